// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use iap_proxy::*;
use tracing::info;

fn main() -> anyhow::Result<()> {
    telemetry::setup_logging();

    // For now we don't need a complex CLI, so rather than pull in dependencies just use basic argv[1]
    let command = match std::env::args().nth(1).as_deref() {
        Some("client") => Command::Client,
        Some("server") => Command::Server,
        Some("version") => return version(),
        None | Some("help") => return help(),
        Some(unknown) => {
            eprintln!("unknown command: {unknown}");
            help()?;
            std::process::exit(1)
        }
    };

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async move {
            match command {
                Command::Client => client().await,
                Command::Server => server().await,
            }
        })
}

enum Command {
    Client,
    Server,
}

fn help() -> anyhow::Result<()> {
    let version = version::BuildInfo::new();
    println!(
        "
IAP Proxy ({version})

Commands:
client  - Start the intercepting forward proxy that injects access proxy credentials
server  - Start the reverse proxy that routes to cluster endpoints
version - Print the version of iap-proxy
help    - Print commands and version of iap-proxy

Configuration is read from the environment, see PORT, PROJECT, KEY_FILE, CERTIFICATE_FILE,
TARGET_URL, IAP_AUDIENCE, SERVICE_ACCOUNT, TO_GKE and TO_HOST."
    );
    Ok(())
}

fn version() -> anyhow::Result<()> {
    println!("{}", version::BuildInfo::new());
    Ok(())
}

async fn client() -> anyhow::Result<()> {
    let cfg = config::parse_client_config()?;
    if cfg.shared.debug {
        telemetry::set_level(false, "debug")?;
    }
    info!("version: {}", version::BuildInfo::new());
    info!("running with config: {}", serde_yaml::to_string(&cfg)?);
    app::build_client(cfg).await?.wait_termination().await
}

async fn server() -> anyhow::Result<()> {
    let cfg = config::parse_server_config()?;
    if cfg.shared.debug {
        telemetry::set_level(false, "debug")?;
    }
    info!("version: {}", version::BuildInfo::new());
    info!("running with config: {}", serde_yaml::to_string(&cfg)?);
    app::build_server(cfg).await?.wait_termination().await
}
