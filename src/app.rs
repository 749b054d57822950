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

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::time;
use tracing::{info, warn};

use crate::config::{ClientConfig, ServerConfig, SharedConfig};
use crate::directory::{Cache, GkeInventory};
use crate::drain::{self, DrainMode, DrainTrigger, DrainWatcher};
use crate::hyper_util::{self, HttpsClient};
use crate::identity::{IdTokenProvider, SourceCredentials, TokenProvider};
use crate::proxy::{ClientProxy, ReverseProxy, Runnable};
use crate::signal;
use crate::tls::{self, ListenerCertificate};

/// Upstream client trusting the platform roots, shared by the credential, inventory and
/// access proxy calls.
fn upstream_client() -> anyhow::Result<HttpsClient> {
    let roots = tls::native_root_store().context("load system trust store")?;
    Ok(hyper_util::https_client(tls::client_config(Arc::new(
        roots,
    ))?))
}

fn listener_certificate(cfg: &SharedConfig) -> anyhow::Result<Option<ListenerCertificate>> {
    match (&cfg.key_file, &cfg.certificate_file) {
        (Some(key), Some(cert)) => Ok(Some(
            ListenerCertificate::from_files(key, cert).context("load listener key pair")?,
        )),
        _ => Ok(None),
    }
}

async fn directory(
    cfg: &SharedConfig,
    source: Arc<dyn TokenProvider>,
    client: HttpsClient,
    drain: DrainWatcher,
) -> anyhow::Result<Arc<Cache>> {
    let inventory = Arc::new(GkeInventory::new(client, source.clone()));
    Cache::new(
        cfg.project.clone(),
        source.as_ref(),
        inventory,
        cfg.refresh_interval,
        drain,
    )
    .await
    .context("load cluster directory")
}

pub async fn build_client(cfg: ClientConfig) -> anyhow::Result<Bound> {
    let shutdown = signal::Shutdown::new();
    let (drain_tx, drain_rx) = drain::new();

    let listener = listener_certificate(&cfg.shared)?
        .context("the client proxy requires KEY_FILE and CERTIFICATE_FILE")?;
    let client = upstream_client()?;
    let source: Arc<dyn TokenProvider> = Arc::new(SourceCredentials::new(
        cfg.shared.credentials.clone(),
        client.clone(),
    ));
    let tokens = Arc::new(IdTokenProvider::new(
        source.clone(),
        client.clone(),
        cfg.service_account.clone(),
        cfg.audience.clone(),
    ));
    tokens
        .fetch_token()
        .await
        .context("obtain initial access proxy token")?;

    let directory = if cfg.to_gke {
        Some(directory(&cfg.shared, source, client.clone(), drain_rx.clone()).await?)
    } else {
        None
    };
    let proxy = ClientProxy::new(&cfg, &listener, tokens, directory, client, drain_rx)
        .await
        .context("client proxy starts")?;
    start(
        Box::new(proxy),
        shutdown,
        drain_tx,
        cfg.shared.termination_grace_period,
    )
}

pub async fn build_server(cfg: ServerConfig) -> anyhow::Result<Bound> {
    let shutdown = signal::Shutdown::new();
    let (drain_tx, drain_rx) = drain::new();

    let listener = listener_certificate(&cfg.shared)?;
    if cfg.plaintext() {
        warn!("no key pair configured, serving plain HTTP");
    }
    let client = upstream_client()?;
    let source: Arc<dyn TokenProvider> = Arc::new(SourceCredentials::new(
        cfg.shared.credentials.clone(),
        client.clone(),
    ));
    let directory = directory(&cfg.shared, source, client, drain_rx.clone()).await?;
    let proxy = ReverseProxy::new(&cfg, listener.as_ref(), directory, drain_rx)
        .await
        .context("reverse proxy starts")?;
    start(
        Box::new(proxy),
        shutdown,
        drain_tx,
        cfg.shared.termination_grace_period,
    )
}

fn start(
    proxy: Box<dyn Runnable>,
    shutdown: signal::Shutdown,
    drain_tx: DrainTrigger,
    termination_grace_period: Duration,
) -> anyhow::Result<Bound> {
    let proxy_address = proxy.address();
    proxy.run()?;
    Ok(Bound {
        proxy_address,
        shutdown,
        termination_grace_period,
        drain_tx,
    })
}

pub struct Bound {
    pub proxy_address: SocketAddr,

    pub shutdown: signal::Shutdown,
    termination_grace_period: Duration,
    drain_tx: DrainTrigger,
}

impl Bound {
    pub async fn wait_termination(self) -> anyhow::Result<()> {
        // Wait for a signal to shutdown from an explicit trigger or signal
        self.shutdown.wait().await;

        // Start a drain; this will wait for all watchers to be dropped before completing,
        // allowing components to terminate.
        // If they take too long, terminate anyways.
        match time::timeout(
            self.termination_grace_period,
            self.drain_tx.start_drain_and_wait(DrainMode::Graceful),
        )
        .await
        {
            Ok(()) => info!("Shutdown completed gracefully"),
            Err(_) => warn!(
                "Graceful shutdown did not complete in {:?}, terminating now",
                self.termination_grace_period
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::directory::{MockInventory, running_cluster};
    use crate::test_helpers::identity::MockTokenProvider;
    use crate::test_helpers::{helpers, test_server_config};

    #[tokio::test]
    async fn shutdown_lifecycle() {
        helpers::initialize_telemetry();
        let cfg = test_server_config();
        let (drain_tx, drain_rx) = drain::new();
        let inventory = Arc::new(MockInventory::new(vec![running_cluster(
            "c1", "10.0.0.5", "",
        )]));
        let directory = Cache::new(
            cfg.shared.project.clone(),
            &MockTokenProvider::new("t"),
            inventory,
            cfg.shared.refresh_interval,
            drain_rx.clone(),
        )
        .await
        .unwrap();
        let proxy = ReverseProxy::new(&cfg, None, directory, drain_rx).await.unwrap();
        let bound = start(
            Box::new(proxy),
            signal::Shutdown::new(),
            drain_tx,
            Duration::from_secs(5),
        )
        .unwrap();
        let address = bound.proxy_address;
        assert!(tokio::net::TcpStream::connect(address).await.is_ok());

        let trigger = bound.shutdown.trigger();
        let (res, _) = tokio::join!(
            time::timeout(Duration::from_secs(5), bound.wait_termination()),
            trigger.shutdown_now()
        );
        res.expect("terminates in time").expect("terminates cleanly");
        assert!(tokio::net::TcpStream::connect(address).await.is_err());
    }
}
