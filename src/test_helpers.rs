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

use crate::config::{self, ClientConfig, ServerConfig, Vars};

pub mod directory;
pub mod helpers;
pub mod identity;
pub mod tunnel;

/// A client configuration listening on an ephemeral localhost port with `target` as the
/// access proxy and no interception scope beyond the directory.
pub fn test_client_config(target: &str) -> ClientConfig {
    let vars: Vars = [
        ("TARGET_URL", target),
        ("IAP_AUDIENCE", "test-audience"),
        ("SERVICE_ACCOUNT", "proxy@test.iam.gserviceaccount.com"),
        ("KEY_FILE", "/unused/key.pem"),
        ("CERTIFICATE_FILE", "/unused/cert.pem"),
        ("TO_GKE", "true"),
        ("PROJECT", "test-project"),
    ]
    .into_iter()
    .collect();
    let mut cfg = config::construct_client_config(&vars).unwrap();
    cfg.shared.listen_addr = helpers::localhost();
    cfg
}

pub fn test_server_config() -> ServerConfig {
    let vars: Vars = [("PROJECT", "test-project"), ("DEBUG", "true")]
        .into_iter()
        .collect();
    let mut cfg = config::construct_server_config(&vars).unwrap();
    cfg.shared.listen_addr = helpers::localhost();
    cfg
}
