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

use hyper::StatusCode;

use iap_proxy::config::{ClientConfig, InScopeAction, OutOfScopeAction};
use iap_proxy::directory::Cache;
use iap_proxy::drain::{self, DrainMode, DrainTrigger};
use iap_proxy::proxy::{ClientProxy, Runnable};
use iap_proxy::test_helpers::directory::{MockInventory, running_cluster};
use iap_proxy::test_helpers::helpers::{self, EchoServer, body_string};
use iap_proxy::test_helpers::identity::MockTokenProvider;
use iap_proxy::test_helpers::test_client_config;
use iap_proxy::test_helpers::tunnel;
use iap_proxy::tls::mock::TestCa;

struct Harness {
    proxy: SocketAddr,
    root: TestCa,
    target: EchoServer,
    tokens: Arc<MockTokenProvider>,
    drain: DrainTrigger,
}

/// A plaintext client proxy intercepting `api.internal`, forwarding to a TLS access proxy
/// stand-in that echoes what it receives.
async fn harness(
    customize: impl FnOnce(&mut ClientConfig),
    directory: Option<Arc<Cache>>,
) -> Harness {
    helpers::initialize_telemetry();
    let access_root = TestCa::new("access-proxy-root");
    let target = helpers::echo_server(Some(&access_root.leaf("127.0.0.1"))).await;
    let mut cfg = test_client_config(&format!("https://{}", target.address()));
    cfg.to_gke = false;
    cfg.plaintext = true;
    cfg.to_hosts = vec![r"^api\.internal$".to_string()];
    customize(&mut cfg);

    let root = TestCa::new("client-proxy-root");
    let tokens = Arc::new(MockTokenProvider::new("iap-token"));
    let (drain, watcher) = drain::new();
    let proxy = ClientProxy::new(
        &cfg,
        &root.as_listener(),
        tokens.clone(),
        directory,
        helpers::client_trusting(access_root.root_store()),
        watcher,
    )
    .await
    .unwrap();
    let proxy = Box::new(proxy);
    let address = proxy.address();
    proxy.run().unwrap();
    Harness {
        proxy: address,
        root,
        target,
        tokens,
        drain,
    }
}

#[tokio::test]
async fn intercepted_tunnel_carries_injected_credential() {
    let h = harness(|_| {}, None).await;
    let io = tunnel::tunnel(h.proxy, "api.internal:443").await;
    let mut sender = tunnel::tls_sender(io, h.root.root_store(), "api.internal").await;

    let resp = sender
        .send_request(tunnel::get("/hello?x=1", "api.internal", Some("Bearer user")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_string(resp).await, "echo /hello");

    let seen = h.target.state().last().unwrap();
    assert_eq!(seen.uri.path(), "/hello");
    assert_eq!(seen.uri.query(), Some("x=1"));
    assert_eq!(seen.header("host").as_deref(), Some("api.internal"));
    assert_eq!(seen.header("authorization").as_deref(), Some("Bearer iap-token"));
    assert_eq!(seen.header("x-real-authorization").as_deref(), Some("Bearer user"));
}

#[tokio::test]
async fn every_request_fetches_a_token() {
    let h = harness(|_| {}, None).await;
    let io = tunnel::tunnel(h.proxy, "api.internal:443").await;
    let mut sender = tunnel::tls_sender(io, h.root.root_store(), "api.internal").await;

    for token in ["first", "second"] {
        h.tokens.set_token(token);
        let resp = sender
            .send_request(tunnel::get("/", "api.internal", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        body_string(resp).await;
        let seen = h.target.state().last().unwrap();
        assert_eq!(seen.header("authorization"), Some(format!("Bearer {token}")));
        assert_eq!(seen.header("x-real-authorization"), None);
    }
    assert_eq!(h.tokens.calls(), 2);
}

#[tokio::test]
async fn intercepted_upgrades_are_spliced() {
    let h = harness(|_| {}, None).await;
    let io = tunnel::tunnel(h.proxy, "api.internal:443").await;
    let mut sender = tunnel::tls_sender(io, h.root.root_store(), "api.internal").await;

    let resp = sender
        .send_request(tunnel::upgrade("/exec", "api.internal", "SPDY/3.1"))
        .await
        .unwrap();
    assert_eq!(tunnel::exchange(resp, b"stdin").await, b"stdin");

    let seen = h.target.state().last().unwrap();
    assert_eq!(seen.header("upgrade").as_deref(), Some("SPDY/3.1"));
    assert_eq!(seen.header("authorization").as_deref(), Some("Bearer iap-token"));
}

#[tokio::test]
async fn token_failure_fails_only_the_request() {
    let h = harness(|_| {}, None).await;
    let io = tunnel::tunnel(h.proxy, "api.internal:443").await;
    let mut sender = tunnel::tls_sender(io, h.root.root_store(), "api.internal").await;

    h.tokens.set_failing(true);
    let resp = sender
        .send_request(tunnel::get("/", "api.internal", None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    body_string(resp).await;
    assert!(h.target.state().requests().is_empty());

    h.tokens.set_failing(false);
    let resp = sender
        .send_request(tunnel::get("/again", "api.internal", None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_string(resp).await, "echo /again");
}

#[tokio::test]
async fn directory_endpoints_are_intercepted() {
    let inventory = Arc::new(MockInventory::new(vec![running_cluster(
        "c1", "10.0.0.5", "",
    )]));
    let (_directory_drain, watcher) = drain::new();
    let directory = Cache::new(
        Some("test-project".to_string()),
        &MockTokenProvider::new("t"),
        inventory,
        Duration::from_secs(300),
        watcher,
    )
    .await
    .unwrap();
    let h = harness(|cfg| cfg.to_hosts.clear(), Some(directory)).await;

    // The tunnel is terminated locally, so 10.0.0.5 is never dialed.
    let io = tunnel::tunnel(h.proxy, "10.0.0.5:443").await;
    let mut sender = tunnel::tls_sender(io, h.root.root_store(), "10.0.0.5").await;
    let resp = sender
        .send_request(tunnel::get("/api", "10.0.0.5", None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    body_string(resp).await;
    let seen = h.target.state().last().unwrap();
    assert_eq!(seen.header("host").as_deref(), Some("10.0.0.5"));
    assert_eq!(seen.header("authorization").as_deref(), Some("Bearer iap-token"));
}

#[tokio::test]
async fn http_mitm_serves_plain_http_in_tunnel() {
    let h = harness(|cfg| cfg.in_scope_action = InScopeAction::HttpMitm, None).await;
    let io = tunnel::tunnel(h.proxy, "api.internal:80").await;
    let mut sender = tunnel::http_sender(io).await;
    let resp = sender
        .send_request(tunnel::get("/plain", "api.internal", Some("Bearer user")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_string(resp).await, "echo /plain");
    let seen = h.target.state().last().unwrap();
    assert_eq!(seen.header("authorization").as_deref(), Some("Bearer iap-token"));
    assert_eq!(seen.header("x-real-authorization").as_deref(), Some("Bearer user"));
}

#[tokio::test]
async fn out_of_scope_tunnels_are_relayed() {
    let h = harness(|_| {}, None).await;
    let plain = helpers::echo_server(None).await;
    let io = tunnel::tunnel(h.proxy, &plain.address().to_string()).await;
    let mut sender = tunnel::http_sender(io).await;
    let resp = sender
        .send_request(tunnel::get("/raw", "example.com", Some("Bearer user")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_string(resp).await, "echo /raw");

    let seen = plain.state().last().unwrap();
    assert_eq!(seen.header("authorization").as_deref(), Some("Bearer user"));
    assert_eq!(h.tokens.calls(), 0);
    assert!(h.target.state().requests().is_empty());
}

#[tokio::test]
async fn out_of_scope_absolute_requests_pass_through() {
    let h = harness(|_| {}, None).await;
    let plain = helpers::echo_server(None).await;
    let stream = tokio::net::TcpStream::connect(h.proxy).await.unwrap();
    let mut sender = tunnel::http_sender(stream).await;
    let host = plain.address().to_string();
    let resp = sender
        .send_request(tunnel::get(&format!("http://{host}/direct"), &host, None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_string(resp).await, "echo /direct");
    assert_eq!(h.tokens.calls(), 0);
}

#[tokio::test]
async fn out_of_scope_destinations_can_be_rejected() {
    let h = harness(|cfg| cfg.out_of_scope_action = OutOfScopeAction::Reject, None).await;

    let resp = tunnel::connect(h.proxy, "example.com:443").await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let stream = tokio::net::TcpStream::connect(h.proxy).await.unwrap();
    let mut sender = tunnel::http_sender(stream).await;
    let resp = sender
        .send_request(tunnel::get("http://example.com/", "example.com", None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert!(body_string(resp).await.contains("example.com"));
}

#[tokio::test]
async fn intercepted_plain_requests_are_rewritten() {
    let h = harness(|_| {}, None).await;
    let stream = tokio::net::TcpStream::connect(h.proxy).await.unwrap();
    let mut sender = tunnel::http_sender(stream).await;
    let resp = sender
        .send_request(tunnel::get(
            "http://api.internal/absolute",
            "api.internal",
            Some("Bearer user"),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_string(resp).await, "echo /absolute");
    let seen = h.target.state().last().unwrap();
    assert_eq!(seen.header("authorization").as_deref(), Some("Bearer iap-token"));
}

#[tokio::test]
async fn drained_proxy_stops_accepting() {
    let h = harness(|_| {}, None).await;
    let proxy = h.proxy;
    tokio::time::timeout(
        Duration::from_secs(5),
        h.drain.start_drain_and_wait(DrainMode::Graceful),
    )
    .await
    .unwrap();
    assert!(tokio::net::TcpStream::connect(proxy).await.is_err());
}
