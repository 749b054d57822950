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

use std::convert::Infallible;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use ::hyper_util::rt::TokioIo;
use hyper::header::{AUTHORIZATION, CONNECTION, HeaderValue, UPGRADE};
use hyper::{HeaderMap, Method, Request, Response, StatusCode, Uri};
use once_cell::sync::Lazy;
use rustls::RootCertStore;
use tokio_rustls::TlsAcceptor;

use crate::drain::{self, DrainTrigger};
use crate::hyper_util::{self, BoxBody, HttpsClient, Server};
use crate::proxy::upgrade;
use crate::telemetry;
use crate::tls::{self, ListenerCertificate};

// Ensure that the `tracing` stack is only initialised once using `once_cell`
static TRACING: Lazy<()> = Lazy::new(telemetry::setup_logging);

pub fn initialize_telemetry() {
    Lazy::force(&TRACING);
}

pub fn localhost() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
}

/// A client for plain HTTP mocks. It trusts nothing, so HTTPS requests fail.
pub fn plain_client() -> HttpsClient {
    client_trusting(Arc::new(RootCertStore::empty()))
}

pub fn client_trusting(roots: Arc<RootCertStore>) -> HttpsClient {
    hyper_util::https_client(tls::client_config(roots).unwrap())
}

/// An unsigned JWT expiring at `exp` seconds since the epoch.
pub fn fake_jwt(exp: u64) -> String {
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"none"}"#);
    let claims = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{exp}}}"#));
    format!("{header}.{claims}.sig")
}

/// TestServer runs a handler on a local port until dropped.
pub struct TestServer<S> {
    addr: SocketAddr,
    state: Arc<S>,
    _drain: DrainTrigger,
}

impl<S: Send + Sync + 'static> TestServer<S> {
    pub async fn spawn<F, R>(state: S, cert: Option<&ListenerCertificate>, f: F) -> Self
    where
        F: Fn(Arc<S>, SocketAddr, Request<Incoming>) -> R + Send + Sync + 'static,
        R: Future<Output = Result<Response<BoxBody>, Infallible>> + Send + 'static,
    {
        let (trigger, watcher) = drain::new();
        let mut server = Server::bind("test", localhost(), watcher, state)
            .await
            .unwrap();
        if let Some(cert) = cert {
            let acceptor = TlsAcceptor::from(Arc::new(cert.server_config().unwrap()));
            server = server.with_tls(acceptor);
        }
        let addr = server.address();
        let state = server.state();
        server.spawn(f);
        TestServer {
            addr,
            state,
            _drain: trigger,
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn state(&self) -> &S {
        &self.state
    }
}

#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    pub fn header_all(&self, name: &str) -> Vec<String> {
        self.headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect()
    }
}

/// Records every request and answers `200 echo <path>`.
#[derive(Default)]
pub struct Recorder {
    requests: Mutex<Vec<RecordedRequest>>,
}

impl Recorder {
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<RecordedRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

pub type EchoServer = TestServer<Recorder>;

/// An upstream that records what it receives, over TLS when `cert` is set. Upgrade requests
/// are switched to the requested protocol and the bytes that follow are echoed back.
pub async fn echo_server(cert: Option<&ListenerCertificate>) -> EchoServer {
    TestServer::spawn(Recorder::default(), cert, |state, _src, mut req| async move {
        let protocol = upgrade::requested_protocol(req.headers());
        if let Some(on) = upgrade::take(&mut req) {
            tokio::spawn(async move {
                let mut io = TokioIo::new(on.await.unwrap());
                let (mut rd, mut wr) = tokio::io::split(&mut io);
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
        let (parts, body) = req.into_parts();
        let body = body
            .collect()
            .await
            .map(|b| b.to_bytes())
            .unwrap_or_default();
        let path = parts.uri.path().to_string();
        state.requests.lock().unwrap().push(RecordedRequest {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body,
        });
        if let Some(protocol) = protocol {
            let mut resp = hyper_util::empty_response(StatusCode::SWITCHING_PROTOCOLS);
            resp.headers_mut()
                .insert(CONNECTION, HeaderValue::from_static("upgrade"));
            resp.headers_mut().insert(UPGRADE, protocol);
            return Ok(resp);
        }
        Ok(hyper_util::plaintext_response(
            StatusCode::OK,
            format!("echo {path}"),
        ))
    })
    .await
}

/// Serves the two compute metadata endpoints the proxies use.
pub struct MockMetadataServer;

impl MockMetadataServer {
    pub async fn spawn(project: &str) -> TestServer<String> {
        TestServer::spawn(project.to_string(), None, |project, _src, req| async move {
            if req.headers().get("Metadata-Flavor").map(|v| v.as_bytes()) != Some(&b"Google"[..]) {
                return Ok(hyper_util::empty_response(StatusCode::FORBIDDEN));
            }
            let resp = match req.uri().path() {
                "/computeMetadata/v1/instance/service-accounts/default/token" => {
                    hyper_util::plaintext_response(
                        StatusCode::OK,
                        r#"{"access_token":"metadata-token","expires_in":3599,"token_type":"Bearer"}"#
                            .to_string(),
                    )
                }
                "/computeMetadata/v1/project/project-id" => {
                    hyper_util::plaintext_response(StatusCode::OK, project.to_string())
                }
                _ => hyper_util::empty_response(StatusCode::NOT_FOUND),
            };
            Ok(resp)
        })
        .await
    }
}

#[derive(Default)]
pub struct IamState {
    requests: Mutex<Vec<String>>,
}

/// Answers generateIdToken with a token valid for an hour.
pub struct MockIamServer;

impl MockIamServer {
    pub async fn spawn() -> TestServer<IamState> {
        TestServer::spawn(IamState::default(), None, |state, _src, req| async move {
            let (parts, body) = req.into_parts();
            let Some(sa) = parts
                .uri
                .path()
                .strip_prefix("/v1/projects/-/serviceAccounts/")
                .and_then(|p| p.strip_suffix(":generateIdToken"))
                .map(str::to_string)
            else {
                return Ok(hyper_util::empty_response(StatusCode::NOT_FOUND));
            };
            let body = body
                .collect()
                .await
                .map(|b| b.to_bytes())
                .unwrap_or_default();
            let req: serde_json::Value = serde_json::from_slice(&body).unwrap_or_default();
            let auth = parts
                .headers
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            let audience = req["audience"].as_str().unwrap_or_default();
            if req["includeEmail"] != serde_json::Value::Bool(true) {
                return Ok(hyper_util::empty_response(StatusCode::BAD_REQUEST));
            }
            state
                .requests
                .lock()
                .unwrap()
                .push(format!("{auth} {audience} {sa}"));
            let exp = (SystemTime::now() + Duration::from_secs(3600))
                .duration_since(UNIX_EPOCH)
                .unwrap()
                .as_secs();
            Ok(hyper_util::plaintext_response(
                StatusCode::OK,
                serde_json::json!({ "token": fake_jwt(exp) }).to_string(),
            ))
        })
        .await
    }
}

impl TestServer<IamState> {
    pub fn requests(&self) -> usize {
        self.state().requests.lock().unwrap().len()
    }

    pub fn last_request(&self) -> Option<String> {
        self.state().requests.lock().unwrap().last().cloned()
    }
}

/// Reads a response body to a string.
pub async fn body_string(resp: Response<Incoming>) -> String {
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8_lossy(&body).into_owned()
}
