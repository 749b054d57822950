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

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HOST, HeaderName, HeaderValue};
use hyper::{Request, Response, StatusCode, Uri};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use super::{Error, Runnable, restore_authorization, strip_hop_by_hop, upgrade};
use crate::config::ServerConfig;
use crate::directory::{Cache, ConnectInfo};
use crate::drain::DrainWatcher;
use crate::hyper_util::{self, BoxBody, HttpsClient, Server, plaintext_response};
use crate::tls::{self, ListenerCertificate};

pub const HEALTH_PATH: &str = "/__health";
pub const HEALTH_BODY: &str = "service is healthy\n";

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// ReverseProxy runs inside the private network behind the access proxy. It routes each
/// request by Host to the matching cluster endpoint, trusting only that cluster's CA.
pub struct ReverseProxy {
    server: Server<ReverseState>,
}

pub struct ReverseState {
    directory: Arc<Cache>,
    clients: Mutex<HashMap<String, (Arc<ConnectInfo>, HttpsClient)>>,
    debug: bool,
}

impl ReverseProxy {
    /// Binds the listener. Without `listener` the proxy serves plain HTTP.
    pub async fn new(
        cfg: &ServerConfig,
        listener: Option<&ListenerCertificate>,
        directory: Arc<Cache>,
        drain: DrainWatcher,
    ) -> Result<ReverseProxy, Error> {
        let state = ReverseState {
            directory,
            clients: Mutex::new(HashMap::new()),
            debug: cfg.shared.debug,
        };
        let addr = cfg.shared.listen_addr;
        let mut server = Server::bind("reverse", addr, drain, state)
            .await
            .map_err(|e| Error::Bind(addr, e))?;
        if let Some(cert) = listener {
            let acceptor = TlsAcceptor::from(Arc::new(cert.server_config()?));
            server = server.with_tls(acceptor);
        }
        Ok(ReverseProxy { server })
    }
}

impl Runnable for ReverseProxy {
    fn address(&self) -> SocketAddr {
        self.server.address()
    }

    fn run(self: Box<Self>) -> Result<(), Error> {
        self.server.spawn(handle);
        Ok(())
    }
}

impl ReverseState {
    /// Clients are kept per endpoint and rebuilt when a refresh replaces the entry.
    fn client_for(&self, info: &Arc<ConnectInfo>) -> Result<HttpsClient, tls::Error> {
        let mut clients = self.clients.lock().expect("mutex");
        if let Some((cached, client)) = clients.get(&info.endpoint) {
            if Arc::ptr_eq(cached, info) {
                return Ok(client.clone());
            }
        }
        let client = hyper_util::https_client(tls::client_config(info.root_store.clone())?);
        clients.insert(info.endpoint.clone(), (info.clone(), client.clone()));
        Ok(client)
    }
}

async fn handle(
    state: Arc<ReverseState>,
    src: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<BoxBody>, Infallible> {
    if req.uri().path() == HEALTH_PATH {
        return Ok(plaintext_response(StatusCode::OK, HEALTH_BODY.to_string()));
    }
    Ok(route(&state, src, req).await)
}

fn request_host<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
}

async fn route(
    state: &ReverseState,
    src: SocketAddr,
    mut req: Request<Incoming>,
) -> Response<BoxBody> {
    let host = request_host(&req).unwrap_or_default();
    let Some(info) = state.directory.lookup(&host) else {
        debug!(%host, "no cluster for host");
        return plaintext_response(
            StatusCode::BAD_GATEWAY,
            format!("{host} is not a cluster endpoint"),
        );
    };
    let client = match state.client_for(&info) {
        Ok(client) => client,
        Err(e) => {
            warn!(cluster=%info.name, "failed to build client: {e}");
            return plaintext_response(StatusCode::BAD_GATEWAY, e.to_string());
        }
    };

    let protocol = upgrade::requested_protocol(req.headers());
    let downstream = upgrade::take(&mut req);
    let (mut parts, body) = req.into_parts();
    restore_authorization(&mut parts.headers);
    strip_hop_by_hop(&mut parts.headers);
    if let Some(protocol) = protocol {
        upgrade::preserve(&mut parts.headers, protocol);
    }
    if let Ok(ip) = HeaderValue::from_str(&src.ip().to_string()) {
        parts.headers.append(X_FORWARDED_FOR.clone(), ip);
    }
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    parts.uri = match Uri::builder()
        .scheme("https")
        .authority(host.as_str())
        .path_and_query(path_and_query)
        .build()
    {
        Ok(uri) => uri,
        Err(e) => {
            return plaintext_response(
                StatusCode::BAD_REQUEST,
                format!("invalid host {host}: {e}"),
            );
        }
    };
    if state.debug {
        debug!(
            cluster=%info.name,
            method=%parts.method,
            uri=%parts.uri,
            headers=?parts.headers,
            "proxying request"
        );
    }

    match client.request(Request::from_parts(parts, body.boxed())).await {
        Ok(mut resp) => {
            upgrade::splice(downstream, &mut resp, &info.name);
            if state.debug {
                debug!(
                    cluster=%info.name,
                    status=%resp.status(),
                    headers=?resp.headers(),
                    "upstream response"
                );
            }
            resp.map(|b| b.boxed())
        }
        Err(e) => {
            warn!(cluster=%info.name, %host, "upstream request failed: {e:?}");
            plaintext_response(
                StatusCode::BAD_GATEWAY,
                format!("upstream request to {} failed: {e}", info.name),
            )
        }
    }
}
