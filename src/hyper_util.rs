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
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::drain::DrainWatcher;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("request failed: {0}")]
    Request(#[from] hyper_util::client::legacy::Error),
    #[error("reading body: {0}")]
    Body(#[from] hyper::Error),
    #[error("unexpected status {status}: {body}")]
    Status {
        status: hyper::StatusCode,
        body: String,
    },
    #[error("decoding response: {0}")]
    Decode(#[from] serde_json::Error),
}

// Pause after a failed accept (e.g. out of file descriptors) before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Body type used for everything the proxies send, whether produced locally or relayed.
pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub type HttpsClient = Client<HttpsConnector<HttpConnector>, BoxBody>;

pub fn empty() -> BoxBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

pub fn full(chunk: impl Into<Bytes>) -> BoxBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_response(code: hyper::StatusCode) -> Response<BoxBody> {
    let mut resp = Response::new(empty());
    *resp.status_mut() = code;
    resp
}

pub fn plaintext_response(code: hyper::StatusCode, body: String) -> Response<BoxBody> {
    let mut resp = Response::new(full(body));
    *resp.status_mut() = code;
    resp.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain"),
    );
    resp
}

pub fn http1_server() -> hyper::server::conn::http1::Builder {
    let mut b = hyper::server::conn::http1::Builder::new();
    b.timer(TokioTimer::new());
    b
}

/// Builds a pooling HTTP/1 client that trusts exactly what `tls` trusts.
pub fn https_client(tls: rustls::ClientConfig) -> HttpsClient {
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_nodelay(true);
    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls)
        .https_or_http()
        .enable_http1()
        .wrap_connector(http);
    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs(90))
        .build(https)
}

/// Sends `req` and collects the body of a 2xx response. Other statuses become [Error::Status].
pub async fn fetch(client: &HttpsClient, req: Request<BoxBody>) -> Result<Bytes, Error> {
    let resp = client.request(req).await?;
    let status = resp.status();
    let body = resp.into_body().collect().await?.to_bytes();
    if !status.is_success() {
        return Err(Error::Status {
            status,
            body: String::from_utf8_lossy(&body).trim().to_string(),
        });
    }
    Ok(body)
}

pub async fn fetch_json<T: serde::de::DeserializeOwned>(
    client: &HttpsClient,
    req: Request<BoxBody>,
) -> Result<T, Error> {
    let body = fetch(client, req).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Server implements a generic HTTP server with the follow behavior:
/// * HTTP/1.1, optionally over TLS
/// * Connection upgrades (CONNECT) are enabled
/// * Draining
pub struct Server<S> {
    name: String,
    addr: SocketAddr,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    drain_rx: DrainWatcher,
    state: Arc<S>,
}

impl<S> Server<S> {
    pub async fn bind(
        name: &str,
        addr: SocketAddr,
        drain_rx: DrainWatcher,
        s: S,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        Ok(Server {
            name: name.to_string(),
            addr,
            listener,
            tls: None,
            drain_rx,
            state: Arc::new(s),
        })
    }

    /// Terminate TLS on every accepted connection before serving HTTP.
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    pub fn address(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> Arc<S> {
        self.state.clone()
    }

    pub fn spawn<F, R>(self, f: F)
    where
        S: Send + Sync + 'static,
        F: Fn(Arc<S>, SocketAddr, Request<Incoming>) -> R + Send + Sync + 'static,
        R: Future<Output = Result<Response<BoxBody>, Infallible>> + Send + 'static,
    {
        let address = self.addr;
        let name = self.name;
        let drain = self.drain_rx;
        let state = self.state;
        let tls = self.tls;
        let listener = self.listener;
        let f = Arc::new(f);
        info!(
            %address,
            component=name,
            tls=tls.is_some(),
            "listener established",
        );
        tokio::spawn(async move {
            let stop = drain.clone().wait_for_drain();
            tokio::pin!(stop);
            loop {
                let (socket, src) = tokio::select! {
                    accepted = accept_next(&name, || listener.accept()) => accepted,
                    _blocker = &mut stop => {
                        info!("starting drain of {name} server");
                        break;
                    }
                };
                if let Err(e) = socket.set_nodelay(true) {
                    debug!("failed to set nodelay: {e}");
                }
                let state = state.clone();
                let f = f.clone();
                let drain = drain.clone();
                let tls = tls.clone();
                let name = name.clone();
                tokio::spawn(async move {
                    let svc = service_fn(move |req| f(state.clone(), src, req));
                    match tls {
                        None => serve_connection(&name, socket, svc, drain).await,
                        Some(acceptor) => match acceptor.accept(socket).await {
                            Ok(stream) => {
                                debug!(%src, "TLS handshake succeeded");
                                serve_connection(&name, stream, svc, drain).await
                            }
                            Err(e) => warn!(%src, "TLS handshake error: {e}"),
                        },
                    }
                });
            }
            info!("{name} server terminated");
        });
    }
}

/// Retries `accept` until it yields a connection, pausing after each failure.
async fn accept_next<T, F, Fut>(name: &str, mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(conn) => return conn,
            Err(e) => {
                warn!(component = name, "accept failed: {e}");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

async fn serve_connection<IO, Svc>(name: &str, io: IO, svc: Svc, drain: DrainWatcher)
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    Svc: hyper::service::Service<Request<Incoming>, Response = Response<BoxBody>, Error = Infallible>
        + Send
        + 'static,
    Svc::Future: Send + 'static,
{
    let conn = http1_server()
        .half_close(true)
        .header_read_timeout(Duration::from_secs(30))
        .serve_connection(TokioIo::new(io), svc)
        .with_upgrades();
    tokio::pin!(conn);
    tokio::select! {
        res = conn.as_mut() => {
            if let Err(e) = res {
                debug!(component=name, "connection closed with error: {e}");
            }
        }
        blocker = drain.wait_for_drain() => {
            conn.as_mut().graceful_shutdown();
            if let Err(e) = conn.await {
                debug!(component=name, "connection closed during drain: {e}");
            }
            drop(blocker);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[tokio::test(start_paused = true)]
    async fn accept_failures_back_off() {
        let mut failures = 3;
        let start = tokio::time::Instant::now();
        let conn = accept_next("test", || {
            let res = if failures > 0 {
                failures -= 1;
                Err(io::Error::other("too many open files"))
            } else {
                Ok("conn")
            };
            async move { res }
        })
        .await;
        assert_eq!(conn, "conn");
        assert!(start.elapsed() >= ACCEPT_BACKOFF * 3);
    }

    #[tokio::test]
    async fn plaintext_response_sets_content_type() {
        let resp = plaintext_response(hyper::StatusCode::BAD_GATEWAY, "nope".to_string());
        assert_eq!(resp.status(), hyper::StatusCode::BAD_GATEWAY);
        assert_eq!(resp.headers()[hyper::header::CONTENT_TYPE], "text/plain");
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "nope");
    }
}
