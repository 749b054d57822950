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
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::http::uri::{Authority, Scheme};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use ::hyper_util::rt::TokioIo;
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use super::rewind::Rewind;
use super::{Error, InterceptionGate, RewriteError, Rewriter, Runnable, strip_hop_by_hop, upgrade};
use crate::config::{ClientConfig, InScopeAction, OutOfScopeAction};
use crate::directory::{Cache, strip_port};
use crate::drain::DrainWatcher;
use crate::hyper_util::{self, BoxBody, HttpsClient, Server, empty_response, plaintext_response};
use crate::identity::TokenProvider;
use crate::tls::{CertificateAuthority, ConnectAction, ListenerCertificate};

// First byte of a TLS handshake record.
const TLS_HANDSHAKE: u8 = 0x16;

/// ClientProxy is the forward proxy callers point their tools at. Traffic for in-scope
/// destinations is decrypted, stamped with a fresh credential and sent to the access proxy.
pub struct ClientProxy {
    server: Server<ClientState>,
}

pub struct ClientState {
    gate: InterceptionGate,
    authority: CertificateAuthority,
    rewriter: Rewriter,
    client: HttpsClient,
    in_scope: InScopeAction,
    out_of_scope: OutOfScopeAction,
}

impl ClientProxy {
    /// Binds the listener. `client` is used for everything sent upstream and must trust the
    /// access proxy's certificate.
    pub async fn new(
        cfg: &ClientConfig,
        listener: &ListenerCertificate,
        tokens: Arc<dyn TokenProvider>,
        directory: Option<Arc<Cache>>,
        client: HttpsClient,
        drain: DrainWatcher,
    ) -> Result<ClientProxy, Error> {
        let target: Uri = cfg.target_url.as_str().parse()?;
        if target.scheme() != Some(&Scheme::HTTPS) {
            return Err(Error::TargetNotHttps(cfg.target_url.to_string()));
        }
        let state = ClientState {
            gate: InterceptionGate::new(directory, &cfg.to_hosts)?,
            authority: CertificateAuthority::from_listener(listener)?,
            rewriter: Rewriter::new(target, cfg.injection_mode, tokens),
            client,
            in_scope: cfg.in_scope_action,
            out_of_scope: cfg.out_of_scope_action,
        };
        let addr = cfg.shared.listen_addr;
        let mut server = Server::bind("client", addr, drain, state)
            .await
            .map_err(|e| Error::Bind(addr, e))?;
        if !cfg.plaintext {
            let acceptor = TlsAcceptor::from(Arc::new(listener.server_config()?));
            server = server.with_tls(acceptor);
        }
        Ok(ClientProxy { server })
    }
}

impl Runnable for ClientProxy {
    fn address(&self) -> SocketAddr {
        self.server.address()
    }

    fn run(self: Box<Self>) -> Result<(), Error> {
        self.server.spawn(handle);
        Ok(())
    }
}

impl ClientState {
    /// The disposition of a CONNECT to `host`, decided once per tunnel.
    pub fn decide(&self, host: &str) -> ConnectAction {
        if self.gate.is_in_scope(host) {
            match self.in_scope {
                InScopeAction::Mitm => ConnectAction::Mitm,
                InScopeAction::HttpMitm => ConnectAction::HttpMitm,
            }
        } else {
            match self.out_of_scope {
                OutOfScopeAction::Accept => ConnectAction::Accept,
                OutOfScopeAction::Reject => ConnectAction::Reject,
            }
        }
    }

    /// Rewrites one in-scope request and sends it to the access proxy.
    async fn forward_intercepted(
        &self,
        mut req: Request<Incoming>,
        origin: &Authority,
    ) -> Response<BoxBody> {
        let downstream = upgrade::take(&mut req);
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let req = req.map(|b| b.boxed());
        match self.rewriter.rewrite(req, Some(origin)).await {
            Ok(req) => {
                debug!(host=%origin, %method, %path, "forwarding intercepted request");
                self.send(req, downstream, origin.as_str()).await
            }
            Err(e @ RewriteError::Credentials(_)) => {
                error!(host=%origin, "{e}");
                plaintext_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
            Err(e) => {
                warn!(host=%origin, "failed to rewrite request: {e}");
                plaintext_response(StatusCode::BAD_REQUEST, e.to_string())
            }
        }
    }

    /// Sends `req` upstream. A `101` answer to an upgrade request is spliced to `downstream`.
    async fn send(
        &self,
        req: Request<BoxBody>,
        downstream: Option<hyper::upgrade::OnUpgrade>,
        host: &str,
    ) -> Response<BoxBody> {
        match self.client.request(req).await {
            Ok(mut resp) => {
                upgrade::splice(downstream, &mut resp, host);
                resp.map(|b| b.boxed())
            }
            Err(e) => {
                warn!(%host, "upstream request failed: {e}");
                plaintext_response(
                    StatusCode::BAD_GATEWAY,
                    format!("upstream request for {host} failed: {e}"),
                )
            }
        }
    }
}

async fn handle(
    state: Arc<ClientState>,
    src: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<BoxBody>, Infallible> {
    if req.method() == Method::CONNECT {
        return Ok(connect(state, src, req).await);
    }
    Ok(forward(state, req).await)
}

/// Plain proxy requests carry the destination in absolute form.
async fn forward(state: Arc<ClientState>, req: Request<Incoming>) -> Response<BoxBody> {
    let Some(authority) = req.uri().authority().cloned() else {
        return plaintext_response(
            StatusCode::BAD_REQUEST,
            "proxy requests must use an absolute URI".to_string(),
        );
    };
    if state.gate.is_in_scope(authority.as_str()) {
        return state.forward_intercepted(req, &authority).await;
    }
    match state.out_of_scope {
        OutOfScopeAction::Reject => {
            info!(host=%authority, "rejected out of scope request");
            plaintext_response(
                StatusCode::FORBIDDEN,
                format!("{authority} is not an allowed destination"),
            )
        }
        OutOfScopeAction::Accept => {
            let mut req = req;
            let protocol = upgrade::requested_protocol(req.headers());
            let downstream = upgrade::take(&mut req);
            let mut req = req.map(|b| b.boxed());
            strip_hop_by_hop(req.headers_mut());
            if let Some(protocol) = protocol {
                upgrade::preserve(req.headers_mut(), protocol);
            }
            state.send(req, downstream, authority.as_str()).await
        }
    }
}

async fn connect(
    state: Arc<ClientState>,
    src: SocketAddr,
    req: Request<Incoming>,
) -> Response<BoxBody> {
    let Some(authority) = req.uri().authority().cloned() else {
        return plaintext_response(
            StatusCode::BAD_REQUEST,
            "CONNECT requires host:port".to_string(),
        );
    };
    let action = state.decide(authority.as_str());
    debug!(%src, host=%authority, %action, "tunnel requested");
    match action {
        ConnectAction::Reject => {
            info!(host=%authority, "rejected tunnel");
            plaintext_response(
                StatusCode::FORBIDDEN,
                format!("{authority} is not an allowed destination"),
            )
        }
        ConnectAction::Accept => accept(req, authority).await,
        ConnectAction::Mitm => {
            // Issue before answering: a host we cannot sign for never gets a tunnel.
            let sc = match state.authority.server_config(strip_port(authority.as_str())) {
                Ok(sc) => sc,
                Err(e) => {
                    warn!(host=%authority, "failed to issue certificate: {e}");
                    return plaintext_response(
                        StatusCode::BAD_GATEWAY,
                        format!("failed to intercept {authority}: {e}"),
                    );
                }
            };
            tokio::spawn(async move {
                match hyper::upgrade::on(req).await {
                    Ok(upgraded) => {
                        intercept_tls(state, TokioIo::new(upgraded), sc, authority).await
                    }
                    Err(e) => warn!(host=%authority, "upgrade failed: {e}"),
                }
            });
            empty_response(StatusCode::OK)
        }
        ConnectAction::HttpMitm => {
            tokio::spawn(async move {
                match hyper::upgrade::on(req).await {
                    Ok(upgraded) => {
                        intercept_sniffed(state, TokioIo::new(upgraded), authority).await
                    }
                    Err(e) => warn!(host=%authority, "upgrade failed: {e}"),
                }
            });
            empty_response(StatusCode::OK)
        }
    }
}

async fn accept(req: Request<Incoming>, authority: Authority) -> Response<BoxBody> {
    let upstream = match dial(&authority).await {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!(host=%authority, "failed to dial: {e}");
            return plaintext_response(
                StatusCode::BAD_GATEWAY,
                format!("failed to connect to {authority}: {e}"),
            );
        }
    };
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => relay(TokioIo::new(upgraded), upstream, &authority).await,
            Err(e) => warn!(host=%authority, "upgrade failed: {e}"),
        }
    });
    empty_response(StatusCode::OK)
}

async fn dial(authority: &Authority) -> std::io::Result<TcpStream> {
    let port = authority.port_u16().unwrap_or(443);
    let stream = TcpStream::connect((strip_port(authority.as_str()), port)).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

async fn relay<IO>(mut downstream: IO, mut upstream: TcpStream, authority: &Authority)
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::io::copy_bidirectional(&mut downstream, &mut upstream).await {
        Ok((sent, received)) => debug!(host=%authority, sent, received, "tunnel closed"),
        Err(e) => debug!(host=%authority, "tunnel closed with error: {e}"),
    }
}

async fn intercept_tls<IO>(
    state: Arc<ClientState>,
    io: IO,
    sc: Arc<ServerConfig>,
    authority: Authority,
) where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match TlsAcceptor::from(sc).accept(io).await {
        Ok(stream) => serve_intercepted(state, stream, authority).await,
        Err(e) => warn!(host=%authority, "TLS handshake with caller failed: {e}"),
    }
}

/// Takes over the tunnel only if the caller speaks plain HTTP inside it. TLS is relayed
/// untouched since we did not offer a certificate for it.
async fn intercept_sniffed<IO>(state: Arc<ClientState>, mut io: IO, authority: Authority)
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut first = [0u8; 1];
    match io.read(&mut first).await {
        Ok(0) => return,
        Ok(_) => {}
        Err(e) => {
            debug!(host=%authority, "tunnel closed before first byte: {e}");
            return;
        }
    }
    if first[0] != TLS_HANDSHAKE {
        let io = Rewind::new(Bytes::copy_from_slice(&first), io);
        return serve_intercepted(state, io, authority).await;
    }
    debug!(host=%authority, "tunnel carries TLS, relaying without interception");
    let mut upstream = match dial(&authority).await {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!(host=%authority, "failed to dial: {e}");
            return;
        }
    };
    if let Err(e) = upstream.write_all(&first).await {
        debug!(host=%authority, "failed to replay first byte: {e}");
        return;
    }
    relay(io, upstream, &authority).await
}

async fn serve_intercepted<IO>(state: Arc<ClientState>, io: IO, authority: Authority)
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let host = authority.clone();
    let svc = service_fn(move |req| {
        let state = state.clone();
        let authority = authority.clone();
        async move { Ok::<_, Infallible>(state.forward_intercepted(req, &authority).await) }
    });
    if let Err(e) = hyper_util::http1_server()
        .serve_connection(TokioIo::new(io), svc)
        .with_upgrades()
        .await
    {
        debug!(host=%host, "intercepted connection closed with error: {e}");
    }
}
