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

use bytes::Bytes;
use http_body_util::{Empty, Full};
use hyper::client::conn::http1::{self, SendRequest};
use hyper::header::HOST;
use hyper::body::Incoming;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::RootCertStore;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::tls;

pub type Sender = SendRequest<Full<Bytes>>;

/// Sends `CONNECT authority` to the proxy at `proxy`. A successful response can be upgraded.
pub async fn connect(proxy: SocketAddr, authority: &str) -> Response<Incoming> {
    let stream = TcpStream::connect(proxy).await.unwrap();
    let (mut sender, conn) = http1::handshake(TokioIo::new(stream)).await.unwrap();
    tokio::spawn(conn.with_upgrades());
    let req = Request::connect(authority)
        .header(HOST, authority)
        .body(Empty::<Bytes>::new())
        .unwrap();
    sender.send_request(req).await.unwrap()
}

/// Opens a tunnel through the proxy, panicking unless it is granted.
pub async fn tunnel(proxy: SocketAddr, authority: &str) -> TokioIo<Upgraded> {
    let resp = connect(proxy, authority).await;
    assert_eq!(resp.status(), StatusCode::OK, "tunnel to {authority} refused");
    TokioIo::new(hyper::upgrade::on(resp).await.unwrap())
}

/// Starts an HTTP/1 client connection over `io`.
pub async fn http_sender<IO>(io: IO) -> Sender
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, conn) = http1::handshake(TokioIo::new(io)).await.unwrap();
    tokio::spawn(conn.with_upgrades());
    sender
}

/// Starts an HTTP/1 client connection over TLS to `host`, trusting only `roots`.
pub async fn tls_sender<IO>(io: IO, roots: Arc<RootCertStore>, host: &str) -> Sender
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let cc = tls::client_config(roots).unwrap();
    let server_name = ServerName::try_from(host.to_string()).unwrap();
    let stream = TlsConnector::from(Arc::new(cc))
        .connect(server_name, io)
        .await
        .unwrap();
    http_sender(stream).await
}

/// A request with `host` as Host header and optional caller credential.
pub fn get(uri: &str, host: &str, authorization: Option<&str>) -> Request<Full<Bytes>> {
    let mut builder = Request::get(uri).header(HOST, host);
    if let Some(auth) = authorization {
        builder = builder.header("authorization", auth);
    }
    builder.body(Full::new(Bytes::new())).unwrap()
}

/// A request asking `host` to switch the connection to `protocol`.
pub fn upgrade(uri: &str, host: &str, protocol: &str) -> Request<Full<Bytes>> {
    Request::get(uri)
        .header(HOST, host)
        .header("connection", "Upgrade")
        .header("upgrade", protocol)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

/// Writes `msg` over a switched connection and reads back as many bytes.
pub async fn exchange(resp: Response<Incoming>, msg: &[u8]) -> Vec<u8> {
    assert_eq!(resp.status(), StatusCode::SWITCHING_PROTOCOLS);
    let mut io = TokioIo::new(hyper::upgrade::on(resp).await.unwrap());
    io.write_all(msg).await.unwrap();
    let mut buf = vec![0u8; msg.len()];
    io.read_exact(&mut buf).await.unwrap();
    buf
}
