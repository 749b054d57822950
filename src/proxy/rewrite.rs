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

use std::sync::Arc;

use hyper::header::{
    ACCEPT_ENCODING, AUTHORIZATION, CONNECTION, HOST, HeaderName, HeaderValue,
    PROXY_AUTHENTICATE, PROXY_AUTHORIZATION,
};
use hyper::http::uri::{Authority, Scheme};
use hyper::{HeaderMap, Request, Uri};
use tracing::trace;

use crate::config::HeaderInjectionMode;
use super::upgrade;
use crate::identity::{self, TokenProvider};

/// Carries the caller's own credential while the injected one occupies `Authorization`.
pub static X_REAL_AUTHORIZATION: HeaderName = HeaderName::from_static("x-real-authorization");

static PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");

/// Removes the headers addressed to the client proxy itself. Returns true when the caller
/// asked for the connection to be closed.
pub fn strip_proxy_headers(headers: &mut HeaderMap) -> bool {
    let close = headers
        .get_all(CONNECTION)
        .iter()
        .chain(headers.get_all(&PROXY_CONNECTION).iter())
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("close"));
    headers.remove(ACCEPT_ENCODING);
    headers.remove(&PROXY_CONNECTION);
    headers.remove(PROXY_AUTHENTICATE);
    headers.remove(PROXY_AUTHORIZATION);
    headers.remove(CONNECTION);
    close
}

const HOP_BY_HOP: &[&str] = &[
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Removes hop-by-hop headers, including any named by `Connection`, before a request or
/// response is relayed.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    headers.remove(CONNECTION);
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Places `credential` in the slot `mode` selects, moving the caller's credential aside when
/// the mode requires it.
pub fn inject_credential(
    headers: &mut HeaderMap,
    mode: HeaderInjectionMode,
    credential: HeaderValue,
) {
    match mode {
        HeaderInjectionMode::RenameThenAuthorization => {
            let original: Vec<HeaderValue> = match headers.entry(AUTHORIZATION) {
                hyper::header::Entry::Occupied(e) => e.remove_entry_mult().1.collect(),
                hyper::header::Entry::Vacant(_) => Vec::new(),
            };
            headers.remove(&X_REAL_AUTHORIZATION);
            for v in original {
                headers.append(X_REAL_AUTHORIZATION.clone(), v);
            }
            headers.insert(AUTHORIZATION, credential);
        }
        HeaderInjectionMode::ProxyAuthorization => {
            headers.insert(PROXY_AUTHORIZATION, credential);
        }
        HeaderInjectionMode::Authorization => {
            if headers.contains_key(AUTHORIZATION) {
                headers.insert(PROXY_AUTHORIZATION, credential);
            } else {
                headers.insert(AUTHORIZATION, credential);
            }
        }
    }
}

/// Undoes [inject_credential] in rename mode: the caller's credential returns to
/// `Authorization` and the injected one is dropped. Without `X-Real-Authorization` the
/// headers are left untouched.
pub fn restore_authorization(headers: &mut HeaderMap) {
    let real: Vec<HeaderValue> = match headers.entry(&X_REAL_AUTHORIZATION) {
        hyper::header::Entry::Occupied(e) => e.remove_entry_mult().1.collect(),
        hyper::header::Entry::Vacant(_) => return,
    };
    headers.remove(AUTHORIZATION);
    for v in real {
        headers.append(AUTHORIZATION, v);
    }
}

/// Replaces scheme and authority of `uri` with those of `target`, keeping path and query.
pub fn retarget(uri: &Uri, target: &Uri) -> Result<Uri, hyper::http::Error> {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    Uri::builder()
        .scheme(target.scheme().cloned().unwrap_or(Scheme::HTTPS))
        .authority(target.authority().cloned().unwrap_or_else(|| Authority::from_static("localhost")))
        .path_and_query(path_and_query)
        .build()
}

#[derive(thiserror::Error, Debug)]
pub enum RewriteError {
    #[error("failed to obtain credentials: {0}")]
    Credentials(#[from] identity::Error),
    #[error("invalid credential header: {0}")]
    InvalidHeader(#[from] hyper::header::InvalidHeaderValue),
    #[error("invalid request: {0}")]
    Request(#[from] hyper::http::Error),
}

/// Rewriter turns an intercepted request into one addressed to the access proxy front door.
pub struct Rewriter {
    target: Uri,
    mode: HeaderInjectionMode,
    tokens: Arc<dyn TokenProvider>,
}

impl Rewriter {
    pub fn new(target: Uri, mode: HeaderInjectionMode, tokens: Arc<dyn TokenProvider>) -> Self {
        Rewriter {
            target,
            mode,
            tokens,
        }
    }

    pub fn target(&self) -> &Uri {
        &self.target
    }

    /// `origin` is the authority the caller believed it was talking to. It becomes the Host
    /// header when the request lacks one, which the reverse proxy routes on.
    pub async fn rewrite<B>(
        &self,
        mut req: Request<B>,
        origin: Option<&Authority>,
    ) -> Result<Request<B>, RewriteError> {
        let protocol = upgrade::requested_protocol(req.headers());
        let close = strip_proxy_headers(req.headers_mut());
        if !req.headers().contains_key(HOST) {
            let host = req.uri().authority().or(origin).map(|a| a.as_str().to_string());
            if let Some(host) = host {
                req.headers_mut().insert(HOST, HeaderValue::from_str(&host)?);
            }
        }
        let token = self.tokens.fetch_token().await?;
        let credential = HeaderValue::from_str(&token.authorization())?;
        inject_credential(req.headers_mut(), self.mode, credential);
        if let Some(protocol) = protocol {
            upgrade::preserve(req.headers_mut(), protocol);
        } else if close {
            req.headers_mut()
                .insert(CONNECTION, HeaderValue::from_static("close"));
        }
        let uri = retarget(req.uri(), &self.target)?;
        trace!(from=%req.uri(), to=%uri, "rewrote request");
        *req.uri_mut() = uri;
        Ok(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::identity::MockTokenProvider;
    use matches::assert_matches;
    use test_case::test_case;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.append(
                HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        h
    }

    fn values(h: &HeaderMap, name: &str) -> Vec<String> {
        h.get_all(name)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn strips_proxy_headers() {
        let mut h = headers(&[
            ("accept-encoding", "gzip"),
            ("proxy-connection", "keep-alive"),
            ("proxy-authorization", "Basic abc"),
            ("proxy-authenticate", "Basic"),
            ("connection", "keep-alive"),
            ("x-other", "kept"),
        ]);
        assert!(!strip_proxy_headers(&mut h));
        assert_eq!(h.len(), 1);
        assert_eq!(values(&h, "x-other"), vec!["kept"]);

        let mut h = headers(&[("connection", "Upgrade, Close")]);
        assert!(strip_proxy_headers(&mut h));
        assert!(h.is_empty());
    }

    #[test]
    fn strips_hop_by_hop() {
        let mut h = headers(&[
            ("connection", "keep-alive, x-custom-hop"),
            ("x-custom-hop", "1"),
            ("keep-alive", "timeout=5"),
            ("transfer-encoding", "chunked"),
            ("upgrade", "websocket"),
            ("authorization", "Bearer kept"),
        ]);
        strip_hop_by_hop(&mut h);
        assert_eq!(h.len(), 1);
        assert_eq!(values(&h, "authorization"), vec!["Bearer kept"]);
    }

    #[test]
    fn rename_then_authorization() {
        let mut h = headers(&[("authorization", "Bearer user1"), ("authorization", "Bearer user2")]);
        inject_credential(
            &mut h,
            HeaderInjectionMode::RenameThenAuthorization,
            HeaderValue::from_static("Bearer iap"),
        );
        assert_eq!(values(&h, "authorization"), vec!["Bearer iap"]);
        assert_eq!(
            values(&h, "x-real-authorization"),
            vec!["Bearer user1", "Bearer user2"]
        );
    }

    #[test]
    fn rename_without_caller_credential() {
        let mut h = headers(&[("x-real-authorization", "spoofed")]);
        inject_credential(
            &mut h,
            HeaderInjectionMode::RenameThenAuthorization,
            HeaderValue::from_static("Bearer iap"),
        );
        assert_eq!(values(&h, "authorization"), vec!["Bearer iap"]);
        assert!(h.get("x-real-authorization").is_none());
    }

    #[test_case(&[], "authorization", "Bearer iap"; "empty slot")]
    #[test_case(&[("authorization", "Bearer user")], "proxy-authorization", "Bearer iap"; "occupied slot")]
    fn authorization_mode(initial: &[(&str, &str)], slot: &str, expected: &str) {
        let mut h = headers(initial);
        inject_credential(
            &mut h,
            HeaderInjectionMode::Authorization,
            HeaderValue::from_static("Bearer iap"),
        );
        assert_eq!(values(&h, slot), vec![expected]);
    }

    #[test]
    fn proxy_authorization_mode() {
        let mut h = headers(&[("authorization", "Bearer user")]);
        inject_credential(
            &mut h,
            HeaderInjectionMode::ProxyAuthorization,
            HeaderValue::from_static("Bearer iap"),
        );
        assert_eq!(values(&h, "authorization"), vec!["Bearer user"]);
        assert_eq!(values(&h, "proxy-authorization"), vec!["Bearer iap"]);
    }

    #[test]
    fn round_trip_restores_caller_credential() {
        let mut h = headers(&[("authorization", "Bearer user")]);
        inject_credential(
            &mut h,
            HeaderInjectionMode::RenameThenAuthorization,
            HeaderValue::from_static("Bearer iap"),
        );
        restore_authorization(&mut h);
        assert_eq!(values(&h, "authorization"), vec!["Bearer user"]);
        assert!(h.get("x-real-authorization").is_none());
    }

    #[test]
    fn restore_without_marker_is_noop() {
        let mut h = headers(&[("authorization", "Bearer iap")]);
        restore_authorization(&mut h);
        assert_eq!(values(&h, "authorization"), vec!["Bearer iap"]);
    }

    #[test]
    fn retargets_keeping_path_and_query() {
        let target: Uri = "https://iap.example.com".parse().unwrap();
        let uri: Uri = "/api/v1/pods?watch=1".parse().unwrap();
        assert_eq!(
            retarget(&uri, &target).unwrap(),
            "https://iap.example.com/api/v1/pods?watch=1"
        );
        let uri: Uri = "http://10.0.0.5:443/version".parse().unwrap();
        assert_eq!(
            retarget(&uri, &target).unwrap(),
            "https://iap.example.com/version"
        );
    }

    #[tokio::test]
    async fn rewrites_request() {
        let tokens = Arc::new(MockTokenProvider::new("iap-token"));
        let rw = Rewriter::new(
            "https://iap.example.com".parse().unwrap(),
            HeaderInjectionMode::RenameThenAuthorization,
            tokens,
        );
        let req = Request::get("/api?x=1")
            .header("authorization", "Bearer user")
            .header("connection", "close")
            .header("accept-encoding", "gzip")
            .body(())
            .unwrap();
        let origin = Authority::from_static("10.0.0.5:443");
        let out = rw.rewrite(req, Some(&origin)).await.unwrap();
        assert_eq!(out.uri(), "https://iap.example.com/api?x=1");
        assert_eq!(out.headers()["host"], "10.0.0.5:443");
        assert_eq!(out.headers()["authorization"], "Bearer iap-token");
        assert_eq!(out.headers()["x-real-authorization"], "Bearer user");
        assert_eq!(out.headers()["connection"], "close");
        assert!(out.headers().get("accept-encoding").is_none());
    }

    #[tokio::test]
    async fn keeps_upgrade_pair() {
        let rw = Rewriter::new(
            "https://iap.example.com".parse().unwrap(),
            HeaderInjectionMode::default(),
            Arc::new(MockTokenProvider::new("iap-token")),
        );
        let req = Request::post("/api/v1/namespaces/default/pods/p/exec")
            .header("connection", "Upgrade")
            .header("upgrade", "SPDY/3.1")
            .header("proxy-connection", "keep-alive")
            .body(())
            .unwrap();
        let out = rw.rewrite(req, None).await.unwrap();
        assert_eq!(out.headers()["connection"], "upgrade");
        assert_eq!(out.headers()["upgrade"], "SPDY/3.1");
        assert!(out.headers().get("proxy-connection").is_none());
    }

    #[tokio::test]
    async fn credential_failure() {
        let tokens = Arc::new(MockTokenProvider::new("iap-token"));
        tokens.set_failing(true);
        let rw = Rewriter::new(
            "https://iap.example.com".parse().unwrap(),
            HeaderInjectionMode::default(),
            tokens,
        );
        let req = Request::get("/").body(()).unwrap();
        assert_matches!(
            rw.rewrite(req, None).await,
            Err(RewriteError::Credentials(_))
        );
    }
}
