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

use ::hyper_util::rt::TokioIo;
use hyper::header::{CONNECTION, HeaderValue, UPGRADE};
use hyper::upgrade::OnUpgrade;
use hyper::{HeaderMap, Request, Response, StatusCode};
use tracing::debug;

/// The protocol a request asks to switch to, when `Connection` carries the `upgrade` token.
/// Exec, attach and port-forward sessions arrive this way.
pub fn requested_protocol(headers: &HeaderMap) -> Option<HeaderValue> {
    let wants_upgrade = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    if !wants_upgrade {
        return None;
    }
    headers.get(UPGRADE).cloned()
}

/// Puts back the upgrade pair after hop-by-hop stripping removed it.
pub fn preserve(headers: &mut HeaderMap, protocol: HeaderValue) {
    headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
    headers.insert(UPGRADE, protocol);
}

/// Takes the downstream half of an upgrade out of `req`, if the caller asked for one.
pub fn take<B>(req: &mut Request<B>) -> Option<OnUpgrade> {
    requested_protocol(req.headers())?;
    Some(hyper::upgrade::on(req))
}

/// Joins both halves once the upstream agreed to switch protocols. `resp` is returned to the
/// caller unchanged; the relay starts after hyper has written it.
pub fn splice<B>(downstream: Option<OnUpgrade>, resp: &mut Response<B>, host: &str) {
    let Some(downstream) = downstream else {
        return;
    };
    if resp.status() != StatusCode::SWITCHING_PROTOCOLS {
        return;
    }
    let upstream = hyper::upgrade::on(resp);
    let host = host.to_string();
    tokio::spawn(async move {
        let (down, up) = match tokio::try_join!(downstream, upstream) {
            Ok(pair) => pair,
            Err(e) => {
                debug!(%host, "upgrade failed: {e}");
                return;
            }
        };
        let mut down = TokioIo::new(down);
        let mut up = TokioIo::new(up);
        match tokio::io::copy_bidirectional(&mut down, &mut up).await {
            Ok((sent, received)) => debug!(%host, sent, received, "upgraded connection closed"),
            Err(e) => debug!(%host, "upgraded connection closed with error: {e}"),
        }
    });
}
