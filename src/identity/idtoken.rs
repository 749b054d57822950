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
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hyper::Request;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{Error, Token, TokenProvider};
use crate::hyper_util::{self, HttpsClient};

pub const IAM_CREDENTIALS_URL: &str = "https://iamcredentials.googleapis.com";

// Tokens are refreshed this long before they expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateIdTokenRequest<'a> {
    audience: &'a str,
    include_email: bool,
}

#[derive(Deserialize)]
struct GenerateIdTokenResponse {
    token: String,
}

#[derive(Deserialize)]
struct Claims {
    exp: u64,
}

/// IdTokenProvider impersonates a service account to mint OpenID Connect tokens for the
/// access proxy's audience. Tokens are reused until shortly before they expire.
pub struct IdTokenProvider {
    source: Arc<dyn TokenProvider>,
    client: HttpsClient,
    service_account: String,
    audience: String,
    endpoint: String,
    cached: Mutex<Option<Token>>,
}

impl IdTokenProvider {
    pub fn new(
        source: Arc<dyn TokenProvider>,
        client: HttpsClient,
        service_account: impl Into<String>,
        audience: impl Into<String>,
    ) -> Self {
        IdTokenProvider {
            source,
            client,
            service_account: service_account.into(),
            audience: audience.into(),
            endpoint: IAM_CREDENTIALS_URL.to_string(),
            cached: Mutex::new(None),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    async fn generate(&self) -> Result<Token, Error> {
        let source = self.source.fetch_token().await?;
        let endpoint = format!(
            "{}/v1/projects/-/serviceAccounts/{}:generateIdToken",
            self.endpoint, self.service_account
        );
        let body = serde_json::to_vec(&GenerateIdTokenRequest {
            audience: &self.audience,
            include_email: true,
        })?;
        let req = Request::post(&endpoint)
            .header(AUTHORIZATION, source.authorization())
            .header(CONTENT_TYPE, "application/json")
            .body(hyper_util::full(body))?;
        let resp: GenerateIdTokenResponse = hyper_util::fetch_json(&self.client, req)
            .await
            .map_err(|source| Error::Fetch {
                endpoint: endpoint.clone(),
                source,
            })?;
        if resp.token.is_empty() {
            return Err(Error::EmptyToken(endpoint));
        }
        let expiry = jwt_expiry(&resp.token);
        if expiry.is_none() {
            warn!("id token carries no readable expiry, it will not be cached");
        }
        Ok(Token {
            token_type: "Bearer".to_string(),
            access_token: resp.token,
            expiry,
        })
    }
}

/// Reads the `exp` claim without verifying the token; we are its bearer, not its audience.
fn jwt_expiry(token: &str) -> Option<SystemTime> {
    let payload = token.split('.').nth(1)?;
    let raw = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Claims = serde_json::from_slice(&raw).ok()?;
    UNIX_EPOCH.checked_add(Duration::from_secs(claims.exp))
}

#[async_trait::async_trait]
impl TokenProvider for IdTokenProvider {
    async fn fetch_token(&self) -> Result<Token, Error> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.is_fresh(SystemTime::now(), EXPIRY_MARGIN) {
                return Ok(token.clone());
            }
        }
        debug!(service_account=%self.service_account, "generating id token");
        let token = self.generate().await?;
        *cached = Some(token.clone());
        Ok(token)
    }

    async fn default_project(&self) -> Result<Option<String>, Error> {
        self.source.default_project().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::helpers;
    use crate::test_helpers::identity::MockTokenProvider;
    use matches::assert_matches;

    #[test]
    fn reads_jwt_expiry() {
        let token = helpers::fake_jwt(1_700_000_000);
        assert_eq!(
            jwt_expiry(&token),
            Some(UNIX_EPOCH + Duration::from_secs(1_700_000_000))
        );
        assert_eq!(jwt_expiry("not-a-jwt"), None);
    }

    #[test]
    fn unrepresentable_expiry_is_unknown() {
        assert_eq!(jwt_expiry(&helpers::fake_jwt(u64::MAX)), None);
    }

    #[tokio::test]
    async fn generates_and_caches() {
        let iam = helpers::MockIamServer::spawn().await;
        let source = Arc::new(MockTokenProvider::new("source-token"));
        let provider = IdTokenProvider::new(
            source.clone(),
            helpers::plain_client(),
            "proxy@p.iam.gserviceaccount.com",
            "my-audience",
        )
        .with_endpoint(iam.url());

        let first = provider.fetch_token().await.unwrap();
        let second = provider.fetch_token().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(source.calls(), 1);
        assert_eq!(iam.requests(), 1);
        assert_eq!(
            iam.last_request().as_deref(),
            Some("Bearer source-token my-audience proxy@p.iam.gserviceaccount.com")
        );
    }

    #[tokio::test]
    async fn source_failure_propagates() {
        let source = Arc::new(MockTokenProvider::new("unused"));
        source.set_failing(true);
        let provider =
            IdTokenProvider::new(source, helpers::plain_client(), "sa", "aud")
                .with_endpoint("http://127.0.0.1:1");
        assert_matches!(provider.fetch_token().await, Err(Error::EmptyToken(_)));
    }
}
