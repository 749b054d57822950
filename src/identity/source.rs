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

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use hyper::Request;
use serde::Deserialize;
use tracing::debug;

use super::{Error, Token, TokenProvider};
use crate::hyper_util::{self, HttpsClient};

pub const METADATA_URL: &str = "http://metadata.google.internal";
const METADATA_FLAVOR: &str = "Metadata-Flavor";

/// CredentialSource is where the proxy's own access token comes from.
#[derive(serde::Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum CredentialSource {
    /// An access token maintained in a file by some other process.
    TokenFile(PathBuf),
    /// The compute metadata server's default service account.
    Metadata,
}

#[derive(Deserialize)]
struct MetadataToken {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
    token_type: String,
}

/// SourceCredentials fetches access tokens from a [CredentialSource].
pub struct SourceCredentials {
    source: CredentialSource,
    client: HttpsClient,
    metadata_url: String,
}

impl SourceCredentials {
    pub fn new(source: CredentialSource, client: HttpsClient) -> Self {
        SourceCredentials {
            source,
            client,
            metadata_url: METADATA_URL.to_string(),
        }
    }

    /// Points metadata lookups at another server.
    pub fn with_metadata_url(mut self, url: impl Into<String>) -> Self {
        self.metadata_url = url.into().trim_end_matches('/').to_string();
        self
    }

    fn metadata_request(
        &self,
        path: &str,
    ) -> Result<(String, Request<hyper_util::BoxBody>), Error> {
        let endpoint = format!("{}/computeMetadata/v1/{path}", self.metadata_url);
        let req = Request::get(&endpoint)
            .header(METADATA_FLAVOR, "Google")
            .body(hyper_util::empty())?;
        Ok((endpoint, req))
    }
}

async fn load_token_file(path: &PathBuf) -> Result<Token, Error> {
    let t = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| Error::TokenFile {
            path: path.clone(),
            source,
        })?;
    let t = t.trim();
    if t.is_empty() {
        return Err(Error::EmptyTokenFile(path.clone()));
    }
    Ok(Token::bearer(t))
}

#[async_trait::async_trait]
impl TokenProvider for SourceCredentials {
    async fn fetch_token(&self) -> Result<Token, Error> {
        match &self.source {
            CredentialSource::TokenFile(path) => load_token_file(path).await,
            CredentialSource::Metadata => {
                let (endpoint, req) =
                    self.metadata_request("instance/service-accounts/default/token")?;
                let resp: MetadataToken = hyper_util::fetch_json(&self.client, req)
                    .await
                    .map_err(|source| Error::Fetch {
                        endpoint: endpoint.clone(),
                        source,
                    })?;
                if resp.access_token.is_empty() {
                    return Err(Error::EmptyToken(endpoint));
                }
                Ok(Token {
                    token_type: resp.token_type,
                    access_token: resp.access_token,
                    expiry: expiry_after(SystemTime::now(), resp.expires_in),
                })
            }
        }
    }

    async fn default_project(&self) -> Result<Option<String>, Error> {
        match &self.source {
            CredentialSource::TokenFile(_) => Ok(None),
            CredentialSource::Metadata => {
                let (endpoint, req) = self.metadata_request("project/project-id")?;
                let body = hyper_util::fetch(&self.client, req)
                    .await
                    .map_err(|source| Error::Fetch { endpoint, source })?;
                let project = String::from_utf8_lossy(&body).trim().to_string();
                debug!(%project, "resolved default project from metadata server");
                Ok(Some(project).filter(|p| !p.is_empty()))
            }
        }
    }
}

/// `None` when the server gave no lifetime or one past what `SystemTime` can hold.
fn expiry_after(now: SystemTime, expires_in: u64) -> Option<SystemTime> {
    if expires_in == 0 {
        return None;
    }
    now.checked_add(Duration::from_secs(expires_in))
}
