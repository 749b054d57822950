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

use crate::hyper_util;

mod idtoken;
pub use idtoken::*;

mod source;
pub use source::*;

mod token;
pub use token::*;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to read token file {path}: {source}")]
    TokenFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("token file {0} exists, but was empty")]
    EmptyTokenFile(PathBuf),
    #[error("{endpoint}: {source}")]
    Fetch {
        endpoint: String,
        source: hyper_util::Error,
    },
    #[error("{0} returned an empty token")]
    EmptyToken(String),
    #[error("invalid request: {0}")]
    Request(#[from] http::Error),
    #[error("encoding request: {0}")]
    Encode(#[from] serde_json::Error),
}

/// TokenProvider produces the credential placed on outbound requests.
#[async_trait::async_trait]
pub trait TokenProvider: Send + Sync {
    async fn fetch_token(&self) -> Result<Token, Error>;

    /// Project the credential belongs to, when the source knows it.
    async fn default_project(&self) -> Result<Option<String>, Error> {
        Ok(None)
    }
}
