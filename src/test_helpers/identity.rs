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

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::identity::{Error, Token, TokenProvider};

/// MockTokenProvider hands out a fixed bearer token and counts calls.
#[derive(Default)]
pub struct MockTokenProvider {
    token: Mutex<String>,
    project: Option<String>,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl MockTokenProvider {
    pub fn new(token: &str) -> Self {
        MockTokenProvider {
            token: Mutex::new(token.to_string()),
            ..Default::default()
        }
    }

    pub fn with_project(mut self, project: &str) -> Self {
        self.project = Some(project.to_string());
        self
    }

    pub fn set_token(&self, token: &str) {
        *self.token.lock().unwrap() = token.to_string();
    }

    /// While failing, every fetch returns [Error::EmptyToken].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl TokenProvider for MockTokenProvider {
    async fn fetch_token(&self) -> Result<Token, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::EmptyToken("mock".to_string()));
        }
        Ok(Token::bearer(self.token.lock().unwrap().clone()))
    }

    async fn default_project(&self) -> Result<Option<String>, Error> {
        Ok(self.project.clone())
    }
}
