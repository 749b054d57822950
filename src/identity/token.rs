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

use std::fmt;
use std::time::{Duration, SystemTime};

/// Token is a short lived bearer credential. It is never persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    pub token_type: String,
    pub access_token: String,
    pub expiry: Option<SystemTime>,
}

impl Token {
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Token {
            token_type: "Bearer".to_string(),
            access_token: access_token.into(),
            expiry: None,
        }
    }

    pub fn with_expiry(mut self, expiry: SystemTime) -> Self {
        self.expiry = Some(expiry);
        self
    }

    /// Header value for this token, `<type> <token>`.
    pub fn authorization(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }

    /// Whether the token is still usable `margin` from now. Tokens without a known expiry
    /// are never considered fresh.
    pub fn is_fresh(&self, now: SystemTime, margin: Duration) -> bool {
        match self.expiry {
            Some(expiry) => now + margin < expiry,
            None => false,
        }
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("token_type", &self.token_type)
            .field("access_token", &"<redacted>")
            .field("expiry", &self.expiry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorization_value() {
        assert_eq!(Token::bearer("abc").authorization(), "Bearer abc");
    }

    #[test]
    fn freshness() {
        let now = SystemTime::now();
        let margin = Duration::from_secs(60);
        assert!(!Token::bearer("a").is_fresh(now, margin));
        let t = Token::bearer("a").with_expiry(now + Duration::from_secs(120));
        assert!(t.is_fresh(now, margin));
        assert!(!t.is_fresh(now + Duration::from_secs(61), margin));
    }

    #[test]
    fn debug_redacts() {
        let t = Token::bearer("secret-value");
        assert!(!format!("{t:?}").contains("secret-value"));
    }
}
