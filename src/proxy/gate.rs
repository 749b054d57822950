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

use regex::Regex;

use crate::directory::{Cache, strip_port};

/// InterceptionGate decides which destinations the client proxy takes over.
pub struct InterceptionGate {
    directory: Option<Arc<Cache>>,
    patterns: Vec<Regex>,
}

impl InterceptionGate {
    pub fn new(directory: Option<Arc<Cache>>, patterns: &[String]) -> Result<Self, regex::Error> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(InterceptionGate {
            directory,
            patterns,
        })
    }

    /// `host` may carry a port. Patterns are tried against both forms.
    pub fn is_in_scope(&self, host: &str) -> bool {
        if let Some(directory) = &self.directory {
            if directory.lookup(host).is_some() {
                return true;
            }
        }
        let bare = strip_port(host);
        self.patterns
            .iter()
            .any(|p| p.is_match(bare) || p.is_match(host))
    }
}
