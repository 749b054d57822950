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

use crate::tls;

mod client;
pub use client::*;

mod gate;
pub use gate::*;

mod reverse;
pub use reverse::*;

mod rewind;

mod rewrite;
pub use rewrite::*;

pub mod upgrade;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to bind to address {0}: {1}")]
    Bind(SocketAddr, std::io::Error),

    #[error("tls: {0}")]
    Tls(#[from] tls::Error),

    #[error("invalid host pattern: {0}")]
    HostPattern(#[from] regex::Error),

    #[error("invalid target url: {0}")]
    InvalidTarget(#[from] hyper::http::uri::InvalidUri),

    #[error("target url {0} must be https")]
    TargetNotHttps(String),
}

/// Runnable is a proxy engine that has bound its listener and is ready to serve.
pub trait Runnable: Send {
    fn address(&self) -> SocketAddr;

    /// Starts serving in the background. Serving stops when the engine's drain is signaled.
    fn run(self: Box<Self>) -> Result<(), Error>;
}
