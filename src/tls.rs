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

mod authority;
mod certificate;
mod lib;
#[cfg(any(test, feature = "testing"))]
pub mod mock;

use std::path::PathBuf;

pub use crate::tls::authority::*;
pub use crate::tls::certificate::*;
pub use crate::tls::lib::*;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid root certificate: {0}")]
    InvalidRootCert(String),

    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),

    #[error("certificate parse: {0}")]
    CertificateParseNomError(#[from] x509_parser::nom::Err<x509_parser::error::X509Error>),

    #[error("certificate: {0}")]
    CertificateParseError(String),

    #[error("base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("certificate issuance: {0}")]
    Issue(#[from] rcgen::Error),

    #[error("cannot issue a certificate for {0:?}")]
    InvalidHostName(String),
}
