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

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pemfile::Item;
use tracing::{debug, warn};
use x509_parser::certificate::X509Certificate;

use crate::tls::{Error, lib};

#[derive(Clone, Debug)]
pub struct Certificate {
    pub expiry: Expiration,
    pub der: CertificateDer<'static>,
}

#[derive(Clone, Debug)]
pub struct Expiration {
    pub not_before: SystemTime,
    pub not_after: SystemTime,
}

/// The key pair a proxy presents on its listener. On the client it is also the root the
/// MITM leaves are signed with, so the original PEM text is retained.
#[derive(Debug)]
pub struct ListenerCertificate {
    /// cert is the leaf certificate
    pub cert: Certificate,
    /// chain holds any further certificates that followed the leaf in the PEM file
    pub chain: Vec<Certificate>,
    pub private_key: PrivateKeyDer<'static>,
    pub(crate) cert_pem: String,
    pub(crate) key_pem: String,
}

fn expiration(cert: X509Certificate) -> Expiration {
    Expiration {
        not_before: UNIX_EPOCH
            + Duration::from_secs(
                cert.validity
                    .not_before
                    .timestamp()
                    .try_into()
                    .unwrap_or_default(),
            ),
        not_after: UNIX_EPOCH
            + Duration::from_secs(
                cert.validity
                    .not_after
                    .timestamp()
                    .try_into()
                    .unwrap_or_default(),
            ),
    }
}

fn parse_cert_multi(mut cert: &[u8]) -> Result<Vec<Certificate>, Error> {
    let mut reader = std::io::BufReader::new(Cursor::new(&mut cert));
    let parsed: Result<Vec<_>, _> = rustls_pemfile::read_all(&mut reader).collect();
    parsed
        .map_err(|e| Error::CertificateParseError(e.to_string()))?
        .into_iter()
        .filter_map(|p| match p {
            Item::X509Certificate(der) => Some(der),
            _ => None,
        })
        .map(|der| {
            let (_, cert) = x509_parser::parse_x509_certificate(&der)?;
            Ok(Certificate {
                expiry: expiration(cert),
                der: der.clone(),
            })
        })
        .collect()
}

fn parse_key(mut key: &[u8]) -> Result<PrivateKeyDer<'static>, Error> {
    let mut reader = std::io::BufReader::new(Cursor::new(&mut key));
    let parsed = rustls_pemfile::read_one(&mut reader)
        .map_err(|e| Error::CertificateParseError(e.to_string()))?
        .ok_or_else(|| Error::CertificateParseError("no key".to_string()))?;
    match parsed {
        Item::Pkcs8Key(c) => Ok(PrivateKeyDer::Pkcs8(c)),
        _ => Err(Error::CertificateParseError(
            "key must be PKCS#8 PEM".to_string(),
        )),
    }
}

fn read(path: &Path) -> Result<Vec<u8>, Error> {
    std::fs::read(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })
}

impl ListenerCertificate {
    pub fn new(key: &[u8], cert: &[u8]) -> Result<ListenerCertificate, Error> {
        let mut certs = parse_cert_multi(cert)?.into_iter();
        let Some(leaf) = certs.next() else {
            return Err(Error::CertificateParseError("no certificate".to_string()));
        };
        let private_key = parse_key(key)?;
        let now = SystemTime::now();
        if leaf.expiry.not_after < now {
            warn!("listener certificate expired at {:?}", leaf.expiry.not_after);
        }
        Ok(ListenerCertificate {
            cert: leaf,
            chain: certs.collect(),
            private_key,
            cert_pem: String::from_utf8_lossy(cert).into_owned(),
            key_pem: String::from_utf8_lossy(key).into_owned(),
        })
    }

    pub fn from_files(key: &Path, cert: &Path) -> Result<ListenerCertificate, Error> {
        Self::new(&read(key)?, &read(cert)?)
    }

    fn cert_and_intermediates_der(&self) -> Vec<CertificateDer<'static>> {
        std::iter::once(self.cert.der.clone())
            .chain(self.chain.iter().map(|x| x.der.clone()))
            .collect()
    }

    /// TLS configuration for a listener presenting this certificate. Clients are not authenticated.
    pub fn server_config(&self) -> Result<ServerConfig, Error> {
        let mut sc = ServerConfig::builder_with_provider(lib::provider())
            .with_protocol_versions(lib::tls_versions())?
            .with_no_client_auth()
            .with_single_cert(
                self.cert_and_intermediates_der(),
                self.private_key.clone_key(),
            )?;
        sc.alpn_protocols = lib::alpn();
        Ok(sc)
    }
}

/// Builds a trust pool from a base64 encoded PEM bundle, the format cluster inventories
/// publish CA material in.
pub fn root_store_from_base64(encoded: &str) -> Result<RootCertStore, Error> {
    let pem = STANDARD.decode(encoded.trim())?;
    let roots = parse_cert_multi(&pem)?;
    if roots.is_empty() {
        return Err(Error::InvalidRootCert(
            "no root certificate present".to_string(),
        ));
    }
    let mut store = RootCertStore::empty();
    let (_valid, invalid) = store.add_parsable_certificates(roots.into_iter().map(|c| c.der));
    if invalid > 0 {
        warn!("warning: found {invalid} invalid root certs");
    }
    if store.is_empty() {
        return Err(Error::InvalidRootCert(
            "no usable root certificate".to_string(),
        ));
    }
    Ok(store)
}

/// The platform trust store, used for the access-proxy front door.
pub fn native_root_store() -> Result<RootCertStore, Error> {
    let native = rustls_native_certs::load_native_certs();
    for err in native.errors {
        debug!("failed to load native cert: {err}");
    }
    let mut store = RootCertStore::empty();
    let (_valid, invalid) = store.add_parsable_certificates(native.certs);
    if invalid > 0 {
        debug!("skipped {invalid} native root certs");
    }
    if store.is_empty() {
        return Err(Error::InvalidRootCert(
            "no system root certificates found".to_string(),
        ));
    }
    Ok(store)
}

/// Client configuration that trusts exactly `roots`.
pub fn client_config(roots: Arc<RootCertStore>) -> Result<ClientConfig, Error> {
    // No ALPN here, the HTTPS connector negotiates its own.
    Ok(ClientConfig::builder_with_provider(lib::provider())
        .with_protocol_versions(lib::tls_versions())?
        .with_root_certificates(roots)
        .with_no_client_auth())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::mock;
    use matches::assert_matches;

    #[test]
    fn root_store_from_encoded_pem() {
        let ca = mock::TestCa::new("cluster-ca");
        let store = root_store_from_base64(&STANDARD.encode(ca.cert_pem())).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn root_store_rejects_garbage() {
        assert_matches!(
            root_store_from_base64("not base64!!"),
            Err(Error::Base64(_))
        );
        assert_matches!(
            root_store_from_base64(&STANDARD.encode("hello")),
            Err(Error::InvalidRootCert(_))
        );
    }

    #[test]
    fn listener_certificate() {
        let ca = mock::TestCa::new("listener");
        let lc = ListenerCertificate::new(ca.key_pem().as_bytes(), ca.cert_pem().as_bytes())
            .unwrap();
        assert!(lc.chain.is_empty());
        assert!(lc.cert.expiry.not_after > SystemTime::now());
        let sc = lc.server_config().unwrap();
        assert_eq!(sc.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn listener_certificate_requires_pkcs8() {
        let ca = mock::TestCa::new("listener");
        let res = ListenerCertificate::new(b"", ca.cert_pem().as_bytes());
        assert_matches!(res, Err(Error::CertificateParseError(_)));
    }
}
