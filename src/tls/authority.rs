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

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, Issuer, KeyPair,
    KeyUsagePurpose, SanType,
};
use rustls::ServerConfig;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tracing::{debug, trace};

use crate::tls::{Error, ListenerCertificate, lib};

const LEAF_VALIDITY: Duration = Duration::from_secs(365 * 24 * 60 * 60);
// Leaves are backdated to tolerate clock skew between the proxy and its callers.
const LEAF_BACKDATE: Duration = Duration::from_secs(60 * 60);

/// What the client proxy does with a CONNECT tunnel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectAction {
    /// Relay bytes to the requested destination without inspecting them.
    Accept,
    /// Terminate TLS with a leaf issued for the host and handle the requests inside.
    Mitm,
    /// Handle the requests inside only if the tunnel carries plain HTTP.
    HttpMitm,
    /// Refuse the tunnel.
    Reject,
}

impl fmt::Display for ConnectAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectAction::Accept => "accept",
            ConnectAction::Mitm => "mitm",
            ConnectAction::HttpMitm => "http-mitm",
            ConnectAction::Reject => "reject",
        };
        f.write_str(s)
    }
}

/// CertificateAuthority issues leaf certificates for intercepted hosts, signed by a loaded root.
/// Leaves are cached per host for the life of the process.
pub struct CertificateAuthority {
    issuer: Issuer<'static, KeyPair>,
    leaves: RwLock<HashMap<String, Arc<CertifiedKey>>>,
}

impl fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("leaves", &self.len())
            .finish()
    }
}

impl CertificateAuthority {
    pub fn from_pem(key_pem: &str, cert_pem: &str) -> Result<Self, Error> {
        let key = KeyPair::from_pem(key_pem)?;
        let issuer = Issuer::from_ca_cert_pem(cert_pem, key)?;
        Ok(CertificateAuthority {
            issuer,
            leaves: RwLock::new(HashMap::new()),
        })
    }

    pub fn from_listener(cert: &ListenerCertificate) -> Result<Self, Error> {
        Self::from_pem(&cert.key_pem, &cert.cert_pem)
    }

    /// Returns the leaf for `host`, issuing it on first use. `host` carries no port.
    pub fn issue(&self, host: &str) -> Result<Arc<CertifiedKey>, Error> {
        let host = host.to_ascii_lowercase();
        if let Some(key) = self.leaves.read().expect("mutex").get(&host) {
            trace!(%host, "leaf cache hit");
            return Ok(key.clone());
        }

        debug!(%host, "issuing leaf certificate");
        let key = Arc::new(self.sign(&host)?);
        let mut leaves = self.leaves.write().expect("mutex");
        // Another connection may have raced us here; keep whichever landed first.
        Ok(leaves.entry(host).or_insert(key).clone())
    }

    fn sign(&self, host: &str) -> Result<CertifiedKey, Error> {
        if host.is_empty() {
            return Err(Error::InvalidHostName(host.to_string()));
        }
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        params.subject_alt_names = vec![match host.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(
                host.try_into()
                    .map_err(|_| Error::InvalidHostName(host.to_string()))?,
            ),
        }];
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let now = SystemTime::now();
        params.not_before = (now - LEAF_BACKDATE).into();
        params.not_after = (now + LEAF_VALIDITY).into();

        let leaf_key = KeyPair::generate()?;
        let cert = params.signed_by(&leaf_key, &self.issuer)?;
        let signing_key = lib::provider()
            .key_provider
            .load_private_key(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
                leaf_key.serialize_der(),
            )))?;
        Ok(CertifiedKey::new(vec![cert.der().clone()], signing_key))
    }

    pub fn len(&self) -> usize {
        self.leaves.read().expect("mutex").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// TLS server configuration for one intercepted tunnel. Only the leaf for `host`, the
    /// destination that was approved for interception, is ever presented; it is issued up
    /// front so failures surface before the handshake.
    pub fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>, Error> {
        let resolver = HostResolver {
            host: host.to_string(),
            key: self.issue(host)?,
        };
        let mut sc = ServerConfig::builder_with_provider(lib::provider())
            .with_protocol_versions(lib::tls_versions())?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(resolver));
        sc.alpn_protocols = lib::alpn();
        Ok(Arc::new(sc))
    }
}

struct HostResolver {
    host: String,
    key: Arc<CertifiedKey>,
}

impl fmt::Debug for HostResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostResolver")
            .field("host", &self.host)
            .finish()
    }
}

impl ResolvesServerCert for HostResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        if let Some(sni) = client_hello.server_name() {
            if !sni.eq_ignore_ascii_case(&self.host) {
                debug!(host=%self.host, %sni, "server name differs from tunnel destination");
            }
        }
        Some(self.key.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::mock::TestCa;
    use matches::assert_matches;
    use x509_parser::extensions::GeneralName;

    fn authority() -> Arc<CertificateAuthority> {
        let ca = TestCa::new("mitm-root");
        Arc::new(CertificateAuthority::from_pem(&ca.key_pem(), &ca.cert_pem()).unwrap())
    }

    fn sans(key: &CertifiedKey) -> Vec<String> {
        let (_, cert) = x509_parser::parse_x509_certificate(&key.cert[0]).unwrap();
        cert.subject_alternative_name()
            .unwrap()
            .unwrap()
            .value
            .general_names
            .iter()
            .map(|n| match n {
                GeneralName::DNSName(d) => d.to_string(),
                GeneralName::IPAddress(ip) => format!("{ip:?}"),
                other => other.to_string(),
            })
            .collect()
    }

    #[test]
    fn issues_dns_leaf_once() {
        let ca = authority();
        let a = ca.issue("api.example.com").unwrap();
        let b = ca.issue("API.example.com").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(ca.len(), 1);
        assert_eq!(sans(&a), vec!["api.example.com"]);
    }

    #[test]
    fn issues_ip_leaf() {
        let ca = authority();
        let key = ca.issue("10.0.0.5").unwrap();
        assert_eq!(sans(&key), vec![format!("{:?}", &[10u8, 0, 0, 5][..])]);
    }

    #[test]
    fn rejects_invalid_host() {
        let ca = authority();
        assert_matches!(ca.issue(""), Err(Error::InvalidHostName(_)));
        assert_matches!(ca.server_config(""), Err(Error::InvalidHostName(_)));
        assert!(ca.is_empty());
    }

    #[test]
    fn server_config_issues_up_front() {
        let ca = authority();
        let sc = ca.server_config("cluster.internal").unwrap();
        assert_eq!(sc.alpn_protocols, vec![b"http/1.1".to_vec()]);
        assert_eq!(ca.len(), 1);
    }

    #[tokio::test]
    async fn foreign_server_names_get_no_leaf() {
        let root = TestCa::new("mitm-root");
        let ca = CertificateAuthority::from_pem(&root.key_pem(), &root.cert_pem()).unwrap();
        let sc = ca.server_config("api.internal").unwrap();

        for (sni, ok) in [("other.example.com", false), ("api.internal", true)] {
            let (client, server) = tokio::io::duplex(16 * 1024);
            let acceptor = tokio_rustls::TlsAcceptor::from(sc.clone());
            let server = tokio::spawn(async move { acceptor.accept(server).await.is_ok() });
            let connector = tokio_rustls::TlsConnector::from(Arc::new(
                crate::tls::client_config(root.root_store()).unwrap(),
            ));
            let name = rustls::pki_types::ServerName::try_from(sni.to_string()).unwrap();
            assert_eq!(connector.connect(name, client).await.is_ok(), ok, "{sni}");
            if ok {
                assert!(server.await.unwrap());
            }
        }
        assert_eq!(ca.len(), 1);
    }

    #[test]
    fn rejects_non_ca_material() {
        assert!(CertificateAuthority::from_pem("garbage", "garbage").is_err());
    }
}
