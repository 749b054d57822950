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

use std::net::IpAddr;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SanType,
};
use rustls::RootCertStore;

use crate::tls::ListenerCertificate;

/// TestCa is a throwaway root used to mint listener and upstream certificates in tests.
pub struct TestCa {
    cert_pem: String,
    key_pem: String,
    issuer: Issuer<'static, KeyPair>,
}

impl TestCa {
    pub fn new(name: &str) -> Self {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, name);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let cert = params.self_signed(&key).unwrap();
        let cert_pem = cert.pem();
        let key_pem = key.serialize_pem();
        let issuer = Issuer::new(params, key);
        TestCa {
            cert_pem,
            key_pem,
            issuer,
        }
    }

    pub fn cert_pem(&self) -> String {
        self.cert_pem.clone()
    }

    pub fn key_pem(&self) -> String {
        self.key_pem.clone()
    }

    /// The root encoded the way a cluster inventory reports it.
    pub fn cert_base64(&self) -> String {
        STANDARD.encode(&self.cert_pem)
    }

    pub fn root_store(&self) -> Arc<RootCertStore> {
        let mut store = RootCertStore::empty();
        store
            .add_parsable_certificates(rustls_pemfile::certs(&mut self.cert_pem.as_bytes()).flatten());
        Arc::new(store)
    }

    /// Issues a serving certificate for `host` (a DNS name or IP literal).
    pub fn leaf(&self, host: &str) -> ListenerCertificate {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        params.subject_alt_names = vec![match host.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(host.try_into().unwrap()),
        }];
        let cert = params.signed_by(&key, &self.issuer).unwrap();
        ListenerCertificate::new(key.serialize_pem().as_bytes(), cert.pem().as_bytes()).unwrap()
    }

    /// Listener certificate for the root itself, as used by the client proxy.
    pub fn as_listener(&self) -> ListenerCertificate {
        ListenerCertificate::new(self.key_pem.as_bytes(), self.cert_pem.as_bytes()).unwrap()
    }
}
