//! Test PKI built with rcgen: one CA per trust domain, SPIFFE leaves.

use oneedge_agent::common::credential::{Credential, TrustBundle};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SanType, SignatureAlgorithm,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use spiffe::spiffe_id::TrustDomain;
use std::path::Path;

pub const TRUST_DOMAIN: &str = "oneedge.local";
pub const AGENT_PATH: &str = "/device/dev/agent";
pub const BROKER_PATH: &str = "/mqtt-broker";

pub struct TestCa {
    pub cert: Certificate,
    pub key: KeyPair,
    pub trust_domain: String,
}

pub struct Issued {
    pub cert: Certificate,
    pub key: KeyPair,
    pub spiffe_id: Option<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl TestCa {
    pub fn new(trust_domain: &str) -> Self {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, format!("{trust_domain} test CA"));
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params
            .subject_alt_names
            .push(SanType::URI(format!("spiffe://{trust_domain}").try_into().unwrap()));
        let cert = params.self_signed(&key).unwrap();
        Self {
            cert,
            key,
            trust_domain: trust_domain.to_string(),
        }
    }

    pub fn der(&self) -> CertificateDer<'static> {
        self.cert.der().clone()
    }

    /// Leaf for `spiffe://<trust_domain><path>`.
    pub fn issue(&self, path: &str, role: Role) -> Issued {
        let id = format!("spiffe://{}{}", self.trust_domain, path);
        self.issue_with(vec![id], role, &rcgen::PKCS_ECDSA_P256_SHA256)
    }

    /// Leaf carrying an arbitrary set of URI SANs.
    pub fn issue_with(&self, uris: Vec<String>, role: Role, alg: &'static SignatureAlgorithm) -> Issued {
        let key = KeyPair::generate_for(alg).unwrap();
        let mut params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        params
            .distinguished_name
            .push(DnType::CommonName, "oneedge test leaf");
        for uri in &uris {
            params
                .subject_alt_names
                .push(SanType::URI(uri.clone().try_into().unwrap()));
        }
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![match role {
            Role::Client => ExtendedKeyUsagePurpose::ClientAuth,
            Role::Server => ExtendedKeyUsagePurpose::ServerAuth,
        }];
        params.not_after = rcgen::date_time_ymd(2099, 1, 1);
        let cert = params.signed_by(&key, &self.cert, &self.key).unwrap();
        Issued {
            cert,
            key,
            spiffe_id: uris.into_iter().find(|u| u.starts_with("spiffe://")),
        }
    }

    pub fn bundle(&self) -> TrustBundle {
        let mut bundle = TrustBundle::new();
        bundle.insert(TrustDomain::new(&self.trust_domain).unwrap(), vec![self.der()]);
        bundle
    }

    /// Client credential for `path`, trusting this CA.
    pub fn credential(&self, path: &str) -> Credential {
        self.issue(path, Role::Client).credential(self.bundle())
    }
}

impl Issued {
    pub fn der(&self) -> CertificateDer<'static> {
        self.cert.der().clone()
    }

    pub fn key_der(&self) -> Vec<u8> {
        self.key.serialize_der()
    }

    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der()))
    }

    pub fn credential(&self, bundle: TrustBundle) -> Credential {
        Credential::new(vec![self.der()], self.key_der(), bundle).unwrap()
    }

    /// Writes the helper layout (`svid.pem`, `svid_key.pem`, `svid_bundle.pem`).
    pub fn write_pem_dir(&self, ca: &TestCa, dir: &Path) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join("svid.pem"), self.cert.pem()).unwrap();
        std::fs::write(dir.join("svid_key.pem"), self.key.serialize_pem()).unwrap();
        std::fs::write(dir.join("svid_bundle.pem"), ca.cert.pem()).unwrap();
    }
}
