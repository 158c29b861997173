mod common;

use common::certs::{Role, TestCa, BROKER_PATH, TRUST_DOMAIN};
use oneedge_agent::transport::verifier::{
    PeerValidator, RejectionLog, SpiffeServerVerifier, TrustDomainValidator,
};
use rustls::client::danger::ServerCertVerifier;
use rustls::client::WebPkiServerVerifier;
use rustls::RootCertStore;
use rustls_pki_types::{ServerName, UnixTime};
use spiffe::spiffe_id::TrustDomain;
use std::sync::Arc;

struct Harness {
    verifier: SpiffeServerVerifier,
    rejections: Arc<RejectionLog>,
}

fn harness(roots_from: &TestCa, expected_td: &str) -> Harness {
    let mut roots = RootCertStore::empty();
    roots.add(roots_from.der()).unwrap();
    let inner = WebPkiServerVerifier::builder(Arc::new(roots)).build().unwrap();
    let validator: Arc<dyn PeerValidator> =
        Arc::new(TrustDomainValidator::new(TrustDomain::new(expected_td).unwrap()));
    let rejections = Arc::new(RejectionLog::default());
    Harness {
        verifier: SpiffeServerVerifier::new(inner, validator, Arc::clone(&rejections)),
        rejections,
    }
}

fn server_name() -> ServerName<'static> {
    ServerName::try_from("127.0.0.1").unwrap()
}

#[test]
fn test_same_trust_domain_accepted_despite_hostname() {
    let ca = TestCa::new(TRUST_DOMAIN);
    let broker = ca.issue(BROKER_PATH, Role::Server);
    let h = harness(&ca, TRUST_DOMAIN);

    let result =
        h.verifier
            .verify_server_cert(&broker.der(), &[], &server_name(), &[], UnixTime::now());
    assert!(result.is_ok(), "{result:?}");
    assert_eq!(h.rejections.take(), None);
}

#[test]
fn test_foreign_trust_domain_rejected() {
    // Same CA, so the chain verifies; only the SPIFFE ID is wrong.
    let ca = TestCa::new(TRUST_DOMAIN);
    let broker = ca.issue_with(
        vec!["spiffe://evil.example/mqtt-broker".to_string()],
        Role::Server,
        &rcgen::PKCS_ECDSA_P256_SHA256,
    );
    let h = harness(&ca, TRUST_DOMAIN);

    let result =
        h.verifier
            .verify_server_cert(&broker.der(), &[], &server_name(), &[], UnixTime::now());
    assert!(result.is_err());
    let reason = h.rejections.take().unwrap();
    assert!(reason.contains("evil.example"), "{reason}");
    assert!(reason.contains(TRUST_DOMAIN), "{reason}");
}

#[test]
fn test_unknown_authority_rejected() {
    let trusted = TestCa::new(TRUST_DOMAIN);
    let rogue = TestCa::new(TRUST_DOMAIN);
    let broker = rogue.issue(BROKER_PATH, Role::Server);
    let h = harness(&trusted, TRUST_DOMAIN);

    let result =
        h.verifier
            .verify_server_cert(&broker.der(), &[], &server_name(), &[], UnixTime::now());
    assert!(result.is_err());
    let reason = h.rejections.take().unwrap();
    assert!(reason.contains("chain rejected"), "{reason}");
}

#[test]
fn test_peer_without_spiffe_id_rejected() {
    let ca = TestCa::new(TRUST_DOMAIN);
    let broker = ca.issue_with(vec![], Role::Server, &rcgen::PKCS_ECDSA_P256_SHA256);
    let h = harness(&ca, TRUST_DOMAIN);

    let result =
        h.verifier
            .verify_server_cert(&broker.der(), &[], &server_name(), &[], UnixTime::now());
    assert!(result.is_err());
    assert!(h.rejections.take().unwrap().contains("spiffe"));
}

#[test]
fn test_validator_returns_peer_id() {
    let ca = TestCa::new(TRUST_DOMAIN);
    let broker = ca.issue(BROKER_PATH, Role::Server);
    let validator = TrustDomainValidator::new(TrustDomain::new(TRUST_DOMAIN).unwrap());

    let id = validator.validate(&broker.der()).unwrap();
    assert_eq!(id.to_string(), "spiffe://oneedge.local/mqtt-broker");
    assert_eq!(id.path(), BROKER_PATH);
}

#[test]
fn test_client_config_built_from_credential() {
    let ca = TestCa::new(TRUST_DOMAIN);
    let cred = ca.credential("/device/dev/agent");
    let validator: Arc<dyn PeerValidator> =
        Arc::new(TrustDomainValidator::new(cred.trust_domain().clone()));

    let config = oneedge_agent::transport::tls::build_client_config(
        &cred,
        validator,
        Arc::new(RejectionLog::default()),
    );
    assert!(config.is_ok());
}
