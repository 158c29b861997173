// Copyright 2026 BadCompany
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

//! X.509 SVID credential model.
//!
//! A `Credential` is validated once at construction and immutable afterwards.
//! Everything the transport needs (chain, key, roots, trust domain, client id)
//! is read from it without further parsing.

use crate::common::constants::{mqtt::MAX_CLIENT_ID_LEN, spiffe::SCHEME_PREFIX};
use crate::common::errors::IdentityError;
use chrono::{DateTime, Utc};
use ring::rand::SystemRandom;
use ring::signature::{self, EcdsaKeyPair, Ed25519KeyPair, KeyPair, RsaKeyPair};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use sha2::{Digest, Sha256};
use spiffe::spiffe_id::{SpiffeId, TrustDomain};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::{FromDer, X509Certificate};
use zeroize::Zeroizing;

const PEM_CERTIFICATE: &str = "CERTIFICATE";
const PEM_PKCS8_KEY: &str = "PRIVATE KEY";

/// Root authorities keyed by trust domain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustBundle {
    authorities: BTreeMap<TrustDomain, Vec<CertificateDer<'static>>>,
}

impl TrustBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds authorities for a trust domain, appending to any already present.
    pub fn insert(&mut self, td: TrustDomain, certs: Vec<CertificateDer<'static>>) {
        if certs.is_empty() {
            return;
        }
        self.authorities.entry(td).or_default().extend(certs);
    }

    pub fn get(&self, td: &TrustDomain) -> Option<&[CertificateDer<'static>]> {
        self.authorities.get(td).map(Vec::as_slice)
    }

    pub fn trust_domains(&self) -> impl Iterator<Item = &TrustDomain> {
        self.authorities.keys()
    }

    /// Every authority across all trust domains.
    pub fn authorities(&self) -> impl Iterator<Item = &CertificateDer<'static>> {
        self.authorities.values().flatten()
    }

    pub fn authority_count(&self) -> usize {
        self.authorities.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.authority_count() == 0
    }
}

/// A validated X.509 SVID with its key and trust bundle.
#[derive(Clone)]
pub struct Credential {
    spiffe_id: SpiffeId,
    chain: Vec<CertificateDer<'static>>,
    key: Zeroizing<Vec<u8>>,
    bundle: TrustBundle,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    fingerprint: String,
}

impl Credential {
    /// Builds a credential from a DER chain (leaf first), a PKCS#8 key and a bundle.
    pub fn new(
        chain: Vec<CertificateDer<'static>>,
        pkcs8_key: Vec<u8>,
        bundle: TrustBundle,
    ) -> Result<Self, IdentityError> {
        let key = Zeroizing::new(pkcs8_key);
        let leaf_der = chain
            .first()
            .ok_or_else(|| invalid("certificate chain is empty"))?;

        for (idx, der) in chain.iter().enumerate() {
            X509Certificate::from_der(der.as_ref())
                .map_err(|e| invalid(format!("chain element {idx} is not X.509: {e}")))?;
        }

        let (_, leaf) = X509Certificate::from_der(leaf_der.as_ref())
            .map_err(|e| invalid(format!("leaf is not X.509: {e}")))?;
        let spiffe_id = spiffe_id_from_cert(&leaf).map_err(invalid)?;

        let not_before = asn1_to_utc(leaf.validity().not_before.timestamp())?;
        let not_after = asn1_to_utc(leaf.validity().not_after.timestamp())?;

        let spki = leaf.public_key();
        let leaf_public = &*spki.subject_public_key.data;
        let key_public = derive_public_key(&key)?;
        if key_public.as_slice() != leaf_public {
            return Err(invalid("private key does not match leaf certificate"));
        }

        if bundle.is_empty() {
            return Err(invalid("trust bundle holds no authorities"));
        }

        let fingerprint = hex::encode(Sha256::digest(leaf_der.as_ref()));

        Ok(Self {
            spiffe_id,
            chain,
            key,
            bundle,
            not_before,
            not_after,
            fingerprint,
        })
    }

    /// Builds a credential from the PEM files a SPIFFE helper writes.
    ///
    /// The bundle file holds the roots of the credential's own trust domain.
    pub fn from_pem(
        svid_pem: &[u8],
        key_pem: &[u8],
        bundle_pem: &[u8],
    ) -> Result<Self, IdentityError> {
        let chain = parse_pem_certificates(svid_pem, "svid")?;
        let key = parse_pem_key(key_pem)?;
        let roots = parse_pem_certificates(bundle_pem, "bundle")?;

        let leaf = chain
            .first()
            .ok_or_else(|| invalid("svid file holds no certificate"))?;
        let td = leaf_spiffe_id(leaf.as_ref())
            .map_err(invalid)?
            .trust_domain()
            .clone();

        let mut bundle = TrustBundle::new();
        bundle.insert(td, roots);
        Self::new(chain, key, bundle)
    }

    pub fn spiffe_id(&self) -> &SpiffeId {
        &self.spiffe_id
    }

    pub fn trust_domain(&self) -> &TrustDomain {
        self.spiffe_id.trust_domain()
    }

    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    pub fn leaf(&self) -> &CertificateDer<'static> {
        // Non-empty by construction.
        &self.chain[0]
    }

    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key.to_vec()))
    }

    pub fn bundle(&self) -> &TrustBundle {
        &self.bundle
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// Hex SHA-256 of the leaf DER.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Time left until `not_after`, zero once expired.
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Duration {
        (self.not_after - now).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.not_after
    }

    /// Same leaf certificate.
    pub fn same_leaf(&self, other: &Credential) -> bool {
        self.fingerprint == other.fingerprint
    }

    /// MQTT client identifier derived from the SPIFFE ID.
    pub fn client_id(&self) -> String {
        client_id_for(&self.spiffe_id.to_string())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("spiffe_id", &self.spiffe_id.to_string())
            .field("chain_len", &self.chain.len())
            .field("not_after", &self.not_after)
            .field("fingerprint", &self.fingerprint)
            .field("trust_domains", &self.bundle.authorities.len())
            .finish_non_exhaustive()
    }
}

/// Maps a SPIFFE ID to a broker-safe client identifier.
pub fn client_id_for(spiffe_id: &str) -> String {
    spiffe_id
        .strip_prefix(SCHEME_PREFIX)
        .unwrap_or(spiffe_id)
        .chars()
        .map(|c| if c == '/' || c == ':' { '-' } else { c })
        .take(MAX_CLIENT_ID_LEN)
        .collect()
}

/// Extracts the single SPIFFE ID carried by a DER certificate.
pub fn leaf_spiffe_id(der: &[u8]) -> Result<SpiffeId, String> {
    let (_, cert) =
        X509Certificate::from_der(der).map_err(|e| format!("certificate is not X.509: {e}"))?;
    spiffe_id_from_cert(&cert)
}

fn spiffe_id_from_cert(cert: &X509Certificate<'_>) -> Result<SpiffeId, String> {
    let san = cert
        .subject_alternative_name()
        .map_err(|e| format!("malformed subjectAltName: {e}"))?
        .ok_or_else(|| "certificate has no subjectAltName".to_string())?;

    let mut uris = san.value.general_names.iter().filter_map(|name| match name {
        GeneralName::URI(uri) if uri.starts_with(SCHEME_PREFIX) => Some(*uri),
        _ => None,
    });

    let first = uris
        .next()
        .ok_or_else(|| "certificate has no spiffe URI SAN".to_string())?;
    if uris.next().is_some() {
        return Err("certificate has more than one spiffe URI SAN".to_string());
    }
    SpiffeId::new(first).map_err(|e| format!("invalid SPIFFE ID {first:?}: {e}"))
}

/// Public half of a PKCS#8 key in the encoding used by the SPKI bit string.
fn derive_public_key(pkcs8: &[u8]) -> Result<Vec<u8>, IdentityError> {
    let rng = SystemRandom::new();
    if let Ok(kp) =
        EcdsaKeyPair::from_pkcs8(&signature::ECDSA_P256_SHA256_ASN1_SIGNING, pkcs8, &rng)
    {
        return Ok(kp.public_key().as_ref().to_vec());
    }
    if let Ok(kp) =
        EcdsaKeyPair::from_pkcs8(&signature::ECDSA_P384_SHA384_ASN1_SIGNING, pkcs8, &rng)
    {
        return Ok(kp.public_key().as_ref().to_vec());
    }
    if let Ok(kp) = Ed25519KeyPair::from_pkcs8_maybe_unchecked(pkcs8) {
        return Ok(kp.public_key().as_ref().to_vec());
    }
    if let Ok(kp) = RsaKeyPair::from_pkcs8(pkcs8) {
        return Ok(kp.public_key().as_ref().to_vec());
    }
    Err(invalid("unsupported or malformed PKCS#8 private key"))
}

fn parse_pem_certificates(
    data: &[u8],
    what: &str,
) -> Result<Vec<CertificateDer<'static>>, IdentityError> {
    let blocks =
        pem::parse_many(data).map_err(|e| invalid(format!("{what} PEM unreadable: {e}")))?;
    let certs: Vec<_> = blocks
        .into_iter()
        .filter(|p| p.tag() == PEM_CERTIFICATE)
        .map(|p| CertificateDer::from(p.into_contents()))
        .collect();
    if certs.is_empty() {
        return Err(invalid(format!("{what} PEM holds no certificate")));
    }
    Ok(certs)
}

fn parse_pem_key(data: &[u8]) -> Result<Vec<u8>, IdentityError> {
    let blocks = pem::parse_many(data).map_err(|e| invalid(format!("key PEM unreadable: {e}")))?;
    blocks
        .into_iter()
        .find(|p| p.tag() == PEM_PKCS8_KEY)
        .map(|p| p.into_contents())
        .ok_or_else(|| invalid("key PEM holds no PKCS#8 private key"))
}

fn asn1_to_utc(ts: i64) -> Result<DateTime<Utc>, IdentityError> {
    DateTime::from_timestamp(ts, 0).ok_or_else(|| invalid("validity timestamp out of range"))
}

fn invalid(msg: impl Into<String>) -> IdentityError {
    IdentityError::CredentialInvalid(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_sanitized() {
        assert_eq!(
            client_id_for("spiffe://oneedge.local/device/abc:1"),
            "oneedge.local-device-abc-1"
        );
    }

    #[test]
    fn test_client_id_truncated() {
        let long = format!("spiffe://td/{}", "a".repeat(300));
        assert_eq!(client_id_for(&long).chars().count(), MAX_CLIENT_ID_LEN);
    }

    #[test]
    fn test_empty_chain_rejected() {
        let mut bundle = TrustBundle::new();
        bundle.insert(
            TrustDomain::new("td").unwrap(),
            vec![CertificateDer::from(vec![0x30, 0x00])],
        );
        let err = Credential::new(vec![], vec![], bundle).unwrap_err();
        assert!(matches!(err, IdentityError::CredentialInvalid(m) if m.contains("empty")));
    }

    #[test]
    fn test_garbage_chain_rejected() {
        let err = Credential::new(
            vec![CertificateDer::from(vec![1, 2, 3])],
            vec![],
            TrustBundle::new(),
        )
        .unwrap_err();
        assert!(matches!(err, IdentityError::CredentialInvalid(_)));
    }

    #[test]
    fn test_bundle_ignores_empty_insert() {
        let mut bundle = TrustBundle::new();
        bundle.insert(TrustDomain::new("td").unwrap(), vec![]);
        assert!(bundle.is_empty());
        assert_eq!(bundle.trust_domains().count(), 0);
    }

    #[test]
    fn test_pem_without_certificate_rejected() {
        let err = Credential::from_pem(b"", b"", b"").unwrap_err();
        assert!(matches!(err, IdentityError::CredentialInvalid(_)));
    }
}
