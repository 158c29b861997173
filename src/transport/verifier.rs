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

//! Broker certificate verification by trust domain.
//!
//! The broker's chain is verified against the credential's bundle roots as
//! usual, but the hostname check is replaced: the peer leaf must carry a SPIFFE
//! ID inside the expected trust domain. Which check applies is decided by an
//! injected `PeerValidator`.

use crate::common::credential::leaf_spiffe_id;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::{CertificateError, DigitallySignedStruct, Error as TlsError, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use spiffe::spiffe_id::{SpiffeId, TrustDomain};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, error};

/// Decides whether a verified peer leaf is acceptable.
pub trait PeerValidator: Send + Sync + fmt::Debug {
    fn validate(&self, peer_leaf: &CertificateDer<'_>) -> Result<SpiffeId, String>;
}

/// Accepts peers whose SPIFFE ID belongs to one trust domain.
#[derive(Debug, Clone)]
pub struct TrustDomainValidator {
    trust_domain: TrustDomain,
}

impl TrustDomainValidator {
    pub fn new(trust_domain: TrustDomain) -> Self {
        Self { trust_domain }
    }
}

impl PeerValidator for TrustDomainValidator {
    fn validate(&self, peer_leaf: &CertificateDer<'_>) -> Result<SpiffeId, String> {
        let id = leaf_spiffe_id(peer_leaf.as_ref())?;
        if id.is_member_of(&self.trust_domain) {
            Ok(id)
        } else {
            Err(format!(
                "peer {id} is not in trust domain {}",
                self.trust_domain
            ))
        }
    }
}

/// Last rejection reason recorded during a handshake.
///
/// rustls only reports a generic certificate error to the MQTT client; the
/// connection driver reads this to classify the failure.
#[derive(Debug, Default)]
pub struct RejectionLog(Mutex<Option<String>>);

impl RejectionLog {
    pub fn record(&self, reason: String) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason);
    }

    pub fn take(&self) -> Option<String> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

#[derive(Debug)]
pub struct SpiffeServerVerifier {
    inner: Arc<WebPkiServerVerifier>,
    validator: Arc<dyn PeerValidator>,
    rejections: Arc<RejectionLog>,
}

impl SpiffeServerVerifier {
    pub fn new(
        inner: Arc<WebPkiServerVerifier>,
        validator: Arc<dyn PeerValidator>,
        rejections: Arc<RejectionLog>,
    ) -> Self {
        Self {
            inner,
            validator,
            rejections,
        }
    }

    fn reject(&self, reason: String) -> TlsError {
        error!(%reason, "broker peer verification failed");
        self.rejections.record(reason.clone());
        TlsError::General(reason)
    }
}

impl ServerCertVerifier for SpiffeServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            // The chain checked out; only the hostname did not match.
            Ok(_) | Err(TlsError::InvalidCertificate(CertificateError::NotValidForName)) => {}
            Err(e) => return Err(self.reject(format!("broker chain rejected: {e}"))),
        }

        match self.validator.validate(end_entity) {
            Ok(peer) => {
                debug!(%peer, "broker identity verified");
                Ok(ServerCertVerified::assertion())
            }
            Err(reason) => Err(self.reject(reason)),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
