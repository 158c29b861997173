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

//! Builds the rustls client configuration for a credential.

use crate::common::credential::Credential;
use crate::common::errors::TransportError;
use crate::transport::verifier::{PeerValidator, RejectionLog, SpiffeServerVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::{ClientConfig, RootCertStore};
use std::sync::Arc;

/// Client config presenting `cred` and verifying the broker with `validator`.
///
/// Built completely before anything touches the live connection, so a failure
/// here leaves the current session alone.
pub fn build_client_config(
    cred: &Credential,
    validator: Arc<dyn PeerValidator>,
    rejections: Arc<RejectionLog>,
) -> Result<Arc<ClientConfig>, TransportError> {
    let mut roots = RootCertStore::empty();
    for authority in cred.bundle().authorities() {
        roots
            .add(authority.clone())
            .map_err(|e| TransportError::Tls(format!("bundle authority rejected: {e}")))?;
    }
    if roots.is_empty() {
        return Err(TransportError::Tls("no usable bundle authorities".into()));
    }

    let webpki = WebPkiServerVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| TransportError::Tls(format!("server verifier: {e}")))?;
    let verifier = SpiffeServerVerifier::new(webpki, validator, rejections);

    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(cred.chain().to_vec(), cred.private_key())
        .map_err(|e| TransportError::Tls(format!("client certificate: {e}")))?;

    Ok(Arc::new(config))
}
