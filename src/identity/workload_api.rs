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

//! Identity source talking to the SPIFFE Workload API over its unix socket.

use crate::common::credential::{Credential, TrustBundle};
use crate::common::errors::IdentityError;
use crate::identity::source::{CredentialStream, IdentitySource};
use async_trait::async_trait;
use futures::StreamExt;
use rustls_pki_types::CertificateDer;
use spiffe::workload_api::client::WorkloadApiClient;
use spiffe::workload_api::x509_context::X509Context;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct WorkloadApiSource {
    socket: PathBuf,
    closed: AtomicBool,
}

impl WorkloadApiSource {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            closed: AtomicBool::new(false),
        }
    }

    async fn client(&self) -> Result<WorkloadApiClient, IdentityError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(IdentityError::SourceUnavailable(
                "identity source closed".to_string(),
            ));
        }
        let endpoint = format!("unix:{}", self.socket.display());
        WorkloadApiClient::new_from_path(&endpoint)
            .await
            .map_err(|e| IdentityError::SourceUnavailable(format!("{endpoint}: {e}")))
    }
}

#[async_trait]
impl IdentitySource for WorkloadApiSource {
    async fn fetch(&self) -> Result<Credential, IdentityError> {
        let mut client = self.client().await?;
        let ctx = client
            .fetch_x509_context()
            .await
            .map_err(|e| IdentityError::SourceUnavailable(e.to_string()))?;
        credential_from_context(&ctx)
    }

    async fn watch(&self) -> Result<CredentialStream, IdentityError> {
        let mut client = self.client().await?;
        let stream = client
            .stream_x509_contexts()
            .await
            .map_err(|e| IdentityError::SourceUnavailable(e.to_string()))?;
        Ok(stream
            .map(|item| match item {
                Ok(ctx) => credential_from_context(&ctx),
                Err(e) => Err(IdentityError::SourceUnavailable(e.to_string())),
            })
            .boxed())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

fn credential_from_context(ctx: &X509Context) -> Result<Credential, IdentityError> {
    let svid = ctx
        .default_svid()
        .ok_or_else(|| IdentityError::CredentialInvalid("context holds no SVID".to_string()))?;

    let chain = svid
        .cert_chain()
        .iter()
        .map(|c| CertificateDer::from(c.content().to_vec()))
        .collect();
    let key = svid.private_key().content().to_vec();

    let td = svid.spiffe_id().trust_domain();
    let roots = ctx
        .bundle_set()
        .get_bundle(td)
        .map(|b| {
            b.authorities()
                .iter()
                .map(|c| CertificateDer::from(c.content().to_vec()))
                .collect()
        })
        .unwrap_or_default();

    let mut bundle = TrustBundle::new();
    bundle.insert(td.clone(), roots);
    Credential::new(chain, key, bundle)
}
