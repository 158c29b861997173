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

//! Transport manager: owns at most one broker connection at a time.
//!
//! `(credential, connection)` live behind a single async mutex. Rotation holds
//! it across the whole swap; publish only copies the connection handle out of
//! it and waits for the acknowledgment without the lock.

use crate::common::credential::Credential;
use crate::common::errors::TransportError;
use crate::transport::connection::{Connection, ConnectionParams};
use crate::transport::settings::TransportSettings;
use crate::transport::state::{ConnectionState, StateReporter};
use crate::transport::tls::build_client_config;
use crate::transport::verifier::{PeerValidator, RejectionLog, TrustDomainValidator};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Span};

/// Produces the peer validator for a credential.
pub type ValidatorFactory = Arc<dyn Fn(&Credential) -> Arc<dyn PeerValidator> + Send + Sync>;

#[derive(Default)]
struct Slot {
    credential: Option<Arc<Credential>>,
    connection: Option<Arc<Connection>>,
    closed: bool,
}

pub struct TransportManager {
    settings: TransportSettings,
    slot: Mutex<Slot>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    epoch: Arc<AtomicU64>,
    validator_factory: ValidatorFactory,
    span: Span,
}

impl TransportManager {
    pub fn new(settings: TransportSettings, parent: &Span) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            span: info_span!(parent: parent, "transport", broker = %settings.broker),
            settings,
            slot: Mutex::new(Slot::default()),
            state_tx: Arc::new(state_tx),
            epoch: Arc::new(AtomicU64::new(0)),
            validator_factory: Arc::new(|cred: &Credential| {
                Arc::new(TrustDomainValidator::new(cred.trust_domain().clone()))
                    as Arc<dyn PeerValidator>
            }),
        }
    }

    /// Replaces the peer check applied to connections built from now on.
    pub fn with_validator(mut self, factory: ValidatorFactory) -> Self {
        self.validator_factory = factory;
        self
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Credential of the installed connection.
    pub async fn credential(&self) -> Option<Arc<Credential>> {
        self.slot.lock().await.credential.clone()
    }

    /// Installs a connection built from `cred`, replacing the current one.
    ///
    /// Errors from the first connect attempt are returned, but the new
    /// connection keeps retrying in the background.
    pub async fn apply_credential(&self, cred: Arc<Credential>) -> Result<(), TransportError> {
        let rejections = Arc::new(RejectionLog::default());
        let validator = (self.validator_factory)(&cred);
        let tls = build_client_config(&cred, validator, Arc::clone(&rejections)).map_err(|e| {
            error!(parent: &self.span, spiffe_id = %cred.spiffe_id(), error = %e, "rejected credential, keeping current connection");
            e
        })?;

        let mut slot = self.slot.lock().await;
        if slot.closed {
            return Err(TransportError::ConnectionClosed);
        }

        if let Some(old) = slot.connection.take() {
            info!(parent: &self.span, connection = old.id(), "closing previous connection");
            old.close().await;
        }

        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let reporter = StateReporter::new(Arc::clone(&self.state_tx), Arc::clone(&self.epoch), epoch);
        let (conn, first_attempt) = Connection::spawn(ConnectionParams {
            id: epoch,
            client_id: cred.client_id(),
            settings: self.settings.clone(),
            tls,
            rejections,
            reporter,
            parent: self.span.clone(),
        });
        slot.connection = Some(Arc::new(conn));
        slot.credential = Some(Arc::clone(&cred));

        let result = first_attempt
            .await
            .unwrap_or(Err(TransportError::ConnectionClosed));
        match &result {
            Ok(()) => info!(
                parent: &self.span,
                connection = epoch,
                spiffe_id = %cred.spiffe_id(),
                not_after = %cred.not_after().to_rfc3339(),
                "rotation applied"
            ),
            Err(e @ TransportError::PeerVerificationFailed(_)) => error!(
                parent: &self.span,
                connection = epoch,
                error = %e,
                "broker failed peer verification, retrying in background"
            ),
            Err(e) => warn!(
                parent: &self.span,
                connection = epoch,
                error = %e,
                "initial connect failed, retrying in background"
            ),
        }
        result
    }

    /// Publishes `payload` with QoS 1 and waits for the PUBACK.
    pub async fn publish(
        &self,
        deadline: Duration,
        cancel: &CancellationToken,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        let attempt = async {
            let conn = self
                .slot
                .lock()
                .await
                .connection
                .clone()
                .ok_or(TransportError::NotConnected)?;
            let ack = conn.publish(payload)?;
            ack.await.map_err(|_| TransportError::ConnectionClosed)
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            r = tokio::time::timeout(deadline, attempt) => {
                r.unwrap_or(Err(TransportError::Timeout(deadline)))
            }
        }
    }

    /// Closes the connection and refuses further rotations. Idempotent.
    pub async fn close(&self) {
        let mut slot = self.slot.lock().await;
        if slot.closed {
            return;
        }
        slot.closed = true;
        if let Some(conn) = slot.connection.take() {
            conn.close().await;
        }
        slot.credential = None;
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.state_tx.send_replace(ConnectionState::Disconnected);
        info!(parent: &self.span, "transport closed");
    }
}
