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

//! Domain error types.
//!
//! One enum per component. Variants mirror the failure policy table: which
//! ones are fatal, which ones feed a retry loop, which ones are handed back
//! to the caller and logged.

use std::time::Duration;
use thiserror::Error;

/// Errors raised by the identity side (authority client, credential parsing).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// The identity authority could not be reached or refused the request.
    #[error("identity source unavailable: {0}")]
    SourceUnavailable(String),

    /// The initial fetch did not complete within its deadline.
    #[error("no credential received within {0:?}")]
    Timeout(Duration),

    /// A manual refresh did not complete within its deadline.
    #[error("manual refresh timed out after {0:?}")]
    RefreshTimeout(Duration),

    /// A snapshot was malformed or incomplete.
    #[error("credential invalid: {0}")]
    CredentialInvalid(String),

    /// The operation is not valid in the manager's current state.
    #[error("identity manager is {state}, cannot {operation}")]
    InvalidState {
        state: &'static str,
        operation: &'static str,
    },

    /// The watch loop was already started.
    #[error("watch already started")]
    AlreadyWatching,
}

/// Errors raised by the transport side (TLS material, MQTT session, publish).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No connection exists, or it is not currently connected.
    #[error("mqtt client not connected")]
    NotConnected,

    /// No acknowledgment arrived before the deadline.
    #[error("no acknowledgment within {0:?}")]
    Timeout(Duration),

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// The connection the publish started on was torn down first.
    #[error("connection closed before acknowledgment")]
    ConnectionClosed,

    /// TCP, TLS or MQTT level connect failure.
    #[error("connect mqtt broker: {0}")]
    ConnectFailed(String),

    /// A single connect attempt exceeded its bound.
    #[error("timeout connecting to mqtt broker after {0:?}")]
    ConnectTimeout(Duration),

    /// The broker presented an identity outside the expected trust domain.
    #[error("peer verification failed: {0}")]
    PeerVerificationFailed(String),

    /// TLS configuration could not be built from the credential.
    #[error("TLS configuration error: {0}")]
    Tls(String),

    /// Broker address could not be parsed.
    #[error("invalid broker address: {0}")]
    InvalidBroker(String),
}

impl TransportError {
    /// Whether the error came from a connect attempt (and is handled by the reconnect loop).
    pub fn is_connect_error(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectFailed(_)
                | TransportError::ConnectTimeout(_)
                | TransportError::PeerVerificationFailed(_)
        )
    }
}

/// Errors that end the agent process.
#[derive(Error, Debug)]
pub enum AgentError {
    /// No credential could be obtained at startup.
    #[error("startup failed: {0}")]
    Startup(#[source] IdentityError),

    /// Transport settings were unusable.
    #[error("transport setup failed: {0}")]
    Transport(#[from] TransportError),

    /// State directory or PID file problem.
    #[error("state directory error: {0}")]
    StateDir(#[from] StateDirError),

    /// The configuration asks for something this build cannot do.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Errors around the per-user state directory.
#[derive(Error, Debug)]
pub enum StateDirError {
    /// The home directory could not be determined.
    #[error("cannot determine home directory")]
    NoHome,

    /// Another agent holds the PID file lock.
    #[error("another agent is running (pid file {0} is locked)")]
    AlreadyRunning(String),

    /// The PID file does not contain a process id.
    #[error("invalid PID in {path}: {content:?}")]
    InvalidPid { path: String, content: String },

    /// I/O Error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
