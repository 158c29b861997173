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

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Lifecycle of the broker connection as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Writes a connection's state into the manager-wide channel.
///
/// Each installed connection gets the epoch current at install time. Once a
/// newer connection is installed the epoch moves on and writes from the old
/// driver are ignored.
#[derive(Clone)]
pub(crate) struct StateReporter {
    tx: Arc<watch::Sender<ConnectionState>>,
    epoch: Arc<AtomicU64>,
    mine: u64,
}

impl StateReporter {
    pub(crate) fn new(
        tx: Arc<watch::Sender<ConnectionState>>,
        epoch: Arc<AtomicU64>,
        mine: u64,
    ) -> Self {
        Self { tx, epoch, mine }
    }

    /// Returns whether the write was accepted.
    pub(crate) fn set(&self, state: ConnectionState) -> bool {
        let mut accepted = false;
        self.tx.send_if_modified(|current| {
            if self.epoch.load(Ordering::Acquire) != self.mine {
                return false;
            }
            accepted = true;
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        accepted
    }

    pub(crate) fn is_current(&self) -> bool {
        self.epoch.load(Ordering::Acquire) == self.mine
    }
}
