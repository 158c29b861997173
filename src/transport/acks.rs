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

//! Correlates QoS 1 publishes with their PUBACKs.
//!
//! A waiter is queued when the publish request is handed to the MQTT client.
//! The event loop reports `Outgoing::Publish(pkid)` in request order, which
//! moves the oldest queued waiter under that packet id; `PubAck(pkid)`
//! resolves it. Dropped waiters surface as a closed connection.

use crate::common::errors::TransportError;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};

#[derive(Default)]
struct Inner {
    queued: VecDeque<oneshot::Sender<()>>,
    inflight: HashMap<u16, oneshot::Sender<()>>,
    closed: bool,
}

impl Inner {
    fn outstanding(&self) -> usize {
        self.queued.len() + self.inflight.len()
    }
}

#[derive(Default)]
pub struct AckTracker {
    inner: Mutex<Inner>,
    drained: Notify,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queues a waiter and runs `send` while holding the tracker lock, so the
    /// waiter order matches the request order. `send` must not block.
    pub fn register<F>(&self, send: F) -> Result<oneshot::Receiver<()>, TransportError>
    where
        F: FnOnce() -> Result<(), TransportError>,
    {
        let mut inner = self.lock();
        if inner.closed {
            return Err(TransportError::ConnectionClosed);
        }
        let (tx, rx) = oneshot::channel();
        inner.queued.push_back(tx);
        if let Err(e) = send() {
            inner.queued.pop_back();
            return Err(e);
        }
        Ok(rx)
    }

    pub fn on_outgoing_publish(&self, pkid: u16) {
        let mut inner = self.lock();
        if let Some(tx) = inner.queued.pop_front() {
            inner.inflight.insert(pkid, tx);
        }
    }

    pub fn on_puback(&self, pkid: u16) {
        let drained = {
            let mut inner = self.lock();
            if let Some(tx) = inner.inflight.remove(&pkid) {
                let _ = tx.send(());
            }
            inner.outstanding() == 0
        };
        if drained {
            self.drained.notify_waiters();
        }
    }

    pub fn outstanding(&self) -> usize {
        self.lock().outstanding()
    }

    /// Fails every outstanding waiter; the tracker stays usable.
    pub fn fail_all(&self) {
        {
            let mut inner = self.lock();
            inner.queued.clear();
            inner.inflight.clear();
        }
        self.drained.notify_waiters();
    }

    /// Fails every outstanding waiter and refuses new ones.
    pub fn close(&self) {
        self.lock().closed = true;
        self.fail_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Waits up to `grace` for all outstanding publishes to be acknowledged.
    pub async fn wait_drained(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.outstanding() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.outstanding() == 0;
            }
        }
    }
}
