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

//! Identity manager: caches the current credential and tracks the authority.
//!
//! State machine: `uninitialized -> ready -> watching -> closed`. `fetch` is the
//! bounded startup call, `watch` spawns the background subscription feeding
//! `PendingRotation`, `refresh` forces a re-fetch on demand.

use crate::common::credential::Credential;
use crate::common::errors::IdentityError;
use crate::identity::pending::PendingRotation;
use crate::identity::source::IdentitySource;
use chrono::Utc;
use futures::StreamExt;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityState {
    Uninitialized,
    Ready,
    Watching,
    Closed,
}

impl IdentityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityState::Uninitialized => "uninitialized",
            IdentityState::Ready => "ready",
            IdentityState::Watching => "watching",
            IdentityState::Closed => "closed",
        }
    }
}

impl fmt::Display for IdentityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a manual refresh.
#[derive(Debug, Clone)]
pub enum RefreshOutcome {
    /// A different credential was fetched, cached and offered for rotation.
    Updated(Arc<Credential>),
    /// The authority returned the credential already cached.
    Unchanged,
    /// Another refresh was in flight; the authority was not contacted.
    Coalesced,
}

/// Running watch task.
pub struct WatchHandle {
    pending: Arc<PendingRotation>,
    task: JoinHandle<()>,
}

impl WatchHandle {
    pub fn pending(&self) -> &Arc<PendingRotation> {
        &self.pending
    }

    /// Waits for the task to finish. Cancel its token first.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!(error = %e, "watch task ended abnormally");
        }
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

pub struct IdentityManager {
    source: Arc<dyn IdentitySource>,
    state: Mutex<IdentityState>,
    current: Mutex<Option<Arc<Credential>>>,
    pending: Arc<PendingRotation>,
    refreshing: AtomicBool,
    retry_interval: Duration,
    span: Span,
}

struct RefreshGuard<'a>(&'a AtomicBool);

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl IdentityManager {
    pub fn new(source: Arc<dyn IdentitySource>, retry_interval: Duration, parent: &Span) -> Self {
        Self {
            source,
            state: Mutex::new(IdentityState::Uninitialized),
            current: Mutex::new(None),
            pending: Arc::new(PendingRotation::new()),
            refreshing: AtomicBool::new(false),
            retry_interval,
            span: info_span!(parent: parent, "identity"),
        }
    }

    fn state_guard(&self) -> MutexGuard<'_, IdentityState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> IdentityState {
        *self.state_guard()
    }

    /// The cached credential, if any.
    pub fn current(&self) -> Option<Arc<Credential>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn pending(&self) -> &Arc<PendingRotation> {
        &self.pending
    }

    fn require(
        &self,
        allowed: &[IdentityState],
        operation: &'static str,
    ) -> Result<IdentityState, IdentityError> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(state)
        } else {
            Err(IdentityError::InvalidState {
                state: state.as_str(),
                operation,
            })
        }
    }

    /// Fetches the first credential within `deadline`.
    pub async fn fetch(&self, deadline: Duration) -> Result<Arc<Credential>, IdentityError> {
        self.require(&[IdentityState::Uninitialized, IdentityState::Ready], "fetch")?;

        let fetched = tokio::time::timeout(deadline, self.source.fetch())
            .instrument(self.span.clone())
            .await
            .map_err(|_| IdentityError::Timeout(deadline))??;

        let cred = self
            .accept(fetched)
            .or_else(|| self.current())
            .ok_or_else(|| IdentityError::CredentialInvalid("no credential cached".into()))?;

        let mut state = self.state_guard();
        if *state == IdentityState::Uninitialized {
            *state = IdentityState::Ready;
        }
        Ok(cred)
    }

    /// Starts the background watch task.
    pub fn watch(self: &Arc<Self>, cancel: CancellationToken) -> Result<WatchHandle, IdentityError> {
        {
            let mut state = self.state_guard();
            match *state {
                IdentityState::Ready => *state = IdentityState::Watching,
                IdentityState::Watching => return Err(IdentityError::AlreadyWatching),
                other => {
                    return Err(IdentityError::InvalidState {
                        state: other.as_str(),
                        operation: "watch",
                    })
                }
            }
        }

        let this = Arc::clone(self);
        let span = self.span.clone();
        let task = tokio::spawn(async move { this.watch_loop(cancel).await }.instrument(span));
        Ok(WatchHandle {
            pending: Arc::clone(&self.pending),
            task,
        })
    }

    async fn watch_loop(&self, cancel: CancellationToken) {
        info!("watching identity authority");
        loop {
            let subscribed = tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.source.watch() => r,
            };

            match subscribed {
                Ok(mut stream) => loop {
                    let item = tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!("watch loop cancelled");
                            return;
                        }
                        item = stream.next() => item,
                    };
                    match item {
                        Some(Ok(cred)) => self.deliver(cred),
                        Some(Err(IdentityError::CredentialInvalid(reason))) => {
                            warn!(%reason, "dropping invalid credential, keeping previous");
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "watch stream failed");
                            break;
                        }
                        None => {
                            info!("watch stream ended");
                            break;
                        }
                    }
                },
                Err(e) => warn!(error = %e, "watch subscribe failed"),
            }

            debug!(retry_in = ?self.retry_interval, "re-subscribing to identity authority");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.retry_interval) => {}
            }
        }
        debug!("watch loop cancelled");
    }

    fn deliver(&self, cred: Credential) {
        if let Some(cred) = self.accept(cred) {
            if self.pending.offer(cred) {
                debug!("superseded a credential that was not applied yet");
            }
        }
    }

    /// Caches `cred` unless its leaf matches the cached one.
    fn accept(&self, cred: Credential) -> Option<Arc<Credential>> {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if current.as_ref().is_some_and(|c| c.same_leaf(&cred)) {
            debug!(fingerprint = cred.fingerprint(), "credential unchanged");
            return None;
        }

        let now = Utc::now();
        let ttl = cred.remaining_ttl(now);
        if cred.is_expired(now) {
            warn!(spiffe_id = %cred.spiffe_id(), not_after = %cred.not_after(), "received an expired credential");
        }
        info!(
            parent: &self.span,
            spiffe_id = %cred.spiffe_id(),
            not_after = %cred.not_after().to_rfc3339(),
            ttl_secs = ttl.as_secs(),
            fingerprint = cred.fingerprint(),
            "identity updated"
        );

        let cred = Arc::new(cred);
        *current = Some(Arc::clone(&cred));
        Some(cred)
    }

    /// Forces a re-fetch; concurrent calls coalesce.
    pub async fn refresh(&self, deadline: Duration) -> Result<RefreshOutcome, IdentityError> {
        self.require(&[IdentityState::Ready, IdentityState::Watching], "refresh")?;

        if self.refreshing.swap(true, Ordering::AcqRel) {
            debug!(parent: &self.span, "refresh already in flight");
            return Ok(RefreshOutcome::Coalesced);
        }
        let _guard = RefreshGuard(&self.refreshing);

        info!(parent: &self.span, "manual refresh requested");
        let fetched = tokio::time::timeout(deadline, self.source.fetch())
            .instrument(self.span.clone())
            .await
            .map_err(|_| IdentityError::RefreshTimeout(deadline))??;

        match self.accept(fetched) {
            Some(cred) => {
                self.pending.offer(Arc::clone(&cred));
                Ok(RefreshOutcome::Updated(cred))
            }
            None => Ok(RefreshOutcome::Unchanged),
        }
    }

    /// Releases the source and closes the rotation slot. Idempotent.
    pub async fn close(&self) {
        {
            let mut state = self.state_guard();
            if *state == IdentityState::Closed {
                return;
            }
            *state = IdentityState::Closed;
        }
        self.pending.close();
        self.source.close().await;
        info!(parent: &self.span, "identity manager closed");
    }
}
