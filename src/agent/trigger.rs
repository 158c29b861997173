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

//! Manual rotation trigger: SIGHUP or a touched marker file.

use crate::agent::state_dir;
use crate::identity::{IdentityManager, RefreshOutcome};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument, Span};

/// Tracks the marker file's modification time.
#[derive(Debug)]
pub struct MarkerWatch {
    path: PathBuf,
    last_seen: Option<SystemTime>,
}

impl MarkerWatch {
    /// Seeds with the current mtime so a marker left from an earlier run
    /// does not fire at startup.
    pub fn seeded(path: PathBuf) -> Self {
        let last_seen = state_dir::modified(&path);
        Self { path, last_seen }
    }

    /// True when the mtime moved since the last call.
    pub fn changed(&mut self) -> bool {
        match state_dir::modified(&self.path) {
            Some(mtime) if self.last_seen != Some(mtime) => {
                self.last_seen = Some(mtime);
                true
            }
            _ => false,
        }
    }
}

pub struct TriggerSettings {
    pub marker: MarkerWatch,
    pub poll_interval: Duration,
    pub refresh_timeout: Duration,
    pub hangup: HangupListener,
}

/// Spawns the trigger task. It stops when `cancel` fires.
pub fn spawn(
    identity: Arc<IdentityManager>,
    settings: TriggerSettings,
    cancel: CancellationToken,
    span: Span,
) -> JoinHandle<()> {
    tokio::spawn(run(identity, settings, cancel).instrument(span))
}

async fn run(identity: Arc<IdentityManager>, settings: TriggerSettings, cancel: CancellationToken) {
    let TriggerSettings {
        mut marker,
        poll_interval,
        refresh_timeout,
        mut hangup,
    } = settings;

    let mut ticker =
        tokio::time::interval_at(tokio::time::Instant::now() + poll_interval, poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = hangup.recv() => {
                info!("received SIGHUP; triggering manual rotate");
                refresh(&identity, refresh_timeout).await;
            }
            _ = ticker.tick() => {
                if marker.changed() {
                    info!("rotate signal file touched; triggering refresh");
                    refresh(&identity, refresh_timeout).await;
                }
            }
        }
    }
    debug!("rotation trigger stopped");
}

async fn refresh(identity: &IdentityManager, deadline: Duration) {
    match identity.refresh(deadline).await {
        Ok(RefreshOutcome::Updated(cred)) => info!(
            spiffe_id = %cred.spiffe_id(),
            not_after = %cred.not_after().to_rfc3339(),
            "manual rotate fetched a new credential"
        ),
        Ok(RefreshOutcome::Unchanged) => info!("manual rotate: credential unchanged"),
        Ok(RefreshOutcome::Coalesced) => debug!("manual rotate already in flight"),
        Err(e) => warn!(error = %e, "manual rotate failed, keeping current credential"),
    }
}

/// SIGHUP stream; never fires when disabled or unsupported.
///
/// Installing it replaces the default action of SIGHUP (terminate) for the
/// whole process. Signals that arrive before the trigger task runs are kept
/// and delivered once it starts.
pub struct HangupListener {
    #[cfg(unix)]
    signal: Option<tokio::signal::unix::Signal>,
}

impl std::fmt::Debug for HangupListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HangupListener")
            .field("installed", &self.is_installed())
            .finish()
    }
}

impl HangupListener {
    /// Registers the SIGHUP handler. Must be called inside the runtime.
    pub fn install() -> Self {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let signal = signal(SignalKind::hangup())
                .map_err(|e| warn!(error = %e, "SIGHUP handler unavailable"))
                .ok();
            Self { signal }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }

    pub fn disabled() -> Self {
        Self {
            #[cfg(unix)]
            signal: None,
        }
    }

    pub fn is_installed(&self) -> bool {
        #[cfg(unix)]
        {
            self.signal.is_some()
        }
        #[cfg(not(unix))]
        {
            false
        }
    }

    async fn recv(&mut self) {
        #[cfg(unix)]
        if let Some(signal) = self.signal.as_mut() {
            if signal.recv().await.is_some() {
                return;
            }
            self.signal = None;
        }
        std::future::pending::<()>().await
    }
}
