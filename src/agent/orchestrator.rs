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

//! The agent run loop.
//!
//! Startup fails fast without a credential. After that nothing is fatal: the
//! transport reconnects on its own, rotations flow in through the pending
//! slot, publishes that fail are logged and retried on the next tick.

use crate::agent::context::AgentContext;
use crate::agent::telemetry::TelemetryPayload;
use crate::agent::trigger::{self, HangupListener, MarkerWatch, TriggerSettings};
use crate::common::errors::{AgentError, TransportError};
use crate::config::{AgentConfig, IdentitySourceKind};
use crate::identity::{IdentityManager, IdentitySource, PemDirSource};
use crate::transport::{BrokerAddress, TransportManager, TransportSettings};
use chrono::Utc;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Builds the identity source selected by the configuration.
pub fn build_source(config: &AgentConfig) -> Result<Arc<dyn IdentitySource>, AgentError> {
    match config.identity_source {
        IdentitySourceKind::PemDir => Ok(Arc::new(PemDirSource::new(
            config.svid_dir.clone(),
            config.timing.svid_poll_interval,
        ))),
        #[cfg(feature = "workload-api")]
        IdentitySourceKind::WorkloadApi => Ok(Arc::new(
            crate::identity::WorkloadApiSource::new(config.socket_path.clone()),
        )),
        #[cfg(not(feature = "workload-api"))]
        IdentitySourceKind::WorkloadApi => Err(AgentError::Config(
            "workload-api identity source requires the `workload-api` feature".to_string(),
        )),
    }
}

/// Transport settings derived from the configuration.
pub fn transport_settings(config: &AgentConfig) -> Result<TransportSettings, AgentError> {
    let broker = BrokerAddress::parse(&config.broker)?;
    let mut settings = TransportSettings::new(broker, config.topic.clone());
    settings.keep_alive = config.timing.keep_alive;
    settings.connect_timeout = config.timing.connect_timeout;
    settings.reconnect_interval = config.timing.reconnect_interval;
    settings.drain_grace = config.timing.drain_grace;
    Ok(settings)
}

pub struct Agent {
    ctx: AgentContext,
    identity: Arc<IdentityManager>,
    transport: Arc<TransportManager>,
    hangup: HangupListener,
}

impl Agent {
    pub fn new(ctx: AgentContext, source: Arc<dyn IdentitySource>) -> Result<Self, AgentError> {
        let settings = transport_settings(&ctx.config)?;
        let transport = TransportManager::new(settings, &ctx.span);
        Ok(Self::with_transport(ctx, source, transport))
    }

    /// Uses a caller-built transport manager (custom peer validation).
    pub fn with_transport(
        ctx: AgentContext,
        source: Arc<dyn IdentitySource>,
        transport: TransportManager,
    ) -> Self {
        let identity = Arc::new(IdentityManager::new(
            source,
            ctx.config.timing.watch_retry_interval,
            &ctx.span,
        ));
        Self {
            ctx,
            identity,
            transport: Arc::new(transport),
            hangup: HangupListener::disabled(),
        }
    }

    /// Rotates on SIGHUP through `hangup`. Without it only the marker file
    /// triggers a manual rotation.
    pub fn with_hangup(mut self, hangup: HangupListener) -> Self {
        self.hangup = hangup;
        self
    }

    pub fn identity(&self) -> &Arc<IdentityManager> {
        &self.identity
    }

    pub fn transport(&self) -> &Arc<TransportManager> {
        &self.transport
    }

    /// Runs until the context's shutdown token fires.
    pub async fn run(self) -> Result<(), AgentError> {
        let span = self.ctx.span.clone();
        self.run_inner().instrument(span).await
    }

    async fn run_inner(mut self) -> Result<(), AgentError> {
        let config = Arc::clone(&self.ctx.config);
        let timing = &config.timing;
        let hangup = std::mem::replace(&mut self.hangup, HangupListener::disabled());

        let fetched = tokio::select! {
            _ = self.ctx.shutdown.cancelled() => None,
            r = self.identity.fetch(timing.startup_timeout) => Some(r),
        };
        let first = match fetched {
            Some(Ok(cred)) => cred,
            Some(Err(e)) => {
                error!(error = %e, "no credential at startup, giving up");
                self.identity.close().await;
                return Err(AgentError::Startup(e));
            }
            None => {
                info!("shutdown requested during startup");
                self.identity.close().await;
                return Ok(());
            }
        };

        // The apply future holds the slot lock, so it is dropped before closing.
        let applied = tokio::select! {
            _ = self.ctx.shutdown.cancelled() => None,
            r = self.transport.apply_credential(first) => Some(r),
        };
        match applied {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                warn!(error = %e, "initial connection failed, reconnecting in background")
            }
            None => {
                info!("shutdown requested during initial connect");
                self.transport.close().await;
                self.identity.close().await;
                return Ok(());
            }
        }

        let tasks = self.ctx.shutdown.child_token();
        let watch = match self.identity.watch(tasks.clone()) {
            Ok(watch) => watch,
            Err(e) => {
                self.transport.close().await;
                self.identity.close().await;
                return Err(AgentError::Startup(e));
            }
        };
        let trigger = trigger::spawn(
            Arc::clone(&self.identity),
            TriggerSettings {
                marker: MarkerWatch::seeded(config.rotate_marker_path()),
                poll_interval: timing.marker_poll_interval,
                refresh_timeout: timing.refresh_timeout,
                hangup,
            },
            tasks.clone(),
            info_span!(parent: &self.ctx.span, "rotation_trigger"),
        );

        info!(broker = %config.broker, topic = %config.topic, "agent running");

        let pending = Arc::clone(watch.pending());
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + timing.publish_interval,
            timing.publish_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.ctx.shutdown.cancelled() => {
                    info!("shutdown requested");
                    break;
                }
                _ = ticker.tick() => self.publish_once().await,
                next = pending.next() => match next {
                    Some(cred) => {
                        match self.transport.apply_credential(cred).await {
                            Ok(()) => {}
                            Err(e) if e.is_connect_error() => {
                                warn!(error = %e, "rotation installed but not connected yet");
                            }
                            Err(e) => warn!(error = %e, "rotation rejected, previous connection kept"),
                        }
                    }
                    None => {
                        warn!("rotation slot closed, stopping");
                        break;
                    }
                },
            }
        }

        tasks.cancel();
        watch.join().await;
        if let Err(e) = trigger.await {
            warn!(error = %e, "rotation trigger ended abnormally");
        }
        self.transport.close().await;
        self.identity.close().await;
        info!("agent stopped");
        Ok(())
    }

    async fn publish_once(&self) {
        let timing = &self.ctx.config.timing;
        let payload = match TelemetryPayload::at(Utc::now()).to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "could not encode telemetry");
                return;
            }
        };
        match self
            .transport
            .publish(timing.publish_timeout, &self.ctx.shutdown, payload)
            .await
        {
            Ok(()) => info!("telemetry sent"),
            Err(TransportError::Cancelled) => debug!("publish cancelled by shutdown"),
            Err(e) => warn!(error = %e, "publish failed"),
        }
    }
}
