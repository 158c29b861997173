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

//! One MQTT-over-TLS connection and the task driving it.
//!
//! The driver owns the rumqttc event loop. Every connect attempt starts a
//! fresh clean session (new client, new event loop), so nothing in flight is
//! carried from one socket to the next. Attempts repeat at a fixed interval
//! until the connection is closed.

use crate::common::constants::timing::DRIVER_JOIN_TIMEOUT;
use crate::common::errors::TransportError;
use crate::transport::acks::AckTracker;
use crate::transport::settings::TransportSettings;
use crate::transport::state::{ConnectionState, StateReporter};
use crate::transport::verifier::RejectionLog;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS, TlsConfiguration, Transport,
};
use rustls::ClientConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

/// Outcome of a connection's first connect attempt.
pub type FirstAttempt = oneshot::Receiver<Result<(), TransportError>>;

pub(crate) struct ConnectionParams {
    pub id: u64,
    pub client_id: String,
    pub settings: TransportSettings,
    pub tls: Arc<ClientConfig>,
    pub rejections: Arc<RejectionLog>,
    pub reporter: StateReporter,
    pub parent: Span,
}

struct Shared {
    client: Mutex<Option<AsyncClient>>,
    acks: AckTracker,
    state: watch::Sender<ConnectionState>,
    reporter: StateReporter,
    closing: AtomicBool,
    topic: String,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
        self.reporter.set(state);
    }

    fn client(&self) -> Option<AsyncClient> {
        self.client.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn install_client(&self, client: Option<AsyncClient>) {
        *self.client.lock().unwrap_or_else(|e| e.into_inner()) = client;
    }

    fn closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }
}

pub struct Connection {
    id: u64,
    client_id: String,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
    drain_grace: std::time::Duration,
    span: Span,
}

impl Connection {
    /// Starts the driver task. The receiver resolves after the first attempt.
    pub(crate) fn spawn(params: ConnectionParams) -> (Self, FirstAttempt) {
        let ConnectionParams {
            id,
            client_id,
            settings,
            tls,
            rejections,
            reporter,
            parent,
        } = params;

        let span = info_span!(parent: &parent, "connection", id, client_id = %client_id, broker = %settings.broker);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(Shared {
            client: Mutex::new(None),
            acks: AckTracker::new(),
            state,
            reporter,
            closing: AtomicBool::new(false),
            topic: settings.topic.clone(),
        });
        let cancel = CancellationToken::new();
        let (first_tx, first_rx) = oneshot::channel();
        let drain_grace = settings.drain_grace;

        let driver = Driver {
            shared: Arc::clone(&shared),
            client_id: client_id.clone(),
            settings,
            tls,
            rejections,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(driver.run(first_tx).instrument(span.clone()));

        let conn = Self {
            id,
            client_id,
            shared,
            cancel,
            driver: Mutex::new(Some(handle)),
            drain_grace,
            span,
        };
        (conn, first_rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn outstanding(&self) -> usize {
        self.shared.acks.outstanding()
    }

    /// Hands a QoS 1 publish to the session; the receiver fires on PUBACK.
    pub fn publish(&self, payload: Vec<u8>) -> Result<oneshot::Receiver<()>, TransportError> {
        if self.shared.closing() {
            return Err(TransportError::ConnectionClosed);
        }
        if self.state() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        let client = self.shared.client().ok_or(TransportError::NotConnected)?;
        let topic = self.shared.topic.clone();
        self.shared.acks.register(move || {
            client
                .try_publish(topic, QoS::AtLeastOnce, false, payload)
                .map_err(|e| {
                    debug!(error = %e, "publish request not queued");
                    TransportError::NotConnected
                })
        })
    }

    /// Gives outstanding publishes `drain_grace` to be acknowledged, sends
    /// DISCONNECT and stops the driver. Idempotent.
    pub async fn close(&self) {
        if self.shared.closing.swap(true, Ordering::AcqRel) {
            return;
        }

        if self.shared.acks.outstanding() > 0
            && !self.shared.acks.wait_drained(self.drain_grace).await
        {
            warn!(
                parent: &self.span,
                outstanding = self.shared.acks.outstanding(),
                "closing with unacknowledged publishes"
            );
        }
        self.shared.acks.close();

        match self.shared.client() {
            Some(client) => {
                if let Err(e) = client.try_disconnect() {
                    debug!(parent: &self.span, error = %e, "disconnect request not queued");
                    self.cancel.cancel();
                }
            }
            None => self.cancel.cancel(),
        }

        let handle = self
            .driver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(DRIVER_JOIN_TIMEOUT, &mut handle)
                .await
                .is_err()
            {
                self.cancel.cancel();
                if tokio::time::timeout(DRIVER_JOIN_TIMEOUT, &mut handle)
                    .await
                    .is_err()
                {
                    warn!(parent: &self.span, "connection driver did not stop, aborting");
                    handle.abort();
                }
            }
        }
        self.cancel.cancel();
        self.shared.install_client(None);
        self.shared.set_state(ConnectionState::Disconnected);
        info!(parent: &self.span, "connection closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum SessionEnd {
    Cancelled,
    Disconnected,
    Lost(String),
}

struct Driver {
    shared: Arc<Shared>,
    client_id: String,
    settings: TransportSettings,
    tls: Arc<ClientConfig>,
    rejections: Arc<RejectionLog>,
    cancel: CancellationToken,
}

impl Driver {
    fn mqtt_options(&self) -> MqttOptions {
        let mut opts = MqttOptions::new(
            self.client_id.clone(),
            self.settings.broker.host.clone(),
            self.settings.broker.port,
        );
        opts.set_clean_session(true)
            .set_keep_alive(self.settings.keep_alive)
            .set_transport(Transport::Tls(TlsConfiguration::Rustls(Arc::clone(
                &self.tls,
            ))));
        opts
    }

    async fn run(self, first: oneshot::Sender<Result<(), TransportError>>) {
        let mut first = Some(first);
        let mut attempt: u64 = 0;

        loop {
            if self.shared.closing() {
                break;
            }
            attempt += 1;
            self.shared.set_state(if first.is_some() {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting
            });
            self.rejections.take();

            let (client, mut eventloop) =
                AsyncClient::new(self.mqtt_options(), self.settings.request_capacity);
            debug!(attempt, "connecting to mqtt broker");

            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                r = tokio::time::timeout(self.settings.connect_timeout, wait_connack(&mut eventloop)) => match r {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(self.classify(e)),
                    Err(_) => Err(TransportError::ConnectTimeout(self.settings.connect_timeout)),
                },
            };

            match connected {
                Ok(()) => {
                    self.shared.install_client(Some(client));
                    self.shared.set_state(ConnectionState::Connected);
                    info!(attempt, "connected to mqtt broker");
                    if let Some(tx) = first.take() {
                        let _ = tx.send(Ok(()));
                    }

                    let end = self.run_session(&mut eventloop).await;
                    self.shared.install_client(None);
                    self.shared.acks.fail_all();
                    match end {
                        SessionEnd::Cancelled | SessionEnd::Disconnected => {
                            info!("disconnected from mqtt broker");
                            break;
                        }
                        SessionEnd::Lost(reason) => {
                            if self.shared.closing() {
                                break;
                            }
                            warn!(%reason, "connection to mqtt broker lost");
                            self.shared.set_state(ConnectionState::Reconnecting);
                        }
                    }
                }
                Err(e) => {
                    if let Some(tx) = first.take() {
                        self.shared.set_state(ConnectionState::Disconnected);
                        let _ = tx.send(Err(e.clone()));
                    }
                    if matches!(e, TransportError::PeerVerificationFailed(_)) {
                        error!(attempt, error = %e, "mqtt connect refused by peer verification");
                    } else {
                        warn!(attempt, error = %e, retry_in = ?self.settings.reconnect_interval, "mqtt connect failed");
                    }
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.reconnect_interval) => {}
            }
        }

        self.shared.install_client(None);
        debug!("connection driver stopped");
    }

    async fn run_session(&self, eventloop: &mut EventLoop) -> SessionEnd {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => return SessionEnd::Cancelled,
                event = eventloop.poll() => event,
            };
            match event {
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                    self.shared.acks.on_outgoing_publish(pkid)
                }
                Ok(Event::Incoming(Packet::PubAck(ack))) => self.shared.acks.on_puback(ack.pkid),
                Ok(Event::Outgoing(Outgoing::Disconnect)) => return SessionEnd::Disconnected,
                Ok(_) => {}
                Err(e) => return SessionEnd::Lost(e.to_string()),
            }
        }
    }

    fn classify(&self, err: ConnectionError) -> TransportError {
        if let Some(reason) = self.rejections.take() {
            return TransportError::PeerVerificationFailed(reason);
        }
        match err {
            ConnectionError::NetworkTimeout => {
                TransportError::ConnectTimeout(self.settings.connect_timeout)
            }
            other => TransportError::ConnectFailed(other.to_string()),
        }
    }
}

async fn wait_connack(eventloop: &mut EventLoop) -> Result<(), ConnectionError> {
    loop {
        if let Event::Incoming(Packet::ConnAck(ack)) = eventloop.poll().await? {
            return if ack.code == ConnectReturnCode::Success {
                Ok(())
            } else {
                Err(ConnectionError::ConnectionRefused(ack.code))
            };
        }
    }
}
