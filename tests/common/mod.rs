#![allow(dead_code)]

pub mod broker;
pub mod certs;
pub mod source;

use oneedge_agent::transport::{BrokerAddress, ConnectionState, TransportManager, TransportSettings};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;

/// Transport settings with test-friendly intervals.
pub fn fast_settings(broker: &str) -> TransportSettings {
    let mut settings =
        TransportSettings::new(BrokerAddress::parse(broker).unwrap(), "sensors/dev/agent/telemetry");
    settings.connect_timeout = Duration::from_secs(2);
    settings.reconnect_interval = Duration::from_millis(100);
    settings.drain_grace = Duration::from_millis(500);
    settings
}

pub fn transport(broker: &str) -> TransportManager {
    TransportManager::new(fast_settings(broker), &tracing::Span::none())
}

/// A localhost port with nothing listening on it (at the time of the call).
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

pub async fn wait_for_state(
    rx: &mut watch::Receiver<ConnectionState>,
    want: ConnectionState,
    within: Duration,
) -> bool {
    tokio::time::timeout(within, rx.wait_for(|s| *s == want))
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
}

/// Polls `check` every 10ms until it holds or `within` elapses.
pub async fn eventually<F, Fut>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
