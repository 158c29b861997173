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

//! oneedge-agent Constants - Single source of truth for defaults and names.
//!
//! This module centralizes timing defaults, file names, environment variable
//! names and wire constants so the agent, the CLI and the tests agree.

use std::time::Duration;

/// Timing defaults for the identity and transport loops
pub mod timing {
    use super::Duration;

    /// Startup deadline for the first credential
    pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
    /// Deadline for a manual refresh
    pub const REFRESH_TIMEOUT: Duration = Duration::from_secs(5);
    /// Interval between telemetry publishes
    pub const PUBLISH_INTERVAL: Duration = Duration::from_secs(10);
    /// Deadline for a single publish acknowledgment
    pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);
    /// Fixed interval between connect attempts
    pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);
    /// Bound on a single connect attempt (TCP + TLS + CONNACK)
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    /// Marker file polling interval
    pub const MARKER_POLL_INTERVAL: Duration = Duration::from_secs(10);
    /// Delay before re-subscribing to the identity authority
    pub const WATCH_RETRY_INTERVAL: Duration = Duration::from_secs(5);
    /// PEM directory polling interval
    pub const SVID_DIR_POLL_INTERVAL: Duration = Duration::from_secs(5);
    /// Time an outgoing connection gets to drain in-flight acknowledgments
    pub const DRAIN_GRACE: Duration = Duration::from_millis(250);
    /// MQTT keep-alive
    pub const KEEP_ALIVE: Duration = Duration::from_secs(30);
    /// How long a closing connection waits for its driver task to stop
    pub const DRIVER_JOIN_TIMEOUT: Duration = Duration::from_secs(1);
}

/// MQTT defaults
pub mod mqtt {
    pub const DEFAULT_BROKER: &str = "localhost:8883";
    pub const DEFAULT_PORT: u16 = 8883;
    /// Maximum client identifier length accepted by the broker
    pub const MAX_CLIENT_ID_LEN: usize = 128;
    /// Capacity of the request channel between client handle and event loop
    pub const REQUEST_CAPACITY: usize = 16;
}

/// Telemetry payload fields
pub mod telemetry {
    pub const COMPONENT: &str = "oneedge-agent";
    pub const MESSAGE: &str = "hello from oneedge-agent";
}

/// Per-user state directory layout
pub mod state {
    pub const STATE_DIR_NAME: &str = ".oneedge";
    pub const ROTATE_FILE_NAME: &str = "rotate.signal";
    pub const PID_FILE_NAME: &str = "agent.pid";
    pub const DEVICE_CONFIG_FILE_NAME: &str = "config.yaml";
    pub const DEFAULT_SOCKET_PATH: &str = "spire/api.sock";
    pub const DEFAULT_SVID_DIR: &str = "svid";
    pub const DEFAULT_DEVICE_ID: &str = "dev/agent";
}

/// File names inside a helper-maintained SVID directory
pub mod svid_dir {
    pub const SVID_FILE_NAME: &str = "svid.pem";
    pub const KEY_FILE_NAME: &str = "svid_key.pem";
    pub const BUNDLE_FILE_NAME: &str = "svid_bundle.pem";
}

/// Configuration Environment Variables
pub mod config {
    pub const ENV_MQTT_BROKER: &str = "ONEEDGE_MQTT_BROKER";
    pub const ENV_MQTT_TOPIC: &str = "ONEEDGE_MQTT_TOPIC";
    pub const ENV_DEVICE_ID: &str = "ONEEDGE_DEVICE_ID";
    pub const ENV_STATE_DIR: &str = "ONEEDGE_STATE_DIR";
    pub const ENV_IDENTITY_SOURCE: &str = "ONEEDGE_IDENTITY_SOURCE";
    pub const ENV_SVID_DIR: &str = "ONEEDGE_SVID_DIR";
    pub const ENV_SPIFFE_ENDPOINT_SOCKET: &str = "SPIFFE_ENDPOINT_SOCKET";
    pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL";
    pub const ENV_LOG_FORMAT: &str = "LOG_FORMAT";
}

/// SPIFFE identifiers
pub mod spiffe {
    pub const SCHEME_PREFIX: &str = "spiffe://";
    /// Prefix accepted (and stripped) on socket addresses
    pub const UNIX_SCHEME_PREFIX: &str = "unix://";
}
