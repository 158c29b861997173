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

use crate::common::constants::{self, config as env_names, state, timing};
use crate::common::errors::StateDirError;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum IdentitySourceKind {
    PemDir,
    WorkloadApi,
}

impl IdentitySourceKind {
    pub fn parse_safe(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "workload-api" | "workload_api" | "spire" => IdentitySourceKind::WorkloadApi,
            _ => IdentitySourceKind::PemDir,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IdentitySourceKind::PemDir => "pem-dir",
            IdentitySourceKind::WorkloadApi => "workload-api",
        }
    }
}

/// Deadlines and intervals used by the agent loops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timing {
    pub startup_timeout: Duration,
    pub refresh_timeout: Duration,
    pub publish_interval: Duration,
    pub publish_timeout: Duration,
    pub reconnect_interval: Duration,
    pub connect_timeout: Duration,
    pub marker_poll_interval: Duration,
    pub watch_retry_interval: Duration,
    pub svid_poll_interval: Duration,
    pub drain_grace: Duration,
    pub keep_alive: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            startup_timeout: timing::STARTUP_TIMEOUT,
            refresh_timeout: timing::REFRESH_TIMEOUT,
            publish_interval: timing::PUBLISH_INTERVAL,
            publish_timeout: timing::PUBLISH_TIMEOUT,
            reconnect_interval: timing::RECONNECT_INTERVAL,
            connect_timeout: timing::CONNECT_TIMEOUT,
            marker_poll_interval: timing::MARKER_POLL_INTERVAL,
            watch_retry_interval: timing::WATCH_RETRY_INTERVAL,
            svid_poll_interval: timing::SVID_DIR_POLL_INTERVAL,
            drain_grace: timing::DRAIN_GRACE,
            keep_alive: timing::KEEP_ALIVE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub broker: String,
    pub topic: String,
    pub device_id: String,
    pub state_dir: PathBuf,
    pub identity_source: IdentitySourceKind,
    pub socket_path: PathBuf,
    pub svid_dir: PathBuf,
    pub log_level: String,
    pub log_format: String, // "json" or "text"
    pub timing: Timing,
}

/// Device enrolment record written next to the agent state.
#[derive(Debug, Deserialize)]
struct DeviceRecord {
    device_id: Option<String>,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self, StateDirError> {
        let state_dir = match env::var(env_names::ENV_STATE_DIR) {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => default_state_dir()?,
        };
        Ok(Self::from_env_with_state_dir(state_dir))
    }

    /// Reads everything but the state directory from the environment.
    pub fn from_env_with_state_dir(state_dir: PathBuf) -> Self {
        let device_id = non_empty_env(env_names::ENV_DEVICE_ID)
            .or_else(|| device_id_from_record(&state_dir))
            .unwrap_or_else(|| state::DEFAULT_DEVICE_ID.to_string());
        let topic = non_empty_env(env_names::ENV_MQTT_TOPIC)
            .unwrap_or_else(|| default_topic(&device_id));
        let socket_path = non_empty_env(env_names::ENV_SPIFFE_ENDPOINT_SOCKET)
            .map(|s| socket_from_endpoint(&s))
            .unwrap_or_else(|| state_dir.join(state::DEFAULT_SOCKET_PATH));
        let svid_dir = non_empty_env(env_names::ENV_SVID_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|| state_dir.join(state::DEFAULT_SVID_DIR));

        Self {
            broker: non_empty_env(env_names::ENV_MQTT_BROKER)
                .unwrap_or_else(|| constants::mqtt::DEFAULT_BROKER.to_string()),
            topic,
            device_id,
            identity_source: IdentitySourceKind::parse_safe(
                &env::var(env_names::ENV_IDENTITY_SOURCE).unwrap_or_else(|_| "pem-dir".to_string()),
            ),
            socket_path,
            svid_dir,
            log_level: env::var(env_names::ENV_LOG_LEVEL).unwrap_or_else(|_| "info".to_string()),
            log_format: env::var(env_names::ENV_LOG_FORMAT)
                .unwrap_or_else(|_| "text".to_string()),
            timing: Timing::default(),
            state_dir,
        }
    }

    pub fn rotate_marker_path(&self) -> PathBuf {
        self.state_dir.join(state::ROTATE_FILE_NAME)
    }

    pub fn pid_file_path(&self) -> PathBuf {
        self.state_dir.join(state::PID_FILE_NAME)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        let state_dir = default_state_dir().unwrap_or_else(|_| PathBuf::from(state::STATE_DIR_NAME));
        Self {
            broker: constants::mqtt::DEFAULT_BROKER.to_string(),
            topic: default_topic(state::DEFAULT_DEVICE_ID),
            device_id: state::DEFAULT_DEVICE_ID.to_string(),
            identity_source: IdentitySourceKind::PemDir,
            socket_path: state_dir.join(state::DEFAULT_SOCKET_PATH),
            svid_dir: state_dir.join(state::DEFAULT_SVID_DIR),
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            timing: Timing::default(),
            state_dir,
        }
    }
}

pub fn default_state_dir() -> Result<PathBuf, StateDirError> {
    dirs::home_dir()
        .map(|home| home.join(state::STATE_DIR_NAME))
        .ok_or(StateDirError::NoHome)
}

pub fn default_topic(device_id: &str) -> String {
    format!("sensors/{device_id}/telemetry")
}

/// `unix:///run/spire/api.sock` and `/run/spire/api.sock` name the same socket.
pub fn socket_from_endpoint(endpoint: &str) -> PathBuf {
    let path = endpoint
        .strip_prefix(constants::spiffe::UNIX_SCHEME_PREFIX)
        .or_else(|| endpoint.strip_prefix("unix:"))
        .unwrap_or(endpoint);
    PathBuf::from(path)
}

fn non_empty_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn device_id_from_record(state_dir: &Path) -> Option<String> {
    let path = state_dir.join(state::DEVICE_CONFIG_FILE_NAME);
    let content = std::fs::read_to_string(&path).ok()?;
    match serde_yaml_ng::from_str::<DeviceRecord>(&content) {
        Ok(record) => record.device_id.filter(|id| !id.trim().is_empty()),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable device config");
            None
        }
    }
}
