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

use crate::common::constants::{mqtt, timing};
use crate::common::errors::TransportError;
use std::fmt;
use std::time::Duration;

const SCHEMES: [&str; 5] = ["mqtts://", "ssl://", "tls://", "tcp://", "mqtt://"];

/// Broker host and port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

impl BrokerAddress {
    /// Parses `host`, `host:port`, `[v6]:port`, optionally with a URL scheme.
    pub fn parse(input: &str) -> Result<Self, TransportError> {
        let invalid = || TransportError::InvalidBroker(input.to_string());
        let trimmed = input.trim();
        let rest = SCHEMES
            .iter()
            .find_map(|s| trimmed.strip_prefix(s))
            .unwrap_or(trimmed)
            .trim_end_matches('/');
        if rest.is_empty() {
            return Err(invalid());
        }

        let (host, port) = if let Some(v6) = rest.strip_prefix('[') {
            let (host, after) = v6.split_once(']').ok_or_else(invalid)?;
            match after.strip_prefix(':') {
                Some(p) => (host, Some(p)),
                None if after.is_empty() => (host, None),
                None => return Err(invalid()),
            }
        } else {
            match rest.rsplit_once(':') {
                Some((h, p)) if !h.contains(':') => (h, Some(p)),
                Some(_) => return Err(invalid()),
                None => (rest, None),
            }
        };

        if host.is_empty() {
            return Err(invalid());
        }
        let port = match port {
            Some(p) => p.parse::<u16>().map_err(|_| invalid())?,
            None => mqtt::DEFAULT_PORT,
        };
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Knobs for the broker connection.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub broker: BrokerAddress,
    pub topic: String,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub reconnect_interval: Duration,
    pub drain_grace: Duration,
    pub request_capacity: usize,
}

impl TransportSettings {
    pub fn new(broker: BrokerAddress, topic: impl Into<String>) -> Self {
        Self {
            broker,
            topic: topic.into(),
            keep_alive: timing::KEEP_ALIVE,
            connect_timeout: timing::CONNECT_TIMEOUT,
            reconnect_interval: timing::RECONNECT_INTERVAL,
            drain_grace: timing::DRAIN_GRACE,
            request_capacity: mqtt::REQUEST_CAPACITY,
        }
    }
}
