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

//! Telemetry payload published on every tick.

use crate::common::constants::telemetry::{COMPONENT, MESSAGE};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryPayload {
    pub ts: String,
    pub message: String,
    pub component: String,
}

impl TelemetryPayload {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            ts: now.to_rfc3339_opts(SecondsFormat::Nanos, true),
            message: MESSAGE.to_string(),
            component: COMPONENT.to_string(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
