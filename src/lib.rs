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

//! oneedge-agent: an edge telemetry agent bound to a rotating SPIFFE identity.
//!
//! The identity side tracks X.509 SVIDs from the identity authority, the
//! transport side keeps a single mTLS MQTT session whose peer is checked by
//! trust domain, and the agent loop hot-swaps the session on every rotation.

pub mod agent;
pub mod common;
pub mod config;
pub mod identity;
pub mod transport;
