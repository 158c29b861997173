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

use crate::config::AgentConfig;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info_span, Span};

/// Process-wide state handed to every component constructor.
#[derive(Clone)]
pub struct AgentContext {
    pub config: Arc<AgentConfig>,
    pub shutdown: CancellationToken,
    pub span: Span,
}

impl AgentContext {
    pub fn new(config: AgentConfig) -> Self {
        let span = info_span!("agent", device = %config.device_id);
        Self {
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
            span,
        }
    }
}
