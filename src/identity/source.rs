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

use crate::common::credential::Credential;
use crate::common::errors::IdentityError;
use async_trait::async_trait;
use futures::stream::BoxStream;

/// Stream of credential snapshots pushed by the identity authority.
pub type CredentialStream = BoxStream<'static, Result<Credential, IdentityError>>;

/// Client of the identity-issuing authority.
///
/// Implementations never retry internally; the manager owns retry policy.
#[async_trait]
pub trait IdentitySource: Send + Sync {
    /// One snapshot of the current credential.
    async fn fetch(&self) -> Result<Credential, IdentityError>;

    /// Subscribes to updates. The stream ends or yields an error when the
    /// subscription breaks; the caller re-subscribes.
    async fn watch(&self) -> Result<CredentialStream, IdentityError>;

    /// Releases the underlying connection. Idempotent.
    async fn close(&self);
}
