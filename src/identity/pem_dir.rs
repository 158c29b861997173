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

//! Identity source backed by a directory of PEM files.
//!
//! This is the layout a SPIFFE helper maintains on disk: `svid.pem` (chain,
//! leaf first), `svid_key.pem` (PKCS#8 key) and `svid_bundle.pem` (roots of the
//! workload's trust domain). Updates are detected by polling modification times.

use crate::common::constants::svid_dir::{BUNDLE_FILE_NAME, KEY_FILE_NAME, SVID_FILE_NAME};
use crate::common::credential::Credential;
use crate::common::errors::IdentityError;
use crate::identity::source::{CredentialStream, IdentitySource};
use async_trait::async_trait;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct PemDirSource {
    dir: PathBuf,
    poll_interval: Duration,
    closed: CancellationToken,
}

impl PemDirSource {
    pub fn new(dir: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            dir: dir.into(),
            poll_interval,
            closed: CancellationToken::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl IdentitySource for PemDirSource {
    async fn fetch(&self) -> Result<Credential, IdentityError> {
        if self.closed.is_cancelled() {
            return Err(closed_error());
        }
        read_credential(&self.dir).await
    }

    async fn watch(&self) -> Result<CredentialStream, IdentityError> {
        if self.closed.is_cancelled() {
            return Err(closed_error());
        }
        let state = PollState {
            dir: self.dir.clone(),
            interval: self.poll_interval,
            closed: self.closed.clone(),
            last_seen: None,
            done: false,
        };
        Ok(futures::stream::unfold(state, poll_next).boxed())
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

struct PollState {
    dir: PathBuf,
    interval: Duration,
    closed: CancellationToken,
    last_seen: Option<SystemTime>,
    done: bool,
}

async fn poll_next(
    mut st: PollState,
) -> Option<(Result<Credential, IdentityError>, PollState)> {
    loop {
        if st.done || st.closed.is_cancelled() {
            return None;
        }
        match latest_mtime(&st.dir).await {
            Err(e) => {
                st.done = true;
                return Some((Err(e), st));
            }
            Ok(mtime) if st.last_seen != Some(mtime) => {
                debug!(dir = %st.dir.display(), "svid files changed");
                st.last_seen = Some(mtime);
                let item = read_credential(&st.dir).await;
                if matches!(item, Err(IdentityError::SourceUnavailable(_))) {
                    st.done = true;
                }
                return Some((item, st));
            }
            Ok(_) => {}
        }
        tokio::select! {
            _ = st.closed.cancelled() => return None,
            _ = tokio::time::sleep(st.interval) => {}
        }
    }
}

async fn read_credential(dir: &Path) -> Result<Credential, IdentityError> {
    let svid = read_file(&dir.join(SVID_FILE_NAME)).await?;
    let key = zeroize::Zeroizing::new(read_file(&dir.join(KEY_FILE_NAME)).await?);
    let bundle = read_file(&dir.join(BUNDLE_FILE_NAME)).await?;
    Credential::from_pem(&svid, &key, &bundle)
}

async fn read_file(path: &Path) -> Result<Vec<u8>, IdentityError> {
    tokio::fs::read(path)
        .await
        .map_err(|e| IdentityError::SourceUnavailable(format!("read {}: {e}", path.display())))
}

async fn latest_mtime(dir: &Path) -> Result<SystemTime, IdentityError> {
    let mut latest = UNIX_EPOCH;
    for name in [SVID_FILE_NAME, KEY_FILE_NAME, BUNDLE_FILE_NAME] {
        let path = dir.join(name);
        let modified = tokio::fs::metadata(&path)
            .await
            .and_then(|m| m.modified())
            .map_err(|e| {
                IdentityError::SourceUnavailable(format!("stat {}: {e}", path.display()))
            })?;
        latest = latest.max(modified);
    }
    Ok(latest)
}

fn closed_error() -> IdentityError {
    IdentityError::SourceUnavailable("identity source closed".to_string())
}
