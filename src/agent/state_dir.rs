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

//! Per-user state directory: PID file and rotation marker.

use crate::common::errors::StateDirError;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

/// Creates the state directory (0755 on unix) if it does not exist.
///
/// An existing directory keeps its mode and owner.
pub fn ensure(dir: &Path) -> Result<(), StateDirError> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o755);
    }
    builder.create(dir)?;
    Ok(())
}

/// Exclusively locked PID file, held for the agent's lifetime.
#[derive(Debug)]
pub struct PidFile {
    file: File,
    path: PathBuf,
}

impl PidFile {
    /// Locks `path` and writes the current process id into it.
    ///
    /// Fails with `AlreadyRunning` while another process holds the lock.
    pub fn acquire(path: &Path) -> Result<Self, StateDirError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.try_lock_exclusive()
            .map_err(|_| StateDirError::AlreadyRunning(path.display().to_string()))?;

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.sync_all()?;
        debug!(path = %path.display(), pid = std::process::id(), "pid file written");

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the file and drops the lock.
    pub fn release(self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "could not remove pid file");
        }
        let _ = FileExt::unlock(&self.file);
    }
}

/// Reads the process id recorded in a PID file.
pub fn read_pid(path: &Path) -> Result<i32, StateDirError> {
    let content = fs::read_to_string(path)?;
    content
        .trim()
        .parse::<i32>()
        .ok()
        .filter(|pid| *pid > 0)
        .ok_or_else(|| StateDirError::InvalidPid {
            path: path.display().to_string(),
            content: content.trim().to_string(),
        })
}

/// Creates the marker file or bumps its modification time.
pub fn touch_marker(path: &Path) -> Result<(), StateDirError> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    file.set_modified(SystemTime::now())?;
    Ok(())
}

/// Modification time of `path`, `None` when it does not exist.
pub fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}
