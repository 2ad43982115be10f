//! File-based branch handoff channel.
//!
//! When the container creates an ephemeral branch, the only authoritative
//! source of the concrete branch id is a JSON file the container writes into
//! the mounted handoff directory. The file may be read mid-write, so a read
//! only trusts a complete JSON document; anything else is "not yet".

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::debug;

use crate::errors::{ProxyError, Result};

/// File name the container writes inside the mounted directory.
pub const HANDOFF_FILE_NAME: &str = ".branches";

#[derive(Debug, Clone)]
pub struct BranchHandoffChannel {
    path: PathBuf,
}

impl BranchHandoffChannel {
    pub fn new(handoff_dir: &Path) -> BranchHandoffChannel {
        BranchHandoffChannel {
            path: handoff_dir.join(HANDOFF_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse the handoff file and return the first `branch_id` found, or
    /// `None` on absence, emptiness, or any parse failure.
    pub fn read(&self) -> Option<String> {
        let raw = fs::read_to_string(&self.path).ok()?;
        if raw.trim().is_empty() {
            return None;
        }
        let value: Value = serde_json::from_str(&raw).ok()?;
        let map = value.as_object()?;
        for record in map.values() {
            if let Some(id) = record.get("branch_id").and_then(Value::as_str) {
                if !id.is_empty() {
                    return Some(id.to_string());
                }
            }
        }
        None
    }

    /// Poll `read()` until a branch id appears or `timeout` elapses.
    pub fn wait_for(&self, timeout: Duration, interval: Duration) -> Result<String> {
        let started = Instant::now();
        loop {
            if let Some(id) = self.read() {
                debug!(branch_id = %id, "branch id handed off");
                return Ok(id);
            }
            if started.elapsed() >= timeout {
                return Err(ProxyError::HandoffTimeout(timeout));
            }
            thread::sleep(interval);
        }
    }

    /// Remove the handoff file. Idempotent; called on every stop/cleanup path
    /// so no stale branch id survives into the next startup.
    pub fn delete(&self) {
        if fs::remove_file(&self.path).is_ok() {
            debug!(path = %self.path.display(), "handoff file removed");
        }
    }
}
