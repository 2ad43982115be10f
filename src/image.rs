//! Daily image-update check with digest comparison.
//!
//! The check throttles itself to once per day via a small state file; the
//! cooldown is recorded even when the remote check fails, so a broken network
//! does not cost a pull attempt on every startup the same day. Nothing here
//! may abort a startup.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::credentials::resolve_registry_credential;
use crate::errors::Result;
use crate::runtime::ContainerRuntime;

const CHECK_COOLDOWN: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageCheckOutcome {
    /// The image was absent locally and has been pulled.
    Pulled,
    /// A newer image replaced the previous digest.
    Updated,
    /// The local image is current.
    UpToDate,
    /// Cooldown active, or the remote check failed; startup proceeds with the
    /// local image.
    Skipped,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ImageCheckState {
    last_check_unix: Option<u64>,
    last_digest: Option<String>,
}

pub struct ImageUpdateChecker {
    state_path: PathBuf,
    image: String,
}

impl ImageUpdateChecker {
    pub fn new(state_dir: &Path, image: &str) -> ImageUpdateChecker {
        ImageUpdateChecker {
            state_path: state_dir.join("image-check.json"),
            image: image.to_string(),
        }
    }

    /// True when no check was ever recorded or the last one is at least a day
    /// in the past.
    pub fn should_check_today(&self) -> bool {
        self.should_check_at(SystemTime::now())
    }

    fn should_check_at(&self, now: SystemTime) -> bool {
        let Some(last) = self.load_state().last_check_unix else {
            return true;
        };
        let now_unix = unix_secs(now);
        now_unix.saturating_sub(last) >= CHECK_COOLDOWN.as_secs()
    }

    /// Ensure the image is present and, at most once a day, look for a newer
    /// one. Never returns an error the caller must handle; a missing image
    /// that cannot be pulled is the only fatal condition.
    pub fn check_and_maybe_update(&self, runtime: &dyn ContainerRuntime) -> Result<ImageCheckOutcome> {
        if !runtime.image_exists(&self.image)? {
            info!(image = %self.image, "proxy image absent; pulling");
            let auth = resolve_registry_credential();
            runtime.pull(&self.image, auth.as_ref())?;
            let digest = runtime.image_digest(&self.image).unwrap_or(None);
            self.record_check(digest);
            return Ok(ImageCheckOutcome::Pulled);
        }

        if !self.should_check_today() {
            debug!(image = %self.image, "image update check on cooldown");
            return Ok(ImageCheckOutcome::Skipped);
        }

        let previous = self.load_state().last_digest;
        let auth = resolve_registry_credential();
        if let Err(e) = runtime.pull(&self.image, auth.as_ref()) {
            warn!(image = %self.image, error = %e, "image update check failed; keeping local image");
            // Still burn the cooldown so a flaky network is probed once a day.
            self.record_check(previous);
            return Ok(ImageCheckOutcome::Skipped);
        }

        let current = runtime.image_digest(&self.image).unwrap_or(None);
        self.record_check(current.clone());
        match (previous, current) {
            (Some(old), Some(new)) if old != new => {
                info!(image = %self.image, "proxy image updated");
                Ok(ImageCheckOutcome::Updated)
            }
            // A first-ever digest is a baseline, not evidence of a change.
            _ => Ok(ImageCheckOutcome::UpToDate),
        }
    }

    fn load_state(&self) -> ImageCheckState {
        fs::read_to_string(&self.state_path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    fn record_check(&self, digest: Option<String>) {
        self.record_check_at(SystemTime::now(), digest);
    }

    fn record_check_at(&self, now: SystemTime, digest: Option<String>) {
        let state = ImageCheckState {
            last_check_unix: Some(unix_secs(now)),
            last_digest: digest,
        };
        if let Some(parent) = self.state_path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if let Ok(serialized) = serde_json::to_string(&state) {
            let _ = fs::write(&self.state_path, serialized);
        }
    }
}

fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}
