//! Error taxonomy for the proxy lifecycle manager.
//!
//! Credential and quota failures are caller problems and propagate unmodified;
//! image-check and registry-credential failures never reach the caller (they
//! degrade locally); a not-found container on the stop path is success, not an
//! error.

use std::io;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// No usable credential: ephemeral-branch creation requires a persistent
    /// API token, and none is stored (nor any session token at all).
    #[error("authentication required: no API token is configured")]
    AuthRequired,

    /// A session token existed but could not be refreshed; the session has
    /// been cleared and the user must sign in again.
    #[error("session expired: sign in again to continue")]
    AuthExpired,

    /// The upstream project hit its branch quota. Retrying cannot help; the
    /// container is left in place for log inspection unless configured
    /// otherwise.
    #[error("branch limit reached for this project; delete an unused branch and retry")]
    BranchLimitExceeded,

    /// The container came up but never logged the ready marker in time.
    #[error("proxy container did not become ready within {0:?}")]
    ReadinessTimeout(Duration),

    /// The container never reported a concrete branch id through the handoff
    /// file. The container may still be running; startup is rolled back as
    /// failed regardless.
    #[error("no branch id was handed off within {0:?}")]
    HandoffTimeout(Duration),

    /// The container (or a required piece of its state) is absent.
    #[error("proxy container not found: {0}")]
    NotFound(String),

    /// The container runtime reported a hard failure.
    #[error("container runtime failure: {0}")]
    ContainerFailed(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ProxyError>;

/// Map an error to a process exit code for the CLI:
/// 127 when the container runtime is missing, 1 for everything else.
pub fn exit_code_for_error(e: &ProxyError) -> u8 {
    match e {
        ProxyError::Io(ioe) if ioe.kind() == io::ErrorKind::NotFound => 127,
        _ => 1,
    }
}
