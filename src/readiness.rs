//! Readiness classification and the startup poll loop.
//!
//! Classification is a pure function over a runtime state snapshot and a log
//! tail, so the transition logic can be tested without a container. The check
//! order is deliberate: branch-limit before generic error before ready, so a
//! quota failure is never masked by a generic match and a ready marker next
//! to a later error line is not mistaken for success.

use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::errors::{ProxyError, Result};
use crate::runtime::{ContainerRuntime, ContainerState};

/// Log line signaling the proxy accepts connections.
pub const READY_MARKER: &str = "Neon Local is ready";
/// Upstream quota error, surfaced verbatim in the container log.
const BRANCH_LIMIT_STATUS: &str = "422 Client Error: Unprocessable Entity";
const BRANCH_LIMIT_PATH: &str = "/branches";
/// Generic failure marker used by the proxy's log format.
const ERROR_MARKER: &str = "Error:";

/// How many log lines to fetch per poll tick.
pub const LOG_TAIL_LINES: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// Project hit its branch quota; retrying cannot help.
    BranchLimit,
    Generic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    NotRunning,
    Starting,
    Ready,
    Failed(FailureReason),
}

/// Classify a single poll observation.
pub fn classify(state: ContainerState, log_tail: &str) -> Readiness {
    if state != ContainerState::Running {
        return Readiness::NotRunning;
    }
    if log_tail.contains(BRANCH_LIMIT_STATUS) && log_tail.contains(BRANCH_LIMIT_PATH) {
        return Readiness::Failed(FailureReason::BranchLimit);
    }
    if log_tail.contains(ERROR_MARKER) {
        return Readiness::Failed(FailureReason::Generic);
    }
    if log_tail.contains(READY_MARKER) {
        return Readiness::Ready;
    }
    Readiness::Starting
}

/// Poll until the container is ready or has failed. A branch-limit failure
/// short-circuits the timeout.
pub fn wait_ready(
    runtime: &dyn ContainerRuntime,
    name: &str,
    timeout: Duration,
    interval: Duration,
) -> Result<()> {
    let started = Instant::now();
    loop {
        let state = runtime.state(name)?;
        let logs = if state == ContainerState::Running {
            runtime.logs_tail(name, LOG_TAIL_LINES)?
        } else {
            String::new()
        };
        match classify(state, &logs) {
            Readiness::Ready => {
                debug!(container = name, "proxy container ready");
                return Ok(());
            }
            Readiness::Failed(FailureReason::BranchLimit) => {
                return Err(ProxyError::BranchLimitExceeded);
            }
            Readiness::Failed(FailureReason::Generic) => {
                return Err(ProxyError::ContainerFailed(last_error_line(&logs)));
            }
            Readiness::NotRunning | Readiness::Starting => {}
        }
        if started.elapsed() >= timeout {
            return Err(ProxyError::ReadinessTimeout(timeout));
        }
        thread::sleep(interval);
    }
}

fn last_error_line(logs: &str) -> String {
    logs.lines()
        .rev()
        .find(|line| line.contains(ERROR_MARKER))
        .unwrap_or("container reported an error")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const BRANCH_LIMIT_LINE: &str =
        "422 Client Error: Unprocessable Entity for url: https://console.neon.tech/api/v2/projects/p/branches";

    #[test]
    fn not_running_regardless_of_logs() {
        assert_eq!(
            classify(ContainerState::Stopped, READY_MARKER),
            Readiness::NotRunning
        );
        assert_eq!(classify(ContainerState::Absent, ""), Readiness::NotRunning);
        assert_eq!(classify(ContainerState::Created, ""), Readiness::NotRunning);
    }

    #[test]
    fn empty_logs_mean_starting() {
        assert_eq!(classify(ContainerState::Running, ""), Readiness::Starting);
    }

    #[test]
    fn ready_marker_is_terminal_success() {
        let logs = format!("starting up\n{READY_MARKER}\n");
        assert_eq!(classify(ContainerState::Running, &logs), Readiness::Ready);
    }

    #[test]
    fn branch_limit_beats_ready_marker() {
        let logs = format!("{BRANCH_LIMIT_LINE}\n{READY_MARKER}\n");
        assert_eq!(
            classify(ContainerState::Running, &logs),
            Readiness::Failed(FailureReason::BranchLimit)
        );
    }

    #[test]
    fn branch_limit_beats_generic_error_marker() {
        let logs = format!("Error: something\n{BRANCH_LIMIT_LINE}\n");
        assert_eq!(
            classify(ContainerState::Running, &logs),
            Readiness::Failed(FailureReason::BranchLimit)
        );
    }

    #[test]
    fn generic_error_beats_ready_marker() {
        let logs = format!("{READY_MARKER}\nError: connection reset\n");
        assert_eq!(
            classify(ContainerState::Running, &logs),
            Readiness::Failed(FailureReason::Generic)
        );
    }

    #[test]
    fn plain_422_without_branches_url_is_generic_at_most() {
        let logs = "422 Client Error: Unprocessable Entity for url: /endpoints\n";
        // "Client Error:" still carries the generic marker, but not the quota signature.
        assert_eq!(
            classify(ContainerState::Running, logs),
            Readiness::Failed(FailureReason::Generic)
        );
    }

    #[test]
    fn last_error_line_picks_most_recent() {
        let logs = "Error: first\ninfo\nError: second\n";
        assert_eq!(last_error_line(logs), "Error: second");
    }
}
