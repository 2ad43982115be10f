//! Bounded subprocess execution with captured output.
//!
//! Used for the registry credential helper, which is an arbitrary external
//! executable and must never hang a startup.

use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::time::Duration;

use wait_timeout::ChildExt;

use crate::errors::Result;

#[derive(Debug)]
pub struct CapturedOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Spawn `program` with `args`, write `stdin_data` to its stdin, and wait up
/// to `timeout` for completion. The child is killed on expiry and the call
/// reports failure rather than blocking.
pub fn run_captured(
    program: &str,
    args: &[&str],
    stdin_data: Option<&str>,
    timeout: Duration,
) -> Result<CapturedOutput> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn()?;

    if let Some(data) = stdin_data {
        if let Some(mut stdin) = child.stdin.take() {
            // The helper may exit before reading; a broken pipe is its answer.
            let _ = stdin.write_all(data.as_bytes());
        }
    } else {
        drop(child.stdin.take());
    }

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let status = match child.wait_timeout(timeout)? {
        Some(status) => status,
        None => {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(CapturedOutput {
                success: false,
                stdout: String::new(),
                stderr: format!("{program} timed out after {timeout:?}"),
            });
        }
    };

    let mut stdout = String::new();
    if let Some(ref mut pipe) = stdout_pipe {
        let _ = pipe.read_to_string(&mut stdout);
    }
    let mut stderr = String::new();
    if let Some(ref mut pipe) = stderr_pipe {
        let _ = pipe.read_to_string(&mut stderr);
    }

    Ok(CapturedOutput {
        success: status.success(),
        stdout,
        stderr,
    })
}
