//! Container runtime abstraction and its Docker CLI implementation.
//!
//! The trait seam exists so readiness and lifecycle logic can be exercised
//! against scripted fakes; `DockerCli` is the only production implementation.

use std::env;
use std::io;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use tracing::debug;
use which::which;

use crate::credentials::RegistryCredential;
use crate::errors::{ProxyError, Result};
use crate::spec::ContainerSpec;

/// Runtime-reported container state; queried fresh on every check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Absent,
    Created,
    Running,
    Stopped,
}

pub trait ContainerRuntime {
    fn state(&self, name: &str) -> Result<ContainerState>;
    /// Most recent log lines (stdout+stderr combined) of the container.
    fn logs_tail(&self, name: &str, lines: usize) -> Result<String>;
    /// Create and start a detached container described by a `ContainerSpec`.
    fn run(&self, spec: &ContainerSpec) -> Result<()>;
    /// Stop with a grace period. Absent containers are not an error here;
    /// callers decide what not-found means on their path.
    fn stop(&self, name: &str, grace: Duration) -> Result<()>;
    fn remove(&self, name: &str, force: bool) -> Result<()>;
    fn image_exists(&self, image: &str) -> Result<bool>;
    /// Repo digest of the local image, if any.
    fn image_digest(&self, image: &str) -> Result<Option<String>>;
    /// Pull the image, optionally authenticating with a registry credential.
    fn pull(&self, image: &str, auth: Option<&RegistryCredential>) -> Result<()>;
    /// Environment of the container as KEY=VALUE pairs split into tuples.
    fn container_env(&self, name: &str) -> Result<Vec<(String, String)>>;
}

/// Locate the docker binary, honoring the test kill switch.
pub fn container_runtime_path() -> io::Result<PathBuf> {
    if env::var("NEON_PROXY_SKIP_DOCKER").ok().as_deref() == Some("1") {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            "Docker disabled by environment override.",
        ));
    }
    if let Ok(p) = which("docker") {
        return Ok(p);
    }
    Err(io::Error::new(
        io::ErrorKind::NotFound,
        "Docker is required but was not found in PATH.",
    ))
}

#[derive(Debug, Clone)]
pub struct DockerCli {
    program: PathBuf,
}

impl DockerCli {
    pub fn discover() -> Result<DockerCli> {
        Ok(DockerCli {
            program: container_runtime_path()?,
        })
    }

    fn command(&self) -> Command {
        Command::new(&self.program)
    }

    fn output(&self, args: &[&str]) -> Result<std::process::Output> {
        debug!(?args, "docker");
        Ok(self.command().args(args).output()?)
    }
}

fn stderr_says_no_such(output: &std::process::Output) -> bool {
    let stderr = String::from_utf8_lossy(&output.stderr);
    stderr.contains("No such") || stderr.contains("no such")
}

impl ContainerRuntime for DockerCli {
    fn state(&self, name: &str) -> Result<ContainerState> {
        let output = self.output(&[
            "container",
            "inspect",
            "-f",
            "{{.State.Status}}",
            name,
        ])?;
        if !output.status.success() {
            if stderr_says_no_such(&output) {
                return Ok(ContainerState::Absent);
            }
            return Err(ProxyError::ContainerFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        let status = String::from_utf8_lossy(&output.stdout);
        Ok(match status.trim() {
            "running" => ContainerState::Running,
            "created" => ContainerState::Created,
            // paused/restarting/exited/dead all mean "not serving".
            _ => ContainerState::Stopped,
        })
    }

    fn logs_tail(&self, name: &str, lines: usize) -> Result<String> {
        let tail = lines.to_string();
        let output = self.output(&["logs", "--tail", &tail, name])?;
        if !output.status.success() {
            if stderr_says_no_such(&output) {
                return Err(ProxyError::NotFound(name.to_string()));
            }
            return Err(ProxyError::ContainerFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        // docker interleaves container stderr into our stderr stream.
        let mut logs = String::from_utf8_lossy(&output.stdout).into_owned();
        logs.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(logs)
    }

    fn run(&self, spec: &ContainerSpec) -> Result<()> {
        debug!(preview = %spec.preview(), "starting proxy container");
        let args = spec.run_args();
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.output(&arg_refs)?;
        if !output.status.success() {
            return Err(ProxyError::ContainerFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    fn stop(&self, name: &str, grace: Duration) -> Result<()> {
        let secs = grace.as_secs().to_string();
        let output = self.output(&["stop", "--time", &secs, name])?;
        if !output.status.success() && !stderr_says_no_such(&output) {
            return Err(ProxyError::ContainerFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    fn remove(&self, name: &str, force: bool) -> Result<()> {
        let mut args = vec!["rm"];
        if force {
            args.push("-f");
        }
        args.push(name);
        let output = self.output(&args)?;
        if !output.status.success() && !stderr_says_no_such(&output) {
            return Err(ProxyError::ContainerFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    fn image_exists(&self, image: &str) -> Result<bool> {
        let status = self
            .command()
            .args(["image", "inspect", image])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        Ok(status.success())
    }

    fn image_digest(&self, image: &str) -> Result<Option<String>> {
        let output = self.output(&[
            "image",
            "inspect",
            "-f",
            "{{if .RepoDigests}}{{index .RepoDigests 0}}{{end}}",
            image,
        ])?;
        if !output.status.success() {
            return Ok(None);
        }
        let digest = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(if digest.is_empty() { None } else { Some(digest) })
    }

    fn pull(&self, image: &str, auth: Option<&RegistryCredential>) -> Result<()> {
        // Authenticated pulls go through a throwaway docker config dir so the
        // user's login state is never touched.
        let scratch;
        let mut cmd = self.command();
        if let Some(cred) = auth {
            scratch = crate::credentials::write_scratch_docker_config(cred)?;
            cmd.env("DOCKER_CONFIG", scratch.path());
        }
        let output = cmd.args(["pull", image]).output()?;
        if !output.status.success() {
            return Err(ProxyError::ContainerFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    fn container_env(&self, name: &str) -> Result<Vec<(String, String)>> {
        let output = self.output(&[
            "container",
            "inspect",
            "-f",
            "{{json .Config.Env}}",
            name,
        ])?;
        if !output.status.success() {
            if stderr_says_no_such(&output) {
                return Err(ProxyError::NotFound(name.to_string()));
            }
            return Err(ProxyError::ContainerFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        let raw = String::from_utf8_lossy(&output.stdout);
        parse_env_json(raw.trim())
    }
}

// docker renders an empty env as `null`, not `[]`.
fn parse_env_json(raw: &str) -> Result<Vec<(String, String)>> {
    let entries = serde_json::from_str::<Option<Vec<String>>>(raw)?.unwrap_or_default();
    Ok(entries
        .into_iter()
        .filter_map(|kv| {
            kv.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect())
}
