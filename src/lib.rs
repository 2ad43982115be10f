//! Host-side lifecycle manager for the Neon Local proxy container.
//!
//! The proxy container bridges local application connections to a remote
//! database branch. This crate starts it, decides when it is usable (log
//! readiness markers plus a file-based branch handoff), watches it for
//! unexpected death, and tears it down, with bounded timeouts and defined
//! cleanup on every failure path. All container interaction goes through the
//! `docker` CLI; control-plane auth and secret storage are injected at trait
//! seams.

pub mod cli;
pub mod credentials;
pub mod errors;
pub mod exec;
pub mod handoff;
pub mod image;
pub mod manager;
pub mod monitor;
pub mod readiness;
pub mod runtime;
pub mod spec;
pub mod store;

pub use credentials::{
    resolve_registry_credential, AuthApi, Credential, CredentialResolver, RegistryCredential,
    SessionToken, TokenStore,
};
pub use errors::{exit_code_for_error, ProxyError, Result};
pub use handoff::BranchHandoffChannel;
pub use image::{ImageCheckOutcome, ImageUpdateChecker};
pub use manager::{
    ContainerInfo, ContainerLifecycleManager, ManagerConfig, StartOptions, StartedProxy,
    CONTAINER_NAME, DEFAULT_IMAGE,
};
pub use monitor::StatusMonitor;
pub use readiness::{classify, FailureReason, Readiness, READY_MARKER};
pub use runtime::{container_runtime_path, ContainerRuntime, ContainerState, DockerCli};
pub use spec::{connection_string, BranchTarget, ContainerSpec, Driver};
pub use store::{FileSettingsStore, SettingsStore};
