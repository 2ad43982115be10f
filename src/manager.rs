//! Proxy container lifecycle orchestration.
//!
//! One proxy container exists at a time, under a fixed name. An in-process
//! mutex serializes `start`/`stop`, and an exclusive lock file in the state
//! directory keeps a second process from claiming the slot.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fs2::FileExt;
use tracing::{debug, info, warn};

use crate::credentials::{AuthApi, CredentialResolver, TokenStore};
use crate::errors::{ProxyError, Result};
use crate::handoff::BranchHandoffChannel;
use crate::image::ImageUpdateChecker;
use crate::monitor::StatusMonitor;
use crate::readiness;
use crate::runtime::{ContainerRuntime, ContainerState};
use crate::spec::{
    self, BranchTarget, ContainerSpec, Driver, ENV_BRANCH_ID, ENV_DRIVER, ENV_PARENT_BRANCH_ID,
    ENV_PROJECT_ID,
};
use crate::store::{SettingsStore, KEY_PROXY_RUNNING, KEY_SELECTED_BRANCH, KEY_SELECTED_DRIVER};

pub const DEFAULT_IMAGE: &str = "neondatabase/neon_local:latest";
pub const CONTAINER_NAME: &str = "neon-local-proxy";

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub image: String,
    pub container_name: String,
    pub state_dir: PathBuf,
    pub readiness_timeout: Duration,
    pub readiness_interval: Duration,
    pub handoff_timeout: Duration,
    pub handoff_interval: Duration,
    pub monitor_interval: Duration,
    pub stop_grace: Duration,
    /// Whether a branch-limit failure removes the container. Off by default
    /// so its logs stay available for inspection.
    pub cleanup_on_branch_limit: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        let image =
            std::env::var("NEON_PROXY_IMAGE").unwrap_or_else(|_| DEFAULT_IMAGE.to_string());
        let state_dir = home::home_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(".neon-local-proxy");
        ManagerConfig {
            image,
            container_name: CONTAINER_NAME.to_string(),
            state_dir,
            readiness_timeout: Duration::from_secs(30),
            readiness_interval: Duration::from_secs(1),
            handoff_timeout: Duration::from_secs(30),
            handoff_interval: Duration::from_secs(1),
            monitor_interval: Duration::from_secs(5),
            stop_grace: Duration::from_secs(20),
            cleanup_on_branch_limit: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StartOptions {
    pub target: BranchTarget,
    pub driver: Driver,
    pub project_id: String,
    pub port: u16,
}

/// Successful startup result. The branch id is the concrete one: for
/// ephemeral targets it comes from the handoff file, never the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedProxy {
    pub branch_id: String,
    pub port: u16,
}

impl StartedProxy {
    pub fn connection_string(&self, database: &str) -> String {
        spec::connection_string(self.port, database)
    }
}

/// Container facts recovered from a live container's environment, used to
/// restore manager state after a host-process restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub branch_id: String,
    pub project_id: String,
    pub driver: Driver,
    /// True when the recovered id is a parent branch (ephemeral mode).
    pub is_parent_branch: bool,
}

/// Exclusive lock file marking this process as the slot owner. Unlocked and
/// removed on drop.
struct SlotLock {
    file: File,
    path: PathBuf,
}

impl Drop for SlotLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
        let _ = fs::remove_file(&self.path);
    }
}

fn acquire_slot_lock(path: &PathBuf) -> Result<SlotLock> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(SlotLock {
            file,
            path: path.clone(),
        }),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(ProxyError::ContainerFailed(
            "another proxy manager already owns the container slot".to_string(),
        )),
        Err(e) => Err(e.into()),
    }
}

pub struct ContainerLifecycleManager {
    config: ManagerConfig,
    runtime: Arc<dyn ContainerRuntime + Send + Sync>,
    store: Arc<dyn SettingsStore>,
    tokens: Arc<dyn TokenStore>,
    auth: Arc<dyn AuthApi>,
    // Serializes start/stop; resolves the historical start-vs-stop race.
    lifecycle: Mutex<()>,
    monitor: Mutex<Option<StatusMonitor>>,
    _slot: SlotLock,
}

impl ContainerLifecycleManager {
    pub fn new(
        config: ManagerConfig,
        runtime: Arc<dyn ContainerRuntime + Send + Sync>,
        store: Arc<dyn SettingsStore>,
        tokens: Arc<dyn TokenStore>,
        auth: Arc<dyn AuthApi>,
    ) -> Result<ContainerLifecycleManager> {
        let slot = acquire_slot_lock(&config.state_dir.join("manager.lock"))?;
        Ok(ContainerLifecycleManager {
            config,
            runtime,
            store,
            tokens,
            auth,
            lifecycle: Mutex::new(()),
            monitor: Mutex::new(None),
            _slot: slot,
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    fn handoff_dir(&self) -> PathBuf {
        self.config.state_dir.join("handoff")
    }

    fn handoff(&self) -> BranchHandoffChannel {
        BranchHandoffChannel::new(&self.handoff_dir())
    }

    /// Start the proxy container and wait until it is usable.
    pub fn start(&self, options: &StartOptions) -> Result<StartedProxy> {
        let _guard = self.lifecycle.lock().map_err(poisoned)?;

        let handoff_dir = self.handoff_dir();
        fs::create_dir_all(&handoff_dir)?;
        let handoff = BranchHandoffChannel::new(&handoff_dir);

        // Credential failures propagate before the runtime is touched.
        let resolver = CredentialResolver::new(&*self.tokens, &*self.auth);
        let credential = resolver.resolve(options.target.is_existing())?;

        // Best-effort: a failed update check never blocks startup.
        let checker = ImageUpdateChecker::new(&self.config.state_dir, &self.config.image);
        match checker.check_and_maybe_update(&*self.runtime) {
            Ok(outcome) => debug!(?outcome, "image update check"),
            Err(e) => warn!(error = %e, "image update check failed; continuing with local image"),
        }

        let container_spec = ContainerSpec::new(
            &self.config.image,
            &self.config.container_name,
            &options.target,
            options.driver,
            credential.token(),
            &options.project_id,
            options.port,
            &handoff_dir,
        );

        self.evict_previous(&handoff)?;

        info!(
            container = %self.config.container_name,
            driver = options.driver.as_str(),
            port = options.port,
            "starting proxy container"
        );
        self.runtime.run(&container_spec)?;

        if let Err(e) = readiness::wait_ready(
            &*self.runtime,
            &self.config.container_name,
            self.config.readiness_timeout,
            self.config.readiness_interval,
        ) {
            if matches!(e, ProxyError::BranchLimitExceeded) && self.config.cleanup_on_branch_limit {
                self.cleanup_best_effort(&handoff);
            }
            // Otherwise the container is deliberately left for inspection.
            return Err(e);
        }

        let branch_id = match &options.target {
            BranchTarget::Existing(id) => id.clone(),
            BranchTarget::Ephemeral { .. } => {
                // No usable branch id means the startup failed, running
                // container or not.
                handoff.wait_for(self.config.handoff_timeout, self.config.handoff_interval)?
            }
        };

        self.store.set(KEY_PROXY_RUNNING, "true");
        self.store.set(KEY_SELECTED_BRANCH, &branch_id);
        self.store.set(KEY_SELECTED_DRIVER, options.driver.as_str());

        let monitor = StatusMonitor::spawn(
            Arc::clone(&self.runtime),
            Arc::clone(&self.store),
            handoff,
            self.config.container_name.clone(),
            self.config.monitor_interval,
        );
        if let Ok(mut slot) = self.monitor.lock() {
            if let Some(mut previous) = slot.replace(monitor) {
                previous.stop();
            }
        }

        info!(branch_id = %branch_id, port = options.port, "proxy ready");
        Ok(StartedProxy {
            branch_id,
            port: options.port,
        })
    }

    /// Stop and remove the proxy container. Idempotent: an absent container
    /// is success, and all local state is cleared either way. The last
    /// selected branch/driver survive for the next session.
    pub fn stop(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().map_err(poisoned)?;
        self.stop_monitor();

        let name = &self.config.container_name;
        let result = match self.runtime.state(name)? {
            ContainerState::Absent => Ok(()),
            _ => self
                .runtime
                .stop(name, self.config.stop_grace)
                .and_then(|()| self.runtime.remove(name, true)),
        };

        // File state never outlives the container, even on a failed stop.
        self.handoff().delete();
        if result.is_ok() {
            self.store.remove(KEY_PROXY_RUNNING);
            debug!(container = %name, "proxy container stopped");
        }
        result
    }

    /// Recover branch/project/driver facts from the live container's
    /// environment. This is how state is restored after an IDE restart.
    pub fn container_info(&self) -> Result<ContainerInfo> {
        let name = &self.config.container_name;
        let env = self.runtime.container_env(name)?;
        let lookup = |key: &str| {
            env.iter()
                .find(|(k, _)| k.as_str() == key)
                .map(|(_, v)| v.clone())
        };

        let (branch_id, is_parent_branch) = match lookup(ENV_BRANCH_ID) {
            Some(id) => (id, false),
            None => match lookup(ENV_PARENT_BRANCH_ID) {
                Some(id) => (id, true),
                None => return Err(ProxyError::NotFound(format!("{name}: no branch id"))),
            },
        };
        let project_id = lookup(ENV_PROJECT_ID)
            .ok_or_else(|| ProxyError::NotFound(format!("{name}: no project id")))?;
        let driver = lookup(ENV_DRIVER)
            .and_then(|d| Driver::parse(&d))
            .ok_or_else(|| ProxyError::NotFound(format!("{name}: no driver")))?;

        Ok(ContainerInfo {
            branch_id,
            project_id,
            driver,
            is_parent_branch,
        })
    }

    /// Whether the settings store believes the proxy is up.
    pub fn is_marked_running(&self) -> bool {
        self.store.get(KEY_PROXY_RUNNING).as_deref() == Some("true")
    }

    fn stop_monitor(&self) {
        if let Ok(mut slot) = self.monitor.lock() {
            if let Some(mut monitor) = slot.take() {
                monitor.stop();
            }
        }
    }

    /// Remove any container already occupying the fixed name, plus any stale
    /// handoff file, so the new container starts from a clean slot.
    fn evict_previous(&self, handoff: &BranchHandoffChannel) -> Result<()> {
        let name = &self.config.container_name;
        match self.runtime.state(name)? {
            ContainerState::Absent => {}
            state => {
                info!(container = %name, ?state, "removing previous proxy container");
                // Give it a short stop; force-remove regardless.
                let _ = self.runtime.stop(name, Duration::from_secs(1));
                self.runtime.remove(name, true)?;
            }
        }
        handoff.delete();
        Ok(())
    }

    fn cleanup_best_effort(&self, handoff: &BranchHandoffChannel) {
        let name = &self.config.container_name;
        let _ = self.runtime.stop(name, Duration::from_secs(1));
        let _ = self.runtime.remove(name, true);
        handoff.delete();
    }
}

impl Drop for ContainerLifecycleManager {
    fn drop(&mut self) {
        self.stop_monitor();
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> ProxyError {
    ProxyError::ContainerFailed("lifecycle lock poisoned".to_string())
}
