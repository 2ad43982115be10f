//! Background liveness monitor for the running proxy container.
//!
//! One fixed-interval check: if the container is no longer running, clear the
//! proxy-running flag, delete the handoff file, and stop. Death is terminal
//! here; the monitor never restarts the container.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::handoff::BranchHandoffChannel;
use crate::runtime::{ContainerRuntime, ContainerState};
use crate::store::{SettingsStore, KEY_PROXY_RUNNING};

pub struct StatusMonitor {
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl StatusMonitor {
    /// Spawn the polling thread. `interval` is also the shutdown latency, so
    /// ticks are sliced into short sleeps to keep `stop()` prompt.
    pub fn spawn(
        runtime: Arc<dyn ContainerRuntime + Send + Sync>,
        store: Arc<dyn SettingsStore>,
        handoff: BranchHandoffChannel,
        container_name: String,
        interval: Duration,
    ) -> StatusMonitor {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop_flag);
        let handle = thread::spawn(move || {
            monitor_loop(&*runtime, &*store, &handoff, &container_name, interval, &flag);
        });
        StatusMonitor {
            stop_flag,
            handle: Some(handle),
        }
    }

    /// Signal the thread and wait for it to exit.
    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StatusMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn monitor_loop(
    runtime: &dyn ContainerRuntime,
    store: &dyn SettingsStore,
    handoff: &BranchHandoffChannel,
    container_name: &str,
    interval: Duration,
    stop_flag: &AtomicBool,
) {
    const SLICE: Duration = Duration::from_millis(100);
    loop {
        let mut slept = Duration::ZERO;
        while slept < interval {
            if stop_flag.load(Ordering::SeqCst) {
                return;
            }
            thread::sleep(SLICE);
            slept += SLICE;
        }

        match runtime.state(container_name) {
            Ok(ContainerState::Running) => {}
            Ok(state) => {
                warn!(container = container_name, ?state, "proxy container died");
                store.remove(KEY_PROXY_RUNNING);
                handoff.delete();
                return;
            }
            Err(e) => {
                // A transient inspect failure is not evidence of death.
                debug!(container = container_name, error = %e, "liveness check failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Result;
    use crate::spec::ContainerSpec;
    use std::sync::Mutex;

    struct ScriptedRuntime {
        states: Mutex<Vec<ContainerState>>,
    }

    impl ScriptedRuntime {
        fn new(mut states: Vec<ContainerState>) -> ScriptedRuntime {
            states.reverse();
            ScriptedRuntime {
                states: Mutex::new(states),
            }
        }
    }

    impl ContainerRuntime for ScriptedRuntime {
        fn state(&self, _name: &str) -> Result<ContainerState> {
            let mut states = self.states.lock().unwrap();
            Ok(states.pop().unwrap_or(ContainerState::Absent))
        }
        fn logs_tail(&self, _name: &str, _lines: usize) -> Result<String> {
            Ok(String::new())
        }
        fn run(&self, _spec: &ContainerSpec) -> Result<()> {
            Ok(())
        }
        fn stop(&self, _name: &str, _grace: Duration) -> Result<()> {
            Ok(())
        }
        fn remove(&self, _name: &str, _force: bool) -> Result<()> {
            Ok(())
        }
        fn image_exists(&self, _image: &str) -> Result<bool> {
            Ok(true)
        }
        fn image_digest(&self, _image: &str) -> Result<Option<String>> {
            Ok(None)
        }
        fn pull(
            &self,
            _image: &str,
            _auth: Option<&crate::credentials::RegistryCredential>,
        ) -> Result<()> {
            Ok(())
        }
        fn container_env(&self, _name: &str) -> Result<Vec<(String, String)>> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        map: Mutex<std::collections::BTreeMap<String, String>>,
    }

    impl SettingsStore for MemoryStore {
        fn get(&self, key: &str) -> Option<String> {
            self.map.lock().unwrap().get(key).cloned()
        }
        fn set(&self, key: &str, value: &str) {
            self.map
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_string());
        }
        fn remove(&self, key: &str) {
            self.map.lock().unwrap().remove(key);
        }
    }

    #[test]
    fn death_clears_state_and_handoff_then_exits() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let handoff = BranchHandoffChannel::new(dir.path());
        std::fs::write(handoff.path(), r#"{"k":{"branch_id":"br_1"}}"#).expect("write");

        let store: Arc<dyn SettingsStore> = Arc::new(MemoryStore::default());
        store.set(KEY_PROXY_RUNNING, "true");

        let runtime: Arc<dyn ContainerRuntime + Send + Sync> = Arc::new(ScriptedRuntime::new(
            vec![ContainerState::Running, ContainerState::Stopped],
        ));

        let mut monitor = StatusMonitor::spawn(
            Arc::clone(&runtime),
            Arc::clone(&store),
            handoff.clone(),
            "neon-local-proxy".into(),
            Duration::from_millis(100),
        );

        // Two ticks: running, then dead. Give it time to observe both.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while store.get(KEY_PROXY_RUNNING).is_some() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }

        assert_eq!(store.get(KEY_PROXY_RUNNING), None);
        assert!(!handoff.path().exists());
        monitor.stop();
    }

    #[test]
    fn stop_joins_promptly_while_container_is_healthy() {
        let runtime: Arc<dyn ContainerRuntime + Send + Sync> = Arc::new(ScriptedRuntime::new(
            vec![ContainerState::Running; 1000],
        ));
        let store: Arc<dyn SettingsStore> = Arc::new(MemoryStore::default());
        let dir = tempfile::tempdir().expect("tmpdir");
        let mut monitor = StatusMonitor::spawn(
            runtime,
            store,
            BranchHandoffChannel::new(dir.path()),
            "neon-local-proxy".into(),
            Duration::from_secs(5),
        );
        let started = std::time::Instant::now();
        monitor.stop();
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
