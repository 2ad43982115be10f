//! Shared test doubles: a scripted container runtime and in-memory stores.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use neon_local_proxy::{
    AuthApi, ContainerRuntime, ContainerSpec, ContainerState, RegistryCredential, Result,
    SessionToken, SettingsStore, TokenStore,
};

/// Container runtime whose observations are scripted per call. Queues are
/// consumed front to back; when a queue runs dry the final value repeats.
pub struct FakeRuntime {
    states: Mutex<VecDeque<ContainerState>>,
    final_state: Mutex<ContainerState>,
    logs: Mutex<VecDeque<String>>,
    final_logs: Mutex<String>,
    events: Mutex<Vec<String>>,
    /// Written when `run` is called, simulating the container producing the
    /// handoff file after startup.
    handoff_on_run: Mutex<Option<(PathBuf, String)>>,
    image_present: Mutex<bool>,
    env_vars: Mutex<Vec<(String, String)>>,
}

impl FakeRuntime {
    pub fn new() -> FakeRuntime {
        FakeRuntime {
            states: Mutex::new(VecDeque::new()),
            final_state: Mutex::new(ContainerState::Absent),
            logs: Mutex::new(VecDeque::new()),
            final_logs: Mutex::new(String::new()),
            events: Mutex::new(Vec::new()),
            handoff_on_run: Mutex::new(None),
            image_present: Mutex::new(true),
            env_vars: Mutex::new(Vec::new()),
        }
    }

    pub fn set_container_env(&self, vars: &[(&str, &str)]) {
        *self.env_vars.lock().unwrap() = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
    }

    pub fn script_states(&self, states: &[ContainerState]) {
        let mut queue = self.states.lock().unwrap();
        queue.clear();
        queue.extend(states.iter().copied());
        if let Some(last) = states.last() {
            *self.final_state.lock().unwrap() = *last;
        }
    }

    pub fn script_logs(&self, logs: &[&str]) {
        let mut queue = self.logs.lock().unwrap();
        queue.clear();
        queue.extend(logs.iter().map(|s| s.to_string()));
        if let Some(last) = logs.last() {
            *self.final_logs.lock().unwrap() = last.to_string();
        }
    }

    pub fn write_handoff_on_run(&self, path: PathBuf, contents: &str) {
        *self.handoff_on_run.lock().unwrap() = Some((path, contents.to_string()));
    }

    pub fn set_image_present(&self, present: bool) {
        *self.image_present.lock().unwrap() = present;
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }
}

impl ContainerRuntime for FakeRuntime {
    fn state(&self, _name: &str) -> Result<ContainerState> {
        let mut queue = self.states.lock().unwrap();
        Ok(queue
            .pop_front()
            .unwrap_or(*self.final_state.lock().unwrap()))
    }

    fn logs_tail(&self, _name: &str, _lines: usize) -> Result<String> {
        let mut queue = self.logs.lock().unwrap();
        Ok(queue
            .pop_front()
            .unwrap_or_else(|| self.final_logs.lock().unwrap().clone()))
    }

    fn run(&self, spec: &ContainerSpec) -> Result<()> {
        self.record(format!("run:{}", spec.name));
        if let Some((path, contents)) = self.handoff_on_run.lock().unwrap().clone() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, contents)?;
        }
        Ok(())
    }

    fn stop(&self, name: &str, _grace: Duration) -> Result<()> {
        self.record(format!("stop:{name}"));
        Ok(())
    }

    fn remove(&self, name: &str, force: bool) -> Result<()> {
        self.record(format!("remove:{name}:force={force}"));
        Ok(())
    }

    fn image_exists(&self, _image: &str) -> Result<bool> {
        Ok(*self.image_present.lock().unwrap())
    }

    fn image_digest(&self, _image: &str) -> Result<Option<String>> {
        Ok(Some("sha256:fake".to_string()))
    }

    fn pull(&self, image: &str, _auth: Option<&RegistryCredential>) -> Result<()> {
        self.record(format!("pull:{image}"));
        Ok(())
    }

    fn container_env(&self, name: &str) -> Result<Vec<(String, String)>> {
        self.record(format!("env:{name}"));
        Ok(self.env_vars.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    map: Mutex<BTreeMap<String, String>>,
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

pub struct StaticTokenStore {
    pub persistent: Option<String>,
}

impl TokenStore for StaticTokenStore {
    fn persistent_token(&self) -> Option<String> {
        self.persistent.clone()
    }
    fn session_token(&self) -> Option<SessionToken> {
        None
    }
    fn save_session(&self, _session: &SessionToken) {}
    fn clear_session(&self) {}
}

pub struct RefusingApi;

impl AuthApi for RefusingApi {
    fn refresh(&self, _refresh_token: &str) -> std::result::Result<SessionToken, String> {
        Err("refresh unavailable in tests".to_string())
    }
}
