//! Credential resolution: API tokens for the container environment and
//! registry credentials for image pulls.
//!
//! Two auth modes exist. A persistent API token always wins, for every
//! operation. A refreshable session token can only attach to existing
//! branches; the container cannot create ephemeral branches with it.
//! Registry-credential discovery is strictly best-effort: any failure
//! degrades to an anonymous pull.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::Deserialize;
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::errors::{ProxyError, Result};
use crate::exec::run_captured;

/// Registry hosts the proxy image may be pulled from, in lookup order.
const KNOWN_REGISTRY_HOSTS: &[&str] = &[
    "https://index.docker.io/v1/",
    "index.docker.io",
    "registry-1.docker.io",
    "docker.io",
];

/// Refresh sessions this close to expiry.
const REFRESH_SKEW: Duration = Duration::from_secs(60);
/// Credential helpers are external executables; never wait longer than this.
const HELPER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// Long-lived personal API token.
    Persistent(String),
    /// OAuth-style session; cannot create ephemeral branches.
    Session { access: String },
}

impl Credential {
    /// Token value to place in the container environment.
    pub fn token(&self) -> &str {
        match self {
            Credential::Persistent(t) => t,
            Credential::Session { access } => access,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    pub access: String,
    pub refresh: String,
    pub expires_at: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryCredential {
    pub username: String,
    pub secret: String,
}

/// Secure key-value storage for tokens (the IDE's credential store).
pub trait TokenStore: Send + Sync {
    fn persistent_token(&self) -> Option<String>;
    fn session_token(&self) -> Option<SessionToken>;
    fn save_session(&self, session: &SessionToken);
    /// Sign the user out.
    fn clear_session(&self);
}

/// The slice of the control-plane API this crate needs.
pub trait AuthApi: Send + Sync {
    fn refresh(&self, refresh_token: &str) -> std::result::Result<SessionToken, String>;
}

pub struct CredentialResolver<'a> {
    store: &'a dyn TokenStore,
    api: &'a dyn AuthApi,
}

impl<'a> CredentialResolver<'a> {
    pub fn new(store: &'a dyn TokenStore, api: &'a dyn AuthApi) -> CredentialResolver<'a> {
        CredentialResolver { store, api }
    }

    /// Resolve the credential for a startup. `is_existing_branch` is false
    /// when the container will create an ephemeral branch, which only the
    /// persistent token can authorize.
    pub fn resolve(&self, is_existing_branch: bool) -> Result<Credential> {
        if let Some(token) = self.store.persistent_token() {
            return Ok(Credential::Persistent(token));
        }
        if !is_existing_branch {
            return Err(ProxyError::AuthRequired);
        }
        let Some(session) = self.store.session_token() else {
            return Err(ProxyError::AuthRequired);
        };
        let now = SystemTime::now();
        let near_expiry = session
            .expires_at
            .duration_since(now)
            .map(|left| left < REFRESH_SKEW)
            .unwrap_or(true);
        if !near_expiry {
            return Ok(Credential::Session {
                access: session.access,
            });
        }
        match self.api.refresh(&session.refresh) {
            Ok(fresh) => {
                self.store.save_session(&fresh);
                Ok(Credential::Session {
                    access: fresh.access,
                })
            }
            Err(reason) => {
                warn!(%reason, "session refresh failed; signing out");
                self.store.clear_session();
                Err(ProxyError::AuthExpired)
            }
        }
    }
}

// --- registry credential discovery -----------------------------------------

#[derive(Debug, Deserialize, Default)]
struct DockerConfig {
    #[serde(default)]
    auths: BTreeMap<String, AuthEntry>,
    #[serde(default, rename = "credsStore")]
    creds_store: Option<String>,
    #[serde(default, rename = "credHelpers")]
    cred_helpers: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, Default)]
struct AuthEntry {
    #[serde(default)]
    auth: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HelperOutput {
    #[serde(rename = "Username")]
    username: String,
    #[serde(rename = "Secret")]
    secret: String,
}

fn docker_config_path() -> Option<PathBuf> {
    if let Ok(dir) = env::var("DOCKER_CONFIG") {
        if !dir.trim().is_empty() {
            return Some(PathBuf::from(dir).join("config.json"));
        }
    }
    home::home_dir().map(|h| h.join(".docker").join("config.json"))
}

/// Find a credential for the known registry hosts, or `None` for anonymous
/// pulls. Inline base64 `auths` entries win over helper indirection; every
/// failure along the way is swallowed.
pub fn resolve_registry_credential() -> Option<RegistryCredential> {
    let path = docker_config_path()?;
    let raw = fs::read_to_string(&path).ok()?;
    let config: DockerConfig = serde_json::from_str(&raw).ok()?;

    for host in KNOWN_REGISTRY_HOSTS {
        if let Some(entry) = config.auths.get(*host) {
            if let Some(cred) = entry.auth.as_deref().and_then(decode_inline_auth) {
                debug!(host, "registry credential from inline auths");
                return Some(cred);
            }
        }
    }

    for host in KNOWN_REGISTRY_HOSTS {
        let Some(helper) = config
            .cred_helpers
            .get(*host)
            .or(config.creds_store.as_ref())
        else {
            continue;
        };
        if let Some(cred) = invoke_credential_helper(helper, host) {
            debug!(host, helper, "registry credential from helper");
            return Some(cred);
        }
    }
    None
}

fn decode_inline_auth(auth: &str) -> Option<RegistryCredential> {
    let decoded = BASE64_STANDARD.decode(auth.trim()).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (username, secret) = text.split_once(':')?;
    if username.is_empty() || secret.is_empty() {
        return None;
    }
    Some(RegistryCredential {
        username: username.to_string(),
        secret: secret.to_string(),
    })
}

fn invoke_credential_helper(helper: &str, registry: &str) -> Option<RegistryCredential> {
    let program = format!("docker-credential-{helper}");
    let out = match run_captured(&program, &["get"], Some(registry), HELPER_TIMEOUT) {
        Ok(out) => out,
        Err(e) => {
            debug!(program, error = %e, "credential helper unavailable");
            return None;
        }
    };
    if !out.success {
        debug!(program, stderr = %out.stderr.trim(), "credential helper failed");
        return None;
    }
    let parsed: HelperOutput = serde_json::from_str(out.stdout.trim()).ok()?;
    if parsed.username.is_empty() || parsed.secret.is_empty() {
        return None;
    }
    Some(RegistryCredential {
        username: parsed.username,
        secret: parsed.secret,
    })
}

/// Materialize a throwaway docker config dir holding only this credential,
/// for use via the DOCKER_CONFIG override during a pull.
pub fn write_scratch_docker_config(cred: &RegistryCredential) -> Result<TempDir> {
    let dir = TempDir::new()?;
    let auth = BASE64_STANDARD.encode(format!("{}:{}", cred.username, cred.secret));
    let config = serde_json::json!({
        "auths": { KNOWN_REGISTRY_HOSTS[0]: { "auth": auth } }
    });
    fs::write(
        dir.path().join("config.json"),
        serde_json::to_string(&config)?,
    )?;
    Ok(dir)
}
