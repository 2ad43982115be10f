use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use neon_local_proxy::cli::{Cli, Command};
use neon_local_proxy::{
    exit_code_for_error, AuthApi, BranchTarget, ContainerLifecycleManager, ContainerState,
    DockerCli, FileSettingsStore, ManagerConfig, ProxyError, SessionToken, StartOptions,
    TokenStore,
};

/// Token store for CLI use: a persistent API key from the environment, no
/// session mode. The IDE integration supplies its own secure store instead.
struct EnvTokenStore;

impl TokenStore for EnvTokenStore {
    fn persistent_token(&self) -> Option<String> {
        std::env::var("NEON_API_KEY").ok().filter(|t| !t.is_empty())
    }
    fn session_token(&self) -> Option<SessionToken> {
        None
    }
    fn save_session(&self, _session: &SessionToken) {}
    fn clear_session(&self) {}
}

/// The CLI has no browser sign-in flow, so refresh is always unavailable.
struct NoRefreshApi;

impl AuthApi for NoRefreshApi {
    fn refresh(&self, _refresh_token: &str) -> Result<SessionToken, String> {
        Err("session refresh is not available from the CLI".to_string())
    }
}

fn run(cli: Cli) -> Result<(), ProxyError> {
    let config = match &cli.command {
        Command::Start {
            cleanup_on_branch_limit,
            ..
        } => ManagerConfig {
            cleanup_on_branch_limit: *cleanup_on_branch_limit,
            ..ManagerConfig::default()
        },
        _ => ManagerConfig::default(),
    };

    let runtime = Arc::new(DockerCli::discover()?);
    let store = Arc::new(FileSettingsStore::open(
        &config.state_dir.join("settings.json"),
    )?);
    let manager = ContainerLifecycleManager::new(
        config,
        runtime.clone(),
        store,
        Arc::new(EnvTokenStore),
        Arc::new(NoRefreshApi),
    )?;

    match cli.command {
        Command::Start {
            project,
            branch,
            parent_branch,
            driver,
            port,
            ..
        } => {
            let target = match (branch, parent_branch) {
                (Some(id), None) => BranchTarget::Existing(id),
                (None, Some(parent)) => BranchTarget::Ephemeral { parent },
                (None, None) => {
                    eprintln!("one of --branch or --parent-branch is required");
                    return Err(ProxyError::NotFound("branch target".to_string()));
                }
                (Some(_), Some(_)) => unreachable!("clap rejects conflicting flags"),
            };
            let started = manager.start(&StartOptions {
                target,
                driver: driver.into(),
                project_id: project,
                port,
            })?;
            println!("proxy ready on branch {}", started.branch_id);
            println!("  {}", started.connection_string("<database>"));
            Ok(())
        }
        Command::Stop => {
            manager.stop()?;
            println!("proxy stopped");
            Ok(())
        }
        Command::Status => {
            use neon_local_proxy::ContainerRuntime;
            let state = runtime.state(&manager.config().container_name)?;
            match state {
                ContainerState::Running => println!("running"),
                ContainerState::Absent => println!("not created"),
                _ => println!("not running"),
            }
            Ok(())
        }
        Command::Info => {
            let info = manager.container_info()?;
            let branch_kind = if info.is_parent_branch {
                "parent branch"
            } else {
                "branch"
            };
            println!("project: {}", info.project_id);
            println!("{}: {}", branch_kind, info.branch_id);
            println!("driver: {}", info.driver.as_str());
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(exit_code_for_error(&e))
        }
    }
}
