use clap::{Parser, Subcommand};

use crate::spec::Driver;

#[derive(Copy, Clone, PartialEq, Eq, Debug, clap::ValueEnum)]
pub enum DriverArg {
    Postgres,
    Serverless,
}

impl From<DriverArg> for Driver {
    fn from(arg: DriverArg) -> Driver {
        match arg {
            DriverArg::Postgres => Driver::Postgres,
            DriverArg::Serverless => Driver::Serverless,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "neon-local-proxy",
    version,
    about = "Manage the local Neon proxy container"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the proxy container and wait until it accepts connections
    Start {
        /// Project id the branch belongs to
        #[arg(long = "project")]
        project: String,
        /// Attach to this existing branch
        #[arg(long = "branch", conflicts_with = "parent_branch")]
        branch: Option<String>,
        /// Create an ephemeral branch under this parent (requires an API key)
        #[arg(long = "parent-branch")]
        parent_branch: Option<String>,
        /// Driver mode presented to the application
        #[arg(long = "driver", value_enum, default_value = "postgres")]
        driver: DriverArg,
        /// Host port to bind the proxy on
        #[arg(long = "port", default_value_t = 5432)]
        port: u16,
        /// Remove the container when the branch limit is hit instead of
        /// leaving it for log inspection
        #[arg(long = "cleanup-on-branch-limit")]
        cleanup_on_branch_limit: bool,
    },
    /// Stop and remove the proxy container
    Stop,
    /// Report whether the proxy container is running
    Status,
    /// Show branch/project/driver recovered from the running container
    Info,
}
