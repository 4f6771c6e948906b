use std::path::PathBuf;

use clap::{ArgAction, Args as ClapArgs, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "fleetctl",
    version,
    about = "Deploy and supervise the trading fleet on its remote host"
)]
pub(crate) struct Args {
    #[command(flatten)]
    pub(crate) global: GlobalArgs,
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(ClapArgs, Debug, Clone)]
pub(crate) struct GlobalArgs {
    /// TOML config file; `fleet.toml` in the working directory is used when present.
    #[arg(long, global = true, env = "FLEET_CONFIG")]
    pub(crate) config: Option<PathBuf>,
    #[arg(
        long,
        global = true,
        env = "FLEET_STATE_FILE",
        default_value = ".fleet/deployment.state"
    )]
    pub(crate) state_file: PathBuf,
    /// Database URL as seen from the remote host.
    #[arg(
        long,
        global = true,
        env = "FLEET_REMOTE_DATABASE_URL",
        hide_env_values = true
    )]
    pub(crate) remote_database_url: Option<String>,
    #[arg(long, global = true, env = "FLEET_SSH_USER")]
    pub(crate) ssh_user: Option<String>,
    /// Repeat for more detail on stderr (-v info, -vv debug).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub(crate) verbose: u8,
    #[arg(long, global = true, default_value_t = false)]
    pub(crate) no_color: bool,
    #[arg(long, global = true, default_value_t = false)]
    pub(crate) no_audit_log: bool,
    #[arg(long, global = true, default_value = "~/.fleetctl/logs", hide = true)]
    pub(crate) audit_dir: String,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Show every service's state plus host counters in one round trip.
    Status {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Print the tail of a service log, follow it, or copy it locally.
    Logs {
        service: String,
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,
        #[arg(short, long, default_value_t = false)]
        follow: bool,
        #[arg(long, value_name = "PATH", conflicts_with = "follow")]
        save: Option<PathBuf>,
    },
    /// Start a service; arguments after the name replace its defaults.
    Start(LaunchArgs),
    Stop {
        service: String,
    },
    Restart(LaunchArgs),
    StopAll,
    /// Build, replace the remote artifact, migrate and restart continuous services.
    Redeploy {
        #[arg(long, default_value_t = false)]
        skip_build: bool,
    },
    /// Apply pending schema migrations on the remote database.
    Migrate,
    /// Open a shell on the host, or run one command there.
    Ssh {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Open psql against the remote database.
    Db {
        #[arg(short = 'c', long = "command", value_name = "SQL")]
        sql: Option<String>,
    },
    /// Record a freshly provisioned host once it answers over SSH.
    Init(InitArgs),
    /// Stop everything that still answers, then forget the deployment.
    Teardown,
}

#[derive(ClapArgs, Debug)]
pub(crate) struct LaunchArgs {
    pub(crate) service: String,
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub(crate) args: Vec<String>,
}

#[derive(ClapArgs, Debug)]
pub(crate) struct InitArgs {
    #[arg(long)]
    pub(crate) host: String,
    /// SSH identity file for the host.
    #[arg(long)]
    pub(crate) key: String,
    #[arg(long, default_value = "none")]
    pub(crate) network_group: String,
    #[arg(long, default_value = "none")]
    pub(crate) allocation: String,
    #[arg(long, default_value = "none")]
    pub(crate) region: String,
    #[arg(long, default_value = "on-demand")]
    pub(crate) market_type: String,
    /// Record the host without waiting for SSH to answer.
    #[arg(long, default_value_t = false)]
    pub(crate) no_wait: bool,
}

impl Command {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Command::Status { .. } => "status",
            Command::Logs { .. } => "logs",
            Command::Start(_) => "start",
            Command::Stop { .. } => "stop",
            Command::Restart(_) => "restart",
            Command::StopAll => "stop-all",
            Command::Redeploy { .. } => "redeploy",
            Command::Migrate => "migrate",
            Command::Ssh { .. } => "ssh",
            Command::Db { .. } => "db",
            Command::Init(_) => "init",
            Command::Teardown => "teardown",
        }
    }
}
