use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use regex::Regex;
use serde::Deserialize;

use crate::errors::MissingSetting;
use crate::registry::{builtin_specs, RemoteLayout, ServiceSpec};

const DEFAULT_CONFIG_FILE: &str = "fleet.toml";
const DEFAULT_REMOTE_USER: &str = "ubuntu";
const DEFAULT_REMOTE_DIR: &str = "/home/ubuntu/algo-trade";
const DEFAULT_ARTIFACT: &str = "algo-trade";
const DEFAULT_BUILD_COMMAND: &str = "cargo build --release --bin algo-trade";
const DEFAULT_BUILD_ARTIFACT: &str = "target/release/algo-trade";
const DEFAULT_MIGRATIONS_DIR: &str = "migrations";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct FleetConfig {
    pub(crate) remote: Option<RemoteConfig>,
    pub(crate) build: Option<BuildConfig>,
    pub(crate) migrations: Option<MigrationsConfig>,
    pub(crate) timing: Option<TimingConfig>,
    pub(crate) status: Option<StatusConfig>,
    pub(crate) redeploy: Option<RedeployConfig>,
    #[serde(default)]
    pub(crate) services: Vec<ServiceConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RemoteConfig {
    pub(crate) user: Option<String>,
    pub(crate) dir: Option<String>,
    pub(crate) artifact: Option<String>,
    pub(crate) database_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct BuildConfig {
    pub(crate) command: Option<String>,
    pub(crate) artifact: Option<String>,
    pub(crate) config_files: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct MigrationsConfig {
    pub(crate) dir: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct TimingConfig {
    pub(crate) start_grace: Option<String>,
    pub(crate) restart_settle: Option<String>,
    pub(crate) stop_timeout: Option<String>,
    pub(crate) ssh_timeout: Option<String>,
    pub(crate) transfer_timeout: Option<String>,
    pub(crate) reachable_interval: Option<String>,
    pub(crate) reachable_attempts: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct StatusConfig {
    pub(crate) tables: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RedeployConfig {
    pub(crate) overrides: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ServiceConfig {
    pub(crate) name: String,
    pub(crate) subcommand: Option<String>,
    pub(crate) args: Option<Vec<String>>,
    pub(crate) auto_restart: Option<bool>,
}

/// Values taken from the environment (or flags) that win over the file.
#[derive(Debug, Clone, Default)]
pub(crate) struct EnvOverrides {
    pub(crate) remote_database_url: Option<String>,
    pub(crate) ssh_user: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct Timing {
    pub(crate) start_grace: Duration,
    pub(crate) restart_settle: Duration,
    pub(crate) stop_timeout: Duration,
    pub(crate) ssh_timeout: Duration,
    pub(crate) transfer_timeout: Duration,
    pub(crate) reachable_interval: Duration,
    pub(crate) reachable_attempts: u32,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            start_grace: Duration::from_secs(3),
            restart_settle: Duration::from_secs(2),
            stop_timeout: Duration::from_secs(10),
            ssh_timeout: Duration::from_secs(120),
            transfer_timeout: Duration::from_secs(600),
            reachable_interval: Duration::from_secs(10),
            reachable_attempts: 30,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct BuildSettings {
    pub(crate) command: Vec<String>,
    pub(crate) artifact: PathBuf,
    pub(crate) config_files: Vec<PathBuf>,
}

/// Fully resolved configuration for one invocation.
#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub(crate) remote_user: String,
    pub(crate) layout: RemoteLayout,
    pub(crate) remote_database_url: Option<String>,
    pub(crate) build: BuildSettings,
    pub(crate) migrations_dir: PathBuf,
    pub(crate) timing: Timing,
    pub(crate) status_tables: Vec<String>,
    pub(crate) overrides: BTreeMap<String, String>,
    pub(crate) services: Vec<ServiceSpec>,
}

impl Settings {
    pub(crate) fn resolve(config: FleetConfig, env: &EnvOverrides) -> anyhow::Result<Self> {
        let remote = config.remote.unwrap_or_default();
        let build = config.build.unwrap_or_default();
        let timing = config.timing.unwrap_or_default();

        let remote_user = non_empty(env.ssh_user.clone())
            .or(non_empty(remote.user))
            .unwrap_or_else(|| DEFAULT_REMOTE_USER.to_string());
        let layout = RemoteLayout {
            dir: non_empty(remote.dir).unwrap_or_else(|| DEFAULT_REMOTE_DIR.to_string()),
            artifact: non_empty(remote.artifact).unwrap_or_else(|| DEFAULT_ARTIFACT.to_string()),
        };
        if layout.artifact.contains('/') {
            anyhow::bail!("remote.artifact must be a file name, got {}", layout.artifact);
        }
        let remote_database_url =
            non_empty(env.remote_database_url.clone()).or(non_empty(remote.database_url));

        let command_raw = build
            .command
            .unwrap_or_else(|| DEFAULT_BUILD_COMMAND.to_string());
        let command = shell_words::split(&command_raw)
            .with_context(|| format!("build.command: cannot parse {command_raw:?}"))?;
        if command.is_empty() {
            anyhow::bail!("build.command cannot be empty");
        }
        let build = BuildSettings {
            command,
            artifact: PathBuf::from(
                build
                    .artifact
                    .unwrap_or_else(|| DEFAULT_BUILD_ARTIFACT.to_string()),
            ),
            config_files: build
                .config_files
                .unwrap_or_else(|| vec![".env".to_string()])
                .into_iter()
                .map(PathBuf::from)
                .collect(),
        };

        let defaults = Timing::default();
        let timing = Timing {
            start_grace: duration_or("timing.start_grace", timing.start_grace, defaults.start_grace)?,
            restart_settle: duration_or(
                "timing.restart_settle",
                timing.restart_settle,
                defaults.restart_settle,
            )?,
            stop_timeout: duration_or("timing.stop_timeout", timing.stop_timeout, defaults.stop_timeout)?,
            ssh_timeout: duration_or("timing.ssh_timeout", timing.ssh_timeout, defaults.ssh_timeout)?,
            transfer_timeout: duration_or(
                "timing.transfer_timeout",
                timing.transfer_timeout,
                defaults.transfer_timeout,
            )?,
            reachable_interval: duration_or(
                "timing.reachable_interval",
                timing.reachable_interval,
                defaults.reachable_interval,
            )?,
            reachable_attempts: timing.reachable_attempts.unwrap_or(defaults.reachable_attempts),
        };
        if timing.reachable_attempts == 0 {
            anyhow::bail!("timing.reachable_attempts must be at least 1");
        }

        let identifier = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$")?;
        let status_tables = config.status.and_then(|s| s.tables).unwrap_or_default();
        for table in &status_tables {
            if !identifier.is_match(table) {
                anyhow::bail!("status.tables: invalid table name {table:?}");
            }
        }

        let overrides = config
            .redeploy
            .and_then(|r| r.overrides)
            .unwrap_or_default();
        let env_key = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$")?;
        for key in overrides.keys() {
            if !env_key.is_match(key) {
                anyhow::bail!("redeploy.overrides: invalid variable name {key:?}");
            }
        }

        let services = if config.services.is_empty() {
            builtin_specs()
        } else {
            config
                .services
                .into_iter()
                .map(|service| ServiceSpec {
                    subcommand: service.subcommand.unwrap_or_else(|| service.name.clone()),
                    name: service.name,
                    args: service.args.unwrap_or_default(),
                    auto_restart: service.auto_restart.unwrap_or(false),
                })
                .collect()
        };

        Ok(Self {
            remote_user,
            layout,
            remote_database_url,
            build,
            migrations_dir: PathBuf::from(
                config
                    .migrations
                    .and_then(|m| m.dir)
                    .unwrap_or_else(|| DEFAULT_MIGRATIONS_DIR.to_string()),
            ),
            timing,
            status_tables,
            overrides,
            services,
        })
    }

    /// The database URL as seen from the deployed host.
    pub(crate) fn require_database_url(&self) -> Result<&str, MissingSetting> {
        self.remote_database_url.as_deref().ok_or(MissingSetting {
            name: "remote database URL",
            hint: "set remote.database_url in fleet.toml or FLEET_REMOTE_DATABASE_URL",
        })
    }
}

/// Reads the config file; without an explicit path a missing `fleet.toml` means defaults.
pub(crate) fn load_fleet_config(path: Option<&Path>) -> anyhow::Result<FleetConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => {
            let fallback = PathBuf::from(DEFAULT_CONFIG_FILE);
            if !fallback.exists() {
                return Ok(FleetConfig::default());
            }
            fallback
        }
    };
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: FleetConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    Ok(config)
}

fn duration_or(key: &str, raw: Option<String>, default: Duration) -> anyhow::Result<Duration> {
    match raw {
        Some(raw) => humantime::parse_duration(raw.trim())
            .with_context(|| format!("{key}: invalid duration {raw:?}")),
        None => Ok(default),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}
