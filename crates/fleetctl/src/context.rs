use std::io::IsTerminal;

use system_utils::path::expand_tilde;

use crate::channel::{Channel, SshChannel, SshOptions};
use crate::cli::GlobalArgs;
use crate::config::{load_fleet_config, EnvOverrides, Settings};
use crate::redeploy::is_env_file;
use crate::registry::ServiceRegistry;
use crate::state::{DeploymentState, StateStore};
use crate::status::{Palette, StatusRequest};
use crate::supervisor::{LaunchEnv, Supervisor};

/// Everything one invocation needs, resolved once from flags, environment and config.
pub(crate) struct FleetContext {
    pub(crate) settings: Settings,
    pub(crate) registry: ServiceRegistry,
    pub(crate) state_store: StateStore,
    pub(crate) palette: Palette,
}

impl FleetContext {
    pub(crate) fn from_args(global: &GlobalArgs) -> anyhow::Result<Self> {
        let config = load_fleet_config(global.config.as_deref())?;
        let env = EnvOverrides {
            remote_database_url: global.remote_database_url.clone(),
            ssh_user: global.ssh_user.clone(),
        };
        let settings = Settings::resolve(config, &env)?;
        let registry = ServiceRegistry::from_specs(&settings.layout, &settings.services)?;
        let colour = !global.no_color
            && std::env::var_os("NO_COLOR").is_none()
            && std::io::stdout().is_terminal();
        Ok(Self {
            settings,
            registry,
            state_store: StateStore::new(global.state_file.clone()),
            palette: Palette::new(colour),
        })
    }

    pub(crate) fn load_state(&self) -> anyhow::Result<DeploymentState> {
        self.state_store.load()
    }

    pub(crate) fn channel(&self, state: &DeploymentState) -> SshChannel {
        SshChannel::new(
            &self.settings.remote_user,
            &state.host_address,
            expand_tilde(&state.credential_ref),
            SshOptions {
                command_timeout: self.settings.timing.ssh_timeout,
                transfer_timeout: self.settings.timing.transfer_timeout,
            },
        )
    }

    pub(crate) fn launch_env(&self) -> LaunchEnv {
        let env_file = self
            .settings
            .build
            .config_files
            .iter()
            .filter_map(|path| path.file_name())
            .map(|name| name.to_string_lossy().to_string())
            .find(|name| is_env_file(name));
        LaunchEnv {
            workdir: self.settings.layout.dir.clone(),
            env_file,
            database_url: self.settings.remote_database_url.clone(),
        }
    }

    pub(crate) fn supervisor<'a>(&self, channel: &'a dyn Channel) -> Supervisor<'a> {
        Supervisor::new(channel, self.launch_env(), self.settings.timing.clone())
    }

    pub(crate) fn status_request(&self) -> StatusRequest {
        StatusRequest {
            workdir: self.settings.layout.dir.clone(),
            tables: self.settings.status_tables.clone(),
            database_url: self.settings.remote_database_url.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::temp_dir;

    fn global(config: Option<std::path::PathBuf>) -> GlobalArgs {
        GlobalArgs {
            config,
            state_file: ".fleet/deployment.state".into(),
            remote_database_url: Some("postgres://bot@127.0.0.1/bot".to_string()),
            ssh_user: None,
            verbose: 0,
            no_color: true,
            no_audit_log: true,
            audit_dir: "~/.fleetctl/logs".to_string(),
        }
    }

    #[test]
    fn resolves_registry_and_launch_env_from_config() {
        let dir = temp_dir("fleet-context");
        let path = dir.join("fleet.toml");
        std::fs::write(
            &path,
            "[remote]\ndir = \"/srv/fleet\"\n\n[build]\nconfig_files = [\"config/Config.toml\", \"deploy/prod.env\"]\n\n[[services]]\nname = \"alpha\"\nauto_restart = true\n",
        )
        .expect("config");
        let ctx = FleetContext::from_args(&global(Some(path))).expect("context");
        assert_eq!(ctx.registry.names(), vec!["alpha".to_string()]);
        assert_eq!(ctx.palette, Palette::new(false));

        let launch = ctx.launch_env();
        assert_eq!(launch.workdir, "/srv/fleet");
        assert_eq!(launch.env_file.as_deref(), Some("prod.env"));
        assert_eq!(launch.database_url.as_deref(), Some("postgres://bot@127.0.0.1/bot"));
    }

    #[test]
    fn explicit_missing_config_is_an_error() {
        let dir = temp_dir("fleet-context-missing");
        assert!(FleetContext::from_args(&global(Some(dir.join("nope.toml")))).is_err());
    }
}
