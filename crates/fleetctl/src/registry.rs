use std::collections::HashSet;

use regex::Regex;

use crate::errors::UnknownService;

/// Where the deployed artifact and its per-service files live on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RemoteLayout {
    pub(crate) dir: String,
    pub(crate) artifact: String,
}

impl RemoteLayout {
    pub(crate) fn artifact_path(&self) -> String {
        join_remote(&self.dir, &self.artifact)
    }

    pub(crate) fn pid_file(&self, service: &str) -> String {
        join_remote(&self.dir, &format!("run/{service}.pid"))
    }

    pub(crate) fn log_file(&self, service: &str) -> String {
        join_remote(&self.dir, &format!("logs/{service}.log"))
    }

    pub(crate) fn staging_dir(&self) -> String {
        join_remote(&self.dir, "migrations")
    }
}

/// How a service is launched, before paths are resolved against a [`RemoteLayout`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ServiceSpec {
    pub(crate) name: String,
    pub(crate) subcommand: String,
    pub(crate) args: Vec<String>,
    pub(crate) auto_restart: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ServiceDescriptor {
    pub(crate) name: String,
    pub(crate) pid_file: String,
    pub(crate) log_file: String,
    /// Literal substring of the process command line.
    pub(crate) match_pattern: String,
    /// Program followed by its fixed leading arguments.
    pub(crate) command: Vec<String>,
    pub(crate) default_args: Vec<String>,
    pub(crate) auto_restart: bool,
}

impl ServiceDescriptor {
    /// Full argv for a launch; explicit `args` replace the defaults wholesale.
    pub(crate) fn argv(&self, args: &[String]) -> Vec<String> {
        let mut argv = self.command.clone();
        if args.is_empty() {
            argv.extend(self.default_args.iter().cloned());
        } else {
            argv.extend(args.iter().cloned());
        }
        argv
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ServiceRegistry {
    services: Vec<ServiceDescriptor>,
}

impl ServiceRegistry {
    pub(crate) fn new(services: Vec<ServiceDescriptor>) -> anyhow::Result<Self> {
        if services.is_empty() {
            anyhow::bail!("service registry cannot be empty");
        }
        let name_rule = Regex::new(r"^[a-z0-9][a-z0-9_-]*$")?;
        let mut seen = HashSet::new();
        for service in &services {
            if !name_rule.is_match(&service.name) {
                anyhow::bail!(
                    "invalid service name {:?}: use lowercase letters, digits, '-' or '_'",
                    service.name
                );
            }
            if !seen.insert(service.name.as_str()) {
                anyhow::bail!("duplicate service name: {}", service.name);
            }
            if service.match_pattern.trim().is_empty() {
                anyhow::bail!("service {} has an empty match pattern", service.name);
            }
            if service.command.is_empty() {
                anyhow::bail!("service {} has no command", service.name);
            }
        }
        Ok(Self { services })
    }

    pub(crate) fn from_specs(layout: &RemoteLayout, specs: &[ServiceSpec]) -> anyhow::Result<Self> {
        let artifact = layout.artifact_path();
        let services = specs
            .iter()
            .map(|spec| ServiceDescriptor {
                name: spec.name.clone(),
                pid_file: layout.pid_file(&spec.name),
                log_file: layout.log_file(&spec.name),
                match_pattern: format!("{} {}", layout.artifact, spec.subcommand),
                command: vec![artifact.clone(), spec.subcommand.clone()],
                default_args: spec.args.clone(),
                auto_restart: spec.auto_restart,
            })
            .collect();
        Self::new(services)
    }

    pub(crate) fn get(&self, name: &str) -> Result<&ServiceDescriptor, UnknownService> {
        self.services
            .iter()
            .find(|service| service.name == name)
            .ok_or_else(|| UnknownService {
                name: name.to_string(),
                valid: self.names(),
            })
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.services.iter().map(|s| s.name.clone()).collect()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.services.iter()
    }

    /// Services restarted automatically after a redeploy.
    pub(crate) fn auto_restart(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.services.iter().filter(|service| service.auto_restart)
    }
}

pub(crate) fn builtin_specs() -> Vec<ServiceSpec> {
    let spec = |name: &str, args: &[&str], auto_restart: bool| ServiceSpec {
        name: name.to_string(),
        subcommand: name.to_string(),
        args: args.iter().map(|arg| arg.to_string()).collect(),
        auto_restart,
    };
    vec![
        spec(
            "collect-signals",
            &["--duration", "7d", "--sources", "orderbook,funding,liquidations,polymarket,news"],
            true,
        ),
        spec(
            "clob-timing",
            &["--mode", "paper", "--duration", "7d", "--coins", "btc,eth", "--persist"],
            true,
        ),
        spec(
            "directional-auto",
            &["--mode", "paper", "--duration", "7d", "--coins", "btc,eth,sol,xrp", "--persist"],
            true,
        ),
        spec(
            "cross-market-auto",
            &["--mode", "paper", "--duration", "7d", "--coins", "btc,eth", "--persist"],
            true,
        ),
        spec("gabagool-monitor", &["--verbose"], true),
        spec("directional-settle", &[], false),
        spec("cross-market-settle", &[], false),
    ]
}

pub(crate) fn join_remote(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}
