use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::errors::{MissingState, StateExists};

const KEYS: [&str; 6] = [
    "host_address",
    "credential_ref",
    "network_group_id",
    "allocation_id",
    "region",
    "market_type",
];

/// Facts recorded when the host was provisioned.
///
/// Recreated wholesale on re-provision; nothing edits a field in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DeploymentState {
    pub(crate) host_address: String,
    /// Path of the SSH identity file used for every remote call.
    pub(crate) credential_ref: String,
    pub(crate) network_group_id: String,
    pub(crate) allocation_id: String,
    pub(crate) region: String,
    pub(crate) market_type: String,
}

impl DeploymentState {
    pub(crate) fn parse(raw: &str) -> anyhow::Result<Self> {
        let mut values: [Option<String>; 6] = Default::default();
        for (index, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("line {}: expected key=value", index + 1))?;
            let key = key.trim();
            let slot = KEYS
                .iter()
                .position(|known| *known == key)
                .ok_or_else(|| anyhow::anyhow!("line {}: unknown key {key}", index + 1))?;
            values[slot] = Some(value.trim().to_string());
        }
        let mut take = |slot: usize| -> anyhow::Result<String> {
            match values[slot].take() {
                Some(value) if !value.is_empty() => Ok(value),
                _ => anyhow::bail!("missing value for {}", KEYS[slot]),
            }
        };
        Ok(Self {
            host_address: take(0)?,
            credential_ref: take(1)?,
            network_group_id: take(2)?,
            allocation_id: take(3)?,
            region: take(4)?,
            market_type: take(5)?,
        })
    }

    pub(crate) fn render(&self) -> String {
        let values = [
            &self.host_address,
            &self.credential_ref,
            &self.network_group_id,
            &self.allocation_id,
            &self.region,
            &self.market_type,
        ];
        let mut out = String::new();
        for (key, value) in KEYS.iter().zip(values) {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        out
    }
}

pub(crate) struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn load(&self) -> anyhow::Result<DeploymentState> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(MissingState {
                    path: self.path.clone(),
                }
                .into());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", self.path.display()))
            }
        };
        DeploymentState::parse(&raw)
            .with_context(|| format!("invalid deployment state {}", self.path.display()))
    }

    /// Fails with [`StateExists`] when a deployment is already recorded.
    pub(crate) fn ensure_vacant(&self) -> anyhow::Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let host = self
            .load()
            .map(|existing| existing.host_address)
            .unwrap_or_else(|_| "unreadable".to_string());
        Err(StateExists {
            path: self.path.clone(),
            host,
        }
        .into())
    }

    /// Writes a new state file, refusing to replace an existing deployment.
    pub(crate) fn create(&self, state: &DeploymentState) -> anyhow::Result<()> {
        self.ensure_vacant()?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, state.render())
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to move state into {}", self.path.display()))?;
        Ok(())
    }

    pub(crate) fn remove(&self) -> anyhow::Result<()> {
        std::fs::remove_file(&self.path)
            .with_context(|| format!("failed to remove {}", self.path.display()))
    }
}
