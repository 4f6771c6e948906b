mod script;
mod ssh;

#[cfg(test)]
pub(crate) mod local;

use std::path::Path;

use async_trait::async_trait;

pub(crate) use script::{shell_escape, RemoteScript};
pub(crate) use ssh::{SshChannel, SshOptions};

/// Result of one remote script run. A non-zero exit is not an error at this layer.
#[derive(Debug, Clone, Default)]
pub(crate) struct ExecOutput {
    pub(crate) stdout: String,
    pub(crate) stderr: String,
    pub(crate) exit_code: Option<i32>,
}

impl ExecOutput {
    pub(crate) fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Turns a non-zero exit into an error carrying the remote diagnostics.
    pub(crate) fn check(self, label: &str) -> anyhow::Result<Self> {
        if self.success() {
            return Ok(self);
        }
        let detail = format!("{}{}", self.stderr, self.stdout).trim().to_string();
        let status = self
            .exit_code
            .map(|code| format!("exit status {code}"))
            .unwrap_or_else(|| "terminated by signal".to_string());
        if detail.is_empty() {
            anyhow::bail!("{label} failed ({status})");
        }
        anyhow::bail!("{label} failed ({status}): {detail}");
    }

    pub(crate) fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines()
    }
}

/// Executes scripts and moves files against the deployed host.
///
/// Every call is a single attempt; callers decide whether a retry is safe.
#[async_trait]
pub(crate) trait Channel: Send + Sync {
    fn describe(&self) -> String;

    async fn execute(&self, script: &RemoteScript) -> anyhow::Result<ExecOutput>;

    async fn upload(&self, local: &Path, remote: &str) -> anyhow::Result<()>;

    async fn download(&self, remote: &str, local: &Path) -> anyhow::Result<()>;
}
