use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use system_utils::process::run_command_with_input;
use tokio::process::Command;
use tokio::time::Duration;

use super::{Channel, ExecOutput, RemoteScript};

/// Runs scripts with the local `sh`, standing in for the remote host.
pub(crate) struct LocalChannel;

#[async_trait]
impl Channel for LocalChannel {
    fn describe(&self) -> String {
        "localhost".to_string()
    }

    async fn execute(&self, script: &RemoteScript) -> anyhow::Result<ExecOutput> {
        let mut cmd = Command::new("sh");
        cmd.arg("-s");
        let output = run_command_with_input(
            &mut cmd,
            Some(script.text().as_bytes()),
            Duration::from_secs(30),
            "local sh",
        )
        .await?;
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
        })
    }

    async fn upload(&self, local: &Path, remote: &str) -> anyhow::Result<()> {
        std::fs::copy(local, remote)
            .with_context(|| format!("failed to copy {} to {remote}", local.display()))?;
        Ok(())
    }

    async fn download(&self, remote: &str, local: &Path) -> anyhow::Result<()> {
        std::fs::copy(remote, local)
            .with_context(|| format!("failed to copy {remote} to {}", local.display()))?;
        Ok(())
    }
}
