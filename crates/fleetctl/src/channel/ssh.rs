use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use system_utils::process::{run_command_with_input, run_command_with_timeout};
use tokio::process::Command;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use super::{Channel, ExecOutput, RemoteScript};
use crate::errors::Unreachable;

const SSH_CONNECT_TIMEOUT_SECS: u64 = 10;
const SSH_TRANSPORT_FAILURE: i32 = 255;

#[derive(Debug, Clone)]
pub(crate) struct SshOptions {
    pub(crate) command_timeout: Duration,
    pub(crate) transfer_timeout: Duration,
}

/// Remote execution over the system `ssh`/`scp` binaries with a fixed identity file.
pub(crate) struct SshChannel {
    destination: String,
    identity: PathBuf,
    options: SshOptions,
}

impl SshChannel {
    pub(crate) fn new(user: &str, host: &str, identity: PathBuf, options: SshOptions) -> Self {
        Self {
            destination: format!("{user}@{host}"),
            identity,
            options,
        }
    }

    /// Polls until the host accepts a trivial command. The only retrying call on this channel.
    pub(crate) async fn wait_until_reachable(
        &self,
        attempts: u32,
        interval: Duration,
    ) -> anyhow::Result<()> {
        let probe = RemoteScript::new().line("true");
        let mut last_error = String::from("no attempt made");
        for attempt in 1..=attempts {
            match self.execute(&probe).await {
                Ok(output) if output.success() => {
                    info!(
                        event = "ssh.reachable",
                        destination = %self.destination,
                        attempt,
                        "host reachable"
                    );
                    return Ok(());
                }
                Ok(output) => {
                    last_error = format!("probe exited with {:?}", output.exit_code);
                }
                Err(err) => {
                    last_error = err.to_string();
                }
            }
            warn!(
                event = "ssh.unreachable",
                destination = %self.destination,
                attempt,
                attempts,
                error = %last_error,
                "host not reachable yet"
            );
            if attempt < attempts {
                tokio::time::sleep(interval).await;
            }
        }
        Err(Unreachable {
            host: self.destination.clone(),
            attempts,
            last_error,
        }
        .into())
    }

    /// Runs an interactive session with a TTY; `remote_cmd` of `None` opens a login shell.
    pub(crate) async fn interactive(&self, remote_cmd: Option<&str>) -> anyhow::Result<i32> {
        let mut cmd = self.base("ssh");
        cmd.arg("-t");
        cmd.arg(&self.destination);
        if let Some(remote_cmd) = remote_cmd {
            cmd.arg(remote_cmd);
        }
        cmd.stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        info!(
            event = "ssh.interactive",
            destination = %self.destination,
            command = remote_cmd.unwrap_or("<shell>"),
            "opening interactive session"
        );
        let status = cmd
            .status()
            .await
            .map_err(|err| anyhow::anyhow!("failed to run ssh: {err}"))?;
        Ok(status.code().unwrap_or(1))
    }

    fn base(&self, program: &str) -> Command {
        let mut cmd = Command::new(program);
        cmd.arg("-i").arg(&self.identity);
        apply_ssh_options(&mut cmd);
        cmd
    }
}

#[async_trait]
impl Channel for SshChannel {
    fn describe(&self) -> String {
        self.destination.clone()
    }

    async fn execute(&self, script: &RemoteScript) -> anyhow::Result<ExecOutput> {
        let mut cmd = self.base("ssh");
        cmd.arg("-T").arg(&self.destination).arg("sh -s");
        debug!(
            event = "ssh.execute",
            destination = %self.destination,
            bytes = script.text().len(),
            "running remote script"
        );
        let output = run_command_with_input(
            &mut cmd,
            Some(script.text().as_bytes()),
            self.options.command_timeout,
            "ssh command",
        )
        .await?;
        if output.status.code() == Some(SSH_TRANSPORT_FAILURE) {
            anyhow::bail!(format_ssh_failure("ssh", &output.stdout, &output.stderr));
        }
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
        })
    }

    async fn upload(&self, local: &Path, remote: &str) -> anyhow::Result<()> {
        let mut cmd = self.base("scp");
        cmd.arg("-q")
            .arg(local)
            .arg(format!("{}:{}", self.destination, remote));
        self.run_scp(&mut cmd).await
    }

    async fn download(&self, remote: &str, local: &Path) -> anyhow::Result<()> {
        let mut cmd = self.base("scp");
        cmd.arg("-q")
            .arg(format!("{}:{}", self.destination, remote))
            .arg(local);
        self.run_scp(&mut cmd).await
    }
}

impl SshChannel {
    async fn run_scp(&self, cmd: &mut Command) -> anyhow::Result<()> {
        let output =
            run_command_with_timeout(cmd, self.options.transfer_timeout, "scp command").await?;
        if !output.status.success() {
            anyhow::bail!(format_ssh_failure("scp", &output.stdout, &output.stderr));
        }
        Ok(())
    }
}

/// Host keys are not checked: hosts are re-provisioned behind a reused address and
/// unattended runs cannot answer a prompt. First-connection spoofing is not detected.
fn apply_ssh_options(cmd: &mut Command) {
    cmd.arg("-o").arg("BatchMode=yes");
    cmd.arg("-o").arg("StrictHostKeyChecking=no");
    cmd.arg("-o").arg("UserKnownHostsFile=/dev/null");
    cmd.arg("-o").arg("LogLevel=ERROR");
    cmd.arg("-o")
        .arg(format!("ConnectTimeout={}", SSH_CONNECT_TIMEOUT_SECS));
    cmd.arg("-o").arg("ServerAliveInterval=30");
    cmd.arg("-o").arg("ServerAliveCountMax=3");
}

fn format_ssh_failure(label: &str, stdout: &[u8], stderr: &[u8]) -> String {
    let stdout = String::from_utf8_lossy(stdout);
    let stderr = String::from_utf8_lossy(stderr);
    let detail = format!("{}{}", stdout, stderr).trim().to_string();
    let mut message = if detail.is_empty() {
        format!("{label} failed")
    } else {
        format!("{label} failed: {detail}")
    };
    if let Some(hint) = ssh_auth_hint(&detail) {
        message.push('\n');
        message.push_str(hint);
    }
    message
}

fn ssh_auth_hint(detail: &str) -> Option<&'static str> {
    let detail = detail.to_lowercase();
    if detail.contains("permission denied")
        || detail.contains("no supported authentication methods available")
        || detail.contains("too many authentication failures")
    {
        return Some(
            "ssh authentication failed. Check credential_ref in the deployment state and the remote user.",
        );
    }
    if detail.contains("unprotected private key") || detail.contains("bad permissions") {
        return Some("the identity file must be readable only by you (chmod 600).");
    }
    if detail.contains("connection timed out") || detail.contains("no route to host") {
        return Some("host unreachable. Check that the instance is running and its network group allows SSH.");
    }
    None
}
