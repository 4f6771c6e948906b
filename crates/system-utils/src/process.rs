use std::process::{Output, Stdio};

use anyhow::Context;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::{timeout, Duration};

pub async fn run_command_with_timeout(
    cmd: &mut Command,
    command_timeout: Duration,
    label: &str,
) -> anyhow::Result<Output> {
    run_command_with_input(cmd, None, command_timeout, label).await
}

/// Runs `cmd` to completion, feeding `input` on stdin when given.
///
/// The child is killed if the deadline passes before it exits.
pub async fn run_command_with_input(
    cmd: &mut Command,
    input: Option<&[u8]>,
    command_timeout: Duration,
    label: &str,
) -> anyhow::Result<Output> {
    let stdin = if input.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    };
    cmd.stdin(stdin)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {label}"))?;
    if let Some(input) = input {
        let mut pipe = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("{label}: stdin not captured"))?;
        let input = input.to_vec();
        tokio::spawn(async move {
            // A child that exits early closes the pipe; its exit status tells the story.
            let _ = pipe.write_all(&input).await;
            let _ = pipe.shutdown().await;
        });
    }
    match timeout(command_timeout, child.wait_with_output()).await {
        Ok(result) => result.with_context(|| format!("{label} failed")),
        Err(_) => anyhow::bail!(
            "{label} timed out after {}s",
            command_timeout.as_secs()
        ),
    }
}
