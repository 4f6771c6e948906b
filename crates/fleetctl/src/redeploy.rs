use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::time::Instant;

use anyhow::Context;
use tracing::{info, warn};

use crate::channel::{Channel, RemoteScript};
use crate::config::{BuildSettings, Settings};
use crate::errors::{BuildFailed, PartialFailure};
use crate::migrate::{discover, run_migrations, MigrationReport, MigrationTarget};
use crate::registry::{join_remote, ServiceRegistry};
use crate::supervisor::{ProcessHandle, ServiceOutcome, Supervisor};

const DATABASE_URL_KEY: &str = "DATABASE_URL";

pub(crate) struct RedeployReport {
    pub(crate) migrations: MigrationReport,
    pub(crate) restarted: Vec<ServiceOutcome<ProcessHandle>>,
}

impl RedeployReport {
    pub(crate) fn failed_restarts(&self) -> Vec<String> {
        self.restarted
            .iter()
            .filter(|outcome| outcome.result.is_err())
            .map(|outcome| outcome.service.clone())
            .collect()
    }
}

/// Replaces the deployed artifact and brings the continuous services back.
pub(crate) struct Redeploy<'a> {
    pub(crate) channel: &'a dyn Channel,
    pub(crate) settings: &'a Settings,
    pub(crate) registry: &'a ServiceRegistry,
    pub(crate) supervisor: &'a Supervisor<'a>,
    pub(crate) migrations: &'a dyn MigrationTarget,
}

impl Redeploy<'_> {
    pub(crate) async fn run(&self, skip_build: bool) -> anyhow::Result<RedeployReport> {
        let build = &self.settings.build;
        if skip_build {
            info!(event = "redeploy.skip_build", "reusing existing local artifact");
        } else {
            run_step("build", || run_build(build)).await?;
        }
        if !build.artifact.is_file() {
            anyhow::bail!("build artifact not found: {}", build.artifact.display());
        }
        let migrations = discover(&self.settings.migrations_dir)?;
        let config_files = self.rendered_config_files()?;

        run_step("stop_services", || async {
            let outcomes = self.supervisor.stop_all(self.registry).await;
            let failed: Vec<String> = outcomes
                .into_iter()
                .filter(|outcome| outcome.result.is_err())
                .map(|outcome| outcome.service)
                .collect();
            if failed.is_empty() {
                Ok(())
            } else {
                Err(PartialFailure {
                    action: "stop",
                    failed,
                }
                .into())
            }
        })
        .await?;

        let layout = &self.settings.layout;
        let remote_artifact = layout.artifact_path();
        run_step("remove_artifact", || async {
            let script = RemoteScript::new()
                .set("fleet_dir", &layout.dir)
                .set("fleet_artifact", &remote_artifact)
                .line(r#"mkdir -p "$fleet_dir" && rm -f "$fleet_artifact""#);
            self.channel
                .execute(&script)
                .await?
                .check("remove remote artifact")?;
            Ok(())
        })
        .await?;

        run_step("upload_artifact", || {
            self.channel.upload(&build.artifact, &remote_artifact)
        })
        .await?;
        run_step("verify_artifact", || async {
            let local = ArtifactDigest::of(&build.artifact)?;
            match self.mark_executable(&remote_artifact).await? {
                Some(remote) if remote == local.md5 => Ok(()),
                Some(remote) => anyhow::bail!(
                    "uploaded artifact checksum mismatch: local {local}, remote md5 {remote}"
                ),
                None => {
                    warn!(
                        event = "redeploy.md5_unavailable",
                        "md5sum missing on remote host, upload not verified"
                    );
                    Ok(())
                }
            }
        })
        .await?;

        run_step("upload_config", || async {
            for (name, content) in &config_files {
                self.upload_text(name, content).await?;
            }
            Ok(())
        })
        .await?;

        let migrations =
            run_step("migrate", || run_migrations(self.migrations, &migrations)).await?;

        let restarted = run_step("restart_services", || async {
            let mut outcomes = Vec::new();
            for service in self.registry.auto_restart() {
                let result = self.supervisor.start(service, &[]).await;
                if let Err(err) = &result {
                    warn!(
                        event = "redeploy.restart_failed",
                        service = %service.name,
                        error = %err,
                        "restart failed"
                    );
                }
                outcomes.push(ServiceOutcome {
                    service: service.name.clone(),
                    result,
                });
            }
            Ok(outcomes)
        })
        .await?;

        Ok(RedeployReport {
            migrations,
            restarted,
        })
    }

    /// Reads every configured file up front so nothing remote happens if one is unreadable.
    fn rendered_config_files(&self) -> anyhow::Result<Vec<(String, String)>> {
        let mut overrides = self.settings.overrides.clone();
        if let Some(url) = &self.settings.remote_database_url {
            overrides.insert(DATABASE_URL_KEY.to_string(), url.clone());
        }
        let mut files = Vec::new();
        for path in &self.settings.build.config_files {
            if !path.exists() {
                warn!(
                    event = "redeploy.config_missing",
                    file = %path.display(),
                    "config file not found, skipping"
                );
                continue;
            }
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .with_context(|| format!("config file has no name: {}", path.display()))?;
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let content = if is_env_file(&name) {
                apply_env_overrides(&content, &overrides)
            } else {
                content
            };
            files.push((name, content));
        }
        Ok(files)
    }

    async fn mark_executable(&self, remote: &str) -> anyhow::Result<Option<String>> {
        let script = RemoteScript::new()
            .set("fleet_artifact", remote)
            .line(r#"chmod +x "$fleet_artifact" || exit 1"#)
            .line(r#"if command -v md5sum >/dev/null 2>&1; then md5sum "$fleet_artifact"; fi"#);
        let output = self
            .channel
            .execute(&script)
            .await?
            .check("chmod remote artifact")?;
        let hash = output.stdout.split_whitespace().next().unwrap_or("");
        if hash.is_empty() {
            return Ok(None);
        }
        Ok(Some(hash.to_string()))
    }

    async fn upload_text(&self, name: &str, content: &str) -> anyhow::Result<()> {
        let local = std::env::temp_dir().join(format!("fleetctl-{}-{name}", std::process::id()));
        std::fs::write(&local, content)
            .with_context(|| format!("failed to stage {}", local.display()))?;
        let remote = join_remote(&self.settings.layout.dir, name);
        let result = self.channel.upload(&local, &remote).await;
        let _ = std::fs::remove_file(&local);
        result
    }
}

async fn run_build(build: &BuildSettings) -> anyhow::Result<()> {
    let command = shell_words::join(&build.command);
    let (program, args) = build
        .command
        .split_first()
        .context("build command is empty")?;
    let status = tokio::process::Command::new(program)
        .args(args)
        .status()
        .await
        .with_context(|| format!("failed to run `{command}`"))?;
    if !status.success() {
        return Err(BuildFailed {
            command,
            status: status.code(),
        }
        .into());
    }
    Ok(())
}

async fn run_step<T, F, Fut>(step: &'static str, f: F) -> anyhow::Result<T>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    info!(event = "redeploy.step.start", step, "redeploy step start");
    let start = Instant::now();
    match f().await {
        Ok(value) => {
            info!(
                event = "redeploy.step.done",
                step,
                elapsed_ms = start.elapsed().as_millis(),
                "redeploy step done"
            );
            Ok(value)
        }
        Err(err) => {
            warn!(
                event = "redeploy.step.failed",
                step,
                elapsed_ms = start.elapsed().as_millis(),
                error = %err,
                "redeploy step failed"
            );
            Err(err)
        }
    }
}

pub(crate) fn is_env_file(name: &str) -> bool {
    name.starts_with(".env") || name.ends_with(".env")
}

/// Rewrites `KEY=value` lines whose key is overridden and appends the keys not present.
pub(crate) fn apply_env_overrides(content: &str, overrides: &BTreeMap<String, String>) -> String {
    let mut seen = Vec::new();
    let mut out = String::with_capacity(content.len());
    for line in content.lines() {
        let trimmed = line.trim_start();
        let (prefix, body) = match trimmed.strip_prefix("export ") {
            Some(rest) => ("export ", rest),
            None => ("", trimmed),
        };
        let replaced = if trimmed.starts_with('#') {
            None
        } else {
            body.split_once('=')
                .and_then(|(key, _)| overrides.get_key_value(key.trim()))
        };
        match replaced {
            Some((key, value)) => {
                out.push_str(&format!("{prefix}{key}={}", env_value(value)));
                seen.push(key.as_str());
            }
            None => out.push_str(line),
        }
        out.push('\n');
    }
    for (key, value) in overrides {
        if !seen.contains(&key.as_str()) {
            out.push_str(&format!("{key}={}\n", env_value(value)));
        }
    }
    out
}

fn env_value(value: &str) -> String {
    if value.chars().any(|c| c.is_whitespace() || c == '#') {
        format!("\"{value}\"")
    } else {
        value.to_string()
    }
}

/// Checksum of the built artifact, compared against `md5sum` output on the host.
#[derive(Debug, PartialEq, Eq)]
struct ArtifactDigest {
    md5: String,
    bytes: u64,
}

impl ArtifactDigest {
    fn of(artifact: &Path) -> anyhow::Result<Self> {
        let mut file = std::fs::File::open(artifact)
            .with_context(|| format!("cannot read artifact {}", artifact.display()))?;
        let mut hasher = md5::Context::new();
        let mut chunk = vec![0u8; 64 * 1024];
        let mut bytes = 0u64;
        loop {
            let n = file
                .read(&mut chunk)
                .with_context(|| format!("cannot read artifact {}", artifact.display()))?;
            if n == 0 {
                break;
            }
            hasher.consume(&chunk[..n]);
            bytes += n as u64;
        }
        Ok(Self {
            md5: format!("{:x}", hasher.compute()),
            bytes,
        })
    }
}

impl std::fmt::Display for ArtifactDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "md5 {} over {} bytes", self.md5, self.bytes)
    }
}
