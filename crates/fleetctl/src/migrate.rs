use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use regex::Regex;
use tracing::{info, warn};

use crate::channel::{Channel, RemoteScript};
use crate::errors::MigrationFailed;
use crate::registry::join_remote;

const LEDGER_DDL: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (filename TEXT PRIMARY KEY, applied_at TIMESTAMPTZ NOT NULL DEFAULT now())";

const PSQL_PREAMBLE: &str = r#"command -v psql >/dev/null 2>&1 || { echo "psql not found on remote host" >&2; exit 127; }"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Migration {
    pub(crate) filename: String,
    pub(crate) path: PathBuf,
}

/// Lists `*.sql` files in `dir`, sorted by filename. A missing directory has no migrations.
pub(crate) fn discover(dir: &Path) -> anyhow::Result<Vec<Migration>> {
    if !dir.exists() {
        warn!(
            event = "migrate.no_directory",
            dir = %dir.display(),
            "migrations directory not found"
        );
        return Ok(Vec::new());
    }
    let name_rule = Regex::new(r"^[A-Za-z0-9_.-]+\.sql$")?;
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read migrations dir {}", dir.display()))?;
    let mut migrations = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() || path.extension().and_then(|ext| ext.to_str()) != Some("sql") {
            continue;
        }
        let filename = entry.file_name().to_string_lossy().to_string();
        if !name_rule.is_match(&filename) {
            anyhow::bail!(
                "invalid migration filename {filename:?}: use letters, digits, '.', '-' or '_'"
            );
        }
        migrations.push(Migration { filename, path });
    }
    migrations.sort_by(|a, b| a.filename.cmp(&b.filename));
    Ok(migrations)
}

/// A database that keeps a ledger of applied migration files.
#[async_trait]
pub(crate) trait MigrationTarget: Send + Sync {
    async fn ensure_ledger(&self) -> anyhow::Result<()>;

    async fn applied(&self) -> anyhow::Result<BTreeSet<String>>;

    /// Applies the file and records it in the ledger as one unit.
    async fn apply(&self, migration: &Migration) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct MigrationReport {
    pub(crate) applied: Vec<String>,
    pub(crate) skipped: usize,
}

impl fmt::Display for MigrationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.applied.is_empty() {
            return write!(f, "up to date ({} already applied)", self.skipped);
        }
        write!(
            f,
            "applied {} migration(s): {}",
            self.applied.len(),
            self.applied.join(", ")
        )?;
        if self.skipped > 0 {
            write!(f, " ({} already applied)", self.skipped)?;
        }
        Ok(())
    }
}

/// Applies every unrecorded migration in order, stopping at the first failure.
pub(crate) async fn run_migrations(
    target: &dyn MigrationTarget,
    migrations: &[Migration],
) -> anyhow::Result<MigrationReport> {
    target.ensure_ledger().await?;
    let done = target.applied().await?;
    let mut report = MigrationReport::default();
    for migration in migrations {
        if done.contains(&migration.filename) {
            report.skipped += 1;
            continue;
        }
        info!(
            event = "migrate.apply",
            file = %migration.filename,
            "applying migration"
        );
        if let Err(err) = target.apply(migration).await {
            warn!(
                event = "migrate.failed",
                file = %migration.filename,
                applied = ?report.applied,
                "migration failed"
            );
            let failure = match err.downcast::<MigrationFailed>() {
                Ok(failed) => failed,
                Err(other) => MigrationFailed {
                    filename: migration.filename.clone(),
                    detail: format!("{other:#}"),
                },
            };
            let applied = report.applied.len();
            return Err(anyhow::Error::new(failure)
                .context(format!("migration stopped after applying {applied} file(s) in this run")));
        }
        report.applied.push(migration.filename.clone());
    }
    info!(
        event = "migrate.done",
        applied = report.applied.len(),
        skipped = report.skipped,
        "migrations complete"
    );
    Ok(report)
}

/// Runs `psql` on the deployed host against the colocated database.
pub(crate) struct RemotePsql<'a> {
    channel: &'a dyn Channel,
    database_url: String,
    staging_dir: String,
}

impl<'a> RemotePsql<'a> {
    pub(crate) fn new(channel: &'a dyn Channel, database_url: &str, staging_dir: &str) -> Self {
        Self {
            channel,
            database_url: database_url.to_string(),
            staging_dir: staging_dir.to_string(),
        }
    }

    fn script(&self) -> RemoteScript {
        RemoteScript::new()
            .set("fleet_db", &self.database_url)
            .line(PSQL_PREAMBLE)
    }
}

#[async_trait]
impl MigrationTarget for RemotePsql<'_> {
    async fn ensure_ledger(&self) -> anyhow::Result<()> {
        let script = self
            .script()
            .set("fleet_staging", &self.staging_dir)
            .line(r#"mkdir -p "$fleet_staging" || exit 1"#)
            .line(&format!(
                r#"psql "$fleet_db" -X -q -v ON_ERROR_STOP=1 -c "{LEDGER_DDL}" </dev/null"#
            ));
        self.channel
            .execute(&script)
            .await?
            .check("create migration ledger")?;
        Ok(())
    }

    async fn applied(&self) -> anyhow::Result<BTreeSet<String>> {
        let script = self.script().line(
            r#"psql "$fleet_db" -X -A -t -q -v ON_ERROR_STOP=1 -c "SELECT filename FROM schema_migrations ORDER BY filename" </dev/null"#,
        );
        let output = self
            .channel
            .execute(&script)
            .await?
            .check("read migration ledger")?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn apply(&self, migration: &Migration) -> anyhow::Result<()> {
        let remote = join_remote(&self.staging_dir, &migration.filename);
        self.channel
            .upload(&migration.path, &remote)
            .await
            .with_context(|| format!("failed to upload {}", migration.filename))?;
        let record = format!(
            "INSERT INTO schema_migrations (filename) VALUES ('{}') ON CONFLICT (filename) DO NOTHING",
            migration.filename.replace('\'', "''")
        );
        let script = self
            .script()
            .set("fleet_file", &remote)
            .set("fleet_record", &record)
            .line(r#"psql "$fleet_db" -X -q -v ON_ERROR_STOP=1 --single-transaction -f "$fleet_file" -c "$fleet_record" </dev/null"#);
        let output = self.channel.execute(&script).await?;
        if !output.success() {
            return Err(MigrationFailed {
                filename: migration.filename.clone(),
                detail: format!("{}{}", output.stderr, output.stdout).trim().to_string(),
            }
            .into());
        }
        Ok(())
    }
}
