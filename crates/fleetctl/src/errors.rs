use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub(crate) struct MissingState {
    pub(crate) path: PathBuf,
}

impl fmt::Display for MissingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no deployment state at {}", self.path.display())
    }
}

impl std::error::Error for MissingState {}

#[derive(Debug)]
pub(crate) struct StateExists {
    pub(crate) path: PathBuf,
    pub(crate) host: String,
}

impl fmt::Display for StateExists {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "deployment state already exists at {} (host {})",
            self.path.display(),
            self.host
        )
    }
}

impl std::error::Error for StateExists {}

#[derive(Debug)]
pub(crate) struct UnknownService {
    pub(crate) name: String,
    pub(crate) valid: Vec<String>,
}

impl fmt::Display for UnknownService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown service {:?}; valid services: {}",
            self.name,
            self.valid.join(", ")
        )
    }
}

impl std::error::Error for UnknownService {}

#[derive(Debug)]
pub(crate) struct MissingSetting {
    pub(crate) name: &'static str,
    pub(crate) hint: &'static str,
}

impl fmt::Display for MissingSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "missing required setting {}", self.name)
    }
}

impl std::error::Error for MissingSetting {}

#[derive(Debug)]
pub(crate) struct AlreadyRunning {
    pub(crate) service: String,
    pub(crate) pid: u32,
    pub(crate) tracked: bool,
}

impl fmt::Display for AlreadyRunning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.tracked {
            write!(f, "{} is already running (pid {})", self.service, self.pid)
        } else {
            write!(
                f,
                "{} has an untracked process running (pid {})",
                self.service, self.pid
            )
        }
    }
}

impl std::error::Error for AlreadyRunning {}

#[derive(Debug)]
pub(crate) struct StartFailed {
    pub(crate) service: String,
    pub(crate) pid: Option<u32>,
    pub(crate) log_tail: Vec<String>,
}

impl fmt::Display for StartFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pid {
            Some(pid) => write!(f, "{} exited right after launch (pid {pid})", self.service)?,
            None => write!(f, "{} failed to launch", self.service)?,
        }
        if self.log_tail.is_empty() {
            write!(f, "; log is empty")
        } else {
            write!(f, "; last log lines:")?;
            for line in &self.log_tail {
                write!(f, "\n  | {line}")?;
            }
            Ok(())
        }
    }
}

impl std::error::Error for StartFailed {}

#[derive(Debug)]
pub(crate) struct MigrationFailed {
    pub(crate) filename: String,
    pub(crate) detail: String,
}

impl fmt::Display for MigrationFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "migration {} failed", self.filename)?;
        if !self.detail.is_empty() {
            write!(f, ": {}", self.detail)?;
        }
        Ok(())
    }
}

impl std::error::Error for MigrationFailed {}

#[derive(Debug)]
pub(crate) struct Unreachable {
    pub(crate) host: String,
    pub(crate) attempts: u32,
    pub(crate) last_error: String,
}

impl fmt::Display for Unreachable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} not reachable after {} attempts: {}",
            self.host, self.attempts, self.last_error
        )
    }
}

impl std::error::Error for Unreachable {}

#[derive(Debug)]
pub(crate) struct BuildFailed {
    pub(crate) command: String,
    pub(crate) status: Option<i32>,
}

impl fmt::Display for BuildFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(code) => write!(f, "build `{}` exited with status {code}", self.command),
            None => write!(f, "build `{}` was terminated by a signal", self.command),
        }
    }
}

impl std::error::Error for BuildFailed {}

/// Raised after a loop over services in which at least one service failed.
#[derive(Debug)]
pub(crate) struct PartialFailure {
    pub(crate) action: &'static str,
    pub(crate) failed: Vec<String>,
}

impl fmt::Display for PartialFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed for {}",
            self.action,
            self.failed.join(", ")
        )
    }
}

impl std::error::Error for PartialFailure {}

/// Errors raised before any remote call was made.
pub(crate) fn is_precondition(err: &anyhow::Error) -> bool {
    err.downcast_ref::<MissingState>().is_some()
        || err.downcast_ref::<StateExists>().is_some()
        || err.downcast_ref::<UnknownService>().is_some()
        || err.downcast_ref::<MissingSetting>().is_some()
        || err.downcast_ref::<BuildFailed>().is_some()
}

pub(crate) fn remedy(err: &anyhow::Error) -> Option<String> {
    if err.downcast_ref::<MissingState>().is_some() {
        return Some("provision the host, then run `fleetctl init --host <addr> --key <file>`".to_string());
    }
    if err.downcast_ref::<StateExists>().is_some() {
        return Some("run `fleetctl teardown` first".to_string());
    }
    if let Some(missing) = err.downcast_ref::<MissingSetting>() {
        return Some(missing.hint.to_string());
    }
    if let Some(running) = err.downcast_ref::<AlreadyRunning>() {
        return Some(if running.tracked {
            format!("use `fleetctl restart {}` to replace it", running.service)
        } else {
            format!("run `fleetctl stop {}` to clean it up", running.service)
        });
    }
    if let Some(failed) = err.downcast_ref::<StartFailed>() {
        return Some(format!("inspect `fleetctl logs {}`", failed.service));
    }
    if err.downcast_ref::<MigrationFailed>().is_some() {
        return Some("fix the migration and rerun `fleetctl migrate`; applied files are skipped".to_string());
    }
    if err.downcast_ref::<Unreachable>().is_some() {
        return Some("check the instance and its network group, or run `fleetctl teardown` and re-provision".to_string());
    }
    None
}
