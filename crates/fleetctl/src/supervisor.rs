use std::fmt;
use std::time::Duration;

use tracing::{info, warn};

use crate::channel::{Channel, RemoteScript};
use crate::config::Timing;
use crate::errors::{AlreadyRunning, MissingSetting, StartFailed};
use crate::registry::{ServiceDescriptor, ServiceRegistry};

const PERSIST_FLAG: &str = "--persist";
const LOG_TAIL_LINES: usize = 20;
const STOP_POLL: Duration = Duration::from_millis(200);

const LAUNCH_TEMPLATE: &str = r#"fleet_refresh
if [ -f "$fleet_pid_file" ]; then
  fleet_pid=$(fleet_read_pid "$fleet_pid_file")
  if fleet_owns "$fleet_pid" "$fleet_pattern"; then
    echo "running $fleet_pid"
    exit 0
  fi
  rm -f "$fleet_pid_file"
  echo "stale $fleet_pid"
fi
for fleet_orphan in $(fleet_match "$fleet_pattern"); do
  echo "untracked $fleet_orphan"
  exit 0
done
mkdir -p "$(dirname "$fleet_pid_file")" "$(dirname "$fleet_log")" || exit 3
if [ -f "$fleet_log" ]; then
  mv -f "$fleet_log" "$fleet_log.1"
fi
cd "$fleet_workdir" || exit 3
if [ -n "$fleet_env_file" ] && [ -f "$fleet_env_file" ]; then
  while IFS= read -r fleet_line || [ -n "$fleet_line" ]; do
    fleet_line=${fleet_line#export }
    case "$fleet_line" in
      ''|'#'*|=*) continue ;;
      *=*) ;;
      *) continue ;;
    esac
    fleet_key=${fleet_line%%=*}
    case "$fleet_key" in [0-9]*|*[!A-Za-z0-9_]*) continue ;; esac
    fleet_value=${fleet_line#*=}
    case "$fleet_value" in
      \"*\") fleet_value=${fleet_value#\"}; fleet_value=${fleet_value%\"} ;;
      \'*\') fleet_value=${fleet_value#\'}; fleet_value=${fleet_value%\'} ;;
    esac
    export "$fleet_key=$fleet_value"
  done < "$fleet_env_file"
fi
if [ -n "$fleet_database_url" ]; then
  DATABASE_URL=$fleet_database_url
  export DATABASE_URL
fi
if command -v setsid >/dev/null 2>&1; then
  setsid "$@" </dev/null >>"$fleet_log" 2>&1 &
else
  nohup "$@" </dev/null >>"$fleet_log" 2>&1 &
fi
fleet_pid=$!
printf '%s\n' "$fleet_pid" > "$fleet_pid_file"
echo "launched $fleet_pid $(date +%s)"
"#;

const PROBE_TEMPLATE: &str = r#"if fleet_alive "$fleet_pid"; then
  echo alive
  exit 0
fi
echo dead
tail -n "$fleet_tail" "$fleet_log" 2>/dev/null | sed 's/^/log /'
"#;

const STOP_TEMPLATE: &str = r#"fleet_refresh
fleet_pid=
fleet_targets=
if [ -f "$fleet_pid_file" ]; then
  fleet_pid=$(fleet_read_pid "$fleet_pid_file")
  if fleet_owns "$fleet_pid" "$fleet_pattern"; then
    kill -TERM -- "-$fleet_pid" 2>/dev/null || kill -TERM "$fleet_pid" 2>/dev/null
    echo "stopped $fleet_pid"
    fleet_targets=$fleet_pid
  else
    echo "stale $fleet_pid"
  fi
fi
for fleet_orphan in $(fleet_match "$fleet_pattern"); do
  [ "$fleet_orphan" = "$fleet_pid" ] && continue
  kill -TERM "$fleet_orphan" 2>/dev/null && echo "orphan $fleet_orphan"
  fleet_targets="$fleet_targets $fleet_orphan"
done
if [ -n "$fleet_targets" ] && ! fleet_wait_gone "$fleet_ticks_max" $fleet_targets; then
  for fleet_w in $fleet_targets; do
    if fleet_alive "$fleet_w"; then
      kill -KILL "$fleet_w" 2>/dev/null
      echo "killed $fleet_w"
    fi
  done
fi
rm -f "$fleet_pid_file"
"#;

/// What a detached launch needs from the host besides the argv.
#[derive(Debug, Clone, Default)]
pub(crate) struct LaunchEnv {
    pub(crate) workdir: String,
    /// `KEY=value` file read (never sourced) before launch.
    pub(crate) env_file: Option<String>,
    pub(crate) database_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ProcessHandle {
    pub(crate) pid: u32,
    pub(crate) started_at: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct StopReport {
    pub(crate) stopped: Option<u32>,
    pub(crate) stale: Option<u32>,
    pub(crate) orphans: Vec<u32>,
    pub(crate) killed: Vec<u32>,
}

impl StopReport {
    pub(crate) fn nothing_to_stop(&self) -> bool {
        self.stopped.is_none() && self.orphans.is_empty()
    }

    fn parse(stdout: &str) -> Self {
        let mut report = Self::default();
        for line in stdout.lines() {
            let Some((tag, value)) = line.trim().split_once(' ') else {
                continue;
            };
            let Ok(pid) = value.trim().parse::<u32>() else {
                continue;
            };
            match tag {
                "stopped" => report.stopped = Some(pid),
                "stale" => report.stale = Some(pid),
                "orphan" => report.orphans.push(pid),
                "killed" => report.killed.push(pid),
                _ => {}
            }
        }
        report
    }
}

impl fmt::Display for StopReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nothing_to_stop() {
            write!(f, "nothing to stop")?;
            if let Some(pid) = self.stale {
                write!(f, " (removed stale pid file for {pid})")?;
            }
            return Ok(());
        }
        write!(f, "stopped")?;
        let mut details = Vec::new();
        if let Some(pid) = self.stopped {
            details.push(format!("pid {pid}"));
        }
        if !self.orphans.is_empty() {
            let pids: Vec<String> = self.orphans.iter().map(u32::to_string).collect();
            details.push(format!("orphan {}", pids.join(",")));
        }
        if !self.killed.is_empty() {
            let pids: Vec<String> = self.killed.iter().map(u32::to_string).collect();
            details.push(format!("force-killed {}", pids.join(",")));
        }
        write!(f, " ({})", details.join("; "))
    }
}

/// Outcome of one service inside a loop over the fleet.
pub(crate) struct ServiceOutcome<T> {
    pub(crate) service: String,
    pub(crate) result: anyhow::Result<T>,
}

pub(crate) struct Supervisor<'a> {
    channel: &'a dyn Channel,
    launch: LaunchEnv,
    timing: Timing,
}

impl<'a> Supervisor<'a> {
    pub(crate) fn new(channel: &'a dyn Channel, launch: LaunchEnv, timing: Timing) -> Self {
        Self {
            channel,
            launch,
            timing,
        }
    }

    /// Launches `service` detached from the channel; refuses if an instance is alive.
    pub(crate) async fn start(
        &self,
        service: &ServiceDescriptor,
        args: &[String],
    ) -> anyhow::Result<ProcessHandle> {
        let argv = service.argv(args);
        if argv.iter().any(|arg| arg == PERSIST_FLAG) && self.launch.database_url.is_none() {
            return Err(MissingSetting {
                name: "remote database URL",
                hint: "persistence was requested; set remote.database_url in fleet.toml or FLEET_REMOTE_DATABASE_URL",
            }
            .into());
        }
        info!(
            event = "supervisor.starting",
            service = %service.name,
            command = %shell_words::join(&argv),
            "starting service"
        );
        let script = launch_script(service, &argv, &self.launch);
        let output = self
            .channel
            .execute(&script)
            .await?
            .check(&format!("start {}", service.name))?;
        let handle = match parse_launch(&output.stdout) {
            LaunchResult::Launched(handle) => handle,
            LaunchResult::Running { pid, tracked } => {
                return Err(AlreadyRunning {
                    service: service.name.clone(),
                    pid,
                    tracked,
                }
                .into());
            }
            LaunchResult::Unknown => {
                anyhow::bail!(
                    "start {}: unexpected launch output: {}",
                    service.name,
                    output.stdout.trim()
                );
            }
        };

        tokio::time::sleep(self.timing.start_grace).await;

        let probe = RemoteScript::with_helpers()
            .set("fleet_pid", &handle.pid.to_string())
            .set("fleet_log", &service.log_file)
            .set("fleet_tail", &LOG_TAIL_LINES.to_string())
            .line(PROBE_TEMPLATE);
        let output = self
            .channel
            .execute(&probe)
            .await?
            .check(&format!("probe {}", service.name))?;
        let mut lines = output.lines();
        if lines.next().map(str::trim) == Some("alive") {
            info!(
                event = "supervisor.running",
                service = %service.name,
                pid = handle.pid,
                started_at = handle.started_at,
                "service running"
            );
            return Ok(handle);
        }
        let log_tail = lines
            .filter_map(|line| line.strip_prefix("log "))
            .map(str::to_string)
            .collect();
        warn!(
            event = "supervisor.dead_after_start",
            service = %service.name,
            pid = handle.pid,
            "service exited during grace period"
        );
        Err(StartFailed {
            service: service.name.clone(),
            pid: Some(handle.pid),
            log_tail,
        }
        .into())
    }

    /// Terminates the tracked process and any untracked matches. Idempotent.
    pub(crate) async fn stop(&self, service: &ServiceDescriptor) -> anyhow::Result<StopReport> {
        let ticks = (self.timing.stop_timeout.as_millis() / STOP_POLL.as_millis()).max(1);
        let script = RemoteScript::with_helpers()
            .set("fleet_pid_file", &service.pid_file)
            .set("fleet_pattern", &service.match_pattern)
            .set("fleet_ticks_max", &ticks.to_string())
            .line(STOP_TEMPLATE);
        let output = self
            .channel
            .execute(&script)
            .await?
            .check(&format!("stop {}", service.name))?;
        let report = StopReport::parse(&output.stdout);
        if !report.killed.is_empty() {
            warn!(
                event = "supervisor.force_killed",
                service = %service.name,
                pids = ?report.killed,
                "service ignored SIGTERM"
            );
        }
        if !report.orphans.is_empty() {
            warn!(
                event = "supervisor.orphans",
                service = %service.name,
                pids = ?report.orphans,
                "terminated untracked processes"
            );
        }
        info!(
            event = "supervisor.stopped",
            service = %service.name,
            noop = report.nothing_to_stop(),
            "stop complete"
        );
        Ok(report)
    }

    pub(crate) async fn restart(
        &self,
        service: &ServiceDescriptor,
        args: &[String],
    ) -> anyhow::Result<(StopReport, ProcessHandle)> {
        let report = self.stop(service).await?;
        tokio::time::sleep(self.timing.restart_settle).await;
        let handle = self.start(service, args).await?;
        Ok((report, handle))
    }

    /// Stops every registered service; one failure does not skip the rest.
    pub(crate) async fn stop_all(
        &self,
        registry: &ServiceRegistry,
    ) -> Vec<ServiceOutcome<StopReport>> {
        let mut outcomes = Vec::new();
        for service in registry.iter() {
            let result = self.stop(service).await;
            if let Err(err) = &result {
                warn!(
                    event = "supervisor.stop_failed",
                    service = %service.name,
                    error = %err,
                    "stop failed"
                );
            }
            outcomes.push(ServiceOutcome {
                service: service.name.clone(),
                result,
            });
        }
        outcomes
    }
}

fn launch_script(service: &ServiceDescriptor, argv: &[String], env: &LaunchEnv) -> RemoteScript {
    RemoteScript::with_helpers()
        .set("fleet_pid_file", &service.pid_file)
        .set("fleet_log", &service.log_file)
        .set("fleet_pattern", &service.match_pattern)
        .set("fleet_workdir", &env.workdir)
        .set("fleet_env_file", env.env_file.as_deref().unwrap_or(""))
        .set("fleet_database_url", env.database_url.as_deref().unwrap_or(""))
        .set_args(argv)
        .line(LAUNCH_TEMPLATE)
}

#[derive(Debug, PartialEq, Eq)]
enum LaunchResult {
    Launched(ProcessHandle),
    Running { pid: u32, tracked: bool },
    Unknown,
}

fn parse_launch(stdout: &str) -> LaunchResult {
    for line in stdout.lines() {
        let mut parts = line.split_whitespace();
        let tag = parts.next();
        let pid = parts.next().and_then(|value| value.parse::<u32>().ok());
        match (tag, pid) {
            (Some("running"), Some(pid)) => return LaunchResult::Running { pid, tracked: true },
            (Some("untracked"), Some(pid)) => {
                return LaunchResult::Running {
                    pid,
                    tracked: false,
                }
            }
            (Some("launched"), Some(pid)) => {
                let started_at = parts
                    .next()
                    .and_then(|value| value.parse::<u64>().ok())
                    .unwrap_or_default();
                return LaunchResult::Launched(ProcessHandle { pid, started_at });
            }
            _ => {}
        }
    }
    LaunchResult::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::local::LocalChannel;
    use crate::status::{collect_status, ServiceState, StatusRequest};
    use crate::test_utils::{
        fast_timing, kill_hard, pid_alive, wait_until_dead, LocalFleet, RecordingChannel,
    };

    fn supervisor<'a>(channel: &'a dyn Channel, fleet: &LocalFleet) -> Supervisor<'a> {
        Supervisor::new(
            channel,
            LaunchEnv {
                workdir: fleet.workdir(),
                env_file: Some(".env".to_string()),
                database_url: None,
            },
            fast_timing(),
        )
    }

    async fn status_of(fleet: &LocalFleet, name: &str) -> crate::status::ServiceStatus {
        let request = StatusRequest {
            workdir: fleet.workdir(),
            tables: Vec::new(),
            database_url: None,
        };
        let snapshot = collect_status(&LocalChannel, &fleet.registry, &request)
            .await
            .expect("status");
        snapshot
            .services
            .into_iter()
            .find(|status| status.name == name)
            .expect("service in snapshot")
    }

    #[test]
    fn parses_launch_lines() {
        assert_eq!(
            parse_launch("stale 12\nlaunched 345 1700000000\n"),
            LaunchResult::Launched(ProcessHandle {
                pid: 345,
                started_at: 1_700_000_000
            })
        );
        assert_eq!(
            parse_launch("running 9\n"),
            LaunchResult::Running { pid: 9, tracked: true }
        );
        assert_eq!(
            parse_launch("untracked 10\n"),
            LaunchResult::Running { pid: 10, tracked: false }
        );
        assert_eq!(parse_launch("bash: setsid: oops\n"), LaunchResult::Unknown);
    }

    #[test]
    fn stop_report_wording() {
        let report = StopReport::parse("stale 4\n");
        assert!(report.nothing_to_stop());
        assert_eq!(report.to_string(), "nothing to stop (removed stale pid file for 4)");

        let report = StopReport::parse("stopped 10\norphan 11\norphan 12\nkilled 12\n");
        assert!(!report.nothing_to_stop());
        assert_eq!(
            report.to_string(),
            "stopped (pid 10; orphan 11,12; force-killed 12)"
        );
        assert_eq!(StopReport::parse("").to_string(), "nothing to stop");
    }

    #[tokio::test]
    async fn persist_without_database_url_fails_before_any_remote_call() {
        let fleet = LocalFleet::new("fleet-persist", &["alpha"]);
        let channel = RecordingChannel::default();
        let supervisor = supervisor(&channel, &fleet);
        let err = supervisor
            .start(fleet.service("alpha"), &["--persist".to_string()])
            .await
            .expect_err("missing url");
        assert!(err.downcast_ref::<MissingSetting>().is_some());
        assert!(channel.scripts().is_empty());
    }

    #[tokio::test]
    async fn launch_script_quotes_forwarded_arguments() {
        let fleet = LocalFleet::new("fleet-quote", &["alpha"]);
        let channel = RecordingChannel::default();
        channel.respond("launched 4242 1700000000\n", 0);
        channel.respond("alive\n", 0);
        let supervisor = supervisor(&channel, &fleet);
        let handle = supervisor
            .start(fleet.service("alpha"), &["--coins".to_string(), "btc; rm -rf /".to_string()])
            .await
            .expect("start");
        assert_eq!(handle.pid, 4242);
        let scripts = channel.scripts();
        assert_eq!(scripts.len(), 2);
        assert!(scripts[0].contains("'--coins' 'btc; rm -rf /'"));
        assert!(scripts[1].contains("fleet_pid='4242'"));
    }

    #[tokio::test]
    async fn stop_when_not_running_is_a_noop() {
        let fleet = LocalFleet::new("fleet-noop", &["alpha"]);
        let supervisor = supervisor(&LocalChannel, &fleet);
        let report = supervisor.stop(fleet.service("alpha")).await.expect("stop");
        assert!(report.nothing_to_stop());
        assert_eq!(report.to_string(), "nothing to stop");
        assert!(!std::path::Path::new(&fleet.service("alpha").pid_file).exists());
        assert_eq!(status_of(&fleet, "alpha").await.state, ServiceState::Stopped);
    }

    #[tokio::test]
    async fn second_start_fails_with_already_running() {
        let fleet = LocalFleet::new("fleet-twice", &["alpha"]);
        let supervisor = supervisor(&LocalChannel, &fleet);
        let service = fleet.service("alpha");
        let handle = supervisor.start(service, &[]).await.expect("first start");
        assert!(pid_alive(handle.pid));

        let err = supervisor.start(service, &[]).await.expect_err("second start");
        let running = err.downcast_ref::<AlreadyRunning>().expect("typed error");
        assert_eq!(running.pid, handle.pid);
        assert!(running.tracked);
        let pid_file = std::fs::read_to_string(&service.pid_file).expect("pid file");
        assert_eq!(pid_file.trim(), handle.pid.to_string());

        let report = supervisor.stop(service).await.expect("stop");
        assert_eq!(report.stopped, Some(handle.pid));
        wait_until_dead(handle.pid).await;
        assert!(!std::path::Path::new(&service.pid_file).exists());
    }

    #[tokio::test]
    async fn start_rotates_log_and_passes_default_args() {
        let fleet = LocalFleet::new("fleet-rotate", &["alpha"]);
        let supervisor = supervisor(&LocalChannel, &fleet);
        let service = fleet.service("alpha");
        std::fs::create_dir_all(fleet.dir.join("logs")).expect("logs dir");
        std::fs::write(&service.log_file, "previous run\n").expect("old log");

        let handle = supervisor.start(service, &[]).await.expect("start");
        let rotated = std::fs::read_to_string(format!("{}.1", service.log_file)).expect("rotated");
        assert_eq!(rotated, "previous run\n");
        let log = std::fs::read_to_string(&service.log_file).expect("log");
        assert!(log.contains("service up: --mode paper"), "log was {log:?}");

        supervisor.stop(service).await.expect("stop");
        wait_until_dead(handle.pid).await;
    }

    #[tokio::test]
    async fn launch_exports_env_file_and_database_url() {
        let fleet = LocalFleet::new("fleet-env", &["alpha"]);
        let script = fleet.dir.join("env-service.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\necho \"db=$DATABASE_URL key=$API_KEY q=$QUERY\"\nwhile :; do sleep 1; done\n",
        )
        .expect("script");
        std::fs::write(
            fleet.dir.join(".env"),
            "# comment\nexport API_KEY=\"abc 123\"\nDATABASE_URL=postgres://local\nQUERY=a?b=c\nnot a pair\n",
        )
        .expect("env");
        let mut service = fleet.service("alpha").clone();
        service.command = vec!["sh".to_string(), script.display().to_string()];
        service.match_pattern = script.display().to_string();

        let supervisor = Supervisor::new(
            &LocalChannel,
            LaunchEnv {
                workdir: fleet.workdir(),
                env_file: Some(".env".to_string()),
                database_url: Some("postgres://colocated".to_string()),
            },
            fast_timing(),
        );
        let handle = supervisor.start(&service, &[]).await.expect("start");
        let log = std::fs::read_to_string(&service.log_file).expect("log");
        assert!(log.contains("db=postgres://colocated key=abc 123 q=a?b=c"), "log was {log:?}");
        supervisor.stop(&service).await.expect("stop");
        wait_until_dead(handle.pid).await;
    }

    #[tokio::test]
    async fn start_failure_attaches_log_tail() {
        let fleet = LocalFleet::new("fleet-crash", &["alpha"]);
        let script = fleet.dir.join("crash.sh");
        std::fs::write(&script, "#!/bin/sh\necho 'fatal: config missing'\nexit 1\n")
            .expect("script");
        let mut service = fleet.service("alpha").clone();
        service.command = vec!["sh".to_string(), script.display().to_string()];
        service.match_pattern = script.display().to_string();

        let supervisor = supervisor(&LocalChannel, &fleet);
        let err = supervisor.start(&service, &[]).await.expect_err("crash");
        let failed = err.downcast_ref::<StartFailed>().expect("typed error");
        assert_eq!(failed.log_tail, vec!["fatal: config missing".to_string()]);
    }

    #[tokio::test]
    async fn orphan_is_reported_then_stopped() {
        let fleet = LocalFleet::new("fleet-orphan", &["alpha"]);
        let mut orphan = fleet.spawn_orphan("alpha");
        let orphan_pid = orphan.id();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let status = status_of(&fleet, "alpha").await;
        assert_eq!(status.state, ServiceState::Orphan);
        assert!(status.orphan_pids.contains(&orphan_pid));

        let supervisor = supervisor(&LocalChannel, &fleet);
        let err = supervisor
            .start(fleet.service("alpha"), &[])
            .await
            .expect_err("untracked instance");
        let running = err.downcast_ref::<AlreadyRunning>().expect("typed error");
        assert!(!running.tracked);

        let report = supervisor.stop(fleet.service("alpha")).await.expect("stop");
        assert!(report.orphans.contains(&orphan_pid));
        assert!(report.stopped.is_none());
        orphan.wait().expect("reap orphan");
        assert!(!std::path::Path::new(&fleet.service("alpha").pid_file).exists());
        assert_eq!(status_of(&fleet, "alpha").await.state, ServiceState::Stopped);
    }

    #[tokio::test]
    async fn recycled_pid_is_treated_as_stale() {
        let fleet = LocalFleet::new("fleet-recycled", &["alpha"]);
        let service = fleet.service("alpha");
        let mut bystander = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn bystander");
        let bystander_pid = bystander.id();
        let run_dir = std::path::Path::new(&service.pid_file)
            .parent()
            .expect("run dir")
            .to_path_buf();
        std::fs::create_dir_all(&run_dir).expect("run dir");
        let write_pid = || {
            std::fs::write(&service.pid_file, format!("{bystander_pid}\n")).expect("pid file")
        };

        write_pid();
        let status = status_of(&fleet, "alpha").await;
        assert_eq!(status.state, ServiceState::Dead);
        assert_eq!(status.pid, Some(bystander_pid));

        let supervisor = supervisor(&LocalChannel, &fleet);
        write_pid();
        let report = supervisor.stop(service).await.expect("stop");
        assert_eq!(report.stale, Some(bystander_pid));
        assert!(report.nothing_to_stop());
        assert!(pid_alive(bystander_pid));

        write_pid();
        let handle = supervisor.start(service, &[]).await.expect("start over stale pid");
        assert_ne!(handle.pid, bystander_pid);
        assert!(pid_alive(bystander_pid));

        supervisor.stop(service).await.expect("stop");
        wait_until_dead(handle.pid).await;
        assert!(pid_alive(bystander_pid));
        bystander.kill().expect("kill bystander");
        bystander.wait().expect("reap bystander");
    }

    #[tokio::test]
    async fn scenario_a_running_and_stopped() {
        let fleet = LocalFleet::new("fleet-scenario-a", &["alpha", "beta"]);
        let supervisor = supervisor(&LocalChannel, &fleet);
        let handle = supervisor
            .start(fleet.service("alpha"), &[])
            .await
            .expect("start alpha");

        let alpha = status_of(&fleet, "alpha").await;
        assert_eq!(alpha.state, ServiceState::Running);
        assert_eq!(alpha.pid, Some(handle.pid));
        assert!(alpha.uptime_secs.is_some_and(|secs| secs < 60));
        let beta = status_of(&fleet, "beta").await;
        assert_eq!(beta.state, ServiceState::Stopped);
        assert_eq!(beta.pid, None);

        supervisor.stop(fleet.service("alpha")).await.expect("stop");
        wait_until_dead(handle.pid).await;
    }

    #[tokio::test]
    async fn scenario_c_killed_process_reports_dead() {
        let fleet = LocalFleet::new("fleet-scenario-c", &["alpha"]);
        let supervisor = supervisor(&LocalChannel, &fleet);
        let service = fleet.service("alpha");
        let handle = supervisor.start(service, &[]).await.expect("start");

        kill_hard(handle.pid);
        wait_until_dead(handle.pid).await;
        assert!(std::path::Path::new(&service.pid_file).exists());

        let status = status_of(&fleet, "alpha").await;
        assert_eq!(status.state, ServiceState::Dead);
        assert_eq!(status.pid, Some(handle.pid));
        assert!(!std::path::Path::new(&service.pid_file).exists());
    }

    #[tokio::test]
    async fn scenario_d_stop_all_reports_each_service() {
        let fleet = LocalFleet::new("fleet-scenario-d", &["alpha", "beta"]);
        let supervisor = supervisor(&LocalChannel, &fleet);
        let handle = supervisor
            .start(fleet.service("alpha"), &[])
            .await
            .expect("start alpha");

        let outcomes = supervisor.stop_all(&fleet.registry).await;
        assert_eq!(outcomes.len(), 2);
        let alpha = outcomes[0].result.as_ref().expect("alpha stop");
        assert_eq!(outcomes[0].service, "alpha");
        assert!(alpha.to_string().starts_with("stopped"));
        let beta = outcomes[1].result.as_ref().expect("beta stop");
        assert_eq!(beta.to_string(), "nothing to stop");
        wait_until_dead(handle.pid).await;
    }

    #[tokio::test]
    async fn restart_replaces_the_process() {
        let fleet = LocalFleet::new("fleet-restart", &["alpha"]);
        let supervisor = supervisor(&LocalChannel, &fleet);
        let service = fleet.service("alpha");

        let (report, first) = supervisor.restart(service, &[]).await.expect("restart from stopped");
        assert!(report.nothing_to_stop());

        let (report, second) = supervisor.restart(service, &[]).await.expect("restart running");
        assert_eq!(report.stopped, Some(first.pid));
        assert_ne!(first.pid, second.pid);
        wait_until_dead(first.pid).await;
        assert!(pid_alive(second.pid));

        supervisor.stop(service).await.expect("stop");
        wait_until_dead(second.pid).await;
    }
}
