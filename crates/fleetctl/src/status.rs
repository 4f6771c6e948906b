use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;

use serde::Serialize;
use tracing::debug;

use crate::channel::{Channel, RemoteScript};
use crate::registry::ServiceRegistry;

pub(crate) const FLEET_SCOPE: &str = "@fleet";

const FLEET_TEMPLATE: &str = r#"fleet_mtime() {
  stat -c %Y "$1" 2>/dev/null || date -r "$1" +%s 2>/dev/null
}
fleet_uptime() {
  fleet_up=$(ps -o etimes= -p "$1" 2>/dev/null | tr -d ' ')
  case "$fleet_up" in
    ''|*[!0-9]*) ;;
    *) echo "$fleet_up"; return 0 ;;
  esac
  fleet_hz=$(getconf CLK_TCK 2>/dev/null || echo 100)
  fleet_start_ticks=$(sed 's/^.*) //' "/proc/$1/stat" 2>/dev/null | awk '{print $20}')
  fleet_boot=$(awk '/^btime/ {print $2}' /proc/stat 2>/dev/null)
  [ -n "$fleet_start_ticks" ] && [ -n "$fleet_boot" ] || return 0
  echo $(( $(date +%s) - fleet_boot - fleet_start_ticks / fleet_hz ))
}
fleet_emit @fleet now "$(date +%s)"
fleet_disk=$(df -Pk "$fleet_dir" 2>/dev/null | awk 'NR==2 {print $3, $2}')
[ -n "$fleet_disk" ] && fleet_emit @fleet disk "$fleet_disk"
fleet_mem=$(awk '/^MemTotal:/ {t=$2} /^MemAvailable:/ {a=$2} END {if (t) print t-a, t}' /proc/meminfo 2>/dev/null)
[ -n "$fleet_mem" ] && fleet_emit @fleet mem "$fleet_mem"
if [ -n "$fleet_db" ] && [ -n "$fleet_tables" ] && command -v psql >/dev/null 2>&1; then
  for fleet_t in $fleet_tables; do
    fleet_n=$(psql "$fleet_db" -XAtq -c "SELECT count(*) FROM $fleet_t" </dev/null 2>/dev/null)
    [ -n "$fleet_n" ] && fleet_emit @fleet "rows:$fleet_t" "$fleet_n"
  done
fi
fleet_status() {
  fleet_name=$1
  fleet_pid_file=$2
  fleet_log=$3
  fleet_pid=
  if [ -f "$fleet_pid_file" ]; then
    fleet_pid=$(fleet_read_pid "$fleet_pid_file")
    fleet_emit "$fleet_name" pid "$fleet_pid"
    if fleet_owns "$fleet_pid" "$4"; then
      fleet_emit "$fleet_name" alive 1
      fleet_emit "$fleet_name" uptime "$(fleet_uptime "$fleet_pid")"
    else
      fleet_emit "$fleet_name" alive 0
      rm -f "$fleet_pid_file"
    fi
  fi
  for fleet_o in $(fleet_match "$4"); do
    [ "$fleet_o" = "$fleet_pid" ] && continue
    fleet_emit "$fleet_name" orphan "$fleet_o"
  done
  if [ -f "$fleet_log" ]; then
    fleet_emit "$fleet_name" log_mtime "$(fleet_mtime "$fleet_log")"
    fleet_emit "$fleet_name" log_line "$(tail -n 1 "$fleet_log" 2>/dev/null | tr -d '\r')"
  fi
}
fleet_refresh
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum ServiceState {
    Running,
    Dead,
    Stopped,
    Orphan,
}

impl ServiceState {
    pub(crate) fn label(self) -> &'static str {
        match self {
            ServiceState::Running => "running",
            ServiceState::Dead => "dead",
            ServiceState::Stopped => "stopped",
            ServiceState::Orphan => "orphan",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct ServiceStatus {
    pub(crate) name: String,
    pub(crate) state: ServiceState,
    pub(crate) pid: Option<u32>,
    pub(crate) orphan_pids: Vec<u32>,
    pub(crate) uptime_secs: Option<u64>,
    pub(crate) log_age_secs: Option<u64>,
    pub(crate) last_log_line: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub(crate) struct Usage {
    pub(crate) used_kb: u64,
    pub(crate) total_kb: u64,
}

impl Usage {
    fn parse(value: &str) -> Option<Self> {
        let mut parts = value.split_whitespace();
        let used_kb = parts.next()?.parse().ok()?;
        let total_kb = parts.next()?.parse().ok()?;
        Some(Self { used_kb, total_kb })
    }

    pub(crate) fn percent(&self) -> u64 {
        if self.total_kb == 0 {
            return 0;
        }
        self.used_kb.saturating_mul(100) / self.total_kb
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub(crate) struct FleetCounters {
    pub(crate) disk: Option<Usage>,
    pub(crate) memory: Option<Usage>,
    pub(crate) rows: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct StatusSnapshot {
    pub(crate) host: String,
    pub(crate) remote_time: Option<u64>,
    pub(crate) fleet: FleetCounters,
    pub(crate) services: Vec<ServiceStatus>,
}

/// Inputs for the fleet-wide part of the status script.
#[derive(Debug, Clone, Default)]
pub(crate) struct StatusRequest {
    pub(crate) workdir: String,
    pub(crate) tables: Vec<String>,
    pub(crate) database_url: Option<String>,
}

/// Collects every service's state and the host counters in one remote call.
pub(crate) async fn collect_status(
    channel: &dyn Channel,
    registry: &ServiceRegistry,
    request: &StatusRequest,
) -> anyhow::Result<StatusSnapshot> {
    let script = status_script(registry, request);
    let output = channel.execute(&script).await?.check("status")?;
    let mut snapshot = parse_status(registry, &output.stdout);
    snapshot.host = channel.describe();
    Ok(snapshot)
}

fn status_script(registry: &ServiceRegistry, request: &StatusRequest) -> RemoteScript {
    let mut script = RemoteScript::with_helpers()
        .set("fleet_dir", &request.workdir)
        .set("fleet_db", request.database_url.as_deref().unwrap_or(""))
        .set("fleet_tables", &request.tables.join(" "))
        .line(FLEET_TEMPLATE);
    for service in registry.iter() {
        script = script.command(&[
            "fleet_status",
            service.name.as_str(),
            service.pid_file.as_str(),
            service.log_file.as_str(),
            service.match_pattern.as_str(),
        ]);
    }
    script
}

#[derive(Default)]
struct RawService {
    tracked: bool,
    pid: Option<u32>,
    uptime: Option<u64>,
    alive: bool,
    orphans: Vec<u32>,
    log_mtime: Option<u64>,
    log_line: Option<String>,
}

/// Parses `<scope>\t<field>\t<value>` records; services come back in registry order.
pub(crate) fn parse_status(registry: &ServiceRegistry, stdout: &str) -> StatusSnapshot {
    let mut remote_time: Option<u64> = None;
    let mut fleet = FleetCounters::default();
    let mut raw: HashMap<&str, RawService> = registry
        .iter()
        .map(|service| (service.name.as_str(), RawService::default()))
        .collect();

    for line in stdout.lines() {
        let mut parts = line.splitn(3, '\t');
        let (Some(scope), Some(field), Some(value)) = (parts.next(), parts.next(), parts.next())
        else {
            if !line.trim().is_empty() {
                debug!(event = "status.unparsed_line", line = %line);
            }
            continue;
        };
        if scope == FLEET_SCOPE {
            match field {
                "now" => remote_time = value.trim().parse().ok(),
                "disk" => fleet.disk = Usage::parse(value),
                "mem" => fleet.memory = Usage::parse(value),
                _ => {
                    if let Some(table) = field.strip_prefix("rows:") {
                        if let Ok(count) = value.trim().parse() {
                            fleet.rows.insert(table.to_string(), count);
                        }
                    }
                }
            }
            continue;
        }
        let Some(entry) = raw.get_mut(scope) else {
            debug!(event = "status.unknown_scope", scope = %scope);
            continue;
        };
        match field {
            "pid" => {
                entry.tracked = true;
                entry.pid = value.trim().parse().ok();
            }
            "uptime" => entry.uptime = value.trim().parse().ok(),
            "alive" => entry.alive = value.trim() == "1",
            "orphan" => {
                if let Ok(pid) = value.trim().parse() {
                    entry.orphans.push(pid);
                }
            }
            "log_mtime" => entry.log_mtime = value.trim().parse().ok(),
            "log_line" => {
                let line = value.trim_end();
                if !line.is_empty() {
                    entry.log_line = Some(line.to_string());
                }
            }
            _ => debug!(event = "status.unknown_field", scope = %scope, field = %field),
        }
    }

    let services = registry
        .iter()
        .map(|service| {
            let entry = raw.remove(service.name.as_str()).unwrap_or_default();
            let state = classify(&entry);
            let age = |at: Option<u64>| match (remote_time, at) {
                (Some(now), Some(at)) => Some(now.saturating_sub(at)),
                _ => None,
            };
            ServiceStatus {
                name: service.name.clone(),
                state,
                pid: entry.pid,
                uptime_secs: if state == ServiceState::Running {
                    entry.uptime
                } else {
                    None
                },
                log_age_secs: age(entry.log_mtime),
                last_log_line: entry.log_line,
                orphan_pids: entry.orphans,
            }
        })
        .collect();

    StatusSnapshot {
        host: String::new(),
        remote_time,
        fleet,
        services,
    }
}

fn classify(entry: &RawService) -> ServiceState {
    match (entry.tracked, entry.alive, entry.orphans.is_empty()) {
        (true, true, _) => ServiceState::Running,
        (true, false, _) => ServiceState::Dead,
        (false, _, false) => ServiceState::Orphan,
        (false, _, true) => ServiceState::Stopped,
    }
}

pub(crate) fn format_age(secs: u64) -> String {
    match secs {
        0..=59 => format!("{secs}s"),
        60..=3599 => format!("{}m", secs / 60),
        _ => format!("{}h", secs / 3600),
    }
}

/// ANSI styling for terminal output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Palette {
    enabled: bool,
}

impl Palette {
    pub(crate) fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub(crate) fn paint(&self, code: &str, text: &str) -> String {
        if self.enabled {
            format!("\x1b[{code}m{text}\x1b[0m")
        } else {
            text.to_string()
        }
    }

    fn state(&self, state: ServiceState, text: &str) -> String {
        let code = match state {
            ServiceState::Running => "32",
            ServiceState::Dead => "31",
            ServiceState::Orphan => "33",
            ServiceState::Stopped => "2",
        };
        self.paint(code, text)
    }
}

const LAST_LINE_WIDTH: usize = 60;

pub(crate) fn render_table(snapshot: &StatusSnapshot, palette: Palette) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "host: {}", snapshot.host);
    let mut counters = Vec::new();
    if let Some(disk) = snapshot.fleet.disk {
        counters.push(format!(
            "disk {}% of {}",
            disk.percent(),
            format_kb(disk.total_kb)
        ));
    }
    if let Some(mem) = snapshot.fleet.memory {
        counters.push(format!(
            "mem {}% of {}",
            mem.percent(),
            format_kb(mem.total_kb)
        ));
    }
    if !counters.is_empty() {
        let _ = writeln!(out, "{}", counters.join("  "));
    }
    for (table, count) in &snapshot.fleet.rows {
        let _ = writeln!(out, "rows {table}: {count}");
    }
    out.push('\n');

    let name_width = snapshot
        .services
        .iter()
        .map(|status| status.name.len())
        .max()
        .unwrap_or(0)
        .max("SERVICE".len());
    let _ = writeln!(
        out,
        "{:<name_width$}  {:<8}  {:<8}  {:<6}  {:<5}  LAST LOG LINE",
        "SERVICE", "STATE", "PID", "UPTIME", "LOG"
    );
    for status in &snapshot.services {
        let pid = match (status.state, status.pid) {
            (ServiceState::Orphan, _) => status
                .orphan_pids
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(","),
            (_, Some(pid)) => pid.to_string(),
            (_, None) => "-".to_string(),
        };
        let uptime = status.uptime_secs.map(format_age).unwrap_or_else(|| "-".to_string());
        let log_age = status.log_age_secs.map(format_age).unwrap_or_else(|| "-".to_string());
        let last = status
            .last_log_line
            .as_deref()
            .map(|line| truncate(line, LAST_LINE_WIDTH))
            .unwrap_or_default();
        let state = palette.state(status.state, &format!("{:<8}", status.state.label()));
        let _ = writeln!(
            out,
            "{:<name_width$}  {state}  {pid:<8}  {uptime:<6}  {log_age:<5}  {last}",
            status.name
        );
        if status.state != ServiceState::Orphan && !status.orphan_pids.is_empty() {
            let pids: Vec<String> = status.orphan_pids.iter().map(u32::to_string).collect();
            let _ = writeln!(
                out,
                "{:<name_width$}  {}",
                "",
                palette.paint("33", &format!("untracked duplicates: {}", pids.join(",")))
            );
        }
    }
    out
}

fn format_kb(kb: u64) -> String {
    const MB: u64 = 1024;
    const GB: u64 = 1024 * 1024;
    if kb >= GB {
        format!("{:.1}G", kb as f64 / GB as f64)
    } else {
        format!("{}M", kb / MB)
    }
}

fn truncate(line: &str, width: usize) -> String {
    if line.chars().count() <= width {
        return line.to_string();
    }
    let mut cut: String = line.chars().take(width.saturating_sub(1)).collect();
    cut.push('…');
    cut
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::local::LocalChannel;
    use crate::test_utils::{LocalFleet, RecordingChannel};

    fn two_services() -> LocalFleet {
        LocalFleet::new("fleet-status", &["alpha", "beta"])
    }

    #[test]
    fn classifies_from_tagged_lines_regardless_of_order() {
        let fleet = two_services();
        let stdout = "@fleet\tnow\t1000\n\
beta\torphan\t77\n\
alpha\tlog_line\tticker: btc 64000\tfill\n\
alpha\tpid\t42\n\
@fleet\tdisk\t500 1000\n\
alpha\tuptime\t120\n\
alpha\talive\t1\n\
alpha\tlog_mtime\t990\n\
@fleet\trows:funding_rates\t12\n\
garbage line\n";
        let snapshot = parse_status(&fleet.registry, stdout);
        let alpha = &snapshot.services[0];
        assert_eq!(alpha.name, "alpha");
        assert_eq!(alpha.state, ServiceState::Running);
        assert_eq!(alpha.pid, Some(42));
        assert_eq!(alpha.uptime_secs, Some(120));
        assert_eq!(alpha.log_age_secs, Some(10));
        assert_eq!(alpha.last_log_line.as_deref(), Some("ticker: btc 64000\tfill"));
        let beta = &snapshot.services[1];
        assert_eq!(beta.state, ServiceState::Orphan);
        assert_eq!(beta.orphan_pids, vec![77]);
        assert_eq!(snapshot.fleet.disk.map(|d| d.percent()), Some(50));
        assert_eq!(snapshot.fleet.rows.get("funding_rates"), Some(&12));
    }

    #[test]
    fn dead_and_stopped_have_no_uptime() {
        let fleet = two_services();
        let stdout = "@fleet\tnow\t1000\nalpha\tpid\t42\nalpha\talive\t0\n";
        let snapshot = parse_status(&fleet.registry, stdout);
        assert_eq!(snapshot.services[0].state, ServiceState::Dead);
        assert_eq!(snapshot.services[0].uptime_secs, None);
        assert_eq!(snapshot.services[1].state, ServiceState::Stopped);
        assert_eq!(snapshot.services[1].pid, None);
    }

    #[test]
    fn log_age_needs_the_remote_clock() {
        let fleet = two_services();
        let stdout = "alpha\tpid\t42\nalpha\tuptime\t30\nalpha\talive\t1\nalpha\tlog_mtime\t900\n";
        let snapshot = parse_status(&fleet.registry, stdout);
        assert_eq!(snapshot.services[0].state, ServiceState::Running);
        assert_eq!(snapshot.services[0].uptime_secs, Some(30));
        assert_eq!(snapshot.services[0].log_age_secs, None);
        assert_eq!(snapshot.remote_time, None);
    }

    #[test]
    fn age_buckets() {
        assert_eq!(format_age(0), "0s");
        assert_eq!(format_age(59), "59s");
        assert_eq!(format_age(60), "1m");
        assert_eq!(format_age(3599), "59m");
        assert_eq!(format_age(7200), "2h");
    }

    #[test]
    fn table_without_colour_is_plain_text() {
        let fleet = two_services();
        let stdout = "@fleet\tnow\t1000\n@fleet\tmem\t1048576 2097152\nalpha\tpid\t42\nalpha\tuptime\t600\nalpha\talive\t1\n";
        let mut snapshot = parse_status(&fleet.registry, stdout);
        snapshot.host = "10.0.0.5".to_string();
        let table = render_table(&snapshot, Palette::new(false));
        assert!(table.contains("host: 10.0.0.5"));
        assert!(table.contains("mem 50% of 2.0G"));
        assert!(table.contains("alpha    running   42        10m"));
        assert!(table.contains("beta     stopped   -"));
        assert!(!table.contains('\x1b'));

        let coloured = render_table(&snapshot, Palette::new(true));
        assert!(coloured.contains("\x1b[32mrunning "));
    }

    #[test]
    fn snapshot_serializes_lowercase_states() {
        let fleet = two_services();
        let snapshot = parse_status(&fleet.registry, "");
        let json = serde_json::to_value(&snapshot).expect("json");
        assert_eq!(json["services"][0]["state"], "stopped");
        assert_eq!(json["services"][1]["name"], "beta");
    }

    #[tokio::test]
    async fn script_lists_every_service_once() {
        let fleet = two_services();
        let channel = RecordingChannel::default();
        let request = StatusRequest {
            workdir: "/srv/fleet".to_string(),
            tables: vec!["funding_rates".to_string()],
            database_url: Some("postgres://db".to_string()),
        };
        collect_status(&channel, &fleet.registry, &request)
            .await
            .expect("status");
        let scripts = channel.scripts();
        assert_eq!(scripts.len(), 1);
        assert_eq!(scripts[0].matches("\n'fleet_status' 'alpha'").count(), 1);
        assert_eq!(scripts[0].matches("\n'fleet_status' 'beta'").count(), 1);
        assert!(scripts[0].contains("fleet_tables='funding_rates'"));
    }

    #[tokio::test]
    async fn local_snapshot_reports_fleet_counters() {
        let fleet = two_services();
        std::fs::create_dir_all(fleet.dir.join("logs")).expect("logs");
        std::fs::write(&fleet.service("beta").log_file, "one\nlast line\n").expect("log");
        let request = StatusRequest {
            workdir: fleet.workdir(),
            tables: Vec::new(),
            database_url: None,
        };
        let snapshot = collect_status(&LocalChannel, &fleet.registry, &request)
            .await
            .expect("status");
        assert!(snapshot.remote_time.is_some());
        assert!(snapshot.fleet.disk.is_some());
        assert!(snapshot.fleet.rows.is_empty());
        let beta = &snapshot.services[1];
        assert_eq!(beta.state, ServiceState::Stopped);
        assert_eq!(beta.last_log_line.as_deref(), Some("last line"));
        assert!(beta.log_age_secs.is_some());
    }
}
