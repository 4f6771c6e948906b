use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use crate::channel::{Channel, ExecOutput, RemoteScript};
use crate::config::Timing;
use crate::registry::{ServiceDescriptor, ServiceRegistry};

pub(crate) fn temp_dir(prefix: &str) -> PathBuf {
    let mut dir = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    dir.push(format!("{prefix}-{}-{nanos}", std::process::id()));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

/// Records every call and answers `execute` from a queue of canned outputs.
#[derive(Default)]
pub(crate) struct RecordingChannel {
    pub(crate) scripts: Mutex<Vec<String>>,
    pub(crate) uploads: Mutex<Vec<(PathBuf, String)>>,
    responses: Mutex<VecDeque<ExecOutput>>,
}

impl RecordingChannel {
    pub(crate) fn respond(&self, stdout: &str, exit_code: i32) {
        self.responses
            .lock()
            .expect("responses")
            .push_back(ExecOutput {
                stdout: stdout.to_string(),
                stderr: String::new(),
                exit_code: Some(exit_code),
            });
    }

    pub(crate) fn scripts(&self) -> Vec<String> {
        self.scripts.lock().expect("scripts").clone()
    }
}

#[async_trait]
impl Channel for RecordingChannel {
    fn describe(&self) -> String {
        "recording".to_string()
    }

    async fn execute(&self, script: &RemoteScript) -> anyhow::Result<ExecOutput> {
        self.scripts
            .lock()
            .expect("scripts")
            .push(script.text().to_string());
        let next = self.responses.lock().expect("responses").pop_front();
        Ok(next.unwrap_or(ExecOutput {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: Some(0),
        }))
    }

    async fn upload(&self, local: &Path, remote: &str) -> anyhow::Result<()> {
        self.uploads
            .lock()
            .expect("uploads")
            .push((local.to_path_buf(), remote.to_string()));
        Ok(())
    }

    async fn download(&self, _remote: &str, _local: &Path) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A throwaway "host" directory with one looping script per service.
///
/// Scripts run as `sh <script>` rather than being executed directly, which avoids
/// `ETXTBSY` when another test thread forks while a script is still open for writing.
///
/// Each service's command line contains the script's unique path, which is also its match
/// pattern, so fixtures running in parallel never see each other's processes.
pub(crate) struct LocalFleet {
    pub(crate) dir: PathBuf,
    pub(crate) registry: ServiceRegistry,
}

impl LocalFleet {
    pub(crate) fn new(prefix: &str, names: &[&str]) -> Self {
        let dir = temp_dir(prefix);
        let services = names
            .iter()
            .map(|name| {
                let script = write_loop_script(&dir, name);
                ServiceDescriptor {
                    name: name.to_string(),
                    pid_file: dir.join("run").join(format!("{name}.pid")).display().to_string(),
                    log_file: dir.join("logs").join(format!("{name}.log")).display().to_string(),
                    match_pattern: script.display().to_string(),
                    command: vec!["sh".to_string(), script.display().to_string()],
                    default_args: vec!["--mode".to_string(), "paper".to_string()],
                    auto_restart: true,
                }
            })
            .collect();
        Self {
            registry: ServiceRegistry::new(services).expect("registry"),
            dir,
        }
    }

    pub(crate) fn service(&self, name: &str) -> &ServiceDescriptor {
        self.registry.get(name).expect("service")
    }

    pub(crate) fn workdir(&self) -> String {
        self.dir.display().to_string()
    }

    /// Starts a matching process without a PID file, as a crashed supervisor would leave it.
    pub(crate) fn spawn_orphan(&self, name: &str) -> std::process::Child {
        let service = self.service(name);
        std::process::Command::new(&service.command[0])
            .arg(&service.command[1])
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .expect("spawn orphan")
    }
}

fn write_loop_script(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(format!("{name}-service.sh"));
    fs::write(
        &path,
        "#!/bin/sh\necho \"service up: $*\"\nwhile :; do sleep 1; done\n",
    )
    .expect("write service script");
    path
}

pub(crate) fn fast_timing() -> Timing {
    Timing {
        start_grace: Duration::from_millis(300),
        restart_settle: Duration::from_millis(100),
        stop_timeout: Duration::from_secs(5),
        ssh_timeout: Duration::from_secs(30),
        transfer_timeout: Duration::from_secs(30),
        reachable_interval: Duration::from_millis(10),
        reachable_attempts: 2,
    }
}

pub(crate) fn kill_hard(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

pub(crate) fn pid_alive(pid: u32) -> bool {
    let stat = match fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat,
        Err(_) => return false,
    };
    let state = stat
        .rsplit_once(") ")
        .and_then(|(_, rest)| rest.chars().next());
    !matches!(state, None | Some('Z') | Some('X'))
}

pub(crate) async fn wait_until_dead(pid: u32) {
    for _ in 0..50 {
        if !pid_alive(pid) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("pid {pid} still alive");
}
