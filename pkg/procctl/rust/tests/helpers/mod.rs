// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

#![allow(dead_code)]

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Prefix of log lines carrying a child's relayed stderr.
const STDIO_PREFIX: &str = "dd_procctl::stdio: ";

/// Server manager script: reports its address and key on stderr, answers
/// SHUTDOWN_SERVERS and exits on SHUTDOWN.
pub const SERVER_MANAGER_SCRIPT: &str = r#"
printf 'sm-address=%s\n' "$DD_PC_ADDRESS" >&2
head -n 1 | tr '\000' ' ' >&2
while read -r cmd; do
  case "$cmd" in
    SHUTDOWN_SERVERS) printf 'SERVERS_SHUTDOWN\n' ;;
    SHUTDOWN) exit 0 ;;
  esac
done
"#;

/// Handle to a running dd-procctld daemon process.
pub struct DaemonHandle {
    child: Child,
    log_lines: Arc<Mutex<Vec<String>>>,
    _reader_thread: std::thread::JoinHandle<()>,
    _stderr_thread: std::thread::JoinHandle<()>,
}

impl DaemonHandle {
    /// Start the daemon supervising `/bin/sh -c script` as the server manager.
    pub fn start(working_dir: &Path, script: &str) -> Self {
        Self::start_with_env(working_dir, script, &[])
    }

    pub fn start_with_env(working_dir: &Path, script: &str, env: &[(&str, &str)]) -> Self {
        let mut args = vec![working_dir.display().to_string()];
        args.extend(["/bin/sh", "-c", script].map(String::from));
        Self::spawn(&args, env)
    }

    /// Start the daemon with raw command-line arguments.
    pub fn spawn(args: &[String], env: &[(&str, &str)]) -> Self {
        let bin = env!("CARGO_BIN_EXE_dd-procctld");
        let mut child = Command::new(bin)
            .args(args)
            .env("DD_PC_LISTEN_ADDR", "127.0.0.1:0")
            .env("DD_PC_LOG_LEVEL", "debug")
            .env_remove("DD_PC_CONFIG_FILE")
            .envs(env.iter().copied())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .expect("failed to start dd-procctld");

        let stdout = child.stdout.take().expect("failed to capture stdout");
        let stderr = child.stderr.take().expect("failed to capture stderr");
        let log_lines = Arc::new(Mutex::new(Vec::<String>::new()));

        // The fmt subscriber logs to stdout; clap and panics go to stderr.
        let reader_thread = capture(stdout, "daemon", Arc::clone(&log_lines));
        let stderr_thread = capture(stderr, "daemon:err", Arc::clone(&log_lines));

        Self {
            child,
            log_lines,
            _reader_thread: reader_thread,
            _stderr_thread: stderr_thread,
        }
    }

    /// Wait until a log line containing `pattern` appears, or timeout.
    pub fn wait_for_log(&self, pattern: &str, timeout: Duration) -> bool {
        self.wait_for_log_count(pattern, 1, timeout)
    }

    /// Wait until a log line containing `pattern` appears using the default timeout.
    pub fn wait_for_log_default(&self, pattern: &str) -> bool {
        self.wait_for_log(pattern, DEFAULT_TIMEOUT)
    }

    /// Count how many log lines contain `pattern`.
    pub fn count_log_matches(&self, pattern: &str) -> usize {
        let lines = self.log_lines.lock().unwrap();
        lines.iter().filter(|l| l.contains(pattern)).count()
    }

    /// Wait until the count of log lines matching `pattern` reaches at least `n`.
    pub fn wait_for_log_count(&self, pattern: &str, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.count_log_matches(pattern) >= n {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    /// Wait until a relayed child stderr line containing `marker` appears.
    pub fn wait_for_output(&self, marker: &str) -> bool {
        let deadline = Instant::now() + DEFAULT_TIMEOUT;
        loop {
            if self.output_value(marker).is_some() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    /// The token following `marker` in the first relayed child stderr line
    /// containing it. Daemon log lines that merely quote the child's command line
    /// are ignored.
    pub fn output_value(&self, marker: &str) -> Option<String> {
        let lines = self.log_lines.lock().unwrap();
        lines.iter().find_map(|l| {
            let output = &l[l.find(STDIO_PREFIX)? + STDIO_PREFIX.len()..];
            let start = output.find(marker)? + marker.len();
            let value: String = output[start..]
                .chars()
                .take_while(|c| !c.is_whitespace())
                .collect();
            (!value.is_empty()).then_some(value)
        })
    }

    /// Send a signal to the daemon process.
    pub fn send_signal(&self, sig: Signal) {
        let pid = self.child.id() as i32;
        signal::kill(Pid::from_raw(pid), sig).expect("failed to send signal to daemon");
    }

    /// Send SIGTERM and wait for the daemon to exit. Returns the exit status.
    pub fn stop(&mut self) -> ExitStatus {
        self.send_signal(Signal::SIGTERM);
        self.wait_with_timeout(DEFAULT_TIMEOUT)
    }

    /// Wait for the daemon to exit within the given timeout.
    pub fn wait_with_timeout(&mut self, timeout: Duration) -> ExitStatus {
        let deadline = Instant::now() + timeout;
        loop {
            match self
                .child
                .try_wait()
                .expect("failed to check daemon status")
            {
                Some(status) => return status,
                None => {
                    if Instant::now() >= deadline {
                        self.child.kill().ok();
                        return self.child.wait().expect("failed to wait on killed daemon");
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }

    /// PIDs of every spawn, in order, for the given process name.
    pub fn spawned_pids(&self, process: &str) -> Vec<u32> {
        let needle = format!("process={process} ");
        let lines = self.log_lines.lock().unwrap();
        lines
            .iter()
            .filter(|l| l.contains(" spawned ") && l.contains(&needle))
            .filter_map(|l| {
                let marker = "pid=";
                let start = l.find(marker)? + marker.len();
                let end = l[start..]
                    .find(|c: char| !c.is_ascii_digit())
                    .map_or(l.len(), |i| i + start);
                l[start..end].parse().ok()
            })
            .collect()
    }
}

impl Drop for DaemonHandle {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn capture(
    stream: impl Read + Send + 'static,
    label: &'static str,
    lines: Arc<Mutex<Vec<String>>>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            match line {
                Ok(l) => {
                    eprintln!("[{label}] {l}");
                    lines.lock().unwrap().push(l);
                }
                Err(_) => break,
            }
        }
    })
}

/// Write a YAML initial-process config into `dir` and return its path.
pub fn write_config(dir: &Path, yaml: &str) -> std::path::PathBuf {
    let path = dir.join("procctl.yaml");
    std::fs::write(&path, yaml)
        .unwrap_or_else(|e| panic!("failed to write {}: {e}", path.display()));
    path
}

/// Check if a PID is still alive.
pub fn pid_is_alive(pid: u32) -> bool {
    signal::kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Wait until a PID is no longer alive, or timeout.
pub fn wait_for_pid_gone(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !pid_is_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}
