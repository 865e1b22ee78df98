// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::auth::AuthKey;
use crate::codec::{Status, write_frame};
use crate::error::{ControllerError, Result};
use crate::master::{Master, ProcessExit};
use crate::protocol::manager::ManagerCommand;
use crate::protocol::process::handle_message;
use crate::respawn::RespawnPolicy;
use crate::state::ProcessState;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, MutexGuard, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Longest stderr line logged as a single record; longer lines are split.
pub const STDERR_LINE_LIMIT: usize = 8192;

/// Log target for relayed stderr lines.
pub const STDIO_TARGET: &str = "dd_procctl::stdio";

const RECENT_STARTS: usize = 10;

/// A run at least this long resets the respawn backoff.
pub const STABLE_RUN: Duration = Duration::from_secs(60);

/// What to launch. Immutable once the process is registered.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub name: String,
    /// Program followed by its arguments.
    pub command: Vec<String>,
    /// Complete environment of the child; nothing is inherited.
    pub env: HashMap<String, String>,
    pub working_dir: PathBuf,
}

/// How a run ended, as seen by the controller.
#[derive(Debug, Clone, Copy)]
pub struct RunSummary {
    pub uptime: Duration,
    /// The run ended after [`ManagedProcess::stop`].
    pub requested: bool,
    pub exit: ProcessExit,
}

struct RunState {
    state: ProcessState,
    pid: Option<u32>,
    generation: u64,
    started_at: Option<Instant>,
    recent_starts: VecDeque<Instant>,
    respawn_count: u32,
}

impl RunState {
    fn transition(&mut self, next: ProcessState) {
        if !self.state.can_transition_to(next) {
            warn!(from = %self.state, to = %next, "unexpected state transition");
        }
        self.state = next;
    }
}

pub struct ManagedProcess {
    spec: ProcessSpec,
    auth_key: AuthKey,
    initial: bool,
    respawn_policy: Arc<dyn RespawnPolicy>,
    stdin: Mutex<Option<ChildStdin>>,
    run: std::sync::Mutex<RunState>,
}

impl ManagedProcess {
    pub fn new(
        spec: ProcessSpec,
        auth_key: AuthKey,
        initial: bool,
        respawn_policy: Arc<dyn RespawnPolicy>,
    ) -> Self {
        Self {
            spec,
            auth_key,
            initial,
            respawn_policy,
            stdin: Mutex::new(None),
            run: std::sync::Mutex::new(RunState {
                state: ProcessState::Created,
                pid: None,
                generation: 0,
                started_at: None,
                recent_starts: VecDeque::with_capacity(RECENT_STARTS),
                respawn_count: 0,
            }),
        }
    }

    fn run(&self) -> MutexGuard<'_, RunState> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    pub fn auth_key(&self) -> AuthKey {
        self.auth_key
    }

    /// Whether this is the process the daemon was launched with.
    pub fn is_initial(&self) -> bool {
        self.initial
    }

    pub fn state(&self) -> ProcessState {
        self.run().state
    }

    pub fn is_running(&self) -> bool {
        self.state().is_alive()
    }

    pub fn pid(&self) -> Option<u32> {
        self.run().pid
    }

    /// Number of starts recorded within the last `window`.
    pub fn starts_within(&self, window: Duration) -> usize {
        let run = self.run();
        run.recent_starts
            .iter()
            .filter(|t| t.elapsed() <= window)
            .count()
    }

    /// Spawn the child unless one is already running. Returns whether a child was spawned.
    ///
    /// The child's environment is exactly the configured one. Its first input
    /// frame is the authentication key. Commands it writes on stdout are dispatched
    /// to `master` until the stream closes; `master` is then told the run ended.
    /// Callers serialize starts through the controller lock.
    pub async fn start(self: &Arc<Self>, master: Arc<dyn Master>) -> Result<bool> {
        if self.is_running() {
            debug!(process = %self.spec.name, "already running");
            return Ok(false);
        }
        let spawn_error = |source: io::Error| ControllerError::Spawn {
            name: self.spec.name.clone(),
            source,
        };
        let Some((program, args)) = self.spec.command.split_first() else {
            return Err(spawn_error(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty command line",
            )));
        };

        let mut child = Command::new(program)
            .args(args)
            .env_clear()
            .envs(&self.spec.env)
            .current_dir(&self.spec.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_error)?;
        let (Some(mut stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(spawn_error(io::Error::other("child stdio was not captured")));
        };

        let pid = child.id();
        let generation = {
            let mut run = self.run();
            let now = Instant::now();
            run.transition(ProcessState::Running);
            run.pid = pid;
            run.generation += 1;
            run.started_at = Some(now);
            if run.recent_starts.len() == RECENT_STARTS {
                run.recent_starts.pop_front();
            }
            run.recent_starts.push_back(now);
            run.generation
        };
        info!(process = %self.spec.name, pid, generation, cmd = %program, "spawned");

        {
            let mut input = self.stdin.lock().await;
            let key = ManagerCommand::AuthKey(self.auth_key).encode();
            if let Err(e) = write_frame(&mut stdin, &key).await {
                warn!(process = %self.spec.name, error = %e, "failed to send authentication key");
            }
            *input = Some(stdin);
        }

        let span = info_span!("process", name = %self.spec.name);
        tokio::spawn(drain_errors(self.spec.name.clone(), stderr).instrument(span.clone()));
        tokio::spawn(supervise(Arc::clone(self), master, stdout, child, generation).instrument(span));
        Ok(true)
    }

    /// Ask the child to exit: send SHUTDOWN and close its input.
    ///
    /// Returns false if the process was not running or already stopping.
    pub async fn stop(&self) -> Result<bool> {
        {
            let mut run = self.run();
            if run.state != ProcessState::Running {
                return Ok(false);
            }
            run.transition(ProcessState::Stopping);
        }
        let Some(mut stdin) = self.stdin.lock().await.take() else {
            // Input already closed; the run is ending on its own.
            return Ok(true);
        };
        info!(process = %self.spec.name, "stopping");
        let result = write_frame(&mut stdin, &ManagerCommand::Shutdown.encode()).await;
        drop(stdin);
        result.map_err(|source| ControllerError::Write {
            name: self.spec.name.clone(),
            source,
        })?;
        Ok(true)
    }

    /// Write raw bytes to the child's input and flush.
    pub async fn write_input(&self, bytes: &[u8]) -> Result<()> {
        let mut input = self.stdin.lock().await;
        let stdin = input
            .as_mut()
            .ok_or_else(|| ControllerError::NotStarted(self.spec.name.clone()))?;
        write_frame(stdin, bytes)
            .await
            .map_err(|source| ControllerError::Write {
                name: self.spec.name.clone(),
                source,
            })
    }

    pub async fn send(&self, command: &ManagerCommand) -> Result<()> {
        self.write_input(&command.encode()).await
    }

    async fn close_input(&self) {
        self.stdin.lock().await.take();
    }

    /// Record the end of run `generation`. `None` if that run was already accounted for.
    pub fn finish_run(&self, generation: u64, exit: ProcessExit) -> Option<RunSummary> {
        let mut run = self.run();
        if run.generation != generation || !run.state.is_alive() {
            return None;
        }
        let uptime = run.started_at.map(|t| t.elapsed()).unwrap_or_default();
        let requested = run.state == ProcessState::Stopping;
        run.transition(match exit {
            ProcessExit::SupervisionLost => ProcessState::Failed,
            ProcessExit::Exited(_) if requested => ProcessState::Stopped,
            ProcessExit::Exited(_) => ProcessState::Exited,
        });
        run.pid = None;
        if uptime >= STABLE_RUN {
            run.respawn_count = 0;
        }
        Some(RunSummary {
            uptime,
            requested,
            exit,
        })
    }

    /// Consult the respawn policy for the next attempt. Giving up marks the process failed.
    pub fn next_respawn_delay(&self) -> Option<Duration> {
        let mut run = self.run();
        run.respawn_count = run.respawn_count.saturating_add(1);
        let delay = self.respawn_policy.timeout(run.respawn_count);
        if delay.is_none() {
            run.transition(ProcessState::Failed);
        }
        delay
    }

    pub fn respawn_count(&self) -> u32 {
        self.run().respawn_count
    }

    pub fn reset_respawn_count(&self) {
        self.run().respawn_count = 0;
    }
}

async fn supervise(
    process: Arc<ManagedProcess>,
    master: Arc<dyn Master>,
    stdout: ChildStdout,
    child: Child,
    generation: u64,
) {
    let reader = tokio::spawn(
        read_output(Arc::clone(&process), Arc::clone(&master), stdout, child)
            .in_current_span(),
    );
    let exit = match reader.await {
        Ok(exit) => exit,
        Err(e) => {
            error!(error = %e, "output reader died, process is no longer supervised");
            ProcessExit::SupervisionLost
        }
    };
    process.close_input().await;
    master.process_exited(process.name(), generation, exit).await;
}

async fn read_output(
    process: Arc<ManagedProcess>,
    master: Arc<dyn Master>,
    stdout: ChildStdout,
    mut child: Child,
) -> ProcessExit {
    let mut reader = BufReader::new(stdout);
    loop {
        match handle_message(&mut reader, master.as_ref(), process.name()).await {
            Ok(Status::EndOfStream) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "failed reading process output");
                break;
            }
        }
    }
    drop(reader);

    match child.wait().await {
        Ok(status) => {
            info!(%status, "exited");
            ProcessExit::Exited(Some(status))
        }
        Err(e) => {
            warn!(error = %e, "failed to collect exit status");
            ProcessExit::Exited(None)
        }
    }
}

/// Splits a byte stream into lines of at most `limit` bytes.
#[derive(Debug)]
pub struct LineSplitter {
    line: Vec<u8>,
    limit: usize,
}

impl LineSplitter {
    pub fn new(limit: usize) -> Self {
        Self {
            line: Vec::new(),
            limit,
        }
    }

    pub fn feed(&mut self, bytes: &[u8], mut emit: impl FnMut(&[u8])) {
        for &byte in bytes {
            if byte == b'\n' {
                emit(&self.line);
                self.line.clear();
                continue;
            }
            self.line.push(byte);
            if self.line.len() >= self.limit {
                emit(&self.line);
                self.line.clear();
            }
        }
    }

    /// Emit whatever is left after the stream closed.
    pub fn finish(&mut self, mut emit: impl FnMut(&[u8])) {
        if !self.line.is_empty() {
            emit(&self.line);
            self.line.clear();
        }
    }
}

fn log_stderr_line(process: &str, line: &[u8]) {
    let text = String::from_utf8_lossy(line);
    info!(target: STDIO_TARGET, process, "{}", text.trim_end_matches('\r'));
}

async fn drain_errors<R: AsyncRead + Unpin>(name: String, stderr: R) {
    let mut reader = BufReader::new(stderr);
    let mut lines = LineSplitter::new(STDERR_LINE_LIMIT);
    loop {
        let buf = match reader.fill_buf().await {
            Ok([]) => break,
            Ok(buf) => buf,
            Err(e) => {
                debug!(error = %e, "stderr closed");
                break;
            }
        };
        let len = buf.len();
        lines.feed(buf, |line| log_stderr_line(&name, line));
        reader.consume(len);
    }
    lines.finish(|line| log_stderr_line(&name, line));
}
