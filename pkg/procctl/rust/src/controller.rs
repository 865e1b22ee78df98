// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! The process registry: owns every managed process and executes the commands
//! they (and authenticated peers) send.

use crate::auth::AuthKey;
use crate::master::{Master, ProcessExit, SERVER_MANAGER_PROCESS_NAME};
use crate::process::{ManagedProcess, ProcessSpec};
use crate::protocol::manager::ManagerCommand;
use crate::protocol::peer::{InventoryEntry, PeerEvent};
use crate::respawn::{NeverRespawn, RespawnPolicy};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub type PeerId = u64;

#[derive(Default)]
struct ProcessTable {
    by_name: HashMap<String, Arc<ManagedProcess>>,
    by_key: HashMap<AuthKey, Arc<ManagedProcess>>,
    peers: HashMap<PeerId, mpsc::UnboundedSender<PeerEvent>>,
    next_peer_id: PeerId,
    shutting_down: bool,
}

impl ProcessTable {
    /// Fan an event out to every registered peer, dropping closed connections.
    fn notify_peers(&mut self, event: PeerEvent) {
        self.peers.retain(|id, events| {
            let open = events.send(event.clone()).is_ok();
            if !open {
                debug!(peer = id, "dropping closed peer");
            }
            open
        });
    }

    fn remove(&mut self, name: &str) -> Option<Arc<ManagedProcess>> {
        let process = self.by_name.remove(name)?;
        self.by_key.remove(&process.auth_key());
        self.notify_peers(PeerEvent::ProcessRemoved {
            name: name.to_string(),
        });
        Some(process)
    }

    fn running_server_manager(&self) -> Option<Arc<ManagedProcess>> {
        self.by_name
            .get(SERVER_MANAGER_PROCESS_NAME)
            .filter(|p| p.is_running())
            .cloned()
    }
}

struct Inner {
    table: Mutex<ProcessTable>,
    /// Signalled whenever a process leaves the table.
    removed: Notify,
    /// Signalled when the server manager reports its servers are down, or exits.
    servers_shutdown: Notify,
    /// Cancelled once a shutdown has drained the table.
    finished: CancellationToken,
}

/// Shared handle to the process registry. Cloning is cheap.
#[derive(Clone)]
pub struct ProcessController {
    inner: Arc<Inner>,
}

impl Default for ProcessController {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessController {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                table: Mutex::new(ProcessTable::default()),
                removed: Notify::new(),
                servers_shutdown: Notify::new(),
                finished: CancellationToken::new(),
            }),
        }
    }

    fn master(&self) -> Arc<dyn Master> {
        Arc::new(self.clone())
    }

    /// Register the process the daemon was launched with. It gets `policy` for
    /// respawns; processes added later are never respawned by the controller.
    pub async fn add_initial_process(
        &self,
        name: &str,
        command: Vec<String>,
        env: HashMap<String, String>,
        working_dir: PathBuf,
        policy: Arc<dyn RespawnPolicy>,
    ) -> Option<AuthKey> {
        let spec = ProcessSpec {
            name: name.to_string(),
            command,
            env,
            working_dir,
        };
        self.register(spec, true, policy).await
    }

    async fn register(
        &self,
        spec: ProcessSpec,
        initial: bool,
        policy: Arc<dyn RespawnPolicy>,
    ) -> Option<AuthKey> {
        let mut table = self.inner.table.lock().await;
        if table.shutting_down {
            warn!(process = %spec.name, "attempted to add a process during shutdown");
            return None;
        }
        if table.by_name.contains_key(&spec.name) {
            warn!(process = %spec.name, "attempted to register duplicate named process");
            return None;
        }
        let mut key = AuthKey::generate();
        while table.by_key.contains_key(&key) {
            key = AuthKey::generate();
        }
        let name = spec.name.clone();
        info!(process = %name, dir = %spec.working_dir.display(), "added process");
        debug!(process = %name, cmd = ?spec.command, "command line");
        let process = Arc::new(ManagedProcess::new(spec, key, initial, policy));
        table.by_name.insert(name.clone(), Arc::clone(&process));
        table.by_key.insert(key, process);
        table.notify_peers(PeerEvent::ProcessAdded { name });
        Some(key)
    }

    /// Start `process` while holding the table lock.
    async fn start_locked(&self, table: &mut ProcessTable, process: &Arc<ManagedProcess>) {
        if table.shutting_down {
            warn!(process = %process.name(), "not starting process during shutdown");
            return;
        }
        match process.start(self.master()).await {
            Ok(true) => table.notify_peers(PeerEvent::ProcessStarted {
                name: process.name().to_string(),
            }),
            Ok(false) => debug!(process = %process.name(), "start ignored, already running"),
            Err(e) => error!(process = %process.name(), error = %e, "failed to start process"),
        }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<ManagedProcess>> {
        self.inner.table.lock().await.by_name.get(name).cloned()
    }

    pub async fn process_by_auth_key(&self, key: &AuthKey) -> Option<Arc<ManagedProcess>> {
        self.inner.table.lock().await.by_key.get(key).cloned()
    }

    pub async fn process_names(&self) -> Vec<String> {
        let table = self.inner.table.lock().await;
        let mut names: Vec<String> = table.by_name.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn inventory(&self) -> Vec<InventoryEntry> {
        let table = self.inner.table.lock().await;
        let mut entries: Vec<InventoryEntry> = table
            .by_name
            .values()
            .map(|p| InventoryEntry {
                name: p.name().to_string(),
                auth_key: p.auth_key(),
                running: p.is_running(),
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    pub async fn is_shutting_down(&self) -> bool {
        self.inner.table.lock().await.shutting_down
    }

    /// Subscribe a peer connection to process events.
    pub async fn register_peer(&self, events: mpsc::UnboundedSender<PeerEvent>) -> PeerId {
        let mut table = self.inner.table.lock().await;
        let id = table.next_peer_id;
        table.next_peer_id += 1;
        table.peers.insert(id, events);
        id
    }

    pub async fn unregister_peer(&self, id: PeerId) {
        self.inner.table.lock().await.peers.remove(&id);
    }

    /// Write an already-encoded frame to `recipient`, logging failures.
    async fn deliver(&self, recipient: &str, frame: &[u8]) {
        let Some(process) = self.get(recipient).await else {
            warn!(process = recipient, "attempted to message a non-existent process");
            return;
        };
        if let Err(e) = process.write_input(frame).await {
            warn!(process = recipient, error = %e, "failed to deliver message");
        }
    }

    /// Write an already-encoded frame to every running process except `sender`.
    async fn deliver_all(&self, sender: Option<&str>, frame: &[u8]) {
        let recipients: Vec<Arc<ManagedProcess>> = {
            let table = self.inner.table.lock().await;
            table
                .by_name
                .values()
                .filter(|p| Some(p.name()) != sender && p.is_running())
                .cloned()
                .collect()
        };
        for process in recipients {
            if let Err(e) = process.write_input(frame).await {
                warn!(process = %process.name(), error = %e, "failed to deliver broadcast");
            }
        }
    }

    /// Stop every process and wait until all of them are gone.
    ///
    /// A running server manager is first asked to shut its servers down, and the
    /// other processes are only stopped once it reports back or exits. There is
    /// no timeout: a child that never exits blocks shutdown.
    pub async fn shutdown(&self) {
        let server_manager = {
            let mut table = self.inner.table.lock().await;
            if !table.shutting_down {
                info!(processes = table.by_name.len(), "shutting down");
            }
            table.shutting_down = true;
            table.running_server_manager()
        };

        if let Some(server_manager) = server_manager {
            let reported = self.inner.servers_shutdown.notified();
            tokio::pin!(reported);
            reported.as_mut().enable();
            match server_manager.send(&ManagerCommand::ShutdownServers).await {
                Ok(()) if server_manager.is_running() => {
                    info!("waiting for server manager to shut servers down");
                    reported.await;
                }
                Ok(()) => {}
                Err(e) => warn!(error = %e, "could not ask server manager to shut servers down"),
            }
        }

        let running = {
            let mut table = self.inner.table.lock().await;
            let (running, idle): (Vec<_>, Vec<_>) = table
                .by_name
                .values()
                .cloned()
                .partition(|p| p.is_running());
            for process in idle {
                table.remove(process.name());
            }
            running
        };
        // Stopped outside the table lock: a child whose input pipe is full must
        // not stall exits reported by the others.
        for process in running {
            if let Err(e) = process.stop().await {
                warn!(process = %process.name(), error = %e, "failed to stop process");
            }
        }
        self.inner.removed.notify_waiters();

        loop {
            let removed = self.inner.removed.notified();
            tokio::pin!(removed);
            removed.as_mut().enable();
            let remaining = self.inner.table.lock().await.by_name.len();
            if remaining == 0 {
                break;
            }
            debug!(remaining, "waiting for processes to exit");
            removed.await;
        }
        info!("all processes finished");
        self.inner.finished.cancel();
    }

    /// Resolves once a shutdown, whoever started it, has drained the table.
    pub async fn wait_for_shutdown(&self) {
        self.inner.finished.cancelled().await;
    }

    async fn respawn_later(self, name: String, delay: Duration) {
        tokio::time::sleep(delay).await;
        let mut table = self.inner.table.lock().await;
        let Some(process) = table.by_name.get(&name).cloned() else {
            debug!(process = %name, "respawn skipped, process was removed");
            return;
        };
        if process.is_running() {
            return;
        }
        info!(
            process = %name,
            attempt = process.respawn_count(),
            recent_starts = process.starts_within(Duration::from_secs(60)),
            "respawning"
        );
        self.start_locked(&mut table, &process).await;
    }
}

#[async_trait]
impl Master for ProcessController {
    async fn add_process(
        &self,
        name: String,
        command: Vec<String>,
        env: HashMap<String, String>,
        working_dir: String,
    ) {
        let spec = ProcessSpec {
            name,
            command,
            env,
            working_dir: PathBuf::from(working_dir),
        };
        self.register(spec, false, Arc::new(NeverRespawn)).await;
    }

    async fn start_process(&self, name: &str) {
        let mut table = self.inner.table.lock().await;
        let Some(process) = table.by_name.get(name).cloned() else {
            warn!(process = name, "attempted to start a non-existent process");
            return;
        };
        process.reset_respawn_count();
        self.start_locked(&mut table, &process).await;
    }

    async fn stop_process(&self, name: &str) {
        let Some(process) = self.get(name).await else {
            warn!(process = name, "attempted to stop a non-existent process");
            return;
        };
        match process.stop().await {
            Ok(true) => {}
            Ok(false) => debug!(process = name, "stop ignored, not running"),
            Err(e) => warn!(process = name, error = %e, "failed to stop process"),
        }
    }

    async fn remove_process(&self, name: &str) {
        let mut table = self.inner.table.lock().await;
        let Some(process) = table.by_name.get(name) else {
            warn!(process = name, "attempted to remove a non-existent process");
            return;
        };
        if process.is_running() {
            warn!(process = name, "attempted to remove a running process");
            return;
        }
        table.remove(name);
        drop(table);
        info!(process = name, "removed process");
        self.inner.removed.notify_waiters();
    }

    async fn send_message(&self, sender: &str, recipient: &str, message: Vec<String>) {
        let frame = ManagerCommand::Msg {
            sender: sender.to_string(),
            message,
        }
        .encode();
        self.deliver(recipient, &frame).await;
    }

    async fn send_message_bytes(&self, sender: &str, recipient: &str, message: Vec<u8>) {
        let frame = ManagerCommand::MsgBytes {
            sender: sender.to_string(),
            message,
        }
        .encode();
        self.deliver(recipient, &frame).await;
    }

    async fn broadcast_message(&self, sender: &str, message: Vec<String>) {
        let frame = ManagerCommand::Msg {
            sender: sender.to_string(),
            message,
        }
        .encode();
        self.deliver_all(Some(sender), &frame).await;
    }

    async fn broadcast_message_bytes(&self, sender: &str, message: Vec<u8>) {
        let frame = ManagerCommand::MsgBytes {
            sender: sender.to_string(),
            message,
        }
        .encode();
        self.deliver_all(Some(sender), &frame).await;
    }

    async fn servers_shutdown(&self) {
        info!("server manager reports servers are shut down");
        self.inner.servers_shutdown.notify_waiters();
    }

    async fn reconnect_servers_to_server_manager(&self, address: &str, port: &str) {
        let frame = ManagerCommand::ReconnectServerManager {
            address: address.to_string(),
            port: port.to_string(),
        }
        .encode();
        self.deliver_all(Some(SERVER_MANAGER_PROCESS_NAME), &frame).await;
    }

    async fn reconnect_process_to_server_manager(&self, name: &str, address: &str, port: &str) {
        let frame = ManagerCommand::ReconnectServerManager {
            address: address.to_string(),
            port: port.to_string(),
        }
        .encode();
        self.deliver(name, &frame).await;
    }

    async fn send_stdin(&self, recipient: &str, bytes: Vec<u8>) {
        self.deliver(recipient, &bytes).await;
    }

    async fn process_exited(&self, name: &str, generation: u64, exit: ProcessExit) {
        let mut table = self.inner.table.lock().await;
        let Some(process) = table.by_name.get(name).cloned() else {
            return;
        };
        let Some(summary) = process.finish_run(generation, exit) else {
            return;
        };
        table.notify_peers(PeerEvent::ProcessStopped {
            name: name.to_string(),
            uptime_ms: i64::try_from(summary.uptime.as_millis()).unwrap_or(i64::MAX),
        });
        if name == SERVER_MANAGER_PROCESS_NAME {
            self.inner.servers_shutdown.notify_waiters();
        }

        if table.shutting_down {
            table.remove(name);
            drop(table);
            info!(process = name, "process finished");
            self.inner.removed.notify_waiters();
            return;
        }
        if summary.requested {
            info!(process = name, "process stopped");
            return;
        }
        if exit == ProcessExit::SupervisionLost {
            error!(process = name, "lost track of process, not respawning");
            return;
        }

        warn!(process = name, exit = ?exit, uptime_ms = summary.uptime.as_millis() as u64, "process exited unexpectedly");
        let server_manager = if name == SERVER_MANAGER_PROCESS_NAME {
            None
        } else {
            table.running_server_manager()
        };

        match process.next_respawn_delay() {
            Some(delay) => {
                info!(
                    process = name,
                    delay_ms = delay.as_millis() as u64,
                    "waiting until trying to restart"
                );
                tokio::spawn(self.clone().respawn_later(name.to_string(), delay));
            }
            None => info!(process = name, "not restarting process"),
        }
        drop(table);

        // Reported outside the table lock, like any other message.
        if let Some(server_manager) = server_manager
            && let Err(e) = server_manager
                .send(&ManagerCommand::Down {
                    name: name.to_string(),
                })
                .await
        {
            warn!(process = name, error = %e, "failed to report process down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::tests::shell;
    use crate::respawn::DefaultRespawnPolicy;
    use crate::state::ProcessState;

    async fn add(controller: &ProcessController, spec: ProcessSpec) {
        controller
            .add_process(
                spec.name,
                spec.command,
                spec.env,
                spec.working_dir.display().to_string(),
            )
            .await;
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never became true");
    }

    async fn state_of(controller: &ProcessController, name: &str) -> Option<ProcessState> {
        controller.get(name).await.map(|p| p.state())
    }

    /// Records its raw input, answers SHUTDOWN_SERVERS and exits on SHUTDOWN.
    const SERVER_MANAGER: &str = r#"tee "$OUT" | while read -r cmd; do
  case "$cmd" in
    SHUTDOWN_SERVERS) sleep 0.3; echo servers-down >> "$LOG"; printf 'SERVERS_SHUTDOWN\n' ;;
    SHUTDOWN) exit 0 ;;
  esac
done"#;

    fn with_env(mut spec: ProcessSpec, vars: &[(&str, &std::path::Path)]) -> ProcessSpec {
        for (key, path) in vars {
            spec.env.insert(key.to_string(), path.display().to_string());
        }
        spec
    }

    async fn add_server_manager(controller: &ProcessController, spec: ProcessSpec) {
        controller
            .add_initial_process(
                SERVER_MANAGER_PROCESS_NAME,
                spec.command,
                spec.env,
                spec.working_dir,
                Arc::new(NeverRespawn),
            )
            .await
            .unwrap();
        controller.start_process(SERVER_MANAGER_PROCESS_NAME).await;
    }

    fn find_frame(path: &std::path::Path, frame: &[u8]) -> Option<usize> {
        let contents = std::fs::read(path).ok()?;
        contents.windows(frame.len()).position(|w| w == frame)
    }

    /// Delegates to the controller but panics while relaying a message.
    struct PanicOnSend(ProcessController);

    #[async_trait]
    impl Master for PanicOnSend {
        async fn add_process(
            &self,
            name: String,
            command: Vec<String>,
            env: HashMap<String, String>,
            working_dir: String,
        ) {
            self.0.add_process(name, command, env, working_dir).await
        }
        async fn start_process(&self, name: &str) {
            self.0.start_process(name).await
        }
        async fn stop_process(&self, name: &str) {
            self.0.stop_process(name).await
        }
        async fn remove_process(&self, name: &str) {
            self.0.remove_process(name).await
        }
        async fn send_message(&self, _sender: &str, recipient: &str, _message: Vec<String>) {
            panic!("relay to {recipient} failed");
        }
        async fn send_message_bytes(&self, sender: &str, recipient: &str, message: Vec<u8>) {
            self.0.send_message_bytes(sender, recipient, message).await
        }
        async fn broadcast_message(&self, sender: &str, message: Vec<String>) {
            self.0.broadcast_message(sender, message).await
        }
        async fn broadcast_message_bytes(&self, sender: &str, message: Vec<u8>) {
            self.0.broadcast_message_bytes(sender, message).await
        }
        async fn servers_shutdown(&self) {
            self.0.servers_shutdown().await
        }
        async fn reconnect_servers_to_server_manager(&self, address: &str, port: &str) {
            self.0.reconnect_servers_to_server_manager(address, port).await
        }
        async fn reconnect_process_to_server_manager(&self, name: &str, address: &str, port: &str) {
            self.0
                .reconnect_process_to_server_manager(name, address, port)
                .await
        }
        async fn send_stdin(&self, recipient: &str, bytes: Vec<u8>) {
            self.0.send_stdin(recipient, bytes).await
        }
        async fn process_exited(&self, name: &str, generation: u64, exit: ProcessExit) {
            self.0.process_exited(name, generation, exit).await
        }
    }

    #[tokio::test]
    async fn test_unexpected_exit_reported_to_server_manager() {
        let dir = tempfile::tempdir().unwrap();
        let sm_in = dir.path().join("sm.in");
        let log = dir.path().join("log");
        let controller = ProcessController::new();
        let sm = shell(SERVER_MANAGER_PROCESS_NAME, SERVER_MANAGER);
        add_server_manager(&controller, with_env(sm, &[("OUT", &sm_in), ("LOG", &log)])).await;

        add(&controller, shell("crasher", "exit 3")).await;
        add(&controller, shell("quiet", "exec cat > /dev/null")).await;
        controller.start_process("quiet").await;
        controller.start_process("crasher").await;

        let down = ManagerCommand::Down {
            name: "crasher".into(),
        }
        .encode();
        wait_until(|| find_frame(&sm_in, &down).is_some()).await;

        let quiet = controller.get("quiet").await.unwrap();
        controller.stop_process("quiet").await;
        wait_until(|| quiet.state() == ProcessState::Stopped).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        let requested = ManagerCommand::Down {
            name: "quiet".into(),
        }
        .encode();
        assert_eq!(find_frame(&sm_in, &requested), None);

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_reconnect_skips_server_manager() {
        let dir = tempfile::tempdir().unwrap();
        let sm_in = dir.path().join("sm.in");
        let log = dir.path().join("log");
        let controller = ProcessController::new();
        let sm = shell(SERVER_MANAGER_PROCESS_NAME, SERVER_MANAGER);
        add_server_manager(&controller, with_env(sm, &[("OUT", &sm_in), ("LOG", &log)])).await;

        let mut outputs = Vec::new();
        for name in ["b", "c"] {
            let out = dir.path().join(format!("{name}.in"));
            add(&controller, with_env(shell(name, r#"exec cat > "$OUT""#), &[("OUT", &out)])).await;
            controller.start_process(name).await;
            outputs.push(out);
        }

        controller
            .reconnect_servers_to_server_manager("10.0.0.7", "9990")
            .await;

        let frame = ManagerCommand::ReconnectServerManager {
            address: "10.0.0.7".into(),
            port: "9990".into(),
        }
        .encode();
        for out in &outputs {
            wait_until(|| find_frame(out, &frame).is_some()).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(find_frame(&sm_in, &frame), None);

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_server_manager_first() {
        let dir = tempfile::tempdir().unwrap();
        let sm_in = dir.path().join("sm.in");
        let worker_in = dir.path().join("worker.in");
        let log = dir.path().join("log");
        let controller = ProcessController::new();
        let sm = shell(SERVER_MANAGER_PROCESS_NAME, SERVER_MANAGER);
        add_server_manager(&controller, with_env(sm, &[("OUT", &sm_in), ("LOG", &log)])).await;

        let worker = shell(
            "worker",
            r#"tee "$OUT" | while read -r cmd; do
  [ "$cmd" = SHUTDOWN ] && { echo worker-stopped >> "$LOG"; exit 0; }
done"#,
        );
        add(&controller, with_env(worker, &[("OUT", &worker_in), ("LOG", &log)])).await;
        controller.start_process("worker").await;

        tokio::time::timeout(Duration::from_secs(10), controller.shutdown())
            .await
            .expect("shutdown did not finish");

        let events = std::fs::read_to_string(&log).unwrap();
        let events: Vec<&str> = events.lines().collect();
        assert_eq!(events, vec!["servers-down", "worker-stopped"]);

        let shutdown = ManagerCommand::Shutdown.encode();
        let servers = find_frame(&sm_in, &ManagerCommand::ShutdownServers.encode()).unwrap();
        assert!(servers < find_frame(&sm_in, &shutdown).unwrap());
        assert!(find_frame(&worker_in, &ManagerCommand::ShutdownServers.encode()).is_none());
        assert!(find_frame(&worker_in, &shutdown).is_some());
    }

    #[tokio::test]
    async fn test_lost_supervision_fails_without_respawn() {
        let controller = ProcessController::new();
        let spec = shell("fragile", r"printf 'SEND\000x\000hi\n'; exec cat > /dev/null");
        controller
            .add_initial_process(
                "fragile",
                spec.command,
                spec.env,
                spec.working_dir,
                Arc::new(DefaultRespawnPolicy),
            )
            .await
            .unwrap();
        let fragile = controller.get("fragile").await.unwrap();

        let master: Arc<dyn Master> = Arc::new(PanicOnSend(controller.clone()));
        assert!(fragile.start(master).await.unwrap());
        wait_until(|| fragile.state() == ProcessState::Failed).await;

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fragile.state(), ProcessState::Failed);
        assert_eq!(fragile.respawn_count(), 0);
        assert_eq!(controller.process_names().await, vec!["fragile"]);

        controller.shutdown().await;
        assert!(controller.process_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_full_input_pipe_does_not_block_other_processes() {
        let controller = ProcessController::new();
        add(&controller, shell("stuck", "exec sleep 3")).await;
        add(&controller, shell("other", "exec cat > /dev/null")).await;
        controller.start_process("stuck").await;
        controller.start_process("other").await;

        // Nothing drains stuck's stdin, so both writes park until it exits.
        let flood = tokio::spawn({
            let controller = controller.clone();
            async move { controller.send_stdin("stuck", vec![b'x'; 1 << 20]).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        let stop_stuck = tokio::spawn({
            let controller = controller.clone();
            async move { controller.stop_process("stuck").await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let other = controller.get("other").await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), controller.stop_process("other"))
            .await
            .expect("stop blocked behind another process");
        wait_until(|| other.state() == ProcessState::Stopped).await;
        assert!(!stop_stuck.is_finished());

        flood.await.unwrap();
        stop_stuck.await.unwrap();
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_wait_for_shutdown_resolves_after_drain() {
        let controller = ProcessController::new();
        add(&controller, shell("svc", "exec cat > /dev/null")).await;
        controller.start_process("svc").await;

        let waiter = tokio::spawn({
            let controller = controller.clone();
            async move { controller.wait_for_shutdown().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        tokio::spawn({
            let controller = controller.clone();
            async move { controller.shutdown().await }
        });
        tokio::time::timeout(Duration::from_secs(10), waiter)
            .await
            .expect("waiter never woke")
            .unwrap();
        assert!(controller.process_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_add_keeps_first() {
        let controller = ProcessController::new();
        add(&controller, shell("a", "exit 0")).await;
        let first = controller.get("a").await.unwrap().auth_key();

        add(&controller, shell("a", "exit 1")).await;
        assert_eq!(controller.process_names().await, vec!["a"]);
        assert_eq!(controller.get("a").await.unwrap().auth_key(), first);
        assert!(controller.process_by_auth_key(&first).await.is_some());
    }

    #[tokio::test]
    async fn test_unknown_names_are_ignored() {
        let controller = ProcessController::new();
        controller.start_process("ghost").await;
        controller.stop_process("ghost").await;
        controller.remove_process("ghost").await;
        controller.send_message("a", "ghost", vec!["hi".into()]).await;
        assert!(controller.process_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_refused_while_running() {
        let controller = ProcessController::new();
        add(&controller, shell("svc", "exec cat > /dev/null")).await;
        controller.start_process("svc").await;
        assert_eq!(state_of(&controller, "svc").await, Some(ProcessState::Running));

        controller.remove_process("svc").await;
        assert!(controller.get("svc").await.is_some());

        let svc = controller.get("svc").await.unwrap();
        controller.stop_process("svc").await;
        wait_until(|| svc.state() == ProcessState::Stopped).await;
        controller.remove_process("svc").await;
        assert!(controller.get("svc").await.is_none());
    }

    #[tokio::test]
    async fn test_message_relay_between_processes() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("b.in");
        let controller = ProcessController::new();

        let mut receiver = shell("b", r#"exec cat > "$OUT""#);
        receiver.env.insert("OUT".into(), out.display().to_string());
        add(&controller, receiver).await;
        add(&controller, shell("a", r"printf 'SEND\000b\000hello\000world\n'; exec cat > /dev/null")).await;
        controller.start_process("b").await;
        controller.start_process("a").await;

        let expected = ManagerCommand::Msg {
            sender: "a".into(),
            message: vec!["hello".into(), "world".into()],
        }
        .encode();
        wait_until(|| {
            std::fs::read(&out).is_ok_and(|c| c.windows(expected.len()).any(|w| w == expected))
        })
        .await;

        controller.shutdown().await;
        assert!(controller.process_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_survives_failed_recipient() {
        let dir = tempfile::tempdir().unwrap();
        let ready = dir.path().join("ready");
        let controller = ProcessController::new();

        let mut closed = shell("closed", r#"exec 0<&-; : > "$READY"; exec sleep 2"#);
        closed.env.insert("READY".into(), ready.display().to_string());
        add(&controller, closed).await;
        let mut outputs = Vec::new();
        for name in ["b", "c"] {
            let out = dir.path().join(format!("{name}.in"));
            let mut spec = shell(name, r#"exec cat > "$OUT""#);
            spec.env.insert("OUT".into(), out.display().to_string());
            add(&controller, spec).await;
            outputs.push(out);
        }
        for name in ["closed", "b", "c"] {
            controller.start_process(name).await;
        }
        wait_until(|| ready.exists()).await;

        controller.broadcast_message("a", vec!["ping".into()]).await;

        let expected = ManagerCommand::Msg {
            sender: "a".into(),
            message: vec!["ping".into()],
        }
        .encode();
        for out in &outputs {
            wait_until(|| {
                std::fs::read(out).is_ok_and(|c| c.windows(expected.len()).any(|w| w == expected))
            })
            .await;
        }
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_every_process() {
        let controller = ProcessController::new();
        for name in ["one", "two", "three"] {
            add(&controller, shell(name, "exec cat > /dev/null")).await;
            controller.start_process(name).await;
        }
        add(&controller, shell("idle", "exit 0")).await;

        tokio::time::timeout(Duration::from_secs(10), controller.shutdown())
            .await
            .expect("shutdown did not finish");
        assert!(controller.process_names().await.is_empty());
        assert!(controller.inventory().await.is_empty());
    }

    #[tokio::test]
    async fn test_peers_notified_of_lifecycle() {
        let controller = ProcessController::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        controller.register_peer(tx).await;

        add(&controller, shell("job", "exit 0")).await;
        let job = controller.get("job").await.unwrap();
        controller.start_process("job").await;
        wait_until(|| job.state() == ProcessState::Failed).await;
        controller.remove_process("job").await;

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(events.len(), 4, "{events:?}");
        assert_eq!(events[0], PeerEvent::ProcessAdded { name: "job".into() });
        assert_eq!(events[1], PeerEvent::ProcessStarted { name: "job".into() });
        assert!(matches!(&events[2], PeerEvent::ProcessStopped { name, .. } if name == "job"));
        assert_eq!(events[3], PeerEvent::ProcessRemoved { name: "job".into() });
    }

    #[tokio::test]
    async fn test_initial_process_is_respawned() {
        let dir = tempfile::tempdir().unwrap();
        let runs = dir.path().join("runs");
        let controller = ProcessController::new();
        let mut spec = shell("sm", r#"echo run >> "$OUT"; exit 3"#);
        spec.env.insert("OUT".into(), runs.display().to_string());

        controller
            .add_initial_process(
                "sm",
                spec.command,
                spec.env,
                spec.working_dir,
                Arc::new(DefaultRespawnPolicy),
            )
            .await
            .unwrap();
        controller.start_process("sm").await;

        wait_until(|| std::fs::read_to_string(&runs).is_ok_and(|c| c.lines().count() >= 3)).await;
        assert!(controller.get("sm").await.unwrap().is_initial());
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_added_process_is_not_respawned() {
        let controller = ProcessController::new();
        add(&controller, shell("once", "exit 3")).await;
        let once = controller.get("once").await.unwrap();
        controller.start_process("once").await;
        wait_until(|| once.state() == ProcessState::Failed).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(state_of(&controller, "once").await, Some(ProcessState::Failed));
    }

    #[tokio::test]
    async fn test_add_rejected_during_shutdown() {
        let controller = ProcessController::new();
        controller.shutdown().await;
        assert!(controller.is_shutting_down().await);
        add(&controller, shell("late", "exit 0")).await;
        assert!(controller.get("late").await.is_none());
    }

    #[tokio::test]
    async fn test_inventory_reports_keys_and_state() {
        let controller = ProcessController::new();
        add(&controller, shell("b", "exit 0")).await;
        add(&controller, shell("a", "exec cat > /dev/null")).await;
        controller.start_process("a").await;

        let inventory = controller.inventory().await;
        let names: Vec<&str> = inventory.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(inventory[0].running);
        assert!(!inventory[1].running);
        assert_eq!(
            inventory[0].auth_key,
            controller.get("a").await.unwrap().auth_key()
        );
        controller.shutdown().await;
    }
}
