// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use async_trait::async_trait;
use std::collections::HashMap;
use std::process::ExitStatus;

/// Name of the coordinating process. Only it may report `SERVERS_SHUTDOWN`, and it
/// is told about other processes going down.
pub const SERVER_MANAGER_PROCESS_NAME: &str = "ServerManager";

/// How one run of a managed process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    /// The child exited. `None` when its status could not be collected.
    Exited(Option<ExitStatus>),
    /// The task supervising the child died; the child may still be alive.
    SupervisionLost,
}

/// Receiving side of the commands a managed process writes on its output stream.
///
/// Every operation is fire-and-forget: lookup misses and refused operations are
/// logged by the implementation and never reported back to the sender.
#[async_trait]
pub trait Master: Send + Sync {
    async fn add_process(
        &self,
        name: String,
        command: Vec<String>,
        env: HashMap<String, String>,
        working_dir: String,
    );

    async fn start_process(&self, name: &str);

    async fn stop_process(&self, name: &str);

    async fn remove_process(&self, name: &str);

    async fn send_message(&self, sender: &str, recipient: &str, message: Vec<String>);

    async fn send_message_bytes(&self, sender: &str, recipient: &str, message: Vec<u8>);

    async fn broadcast_message(&self, sender: &str, message: Vec<String>);

    async fn broadcast_message_bytes(&self, sender: &str, message: Vec<u8>);

    /// The server manager finished shutting its servers down.
    async fn servers_shutdown(&self);

    async fn reconnect_servers_to_server_manager(&self, address: &str, port: &str);

    async fn reconnect_process_to_server_manager(&self, name: &str, address: &str, port: &str);

    async fn send_stdin(&self, recipient: &str, bytes: Vec<u8>);

    /// Called once per run, after the output stream ended and the child was reaped.
    /// `generation` identifies the run that ended.
    async fn process_exited(&self, name: &str, generation: u64, exit: ProcessExit);
}
