// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Commands a managed process writes on its stdout, addressed to the controller.

use super::{Decoded, Fields, verified};
use crate::codec::{self, Frame, Status};
use crate::error::CodecError;
use crate::master::{Master, SERVER_MANAGER_PROCESS_NAME};
use phf::phf_map;
use std::collections::HashMap;
use tokio::io::AsyncRead;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessCommandKind {
    Add,
    Start,
    Stop,
    Remove,
    Send,
    SendBytes,
    Broadcast,
    BroadcastBytes,
    ServersShutdown,
    ReconnectServers,
    ReconnectServer,
    SendStdin,
}

static PROCESS_COMMANDS: phf::Map<&'static str, ProcessCommandKind> = phf_map! {
    "ADD" => ProcessCommandKind::Add,
    "START" => ProcessCommandKind::Start,
    "STOP" => ProcessCommandKind::Stop,
    "REMOVE" => ProcessCommandKind::Remove,
    "SEND" => ProcessCommandKind::Send,
    "SEND_BYTES" => ProcessCommandKind::SendBytes,
    "BROADCAST" => ProcessCommandKind::Broadcast,
    "BROADCAST_BYTES" => ProcessCommandKind::BroadcastBytes,
    "SERVERS_SHUTDOWN" => ProcessCommandKind::ServersShutdown,
    "RECONNECT_SERVERS" => ProcessCommandKind::ReconnectServers,
    "RECONNECT_SERVER" => ProcessCommandKind::ReconnectServer,
    "SEND_STDIN" => ProcessCommandKind::SendStdin,
};

impl ProcessCommandKind {
    pub fn from_name(name: &str) -> Option<Self> {
        PROCESS_COMMANDS.get(name).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            ProcessCommandKind::Add => "ADD",
            ProcessCommandKind::Start => "START",
            ProcessCommandKind::Stop => "STOP",
            ProcessCommandKind::Remove => "REMOVE",
            ProcessCommandKind::Send => "SEND",
            ProcessCommandKind::SendBytes => "SEND_BYTES",
            ProcessCommandKind::Broadcast => "BROADCAST",
            ProcessCommandKind::BroadcastBytes => "BROADCAST_BYTES",
            ProcessCommandKind::ServersShutdown => "SERVERS_SHUTDOWN",
            ProcessCommandKind::ReconnectServers => "RECONNECT_SERVERS",
            ProcessCommandKind::ReconnectServer => "RECONNECT_SERVER",
            ProcessCommandKind::SendStdin => "SEND_STDIN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessCommand {
    Add {
        name: String,
        working_dir: String,
        command: Vec<String>,
        env: HashMap<String, String>,
    },
    Start {
        name: String,
    },
    Stop {
        name: String,
    },
    Remove {
        name: String,
    },
    Send {
        recipient: String,
        message: Vec<String>,
    },
    SendBytes {
        recipient: String,
        message: Vec<u8>,
    },
    Broadcast {
        message: Vec<String>,
    },
    BroadcastBytes {
        message: Vec<u8>,
    },
    ServersShutdown,
    ReconnectServers {
        address: String,
        port: String,
    },
    ReconnectServer {
        name: String,
        address: String,
        port: String,
    },
    SendStdin {
        recipient: String,
        bytes: Vec<u8>,
    },
}

impl ProcessCommand {
    pub fn kind(&self) -> ProcessCommandKind {
        match self {
            ProcessCommand::Add { .. } => ProcessCommandKind::Add,
            ProcessCommand::Start { .. } => ProcessCommandKind::Start,
            ProcessCommand::Stop { .. } => ProcessCommandKind::Stop,
            ProcessCommand::Remove { .. } => ProcessCommandKind::Remove,
            ProcessCommand::Send { .. } => ProcessCommandKind::Send,
            ProcessCommand::SendBytes { .. } => ProcessCommandKind::SendBytes,
            ProcessCommand::Broadcast { .. } => ProcessCommandKind::Broadcast,
            ProcessCommand::BroadcastBytes { .. } => ProcessCommandKind::BroadcastBytes,
            ProcessCommand::ServersShutdown => ProcessCommandKind::ServersShutdown,
            ProcessCommand::ReconnectServers { .. } => ProcessCommandKind::ReconnectServers,
            ProcessCommand::ReconnectServer { .. } => ProcessCommandKind::ReconnectServer,
            ProcessCommand::SendStdin { .. } => ProcessCommandKind::SendStdin,
        }
    }

    /// Serialize as one newline-terminated frame.
    ///
    /// The environment count is followed by alternating keys and values; the last
    /// value is terminated by the newline itself.
    pub fn encode(&self) -> Vec<u8> {
        let frame = Frame::new(self.kind().name());
        let frame = match self {
            ProcessCommand::Add {
                name,
                working_dir,
                command,
                env,
            } => {
                let frame = frame
                    .word(name)
                    .word(working_dir)
                    .word(&command.len().to_string())
                    .words(command.iter().map(String::as_str))
                    .word(&env.len().to_string());
                env.iter().fold(frame, |frame, (k, v)| frame.word(k).word(v))
            }
            ProcessCommand::Start { name }
            | ProcessCommand::Stop { name }
            | ProcessCommand::Remove { name } => frame.word(name),
            ProcessCommand::Send { recipient, message } => frame
                .word(recipient)
                .words(message.iter().map(String::as_str)),
            ProcessCommand::SendBytes { recipient, message } => {
                frame.word(recipient).checked(message)
            }
            ProcessCommand::Broadcast { message } => frame.words(message.iter().map(String::as_str)),
            ProcessCommand::BroadcastBytes { message } => frame.checked(message),
            ProcessCommand::ServersShutdown => frame,
            ProcessCommand::ReconnectServers { address, port } => frame.word(address).word(port),
            ProcessCommand::ReconnectServer {
                name,
                address,
                port,
            } => frame.word(name).word(address).word(port),
            ProcessCommand::SendStdin { recipient, bytes } => frame.word(recipient).bytes(bytes),
        };
        frame.finish()
    }

    /// Invoke the matching [`Master`] operation on behalf of `sender`.
    pub async fn apply(self, master: &dyn Master, sender: &str) {
        match self {
            ProcessCommand::Add {
                name,
                working_dir,
                command,
                env,
            } => master.add_process(name, command, env, working_dir).await,
            ProcessCommand::Start { name } => master.start_process(&name).await,
            ProcessCommand::Stop { name } => master.stop_process(&name).await,
            ProcessCommand::Remove { name } => master.remove_process(&name).await,
            ProcessCommand::Send { recipient, message } => {
                master.send_message(sender, &recipient, message).await
            }
            ProcessCommand::SendBytes { recipient, message } => {
                master.send_message_bytes(sender, &recipient, message).await
            }
            ProcessCommand::Broadcast { message } => master.broadcast_message(sender, message).await,
            ProcessCommand::BroadcastBytes { message } => {
                master.broadcast_message_bytes(sender, message).await
            }
            ProcessCommand::ServersShutdown => {
                if sender == SERVER_MANAGER_PROCESS_NAME {
                    master.servers_shutdown().await;
                } else {
                    warn!(sender, "SERVERS_SHUTDOWN received from wrong process, ignoring");
                }
            }
            ProcessCommand::ReconnectServers { address, port } => {
                master.reconnect_servers_to_server_manager(&address, &port).await
            }
            ProcessCommand::ReconnectServer {
                name,
                address,
                port,
            } => {
                master
                    .reconnect_process_to_server_manager(&name, &address, &port)
                    .await
            }
            ProcessCommand::SendStdin { recipient, bytes } => master.send_stdin(&recipient, bytes).await,
        }
    }
}

async fn decode<R: AsyncRead + Unpin>(
    kind: ProcessCommandKind,
    f: &mut Fields<'_, R>,
) -> Result<Option<ProcessCommand>, CodecError> {
    let command = match kind {
        ProcessCommandKind::Add => {
            let name = field!(f.word());
            let working_dir = field!(f.word());
            let argc = field!(f.count("command length"));
            let mut command = Vec::new();
            for _ in 0..argc {
                command.push(field!(f.word()));
            }
            let envc = field!(f.count("environment size"));
            let mut env = HashMap::new();
            for _ in 0..envc {
                let key = field!(f.word());
                let value = field!(f.word());
                env.insert(key, value);
            }
            ProcessCommand::Add {
                name,
                working_dir,
                command,
                env,
            }
        }
        ProcessCommandKind::Start => ProcessCommand::Start {
            name: field!(f.word()),
        },
        ProcessCommandKind::Stop => ProcessCommand::Stop {
            name: field!(f.word()),
        },
        ProcessCommandKind::Remove => ProcessCommand::Remove {
            name: field!(f.word()),
        },
        ProcessCommandKind::Send => ProcessCommand::Send {
            recipient: field!(f.word()),
            message: f.remaining_words().await?,
        },
        ProcessCommandKind::SendBytes => {
            let recipient = field!(f.word());
            let Some(message) = verified(kind.name(), field!(f.checked())) else {
                return Ok(None);
            };
            ProcessCommand::SendBytes { recipient, message }
        }
        ProcessCommandKind::Broadcast => ProcessCommand::Broadcast {
            message: f.remaining_words().await?,
        },
        ProcessCommandKind::BroadcastBytes => {
            let Some(message) = verified(kind.name(), field!(f.checked())) else {
                return Ok(None);
            };
            ProcessCommand::BroadcastBytes { message }
        }
        ProcessCommandKind::ServersShutdown => ProcessCommand::ServersShutdown,
        ProcessCommandKind::ReconnectServers => ProcessCommand::ReconnectServers {
            address: field!(f.word()),
            port: field!(f.word()),
        },
        ProcessCommandKind::ReconnectServer => ProcessCommand::ReconnectServer {
            name: field!(f.word()),
            address: field!(f.word()),
            port: field!(f.word()),
        },
        ProcessCommandKind::SendStdin => ProcessCommand::SendStdin {
            recipient: field!(f.word()),
            bytes: field!(f.bytes()),
        },
    };
    Ok(Some(command))
}

/// Decode one frame from a process's output stream.
///
/// Unknown command names are logged; their fields are left unread.
pub async fn read_command<R: AsyncRead + Unpin>(
    input: &mut R,
) -> Result<Decoded<ProcessCommand>, CodecError> {
    let mut name = String::new();
    let status = codec::read_word(input, &mut name).await?;
    if name.is_empty() && status != Status::More {
        return Ok(Decoded {
            command: None,
            status,
        });
    }
    let Some(kind) = ProcessCommandKind::from_name(&name) else {
        error!(command = %name, "Unknown command");
        return Ok(Decoded {
            command: None,
            status,
        });
    };

    let mut fields = Fields::new(input, status);
    let command = decode(kind, &mut fields).await?;
    if fields.truncated() {
        warn!(command = kind.name(), "Incomplete command, ignoring");
    }
    Ok(Decoded {
        command,
        status: fields.status(),
    })
}

/// Read one frame from `input` and dispatch it to `master` on behalf of `sender`.
///
/// Malformed frames are logged and the reader is moved past the offending line,
/// so the returned status is never [`Status::More`]. Only stream failures are
/// returned as errors.
pub async fn handle_message<R: AsyncRead + Unpin>(
    input: &mut R,
    master: &dyn Master,
    sender: &str,
) -> Result<Status, CodecError> {
    let decoded = match read_command(input).await {
        Ok(decoded) => decoded,
        Err(e) if e.is_end_of_stream() => return Ok(Status::EndOfStream),
        Err(CodecError::Io(e)) => return Err(CodecError::Io(e)),
        Err(e) => {
            warn!(error = %e, "Malformed command, discarding line");
            if e.ends_line() {
                return Ok(Status::EndOfLine);
            }
            return codec::skip_to_end_of_line(input).await;
        }
    };

    match (decoded.command, decoded.status) {
        (Some(command), Status::More) => {
            warn!(command = command.kind().name(), "Unexpected trailing fields, discarding command");
            codec::skip_to_end_of_line(input).await
        }
        (Some(command), status) => {
            debug!(command = command.kind().name(), "Dispatching command");
            command.apply(master, sender).await;
            Ok(status)
        }
        (None, Status::More) => codec::skip_to_end_of_line(input).await,
        (None, status) => Ok(status),
    }
}
