// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Commands the controller writes on a managed process's stdin.

use super::{Decoded, Fields, verified};
use crate::auth::AuthKey;
use crate::codec::{self, Frame, Status};
use crate::error::CodecError;
use phf::phf_map;
use tokio::io::AsyncRead;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerCommandKind {
    AuthKey,
    Shutdown,
    ShutdownServers,
    ReconnectServerManager,
    Down,
    Msg,
    MsgBytes,
}

static MANAGER_COMMANDS: phf::Map<&'static str, ManagerCommandKind> = phf_map! {
    "AUTH_KEY" => ManagerCommandKind::AuthKey,
    "SHUTDOWN" => ManagerCommandKind::Shutdown,
    "SHUTDOWN_SERVERS" => ManagerCommandKind::ShutdownServers,
    "RECONNECT_SERVER_MANAGER" => ManagerCommandKind::ReconnectServerManager,
    "DOWN" => ManagerCommandKind::Down,
    "MSG" => ManagerCommandKind::Msg,
    "MSG_BYTES" => ManagerCommandKind::MsgBytes,
};

impl ManagerCommandKind {
    pub fn from_name(name: &str) -> Option<Self> {
        MANAGER_COMMANDS.get(name).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            ManagerCommandKind::AuthKey => "AUTH_KEY",
            ManagerCommandKind::Shutdown => "SHUTDOWN",
            ManagerCommandKind::ShutdownServers => "SHUTDOWN_SERVERS",
            ManagerCommandKind::ReconnectServerManager => "RECONNECT_SERVER_MANAGER",
            ManagerCommandKind::Down => "DOWN",
            ManagerCommandKind::Msg => "MSG",
            ManagerCommandKind::MsgBytes => "MSG_BYTES",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerCommand {
    /// First frame of every run: the key to present to the peer server.
    AuthKey(AuthKey),
    /// Exit. The controller closes the stream right after this frame.
    Shutdown,
    /// Server manager only: shut the servers down, then report SERVERS_SHUTDOWN.
    ShutdownServers,
    ReconnectServerManager {
        address: String,
        port: String,
    },
    /// Server manager only: a managed process exited unexpectedly.
    Down {
        name: String,
    },
    Msg {
        sender: String,
        message: Vec<String>,
    },
    MsgBytes {
        sender: String,
        message: Vec<u8>,
    },
}

impl ManagerCommand {
    pub fn kind(&self) -> ManagerCommandKind {
        match self {
            ManagerCommand::AuthKey(_) => ManagerCommandKind::AuthKey,
            ManagerCommand::Shutdown => ManagerCommandKind::Shutdown,
            ManagerCommand::ShutdownServers => ManagerCommandKind::ShutdownServers,
            ManagerCommand::ReconnectServerManager { .. } => {
                ManagerCommandKind::ReconnectServerManager
            }
            ManagerCommand::Down { .. } => ManagerCommandKind::Down,
            ManagerCommand::Msg { .. } => ManagerCommandKind::Msg,
            ManagerCommand::MsgBytes { .. } => ManagerCommandKind::MsgBytes,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let frame = Frame::new(self.kind().name());
        match self {
            ManagerCommand::AuthKey(key) => frame.word(&key.to_hex()),
            ManagerCommand::Shutdown | ManagerCommand::ShutdownServers => frame,
            ManagerCommand::ReconnectServerManager { address, port } => {
                frame.word(address).word(port)
            }
            ManagerCommand::Down { name } => frame.word(name),
            ManagerCommand::Msg { sender, message } => {
                frame.word(sender).words(message.iter().map(String::as_str))
            }
            ManagerCommand::MsgBytes { sender, message } => frame.word(sender).checked(message),
        }
        .finish()
    }
}

async fn decode<R: AsyncRead + Unpin>(
    kind: ManagerCommandKind,
    f: &mut Fields<'_, R>,
) -> Result<Option<ManagerCommand>, CodecError> {
    let command = match kind {
        ManagerCommandKind::AuthKey => {
            let hex = field!(f.word());
            let Some(key) = AuthKey::from_hex(&hex) else {
                warn!("Malformed authentication key");
                return Ok(None);
            };
            ManagerCommand::AuthKey(key)
        }
        ManagerCommandKind::Shutdown => ManagerCommand::Shutdown,
        ManagerCommandKind::ShutdownServers => ManagerCommand::ShutdownServers,
        ManagerCommandKind::ReconnectServerManager => ManagerCommand::ReconnectServerManager {
            address: field!(f.word()),
            port: field!(f.word()),
        },
        ManagerCommandKind::Down => ManagerCommand::Down {
            name: field!(f.word()),
        },
        ManagerCommandKind::Msg => ManagerCommand::Msg {
            sender: field!(f.word()),
            message: f.remaining_words().await?,
        },
        ManagerCommandKind::MsgBytes => {
            let sender = field!(f.word());
            let Some(message) = verified(kind.name(), field!(f.checked())) else {
                return Ok(None);
            };
            ManagerCommand::MsgBytes { sender, message }
        }
    };
    Ok(Some(command))
}

/// Decode one frame from the controller, as a managed process would.
pub async fn read_command<R: AsyncRead + Unpin>(
    input: &mut R,
) -> Result<Decoded<ManagerCommand>, CodecError> {
    let mut name = String::new();
    let status = codec::read_word(input, &mut name).await?;
    if name.is_empty() && status != Status::More {
        return Ok(Decoded {
            command: None,
            status,
        });
    }
    let Some(kind) = ManagerCommandKind::from_name(&name) else {
        error!(command = %name, "Unknown command");
        return Ok(Decoded {
            command: None,
            status,
        });
    };

    let mut f = Fields::new(input, status);
    let command = decode(kind, &mut f).await?;
    if f.truncated() {
        warn!(command = kind.name(), "Incomplete command, ignoring");
    }
    Ok(Decoded {
        command,
        status: f.status(),
    })
}
