// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Binary dialect spoken on authenticated TCP connections.
//!
//! A connection opens with `[AUTH:1][version:1][key:16]`; the server answers with
//! the negotiated version byte. After that every frame is a one-byte tag followed
//! by big-endian fields. Strings are `[len:4][utf-8]`.

use crate::auth::{AUTH_KEY_LENGTH, AuthKey};
use crate::codec::{
    MAX_FIELD_LENGTH, read_bool, read_bytes_with_length, read_int, read_long, read_utf, write_bool,
    write_bytes_with_length, write_int, write_long, write_utf,
};
use crate::error::{CodecError, ProtocolError};
use std::collections::HashMap;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const AUTH: u8 = 0xEE;
pub const PROTOCOL_VERSION: u8 = 1;

pub const ADD_PROCESS: u8 = 0x10;
pub const START_PROCESS: u8 = 0x11;
pub const STOP_PROCESS: u8 = 0x12;
pub const REMOVE_PROCESS: u8 = 0x13;
pub const REQUEST_PROCESS_INVENTORY: u8 = 0x14;
pub const SEND_STDIN: u8 = 0x15;
pub const SHUTDOWN: u8 = 0x16;

pub const PROCESS_ADDED: u8 = 0x20;
pub const PROCESS_STARTED: u8 = 0x21;
pub const PROCESS_STOPPED: u8 = 0x22;
pub const PROCESS_REMOVED: u8 = 0x23;
pub const PROCESS_INVENTORY: u8 = 0x24;

/// Read the client greeting. Returns the version the client asked for.
pub async fn read_greeting<R: AsyncRead + Unpin>(
    input: &mut R,
) -> Result<(u8, AuthKey), ProtocolError> {
    let tag = input.read_u8().await?;
    if tag != AUTH {
        return Err(ProtocolError::UnrecognizedGreeting(tag));
    }
    let version = input.read_u8().await?;
    if version < 1 {
        return Err(ProtocolError::InvalidVersion(version));
    }
    let mut key = [0u8; AUTH_KEY_LENGTH];
    input.read_exact(&mut key).await?;
    Ok((version, AuthKey::from_bytes(key)))
}

pub async fn write_greeting<W: AsyncWrite + Unpin>(
    out: &mut W,
    version: u8,
    key: &AuthKey,
) -> io::Result<()> {
    let mut buf = Vec::with_capacity(2 + AUTH_KEY_LENGTH);
    buf.push(AUTH);
    buf.push(version);
    buf.extend_from_slice(key.as_bytes());
    out.write_all(&buf).await?;
    out.flush().await
}

/// Highest version both sides speak.
pub fn negotiate(requested: u8) -> u8 {
    requested.min(PROTOCOL_VERSION)
}

/// Read a tag, or `None` if the stream closed cleanly before one.
async fn read_tag<R: AsyncRead + Unpin>(input: &mut R) -> Result<Option<u8>, ProtocolError> {
    match input.read_u8().await {
        Ok(tag) => Ok(Some(tag)),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn read_count<R: AsyncRead + Unpin>(input: &mut R) -> Result<usize, ProtocolError> {
    let count = read_int(input).await?;
    usize::try_from(count)
        .ok()
        .filter(|&n| n <= MAX_FIELD_LENGTH)
        .ok_or(ProtocolError::Codec(CodecError::InvalidLength(i64::from(count))))
}

fn write_count(out: &mut Vec<u8>, count: usize) {
    write_int(out, count as i32);
}

/// Requests a peer may send after authenticating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerRequest {
    AddProcess {
        name: String,
        working_dir: String,
        command: Vec<String>,
        env: HashMap<String, String>,
    },
    StartProcess {
        name: String,
    },
    StopProcess {
        name: String,
    },
    RemoveProcess {
        name: String,
    },
    RequestProcessInventory,
    SendStdin {
        name: String,
        bytes: Vec<u8>,
    },
    Shutdown,
}

impl PeerRequest {
    pub fn tag(&self) -> u8 {
        match self {
            PeerRequest::AddProcess { .. } => ADD_PROCESS,
            PeerRequest::StartProcess { .. } => START_PROCESS,
            PeerRequest::StopProcess { .. } => STOP_PROCESS,
            PeerRequest::RemoveProcess { .. } => REMOVE_PROCESS,
            PeerRequest::RequestProcessInventory => REQUEST_PROCESS_INVENTORY,
            PeerRequest::SendStdin { .. } => SEND_STDIN,
            PeerRequest::Shutdown => SHUTDOWN,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.tag()];
        match self {
            PeerRequest::AddProcess {
                name,
                working_dir,
                command,
                env,
            } => {
                write_utf(&mut out, name);
                write_utf(&mut out, working_dir);
                write_count(&mut out, command.len());
                for arg in command {
                    write_utf(&mut out, arg);
                }
                write_count(&mut out, env.len());
                for (key, value) in env {
                    write_utf(&mut out, key);
                    write_utf(&mut out, value);
                }
            }
            PeerRequest::StartProcess { name }
            | PeerRequest::StopProcess { name }
            | PeerRequest::RemoveProcess { name } => write_utf(&mut out, name),
            PeerRequest::SendStdin { name, bytes } => {
                write_utf(&mut out, name);
                write_bytes_with_length(&mut out, bytes);
            }
            PeerRequest::RequestProcessInventory | PeerRequest::Shutdown => {}
        }
        out
    }

    /// Read the next request, or `None` once the peer closed the connection.
    pub async fn read_from<R: AsyncRead + Unpin>(
        input: &mut R,
    ) -> Result<Option<Self>, ProtocolError> {
        let Some(tag) = read_tag(input).await? else {
            return Ok(None);
        };
        let request = match tag {
            ADD_PROCESS => {
                let name = read_utf(input).await?;
                let working_dir = read_utf(input).await?;
                let argc = read_count(input).await?;
                let mut command = Vec::new();
                for _ in 0..argc {
                    command.push(read_utf(input).await?);
                }
                let envc = read_count(input).await?;
                let mut env = HashMap::new();
                for _ in 0..envc {
                    let key = read_utf(input).await?;
                    env.insert(key, read_utf(input).await?);
                }
                PeerRequest::AddProcess {
                    name,
                    working_dir,
                    command,
                    env,
                }
            }
            START_PROCESS => PeerRequest::StartProcess {
                name: read_utf(input).await?,
            },
            STOP_PROCESS => PeerRequest::StopProcess {
                name: read_utf(input).await?,
            },
            REMOVE_PROCESS => PeerRequest::RemoveProcess {
                name: read_utf(input).await?,
            },
            REQUEST_PROCESS_INVENTORY => PeerRequest::RequestProcessInventory,
            SEND_STDIN => PeerRequest::SendStdin {
                name: read_utf(input).await?,
                bytes: read_bytes_with_length(input).await?,
            },
            SHUTDOWN => PeerRequest::Shutdown,
            other => return Err(ProtocolError::UnknownMessage(other)),
        };
        Ok(Some(request))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryEntry {
    pub name: String,
    pub auth_key: AuthKey,
    pub running: bool,
}

/// Notifications pushed to the server manager's connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    ProcessAdded { name: String },
    ProcessStarted { name: String },
    ProcessStopped { name: String, uptime_ms: i64 },
    ProcessRemoved { name: String },
    ProcessInventory(Vec<InventoryEntry>),
}

impl PeerEvent {
    pub fn tag(&self) -> u8 {
        match self {
            PeerEvent::ProcessAdded { .. } => PROCESS_ADDED,
            PeerEvent::ProcessStarted { .. } => PROCESS_STARTED,
            PeerEvent::ProcessStopped { .. } => PROCESS_STOPPED,
            PeerEvent::ProcessRemoved { .. } => PROCESS_REMOVED,
            PeerEvent::ProcessInventory(_) => PROCESS_INVENTORY,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.tag()];
        match self {
            PeerEvent::ProcessAdded { name }
            | PeerEvent::ProcessStarted { name }
            | PeerEvent::ProcessRemoved { name } => write_utf(&mut out, name),
            PeerEvent::ProcessStopped { name, uptime_ms } => {
                write_utf(&mut out, name);
                write_long(&mut out, *uptime_ms);
            }
            PeerEvent::ProcessInventory(entries) => {
                write_count(&mut out, entries.len());
                for entry in entries {
                    write_utf(&mut out, &entry.name);
                    out.extend_from_slice(entry.auth_key.as_bytes());
                    write_bool(&mut out, entry.running);
                }
            }
        }
        out
    }

    /// Read the next event, or `None` once the server closed the connection.
    pub async fn read_from<R: AsyncRead + Unpin>(
        input: &mut R,
    ) -> Result<Option<Self>, ProtocolError> {
        let Some(tag) = read_tag(input).await? else {
            return Ok(None);
        };
        let event = match tag {
            PROCESS_ADDED => PeerEvent::ProcessAdded {
                name: read_utf(input).await?,
            },
            PROCESS_STARTED => PeerEvent::ProcessStarted {
                name: read_utf(input).await?,
            },
            PROCESS_STOPPED => PeerEvent::ProcessStopped {
                name: read_utf(input).await?,
                uptime_ms: read_long(input).await?,
            },
            PROCESS_REMOVED => PeerEvent::ProcessRemoved {
                name: read_utf(input).await?,
            },
            PROCESS_INVENTORY => {
                let count = read_count(input).await?;
                let mut entries = Vec::new();
                for _ in 0..count {
                    let name = read_utf(input).await?;
                    let mut key = [0u8; AUTH_KEY_LENGTH];
                    input.read_exact(&mut key).await?;
                    entries.push(InventoryEntry {
                        name,
                        auth_key: AuthKey::from_bytes(key),
                        running: read_bool(input).await?,
                    });
                }
                PeerEvent::ProcessInventory(entries)
            }
            other => return Err(ProtocolError::UnknownMessage(other)),
        };
        Ok(Some(event))
    }
}
