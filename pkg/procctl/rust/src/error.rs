// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Error taxonomy for the process controller.
//!
//! None of these errors reach the callers of the controller operations: they are
//! logged at the task boundary that observed them (stream reader, peer connection).

use std::io;
use thiserror::Error;

/// Failures decoding the framing primitives of the wire protocol.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid lead byte 0x{0:02x}")]
    InvalidLeadByte(u8),

    #[error("invalid continuation byte 0x{0:02x}")]
    InvalidContinuation(u8),

    #[error("stream ended inside a multi-byte sequence")]
    TruncatedSequence,

    #[error("unpaired surrogate 0x{0:04x}")]
    UnpairedSurrogate(u16),

    #[error("invalid length {0}")]
    InvalidLength(i64),

    #[error("invalid UTF-8 in string field")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

impl CodecError {
    /// True when the underlying stream is gone and the reader should stop.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, CodecError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
            || matches!(self, CodecError::TruncatedSequence)
    }

    /// True when decoding consumed the newline that terminated the broken line,
    /// so no resynchronisation is needed.
    pub fn ends_line(&self) -> bool {
        matches!(self, CodecError::InvalidContinuation(b'\n'))
    }
}

/// Failures on a peer connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unrecognized greeting code 0x{0:02x}")]
    UnrecognizedGreeting(u8),

    #[error("invalid protocol version {0}")]
    InvalidVersion(u8),

    #[error("unknown message code 0x{0:02x}")]
    UnknownMessage(u8),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl From<io::Error> for ProtocolError {
    fn from(e: io::Error) -> Self {
        ProtocolError::Codec(CodecError::Io(e))
    }
}

/// Failures operating on a managed process.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("failed to spawn process '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("process '{0}' has no open command stream")]
    NotStarted(String),

    #[error("failed to write to process '{name}': {source}")]
    Write {
        name: String,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ControllerError>;
