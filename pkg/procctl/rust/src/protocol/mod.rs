// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! The three command dialects spoken by the controller.
//!
//! - [`process`]: text frames a managed process writes on its stdout.
//! - [`manager`]: text frames the controller writes on a process's stdin.
//! - [`peer`]: tagged binary frames on an authenticated TCP connection.

/// Unwrap an optional field or abandon the frame being decoded.
macro_rules! field {
    ($read:expr) => {
        match $read.await? {
            Some(value) => value,
            None => return Ok(None),
        }
    };
}

pub mod manager;
pub mod peer;
pub mod process;

use crate::codec::{self, CheckedBytes, Status};
use crate::error::CodecError;
use tokio::io::AsyncRead;
use tracing::warn;

/// One decoded text frame and the status of the stream after it.
///
/// `command` is `None` when the frame was unknown, incomplete or dropped; the
/// reason has already been logged. A `status` of [`Status::More`] means the line
/// still has unread bytes.
#[derive(Debug)]
pub struct Decoded<T> {
    pub command: Option<T>,
    pub status: Status,
}

/// Cursor over the fields of one text frame.
pub(crate) struct Fields<'a, R> {
    input: &'a mut R,
    status: Status,
    word: String,
    truncated: bool,
}

impl<'a, R: AsyncRead + Unpin> Fields<'a, R> {
    /// `status` is what ended the command name.
    pub(crate) fn new(input: &'a mut R, status: Status) -> Self {
        Self {
            input,
            status,
            word: String::new(),
            truncated: false,
        }
    }

    pub(crate) fn status(&self) -> Status {
        self.status
    }

    /// True if a field was requested after the line had already ended.
    pub(crate) fn truncated(&self) -> bool {
        self.truncated
    }

    /// Next word, or `None` if the line ended before it.
    pub(crate) async fn word(&mut self) -> Result<Option<String>, CodecError> {
        if self.status != Status::More {
            self.truncated = true;
            return Ok(None);
        }
        self.status = codec::read_word(self.input, &mut self.word).await?;
        Ok(Some(std::mem::take(&mut self.word)))
    }

    /// A decimal count field. Malformed counts are logged and yield `None`.
    pub(crate) async fn count(&mut self, field: &'static str) -> Result<Option<usize>, CodecError> {
        let Some(word) = self.word().await? else {
            return Ok(None);
        };
        match word.parse::<usize>() {
            Ok(n) => Ok(Some(n)),
            Err(_) => {
                warn!(field, value = %word, "Malformed count, abandoning command");
                Ok(None)
            }
        }
    }

    /// Every word left on the line.
    pub(crate) async fn remaining_words(&mut self) -> Result<Vec<String>, CodecError> {
        let mut words = Vec::new();
        while self.status == Status::More {
            self.status = codec::read_word(self.input, &mut self.word).await?;
            words.push(std::mem::take(&mut self.word));
        }
        Ok(words)
    }

    /// A checked blob and the delimiter after it.
    pub(crate) async fn checked(&mut self) -> Result<Option<CheckedBytes>, CodecError> {
        if self.status != Status::More {
            self.truncated = true;
            return Ok(None);
        }
        let checked = codec::read_checked(self.input).await?;
        self.status = codec::read_status(self.input).await?;
        Ok(Some(checked))
    }

    /// A length-prefixed blob and the delimiter after it.
    pub(crate) async fn bytes(&mut self) -> Result<Option<Vec<u8>>, CodecError> {
        if self.status != Status::More {
            self.truncated = true;
            return Ok(None);
        }
        let bytes = codec::read_bytes_with_length(self.input).await?;
        self.status = codec::read_status(self.input).await?;
        Ok(Some(bytes))
    }
}

/// Checked payloads whose checksum does not match are dropped.
pub(crate) fn verified(command: &'static str, checked: CheckedBytes) -> Option<Vec<u8>> {
    if checked.is_valid() {
        return Some(checked.bytes);
    }
    warn!(
        command,
        expected = checked.expected_checksum(),
        received = checked.checksum,
        len = checked.bytes.len(),
        "Checksum mismatch, dropping message"
    );
    None
}
