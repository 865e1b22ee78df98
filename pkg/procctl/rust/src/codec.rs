// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Byte-exact framing primitives shared by every protocol direction.
//!
//! Text frames are sequences of words. A raw `0x00` ends a word and a raw `0x0A`
//! ends the line, so word content never contains either byte: characters outside
//! `0x20..=0x7F` are written as 2- or 3-byte sequences of UTF-16 code units
//! (characters above U+FFFF become a surrogate pair).
//!
//! Binary fields are big-endian. A checked blob is `[len:4][bytes][adler32:8]`.

use crate::error::CodecError;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for any length-prefixed field read off the wire.
pub const MAX_FIELD_LENGTH: usize = 16 * 1024 * 1024;

/// What terminated the last word read from a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// A NUL: more words follow on this line.
    More,
    /// A newline: the frame is complete.
    EndOfLine,
    /// The stream is closed.
    EndOfStream,
}

async fn next_byte<R: AsyncRead + Unpin>(input: &mut R) -> Result<Option<u8>, CodecError> {
    match input.read_u8().await {
        Ok(b) => Ok(Some(b)),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn continuation<R: AsyncRead + Unpin>(input: &mut R) -> Result<u16, CodecError> {
    match next_byte(input).await? {
        Some(b) if b & 0xC0 == 0x80 => Ok(u16::from(b & 0x3F)),
        Some(b) => Err(CodecError::InvalidContinuation(b)),
        None => Err(CodecError::TruncatedSequence),
    }
}

fn push_unit(word: &mut String, unit: u16, high: &mut Option<u16>) -> Result<(), CodecError> {
    match unit {
        0xD800..=0xDBFF => {
            if let Some(pending) = high.replace(unit) {
                return Err(CodecError::UnpairedSurrogate(pending));
            }
        }
        0xDC00..=0xDFFF => {
            let pending = high.take().ok_or(CodecError::UnpairedSurrogate(unit))?;
            let code = 0x10000 + ((u32::from(pending) - 0xD800) << 10) + (u32::from(unit) - 0xDC00);
            word.push(char::from_u32(code).ok_or(CodecError::UnpairedSurrogate(unit))?);
        }
        _ => {
            if let Some(pending) = high.take() {
                return Err(CodecError::UnpairedSurrogate(pending));
            }
            word.push(char::from_u32(u32::from(unit)).ok_or(CodecError::UnpairedSurrogate(unit))?);
        }
    }
    Ok(())
}

fn finish_word(high: Option<u16>, status: Status) -> Result<Status, CodecError> {
    match high {
        Some(pending) => Err(CodecError::UnpairedSurrogate(pending)),
        None => Ok(status),
    }
}

/// Read one word into `word` (cleared first) and report what ended it.
///
/// On error the stream is left somewhere inside the current line; callers
/// resynchronise with [`skip_to_end_of_line`] unless [`CodecError::ends_line`].
pub async fn read_word<R: AsyncRead + Unpin>(
    input: &mut R,
    word: &mut String,
) -> Result<Status, CodecError> {
    word.clear();
    let mut high = None;
    loop {
        let Some(lead) = next_byte(input).await? else {
            return finish_word(high, Status::EndOfStream);
        };
        let unit = match lead {
            0x00 => return finish_word(high, Status::More),
            b'\n' => return finish_word(high, Status::EndOfLine),
            0x01..=0x7F => u16::from(lead),
            0xC0..=0xDF => (u16::from(lead & 0x1F) << 6) | continuation(input).await?,
            0xE0..=0xEF => {
                let mid = continuation(input).await?;
                let low = continuation(input).await?;
                (u16::from(lead & 0x0F) << 12) | (mid << 6) | low
            }
            other => return Err(CodecError::InvalidLeadByte(other)),
        };
        push_unit(word, unit, &mut high)?;
    }
}

/// Append the escaped form of `word` to `out`.
pub fn encode_word(word: &str, out: &mut Vec<u8>) {
    for unit in word.encode_utf16() {
        match unit {
            0x20..=0x7F => out.push(unit as u8),
            0x00..=0x7FF => {
                out.push(0xC0 | (unit >> 6) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
            _ => {
                out.push(0xE0 | (unit >> 12) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
        }
    }
}

/// Read the single delimiter byte that follows a binary field.
///
/// Anything other than NUL or newline is reported as [`Status::More`] so the
/// caller treats the line as malformed and resynchronises.
pub async fn read_status<R: AsyncRead + Unpin>(input: &mut R) -> Result<Status, CodecError> {
    Ok(match next_byte(input).await? {
        None => Status::EndOfStream,
        Some(b'\n') => Status::EndOfLine,
        Some(_) => Status::More,
    })
}

/// Discard input up to and including the next newline.
pub async fn skip_to_end_of_line<R: AsyncRead + Unpin>(input: &mut R) -> Result<Status, CodecError> {
    loop {
        match next_byte(input).await? {
            None => return Ok(Status::EndOfStream),
            Some(b'\n') => return Ok(Status::EndOfLine),
            Some(_) => {}
        }
    }
}

fn checked_length(len: i64) -> Result<usize, CodecError> {
    usize::try_from(len)
        .ok()
        .filter(|&n| n <= MAX_FIELD_LENGTH)
        .ok_or(CodecError::InvalidLength(len))
}

pub async fn read_int<R: AsyncRead + Unpin>(input: &mut R) -> Result<i32, CodecError> {
    Ok(input.read_i32().await?)
}

pub async fn read_long<R: AsyncRead + Unpin>(input: &mut R) -> Result<i64, CodecError> {
    Ok(input.read_i64().await?)
}

pub fn write_int(out: &mut Vec<u8>, value: i32) {
    out.extend_from_slice(&value.to_be_bytes());
}

pub fn write_long(out: &mut Vec<u8>, value: i64) {
    out.extend_from_slice(&value.to_be_bytes());
}

/// Read a 4-byte length prefix and exactly that many bytes.
pub async fn read_bytes_with_length<R: AsyncRead + Unpin>(
    input: &mut R,
) -> Result<Vec<u8>, CodecError> {
    let len = checked_length(i64::from(read_int(input).await?))?;
    // Grow with the data actually received, not with the advertised length.
    let mut bytes = Vec::new();
    (&mut *input).take(len as u64).read_to_end(&mut bytes).await?;
    if bytes.len() < len {
        let short = io::Error::new(io::ErrorKind::UnexpectedEof, "length-prefixed field cut short");
        return Err(short.into());
    }
    Ok(bytes)
}

pub fn write_bytes_with_length(out: &mut Vec<u8>, bytes: &[u8]) {
    // Lengths above i32::MAX cannot be framed; callers bound payloads well below that.
    write_int(out, bytes.len() as i32);
    out.extend_from_slice(bytes);
}

/// A blob read off the wire together with the checksum the sender attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckedBytes {
    pub bytes: Vec<u8>,
    pub checksum: u64,
}

impl CheckedBytes {
    /// Checksum computed locally over the received bytes.
    pub fn expected_checksum(&self) -> u64 {
        u64::from(adler32(&self.bytes))
    }

    pub fn is_valid(&self) -> bool {
        self.checksum == self.expected_checksum()
    }
}

/// Read `[len:4][bytes][checksum:8]`. Verification is left to the caller.
pub async fn read_checked<R: AsyncRead + Unpin>(input: &mut R) -> Result<CheckedBytes, CodecError> {
    let bytes = read_bytes_with_length(input).await?;
    let checksum = read_long(input).await? as u64;
    Ok(CheckedBytes { bytes, checksum })
}

pub fn write_checked(out: &mut Vec<u8>, bytes: &[u8]) {
    write_bytes_with_length(out, bytes);
    write_long(out, i64::from(adler32(bytes)));
}

/// Length-prefixed UTF-8 string used by the binary peer protocol.
pub async fn read_utf<R: AsyncRead + Unpin>(input: &mut R) -> Result<String, CodecError> {
    Ok(String::from_utf8(read_bytes_with_length(input).await?)?)
}

pub fn write_utf(out: &mut Vec<u8>, value: &str) {
    write_bytes_with_length(out, value.as_bytes());
}

pub async fn read_bool<R: AsyncRead + Unpin>(input: &mut R) -> Result<bool, CodecError> {
    Ok(input.read_u8().await? != 0)
}

pub fn write_bool(out: &mut Vec<u8>, value: bool) {
    out.push(u8::from(value));
}

/// Adler-32 as defined by RFC 1950.
pub fn adler32(data: &[u8]) -> u32 {
    const MOD_ADLER: u32 = 65521;
    // Largest run that cannot overflow `b` before reduction.
    const NMAX: usize = 5552;

    let (mut a, mut b) = (1u32, 0u32);
    for chunk in data.chunks(NMAX) {
        for &byte in chunk {
            a += u32::from(byte);
            b += a;
        }
        a %= MOD_ADLER;
        b %= MOD_ADLER;
    }
    (b << 16) | a
}

/// Builder for one text frame: `NAME (\0 field)* \n`.
#[derive(Debug)]
pub struct Frame {
    buf: Vec<u8>,
}

impl Frame {
    pub fn new(name: &str) -> Self {
        let mut buf = Vec::with_capacity(64);
        encode_word(name, &mut buf);
        Self { buf }
    }

    /// Append a NUL separator and `word`.
    pub fn word(mut self, word: &str) -> Self {
        self.buf.push(0);
        encode_word(word, &mut self.buf);
        self
    }

    pub fn words<'a>(self, words: impl IntoIterator<Item = &'a str>) -> Self {
        words.into_iter().fold(self, Frame::word)
    }

    /// Append a NUL separator followed by a checked blob.
    pub fn checked(mut self, bytes: &[u8]) -> Self {
        self.buf.push(0);
        write_checked(&mut self.buf, bytes);
        self
    }

    /// Append a NUL separator followed by a length-prefixed blob.
    pub fn bytes(mut self, bytes: &[u8]) -> Self {
        self.buf.push(0);
        write_bytes_with_length(&mut self.buf, bytes);
        self
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.buf.push(b'\n');
        self.buf
    }
}

/// Write an already-encoded frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(out: &mut W, frame: &[u8]) -> io::Result<()> {
    out.write_all(frame).await?;
    out.flush().await
}
