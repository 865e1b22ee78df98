// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use rand_core::{OsRng, RngCore};
use std::fmt;

pub const AUTH_KEY_LENGTH: usize = 16;

/// Per-process shared secret a child presents when it connects back to the peer server.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct AuthKey([u8; AUTH_KEY_LENGTH]);

impl AuthKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; AUTH_KEY_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; AUTH_KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; AUTH_KEY_LENGTH] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != AUTH_KEY_LENGTH * 2 || !hex.is_ascii() {
            return None;
        }
        let mut bytes = [0u8; AUTH_KEY_LENGTH];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(Self(bytes))
    }
}

// Keys never show up in logs.
impl fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthKey(..)")
    }
}
