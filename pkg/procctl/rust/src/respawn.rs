// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Backoff applied when a managed process exits without being asked to.
pub trait RespawnPolicy: Send + Sync + fmt::Debug {
    /// Delay before restart attempt `retry_count`, or `None` to give up for good.
    ///
    /// `retry_count` starts at 1; passing 0 is a caller bug and panics.
    fn timeout(&self, retry_count: u32) -> Option<Duration>;

    /// Milliseconds to wait, or -1 to give up.
    fn timeout_ms(&self, retry_count: i32) -> i64 {
        assert!(retry_count >= 1, "retry count must be at least 1, got {retry_count}");
        self.timeout(retry_count.unsigned_abs())
            .map_or(-1, |d| d.as_millis() as i64)
    }
}

/// 150ms steps for the first four retries, 300ms steps up to nine, 400ms steps up to
/// fourteen, then give up.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultRespawnPolicy;

impl RespawnPolicy for DefaultRespawnPolicy {
    fn timeout(&self, retry_count: u32) -> Option<Duration> {
        assert!(retry_count >= 1, "retry count must be at least 1, got {retry_count}");
        let step = match retry_count {
            1..=4 => 150,
            5..=9 => 300,
            10..=14 => 400,
            _ => return None,
        };
        Some(Duration::from_millis(step * u64::from(retry_count)))
    }
}

/// Never restart; whoever manages the process decides.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverRespawn;

impl RespawnPolicy for NeverRespawn {
    fn timeout(&self, retry_count: u32) -> Option<Duration> {
        assert!(retry_count >= 1, "retry count must be at least 1, got {retry_count}");
        None
    }
}

/// Configurable selector for the built-in policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RespawnPolicyKind {
    #[default]
    Default,
    Never,
}

impl RespawnPolicyKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "default" | "backoff" => Some(RespawnPolicyKind::Default),
            "never" | "no" => Some(RespawnPolicyKind::Never),
            _ => None,
        }
    }

    pub fn into_policy(self) -> Arc<dyn RespawnPolicy> {
        match self {
            RespawnPolicyKind::Default => Arc::new(DefaultRespawnPolicy),
            RespawnPolicyKind::Never => Arc::new(NeverRespawn),
        }
    }
}

impl fmt::Display for RespawnPolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RespawnPolicyKind::Default => write!(f, "default"),
            RespawnPolicyKind::Never => write!(f, "never"),
        }
    }
}
