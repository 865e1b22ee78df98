// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Daemon configuration.
//!
//! Daemon settings are read from environment variables with sensible defaults. An
//! optional YAML file describes the environment and respawn policy of the
//! initial process.

use crate::env::parse_environment_file;
use crate::respawn::RespawnPolicyKind;
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:0";
const DEFAULT_LOG_LEVEL: &str = "info";

/// Variable through which the initial process learns the peer server address.
pub const ADDRESS_ENV: &str = "DD_PC_ADDRESS";

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Address the peer server binds, `host:port`.
    pub listen_addr: String,

    /// tracing filter directive
    pub log_level: String,

    /// Initial process settings
    pub config_file: Option<PathBuf>,
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            listen_addr: lookup("DD_PC_LISTEN_ADDR")
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string()),
            // Priority: DD_PC_LOG_LEVEL > RUST_LOG > default
            log_level: lookup("DD_PC_LOG_LEVEL")
                .or_else(|| lookup("RUST_LOG"))
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            config_file: lookup("DD_PC_CONFIG_FILE").map(PathBuf::from),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let port = self
            .listen_addr
            .rsplit_once(':')
            .map(|(_, port)| port)
            .unwrap_or_default();
        if port.parse::<u16>().is_err() {
            bail!("DD_PC_LISTEN_ADDR must be host:port, got '{}'", self.listen_addr);
        }
        Ok(())
    }

    /// Initial process settings, or the defaults when no file is configured.
    pub fn initial_process(&self) -> Result<InitialProcessConfig> {
        match &self.config_file {
            Some(path) => InitialProcessConfig::load(path),
            None => Ok(InitialProcessConfig::default()),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct InitialProcessConfig {
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub environment_file: Option<String>,
    /// Start from the daemon's own environment.
    #[serde(default = "default_true")]
    pub inherit_env: bool,
    #[serde(default)]
    pub respawn: RespawnPolicyKind,
}

impl Default for InitialProcessConfig {
    fn default() -> Self {
        Self {
            env: HashMap::new(),
            environment_file: None,
            inherit_env: true,
            respawn: RespawnPolicyKind::default(),
        }
    }
}

impl InitialProcessConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: InitialProcessConfig =
            serde_yaml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Complete environment for the initial process.
    ///
    /// Layers, later ones winning: `ambient` (if inherited), the environment file,
    /// then `env`.
    pub fn environment(
        &self,
        ambient: impl IntoIterator<Item = (String, String)>,
    ) -> Result<HashMap<String, String>> {
        let mut vars = HashMap::new();
        if self.inherit_env {
            vars.extend(ambient);
        }
        if let Some(file) = &self.environment_file {
            vars.extend(parse_environment_file(file)?);
        }
        vars.extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(vars)
    }
}
