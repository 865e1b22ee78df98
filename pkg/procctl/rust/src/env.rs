// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::debug;

/// Parse a systemd-style environment file into ordered key-value pairs.
///
/// Supports `KEY=VALUE`, `export KEY=VALUE`, matching single or double quotes,
/// comments (#) and blank lines. A leading `-` on `path` makes a missing file
/// yield no variables instead of an error.
pub fn parse_environment_file(path: &str) -> Result<Vec<(String, String)>> {
    let (optional, path) = match path.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, path),
    };
    if optional && !Path::new(path).exists() {
        debug!(path, "optional environment file not found");
        return Ok(Vec::new());
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading environment file: {path}"))?;
    let mut vars = Vec::new();
    for (lineno, line) in contents.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let trimmed = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, raw_val)) = trimmed.split_once('=') else {
            debug!(path, line = lineno + 1, "skipping line without '='");
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        vars.push((key.to_string(), unquote(raw_val.trim()).to_string()));
    }
    Ok(vars)
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}
