// This file is part of Argus NVR, a lightweight network video recorder.
// Copyright (C) 2026 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Process configuration: one TOML key/value file.
//!
//! Unknown keys are logged with a warning and otherwise ignored, so a
//! config written for a newer version still loads.

use base::{err, Error};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/argus-nvr.toml";

/// The name of the SQLite metadata database within `storage_root`.
pub const DB_FILENAME: &str = "argus.db";

fn default_web_port() -> u16 {
    8080
}
fn default_segment_duration_s() -> u32 {
    60
}
fn default_pre_roll_s() -> u32 {
    5
}
fn default_post_roll_s() -> u32 {
    10
}
fn default_packet_timeout_s() -> u32 {
    5
}
fn default_buffer_memory_limit_mb() -> u64 {
    256
}
fn default_max_streams() -> u32 {
    16
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Where recordings and the metadata database live.
    pub storage_root: PathBuf,

    /// Listen port for the HTTP layer that wraps this core.
    #[serde(default = "default_web_port")]
    pub web_port: u16,

    #[serde(default = "default_segment_duration_s")]
    pub default_segment_duration_s: u32,

    #[serde(default = "default_pre_roll_s")]
    pub default_pre_roll_s: u32,

    #[serde(default = "default_post_roll_s")]
    pub default_post_roll_s: u32,

    #[serde(default = "default_packet_timeout_s")]
    pub packet_timeout_s: u32,

    #[serde(default = "default_buffer_memory_limit_mb")]
    pub buffer_memory_limit_mb: u64,

    #[serde(default = "default_max_streams")]
    pub max_streams: u32,

    #[serde(flatten)]
    pub unknown: serde_json::Map<String, serde_json::Value>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            storage_root: PathBuf::from("/var/lib/argus-nvr"),
            web_port: default_web_port(),
            default_segment_duration_s: default_segment_duration_s(),
            default_pre_roll_s: default_pre_roll_s(),
            default_post_roll_s: default_post_roll_s(),
            packet_timeout_s: default_packet_timeout_s(),
            buffer_memory_limit_mb: default_buffer_memory_limit_mb(),
            max_streams: default_max_streams(),
            unknown: Default::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            err!(
                InvalidArgument,
                msg("unable to read config {}", path.display()),
                source(e)
            )
        })?;
        let config: Config = toml::from_str(&raw).map_err(|e| {
            err!(
                InvalidArgument,
                msg("unable to parse config {}", path.display()),
                source(e)
            )
        })?;
        for k in config.unknown.keys() {
            warn!(key = %k, "ignoring unknown config key");
        }
        Ok(config)
    }

    pub fn buffer_memory_limit_bytes(&self) -> i64 {
        (self.buffer_memory_limit_mb as i64) << 20
    }

    pub fn db_path(&self) -> PathBuf {
        self.storage_root.join(DB_FILENAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn load_str(s: &str) -> Result<Config, Error> {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(s.as_bytes()).unwrap();
        Config::load(f.path())
    }

    #[test]
    fn minimal() {
        let c = load_str(r#"storage_root = "/tmp/argus""#).unwrap();
        assert_eq!(c.storage_root, PathBuf::from("/tmp/argus"));
        assert_eq!(c.default_segment_duration_s, 60);
        assert_eq!(c.default_pre_roll_s, 5);
        assert_eq!(c.default_post_roll_s, 10);
        assert_eq!(c.packet_timeout_s, 5);
        assert_eq!(c.buffer_memory_limit_mb, 256);
        assert_eq!(c.max_streams, 16);
        assert_eq!(c.db_path(), PathBuf::from("/tmp/argus/argus.db"));
    }

    #[test]
    fn unknown_keys_tolerated() {
        let c = load_str(
            r#"
            storage_root = "/tmp/argus"
            buffer_memory_limit_mb = 4
            some_future_knob = true
            "#,
        )
        .unwrap();
        assert_eq!(c.buffer_memory_limit_mb, 4);
        assert_eq!(c.buffer_memory_limit_bytes(), 4 << 20);
    }

    #[test]
    fn missing_storage_root_is_config_error() {
        let e = load_str(r#"web_port = 8080"#).unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::InvalidArgument);
    }
}
