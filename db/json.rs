// This file is part of Argus NVR, a lightweight network video recorder.
// Copyright (C) 2026 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! JSON types for use in the database schema. See references from `schema.sql`.

use rusqlite::types::{FromSqlError, ValueRef};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

macro_rules! sql {
    ($l:ident) => {
        impl rusqlite::types::FromSql for $l {
            fn column_result(value: ValueRef) -> Result<Self, FromSqlError> {
                match value {
                    ValueRef::Text(t) => {
                        Ok(serde_json::from_slice(t)
                            .map_err(|e| FromSqlError::Other(Box::new(e)))?)
                    }
                    _ => Err(FromSqlError::InvalidType),
                }
            }
        }

        impl rusqlite::types::ToSql for $l {
            fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
                Ok(serde_json::to_string(&self)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(e.into()))?
                    .into())
            }
        }
    };
}

/// The transport protocol used to fetch the stream.
#[derive(Copy, Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

/// How recording is driven for a stream.
#[derive(Copy, Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordMode {
    /// Record only around detection triggers (with pre/post-roll).
    #[default]
    Triggered,

    /// Record at all times; segments rotate at the configured duration.
    Continuous,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamConfig {
    /// The `rtsp://` URL to use for this stream, including credentials.
    pub url: Url,

    /// TCP (default) or UDP. A multicast host in `url` forces UDP regardless
    /// of this setting.
    #[serde(default)]
    pub protocol: Protocol,

    #[serde(default)]
    pub mode: RecordMode,

    /// Whether the stream's ingestor starts with the process. A disabled
    /// stream is registered but idle until `start_stream`.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds of video to retroactively include before a trigger.
    /// Falls back to the process default when unset.
    #[serde(default)]
    pub pre_roll_s: Option<u32>,

    /// Seconds of video to keep recording after the last trigger.
    #[serde(default)]
    pub post_roll_s: Option<u32>,

    /// Target duration of one segment file.
    #[serde(default)]
    pub segment_duration_s: Option<u32>,

    /// Sample every Nth video keyframe for detection.
    #[serde(default)]
    pub detection_interval: Option<u32>,

    /// Minimum confidence for a verdict to count as a trigger.
    #[serde(default)]
    pub detection_threshold: Option<f32>,

    /// Locator for the detection model; opaque to the recording core.
    #[serde(default)]
    pub model: Option<String>,

    /// Whether to record the camera's audio track, if it has a usable one.
    #[serde(default = "default_true")]
    pub record_audio: bool,

    #[serde(flatten)]
    pub unknown: Map<String, Value>,
}
sql!(StreamConfig);

fn default_true() -> bool {
    true
}

impl StreamConfig {
    /// Logs a warning for each unrecognized key, as promised in the docs.
    pub fn warn_unknown(&self, stream_name: &str) {
        for k in self.unknown.keys() {
            tracing::warn!(stream = stream_name, key = %k, "ignoring unknown stream config key");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_and_unknown_keys() {
        let c: StreamConfig = serde_json::from_str(
            r#"{"url": "rtsp://user:pw@cam/front", "frobnicate": true}"#,
        )
        .unwrap();
        assert_eq!(c.protocol, Protocol::Tcp);
        assert_eq!(c.mode, RecordMode::Triggered);
        assert!(c.enabled);
        assert!(c.record_audio);
        assert!(c.unknown.contains_key("frobnicate"));
    }

    #[test]
    fn round_trip() {
        let c: StreamConfig = serde_json::from_str(
            r#"{"url": "rtsp://cam/front", "protocol": "udp", "mode": "continuous",
                "preRollS": 5, "postRollS": 10, "segmentDurationS": 30}"#,
        )
        .unwrap();
        let s = serde_json::to_string(&c).unwrap();
        let c2: StreamConfig = serde_json::from_str(&s).unwrap();
        assert_eq!(c, c2);
        assert_eq!(c2.protocol, Protocol::Udp);
        assert_eq!(c2.mode, RecordMode::Continuous);
        assert_eq!(c2.pre_roll_s, Some(5));
    }
}
