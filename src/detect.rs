// This file is part of Argus NVR, a lightweight network video recorder.
// Copyright (C) 2026 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The detection boundary.
//!
//! The recording core neither runs models nor diffs frames. It emits
//! sampled keyframes ([`DetectionSample`]) at the configured cadence and
//! consumes opaque verdicts ([`DetectionVerdict`]) from whatever backend the
//! embedder wires up — an HTTP API, an on-device network, or simple motion
//! differencing. Verdicts reach the per-stream controller through
//! [`crate::registry::Registry::submit_verdict`].

use base::time::Time;
use bytes::Bytes;

/// One detection decision, produced by an external subsystem.
#[derive(Clone, Debug)]
pub struct DetectionVerdict {
    /// When the analyzed frame was captured.
    pub at: Time,

    pub triggered: bool,

    /// Object class for object detection; `None` for plain motion.
    pub label: Option<String>,

    /// Confidence in `[0, 1]`. Compared against the stream's configured
    /// threshold before a verdict counts as a trigger.
    pub confidence: f32,
}

/// A keyframe handed to the detection glue for analysis, sampled every Nth
/// video keyframe per the stream's `detection_interval`.
#[derive(Clone)]
pub struct DetectionSample {
    pub stream_name: String,
    pub at: Time,

    /// The compressed keyframe, exactly as received; shared with the buffer
    /// and writer, not copied.
    pub payload: Bytes,
    pub width: u16,
    pub height: u16,
}

impl std::fmt::Debug for DetectionSample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectionSample")
            .field("stream_name", &self.stream_name)
            .field("at", &self.at)
            .field("payload_len", &self.payload.len())
            .finish_non_exhaustive()
    }
}
