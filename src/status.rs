// This file is part of Argus NVR, a lightweight network video recorder.
// Copyright (C) 2026 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Shared per-stream status, written by the ingestor and controller and read
//! by the registry's status queries.

use crate::buffer::BufferStats;
use std::sync::{Arc, Mutex};

/// The ingestor's lifecycle state.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StreamState {
    Initializing,
    Connecting,
    Running,
    Reconnecting,
    Stopping,
    Stopped,

    /// Still retrying, but 10+ consecutive connection attempts have failed.
    Error,
}

impl StreamState {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamState::Initializing => "initializing",
            StreamState::Connecting => "connecting",
            StreamState::Running => "running",
            StreamState::Reconnecting => "reconnecting",
            StreamState::Stopping => "stopping",
            StreamState::Stopped => "stopped",
            StreamState::Error => "error",
        }
    }
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters accumulated over the stream's whole life.
#[derive(Clone, Copy, Debug, Default)]
pub struct StreamStats {
    pub packets: u64,
    pub bytes: u64,
    pub keyframes: u64,
    pub reconnects: u64,
    pub timestamp_corrections: u64,
    pub detection_samples: u64,
    pub buffer: BufferStats,
}

/// A point-in-time view of one stream, as returned by `get_status`.
#[derive(Clone, Debug)]
pub struct StreamStatus {
    pub state: StreamState,
    pub controller_state: &'static str,
    pub stats: StreamStats,
    pub current_recording: Option<db::RecordingId>,

    /// The latest non-transient error, cleared when the stream returns to
    /// running.
    pub last_error: Option<String>,
}

impl Default for StreamStatus {
    fn default() -> Self {
        StreamStatus {
            state: StreamState::Initializing,
            controller_state: "idle",
            stats: StreamStats::default(),
            current_recording: None,
            last_error: None,
        }
    }
}

/// Handle shared between the registry and the stream's task.
#[derive(Clone, Default)]
pub struct SharedStatus(Arc<Mutex<StreamStatus>>);

impl SharedStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StreamStatus {
        self.lock().clone()
    }

    pub fn set_state(&self, state: StreamState) {
        let mut l = self.lock();
        l.state = state;
        if state == StreamState::Running {
            // Back to healthy; the error field describes only current woes.
            l.last_error = None;
        }
    }

    pub fn set_error(&self, msg: String) {
        self.lock().last_error = Some(msg);
    }

    pub fn update<F: FnOnce(&mut StreamStatus)>(&self, f: F) {
        f(&mut self.lock());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StreamStatus> {
        self.0.lock().expect("status lock poisoned")
    }
}
