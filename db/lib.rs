// This file is part of Argus NVR, a lightweight network video recorder.
// Copyright (C) 2026 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

mod db;
pub mod json;
pub mod testutil;

pub use crate::db::{
    init, Database, RecordingFilter, RecordingId, RecordingRow, SegmentClose, SegmentRow, Trigger,
    SCHEMA_VERSION,
};
