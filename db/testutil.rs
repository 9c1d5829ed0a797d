// This file is part of Argus NVR, a lightweight network video recorder.
// Copyright (C) 2026 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Utilities for automated testing involving Argus NVR's persistence library.
//! Used for tests of both the `argus_db` crate itself and the `argus_nvr`
//! crate.

use crate::json::StreamConfig;

static INIT: std::sync::Once = std::sync::Once::new();

/// Performs global initialization for tests: sets up logging. (Note the
/// output can be confusing unless `RUST_TEST_THREADS=1` is set in the
/// program's environment prior to running.)
pub fn init() {
    INIT.call_once(base::tracing_setup::install_for_tests);
}

/// Creates an empty in-memory database with the schema installed.
pub fn new_db() -> crate::Database {
    let mut conn = rusqlite::Connection::open_in_memory().expect("open in-memory db");
    crate::init(&mut conn).expect("init schema");
    crate::Database::from_conn(conn).expect("wrap connection")
}

/// A minimal valid stream config for the given URL.
pub fn stream_config(url: &str) -> StreamConfig {
    StreamConfig {
        url: url::Url::parse(url).expect("test url is valid"),
        protocol: Default::default(),
        mode: Default::default(),
        enabled: true,
        pre_roll_s: None,
        post_roll_s: None,
        segment_duration_s: None,
        detection_interval: None,
        detection_threshold: None,
        model: None,
        record_audio: true,
        unknown: Default::default(),
    }
}
