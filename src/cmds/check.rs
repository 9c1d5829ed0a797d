// This file is part of Argus NVR, a lightweight network video recorder.
// Copyright (C) 2026 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use argus_nvr::config::Config;
use base::{err, Error};
use bpaf::Bpaf;
use std::io::Write as _;
use std::path::PathBuf;
use tracing::info;

/// Verifies the storage layout and metadata database are usable.
#[derive(Bpaf, Debug)]
#[bpaf(command)]
pub struct Args {
    /// Path to the process configuration file.
    #[bpaf(
        long,
        argument("PATH"),
        fallback(argus_nvr::config::DEFAULT_CONFIG_PATH.into()),
        debug_fallback
    )]
    config: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let config = Config::load(&args.config)?;

    // Storage must exist and be writable.
    let probe = config.storage_root.join(".argus-check");
    std::fs::File::create(&probe)
        .and_then(|mut f| f.write_all(b"ok"))
        .map_err(|e| {
            err!(
                Unavailable,
                msg("storage root {} is not writable", config.storage_root.display()),
                source(e)
            )
        })?;
    let _ = std::fs::remove_file(&probe);

    let database = db::Database::open(&config.db_path())?;
    let streams = database.list_streams()?;
    info!(
        storage_root = %config.storage_root.display(),
        streams = streams.len(),
        "check passed"
    );
    Ok(0)
}
