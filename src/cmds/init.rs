// This file is part of Argus NVR, a lightweight network video recorder.
// Copyright (C) 2026 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use argus_nvr::config::Config;
use base::{bail, err, Error};
use bpaf::Bpaf;
use std::path::PathBuf;
use tracing::info;

/// Creates the storage layout and metadata database.
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
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(config.storage_root.join("recordings"))
        .map_err(|e| {
            err!(
                Unavailable,
                msg("unable to create {}", config.storage_root.display()),
                source(e)
            )
        })?;
    let db_path = config.db_path();
    if db_path.exists() {
        bail!(
            AlreadyExists,
            msg("database {} already exists", db_path.display())
        );
    }
    let mut conn = rusqlite::Connection::open(&db_path)
        .map_err(|e| err!(Unavailable, msg("unable to create {}", db_path.display()), source(e)))?;
    db::init(&mut conn)?;
    info!(path = %db_path.display(), "initialized");
    Ok(0)
}
