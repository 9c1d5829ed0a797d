// This file is part of Argus NVR, a lightweight network video recorder.
// Copyright (C) 2026 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use argus_nvr::config::Config;
use argus_nvr::registry::Registry;
use argus_nvr::stream;
use base::clock::RealClocks;
use base::Error;
use bpaf::Bpaf;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

/// Runs the recorder: ingests every enabled stream until SIGINT/SIGTERM.
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

    /// The number of worker threads used by the asynchronous runtime.
    /// Defaults to the number of cores on the system.
    #[bpaf(long, argument("worker_threads"))]
    worker_threads: Option<usize>,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let config = Config::load(&args.config)?;
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(worker_threads) = args.worker_threads {
        builder.worker_threads(worker_threads);
    }
    builder
        .build()
        .expect("runtime build only fails on invalid settings")
        .block_on(async_run(config))
}

async fn async_run(config: Config) -> Result<i32, Error> {
    let database = Arc::new(db::Database::open(&config.db_path())?);
    let recovered = database.recover_interrupted()?;
    if recovered > 0 {
        info!(recovered, "closed recordings interrupted by the last shutdown");
    }

    let registry = Arc::new(Registry::new(
        RealClocks {},
        config,
        database,
        Arc::new(stream::RealOpener),
        None,
    )?);
    registry.start_enabled();
    info!("recording engine is up");

    let mut int = signal(SignalKind::interrupt())?;
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = int.recv() => info!("got SIGINT; shutting down"),
        _ = term.recv() => info!("got SIGTERM; shutting down"),
    }

    // Stops block on stream threads; keep the reactor responsive.
    let registry2 = registry.clone();
    tokio::task::spawn_blocking(move || registry2.shutdown())
        .await
        .expect("shutdown task panicked, see earlier error");
    info!("exiting");
    Ok(0)
}
