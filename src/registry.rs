// This file is part of Argus NVR, a lightweight network video recorder.
// Copyright (C) 2026 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The stream registry: the single source of truth for stream existence,
//! lifecycle, and control.
//!
//! The registry exclusively owns every stream entry; a stream's task owns
//! its buffer, trackers, and writer. Other components refer to streams by
//! name and resolve through here. There are no process-wide stream tables.

use crate::buffer::GlobalBudget;
use crate::config::Config;
use crate::controller::{Command, ControllerConfig};
use crate::detect::{DetectionSample, DetectionVerdict};
use crate::status::{SharedStatus, StreamStatus};
use crate::stream;
use crate::streamer::{self, Msg, StreamSettings, Streamer};
use base::clock::Clocks;
use base::time::Duration;
use base::{bail, err, Error};
use db::json::{RecordMode, StreamConfig};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use tracing::{info, warn};

pub const MAX_STREAM_NAME_LEN: usize = 64;

/// How long `stop_stream` and shutdown wait for a stream task to exit
/// gracefully before abandoning it.
const STOP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// One row of `list_streams`.
#[derive(Clone, Debug)]
pub struct StreamInfo {
    pub name: String,
    pub enabled: bool,
    pub running: bool,
    pub status: StreamStatus,
}

struct Running {
    msg_tx: mpsc::SyncSender<Msg>,

    /// Dropping this asks the task to stop.
    shutdown_tx: Option<base::shutdown::Sender>,

    /// Closed by the task on exit; lets stops be bounded by a timeout.
    done_rx: mpsc::Receiver<std::convert::Infallible>,
    join: Option<std::thread::JoinHandle<()>>,
    status: SharedStatus,
}

struct StreamEntry {
    config: StreamConfig,
    running: Option<Running>,
}

pub struct Registry<C: Clocks + Clone> {
    clocks: C,
    config: Config,
    db: Arc<db::Database>,
    opener: Arc<dyn stream::Opener>,
    budget: Arc<GlobalBudget>,
    detection_tx: Option<mpsc::SyncSender<DetectionSample>>,

    /// `None` when no tokio runtime exists (unit tests with mock openers).
    rt_handle: Option<tokio::runtime::Handle>,

    streams: Mutex<HashMap<String, StreamEntry>>,
    shutting_down: AtomicBool,
}

fn validate_name(name: &str) -> Result<(), Error> {
    if name.is_empty() || name.len() > MAX_STREAM_NAME_LEN {
        bail!(
            InvalidArgument,
            msg("stream name must be 1..={MAX_STREAM_NAME_LEN} bytes")
        );
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        // Names become path components under the storage root.
        bail!(
            InvalidArgument,
            msg("stream name {name:?} may only contain [A-Za-z0-9_-]")
        );
    }
    Ok(())
}

fn validate_config(config: &StreamConfig) -> Result<(), Error> {
    if config.url.scheme() != "rtsp" {
        bail!(
            InvalidArgument,
            msg("stream url must be rtsp://, not {}://", config.url.scheme())
        );
    }
    if let Some(0) = config.segment_duration_s {
        bail!(InvalidArgument, msg("segment_duration_s must be nonzero"));
    }
    Ok(())
}

impl<C: Clocks + Clone> Registry<C> {
    /// Creates a registry, loading stream definitions from the metadata
    /// store. Nothing is started; see [`Registry::start_enabled`].
    pub fn new(
        clocks: C,
        config: Config,
        db: Arc<db::Database>,
        opener: Arc<dyn stream::Opener>,
        detection_tx: Option<mpsc::SyncSender<DetectionSample>>,
    ) -> Result<Self, Error> {
        let budget = GlobalBudget::new(config.buffer_memory_limit_bytes());
        let mut streams = HashMap::new();
        for (name, config) in db.list_streams()? {
            config.warn_unknown(&name);
            streams.insert(
                name,
                StreamEntry {
                    config,
                    running: None,
                },
            );
        }
        Ok(Registry {
            clocks,
            config,
            db,
            opener,
            budget,
            detection_tx,
            rt_handle: tokio::runtime::Handle::try_current().ok(),
            streams: Mutex::new(streams),
            shutting_down: AtomicBool::new(false),
        })
    }

    fn check_not_shutting_down(&self) -> Result<(), Error> {
        if self.shutting_down.load(Ordering::SeqCst) {
            bail!(Cancelled, msg("shutting down"));
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, StreamEntry>> {
        self.streams.lock().expect("registry lock poisoned")
    }

    /// Registers a stream. If `config.enabled`, its ingestor starts
    /// immediately.
    pub fn add_stream(&self, name: &str, config: StreamConfig) -> Result<(), Error> {
        self.check_not_shutting_down()?;
        validate_name(name)?;
        validate_config(&config)?;
        config.warn_unknown(name);
        let mut l = self.lock();
        if l.contains_key(name) {
            bail!(AlreadyExists, msg("stream {name:?} already exists"));
        }
        if l.len() >= self.config.max_streams as usize {
            bail!(
                ResourceExhausted,
                msg("stream limit of {} reached", self.config.max_streams)
            );
        }
        self.db.insert_stream(name, &config)?;
        let enabled = config.enabled;
        l.insert(
            name.to_owned(),
            StreamEntry {
                config,
                running: None,
            },
        );
        info!(stream = name, "added");
        if enabled {
            self.start_locked(&mut l, name)?;
        }
        Ok(())
    }

    /// Unregisters a stopped stream. Its recordings stay in the store.
    pub fn remove_stream(&self, name: &str) -> Result<(), Error> {
        self.check_not_shutting_down()?;
        let mut l = self.lock();
        let entry = l
            .get(name)
            .ok_or_else(|| err!(NotFound, msg("no stream {name:?}")))?;
        if entry.running.is_some() {
            bail!(
                FailedPrecondition,
                msg("stream {name:?} is running; stop it first")
            );
        }
        self.db.delete_stream(name)?;
        l.remove(name);
        info!(stream = name, "removed");
        Ok(())
    }

    pub fn start_stream(&self, name: &str) -> Result<(), Error> {
        self.check_not_shutting_down()?;
        let mut l = self.lock();
        if !l.contains_key(name) {
            bail!(NotFound, msg("no stream {name:?}"));
        }
        self.start_locked(&mut l, name)
    }

    fn start_locked(
        &self,
        l: &mut HashMap<String, StreamEntry>,
        name: &str,
    ) -> Result<(), Error> {
        let entry = l.get_mut(name).expect("caller verified existence");
        if entry.running.is_some() {
            return Ok(()); // already running
        }
        let (shutdown_tx, shutdown_rx) = base::shutdown::channel();
        let (msg_tx, msg_rx) = mpsc::sync_channel(16);
        let (done_tx, done_rx) = mpsc::sync_channel::<std::convert::Infallible>(1);
        let status = SharedStatus::new();
        let settings = self.settings_for(name, &entry.config);
        let mut streamer = Streamer::new(
            self.clocks.clone(),
            settings,
            self.opener.clone(),
            self.db.clone(),
            self.budget.clone(),
            shutdown_rx,
            status.clone(),
            msg_rx,
            self.detection_tx.clone(),
        );
        let rt_handle = self.rt_handle.clone();
        let join = std::thread::Builder::new()
            .name(format!("s-{name}"))
            .spawn(move || {
                let _enter = rt_handle.as_ref().map(|h| h.enter());
                let _done_tx = done_tx;
                streamer.run();
            })
            .map_err(|e| err!(Internal, msg("unable to spawn stream thread"), source(e)))?;
        entry.running = Some(Running {
            msg_tx,
            shutdown_tx: Some(shutdown_tx),
            done_rx,
            join: Some(join),
            status,
        });
        info!(stream = name, "started");
        Ok(())
    }

    /// Resolves per-stream settings against the process defaults.
    fn settings_for(&self, name: &str, c: &StreamConfig) -> StreamSettings {
        let pre_roll = Duration::from_secs(
            c.pre_roll_s.unwrap_or(self.config.default_pre_roll_s).into(),
        );
        let post_roll = Duration::from_secs(
            c.post_roll_s
                .unwrap_or(self.config.default_post_roll_s)
                .into(),
        );
        let segment_duration = Duration::from_secs(
            c.segment_duration_s
                .unwrap_or(self.config.default_segment_duration_s)
                .into(),
        );
        let slice = streamer::buffer_slice_bytes(
            pre_roll,
            self.config.buffer_memory_limit_bytes(),
            self.config.max_streams,
        );
        StreamSettings {
            name: name.to_owned(),
            url: c.url.clone(),
            protocol: c.protocol,
            record_audio: c.record_audio,
            packet_timeout: std::time::Duration::from_secs(self.config.packet_timeout_s.into()),
            buffer_slice_bytes: slice,
            buffer_capacity_packets: (slice / 512).max(1024),
            controller: ControllerConfig {
                stream_name: name.to_owned(),
                storage_root: self.config.storage_root.clone(),
                continuous: c.mode == RecordMode::Continuous,
                pre_roll,
                post_roll,
                cooldown: post_roll,
                segment_duration,
                detection_interval: c.detection_interval.unwrap_or(10),
                detection_threshold: c.detection_threshold.unwrap_or(0.5),
            },
        }
    }

    /// Starts every stream whose config says `enabled`; used at process
    /// startup. Failures are logged, not fatal.
    pub fn start_enabled(&self) {
        let names: Vec<String> = {
            let l = self.lock();
            l.iter()
                .filter(|(_, e)| e.config.enabled)
                .map(|(n, _)| n.clone())
                .collect()
        };
        for name in names {
            if let Err(e) = self.start_stream(&name) {
                warn!(stream = %name, err = %e.chain(), "unable to start stream");
            }
        }
    }

    /// Stops a stream's ingestor, waiting up to 30 s. Idempotent: stopping
    /// a stopped (or merely registered) stream is a no-op.
    pub fn stop_stream(&self, name: &str) -> Result<(), Error> {
        let running = {
            let mut l = self.lock();
            let entry = l
                .get_mut(name)
                .ok_or_else(|| err!(NotFound, msg("no stream {name:?}")))?;
            entry.running.take()
        };
        let Some(running) = running else {
            return Ok(());
        };
        self.stop_running(name, running);
        Ok(())
    }

    fn stop_running(&self, name: &str, mut running: Running) {
        drop(running.shutdown_tx.take());
        drop(running.msg_tx);
        match self.clocks.recv_timeout(&running.done_rx, STOP_TIMEOUT) {
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                if let Some(join) = running.join.take() {
                    let _ = join.join();
                }
                info!(stream = name, "stopped");
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                // Abandon the thread; it holds only its own resources and
                // will be reaped at process exit.
                warn!(stream = name, "stream did not stop within {STOP_TIMEOUT:?}; abandoning");
            }
            Ok(i) => match i {},
        }
    }

    /// Status for a registered stream whose task isn't running.
    fn idle_status() -> StreamStatus {
        StreamStatus {
            state: crate::status::StreamState::Stopped,
            ..Default::default()
        }
    }

    pub fn list_streams(&self) -> Vec<StreamInfo> {
        let l = self.lock();
        let mut out: Vec<StreamInfo> = l
            .iter()
            .map(|(name, e)| StreamInfo {
                name: name.clone(),
                enabled: e.config.enabled,
                running: e.running.is_some(),
                status: e
                    .running
                    .as_ref()
                    .map(|r| r.status.snapshot())
                    .unwrap_or_else(Self::idle_status),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn get_status(&self, name: &str) -> Result<StreamStatus, Error> {
        let l = self.lock();
        let entry = l
            .get(name)
            .ok_or_else(|| err!(NotFound, msg("no stream {name:?}")))?;
        Ok(entry
            .running
            .as_ref()
            .map(|r| r.status.snapshot())
            .unwrap_or_else(Self::idle_status))
    }

    fn send(&self, name: &str, msg: Msg) -> Result<(), Error> {
        self.check_not_shutting_down()?;
        let l = self.lock();
        let entry = l
            .get(name)
            .ok_or_else(|| err!(NotFound, msg("no stream {name:?}")))?;
        let running = entry
            .running
            .as_ref()
            .ok_or_else(|| err!(FailedPrecondition, msg("stream {name:?} is not running")))?;
        running
            .msg_tx
            .try_send(msg)
            .map_err(|_| err!(ResourceExhausted, msg("stream {name:?} command queue full")))
    }

    /// Starts, extends, or latches a recording; used by the detection glue
    /// and the manual-record control.
    pub fn trigger_recording(&self, name: &str, trigger: db::Trigger) -> Result<(), Error> {
        self.send(name, Msg::Command(Command::Trigger(trigger)))
    }

    /// Begins continuous recording on a stream configured for triggers.
    pub fn start_continuous(&self, name: &str) -> Result<(), Error> {
        self.send(name, Msg::Command(Command::StartContinuous))
    }

    /// Ends a continuous/manual recording through the post-buffer path.
    pub fn stop_recording(&self, name: &str) -> Result<(), Error> {
        self.send(name, Msg::Command(Command::Stop))
    }

    /// Immediately finalizes a stream's recording in progress, skipping the
    /// post-buffer wait.
    pub fn force_close(&self, name: &str) -> Result<(), Error> {
        self.send(name, Msg::Command(Command::ForceClose))
    }

    /// Routes one detection verdict to a stream's controller.
    pub fn submit_verdict(&self, name: &str, verdict: DetectionVerdict) -> Result<(), Error> {
        self.send(name, Msg::Verdict(verdict))
    }

    pub fn query_recordings(
        &self,
        filter: &db::RecordingFilter,
    ) -> Result<Vec<db::RecordingRow>, Error> {
        self.db.query_recordings(filter)
    }

    /// Stops everything. Concurrent control calls fail with `Cancelled`.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let to_stop: Vec<(String, Running)> = {
            let mut l = self.lock();
            l.iter_mut()
                .filter_map(|(n, e)| e.running.take().map(|r| (n.clone(), r)))
                .collect()
        };
        // Signal everything first so the stops overlap, then reap.
        let mut draining = Vec::with_capacity(to_stop.len());
        for (name, mut running) in to_stop {
            drop(running.shutdown_tx.take());
            draining.push((name, running));
        }
        for (name, running) in draining {
            self.stop_running(&name, running);
        }
        info!("registry shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use base::clock::RealClocks;
    use base::ErrorKind;

    /// An opener that always fails; good enough for control-surface tests.
    struct NeverOpener;

    impl stream::Opener for NeverOpener {
        fn open(
            &self,
            _label: String,
            _url: url::Url,
            _options: stream::Options,
        ) -> Result<Box<dyn stream::Stream>, Error> {
            Err(base::err!(Unavailable, msg("test opener never connects")))
        }
    }

    fn new_registry(max_streams: u32) -> (Registry<RealClocks>, tempfile::TempDir) {
        testutil::init();
        let tmp = tempfile::tempdir().unwrap();
        let config = Config {
            storage_root: tmp.path().to_owned(),
            max_streams,
            ..Config::default()
        };
        let db = Arc::new(db::testutil::new_db());
        let registry =
            Registry::new(RealClocks {}, config, db, Arc::new(NeverOpener), None).unwrap();
        (registry, tmp)
    }

    fn disabled_config(url: &str) -> StreamConfig {
        StreamConfig {
            enabled: false,
            ..db::testutil::stream_config(url)
        }
    }

    #[test]
    fn duplicate_name_rejected() {
        let (registry, _tmp) = new_registry(16);
        registry
            .add_stream("front", disabled_config("rtsp://cam/front"))
            .unwrap();
        let e = registry
            .add_stream("front", disabled_config("rtsp://cam/other"))
            .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::AlreadyExists);
        // First stream unaffected.
        assert_eq!(registry.list_streams().len(), 1);
        registry.get_status("front").unwrap();
    }

    #[test]
    fn name_and_config_validation() {
        let (registry, _tmp) = new_registry(16);
        let e = registry
            .add_stream("", disabled_config("rtsp://cam/x"))
            .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidArgument);
        let e = registry
            .add_stream("a/b", disabled_config("rtsp://cam/x"))
            .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidArgument);
        let e = registry
            .add_stream(&"x".repeat(65), disabled_config("rtsp://cam/x"))
            .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidArgument);
        let e = registry
            .add_stream("front", disabled_config("http://cam/x"))
            .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn stream_limit_enforced() {
        let (registry, _tmp) = new_registry(1);
        registry
            .add_stream("a", disabled_config("rtsp://cam/a"))
            .unwrap();
        let e = registry
            .add_stream("b", disabled_config("rtsp://cam/b"))
            .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::ResourceExhausted);
    }

    #[test]
    fn stop_is_idempotent() {
        let (registry, _tmp) = new_registry(16);
        registry
            .add_stream("front", disabled_config("rtsp://cam/front"))
            .unwrap();
        registry.start_stream("front").unwrap();
        registry.stop_stream("front").unwrap();
        registry.stop_stream("front").unwrap(); // second stop is a no-op
        registry.stop_stream("front").unwrap();
    }

    #[test]
    fn remove_requires_stopped() {
        let (registry, _tmp) = new_registry(16);
        registry
            .add_stream("front", disabled_config("rtsp://cam/front"))
            .unwrap();
        registry.start_stream("front").unwrap();
        let e = registry.remove_stream("front").unwrap_err();
        assert_eq!(e.kind(), ErrorKind::FailedPrecondition);
        registry.stop_stream("front").unwrap();
        registry.remove_stream("front").unwrap();
        let e = registry.get_status("front").unwrap_err();
        assert_eq!(e.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn trigger_requires_running_stream() {
        let (registry, _tmp) = new_registry(16);
        registry
            .add_stream("front", disabled_config("rtsp://cam/front"))
            .unwrap();
        let e = registry
            .trigger_recording("front", db::Trigger::Manual)
            .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::FailedPrecondition);
        let e = registry
            .trigger_recording("ghost", db::Trigger::Manual)
            .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn shutdown_blocks_control_calls() {
        let (registry, _tmp) = new_registry(16);
        registry
            .add_stream("front", disabled_config("rtsp://cam/front"))
            .unwrap();
        registry.start_stream("front").unwrap();
        registry.shutdown();
        let e = registry
            .add_stream("back", disabled_config("rtsp://cam/back"))
            .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Cancelled);
        // Streams report stopped after shutdown.
        let infos = registry.list_streams();
        assert!(!infos[0].running);
    }

    #[test]
    fn persisted_streams_reload() {
        testutil::init();
        let tmp = tempfile::tempdir().unwrap();
        let db = Arc::new(db::testutil::new_db());
        let config = Config {
            storage_root: tmp.path().to_owned(),
            ..Config::default()
        };
        {
            let registry = Registry::new(
                RealClocks {},
                config.clone(),
                db.clone(),
                Arc::new(NeverOpener),
                None,
            )
            .unwrap();
            registry
                .add_stream("front", disabled_config("rtsp://cam/front"))
                .unwrap();
        }
        let registry =
            Registry::new(RealClocks {}, config, db, Arc::new(NeverOpener), None).unwrap();
        let streams = registry.list_streams();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].name, "front");
        assert!(!streams[0].running);
    }
}
