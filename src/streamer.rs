// This file is part of Argus NVR, a lightweight network video recorder.
// Copyright (C) 2026 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The per-stream ingestor: a long-lived task that owns the RTSP
//! connection, the pre-roll buffer, the timestamp trackers, and the
//! recording controller, and survives network failures by reconnecting
//! with backoff.

use crate::buffer::{GlobalBudget, PacketBuffer};
use crate::controller::{Command, ControllerConfig, RecordingController};
use crate::detect::{DetectionSample, DetectionVerdict};
use crate::pkt::{Packet, StreamKind, TimeBase, Wallclock};
use crate::status::{SharedStatus, StreamState};
use crate::stream;
use crate::timestamp::TimestampTracker;
use base::clock::{warn_if_slow, Clocks};
use base::time::Duration;
use base::{Error, ErrorKind};
use rand::Rng;
use std::sync::{mpsc, Arc};
use tracing::{debug, info, warn};
use url::Url;

/// Reconnection backoff: base 500 ms, doubling to a 30 s cap, full jitter.
const BACKOFF_BASE: std::time::Duration = std::time::Duration::from_millis(500);
const BACKOFF_CAP: std::time::Duration = std::time::Duration::from_secs(30);

/// After this many consecutive connect failures the stream is marked ERROR
/// in the registry; the task keeps trying regardless.
const ERROR_THRESHOLD: u32 = 10;

/// Everything a stream's task consumes from the registry.
pub enum Msg {
    Command(Command),
    Verdict(DetectionVerdict),
}

/// Per-stream settings resolved against the process defaults.
#[derive(Clone, Debug)]
pub struct StreamSettings {
    pub name: String,
    pub url: Url,
    pub protocol: db::json::Protocol,
    pub record_audio: bool,
    pub packet_timeout: std::time::Duration,
    pub buffer_slice_bytes: usize,
    pub buffer_capacity_packets: usize,
    pub controller: ControllerConfig,
}

/// Connects to a given RTSP stream, feeds the buffer and controller, and
/// recovers from failures. Meant to be long-lived: it sleeps and retries
/// after each failure until shutdown.
pub struct Streamer<C: Clocks + Clone> {
    clocks: C,
    settings: StreamSettings,
    redacted_url: Url,
    opener: Arc<dyn stream::Opener>,
    shutdown: base::shutdown::Receiver,
    status: SharedStatus,
    inbound: mpsc::Receiver<Msg>,
    detection_tx: Option<mpsc::SyncSender<DetectionSample>>,

    buffer: PacketBuffer,
    video_tracker: TimestampTracker,
    audio_tracker: TimestampTracker,
    controller: RecordingController<C>,

    audio_clock_rate: u32,
    frame_size: (u16, u16),
    consecutive_failures: u32,
}

fn redact(url: &Url) -> Url {
    let mut redacted = url.clone();
    if url.password().is_some() {
        let _ = redacted.set_password(Some("redacted"));
    }
    redacted
}

impl<C: Clocks + Clone> Streamer<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clocks: C,
        settings: StreamSettings,
        opener: Arc<dyn stream::Opener>,
        db: Arc<db::Database>,
        budget: Arc<GlobalBudget>,
        shutdown: base::shutdown::Receiver,
        status: SharedStatus,
        inbound: mpsc::Receiver<Msg>,
        detection_tx: Option<mpsc::SyncSender<DetectionSample>>,
    ) -> Self {
        let is_udp = settings.protocol == db::json::Protocol::Udp;
        let buffer = PacketBuffer::new(
            settings.buffer_slice_bytes,
            settings.buffer_capacity_packets,
            settings.controller.pre_roll,
            budget,
        );
        let controller = RecordingController::new(
            settings.controller.clone(),
            clocks.clone(),
            db,
            status.clone(),
        );
        let redacted_url = redact(&settings.url);
        Streamer {
            clocks,
            settings,
            redacted_url,
            opener,
            shutdown,
            status,
            inbound,
            detection_tx,
            buffer,
            video_tracker: TimestampTracker::new(is_udp),
            audio_tracker: TimestampTracker::new(is_udp),
            controller,
            audio_clock_rate: 0,
            frame_size: (0, 0),
            consecutive_failures: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    /// Runs until shutdown: connect, ingest, reconnect with backoff.
    pub fn run(&mut self) {
        let mut backoff = BACKOFF_BASE;
        let mut first = true;
        while self.shutdown.check().is_ok() {
            if !first {
                // RECONNECTING: close out the old connection's state. The
                // buffer is cleared because extradata may differ; the
                // trackers rebase so a straddling recording's timeline
                // continues seamlessly.
                if self.consecutive_failures < ERROR_THRESHOLD {
                    self.status.set_state(StreamState::Reconnecting);
                }
                self.controller.on_reconnecting();
                self.buffer.clear();
                self.video_tracker.rebase();
                self.audio_tracker.rebase();
                self.status.update(|s| s.stats.reconnects += 1);

                let sleep = full_jitter(backoff);
                debug!(stream = %self.settings.name, ?sleep, "backing off before reconnect");
                if self.shutdown.wait_for(sleep).is_err() {
                    break;
                }
                backoff = std::cmp::min(backoff * 2, BACKOFF_CAP);
            }
            first = false;

            self.status.set_state(StreamState::Connecting);
            info!(stream = %self.settings.name, url = %self.redacted_url, "opening input");
            let label = format!("opening {}", self.redacted_url);
            let opened = warn_if_slow(&self.clocks, &label, || {
                self.opener.open(
                    self.settings.name.clone(),
                    self.settings.url.clone(),
                    stream::Options {
                        transport: self.settings.protocol,
                        record_audio: self.settings.record_audio,
                        packet_timeout: self.settings.packet_timeout,
                        shutdown: self.shutdown.clone(),
                    },
                )
            });
            let mut s = match opened {
                Ok(s) => s,
                Err(e) => {
                    self.consecutive_failures += 1;
                    if self.consecutive_failures >= ERROR_THRESHOLD {
                        self.status.set_state(StreamState::Error);
                        self.status.set_error(e.chain().to_string());
                    }
                    warn!(
                        stream = %self.settings.name,
                        err = %e.chain(),
                        failures = self.consecutive_failures,
                        "unable to open stream"
                    );
                    continue;
                }
            };
            self.consecutive_failures = 0;
            backoff = BACKOFF_BASE;
            self.status.set_state(StreamState::Running);
            self.audio_clock_rate = s.audio_params().map(|a| a.clock_rate).unwrap_or(0);
            let vp = s.video_params().clone();
            self.frame_size = (vp.width, vp.height);
            self.controller.set_codec_params(vp, s.audio_params().cloned());
            if let Err(e) = self.controller.on_running(&self.buffer) {
                warn!(stream = %self.settings.name, err = %e.chain(), "controller resume failed");
            }

            match self.run_connected(s.as_mut()) {
                Ok(()) => break, // shutdown
                Err(e) => {
                    // Transient by definition; never surfaced to the
                    // registry as a failure.
                    warn!(stream = %self.settings.name, err = %e.chain(), "stream failed; will reconnect");
                }
            }
        }

        // STOPPING: finalize any recording and publish final stats.
        self.status.set_state(StreamState::Stopping);
        self.controller.shutdown();
        let buffer_stats = self.buffer.stats();
        self.buffer.clear();
        self.status.update(|s| s.stats.buffer = buffer_stats);
        self.status.set_state(StreamState::Stopped);
        info!(stream = %self.settings.name, "shut down");
    }

    /// Ingests until failure or shutdown. `Ok(())` means stop was requested.
    fn run_connected(&mut self, s: &mut dyn stream::Stream) -> Result<(), Error> {
        loop {
            // A stop command is honored before any further packet is pushed.
            if !self.drain_inbound() {
                return Ok(());
            }
            if self.shutdown.check().is_err() {
                return Ok(());
            }
            let frame = match s.next() {
                Ok(f) => f,
                Err(e) if e.kind() == ErrorKind::Cancelled => return Ok(()),
                Err(e) => return Err(e),
            };
            let pkt = self.make_packet(frame);
            self.note_packet(&pkt);
            self.buffer.push(pkt.clone());
            match self.controller.on_packet(&pkt, &self.buffer) {
                Ok(true) => self.emit_sample(&pkt),
                Ok(false) => {}
                Err(e) => {
                    // Metadata store hiccup; the stream itself is fine.
                    warn!(stream = %self.settings.name, err = %e.chain(), "controller error");
                }
            }
        }
    }

    /// Applies queued commands and verdicts. Returns false on shutdown (the
    /// registry hung up).
    fn drain_inbound(&mut self) -> bool {
        loop {
            match self.inbound.try_recv() {
                Ok(Msg::Command(cmd)) => {
                    debug!(stream = %self.settings.name, ?cmd, "applying command");
                    if let Err(e) = self.controller.on_command(cmd, &self.buffer) {
                        warn!(stream = %self.settings.name, err = %e.chain(), "command failed");
                    }
                }
                Ok(Msg::Verdict(v)) => {
                    if let Err(e) = self.controller.on_verdict(v, &self.buffer) {
                        warn!(stream = %self.settings.name, err = %e.chain(), "verdict failed");
                    }
                }
                Err(mpsc::TryRecvError::Empty) => return true,
                Err(mpsc::TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn make_packet(&mut self, frame: stream::StreamFrame) -> Packet {
        let now = self.clocks.now();
        let arrival = Wallclock {
            monotonic: now.mono,
            realtime: now.wall,
        };
        let (tracker, time_base) = match frame.kind {
            StreamKind::Video => (&mut self.video_tracker, TimeBase::VIDEO_90K),
            StreamKind::Audio => (
                &mut self.audio_tracker,
                TimeBase::per_second(self.audio_clock_rate.max(1)),
            ),
        };
        // RTSP cameras don't deliver a distinct decode timestamp; the
        // tracker keeps both monotonic regardless.
        let ts = tracker.normalize(frame.pts, frame.pts);
        Packet {
            stream: frame.kind,
            pts: ts.pts,
            dts: ts.dts,
            time_base,
            is_keyframe: frame.is_keyframe,
            payload: frame.data,
            duration: frame.duration,
            arrival,
        }
    }

    fn note_packet(&mut self, pkt: &Packet) {
        let corrections =
            self.video_tracker.discontinuity_count() + self.audio_tracker.discontinuity_count();
        let buffer_stats = self.buffer.stats();
        self.status.update(|s| {
            s.stats.packets += 1;
            s.stats.bytes += pkt.payload.len() as u64;
            if pkt.is_video_keyframe() {
                s.stats.keyframes += 1;
            }
            s.stats.timestamp_corrections = corrections;
            s.stats.buffer = buffer_stats;
        });
    }

    fn emit_sample(&mut self, pkt: &Packet) {
        let Some(tx) = self.detection_tx.as_ref() else {
            return;
        };
        let sample = DetectionSample {
            stream_name: self.settings.name.clone(),
            at: pkt.arrival.realtime,
            payload: pkt.payload.clone(),
            width: self.frame_size.0,
            height: self.frame_size.1,
        };
        match tx.try_send(sample) {
            Ok(()) => self.status.update(|s| s.stats.detection_samples += 1),
            Err(mpsc::TrySendError::Full(_)) => {
                // Detection lags; skipping a sample beats stalling ingest.
                debug!(stream = %self.settings.name, "detection sampler busy; sample skipped");
            }
            Err(mpsc::TrySendError::Disconnected(_)) => {}
        }
    }
}

/// Full jitter: a uniformly random delay in `[0, cap]`.
fn full_jitter(cap: std::time::Duration) -> std::time::Duration {
    let millis = cap.as_millis() as u64;
    std::time::Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
}

/// Derives the buffer's byte slice for one stream: enough for
/// `pre_roll + post_roll` at a generous bitrate, within the global budget.
pub fn buffer_slice_bytes(pre_roll: Duration, global_limit: i64, max_streams: u32) -> usize {
    let per_stream = (global_limit / i64::from(max_streams.max(1))) as usize;
    // 2 MiB/s covers a 16 Mbps camera; pre-roll plus slack for one GOP.
    let wanted = (pre_roll.whole_secs().max(1) as usize + 2) * (2 << 20);
    wanted.min(per_stream.max(1 << 20))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkt::CodecParameters;
    use crate::stream::StreamFrame;
    use crate::testutil::{self, PacketGen};
    use base::clock::SimulatedClocks;
    use base::time::Time;
    use std::sync::Mutex;

    /// Yields scripted frames, advancing the simulated clock as a camera
    /// would; errors out at the end of its script.
    struct MockStream {
        clocks: SimulatedClocks,
        frames: Vec<StreamFrame>, // reversed; popped from the back
        video_params: CodecParameters,
        tick: Duration,
    }

    impl stream::Stream for MockStream {
        fn video_params(&self) -> &CodecParameters {
            &self.video_params
        }
        fn audio_params(&self) -> Option<&CodecParameters> {
            None
        }
        fn next(&mut self) -> Result<StreamFrame, Error> {
            match self.frames.pop() {
                Some(f) => {
                    self.clocks.sleep(self.tick);
                    Ok(f)
                }
                None => Err(base::err!(Unavailable, msg("end of stream"))),
            }
        }
    }

    struct MockOpener {
        expected_url: Url,
        streams: Mutex<Vec<MockStream>>,

        /// Dropped (signaling shutdown) when the script runs out.
        shutdown_tx: Mutex<Option<base::shutdown::Sender>>,
    }

    impl stream::Opener for MockOpener {
        fn open(
            &self,
            _label: String,
            url: Url,
            _options: stream::Options,
        ) -> Result<Box<dyn stream::Stream>, Error> {
            assert_eq!(url, self.expected_url);
            let mut l = self.streams.lock().unwrap();
            match l.pop() {
                Some(s) => Ok(Box::new(s)),
                None => {
                    *self.shutdown_tx.lock().unwrap() = None;
                    Err(base::err!(Unavailable, msg("done")))
                }
            }
        }
    }

    fn script(clocks: &SimulatedClocks, frames: usize, fps: u32, gop: u64) -> MockStream {
        let mut gen = PacketGen::new(fps, gop);
        let tick = Duration(base::time::TIME_UNITS_PER_SEC / i64::from(fps));
        let frames = (0..frames)
            .map(|_| {
                let p = gen.next_video();
                StreamFrame {
                    kind: StreamKind::Video,
                    pts: p.pts,
                    is_keyframe: p.is_keyframe,
                    data: p.payload,
                    duration: None,
                }
            })
            .rev()
            .collect();
        MockStream {
            clocks: clocks.clone(),
            frames,
            video_params: testutil::video_params(),
            tick,
        }
    }

    fn settings(tmp: &std::path::Path) -> StreamSettings {
        StreamSettings {
            name: "front".to_owned(),
            url: Url::parse("rtsp://cam/front").unwrap(),
            protocol: db::json::Protocol::Tcp,
            record_audio: false,
            packet_timeout: std::time::Duration::from_secs(5),
            buffer_slice_bytes: 64 << 20,
            buffer_capacity_packets: 100_000,
            controller: ControllerConfig {
                stream_name: "front".to_owned(),
                storage_root: tmp.to_owned(),
                continuous: true,
                pre_roll: Duration::from_secs(5),
                post_roll: Duration::from_secs(10),
                cooldown: Duration::from_secs(10),
                segment_duration: Duration::from_secs(10),
                detection_interval: 0,
                detection_threshold: 0.5,
            },
        }
    }

    #[test]
    fn ingests_reconnects_and_stops() {
        testutil::init();
        let tmp = tempfile::tempdir().unwrap();
        let clocks = SimulatedClocks::new(Time::from_unix_secs(1_700_000_000));
        let (shutdown_tx, shutdown_rx) = base::shutdown::channel();
        // Two connections of 12 s each, with a drop in between.
        let opener = Arc::new(MockOpener {
            expected_url: Url::parse("rtsp://cam/front").unwrap(),
            streams: Mutex::new(vec![
                script(&clocks, 300, 25, 50),
                script(&clocks, 300, 25, 50),
            ]),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
        });
        let db = Arc::new(db::testutil::new_db());
        let status = SharedStatus::new();
        let (_msg_tx, msg_rx) = mpsc::sync_channel(16);
        let mut streamer = Streamer::new(
            clocks.clone(),
            settings(tmp.path()),
            opener.clone(),
            db.clone(),
            GlobalBudget::new(1 << 30),
            shutdown_rx,
            status.clone(),
            msg_rx,
            None,
        );
        streamer.run();

        let st = status.snapshot();
        assert_eq!(st.state, StreamState::Stopped);
        assert_eq!(st.stats.packets, 600);
        assert_eq!(st.stats.keyframes, 12);
        assert!(st.stats.reconnects >= 1);
        assert!(opener.streams.lock().unwrap().is_empty());

        // Continuous mode: the two connections share one recording,
        // preserved across the reconnect and finalized at shutdown.
        let recs = db.query_recordings(&db::RecordingFilter::default()).unwrap();
        assert_eq!(recs.len(), 1);
        assert!(recs[0].complete);
        assert!(!recs[0].segments.is_empty());
    }

    #[test]
    fn stop_honored_before_packets() {
        testutil::init();
        let tmp = tempfile::tempdir().unwrap();
        let clocks = SimulatedClocks::new(Time::from_unix_secs(1_700_000_000));
        let (shutdown_tx, shutdown_rx) = base::shutdown::channel();
        let opener = Arc::new(MockOpener {
            expected_url: Url::parse("rtsp://cam/front").unwrap(),
            streams: Mutex::new(vec![script(&clocks, 300, 25, 50)]),
            shutdown_tx: Mutex::new(None),
        });
        let db = Arc::new(db::testutil::new_db());
        let status = SharedStatus::new();
        let (msg_tx, msg_rx) = mpsc::sync_channel(16);
        let mut streamer = Streamer::new(
            clocks.clone(),
            settings(tmp.path()),
            opener,
            db,
            GlobalBudget::new(1 << 30),
            shutdown_rx,
            status.clone(),
            msg_rx,
            None,
        );
        // Hang up the registry side immediately: the streamer must stop
        // without consuming the scripted frames.
        drop(msg_tx);
        drop(shutdown_tx);
        streamer.run();
        let st = status.snapshot();
        assert_eq!(st.state, StreamState::Stopped);
        assert_eq!(st.stats.packets, 0);
    }

    #[test]
    fn jitter_stays_in_bounds() {
        for _ in 0..100 {
            let d = full_jitter(std::time::Duration::from_millis(500));
            assert!(d <= std::time::Duration::from_millis(500));
        }
    }
}
