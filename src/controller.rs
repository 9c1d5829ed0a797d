// This file is part of Argus NVR, a lightweight network video recorder.
// Copyright (C) 2026 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The per-stream recording controller.
//!
//! Fuses packet arrivals, detection verdicts, control commands, and the
//! clock into writer lifecycle decisions:
//!
//! ```text
//! IDLE → BUFFERING → RECORDING ⇄ POST_BUFFER → (finalize) → BUFFERING
//!              ↑  any of these may detour through RECONNECTING  ↑
//! ```
//!
//! The controller is confined to its stream's ingestor task; it owns the
//! active writer and talks to the metadata store in short transactions.

use crate::buffer::PacketBuffer;
use crate::detect::DetectionVerdict;
use crate::pkt::{CodecParameters, Packet};
use crate::status::SharedStatus;
use crate::writer::{FinishedSegment, SegmentStarted, SegmentWriter, WriterConfig};
use base::clock::Clocks;
use base::time::{Duration, Time};
use base::Error;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use tracing::{debug, info, warn};

/// Control commands from the registry, applied before the next packet.
#[derive(Clone, Debug)]
pub enum Command {
    StartContinuous,

    /// A manual or external trigger, as from `trigger_recording`.
    Trigger(db::Trigger),

    /// Ends a latched (continuous/manual) event through the normal
    /// post-buffer path. A no-op while merely buffering.
    Stop,

    /// Immediately finalizes any recording in progress.
    ForceClose,
}

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    pub stream_name: String,
    pub storage_root: PathBuf,
    pub continuous: bool,
    pub pre_roll: Duration,
    pub post_roll: Duration,

    /// How long after the last trigger the event is considered over.
    /// Defaults to `post_roll`.
    pub cooldown: Duration,
    pub segment_duration: Duration,

    /// Sample every Nth video keyframe for detection; 0 disables sampling.
    pub detection_interval: u32,

    /// Minimum verdict confidence to count as a trigger.
    pub detection_threshold: f32,
}

enum State {
    Idle,
    Buffering,
    Recording,
    PostBuffer {
        since: Duration, // monotonic
    },
    Reconnecting {
        /// The interrupted state, to resume exactly where it paused.
        /// `None` when the stream was merely buffering.
        resume: Option<Resume>,
        /// At most one queued trigger, the freshest.
        queued: Option<db::Trigger>,
    },
}

/// Countdown progress captured when a reconnect interrupts a recording.
/// Clock ticks pause during the outage: the elapsed values are restored
/// against the resume-time clock, so disconnected seconds count toward
/// neither the cooldown nor the post-roll.
enum Resume {
    Recording { cooldown_elapsed: Duration },
    PostBuffer { elapsed: Duration },
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::Idle => "idle",
            State::Buffering => "buffering",
            State::Recording => "recording",
            State::PostBuffer { .. } => "post_buffer",
            State::Reconnecting { .. } => "reconnecting",
        }
    }
}

struct ActiveRecording {
    id: db::RecordingId,
    writer: SegmentWriter,
    events: mpsc::Receiver<SegmentStarted>,

    /// Monotonic time of the most recent trigger.
    last_trigger: Duration,

    /// Continuous/manual events never expire by cooldown; only `Stop` or
    /// `ForceClose` ends them.
    latched: bool,
}

pub struct RecordingController<C: Clocks> {
    config: ControllerConfig,
    clocks: C,
    db: Arc<db::Database>,
    status: SharedStatus,
    state: State,
    active: Option<ActiveRecording>,
    video_params: Option<CodecParameters>,
    audio_params: Option<CodecParameters>,
    keyframe_counter: u64,
}

impl<C: Clocks + Clone> RecordingController<C> {
    pub fn new(
        config: ControllerConfig,
        clocks: C,
        db: Arc<db::Database>,
        status: SharedStatus,
    ) -> Self {
        RecordingController {
            config,
            clocks,
            db,
            status,
            state: State::Idle,
            active: None,
            video_params: None,
            audio_params: None,
            keyframe_counter: 0,
        }
    }

    fn set_state(&mut self, state: State) {
        debug!(
            stream = %self.config.stream_name,
            from = self.state.name(),
            to = state.name(),
            "controller transition"
        );
        self.state = state;
        let name = self.state.name();
        let recording = self.active.as_ref().map(|a| a.id);
        self.status.update(|s| {
            s.controller_state = name;
            s.current_recording = recording;
        });
    }

    pub fn state_name(&self) -> &'static str {
        self.state.name()
    }

    /// Captures codec parameters on (re)connect; a reconnect may change
    /// extradata, so this runs every time.
    pub fn set_codec_params(
        &mut self,
        video: CodecParameters,
        audio: Option<CodecParameters>,
    ) {
        self.video_params = Some(video);
        self.audio_params = audio;
    }

    /// The ingestor reached RUNNING: start buffering, resume the paused
    /// state exactly as it was, or kick off continuous mode.
    pub fn on_running(&mut self, buffer: &PacketBuffer) -> Result<(), Error> {
        let now = self.clocks.now();
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Reconnecting { resume, queued } => {
                match resume {
                    Some(Resume::Recording { cooldown_elapsed }) => {
                        // Re-anchor the trigger so the cooldown continues
                        // from where the outage paused it.
                        if let Some(a) = self.active.as_mut() {
                            a.last_trigger = now.mono - cooldown_elapsed;
                        }
                        self.set_state(State::Recording);
                    }
                    Some(Resume::PostBuffer { elapsed }) => {
                        self.set_state(State::PostBuffer {
                            since: now.mono - elapsed,
                        });
                    }
                    None => self.set_state(State::Buffering),
                }
                if let Some(trigger) = queued {
                    info!(
                        stream = %self.config.stream_name,
                        %trigger,
                        "applying trigger queued during reconnect"
                    );
                    self.trigger_at(trigger, now.wall, buffer)?;
                }
            }
            State::Idle => {
                self.set_state(State::Buffering);
                if self.config.continuous {
                    self.trigger_at(db::Trigger::Continuous, now.wall, buffer)?;
                }
            }
            other => self.set_state(other),
        }
        Ok(())
    }

    /// The ingestor lost its connection. A recording in progress is
    /// preserved: the writer stays open, rotation pauses, the cooldown and
    /// post-roll countdowns freeze, and the normalizer's rebase keeps the
    /// timeline continuous on resume.
    pub fn on_reconnecting(&mut self) {
        let now = self.clocks.now();
        let resume = match self.state {
            State::Reconnecting { .. } => return,
            State::Recording => Some(Resume::Recording {
                cooldown_elapsed: self
                    .active
                    .as_ref()
                    .map(|a| now.mono - a.last_trigger)
                    .unwrap_or_default(),
            }),
            State::PostBuffer { since } => Some(Resume::PostBuffer {
                elapsed: now.mono - since,
            }),
            State::Idle | State::Buffering => None,
        };
        self.set_state(State::Reconnecting {
            resume,
            queued: None,
        });
    }

    /// Feeds one packet through. Returns true if this packet should be
    /// handed to the detection sampler.
    pub fn on_packet(&mut self, pkt: &Packet, buffer: &PacketBuffer) -> Result<bool, Error> {
        let mut wants_sample = false;
        if pkt.is_video_keyframe() {
            self.keyframe_counter += 1;
            wants_sample = !matches!(self.state, State::Idle)
                && self.config.detection_interval > 0
                && self.keyframe_counter % u64::from(self.config.detection_interval) == 0;
        }

        if matches!(self.state, State::Recording | State::PostBuffer { .. }) {
            if let Err(e) = self.write_packet(pkt) {
                self.on_storage_failure(e);
                return Ok(wants_sample);
            }
            self.drain_writer_events();
        }
        self.tick()?;
        Ok(wants_sample)
    }

    fn write_packet(&mut self, pkt: &Packet) -> Result<(), Error> {
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        // An empty-buffer trigger begins at the next live keyframe;
        // leading delta frames are not writable.
        if !active.writer.current_has_samples() && !pkt.is_video_keyframe() {
            return Ok(());
        }
        if let Some(finished) = active.writer.write(pkt)? {
            let id = active.id;
            self.persist_finished(id, &finished);
        }
        Ok(())
    }

    /// Time-driven transitions; also called when no packets arrive.
    pub fn tick(&mut self) -> Result<(), Error> {
        let now = self.clocks.now().mono;
        match self.state {
            State::Recording => {
                let expired = self.active.as_ref().is_some_and(|a| {
                    !a.latched && now - a.last_trigger > self.config.cooldown
                });
                if expired {
                    self.set_state(State::PostBuffer { since: now });
                }
            }
            State::PostBuffer { since } => {
                if now - since >= self.config.post_roll {
                    self.finalize(true);
                    self.set_state(State::Buffering);
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// A detection verdict from the external subsystem.
    pub fn on_verdict(
        &mut self,
        v: DetectionVerdict,
        buffer: &PacketBuffer,
    ) -> Result<(), Error> {
        if !v.triggered || v.confidence < self.config.detection_threshold {
            return self.tick();
        }
        let trigger = if v.label.is_some() {
            db::Trigger::Objects
        } else {
            db::Trigger::Motion
        };
        self.trigger_at(trigger, v.at, buffer)
    }

    /// A control command from the registry.
    pub fn on_command(&mut self, cmd: Command, buffer: &PacketBuffer) -> Result<(), Error> {
        match cmd {
            Command::StartContinuous => {
                self.trigger_at(db::Trigger::Continuous, self.clocks.now().wall, buffer)
            }
            Command::Trigger(t) => self.trigger_at(t, self.clocks.now().wall, buffer),
            Command::Stop => {
                if matches!(self.state, State::Recording) {
                    if let Some(a) = self.active.as_mut() {
                        a.latched = false;
                    }
                    let now = self.clocks.now().mono;
                    self.set_state(State::PostBuffer { since: now });
                }
                Ok(())
            }
            Command::ForceClose => {
                if self.active.is_some() {
                    self.finalize(true);
                    if !matches!(self.state, State::Idle | State::Reconnecting { .. }) {
                        self.set_state(State::Buffering);
                    }
                }
                Ok(())
            }
        }
    }

    fn trigger_at(
        &mut self,
        trigger: db::Trigger,
        at: Time,
        buffer: &PacketBuffer,
    ) -> Result<(), Error> {
        let now = self.clocks.now().mono;
        match &mut self.state {
            State::Buffering => self.start_recording(trigger, at, buffer),
            State::Recording => {
                if let Some(a) = self.active.as_mut() {
                    a.last_trigger = now;
                    if matches!(trigger, db::Trigger::Continuous | db::Trigger::Manual) {
                        a.latched = true;
                    }
                }
                Ok(())
            }
            State::PostBuffer { .. } => {
                // The event wasn't over after all.
                if let Some(a) = self.active.as_mut() {
                    a.last_trigger = now;
                }
                self.set_state(State::Recording);
                Ok(())
            }
            State::Reconnecting { queued, .. } => {
                // Keep only the freshest.
                *queued = Some(trigger);
                Ok(())
            }
            State::Idle => Ok(()), // not running; nothing to record
        }
    }

    fn start_recording(
        &mut self,
        trigger: db::Trigger,
        at: Time,
        buffer: &PacketBuffer,
    ) -> Result<(), Error> {
        let Some(video_params) = self.video_params.clone() else {
            warn!(
                stream = %self.config.stream_name,
                "trigger before codec parameters are known; ignoring"
            );
            return Ok(());
        };
        // Continuous mode wants a prompt start from the newest GOP rather
        // than reaching back pre_roll seconds.
        let since = match trigger {
            db::Trigger::Continuous => at,
            _ => at - self.config.pre_roll,
        };
        let id = self.db.create_recording(&self.config.stream_name, trigger, since)?;
        let (events_tx, events_rx) = mpsc::sync_channel(8);
        if trigger != db::Trigger::Continuous && buffer.stats().duration < buffer.target_duration {
            warn!(
                stream = %self.config.stream_name,
                buffered = %buffer.stats().duration,
                "buffer holds less than the configured pre-roll; event will start late"
            );
        }
        let opened = (|| {
            let mut writer = SegmentWriter::new(
                WriterConfig {
                    storage_root: self.config.storage_root.clone(),
                    stream_name: self.config.stream_name.clone(),
                    recording_id: id,
                    segment_duration: self.config.segment_duration,
                },
                video_params,
                self.audio_params.clone(),
                since,
                events_tx,
            )?;
            let mut drained = 0usize;
            for pkt in buffer.drain_from_keyframe(since) {
                writer.write(pkt)?;
                drained += 1;
            }
            Ok::<_, Error>((writer, drained))
        })();
        let (writer, drained) = match opened {
            Ok(x) => x,
            Err(e) => {
                // Don't leave an in-progress recording row behind.
                let _ = self.db.close_recording(id, self.clocks.now().wall, false);
                let label = match e.kind() {
                    base::ErrorKind::InvalidArgument => "codec",
                    _ => "storage",
                };
                self.status.set_error(label.to_owned());
                return Err(e);
            }
        };
        info!(
            stream = %self.config.stream_name,
            recording = %id,
            %trigger,
            drained,
            "recording started"
        );
        self.active = Some(ActiveRecording {
            id,
            writer,
            events: events_rx,
            last_trigger: self.clocks.now().mono,
            latched: matches!(trigger, db::Trigger::Continuous | db::Trigger::Manual),
        });
        self.set_state(State::Recording);
        self.drain_writer_events();
        Ok(())
    }

    /// Records open-segment rows for files the writer has started.
    fn drain_writer_events(&mut self) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        let id = active.id;
        let mut updates = Vec::new();
        for ev in active.events.try_iter() {
            updates.push(ev);
        }
        for ev in updates {
            let rel = self.relative_path(&ev.path);
            if let Err(e) = self.db.open_segment(id, ev.segment_index, &rel, ev.first_pts_wallclock)
            {
                warn!(err = %e.chain(), "unable to record segment open");
            }
            if ev.segment_index == 0 {
                // Align the recording's start to the actual first keyframe.
                if let Err(e) = self.db.set_recording_start(id, ev.first_pts_wallclock) {
                    warn!(err = %e.chain(), "unable to align recording start");
                }
            }
        }
    }

    fn relative_path(&self, path: &Path) -> PathBuf {
        path.strip_prefix(&self.config.storage_root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.to_path_buf())
    }

    fn persist_finished(&self, id: db::RecordingId, f: &FinishedSegment) {
        let r = self.db.close_segment(
            id,
            f.segment_index,
            &db::SegmentClose {
                first_pts: f.first_pts.unwrap_or(0),
                last_pts: f.last_pts.unwrap_or(0),
                end: f.end_wallclock,
                size_bytes: i64::try_from(f.size_bytes).unwrap_or(i64::MAX),
                has_audio: f.has_audio,
                ended_on_keyframe: f.ended_on_keyframe,
            },
        );
        if let Err(e) = r {
            warn!(err = %e.chain(), "unable to record segment close");
        }
    }

    /// Closes the writer and finalizes the recording's rows.
    fn finalize(&mut self, complete: bool) {
        self.drain_writer_events();
        let Some(active) = self.active.take() else {
            return;
        };
        let ActiveRecording { id, writer, events, .. } = active;
        let finished = writer.close();
        // The final file's open event may still be in flight.
        for ev in events.try_iter() {
            let rel = self.relative_path(&ev.path);
            if let Err(e) = self.db.open_segment(id, ev.segment_index, &rel, ev.first_pts_wallclock)
            {
                warn!(err = %e.chain(), "unable to record segment open");
            }
        }
        let end = finished
            .as_ref()
            .map(|f| f.end_wallclock)
            .unwrap_or_else(|| self.clocks.now().wall);
        if let Some(f) = finished.as_ref() {
            self.persist_finished(id, f);
        }
        if let Err(e) = self.db.close_recording(id, end, complete) {
            warn!(err = %e.chain(), "unable to finalize recording");
        }
        info!(
            stream = %self.config.stream_name,
            recording = %id,
            complete,
            "recording finalized"
        );
        self.status.update(|s| s.current_recording = None);
    }

    /// A write failed (disk full, path unwritable). Finalize the recording
    /// cleanly and fall back to buffering; the stream keeps running.
    fn on_storage_failure(&mut self, e: Error) {
        warn!(
            stream = %self.config.stream_name,
            err = %e.chain(),
            "storage failure; finalizing recording"
        );
        self.status.set_error("storage".to_owned());
        self.finalize(true);
        self.set_state(State::Buffering);
    }

    /// Graceful shutdown: finalize any recording and return to idle.
    pub fn shutdown(&mut self) {
        if self.active.is_some() {
            self.finalize(true);
        }
        self.set_state(State::Idle);
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }
}
