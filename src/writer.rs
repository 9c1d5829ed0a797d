// This file is part of Argus NVR, a lightweight network video recorder.
// Copyright (C) 2026 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The segment writer: one recording's sequence of fragmented `.mp4` files.
//!
//! Guarantees the controller relies on:
//!
//! * the first video sample of every file is a keyframe — a rotation
//!   requested mid-GOP is deferred until the next keyframe arrives;
//! * decode timestamps are strictly monotonic within a file (an equal DTS
//!   is bumped by one tick; the muxer rejects equal DTS);
//! * each file is finalized fragment-by-fragment, so killing the process
//!   loses at most the open fragment;
//! * if the input declared audio but the first 3 s of a recording produce
//!   no audio packets, the audio track is dropped from subsequent files.

use crate::fmp4::Fmp4Writer;
use crate::h264;
use crate::pkt::{CodecParameters, Packet, StreamKind};
use base::time::{Duration, Time, TIME_UNITS_PER_SEC};
use base::{bail, Error};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use tracing::{debug, info, warn};

/// How long a declared-but-silent audio track survives before being dropped,
/// in video media time.
const AUDIO_GUARD_TICKS: i64 = 3 * TIME_UNITS_PER_SEC;

/// Sent to the controller when a segment file accepts its first sample, so
/// the recording's start time can be aligned to the actual keyframe.
#[derive(Clone, Debug)]
pub struct SegmentStarted {
    pub segment_index: i32,
    pub path: PathBuf,
    pub first_pts_wallclock: Time,
}

/// Metadata for a finished segment file, for persistence.
#[derive(Clone, Debug)]
pub struct FinishedSegment {
    pub segment_index: i32,
    pub path: PathBuf,
    pub first_pts: Option<i64>,
    pub last_pts: Option<i64>,
    pub start_wallclock: Time,
    pub end_wallclock: Time,
    pub size_bytes: u64,
    pub has_audio: bool,
    pub ended_on_keyframe: bool,
}

pub struct WriterConfig {
    pub storage_root: PathBuf,
    pub stream_name: String,
    pub recording_id: db::RecordingId,
    pub segment_duration: Duration,
}

struct OpenSegment {
    index: i32,
    path: PathBuf,
    mp4: Fmp4Writer<BufWriter<File>>,
    start_wallclock: Time,
    last_wallclock: Time,
    first_pts: Option<i64>,
    first_dts: Option<i64>,
    last_pts: Option<i64>,
    audio_samples: u64,
    started_sent: bool,
}

/// Writes one recording: a directory-dated sequence of
/// `<recording_id>-<NNNNN>.mp4` files.
pub struct SegmentWriter {
    config: WriterConfig,
    dir: PathBuf,
    video_params: CodecParameters,
    audio_params: Option<CodecParameters>,
    need_transform: bool,
    transform_buf: Vec<u8>,
    events: mpsc::SyncSender<SegmentStarted>,
    cur: Option<OpenSegment>,

    /// A rotation-finished segment whose successor failed to open; held so
    /// `close` can still report it.
    pending_finished: Option<FinishedSegment>,
    next_index: i32,

    /// Stream-timeline DTS of the recording's first video sample; the
    /// in-file timeline is rebased so every recording starts at zero.
    video_base: Option<i64>,
    last_video_dts: Option<i64>,
    audio_ever_seen: bool,
}

/// Formats the dated directory for a recording beginning at `start`:
/// `<storage_root>/recordings/<stream_name>/YYYY/MM/DD` (UTC).
fn dated_dir(root: &Path, stream_name: &str, start: Time) -> Result<PathBuf, Error> {
    let ts = jiff::Timestamp::from_second(start.unix_secs())
        .map_err(|e| base::err!(OutOfRange, msg("recording start out of range"), source(e)))?;
    let date = ts.to_zoned(jiff::tz::TimeZone::UTC).date();
    Ok(root
        .join("recordings")
        .join(stream_name)
        .join(format!("{:04}", date.year()))
        .join(format!("{:02}", date.month()))
        .join(format!("{:02}", date.day())))
}

fn create_dir_0755(path: &Path) -> Result<(), Error> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(path)
        .map_err(|e| {
            base::err!(
                Unavailable,
                msg("unable to create {}", path.display()),
                source(e)
            )
        })
}

impl SegmentWriter {
    /// Creates the writer and opens the first segment file, whose dated path
    /// comes from `start`. The file holds only the header until the first
    /// sample is written.
    pub fn new(
        config: WriterConfig,
        mut video_params: CodecParameters,
        audio_params: Option<CodecParameters>,
        start: Time,
        events: mpsc::SyncSender<SegmentStarted>,
    ) -> Result<Self, Error> {
        // Annex B extradata implies Annex B samples: build the sample entry
        // from the SPS/PPS ourselves and convert each sample before muxing.
        let need_transform = video_params.extradata.starts_with(b"\x00\x00\x00\x01")
            || video_params.extradata.starts_with(b"\x00\x00\x01");
        if need_transform && video_params.codec == crate::pkt::CodecId::H264 {
            let extradata = video_params.extradata.clone();
            let parsed =
                h264::ExtraData::parse(&extradata, video_params.width, video_params.height)?;
            video_params.sample_entry = parsed.sample_entry;
            video_params.rfc6381_codec = parsed.rfc6381_codec;
        }
        let dir = dated_dir(&config.storage_root, &config.stream_name, start)?;
        create_dir_0755(&dir)?;
        let mut w = SegmentWriter {
            config,
            dir,
            video_params,
            audio_params,
            need_transform,
            transform_buf: Vec::new(),
            events,
            cur: None,
            pending_finished: None,
            next_index: 0,
            video_base: None,
            last_video_dts: None,
            audio_ever_seen: false,
        };
        w.open_next(start)?;
        Ok(w)
    }

    fn open_next(&mut self, wallclock: Time) -> Result<(), Error> {
        let index = self.next_index;
        let path = self
            .dir
            .join(format!("{}-{:05}.mp4", self.config.recording_id, index));
        debug!(path = %path.display(), "opening segment file");
        let f = File::create(&path).map_err(|e| {
            base::err!(
                Unavailable,
                msg("unable to create {}", path.display()),
                source(e)
            )
        })?;
        let mp4 = Fmp4Writer::new(
            &self.video_params,
            self.audio_params.as_ref(),
            BufWriter::new(f),
        )?;
        self.cur = Some(OpenSegment {
            index,
            path,
            mp4,
            start_wallclock: wallclock,
            last_wallclock: wallclock,
            first_pts: None,
            first_dts: None,
            last_pts: None,
            audio_samples: 0,
            started_sent: false,
        });
        self.next_index = index + 1;
        Ok(())
    }

    /// Finalizes the open file. Flush failures are logged, not surfaced: the
    /// file remains playable up to its last completed fragment.
    fn finish_file(&mut self, ended_on_keyframe: bool) -> Option<FinishedSegment> {
        let cur = self.cur.take()?;
        let OpenSegment {
            index,
            path,
            mp4,
            start_wallclock,
            last_wallclock,
            first_pts,
            last_pts,
            audio_samples,
            ..
        } = cur;
        let size_bytes = match mp4.finish() {
            Ok((buf_writer, stats)) => {
                match buf_writer.into_inner() {
                    Ok(f) => {
                        // fsync is best-effort per segment boundary; crash
                        // recovery relies on the MP4 fragments themselves.
                        if let Err(err) = f.sync_all() {
                            warn!(%err, path = %path.display(), "fsync failed");
                        }
                    }
                    Err(err) => {
                        warn!(%err, path = %path.display(), "final flush failed");
                    }
                }
                stats.bytes_written
            }
            Err(err) => {
                warn!(err = %err.chain(), path = %path.display(), "finalize failed");
                std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0)
            }
        };
        if let Ok(d) = File::open(&self.dir) {
            let _ = d.sync_all();
        }
        info!(
            path = %path.display(),
            size_bytes,
            "finished segment"
        );
        Some(FinishedSegment {
            segment_index: index,
            path,
            first_pts,
            last_pts,
            start_wallclock,
            end_wallclock: last_wallclock,
            size_bytes,
            has_audio: audio_samples > 0,
            ended_on_keyframe,
        })
    }

    /// Writes one packet. Its timestamps must already be normalized (the
    /// ingestor's tracker keeps them monotonic on the stream timeline); the
    /// writer rebases them to the recording timeline. Returns the metadata
    /// of a segment finalized by rotation, if any.
    ///
    /// The caller must start the recording with a video keyframe and feed
    /// packets in normalizer order (video before audio on equal DTS).
    pub fn write(&mut self, pkt: &Packet) -> Result<Option<FinishedSegment>, Error> {
        match pkt.stream {
            StreamKind::Video => self.write_video(pkt),
            StreamKind::Audio => {
                self.write_audio(pkt)?;
                Ok(None)
            }
        }
    }

    fn write_video(&mut self, pkt: &Packet) -> Result<Option<FinishedSegment>, Error> {
        let base = *self.video_base.get_or_insert(pkt.dts);
        let mut ts = crate::timestamp::Normalized {
            pts: pkt.pts - base,
            dts: pkt.dts - base,
        };
        if let Some(last) = self.last_video_dts {
            // The muxer rejects equal DTS; bump by one tick.
            if ts.dts <= last {
                let cts = ts.pts - ts.dts;
                ts.dts = last + 1;
                ts.pts = ts.dts + cts;
            }
        }

        let mut finished = None;
        if pkt.is_keyframe {
            // Rotation is keyframe-aligned: this keyframe either closes the
            // current file (becoming the next file's first sample) or the
            // file keeps going until the next one.
            let must_rotate = self
                .cur
                .as_ref()
                .is_some_and(|c| {
                    c.first_dts
                        .is_some_and(|first| ts.dts - first >= self.config.segment_duration.0)
                });
            if must_rotate {
                finished = self.finish_file(true);
                if let Err(e) = self.open_next(pkt.arrival.realtime) {
                    self.pending_finished = finished;
                    return Err(e);
                }
            }
            // Drop a declared audio track that never produced a packet.
            if self.audio_params.is_some()
                && !self.audio_ever_seen
                && ts.dts >= AUDIO_GUARD_TICKS
            {
                info!(
                    stream = %self.config.stream_name,
                    "no audio in first 3s; dropping audio track for remainder of recording"
                );
                self.audio_params = None;
            }
        }

        let cur = match self.cur.as_mut() {
            Some(c) => c,
            None => bail!(FailedPrecondition, msg("write after close")),
        };
        if cur.first_pts.is_none() && !pkt.is_keyframe {
            bail!(
                FailedPrecondition,
                msg("recording must begin with a video keyframe")
            );
        }

        let data: &[u8] = if self.need_transform {
            h264::to_length_prefixed(&pkt.payload, &mut self.transform_buf);
            &self.transform_buf
        } else {
            &pkt.payload
        };
        cur.mp4.video(data, ts.dts, ts.pts, pkt.is_keyframe)?;
        self.last_video_dts = Some(ts.dts);
        cur.last_pts = Some(ts.pts);
        cur.last_wallclock = pkt.arrival.realtime;
        if cur.first_pts.is_none() {
            cur.first_pts = Some(ts.pts);
            cur.first_dts = Some(ts.dts);
            cur.start_wallclock = pkt.arrival.realtime;
        }
        if !cur.started_sent {
            cur.started_sent = true;
            let event = SegmentStarted {
                segment_index: cur.index,
                path: cur.path.clone(),
                first_pts_wallclock: pkt.arrival.realtime,
            };
            if let Err(e) = self.events.try_send(event) {
                warn!(err = %e, "segment-started event dropped");
            }
        }
        Ok(finished)
    }

    fn write_audio(&mut self, pkt: &Packet) -> Result<(), Error> {
        let Some(audio_params) = self.audio_params.as_ref() else {
            // Undeclared or dropped track; ignore quietly.
            return Ok(());
        };
        self.audio_ever_seen = true;
        let Some(video_base) = self.video_base else {
            // No video written yet; nothing to sync against.
            return Ok(());
        };
        let cur = match self.cur.as_mut() {
            Some(c) => c,
            None => bail!(FailedPrecondition, msg("write after close")),
        };
        if cur.first_pts.is_none() {
            // Audio before the keyframe that starts this file is unplayable.
            return Ok(());
        }
        // Rebase onto the recording timeline, rescaled from the video's
        // 90 kHz clock to the audio track's own timescale. Both stream
        // timelines are zeroed at the same connection instant.
        let rate = i64::from(audio_params.clock_rate);
        let base = video_base * rate / TIME_UNITS_PER_SEC;
        let dts = (pkt.dts - base).max(0);
        let duration = u32::try_from(pkt.duration.unwrap_or(0)).unwrap_or(0);
        cur.mp4.audio(&pkt.payload, dts, duration)?;
        cur.audio_samples += 1;
        cur.last_wallclock = pkt.arrival.realtime;
        Ok(())
    }

    /// Closes the recording's final file gracefully.
    pub fn close(mut self) -> Option<FinishedSegment> {
        self.pending_finished
            .take()
            .or_else(|| self.finish_file(false))
    }

    /// The index the next opened segment file will get.
    pub fn next_index(&self) -> i32 {
        self.next_index
    }

    /// True once the current file has accepted at least one video sample.
    pub fn current_has_samples(&self) -> bool {
        self.cur.as_ref().is_some_and(|c| c.first_pts.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fmp4::testutil::{boxes, find, trun_samples};
    use crate::testutil::{self, PacketGen};

    fn new_writer(
        dir: &Path,
        segment_duration_s: i64,
        audio: bool,
    ) -> (SegmentWriter, mpsc::Receiver<SegmentStarted>, db::RecordingId) {
        let (tx, rx) = mpsc::sync_channel(8);
        let recording_id = db::RecordingId::generate();
        let w = SegmentWriter::new(
            WriterConfig {
                storage_root: dir.to_owned(),
                stream_name: "front".to_owned(),
                recording_id,
                segment_duration: Duration::from_secs(segment_duration_s),
            },
            testutil::video_params(),
            audio.then(testutil::audio_params),
            Time::from_unix_secs(1_700_000_000),
            tx,
        )
        .unwrap();
        (w, rx, recording_id)
    }

    fn write_stream(w: &mut SegmentWriter, gen: &mut PacketGen, frames: usize) -> Vec<FinishedSegment> {
        let mut finished = Vec::new();
        for _ in 0..frames {
            let p = gen.next_video();
            if let Some(f) = w.write(&p).unwrap() {
                finished.push(f);
            }
        }
        finished
    }

    #[test]
    fn layout_and_naming() {
        testutil::init();
        let tmp = tempfile::tempdir().unwrap();
        let (mut w, rx, recording_id) = new_writer(tmp.path(), 10, false);
        let mut gen = PacketGen::new(25, 50);
        write_stream(&mut w, &mut gen, 10);
        let f = w.close().unwrap();
        // 2023-11-14 22:13:20 UTC.
        let expect = tmp
            .path()
            .join("recordings/front/2023/11/14")
            .join(format!("{recording_id}-00000.mp4"));
        assert_eq!(f.path, expect);
        assert!(f.path.exists());
        let started = rx.try_recv().unwrap();
        assert_eq!(started.segment_index, 0);
        assert_eq!(started.path, expect);
        assert_eq!(started.first_pts_wallclock, Time::from_unix_secs(1_700_000_000));
    }

    #[test]
    fn rotates_on_keyframe_after_duration() {
        testutil::init();
        let tmp = tempfile::tempdir().unwrap();
        // 2 s segments; keyframe every 1 s at 25 fps.
        let (mut w, _rx, _) = new_writer(tmp.path(), 2, false);
        let mut gen = PacketGen::new(25, 25);
        let finished = write_stream(&mut w, &mut gen, 125); // 5 s
        let last = w.close().unwrap();
        // Files: [0s,2s) [2s,4s) and a final [4s,5s).
        assert_eq!(finished.len(), 2);
        assert_eq!(finished[0].segment_index, 0);
        assert_eq!(finished[1].segment_index, 1);
        assert_eq!(last.segment_index, 2);
        assert!(finished.iter().all(|f| f.ended_on_keyframe));
        assert!(!last.ended_on_keyframe);

        // Every file starts with a sync sample, and each file's first
        // fragment begins at its own keyframe.
        for f in finished.iter().chain(std::iter::once(&last)) {
            let data = std::fs::read(&f.path).unwrap();
            let moofs: Vec<_> = boxes(&data)
                .into_iter()
                .filter(|(fourcc, _)| fourcc == b"moof")
                .collect();
            assert!(!moofs.is_empty());
            let first_moof = &data[moofs[0].1.clone()];
            let traf = find(first_moof, b"traf");
            let trun = find(&first_moof[traf.clone()], b"trun");
            let rows = trun_samples(&first_moof[traf][trun]);
            assert_eq!(rows[0].2, 0x0200_0000, "first sample must be sync");
        }
    }

    /// Reconstructs each video sample's DTS from a file's tfdt and trun
    /// boxes.
    fn file_dts_series(path: &Path) -> Vec<i64> {
        let data = std::fs::read(path).unwrap();
        let mut out = Vec::new();
        for (fourcc, range) in boxes(&data) {
            if fourcc != *b"moof" {
                continue;
            }
            let moof = &data[range];
            let traf = find(moof, b"traf");
            let tfdt = find(&moof[traf.clone()], b"tfdt");
            let mut dts = crate::fmp4::testutil::tfdt_base_time(&moof[traf.clone()][tfdt]) as i64;
            let trun = find(&moof[traf.clone()], b"trun");
            for (duration, _, _, _) in trun_samples(&moof[traf.clone()][trun]) {
                out.push(dts);
                dts += i64::from(duration);
            }
        }
        out
    }

    #[test]
    fn dts_monotonic_within_and_continuous_across_segments() {
        testutil::init();
        let tmp = tempfile::tempdir().unwrap();
        let (mut w, _rx, _) = new_writer(tmp.path(), 2, false);
        let mut gen = PacketGen::new(25, 50);
        let mut finished = write_stream(&mut w, &mut gen, 150); // 3 files of 2 s
        finished.extend(w.close());
        assert_eq!(finished.len(), 3);

        let mut prev_last: Option<i64> = None;
        for f in &finished {
            let series = file_dts_series(&f.path);
            assert!(!series.is_empty());
            // Strictly monotonic decode timeline within one file.
            for pair in series.windows(2) {
                assert!(pair[1] > pair[0], "dts went backward: {pair:?}");
            }
            // Seamless continuation from the previous file.
            if let Some(prev) = prev_last {
                let gap = series[0] - prev;
                assert!(
                    (3600 - 1..=2 * 3600).contains(&gap),
                    "discontinuity across segments: {gap}"
                );
            }
            prev_last = series.last().copied();
        }
    }

    #[test]
    fn rotation_defers_to_next_keyframe() {
        testutil::init();
        let tmp = tempfile::tempdir().unwrap();
        // 1 s segments but a 2 s GOP: rotation can only happen every 2 s.
        let (mut w, _rx, _) = new_writer(tmp.path(), 1, false);
        let mut gen = PacketGen::new(25, 50);
        let finished = write_stream(&mut w, &mut gen, 150); // 6 s
        w.close();
        assert_eq!(finished.len(), 2);
        for f in &finished {
            let dur = f.last_pts.unwrap() - f.first_pts.unwrap();
            // Each finished file covers a full 2 s GOP (last frame pts is
            // one frame short of the boundary).
            assert_eq!(dur, 2 * 90_000 - 3600);
        }
    }

    #[test]
    fn equal_dts_bumped() {
        testutil::init();
        let tmp = tempfile::tempdir().unwrap();
        let (mut w, _rx, _) = new_writer(tmp.path(), 10, false);
        let mut gen = PacketGen::new(25, 50);
        let p1 = gen.next_video();
        w.write(&p1).unwrap();
        let mut p2 = gen.next_video();
        p2.pts = p1.pts; // a duplicate timestamp that slipped past ingest
        p2.dts = p1.dts;
        w.write(&p2).unwrap();
        let mut p3 = gen.next_video();
        p3.pts = p1.pts + 3600;
        p3.dts = p1.dts + 3600;
        w.write(&p3).unwrap();
        let f = w.close().unwrap();
        let data = std::fs::read(&f.path).unwrap();
        let moof = find(&data, b"moof");
        let traf = find(&data[moof.clone()], b"traf");
        let trun = find(&data[moof.clone()][traf.clone()], b"trun");
        let rows = trun_samples(&data[moof][traf][trun]);
        // Durations: 1 tick (bumped), then 3599 to the third sample.
        assert_eq!(rows[0].0, 1);
        assert_eq!(rows[1].0, 3599);
    }

    #[test]
    fn audio_guard_drops_silent_track() {
        testutil::init();
        let tmp = tempfile::tempdir().unwrap();
        let (mut w, _rx, _) = new_writer(tmp.path(), 2, true);
        let mut gen = PacketGen::new(25, 25);
        // 6 s of video, no audio at all; the guard fires at 3 s and the
        // third file (opened at 4 s) omits the audio track entirely.
        let finished = write_stream(&mut w, &mut gen, 150);
        let last = w.close().unwrap();
        assert!(!finished.is_empty());
        assert!(finished.iter().all(|f| !f.has_audio));
        assert!(!last.has_audio);
        // The final file was opened after the guard fired: video-only moov.
        let data = std::fs::read(&last.path).unwrap();
        let moov = find(&data, b"moov");
        let traks = boxes(&data[moov])
            .into_iter()
            .filter(|(f, _)| f == b"trak")
            .count();
        assert_eq!(traks, 1);
    }

    #[test]
    fn audio_interleaves_when_present() {
        testutil::init();
        let tmp = tempfile::tempdir().unwrap();
        let (mut w, _rx, _) = new_writer(tmp.path(), 10, true);
        let mut gen = PacketGen::new(25, 25);
        for i in 0..50 {
            let p = gen.next_video();
            w.write(&p).unwrap();
            if i % 2 == 0 {
                let a = gen.next_audio();
                w.write(&a).unwrap();
            }
        }
        let f = w.close().unwrap();
        assert!(f.has_audio);
    }

    #[test]
    fn annex_b_input_converted_to_avc() {
        testutil::init();
        let tmp = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::sync_channel(8);
        let mut params = testutil::video_params();
        // Annex B SPS+PPS extradata, as an ffmpeg-era camera would supply.
        params.extradata = bytes::Bytes::from(testutil::annex_b_extradata());
        let mut w = SegmentWriter::new(
            WriterConfig {
                storage_root: tmp.path().to_owned(),
                stream_name: "front".to_owned(),
                recording_id: db::RecordingId::generate(),
                segment_duration: Duration::from_secs(10),
            },
            params,
            None,
            Time::from_unix_secs(1_700_000_000),
            tx,
        )
        .unwrap();

        let mut gen = PacketGen::new(25, 50);
        let mut p = gen.next_video();
        p.payload = bytes::Bytes::from_static(&[0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x80]);
        w.write(&p).unwrap();
        let f = w.close().unwrap();

        let data = std::fs::read(&f.path).unwrap();
        let mdat = find(&data, b"mdat");
        // The start code became a 4-byte big-endian length.
        assert_eq!(&data[mdat], &[0x00, 0x00, 0x00, 0x03, 0x65, 0x88, 0x80]);
    }

    #[test]
    fn non_keyframe_start_rejected() {
        testutil::init();
        let tmp = tempfile::tempdir().unwrap();
        let (mut w, _rx, _) = new_writer(tmp.path(), 10, false);
        let mut gen = PacketGen::new(25, 50);
        gen.skip_video(1); // drop the opening keyframe
        let p = gen.next_video();
        assert!(!p.is_keyframe);
        let e = w.write(&p).unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::FailedPrecondition);
    }
}
