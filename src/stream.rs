// This file is part of Argus NVR, a lightweight network video recorder.
// Copyright (C) 2026 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! RTSP stream opening and demuxing, on the Retina library.

use crate::pkt::{CodecId, CodecParameters, StreamKind};
use base::{bail, err, Error};
use bytes::Bytes;
use futures::StreamExt;
use retina::client::Demuxed;
use retina::codec::CodecItem;
use std::pin::Pin;
use std::sync::Arc;
use tracing::Instrument;
use url::Url;

/// Bound on session setup through the first frame.
static OPEN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// The pixel aspect ratio to assume when the camera doesn't declare one.
///
/// Some cameras set the aspect ratio in the H.264 SPS correctly for both
/// square and non-square pixels; others leave it unset even on anamorphic
/// sub streams. The listed modes are the common wide-sensor sub-stream
/// resolutions (assumed 16x9); a rotated camera gets the transpose.
fn default_pixel_aspect_ratio(width: u16, height: u16) -> (u16, u16) {
    let rotated = height > width;
    let landscape = if rotated { (height, width) } else { (width, height) };
    let pasp = match landscape {
        (320, 240) | (640, 480) => (4, 3),
        (352, 240) | (704, 480) => (40, 33),
        (640, 352) => (44, 45),
        (720, 480) => (32, 27),
        _ => (1, 1),
    };
    if rotated {
        (pasp.1, pasp.0)
    } else {
        pasp
    }
}

#[derive(Clone)]
pub struct Options {
    pub transport: db::json::Protocol,
    pub record_audio: bool,

    /// RUNNING is declared failed when no packet arrives within this bound.
    pub packet_timeout: std::time::Duration,

    /// Checked so a blocking fetch returns promptly on stop requests.
    pub shutdown: base::shutdown::Receiver,
}

/// One demuxed frame, not yet stamped with arrival clocks.
pub struct StreamFrame {
    pub kind: StreamKind,

    /// Timestamp in the stream's clock rate, monotonic per Retina's own
    /// enforcement but not normalized.
    pub pts: i64,
    pub is_keyframe: bool,
    pub data: Bytes,

    /// Duration in timestamp units, when the demuxer knows it (audio).
    pub duration: Option<i64>,
}

/// Opens a RTSP stream. This is a trait for test injection.
pub trait Opener: Send + Sync {
    /// Opens the given RTSP URL.
    ///
    /// Note: despite the blocking interface, this expects to be called from
    /// the context of a multithreaded tokio runtime with IO and time
    /// enabled.
    fn open(&self, label: String, url: Url, options: Options) -> Result<Box<dyn Stream>, Error>;
}

pub trait Stream: Send {
    fn video_params(&self) -> &CodecParameters;
    fn audio_params(&self) -> Option<&CodecParameters>;

    /// Blocks until the next frame, the packet timeout, or shutdown.
    fn next(&mut self) -> Result<StreamFrame, Error>;
}

pub struct RealOpener;

pub const OPENER: RealOpener = RealOpener;

impl Opener for RealOpener {
    fn open(&self, label: String, url: Url, options: Options) -> Result<Box<dyn Stream>, Error> {
        let rt_handle = tokio::runtime::Handle::current();
        let packet_timeout = options.packet_timeout;
        let shutdown = options.shutdown.clone();
        let (inner, first_frame) = rt_handle
            .block_on(
                rt_handle.spawn(
                    tokio::time::timeout(OPEN_TIMEOUT, RetinaStreamInner::play(label, url, options))
                        .in_current_span(),
                ),
            )
            .expect("RetinaStream::play task panicked, see earlier error")
            .map_err(|e| {
                err!(
                    DeadlineExceeded,
                    msg("unable to play stream and get first frame within {OPEN_TIMEOUT:?}"),
                    source(e),
                )
            })??;
        Ok(Box::new(RetinaStream {
            inner: Some(inner),
            rt_handle,
            packet_timeout,
            shutdown,
            first_frame: Some(first_frame),
        }))
    }
}

fn params_to_video(params: &retina::codec::VideoParameters) -> Result<CodecParameters, Error> {
    let (width, height) = params.pixel_dimensions();
    let width = u16::try_from(width).map_err(|e| err!(Unknown, source(e)))?;
    let height = u16::try_from(height).map_err(|e| err!(Unknown, source(e)))?;
    let aspect = default_pixel_aspect_ratio(width, height);
    let rfc6381_codec = params.rfc6381_codec().to_owned();
    let codec = if rfc6381_codec.starts_with("avc1") {
        CodecId::H264
    } else if rfc6381_codec.starts_with("hvc1") || rfc6381_codec.starts_with("hev1") {
        CodecId::H265
    } else {
        bail!(Unimplemented, msg("unsupported video codec {rfc6381_codec}"));
    };
    Ok(CodecParameters {
        codec,
        extradata: Bytes::copy_from_slice(params.extra_data()),
        sample_entry: params
            .mp4_sample_entry()
            .with_aspect_ratio(aspect)
            .build()
            .map_err(|e| err!(Unknown, source(e)))?,
        rfc6381_codec,
        width,
        height,
        clock_rate: 90_000,
        sample_rate: 0,
        channels: 0,
    })
}

fn params_to_audio(params: &retina::codec::AudioParameters) -> Result<CodecParameters, Error> {
    let rfc6381_codec = params.rfc6381_codec().unwrap_or("").to_owned();
    let codec = if rfc6381_codec.starts_with("mp4a.40") {
        CodecId::Aac
    } else {
        CodecId::OtherAudio
    };
    Ok(CodecParameters {
        codec,
        extradata: Bytes::new(),
        sample_entry: params
            .mp4_sample_entry()
            .build()
            .map_err(|e| err!(Unknown, source(e)))?,
        rfc6381_codec,
        width: 0,
        height: 0,
        clock_rate: params.clock_rate(),
        sample_rate: params.clock_rate(),
        channels: 0,
    })
}

fn is_multicast(url: &Url) -> bool {
    match url.host_str().and_then(|h| h.parse::<std::net::IpAddr>().ok()) {
        Some(addr) => addr.is_multicast(),
        None => false,
    }
}

fn transport_for(url: &Url, configured: db::json::Protocol) -> retina::client::Transport {
    if is_multicast(url) || configured == db::json::Protocol::Udp {
        retina::client::Transport::Udp(retina::client::UdpTransportOptions::default())
    } else {
        retina::client::Transport::Tcp(retina::client::TcpTransportOptions::default())
    }
}

/// Real stream, implemented with the Retina library.
///
/// Retina is asynchronous and tokio-based where the ingestor expects a
/// synchronous stream interface. This blocks on the tokio operations, with
/// one thread hand-off per frame via `handle.block_on(handle.spawn(...))`.
struct RetinaStream {
    /// The actual stream details used from within the tokio reactor.
    ///
    /// Spawned tokio tasks must be `'static`, so ownership is passed to the
    /// task, and then returned when it completes.
    inner: Option<Box<RetinaStreamInner>>,

    rt_handle: tokio::runtime::Handle,
    packet_timeout: std::time::Duration,
    shutdown: base::shutdown::Receiver,

    /// The first frame, if not yet returned from `next`.
    ///
    /// This frame is special because it is fetched as part of getting the
    /// video parameters.
    first_frame: Option<retina::codec::VideoFrame>,
}

struct RetinaStreamInner {
    label: String,
    session: Demuxed,
    video_params: CodecParameters,
    audio_params: Option<CodecParameters>,
}

impl RetinaStreamInner {
    /// Plays to the first video frame. No timeout; that's the caller's
    /// responsibility.
    async fn play(
        label: String,
        url: Url,
        options: Options,
    ) -> Result<(Box<Self>, retina::codec::VideoFrame), Error> {
        let transport = transport_for(&url, options.transport);

        // Credentials ride in the URL per our config convention; Retina
        // wants them separately.
        let mut url = url;
        let creds = if url.username().is_empty() {
            None
        } else {
            let creds = retina::client::Credentials {
                username: url.username().to_owned(),
                password: url.password().unwrap_or("").to_owned(),
            };
            let _ = url.set_username("");
            let _ = url.set_password(None);
            Some(creds)
        };
        let mut session = retina::client::Session::describe(
            url,
            retina::client::SessionOptions::default()
                .creds(creds)
                .user_agent(format!("Argus NVR {}", env!("CARGO_PKG_VERSION")))
                .session_group(Arc::new(retina::client::SessionGroup::default()))
                .teardown(retina::client::TeardownPolicy::Auto),
        )
        .await
        .map_err(|e| err!(Unknown, source(e)))?;
        tracing::debug!("connected to {:?}, tool {:?}", &label, session.tool());
        let video_i = session
            .streams()
            .iter()
            .position(|s| s.media() == "video" && matches!(s.encoding_name(), "h264" | "h265"))
            .ok_or_else(|| {
                err!(
                    FailedPrecondition,
                    msg("couldn't find supported video stream")
                )
            })?;
        session
            .setup(
                video_i,
                retina::client::SetupOptions::default().transport(transport.clone()),
            )
            .await
            .map_err(|e| err!(Unknown, source(e)))?;

        // Record an audio track iff configured and the camera offers one
        // that can be placed in a .mp4 without transcoding.
        let audio_i = if options.record_audio {
            session.streams().iter().enumerate().find_map(|(i, s)| {
                match s.parameters() {
                    Some(retina::codec::ParametersRef::Audio(a))
                        if a.mp4_sample_entry().build().is_ok() =>
                    {
                        Some(i)
                    }
                    _ => None,
                }
            })
        } else {
            None
        };
        if let Some(i) = audio_i {
            session
                .setup(
                    i,
                    retina::client::SetupOptions::default().transport(transport.clone()),
                )
                .await
                .map_err(|e| err!(Unknown, source(e)))?;
        }

        let session = session
            .play(retina::client::PlayOptions::default())
            .await
            .map_err(|e| err!(Unknown, source(e)))?;
        let mut session = session.demuxed().map_err(|e| err!(Unknown, source(e)))?;

        // First frame: a random access point, so recording can begin
        // immediately.
        let first_frame = loop {
            match Pin::new(&mut session).next().await {
                None => bail!(Unavailable, msg("stream closed before first frame")),
                Some(Err(e)) => bail!(Unknown, msg("unable to get first frame"), source(e)),
                Some(Ok(CodecItem::VideoFrame(v))) => {
                    if v.is_random_access_point() {
                        break v;
                    }
                }
                Some(Ok(_)) => {}
            }
        };
        let video_params = match session.streams()[video_i].parameters() {
            Some(retina::codec::ParametersRef::Video(v)) => params_to_video(&v.clone())?,
            Some(_) => unreachable!(),
            None => bail!(Unknown, msg("couldn't find video parameters")),
        };
        let audio_params = match audio_i.map(|i| session.streams()[i].parameters()) {
            Some(Some(retina::codec::ParametersRef::Audio(a))) => Some(params_to_audio(&a.clone())?),
            _ => None,
        };
        let self_ = Box::new(Self {
            label,
            session,
            video_params,
            audio_params,
        });
        Ok((self_, first_frame))
    }

    /// Fetches a non-initial frame.
    async fn fetch_next_frame(mut self: Box<Self>) -> Result<(Box<Self>, StreamFrame), Error> {
        loop {
            match Pin::new(&mut self.session)
                .next()
                .await
                .transpose()
                .map_err(|e| err!(Unknown, source(e)))?
            {
                None => bail!(Unavailable, msg("end of stream")),
                Some(CodecItem::VideoFrame(v)) => {
                    if v.loss() > 0 {
                        tracing::warn!(
                            "{}: lost {} RTP packets @ {}",
                            &self.label,
                            v.loss(),
                            v.start_ctx()
                        );
                    }
                    if v.has_new_parameters() {
                        // Extradata changed mid-stream; force a reconnect so
                        // downstream state (buffer, sample entries) resets.
                        bail!(Unavailable, msg("video parameters changed"));
                    }
                    let frame = StreamFrame {
                        kind: StreamKind::Video,
                        pts: v.timestamp().elapsed(),
                        is_keyframe: v.is_random_access_point(),
                        data: v.into_data().into(),
                        duration: None,
                    };
                    return Ok((self, frame));
                }
                Some(CodecItem::AudioFrame(a)) => {
                    if self.audio_params.is_none() {
                        continue;
                    }
                    let frame = StreamFrame {
                        kind: StreamKind::Audio,
                        pts: a.timestamp().elapsed(),
                        is_keyframe: false,
                        duration: Some(i64::from(a.frame_length().get())),
                        data: bytes::Bytes::copy_from_slice(a.data()),
                    };
                    return Ok((self, frame));
                }
                Some(_) => {}
            }
        }
    }
}

impl Stream for RetinaStream {
    fn video_params(&self) -> &CodecParameters {
        &self
            .inner
            .as_ref()
            .expect("stream valid until failure")
            .video_params
    }

    fn audio_params(&self) -> Option<&CodecParameters> {
        self.inner
            .as_ref()
            .expect("stream valid until failure")
            .audio_params
            .as_ref()
    }

    fn next(&mut self) -> Result<StreamFrame, Error> {
        if let Some(f) = self.first_frame.take() {
            return Ok(StreamFrame {
                kind: StreamKind::Video,
                pts: f.timestamp().elapsed(),
                is_keyframe: f.is_random_access_point(),
                data: f.into_data().into(),
                duration: None,
            });
        }
        let inner = self.inner.take().expect("stream valid until failure");
        let packet_timeout = self.packet_timeout;
        let shutdown = self.shutdown.clone();
        let (inner, frame) = self
            .rt_handle
            .block_on(
                self.rt_handle.spawn(
                    async move {
                        tokio::select! {
                            _ = shutdown.wait() => Err(err!(Cancelled, msg("shutdown requested"))),
                            r = tokio::time::timeout(packet_timeout, inner.fetch_next_frame()) => {
                                r.map_err(|e| {
                                    err!(
                                        DeadlineExceeded,
                                        msg("no packet within {packet_timeout:?}"),
                                        source(e),
                                    )
                                })?
                            }
                        }
                    }
                    .in_current_span(),
                ),
            )
            .expect("fetch_next_frame task panicked, see earlier error")?;
        self.inner = Some(inner);
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_aspect_ratios() {
        assert_eq!(default_pixel_aspect_ratio(704, 480), (40, 33));
        assert_eq!(default_pixel_aspect_ratio(640, 352), (44, 45));
        // A rotated camera gets the transpose.
        assert_eq!(default_pixel_aspect_ratio(480, 704), (33, 40));
        // Square pixels for true 16x9 modes.
        assert_eq!(default_pixel_aspect_ratio(1920, 1080), (1, 1));
        assert_eq!(default_pixel_aspect_ratio(1080, 1920), (1, 1));
    }

    #[test]
    fn multicast_forces_udp() {
        let m = Url::parse("rtsp://239.0.0.1/stream").unwrap();
        assert!(is_multicast(&m));
        assert!(matches!(
            transport_for(&m, db::json::Protocol::Tcp),
            retina::client::Transport::Udp(_)
        ));
        let u = Url::parse("rtsp://cam.example.com/stream").unwrap();
        assert!(!is_multicast(&u));
        assert!(matches!(
            transport_for(&u, db::json::Protocol::Tcp),
            retina::client::Transport::Tcp(_)
        ));
        assert!(matches!(
            transport_for(&u, db::json::Protocol::Udp),
            retina::client::Transport::Udp(_)
        ));
    }
}
