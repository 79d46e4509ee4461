//! Decode session — demuxes a container, decodes the selected video and
//! audio streams, and emits timestamped [`RawBuffer`]s in canonical form.
//!
//! # Design
//!
//! The session owns one format context, up to two decoder contexts, one
//! pixel conversion context, and scratch frames.  All of them are acquired
//! step by step during [`DecodeSession::open`]; any failure mid-construction
//! runs the same teardown used by [`DecodeSession::close`], so no partial
//! session ever escapes.  Teardown order is fixed: scratch frames →
//! conversion context → decoder contexts → format context (which closes the
//! underlying file handle).

use std::ptr;

use ffmpeg_sys_next::*;

use crate::buffer::{RawBuffer, planar_420_size};
use crate::convert::Converter;
use crate::error::{Result, SessionError};
use crate::ffi::{EAGAIN, check_ffmpeg, to_cstring};
use crate::params::Rational;
use crate::stream::{StreamDescriptor, StreamInfo};

/// Result of one [`DecodeSession::read`] call.
///
/// End-of-stream is an expected outcome, not an error.
#[derive(Debug)]
pub enum ReadOutcome {
    /// One decoded picture or audio block.
    Frame(RawBuffer),
    /// The container and both decoders are exhausted.
    EndOfStream,
}

/// Demuxes and decodes one media resource.
///
/// Tracks the first video stream (required) and, on request, the first
/// audio stream.  Not thread-safe; one session must not be used from two
/// threads at once.  Distinct sessions are independent.
#[derive(Debug)]
pub struct DecodeSession {
    locator: String,
    fmt_ctx: *mut AVFormatContext,
    video_dec: *mut AVCodecContext,
    audio_dec: *mut AVCodecContext,
    video: Option<StreamDescriptor>,
    audio: Option<StreamDescriptor>,
    converter: Option<Converter>,
    pkt: *mut AVPacket,
    frame: *mut AVFrame,
    audio_frame: *mut AVFrame,
    /// Decoded audio bytes not yet returned to the caller.
    audio_pending: Vec<u8>,
    /// Timestamp of the audio block currently accumulating.
    audio_block_pts: Option<i64>,
    /// DTS of the last packet fed to each decoder; the packet that completes
    /// a frame supplies its presentation timestamp.
    last_video_dts: i64,
    last_audio_dts: i64,
    /// PTS of the first packet contributing to the current access unit,
    /// used as fallback when the completing packet carries no DTS.
    video_pending_pts: Option<i64>,
    audio_pending_pts: Option<i64>,
    draining: bool,
    open: bool,
}

// SAFETY: the raw FFmpeg pointers are exclusively owned and every operation
// takes `&mut self`; the session may move between threads but is never used
// from two at once.
unsafe impl Send for DecodeSession {}

impl DecodeSession {
    /// Open a container, probe its streams, and prepare decoders.
    ///
    /// The first video stream is required.  When `want_audio` is set the
    /// first audio stream (if any) is decoded as well; its absence is not
    /// an error and is reported through [`DecodeSession::has_audio`].
    pub fn open(locator: &str, want_audio: bool) -> Result<Self> {
        crate::ffi::init();

        let mut session = Self {
            locator: locator.to_string(),
            fmt_ctx: ptr::null_mut(),
            video_dec: ptr::null_mut(),
            audio_dec: ptr::null_mut(),
            video: None,
            audio: None,
            converter: None,
            pkt: ptr::null_mut(),
            frame: ptr::null_mut(),
            audio_frame: ptr::null_mut(),
            audio_pending: Vec::new(),
            audio_block_pts: None,
            last_video_dts: AV_NOPTS_VALUE,
            last_audio_dts: AV_NOPTS_VALUE,
            video_pending_pts: None,
            audio_pending_pts: None,
            draining: false,
            open: false,
        };

        match session.open_inner(want_audio) {
            Ok(()) => {
                session.open = true;
                tracing::info!(
                    locator = %session.locator,
                    has_audio = session.audio.is_some(),
                    "Decode session opened"
                );
                Ok(session)
            }
            Err(detail) => {
                session.release();
                Err(SessionError::Open {
                    locator: locator.to_string(),
                    detail,
                })
            }
        }
    }

    fn open_inner(&mut self, want_audio: bool) -> std::result::Result<(), String> {
        let c_path = to_cstring(&self.locator)?;

        // ── Open container and probe streams ──
        let ret = unsafe {
            avformat_open_input(
                &mut self.fmt_ctx,
                c_path.as_ptr(),
                ptr::null(),
                ptr::null_mut(),
            )
        };
        check_ffmpeg(ret, "avformat_open_input").map_err(|e| e.to_string())?;

        let ret = unsafe { avformat_find_stream_info(self.fmt_ctx, ptr::null_mut()) };
        check_ffmpeg(ret, "avformat_find_stream_info").map_err(|e| e.to_string())?;

        // ── Select first video and (optionally) first audio stream ──
        let nb_streams = unsafe { (*self.fmt_ctx).nb_streams };
        let mut video_idx: i32 = -1;
        let mut audio_idx: i32 = -1;
        for i in 0..nb_streams {
            let stream = unsafe { &**(*self.fmt_ctx).streams.add(i as usize) };
            let codec_type = unsafe { (*stream.codecpar).codec_type };
            match codec_type {
                AVMediaType::AVMEDIA_TYPE_VIDEO if video_idx < 0 => video_idx = i as i32,
                AVMediaType::AVMEDIA_TYPE_AUDIO if want_audio && audio_idx < 0 => {
                    audio_idx = i as i32
                }
                _ => {}
            }
        }
        if video_idx < 0 {
            return Err("no video stream in container".into());
        }

        // ── Video decoder ──
        let stream = unsafe { &**(*self.fmt_ctx).streams.add(video_idx as usize) };
        let (dec, codec_name) = open_decoder(stream.codecpar)?;
        self.video_dec = dec;

        let par = unsafe { &*stream.codecpar };
        let frame_rate = if stream.avg_frame_rate.num != 0 {
            stream.avg_frame_rate
        } else {
            stream.r_frame_rate
        };
        let aspect_ratio = if par.sample_aspect_ratio.num != 0 {
            par.sample_aspect_ratio
        } else {
            AVRational { num: 1, den: 1 }
        };
        self.video = Some(StreamDescriptor {
            index: video_idx,
            time_base: Rational::from_ffi(stream.time_base),
            codec_name,
            info: StreamInfo::Video {
                width: par.width as u32,
                height: par.height as u32,
                frame_rate: Rational::from_ffi(frame_rate),
                aspect_ratio: Rational::from_ffi(aspect_ratio),
            },
        });

        // ── Conversion context into canonical planar 4:2:0 ──
        let pix_fmt = unsafe { (*self.video_dec).pix_fmt };
        self.converter = Some(Converter::new(
            pix_fmt,
            AVPixelFormat::AV_PIX_FMT_YUV420P,
            par.width as u32,
            par.height as u32,
        )?);

        // ── Audio decoder (optional) ──
        if audio_idx >= 0 {
            let stream = unsafe { &**(*self.fmt_ctx).streams.add(audio_idx as usize) };
            let (dec, codec_name) = open_decoder(stream.codecpar)?;
            self.audio_dec = dec;

            let par = unsafe { &*stream.codecpar };
            self.audio = Some(StreamDescriptor {
                index: audio_idx,
                time_base: Rational::from_ffi(stream.time_base),
                codec_name,
                info: StreamInfo::Audio {
                    sample_rate: par.sample_rate,
                    channels: par.ch_layout.nb_channels,
                },
            });
        }

        // ── Scratch frames and packet ──
        self.pkt = unsafe { av_packet_alloc() };
        self.frame = unsafe { av_frame_alloc() };
        self.audio_frame = unsafe { av_frame_alloc() };
        if self.pkt.is_null() || self.frame.is_null() || self.audio_frame.is_null() {
            return Err("failed to allocate packet/frame scratch buffers".into());
        }

        Ok(())
    }

    /// Read container packets until one produces a complete picture or
    /// audio block, or the container and decoders are exhausted.
    pub fn read(&mut self) -> Result<ReadOutcome> {
        self.ensure_open()?;

        loop {
            // Decoded output may still be buffered from a previous packet
            // (or from the drain), so always try to receive first.
            if let Some(buf) = self.receive_video()? {
                return Ok(ReadOutcome::Frame(buf));
            }
            if !self.audio_dec.is_null() {
                self.drain_audio_frames()?;
                if !self.audio_pending.is_empty() {
                    let data = std::mem::take(&mut self.audio_pending);
                    let pts = self.audio_block_pts.take();
                    return Ok(ReadOutcome::Frame(RawBuffer::audio(data, pts)));
                }
            }
            if self.draining {
                return Ok(ReadOutcome::EndOfStream);
            }

            let ret = unsafe { av_read_frame(self.fmt_ctx, self.pkt) };
            if ret < 0 {
                if ret == AVERROR_EOF {
                    self.begin_drain();
                    continue;
                }
                check_ffmpeg(ret, "av_read_frame")
                    .map_err(|e| SessionError::Decode(e.to_string()))?;
            }

            let (stream_index, pkt_pts, pkt_dts) = unsafe {
                (
                    (*self.pkt).stream_index,
                    (*self.pkt).pts,
                    (*self.pkt).dts,
                )
            };

            if Some(stream_index) == self.video.as_ref().map(|d| d.index) {
                if self.video_pending_pts.is_none() && pkt_pts != AV_NOPTS_VALUE {
                    self.video_pending_pts = Some(pkt_pts);
                }
                self.last_video_dts = pkt_dts;
                let ret = unsafe { avcodec_send_packet(self.video_dec, self.pkt) };
                unsafe { av_packet_unref(self.pkt) };
                if ret < 0 {
                    check_ffmpeg(ret, "avcodec_send_packet")
                        .map_err(|e| SessionError::Decode(e.to_string()))?;
                }
            } else if Some(stream_index) == self.audio.as_ref().map(|d| d.index) {
                if self.audio_pending_pts.is_none() && pkt_pts != AV_NOPTS_VALUE {
                    self.audio_pending_pts = Some(pkt_pts);
                }
                self.last_audio_dts = pkt_dts;
                let ret = unsafe { avcodec_send_packet(self.audio_dec, self.pkt) };
                unsafe { av_packet_unref(self.pkt) };
                if ret < 0 {
                    check_ffmpeg(ret, "avcodec_send_packet")
                        .map_err(|e| SessionError::Decode(e.to_string()))?;
                }
            } else {
                // Packet belongs to a stream this session does not track.
                unsafe { av_packet_unref(self.pkt) };
            }
        }
    }

    /// Receive one decoded picture, converted to canonical planar 4:2:0.
    fn receive_video(&mut self) -> Result<Option<RawBuffer>> {
        let ret = unsafe { avcodec_receive_frame(self.video_dec, self.frame) };
        if ret == AVERROR(EAGAIN) || ret == AVERROR_EOF {
            return Ok(None);
        }
        check_ffmpeg(ret, "avcodec_receive_frame")
            .map_err(|e| SessionError::Decode(e.to_string()))?;

        let (frame_w, frame_h, frame_fmt, frame_pts) = unsafe {
            (
                (*self.frame).width as u32,
                (*self.frame).height as u32,
                (*self.frame).format,
                (*self.frame).pts,
            )
        };

        let converter = self
            .converter
            .as_mut()
            .ok_or(SessionError::NotOpen)?;
        if !converter.matches_raw(frame_fmt, frame_w, frame_h) {
            unsafe { av_frame_unref(self.frame) };
            return Err(SessionError::Decode(format!(
                "stream geometry changed mid-session ({frame_w}x{frame_h}, format {frame_fmt})"
            )));
        }

        // The completing packet's DTS is the presentation time; fall back
        // to the first packet seen for this access unit, then to the
        // decoder's own frame timestamp.
        let pts = if self.last_video_dts != AV_NOPTS_VALUE {
            Some(self.last_video_dts)
        } else if self.video_pending_pts.is_some() {
            self.video_pending_pts
        } else if frame_pts != AV_NOPTS_VALUE {
            Some(frame_pts)
        } else {
            None
        };
        self.video_pending_pts = None;

        let mut data = vec![0u8; planar_420_size(frame_w, frame_h)];
        let conv = converter.planar_from_frame(self.frame, &mut data);
        unsafe { av_frame_unref(self.frame) };
        conv.map_err(SessionError::Decode)?;

        Ok(Some(RawBuffer::video(frame_w, frame_h, data, pts)))
    }

    /// Append every decoded audio frame currently available to the pending
    /// accumulator, interleaving planar sample formats on copy.
    fn drain_audio_frames(&mut self) -> Result<()> {
        loop {
            let ret = unsafe { avcodec_receive_frame(self.audio_dec, self.audio_frame) };
            if ret == AVERROR(EAGAIN) || ret == AVERROR_EOF {
                return Ok(());
            }
            check_ffmpeg(ret, "avcodec_receive_frame")
                .map_err(|e| SessionError::Decode(e.to_string()))?;

            if self.audio_pending.is_empty() {
                let frame_pts = unsafe { (*self.audio_frame).pts };
                self.audio_block_pts = if self.last_audio_dts != AV_NOPTS_VALUE {
                    Some(self.last_audio_dts)
                } else if self.audio_pending_pts.is_some() {
                    self.audio_pending_pts
                } else if frame_pts != AV_NOPTS_VALUE {
                    Some(frame_pts)
                } else {
                    None
                };
                self.audio_pending_pts = None;
            }

            // SAFETY: the decoder context and received frame are valid; the
            // sample copy below reads only `nb_samples` worth of data.
            unsafe {
                append_samples(&mut self.audio_pending, self.audio_dec, self.audio_frame);
                av_frame_unref(self.audio_frame);
            }
        }
    }

    /// Signal end-of-input to both decoders so buffered frames drain out.
    fn begin_drain(&mut self) {
        unsafe {
            avcodec_send_packet(self.video_dec, ptr::null());
            if !self.audio_dec.is_null() {
                avcodec_send_packet(self.audio_dec, ptr::null());
            }
        }
        // No packet completes drained frames; their own timestamps apply.
        self.last_video_dts = AV_NOPTS_VALUE;
        self.last_audio_dts = AV_NOPTS_VALUE;
        self.draining = true;
        tracing::debug!(locator = %self.locator, "Container exhausted, draining decoders");
    }

    /// Seek the container to the nearest access point at or before
    /// `timestamp` (container-global `AV_TIME_BASE` units) and discard all
    /// pending decoder state.
    pub fn seek(&mut self, timestamp: i64) -> Result<()> {
        self.ensure_open()?;

        let ret =
            unsafe { av_seek_frame(self.fmt_ctx, -1, timestamp, AVSEEK_FLAG_BACKWARD as i32) };
        check_ffmpeg(ret, "av_seek_frame").map_err(|e| SessionError::Seek(e.to_string()))?;

        unsafe {
            avcodec_flush_buffers(self.video_dec);
            if !self.audio_dec.is_null() {
                avcodec_flush_buffers(self.audio_dec);
            }
        }
        self.audio_pending.clear();
        self.audio_block_pts = None;
        self.video_pending_pts = None;
        self.audio_pending_pts = None;
        self.last_video_dts = AV_NOPTS_VALUE;
        self.last_audio_dts = AV_NOPTS_VALUE;
        self.draining = false;

        tracing::debug!(locator = %self.locator, timestamp, "Seek complete, decoder state flushed");
        Ok(())
    }

    /// Release every native resource.  Idempotent; subsequent operations
    /// fail with [`SessionError::NotOpen`].
    pub fn close(&mut self) {
        if !self.open && self.fmt_ctx.is_null() {
            return;
        }
        self.open = false;
        self.release();
        tracing::info!(locator = %self.locator, "Decode session closed");
    }

    /// Teardown in dependency order: scratch frames → conversion context →
    /// decoder contexts → format context (and file handle).  Null-guarded so
    /// it is safe at any construction depth and on repeated calls.
    fn release(&mut self) {
        unsafe {
            if !self.frame.is_null() {
                av_frame_free(&mut self.frame);
            }
            if !self.audio_frame.is_null() {
                av_frame_free(&mut self.audio_frame);
            }
            if !self.pkt.is_null() {
                av_packet_free(&mut self.pkt);
            }
        }
        self.converter = None;
        unsafe {
            if !self.video_dec.is_null() {
                avcodec_free_context(&mut self.video_dec);
            }
            if !self.audio_dec.is_null() {
                avcodec_free_context(&mut self.audio_dec);
            }
            if !self.fmt_ctx.is_null() {
                avformat_close_input(&mut self.fmt_ctx);
            }
        }
        self.audio_pending = Vec::new();
        self.audio_block_pts = None;
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open { Ok(()) } else { Err(SessionError::NotOpen) }
    }

    // ── Accessors — read-only projections of the stream descriptors ──

    fn video_desc(&self) -> Result<&StreamDescriptor> {
        self.ensure_open()?;
        self.video.as_ref().ok_or(SessionError::NotOpen)
    }

    fn audio_desc(&self) -> Result<&StreamDescriptor> {
        self.ensure_open()?;
        self.audio.as_ref().ok_or(SessionError::NotOpen)
    }

    /// Picture width in pixels.
    pub fn width(&self) -> Result<u32> {
        match self.video_desc()?.info {
            StreamInfo::Video { width, .. } => Ok(width),
            StreamInfo::Audio { .. } => Err(SessionError::NotOpen),
        }
    }

    /// Picture height in pixels.
    pub fn height(&self) -> Result<u32> {
        match self.video_desc()?.info {
            StreamInfo::Video { height, .. } => Ok(height),
            StreamInfo::Audio { .. } => Err(SessionError::NotOpen),
        }
    }

    /// Video stream time base.
    pub fn video_time_base(&self) -> Result<Rational> {
        Ok(self.video_desc()?.time_base)
    }

    /// Audio stream time base.
    pub fn audio_time_base(&self) -> Result<Rational> {
        Ok(self.audio_desc()?.time_base)
    }

    /// Average video frame rate.
    pub fn frame_rate(&self) -> Result<Rational> {
        match self.video_desc()?.info {
            StreamInfo::Video { frame_rate, .. } => Ok(frame_rate),
            StreamInfo::Audio { .. } => Err(SessionError::NotOpen),
        }
    }

    /// Pixel aspect ratio of the video stream.
    pub fn aspect_ratio(&self) -> Result<Rational> {
        match self.video_desc()?.info {
            StreamInfo::Video { aspect_ratio, .. } => Ok(aspect_ratio),
            StreamInfo::Audio { .. } => Err(SessionError::NotOpen),
        }
    }

    /// Audio sample rate in Hz.
    pub fn sample_rate(&self) -> Result<i32> {
        match self.audio_desc()?.info {
            StreamInfo::Audio { sample_rate, .. } => Ok(sample_rate),
            StreamInfo::Video { .. } => Err(SessionError::NotOpen),
        }
    }

    /// Audio channel count.
    pub fn channels(&self) -> Result<i32> {
        match self.audio_desc()?.info {
            StreamInfo::Audio { channels, .. } => Ok(channels),
            StreamInfo::Video { .. } => Err(SessionError::NotOpen),
        }
    }

    /// Container duration in `AV_TIME_BASE` units.
    pub fn duration(&self) -> Result<i64> {
        self.ensure_open()?;
        Ok(unsafe { (*self.fmt_ctx).duration })
    }

    /// Container start time in `AV_TIME_BASE` units.
    pub fn start_time(&self) -> Result<i64> {
        self.ensure_open()?;
        Ok(unsafe { (*self.fmt_ctx).start_time })
    }

    /// Whether an audio stream was selected at open time.
    pub fn has_audio(&self) -> bool {
        self.open && self.audio.is_some()
    }

    /// Descriptor of the selected video stream.
    pub fn video_stream(&self) -> Result<&StreamDescriptor> {
        self.video_desc()
    }

    /// Descriptor of the selected audio stream, if any.
    pub fn audio_stream(&self) -> Result<&StreamDescriptor> {
        self.audio_desc()
    }
}

impl Drop for DecodeSession {
    fn drop(&mut self) {
        self.open = false;
        self.release();
    }
}

/// Find, allocate, and open a decoder for the given stream parameters.
///
/// Returns the context and the codec's short name.  Frees the context on
/// any partial failure.
fn open_decoder(
    par: *mut AVCodecParameters,
) -> std::result::Result<(*mut AVCodecContext, String), String> {
    let codec_id = unsafe { (*par).codec_id };
    let codec = unsafe { avcodec_find_decoder(codec_id) };
    if codec.is_null() {
        return Err(format!("no decoder registered for codec {codec_id:?}"));
    }
    let codec_name = unsafe { std::ffi::CStr::from_ptr((*codec).name) }
        .to_str()
        .unwrap_or("unknown")
        .to_string();

    let mut ctx = unsafe { avcodec_alloc_context3(codec) };
    if ctx.is_null() {
        return Err("failed to allocate decoder context".into());
    }

    let ret = unsafe { avcodec_parameters_to_context(ctx, par) };
    if ret < 0 {
        unsafe { avcodec_free_context(&mut ctx) };
        check_ffmpeg(ret, "avcodec_parameters_to_context").map_err(|e| e.to_string())?;
    }

    let ret = unsafe { avcodec_open2(ctx, codec, ptr::null_mut()) };
    if ret < 0 {
        unsafe { avcodec_free_context(&mut ctx) };
        check_ffmpeg(ret, "avcodec_open2").map_err(|e| e.to_string())?;
    }

    Ok((ctx, codec_name))
}

/// Copy one decoded audio frame into `dst` as interleaved bytes.
///
/// # Safety
///
/// `ctx` must be the decoder that produced `frame`, and `frame` must hold a
/// fully decoded audio frame.
unsafe fn append_samples(dst: &mut Vec<u8>, ctx: *const AVCodecContext, frame: *const AVFrame) {
    let sample_fmt = unsafe { (*ctx).sample_fmt };
    let bytes_per_sample = unsafe { av_get_bytes_per_sample(sample_fmt) } as usize;
    let channels = unsafe { (*frame).ch_layout.nb_channels } as usize;
    let samples = unsafe { (*frame).nb_samples } as usize;
    if bytes_per_sample == 0 || channels == 0 || samples == 0 {
        return;
    }

    if unsafe { av_sample_fmt_is_planar(sample_fmt) } != 0 {
        // One plane per channel; interleave sample by sample.
        dst.reserve(samples * channels * bytes_per_sample);
        for s in 0..samples {
            for ch in 0..channels {
                let plane = unsafe { *(*frame).extended_data.add(ch) };
                let src = unsafe {
                    std::slice::from_raw_parts(plane.add(s * bytes_per_sample), bytes_per_sample)
                };
                dst.extend_from_slice(src);
            }
        }
    } else {
        let src = unsafe {
            std::slice::from_raw_parts((*frame).data[0], samples * channels * bytes_per_sample)
        };
        dst.extend_from_slice(src);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_missing_file_reports_open_error() {
        let err = DecodeSession::open("/nonexistent/clip.mp4", false).unwrap_err();
        match err {
            SessionError::Open { locator, .. } => {
                assert_eq!(locator, "/nonexistent/clip.mp4");
            }
            other => panic!("expected Open error, got {other:?}"),
        }
    }

    #[test]
    fn repeated_failed_opens_do_not_leak() {
        // Each failed open must unwind fully; exhausting descriptors here
        // would make later iterations fail differently.
        for _ in 0..64 {
            assert!(DecodeSession::open("/nonexistent/clip.mp4", true).is_err());
        }
    }
}
