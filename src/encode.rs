//! Encode session — accepts canonical [`RawBuffer`]s, encodes them, and
//! multiplexes the compressed packets into an output container.
//!
//! # Design
//!
//! The output format is guessed from the locator extension (with an "mpeg"
//! fallback).  The session owns the muxer context, one or two encoder
//! contexts, a pixel conversion context, and per-stream scratch frames.
//! Construction acquires them step by step and runs the close teardown on
//! any failure, so no partial session escapes.  `close()` drains both
//! encoders and writes the trailer before releasing anything.

use std::ptr;

use ffmpeg_sys_next::*;

use crate::buffer::{RawBuffer, planar_420_size};
use crate::convert::Converter;
use crate::error::{Result, SessionError};
use crate::ffi::{EAGAIN, check_ffmpeg, to_cstring};
use crate::params::{AudioParams, Rational, VideoParams};

/// Encodes and multiplexes one output media resource.
///
/// Not thread-safe; one session must not be used from two threads at once.
#[derive(Debug)]
pub struct EncodeSession {
    locator: String,
    fmt_ctx: *mut AVFormatContext,
    video_stream: *mut AVStream,
    audio_stream: *mut AVStream,
    video_enc: *mut AVCodecContext,
    audio_enc: *mut AVCodecContext,
    converter: Option<Converter>,
    video_frame: *mut AVFrame,
    audio_frame: *mut AVFrame,
    pkt: *mut AVPacket,
    width: u32,
    height: u32,
    /// Samples per encoded audio frame; write_audio expects exactly one
    /// frame's worth of interleaved bytes per call.
    audio_frame_size: i32,
    audio_channels: i32,
    audio_sample_fmt: AVSampleFormat,
    /// Next frame timestamp in encoder time-base ticks (one per picture).
    video_pts: i64,
    /// Next audio timestamp in samples.
    audio_pts: i64,
    file_open: bool,
    header_written: bool,
    open: bool,
}

// SAFETY: the raw FFmpeg pointers are exclusively owned and every operation
// takes `&mut self`; the session may move between threads but is never used
// from two at once.
unsafe impl Send for EncodeSession {}

impl EncodeSession {
    /// Create the output container, configure and open the encoders, open
    /// the file handle, and write the container header.
    ///
    /// An audio stream is created only when `audio.channels > 0`.
    pub fn open(locator: &str, video: VideoParams, audio: Option<AudioParams>) -> Result<Self> {
        crate::ffi::init();

        let mut session = Self {
            locator: locator.to_string(),
            fmt_ctx: ptr::null_mut(),
            video_stream: ptr::null_mut(),
            audio_stream: ptr::null_mut(),
            video_enc: ptr::null_mut(),
            audio_enc: ptr::null_mut(),
            converter: None,
            video_frame: ptr::null_mut(),
            audio_frame: ptr::null_mut(),
            pkt: ptr::null_mut(),
            width: video.width,
            height: video.height,
            audio_frame_size: 0,
            audio_channels: 0,
            audio_sample_fmt: AVSampleFormat::AV_SAMPLE_FMT_NONE,
            video_pts: 0,
            audio_pts: 0,
            file_open: false,
            header_written: false,
            open: false,
        };

        match session.open_inner(video, audio) {
            Ok(()) => {
                session.open = true;
                tracing::info!(
                    locator = %session.locator,
                    width = video.width,
                    height = video.height,
                    has_audio = !session.audio_enc.is_null(),
                    "Encode session opened"
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

    fn open_inner(
        &mut self,
        video: VideoParams,
        audio: Option<AudioParams>,
    ) -> std::result::Result<(), String> {
        let c_path = to_cstring(&self.locator)?;

        // ── Resolve output format from the locator extension ──
        let mut format = unsafe { av_guess_format(ptr::null(), c_path.as_ptr(), ptr::null()) };
        if format.is_null() {
            format = unsafe { av_guess_format(c"mpeg".as_ptr(), ptr::null(), ptr::null()) };
        }
        if format.is_null() {
            return Err("could not resolve an output container format".into());
        }

        let ret = unsafe {
            avformat_alloc_output_context2(&mut self.fmt_ctx, format, ptr::null(), c_path.as_ptr())
        };
        if ret < 0 || self.fmt_ctx.is_null() {
            check_ffmpeg(ret, "avformat_alloc_output_context2").map_err(|e| e.to_string())?;
            return Err("failed to allocate output context".into());
        }

        // ── Video stream and encoder ──
        let video_codec_id = video
            .codec
            .map(|c| c.to_ffi())
            .unwrap_or(unsafe { (*format).video_codec });
        if video_codec_id == AVCodecID::AV_CODEC_ID_NONE {
            return Err("output format does not support video".into());
        }

        let codec = unsafe { avcodec_find_encoder(video_codec_id) };
        if codec.is_null() {
            return Err(format!("no encoder registered for {video_codec_id:?}"));
        }

        self.video_stream = unsafe { avformat_new_stream(self.fmt_ctx, ptr::null()) };
        if self.video_stream.is_null() {
            return Err("failed to allocate video stream".into());
        }

        self.video_enc = unsafe { avcodec_alloc_context3(codec) };
        if self.video_enc.is_null() {
            return Err("failed to allocate video encoder context".into());
        }
        unsafe {
            let c = &mut *self.video_enc;
            c.codec_id = video_codec_id;
            c.codec_type = AVMediaType::AVMEDIA_TYPE_VIDEO;
            c.bit_rate = video.bit_rate;
            c.width = video.width as i32;
            c.height = video.height as i32;
            c.time_base = video.time_base.to_ffi();
            c.sample_aspect_ratio = video.aspect_ratio.to_ffi();
            c.gop_size = 12;
            c.pix_fmt = AVPixelFormat::AV_PIX_FMT_YUV420P;
            if (*(*self.fmt_ctx).oformat).flags & AVFMT_GLOBALHEADER != 0 {
                c.flags |= AV_CODEC_FLAG_GLOBAL_HEADER as i32;
            }
        }

        let ret = unsafe { avcodec_open2(self.video_enc, codec, ptr::null_mut()) };
        check_ffmpeg(ret, "avcodec_open2 (video)").map_err(|e| e.to_string())?;

        let ret = unsafe {
            avcodec_parameters_from_context((*self.video_stream).codecpar, self.video_enc)
        };
        check_ffmpeg(ret, "avcodec_parameters_from_context").map_err(|e| e.to_string())?;
        unsafe {
            (*self.video_stream).time_base = video.time_base.to_ffi();
        }

        // ── Conversion context and video scratch frame ──
        self.converter = Some(Converter::new(
            AVPixelFormat::AV_PIX_FMT_YUV420P,
            AVPixelFormat::AV_PIX_FMT_YUV420P,
            video.width,
            video.height,
        )?);

        self.video_frame = unsafe { av_frame_alloc() };
        if self.video_frame.is_null() {
            return Err("failed to allocate video frame".into());
        }
        unsafe {
            (*self.video_frame).format = AVPixelFormat::AV_PIX_FMT_YUV420P as i32;
            (*self.video_frame).width = video.width as i32;
            (*self.video_frame).height = video.height as i32;
        }
        let ret = unsafe { av_frame_get_buffer(self.video_frame, 0) };
        check_ffmpeg(ret, "av_frame_get_buffer (video)").map_err(|e| e.to_string())?;

        // ── Optional audio stream and encoder ──
        if let Some(audio) = audio.filter(|a| a.channels > 0) {
            self.open_audio_inner(audio, format)?;
        }

        // ── File handle and container header ──
        if unsafe { (*format).flags } & AVFMT_NOFILE == 0 {
            let ret =
                unsafe { avio_open(&mut (*self.fmt_ctx).pb, c_path.as_ptr(), AVIO_FLAG_WRITE) };
            check_ffmpeg(ret, "avio_open").map_err(|e| e.to_string())?;
            self.file_open = true;
        }

        let ret = unsafe { avformat_write_header(self.fmt_ctx, ptr::null_mut()) };
        check_ffmpeg(ret, "avformat_write_header").map_err(|e| e.to_string())?;
        self.header_written = true;

        self.pkt = unsafe { av_packet_alloc() };
        if self.pkt.is_null() {
            return Err("failed to allocate packet".into());
        }

        Ok(())
    }

    fn open_audio_inner(
        &mut self,
        audio: AudioParams,
        format: *const AVOutputFormat,
    ) -> std::result::Result<(), String> {
        let codec_id = audio
            .codec
            .map(|c| c.to_ffi())
            .unwrap_or(unsafe { (*format).audio_codec });
        if codec_id == AVCodecID::AV_CODEC_ID_NONE {
            return Err("output format does not support audio".into());
        }

        let codec = unsafe { avcodec_find_encoder(codec_id) };
        if codec.is_null() {
            return Err(format!("no encoder registered for {codec_id:?}"));
        }

        self.audio_stream = unsafe { avformat_new_stream(self.fmt_ctx, ptr::null()) };
        if self.audio_stream.is_null() {
            return Err("failed to allocate audio stream".into());
        }

        self.audio_enc = unsafe { avcodec_alloc_context3(codec) };
        if self.audio_enc.is_null() {
            return Err("failed to allocate audio encoder context".into());
        }
        self.audio_sample_fmt = sample_format_for(codec_id);
        unsafe {
            let c = &mut *self.audio_enc;
            c.codec_id = codec_id;
            c.codec_type = AVMediaType::AVMEDIA_TYPE_AUDIO;
            c.bit_rate = audio.bit_rate;
            c.sample_rate = audio.sample_rate;
            c.sample_fmt = self.audio_sample_fmt;
            c.time_base = AVRational {
                num: 1,
                den: audio.sample_rate,
            };
            av_channel_layout_default(&mut c.ch_layout, audio.channels);
            if (*(*self.fmt_ctx).oformat).flags & AVFMT_GLOBALHEADER != 0 {
                c.flags |= AV_CODEC_FLAG_GLOBAL_HEADER as i32;
            }
        }

        let ret = unsafe { avcodec_open2(self.audio_enc, codec, ptr::null_mut()) };
        check_ffmpeg(ret, "avcodec_open2 (audio)").map_err(|e| e.to_string())?;

        let ret = unsafe {
            avcodec_parameters_from_context((*self.audio_stream).codecpar, self.audio_enc)
        };
        check_ffmpeg(ret, "avcodec_parameters_from_context").map_err(|e| e.to_string())?;
        unsafe {
            (*self.audio_stream).time_base = AVRational {
                num: 1,
                den: audio.sample_rate,
            };
        }

        self.audio_channels = audio.channels;
        // Encoders with a variable frame size report zero; pick a fixed
        // block so write_audio still has a well-defined contract.
        let frame_size = unsafe { (*self.audio_enc).frame_size };
        self.audio_frame_size = if frame_size > 0 { frame_size } else { 1024 };

        self.audio_frame = unsafe { av_frame_alloc() };
        if self.audio_frame.is_null() {
            return Err("failed to allocate audio frame".into());
        }
        unsafe {
            (*self.audio_frame).format = self.audio_sample_fmt as i32;
            (*self.audio_frame).nb_samples = self.audio_frame_size;
            let ret = av_channel_layout_copy(
                &mut (*self.audio_frame).ch_layout,
                &(*self.audio_enc).ch_layout,
            );
            check_ffmpeg(ret, "av_channel_layout_copy").map_err(|e| e.to_string())?;
        }
        let ret = unsafe { av_frame_get_buffer(self.audio_frame, 0) };
        check_ffmpeg(ret, "av_frame_get_buffer (audio)").map_err(|e| e.to_string())?;

        tracing::debug!(
            frame_size = self.audio_frame_size,
            channels = self.audio_channels,
            sample_fmt = ?self.audio_sample_fmt,
            "Audio encoder opened"
        );
        Ok(())
    }

    /// Encode one canonical planar 4:2:0 picture and write every packet the
    /// encoder emits.
    ///
    /// The buffer's resolution must exactly match the configured stream.
    pub fn write_video(&mut self, buffer: &RawBuffer) -> Result<()> {
        self.ensure_open()?;

        if buffer.width != self.width || buffer.height != self.height {
            return Err(SessionError::InvalidArgument(format!(
                "frame resolution is {}x{} but video resolution is {}x{}",
                buffer.width, buffer.height, self.width, self.height
            )));
        }
        let expected = planar_420_size(self.width, self.height);
        if buffer.data.len() != expected {
            return Err(SessionError::InvalidArgument(format!(
                "frame payload is {} bytes, expected {expected}",
                buffer.data.len()
            )));
        }

        let ret = unsafe { av_frame_make_writable(self.video_frame) };
        check_ffmpeg(ret, "av_frame_make_writable")
            .map_err(|e| SessionError::Encode(e.to_string()))?;

        let converter = self.converter.as_mut().ok_or(SessionError::NotOpen)?;
        converter
            .frame_from_planar(&buffer.data, self.video_frame)
            .map_err(SessionError::Encode)?;

        unsafe {
            (*self.video_frame).pts = self.video_pts;
        }
        self.video_pts += 1;

        let ret = unsafe { avcodec_send_frame(self.video_enc, self.video_frame) };
        check_ffmpeg(ret, "avcodec_send_frame (video)")
            .map_err(|e| SessionError::Encode(e.to_string()))?;

        self.write_encoded_packets(self.video_enc, self.video_stream, false)
    }

    /// Encode one block of interleaved audio samples and write every packet
    /// the encoder emits.
    ///
    /// The payload must be exactly `frame_size * bytes_per_sample * channels`
    /// bytes in the encoder's sample format.
    pub fn write_audio(&mut self, buffer: &RawBuffer) -> Result<()> {
        self.ensure_open()?;

        if self.audio_enc.is_null() {
            return Err(SessionError::InvalidArgument(
                "session was opened without an audio stream".into(),
            ));
        }
        let bytes_per_sample = unsafe { av_get_bytes_per_sample(self.audio_sample_fmt) } as usize;
        let expected =
            self.audio_frame_size as usize * bytes_per_sample * self.audio_channels as usize;
        if buffer.data.len() != expected {
            return Err(SessionError::InvalidArgument(format!(
                "audio payload is {} bytes, expected {expected} ({} samples x {} channels x {} bytes)",
                buffer.data.len(),
                self.audio_frame_size,
                self.audio_channels,
                bytes_per_sample
            )));
        }

        let ret = unsafe { av_frame_make_writable(self.audio_frame) };
        check_ffmpeg(ret, "av_frame_make_writable")
            .map_err(|e| SessionError::Encode(e.to_string()))?;

        // SAFETY: the frame owns buffers for `audio_frame_size` samples in
        // the encoder's sample format; sizes were validated above.
        unsafe {
            fill_audio_frame(
                self.audio_frame,
                &buffer.data,
                self.audio_sample_fmt,
                self.audio_channels as usize,
                bytes_per_sample,
            );
            (*self.audio_frame).pts = self.audio_pts;
        }
        self.audio_pts += i64::from(self.audio_frame_size);

        let ret = unsafe { avcodec_send_frame(self.audio_enc, self.audio_frame) };
        check_ffmpeg(ret, "avcodec_send_frame (audio)")
            .map_err(|e| SessionError::Encode(e.to_string()))?;

        self.write_encoded_packets(self.audio_enc, self.audio_stream, true)
    }

    /// Drain every packet currently available from `enc`, rescale its
    /// timestamps into the stream time base, and write it interleaved.
    fn write_encoded_packets(
        &mut self,
        enc: *mut AVCodecContext,
        stream: *mut AVStream,
        mark_sync: bool,
    ) -> Result<()> {
        loop {
            let ret = unsafe { avcodec_receive_packet(enc, self.pkt) };
            if ret == AVERROR(EAGAIN) || ret == AVERROR_EOF {
                return Ok(());
            }
            check_ffmpeg(ret, "avcodec_receive_packet")
                .map_err(|e| SessionError::Encode(e.to_string()))?;

            unsafe {
                av_packet_rescale_ts(self.pkt, (*enc).time_base, (*stream).time_base);
                (*self.pkt).stream_index = (*stream).index;
                if mark_sync {
                    (*self.pkt).flags |= AV_PKT_FLAG_KEY;
                }
            }

            let ret = unsafe { av_interleaved_write_frame(self.fmt_ctx, self.pkt) };
            // av_interleaved_write_frame takes ownership and unrefs internally.
            if ret < 0 {
                check_ffmpeg(ret, "av_interleaved_write_frame")
                    .map_err(|e| SessionError::Encode(e.to_string()))?;
            }
        }
    }

    /// Send the end-of-stream signal to `enc` and write the remaining
    /// look-ahead packets.
    fn flush_encoder(
        &mut self,
        enc: *mut AVCodecContext,
        stream: *mut AVStream,
        mark_sync: bool,
    ) -> Result<()> {
        let ret = unsafe { avcodec_send_frame(enc, ptr::null()) };
        if ret < 0 && ret != AVERROR_EOF {
            check_ffmpeg(ret, "avcodec_send_frame (flush)")
                .map_err(|e| SessionError::Encode(e.to_string()))?;
        }
        self.write_encoded_packets(enc, stream, mark_sync)
    }

    /// Flush the encoders, write the trailer, and release every native
    /// resource.  Idempotent; subsequent writes fail with
    /// [`SessionError::NotOpen`].
    pub fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;

        // Drain encoder look-ahead before the trailer so buffered frames
        // are not dropped.
        let mut result = Ok(());
        if self.header_written {
            if !self.video_enc.is_null() {
                result = self.flush_encoder(self.video_enc, self.video_stream, false);
            }
            if result.is_ok() && !self.audio_enc.is_null() {
                result = self.flush_encoder(self.audio_enc, self.audio_stream, true);
            }

            let ret = unsafe { av_write_trailer(self.fmt_ctx) };
            if result.is_ok() {
                result = check_ffmpeg(ret, "av_write_trailer")
                    .map_err(|e| SessionError::Encode(e.to_string()));
            }
            self.header_written = false;
        }

        self.release();
        tracing::info!(
            locator = %self.locator,
            frames = self.video_pts,
            "Encode session closed"
        );
        result
    }

    /// Teardown in dependency order: scratch frames → conversion context →
    /// encoder contexts → file handle → format context.  Null-guarded so it
    /// is safe at any construction depth and on repeated calls.
    fn release(&mut self) {
        unsafe {
            if !self.video_frame.is_null() {
                av_frame_free(&mut self.video_frame);
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
            if !self.video_enc.is_null() {
                avcodec_free_context(&mut self.video_enc);
            }
            if !self.audio_enc.is_null() {
                avcodec_free_context(&mut self.audio_enc);
            }
            if !self.fmt_ctx.is_null() {
                if self.file_open {
                    avio_closep(&mut (*self.fmt_ctx).pb);
                    self.file_open = false;
                }
                avformat_free_context(self.fmt_ctx);
                self.fmt_ctx = ptr::null_mut();
            }
        }
        self.video_stream = ptr::null_mut();
        self.audio_stream = ptr::null_mut();
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open { Ok(()) } else { Err(SessionError::NotOpen) }
    }

    // ── Accessors ──

    /// Video stream time base.
    pub fn video_time_base(&self) -> Result<Rational> {
        self.ensure_open()?;
        Ok(Rational::from_ffi(unsafe {
            (*self.video_stream).time_base
        }))
    }

    /// Audio stream time base.
    pub fn audio_time_base(&self) -> Result<Rational> {
        self.ensure_open()?;
        if self.audio_stream.is_null() {
            return Err(SessionError::NotOpen);
        }
        Ok(Rational::from_ffi(unsafe {
            (*self.audio_stream).time_base
        }))
    }

    /// Samples per encoded audio frame.
    pub fn audio_frame_size(&self) -> Result<i32> {
        self.ensure_open()?;
        if self.audio_enc.is_null() {
            return Err(SessionError::NotOpen);
        }
        Ok(self.audio_frame_size)
    }

    /// Configured audio channel count.
    pub fn channels(&self) -> Result<i32> {
        self.ensure_open()?;
        if self.audio_enc.is_null() {
            return Err(SessionError::NotOpen);
        }
        Ok(self.audio_channels)
    }
}

impl Drop for EncodeSession {
    fn drop(&mut self) {
        if self.open {
            // Flush failures cannot propagate out of drop; the trailer is
            // still attempted so the container stays readable.
            if let Err(err) = self.close() {
                tracing::warn!(locator = %self.locator, %err, "Encode close failed in drop");
            }
        } else {
            self.release();
        }
    }
}

/// Sample format each supported encoder expects its input in.
///
/// FFmpeg removed the public supported-format tables from `AVCodec`; this
/// closed mapping covers the codec identities the session can configure.
fn sample_format_for(codec_id: AVCodecID) -> AVSampleFormat {
    match codec_id {
        AVCodecID::AV_CODEC_ID_AAC | AVCodecID::AV_CODEC_ID_VORBIS => {
            AVSampleFormat::AV_SAMPLE_FMT_FLTP
        }
        AVCodecID::AV_CODEC_ID_MP3 => AVSampleFormat::AV_SAMPLE_FMT_S16P,
        _ => AVSampleFormat::AV_SAMPLE_FMT_S16,
    }
}

/// Spread one block of interleaved samples into the frame's plane layout.
///
/// # Safety
///
/// `frame` must own writable buffers for exactly `data.len()` bytes of
/// samples in `sample_fmt`.
unsafe fn fill_audio_frame(
    frame: *mut AVFrame,
    data: &[u8],
    sample_fmt: AVSampleFormat,
    channels: usize,
    bytes_per_sample: usize,
) {
    let samples = data.len() / (channels * bytes_per_sample);
    if unsafe { av_sample_fmt_is_planar(sample_fmt) } != 0 {
        for s in 0..samples {
            for ch in 0..channels {
                let src = &data[(s * channels + ch) * bytes_per_sample..][..bytes_per_sample];
                // SAFETY: plane `ch` holds `samples * bytes_per_sample` bytes.
                unsafe {
                    let plane = *(*frame).extended_data.add(ch);
                    ptr::copy_nonoverlapping(
                        src.as_ptr(),
                        plane.add(s * bytes_per_sample),
                        bytes_per_sample,
                    );
                }
            }
        }
    } else {
        // SAFETY: plane 0 holds the full interleaved block.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), (*frame).data[0], data.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_format_mapping_is_closed() {
        assert_eq!(
            sample_format_for(AVCodecID::AV_CODEC_ID_AAC),
            AVSampleFormat::AV_SAMPLE_FMT_FLTP
        );
        assert_eq!(
            sample_format_for(AVCodecID::AV_CODEC_ID_MP2),
            AVSampleFormat::AV_SAMPLE_FMT_S16
        );
        assert_eq!(
            sample_format_for(AVCodecID::AV_CODEC_ID_PCM_S16LE),
            AVSampleFormat::AV_SAMPLE_FMT_S16
        );
    }

    #[test]
    fn open_rejects_unwritable_locator() {
        let err = EncodeSession::open(
            "/nonexistent-dir/out.mp4",
            VideoParams::new(320, 240, crate::params::Rational::new(25, 1)),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, SessionError::Open { .. }));
    }
}
