//! Session construction parameters and the rational/codec value types
//! exchanged at the boundary.

use ffmpeg_sys_next::{AVCodecID, AVRational};

/// A rational number mirroring FFmpeg's `AVRational`.
///
/// Used for time bases, frame rates, and pixel aspect ratios.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rational {
    /// Numerator.
    pub num: i32,
    /// Denominator.
    pub den: i32,
}

impl Rational {
    /// Construct from numerator and denominator.
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// Approximate as a float; zero when the denominator is zero.
    pub fn as_f64(self) -> f64 {
        if self.den == 0 {
            0.0
        } else {
            f64::from(self.num) / f64::from(self.den)
        }
    }

    pub(crate) fn to_ffi(self) -> AVRational {
        AVRational {
            num: self.num,
            den: self.den,
        }
    }

    pub(crate) fn from_ffi(r: AVRational) -> Self {
        Self {
            num: r.num,
            den: r.den,
        }
    }
}

/// Explicit video codec choice for an encode session.
///
/// When absent, the output container's default video codec is used.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VideoCodec {
    /// H.264 / AVC.
    H264,
    /// H.265 / HEVC.
    Hevc,
    /// MPEG-4 part 2.
    Mpeg4,
    /// MPEG-2 video.
    Mpeg2,
    /// VP8.
    Vp8,
    /// VP9.
    Vp9,
}

impl VideoCodec {
    pub(crate) fn to_ffi(self) -> AVCodecID {
        match self {
            Self::H264 => AVCodecID::AV_CODEC_ID_H264,
            Self::Hevc => AVCodecID::AV_CODEC_ID_HEVC,
            Self::Mpeg4 => AVCodecID::AV_CODEC_ID_MPEG4,
            Self::Mpeg2 => AVCodecID::AV_CODEC_ID_MPEG2VIDEO,
            Self::Vp8 => AVCodecID::AV_CODEC_ID_VP8,
            Self::Vp9 => AVCodecID::AV_CODEC_ID_VP9,
        }
    }
}

/// Explicit audio codec choice for an encode session.
///
/// When absent, the output container's default audio codec is used.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AudioCodec {
    /// AAC.
    Aac,
    /// MPEG-1 layer 2.
    Mp2,
    /// MPEG-1 layer 3.
    Mp3,
    /// FLAC.
    Flac,
    /// Signed 16-bit little-endian PCM.
    PcmS16le,
}

impl AudioCodec {
    pub(crate) fn to_ffi(self) -> AVCodecID {
        match self {
            Self::Aac => AVCodecID::AV_CODEC_ID_AAC,
            Self::Mp2 => AVCodecID::AV_CODEC_ID_MP2,
            Self::Mp3 => AVCodecID::AV_CODEC_ID_MP3,
            Self::Flac => AVCodecID::AV_CODEC_ID_FLAC,
            Self::PcmS16le => AVCodecID::AV_CODEC_ID_PCM_S16LE,
        }
    }
}

/// Video stream parameters for an encode session.
#[derive(Clone, Copy, Debug)]
pub struct VideoParams {
    /// Target bit rate in bits per second.
    pub bit_rate: i64,
    /// Picture width in pixels.
    pub width: u32,
    /// Picture height in pixels.
    pub height: u32,
    /// Encoder time base (typically `1/fps`).
    pub time_base: Rational,
    /// Pixel aspect ratio.
    pub aspect_ratio: Rational,
    /// Explicit codec override; `None` uses the container default.
    pub codec: Option<VideoCodec>,
}

impl VideoParams {
    /// Reasonable defaults for the given geometry and frame rate.
    pub fn new(width: u32, height: u32, frame_rate: Rational) -> Self {
        Self {
            bit_rate: 1_000_000,
            width,
            height,
            // Encoder time base is the inverse of the frame rate.
            time_base: Rational::new(frame_rate.den, frame_rate.num),
            aspect_ratio: Rational::new(1, 1),
            codec: None,
        }
    }
}

/// Audio stream parameters for an encode session.
///
/// A zero channel count disables the audio stream entirely.
#[derive(Clone, Copy, Debug)]
pub struct AudioParams {
    /// Target bit rate in bits per second.
    pub bit_rate: i64,
    /// Samples per second.
    pub sample_rate: i32,
    /// Channel count; zero means "no audio stream".
    pub channels: i32,
    /// Explicit codec override; `None` uses the container default.
    pub codec: Option<AudioCodec>,
}

impl AudioParams {
    /// Reasonable defaults for the given sample rate and channel count.
    pub fn new(sample_rate: i32, channels: i32) -> Self {
        Self {
            bit_rate: 128_000,
            sample_rate,
            channels,
            codec: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rational_round_trips_through_ffi() {
        let r = Rational::new(1001, 30000);
        assert_eq!(Rational::from_ffi(r.to_ffi()), r);
    }

    #[test]
    fn rational_as_f64_guards_zero_denominator() {
        assert_eq!(Rational::new(1, 0).as_f64(), 0.0);
        assert!((Rational::new(1, 4).as_f64() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn video_params_invert_frame_rate() {
        let p = VideoParams::new(640, 480, Rational::new(25, 1));
        assert_eq!(p.time_base, Rational::new(1, 25));
    }

    #[test]
    fn codec_identities_map_to_ffi() {
        assert_eq!(VideoCodec::H264.to_ffi(), AVCodecID::AV_CODEC_ID_H264);
        assert_eq!(AudioCodec::Aac.to_ffi(), AVCodecID::AV_CODEC_ID_AAC);
    }
}
