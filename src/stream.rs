//! Immutable-after-open descriptions of the elementary streams a session
//! tracks.

use crate::buffer::StreamKind;
use crate::params::Rational;

/// Kind-specific stream properties.
#[derive(Clone, Debug)]
pub enum StreamInfo {
    /// Video stream geometry and timing.
    Video {
        /// Picture width in pixels.
        width: u32,
        /// Picture height in pixels.
        height: u32,
        /// Average frame rate as reported by the container.
        frame_rate: Rational,
        /// Pixel aspect ratio.
        aspect_ratio: Rational,
    },
    /// Audio stream sampling properties.
    Audio {
        /// Samples per second.
        sample_rate: i32,
        /// Channel count.
        channels: i32,
    },
}

/// Description of one elementary stream, built while probing the container
/// and never mutated afterwards.
#[derive(Clone, Debug)]
pub struct StreamDescriptor {
    /// Stream index inside the container.
    pub index: i32,
    /// Time base all of this stream's timestamps are expressed in.
    pub time_base: Rational,
    /// Short codec name (e.g. `"h264"`).
    pub codec_name: String,
    /// Kind-specific properties.
    pub info: StreamInfo,
}

impl StreamDescriptor {
    /// Which stream kind this descriptor describes.
    pub fn kind(&self) -> StreamKind {
        match self.info {
            StreamInfo::Video { .. } => StreamKind::Video,
            StreamInfo::Audio { .. } => StreamKind::Audio,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_kind_follows_info() {
        let video = StreamDescriptor {
            index: 0,
            time_base: Rational::new(1, 90000),
            codec_name: "h264".into(),
            info: StreamInfo::Video {
                width: 1920,
                height: 1080,
                frame_rate: Rational::new(25, 1),
                aspect_ratio: Rational::new(1, 1),
            },
        };
        assert_eq!(video.kind(), StreamKind::Video);

        let audio = StreamDescriptor {
            index: 1,
            time_base: Rational::new(1, 48000),
            codec_name: "aac".into(),
            info: StreamInfo::Audio {
                sample_rate: 48000,
                channels: 2,
            },
        };
        assert_eq!(audio.kind(), StreamKind::Audio);
    }
}
