//! Raw decoded-media buffers exchanged across the session boundary.
//!
//! A [`RawBuffer`] owns one decoded picture in canonical planar 4:2:0
//! layout, or one block of interleaved audio samples.  Ownership transfers
//! to the caller on `read()`; write calls only borrow the contents.

/// Which elementary stream a buffer (or stream descriptor) belongs to.
///
/// Closed variant set — sessions track at most one stream of each kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    /// Video pictures.
    Video,
    /// Audio sample blocks.
    Audio,
}

/// One decoded picture or audio block, tagged with its stream kind and
/// presentation timestamp (in the originating stream's time base).
#[derive(Debug)]
pub struct RawBuffer {
    /// Stream kind this buffer was decoded from or is destined for.
    pub kind: StreamKind,
    /// Presentation timestamp, `None` when the container provided no usable
    /// timestamp for this access unit.
    pub pts: Option<i64>,
    /// Picture width in pixels (zero for audio).
    pub width: u32,
    /// Picture height in pixels (zero for audio).
    pub height: u32,
    /// Owned payload.  Video: tightly packed I420 planes (`w*h*3/2` bytes,
    /// Y then U then V).  Audio: interleaved samples in the decoder's
    /// native sample format.
    pub data: Vec<u8>,
}

impl RawBuffer {
    /// Wrap a canonical planar 4:2:0 picture.
    pub fn video(width: u32, height: u32, data: Vec<u8>, pts: Option<i64>) -> Self {
        debug_assert_eq!(data.len(), planar_420_size(width, height));
        Self {
            kind: StreamKind::Video,
            pts,
            width,
            height,
            data,
        }
    }

    /// Wrap an interleaved audio sample block.
    pub fn audio(data: Vec<u8>, pts: Option<i64>) -> Self {
        Self {
            kind: StreamKind::Audio,
            pts,
            width: 0,
            height: 0,
            data,
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Byte size of one tightly packed planar 4:2:0 picture.
pub fn planar_420_size(width: u32, height: u32) -> usize {
    (width as usize) * (height as usize) * 3 / 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn planar_size_is_three_halves() {
        assert_eq!(planar_420_size(320, 240), 320 * 240 * 3 / 2);
        assert_eq!(planar_420_size(0, 0), 0);
    }

    #[test]
    fn video_buffer_keeps_geometry() {
        let buf = RawBuffer::video(16, 16, vec![0u8; 16 * 16 * 3 / 2], Some(40));
        assert_eq!(buf.kind, StreamKind::Video);
        assert_eq!((buf.width, buf.height), (16, 16));
        assert_eq!(buf.pts, Some(40));
        assert_eq!(buf.len(), 384);
    }

    #[test]
    fn audio_buffer_has_no_geometry() {
        let buf = RawBuffer::audio(vec![0u8; 4096], None);
        assert_eq!(buf.kind, StreamKind::Audio);
        assert_eq!((buf.width, buf.height), (0, 0));
        assert!(buf.pts.is_none());
        assert!(!buf.is_empty());
    }
}
