//! Typed error hierarchy for session operations.
//!
//! Uses `thiserror` for library-grade errors.  End-of-stream is deliberately
//! NOT an error — see [`crate::decode::ReadOutcome`].

/// All errors a decode or encode session can surface.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Container/codec discovery, allocation, or header-write failure during
    /// session construction.  Carries the locator and the native status text.
    #[error("failed to open \"{locator}\": {detail}")]
    Open {
        /// The media locator (file path or URI) the session was opened against.
        locator: String,
        /// Underlying FFmpeg status text.
        detail: String,
    },

    /// Operation invoked on a session that was never opened or has been closed.
    #[error("session is not open")]
    NotOpen,

    /// A native decode call returned a failure status mid-stream.
    #[error("decode error: {0}")]
    Decode(String),

    /// A native encode or muxed-write call returned a failure status.
    #[error("encode error: {0}")]
    Encode(String),

    /// The underlying container seek failed.
    #[error("seek error: {0}")]
    Seek(String),

    /// Caller-supplied buffer geometry or size does not match the configured
    /// stream.  No native call was performed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_error_names_the_locator() {
        let err = SessionError::Open {
            locator: "/tmp/missing.mp4".into(),
            detail: "No such file or directory".into(),
        };
        let text = err.to_string();
        assert!(text.contains("/tmp/missing.mp4"));
        assert!(text.contains("No such file"));
    }

    #[test]
    fn not_open_is_self_describing() {
        assert_eq!(SessionError::NotOpen.to_string(), "session is not open");
    }
}
