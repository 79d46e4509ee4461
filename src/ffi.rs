//! FFmpeg FFI helpers — status translation, string conversion, and one-time
//! process-wide library initialization.

use std::ffi::CString;
use std::fmt::{Display, Formatter};
use std::sync::Once;

use ffmpeg_sys_next::{AV_LOG_ERROR, av_log_set_level, av_strerror, avformat_network_init};

/// POSIX EAGAIN — used with AVERROR() for "try again" semantics.
pub(crate) const EAGAIN: i32 = 11;

static INIT: Once = Once::new();

/// One-time process-scoped FFmpeg setup.
///
/// Clamps the native log level (session logging goes through `tracing`
/// instead) and initializes network support.  Safe to call repeatedly; both
/// session constructors invoke it, so callers normally never need to.
pub fn init() {
    INIT.call_once(|| {
        // SAFETY: both calls are process-global configuration with no
        // preconditions; the Once guard serializes the first invocation.
        unsafe {
            av_log_set_level(AV_LOG_ERROR);
            avformat_network_init();
        }
    });
}

/// Structured FFmpeg error details for module-specific wrapping.
#[derive(Debug, Clone)]
pub struct FfmpegErrorDetail {
    /// The native call that failed (e.g. `"avformat_open_input"`).
    pub context: String,
    /// Raw FFmpeg error code (negative AVERROR value).
    pub code: i32,
    /// Human-readable error message from `av_strerror`.
    pub message: String,
}

impl Display for FfmpegErrorDetail {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} (code {})", self.context, self.message, self.code)
    }
}

/// Translate an FFmpeg return code into a structured error.
///
/// On success (`ret >= 0`) this is a no-op.  On failure, `av_strerror` is
/// called to produce a human-readable message.
pub fn check_ffmpeg(ret: i32, context: &str) -> std::result::Result<(), FfmpegErrorDetail> {
    if ret >= 0 {
        return Ok(());
    }

    let mut buf = [0 as std::ffi::c_char; 256];
    // SAFETY: buf is a valid mutable buffer of known length.
    unsafe {
        av_strerror(ret, buf.as_mut_ptr(), buf.len());
    }
    let msg = unsafe { std::ffi::CStr::from_ptr(buf.as_ptr()) }
        .to_str()
        .unwrap_or("unknown error")
        .to_string();

    Err(FfmpegErrorDetail {
        context: context.to_string(),
        code: ret,
        message: msg,
    })
}

/// Convert a Rust `&str` to a `CString`, mapping NUL bytes to an error.
pub fn to_cstring(s: &str) -> std::result::Result<CString, String> {
    CString::new(s).map_err(|e| format!("Invalid locator string: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_codes_pass_through() {
        assert!(check_ffmpeg(0, "noop").is_ok());
        assert!(check_ffmpeg(42, "noop").is_ok());
    }

    #[test]
    fn failure_carries_context_and_code() {
        init();
        let err = check_ffmpeg(-22, "avformat_open_input").unwrap_err();
        assert_eq!(err.context, "avformat_open_input");
        assert_eq!(err.code, -22);
        assert!(err.to_string().contains("avformat_open_input"));
    }

    #[test]
    fn interior_nul_is_rejected() {
        assert!(to_cstring("a\0b").is_err());
        assert!(to_cstring("plain.mp4").is_ok());
    }

    #[test]
    fn init_is_idempotent() {
        init();
        init();
    }
}
