//! Bidirectional audio/video session engine over FFmpeg.
//!
//! One half demultiplexes a container, decodes its video (and optionally
//! audio) streams, and emits timestamped [`RawBuffer`]s in canonical planar
//! 4:2:0; the other half accepts such buffers, encodes them, and multiplexes
//! the compressed packets into an output container.
//!
//! ```no_run
//! use avsession::{DecodeSession, ReadOutcome};
//!
//! # fn main() -> avsession::Result<()> {
//! let mut session = DecodeSession::open("clip.mp4", true)?;
//! while let ReadOutcome::Frame(frame) = session.read()? {
//!     println!("{:?} frame, {} bytes, pts {:?}", frame.kind, frame.len(), frame.pts);
//! }
//! session.close();
//! # Ok(())
//! # }
//! ```
//!
//! # Module layout
//!
//! - [`decode`] — demux + decode session with seek/flush semantics
//! - [`encode`] — encode + mux session with header/trailer lifecycle
//! - `convert` — libswscale pixel conversion contexts (crate-internal)
//! - [`buffer`] — the raw frame/sample buffers exchanged with the caller
//! - [`stream`] — immutable per-stream descriptors
//! - [`params`] — encode parameters, rationals, codec identities
//! - [`error`] — typed error hierarchy
//! - [`ffi`] — FFmpeg status translation and one-time initialization
//!
//! # Threading
//!
//! Every operation is synchronous and runs on the caller's thread.  A
//! session holds no internal locking and must not be used from two threads
//! at once; distinct sessions own disjoint native state and are fully
//! independent.

pub mod buffer;
mod convert;
pub mod decode;
pub mod encode;
pub mod error;
pub mod ffi;
pub mod params;
pub mod stream;

pub use buffer::{RawBuffer, StreamKind, planar_420_size};
pub use decode::{DecodeSession, ReadOutcome};
pub use encode::EncodeSession;
pub use error::{Result, SessionError};
pub use ffi::init;
pub use params::{AudioCodec, AudioParams, Rational, VideoCodec, VideoParams};
pub use stream::{StreamDescriptor, StreamInfo};
