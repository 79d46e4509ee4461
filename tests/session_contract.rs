//! End-to-end contract tests: encode a synthetic clip with [`EncodeSession`],
//! then verify the decode half against it.
//!
//! Everything runs against files under a per-test temp directory; no media
//! fixtures are required.

use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use avsession::{
    AudioCodec, AudioParams, DecodeSession, EncodeSession, RawBuffer, Rational, ReadOutcome,
    SessionError, StreamKind, VideoCodec, VideoParams, planar_420_size,
};

const WIDTH: u32 = 320;
const HEIGHT: u32 = 240;
const FPS: Rational = Rational::new(25, 1);

fn unique_temp_dir(label: &str) -> PathBuf {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let dir =
        std::env::temp_dir().join(format!("avsession_{label}_{}_{}", std::process::id(), nanos));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

/// One flat gray picture; the shade varies per frame so encoded sizes stay
/// non-trivial.
fn gray_frame(shade: u8) -> RawBuffer {
    let luma = (WIDTH * HEIGHT) as usize;
    let mut data = vec![128u8; planar_420_size(WIDTH, HEIGHT)];
    data[..luma].fill(shade);
    RawBuffer::video(WIDTH, HEIGHT, data, None)
}

fn video_params() -> VideoParams {
    let mut params = VideoParams::new(WIDTH, HEIGHT, FPS);
    // The native MPEG-4 encoder is always compiled in, unlike libx264.
    params.codec = Some(VideoCodec::Mpeg4);
    params
}

/// Encode `frames` synthetic pictures into a fresh AVI file.
fn encode_clip(dir: &PathBuf, frames: usize) -> String {
    let path = dir.join("clip.avi").to_string_lossy().into_owned();
    let mut session = EncodeSession::open(&path, video_params(), None).expect("open encode");
    for i in 0..frames {
        let frame = gray_frame((16 + i * 7 % 220) as u8);
        session.write_video(&frame).expect("write frame");
    }
    session.close().expect("close encode");
    path
}

#[test]
fn round_trip_preserves_frame_count_and_length() {
    let dir = unique_temp_dir("round_trip");
    let frames = 25;
    let path = encode_clip(&dir, frames);

    let mut session = DecodeSession::open(&path, false).expect("open decode");
    assert_eq!(session.width().expect("width"), WIDTH);
    assert_eq!(session.height().expect("height"), HEIGHT);
    assert!(!session.has_audio());

    let mut decoded = 0usize;
    loop {
        match session.read().expect("read") {
            ReadOutcome::Frame(frame) => {
                assert_eq!(frame.kind, StreamKind::Video);
                assert_eq!(frame.len(), planar_420_size(WIDTH, HEIGHT));
                decoded += 1;
            }
            ReadOutcome::EndOfStream => break,
        }
    }
    assert_eq!(decoded, frames, "every encoded frame must decode back");
    session.close();
}

#[test]
fn video_timestamps_are_non_decreasing() {
    let dir = unique_temp_dir("pts_order");
    let path = encode_clip(&dir, 30);

    let mut session = DecodeSession::open(&path, false).expect("open decode");
    let mut last_pts: Option<i64> = None;
    loop {
        match session.read().expect("read") {
            ReadOutcome::Frame(frame) => {
                if let (Some(prev), Some(pts)) = (last_pts, frame.pts) {
                    assert!(pts >= prev, "pts went backwards: {prev} -> {pts}");
                }
                if frame.pts.is_some() {
                    last_pts = frame.pts;
                }
            }
            ReadOutcome::EndOfStream => break,
        }
    }
    assert!(last_pts.is_some(), "at least one frame must carry a pts");
}

#[test]
fn seek_then_read_produces_a_frame_without_error() {
    let dir = unique_temp_dir("seek");
    let path = encode_clip(&dir, 50);

    let mut session = DecodeSession::open(&path, false).expect("open decode");
    // Warm the decoder past the first GOP.
    for _ in 0..5 {
        session.read().expect("read before seek");
    }

    // One second in, in AV_TIME_BASE (microsecond) units.
    session.seek(1_000_000).expect("seek");
    match session.read().expect("first read after seek") {
        ReadOutcome::Frame(frame) => {
            assert_eq!(frame.kind, StreamKind::Video);
            assert_eq!(frame.len(), planar_420_size(WIDTH, HEIGHT));
        }
        ReadOutcome::EndOfStream => panic!("seek landed past the end of a 2s clip"),
    }
}

#[test]
fn open_garbage_container_fails_cleanly_and_repeatedly() {
    let dir = unique_temp_dir("garbage");
    let path = dir.join("not_media.mp4");
    fs::write(&path, b"this is not a container").expect("write garbage");
    let locator = path.to_string_lossy().into_owned();

    // Every failed open must unwind fully; leaking a descriptor per cycle
    // would surface as a different error long before the loop ends.
    for _ in 0..64 {
        match DecodeSession::open(&locator, true) {
            Err(SessionError::Open { locator: l, .. }) => assert_eq!(l, locator),
            other => panic!("expected Open error, got {other:?}"),
        }
    }
}

#[test]
fn write_video_rejects_mismatched_geometry() {
    let dir = unique_temp_dir("geometry");
    let path = dir.join("out.avi").to_string_lossy().into_owned();
    let mut session = EncodeSession::open(&path, video_params(), None).expect("open encode");

    let wrong = RawBuffer::video(160, 120, vec![0u8; planar_420_size(160, 120)], None);
    match session.write_video(&wrong) {
        Err(SessionError::InvalidArgument(msg)) => {
            assert!(msg.contains("160x120"), "message should name the geometry: {msg}");
        }
        other => panic!("expected InvalidArgument, got {other:?}"),
    }

    // The session is still usable after the rejected call.
    session.write_video(&gray_frame(80)).expect("valid write");
    session.close().expect("close");
}

#[test]
fn decode_close_is_idempotent_and_gates_operations() {
    let dir = unique_temp_dir("decode_close");
    let path = encode_clip(&dir, 5);

    let mut session = DecodeSession::open(&path, false).expect("open decode");
    session.close();
    session.close();

    assert!(matches!(session.read(), Err(SessionError::NotOpen)));
    assert!(matches!(session.seek(0), Err(SessionError::NotOpen)));
    assert!(matches!(session.width(), Err(SessionError::NotOpen)));
    assert!(!session.has_audio());
}

#[test]
fn encode_close_is_idempotent_and_gates_writes() {
    let dir = unique_temp_dir("encode_close");
    let path = dir.join("out.avi").to_string_lossy().into_owned();
    let mut session = EncodeSession::open(&path, video_params(), None).expect("open encode");
    session.write_video(&gray_frame(50)).expect("write");
    session.close().expect("first close");
    session.close().expect("second close is a no-op");

    assert!(matches!(
        session.write_video(&gray_frame(50)),
        Err(SessionError::NotOpen)
    ));
    assert!(matches!(session.video_time_base(), Err(SessionError::NotOpen)));
}

#[test]
fn audio_round_trip_through_mp2() {
    let dir = unique_temp_dir("audio");
    let path = dir.join("clip.avi").to_string_lossy().into_owned();

    let mut audio = AudioParams::new(44_100, 2);
    audio.codec = Some(AudioCodec::Mp2);

    let mut session =
        EncodeSession::open(&path, video_params(), Some(audio)).expect("open encode");
    let frame_size = session.audio_frame_size().expect("frame size") as usize;
    assert_eq!(session.channels().expect("channels"), 2);

    // Silence, s16 interleaved stereo.
    let block = RawBuffer::audio(vec![0u8; frame_size * 2 * 2], None);
    for i in 0..40u8 {
        session.write_video(&gray_frame(60 + i)).expect("write video");
        session.write_audio(&block).expect("write audio");
    }
    session.close().expect("close encode");

    let mut session = DecodeSession::open(&path, true).expect("open decode");
    assert!(session.has_audio());
    assert_eq!(session.sample_rate().expect("sample rate"), 44_100);
    assert_eq!(session.channels().expect("channels"), 2);

    let mut video_frames = 0usize;
    let mut audio_blocks = 0usize;
    loop {
        match session.read().expect("read") {
            ReadOutcome::Frame(frame) => match frame.kind {
                StreamKind::Video => video_frames += 1,
                StreamKind::Audio => {
                    assert!(!frame.is_empty());
                    audio_blocks += 1;
                }
            },
            ReadOutcome::EndOfStream => break,
        }
    }
    assert_eq!(video_frames, 40);
    assert!(audio_blocks > 0, "decoded audio must surface");
}

#[test]
fn write_audio_without_audio_stream_is_rejected() {
    let dir = unique_temp_dir("no_audio");
    let path = dir.join("out.avi").to_string_lossy().into_owned();
    let mut session = EncodeSession::open(&path, video_params(), None).expect("open encode");

    let block = RawBuffer::audio(vec![0u8; 4096], None);
    assert!(matches!(
        session.write_audio(&block),
        Err(SessionError::InvalidArgument(_))
    ));
    session.close().expect("close");
}
