//! Pixel format conversion via libswscale.
//!
//! A [`Converter`] is keyed by `(src_format, dst_format, width, height)`.
//! Construction cost is proportional to the resolution, so sessions build
//! one per stream and reuse it for every frame.  Stream geometry is not
//! expected to change mid-session; the owning session checks each frame
//! against the key and treats a mismatch as a fatal inconsistency.

use std::ptr;

use ffmpeg_sys_next::{
    AVFrame, AVPixelFormat, SWS_FAST_BILINEAR, SwsContext, sws_freeContext, sws_getContext,
    sws_scale,
};

/// Stateful picture converter between a fixed pair of pixel layouts.
#[derive(Debug)]
pub(crate) struct Converter {
    ctx: *mut SwsContext,
    src_format: AVPixelFormat,
    width: u32,
    height: u32,
}

// SAFETY: the context is exclusively owned by one session and never touched
// from more than one thread at a time.
unsafe impl Send for Converter {}

impl Converter {
    /// Build a converter from `src_format` to `dst_format` at a fixed
    /// resolution.
    pub fn new(
        src_format: AVPixelFormat,
        dst_format: AVPixelFormat,
        width: u32,
        height: u32,
    ) -> Result<Self, String> {
        let ctx = unsafe {
            sws_getContext(
                width as i32,
                height as i32,
                src_format,
                width as i32,
                height as i32,
                dst_format,
                SWS_FAST_BILINEAR,
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null(),
            )
        };
        if ctx.is_null() {
            return Err(format!(
                "sws_getContext failed for {src_format:?} -> {dst_format:?} at {width}x{height}"
            ));
        }
        Ok(Self {
            ctx,
            src_format,
            width,
            height,
        })
    }

    /// Whether this converter was built for the given source geometry.
    pub fn matches(&self, src_format: AVPixelFormat, width: u32, height: u32) -> bool {
        self.matches_raw(src_format as i32, width, height)
    }

    /// [`Converter::matches`] for a raw `AVFrame::format` integer.
    pub fn matches_raw(&self, src_format: i32, width: u32, height: u32) -> bool {
        self.src_format as i32 == src_format && self.width == width && self.height == height
    }

    /// Convert a decoded picture into tightly packed I420 planes.
    ///
    /// `dst` must be exactly `width * height * 3 / 2` bytes.
    pub fn planar_from_frame(&mut self, src: *const AVFrame, dst: &mut [u8]) -> Result<(), String> {
        let (w, h) = (self.width as usize, self.height as usize);
        debug_assert_eq!(dst.len(), w * h * 3 / 2);

        let y = dst.as_mut_ptr();
        // SAFETY: plane offsets stay inside `dst`, whose length is w*h*3/2.
        let u = unsafe { y.add(w * h) };
        let v = unsafe { u.add(w * h / 4) };
        let dst_data: [*mut u8; 4] = [y, u, v, ptr::null_mut()];
        let dst_stride: [i32; 4] = [w as i32, (w / 2) as i32, (w / 2) as i32, 0];

        // SAFETY: src is a fully decoded frame matching the converter key;
        // the destination pointers cover one packed I420 picture.
        let ret = unsafe {
            sws_scale(
                self.ctx,
                (*src).data.as_ptr() as *const *const u8,
                (*src).linesize.as_ptr(),
                0,
                self.height as i32,
                dst_data.as_ptr(),
                dst_stride.as_ptr(),
            )
        };
        if ret < 0 {
            return Err(format!("sws_scale failed with status {ret}"));
        }
        Ok(())
    }

    /// Convert tightly packed I420 planes into a writable frame in the
    /// converter's destination format.
    ///
    /// `src` must be exactly `width * height * 3 / 2` bytes and `dst` must
    /// already own writable buffers at the converter's resolution.
    pub fn frame_from_planar(&mut self, src: &[u8], dst: *mut AVFrame) -> Result<(), String> {
        let (w, h) = (self.width as usize, self.height as usize);
        debug_assert_eq!(src.len(), w * h * 3 / 2);

        let y = src.as_ptr();
        // SAFETY: plane offsets stay inside `src`, whose length is w*h*3/2.
        let u = unsafe { y.add(w * h) };
        let v = unsafe { u.add(w * h / 4) };
        let src_data: [*const u8; 4] = [y, u, v, ptr::null()];
        let src_stride: [i32; 4] = [w as i32, (w / 2) as i32, (w / 2) as i32, 0];

        // SAFETY: the destination frame owns writable plane buffers at the
        // converter's resolution (allocated once at session open).
        let ret = unsafe {
            sws_scale(
                self.ctx,
                src_data.as_ptr(),
                src_stride.as_ptr(),
                0,
                self.height as i32,
                (*dst).data.as_ptr(),
                (*dst).linesize.as_ptr(),
            )
        };
        if ret < 0 {
            return Err(format!("sws_scale failed with status {ret}"));
        }
        Ok(())
    }
}

impl Drop for Converter {
    fn drop(&mut self) {
        // SAFETY: ctx is owned by this converter and freed exactly once.
        unsafe { sws_freeContext(self.ctx) };
        tracing::trace!(
            width = self.width,
            height = self.height,
            "Conversion context released"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converter_key_matching() {
        crate::ffi::init();
        let conv = Converter::new(
            AVPixelFormat::AV_PIX_FMT_YUV420P,
            AVPixelFormat::AV_PIX_FMT_YUV420P,
            320,
            240,
        )
        .expect("build converter");

        assert!(conv.matches(AVPixelFormat::AV_PIX_FMT_YUV420P, 320, 240));
        assert!(!conv.matches(AVPixelFormat::AV_PIX_FMT_YUV420P, 640, 240));
        assert!(!conv.matches(AVPixelFormat::AV_PIX_FMT_NV12, 320, 240));
    }
}
