//! Screen snapshots from the primary monitor using `xcap`.

use crate::events::ImageFrame;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, RgbaImage};
use tracing::debug;
use xcap::Monitor;

/// Longest side of a frame sent to the session.
pub const MAX_FRAME_SIDE: u32 = 1024;
const JPEG_QUALITY: u8 = 75;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("screen capture failed: {0}")]
    Capture(String),

    #[error("no monitors found")]
    NoMonitor,

    #[error("JPEG encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// Anything that can produce a still frame on demand. Called from the
/// blocking pool.
pub trait FrameSource: Send {
    fn capture(&mut self) -> Result<ImageFrame, CaptureError>;
}

/// Captures the primary monitor (or the first one if none is flagged
/// primary).
#[derive(Debug, Default)]
pub struct XcapScreen;

impl XcapScreen {
    pub fn new() -> Self {
        Self
    }

    fn primary_monitor() -> Result<Monitor, CaptureError> {
        let monitors = Monitor::all().map_err(capture_error)?;
        let index = monitors
            .iter()
            .position(|m| m.is_primary().unwrap_or(false))
            .unwrap_or(0);
        monitors.into_iter().nth(index).ok_or(CaptureError::NoMonitor)
    }
}

impl FrameSource for XcapScreen {
    fn capture(&mut self) -> Result<ImageFrame, CaptureError> {
        // Monitors are re-enumerated every time so hotplug is picked up.
        let monitor = Self::primary_monitor()?;
        let image = monitor.capture_image().map_err(capture_error)?;
        debug!("Captured {}x{} screen", image.width(), image.height());
        Ok(ImageFrame::jpeg(encode_jpeg(&image, MAX_FRAME_SIDE)?))
    }
}

// xcap's error type is not Send on every platform.
fn capture_error(e: xcap::XCapError) -> CaptureError {
    CaptureError::Capture(e.to_string())
}

/// Downscale to fit in `max_side` x `max_side` (keeping aspect ratio) and
/// encode as JPEG.
pub fn encode_jpeg(image: &RgbaImage, max_side: u32) -> Result<Vec<u8>, CaptureError> {
    let image = DynamicImage::ImageRgba8(image.clone());
    let image = if image.width() > max_side || image.height() > max_side {
        image.thumbnail(max_side, max_side)
    } else {
        image
    };
    let rgb = image.to_rgb8();

    let mut jpeg = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY);
    encoder.encode(
        rgb.as_raw(),
        rgb.width(),
        rgb.height(),
        image::ExtendedColorType::Rgb8,
    )?;
    Ok(jpeg)
}
