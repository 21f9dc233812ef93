//! Frame type and decoding.

use image::imageops::FilterType;
use image::RgbImage;
use std::time::Instant;

/// A decoded video frame at source resolution.
#[derive(Clone)]
pub struct Frame {
    /// RGB pixel data.
    pub image: RgbImage,
    /// Position in the stream, starting at 1.
    pub sequence: u64,
    /// When the frame was decoded; the clock for attendance cooldowns.
    pub timestamp: Instant,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u64) -> Self {
        Self {
            image,
            sequence,
            timestamp: Instant::now(),
        }
    }

    /// Decode an encoded image (JPEG, PNG, ...) into an RGB frame.
    pub fn decode(bytes: &[u8], sequence: u64) -> Result<Self, FrameError> {
        if bytes.is_empty() {
            return Err(FrameError::Empty);
        }
        let image = image::load_from_memory(bytes)?.to_rgb8();
        if image.width() == 0 || image.height() == 0 {
            return Err(FrameError::Empty);
        }
        Ok(Self::new(image, sequence))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.sequence)
            .field("width", &self.width())
            .field("height", &self.height())
            .finish()
    }
}

/// Shrink an image by `factor` (in (0, 1]) with bilinear filtering.
///
/// Dimensions are truncated like region coordinates, with a 1-pixel floor.
pub fn downscale(image: &RgbImage, factor: f32) -> RgbImage {
    if factor >= 1.0 {
        return image.clone();
    }
    let width = ((image.width() as f32 * factor) as u32).max(1);
    let height = ((image.height() as f32 * factor) as u32).max(1);
    image::imageops::resize(image, width, height, FilterType::Triangle)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("frame decode failed: {0}")]
    Decode(#[from] image::ImageError),
}
