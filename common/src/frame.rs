use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::{ImageReader, RgbImage};
use std::io::Cursor;

const CHANNELS: usize = 3;

/// A decoded camera frame: tightly packed RGB8 pixels plus capture time.
///
/// Frames are immutable once built; the capture loop owns one per iteration
/// and the change detector keeps a clone as its baseline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    pub captured_at_ms: i64,
}

impl Frame {
    /// Build a frame from raw RGB8 pixels. `pixels.len()` must equal
    /// `width * height * 3`.
    pub fn from_rgb(
        width: u32,
        height: u32,
        pixels: Vec<u8>,
        captured_at_ms: i64,
    ) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize * CHANNELS;
        if pixels.len() != expected {
            return Err(FrameError::SizeMismatch {
                expected,
                got: pixels.len(),
            });
        }
        Ok(Self {
            width,
            height,
            pixels,
            captured_at_ms,
        })
    }

    /// A frame of a single solid colour. Mostly useful for tests and
    /// placeholder sources.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3], captured_at_ms: i64) -> Self {
        let pixels = rgb
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * CHANNELS)
            .collect();
        Self {
            width,
            height,
            pixels,
            captured_at_ms,
        }
    }

    /// Decode a JPEG (or any format the `image` crate can sniff).
    pub fn from_jpeg(data: &[u8], captured_at_ms: i64) -> Result<Self, FrameError> {
        if data.is_empty() {
            return Err(FrameError::Empty);
        }
        let img = ImageReader::new(Cursor::new(data))
            .with_guessed_format()
            .map_err(|e| FrameError::Decode(e.to_string()))?
            .decode()
            .map_err(|e| FrameError::Decode(e.to_string()))?
            .to_rgb8();

        let (width, height) = img.dimensions();
        Ok(Self {
            width,
            height,
            pixels: img.into_raw(),
            captured_at_ms,
        })
    }

    /// Encode to baseline JPEG at the given quality (1..=100).
    pub fn to_jpeg(&self, quality: u8) -> Result<Vec<u8>, FrameError> {
        if self.is_empty() {
            return Err(FrameError::Empty);
        }
        let img = RgbImage::from_raw(self.width, self.height, self.pixels.clone()).ok_or(
            FrameError::SizeMismatch {
                expected: self.pixel_count() * CHANNELS,
                got: self.pixels.len(),
            },
        )?;

        let mut buf = Vec::new();
        JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100))
            .encode_image(&img)
            .map_err(|e| FrameError::Encode(e.to_string()))?;
        Ok(buf)
    }

    /// Capture time as a UTC datetime, falling back to now if the stored
    /// timestamp is out of range.
    pub fn captured_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.captured_at_ms).unwrap_or_else(Utc::now)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn is_empty(&self) -> bool {
        self.pixel_count() == 0
    }

    /// Iterate over pixels as `[r, g, b]` slices in row-major order.
    pub fn pixels(&self) -> impl Iterator<Item = &[u8]> {
        self.pixels.chunks_exact(CHANNELS)
    }

    /// Return a copy with the pixel at `(x, y)` replaced. Out-of-bounds
    /// coordinates leave the frame unchanged.
    pub fn with_pixel(&self, x: u32, y: u32, rgb: [u8; 3]) -> Self {
        let mut next = self.clone();
        if x < self.width && y < self.height {
            let offset = (y as usize * self.width as usize + x as usize) * CHANNELS;
            next.pixels[offset..offset + CHANNELS].copy_from_slice(&rgb);
        }
        next
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame is empty")]
    Empty,
    #[error("pixel buffer has {got} bytes, expected {expected}")]
    SizeMismatch { expected: usize, got: usize },
    #[error("failed to decode image: {0}")]
    Decode(String),
    #[error("failed to encode JPEG: {0}")]
    Encode(String),
}
