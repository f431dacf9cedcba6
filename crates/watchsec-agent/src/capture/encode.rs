//! Downscale and JPEG-encode captured images

use bytes::Bytes;
use image::buffer::ConvertBuffer;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{RgbImage, RgbaImage};

use watchsec_core::config::StreamConfig;

use crate::error::CaptureError;

/// Turns raw captures into stream payloads
#[derive(Debug, Clone)]
pub struct FrameEncoder {
    scale: f32,
    max_width: u32,
    quality: u8,
}

impl FrameEncoder {
    pub fn new(scale: f32, max_width: u32, quality: u8) -> Self {
        Self {
            scale: scale.clamp(0.01, 1.0),
            max_width: max_width.max(1),
            quality: quality.clamp(1, 100),
        }
    }

    pub fn from_config(config: &StreamConfig) -> Self {
        Self::new(config.scale, config.max_width, config.jpeg_quality)
    }

    /// Output size for a capture of the given size.
    ///
    /// The scale factor applies first, then the width cap; the aspect ratio
    /// is kept and neither side drops below one pixel.
    pub fn target_size(&self, width: u32, height: u32) -> (u32, u32) {
        let mut w = (width as f64 * self.scale as f64).round();
        let mut h = (height as f64 * self.scale as f64).round();

        let max = self.max_width as f64;
        if w > max {
            h = (h * max / w).round();
            w = max;
        }
        ((w as u32).max(1), (h as u32).max(1))
    }

    /// Encode one capture
    pub fn encode(&self, image: &RgbaImage) -> Result<Bytes, CaptureError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(CaptureError::EmptyImage);
        }

        let (w, h) = self.target_size(width, height);
        let rgb: RgbImage = if (w, h) == (width, height) {
            image.convert()
        } else {
            imageops::resize(image, w, h, FilterType::Triangle).convert()
        };

        let mut out = Vec::with_capacity((w * h / 4) as usize);
        JpegEncoder::new_with_quality(&mut out, self.quality).encode_image(&rgb)?;
        Ok(Bytes::from(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn test_target_size_caps_width() {
        let encoder = FrameEncoder::new(1.0, 1280, 70);
        assert_eq!(encoder.target_size(1920, 1080), (1280, 720));
        assert_eq!(encoder.target_size(800, 600), (800, 600));
    }

    #[test]
    fn test_target_size_scales_then_caps() {
        let encoder = FrameEncoder::new(0.6, 800, 70);
        assert_eq!(encoder.target_size(1000, 500), (600, 300));
        assert_eq!(encoder.target_size(2560, 1440), (800, 450));
    }

    #[test]
    fn test_target_size_never_zero() {
        let encoder = FrameEncoder::new(0.1, 1280, 70);
        assert_eq!(encoder.target_size(3, 2), (1, 1));
    }

    #[test]
    fn test_encode_produces_jpeg_at_target_size() {
        let encoder = FrameEncoder::new(0.5, 1280, 80);
        let image = RgbaImage::from_pixel(64, 32, Rgba([200, 10, 10, 255]));

        let jpeg = encoder.encode(&image).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 16));
    }

    #[test]
    fn test_encode_empty_image() {
        let encoder = FrameEncoder::new(1.0, 1280, 70);
        let image = RgbaImage::new(0, 0);
        assert!(matches!(
            encoder.encode(&image),
            Err(CaptureError::EmptyImage)
        ));
    }
}
