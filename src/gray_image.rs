// Single-channel 8-bit images read from and written to PNG

use crate::error::{ComputeError, Result};
use glam::UVec2;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrayImage {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl GrayImage {
    pub fn from_raw(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize;
        if pixels.len() != expected {
            return Err(ComputeError::SizeMismatch {
                expected,
                actual: pixels.len(),
            });
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Decode an image and reduce it to one channel
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let decoded = image::open(path)?;
        let (width, height) = (decoded.width(), decoded.height());
        let channels = decoded.color().channel_count();
        log::debug!(
            "Input image is loaded. ({:?}, {}x{}, {} channels)",
            path,
            width,
            height,
            channels
        );

        let interleaved = match channels {
            1 => decoded.into_luma8().into_raw(),
            2 => decoded.into_luma_alpha8().into_raw(),
            3 => decoded.into_rgb8().into_raw(),
            _ => decoded.into_rgba8().into_raw(),
        };
        let pixels = to_grayscale(&interleaved, width, height, usize::from(channels).min(4))?;
        Self::from_raw(width, height, pixels)
    }

    /// Write as RGBA with R = G = B = value and opaque alpha
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let rgba: Vec<u8> = self
            .pixels
            .iter()
            .flat_map(|&v| [v, v, v, u8::MAX])
            .collect();
        let buffer = image::RgbaImage::from_raw(self.width, self.height, rgba)
            .ok_or_else(|| ComputeError::BrokenImage("pixel count does not match extent".into()))?;
        buffer.save(path.as_ref())?;
        log::debug!("Saved {}x{} image to {:?}", self.width, self.height, path.as_ref());
        Ok(())
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn extent(&self) -> UVec2 {
        UVec2::new(self.width, self.height)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn into_pixels(self) -> Vec<u8> {
        self.pixels
    }

    pub fn get(&self, x: u32, y: u32) -> u8 {
        self.pixels[y as usize * self.width as usize + x as usize]
    }
}

/// Convert interleaved pixels with `channels` channels to luminance
///
/// One channel is passed through, two channels is rejected, otherwise
/// `0.3 R + 0.59 G + 0.11 B` truncated toward zero.
pub fn to_grayscale(data: &[u8], width: u32, height: u32, channels: usize) -> Result<Vec<u8>> {
    let count = width as usize * height as usize;
    if data.len() != count * channels {
        return Err(ComputeError::SizeMismatch {
            expected: count * channels,
            actual: data.len(),
        });
    }
    match channels {
        1 => Ok(data.to_vec()),
        2 => Err(ComputeError::BrokenImage(
            "two-channel images are not supported".into(),
        )),
        0 => Err(ComputeError::BrokenImage("image has no channels".into())),
        _ => Ok(data
            .chunks_exact(channels)
            .map(|px| {
                let v = 0.3 * f32::from(px[0]) + 0.59 * f32::from(px[1]) + 0.11 * f32::from(px[2]);
                v as u8
            })
            .collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_channel_passes_through() {
        let data = vec![0, 10, 20, 255];
        assert_eq!(to_grayscale(&data, 2, 2, 1).unwrap(), data);
    }

    #[test]
    fn rgb_uses_luma_weights() {
        let data = [255, 0, 0, 0, 255, 0, 0, 0, 255, 255, 255, 255];
        let gray = to_grayscale(&data, 4, 1, 3).unwrap();
        // 0.3*255 = 76.5, 0.59*255 = 150.45, 0.11*255 = 28.05
        assert_eq!(gray[..3], [76, 150, 28]);
        assert!(gray[3] >= 254);
    }

    #[test]
    fn alpha_is_ignored() {
        let data = [100, 100, 100, 0, 100, 100, 100, 255];
        let gray = to_grayscale(&data, 2, 1, 4).unwrap();
        assert_eq!(gray[0], gray[1]);
    }

    #[test]
    fn two_channels_are_rejected() {
        assert!(matches!(
            to_grayscale(&[0; 8], 2, 2, 2),
            Err(ComputeError::BrokenImage(_))
        ));
    }

    #[test]
    fn from_raw_checks_extent() {
        assert!(GrayImage::from_raw(2, 2, vec![0; 4]).is_ok());
        assert!(matches!(
            GrayImage::from_raw(2, 2, vec![0; 3]),
            Err(ComputeError::SizeMismatch {
                expected: 4,
                actual: 3
            })
        ));
    }

    #[test]
    fn saved_image_loads_back_as_gray() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gray.png");
        let image = GrayImage::from_raw(3, 2, vec![0, 50, 100, 150, 200, 250]).unwrap();
        image.save(&path).unwrap();

        // Saved as RGBA with equal channels; weights sum to 1 so values survive
        // up to float truncation
        let loaded = GrayImage::load(&path).unwrap();
        assert_eq!(loaded.extent(), UVec2::new(3, 2));
        for (a, b) in image.pixels().iter().zip(loaded.pixels()) {
            assert!(a.abs_diff(*b) <= 1, "{} vs {}", a, b);
        }
    }
}
