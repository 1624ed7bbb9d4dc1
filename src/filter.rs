//! 7x7 Gaussian filter over grayscale images
//!
//! The GPU path runs `shaders/gaussian_filter.comp`: the destination buffer is
//! binding 0, the source binding 1, and the extent plus sigma travel as push
//! constants. [`gaussian_blur_cpu`] computes the same result on the host.

use crate::backend::shader::read_spirv;
use crate::backend::{Buffer, ComputePipeline, CpuBuffer, Device};
use crate::config::FilterConfig;
use crate::error::{ComputeError, Result};
use crate::gray_image::GrayImage;
use bytemuck::{Pod, Zeroable};
use glam::UVec2;
use parking_lot::Mutex;
use std::sync::Arc;

/// Workgroup size in the compute shader, both axes
pub const WORKGROUP_SIZE: u32 = 32;

/// Kernel is (2 * KERNEL_RADIUS + 1) squared
pub const KERNEL_RADIUS: i32 = 3;

const KERNEL_SIZE: usize = (2 * KERNEL_RADIUS + 1) as usize;

/// Must match the push constant block in the shader
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct FilterPushConstants {
    pub w: u32,
    pub h: u32,
    pub sigma: f32,
}

/// Workgroups needed to cover `extent`
pub fn group_count(extent: UVec2) -> [u32; 3] {
    let groups = (extent + UVec2::splat(WORKGROUP_SIZE - 1)) / WORKGROUP_SIZE;
    [groups.x, groups.y, 1]
}

pub fn validate_sigma(sigma: f32) -> Result<f32> {
    if sigma.is_finite() && sigma > 0.0 {
        Ok(sigma)
    } else {
        Err(ComputeError::InvalidSigma(sigma))
    }
}

/// Normalized weights, indexed `[dy + r][dx + r]`
pub fn gaussian_kernel(sigma: f32) -> Result<[[f32; KERNEL_SIZE]; KERNEL_SIZE]> {
    let sigma = validate_sigma(sigma)?;
    let mut kernel = [[0.0f32; KERNEL_SIZE]; KERNEL_SIZE];
    let mut total = 0.0;
    for (row, dy) in kernel.iter_mut().zip(-KERNEL_RADIUS..=KERNEL_RADIUS) {
        for (weight, dx) in row.iter_mut().zip(-KERNEL_RADIUS..=KERNEL_RADIUS) {
            let d2 = (dx * dx + dy * dy) as f32;
            *weight = (-d2 / (2.0 * sigma * sigma)).exp();
            total += *weight;
        }
    }
    for weight in kernel.iter_mut().flatten() {
        *weight /= total;
    }
    Ok(kernel)
}

/// Host reference: same kernel, borders clamped, rounded to nearest
pub fn gaussian_blur_cpu(image: &GrayImage, sigma: f32) -> Result<GrayImage> {
    let kernel = gaussian_kernel(sigma)?;
    let (w, h) = (image.width() as i64, image.height() as i64);
    let src = image.pixels();

    let mut out = Vec::with_capacity(src.len());
    for y in 0..h {
        for x in 0..w {
            let mut sum = 0.0f32;
            for (row, dy) in kernel.iter().zip(-KERNEL_RADIUS..=KERNEL_RADIUS) {
                let sy = (y + i64::from(dy)).clamp(0, h - 1);
                for (weight, dx) in row.iter().zip(-KERNEL_RADIUS..=KERNEL_RADIUS) {
                    let sx = (x + i64::from(dx)).clamp(0, w - 1);
                    sum += weight * f32::from(src[(sy * w + sx) as usize]);
                }
            }
            out.push((sum + 0.5).min(255.0) as u8);
        }
    }

    GrayImage::from_raw(image.width(), image.height(), out)
}

/// Largest per-pixel difference, `None` if the extents differ
pub fn max_abs_diff(a: &GrayImage, b: &GrayImage) -> Option<u8> {
    if a.extent() != b.extent() {
        return None;
    }
    Some(
        a.pixels()
            .iter()
            .zip(b.pixels())
            .map(|(x, y)| x.abs_diff(*y))
            .max()
            .unwrap_or(0),
    )
}

/// Shareable across threads; concurrent `apply` calls run one at a time
pub struct GaussianFilter {
    // Binding and dispatch share one descriptor set
    pipeline: Mutex<ComputePipeline>,
    device: Arc<Device>,
    sigma: f32,
}

impl GaussianFilter {
    pub fn new(device: &Arc<Device>, config: &FilterConfig) -> Result<Self> {
        let sigma = validate_sigma(config.sigma)?;
        check_workgroup_limits(device)?;

        let spirv = read_spirv(&config.shader_path)?;
        let pipeline = ComputePipeline::new(
            device,
            &spirv,
            &config.entry_point,
            2,
            std::mem::size_of::<FilterPushConstants>() as u32,
        )?;
        log::info!("Gaussian filter ready on {} (sigma {})", device.name(), sigma);

        Ok(Self {
            pipeline: Mutex::new(pipeline),
            device: Arc::clone(device),
            sigma,
        })
    }

    pub fn sigma(&self) -> f32 {
        self.sigma
    }

    pub fn set_sigma(&mut self, sigma: f32) -> Result<()> {
        self.sigma = validate_sigma(sigma)?;
        Ok(())
    }

    pub fn apply(&self, image: &GrayImage) -> Result<GrayImage> {
        if image.pixels().is_empty() {
            return Ok(image.clone());
        }

        let src = CpuBuffer::from_slice(image.pixels()).to_device_buffer(&self.device)?;
        log::debug!("Upload source image to GPU");
        let dst = Buffer::with_size(&self.device, src.size_byte())?;

        let push_constants = FilterPushConstants {
            w: image.width(),
            h: image.height(),
            sigma: self.sigma,
        };
        {
            let mut pipeline = self.pipeline.lock();
            pipeline.bind_buffers(&[&dst, &src])?;
            pipeline.dispatch(group_count(image.extent()), bytemuck::bytes_of(&push_constants))?;
        }
        log::debug!("Computation is finished");

        let pixels = dst.to_cpu_buffer()?.into_bytes();
        GrayImage::from_raw(image.width(), image.height(), pixels)
    }
}

fn check_workgroup_limits(device: &Device) -> Result<()> {
    let limits = &device.properties().limits;
    let fits = limits.max_compute_work_group_size[0] >= WORKGROUP_SIZE
        && limits.max_compute_work_group_size[1] >= WORKGROUP_SIZE
        && limits.max_compute_work_group_invocations >= WORKGROUP_SIZE * WORKGROUP_SIZE;
    if fits {
        Ok(())
    } else {
        Err(ComputeError::MissingFeature {
            name: device.name().to_string(),
            feature: "32x32 compute workgroups",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_constants_are_tightly_packed() {
        assert_eq!(std::mem::size_of::<FilterPushConstants>(), 12);
        let bytes = bytemuck::bytes_of(&FilterPushConstants {
            w: 2,
            h: 3,
            sigma: 1.0,
        });
        assert_eq!(&bytes[..4], &2u32.to_ne_bytes());
        assert_eq!(&bytes[8..], &1.0f32.to_ne_bytes());
    }

    #[test]
    fn group_count_rounds_up() {
        assert_eq!(group_count(UVec2::new(1, 1)), [1, 1, 1]);
        assert_eq!(group_count(UVec2::new(32, 32)), [1, 1, 1]);
        assert_eq!(group_count(UVec2::new(33, 64)), [2, 2, 1]);
        assert_eq!(group_count(UVec2::new(640, 481)), [20, 16, 1]);
    }

    #[test]
    fn kernel_is_normalized_and_symmetric() {
        let kernel = gaussian_kernel(1.5).unwrap();
        let total: f32 = kernel.iter().flatten().sum();
        assert!((total - 1.0).abs() < 1e-5);

        let last = KERNEL_SIZE - 1;
        for i in 0..KERNEL_SIZE {
            for j in 0..KERNEL_SIZE {
                assert_eq!(kernel[i][j], kernel[j][i]);
                assert_eq!(kernel[i][j], kernel[last - i][last - j]);
                assert!(kernel[i][j] <= kernel[3][3]);
            }
        }
    }

    #[test]
    fn large_sigma_approaches_box_filter() {
        let kernel = gaussian_kernel(1000.0).unwrap();
        for weight in kernel.iter().flatten() {
            assert!((weight - 1.0 / 49.0).abs() < 1e-4);
        }
    }

    #[test]
    fn non_positive_sigma_is_rejected() {
        assert!(matches!(gaussian_kernel(0.0), Err(ComputeError::InvalidSigma(_))));
        assert!(matches!(validate_sigma(-1.0), Err(ComputeError::InvalidSigma(_))));
        assert!(validate_sigma(f32::NAN).is_err());
    }

    #[test]
    fn constant_image_is_unchanged() {
        let image = GrayImage::from_raw(9, 5, vec![137; 45]).unwrap();
        let blurred = gaussian_blur_cpu(&image, 10.0).unwrap();
        assert_eq!(blurred, image);
    }

    #[test]
    fn impulse_spreads_symmetrically() {
        let mut pixels = vec![0u8; 11 * 11];
        pixels[5 * 11 + 5] = 255;
        let image = GrayImage::from_raw(11, 11, pixels).unwrap();
        let blurred = gaussian_blur_cpu(&image, 1.0).unwrap();

        assert!(blurred.get(5, 5) < 255);
        assert!(blurred.get(5, 5) > blurred.get(4, 5));
        assert_eq!(blurred.get(4, 5), blurred.get(6, 5));
        assert_eq!(blurred.get(5, 4), blurred.get(5, 6));
        // Outside the 7x7 footprint nothing moves
        assert_eq!(blurred.get(0, 0), 0);
        assert_eq!(blurred.get(5, 1), 0);
    }

    #[test]
    fn borders_are_clamped() {
        // Left half bright, right half dark: the bright edge column only sees
        // bright pixels to its left thanks to clamping
        let pixels: Vec<u8> = (0..8 * 8)
            .map(|i| if i % 8 < 4 { 200 } else { 0 })
            .collect();
        let image = GrayImage::from_raw(8, 8, pixels).unwrap();
        let blurred = gaussian_blur_cpu(&image, 2.0).unwrap();
        assert_eq!(blurred.get(0, 0), 200);
        assert_eq!(blurred.get(7, 7), 0);
        assert!(blurred.get(3, 4) < 200 && blurred.get(4, 4) > 0);
    }

    #[test]
    fn diff_requires_same_extent() {
        let a = GrayImage::from_raw(2, 1, vec![10, 20]).unwrap();
        let b = GrayImage::from_raw(2, 1, vec![13, 20]).unwrap();
        let c = GrayImage::from_raw(1, 2, vec![10, 20]).unwrap();
        assert_eq!(max_abs_diff(&a, &b), Some(3));
        assert_eq!(max_abs_diff(&a, &c), None);
    }

    #[test]
    fn filter_can_be_shared_between_threads() {
        fn assert_shareable<T: Send + Sync>() {}
        assert_shareable::<GaussianFilter>();
    }
}
