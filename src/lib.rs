//! Vulkan compute helpers
//!
//! - [`backend`]: RAII wrappers for instance, devices, buffers and compute pipelines
//! - [`app::App`]: instance plus every usable device
//! - [`filter`]: 7x7 Gaussian filter on the GPU with a host reference
//! - `python` (feature): extension module exposing `App`, `Buffer` and `CpuBuffer`

pub mod app;
pub mod backend;
pub mod config;
pub mod error;
pub mod filter;
pub mod gray_image;
pub mod logging;
#[cfg(feature = "python")]
mod python;

pub use app::App;
pub use backend::{Buffer, CpuBuffer, Device, Instance};
pub use config::Config;
pub use error::{ComputeError, Result};
pub use gray_image::GrayImage;
