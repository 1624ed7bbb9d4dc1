// Error type shared by the Vulkan wrapper, the image helpers and the filter

use ash::vk;

pub type Result<T, E = ComputeError> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum ComputeError {
    #[error("Vulkan: {0}")]
    Vulkan(#[from] vk::Result),

    #[error("Failed to load Vulkan library: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("Allocation: {0}")]
    Allocation(#[from] gpu_allocator::AllocationError),

    #[error("Layer {0} not supported")]
    LayerNotSupported(String),

    #[error("Instance extension {0} not supported")]
    ExtensionNotSupported(String),

    #[error("No Vulkan device satisfies the requirements")]
    NoDevice,

    #[error("Device {name} has no queue family with compute support")]
    NoComputeQueue { name: String },

    #[error("Device {name} does not support {feature}")]
    MissingFeature { name: String, feature: &'static str },

    #[error("Invalid device id {id} ({count} devices available)")]
    InvalidDevice { id: usize, count: usize },

    #[error("Device was dropped while a buffer still referenced it")]
    DeviceLost,

    #[error("Buffer is already allocated")]
    AlreadyAllocated,

    #[error("Buffer is not allocated")]
    NotAllocated,

    #[error("Buffer size must be greater than zero")]
    EmptyBuffer,

    #[error("Unknown buffer handle {0}")]
    UnknownHandle(u32),

    #[error("Size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("Expected {expected} buffers to bind, got {actual}")]
    BindingCount { expected: u32, actual: usize },

    #[error("Buffer at binding {binding} was not allocated on {device}")]
    ForeignBuffer { binding: usize, device: String },

    #[error("Invalid SPIR-V: {0}")]
    InvalidSpirv(String),

    #[error("Timed out after {0} ns waiting for the GPU")]
    Timeout(u64),

    #[error("Image is broken: {0}")]
    BrokenImage(String),

    #[error("Sigma must be positive, got {0}")]
    InvalidSigma(f32),

    #[error("Invalid name: {0}")]
    InvalidName(#[from] std::ffi::NulError),

    #[error("Image: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
}
