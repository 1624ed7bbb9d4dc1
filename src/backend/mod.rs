// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash with RAII ownership of every handle

pub mod buffer;
pub mod device;
pub mod instance;
pub mod pipeline;
pub mod shader;
pub mod sync;

pub use buffer::{Buffer, CpuBuffer};
pub use device::{create_devices, BufferHandle, Device, DeviceInfo};
pub use instance::Instance;
pub use pipeline::ComputePipeline;
