// Device-resident and host-resident buffers
//
// A `Buffer` owns a handle into its device's registry and only holds the
// device weakly. When the device goes away first it frees the memory itself.

use super::device::{BufferHandle, Device};
use crate::error::{ComputeError, Result};
use ash::vk;
use bytemuck::Pod;
use gpu_allocator::MemoryLocation;
use std::sync::{Arc, Weak};

/// Usage for buffers that compute shaders read and write
pub const STORAGE_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::STORAGE_BUFFER.as_raw()
        | vk::BufferUsageFlags::TRANSFER_SRC.as_raw()
        | vk::BufferUsageFlags::TRANSFER_DST.as_raw(),
);

/// GPU memory region allocated on one device
#[derive(Debug, Default)]
pub struct Buffer {
    handle: Option<BufferHandle>,
    vk_buffer: vk::Buffer,
    device: Weak<Device>,
    size_byte: u64,
}

impl Buffer {
    /// Unallocated buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate `size_byte` bytes of device-local memory on `device`
    pub fn allocate(&mut self, device: &Arc<Device>, size_byte: u64) -> Result<()> {
        if self.handle.is_some() {
            return Err(ComputeError::AlreadyAllocated);
        }
        let (handle, vk_buffer) =
            device.create_vk_buffer(size_byte, STORAGE_USAGE, MemoryLocation::GpuOnly)?;
        self.handle = Some(handle);
        self.vk_buffer = vk_buffer;
        self.device = Arc::downgrade(device);
        self.size_byte = size_byte;
        Ok(())
    }

    pub fn with_size(device: &Arc<Device>, size_byte: u64) -> Result<Self> {
        let mut buffer = Self::new();
        buffer.allocate(device, size_byte)?;
        Ok(buffer)
    }

    pub fn is_allocated(&self) -> bool {
        self.handle.is_some()
    }

    pub fn handle(&self) -> Option<BufferHandle> {
        self.handle
    }

    pub fn size_byte(&self) -> u64 {
        self.size_byte
    }

    pub fn raw(&self) -> vk::Buffer {
        self.vk_buffer
    }

    pub fn device(&self) -> Result<Arc<Device>> {
        if self.handle.is_none() {
            return Err(ComputeError::NotAllocated);
        }
        self.device.upgrade().ok_or(ComputeError::DeviceLost)
    }

    /// Detach the handle without freeing it
    ///
    /// The caller is responsible for returning the handle to the device.
    pub fn release(&mut self) -> Option<BufferHandle> {
        let handle = self.handle.take();
        self.vk_buffer = vk::Buffer::null();
        self.size_byte = 0;
        handle
    }

    pub fn upload(&self, data: &CpuBuffer) -> Result<()> {
        let device = self.device()?;
        let handle = self.handle.ok_or(ComputeError::NotAllocated)?;
        if data.len() as u64 != self.size_byte {
            return Err(ComputeError::SizeMismatch {
                expected: self.size_byte as usize,
                actual: data.len(),
            });
        }
        device.write_buffer(handle, data.as_bytes())
    }

    pub fn to_cpu_buffer(&self) -> Result<CpuBuffer> {
        let device = self.device()?;
        let handle = self.handle.ok_or(ComputeError::NotAllocated)?;
        Ok(CpuBuffer {
            data: device.read_buffer(handle)?,
        })
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let device = self.device.upgrade();
        if let Some(handle) = self.release() {
            if let Some(device) = device {
                device.return_buffer(handle);
            }
        }
        debug_assert_eq!(self.size_byte, 0);
    }
}

/// Host memory block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuBuffer {
    data: Vec<u8>,
}

impl CpuBuffer {
    /// Zero-filled buffer
    pub fn new(size_byte: usize) -> Self {
        Self {
            data: vec![0; size_byte],
        }
    }

    pub fn from_slice<T: Pod>(values: &[T]) -> Self {
        Self {
            data: bytemuck::cast_slice(values).to_vec(),
        }
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Overwrite the whole content; byte lengths must match
    pub fn copy_from_slice<T: Pod>(&mut self, values: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(values);
        if bytes.len() != self.data.len() {
            return Err(ComputeError::SizeMismatch {
                expected: self.data.len(),
                actual: bytes.len(),
            });
        }
        self.data.copy_from_slice(bytes);
        Ok(())
    }

    pub fn to_vec<T: Pod>(&self) -> Result<Vec<T>> {
        let size = std::mem::size_of::<T>();
        if size == 0 || self.data.len() % size != 0 {
            return Err(ComputeError::SizeMismatch {
                expected: self.data.len().next_multiple_of(size.max(1)),
                actual: self.data.len(),
            });
        }
        // Vec<u8> gives no alignment guarantee for T
        Ok(bytemuck::pod_collect_to_vec(&self.data))
    }

    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        self.to_vec()
    }

    pub fn to_device_buffer(&self, device: &Arc<Device>) -> Result<Buffer> {
        let buffer = Buffer::with_size(device, self.data.len() as u64)?;
        buffer.upload(self)?;
        Ok(buffer)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unallocated_buffer_is_empty() {
        let mut buffer = Buffer::new();
        assert!(!buffer.is_allocated());
        assert_eq!(buffer.size_byte(), 0);
        assert_eq!(buffer.release(), None);
        assert!(matches!(buffer.device(), Err(ComputeError::NotAllocated)));
        assert!(matches!(
            buffer.to_cpu_buffer(),
            Err(ComputeError::NotAllocated)
        ));
    }

    #[test]
    fn cpu_buffer_starts_zeroed() {
        let buffer = CpuBuffer::new(16);
        assert_eq!(buffer.len(), 16);
        assert!(buffer.as_bytes().iter().all(|&b| b == 0));
        assert!(CpuBuffer::new(0).is_empty());
    }

    #[test]
    fn cpu_buffer_holds_f32_values() {
        let values: Vec<f32> = (0..25).map(|i| i as f32).collect();
        let buffer = CpuBuffer::from_slice(&values);
        assert_eq!(buffer.len(), 100);
        assert_eq!(buffer.to_f32_vec().unwrap(), values);
    }

    #[test]
    fn copy_from_slice_requires_matching_length() {
        let mut buffer = CpuBuffer::new(8);
        buffer.copy_from_slice(&[1.5f32, -2.0]).unwrap();
        assert_eq!(buffer.to_vec::<f32>().unwrap(), vec![1.5, -2.0]);

        let err = buffer.copy_from_slice(&[1.0f32]).unwrap_err();
        assert!(matches!(
            err,
            ComputeError::SizeMismatch {
                expected: 8,
                actual: 4
            }
        ));
    }

    #[test]
    fn to_vec_rejects_partial_elements() {
        let buffer = CpuBuffer::from_bytes(vec![0; 6]);
        assert!(buffer.to_vec::<u16>().is_ok());
        assert!(matches!(
            buffer.to_vec::<f32>(),
            Err(ComputeError::SizeMismatch {
                expected: 8,
                actual: 6
            })
        ));
    }

    #[test]
    fn storage_usage_allows_transfers() {
        assert!(STORAGE_USAGE.contains(vk::BufferUsageFlags::STORAGE_BUFFER));
        assert!(STORAGE_USAGE.contains(vk::BufferUsageFlags::TRANSFER_SRC));
        assert!(STORAGE_USAGE.contains(vk::BufferUsageFlags::TRANSFER_DST));
    }
}
