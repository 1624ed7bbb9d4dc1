// Synchronization primitives
//
// Fences for GPU-CPU sync on blocking submissions

use crate::error::{ComputeError, Result};
use ash::vk;

/// Fence owned on a logical device, destroyed on drop
pub struct Fence<'a> {
    device: &'a ash::Device,
    fence: vk::Fence,
}

impl<'a> Fence<'a> {
    pub fn new(device: &'a ash::Device, signaled: bool) -> Result<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let fence_info = vk::FenceCreateInfo::default().flags(flags);
        let fence = unsafe { device.create_fence(&fence_info, None) }?;
        Ok(Self { device, fence })
    }

    pub fn raw(&self) -> vk::Fence {
        self.fence
    }

    pub fn wait(&self, timeout_ns: u64) -> Result<()> {
        match unsafe { self.device.wait_for_fences(&[self.fence], true, timeout_ns) } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(ComputeError::Timeout(timeout_ns)),
            Err(e) => Err(e.into()),
        }
    }

    pub fn reset(&self) -> Result<()> {
        unsafe { self.device.reset_fences(&[self.fence]) }?;
        Ok(())
    }
}

impl Drop for Fence<'_> {
    fn drop(&mut self) {
        unsafe { self.device.destroy_fence(self.fence, None) };
    }
}
