// Top-level object gluing Instance -> Devices -> Buffers

use crate::backend::{create_devices, Buffer, CpuBuffer, Device, DeviceInfo, Instance};
use crate::config::Config;
use crate::error::{ComputeError, Result};
use std::sync::Arc;

pub struct App {
    // Field order matters for Drop: devices go before the instance
    devices: Vec<Arc<Device>>,
    instance: Arc<Instance>,
}

impl App {
    pub fn new(config: &Config) -> Result<Self> {
        let instance = Instance::new(&config.instance)?;
        let devices = create_devices(&instance, &config.device)?;
        if devices.is_empty() {
            return Err(ComputeError::NoDevice);
        }
        log::info!("{} device(s) available", devices.len());
        Ok(Self { devices, instance })
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    pub fn device(&self, device_id: usize) -> Result<&Arc<Device>> {
        self.devices.get(device_id).ok_or(ComputeError::InvalidDevice {
            id: device_id,
            count: self.devices.len(),
        })
    }

    pub fn device_infos(&self) -> Vec<DeviceInfo> {
        self.devices.iter().map(|device| device.info()).collect()
    }

    /// Allocate `size_byte` bytes on device `device_id`
    pub fn create_buffer(&self, device_id: usize, size_byte: u64) -> Result<Buffer> {
        Buffer::with_size(self.device(device_id)?, size_byte)
    }

    pub fn create_cpu_buffer(&self, size_byte: usize) -> CpuBuffer {
        CpuBuffer::new(size_byte)
    }
}
