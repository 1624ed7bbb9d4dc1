// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Physical device filtering (API version, GPU type, extensions, int8 features)
// - Logical device + compute queue creation
// - Memory allocator setup
// - Registry of the buffers allocated on the device
// - Blocking one-time command submission

use super::sync::Fence;
use super::Instance;
use crate::config::DeviceConfig;
use crate::error::{ComputeError, Result};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Key under which a device registers a buffer
pub type BufferHandle = u32;

struct BufferSlot {
    buffer: vk::Buffer,
    allocation: Allocation,
    size_byte: u64,
}

// Command pool and queue are externally synchronized
struct Submission {
    command_pool: vk::CommandPool,
    queue: vk::Queue,
}

/// Logical device wrapper with automatic cleanup
pub struct Device {
    allocator: ManuallyDrop<Mutex<Allocator>>,
    buffers: Mutex<HashMap<BufferHandle, BufferSlot>>,
    buffer_counter: AtomicU32,
    submission: Mutex<Submission>,
    device: ash::Device,
    physical_device: vk::PhysicalDevice,
    queue_family_index: u32,
    properties: vk::PhysicalDeviceProperties,
    name: String,
    fence_timeout_ns: u64,
    instance: Arc<Instance>,
}

/// Summary of a device for listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub device_type: &'static str,
    pub api_version: String,
    pub queue_family_index: u32,
}

/// Create a logical device for every physical device that satisfies `settings`
pub fn create_devices(
    instance: &Arc<Instance>,
    settings: &DeviceConfig,
) -> Result<Vec<Arc<Device>>> {
    let raw = instance.raw();
    let required = settings
        .extensions
        .iter()
        .map(|name| CString::new(name.as_str()))
        .collect::<Result<Vec<_>, _>>()?;

    let mut devices = Vec::new();
    for physical_device in instance.enumerate_physical_devices()? {
        let properties = unsafe { raw.get_physical_device_properties(physical_device) };
        let name = device_name(&properties);

        if properties.api_version < instance.api_version() {
            log::info!(
                "Skipping {}: API {} is older than {}",
                name,
                version_string(properties.api_version),
                version_string(instance.api_version())
            );
            continue;
        }

        log::debug!("Found {}. [{}]", device_type_name(properties.device_type), name);
        if !is_gpu(properties.device_type) {
            continue;
        }

        let available = unsafe { raw.enumerate_device_extension_properties(physical_device) }?;
        let available_names: Vec<&CStr> = available
            .iter()
            .filter_map(|prop| prop.extension_name_as_c_str().ok())
            .collect();
        log::debug!("----- Available Extensions({}) -----", name);
        for extension in &available_names {
            log::debug!("     -- {}", extension.to_string_lossy());
        }

        let missing = missing_extensions(&required, &available_names);
        if !missing.is_empty() {
            for extension in &missing {
                log::warn!("Extension {} not found in ({})", extension, name);
            }
            continue;
        }

        let device = Device::new(instance, physical_device, properties, &required, settings)?;
        devices.push(Arc::new(device));
    }

    Ok(devices)
}

impl Device {
    fn new(
        instance: &Arc<Instance>,
        physical_device: vk::PhysicalDevice,
        properties: vk::PhysicalDeviceProperties,
        extensions: &[CString],
        settings: &DeviceConfig,
    ) -> Result<Self> {
        let raw = instance.raw();
        let name = device_name(&properties);

        let queue_families =
            unsafe { raw.get_physical_device_queue_family_properties(physical_device) };
        let queue_family_index = find_compute_queue_family(&queue_families)
            .ok_or_else(|| ComputeError::NoComputeQueue { name: name.clone() })?;

        let (storage_8bit, shader_int8) = query_int8_features(raw, physical_device);
        log::debug!(
            "{}: storageBuffer8BitAccess -> {}, shaderInt8 -> {}",
            name,
            ok_or_no(storage_8bit),
            ok_or_no(shader_int8)
        );
        if settings.require_int8 {
            if !storage_8bit {
                return Err(ComputeError::MissingFeature {
                    name,
                    feature: "storageBuffer8BitAccess",
                });
            }
            if !shader_int8 {
                return Err(ComputeError::MissingFeature {
                    name,
                    feature: "shaderInt8",
                });
            }
        }

        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family_index)
            .queue_priorities(&queue_priorities);

        let extension_ptrs: Vec<_> = extensions.iter().map(|name| name.as_ptr()).collect();

        let mut enabled_8bit_storage =
            vk::PhysicalDevice8BitStorageFeatures::default().storage_buffer8_bit_access(true);
        let mut enabled_int8 =
            vk::PhysicalDeviceShaderFloat16Int8Features::default().shader_int8(true);

        let mut create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extension_ptrs);
        if settings.require_int8 {
            create_info = create_info
                .push_next(&mut enabled_8bit_storage)
                .push_next(&mut enabled_int8);
        }

        let device = unsafe { raw.create_device(physical_device, &create_info, None) }?;
        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family_index)
            .flags(
                vk::CommandPoolCreateFlags::TRANSIENT
                    | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            );
        let command_pool = match unsafe { device.create_command_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e.into());
            }
        };

        let allocator = match Allocator::new(&AllocatorCreateDesc {
            instance: raw.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        }) {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe {
                    device.destroy_command_pool(command_pool, None);
                    device.destroy_device(None);
                }
                return Err(e.into());
            }
        };

        log::info!(
            "Created device {} (API {}, compute queue family {})",
            name,
            version_string(properties.api_version),
            queue_family_index
        );

        Ok(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            buffers: Mutex::new(HashMap::new()),
            buffer_counter: AtomicU32::new(0),
            submission: Mutex::new(Submission {
                command_pool,
                queue,
            }),
            device,
            physical_device,
            queue_family_index,
            properties,
            name,
            fence_timeout_ns: settings.fence_timeout_ns,
            instance: Arc::clone(instance),
        })
    }

    pub fn raw(&self) -> &ash::Device {
        &self.device
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            name: self.name.clone(),
            device_type: device_type_name(self.properties.device_type),
            api_version: version_string(self.properties.api_version),
            queue_family_index: self.queue_family_index,
        }
    }

    /// Number of buffers currently registered
    pub fn live_buffers(&self) -> usize {
        self.buffers.lock().len()
    }

    /// Create a buffer with bound memory and register it
    pub fn create_vk_buffer(
        &self,
        size_byte: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<(BufferHandle, vk::Buffer)> {
        if size_byte == 0 {
            return Err(ComputeError::EmptyBuffer);
        }

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size_byte)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = self.allocator.lock().allocate(&AllocationCreateDesc {
            name: "buffer",
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e.into());
            }
        };

        let bound = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            unsafe { self.device.destroy_buffer(buffer, None) };
            if let Err(free_err) = self.allocator.lock().free(allocation) {
                log::error!("Failed to free allocation: {}", free_err);
            }
            return Err(e.into());
        }

        let handle = self.buffer_counter.fetch_add(1, Ordering::Relaxed);
        self.buffers.lock().insert(
            handle,
            BufferSlot {
                buffer,
                allocation,
                size_byte,
            },
        );
        log::debug!(
            "{}: allocated buffer {} ({} bytes, {:?})",
            self.name,
            handle,
            size_byte,
            location
        );

        Ok((handle, buffer))
    }

    /// Destroy a registered buffer and free its memory
    pub fn return_buffer(&self, handle: BufferHandle) {
        let Some(slot) = self.buffers.lock().remove(&handle) else {
            log::warn!("{}: buffer {} is not registered", self.name, handle);
            return;
        };
        unsafe { self.device.destroy_buffer(slot.buffer, None) };
        if let Err(e) = self.allocator.lock().free(slot.allocation) {
            log::error!("{}: failed to free buffer {}: {}", self.name, handle, e);
        }
        log::debug!("{}: returned buffer {}", self.name, handle);
    }

    pub fn vk_buffer(&self, handle: BufferHandle) -> Result<vk::Buffer> {
        self.buffers
            .lock()
            .get(&handle)
            .map(|slot| slot.buffer)
            .ok_or(ComputeError::UnknownHandle(handle))
    }

    pub fn buffer_size(&self, handle: BufferHandle) -> Result<u64> {
        self.buffers
            .lock()
            .get(&handle)
            .map(|slot| slot.size_byte)
            .ok_or(ComputeError::UnknownHandle(handle))
    }

    /// Copy `bytes` to the start of a registered buffer
    pub fn write_buffer(&self, handle: BufferHandle, bytes: &[u8]) -> Result<()> {
        let dst = {
            let mut buffers = self.buffers.lock();
            let slot = buffers
                .get_mut(&handle)
                .ok_or(ComputeError::UnknownHandle(handle))?;
            if bytes.len() as u64 > slot.size_byte {
                return Err(ComputeError::SizeMismatch {
                    expected: slot.size_byte as usize,
                    actual: bytes.len(),
                });
            }
            if let Some(mapped) = slot.allocation.mapped_slice_mut() {
                mapped[..bytes.len()].copy_from_slice(bytes);
                return Ok(());
            }
            slot.buffer
        };
        if bytes.is_empty() {
            return Ok(());
        }

        let size = bytes.len() as u64;
        let (staging_handle, staging) = self.create_vk_buffer(
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        )?;
        let result = self.write_buffer(staging_handle, bytes).and_then(|()| {
            self.submit_one_time(|device, cmd| unsafe {
                let region = vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size,
                };
                device.cmd_copy_buffer(cmd, staging, dst, &[region]);
            })
        });
        self.return_buffer(staging_handle);
        result
    }

    /// Copy the whole content of a registered buffer to the host
    pub fn read_buffer(&self, handle: BufferHandle) -> Result<Vec<u8>> {
        let (src, size) = {
            let buffers = self.buffers.lock();
            let slot = buffers
                .get(&handle)
                .ok_or(ComputeError::UnknownHandle(handle))?;
            if let Some(mapped) = slot.allocation.mapped_slice() {
                return Ok(mapped[..slot.size_byte as usize].to_vec());
            }
            (slot.buffer, slot.size_byte)
        };

        let (staging_handle, staging) = self.create_vk_buffer(
            size,
            vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuToCpu,
        )?;
        let result = self
            .submit_one_time(|device, cmd| unsafe {
                let region = vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size,
                };
                device.cmd_copy_buffer(cmd, src, staging, &[region]);
                let barrier = vk::MemoryBarrier::default()
                    .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                    .dst_access_mask(vk::AccessFlags::HOST_READ);
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::HOST,
                    vk::DependencyFlags::empty(),
                    &[barrier],
                    &[],
                    &[],
                );
            })
            .and_then(|()| self.read_buffer(staging_handle));
        self.return_buffer(staging_handle);
        result
    }

    /// Record commands into a fresh command buffer, submit, and wait for completion
    pub fn submit_one_time<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let submission = self.submission.lock();

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(submission.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffers = unsafe { self.device.allocate_command_buffers(&alloc_info) }?;
        let cmd = command_buffers[0];

        // Outlives the idle wait below, a pending submit may still signal it
        let fence = match Fence::new(&self.device, false) {
            Ok(fence) => fence,
            Err(e) => {
                self.free_command_buffers(&submission, &command_buffers);
                return Err(e);
            }
        };

        let result = (|| -> Result<()> {
            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            unsafe { self.device.begin_command_buffer(cmd, &begin_info) }?;
            record(&self.device, cmd);
            unsafe { self.device.end_command_buffer(cmd) }?;

            let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
            unsafe {
                self.device
                    .queue_submit(submission.queue, &[submit_info], fence.raw())
            }?;
            fence.wait(self.fence_timeout_ns)
        })();

        if let Err(e) = &result {
            log::warn!("One-time submit on {} failed: {}", self.name, e);
            if let Err(e) = unsafe { self.device.queue_wait_idle(submission.queue) } {
                log::error!("Failed to wait for queue idle on {}: {}", self.name, e);
            }
        }
        drop(fence);
        self.free_command_buffers(&submission, &command_buffers);
        result
    }

    fn free_command_buffers(
        &self,
        submission: &Submission,
        command_buffers: &[vk::CommandBuffer],
    ) {
        unsafe {
            self.device
                .free_command_buffers(submission.command_pool, command_buffers)
        };
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("queue_family_index", &self.queue_family_index)
            .finish()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        log::info!("Destroying device {}...", self.name);

        let _ = self.wait_idle();

        let allocator = self.allocator.get_mut();
        for (handle, slot) in self.buffers.get_mut().drain() {
            unsafe { self.device.destroy_buffer(slot.buffer, None) };
            if let Err(e) = allocator.free(slot.allocation) {
                log::error!("{}: failed to free buffer {}: {}", self.name, handle, e);
            }
        }

        // Allocator must go before the device it allocates from
        unsafe {
            ManuallyDrop::drop(&mut self.allocator);
            self.device
                .destroy_command_pool(self.submission.get_mut().command_pool, None);
            self.device.destroy_device(None);
        }
    }
}

fn query_int8_features(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> (bool, bool) {
    let mut storage_8bit = vk::PhysicalDevice8BitStorageFeatures::default();
    let mut float16_int8 = vk::PhysicalDeviceShaderFloat16Int8Features::default();
    {
        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut storage_8bit)
            .push_next(&mut float16_int8);
        unsafe { instance.get_physical_device_features2(physical_device, &mut features2) };
    }
    (
        storage_8bit.storage_buffer8_bit_access == vk::TRUE,
        float16_int8.shader_int8 == vk::TRUE,
    )
}

pub(crate) fn find_compute_queue_family(families: &[vk::QueueFamilyProperties]) -> Option<u32> {
    families
        .iter()
        .position(|props| {
            props.queue_count > 0 && props.queue_flags.contains(vk::QueueFlags::COMPUTE)
        })
        .map(|index| index as u32)
}

pub(crate) fn missing_extensions(required: &[CString], available: &[&CStr]) -> Vec<String> {
    required
        .iter()
        .filter(|name| !available.contains(&name.as_c_str()))
        .map(|name| name.to_string_lossy().into_owned())
        .collect()
}

pub(crate) fn is_gpu(device_type: vk::PhysicalDeviceType) -> bool {
    device_type == vk::PhysicalDeviceType::DISCRETE_GPU
        || device_type == vk::PhysicalDeviceType::INTEGRATED_GPU
}

pub fn device_type_name(device_type: vk::PhysicalDeviceType) -> &'static str {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => "discrete GPU",
        vk::PhysicalDeviceType::INTEGRATED_GPU => "integrated GPU",
        vk::PhysicalDeviceType::VIRTUAL_GPU => "virtual GPU",
        vk::PhysicalDeviceType::CPU => "CPU",
        _ => "unknown device",
    }
}

pub fn version_string(version: u32) -> String {
    format!(
        "{}.{}.{}",
        vk::api_version_major(version),
        vk::api_version_minor(version),
        vk::api_version_patch(version)
    )
}

fn device_name(properties: &vk::PhysicalDeviceProperties) -> String {
    properties
        .device_name_as_c_str()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "<unnamed>".to_string())
}

fn ok_or_no(supported: bool) -> &'static str {
    if supported {
        "OK"
    } else {
        "NO"
    }
}
