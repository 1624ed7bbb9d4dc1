// Compute pipeline creation and dispatch
//
// One descriptor set of storage buffers (binding i = i), one push constant
// range, one compute shader entry point.

use super::shader::create_shader_module;
use super::{Buffer, Device};
use crate::error::{ComputeError, Result};
use ash::vk;
use std::ffi::CString;
use std::sync::Arc;

pub struct ComputePipeline {
    device: Arc<Device>,
    shader_module: vk::ShaderModule,
    descriptor_set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    descriptor_pool: vk::DescriptorPool,
    descriptor_set: vk::DescriptorSet,
    storage_buffers: u32,
    push_constant_size: u32,
}

impl ComputePipeline {
    pub fn new(
        device: &Arc<Device>,
        spirv: &[u32],
        entry_point: &str,
        storage_buffers: u32,
        push_constant_size: u32,
    ) -> Result<Self> {
        let entry_point = CString::new(entry_point)?;

        // Null handles are skipped on drop, so early returns clean up what exists
        let mut pipeline = Self {
            device: Arc::clone(device),
            shader_module: vk::ShaderModule::null(),
            descriptor_set_layout: vk::DescriptorSetLayout::null(),
            pipeline_layout: vk::PipelineLayout::null(),
            pipeline: vk::Pipeline::null(),
            descriptor_pool: vk::DescriptorPool::null(),
            descriptor_set: vk::DescriptorSet::null(),
            storage_buffers,
            push_constant_size,
        };
        let raw = device.raw();

        pipeline.shader_module = create_shader_module(device, spirv)?;

        let bindings: Vec<_> = (0..storage_buffers)
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE)
            })
            .collect();
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        pipeline.descriptor_set_layout =
            unsafe { raw.create_descriptor_set_layout(&layout_info, None) }?;

        let set_layouts = [pipeline.descriptor_set_layout];
        let push_constant_ranges = [vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .offset(0)
            .size(push_constant_size)];
        let ranges: &[vk::PushConstantRange] = if push_constant_size > 0 {
            &push_constant_ranges
        } else {
            &[]
        };
        let pipeline_layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(ranges);
        pipeline.pipeline_layout =
            unsafe { raw.create_pipeline_layout(&pipeline_layout_info, None) }?;

        let stage_info = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(pipeline.shader_module)
            .name(&entry_point);
        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage_info)
            .layout(pipeline.pipeline_layout);
        let pipelines = unsafe {
            raw.create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        }
        .map_err(|(_, e)| e)?;
        pipeline.pipeline = pipelines[0];

        if storage_buffers > 0 {
            let pool_sizes = [vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: storage_buffers,
            }];
            let pool_info = vk::DescriptorPoolCreateInfo::default()
                .pool_sizes(&pool_sizes)
                .max_sets(1);
            pipeline.descriptor_pool = unsafe { raw.create_descriptor_pool(&pool_info, None) }?;

            let alloc_info = vk::DescriptorSetAllocateInfo::default()
                .descriptor_pool(pipeline.descriptor_pool)
                .set_layouts(&set_layouts);
            pipeline.descriptor_set = unsafe { raw.allocate_descriptor_sets(&alloc_info) }?[0];
        }

        log::debug!(
            "Created compute pipeline {:?} ({} storage buffers, {} bytes of push constants)",
            entry_point,
            storage_buffers,
            push_constant_size
        );

        Ok(pipeline)
    }

    /// Point binding i at `buffers[i]`
    ///
    /// Takes `&mut self` since the descriptor set must not change while a
    /// dispatch that reads it is in flight.
    pub fn bind_buffers(&mut self, buffers: &[&Buffer]) -> Result<()> {
        if buffers.len() != self.storage_buffers as usize {
            return Err(ComputeError::BindingCount {
                expected: self.storage_buffers,
                actual: buffers.len(),
            });
        }

        let buffer_infos = buffers
            .iter()
            .enumerate()
            .map(|(binding, buffer)| {
                let owner = buffer.device()?;
                if !Arc::ptr_eq(&owner, &self.device) {
                    return Err(ComputeError::ForeignBuffer {
                        binding,
                        device: self.device.name().to_string(),
                    });
                }
                Ok(vk::DescriptorBufferInfo {
                    buffer: buffer.raw(),
                    offset: 0,
                    range: buffer.size_byte(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let writes: Vec<_> = buffer_infos
            .iter()
            .enumerate()
            .map(|(binding, info)| {
                vk::WriteDescriptorSet::default()
                    .dst_set(self.descriptor_set)
                    .dst_binding(binding as u32)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .buffer_info(std::slice::from_ref(info))
            })
            .collect();

        unsafe { self.device.raw().update_descriptor_sets(&writes, &[]) };
        Ok(())
    }

    /// Run the shader and wait for it to finish
    pub fn dispatch(&mut self, group_count: [u32; 3], push_constants: &[u8]) -> Result<()> {
        if push_constants.len() != self.push_constant_size as usize {
            return Err(ComputeError::SizeMismatch {
                expected: self.push_constant_size as usize,
                actual: push_constants.len(),
            });
        }

        log::debug!("Dispatching {:?} workgroups", group_count);
        self.device.submit_one_time(|device, cmd| unsafe {
            memory_barrier(
                device,
                cmd,
                (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_WRITE),
                (vk::PipelineStageFlags::COMPUTE_SHADER, vk::AccessFlags::SHADER_READ),
            );
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, self.pipeline);
            if self.descriptor_set != vk::DescriptorSet::null() {
                device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::COMPUTE,
                    self.pipeline_layout,
                    0,
                    &[self.descriptor_set],
                    &[],
                );
            }
            if !push_constants.is_empty() {
                device.cmd_push_constants(
                    cmd,
                    self.pipeline_layout,
                    vk::ShaderStageFlags::COMPUTE,
                    0,
                    push_constants,
                );
            }
            device.cmd_dispatch(cmd, group_count[0], group_count[1], group_count[2]);
            let (dst_stage, dst_access) = readback_dependency();
            memory_barrier(
                device,
                cmd,
                (vk::PipelineStageFlags::COMPUTE_SHADER, vk::AccessFlags::SHADER_WRITE),
                (dst_stage, dst_access),
            );
        })
    }
}

// Results are read either by a staging copy or straight through a host mapping
fn readback_dependency() -> (vk::PipelineStageFlags, vk::AccessFlags) {
    (
        vk::PipelineStageFlags::TRANSFER | vk::PipelineStageFlags::HOST,
        vk::AccessFlags::TRANSFER_READ | vk::AccessFlags::HOST_READ,
    )
}

unsafe fn memory_barrier(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    src: (vk::PipelineStageFlags, vk::AccessFlags),
    dst: (vk::PipelineStageFlags, vk::AccessFlags),
) {
    let barrier = vk::MemoryBarrier::default()
        .src_access_mask(src.1)
        .dst_access_mask(dst.1);
    device.cmd_pipeline_barrier(
        cmd,
        src.0,
        dst.0,
        vk::DependencyFlags::empty(),
        &[barrier],
        &[],
        &[],
    );
}

impl Drop for ComputePipeline {
    fn drop(&mut self) {
        let raw = self.device.raw();
        unsafe {
            // Freeing the pool frees the descriptor set
            raw.destroy_descriptor_pool(self.descriptor_pool, None);
            raw.destroy_pipeline(self.pipeline, None);
            raw.destroy_pipeline_layout(self.pipeline_layout, None);
            raw.destroy_descriptor_set_layout(self.descriptor_set_layout, None);
            raw.destroy_shader_module(self.shader_module, None);
        }
    }
}
