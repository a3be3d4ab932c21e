//! Per-frame scene descriptor sets: camera uniforms and the top-level acceleration structure.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Mat4;
use gpu_allocator::MemoryLocation;

use crate::allocator::GpuBuffer;
use crate::config::EngineConfig;
use crate::descriptors::{DescriptorAllocatorGrowable, DescriptorLayoutBuilder, DescriptorWriter, PoolSizeRatio};
use crate::error::Result;
use crate::vulkan_context::VulkanContext;

pub const SCENE_UNIFORM_BINDING: u32 = 0;
pub const TOP_LEVEL_BINDING: u32 = 1;

/// Scene uniform block (std140).
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct SceneUniforms {
    pub inverse_view: [f32; 16],
    pub inverse_projection: [f32; 16],
    pub instance_count: u32,
    pub frame_index: u32,
    pub _pad: [u32; 2],
}

impl SceneUniforms {
    pub fn new(view: &Mat4, projection: &Mat4, instance_count: u32, frame_index: u32) -> Self {
        Self {
            inverse_view: view.inverse().to_cols_array(),
            inverse_projection: projection.inverse().to_cols_array(),
            instance_count,
            frame_index,
            _pad: [0; 2],
        }
    }
}

struct FrameSet {
    set: vk::DescriptorSet,
    uniforms: GpuBuffer,
}

/// One scene set per frame in flight.
///
/// A frame's set is rewritten by [`FrameDescriptors::write_frame`]; the caller must have waited
/// for that frame's previous submission first.
pub struct FrameDescriptors {
    allocator: DescriptorAllocatorGrowable,
    layout: vk::DescriptorSetLayout,
    frames: Vec<FrameSet>,
}

impl FrameDescriptors {
    pub fn new(ctx: &mut VulkanContext, config: &EngineConfig) -> Result<Self> {
        let layout = DescriptorLayoutBuilder::new()
            .add_binding(SCENE_UNIFORM_BINDING, vk::DescriptorType::UNIFORM_BUFFER)
            .add_binding(TOP_LEVEL_BINDING, vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
            .build(&ctx.device, vk::ShaderStageFlags::ALL)?;

        let ratios = [
            PoolSizeRatio {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                ratio: 1.0,
            },
            PoolSizeRatio {
                ty: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                ratio: 1.0,
            },
        ];
        let mut allocator = DescriptorAllocatorGrowable::new(
            &ctx.device,
            config.descriptor_sets_per_pool,
            &ratios,
            vk::DescriptorPoolCreateFlags::empty(),
        )?;

        let mut frames = Vec::with_capacity(config.frames_in_flight as usize);
        for i in 0..config.frames_in_flight {
            let set = allocator.allocate(&ctx.device, layout)?;
            let uniforms = ctx.create_buffer(
                std::mem::size_of::<SceneUniforms>() as u64,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                MemoryLocation::CpuToGpu,
                &format!("scene_uniforms_{}", i),
            )?;
            frames.push(FrameSet { set, uniforms });
        }

        Ok(Self {
            allocator,
            layout,
            frames,
        })
    }

    /// Upload `uniforms` and point frame `frame_index`'s set at them and at `top_level`.
    pub fn write_frame(
        &mut self,
        ctx: &VulkanContext,
        frame_index: usize,
        uniforms: &SceneUniforms,
        top_level: vk::AccelerationStructureKHR,
    ) -> Result<vk::DescriptorSet> {
        let frame_count = self.frames.len();
        let frame = &mut self.frames[frame_index % frame_count];
        frame.uniforms.write(0, bytemuck::bytes_of(uniforms))?;

        let mut writer = DescriptorWriter::new();
        writer
            .write_buffer(
                SCENE_UNIFORM_BINDING,
                frame.uniforms.buffer,
                0,
                std::mem::size_of::<SceneUniforms>() as u64,
                vk::DescriptorType::UNIFORM_BUFFER,
            )
            .write_acceleration_structure(TOP_LEVEL_BINDING, top_level);
        writer.update_set(&ctx.device, frame.set);
        Ok(frame.set)
    }

    pub fn set(&self, frame_index: usize) -> vk::DescriptorSet {
        self.frames[frame_index % self.frames.len()].set
    }

    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn destroy(&mut self, ctx: &mut VulkanContext) {
        for mut frame in self.frames.drain(..) {
            ctx.destroy_buffer(&mut frame.uniforms);
        }
        self.allocator.destroy_pools(&ctx.device);
        unsafe {
            ctx.device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}
