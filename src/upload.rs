//! Mesh, material and texture uploads plus the bindless descriptor set they feed.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use gpu_allocator::MemoryLocation;
use log::info;
use std::marker::PhantomData;

use crate::accel::BottomLevelGeometry;
use crate::allocator::GpuBuffer;
use crate::config::EngineConfig;
use crate::descriptors::{DescriptorAllocatorGrowable, DescriptorLayoutBuilder, DescriptorWriter, PoolSizeRatio};
use crate::error::{EngineError, Result};
use crate::materials::MaterialRecord;
use crate::textures::{BindlessTextures, TextureSampler, TEXTURE_ARRAY_BINDING};
use crate::vulkan_context::VulkanContext;

pub const MATERIAL_BINDING: u32 = 0;
pub const MESH_INFO_BINDING: u32 = 1;

/// Per-mesh data shaders look up through `InstanceCustomIndex`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct MeshInfo {
    pub vertex_address: u64,
    pub index_address: u64,
    pub index_count: u32,
    pub material_index: u32,
    pub vertex_stride: u32,
    pub _pad: u32,
}

/// Device-local vertex and index buffers of one mesh.
pub struct MeshBuffers {
    pub vertices: GpuBuffer,
    pub indices: GpuBuffer,
    pub vertex_address: u64,
    pub index_address: u64,
    pub vertex_stride: u64,
    pub vertex_count: u32,
    pub index_count: u32,
}

impl MeshBuffers {
    /// Geometry description for a bottom-level build over this mesh.
    pub fn geometry(&self) -> BottomLevelGeometry {
        BottomLevelGeometry::new(
            self.vertex_address,
            self.index_address,
            self.vertex_stride,
            self.vertex_count,
            self.index_count,
        )
    }

    pub fn info(&self, material_index: u32) -> MeshInfo {
        MeshInfo {
            vertex_address: self.vertex_address,
            index_address: self.index_address,
            index_count: self.index_count,
            material_index,
            vertex_stride: self.vertex_stride as u32,
            _pad: 0,
        }
    }

    pub fn destroy(&mut self, ctx: &mut VulkanContext) {
        ctx.destroy_buffer(&mut self.vertices);
        ctx.destroy_buffer(&mut self.indices);
    }
}

/// Byte offsets of the vertex and index data inside a shared staging buffer.
pub fn mesh_staging_layout(vertex_bytes: u64, index_bytes: u64) -> (vk::BufferCopy, vk::BufferCopy) {
    let index_offset = crate::allocator::align_up(vertex_bytes, 4);
    (
        vk::BufferCopy::default().src_offset(0).dst_offset(0).size(vertex_bytes),
        vk::BufferCopy::default()
            .src_offset(index_offset)
            .dst_offset(0)
            .size(index_bytes),
    )
}

/// Copies that move `old_bytes` of existing contents and `appended_bytes` of staged records
/// into a freshly allocated buffer. The old region is `None` when there is nothing to keep.
pub fn append_copy_plan(old_bytes: u64, appended_bytes: u64) -> (Option<vk::BufferCopy>, vk::BufferCopy) {
    let old = (old_bytes > 0).then(|| {
        vk::BufferCopy::default()
            .src_offset(0)
            .dst_offset(0)
            .size(old_bytes)
    });
    let appended = vk::BufferCopy::default()
        .src_offset(0)
        .dst_offset(old_bytes)
        .size(appended_bytes);
    (old, appended)
}

/// A device-local array of `T` that grows by reallocating and copying.
pub struct GrowableBuffer<T: Pod> {
    buffer: Option<GpuBuffer>,
    len: usize,
    usage: vk::BufferUsageFlags,
    name: &'static str,
    _marker: PhantomData<T>,
}

impl<T: Pod> GrowableBuffer<T> {
    pub fn new(usage: vk::BufferUsageFlags, name: &'static str) -> Self {
        Self {
            buffer: None,
            len: 0,
            usage,
            name,
            _marker: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn buffer(&self) -> Option<vk::Buffer> {
        self.buffer.as_ref().map(|b| b.buffer)
    }

    pub fn byte_len(&self) -> u64 {
        (self.len * std::mem::size_of::<T>()) as u64
    }

    /// Append `items`, returning the index of the first one.
    ///
    /// The existing contents and the new items are copied into a new buffer in a single
    /// immediate submit; the old buffer is destroyed once the copy has completed.
    pub fn append(&mut self, ctx: &mut VulkanContext, items: &[T]) -> Result<u32> {
        let base = self.len as u32;
        if items.is_empty() {
            return Ok(base);
        }

        let appended: &[u8] = bytemuck::cast_slice(items);
        let old_bytes = self.byte_len();
        let new_bytes = old_bytes + appended.len() as u64;

        let mut staging =
            ctx.create_buffer_with_data(appended, vk::BufferUsageFlags::TRANSFER_SRC, "growable_staging")?;
        let mut grown = match ctx.create_buffer(
            new_bytes,
            self.usage | vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::GpuOnly,
            self.name,
        ) {
            Ok(buffer) => buffer,
            Err(e) => {
                ctx.destroy_buffer(&mut staging);
                return Err(e);
            }
        };

        let (old_copy, new_copy) = append_copy_plan(old_bytes, appended.len() as u64);
        let old_buffer = self.buffer.as_ref().map(|b| b.buffer);
        let staging_buffer = staging.buffer;
        let dst = grown.buffer;
        let submitted = ctx.immediate_submit(|device, cmd| unsafe {
            if let (Some(src), Some(region)) = (old_buffer, old_copy) {
                device.cmd_copy_buffer(cmd, src, dst, &[region]);
            }
            device.cmd_copy_buffer(cmd, staging_buffer, dst, &[new_copy]);
        });

        ctx.destroy_buffer(&mut staging);
        if let Err(e) = submitted {
            ctx.destroy_buffer(&mut grown);
            return Err(e);
        }

        if let Some(mut old) = self.buffer.replace(grown) {
            ctx.destroy_buffer(&mut old);
        }
        self.len += items.len();
        info!(
            "{}: appended {} records at offset {} ({} bytes total)",
            self.name,
            items.len(),
            base,
            new_bytes
        );
        Ok(base)
    }

    pub fn destroy(&mut self, ctx: &mut VulkanContext) {
        if let Some(mut buffer) = self.buffer.take() {
            ctx.destroy_buffer(&mut buffer);
        }
        self.len = 0;
    }
}

/// Owns the bindless set (materials, mesh infos, textures) and everything uploaded into it.
pub struct UploadPipeline {
    descriptor_allocator: DescriptorAllocatorGrowable,
    bindless_layout: vk::DescriptorSetLayout,
    bindless_set: vk::DescriptorSet,
    materials: GrowableBuffer<MaterialRecord>,
    mesh_infos: GrowableBuffer<MeshInfo>,
    textures: BindlessTextures,
}

impl UploadPipeline {
    /// Create the bindless set, the default material (index 0) and the default texture (slot 0).
    pub fn new(ctx: &mut VulkanContext, config: &EngineConfig) -> Result<Self> {
        let texture_capacity = config.max_bindless_textures;
        let layout_builder = DescriptorLayoutBuilder::new()
            .add_binding_with_flags(
                MATERIAL_BINDING,
                vk::DescriptorType::STORAGE_BUFFER,
                vk::DescriptorBindingFlags::PARTIALLY_BOUND | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND,
            )
            .add_binding_with_flags(
                MESH_INFO_BINDING,
                vk::DescriptorType::STORAGE_BUFFER,
                vk::DescriptorBindingFlags::PARTIALLY_BOUND | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND,
            )
            .add_bindless_binding(
                TEXTURE_ARRAY_BINDING,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                texture_capacity,
            );
        let bindless_layout = layout_builder.build(&ctx.device, vk::ShaderStageFlags::ALL)?;

        let ratios = [
            PoolSizeRatio {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                ratio: 2.0,
            },
            PoolSizeRatio {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                ratio: texture_capacity as f32,
            },
        ];
        let mut descriptor_allocator = DescriptorAllocatorGrowable::new(
            &ctx.device,
            1,
            &ratios,
            vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND,
        )?;
        let bindless_set = descriptor_allocator.allocate_variable(&ctx.device, bindless_layout, texture_capacity)?;

        let textures = BindlessTextures::new(ctx, bindless_set, texture_capacity)?;

        let mut pipeline = Self {
            descriptor_allocator,
            bindless_layout,
            bindless_set,
            materials: GrowableBuffer::new(
                vk::BufferUsageFlags::STORAGE_BUFFER,
                "materials",
            ),
            mesh_infos: GrowableBuffer::new(
                vk::BufferUsageFlags::STORAGE_BUFFER,
                "mesh_infos",
            ),
            textures,
        };
        pipeline.upload_materials(ctx, &[MaterialRecord::default()])?;

        info!(
            "Upload pipeline ready: {} bindless texture slots",
            texture_capacity
        );
        Ok(pipeline)
    }

    /// Copy host vertex and index data into device-local buffers usable as build inputs.
    pub fn upload_mesh<V: Pod>(&mut self, ctx: &mut VulkanContext, indices: &[u32], vertices: &[V]) -> Result<MeshBuffers> {
        if vertices.is_empty() || indices.is_empty() {
            return Err(EngineError::Unsupported("cannot upload an empty mesh".to_string()));
        }
        assert!(
            indices.len() % 3 == 0,
            "index count {} is not a triangle list",
            indices.len()
        );

        let vertex_bytes: &[u8] = bytemuck::cast_slice(vertices);
        let index_bytes: &[u8] = bytemuck::cast_slice(indices);
        let (vertex_copy, index_copy) = mesh_staging_layout(vertex_bytes.len() as u64, index_bytes.len() as u64);

        let mut staging_data = vec![0u8; (index_copy.src_offset + index_copy.size) as usize];
        staging_data[..vertex_bytes.len()].copy_from_slice(vertex_bytes);
        staging_data[index_copy.src_offset as usize..].copy_from_slice(index_bytes);
        let mut staging =
            ctx.create_buffer_with_data(&staging_data, vk::BufferUsageFlags::TRANSFER_SRC, "mesh_staging")?;

        let geometry_usage = vk::BufferUsageFlags::TRANSFER_DST
            | vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
            | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;

        let created = ctx
            .create_buffer(
                vertex_copy.size,
                geometry_usage | vk::BufferUsageFlags::VERTEX_BUFFER,
                MemoryLocation::GpuOnly,
                "mesh_vertices",
            )
            .and_then(|vertices| {
                match ctx.create_buffer(
                    index_copy.size,
                    geometry_usage | vk::BufferUsageFlags::INDEX_BUFFER,
                    MemoryLocation::GpuOnly,
                    "mesh_indices",
                ) {
                    Ok(indices) => Ok((vertices, indices)),
                    Err(e) => {
                        let mut vertices = vertices;
                        ctx.destroy_buffer(&mut vertices);
                        Err(e)
                    }
                }
            });
        let (vertex_buffer, index_buffer) = match created {
            Ok(buffers) => buffers,
            Err(e) => {
                ctx.destroy_buffer(&mut staging);
                return Err(e);
            }
        };

        let src = staging.buffer;
        let (vertex_dst, index_dst) = (vertex_buffer.buffer, index_buffer.buffer);
        let submitted = ctx.immediate_submit(|device, cmd| unsafe {
            device.cmd_copy_buffer(cmd, src, vertex_dst, &[vertex_copy]);
            device.cmd_copy_buffer(cmd, src, index_dst, &[index_copy]);
        });
        ctx.destroy_buffer(&mut staging);

        let mut mesh = MeshBuffers {
            vertex_address: ctx.buffer_device_address(vertex_dst),
            index_address: ctx.buffer_device_address(index_dst),
            vertices: vertex_buffer,
            indices: index_buffer,
            vertex_stride: std::mem::size_of::<V>() as u64,
            vertex_count: vertices.len() as u32,
            index_count: indices.len() as u32,
        };
        if let Err(e) = submitted {
            mesh.destroy(ctx);
            return Err(e);
        }

        info!(
            "Uploaded mesh: {} vertices, {} triangles",
            mesh.vertex_count,
            mesh.index_count / 3
        );
        Ok(mesh)
    }

    /// Append materials, returning the index of the first one.
    pub fn upload_materials(&mut self, ctx: &mut VulkanContext, materials: &[MaterialRecord]) -> Result<u32> {
        let base = self.materials.append(ctx, materials)?;
        self.write_storage_binding(ctx, MATERIAL_BINDING, &self.materials);
        Ok(base)
    }

    /// Append a mesh-info record for `mesh`, returning its index.
    pub fn register_mesh_info(&mut self, ctx: &mut VulkanContext, mesh: &MeshBuffers, material_index: u32) -> Result<u32> {
        let index = self.mesh_infos.append(ctx, &[mesh.info(material_index)])?;
        self.write_storage_binding(ctx, MESH_INFO_BINDING, &self.mesh_infos);
        Ok(index)
    }

    /// Upload textures into the bindless array, returning the slot offset loaders add to their
    /// local texture indices.
    pub fn upload_2d_textures(&mut self, ctx: &mut VulkanContext, tex_samplers: &[TextureSampler]) -> Result<u32> {
        self.textures.upload(ctx, self.bindless_set, tex_samplers)
    }

    fn write_storage_binding<T: Pod>(&self, ctx: &VulkanContext, binding: u32, records: &GrowableBuffer<T>) {
        let Some(buffer) = records.buffer() else {
            return;
        };
        let mut writer = DescriptorWriter::new();
        writer.write_buffer(
            binding,
            buffer,
            0,
            vk::WHOLE_SIZE,
            vk::DescriptorType::STORAGE_BUFFER,
        );
        writer.update_set(&ctx.device, self.bindless_set);
    }

    pub fn material_count(&self) -> usize {
        self.materials.len()
    }

    pub fn mesh_info_count(&self) -> usize {
        self.mesh_infos.len()
    }

    pub fn textures(&self) -> &BindlessTextures {
        &self.textures
    }

    pub fn bindless_set(&self) -> vk::DescriptorSet {
        self.bindless_set
    }

    pub fn bindless_layout(&self) -> vk::DescriptorSetLayout {
        self.bindless_layout
    }

    pub fn destroy(&mut self, ctx: &mut VulkanContext) {
        self.textures.destroy(ctx);
        self.materials.destroy(ctx);
        self.mesh_infos.destroy(ctx);
        self.descriptor_allocator.destroy_pools(&ctx.device);
        unsafe {
            ctx.device
                .destroy_descriptor_set_layout(self.bindless_layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Execute a copy plan on host byte vectors the way the device would.
    fn run_append(existing: &[u8], appended: &[u8]) -> Vec<u8> {
        let (old_copy, new_copy) = append_copy_plan(existing.len() as u64, appended.len() as u64);
        let mut dst = vec![0u8; existing.len() + appended.len()];
        if let Some(region) = old_copy {
            let (src, dst_at, size) = (region.src_offset as usize, region.dst_offset as usize, region.size as usize);
            dst[dst_at..dst_at + size].copy_from_slice(&existing[src..src + size]);
        }
        let (src, dst_at, size) = (new_copy.src_offset as usize, new_copy.dst_offset as usize, new_copy.size as usize);
        dst[dst_at..dst_at + size].copy_from_slice(&appended[src..src + size]);
        dst
    }

    fn material(i: usize) -> MaterialRecord {
        MaterialRecord::new(glam::Vec4::new(i as f32, 0.5, 0.25, 1.0), 0.1 * i as f32, 0.9)
    }

    #[test]
    fn second_batch_preserves_first_batch_bytes() {
        let first: Vec<MaterialRecord> = (0..3).map(material).collect();
        let second: Vec<MaterialRecord> = (3..8).map(material).collect();

        let after_first = run_append(&[], bytemuck::cast_slice(&first));
        let after_second = run_append(&after_first, bytemuck::cast_slice(&second));

        let records: Vec<MaterialRecord> = bytemuck::pod_collect_to_vec(&after_second);
        assert_eq!(records.len(), 8);
        assert_eq!(&after_second[..after_first.len()], after_first.as_slice());
        assert_eq!(&records[..3], first.as_slice());
        assert_eq!(&records[3..], second.as_slice());
    }

    #[test]
    fn first_append_has_no_old_region() {
        let (old, new) = append_copy_plan(0, 96);
        assert!(old.is_none());
        assert_eq!((new.dst_offset, new.size), (0, 96));
    }

    #[test]
    fn index_data_is_four_byte_aligned_in_staging() {
        let (vertex, index) = mesh_staging_layout(30, 12);
        assert_eq!(vertex.size, 30);
        assert_eq!(index.src_offset, 32);
        assert_eq!(index.dst_offset, 0);
        assert_eq!(index.size, 12);
    }

    #[test]
    fn mesh_info_is_std430_sized() {
        assert_eq!(std::mem::size_of::<MeshInfo>(), 32);
    }
}
