//! The device operations an acceleration-structure context needs, and their Vulkan implementation.

use ash::vk;
use gpu_allocator::MemoryLocation;
use log::debug;

use super::instances::BottomLevelGeometry;
use crate::allocator::GpuBuffer;
use crate::error::Result;
use crate::vulkan_context::VulkanContext;

pub const BOTTOM_LEVEL_BUILD_FLAGS: vk::BuildAccelerationStructureFlagsKHR =
    vk::BuildAccelerationStructureFlagsKHR::from_raw(
        vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE.as_raw()
            | vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION.as_raw()
            | vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE.as_raw(),
    );

pub const TOP_LEVEL_BUILD_FLAGS: vk::BuildAccelerationStructureFlagsKHR =
    vk::BuildAccelerationStructureFlagsKHR::from_raw(
        vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE.as_raw()
            | vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE.as_raw(),
    );

/// What a buffer created by the context is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Transient build memory, device-local.
    Scratch,
    /// Host-written instance records read by top-level builds.
    Instances,
    /// Backing memory of an acceleration structure.
    AccelStorage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccelLevel {
    Bottom,
    Top,
}

/// Whether a top-level build starts from scratch or refits the existing structure in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    Build,
    Update,
}

/// Sizes reported by the device for one build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildSizes {
    pub storage: u64,
    pub build_scratch: u64,
    pub update_scratch: u64,
}

impl BuildSizes {
    pub fn scratch_for(&self, mode: BuildMode) -> u64 {
        match mode {
            BuildMode::Build => self.build_scratch,
            BuildMode::Update => self.update_scratch,
        }
    }
}

/// Device operations behind [`super::AccelerationStructureContext`].
///
/// Builds are synchronous: when `build_*` returns, the device has finished with every buffer
/// the build read or wrote.
pub trait AccelBackend {
    type Buffer;
    type Handle: Copy + PartialEq + std::fmt::Debug;

    /// Required alignment of scratch addresses.
    fn scratch_alignment(&self) -> u64;

    fn create_buffer(&mut self, size: u64, kind: BufferKind, name: &str) -> Result<Self::Buffer>;
    fn destroy_buffer(&mut self, buffer: Self::Buffer);
    fn buffer_address(&self, buffer: &Self::Buffer) -> u64;
    /// Overwrite the start of a host-visible buffer.
    fn write_buffer(&mut self, buffer: &mut Self::Buffer, data: &[u8]) -> Result<()>;

    fn bottom_level_sizes(&self, geometry: &BottomLevelGeometry) -> Result<BuildSizes>;
    fn top_level_sizes(&self, instance_address: u64, instance_count: u32) -> Result<BuildSizes>;

    fn create_acceleration_structure(
        &mut self,
        level: AccelLevel,
        storage: &Self::Buffer,
        size: u64,
    ) -> Result<Self::Handle>;
    fn destroy_acceleration_structure(&mut self, handle: Self::Handle);
    fn acceleration_structure_address(&self, handle: Self::Handle) -> u64;

    fn build_bottom_level(
        &mut self,
        dst: Self::Handle,
        geometry: &BottomLevelGeometry,
        scratch_address: u64,
    ) -> Result<()>;

    /// Build (or, with [`BuildMode::Update`], refit in place) the top level over `instance_count`
    /// records at `instance_address`.
    fn build_top_level(
        &mut self,
        dst: Self::Handle,
        instance_address: u64,
        instance_count: u32,
        scratch_address: u64,
        mode: BuildMode,
    ) -> Result<()>;
}

fn triangle_geometry(geometry: &BottomLevelGeometry) -> vk::AccelerationStructureGeometryKHR<'static> {
    let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
        .vertex_format(vk::Format::R32G32B32_SFLOAT)
        .vertex_data(vk::DeviceOrHostAddressConstKHR {
            device_address: geometry.vertex_address(),
        })
        .vertex_stride(geometry.vertex_stride())
        .max_vertex(geometry.max_vertex())
        .index_type(vk::IndexType::UINT32)
        .index_data(vk::DeviceOrHostAddressConstKHR {
            device_address: geometry.index_address(),
        });

    vk::AccelerationStructureGeometryKHR::default()
        .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
        .flags(vk::GeometryFlagsKHR::OPAQUE)
        .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
}

fn instance_geometry(instance_address: u64) -> vk::AccelerationStructureGeometryKHR<'static> {
    let instances = vk::AccelerationStructureGeometryInstancesDataKHR::default()
        .array_of_pointers(false)
        .data(vk::DeviceOrHostAddressConstKHR {
            device_address: instance_address,
        });

    vk::AccelerationStructureGeometryKHR::default()
        .geometry_type(vk::GeometryTypeKHR::INSTANCES)
        .flags(vk::GeometryFlagsKHR::OPAQUE)
        .geometry(vk::AccelerationStructureGeometryDataKHR { instances })
}

impl VulkanContext {
    fn query_build_sizes(
        &self,
        level: AccelLevel,
        flags: vk::BuildAccelerationStructureFlagsKHR,
        geometry: &vk::AccelerationStructureGeometryKHR,
        primitive_count: u32,
    ) -> BuildSizes {
        let ty = match level {
            AccelLevel::Bottom => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            AccelLevel::Top => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
        };
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(ty)
            .flags(flags)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(std::slice::from_ref(geometry));

        let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            self.accel_struct_loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &[primitive_count],
                &mut sizes,
            );
        }
        BuildSizes {
            storage: sizes.acceleration_structure_size,
            build_scratch: sizes.build_scratch_size,
            update_scratch: sizes.update_scratch_size,
        }
    }

    fn submit_build(
        &self,
        build_info: vk::AccelerationStructureBuildGeometryInfoKHR,
        primitive_count: u32,
    ) -> Result<()> {
        let build_range = vk::AccelerationStructureBuildRangeInfoKHR::default()
            .primitive_count(primitive_count)
            .primitive_offset(0)
            .first_vertex(0)
            .transform_offset(0);

        let loader = &self.accel_struct_loader;
        self.immediate_submit(|device, cmd| unsafe {
            loader.cmd_build_acceleration_structures(
                cmd,
                std::slice::from_ref(&build_info),
                &[std::slice::from_ref(&build_range)],
            );

            // Make the finished structure visible to later builds and ray queries
            let memory_barrier = vk::MemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR)
                .dst_access_mask(
                    vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR | vk::AccessFlags::SHADER_READ,
                );
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR
                    | vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[memory_barrier],
                &[],
                &[],
            );
        })
    }
}

impl AccelBackend for VulkanContext {
    type Buffer = GpuBuffer;
    type Handle = vk::AccelerationStructureKHR;

    fn scratch_alignment(&self) -> u64 {
        self.scratch_alignment
    }

    fn create_buffer(&mut self, size: u64, kind: BufferKind, name: &str) -> Result<GpuBuffer> {
        let (usage, location) = match kind {
            BufferKind::Scratch => (
                vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                MemoryLocation::GpuOnly,
            ),
            BufferKind::Instances => (
                vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                MemoryLocation::CpuToGpu,
            ),
            BufferKind::AccelStorage => (
                vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                MemoryLocation::GpuOnly,
            ),
        };
        VulkanContext::create_buffer(self, size, usage, location, name)
    }

    fn destroy_buffer(&mut self, mut buffer: GpuBuffer) {
        VulkanContext::destroy_buffer(self, &mut buffer);
    }

    fn buffer_address(&self, buffer: &GpuBuffer) -> u64 {
        self.buffer_device_address(buffer.buffer)
    }

    fn write_buffer(&mut self, buffer: &mut GpuBuffer, data: &[u8]) -> Result<()> {
        buffer.write(0, data)
    }

    fn bottom_level_sizes(&self, geometry: &BottomLevelGeometry) -> Result<BuildSizes> {
        let geometry_desc = triangle_geometry(geometry);
        Ok(self.query_build_sizes(
            AccelLevel::Bottom,
            BOTTOM_LEVEL_BUILD_FLAGS,
            &geometry_desc,
            geometry.primitive_count(),
        ))
    }

    fn top_level_sizes(&self, instance_address: u64, instance_count: u32) -> Result<BuildSizes> {
        let geometry_desc = instance_geometry(instance_address);
        Ok(self.query_build_sizes(
            AccelLevel::Top,
            TOP_LEVEL_BUILD_FLAGS,
            &geometry_desc,
            instance_count,
        ))
    }

    fn create_acceleration_structure(
        &mut self,
        level: AccelLevel,
        storage: &GpuBuffer,
        size: u64,
    ) -> Result<vk::AccelerationStructureKHR> {
        let ty = match level {
            AccelLevel::Bottom => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            AccelLevel::Top => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
        };
        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(storage.buffer)
            .offset(0)
            .size(size)
            .ty(ty);

        unsafe {
            self.accel_struct_loader
                .create_acceleration_structure(&create_info, None)
                .map_err(|e| crate::error::EngineError::vulkan("create acceleration structure", e))
        }
    }

    fn destroy_acceleration_structure(&mut self, handle: vk::AccelerationStructureKHR) {
        unsafe {
            self.accel_struct_loader
                .destroy_acceleration_structure(handle, None);
        }
    }

    fn acceleration_structure_address(&self, handle: vk::AccelerationStructureKHR) -> u64 {
        let info =
            vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(handle);
        unsafe {
            self.accel_struct_loader
                .get_acceleration_structure_device_address(&info)
        }
    }

    fn build_bottom_level(
        &mut self,
        dst: vk::AccelerationStructureKHR,
        geometry: &BottomLevelGeometry,
        scratch_address: u64,
    ) -> Result<()> {
        let geometry_desc = triangle_geometry(geometry);
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
            .flags(BOTTOM_LEVEL_BUILD_FLAGS)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .dst_acceleration_structure(dst)
            .geometries(std::slice::from_ref(&geometry_desc))
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch_address,
            });

        self.submit_build(build_info, geometry.primitive_count())
    }

    fn build_top_level(
        &mut self,
        dst: vk::AccelerationStructureKHR,
        instance_address: u64,
        instance_count: u32,
        scratch_address: u64,
        mode: BuildMode,
    ) -> Result<()> {
        let geometry_desc = instance_geometry(instance_address);
        let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(TOP_LEVEL_BUILD_FLAGS)
            .dst_acceleration_structure(dst)
            .geometries(std::slice::from_ref(&geometry_desc))
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch_address,
            });
        build_info = match mode {
            BuildMode::Build => build_info.mode(vk::BuildAccelerationStructureModeKHR::BUILD),
            BuildMode::Update => build_info
                .mode(vk::BuildAccelerationStructureModeKHR::UPDATE)
                .src_acceleration_structure(dst),
        };

        debug!("Top-level {:?} over {} instances", mode, instance_count);
        self.submit_build(build_info, instance_count)
    }
}
