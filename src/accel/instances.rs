//! Geometry descriptions, instance references and the GPU instance record layout.

use bytemuck::{Pod, Zeroable};
use glam::Mat4;

/// Visibility mask given to every instance.
pub const INSTANCE_MASK: u8 = 0xFF;
/// `VK_GEOMETRY_INSTANCE_TRIANGLE_FACING_CULL_DISABLE_BIT_KHR`.
pub const INSTANCE_FLAG_CULL_DISABLE: u8 = 0x01;

/// Device-side triangle geometry for one bottom-level structure.
///
/// Positions are three `f32` at the start of each vertex; indices are `u32` triangle lists.
/// Only [`BottomLevelGeometry::new`] constructs one, so every value is a non-empty triangle list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BottomLevelGeometry {
    vertex_address: u64,
    index_address: u64,
    vertex_stride: u64,
    vertex_count: u32,
    index_count: u32,
}

impl BottomLevelGeometry {
    pub fn new(
        vertex_address: u64,
        index_address: u64,
        vertex_stride: u64,
        vertex_count: u32,
        index_count: u32,
    ) -> Self {
        assert!(
            index_count % 3 == 0,
            "index count {} is not a triangle list",
            index_count
        );
        assert!(vertex_count > 0, "geometry has no vertices");
        Self {
            vertex_address,
            index_address,
            vertex_stride,
            vertex_count,
            index_count,
        }
    }

    pub fn vertex_address(&self) -> u64 {
        self.vertex_address
    }

    pub fn index_address(&self) -> u64 {
        self.index_address
    }

    pub fn vertex_stride(&self) -> u64 {
        self.vertex_stride
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    pub fn primitive_count(&self) -> u32 {
        self.index_count / 3
    }

    pub fn max_vertex(&self) -> u32 {
        self.vertex_count - 1
    }
}

/// Stable index of a bottom-level structure inside its context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BottomLevelId(pub(crate) u32);

impl BottomLevelId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Which bottom level an instance points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryRef {
    /// Index into the geometry list passed to the same `register_geometry` call.
    New(usize),
    /// A bottom level registered by an earlier call.
    Registered(BottomLevelId),
}

/// One placed mesh occurrence: a bottom level plus its transform relative to the entity.
#[derive(Debug, Clone, Copy)]
pub struct TopLevelInstanceRef {
    pub geometry: GeometryRef,
    pub local_transform: Mat4,
}

impl TopLevelInstanceRef {
    pub fn new(geometry: GeometryRef, local_transform: Mat4) -> Self {
        Self {
            geometry,
            local_transform,
        }
    }
}

/// Handle of an entity registered with an acceleration-structure context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(u32);

impl EntityId {
    /// Wrap a raw selection index. Membership is checked when the id is used.
    ///
    /// Panics if `index` cannot name any entity.
    pub fn from_index(index: usize) -> Self {
        match u32::try_from(index) {
            Ok(index) => EntityId(index),
            Err(_) => panic!("entity index {} out of range", index),
        }
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Row-major 3×4 form of `m`: the top three rows of the 4×4.
pub fn pack_transform(m: &Mat4) -> [f32; 12] {
    let rows = m.transpose().to_cols_array();
    let mut out = [0.0; 12];
    out.copy_from_slice(&rows[..12]);
    out
}

/// Inverse of [`pack_transform`], with `(0, 0, 0, 1)` as the bottom row.
pub fn unpack_transform(packed: &[f32; 12]) -> Mat4 {
    let mut rows = [0.0; 16];
    rows[..12].copy_from_slice(packed);
    rows[15] = 1.0;
    Mat4::from_cols_array(&rows).transpose()
}

/// Pack a 24-bit value and an 8-bit value the way `VkPacked24_8` does.
pub fn pack_24_8(low_24: u32, high_8: u8) -> u32 {
    assert!(low_24 < (1 << 24), "value {} does not fit in 24 bits", low_24);
    low_24 | ((high_8 as u32) << 24)
}

/// One `VkAccelerationStructureInstanceKHR`, laid out byte-for-byte.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct InstanceRecord {
    pub transform: [f32; 12],
    pub custom_index_and_mask: u32,
    pub sbt_offset_and_flags: u32,
    pub acceleration_structure_reference: u64,
}

impl InstanceRecord {
    /// A double-sided, fully visible instance of the bottom level at `blas_address`.
    ///
    /// `custom_index` is exposed to shaders as `InstanceCustomIndex`.
    pub fn new(blas_address: u64, custom_index: u32, transform: &Mat4) -> Self {
        Self {
            transform: pack_transform(transform),
            custom_index_and_mask: pack_24_8(custom_index, INSTANCE_MASK),
            sbt_offset_and_flags: pack_24_8(0, INSTANCE_FLAG_CULL_DISABLE),
            acceleration_structure_reference: blas_address,
        }
    }

    pub fn set_transform(&mut self, transform: &Mat4) {
        self.transform = pack_transform(transform);
    }

    pub fn transform_matrix(&self) -> Mat4 {
        unpack_transform(&self.transform)
    }

    pub fn custom_index(&self) -> u32 {
        self.custom_index_and_mask & 0x00FF_FFFF
    }

    pub fn mask(&self) -> u8 {
        (self.custom_index_and_mask >> 24) as u8
    }

    pub fn flags(&self) -> u8 {
        (self.sbt_offset_and_flags >> 24) as u8
    }

    pub fn blas_address(&self) -> u64 {
        self.acceleration_structure_reference
    }
}

/// Per-entity bookkeeping: GPU records and the local transforms they were built from.
///
/// Both sequences are only ever written together, so they cannot drift apart.
#[derive(Debug, Clone, Default)]
pub struct EntityInstances {
    records: Vec<InstanceRecord>,
    local_transforms: Vec<Mat4>,
}

impl EntityInstances {
    pub(crate) fn push(&mut self, record: InstanceRecord, local_transform: Mat4) {
        self.records.push(record);
        self.local_transforms.push(local_transform);
    }

    /// Recompute every record as `global * local`.
    pub(crate) fn apply_global(&mut self, global: &Mat4) {
        for (record, local) in self.records.iter_mut().zip(&self.local_transforms) {
            record.set_transform(&(*global * *local));
        }
    }

    pub fn records(&self) -> &[InstanceRecord] {
        &self.records
    }

    pub fn local_transforms(&self) -> &[Mat4] {
        &self.local_transforms
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
