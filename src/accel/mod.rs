//! Two-level acceleration structures for a live-edited scene.
//!
//! Bottom levels are built once per mesh and never change. The single top level is rebuilt
//! whenever instances are added and refit in place when an entity only moves. Every build is
//! synchronous, so a top level replaced during a call is destroyed once its successor's build
//! has returned.

mod backend;
mod instances;

pub use backend::{
    AccelBackend, AccelLevel, BufferKind, BuildMode, BuildSizes, BOTTOM_LEVEL_BUILD_FLAGS,
    TOP_LEVEL_BUILD_FLAGS,
};
pub use instances::{
    pack_24_8, pack_transform, unpack_transform, BottomLevelGeometry, BottomLevelId, EntityId,
    EntityInstances, GeometryRef, InstanceRecord, TopLevelInstanceRef, INSTANCE_FLAG_CULL_DISABLE,
    INSTANCE_MASK,
};

use glam::Mat4;
use log::{debug, info};

use crate::allocator::align_up;
use crate::error::{AccelStage, Result};

const INSTANCE_RECORD_SIZE: u64 = std::mem::size_of::<InstanceRecord>() as u64;

struct BottomLevel<B: AccelBackend> {
    handle: B::Handle,
    storage: B::Buffer,
    address: u64,
}

/// A buffer together with the size it was created with.
struct SizedBuffer<T> {
    buffer: T,
    capacity: u64,
}

/// Top-level resources swapped out by a rebuild, destroyed after the replacement is built.
struct Retired<B: AccelBackend> {
    handle: Option<B::Handle>,
    storage: Option<B::Buffer>,
}

impl<B: AccelBackend> Retired<B> {
    fn release(self, backend: &mut B) {
        if let Some(handle) = self.handle {
            backend.destroy_acceleration_structure(handle);
        }
        if let Some(storage) = self.storage {
            backend.destroy_buffer(storage);
        }
    }
}

/// Owns every acceleration structure of a scene plus the buffers used to build them.
pub struct AccelerationStructureContext<B: AccelBackend> {
    bottom_levels: Vec<BottomLevel<B>>,
    top_level: Option<B::Handle>,
    /// Instance count of the last top-level build that completed; `None` until one has.
    built_instance_count: Option<usize>,
    entities: Vec<EntityInstances>,
    scratch: Option<SizedBuffer<B::Buffer>>,
    instances: Option<SizedBuffer<B::Buffer>>,
    top_level_storage: Option<SizedBuffer<B::Buffer>>,
}

impl<B: AccelBackend> Default for AccelerationStructureContext<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: AccelBackend> AccelerationStructureContext<B> {
    pub fn new() -> Self {
        Self {
            bottom_levels: Vec::new(),
            top_level: None,
            built_instance_count: None,
            entities: Vec::new(),
            scratch: None,
            instances: None,
            top_level_storage: None,
        }
    }

    /// Build bottom levels for `geometries`, add `instances` as a new entity and rebuild the
    /// top level over every entity.
    ///
    /// `GeometryRef::New(i)` refers to `geometries[i]`; `GeometryRef::Registered` refers to a
    /// bottom level from an earlier call. Any other reference panics before device work starts.
    pub fn register_geometry(
        &mut self,
        backend: &mut B,
        geometries: &[BottomLevelGeometry],
        instances: &[TopLevelInstanceRef],
    ) -> Result<EntityId> {
        let offset = self.bottom_levels.len();
        let blas_indices: Vec<usize> = instances
            .iter()
            .map(|instance| resolve_geometry(instance.geometry, offset, geometries.len()))
            .collect();

        let sizes = geometries
            .iter()
            .map(|g| backend.bottom_level_sizes(g))
            .collect::<Result<Vec<BuildSizes>>>()
            .map_err(|e| e.in_stage(AccelStage::BottomLevelBuild))?;

        if let Some(max_scratch) = sizes.iter().map(|s| s.build_scratch).max() {
            self.ensure_scratch(backend, max_scratch)?;
        }

        for (geometry, size) in geometries.iter().zip(&sizes) {
            self.build_bottom_level(backend, geometry, size)
                .map_err(|e| e.in_stage(AccelStage::BottomLevelBuild))?;
        }
        if !geometries.is_empty() {
            info!(
                "Built {} bottom-level structures ({} total)",
                geometries.len(),
                self.bottom_levels.len()
            );
        }

        let mut entity = EntityInstances::default();
        for (instance, &blas_index) in instances.iter().zip(&blas_indices) {
            let record = InstanceRecord::new(
                self.bottom_levels[blas_index].address,
                blas_index as u32,
                &instance.local_transform,
            );
            entity.push(record, instance.local_transform);
        }
        let id = EntityId::from_index(self.entities.len());
        self.entities.push(entity);

        // Bottom levels built above stay registered; only the entity is withdrawn.
        if let Err(e) = self.build_top_level(backend, BuildMode::Build) {
            self.entities.pop();
            return Err(e);
        }
        Ok(id)
    }

    /// Move `entity` to `global` and refit the top level in place.
    ///
    /// Panics if `entity` was never registered.
    pub fn update_instance_transform(&mut self, backend: &mut B, entity: EntityId, global: &Mat4) -> Result<()> {
        assert!(
            entity.index() < self.entities.len(),
            "entity index {} out of range ({} entities registered)",
            entity.index(),
            self.entities.len()
        );
        self.entities[entity.index()].apply_global(global);
        self.build_top_level(backend, BuildMode::Update)
    }

    fn build_bottom_level(&mut self, backend: &mut B, geometry: &BottomLevelGeometry, sizes: &BuildSizes) -> Result<()> {
        let index = self.bottom_levels.len();
        let storage = backend.create_buffer(sizes.storage, BufferKind::AccelStorage, &format!("blas_{}", index))?;
        let handle = match backend.create_acceleration_structure(AccelLevel::Bottom, &storage, sizes.storage) {
            Ok(handle) => handle,
            Err(e) => {
                backend.destroy_buffer(storage);
                return Err(e);
            }
        };
        let address = backend.acceleration_structure_address(handle);
        self.bottom_levels.push(BottomLevel {
            handle,
            storage,
            address,
        });

        let scratch_address = self.scratch_address(backend);
        backend.build_bottom_level(handle, geometry, scratch_address)?;
        debug!(
            "Bottom level {}: {} triangles, {} bytes at 0x{:016X}",
            index,
            geometry.primitive_count(),
            sizes.storage,
            address
        );
        Ok(())
    }

    fn build_top_level(&mut self, backend: &mut B, mode: BuildMode) -> Result<()> {
        let stage = match mode {
            BuildMode::Build => AccelStage::TopLevelBuild,
            BuildMode::Update => AccelStage::TopLevelUpdate,
        };

        let flattened: Vec<InstanceRecord> = self
            .entities
            .iter()
            .flat_map(|e| e.records().iter().copied())
            .collect();
        let instance_count = flattened.len();
        let bytes: &[u8] = bytemuck::cast_slice(&flattened);

        match mode {
            BuildMode::Build => {
                let required = (bytes.len() as u64).max(INSTANCE_RECORD_SIZE);
                ensure_capacity(backend, &mut self.instances, required, BufferKind::Instances, "tlas_instances")
                    .map_err(|e| e.in_stage(AccelStage::InstanceUpload))?;
            }
            BuildMode::Update => {
                assert!(
                    self.top_level.is_some() && self.built_instance_count == Some(instance_count),
                    "top-level update requires an existing build over the same instances ({:?} built, got {})",
                    self.built_instance_count,
                    instance_count
                );
            }
        }

        let Some(instance_buffer) = self.instances.as_mut() else {
            unreachable!("instance buffer exists after a top-level build");
        };
        backend
            .write_buffer(&mut instance_buffer.buffer, bytes)
            .map_err(|e| e.in_stage(AccelStage::InstanceUpload))?;
        let instance_address = backend.buffer_address(&instance_buffer.buffer);

        let sizes = backend
            .top_level_sizes(instance_address, instance_count as u32)
            .map_err(|e| e.in_stage(stage))?;
        self.ensure_scratch(backend, sizes.scratch_for(mode))?;

        let retired = match mode {
            BuildMode::Build => {
                self.built_instance_count = None;
                Some(
                    self.recreate_top_level(backend, sizes.storage)
                        .map_err(|e| e.in_stage(AccelStage::StorageGrowth))?,
                )
            }
            BuildMode::Update => None,
        };

        let Some(top_level) = self.top_level else {
            unreachable!("top level exists after a top-level build");
        };
        let scratch_address = self.scratch_address(backend);
        let built = backend
            .build_top_level(top_level, instance_address, instance_count as u32, scratch_address, mode)
            .map_err(|e| e.in_stage(stage));
        if let Some(retired) = retired {
            retired.release(backend);
        }
        built?;

        if mode == BuildMode::Build {
            self.built_instance_count = Some(instance_count);
            info!(
                "Top level rebuilt: {} instances across {} entities, {} bytes",
                instance_count,
                self.entities.len(),
                sizes.storage
            );
        }
        Ok(())
    }

    /// Create a new top-level handle, growing its storage if needed. The old handle and any
    /// outgrown storage come back for release once the new handle is built.
    ///
    /// When the storage fits, both handles share it. Building the new one overwrites the old
    /// one's contents, so the old handle is only kept alive, never traced, until then.
    fn recreate_top_level(&mut self, backend: &mut B, storage_size: u64) -> Result<Retired<B>> {
        let fits = self
            .top_level_storage
            .as_ref()
            .is_some_and(|s| s.capacity >= storage_size);

        let grown = if fits {
            None
        } else {
            let buffer = backend.create_buffer(storage_size, BufferKind::AccelStorage, "tlas_storage")?;
            Some(SizedBuffer {
                buffer,
                capacity: storage_size,
            })
        };

        let created = {
            let storage = match (&grown, &self.top_level_storage) {
                (Some(new), _) => &new.buffer,
                (None, Some(existing)) => &existing.buffer,
                (None, None) => unreachable!("storage either fits or was just created"),
            };
            backend.create_acceleration_structure(AccelLevel::Top, storage, storage_size)
        };
        let handle = match created {
            Ok(handle) => handle,
            Err(e) => {
                if let Some(new) = grown {
                    backend.destroy_buffer(new.buffer);
                }
                return Err(e);
            }
        };

        let mut retired = Retired {
            handle: self.top_level.replace(handle),
            storage: None,
        };
        if let Some(new) = grown {
            retired.storage = self.top_level_storage.replace(new).map(|old| old.buffer);
            info!("Top-level storage grown to {} bytes", storage_size);
        }
        Ok(retired)
    }

    fn ensure_scratch(&mut self, backend: &mut B, size: u64) -> Result<()> {
        let alignment = backend.scratch_alignment();
        let slack = if alignment > 1 { alignment - 1 } else { 0 };
        let grew = ensure_capacity(backend, &mut self.scratch, size + slack, BufferKind::Scratch, "accel_scratch")
            .map_err(|e| e.in_stage(AccelStage::ScratchGrowth))?;
        if grew {
            info!("Scratch buffer grown to {} bytes", size + slack);
        }
        Ok(())
    }

    fn scratch_address(&self, backend: &B) -> u64 {
        let Some(scratch) = self.scratch.as_ref() else {
            unreachable!("scratch buffer is sized before every build");
        };
        align_up(backend.buffer_address(&scratch.buffer), backend.scratch_alignment())
    }

    /// The current top-level structure, if anything has been registered.
    pub fn top_level(&self) -> Option<B::Handle> {
        self.top_level
    }

    pub fn bottom_level_count(&self) -> usize {
        self.bottom_levels.len()
    }

    pub fn bottom_level(&self, id: BottomLevelId) -> Option<B::Handle> {
        self.bottom_levels.get(id.index()).map(|b| b.handle)
    }

    pub fn bottom_level_address(&self, id: BottomLevelId) -> Option<u64> {
        self.bottom_levels.get(id.index()).map(|b| b.address)
    }

    /// Id of the `index`-th bottom level, if it exists.
    pub fn bottom_level_id(&self, index: usize) -> Option<BottomLevelId> {
        (index < self.bottom_levels.len()).then_some(BottomLevelId(index as u32))
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Total instance count across all entities.
    pub fn instance_count(&self) -> usize {
        self.entities.iter().map(EntityInstances::len).sum()
    }

    pub fn entity(&self, entity: EntityId) -> Option<&EntityInstances> {
        self.entities.get(entity.index())
    }

    pub fn instance_records(&self, entity: EntityId) -> &[InstanceRecord] {
        self.entity_or_panic(entity).records()
    }

    pub fn local_transforms(&self, entity: EntityId) -> &[Mat4] {
        self.entity_or_panic(entity).local_transforms()
    }

    fn entity_or_panic(&self, entity: EntityId) -> &EntityInstances {
        self.entities.get(entity.index()).unwrap_or_else(|| {
            panic!(
                "entity index {} out of range ({} entities registered)",
                entity.index(),
                self.entities.len()
            )
        })
    }

    pub fn scratch_capacity(&self) -> u64 {
        self.scratch.as_ref().map_or(0, |s| s.capacity)
    }

    pub fn instance_buffer_capacity(&self) -> u64 {
        self.instances.as_ref().map_or(0, |s| s.capacity)
    }

    pub fn top_level_storage_capacity(&self) -> u64 {
        self.top_level_storage.as_ref().map_or(0, |s| s.capacity)
    }

    /// Destroy every structure and buffer. The context is empty afterwards.
    pub fn destroy(&mut self, backend: &mut B) {
        if let Some(top_level) = self.top_level.take() {
            backend.destroy_acceleration_structure(top_level);
        }
        for sized in [
            self.top_level_storage.take(),
            self.instances.take(),
            self.scratch.take(),
        ]
        .into_iter()
        .flatten()
        {
            backend.destroy_buffer(sized.buffer);
        }
        for blas in self.bottom_levels.drain(..) {
            backend.destroy_acceleration_structure(blas.handle);
            backend.destroy_buffer(blas.storage);
        }
        self.entities.clear();
        self.built_instance_count = None;
    }
}

fn resolve_geometry(geometry: GeometryRef, offset: usize, new_count: usize) -> usize {
    match geometry {
        GeometryRef::New(i) => {
            assert!(
                i < new_count,
                "instance references new geometry {} but only {} were supplied",
                i,
                new_count
            );
            offset + i
        }
        GeometryRef::Registered(id) => {
            assert!(
                id.index() < offset,
                "instance references bottom level {} but only {} are registered",
                id.index(),
                offset
            );
            id.index()
        }
    }
}

/// Make sure `slot` holds a buffer of at least `required` bytes, replacing it if not.
///
/// Returns whether a new buffer was created. Contents are not preserved.
fn ensure_capacity<B: AccelBackend>(
    backend: &mut B,
    slot: &mut Option<SizedBuffer<B::Buffer>>,
    required: u64,
    kind: BufferKind,
    name: &str,
) -> Result<bool> {
    if slot.as_ref().is_some_and(|s| s.capacity >= required) {
        return Ok(false);
    }
    if let Some(old) = slot.take() {
        backend.destroy_buffer(old.buffer);
    }
    let buffer = backend.create_buffer(required, kind, name)?;
    *slot = Some(SizedBuffer {
        buffer,
        capacity: required,
    });
    Ok(true)
}
