//! Acceleration-structure context behavior against a host-memory device.

use std::collections::{HashMap, HashSet};

use ash::vk;
use glam::{Mat4, Quat, Vec3};
use strata::accel::{
    AccelBackend, AccelLevel, AccelerationStructureContext, BottomLevelGeometry, BufferKind,
    BuildMode, BuildSizes, EntityId, GeometryRef, InstanceRecord, TopLevelInstanceRef,
};
use strata::error::{EngineError, Result};

const RECORD_SIZE: usize = std::mem::size_of::<InstanceRecord>();

struct FakeBuffer {
    address: u64,
    size: u64,
    kind: BufferKind,
}

#[derive(Debug, Clone, PartialEq)]
enum Event {
    CreateBuffer { kind: BufferKind, size: u64 },
    DestroyBuffer { address: u64 },
    CreateAccel { level: AccelLevel, handle: u64 },
    DestroyAccel { handle: u64 },
    BuildBottom { handle: u64 },
    BuildTop { handle: u64, mode: BuildMode, count: u32 },
}

/// Records every call and checks the invariants a real driver would rely on.
struct FakeDevice {
    alignment: u64,
    next_address: u64,
    next_handle: u64,
    memory: HashMap<u64, (BufferKind, Vec<u8>)>,
    handles: HashMap<u64, (AccelLevel, u64)>,
    built_bottom_addresses: HashSet<u64>,
    events: Vec<Event>,
    last_top_level: Vec<InstanceRecord>,
    top_update_scratch: u64,
    fail_top_level_build: bool,
}

impl FakeDevice {
    fn new() -> Self {
        Self {
            alignment: 128,
            // Deliberately misaligned so scratch alignment is exercised
            next_address: 0x1_0008,
            next_handle: 1,
            memory: HashMap::new(),
            handles: HashMap::new(),
            built_bottom_addresses: HashSet::new(),
            events: Vec::new(),
            last_top_level: Vec::new(),
            top_update_scratch: 32,
            fail_top_level_build: false,
        }
    }

    fn check_scratch(&self, scratch_address: u64, needed: u64) {
        assert_eq!(scratch_address % self.alignment, 0, "scratch address is not aligned");
        let (base, (_, bytes)) = self
            .memory
            .iter()
            .find(|(_, (kind, _))| *kind == BufferKind::Scratch)
            .expect("no scratch buffer is alive");
        assert!(scratch_address >= *base);
        assert!(
            scratch_address + needed <= base + bytes.len() as u64,
            "scratch buffer too small for build"
        );
    }

    fn creates_of(&self, kind: BufferKind) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, Event::CreateBuffer { kind: k, .. } if *k == kind))
            .count()
    }

    fn live_buffer_count(&self) -> usize {
        self.memory.len()
    }
}

impl AccelBackend for FakeDevice {
    type Buffer = FakeBuffer;
    type Handle = u64;

    fn scratch_alignment(&self) -> u64 {
        self.alignment
    }

    fn create_buffer(&mut self, size: u64, kind: BufferKind, _name: &str) -> Result<FakeBuffer> {
        let address = self.next_address;
        self.next_address += size + 0x108;
        self.memory.insert(address, (kind, vec![0; size as usize]));
        self.events.push(Event::CreateBuffer { kind, size });
        Ok(FakeBuffer { address, size, kind })
    }

    fn destroy_buffer(&mut self, buffer: FakeBuffer) {
        assert!(
            self.memory.remove(&buffer.address).is_some(),
            "double free of buffer at 0x{:X}",
            buffer.address
        );
        self.events.push(Event::DestroyBuffer {
            address: buffer.address,
        });
    }

    fn buffer_address(&self, buffer: &FakeBuffer) -> u64 {
        buffer.address
    }

    fn write_buffer(&mut self, buffer: &mut FakeBuffer, data: &[u8]) -> Result<()> {
        assert_eq!(buffer.kind, BufferKind::Instances);
        assert!(data.len() as u64 <= buffer.size, "write overflows buffer");
        let (_, bytes) = self.memory.get_mut(&buffer.address).expect("write to dead buffer");
        bytes[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn bottom_level_sizes(&self, geometry: &BottomLevelGeometry) -> Result<BuildSizes> {
        let triangles = geometry.primitive_count() as u64;
        Ok(BuildSizes {
            storage: 256 + triangles * 64,
            build_scratch: 128 + triangles * 32,
            update_scratch: 64,
        })
    }

    fn top_level_sizes(&self, _instance_address: u64, instance_count: u32) -> Result<BuildSizes> {
        let count = instance_count as u64;
        Ok(BuildSizes {
            storage: 128 + count * 64,
            build_scratch: 256 + count * 16,
            update_scratch: self.top_update_scratch,
        })
    }

    fn create_acceleration_structure(&mut self, level: AccelLevel, storage: &FakeBuffer, size: u64) -> Result<u64> {
        assert_eq!(storage.kind, BufferKind::AccelStorage);
        assert!(storage.size >= size, "storage smaller than structure");
        assert!(self.memory.contains_key(&storage.address), "storage buffer is dead");
        let handle = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(handle, (level, storage.address));
        self.events.push(Event::CreateAccel { level, handle });
        Ok(handle)
    }

    fn destroy_acceleration_structure(&mut self, handle: u64) {
        assert!(self.handles.remove(&handle).is_some(), "double destroy of {}", handle);
        self.events.push(Event::DestroyAccel { handle });
    }

    fn acceleration_structure_address(&self, handle: u64) -> u64 {
        self.handles[&handle].1
    }

    fn build_bottom_level(&mut self, dst: u64, geometry: &BottomLevelGeometry, scratch_address: u64) -> Result<()> {
        let needed = self.bottom_level_sizes(geometry)?.build_scratch;
        self.check_scratch(scratch_address, needed);
        let (level, address) = self.handles[&dst];
        assert_eq!(level, AccelLevel::Bottom);
        self.built_bottom_addresses.insert(address);
        self.events.push(Event::BuildBottom { handle: dst });
        Ok(())
    }

    fn build_top_level(
        &mut self,
        dst: u64,
        instance_address: u64,
        instance_count: u32,
        scratch_address: u64,
        mode: BuildMode,
    ) -> Result<()> {
        if self.fail_top_level_build {
            return Err(EngineError::vulkan(
                "vkCmdBuildAccelerationStructuresKHR",
                vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            ));
        }
        let needed = self
            .top_level_sizes(instance_address, instance_count)?
            .scratch_for(mode);
        self.check_scratch(scratch_address, needed);
        assert_eq!(self.handles[&dst].0, AccelLevel::Top);

        let (_, bytes) = &self.memory[&instance_address];
        let records: Vec<InstanceRecord> = bytes
            .chunks_exact(RECORD_SIZE)
            .take(instance_count as usize)
            .map(bytemuck::pod_read_unaligned)
            .collect();
        for record in &records {
            assert!(
                self.built_bottom_addresses.contains(&record.blas_address()),
                "instance references a bottom level that was never built"
            );
        }
        self.last_top_level = records;
        self.events.push(Event::BuildTop {
            handle: dst,
            mode,
            count: instance_count,
        });
        Ok(())
    }
}

fn triangle_geometry(base: u64) -> BottomLevelGeometry {
    BottomLevelGeometry::new(base, base + 0x100, 12, 3, 3)
}

fn quad_geometry(base: u64) -> BottomLevelGeometry {
    BottomLevelGeometry::new(base, base + 0x100, 32, 4, 6)
}

fn instance(geometry: GeometryRef, transform: Mat4) -> TopLevelInstanceRef {
    TopLevelInstanceRef::new(geometry, transform)
}

fn assert_parallel(ctx: &AccelerationStructureContext<FakeDevice>) {
    for index in 0..ctx.entity_count() {
        let id = EntityId::from_index(index);
        assert_eq!(ctx.instance_records(id).len(), ctx.local_transforms(id).len());
    }
}

#[test]
fn single_triangle_builds_one_bottom_and_one_instance() {
    let mut device = FakeDevice::new();
    let mut ctx = AccelerationStructureContext::new();

    let entity = ctx
        .register_geometry(
            &mut device,
            &[triangle_geometry(0xA000)],
            &[instance(GeometryRef::New(0), Mat4::IDENTITY)],
        )
        .unwrap();

    assert_eq!(entity, EntityId::from_index(0));
    assert_eq!(ctx.bottom_level_count(), 1);
    assert_eq!(ctx.instance_count(), 1);
    assert!(ctx.top_level().is_some());
    assert_eq!(device.last_top_level.len(), 1);
    assert_eq!(device.last_top_level[0].custom_index(), 0);
    assert_eq!(device.last_top_level[0].mask(), 0xFF);
}

#[test]
fn second_registration_keeps_first_entity_unchanged() {
    let mut device = FakeDevice::new();
    let mut ctx = AccelerationStructureContext::new();

    let first_transform = Mat4::from_translation(Vec3::new(1.0, 0.0, 0.0));
    let first = ctx
        .register_geometry(
            &mut device,
            &[triangle_geometry(0xA000)],
            &[instance(GeometryRef::New(0), first_transform)],
        )
        .unwrap();
    let first_records = ctx.instance_records(first).to_vec();

    let second = ctx
        .register_geometry(
            &mut device,
            &[quad_geometry(0xB000)],
            &[instance(GeometryRef::New(0), Mat4::from_scale(Vec3::splat(2.0)))],
        )
        .unwrap();

    assert_eq!(ctx.bottom_level_count(), 2);
    assert_eq!(ctx.entity_count(), 2);
    assert_eq!(ctx.instance_records(first), first_records.as_slice());
    assert_eq!(device.last_top_level[0], first_records[0]);

    // New geometry resolves past the bottom levels that already existed
    let second_record = ctx.instance_records(second)[0];
    assert_eq!(second_record.custom_index(), 1);
    assert_eq!(
        Some(second_record.blas_address()),
        ctx.bottom_level_address(ctx.bottom_level_id(1).unwrap())
    );
    assert_eq!(device.last_top_level.len(), 2);
}

#[test]
fn bottom_level_count_is_sum_of_geometry_lists() {
    let mut device = FakeDevice::new();
    let mut ctx = AccelerationStructureContext::new();
    let batches = [2usize, 0, 3, 1];
    let mut expected = 0;

    for (call, &count) in batches.iter().enumerate() {
        let geometries: Vec<BottomLevelGeometry> = (0..count)
            .map(|i| triangle_geometry(0x10_0000 * (call as u64 + 1) + 0x1000 * i as u64))
            .collect();
        let instances: Vec<TopLevelInstanceRef> = (0..count)
            .map(|i| instance(GeometryRef::New(i), Mat4::IDENTITY))
            .collect();
        ctx.register_geometry(&mut device, &geometries, &instances).unwrap();
        expected += count;
        assert_eq!(ctx.bottom_level_count(), expected);
        assert_parallel(&ctx);
    }
}

#[test]
fn identity_update_reproduces_local_transforms() {
    let mut device = FakeDevice::new();
    let mut ctx = AccelerationStructureContext::new();

    let locals = [
        Mat4::from_translation(Vec3::new(0.0, 3.0, -2.0)),
        Mat4::from_scale_rotation_translation(
            Vec3::new(1.0, 2.0, 1.0),
            Quat::from_rotation_x(0.4),
            Vec3::new(5.0, 0.0, 1.0),
        ),
    ];
    let entity = ctx
        .register_geometry(
            &mut device,
            &[triangle_geometry(0xA000), quad_geometry(0xB000)],
            &[
                instance(GeometryRef::New(0), locals[0]),
                instance(GeometryRef::New(1), locals[1]),
            ],
        )
        .unwrap();

    ctx.update_instance_transform(&mut device, entity, &Mat4::IDENTITY)
        .unwrap();

    for (record, local) in device.last_top_level.iter().zip(&locals) {
        assert!(record.transform_matrix().abs_diff_eq(*local, 1e-6));
    }
    assert_eq!(ctx.local_transforms(entity), &locals);
}

#[test]
fn update_composes_global_with_each_local() {
    let mut device = FakeDevice::new();
    let mut ctx = AccelerationStructureContext::new();

    let locals = [
        Mat4::from_translation(Vec3::X),
        Mat4::from_rotation_y(1.2),
        Mat4::from_scale(Vec3::new(0.5, 0.5, 0.5)),
    ];
    let instances: Vec<TopLevelInstanceRef> = locals
        .iter()
        .map(|l| instance(GeometryRef::New(0), *l))
        .collect();

    let static_entity = ctx
        .register_geometry(&mut device, &[triangle_geometry(0xA000)], &[instance(GeometryRef::New(0), Mat4::IDENTITY)])
        .unwrap();
    let moving = ctx
        .register_geometry(&mut device, &[quad_geometry(0xB000)], &instances)
        .unwrap();

    let global = Mat4::from_rotation_translation(Quat::from_rotation_z(0.3), Vec3::new(10.0, -1.0, 4.0));
    ctx.update_instance_transform(&mut device, moving, &global)
        .unwrap();

    for (i, local) in locals.iter().enumerate() {
        let expected = (global * *local).transpose().to_cols_array();
        let record = ctx.instance_records(moving)[i];
        for (got, want) in record.transform.iter().zip(&expected[..12]) {
            assert!((got - want).abs() < 1e-5, "{got} != {want}");
        }
        // Entity order then instance order: the static entity comes first
        assert_eq!(device.last_top_level[1 + i], record);
    }
    assert_eq!(ctx.instance_records(static_entity)[0].transform_matrix(), Mat4::IDENTITY);
    assert_parallel(&ctx);
}

#[test]
#[should_panic(expected = "out of range")]
fn update_on_unknown_entity_panics() {
    let mut device = FakeDevice::new();
    let mut ctx = AccelerationStructureContext::new();
    ctx.register_geometry(&mut device, &[triangle_geometry(0xA000)], &[instance(GeometryRef::New(0), Mat4::IDENTITY)])
        .unwrap();

    let _ = ctx.update_instance_transform(&mut device, EntityId::from_index(1), &Mat4::IDENTITY);
}

#[test]
fn rebuild_retires_old_top_level_after_new_one_is_built() {
    let mut device = FakeDevice::new();
    let mut ctx = AccelerationStructureContext::new();

    ctx.register_geometry(&mut device, &[triangle_geometry(0xA000)], &[instance(GeometryRef::New(0), Mat4::IDENTITY)])
        .unwrap();
    let old = ctx.top_level().unwrap();
    device.events.clear();

    ctx.register_geometry(&mut device, &[quad_geometry(0xB000)], &[instance(GeometryRef::New(0), Mat4::IDENTITY)])
        .unwrap();
    let new = ctx.top_level().unwrap();
    assert_ne!(old, new);

    let created = device
        .events
        .iter()
        .position(|e| *e == Event::CreateAccel { level: AccelLevel::Top, handle: new })
        .unwrap();
    let destroyed = device
        .events
        .iter()
        .position(|e| *e == Event::DestroyAccel { handle: old })
        .unwrap();
    let built = device
        .events
        .iter()
        .position(|e| matches!(e, Event::BuildTop { handle, mode: BuildMode::Build, .. } if *handle == new))
        .unwrap();
    assert!(created < built);
    assert!(built < destroyed);

    // Bottom-level builds happen before the top-level build that references them
    let bottom_built = device
        .events
        .iter()
        .position(|e| matches!(e, Event::BuildBottom { .. }))
        .unwrap();
    assert!(bottom_built < built);
}

#[test]
fn outgrown_storage_is_released_after_the_new_build() {
    let mut device = FakeDevice::new();
    let mut ctx = AccelerationStructureContext::new();

    ctx.register_geometry(&mut device, &[triangle_geometry(0xA000)], &[instance(GeometryRef::New(0), Mat4::IDENTITY)])
        .unwrap();
    let first_capacity = ctx.top_level_storage_capacity();
    device.events.clear();

    let shared = ctx.bottom_level_id(0).unwrap();
    let many: Vec<TopLevelInstanceRef> = (0..8)
        .map(|i| instance(GeometryRef::Registered(shared), Mat4::from_translation(Vec3::X * i as f32)))
        .collect();
    ctx.register_geometry(&mut device, &[], &many).unwrap();
    assert!(ctx.top_level_storage_capacity() > first_capacity);

    let built = device
        .events
        .iter()
        .position(|e| matches!(e, Event::BuildTop { mode: BuildMode::Build, .. }))
        .unwrap();
    let released = device
        .events
        .iter()
        .rposition(|e| matches!(e, Event::DestroyBuffer { .. }))
        .unwrap();
    assert!(built < released);
    assert_eq!(device.creates_of(BufferKind::AccelStorage), 1);
}

#[test]
fn update_reuses_instance_and_storage_buffers() {
    let mut device = FakeDevice::new();
    let mut ctx = AccelerationStructureContext::new();

    let entity = ctx
        .register_geometry(&mut device, &[triangle_geometry(0xA000)], &[instance(GeometryRef::New(0), Mat4::IDENTITY)])
        .unwrap();
    let top_level = ctx.top_level();
    device.events.clear();

    for step in 0..5 {
        let global = Mat4::from_translation(Vec3::new(step as f32, 0.0, 0.0));
        ctx.update_instance_transform(&mut device, entity, &global)
            .unwrap();
    }

    assert_eq!(ctx.top_level(), top_level);
    assert!(device
        .events
        .iter()
        .all(|e| matches!(e, Event::BuildTop { mode: BuildMode::Update, count: 1, .. })));
    assert_eq!(device.events.len(), 5);
    assert!(device.last_top_level[0]
        .transform_matrix()
        .abs_diff_eq(Mat4::from_translation(Vec3::new(4.0, 0.0, 0.0)), 1e-6));
}

#[test]
fn update_grows_scratch_when_refit_needs_more() {
    let mut device = FakeDevice::new();
    let mut ctx = AccelerationStructureContext::new();

    let entity = ctx
        .register_geometry(&mut device, &[triangle_geometry(0xA000)], &[instance(GeometryRef::New(0), Mat4::IDENTITY)])
        .unwrap();
    let before = ctx.scratch_capacity();
    let instance_capacity = ctx.instance_buffer_capacity();
    let storage_capacity = ctx.top_level_storage_capacity();

    device.top_update_scratch = before * 4;
    device.events.clear();
    ctx.update_instance_transform(&mut device, entity, &Mat4::from_rotation_x(0.5))
        .unwrap();

    assert!(ctx.scratch_capacity() > before);
    assert_eq!(device.creates_of(BufferKind::Scratch), 1);
    assert_eq!(device.creates_of(BufferKind::Instances), 0);
    assert_eq!(device.creates_of(BufferKind::AccelStorage), 0);
    assert_eq!(ctx.instance_buffer_capacity(), instance_capacity);
    assert_eq!(ctx.top_level_storage_capacity(), storage_capacity);
}

#[test]
fn scratch_never_shrinks() {
    let mut device = FakeDevice::new();
    let mut ctx = AccelerationStructureContext::new();

    let big = BottomLevelGeometry::new(0xA000, 0xA100, 12, 300, 300);
    ctx.register_geometry(&mut device, &[big], &[instance(GeometryRef::New(0), Mat4::IDENTITY)])
        .unwrap();
    let after_big = ctx.scratch_capacity();

    ctx.register_geometry(&mut device, &[triangle_geometry(0xB000)], &[instance(GeometryRef::New(0), Mat4::IDENTITY)])
        .unwrap();
    assert_eq!(ctx.scratch_capacity(), after_big);
    assert_eq!(device.creates_of(BufferKind::Scratch), 1);
}

#[test]
fn registered_reference_shares_existing_bottom_level() {
    let mut device = FakeDevice::new();
    let mut ctx = AccelerationStructureContext::new();

    ctx.register_geometry(&mut device, &[triangle_geometry(0xA000)], &[instance(GeometryRef::New(0), Mat4::IDENTITY)])
        .unwrap();
    let shared = ctx.bottom_level_id(0).unwrap();

    let entity = ctx
        .register_geometry(
            &mut device,
            &[],
            &[
                instance(GeometryRef::Registered(shared), Mat4::from_translation(Vec3::Y)),
                instance(GeometryRef::Registered(shared), Mat4::from_translation(Vec3::Z)),
            ],
        )
        .unwrap();

    assert_eq!(ctx.bottom_level_count(), 1);
    assert_eq!(ctx.instance_count(), 3);
    for record in ctx.instance_records(entity) {
        assert_eq!(record.custom_index(), 0);
        assert_eq!(Some(record.blas_address()), ctx.bottom_level_address(shared));
    }
}

#[test]
fn bad_geometry_reference_panics_before_device_work() {
    let mut device = FakeDevice::new();
    let mut ctx = AccelerationStructureContext::new();

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let _ = ctx.register_geometry(
            &mut device,
            &[triangle_geometry(0xA000)],
            &[instance(GeometryRef::New(1), Mat4::IDENTITY)],
        );
    }));

    assert!(result.is_err());
    assert!(device.events.is_empty());
}

#[test]
fn failed_top_level_build_names_the_stage() {
    let mut device = FakeDevice::new();
    device.fail_top_level_build = true;
    let mut ctx = AccelerationStructureContext::new();

    let err = ctx
        .register_geometry(&mut device, &[triangle_geometry(0xA000)], &[instance(GeometryRef::New(0), Mat4::IDENTITY)])
        .unwrap_err();
    assert!(err.to_string().contains("top-level build"), "{err}");
    ctx.destroy(&mut device);
}

#[test]
fn failed_top_level_build_withdraws_the_entity() {
    let mut device = FakeDevice::new();
    let mut ctx = AccelerationStructureContext::new();

    let first = ctx
        .register_geometry(&mut device, &[triangle_geometry(0xA000)], &[instance(GeometryRef::New(0), Mat4::IDENTITY)])
        .unwrap();
    device.fail_top_level_build = true;
    let err = ctx.register_geometry(&mut device, &[quad_geometry(0xB000)], &[instance(GeometryRef::New(0), Mat4::IDENTITY)]);
    assert!(err.is_err());
    assert_eq!(ctx.entity_count(), 1);
    assert_eq!(ctx.instance_count(), 1);
    // The bottom level of the failed call stays registered
    assert_eq!(ctx.bottom_level_count(), 2);

    device.fail_top_level_build = false;
    let quad = ctx.bottom_level_id(1).unwrap();
    let second = ctx
        .register_geometry(&mut device, &[], &[instance(GeometryRef::Registered(quad), Mat4::IDENTITY)])
        .unwrap();
    assert_eq!(first.index(), 0);
    assert_eq!(second.index(), 1);
    ctx.update_instance_transform(&mut device, second, &Mat4::from_translation(Vec3::Y))
        .unwrap();
    assert_eq!(device.last_top_level.len(), 2);
    assert_parallel(&ctx);
    ctx.destroy(&mut device);
    assert_eq!(device.live_buffer_count(), 0);
    assert!(device.handles.is_empty());
}

#[test]
fn refit_after_failed_rebuild_panics() {
    let mut device = FakeDevice::new();
    let mut ctx = AccelerationStructureContext::new();

    let first = ctx
        .register_geometry(&mut device, &[triangle_geometry(0xA000)], &[instance(GeometryRef::New(0), Mat4::IDENTITY)])
        .unwrap();
    device.fail_top_level_build = true;
    let shared = ctx.bottom_level_id(0).unwrap();
    assert!(ctx
        .register_geometry(&mut device, &[], &[instance(GeometryRef::Registered(shared), Mat4::IDENTITY)])
        .is_err());

    device.fail_top_level_build = false;
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let _ = ctx.update_instance_transform(&mut device, first, &Mat4::IDENTITY);
    }));
    assert!(result.is_err());
}

#[test]
fn wrapped_entity_index_never_moves_another_entity() {
    let mut device = FakeDevice::new();
    let mut ctx = AccelerationStructureContext::new();
    let entity = ctx
        .register_geometry(&mut device, &[triangle_geometry(0xA000)], &[instance(GeometryRef::New(0), Mat4::IDENTITY)])
        .unwrap();

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let wrapped = EntityId::from_index(u32::MAX as usize + 1);
        let _ = ctx.update_instance_transform(&mut device, wrapped, &Mat4::from_translation(Vec3::X));
    }));

    assert!(result.is_err());
    assert_eq!(ctx.instance_records(entity)[0].transform_matrix(), Mat4::IDENTITY);
}

#[test]
fn destroy_releases_every_resource() {
    let mut device = FakeDevice::new();
    let mut ctx = AccelerationStructureContext::new();

    ctx.register_geometry(&mut device, &[triangle_geometry(0xA000), quad_geometry(0xB000)], &[instance(GeometryRef::New(1), Mat4::IDENTITY)])
        .unwrap();
    ctx.register_geometry(&mut device, &[triangle_geometry(0xC000)], &[instance(GeometryRef::New(0), Mat4::IDENTITY)])
        .unwrap();

    ctx.destroy(&mut device);

    assert_eq!(device.live_buffer_count(), 0);
    assert!(device.handles.is_empty());
    assert_eq!(ctx.bottom_level_count(), 0);
    assert_eq!(ctx.entity_count(), 0);
    assert!(ctx.top_level().is_none());
}
