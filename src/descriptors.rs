//! Descriptor set layouts, growable descriptor pools and batched descriptor writes.

use ash::vk;
use log::info;

use crate::error::{EngineError, Result};

/// Upper bound on the set count of any single pool created by the growable allocator.
pub const MAX_SETS_PER_POOL: u32 = 4092;

// ===========================================================================
// Layout builder
// ===========================================================================

/// Collects bindings (and per-binding flags) for one descriptor set layout.
#[derive(Default)]
pub struct DescriptorLayoutBuilder {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'static>>,
    binding_flags: Vec<vk::DescriptorBindingFlags>,
}

impl DescriptorLayoutBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a single-descriptor binding.
    pub fn add_binding(mut self, binding: u32, ty: vk::DescriptorType) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(ty)
                .descriptor_count(1),
        );
        self.binding_flags.push(vk::DescriptorBindingFlags::empty());
        self
    }

    /// Add a single-descriptor binding with explicit binding flags.
    pub fn add_binding_with_flags(
        mut self,
        binding: u32,
        ty: vk::DescriptorType,
        flags: vk::DescriptorBindingFlags,
    ) -> Self {
        self = self.add_binding(binding, ty);
        if let Some(last) = self.binding_flags.last_mut() {
            *last = flags;
        }
        self
    }

    /// Add a binding that shaders index dynamically.
    ///
    /// The binding is partially bound, updatable after bind, and its actual size is chosen at
    /// allocation time (up to `max_count`). It must be the highest-numbered binding in the set.
    pub fn add_bindless_binding(mut self, binding: u32, ty: vk::DescriptorType, max_count: u32) -> Self {
        assert!(
            self.bindings.iter().all(|b| b.binding < binding),
            "variable-count binding {} must be the last binding in the set",
            binding
        );
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(ty)
                .descriptor_count(max_count),
        );
        self.binding_flags.push(
            vk::DescriptorBindingFlags::PARTIALLY_BOUND
                | vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT
                | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND,
        );
        self
    }

    pub fn bindings(&self) -> &[vk::DescriptorSetLayoutBinding<'static>] {
        &self.bindings
    }

    pub fn binding_flags(&self) -> &[vk::DescriptorBindingFlags] {
        &self.binding_flags
    }

    /// Layout create flags implied by the bindings added so far.
    pub fn create_flags(&self) -> vk::DescriptorSetLayoutCreateFlags {
        if self
            .binding_flags
            .iter()
            .any(|f| f.contains(vk::DescriptorBindingFlags::UPDATE_AFTER_BIND))
        {
            vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL
        } else {
            vk::DescriptorSetLayoutCreateFlags::empty()
        }
    }

    pub fn build(&self, device: &ash::Device, stages: vk::ShaderStageFlags) -> Result<vk::DescriptorSetLayout> {
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = self
            .bindings
            .iter()
            .map(|b| b.stage_flags(stages))
            .collect();

        let mut flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&self.binding_flags);

        let mut layout_info = vk::DescriptorSetLayoutCreateInfo::default()
            .bindings(&bindings)
            .flags(self.create_flags());
        if self.binding_flags.iter().any(|f| !f.is_empty()) {
            layout_info = layout_info.push_next(&mut flags_info);
        }

        unsafe {
            device
                .create_descriptor_set_layout(&layout_info, None)
                .map_err(|e| EngineError::vulkan("create descriptor set layout", e))
        }
    }
}

// ===========================================================================
// Growable allocator
// ===========================================================================

/// How many descriptors of `ty` to reserve per set in each pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolSizeRatio {
    pub ty: vk::DescriptorType,
    pub ratio: f32,
}

/// Pool sizes for a pool holding `set_count` sets.
pub fn pool_sizes(ratios: &[PoolSizeRatio], set_count: u32) -> Vec<vk::DescriptorPoolSize> {
    ratios
        .iter()
        .map(|r| {
            vk::DescriptorPoolSize::default()
                .ty(r.ty)
                .descriptor_count(((r.ratio * set_count as f32).ceil() as u32).max(1))
        })
        .collect()
}

/// Set count of the pool created after one with `current` sets runs out.
pub fn next_pool_set_count(current: u32) -> u32 {
    (current.saturating_add(current / 2)).clamp(1, MAX_SETS_PER_POOL)
}

/// Allocates descriptor sets, creating a larger pool whenever the current one is exhausted.
pub struct DescriptorAllocatorGrowable {
    ratios: Vec<PoolSizeRatio>,
    ready_pools: Vec<vk::DescriptorPool>,
    full_pools: Vec<vk::DescriptorPool>,
    sets_per_pool: u32,
    flags: vk::DescriptorPoolCreateFlags,
}

impl DescriptorAllocatorGrowable {
    pub fn new(
        device: &ash::Device,
        initial_sets: u32,
        ratios: &[PoolSizeRatio],
        flags: vk::DescriptorPoolCreateFlags,
    ) -> Result<Self> {
        let mut allocator = Self {
            ratios: ratios.to_vec(),
            ready_pools: Vec::new(),
            full_pools: Vec::new(),
            sets_per_pool: initial_sets.max(1),
            flags,
        };
        let pool = allocator.create_pool(device, allocator.sets_per_pool)?;
        allocator.sets_per_pool = next_pool_set_count(allocator.sets_per_pool);
        allocator.ready_pools.push(pool);
        Ok(allocator)
    }

    fn create_pool(&self, device: &ash::Device, set_count: u32) -> Result<vk::DescriptorPool> {
        let sizes = pool_sizes(&self.ratios, set_count);
        let info = vk::DescriptorPoolCreateInfo::default()
            .flags(self.flags)
            .max_sets(set_count)
            .pool_sizes(&sizes);
        unsafe {
            device
                .create_descriptor_pool(&info, None)
                .map_err(|e| EngineError::vulkan("create descriptor pool", e))
        }
    }

    fn get_pool(&mut self, device: &ash::Device) -> Result<vk::DescriptorPool> {
        if let Some(pool) = self.ready_pools.pop() {
            return Ok(pool);
        }
        let pool = self.create_pool(device, self.sets_per_pool)?;
        info!(
            "Descriptor pool exhausted, created new pool with {} sets (total: {})",
            self.sets_per_pool,
            self.full_pools.len() + 1
        );
        self.sets_per_pool = next_pool_set_count(self.sets_per_pool);
        Ok(pool)
    }

    pub fn allocate(&mut self, device: &ash::Device, layout: vk::DescriptorSetLayout) -> Result<vk::DescriptorSet> {
        self.allocate_inner(device, layout, None)
    }

    /// Allocate a set whose variable-count binding holds `count` descriptors.
    pub fn allocate_variable(
        &mut self,
        device: &ash::Device,
        layout: vk::DescriptorSetLayout,
        count: u32,
    ) -> Result<vk::DescriptorSet> {
        self.allocate_inner(device, layout, Some(count))
    }

    fn allocate_inner(
        &mut self,
        device: &ash::Device,
        layout: vk::DescriptorSetLayout,
        variable_count: Option<u32>,
    ) -> Result<vk::DescriptorSet> {
        let layouts = [layout];
        let counts = [variable_count.unwrap_or(0)];

        let mut pool = self.get_pool(device)?;
        let mut attempt = 0;
        loop {
            let mut count_info =
                vk::DescriptorSetVariableDescriptorCountAllocateInfo::default().descriptor_counts(&counts);
            let mut alloc_info = vk::DescriptorSetAllocateInfo::default()
                .descriptor_pool(pool)
                .set_layouts(&layouts);
            if variable_count.is_some() {
                alloc_info = alloc_info.push_next(&mut count_info);
            }

            match unsafe { device.allocate_descriptor_sets(&alloc_info) } {
                Ok(sets) => {
                    self.ready_pools.push(pool);
                    return Ok(sets[0]);
                }
                Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY) | Err(vk::Result::ERROR_FRAGMENTED_POOL)
                    if attempt == 0 =>
                {
                    self.full_pools.push(pool);
                    pool = self.get_pool(device)?;
                    attempt += 1;
                }
                Err(e) => {
                    self.ready_pools.push(pool);
                    return Err(EngineError::vulkan("allocate descriptor set", e));
                }
            }
        }
    }

    pub fn destroy_pools(&mut self, device: &ash::Device) {
        for pool in self.ready_pools.drain(..).chain(self.full_pools.drain(..)) {
            unsafe {
                device.destroy_descriptor_pool(pool, None);
            }
        }
    }
}

// ===========================================================================
// Writer
// ===========================================================================

enum WritePayload {
    Buffer(vk::DescriptorBufferInfo),
    Images(Vec<vk::DescriptorImageInfo>),
    AccelerationStructure([vk::AccelerationStructureKHR; 1]),
}

struct PendingWrite {
    binding: u32,
    array_element: u32,
    ty: vk::DescriptorType,
    payload: WritePayload,
}

/// Queues descriptor writes and flushes them into a set in one `vkUpdateDescriptorSets` call.
#[derive(Default)]
pub struct DescriptorWriter {
    writes: Vec<PendingWrite>,
}

impl DescriptorWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_buffer(
        &mut self,
        binding: u32,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
        ty: vk::DescriptorType,
    ) -> &mut Self {
        self.writes.push(PendingWrite {
            binding,
            array_element: 0,
            ty,
            payload: WritePayload::Buffer(
                vk::DescriptorBufferInfo::default()
                    .buffer(buffer)
                    .offset(offset)
                    .range(range),
            ),
        });
        self
    }

    /// Write one image into `array_element` of `binding`.
    pub fn write_image(
        &mut self,
        binding: u32,
        array_element: u32,
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
        ty: vk::DescriptorType,
    ) -> &mut Self {
        self.writes.push(PendingWrite {
            binding,
            array_element,
            ty,
            payload: WritePayload::Images(vec![vk::DescriptorImageInfo::default()
                .image_view(view)
                .sampler(sampler)
                .image_layout(layout)]),
        });
        self
    }

    pub fn write_acceleration_structure(&mut self, binding: u32, handle: vk::AccelerationStructureKHR) -> &mut Self {
        self.writes.push(PendingWrite {
            binding,
            array_element: 0,
            ty: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            payload: WritePayload::AccelerationStructure([handle]),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// `(binding, array_element, type)` of every queued write, in order.
    pub fn targets(&self) -> Vec<(u32, u32, vk::DescriptorType)> {
        self.writes
            .iter()
            .map(|w| (w.binding, w.array_element, w.ty))
            .collect()
    }

    pub fn clear(&mut self) {
        self.writes.clear();
    }

    /// Apply every queued write to `set`.
    pub fn update_set(&self, device: &ash::Device, set: vk::DescriptorSet) {
        let mut accel_infos: Vec<vk::WriteDescriptorSetAccelerationStructureKHR> = self
            .writes
            .iter()
            .filter_map(|w| match &w.payload {
                WritePayload::AccelerationStructure(handles) => Some(
                    vk::WriteDescriptorSetAccelerationStructureKHR::default()
                        .acceleration_structures(handles),
                ),
                _ => None,
            })
            .collect();
        let mut accel_iter = accel_infos.iter_mut();

        let mut writes: Vec<vk::WriteDescriptorSet> = Vec::with_capacity(self.writes.len());
        for w in &self.writes {
            let base = vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(w.binding)
                .dst_array_element(w.array_element)
                .descriptor_type(w.ty);
            let write = match &w.payload {
                WritePayload::Buffer(info) => base.buffer_info(std::slice::from_ref(info)),
                WritePayload::Images(infos) => base.image_info(infos),
                WritePayload::AccelerationStructure(handles) => {
                    let Some(accel_info) = accel_iter.next() else {
                        continue;
                    };
                    base.descriptor_count(handles.len() as u32).push_next(accel_info)
                }
            };
            writes.push(write);
        }

        unsafe {
            device.update_descriptor_sets(&writes, &[]);
        }
    }
}
