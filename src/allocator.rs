//! Typed GPU buffers and images on top of gpu-allocator.

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator};
use gpu_allocator::MemoryLocation;

use crate::error::{EngineError, Result};

/// GPU buffer with its allocation.
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: vk::DeviceSize,
}

impl GpuBuffer {
    /// Copy `data` into a host-visible buffer at byte `offset`.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let mapped = self
            .allocation
            .as_mut()
            .and_then(|a| a.mapped_slice_mut())
            .ok_or_else(|| {
                EngineError::Unsupported("write to a buffer that is not host-visible".to_string())
            })?;
        let end = offset + data.len();
        if end > mapped.len() {
            return Err(EngineError::Unsupported(format!(
                "write of {} bytes at offset {} overflows a {} byte buffer",
                data.len(),
                offset,
                mapped.len()
            )));
        }
        mapped[offset..end].copy_from_slice(data);
        Ok(())
    }

    pub fn destroy(&mut self, device: &ash::Device, allocator: &mut Allocator) {
        if let Some(alloc) = self.allocation.take() {
            let _ = allocator.free(alloc);
        }
        unsafe {
            device.destroy_buffer(self.buffer, None);
        }
        self.buffer = vk::Buffer::null();
        self.size = 0;
    }
}

/// GPU image with its allocation.
pub struct GpuImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub allocation: Option<Allocation>,
    pub extent: vk::Extent2D,
}

impl GpuImage {
    pub fn destroy(&mut self, device: &ash::Device, allocator: &mut Allocator) {
        unsafe {
            device.destroy_image_view(self.view, None);
        }
        if let Some(alloc) = self.allocation.take() {
            let _ = allocator.free(alloc);
        }
        unsafe {
            device.destroy_image(self.image, None);
        }
        self.image = vk::Image::null();
        self.view = vk::ImageView::null();
    }
}

/// Create an unbound buffer of `size` bytes in `location`.
///
/// Host-visible locations come back persistently mapped.
pub fn create_buffer(
    device: &ash::Device,
    allocator: &mut Allocator,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    location: MemoryLocation,
    name: &str,
) -> Result<GpuBuffer> {
    let buffer_info = vk::BufferCreateInfo::default()
        .size(size.max(1))
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let buffer = unsafe {
        device
            .create_buffer(&buffer_info, None)
            .map_err(|e| EngineError::vulkan(format!("create buffer '{}'", name), e))?
    };

    let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

    let allocation = match allocator.allocate(&AllocationCreateDesc {
        name,
        requirements,
        location,
        linear: true,
        allocation_scheme: AllocationScheme::GpuAllocatorManaged,
    }) {
        Ok(allocation) => allocation,
        Err(e) => {
            unsafe { device.destroy_buffer(buffer, None) };
            return Err(EngineError::allocation(name, e));
        }
    };

    if let Err(e) = unsafe { device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) } {
        let _ = allocator.free(allocation);
        unsafe { device.destroy_buffer(buffer, None) };
        return Err(EngineError::vulkan(format!("bind buffer memory '{}'", name), e));
    }

    Ok(GpuBuffer {
        buffer,
        allocation: Some(allocation),
        size,
    })
}

/// Create a host-visible buffer and fill it with `data`.
pub fn create_buffer_with_data(
    device: &ash::Device,
    allocator: &mut Allocator,
    data: &[u8],
    usage: vk::BufferUsageFlags,
    name: &str,
) -> Result<GpuBuffer> {
    let mut buffer = create_buffer(
        device,
        allocator,
        data.len() as u64,
        usage,
        MemoryLocation::CpuToGpu,
        name,
    )?;
    if let Err(e) = buffer.write(0, data) {
        buffer.destroy(device, allocator);
        return Err(e);
    }
    Ok(buffer)
}

/// Create a device-local 2D image with a full-subresource view.
pub fn create_image(
    device: &ash::Device,
    allocator: &mut Allocator,
    extent: vk::Extent2D,
    format: vk::Format,
    usage: vk::ImageUsageFlags,
    aspect: vk::ImageAspectFlags,
    name: &str,
) -> Result<GpuImage> {
    let image_info = vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(format)
        .extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);

    let image = unsafe {
        device
            .create_image(&image_info, None)
            .map_err(|e| EngineError::vulkan(format!("create image '{}'", name), e))?
    };

    let requirements = unsafe { device.get_image_memory_requirements(image) };

    let allocation = match allocator.allocate(&AllocationCreateDesc {
        name,
        requirements,
        location: MemoryLocation::GpuOnly,
        linear: false,
        allocation_scheme: AllocationScheme::GpuAllocatorManaged,
    }) {
        Ok(allocation) => allocation,
        Err(e) => {
            unsafe { device.destroy_image(image, None) };
            return Err(EngineError::allocation(name, e));
        }
    };

    let mut gpu_image = GpuImage {
        image,
        view: vk::ImageView::null(),
        allocation: Some(allocation),
        extent,
    };

    let bind_result = match gpu_image.allocation.as_ref() {
        Some(alloc) => unsafe { device.bind_image_memory(image, alloc.memory(), alloc.offset()) },
        None => Ok(()),
    };
    if let Err(e) = bind_result {
        gpu_image.destroy(device, allocator);
        return Err(EngineError::vulkan(format!("bind image memory '{}'", name), e));
    }

    let view_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping::default())
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(aspect)
                .base_mip_level(0)
                .level_count(1)
                .base_array_layer(0)
                .layer_count(1),
        );

    match unsafe { device.create_image_view(&view_info, None) } {
        Ok(view) => {
            gpu_image.view = view;
            Ok(gpu_image)
        }
        Err(e) => {
            gpu_image.destroy(device, allocator);
            Err(EngineError::vulkan(format!("create image view '{}'", name), e))
        }
    }
}

/// Round `value` up to a multiple of `alignment` (a power of two, or zero for no alignment).
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_power_of_two() {
        assert_eq!(align_up(0, 128), 0);
        assert_eq!(align_up(1, 128), 128);
        assert_eq!(align_up(128, 128), 128);
        assert_eq!(align_up(129, 256), 256);
    }

    #[test]
    fn align_up_ignores_trivial_alignment() {
        assert_eq!(align_up(77, 0), 77);
        assert_eq!(align_up(77, 1), 77);
    }
}
