//! Image decoding and the bindless texture array.

use ash::vk;
use log::info;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::allocator::GpuImage;
use crate::descriptors::DescriptorWriter;
use crate::error::{EngineError, Result};
use crate::layout::{ImageLayoutState, TrackedLayout};
use crate::materials::DEFAULT_TEXTURE_SLOT;
use crate::vulkan_context::VulkanContext;

/// Binding of the texture array inside the bindless set.
pub const TEXTURE_ARRAY_BINDING: u32 = 2;

/// Where a loader found an image's encoded bytes.
#[derive(Debug, Clone)]
pub enum ImageSource {
    Uri(PathBuf),
    Memory(Arc<[u8]>),
    /// A byte range of a larger binary blob.
    BufferView {
        buffer: Arc<[u8]>,
        offset: usize,
        length: usize,
    },
}

impl ImageSource {
    /// Decode to RGBA8.
    pub fn decode(&self) -> Result<TextureImage> {
        let decoded = match self {
            ImageSource::Uri(path) => image::open(path)
                .map_err(|e| EngineError::Texture(format!("Failed to load {:?}: {}", path, e)))?,
            ImageSource::Memory(bytes) => image::load_from_memory(bytes)
                .map_err(|e| EngineError::Texture(format!("Failed to decode embedded image: {}", e)))?,
            ImageSource::BufferView {
                buffer,
                offset,
                length,
            } => {
                let bytes = offset
                    .checked_add(*length)
                    .and_then(|end| buffer.get(*offset..end))
                    .ok_or_else(|| {
                        EngineError::Texture(format!(
                            "Buffer view {}..{} is outside a {} byte buffer",
                            offset,
                            offset.saturating_add(*length),
                            buffer.len()
                        ))
                    })?;
                image::load_from_memory(bytes)
                    .map_err(|e| EngineError::Texture(format!("Failed to decode buffer view image: {}", e)))?
            }
        };
        let rgba = decoded.to_rgba8();
        let (width, height) = rgba.dimensions();
        Ok(TextureImage::new(rgba.into_raw(), width, height))
    }
}

/// Decoded RGBA8 pixels. Clones share the pixel allocation.
#[derive(Debug, Clone)]
pub struct TextureImage {
    pub pixels: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
}

impl TextureImage {
    pub fn new(pixels: impl Into<Arc<[u8]>>, width: u32, height: u32) -> Self {
        Self {
            pixels: pixels.into(),
            width,
            height,
        }
    }

    /// Identity used for de-duplication: the pixel allocation plus dimensions.
    pub fn key(&self) -> ImageKey {
        ImageKey {
            data: self.pixels.as_ptr() as usize,
            width: self.width,
            height: self.height,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageKey {
    data: usize,
    width: u32,
    height: u32,
}

/// Filtering and addressing of one sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerDesc {
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub address_mode: vk::SamplerAddressMode,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT,
        }
    }
}

/// An image plus how to sample it; one per material texture reference.
#[derive(Debug, Clone)]
pub struct TextureSampler {
    pub image: TextureImage,
    pub sampler: SamplerDesc,
}

/// Which images to upload and which uploaded image each input uses.
#[derive(Debug, PartialEq, Eq)]
pub struct DedupPlan {
    /// Input index of the first occurrence of each distinct image, in upload order.
    pub uploads: Vec<usize>,
    /// For each input, the index into `uploads` it shares.
    pub image_for_input: Vec<usize>,
}

pub fn dedup_plan(keys: &[ImageKey]) -> DedupPlan {
    let mut seen: HashMap<ImageKey, usize> = HashMap::new();
    let mut uploads = Vec::new();
    let mut image_for_input = Vec::with_capacity(keys.len());
    for (i, key) in keys.iter().enumerate() {
        let image = *seen.entry(*key).or_insert_with(|| {
            uploads.push(i);
            uploads.len() - 1
        });
        image_for_input.push(image);
    }
    DedupPlan {
        uploads,
        image_for_input,
    }
}

/// One descriptor write of an upload: the array element and the image it samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotWrite {
    pub array_element: u32,
    pub image_index: usize,
}

/// Slot writes for one upload call: input `i` lands in `base + i` and samples the image its
/// plan entry shares, counted from `first_image`, the image count before the call.
///
/// Identity is only compared within a call, so an image passed again later is uploaded again.
pub fn slot_writes(base: u32, first_image: usize, plan: &DedupPlan) -> Vec<SlotWrite> {
    plan.image_for_input
        .iter()
        .enumerate()
        .map(|(i, &image)| SlotWrite {
            array_element: base + i as u32,
            image_index: first_image + image,
        })
        .collect()
}

/// Fixed-capacity array of combined image samplers written slot by slot.
pub struct BindlessTextures {
    images: Vec<GpuImage>,
    slot_images: Vec<usize>,
    samplers: HashMap<SamplerDesc, vk::Sampler>,
    capacity: u32,
}

impl BindlessTextures {
    /// Create the array and write the 1×1 white default texture into slot 0.
    pub fn new(ctx: &mut VulkanContext, set: vk::DescriptorSet, capacity: u32) -> Result<Self> {
        let mut textures = Self {
            images: Vec::new(),
            slot_images: Vec::new(),
            samplers: HashMap::new(),
            capacity,
        };
        let white = TextureSampler {
            image: TextureImage::new(vec![255u8; 4], 1, 1),
            sampler: SamplerDesc::default(),
        };
        let slot = textures.upload(ctx, set, std::slice::from_ref(&white))?;
        debug_assert_eq!(slot, DEFAULT_TEXTURE_SLOT);
        Ok(textures)
    }

    /// Number of slots written so far; the next upload starts here.
    pub fn len(&self) -> u32 {
        self.slot_images.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.slot_images.is_empty()
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of distinct GPU images, including the default texture.
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Upload `inputs` and write one slot per input. Returns the first slot written.
    pub fn upload(&mut self, ctx: &mut VulkanContext, set: vk::DescriptorSet, inputs: &[TextureSampler]) -> Result<u32> {
        let base = self.len();
        if base as usize + inputs.len() > self.capacity as usize {
            return Err(EngineError::Texture(format!(
                "Bindless texture array full: {} used, {} requested, capacity {}",
                base,
                inputs.len(),
                self.capacity
            )));
        }

        let keys: Vec<ImageKey> = inputs.iter().map(|t| t.image.key()).collect();
        let plan = dedup_plan(&keys);

        let first_image = self.images.len();
        for &input in &plan.uploads {
            let image = upload_image(ctx, &inputs[input].image)?;
            self.images.push(image);
        }

        let mut writer = DescriptorWriter::new();
        for (input, write) in inputs.iter().zip(slot_writes(base, first_image, &plan)) {
            let sampler = self.sampler(ctx, input.sampler)?;
            writer.write_image(
                TEXTURE_ARRAY_BINDING,
                write.array_element,
                self.images[write.image_index].view,
                sampler,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            );
            self.slot_images.push(write.image_index);
        }
        writer.update_set(&ctx.device, set);

        info!(
            "Uploaded {} textures ({} unique) into bindless slots {}..{}",
            inputs.len(),
            plan.uploads.len(),
            base,
            self.len()
        );
        Ok(base)
    }

    fn sampler(&mut self, ctx: &VulkanContext, desc: SamplerDesc) -> Result<vk::Sampler> {
        if let Some(&sampler) = self.samplers.get(&desc) {
            return Ok(sampler);
        }
        let info = vk::SamplerCreateInfo::default()
            .mag_filter(desc.mag_filter)
            .min_filter(desc.min_filter)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(desc.address_mode)
            .address_mode_v(desc.address_mode)
            .address_mode_w(desc.address_mode)
            .max_lod(vk::LOD_CLAMP_NONE);
        let sampler = unsafe {
            ctx.device
                .create_sampler(&info, None)
                .map_err(|e| EngineError::vulkan("create sampler", e))?
        };
        self.samplers.insert(desc, sampler);
        Ok(sampler)
    }

    pub fn destroy(&mut self, ctx: &mut VulkanContext) {
        for (_, sampler) in self.samplers.drain() {
            unsafe {
                ctx.device.destroy_sampler(sampler, None);
            }
        }
        for mut image in self.images.drain(..) {
            ctx.destroy_image(&mut image);
        }
        self.slot_images.clear();
    }
}

/// Copy RGBA8 pixels into a new sampled image through a staging buffer.
fn upload_image(ctx: &mut VulkanContext, texture: &TextureImage) -> Result<GpuImage> {
    let expected = texture.width as usize * texture.height as usize * 4;
    if texture.pixels.len() != expected {
        return Err(EngineError::Texture(format!(
            "Texture is {}x{} but has {} bytes of pixel data (expected {})",
            texture.width,
            texture.height,
            texture.pixels.len(),
            expected
        )));
    }

    let mut staging =
        ctx.create_buffer_with_data(&texture.pixels, vk::BufferUsageFlags::TRANSFER_SRC, "texture_staging")?;

    let extent = vk::Extent2D {
        width: texture.width,
        height: texture.height,
    };
    let mut image = match ctx.create_image(
        extent,
        vk::Format::R8G8B8A8_UNORM,
        vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
        "bindless_texture",
    ) {
        Ok(image) => image,
        Err(e) => {
            ctx.destroy_buffer(&mut staging);
            return Err(e);
        }
    };

    let region = vk::BufferImageCopy::default()
        .buffer_offset(0)
        .buffer_row_length(0)
        .buffer_image_height(0)
        .image_subresource(
            vk::ImageSubresourceLayers::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .mip_level(0)
                .base_array_layer(0)
                .layer_count(1),
        )
        .image_offset(vk::Offset3D::default())
        .image_extent(vk::Extent3D {
            width: texture.width,
            height: texture.height,
            depth: 1,
        });

    let staging_buffer = staging.buffer;
    let vk_image = image.image;
    let mut layout = TrackedLayout::default();
    let submitted = ctx.immediate_submit(|device, cmd| {
        layout.record(device, cmd, vk_image, ImageLayoutState::TransferDst);
        unsafe {
            device.cmd_copy_buffer_to_image(
                cmd,
                staging_buffer,
                vk_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }
        layout.record(device, cmd, vk_image, ImageLayoutState::ShaderReadOnly);
    });

    ctx.destroy_buffer(&mut staging);
    if let Err(e) = submitted {
        ctx.destroy_image(&mut image);
        return Err(e);
    }
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker(size: u32) -> TextureImage {
        TextureImage::new(vec![128u8; (size * size * 4) as usize], size, size)
    }

    #[test]
    fn shared_pixels_upload_once_but_fill_two_slots() {
        let image = checker(4);
        let inputs = [image.key(), image.clone().key()];
        let plan = dedup_plan(&inputs);
        assert_eq!(plan.uploads, vec![0]);
        assert_eq!(plan.image_for_input, vec![0, 0]);

        // Slot 0 and image 0 already hold the default texture
        let writes = slot_writes(1, 1, &plan);
        assert_eq!(
            writes,
            vec![
                SlotWrite { array_element: 1, image_index: 1 },
                SlotWrite { array_element: 2, image_index: 1 },
            ]
        );
    }

    #[test]
    fn consecutive_uploads_continue_slots_and_images() {
        let a = checker(4);
        let b = checker(2);

        // First call after the default texture: a, b, a
        let first = dedup_plan(&[a.key(), b.key(), a.key()]);
        let first_writes = slot_writes(1, 1, &first);
        let slots: Vec<u32> = first_writes.iter().map(|w| w.array_element).collect();
        let images: Vec<usize> = first_writes.iter().map(|w| w.image_index).collect();
        assert_eq!(slots, vec![1, 2, 3]);
        assert_eq!(images, vec![1, 2, 1]);

        // Second call starts after the first batch; b repeats inside it and a again across calls
        let second = dedup_plan(&[b.key(), a.key(), b.key()]);
        assert_eq!(second.uploads, vec![0, 1]);
        let second_writes = slot_writes(1 + first_writes.len() as u32, 1 + first.uploads.len(), &second);
        let slots: Vec<u32> = second_writes.iter().map(|w| w.array_element).collect();
        let images: Vec<usize> = second_writes.iter().map(|w| w.image_index).collect();
        assert_eq!(slots, vec![4, 5, 6]);
        assert_eq!(images, vec![3, 4, 3]);
    }

    #[test]
    fn equal_contents_in_separate_allocations_are_distinct() {
        let a = checker(4);
        let b = checker(4);
        let plan = dedup_plan(&[a.key(), b.key(), a.key()]);
        assert_eq!(plan.uploads, vec![0, 1]);
        assert_eq!(plan.image_for_input, vec![0, 1, 0]);
    }

    #[test]
    fn dimensions_are_part_of_identity() {
        let image = checker(4);
        let reinterpreted = TextureImage {
            pixels: image.pixels.clone(),
            width: 8,
            height: 2,
        };
        assert_ne!(image.key(), reinterpreted.key());
    }

    #[test]
    fn buffer_view_out_of_range_is_an_error() {
        let source = ImageSource::BufferView {
            buffer: Arc::from(vec![0u8; 16]),
            offset: 8,
            length: 64,
        };
        assert!(matches!(source.decode(), Err(EngineError::Texture(_))));
    }

    #[test]
    fn memory_source_decodes_png() {
        let mut encoded = Vec::new();
        let pixels = image::RgbaImage::from_pixel(3, 2, image::Rgba([10, 20, 30, 255]));
        pixels
            .write_to(&mut std::io::Cursor::new(&mut encoded), image::ImageFormat::Png)
            .unwrap();

        let decoded = ImageSource::Memory(Arc::from(encoded.clone())).decode().unwrap();
        assert_eq!((decoded.width, decoded.height), (3, 2));
        assert_eq!(&decoded.pixels[..4], &[10, 20, 30, 255]);

        let mut blob = vec![0xEEu8; 5];
        blob.extend_from_slice(&encoded);
        let view = ImageSource::BufferView {
            buffer: Arc::from(blob),
            offset: 5,
            length: encoded.len(),
        };
        assert_eq!(view.decode().unwrap().pixels, decoded.pixels);
    }
}
