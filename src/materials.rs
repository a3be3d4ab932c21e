//! GPU material records.

use bytemuck::{Pod, Zeroable};
use glam::Vec4;

/// Texture index meaning "sample the default texture".
pub const NO_TEXTURE: u32 = u32::MAX;

/// Bindless slot holding the 1×1 white default texture.
pub const DEFAULT_TEXTURE_SLOT: u32 = 0;

/// Material as shaders read it from the material storage buffer (std430, 48 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct MaterialRecord {
    pub base_color_factor: [f32; 4],
    pub metallic_factor: f32,
    pub roughness_factor: f32,
    pub base_color_texture: u32,
    pub metallic_roughness_texture: u32,
    pub normal_texture: u32,
    pub _pad: [u32; 3],
}

impl Default for MaterialRecord {
    fn default() -> Self {
        Self {
            base_color_factor: [1.0, 1.0, 1.0, 1.0],
            metallic_factor: 0.0,
            roughness_factor: 1.0,
            base_color_texture: NO_TEXTURE,
            metallic_roughness_texture: NO_TEXTURE,
            normal_texture: NO_TEXTURE,
            _pad: [0; 3],
        }
    }
}

impl MaterialRecord {
    pub fn new(base_color: Vec4, metallic: f32, roughness: f32) -> Self {
        Self {
            base_color_factor: base_color.to_array(),
            metallic_factor: metallic,
            roughness_factor: roughness,
            ..Self::default()
        }
    }

    pub fn with_base_color_texture(mut self, index: u32) -> Self {
        self.base_color_texture = index;
        self
    }

    pub fn with_metallic_roughness_texture(mut self, index: u32) -> Self {
        self.metallic_roughness_texture = index;
        self
    }

    pub fn with_normal_texture(mut self, index: u32) -> Self {
        self.normal_texture = index;
        self
    }

    /// Shift loader-local texture indices into the global bindless array.
    pub fn with_texture_offset(mut self, offset: u32) -> Self {
        for index in [
            &mut self.base_color_texture,
            &mut self.metallic_roughness_texture,
            &mut self.normal_texture,
        ] {
            if *index != NO_TEXTURE {
                *index += offset;
            }
        }
        self
    }
}

/// The bindless slot a texture index samples from.
pub fn texture_slot(index: u32) -> u32 {
    if index == NO_TEXTURE {
        DEFAULT_TEXTURE_SLOT
    } else {
        index
    }
}
