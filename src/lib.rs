//! Acceleration-structure and bindless resource core for a Vulkan scene renderer.
//!
//! The [`accel`] module keeps a two-level BVH in step with a live-edited scene, [`upload`]
//! places meshes, materials and textures on the GPU behind one bindless descriptor set, and
//! [`engine::Engine`] ties them to a device.

pub mod accel;
pub mod allocator;
pub mod camera;
pub mod config;
pub mod descriptors;
pub mod engine;
pub mod error;
pub mod frame;
pub mod layout;
pub mod materials;
pub mod scene;
pub mod submit;
pub mod textures;
pub mod upload;
pub mod vulkan_context;

pub use engine::Engine;
pub use error::{EngineError, Result};
