//! The engine aggregate: owns the device and every resource system built on it.

use ash::vk;
use glam::Mat4;
use log::info;

use crate::accel::{AccelerationStructureContext, BottomLevelGeometry, EntityId, TopLevelInstanceRef};
use crate::camera::Camera;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::frame::{FrameDescriptors, SceneUniforms};
use crate::materials::MaterialRecord;
use crate::textures::TextureSampler;
use crate::upload::{MeshBuffers, UploadPipeline};
use crate::vulkan_context::VulkanContext;

/// Owns the Vulkan context and the systems that allocate from it.
///
/// There is no global instance; whoever creates the engine passes it to whatever needs it.
pub struct Engine {
    accel: AccelerationStructureContext<VulkanContext>,
    upload: UploadPipeline,
    frames: FrameDescriptors,
    meshes: Vec<MeshBuffers>,
    config: EngineConfig,
    // Dropped last; everything above is destroyed explicitly in Drop first.
    ctx: VulkanContext,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let mut ctx = VulkanContext::new(&config)?;
        let mut upload = UploadPipeline::new(&mut ctx, &config)?;
        let frames = match FrameDescriptors::new(&mut ctx, &config) {
            Ok(frames) => frames,
            Err(e) => {
                upload.destroy(&mut ctx);
                return Err(e);
            }
        };
        info!(
            "Engine ready ({} frames in flight, ray query: {})",
            frames.frame_count(),
            ctx.ray_query_supported
        );
        Ok(Self {
            accel: AccelerationStructureContext::new(),
            upload,
            frames,
            meshes: Vec::new(),
            config,
            ctx,
        })
    }

    /// Upload a mesh and record its mesh-info entry. Returns the mesh-info index and the
    /// geometry to register for ray tracing.
    pub fn upload_mesh<V: bytemuck::Pod>(
        &mut self,
        indices: &[u32],
        vertices: &[V],
        material_index: u32,
    ) -> Result<(u32, BottomLevelGeometry)> {
        let mesh = self.upload.upload_mesh(&mut self.ctx, indices, vertices)?;
        let geometry = mesh.geometry();
        let info_index = match self.upload.register_mesh_info(&mut self.ctx, &mesh, material_index) {
            Ok(index) => index,
            Err(e) => {
                let mut mesh = mesh;
                mesh.destroy(&mut self.ctx);
                return Err(e);
            }
        };
        self.meshes.push(mesh);
        Ok((info_index, geometry))
    }

    pub fn upload_materials(&mut self, materials: &[MaterialRecord]) -> Result<u32> {
        self.upload.upload_materials(&mut self.ctx, materials)
    }

    pub fn upload_2d_textures(&mut self, tex_samplers: &[TextureSampler]) -> Result<u32> {
        self.upload.upload_2d_textures(&mut self.ctx, tex_samplers)
    }

    pub fn register_geometry(
        &mut self,
        geometries: &[BottomLevelGeometry],
        instances: &[TopLevelInstanceRef],
    ) -> Result<EntityId> {
        self.accel
            .register_geometry(&mut self.ctx, geometries, instances)
    }

    pub fn update_instance_transform(&mut self, entity: EntityId, global: &Mat4) -> Result<()> {
        self.accel
            .update_instance_transform(&mut self.ctx, entity, global)
    }

    /// Write the scene set for `frame_index` and return it, ready to bind.
    pub fn prepare_frame(&mut self, frame_index: usize, camera: &Camera, aspect: f32) -> Result<vk::DescriptorSet> {
        let top_level = self.accel.top_level().ok_or_else(|| {
            EngineError::Unsupported("no geometry registered; nothing to trace against".to_string())
        })?;
        let uniforms = SceneUniforms::new(
            &camera.view(),
            &camera.projection(aspect),
            self.accel.instance_count() as u32,
            frame_index as u32,
        );
        self.frames
            .write_frame(&self.ctx, frame_index, &uniforms, top_level)
    }

    pub fn accel(&self) -> &AccelerationStructureContext<VulkanContext> {
        &self.accel
    }

    pub fn upload(&self) -> &UploadPipeline {
        &self.upload
    }

    pub fn frames(&self) -> &FrameDescriptors {
        &self.frames
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn context(&self) -> &VulkanContext {
        &self.ctx
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        unsafe {
            let _ = self.ctx.device.device_wait_idle();
        }
        self.accel.destroy(&mut self.ctx);
        for mut mesh in self.meshes.drain(..) {
            mesh.destroy(&mut self.ctx);
        }
        self.frames.destroy(&mut self.ctx);
        self.upload.destroy(&mut self.ctx);
        info!("Engine resources released");
    }
}
