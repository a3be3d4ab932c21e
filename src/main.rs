//! CLI entry point: builds a procedural scene headlessly and animates it.

use clap::Parser;
use glam::{Mat4, Vec4};
use log::{error, info};
use std::path::PathBuf;

use strata::accel::{GeometryRef, TopLevelInstanceRef};
use strata::camera::Camera;
use strata::config::EngineConfig;
use strata::materials::MaterialRecord;
use strata::scene;
use strata::textures::{SamplerDesc, TextureSampler};
use strata::Engine;

/// Build acceleration structures and bindless resources for a procedural scene.
#[derive(Parser)]
#[command(name = "strata", about = "Acceleration-structure and bindless resource demo")]
struct Args {
    /// JSON engine config. Missing fields use defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of animated entities.
    #[arg(long, default_value = "16")]
    entities: usize,

    /// Frames of scripted animation to run after loading.
    #[arg(long, default_value = "120")]
    frames: u32,

    /// Override the bindless texture capacity from the config.
    #[arg(long)]
    max_textures: Option<u32>,

    /// Force validation layers on.
    #[arg(long)]
    validation: bool,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    if let Err(e) = run(args) {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> strata::Result<()> {
    let mut config = EngineConfig::load(args.config.as_deref())?;
    if let Some(max_textures) = args.max_textures {
        config.max_bindless_textures = max_textures;
    }
    if args.validation {
        config.validation = true;
    }
    config.validate()?;

    let mut engine = Engine::new(config)?;

    // One checker image shared by two materials: uploaded once, two bindless slots
    let checker = scene::generate_checker_texture(256);
    let texture_base = engine.upload_2d_textures(&[
        TextureSampler {
            image: checker.clone(),
            sampler: SamplerDesc::default(),
        },
        TextureSampler {
            image: checker,
            sampler: SamplerDesc {
                mag_filter: ash::vk::Filter::NEAREST,
                min_filter: ash::vk::Filter::NEAREST,
                ..SamplerDesc::default()
            },
        },
    ])?;

    let materials = [
        MaterialRecord::new(Vec4::new(1.0, 1.0, 1.0, 1.0), 0.0, 0.6).with_base_color_texture(0),
        MaterialRecord::new(Vec4::new(0.9, 0.8, 0.7, 1.0), 1.0, 0.3).with_base_color_texture(1),
    ]
    .map(|m| m.with_texture_offset(texture_base));
    let material_base = engine.upload_materials(&materials)?;

    let sphere = scene::generate_sphere(24, 32);
    let (_, sphere_geometry) = engine.upload_mesh(&sphere.indices, &sphere.vertices, material_base)?;
    let triangle = scene::generate_triangle();
    let (_, triangle_geometry) = engine.upload_mesh(&triangle.indices, &triangle.vertices, material_base + 1)?;

    // First entity brings both meshes; the rest reference the existing bottom levels
    let grid = scene::grid_transforms(args.entities.max(1), 3.0);
    let mut entities = Vec::with_capacity(grid.len());
    let first = engine.register_geometry(
        &[sphere_geometry, triangle_geometry],
        &[
            TopLevelInstanceRef::new(GeometryRef::New(0), Mat4::IDENTITY),
            TopLevelInstanceRef::new(GeometryRef::New(1), Mat4::from_translation(glam::Vec3::Y * 1.5)),
        ],
    )?;
    entities.push(first);

    let shared: Vec<GeometryRef> = (0..2)
        .filter_map(|i| engine.accel().bottom_level_id(i))
        .map(GeometryRef::Registered)
        .collect();
    for _ in 1..grid.len() {
        let instances = [
            TopLevelInstanceRef::new(shared[0], Mat4::IDENTITY),
            TopLevelInstanceRef::new(shared[1], Mat4::from_translation(glam::Vec3::Y * 1.5)),
        ];
        entities.push(engine.register_geometry(&[], &instances)?);
    }
    for (entity, base) in entities.iter().zip(&grid) {
        engine.update_instance_transform(*entity, base)?;
    }

    info!(
        "Scene loaded: {} entities, {} instances, {} bottom levels, {} bindless textures",
        engine.accel().entity_count(),
        engine.accel().instance_count(),
        engine.accel().bottom_level_count(),
        engine.upload().textures().len()
    );

    let mut camera = Camera::default();
    let frames_in_flight = engine.frames().frame_count();
    for frame in 0..args.frames {
        let t = frame as f32 / 60.0;
        for (index, (entity, base)) in entities.iter().zip(&grid).enumerate() {
            engine.update_instance_transform(*entity, &scene::animate(base, index, t))?;
        }
        camera.orbit(0.01);
        engine.prepare_frame(frame as usize % frames_in_flight, &camera, 16.0 / 9.0)?;
    }

    info!("Ran {} animation frames", args.frames);
    Ok(())
}
