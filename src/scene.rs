//! Procedural geometry and textures for the demo scene.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

use crate::textures::TextureImage;

/// Position + normal + UV = 32 bytes. Position comes first so builds can read it directly.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

/// Triangle-list mesh in host memory.
#[derive(Debug, Clone)]
pub struct MeshData {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

/// Unit UV sphere with the given number of stacks and slices.
pub fn generate_sphere(stacks: u32, slices: u32) -> MeshData {
    let mut vertices = Vec::new();
    let mut indices = Vec::new();

    for i in 0..=stacks {
        let phi = std::f32::consts::PI * i as f32 / stacks as f32;
        let v_coord = i as f32 / stacks as f32;
        for j in 0..=slices {
            let theta = 2.0 * std::f32::consts::PI * j as f32 / slices as f32;
            let u_coord = j as f32 / slices as f32;

            let x = phi.sin() * theta.cos();
            let y = phi.cos();
            let z = phi.sin() * theta.sin();

            vertices.push(Vertex {
                position: [x, y, z],
                normal: [x, y, z],
                uv: [u_coord, v_coord],
            });
        }
    }

    for i in 0..stacks {
        for j in 0..slices {
            let a = i * (slices + 1) + j;
            let b = a + slices + 1;
            indices.extend_from_slice(&[a, b, a + 1, b, b + 1, a + 1]);
        }
    }

    MeshData { vertices, indices }
}

/// Single upright triangle facing +Z.
pub fn generate_triangle() -> MeshData {
    let normal = [0.0, 0.0, 1.0];
    MeshData {
        vertices: vec![
            Vertex {
                position: [0.0, 0.5, 0.0],
                normal,
                uv: [0.5, 0.0],
            },
            Vertex {
                position: [-0.5, -0.5, 0.0],
                normal,
                uv: [0.0, 1.0],
            },
            Vertex {
                position: [0.5, -0.5, 0.0],
                normal,
                uv: [1.0, 1.0],
            },
        ],
        indices: vec![0, 1, 2],
    }
}

/// Checker pattern with sinusoidal color variation, RGBA8.
pub fn generate_checker_texture(size: u32) -> TextureImage {
    let mut data = Vec::with_capacity((size * size * 4) as usize);

    for y in 0..size {
        for x in 0..size {
            let u = x as f32 / size as f32;
            let v = y as f32 / size as f32;

            let cx = (u * 8.0) as i32 % 2;
            let cy = (v * 8.0) as i32 % 2;

            let (r, g, b) = if cx ^ cy != 0 {
                (
                    200.0 + 40.0 * (u * 12.0).sin(),
                    120.0 + 30.0 * (v * 10.0).sin(),
                    80.0 + 20.0 * (u * 8.0 + v * 6.0).cos(),
                )
            } else {
                (
                    60.0 + 30.0 * (u * 10.0 + v * 4.0).sin(),
                    150.0 + 40.0 * (v * 8.0).cos(),
                    170.0 + 50.0 * (u * 6.0).sin(),
                )
            };

            data.extend_from_slice(&[
                r.clamp(0.0, 255.0) as u8,
                g.clamp(0.0, 255.0) as u8,
                b.clamp(0.0, 255.0) as u8,
                255,
            ]);
        }
    }

    TextureImage::new(data, size, size)
}

/// Placement of `count` entities on a square grid in the XZ plane, `spacing` apart.
pub fn grid_transforms(count: usize, spacing: f32) -> Vec<Mat4> {
    let side = (count as f32).sqrt().ceil().max(1.0) as usize;
    let half = (side as f32 - 1.0) * spacing * 0.5;
    (0..count)
        .map(|i| {
            let (row, col) = (i / side, i % side);
            Mat4::from_translation(Vec3::new(
                col as f32 * spacing - half,
                0.0,
                row as f32 * spacing - half,
            ))
        })
        .collect()
}

/// Transform of entity `index` at time `t` seconds: a bob and a spin around its grid slot.
pub fn animate(base: &Mat4, index: usize, t: f32) -> Mat4 {
    let phase = index as f32 * 0.7;
    let lift = Mat4::from_translation(Vec3::new(0.0, (t * 2.0 + phase).sin() * 0.5, 0.0));
    let spin = Mat4::from_rotation_y(t + phase);
    *base * lift * spin
}
