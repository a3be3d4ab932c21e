//! Camera math: perspective projection and look-at view matrix.
//!
//! All matrices use Vulkan clip-space conventions:
//! - Y is flipped (negative in projection)
//! - Depth range [0, 1]
//! - Column-major storage (glam default)

use glam::{Mat4, Vec3, Vec4};

/// Create a perspective projection matrix for Vulkan clip space.
///
/// The Y axis is flipped (m[1][1] = -f) to match Vulkan's top-down convention.
/// Depth maps to [0, 1].
pub fn perspective(fov_y: f32, aspect: f32, near: f32, far: f32) -> Mat4 {
    let f = 1.0 / (fov_y / 2.0).tan();

    Mat4::from_cols(
        Vec4::new(f / aspect, 0.0, 0.0, 0.0),
        Vec4::new(0.0, -f, 0.0, 0.0),
        Vec4::new(0.0, 0.0, far / (near - far), -1.0),
        Vec4::new(0.0, 0.0, (near * far) / (near - far), 0.0),
    )
}

/// Create a right-handed look-at view matrix.
pub fn look_at(eye: Vec3, target: Vec3, up: Vec3) -> Mat4 {
    let f = (target - eye).normalize();
    let s = f.cross(up).normalize();
    let u = s.cross(f);

    Mat4::from_cols(
        Vec4::new(s.x, u.x, -f.x, 0.0),
        Vec4::new(s.y, u.y, -f.y, 0.0),
        Vec4::new(s.z, u.z, -f.z, 0.0),
        Vec4::new(-s.dot(eye), -u.dot(eye), f.dot(eye), 1.0),
    )
}

/// Camera state the frame loop reads once per frame.
#[derive(Debug, Clone, Copy)]
pub struct Camera {
    pub eye: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    pub fov_y_deg: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            eye: Vec3::new(0.0, 4.0, 12.0),
            target: Vec3::ZERO,
            up: Vec3::Y,
            fov_y_deg: 45.0,
            near: 0.1,
            far: 200.0,
        }
    }
}

impl Camera {
    pub fn view(&self) -> Mat4 {
        look_at(self.eye, self.target, self.up)
    }

    pub fn projection(&self, aspect: f32) -> Mat4 {
        perspective(self.fov_y_deg.to_radians(), aspect, self.near, self.far)
    }

    /// Rotate the eye around the target about the up axis.
    pub fn orbit(&mut self, radians: f32) {
        let offset = self.eye - self.target;
        self.eye = self.target + glam::Quat::from_axis_angle(self.up.normalize(), radians) * offset;
    }
}
