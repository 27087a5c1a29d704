// Orbit camera and the uniform block the ray generation shader reads

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

use crate::config::CameraConfig;

const PAN_SPEED: f32 = -0.00145;
const ORBIT_SPEED: f32 = -0.004;
const ZOOM_SPEED: f32 = 0.1;
const MIN_DISTANCE: f32 = 0.001;
const MAX_DISTANCE: f32 = 10000.0;

/// Keeps the orbit away from the poles where `up` degenerates
const POLE_EPSILON: f32 = 0.001;

/// Matches `SceneUniform` in raytrace.rgen
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct SceneUniform {
    pub view_inverse: Mat4,
    pub proj_inverse: Mat4,
}

#[derive(Debug, Clone)]
pub struct Camera {
    pub position: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    /// Vertical field of view in degrees
    pub vfov: f32,
    pub near: f32,
    pub far: f32,
    pub width: u32,
    pub height: u32,
}

impl Camera {
    pub fn new(config: &CameraConfig, width: u32, height: u32) -> Self {
        Self {
            position: Vec3::from(config.position),
            target: Vec3::from(config.target),
            up: Vec3::Y,
            vfov: config.vfov,
            near: config.near,
            far: config.far,
            width,
            height,
        }
    }

    pub fn set_viewport(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
    }

    pub fn aspect(&self) -> f32 {
        self.width.max(1) as f32 / self.height.max(1) as f32
    }

    pub fn view(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.target, self.up)
    }

    /// Right-handed, depth 0..1, with Y flipped for Vulkan's framebuffer
    pub fn projection(&self) -> Mat4 {
        let mut proj = Mat4::perspective_rh(self.vfov.to_radians(), self.aspect(), self.near, self.far);
        proj.y_axis.y *= -1.0;
        proj
    }

    pub fn uniform(&self) -> SceneUniform {
        SceneUniform {
            view_inverse: self.view().inverse(),
            proj_inverse: self.projection().inverse(),
        }
    }

    pub fn distance(&self) -> f32 {
        (self.target - self.position).length()
    }

    /// Screen-aligned basis of the current view
    fn basis(&self) -> (Vec3, Vec3) {
        let view_dir = self.target - self.position;
        let right = view_dir.cross(Vec3::Y).normalize_or_zero();
        let up = right.cross(view_dir).normalize_or_zero();
        (right, up)
    }

    /// Move camera and target together, scaled by the orbit distance
    pub fn pan(&mut self, dx: f32, dy: f32) {
        let dist = self.distance();
        let (right, up) = self.basis();
        let offset = right * (dx * PAN_SPEED * dist) + up * (dy * PAN_SPEED * dist);
        self.position += offset;
        self.target += offset;
    }

    /// Rotate the camera around the target by a mouse delta in pixels
    pub fn orbit(&mut self, dx: f32, dy: f32) {
        let view_dir = self.target - self.position;
        let dist = view_dir.length();
        if dist <= f32::EPSILON {
            return;
        }

        let theta = view_dir.x.atan2(view_dir.z) + dx * ORBIT_SPEED;
        let phi = (view_dir.y / dist).clamp(-1.0, 1.0).acos();
        let phi = (phi + dy * ORBIT_SPEED).clamp(POLE_EPSILON, std::f32::consts::PI - POLE_EPSILON);

        let offset = Vec3::new(
            -dist * phi.sin() * theta.sin(),
            -dist * phi.cos(),
            -dist * phi.sin() * theta.cos(),
        );
        self.position = self.target + offset;
    }

    /// Dolly toward the target by wheel steps, keeping the distance in range
    pub fn zoom(&mut self, scroll: f32) {
        let view_dir = self.target - self.position;
        let dist = view_dir.length();
        if scroll == 0.0 || dist <= f32::EPSILON {
            return;
        }

        let new_dist = (dist - dist * scroll * ZOOM_SPEED).clamp(MIN_DISTANCE, MAX_DISTANCE);
        self.position = self.target - view_dir / dist * new_dist;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera() -> Camera {
        Camera::new(&CameraConfig::default(), 800, 600)
    }

    fn close(a: Vec3, b: Vec3) -> bool {
        (a - b).length() < 1e-4
    }

    #[test]
    fn uniform_is_two_matrices() {
        assert_eq!(std::mem::size_of::<SceneUniform>(), 128);
    }

    #[test]
    fn view_inverse_recovers_eye_position() {
        let cam = camera();
        let eye = cam.uniform().view_inverse.transform_point3(Vec3::ZERO);
        assert!(close(eye, Vec3::new(0.0, 0.0, 0.5)));
    }

    #[test]
    fn projection_flips_y() {
        let cam = camera();
        let unflipped = Mat4::perspective_rh(cam.vfov.to_radians(), cam.aspect(), cam.near, cam.far);
        assert!(cam.projection().y_axis.y < 0.0);
        assert_eq!(cam.projection().y_axis.y, -unflipped.y_axis.y);
    }

    #[test]
    fn aspect_follows_viewport() {
        let mut cam = camera();
        assert!((cam.aspect() - 800.0 / 600.0).abs() < 1e-6);
        cam.set_viewport(400, 400);
        assert_eq!(cam.aspect(), 1.0);
    }

    #[test]
    fn orbit_keeps_distance_to_target() {
        let mut cam = camera();
        let before = cam.distance();
        cam.orbit(120.0, -40.0);
        assert!((cam.distance() - before).abs() < 1e-4);
        assert!(!close(cam.position, Vec3::new(0.0, 0.0, 0.5)));
    }

    #[test]
    fn orbit_does_not_cross_the_pole() {
        let mut cam = camera();
        for _ in 0..100 {
            cam.orbit(0.0, 1000.0);
        }
        // Still off the vertical axis, so `up` stays well defined
        let offset = cam.position - cam.target;
        assert!(offset.x.abs() + offset.z.abs() > 0.0);
        assert!(offset.y < 0.0);
    }

    #[test]
    fn pan_moves_target_with_camera() {
        let mut cam = camera();
        let offset_before = cam.target - cam.position;
        cam.pan(100.0, 50.0);
        assert!(close(cam.target - cam.position, offset_before));
        assert!(!close(cam.target, Vec3::ZERO));
    }

    #[test]
    fn zoom_in_reduces_distance_and_clamps() {
        let mut cam = camera();
        cam.zoom(1.0);
        assert!(cam.distance() < 0.5);

        for _ in 0..200 {
            cam.zoom(5.0);
        }
        assert!(cam.distance() >= MIN_DISTANCE - 1e-6);
    }

    #[test]
    fn zoom_out_is_bounded() {
        let mut cam = camera();
        for _ in 0..10_000 {
            cam.zoom(-5.0);
        }
        assert!(cam.distance() <= MAX_DISTANCE + 1.0);
    }
}
