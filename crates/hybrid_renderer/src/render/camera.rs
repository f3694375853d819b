//! Perspective camera and a keyboard camera controller

use crate::events::{EventHandler, KeyCode, WindowEvent};
use crate::foundation::math::{utils, Mat4, Mat4Ext, Vec3};
use std::collections::HashSet;

/// 3D perspective camera
///
/// Uses a right-handed Y-up view space. The Vulkan coordinate flip is applied
/// between view and projection, see [`Camera::get_view_projection_matrix`].
#[derive(Debug, Clone)]
pub struct Camera {
    /// Camera position in world space
    pub position: Vec3,
    /// Point the camera is looking at in world space
    pub target: Vec3,
    /// Up vector for camera orientation (typically [0, 1, 0])
    pub up: Vec3,
    /// Field of view angle in radians
    pub fov: f32,
    /// Aspect ratio (width / height)
    pub aspect: f32,
    /// Distance to near clipping plane
    pub near: f32,
    /// Distance to far clipping plane
    pub far: f32,
}

impl Camera {
    /// Create a new perspective camera looking at the origin
    pub fn perspective(position: Vec3, fov_degrees: f32, aspect: f32, near: f32, far: f32) -> Self {
        Self {
            position,
            target: Vec3::zeros(),
            up: Vec3::new(0.0, 1.0, 0.0),
            fov: utils::deg_to_rad(fov_degrees),
            aspect,
            near,
            far,
        }
    }

    /// Configure camera to look at a specific point with custom up vector
    pub fn look_at(&mut self, target: Vec3, up: Vec3) {
        self.target = target;
        self.up = up;
    }

    /// Update camera aspect ratio for viewport changes
    pub fn set_aspect_ratio(&mut self, aspect: f32) {
        if (self.aspect - aspect).abs() > 0.01 {
            log::info!("Camera aspect ratio changed: {:.3} -> {:.3}", self.aspect, aspect);
        }
        self.aspect = aspect;
    }

    /// World to view space
    pub fn get_view_matrix(&self) -> Mat4 {
        Mat4::look_at(self.position, self.target, self.up)
    }

    /// Projection including the Vulkan Y/Z flip, so shaders can use `proj * view`
    pub fn get_projection_matrix(&self) -> Mat4 {
        Mat4::perspective(self.fov, self.aspect, self.near, self.far) * Mat4::vulkan_coordinate_transform()
    }

    /// Combined view-projection matrix: P × X × V
    pub fn get_view_projection_matrix(&self) -> Mat4 {
        self.get_projection_matrix() * self.get_view_matrix()
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 3.0, 10.0),
            target: Vec3::zeros(),
            up: Vec3::new(0.0, 1.0, 0.0),
            fov: std::f32::consts::FRAC_PI_4,
            aspect: 16.0 / 9.0,
            near: 0.1,
            far: 1000.0,
        }
    }
}

/// WASD/QE fly controller
///
/// Tracks held keys from [`WindowEvent`]s and moves the camera and its target
/// together, so the view direction is preserved. Resize events update the
/// aspect ratio.
pub struct CameraController {
    camera: Camera,
    speed: f32,
    held: HashSet<KeyCode>,
}

impl CameraController {
    /// Wrap a camera; `speed` is in world units per second
    pub fn new(camera: Camera, speed: f32) -> Self {
        Self {
            camera,
            speed,
            held: HashSet::new(),
        }
    }

    /// Current camera
    pub const fn camera(&self) -> &Camera {
        &self.camera
    }

    /// Advance the camera by `delta_time` seconds of held-key movement
    pub fn update(&mut self, delta_time: f32) {
        let forward = (self.camera.target - self.camera.position)
            .try_normalize(f32::EPSILON)
            .unwrap_or_else(|| Vec3::new(0.0, 0.0, -1.0));
        let right = forward.cross(&self.camera.up).try_normalize(f32::EPSILON).unwrap_or_else(|| Vec3::new(1.0, 0.0, 0.0));
        let up = self.camera.up;

        let mut direction = Vec3::zeros();
        for key in &self.held {
            match key {
                KeyCode::W => direction += forward,
                KeyCode::S => direction -= forward,
                KeyCode::D => direction += right,
                KeyCode::A => direction -= right,
                KeyCode::E => direction += up,
                KeyCode::Q => direction -= up,
                _ => {}
            }
        }

        if let Some(direction) = direction.try_normalize(f32::EPSILON) {
            let step = direction * self.speed * delta_time;
            self.camera.position += step;
            self.camera.target += step;
        }
    }
}

impl EventHandler for CameraController {
    #[allow(clippy::cast_precision_loss)]
    fn on_event(&mut self, event: &WindowEvent) -> bool {
        match *event {
            WindowEvent::KeyDown(key) if is_movement_key(key) => {
                self.held.insert(key);
                true
            }
            WindowEvent::KeyUp(key) if is_movement_key(key) => {
                self.held.remove(&key);
                true
            }
            WindowEvent::Resize(width, height) if width > 0 && height > 0 => {
                self.camera.set_aspect_ratio(width as f32 / height as f32);
                false
            }
            _ => false,
        }
    }
}

const fn is_movement_key(key: KeyCode) -> bool {
    matches!(key, KeyCode::W | KeyCode::A | KeyCode::S | KeyCode::D | KeyCode::Q | KeyCode::E)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::Vec4;
    use approx::assert_relative_eq;

    #[test]
    fn test_target_projects_to_screen_center() {
        let camera = Camera::perspective(Vec3::new(0.0, 2.0, 5.0), 60.0, 1.5, 0.1, 100.0);
        let clip = camera.get_view_projection_matrix() * Vec4::new(0.0, 0.0, 0.0, 1.0);
        assert_relative_eq!(clip.x / clip.w, 0.0, epsilon = 1e-5);
        assert_relative_eq!(clip.y / clip.w, 0.0, epsilon = 1e-5);
        let depth = clip.z / clip.w;
        assert!(depth > 0.0 && depth < 1.0);
    }

    #[test]
    fn test_world_up_maps_to_negative_clip_y() {
        let camera = Camera::perspective(Vec3::new(0.0, 0.0, 5.0), 60.0, 1.0, 0.1, 100.0);
        let clip = camera.get_view_projection_matrix() * Vec4::new(0.0, 1.0, 0.0, 1.0);
        assert!(clip.y / clip.w < 0.0);
    }

    #[test]
    fn test_controller_moves_forward_and_keeps_direction() {
        let camera = Camera::perspective(Vec3::new(0.0, 0.0, 10.0), 45.0, 1.0, 0.1, 100.0);
        let mut controller = CameraController::new(camera, 2.0);

        assert!(controller.on_event(&WindowEvent::KeyDown(KeyCode::W)));
        controller.update(1.0);
        assert_relative_eq!(controller.camera().position.z, 8.0, epsilon = 1e-5);
        assert_relative_eq!(controller.camera().target.z, -2.0, epsilon = 1e-5);

        controller.on_event(&WindowEvent::KeyUp(KeyCode::W));
        controller.update(1.0);
        assert_relative_eq!(controller.camera().position.z, 8.0, epsilon = 1e-5);
    }

    #[test]
    fn test_controller_tracks_resize_without_consuming() {
        let mut controller = CameraController::new(Camera::default(), 1.0);
        assert!(!controller.on_event(&WindowEvent::Resize(1280, 720)));
        assert_relative_eq!(controller.camera().aspect, 1280.0 / 720.0, epsilon = 1e-6);

        // A minimized window reports 0x0 and must not poison the aspect ratio
        controller.on_event(&WindowEvent::Resize(0, 0));
        assert!(controller.camera().aspect.is_finite());
    }
}
