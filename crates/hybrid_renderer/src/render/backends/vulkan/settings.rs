//! Per-frame render settings
//!
//! Everything here can change between frames without touching descriptor
//! sets or acceleration structures. Only scene changes move the revision
//! that descriptor writes are checked against.

use std::fmt;

use crate::foundation::math::Vec3;
use crate::render::backends::vulkan::resources::gpu_types::{RasterPushConstant, RtPushConstant};

/// Which path fills the offscreen image this frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderMode {
    /// Forward rasterization into the MSAA target
    #[default]
    Raster,
    /// Ray tracing into the resolved storage image
    RayTrace,
}

impl RenderMode {
    /// The other mode
    #[must_use]
    pub const fn toggled(self) -> Self {
        match self {
            Self::Raster => Self::RayTrace,
            Self::RayTrace => Self::Raster,
        }
    }
}

impl fmt::Display for RenderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raster => f.write_str("raster"),
            Self::RayTrace => f.write_str("ray trace"),
        }
    }
}

/// Light model shared by both paths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LightType {
    /// Positional light with falloff
    #[default]
    Point,
    /// Light from a direction, no falloff
    Directional,
}

/// Mode, light and tracing parameters
#[derive(Debug, Clone, PartialEq)]
pub struct RenderSettings {
    /// Active render path
    pub mode: RenderMode,
    /// Clear color of the offscreen and post passes
    pub clear_color: [f32; 4],
    /// Light position, or direction for [`LightType::Directional`]
    pub light_position: Vec3,
    /// Light color used by the raster path
    pub light_color: [f32; 3],
    /// Point light intensity used by the ray tracing path
    pub light_intensity: f32,
    /// Light model
    pub light_type: LightType,
    /// Primary rays per pixel
    pub samples_per_pixel: u32,
    /// Sample the HDR sky instead of the LDR one
    pub hdr_sky: bool,
    /// Index of refraction for refractive materials
    pub ior: f32,
    /// Fresnel reflectance at normal incidence
    pub f0: f32,
}

impl Default for RenderSettings {
    fn default() -> Self {
        let traced = RtPushConstant::default();
        Self {
            mode: RenderMode::default(),
            clear_color: traced.clear_color,
            light_position: Vec3::new(10.0, 15.0, 8.0),
            light_color: [1.0, 0.0, 1.0],
            light_intensity: traced.light_intensity,
            light_type: LightType::default(),
            samples_per_pixel: traced.samples,
            hdr_sky: false,
            ior: traced.ior,
            f0: traced.f0,
        }
    }
}

impl RenderSettings {
    /// Switch between raster and ray tracing
    pub fn toggle_mode(&mut self) -> RenderMode {
        self.mode = self.mode.toggled();
        self.mode
    }

    /// Raster push block for one instance draw
    pub fn raster_push(&self, instance_id: u32) -> RasterPushConstant {
        RasterPushConstant::new(self.light_position, self.light_color, instance_id)
    }

    /// Ray tracing push block
    pub fn ray_trace_push(&self) -> RtPushConstant {
        RtPushConstant {
            clear_color: self.clear_color,
            light_position: self.light_position.into(),
            light_intensity: self.light_intensity,
            light_type: match self.light_type {
                LightType::Point => 0,
                LightType::Directional => 1,
            },
            samples: self.samples_per_pixel.max(1),
            hdr: i32::from(self.hdr_sky),
            ior: self.ior,
            f0: self.f0,
        }
    }
}

/// Scene revision the descriptor sets were last written against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BindingState {
    written: Option<u64>,
}

impl BindingState {
    /// Whether the sets already reference scene revision `revision`
    pub fn is_current(&self, revision: u64) -> bool {
        self.written == Some(revision)
    }

    /// Record that the sets were written against `revision`
    pub fn mark_written(&mut self, revision: u64) {
        self.written = Some(revision);
    }

    /// Sets were recreated and hold nothing
    pub fn invalidate(&mut self) {
        self.written = None;
    }
}

/// Work one frame has to do before recording
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramePlan {
    /// Path recorded into the offscreen image
    pub mode: RenderMode,
    /// Descriptor sets must be rewritten first
    pub write_descriptors: bool,
}

/// Plan a frame from the settings and the binding bookkeeping
pub fn plan_frame(settings: &RenderSettings, bindings: &BindingState, scene_revision: u64) -> FramePlan {
    FramePlan {
        mode: settings.mode,
        write_descriptors: !bindings.is_current(scene_revision),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toggling_mode_needs_no_descriptor_writes() {
        let mut settings = RenderSettings::default();
        let mut bindings = BindingState::default();
        let revision = 1;

        let first = plan_frame(&settings, &bindings, revision);
        assert!(first.write_descriptors);
        bindings.mark_written(revision);

        let mut modes = Vec::new();
        for _ in 0..4 {
            settings.toggle_mode();
            let plan = plan_frame(&settings, &bindings, revision);
            assert!(!plan.write_descriptors);
            modes.push(plan.mode);
        }
        assert_eq!(
            modes,
            vec![RenderMode::RayTrace, RenderMode::Raster, RenderMode::RayTrace, RenderMode::Raster]
        );
    }

    #[test]
    fn test_scene_change_or_rebuild_requires_writes() {
        let settings = RenderSettings::default();
        let mut bindings = BindingState::default();
        bindings.mark_written(3);
        assert!(plan_frame(&settings, &bindings, 4).write_descriptors);

        bindings.mark_written(4);
        bindings.invalidate();
        assert!(plan_frame(&settings, &bindings, 4).write_descriptors);
    }

    #[test]
    fn test_ray_trace_push_reflects_settings() {
        let settings = RenderSettings {
            light_type: LightType::Directional,
            hdr_sky: true,
            samples_per_pixel: 0,
            ..RenderSettings::default()
        };
        let push = settings.ray_trace_push();
        assert_eq!(push.light_type, 1);
        assert_eq!(push.hdr, 1);
        assert_eq!(push.samples, 1);
        assert_eq!(push.light_intensity, 100.0);
    }

    #[test]
    fn test_raster_push_carries_instance() {
        let push = RenderSettings::default().raster_push(7);
        assert_eq!(push.instance_id, 7);
        assert_eq!(push.light_color, [1.0, 0.0, 1.0]);
    }
}
