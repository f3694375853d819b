//! GPU-visible data layouts
//!
//! `#[repr(C)]` mirrors of the uniform, storage and push-constant blocks the
//! shaders declare, plus the vertex input description.

use ash::vk;
use std::mem::{offset_of, size_of};

use crate::foundation::math::{utils, Mat4, Vec3};
use crate::render::camera::Camera;
use crate::render::scene::Vertex;

/// Camera block, one copy per frame slot in a dynamic uniform buffer
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraUniform {
    /// World-space eye position, w = 1
    pub position: [f32; 4],
    /// World to view
    pub view: [[f32; 4]; 4],
    /// View to clip
    pub proj: [[f32; 4]; 4],
    /// View to world, used to build primary rays
    pub view_inverse: [[f32; 4]; 4],
    /// Clip to view, used to build primary rays
    pub proj_inverse: [[f32; 4]; 4],
}

unsafe impl bytemuck::Pod for CameraUniform {}
unsafe impl bytemuck::Zeroable for CameraUniform {}

impl CameraUniform {
    /// Matrices for `camera`; singular matrices invert to identity
    pub fn from_camera(camera: &Camera) -> Self {
        let view = camera.get_view_matrix();
        let proj = camera.get_projection_matrix();
        let invert = |m: &Mat4| m.try_inverse().unwrap_or_else(Mat4::identity);
        Self {
            position: [camera.position.x, camera.position.y, camera.position.z, 1.0],
            view: utils::mat4_to_cols(&view),
            proj: utils::mat4_to_cols(&proj),
            view_inverse: utils::mat4_to_cols(&invert(&view)),
            proj_inverse: utils::mat4_to_cols(&invert(&proj)),
        }
    }
}

/// Per-instance record in the instance storage buffer
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstanceGpu {
    /// Object to world
    pub model: [[f32; 4]; 4],
    /// Inverse-transpose of `model`, for normals
    pub model_it: [[f32; 4]; 4],
    /// Model index into the per-model descriptor arrays
    pub object_index: u32,
    /// First texture of the model in the flat texture array
    pub texture_offset: u32,
}

unsafe impl bytemuck::Pod for InstanceGpu {}
unsafe impl bytemuck::Zeroable for InstanceGpu {}

impl InstanceGpu {
    /// Record for an instance of `object_index` placed by `model`
    pub fn new(model: &Mat4, object_index: u32, texture_offset: u32) -> Self {
        Self {
            model: utils::mat4_to_cols(model),
            model_it: utils::mat4_to_cols(&utils::inverse_transpose(model)),
            object_index,
            texture_offset,
        }
    }
}

/// Raster pass push constants
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterPushConstant {
    /// World-space light position
    pub light_position: [f32; 3],
    /// Index into the instance buffer
    pub instance_id: u32,
    /// Light color
    pub light_color: [f32; 3],
    _pad: f32,
}

unsafe impl bytemuck::Pod for RasterPushConstant {}
unsafe impl bytemuck::Zeroable for RasterPushConstant {}

impl RasterPushConstant {
    /// Stages reading the block
    pub const STAGES: vk::ShaderStageFlags =
        vk::ShaderStageFlags::from_raw(vk::ShaderStageFlags::VERTEX.as_raw() | vk::ShaderStageFlags::FRAGMENT.as_raw());

    /// Block for one instance draw
    pub fn new(light_position: Vec3, light_color: [f32; 3], instance_id: u32) -> Self {
        Self {
            light_position: light_position.into(),
            instance_id,
            light_color,
            _pad: 0.0,
        }
    }
}

/// Ray tracing push constants
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RtPushConstant {
    /// Returned by rays that miss when no sky is bound
    pub clear_color: [f32; 4],
    /// Light position, or direction for directional lights
    pub light_position: [f32; 3],
    /// Point light intensity
    pub light_intensity: f32,
    /// 0 point, 1 directional
    pub light_type: i32,
    /// Jittered primary rays per pixel
    pub samples: u32,
    /// Non-zero samples the HDR sky instead of the LDR one
    pub hdr: i32,
    /// Index of refraction for refractive materials
    pub ior: f32,
    /// Fresnel reflectance at normal incidence
    pub f0: f32,
}

unsafe impl bytemuck::Pod for RtPushConstant {}
unsafe impl bytemuck::Zeroable for RtPushConstant {}

impl RtPushConstant {
    /// Stages reading the block
    pub const STAGES: vk::ShaderStageFlags = vk::ShaderStageFlags::from_raw(
        vk::ShaderStageFlags::RAYGEN_KHR.as_raw()
            | vk::ShaderStageFlags::CLOSEST_HIT_KHR.as_raw()
            | vk::ShaderStageFlags::MISS_KHR.as_raw(),
    );
}

impl Default for RtPushConstant {
    fn default() -> Self {
        Self {
            clear_color: [1.0, 1.0, 1.0, 1.0],
            light_position: [0.0, 0.0, 0.0],
            light_intensity: 100.0,
            light_type: 0,
            samples: 1,
            hdr: 0,
            ior: 1.0,
            f0: 0.1,
        }
    }
}

/// Post pass push constant
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PostPushConstant {
    /// Swapchain width over height
    pub aspect_ratio: f32,
}

unsafe impl bytemuck::Pod for PostPushConstant {}
unsafe impl bytemuck::Zeroable for PostPushConstant {}

impl PostPushConstant {
    /// Stages reading the block
    pub const STAGES: vk::ShaderStageFlags = vk::ShaderStageFlags::FRAGMENT;
}

/// Push-constant range covering all of `T`
pub fn push_constant_range<T>(stages: vk::ShaderStageFlags) -> vk::PushConstantRange {
    vk::PushConstantRange {
        stage_flags: stages,
        offset: 0,
        size: u32::try_from(size_of::<T>()).unwrap_or(u32::MAX),
    }
}

/// Round `value` up to a multiple of `alignment` (a power of two, or 0)
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        value
    } else {
        (value + alignment - 1) & !(alignment - 1)
    }
}

/// Vertex buffer binding for [`Vertex`]
pub fn vertex_binding_descriptions() -> [vk::VertexInputBindingDescription; 1] {
    [vk::VertexInputBindingDescription {
        binding: 0,
        stride: size_of::<Vertex>() as u32,
        input_rate: vk::VertexInputRate::VERTEX,
    }]
}

/// Attribute locations 0..=4: position, normal, color, uv, material id
pub fn vertex_attribute_descriptions() -> [vk::VertexInputAttributeDescription; 5] {
    let attribute = |location, format, offset: usize| vk::VertexInputAttributeDescription {
        location,
        binding: 0,
        format,
        offset: offset as u32,
    };
    [
        attribute(0, vk::Format::R32G32B32_SFLOAT, offset_of!(Vertex, position)),
        attribute(1, vk::Format::R32G32B32_SFLOAT, offset_of!(Vertex, normal)),
        attribute(2, vk::Format::R32G32B32_SFLOAT, offset_of!(Vertex, color)),
        attribute(3, vk::Format::R32G32_SFLOAT, offset_of!(Vertex, tex_coord)),
        attribute(4, vk::Format::R32_SINT, offset_of!(Vertex, material_id)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_block_sizes_match_shader_declarations() {
        assert_eq!(size_of::<CameraUniform>(), 272);
        assert_eq!(size_of::<InstanceGpu>(), 136);
        assert_eq!(size_of::<RasterPushConstant>(), 32);
        assert_eq!(size_of::<RtPushConstant>(), 52);
        assert_eq!(size_of::<PostPushConstant>(), 4);
    }

    #[test]
    fn test_vertex_attributes_follow_struct_layout() {
        let attributes = vertex_attribute_descriptions();
        let offsets: Vec<u32> = attributes.iter().map(|a| a.offset).collect();
        assert_eq!(offsets, vec![0, 12, 24, 36, 44]);
        assert_eq!(attributes[4].format, vk::Format::R32_SINT);
        assert_eq!(vertex_binding_descriptions()[0].stride, 48);
    }

    #[test]
    fn test_camera_inverse_round_trips_view() {
        let camera = Camera::default();
        let uniform = CameraUniform::from_camera(&camera);
        let view = Mat4::from(uniform.view);
        let view_inverse = Mat4::from(uniform.view_inverse);
        let product = view * view_inverse;
        for r in 0..4 {
            for c in 0..4 {
                let expected = if r == c { 1.0 } else { 0.0 };
                assert_relative_eq!(product[(r, c)], expected, epsilon = 1e-4);
            }
        }
        assert_eq!(uniform.position[3], 1.0);
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(272, 256), 512);
        assert_eq!(align_up(32, 32), 32);
        assert_eq!(align_up(5, 0), 5);
    }

    #[test]
    fn test_rt_defaults() {
        let push = RtPushConstant::default();
        assert_relative_eq!(push.light_intensity, 100.0);
        assert_eq!(push.light_type, 0);
        assert_eq!(push.samples, 1);
        assert_relative_eq!(push.ior, 1.0);
        assert_relative_eq!(push.f0, 0.1);
    }
}
