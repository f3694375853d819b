//! Scene data handed to the renderer
//!
//! Asset loading lives outside the renderer. Whatever parses models produces
//! [`MeshData`] records and a flat texture list; the renderer uploads them once
//! and references them from [`ModelInstance`]s.

use crate::foundation::math::{Mat4, Transform, Vec3};
use std::f32::consts::PI;
use std::path::PathBuf;

/// Vertex layout shared by the raster pipeline and the hit shader
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vertex {
    /// Object-space position
    pub position: [f32; 3],
    /// Object-space normal
    pub normal: [f32; 3],
    /// Vertex color
    pub color: [f32; 3],
    /// Texture coordinate
    pub tex_coord: [f32; 2],
    /// Index into the owning model's material list
    pub material_id: i32,
}

unsafe impl bytemuck::Pod for Vertex {}
unsafe impl bytemuck::Zeroable for Vertex {}

impl Vertex {
    /// White vertex using material 0
    pub const fn new(position: [f32; 3], normal: [f32; 3], tex_coord: [f32; 2]) -> Self {
        Self {
            position,
            normal,
            color: [1.0, 1.0, 1.0],
            tex_coord,
            material_id: 0,
        }
    }
}

/// Wavefront-style material, stored with scalar block layout on the GPU
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Material {
    /// Ambient color
    pub ambient: [f32; 3],
    /// Diffuse color
    pub diffuse: [f32; 3],
    /// Specular color
    pub specular: [f32; 3],
    /// Transmitted color for refractive materials
    pub transmittance: [f32; 3],
    /// Emitted color
    pub emission: [f32; 3],
    /// Specular exponent
    pub shininess: f32,
    /// Index of refraction
    pub ior: f32,
    /// Opacity, 1 is opaque
    pub dissolve: f32,
    /// Illumination model: 0 color, 1 diffuse, 2 specular, 3 reflective, 4 refractive
    pub illum: i32,
    /// Texture index relative to the model's texture offset, -1 for none
    pub texture_id: i32,
}

unsafe impl bytemuck::Pod for Material {}
unsafe impl bytemuck::Zeroable for Material {}

impl Default for Material {
    fn default() -> Self {
        Self {
            ambient: [0.1, 0.1, 0.1],
            diffuse: [0.7, 0.7, 0.7],
            specular: [0.2, 0.2, 0.2],
            transmittance: [0.0, 0.0, 0.0],
            emission: [0.0, 0.0, 0.1],
            shininess: 0.0,
            ior: 1.0,
            dissolve: 1.0,
            illum: 1,
            texture_id: -1,
        }
    }
}

impl Material {
    /// Diffuse-only material of the given sRGB color
    pub fn diffuse(color: [f32; 3]) -> Self {
        Self {
            diffuse: color,
            ..Self::default()
        }
    }

    /// Convert the authored sRGB colors to linear space
    ///
    /// Ambient, diffuse and specular are authored in sRGB; the shaders light in
    /// linear space.
    #[must_use]
    pub fn to_linear(mut self) -> Self {
        let linearize = |c: [f32; 3]| c.map(|v| v.max(0.0).powf(2.2));
        self.ambient = linearize(self.ambient);
        self.diffuse = linearize(self.diffuse);
        self.specular = linearize(self.specular);
        self
    }
}

/// Texture handed to the renderer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextureSource {
    /// Image file decoded at upload time
    File(PathBuf),
    /// Already decoded RGBA8 pixels
    Rgba8 {
        /// Width in pixels
        width: u32,
        /// Height in pixels
        height: u32,
        /// Tightly packed RGBA bytes
        pixels: Vec<u8>,
    },
}

/// One model's geometry, materials and textures
#[derive(Debug, Clone, Default)]
pub struct MeshData {
    /// Vertex list
    pub vertices: Vec<Vertex>,
    /// Triangle list indices
    pub indices: Vec<u32>,
    /// Materials referenced by `Vertex::material_id`
    pub materials: Vec<Material>,
    /// Textures referenced by `Material::texture_id`
    pub textures: Vec<TextureSource>,
}

impl MeshData {
    /// Number of triangles
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Replace the material list with a single material
    #[must_use]
    pub fn with_material(mut self, material: Material) -> Self {
        self.materials = vec![material];
        for vertex in &mut self.vertices {
            vertex.material_id = 0;
        }
        self
    }

    /// Materials converted to linear space, with a default material if none
    /// were authored
    pub fn linear_materials(&self) -> Vec<Material> {
        if self.materials.is_empty() {
            return vec![Material::default()];
        }
        self.materials.iter().map(|m| m.to_linear()).collect()
    }

    /// Flat square on the XZ plane, centered at the origin, normal +Y
    pub fn plane(size: f32) -> Self {
        let h = size * 0.5;
        let n = [0.0, 1.0, 0.0];
        Self {
            vertices: vec![
                Vertex::new([-h, 0.0, -h], n, [0.0, 0.0]),
                Vertex::new([-h, 0.0, h], n, [0.0, 1.0]),
                Vertex::new([h, 0.0, h], n, [1.0, 1.0]),
                Vertex::new([h, 0.0, -h], n, [1.0, 0.0]),
            ],
            indices: vec![0, 1, 2, 0, 2, 3],
            ..Self::default()
        }
    }

    /// Axis-aligned cube with per-face normals
    pub fn cube(size: f32) -> Self {
        let h = size * 0.5;
        let faces: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
            ([1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]),
            ([-1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, -1.0]),
            ([0.0, 1.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0, 0.0]),
            ([0.0, -1.0, 0.0], [0.0, 0.0, -1.0], [1.0, 0.0, 0.0]),
            ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
            ([0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
        ];

        let mut mesh = Self::default();
        for (normal, u, v) in faces {
            let n = Vec3::from(normal);
            let u = Vec3::from(u);
            let v = Vec3::from(v);
            let base = u32::try_from(mesh.vertices.len()).unwrap_or(u32::MAX);
            for (su, sv, uv) in [(-1.0, -1.0, [0.0, 0.0]), (1.0, -1.0, [1.0, 0.0]), (1.0, 1.0, [1.0, 1.0]), (-1.0, 1.0, [0.0, 1.0])] {
                let p = (n + u * su + v * sv) * h;
                mesh.vertices.push(Vertex::new(p.into(), normal, uv));
            }
            mesh.indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }
        mesh
    }

    /// UV sphere with `segments` longitudinal and `rings` latitudinal divisions
    #[allow(clippy::cast_precision_loss)]
    pub fn uv_sphere(radius: f32, segments: u32, rings: u32) -> Self {
        let segments = segments.max(3);
        let rings = rings.max(2);
        let mut mesh = Self::default();

        for ring in 0..=rings {
            let v = ring as f32 / rings as f32;
            let theta = v * PI;
            for segment in 0..=segments {
                let u = segment as f32 / segments as f32;
                let phi = u * 2.0 * PI;
                let normal = [theta.sin() * phi.cos(), theta.cos(), theta.sin() * phi.sin()];
                let position = normal.map(|c| c * radius);
                mesh.vertices.push(Vertex::new(position, normal, [u, v]));
            }
        }

        let stride = segments + 1;
        for ring in 0..rings {
            for segment in 0..segments {
                let a = ring * stride + segment;
                let b = a + stride;
                mesh.indices.extend_from_slice(&[a, a + 1, b, a + 1, b + 1, b]);
            }
        }
        mesh
    }
}

/// Placement of a model in the world
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInstance {
    /// Index into the scene's model list
    pub model_index: u32,
    /// Object to world transform
    pub transform: Mat4,
}

impl ModelInstance {
    /// Instance of `model_index` placed by `transform`
    pub fn new(model_index: u32, transform: &Transform) -> Self {
        Self {
            model_index,
            transform: transform.to_matrix(),
        }
    }
}

/// Everything uploaded by a scene flush
#[derive(Debug, Clone, Default)]
pub struct SceneDescription {
    /// Models, indexed by [`ModelInstance::model_index`]
    pub models: Vec<MeshData>,
    /// Instances drawn and traced every frame
    pub instances: Vec<ModelInstance>,
    /// LDR equirectangular sky, sampled on primary ray misses
    pub sky: Option<PathBuf>,
    /// HDR equirectangular sky, used when the HDR toggle is on
    pub hdr_sky: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_gpu_layout_sizes() {
        assert_eq!(std::mem::size_of::<Vertex>(), 48);
        assert_eq!(std::mem::size_of::<Material>(), 80);
    }

    #[test]
    fn test_to_linear_applies_gamma_to_lit_colors_only() {
        let material = Material {
            diffuse: [0.5, 1.0, 0.0],
            emission: [0.5, 0.5, 0.5],
            ..Material::default()
        }
        .to_linear();

        assert_relative_eq!(material.diffuse[0], 0.5f32.powf(2.2), epsilon = 1e-6);
        assert_relative_eq!(material.diffuse[1], 1.0, epsilon = 1e-6);
        assert_eq!(material.emission, [0.5, 0.5, 0.5]);
    }

    #[test]
    fn test_missing_materials_get_default() {
        let mesh = MeshData::plane(1.0);
        assert_eq!(mesh.linear_materials().len(), 1);
    }

    #[test]
    fn test_procedural_meshes_index_in_range() {
        for mesh in [MeshData::plane(2.0), MeshData::cube(1.0), MeshData::uv_sphere(1.0, 16, 8)] {
            assert_eq!(mesh.indices.len() % 3, 0);
            let count = u32::try_from(mesh.vertices.len()).unwrap();
            assert!(mesh.indices.iter().all(|&i| i < count));
        }
    }

    #[test]
    fn test_sphere_vertices_lie_on_radius() {
        let mesh = MeshData::uv_sphere(2.0, 12, 6);
        for vertex in &mesh.vertices {
            assert_relative_eq!(Vec3::from(vertex.position).norm(), 2.0, epsilon = 1e-5);
        }
    }
}
