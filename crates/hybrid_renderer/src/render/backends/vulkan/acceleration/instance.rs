//! TLAS instance records
//!
//! [`GeometryInstance`] has the exact 64-byte layout of
//! `VkAccelerationStructureInstanceKHR`, so a slice of them uploads as the
//! instance buffer of a top-level build.

use ash::vk;

use crate::foundation::math::Mat4;
use crate::render::backends::vulkan::{VulkanError, VulkanResult};
use crate::render::scene::ModelInstance;

/// Visibility mask that every ray accepts
pub const DEFAULT_MASK: u8 = 0xFF;

const LOW_24: u32 = 0x00FF_FFFF;

/// One instance of a bottom-level structure in the TLAS
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeometryInstance {
    /// Object to world, row-major 3x4
    pub transform: [f32; 12],
    /// `gl_InstanceCustomIndexEXT` in the low 24 bits, mask in the high 8
    pub custom_index_and_mask: u32,
    /// Hit group offset in the low 24 bits, instance flags in the high 8
    pub sbt_offset_and_flags: u32,
    /// Device address of the BLAS
    pub blas_reference: u64,
}

unsafe impl bytemuck::Pod for GeometryInstance {}
unsafe impl bytemuck::Zeroable for GeometryInstance {}

impl GeometryInstance {
    /// Pack an instance; ids wider than 24 bits are truncated
    pub fn new(
        transform: &Mat4,
        instance_id: u32,
        hit_group: u32,
        flags: vk::GeometryInstanceFlagsKHR,
        blas_reference: u64,
    ) -> Self {
        // Flag bits all fit the 8-bit field
        let flags = flags.as_raw() & 0xFF;
        Self {
            transform: row_major_3x4(transform),
            custom_index_and_mask: (instance_id & LOW_24) | (u32::from(DEFAULT_MASK) << 24),
            sbt_offset_and_flags: (hit_group & LOW_24) | (flags << 24),
            blas_reference,
        }
    }

    /// Custom index seen by hit shaders
    pub const fn instance_id(&self) -> u32 {
        self.custom_index_and_mask & LOW_24
    }

    /// Visibility mask
    pub const fn mask(&self) -> u8 {
        (self.custom_index_and_mask >> 24) as u8
    }

    /// Hit group offset into the shader binding table
    pub const fn hit_group(&self) -> u32 {
        self.sbt_offset_and_flags & LOW_24
    }

    /// Instance flags
    pub const fn flags(&self) -> vk::GeometryInstanceFlagsKHR {
        vk::GeometryInstanceFlagsKHR::from_raw(self.sbt_offset_and_flags >> 24)
    }
}

/// Top three rows of `m`, row by row
pub fn row_major_3x4(m: &Mat4) -> [f32; 12] {
    let mut out = [0.0; 12];
    for row in 0..3 {
        for col in 0..4 {
            out[row * 4 + col] = m[(row, col)];
        }
    }
    out
}

/// Instance records for a TLAS over `instances`
///
/// Record `i` carries custom index `i` and references the BLAS of its model.
/// An empty instance list yields an empty plan, which still builds a valid TLAS.
pub fn plan_tlas(instances: &[ModelInstance], blas_addresses: &[u64]) -> VulkanResult<Vec<GeometryInstance>> {
    instances
        .iter()
        .enumerate()
        .map(|(i, instance)| {
            let blas = blas_addresses
                .get(instance.model_index as usize)
                .ok_or(VulkanError::MissingBlas {
                    model_index: instance.model_index,
                    blas_count: blas_addresses.len(),
                })?;
            let instance_id = u32::try_from(i).map_err(|_| VulkanError::InvalidOperation {
                reason: "Instance count exceeds u32".to_string(),
            })?;
            Ok(GeometryInstance::new(
                &instance.transform,
                instance_id,
                0,
                vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE,
                *blas,
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::{Transform, Vec3};

    fn instance(model_index: u32, x: f32) -> ModelInstance {
        ModelInstance::new(model_index, &Transform::from_position(Vec3::new(x, 0.0, 0.0)))
    }

    #[test]
    fn test_record_matches_vulkan_instance_size() {
        assert_eq!(std::mem::size_of::<GeometryInstance>(), 64);
        assert_eq!(
            std::mem::size_of::<GeometryInstance>(),
            std::mem::size_of::<vk::AccelerationStructureInstanceKHR>()
        );
    }

    #[test]
    fn test_packing_splits_24_and_8_bit_fields() {
        let record = GeometryInstance::new(
            &Mat4::identity(),
            0x0123_4567,
            5,
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE,
            0xABCD,
        );
        assert_eq!(record.instance_id(), 0x0023_4567);
        assert_eq!(record.mask(), 0xFF);
        assert_eq!(record.hit_group(), 5);
        assert_eq!(record.flags(), vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE);
        assert_eq!(record.blas_reference, 0xABCD);
    }

    #[test]
    fn test_transform_is_row_major_with_translation_last() {
        let m = Transform::from_position(Vec3::new(1.0, 2.0, 3.0)).to_matrix();
        let rows = row_major_3x4(&m);
        assert_eq!(rows, [1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 2.0, 0.0, 0.0, 1.0, 3.0]);
    }

    #[test]
    fn test_tlas_plan_has_one_record_per_instance() {
        let addresses = [100, 200, 300];
        for n in 0..5u32 {
            let instances: Vec<ModelInstance> = (0..n).map(|i| instance(i % 3, 0.0)).collect();
            let plan = plan_tlas(&instances, &addresses).unwrap();
            assert_eq!(plan.len(), n as usize);
        }
        assert!(plan_tlas(&[], &[]).unwrap().is_empty());
    }

    #[test]
    fn test_tlas_plan_keeps_input_order() {
        let addresses = [100, 200, 300];
        let instances = [instance(0, 0.0), instance(2, 1.0), instance(1, 2.0)];
        let plan = plan_tlas(&instances, &addresses).unwrap();

        let blas: Vec<u64> = plan.iter().map(|r| r.blas_reference).collect();
        assert_eq!(blas, vec![100, 300, 200]);
        let ids: Vec<u32> = plan.iter().map(GeometryInstance::instance_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(plan[1].transform[3], 1.0);
    }

    #[test]
    fn test_tlas_plan_rejects_model_without_blas() {
        let result = plan_tlas(&[instance(3, 0.0)], &[100, 200]);
        assert!(matches!(
            result,
            Err(VulkanError::MissingBlas {
                model_index: 3,
                blas_count: 2
            })
        ));
    }
}
