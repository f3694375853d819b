//! Bottom- and top-level acceleration structure builds
//!
//! Every model gets one BLAS over its opaque triangles. All BLAS builds are
//! recorded into a single one-shot command buffer that reuses one scratch
//! buffer sized for the largest build, with a barrier between builds. The
//! TLAS is then built over one instance record per scene instance.

use ash::extensions::khr::AccelerationStructure;
use ash::{vk, Device};

use super::instance::{plan_tlas, GeometryInstance};
use crate::render::backends::vulkan::rendering::commands::CommandPool;
use crate::render::backends::vulkan::resources::{
    AccelerationAllocation, Allocator, BufferAllocation, MemoryUsageClass,
};
use crate::render::backends::vulkan::{VulkanError, VulkanResult};
use crate::render::scene::{ModelInstance, Vertex};

/// Geometry of one model already resident on the GPU
pub struct BlasInput<'a> {
    /// Vertex buffer with `SHADER_DEVICE_ADDRESS` usage
    pub vertices: &'a BufferAllocation,
    /// Index buffer with `SHADER_DEVICE_ADDRESS` usage
    pub indices: &'a BufferAllocation,
    /// Vertex count
    pub vertex_count: u32,
    /// Index count, a multiple of three
    pub index_count: u32,
}

impl BlasInput<'_> {
    /// Triangle count of the build
    pub const fn primitive_count(&self) -> u32 {
        self.index_count / 3
    }

    fn geometry(&self, device: &Device) -> vk::AccelerationStructureGeometryKHR {
        let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::builder()
            .vertex_format(vk::Format::R32G32B32_SFLOAT)
            .vertex_data(vk::DeviceOrHostAddressConstKHR {
                device_address: self.vertices.device_address(device),
            })
            .vertex_stride(std::mem::size_of::<Vertex>() as vk::DeviceSize)
            .max_vertex(self.vertex_count.saturating_sub(1))
            .index_type(vk::IndexType::UINT32)
            .index_data(vk::DeviceOrHostAddressConstKHR {
                device_address: self.indices.device_address(device),
            })
            .build();

        vk::AccelerationStructureGeometryKHR::builder()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
            .flags(vk::GeometryFlagsKHR::OPAQUE)
            .build()
    }
}

/// Scratch bytes needed to run builds of the given sizes one after another
pub fn max_scratch(sizes: &[vk::DeviceSize]) -> vk::DeviceSize {
    sizes.iter().copied().max().unwrap_or(0)
}

/// Acceleration structures of one scene
pub struct SceneAccelerations {
    tlas: AccelerationAllocation,
    // Referenced by address from the TLAS; must outlive it
    blas: Vec<AccelerationAllocation>,
    instance_count: usize,
}

impl SceneAccelerations {
    /// Top-level handle bound to the ray tracing descriptor set
    pub const fn tlas(&self) -> vk::AccelerationStructureKHR {
        self.tlas.handle()
    }

    /// Number of bottom-level structures
    pub fn blas_count(&self) -> usize {
        self.blas.len()
    }

    /// Number of instances in the TLAS
    pub const fn instance_count(&self) -> usize {
        self.instance_count
    }

    /// Device addresses of the bottom-level structures, in model order
    pub fn blas_addresses(&self) -> Vec<vk::DeviceAddress> {
        self.blas.iter().map(AccelerationAllocation::device_address).collect()
    }
}

/// Builds scene acceleration structures on the graphics queue
pub struct AccelerationBuilder<'a> {
    allocator: &'a mut Allocator,
    commands: &'a CommandPool,
    queue: vk::Queue,
    loader: &'a AccelerationStructure,
}

impl<'a> AccelerationBuilder<'a> {
    /// Builder submitting one-shot work to `queue`
    pub fn new(
        allocator: &'a mut Allocator,
        commands: &'a CommandPool,
        queue: vk::Queue,
        loader: &'a AccelerationStructure,
    ) -> Self {
        Self {
            allocator,
            commands,
            queue,
            loader,
        }
    }

    /// Build every BLAS, then the TLAS over `instances`
    pub fn build_scene(
        &mut self,
        models: &[BlasInput<'_>],
        instances: &[ModelInstance],
    ) -> VulkanResult<SceneAccelerations> {
        let blas = self.build_blas(models)?;
        let addresses: Vec<vk::DeviceAddress> = blas.iter().map(AccelerationAllocation::device_address).collect();
        let tlas = self.build_tlas(instances, &addresses)?;
        log::info!(
            "[ACCEL] Scene built: {} BLAS, {} instances",
            blas.len(),
            instances.len()
        );
        Ok(SceneAccelerations {
            tlas,
            blas,
            instance_count: instances.len(),
        })
    }

    /// Rebuild only the TLAS, keeping the existing bottom-level structures
    pub fn rebuild_tlas(&mut self, scene: &mut SceneAccelerations, instances: &[ModelInstance]) -> VulkanResult<()> {
        let addresses = scene.blas_addresses();
        scene.tlas = self.build_tlas(instances, &addresses)?;
        scene.instance_count = instances.len();
        log::debug!("[ACCEL] TLAS rebuilt over {} instances", instances.len());
        Ok(())
    }

    /// One BLAS per model, built in a single submission
    pub fn build_blas(&mut self, models: &[BlasInput<'_>]) -> VulkanResult<Vec<AccelerationAllocation>> {
        if models.is_empty() {
            return Ok(Vec::new());
        }
        let device = self.allocator.device().clone();

        let geometries: Vec<[vk::AccelerationStructureGeometryKHR; 1]> =
            models.iter().map(|model| [model.geometry(&device)]).collect();

        let mut build_infos: Vec<vk::AccelerationStructureBuildGeometryInfoKHR> = geometries
            .iter()
            .map(|geometry| {
                vk::AccelerationStructureBuildGeometryInfoKHR::builder()
                    .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
                    .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
                    .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
                    .geometries(geometry)
                    .build()
            })
            .collect();

        let mut structures = Vec::with_capacity(models.len());
        let mut scratch_sizes = Vec::with_capacity(models.len());
        for (info, model) in build_infos.iter().zip(models) {
            let sizes = unsafe {
                self.loader.get_acceleration_structure_build_sizes(
                    vk::AccelerationStructureBuildTypeKHR::DEVICE,
                    info,
                    &[model.primitive_count()],
                )
            };
            structures.push(
                self.allocator
                    .create_acceleration(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL, sizes.acceleration_structure_size)?,
            );
            scratch_sizes.push(sizes.build_scratch_size);
        }

        let scratch = self.create_scratch(max_scratch(&scratch_sizes))?;
        let scratch_address = scratch.device_address(&device);
        for (info, structure) in build_infos.iter_mut().zip(&structures) {
            info.dst_acceleration_structure = structure.handle();
            info.scratch_data = vk::DeviceOrHostAddressKHR {
                device_address: scratch_address,
            };
        }

        let loader = self.loader;
        self.commands.run_single_time(self.queue, |command_buffer| {
            for (i, (info, model)) in build_infos.iter().zip(models).enumerate() {
                let range = vk::AccelerationStructureBuildRangeInfoKHR::builder()
                    .primitive_count(model.primitive_count())
                    .build();
                unsafe {
                    loader.cmd_build_acceleration_structures(command_buffer, std::slice::from_ref(info), &[&[range]]);
                }
                // Next build reuses the scratch buffer
                if i + 1 < models.len() {
                    acceleration_barrier(
                        &device,
                        command_buffer,
                        vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                        BETWEEN_BUILDS_ACCESS,
                    );
                }
            }
            Ok(())
        })?;
        drop(scratch);

        log::debug!(
            "[ACCEL] Built {} BLAS, scratch {} bytes",
            structures.len(),
            max_scratch(&scratch_sizes)
        );
        Ok(structures)
    }

    /// TLAS over `instances`; `blas_addresses` is indexed by model
    pub fn build_tlas(
        &mut self,
        instances: &[ModelInstance],
        blas_addresses: &[vk::DeviceAddress],
    ) -> VulkanResult<AccelerationAllocation> {
        let records: Vec<GeometryInstance> = plan_tlas(instances, blas_addresses)?;
        let instance_count = u32::try_from(records.len()).map_err(|_| VulkanError::InvalidOperation {
            reason: "Too many TLAS instances".to_string(),
        })?;
        let device = self.allocator.device().clone();

        // Sizes do not depend on the instance address
        let sizing_geometry = [tlas_geometry(0)];
        let sizing_info = tlas_build_info(&sizing_geometry);
        let sizes = unsafe {
            self.loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &sizing_info,
                &[instance_count],
            )
        };
        let tlas = self
            .allocator
            .create_acceleration(vk::AccelerationStructureTypeKHR::TOP_LEVEL, sizes.acceleration_structure_size)?;
        let scratch = self.create_scratch(sizes.build_scratch_size)?;
        let scratch_address = scratch.device_address(&device);

        let allocator = &mut *self.allocator;
        let loader = self.loader;
        let instance_buffer = self.commands.run_single_time(self.queue, |command_buffer| {
            let instance_buffer = allocator.create_device_local_buffer(
                command_buffer,
                &records,
                vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            )?;

            let geometry = [tlas_geometry(instance_buffer.device_address(&device))];
            let mut build_info = tlas_build_info(&geometry);
            build_info.dst_acceleration_structure = tlas.handle();
            build_info.scratch_data = vk::DeviceOrHostAddressKHR {
                device_address: scratch_address,
            };
            let range = vk::AccelerationStructureBuildRangeInfoKHR::builder()
                .primitive_count(instance_count)
                .build();

            // Instance upload must land before the build reads it
            let barrier = vk::MemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(INSTANCE_INPUT_ACCESS)
                .build();
            unsafe {
                device.cmd_pipeline_barrier(
                    command_buffer,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                    vk::DependencyFlags::empty(),
                    &[barrier],
                    &[],
                    &[],
                );
                loader.cmd_build_acceleration_structures(command_buffer, &[build_info], &[&[range]]);
            }
            acceleration_barrier(
                &device,
                command_buffer,
                vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
                vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR,
            );
            Ok(instance_buffer)
        });
        // Staging for a failed upload is released here as well
        self.allocator.flush_staging();
        drop(scratch);
        drop(instance_buffer?);

        log::debug!(
            "[ACCEL] Built TLAS with {} instances, {} bytes",
            instance_count,
            sizes.acceleration_structure_size
        );
        Ok(tlas)
    }

    fn create_scratch(&self, size: vk::DeviceSize) -> VulkanResult<BufferAllocation> {
        self.allocator.create_buffer(
            size,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryUsageClass::GpuOnly,
        )
    }
}

/// Access of a BLAS build that follows another: reads the previous
/// structure and rewrites the shared scratch buffer
const BETWEEN_BUILDS_ACCESS: vk::AccessFlags = vk::AccessFlags::from_raw(
    vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR.as_raw() | vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR.as_raw(),
);

/// Access of the TLAS build reading the uploaded instance records
const INSTANCE_INPUT_ACCESS: vk::AccessFlags = vk::AccessFlags::from_raw(
    vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR.as_raw() | vk::AccessFlags::SHADER_READ.as_raw(),
);

fn tlas_geometry(instance_address: vk::DeviceAddress) -> vk::AccelerationStructureGeometryKHR {
    vk::AccelerationStructureGeometryKHR::builder()
        .geometry_type(vk::GeometryTypeKHR::INSTANCES)
        .geometry(vk::AccelerationStructureGeometryDataKHR {
            instances: vk::AccelerationStructureGeometryInstancesDataKHR::builder()
                .array_of_pointers(false)
                .data(vk::DeviceOrHostAddressConstKHR {
                    device_address: instance_address,
                })
                .build(),
        })
        .build()
}

fn tlas_build_info(geometry: &[vk::AccelerationStructureGeometryKHR]) -> vk::AccelerationStructureBuildGeometryInfoKHR {
    vk::AccelerationStructureBuildGeometryInfoKHR::builder()
        .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
        .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .geometries(geometry)
        .build()
}

fn acceleration_barrier(
    device: &Device,
    command_buffer: vk::CommandBuffer,
    dst_stage: vk::PipelineStageFlags,
    dst_access: vk::AccessFlags,
) {
    let barrier = vk::MemoryBarrier::builder()
        .src_access_mask(vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR)
        .dst_access_mask(dst_access)
        .build();
    unsafe {
        device.cmd_pipeline_barrier(
            command_buffer,
            vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[barrier],
            &[],
            &[],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_barriers_cover_scratch_and_instance_reads() {
        assert!(BETWEEN_BUILDS_ACCESS.contains(vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR));
        assert!(BETWEEN_BUILDS_ACCESS.contains(vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR));
        assert!(INSTANCE_INPUT_ACCESS.contains(vk::AccessFlags::SHADER_READ));
        assert!(!INSTANCE_INPUT_ACCESS.contains(vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR));
    }

    #[test]
    fn test_tlas_geometry_points_at_instance_records() {
        let geometry = [tlas_geometry(0x1000)];
        let info = tlas_build_info(&geometry);
        assert_eq!(info.ty, vk::AccelerationStructureTypeKHR::TOP_LEVEL);
        assert_eq!(info.geometry_count, 1);
        assert_eq!(geometry[0].geometry_type, vk::GeometryTypeKHR::INSTANCES);
        let instances = unsafe { geometry[0].geometry.instances };
        assert_eq!(instances.array_of_pointers, vk::FALSE);
        assert_eq!(unsafe { instances.data.device_address }, 0x1000);
    }

    #[test]
    fn test_scratch_covers_largest_build() {
        assert_eq!(max_scratch(&[256, 4096, 1024]), 4096);
        assert_eq!(max_scratch(&[512]), 512);
        assert_eq!(max_scratch(&[]), 0);
    }
}
