//! Ray tracing pipeline and shader binding table
//!
//! The pipeline has four stages in four groups with a fixed order: raygen,
//! primary miss, shadow miss, then one triangle hit group with a closest-hit
//! shader. Shaders index miss shaders by that order (`traceRayEXT` miss index
//! 0 is the sky, 1 is the shadow probe), so the order is part of the shader
//! interface.

use ash::extensions::khr::RayTracingPipeline as RayTracingLoader;
use ash::{vk, Device};

use super::pipeline::PipelineLayout;
use super::shader::ShaderModule;
use crate::render::backends::vulkan::resources::gpu_types::align_up;
use crate::render::backends::vulkan::resources::{Allocator, BufferAllocation, MemoryUsageClass};
use crate::render::backends::vulkan::{VulkanError, VulkanResult};

/// Raygen group index
pub const RAYGEN_GROUP: u32 = 0;
/// Primary (sky) miss group index
pub const MISS_GROUP: u32 = 1;
/// Shadow miss group index
pub const SHADOW_MISS_GROUP: u32 = 2;
/// Triangle hit group index
pub const HIT_GROUP: u32 = 3;
/// Number of shader groups
pub const GROUP_COUNT: u32 = 4;
/// Miss shaders in the table
pub const MISS_COUNT: u64 = 2;

/// Shader stages in pipeline stage order
pub const STAGE_ORDER: [vk::ShaderStageFlags; 4] = [
    vk::ShaderStageFlags::RAYGEN_KHR,
    vk::ShaderStageFlags::MISS_KHR,
    vk::ShaderStageFlags::MISS_KHR,
    vk::ShaderStageFlags::CLOSEST_HIT_KHR,
];

/// Group create infos in group order; stage `i` feeds group `i`
pub fn shader_groups() -> [vk::RayTracingShaderGroupCreateInfoKHR; 4] {
    let general = |stage: u32| {
        vk::RayTracingShaderGroupCreateInfoKHR::builder()
            .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
            .general_shader(stage)
            .closest_hit_shader(vk::SHADER_UNUSED_KHR)
            .any_hit_shader(vk::SHADER_UNUSED_KHR)
            .intersection_shader(vk::SHADER_UNUSED_KHR)
            .build()
    };
    let hit = vk::RayTracingShaderGroupCreateInfoKHR::builder()
        .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
        .general_shader(vk::SHADER_UNUSED_KHR)
        .closest_hit_shader(HIT_GROUP)
        .any_hit_shader(vk::SHADER_UNUSED_KHR)
        .intersection_shader(vk::SHADER_UNUSED_KHR)
        .build();

    [general(RAYGEN_GROUP), general(MISS_GROUP), general(SHADOW_MISS_GROUP), hit]
}

/// Recursion depth actually requested from the driver
pub fn clamp_recursion(requested: u32, device_max: u32) -> u32 {
    if requested > device_max {
        log::warn!(
            "[PIPELINE] Ray recursion depth {} exceeds device limit {}; clamping",
            requested,
            device_max
        );
        device_max
    } else {
        requested
    }
}

/// Byte layout of the shader binding table
///
/// Regions start on `shaderGroupBaseAlignment`; entries within a region are
/// `shaderGroupHandleSize` rounded up to `shaderGroupHandleAlignment`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbtLayout {
    /// Bytes of one opaque group handle
    pub handle_size: u64,
    /// Stride between entries of the miss and hit regions
    pub handle_size_aligned: u64,
    /// Alignment of every region start
    pub base_alignment: u64,
    /// Raygen region size; the raygen stride must equal it
    pub raygen_size: u64,
    /// Offset of the miss region
    pub miss_offset: u64,
    /// Miss region size
    pub miss_size: u64,
    /// Offset of the hit region
    pub hit_offset: u64,
    /// Hit region size
    pub hit_size: u64,
}

impl SbtLayout {
    /// Layout for one raygen, two miss and one hit entry
    pub const fn new(handle_size: u32, handle_alignment: u32, base_alignment: u32) -> Self {
        let handle_size = handle_size as u64;
        let base_alignment = base_alignment as u64;
        let handle_size_aligned = align_up(handle_size, handle_alignment as u64);

        let raygen_size = align_up(handle_size_aligned, base_alignment);
        let miss_offset = raygen_size;
        let miss_size = align_up(MISS_COUNT * handle_size_aligned, base_alignment);
        let hit_offset = miss_offset + miss_size;
        let hit_size = align_up(handle_size_aligned, base_alignment);

        Self {
            handle_size,
            handle_size_aligned,
            base_alignment,
            raygen_size,
            miss_offset,
            miss_size,
            hit_offset,
            hit_size,
        }
    }

    /// Layout for the device's ray tracing properties
    pub const fn from_properties(properties: &vk::PhysicalDeviceRayTracingPipelinePropertiesKHR) -> Self {
        Self::new(
            properties.shader_group_handle_size,
            properties.shader_group_handle_alignment,
            properties.shader_group_base_alignment,
        )
    }

    /// Total bytes of the table
    pub const fn total_size(&self) -> u64 {
        self.hit_offset + self.hit_size
    }

    /// Byte offset of each group's entry, in group order
    pub const fn entry_offsets(&self) -> [u64; 4] {
        [
            0,
            self.miss_offset,
            self.miss_offset + self.handle_size_aligned,
            self.hit_offset,
        ]
    }

    /// Regions for `vkCmdTraceRaysKHR` with the table at `base_address`
    pub const fn regions(&self, base_address: vk::DeviceAddress) -> SbtRegions {
        SbtRegions {
            raygen: vk::StridedDeviceAddressRegionKHR {
                device_address: base_address,
                stride: self.raygen_size,
                size: self.raygen_size,
            },
            miss: vk::StridedDeviceAddressRegionKHR {
                device_address: base_address + self.miss_offset,
                stride: self.handle_size_aligned,
                size: self.miss_size,
            },
            hit: vk::StridedDeviceAddressRegionKHR {
                device_address: base_address + self.hit_offset,
                stride: self.handle_size_aligned,
                size: self.hit_size,
            },
            callable: vk::StridedDeviceAddressRegionKHR {
                device_address: 0,
                stride: 0,
                size: 0,
            },
        }
    }
}

/// The four regions passed to a trace call
#[derive(Debug, Clone, Copy)]
pub struct SbtRegions {
    /// Raygen region
    pub raygen: vk::StridedDeviceAddressRegionKHR,
    /// Miss region
    pub miss: vk::StridedDeviceAddressRegionKHR,
    /// Hit group region
    pub hit: vk::StridedDeviceAddressRegionKHR,
    /// Unused callable region
    pub callable: vk::StridedDeviceAddressRegionKHR,
}

/// Scatter tightly packed group handles into table layout
pub fn pack_sbt(layout: &SbtLayout, handles: &[u8]) -> VulkanResult<Vec<u8>> {
    let handle_size = usize::try_from(layout.handle_size).unwrap_or(usize::MAX);
    let expected = handle_size.saturating_mul(GROUP_COUNT as usize);
    if handles.len() != expected {
        return Err(VulkanError::InvalidOperation {
            reason: format!("Expected {expected} bytes of group handles, got {}", handles.len()),
        });
    }

    let mut table = vec![0u8; usize::try_from(layout.total_size()).unwrap_or(0)];
    for (handle, offset) in handles.chunks_exact(handle_size).zip(layout.entry_offsets()) {
        let offset = usize::try_from(offset).unwrap_or(usize::MAX);
        table[offset..offset + handle_size].copy_from_slice(handle);
    }
    Ok(table)
}

/// The four ray tracing shaders in stage order
pub struct RayTracingShaders<'a> {
    /// Primary ray generation
    pub ray_gen: &'a ShaderModule,
    /// Sky lookup on miss
    pub miss: &'a ShaderModule,
    /// Shadow probe miss
    pub shadow_miss: &'a ShaderModule,
    /// Triangle shading
    pub closest_hit: &'a ShaderModule,
}

/// Ray tracing pipeline with RAII cleanup; owns its layout
pub struct RayTracingPipeline {
    device: Device,
    pipeline: vk::Pipeline,
    layout: PipelineLayout,
}

impl RayTracingPipeline {
    /// Create the pipeline; `max_recursion` must already be clamped to the device
    pub fn new(
        device: &Device,
        loader: &RayTracingLoader,
        shaders: &RayTracingShaders<'_>,
        layout: PipelineLayout,
        max_recursion: u32,
    ) -> VulkanResult<Self> {
        let modules = [shaders.ray_gen, shaders.miss, shaders.shadow_miss, shaders.closest_hit];
        let stages: Vec<vk::PipelineShaderStageCreateInfo> = modules
            .iter()
            .zip(STAGE_ORDER)
            .map(|(module, stage)| module.stage_info(stage))
            .collect();
        let groups = shader_groups();

        let create_info = vk::RayTracingPipelineCreateInfoKHR::builder()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(max_recursion)
            .layout(layout.handle())
            .build();

        let pipelines = unsafe {
            loader
                .create_ray_tracing_pipelines(
                    vk::DeferredOperationKHR::null(),
                    vk::PipelineCache::null(),
                    &[create_info],
                    None,
                )
                .map_err(|err| {
                    log::error!("[PIPELINE] Ray tracing pipeline creation failed: {:?}", err);
                    VulkanError::Api(err)
                })?
        };
        let pipeline = pipelines.into_iter().next().ok_or_else(|| VulkanError::InvalidOperation {
            reason: "Driver returned no ray tracing pipeline".to_string(),
        })?;

        log::debug!("[PIPELINE] Ray tracing pipeline, recursion depth {}", max_recursion);
        Ok(Self {
            device: device.clone(),
            pipeline,
            layout,
        })
    }

    /// Pipeline handle
    pub const fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    /// Layout handle
    pub const fn layout(&self) -> vk::PipelineLayout {
        self.layout.handle()
    }
}

impl Drop for RayTracingPipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
        }
    }
}

/// Host-visible table buffer plus the regions that address it
pub struct ShaderBindingTable {
    regions: SbtRegions,
    _buffer: BufferAllocation,
}

impl ShaderBindingTable {
    /// Fetch group handles from `pipeline` and upload them in table layout
    pub fn new(
        allocator: &Allocator,
        loader: &RayTracingLoader,
        pipeline: &RayTracingPipeline,
        properties: &vk::PhysicalDeviceRayTracingPipelinePropertiesKHR,
    ) -> VulkanResult<Self> {
        let layout = SbtLayout::from_properties(properties);
        let handle_bytes = properties.shader_group_handle_size as usize * GROUP_COUNT as usize;
        let handles = unsafe {
            loader
                .get_ray_tracing_shader_group_handles(pipeline.handle(), 0, GROUP_COUNT, handle_bytes)
                .map_err(VulkanError::Api)?
        };
        let table = pack_sbt(&layout, &handles)?;

        // Slack so the table start can be rounded up to the base alignment
        let mut buffer = allocator.create_buffer(
            layout.total_size() + layout.base_alignment,
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryUsageClass::CpuToGpu,
        )?;
        let buffer_address = buffer.device_address(allocator.device());
        let table_address = align_up(buffer_address, layout.base_alignment);
        buffer.write(table_address - buffer_address, &table)?;

        log::debug!(
            "[PIPELINE] Shader binding table: {} bytes, handle {} aligned {}",
            layout.total_size(),
            layout.handle_size,
            layout.handle_size_aligned
        );

        Ok(Self {
            regions: layout.regions(table_address),
            _buffer: buffer,
        })
    }

    /// Regions for the trace call
    pub const fn regions(&self) -> &SbtRegions {
        &self.regions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_order_is_raygen_miss_shadow_hit() {
        let groups = shader_groups();
        assert_eq!(groups.len(), GROUP_COUNT as usize);
        assert_eq!(groups[0].ty, vk::RayTracingShaderGroupTypeKHR::GENERAL);
        assert_eq!(groups[0].general_shader, 0);
        assert_eq!(groups[1].general_shader, 1);
        assert_eq!(groups[2].general_shader, 2);
        assert_eq!(groups[3].ty, vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP);
        assert_eq!(groups[3].closest_hit_shader, 3);
        assert_eq!(groups[3].general_shader, vk::SHADER_UNUSED_KHR);
        assert_eq!(STAGE_ORDER[3], vk::ShaderStageFlags::CLOSEST_HIT_KHR);
    }

    #[test]
    fn test_sbt_layout_typical_nvidia_properties() {
        // handle 32, handle alignment 32, base alignment 64
        let layout = SbtLayout::new(32, 32, 64);
        assert_eq!(layout.handle_size_aligned, 32);
        assert_eq!(layout.raygen_size, 64);
        assert_eq!(layout.miss_offset, 64);
        assert_eq!(layout.miss_size, 64);
        assert_eq!(layout.hit_offset, 128);
        assert_eq!(layout.total_size(), 192);
        assert_eq!(layout.entry_offsets(), [0, 64, 96, 128]);
    }

    #[test]
    fn test_sbt_regions_are_base_aligned() {
        let layout = SbtLayout::new(16, 32, 128);
        let regions = layout.regions(0x1000);
        for region in [regions.raygen, regions.miss, regions.hit] {
            assert_eq!(region.device_address % 128, 0);
            assert_eq!(region.size % 128, 0);
        }
        assert_eq!(regions.raygen.stride, regions.raygen.size);
        assert_eq!(regions.miss.stride, 32);
        assert_eq!(regions.callable.size, 0);
    }

    #[test]
    fn test_pack_sbt_places_each_handle_at_its_entry() {
        let layout = SbtLayout::new(4, 8, 16);
        let handles: Vec<u8> = (1..=16).collect();
        let table = pack_sbt(&layout, &handles).unwrap();

        assert_eq!(table.len() as u64, layout.total_size());
        for (group, offset) in layout.entry_offsets().iter().enumerate() {
            let offset = *offset as usize;
            assert_eq!(&table[offset..offset + 4], &handles[group * 4..group * 4 + 4]);
        }
        assert!(pack_sbt(&layout, &handles[..12]).is_err());
    }

    #[test]
    fn test_recursion_is_clamped_to_device_limit() {
        assert_eq!(clamp_recursion(10, 31), 10);
        assert_eq!(clamp_recursion(10, 1), 1);
    }
}
