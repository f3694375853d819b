//! Scene resources
//!
//! Owns everything a flushed scene puts on the GPU: per-model vertex, index
//! and material buffers, the flat texture array, the sky images, the instance
//! buffer and the acceleration structures. Models and textures are uploaded
//! once per [`SceneResources::load`]; [`SceneResources::rebuild`] replaces the
//! instance buffer and the TLAS and bumps the revision that descriptor writes
//! are tracked against.

use ash::extensions::khr::AccelerationStructure;
use ash::vk;

use crate::render::backends::vulkan::acceleration::{AccelerationBuilder, BlasInput, SceneAccelerations};
use crate::render::backends::vulkan::rendering::commands::{ActiveRenderPass, CommandPool};
use crate::render::backends::vulkan::resources::descriptor_set::{
    DescriptorSetLayoutBuilder, DescriptorSetType, DescriptorWrite, PendingWrite,
};
use crate::render::backends::vulkan::resources::gpu_types::{InstanceGpu, RasterPushConstant};
use crate::render::backends::vulkan::resources::texture::{
    decode_hdr, decode_ldr, decode_source, upload_texture, DecodedImage, Texture,
};
use crate::render::backends::vulkan::resources::{Allocator, BufferAllocation, MemoryUsageClass};
use crate::render::backends::vulkan::settings::RenderSettings;
use crate::render::backends::vulkan::{VulkanError, VulkanResult};
use crate::render::scene::{MeshData, ModelInstance, SceneDescription};

/// Scene set binding of the camera uniform
pub const CAMERA_BINDING: u32 = 0;
/// Scene set binding of the per-model material arrays
pub const MATERIALS_BINDING: u32 = 1;
/// Scene set binding of the flat texture array
pub const TEXTURES_BINDING: u32 = 2;
/// Scene set binding of the instance records
pub const INSTANCES_BINDING: u32 = 3;
/// Scene set binding of the per-model vertex arrays
pub const VERTICES_BINDING: u32 = 4;
/// Scene set binding of the per-model index arrays
pub const INDICES_BINDING: u32 = 5;

const SHADING_STAGES: vk::ShaderStageFlags = vk::ShaderStageFlags::from_raw(
    vk::ShaderStageFlags::FRAGMENT.as_raw() | vk::ShaderStageFlags::CLOSEST_HIT_KHR.as_raw(),
);

const MODEL_BUFFER_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::STORAGE_BUFFER.as_raw()
        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS.as_raw()
        | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR.as_raw(),
);

/// Descriptor array sizes and texture offsets derived from the model list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenePlan {
    model_count: u32,
    texture_count: u32,
    texture_offsets: Vec<u32>,
}

impl ScenePlan {
    /// Plan for `models`
    pub fn new(models: &[MeshData]) -> VulkanResult<Self> {
        let model_count = u32::try_from(models.len()).map_err(|_| VulkanError::InvalidOperation {
            reason: format!("{} models exceed the descriptor array limit", models.len()),
        })?;

        let mut texture_offsets = Vec::with_capacity(models.len());
        let mut texture_count = 0u32;
        for model in models {
            texture_offsets.push(texture_count);
            let count = u32::try_from(model.textures.len()).unwrap_or(u32::MAX);
            texture_count = texture_count.saturating_add(count);
        }

        Ok(Self {
            model_count,
            texture_count,
            texture_offsets,
        })
    }

    /// Number of models
    pub const fn model_count(&self) -> u32 {
        self.model_count
    }

    /// Number of scene textures, not counting the fallback
    pub const fn texture_count(&self) -> u32 {
        self.texture_count
    }

    /// First texture of `model` in the flat array
    pub fn texture_offset(&self, model: u32) -> u32 {
        self.texture_offsets.get(model as usize).copied().unwrap_or(0)
    }

    /// Elements in each per-model array binding; empty scenes bind one placeholder
    pub fn model_array_len(&self) -> u32 {
        self.model_count.max(1)
    }

    /// Elements in the texture binding; an empty list binds the 1x1 fallback
    pub fn texture_array_len(&self) -> u32 {
        self.texture_count.max(1)
    }

    /// Layout shared by the raster set 0 and the ray tracing set 1
    pub fn layout(&self) -> DescriptorSetLayoutBuilder {
        let models = self.model_array_len();
        DescriptorSetLayoutBuilder::new()
            .add(
                CAMERA_BINDING,
                vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                1,
                vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::RAYGEN_KHR,
            )
            .add_storage_buffer(MATERIALS_BINDING, models, SHADING_STAGES)
            .add_combined_image_sampler(TEXTURES_BINDING, self.texture_array_len(), SHADING_STAGES)
            .add_storage_buffer(
                INSTANCES_BINDING,
                1,
                vk::ShaderStageFlags::VERTEX | SHADING_STAGES,
            )
            .add_storage_buffer(VERTICES_BINDING, models, vk::ShaderStageFlags::CLOSEST_HIT_KHR)
            .add_storage_buffer(INDICES_BINDING, models, vk::ShaderStageFlags::CLOSEST_HIT_KHR)
    }

    /// Reject instances that name a model outside the list
    pub fn check_instances(&self, instances: &[ModelInstance]) -> VulkanResult<()> {
        match instances.iter().find(|i| i.model_index >= self.model_count) {
            Some(bad) => Err(VulkanError::MissingBlas {
                model_index: bad.model_index,
                blas_count: self.model_count as usize,
            }),
            None => Ok(()),
        }
    }

    /// Instance buffer records in instance order
    pub fn instance_records(&self, instances: &[ModelInstance]) -> Vec<InstanceGpu> {
        instances
            .iter()
            .map(|i| InstanceGpu::new(&i.transform, i.model_index, self.texture_offset(i.model_index)))
            .collect()
    }
}

/// Device-local geometry and materials of one model
pub struct GpuModel {
    vertices: BufferAllocation,
    indices: BufferAllocation,
    materials: BufferAllocation,
    vertex_count: u32,
    index_count: u32,
}

impl GpuModel {
    fn blas_input(&self) -> BlasInput<'_> {
        BlasInput {
            vertices: &self.vertices,
            indices: &self.indices,
            vertex_count: self.vertex_count,
            index_count: self.index_count,
        }
    }
}

/// Queue and pools a scene upload runs on
pub struct UploadContext<'a> {
    /// Buffer and image allocator
    pub allocator: &'a mut Allocator,
    /// Pool for one-shot command buffers
    pub commands: &'a CommandPool,
    /// Graphics queue
    pub queue: vk::Queue,
    /// Acceleration structure loader
    pub acceleration: &'a AccelerationStructure,
}

/// GPU side of one scene
pub struct SceneResources {
    // The TLAS references the BLAS and both reference model buffers
    accelerations: SceneAccelerations,
    instance_buffer: BufferAllocation,
    instances: Vec<ModelInstance>,
    models: Vec<GpuModel>,
    textures: Vec<Texture>,
    sky: Texture,
    hdr_sky: Texture,
    placeholder: BufferAllocation,
    plan: ScenePlan,
    revision: u64,
}

impl SceneResources {
    /// Upload `scene` and build its acceleration structures
    pub fn load(ctx: &mut UploadContext<'_>, scene: SceneDescription) -> VulkanResult<Self> {
        let plan = ScenePlan::new(&scene.models)?;
        plan.check_instances(&scene.instances)?;

        let models = upload_models(ctx, &scene.models)?;
        let textures = upload_textures(ctx, &scene.models)?;

        let sky_image = scene.sky.as_deref().map_or_else(DecodedImage::fallback_ldr, decode_ldr);
        let hdr_image = scene.hdr_sky.as_deref().map_or_else(DecodedImage::fallback_hdr, decode_hdr);
        let sky = upload_texture(ctx.allocator, ctx.commands, ctx.queue, &sky_image)?;
        let hdr_sky = upload_texture(ctx.allocator, ctx.commands, ctx.queue, &hdr_image)?;

        let placeholder = ctx
            .allocator
            .create_buffer(0, vk::BufferUsageFlags::STORAGE_BUFFER, MemoryUsageClass::GpuOnly)?;

        let instance_buffer = upload_instances(ctx, &plan.instance_records(&scene.instances))?;
        let inputs: Vec<BlasInput<'_>> = models.iter().map(GpuModel::blas_input).collect();
        let accelerations = AccelerationBuilder::new(ctx.allocator, ctx.commands, ctx.queue, ctx.acceleration)
            .build_scene(&inputs, &scene.instances)?;
        drop(inputs);

        let released = ctx.allocator.flush_staging();
        log::info!(
            "[SCENE] Loaded {} models ({} triangles), {} textures, {} instances ({} staging buffers released)",
            plan.model_count(),
            scene.models.iter().map(MeshData::triangle_count).sum::<usize>(),
            textures.len(),
            scene.instances.len(),
            released
        );

        Ok(Self {
            accelerations,
            instance_buffer,
            instances: scene.instances,
            models,
            textures,
            sky,
            hdr_sky,
            placeholder,
            plan,
            revision: 1,
        })
    }

    /// Replace the instance list, the instance buffer and the TLAS
    ///
    /// The device must be idle: the old buffer and TLAS are destroyed here.
    pub fn rebuild(&mut self, ctx: &mut UploadContext<'_>, instances: Vec<ModelInstance>) -> VulkanResult<()> {
        self.plan.check_instances(&instances)?;

        self.instance_buffer = upload_instances(ctx, &self.plan.instance_records(&instances))?;
        AccelerationBuilder::new(ctx.allocator, ctx.commands, ctx.queue, ctx.acceleration)
            .rebuild_tlas(&mut self.accelerations, &instances)?;
        ctx.allocator.flush_staging();

        self.instances = instances;
        self.revision += 1;
        log::debug!(
            "[SCENE] Revision {}: {} instances",
            self.revision,
            self.instances.len()
        );
        Ok(())
    }

    /// Reissue the current instance list after a swapchain rebuild
    pub fn refresh(&mut self, ctx: &mut UploadContext<'_>) -> VulkanResult<()> {
        let instances = self.instances.clone();
        self.rebuild(ctx, instances)
    }

    /// Counter bumped by every rebuild
    pub const fn revision(&self) -> u64 {
        self.revision
    }

    /// Binding counts and texture offsets
    pub const fn plan(&self) -> &ScenePlan {
        &self.plan
    }

    /// Instances in draw order
    pub fn instances(&self) -> &[ModelInstance] {
        &self.instances
    }

    /// Acceleration structures of the current revision
    pub const fn accelerations(&self) -> &SceneAccelerations {
        &self.accelerations
    }

    /// One write per scene-set binding
    pub fn scene_writes(
        &self,
        set: &DescriptorSetType,
        camera: vk::DescriptorBufferInfo,
        sampler: vk::Sampler,
    ) -> VulkanResult<Vec<PendingWrite>> {
        let placeholder = self.placeholder.handle();
        let per_model = |pick: fn(&GpuModel) -> &BufferAllocation| {
            model_buffer_infos(&self.models, placeholder, |m| pick(m).handle())
        };
        let textures: Vec<vk::DescriptorImageInfo> =
            self.textures.iter().map(|texture| texture.descriptor(sampler)).collect();

        Ok(vec![
            set.create_write(0, DescriptorWrite::Buffer(vec![camera]), 0)?,
            set.create_write(1, DescriptorWrite::Buffer(per_model(|m| &m.materials)), 0)?,
            set.create_write(2, DescriptorWrite::Image(textures), 0)?,
            set.create_write(3, DescriptorWrite::Buffer(vec![whole_buffer(self.instance_buffer.handle())]), 0)?,
            set.create_write(4, DescriptorWrite::Buffer(per_model(|m| &m.vertices)), 0)?,
            set.create_write(5, DescriptorWrite::Buffer(per_model(|m| &m.indices)), 0)?,
        ])
    }

    /// One write per ray tracing set binding: TLAS, output image, both skies
    pub fn ray_tracing_writes(
        &self,
        set: &DescriptorSetType,
        output: vk::ImageView,
        sky_sampler: vk::Sampler,
    ) -> VulkanResult<Vec<PendingWrite>> {
        let storage = vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: output,
            image_layout: vk::ImageLayout::GENERAL,
        };
        Ok(vec![
            set.create_write(
                0,
                DescriptorWrite::AccelerationStructure(vec![self.accelerations.tlas()]),
                0,
            )?,
            set.create_write(1, DescriptorWrite::Image(vec![storage]), 0)?,
            set.create_write(2, DescriptorWrite::Image(vec![self.sky.descriptor(sky_sampler)]), 0)?,
            set.create_write(3, DescriptorWrite::Image(vec![self.hdr_sky.descriptor(sky_sampler)]), 0)?,
        ])
    }

    /// Draw every instance with its own push block
    pub fn record_draws(&self, pass: &mut ActiveRenderPass<'_>, layout: vk::PipelineLayout, settings: &RenderSettings) {
        for (instance_id, instance) in self.instances.iter().enumerate() {
            let Some(model) = self.models.get(instance.model_index as usize) else {
                continue;
            };
            let push = settings.raster_push(u32::try_from(instance_id).unwrap_or(u32::MAX));
            pass.cmd_push_constants(layout, RasterPushConstant::STAGES, bytemuck::bytes_of(&push));
            pass.cmd_bind_vertex_buffers(0, &[model.vertices.handle()], &[0]);
            pass.cmd_bind_index_buffer(model.indices.handle(), 0, vk::IndexType::UINT32);
            pass.cmd_draw_indexed(model.index_count, 1);
        }
    }
}

/// One buffer info per model, or the placeholder alone when there are none
fn model_buffer_infos<M>(
    models: &[M],
    placeholder: vk::Buffer,
    pick: impl Fn(&M) -> vk::Buffer,
) -> Vec<vk::DescriptorBufferInfo> {
    if models.is_empty() {
        return vec![whole_buffer(placeholder)];
    }
    models.iter().map(|m| whole_buffer(pick(m))).collect()
}

fn whole_buffer(buffer: vk::Buffer) -> vk::DescriptorBufferInfo {
    vk::DescriptorBufferInfo {
        buffer,
        offset: 0,
        range: vk::WHOLE_SIZE,
    }
}

fn upload_models(ctx: &mut UploadContext<'_>, meshes: &[MeshData]) -> VulkanResult<Vec<GpuModel>> {
    if meshes.is_empty() {
        return Ok(Vec::new());
    }
    let allocator = &mut *ctx.allocator;
    ctx.commands.run_single_time(ctx.queue, |command_buffer| {
        meshes
            .iter()
            .map(|mesh| -> VulkanResult<GpuModel> {
                let vertices = allocator.create_device_local_buffer(
                    command_buffer,
                    &mesh.vertices,
                    MODEL_BUFFER_USAGE | vk::BufferUsageFlags::VERTEX_BUFFER,
                )?;
                let indices = allocator.create_device_local_buffer(
                    command_buffer,
                    &mesh.indices,
                    MODEL_BUFFER_USAGE | vk::BufferUsageFlags::INDEX_BUFFER,
                )?;
                let materials = allocator.create_device_local_buffer(
                    command_buffer,
                    &mesh.linear_materials(),
                    vk::BufferUsageFlags::STORAGE_BUFFER,
                )?;
                Ok(GpuModel {
                    vertices,
                    indices,
                    materials,
                    vertex_count: u32::try_from(mesh.vertices.len()).unwrap_or(u32::MAX),
                    index_count: u32::try_from(mesh.indices.len()).unwrap_or(u32::MAX),
                })
            })
            .collect()
    })
}

fn upload_textures(ctx: &mut UploadContext<'_>, meshes: &[MeshData]) -> VulkanResult<Vec<Texture>> {
    let mut decoded: Vec<DecodedImage> = meshes
        .iter()
        .flat_map(|mesh| mesh.textures.iter().map(decode_source))
        .collect();
    if decoded.is_empty() {
        decoded.push(DecodedImage::fallback_ldr());
    }

    decoded
        .iter()
        .map(|image| upload_texture(ctx.allocator, ctx.commands, ctx.queue, image))
        .collect()
}

fn upload_instances(ctx: &mut UploadContext<'_>, records: &[InstanceGpu]) -> VulkanResult<BufferAllocation> {
    let allocator = &mut *ctx.allocator;
    ctx.commands.run_single_time(ctx.queue, |command_buffer| {
        allocator.create_device_local_buffer(command_buffer, records, vk::BufferUsageFlags::STORAGE_BUFFER)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::{Mat4, Vec3};
    use crate::render::backends::vulkan::acceleration::plan_tlas;
    use crate::render::scene::TextureSource;
    use ash::vk::Handle;

    fn instance(model_index: u32) -> ModelInstance {
        ModelInstance {
            model_index,
            transform: Mat4::new_translation(&Vec3::new(model_index as f32, 0.0, 0.0)),
        }
    }

    fn textured(count: usize) -> MeshData {
        MeshData {
            textures: vec![
                TextureSource::Rgba8 {
                    width: 1,
                    height: 1,
                    pixels: vec![0; 4],
                };
                count
            ],
            ..MeshData::cube(1.0)
        }
    }

    fn count_of(builder: &DescriptorSetLayoutBuilder, binding: u32) -> u32 {
        builder
            .bindings()
            .iter()
            .find(|b| b.binding == binding)
            .map(|b| b.descriptor_count)
            .unwrap()
    }

    #[test]
    fn test_three_models_size_every_model_array() {
        let models = vec![MeshData::plane(1.0), MeshData::cube(1.0), MeshData::uv_sphere(1.0, 8, 4)];
        let plan = ScenePlan::new(&models).unwrap();
        let layout = plan.layout();

        assert_eq!(count_of(&layout, MATERIALS_BINDING), 3);
        assert_eq!(count_of(&layout, VERTICES_BINDING), 3);
        assert_eq!(count_of(&layout, INDICES_BINDING), 3);
        assert_eq!(layout.bindings().len(), 6);

        let buffers: Vec<vk::Buffer> = (1..=3u64).map(vk::Buffer::from_raw).collect();
        let infos = model_buffer_infos(&buffers, vk::Buffer::null(), |&b| b);
        assert_eq!(infos.len(), usize::try_from(count_of(&layout, VERTICES_BINDING)).unwrap());
        assert_eq!(infos.iter().map(|i| i.buffer).collect::<Vec<_>>(), buffers);
        assert!(infos.iter().all(|i| i.offset == 0 && i.range == vk::WHOLE_SIZE));

        let instances = [instance(0), instance(2), instance(1)];
        plan.check_instances(&instances).unwrap();
        let records = plan_tlas(&instances, &[0x100, 0x200, 0x300]).unwrap();
        let blas: Vec<u64> = records.iter().map(|r| r.blas_reference).collect();
        assert_eq!(blas, vec![0x100, 0x300, 0x200]);
    }

    #[test]
    fn test_camera_binding_is_dynamic() {
        let plan = ScenePlan::new(&[MeshData::plane(1.0)]).unwrap();
        let layout = plan.layout();
        let camera = &layout.bindings()[0];
        assert_eq!(camera.descriptor_type, vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC);
        assert!(camera.stage_flags.contains(vk::ShaderStageFlags::RAYGEN_KHR));
    }

    #[test]
    fn test_texture_offsets_are_cumulative() {
        let plan = ScenePlan::new(&[textured(2), textured(0), textured(3)]).unwrap();
        assert_eq!(plan.texture_count(), 5);
        assert_eq!(plan.texture_offset(0), 0);
        assert_eq!(plan.texture_offset(1), 2);
        assert_eq!(plan.texture_offset(2), 2);
        assert_eq!(plan.texture_array_len(), 5);

        let records = plan.instance_records(&[instance(2), instance(0)]);
        assert_eq!(records[0].texture_offset, 2);
        assert_eq!(records[0].object_index, 2);
        assert_eq!(records[1].texture_offset, 0);
    }

    #[test]
    fn test_empty_scene_binds_placeholders() {
        let plan = ScenePlan::new(&[]).unwrap();
        assert_eq!(plan.model_array_len(), 1);
        assert_eq!(plan.texture_array_len(), 1);
        assert!(plan.check_instances(&[]).is_ok());

        let placeholder = vk::Buffer::from_raw(9);
        let infos = model_buffer_infos::<vk::Buffer>(&[], placeholder, |&b| b);
        assert_eq!(infos.len(), plan.model_array_len() as usize);
        assert_eq!(infos[0].buffer, placeholder);
    }

    #[test]
    fn test_instance_of_unknown_model_is_rejected() {
        let plan = ScenePlan::new(&[MeshData::plane(1.0)]).unwrap();
        assert!(matches!(
            plan.check_instances(&[instance(0), instance(1)]),
            Err(VulkanError::MissingBlas {
                model_index: 1,
                blas_count: 1
            })
        ));
    }
}
