//! Hybrid renderer
//!
//! Drives one frame through acquire, record, submit and present. Recording
//! fills the HDR offscreen image by rasterization or ray tracing, tone-maps
//! it onto the swapchain image in the post pass, then opens the overlay pass:
//!
//! ```text
//! begin_frame -> begin_scene -> rasterize | raytrace -> end_scene
//!             -> [record_overlay] -> end_frame
//! ```
//!
//! A stale swapchain, whether reported by acquire, by present or by a window
//! resize, is rebuilt inside `begin_frame` or `end_frame` and never surfaces
//! as an error.

use std::mem::size_of;

use ash::extensions::khr::AccelerationStructure;
use ash::{vk, Device};

use crate::core::config::{RendererConfig, ShaderConfig};
use crate::render::backends::vulkan::initialization::VulkanContext;
use crate::render::backends::vulkan::rendering::pipeline::clamp_samples;
use crate::render::backends::vulkan::rendering::ray_tracing::clamp_recursion;
use crate::render::backends::vulkan::rendering::render_pass::OFFSCREEN_COLOR_FORMAT;
use crate::render::backends::vulkan::rendering::{
    CommandPool, CommandRecorder, Framebuffer, GraphicsPipeline, GraphicsPipelineBuilder, PipelineLayout,
    RayTracingPipeline, RayTracingShaders, RenderPass, RenderPassDesc, ShaderBindingTable, ShaderModule,
};
use crate::render::backends::vulkan::resources::gpu_types::{
    align_up, push_constant_range, vertex_attribute_descriptions, vertex_binding_descriptions, CameraUniform,
    PostPushConstant, RasterPushConstant, RtPushConstant,
};
use crate::render::backends::vulkan::resources::transition::{
    offscreen_write_to_post_read, post_read_to_offscreen_write, record_general_barrier, record_transition,
};
use crate::render::backends::vulkan::resources::{
    Allocator, BufferAllocation, DescriptorSetLayoutBuilder, DescriptorSetType, DescriptorWrite, ImageAllocation,
    ImageView, MemoryUsageClass, Sampler,
};
use crate::render::backends::vulkan::scene_resources::{SceneResources, UploadContext};
use crate::render::backends::vulkan::settings::{plan_frame, BindingState, RenderMode, RenderSettings};
use crate::render::backends::vulkan::state::{
    rebuild_swapchain, FrameEvent, FrameState, FrameStateMachine, FrameSync, RebuildOutcome, RebuildReason,
    SwapchainBackend, SwapchainTargets,
};
use crate::render::backends::vulkan::{VulkanError, VulkanResult};
use crate::render::camera::Camera;
use crate::render::overlay::{NoOverlay, OverlayRenderer, OverlayTarget};
use crate::render::scene::{ModelInstance, SceneDescription};
use crate::render::window::{Window, WindowEvents};

/// Render pass shapes, recreated with the swapchain format
struct RenderPasses {
    offscreen: RenderPass,
    post: RenderPass,
    ui: RenderPass,
}

impl RenderPasses {
    fn new(
        device: &Device,
        swapchain_format: vk::Format,
        depth_format: vk::Format,
        samples: vk::SampleCountFlags,
    ) -> VulkanResult<Self> {
        Ok(Self {
            offscreen: RenderPass::new(device.clone(), RenderPassDesc::offscreen(samples, depth_format))?,
            post: RenderPass::new(device.clone(), RenderPassDesc::post(swapchain_format, depth_format))?,
            ui: RenderPass::new(device.clone(), RenderPassDesc::ui(swapchain_format))?,
        })
    }
}

fn depth_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D32_SFLOAT_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D16_UNORM_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::DEPTH,
    }
}

/// Offscreen HDR images sized to the swapchain
struct OffscreenTargets {
    framebuffer: Framebuffer,
    _multisampled_view: Option<ImageView>,
    _depth_view: ImageView,
    resolved_view: ImageView,
    post_depth_view: ImageView,
    _multisampled: Option<ImageAllocation>,
    _depth: ImageAllocation,
    resolved: ImageAllocation,
    _post_depth: ImageAllocation,
}

impl OffscreenTargets {
    fn new(
        allocator: &Allocator,
        commands: &CommandPool,
        queue: vk::Queue,
        pass: &RenderPass,
        extent: vk::Extent2D,
        samples: vk::SampleCountFlags,
        depth_format: vk::Format,
    ) -> VulkanResult<Self> {
        let device = allocator.device().clone();
        let optimal = vk::ImageTiling::OPTIMAL;
        let aspect = depth_aspect(depth_format);

        let resolved = allocator.create_image(
            extent,
            vk::SampleCountFlags::TYPE_1,
            OFFSCREEN_COLOR_FORMAT,
            optimal,
            vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::STORAGE
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST,
            MemoryUsageClass::GpuOnly,
        )?;
        let multisampled = if samples == vk::SampleCountFlags::TYPE_1 {
            None
        } else {
            Some(allocator.create_image(
                extent,
                samples,
                OFFSCREEN_COLOR_FORMAT,
                optimal,
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSIENT_ATTACHMENT,
                MemoryUsageClass::GpuOnly,
            )?)
        };
        let depth = allocator.create_image(
            extent,
            samples,
            depth_format,
            optimal,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            MemoryUsageClass::GpuOnly,
        )?;
        let post_depth = allocator.create_image(
            extent,
            vk::SampleCountFlags::TYPE_1,
            depth_format,
            optimal,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            MemoryUsageClass::GpuOnly,
        )?;

        commands.run_single_time(queue, |command_buffer| {
            let color = vk::ImageAspectFlags::COLOR;
            for image in std::iter::once(&resolved).chain(multisampled.as_ref()) {
                record_transition(
                    &device,
                    command_buffer,
                    image.handle(),
                    color,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::GENERAL,
                )?;
            }
            record_transition(
                &device,
                command_buffer,
                depth.handle(),
                aspect,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            )
        })?;

        let color_view =
            |image: &ImageAllocation| ImageView::new(device.clone(), image.handle(), OFFSCREEN_COLOR_FORMAT, vk::ImageAspectFlags::COLOR);
        let resolved_view = color_view(&resolved)?;
        let multisampled_view = multisampled.as_ref().map(color_view).transpose()?;
        let depth_view = ImageView::new(device.clone(), depth.handle(), depth_format, aspect)?;
        let post_depth_view = ImageView::new(device.clone(), post_depth.handle(), depth_format, aspect)?;

        let attachments: Vec<vk::ImageView> = match &multisampled_view {
            Some(view) => vec![view.handle(), depth_view.handle(), resolved_view.handle()],
            None => vec![resolved_view.handle(), depth_view.handle()],
        };
        let framebuffer = Framebuffer::new(device, pass, &attachments, extent)?;

        log::debug!(
            "[PASS] Offscreen targets {}x{} at {:?}",
            extent.width,
            extent.height,
            samples
        );

        Ok(Self {
            framebuffer,
            _multisampled_view: multisampled_view,
            _depth_view: depth_view,
            resolved_view,
            post_depth_view,
            _multisampled: multisampled,
            _depth: depth,
            resolved,
            _post_depth: post_depth,
        })
    }

    /// Single-sample image both paths leave their result in
    const fn output_image(&self) -> vk::Image {
        self.resolved.handle()
    }

    const fn output_view(&self) -> vk::ImageView {
        self.resolved_view.handle()
    }
}

/// Per-swapchain-image recording resources
struct ImageTargets {
    command_buffer: vk::CommandBuffer,
    post: Framebuffer,
    ui: Framebuffer,
}

/// Scene, ray tracing and post descriptor sets
struct DescriptorSets {
    scene: DescriptorSetType,
    ray_tracing: DescriptorSetType,
    post: DescriptorSetType,
}

impl DescriptorSets {
    fn new(device: &Device, scene: &SceneResources, image_count: usize) -> VulkanResult<Self> {
        let ray_tracing_layout = DescriptorSetLayoutBuilder::new()
            .add(
                0,
                vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                1,
                vk::ShaderStageFlags::RAYGEN_KHR | vk::ShaderStageFlags::CLOSEST_HIT_KHR,
            )
            .add(1, vk::DescriptorType::STORAGE_IMAGE, 1, vk::ShaderStageFlags::RAYGEN_KHR)
            .add_combined_image_sampler(2, 1, vk::ShaderStageFlags::MISS_KHR)
            .add_combined_image_sampler(3, 1, vk::ShaderStageFlags::MISS_KHR);
        let post_layout = DescriptorSetLayoutBuilder::new().add_combined_image_sampler(0, 1, vk::ShaderStageFlags::FRAGMENT);

        let scene_sets = u32::try_from(image_count.max(1)).unwrap_or(u32::MAX);
        Ok(Self {
            scene: DescriptorSetType::new(device, scene.plan().layout(), scene_sets)?,
            ray_tracing: DescriptorSetType::new(device, ray_tracing_layout, 1)?,
            post: DescriptorSetType::new(device, post_layout, 1)?,
        })
    }
}

/// Raster, post and ray tracing pipelines
struct Pipelines {
    raster: GraphicsPipeline,
    post: GraphicsPipeline,
    shader_binding_table: ShaderBindingTable,
    ray_tracing: RayTracingPipeline,
}

/// Everything pipeline creation reads
struct PipelineInputs<'a> {
    context: &'a VulkanContext,
    allocator: &'a Allocator,
    shaders: &'a ShaderConfig,
    passes: &'a RenderPasses,
    sets: &'a DescriptorSets,
    extent: vk::Extent2D,
    samples: vk::SampleCountFlags,
    recursion_depth: u32,
}

impl Pipelines {
    fn new(inputs: &PipelineInputs<'_>) -> VulkanResult<Self> {
        let device = inputs.context.device();
        let shaders = inputs.shaders;
        let load = |file: &str| ShaderModule::from_file(device, shaders.path(file));

        let raster_vertex = load(&shaders.raster_vertex)?;
        let raster_fragment = load(&shaders.raster_fragment)?;
        let raster_layout = PipelineLayout::new(
            device,
            &[inputs.sets.scene.layout()],
            &[push_constant_range::<RasterPushConstant>(RasterPushConstant::STAGES)],
        )?;
        let raster = GraphicsPipelineBuilder::new(&raster_vertex, &raster_fragment, inputs.extent)
            .cull_mode(vk::CullModeFlags::NONE)
            .samples(inputs.samples)
            .depth_test(true)
            .vertex_input(&vertex_binding_descriptions(), &vertex_attribute_descriptions())
            .build(device, inputs.passes.offscreen.handle(), raster_layout)?;

        let post_vertex = load(&shaders.post_vertex)?;
        let post_fragment = load(&shaders.post_fragment)?;
        let post_layout = PipelineLayout::new(
            device,
            &[inputs.sets.post.layout()],
            &[push_constant_range::<PostPushConstant>(PostPushConstant::STAGES)],
        )?;
        let post = GraphicsPipelineBuilder::new(&post_vertex, &post_fragment, inputs.extent)
            .cull_mode(vk::CullModeFlags::NONE)
            .depth_test(false)
            .build(device, inputs.passes.post.handle(), post_layout)?;

        let ray_gen = load(&shaders.ray_gen)?;
        let miss = load(&shaders.ray_miss)?;
        let shadow_miss = load(&shaders.ray_shadow_miss)?;
        let closest_hit = load(&shaders.ray_closest_hit)?;
        let ray_tracing_layout = PipelineLayout::new(
            device,
            &[inputs.sets.ray_tracing.layout(), inputs.sets.scene.layout()],
            &[push_constant_range::<RtPushConstant>(RtPushConstant::STAGES)],
        )?;
        let loader = &inputs.context.ray_tracing.pipeline;
        let ray_tracing = RayTracingPipeline::new(
            device,
            loader,
            &RayTracingShaders {
                ray_gen: &ray_gen,
                miss: &miss,
                shadow_miss: &shadow_miss,
                closest_hit: &closest_hit,
            },
            ray_tracing_layout,
            inputs.recursion_depth,
        )?;
        let shader_binding_table = ShaderBindingTable::new(
            inputs.allocator,
            loader,
            &ray_tracing,
            &inputs.context.physical_device.ray_tracing_properties,
        )?;

        Ok(Self {
            raster,
            post,
            shader_binding_table,
            ray_tracing,
        })
    }
}

/// Camera uniforms, one aligned copy per frame slot
struct CameraBuffer {
    buffer: BufferAllocation,
    stride: vk::DeviceSize,
}

impl CameraBuffer {
    fn new(allocator: &Allocator, slots: usize, min_alignment: vk::DeviceSize) -> VulkanResult<Self> {
        let stride = align_up(size_of::<CameraUniform>() as vk::DeviceSize, min_alignment.max(1));
        let buffer = allocator.create_buffer(
            stride * slots.max(1) as vk::DeviceSize,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryUsageClass::CpuToGpu,
        )?;
        Ok(Self { buffer, stride })
    }

    fn write(&mut self, slot: usize, camera: &Camera) -> VulkanResult<()> {
        let uniform = CameraUniform::from_camera(camera);
        self.buffer.write(self.offset(slot), std::slice::from_ref(&uniform))
    }

    const fn offset(&self, slot: usize) -> vk::DeviceSize {
        self.stride * slot as vk::DeviceSize
    }

    fn dynamic_offset(&self, slot: usize) -> u32 {
        u32::try_from(self.offset(slot)).unwrap_or(u32::MAX)
    }

    fn descriptor(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: self.buffer.handle(),
            offset: 0,
            range: size_of::<CameraUniform>() as vk::DeviceSize,
        }
    }
}

/// Every GPU object the renderer owns
///
/// Fields drop top to bottom after the device has gone idle; the context
/// goes last.
struct GpuState {
    scene: SceneResources,
    pipelines: Pipelines,
    sets: DescriptorSets,
    bindings: BindingState,
    targets: SwapchainTargets<ImageTargets>,
    offscreen: OffscreenTargets,
    passes: RenderPasses,
    sync: FrameSync,
    camera: CameraBuffer,
    material_sampler: Sampler,
    sky_sampler: Sampler,
    commands: CommandPool,
    allocator: Allocator,
    shaders: ShaderConfig,
    fence_timeout_ns: u64,
    depth_format: vk::Format,
    samples: vk::SampleCountFlags,
    recursion_depth: u32,
    context: VulkanContext,
}

impl GpuState {
    fn new(window: &mut Window, config: &RendererConfig) -> VulkanResult<Self> {
        let context = VulkanContext::new(window, config)?;
        let device = context.device().clone();
        let physical = &context.physical_device;
        let limits = physical.properties.limits;

        let acceleration_loader = &context.ray_tracing.acceleration_structure;
        let mut allocator = Allocator::new(
            context.instance(),
            &device,
            physical,
            AccelerationStructure::new(context.instance(), &device),
        )?;
        let commands = CommandPool::new(device.clone(), context.graphics_queue_family())?;
        let material_sampler = Sampler::material(device.clone(), limits.max_sampler_anisotropy)?;
        let sky_sampler = Sampler::clamped(device.clone())?;

        let depth_format = physical.find_depth_format(context.instance())?;
        let samples = clamp_samples(
            config.msaa_samples,
            limits.framebuffer_color_sample_counts & limits.framebuffer_depth_sample_counts,
        );
        let recursion_depth = clamp_recursion(
            config.max_ray_recursion_depth,
            physical.ray_tracing_properties.max_ray_recursion_depth,
        );

        let swapchain = context.swapchain()?;
        let sync = FrameSync::new(&device, config.max_frames_in_flight, swapchain.image_count())?;
        let camera = CameraBuffer::new(&allocator, config.max_frames_in_flight, physical.min_uniform_alignment())?;

        let scene = SceneResources::load(
            &mut UploadContext {
                allocator: &mut allocator,
                commands: &commands,
                queue: context.graphics_queue(),
                acceleration: acceleration_loader,
            },
            SceneDescription::default(),
        )?;

        let passes = RenderPasses::new(&device, swapchain.format().format, depth_format, samples)?;
        let offscreen = OffscreenTargets::new(
            &allocator,
            &commands,
            context.graphics_queue(),
            &passes.offscreen,
            swapchain.extent(),
            samples,
            depth_format,
        )?;
        let sets = DescriptorSets::new(&device, &scene, swapchain.image_count())?;
        let pipelines = Pipelines::new(&PipelineInputs {
            context: &context,
            allocator: &allocator,
            shaders: &config.shaders,
            passes: &passes,
            sets: &sets,
            extent: swapchain.extent(),
            samples,
            recursion_depth,
        })?;

        log::info!(
            "[FRAME] Renderer ready on {}: {:?} MSAA, recursion depth {}, {} frame slots",
            physical.name(),
            samples,
            recursion_depth,
            config.max_frames_in_flight
        );

        let mut state = Self {
            scene,
            pipelines,
            sets,
            bindings: BindingState::default(),
            targets: SwapchainTargets::new(),
            offscreen,
            passes,
            sync,
            camera,
            material_sampler,
            sky_sampler,
            commands,
            allocator,
            shaders: config.shaders.clone(),
            fence_timeout_ns: config.fence_timeout_ns,
            depth_format,
            samples,
            recursion_depth,
            context,
        };
        state.create_image_targets()?;
        state.write_descriptors()?;
        Ok(state)
    }

    fn device(&self) -> &Device {
        self.context.device()
    }

    fn wait_device_idle(&self) -> VulkanResult<()> {
        unsafe { self.device().device_wait_idle() }.map_err(VulkanError::Api)
    }

    fn upload_context(&mut self) -> UploadContext<'_> {
        UploadContext {
            allocator: &mut self.allocator,
            commands: &self.commands,
            queue: self.context.graphics_queue(),
            acceleration: &self.context.ray_tracing.acceleration_structure,
        }
    }

    /// Free the per-image command buffers and drop the framebuffers
    fn release_image_targets(&mut self) {
        let command_buffers: Vec<vk::CommandBuffer> =
            self.targets.drain().into_iter().map(|target| target.command_buffer).collect();
        self.commands.free_command_buffers(&command_buffers);
    }

    fn create_image_targets(&mut self) -> VulkanResult<()> {
        self.release_image_targets();

        let swapchain = self.context.swapchain()?;
        let device = self.context.device().clone();
        let extent = swapchain.extent();
        let views = swapchain.views();
        let (passes, offscreen, commands) = (&self.passes, &self.offscreen, &self.commands);

        self.targets.rebuild(views.len(), &mut |image: usize| -> VulkanResult<ImageTargets> {
            let view = views[image].handle();
            let post = Framebuffer::new(
                device.clone(),
                &passes.post,
                &[view, offscreen.post_depth_view.handle()],
                extent,
            )?;
            let ui = Framebuffer::new(device.clone(), &passes.ui, &[view], extent)?;
            let command_buffer = commands
                .allocate_command_buffers(1)?
                .into_iter()
                .next()
                .ok_or_else(|| VulkanError::InvalidOperation {
                    reason: "Command buffer allocation returned nothing".to_string(),
                })?;
            Ok(ImageTargets {
                command_buffer,
                post,
                ui,
            })
        })?;
        self.sync.reset_images(views.len());
        Ok(())
    }

    /// Recreate descriptor sets and pipelines against the current scene and swapchain
    fn create_bindings(&mut self) -> VulkanResult<()> {
        let swapchain = self.context.swapchain()?;
        let extent = swapchain.extent();
        let sets = DescriptorSets::new(self.context.device(), &self.scene, swapchain.image_count())?;
        let pipelines = Pipelines::new(&PipelineInputs {
            context: &self.context,
            allocator: &self.allocator,
            shaders: &self.shaders,
            passes: &self.passes,
            sets: &sets,
            extent,
            samples: self.samples,
            recursion_depth: self.recursion_depth,
        })?;
        self.pipelines = pipelines;
        self.sets = sets;
        self.bindings.invalidate();
        Ok(())
    }

    /// Write every set against the current scene revision
    fn write_descriptors(&mut self) -> VulkanResult<()> {
        let scene_writes =
            self.scene
                .scene_writes(&self.sets.scene, self.camera.descriptor(), self.material_sampler.handle())?;
        self.sets.scene.update(&scene_writes)?;

        let ray_tracing_writes = self.scene.ray_tracing_writes(
            &self.sets.ray_tracing,
            self.offscreen.output_view(),
            self.sky_sampler.handle(),
        )?;
        self.sets.ray_tracing.update(&ray_tracing_writes)?;

        let sampled = vk::DescriptorImageInfo {
            sampler: self.sky_sampler.handle(),
            image_view: self.offscreen.output_view(),
            image_layout: vk::ImageLayout::GENERAL,
        };
        let post_writes = [self.sets.post.create_write(0, DescriptorWrite::Image(vec![sampled]), 0)?];
        self.sets.post.update(&post_writes)?;

        self.bindings.mark_written(self.scene.revision());
        log::debug!("[DESCRIPTOR] Sets written for scene revision {}", self.scene.revision());
        Ok(())
    }

    fn replace_scene(&mut self, scene: SceneDescription) -> VulkanResult<()> {
        self.wait_device_idle()?;
        let loaded = SceneResources::load(&mut self.upload_context(), scene)?;
        self.scene = loaded;
        self.create_bindings()?;
        self.write_descriptors()
    }

    fn replace_instances(&mut self, instances: Vec<ModelInstance>) -> VulkanResult<()> {
        self.wait_device_idle()?;
        let mut ctx = UploadContext {
            allocator: &mut self.allocator,
            commands: &self.commands,
            queue: self.context.graphics_queue(),
            acceleration: &self.context.ray_tracing.acceleration_structure,
        };
        self.scene.rebuild(&mut ctx, instances)?;
        self.write_descriptors()
    }
}

impl SwapchainBackend for GpuState {
    fn wait_idle(&mut self) -> VulkanResult<()> {
        self.wait_device_idle()
    }

    fn recreate_swapchain(&mut self, extent: vk::Extent2D) -> VulkanResult<vk::Extent2D> {
        // Framebuffers reference the old swapchain views
        self.release_image_targets();
        self.context.recreate_swapchain(extent)?;
        Ok(self.context.swapchain()?.extent())
    }

    fn recreate_targets(&mut self) -> VulkanResult<()> {
        let swapchain = self.context.swapchain()?;
        let extent = swapchain.extent();
        self.passes = RenderPasses::new(self.device(), swapchain.format().format, self.depth_format, self.samples)?;
        self.offscreen = OffscreenTargets::new(
            &self.allocator,
            &self.commands,
            self.context.graphics_queue(),
            &self.passes.offscreen,
            extent,
            self.samples,
            self.depth_format,
        )?;
        self.create_bindings()?;
        self.create_image_targets()
    }

    fn reload_scene(&mut self) -> VulkanResult<()> {
        let mut ctx = UploadContext {
            allocator: &mut self.allocator,
            commands: &self.commands,
            queue: self.context.graphics_queue(),
            acceleration: &self.context.ray_tracing.acceleration_structure,
        };
        self.scene.refresh(&mut ctx)?;
        self.write_descriptors()
    }
}

impl Drop for GpuState {
    fn drop(&mut self) {
        if let Err(e) = self.wait_device_idle() {
            log::error!("[FRAME] Device wait before teardown failed: {}", e);
        }
        self.release_image_targets();
    }
}

/// How far the open frame has been recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum RecordPhase {
    Opened,
    SceneBegun,
    SceneDrawn,
    PostRecorded,
    OverlayRecorded,
}

/// The frame between `begin_frame` and `end_frame`
struct OpenFrame {
    image_index: u32,
    recorder: CommandRecorder,
    phase: RecordPhase,
}

impl OpenFrame {
    fn advance(&mut self, from: RecordPhase, to: RecordPhase, call: &str) -> VulkanResult<()> {
        if self.phase != from {
            return Err(VulkanError::InvalidOperation {
                reason: format!("{call} called after {:?}, expected {:?}", self.phase, from),
            });
        }
        self.phase = to;
        Ok(())
    }

    const fn image(&self) -> usize {
        self.image_index as usize
    }
}

/// Hybrid raster and ray tracing renderer
pub struct HybridRenderer {
    frame: Option<OpenFrame>,
    machine: FrameStateMachine,
    pending_rebuild: RebuildReason,
    settings: RenderSettings,
    gpu: GpuState,
}

impl HybridRenderer {
    /// Create the Vulkan context and every renderer resource for `window`
    ///
    /// Starts with an empty scene; see [`HybridRenderer::load_scene`].
    pub fn new(window: &mut Window, config: &RendererConfig) -> VulkanResult<Self> {
        config
            .validate_settings()
            .map_err(VulkanError::InitializationFailed)?;
        Ok(Self {
            frame: None,
            machine: FrameStateMachine::new(),
            pending_rebuild: RebuildReason::empty(),
            settings: RenderSettings::default(),
            gpu: GpuState::new(window, config)?,
        })
    }

    /// Upload a new scene, replacing models, textures and acceleration structures
    pub fn load_scene(&mut self, scene: SceneDescription) -> VulkanResult<()> {
        self.require_between_frames()?;
        self.gpu.replace_scene(scene)
    }

    /// Replace the instance list; rebuilds the instance buffer and the TLAS
    pub fn set_instances(&mut self, instances: Vec<ModelInstance>) -> VulkanResult<()> {
        self.require_between_frames()?;
        self.gpu.replace_instances(instances)
    }

    /// Active render path
    pub const fn mode(&self) -> RenderMode {
        self.settings.mode
    }

    /// Choose the render path for following frames
    pub fn set_mode(&mut self, mode: RenderMode) {
        if self.settings.mode != mode {
            log::info!("[FRAME] Render mode: {}", mode);
        }
        self.settings.mode = mode;
    }

    /// Switch between raster and ray tracing
    pub fn toggle_mode(&mut self) -> RenderMode {
        let mode = self.settings.toggle_mode();
        log::info!("[FRAME] Render mode: {}", mode);
        mode
    }

    /// Light and tracing parameters
    pub const fn settings(&self) -> &RenderSettings {
        &self.settings
    }

    /// Mutable light and tracing parameters; changes apply from the next recording
    pub fn settings_mut(&mut self) -> &mut RenderSettings {
        &mut self.settings
    }

    /// Current frame lifecycle state
    pub const fn frame_state(&self) -> FrameState {
        self.machine.state()
    }

    /// Swapchain extent
    pub fn extent(&self) -> VulkanResult<vk::Extent2D> {
        Ok(self.gpu.context.swapchain()?.extent())
    }

    /// Wait for the frame slot, acquire an image and open its command buffer
    ///
    /// Returns `false` when the frame must be skipped because the swapchain
    /// was rebuilt or the window closed while minimized.
    pub fn begin_frame<W: WindowEvents + ?Sized>(&mut self, window: &mut W) -> VulkanResult<bool> {
        if self.machine.state() == FrameState::SwapchainStale {
            let reason = std::mem::take(&mut self.pending_rebuild) | RebuildReason::RESIZED;
            self.rebuild(window, reason)?;
            return Ok(false);
        }

        self.machine.apply(FrameEvent::BeginFrame)?;
        let timeout = self.gpu.fence_timeout_ns;
        self.gpu.sync.wait_current(timeout)?;

        let swapchain = self.gpu.context.swapchain()?;
        let acquired = unsafe {
            swapchain.loader().acquire_next_image(
                swapchain.handle(),
                u64::MAX,
                self.gpu.sync.current().image_available.handle(),
                vk::Fence::null(),
            )
        };
        let image_index = match acquired {
            Ok((index, suboptimal)) => {
                // The semaphore is signaled, so finish this frame and rebuild after present
                if suboptimal {
                    self.pending_rebuild |= RebuildReason::SUBOPTIMAL;
                }
                index
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.machine.apply(FrameEvent::SwapchainStale)?;
                self.rebuild(window, RebuildReason::OUT_OF_DATE)?;
                return Ok(false);
            }
            Err(e) => return Err(VulkanError::Api(e)),
        };

        self.gpu.sync.claim_image(image_index as usize, timeout)?;
        let command_buffer = self.gpu.targets.get(image_index as usize)?.command_buffer;
        let mut recorder = CommandRecorder::new(command_buffer, self.gpu.device().clone());
        recorder.begin()?;

        self.machine.apply(FrameEvent::ImageAcquired)?;
        self.frame = Some(OpenFrame {
            image_index,
            recorder,
            phase: RecordPhase::Opened,
        });
        Ok(true)
    }

    /// Upload the camera for this frame slot
    pub fn begin_scene(&mut self, camera: &Camera) -> VulkanResult<()> {
        let Self { frame, gpu, settings, .. } = self;
        let frame = open_frame(frame)?;
        frame.advance(RecordPhase::Opened, RecordPhase::SceneBegun, "begin_scene")?;

        let plan = plan_frame(settings, &gpu.bindings, gpu.scene.revision());
        if plan.write_descriptors {
            gpu.wait_device_idle()?;
            gpu.write_descriptors()?;
        }
        gpu.camera.write(gpu.sync.current_index(), camera)?;

        record_general_barrier(
            gpu.device(),
            frame.recorder.handle(),
            gpu.offscreen.output_image(),
            post_read_to_offscreen_write(),
        );
        Ok(())
    }

    /// Rasterize every instance into the offscreen image
    pub fn rasterize(&mut self) -> VulkanResult<()> {
        let Self { frame, gpu, settings, .. } = self;
        let frame = open_frame(frame)?;
        frame.advance(RecordPhase::SceneBegun, RecordPhase::SceneDrawn, "rasterize")?;

        let extent = gpu.context.swapchain()?.extent();
        let clears = gpu.passes.offscreen.desc().clear_values(settings.clear_color);
        let pipeline = &gpu.pipelines.raster;
        let scene_set = gpu.sets.scene.set(frame.image());
        let camera_offset = gpu.camera.dynamic_offset(gpu.sync.current_index());

        let mut pass = frame.recorder.begin_render_pass(
            gpu.passes.offscreen.handle(),
            gpu.offscreen.framebuffer.handle(),
            extent,
            &clears,
        )?;
        pass.cmd_bind_pipeline(pipeline.handle());
        pass.cmd_bind_descriptor_sets(pipeline.layout(), &[scene_set], &[camera_offset]);
        gpu.scene.record_draws(&mut pass, pipeline.layout(), settings);
        Ok(())
    }

    /// Trace primary rays into the offscreen image
    pub fn raytrace(&mut self) -> VulkanResult<()> {
        let Self { frame, gpu, settings, .. } = self;
        let frame = open_frame(frame)?;
        frame.advance(RecordPhase::SceneBegun, RecordPhase::SceneDrawn, "raytrace")?;

        let extent = gpu.context.swapchain()?.extent();
        let pipeline = &gpu.pipelines.ray_tracing;
        let sets = [gpu.sets.ray_tracing.set(0), gpu.sets.scene.set(frame.image())];
        let camera_offset = gpu.camera.dynamic_offset(gpu.sync.current_index());
        let push = settings.ray_trace_push();
        let recorder = &mut frame.recorder;

        recorder.cmd_bind_pipeline(vk::PipelineBindPoint::RAY_TRACING_KHR, pipeline.handle());
        recorder.cmd_bind_descriptor_sets(
            vk::PipelineBindPoint::RAY_TRACING_KHR,
            pipeline.layout(),
            &sets,
            &[camera_offset],
        );
        recorder.cmd_push_constants(pipeline.layout(), RtPushConstant::STAGES, bytemuck::bytes_of(&push));

        let regions = gpu.pipelines.shader_binding_table.regions();
        unsafe {
            gpu.context.ray_tracing.pipeline.cmd_trace_rays(
                recorder.handle(),
                &regions.raygen,
                &regions.miss,
                &regions.hit,
                &regions.callable,
                extent.width,
                extent.height,
                1,
            );
        }
        Ok(())
    }

    /// Tone-map the offscreen image onto the swapchain image
    pub fn end_scene(&mut self) -> VulkanResult<()> {
        let Self { frame, gpu, settings, .. } = self;
        let frame = open_frame(frame)?;
        frame.advance(RecordPhase::SceneDrawn, RecordPhase::PostRecorded, "end_scene")?;

        record_general_barrier(
            gpu.device(),
            frame.recorder.handle(),
            gpu.offscreen.output_image(),
            offscreen_write_to_post_read(settings.mode == RenderMode::RayTrace),
        );

        let extent = gpu.context.swapchain()?.extent();
        let target = gpu.targets.get(frame.image())?;
        let clears = gpu.passes.post.desc().clear_values(settings.clear_color);
        let pipeline = &gpu.pipelines.post;
        #[allow(clippy::cast_precision_loss)]
        let push = PostPushConstant {
            aspect_ratio: extent.width as f32 / extent.height.max(1) as f32,
        };

        let mut pass = frame
            .recorder
            .begin_render_pass(gpu.passes.post.handle(), target.post.handle(), extent, &clears)?;
        pass.cmd_bind_pipeline(pipeline.handle());
        pass.cmd_bind_descriptor_sets(pipeline.layout(), &[gpu.sets.post.set(0)], &[]);
        pass.cmd_push_constants(pipeline.layout(), PostPushConstant::STAGES, bytemuck::bytes_of(&push));
        pass.cmd_draw(3);
        Ok(())
    }

    /// Let `overlay` append draw commands in the UI pass
    pub fn record_overlay(&mut self, overlay: &mut dyn OverlayRenderer) -> VulkanResult<()> {
        let Self { frame, gpu, .. } = self;
        let frame = open_frame(frame)?;
        frame.advance(RecordPhase::PostRecorded, RecordPhase::OverlayRecorded, "record_overlay")?;

        let extent = gpu.context.swapchain()?.extent();
        let target = gpu.targets.get(frame.image())?;
        let device = gpu.context.device();
        let pass = frame
            .recorder
            .begin_render_pass(gpu.passes.ui.handle(), target.ui.handle(), extent, &[])?;
        overlay.record(&OverlayTarget {
            device,
            command_buffer: pass.command_buffer(),
            extent,
        });
        Ok(())
    }

    /// Submit the frame and present it, rebuilding the swapchain when needed
    pub fn end_frame<W: WindowEvents + ?Sized>(&mut self, window: &mut W) -> VulkanResult<()> {
        match self.frame.as_ref().map(|frame| frame.phase) {
            Some(RecordPhase::PostRecorded) => self.record_overlay(&mut NoOverlay)?,
            Some(RecordPhase::OverlayRecorded) => {}
            Some(phase) => {
                return Err(VulkanError::InvalidOperation {
                    reason: format!("end_frame called after {phase:?}; end_scene has not run"),
                })
            }
            None => {
                return Err(VulkanError::InvalidOperation {
                    reason: "end_frame called without an open frame".to_string(),
                })
            }
        }
        let frame = self.frame.take().ok_or_else(|| VulkanError::InvalidOperation {
            reason: "end_frame called without an open frame".to_string(),
        })?;
        let command_buffer = frame.recorder.end()?;

        let gpu = &self.gpu;
        let slot = gpu.sync.current();
        slot.in_flight.reset()?;

        let wait_semaphores = [slot.image_available.handle()];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [slot.render_finished.handle()];
        let command_buffers = [command_buffer];
        let submit = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();
        unsafe {
            gpu.device()
                .queue_submit(gpu.context.graphics_queue(), &[submit], slot.in_flight.handle())
                .map_err(VulkanError::Api)?;
        }
        self.machine.apply(FrameEvent::Submitted)?;

        let swapchain = gpu.context.swapchain()?;
        let swapchains = [swapchain.handle()];
        let image_indices = [frame.image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&signal_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        let presented = unsafe {
            swapchain
                .loader()
                .queue_present(gpu.context.present_queue(), &present_info)
        };
        self.machine.apply(FrameEvent::PresentQueued)?;
        self.gpu.sync.advance();

        let mut reason =
            std::mem::take(&mut self.pending_rebuild) | RebuildReason::from_present(presented).map_err(VulkanError::Api)?;
        if window.take_resized() {
            reason |= RebuildReason::RESIZED;
        }

        if reason.is_empty() {
            self.machine.apply(FrameEvent::PresentComplete)?;
        } else {
            self.machine.apply(FrameEvent::SwapchainStale)?;
            self.rebuild(window, reason)?;
        }
        Ok(())
    }

    fn rebuild<W: WindowEvents + ?Sized>(&mut self, window: &mut W, reason: RebuildReason) -> VulkanResult<()> {
        match rebuild_swapchain(&mut self.gpu, window, &mut self.machine, reason)? {
            RebuildOutcome::Rebuilt(_) => {}
            RebuildOutcome::Closed => self.pending_rebuild |= reason,
        }
        Ok(())
    }

    fn require_between_frames(&self) -> VulkanResult<()> {
        match self.machine.state() {
            FrameState::Idle | FrameState::SwapchainStale => Ok(()),
            state => Err(VulkanError::InvalidOperation {
                reason: format!("Scene changes are not allowed in frame state {state}"),
            }),
        }
    }
}

fn open_frame(frame: &mut Option<OpenFrame>) -> VulkanResult<&mut OpenFrame> {
    frame.as_mut().ok_or_else(|| VulkanError::InvalidOperation {
        reason: "No frame is being recorded; call begin_frame first".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_phases_follow_call_order() {
        assert!(RecordPhase::Opened < RecordPhase::SceneBegun);
        assert!(RecordPhase::SceneDrawn < RecordPhase::PostRecorded);
        assert!(RecordPhase::PostRecorded < RecordPhase::OverlayRecorded);
    }

    #[test]
    fn test_depth_aspect_includes_stencil_when_present() {
        assert_eq!(depth_aspect(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            depth_aspect(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }

    #[test]
    fn test_open_frame_requires_begin() {
        let mut frame = None;
        assert!(open_frame(&mut frame).is_err());
    }
}
