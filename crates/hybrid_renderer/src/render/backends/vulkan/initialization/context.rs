//! Vulkan context management
//!
//! Owns the instance, surface, physical device choice, logical device and
//! swapchain. Device selection requires the KHR ray tracing stack and the
//! Vulkan 1.2 features the shaders rely on.

use ash::extensions::khr::{
    AccelerationStructure, DeferredHostOperations, RayTracingPipeline, Surface, Swapchain as SwapchainLoader,
};
#[cfg(debug_assertions)]
use ash::extensions::ext::DebugUtils;
use ash::vk;
use ash::{Device, Entry, Instance};
use std::ffi::{CStr, CString};
use thiserror::Error;

use super::guard::InstanceGuard;
use crate::core::config::RendererConfig;
use crate::render::backends::vulkan::state::swapchain::Swapchain;
use crate::render::window::{Window, WindowEvents};

/// Vulkan-specific error types
#[derive(Error, Debug)]
pub enum VulkanError {
    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// Resource with specified ID could not be found
    #[error("Resource not found: {id}")]
    ResourceNotFound {
        /// The identifier of the resource
        id: u64,
    },

    /// Invalid operation attempted
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },

    /// Memory allocation failed
    #[error("Out of memory: {requested} bytes")]
    OutOfMemory {
        /// Number of bytes that were requested
        requested: usize,
    },

    /// Vulkan context initialization failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// No suitable memory type found for allocation
    #[error("No suitable memory type found")]
    NoSuitableMemoryType,

    /// Layout pair outside the supported transition table
    #[error("Unsupported layout transition: {old:?} -> {new:?}")]
    UnsupportedLayoutTransition {
        /// Current layout
        old: vk::ImageLayout,
        /// Requested layout
        new: vk::ImageLayout,
    },

    /// Descriptor update batch does not cover the layout exactly
    #[error("Descriptor write count mismatch: layout declares {expected} bindings, got {actual} writes")]
    DescriptorCountMismatch {
        /// Bindings declared by the layout
        expected: usize,
        /// Writes supplied
        actual: usize,
    },

    /// A fence wait exceeded the configured timeout
    #[error("Fence wait timed out after {timeout_ns} ns")]
    FenceTimeout {
        /// Timeout that expired
        timeout_ns: u64,
    },

    /// A second Vulkan context was requested while one is alive
    #[error("A Vulkan context already exists in this process")]
    SecondContext,

    /// An instance references a model that has no BLAS
    #[error("Instance references model {model_index} but only {blas_count} BLAS were built")]
    MissingBlas {
        /// Model index referenced by the instance
        model_index: u32,
        /// Number of bottom-level structures available
        blas_count: usize,
    },
}

/// Result type for Vulkan operations
pub type VulkanResult<T> = Result<T, VulkanError>;

/// Device extensions the renderer cannot run without
pub fn required_device_extensions() -> [&'static CStr; 4] {
    [
        SwapchainLoader::name(),
        AccelerationStructure::name(),
        RayTracingPipeline::name(),
        DeferredHostOperations::name(),
    ]
}

/// Names from `required` that are absent from `available`
pub fn missing_extensions(available: &[&CStr], required: &[&CStr]) -> Vec<String> {
    required
        .iter()
        .filter(|req| !available.contains(req))
        .map(|req| req.to_string_lossy().into_owned())
        .collect()
}

/// Device feature bits the shaders depend on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureSupport {
    /// `bufferDeviceAddress`
    pub buffer_device_address: bool,
    /// `runtimeDescriptorArray`
    pub runtime_descriptor_array: bool,
    /// `shaderStorageBufferArrayNonUniformIndexing`
    pub storage_buffer_non_uniform_indexing: bool,
    /// `shaderSampledImageArrayNonUniformIndexing`
    pub sampled_image_non_uniform_indexing: bool,
    /// `scalarBlockLayout`
    pub scalar_block_layout: bool,
    /// `accelerationStructure`
    pub acceleration_structure: bool,
    /// `rayTracingPipeline`
    pub ray_tracing_pipeline: bool,
}

impl FeatureSupport {
    /// Names of the unsupported features
    pub fn missing(&self) -> Vec<&'static str> {
        [
            (self.buffer_device_address, "bufferDeviceAddress"),
            (self.runtime_descriptor_array, "runtimeDescriptorArray"),
            (self.storage_buffer_non_uniform_indexing, "shaderStorageBufferArrayNonUniformIndexing"),
            (self.sampled_image_non_uniform_indexing, "shaderSampledImageArrayNonUniformIndexing"),
            (self.scalar_block_layout, "scalarBlockLayout"),
            (self.acceleration_structure, "accelerationStructure"),
            (self.ray_tracing_pipeline, "rayTracingPipeline"),
        ]
        .into_iter()
        .filter_map(|(supported, name)| (!supported).then_some(name))
        .collect()
    }

    fn query(instance: &Instance, device: vk::PhysicalDevice) -> Self {
        let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut as_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
        let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::builder()
            .push_next(&mut features12)
            .push_next(&mut as_features)
            .push_next(&mut rt_features);
        unsafe { instance.get_physical_device_features2(device, &mut features2) };

        Self {
            buffer_device_address: features12.buffer_device_address == vk::TRUE,
            runtime_descriptor_array: features12.runtime_descriptor_array == vk::TRUE,
            storage_buffer_non_uniform_indexing: features12.shader_storage_buffer_array_non_uniform_indexing
                == vk::TRUE,
            sampled_image_non_uniform_indexing: features12.shader_sampled_image_array_non_uniform_indexing
                == vk::TRUE,
            scalar_block_layout: features12.scalar_block_layout == vk::TRUE,
            acceleration_structure: as_features.acceleration_structure == vk::TRUE,
            ray_tracing_pipeline: rt_features.ray_tracing_pipeline == vk::TRUE,
        }
    }
}

/// First candidate accepted by `supports`, in candidate order
pub fn first_supported_format(
    candidates: &[vk::Format],
    mut supports: impl FnMut(vk::Format) -> bool,
) -> Option<vk::Format> {
    candidates.iter().copied().find(|&format| supports(format))
}

/// Depth formats tried in order of preference
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// Vulkan instance wrapper with RAII cleanup
pub struct VulkanInstance {
    /// Vulkan entry point
    pub entry: Entry,
    /// Vulkan instance handle
    pub instance: Instance,
    /// Debug utilities extension (debug builds)
    #[cfg(debug_assertions)]
    pub debug_utils: Option<DebugUtils>,
    /// Debug messenger handle (debug builds)
    #[cfg(debug_assertions)]
    pub debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
}

impl VulkanInstance {
    /// Create a Vulkan 1.2 instance, with validation layers when requested
    pub fn new(window: &Window, app_name: &str, enable_validation: bool) -> VulkanResult<Self> {
        let entry = unsafe { Entry::load() }
            .map_err(|e| VulkanError::InitializationFailed(format!("Failed to load Vulkan: {e:?}")))?;

        let app_name_cstr = to_cstring(app_name)?;
        let engine_name_cstr = to_cstring("HybridRenderer")?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(&engine_name_cstr)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_2);

        let required_extensions = window
            .get_required_instance_extensions()
            .map_err(|e| VulkanError::InitializationFailed(format!("Failed to get required extensions: {e}")))?;

        let cstr_extensions = required_extensions
            .iter()
            .map(|ext| to_cstring(ext))
            .collect::<VulkanResult<Vec<_>>>()?;

        #[allow(unused_mut)]
        let mut extensions: Vec<*const i8> = cstr_extensions.iter().map(|ext| ext.as_ptr()).collect();

        #[cfg(debug_assertions)]
        if enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        let layer_names = if cfg!(debug_assertions) && enable_validation {
            vec![to_cstring("VK_LAYER_KHRONOS_validation")?]
        } else {
            vec![]
        };
        let layer_names_ptrs: Vec<*const i8> = layer_names.iter().map(|name| name.as_ptr()).collect();

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names_ptrs);

        let instance = unsafe { entry.create_instance(&create_info, None).map_err(VulkanError::Api)? };

        #[cfg(debug_assertions)]
        let (debug_utils, debug_messenger) = if enable_validation {
            let debug_utils = DebugUtils::new(&entry, &instance);
            let debug_messenger = Self::setup_debug_messenger(&debug_utils)?;
            (Some(debug_utils), Some(debug_messenger))
        } else {
            (None, None)
        };

        Ok(Self {
            entry,
            instance,
            #[cfg(debug_assertions)]
            debug_utils,
            #[cfg(debug_assertions)]
            debug_messenger,
        })
    }

    #[cfg(debug_assertions)]
    fn setup_debug_messenger(debug_utils: &DebugUtils) -> VulkanResult<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        unsafe {
            debug_utils
                .create_debug_utils_messenger(&create_info, None)
                .map_err(VulkanError::Api)
        }
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            #[cfg(debug_assertions)]
            if let (Some(debug_utils), Some(debug_messenger)) = (&self.debug_utils, &self.debug_messenger) {
                debug_utils.destroy_debug_utils_messenger(*debug_messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

fn to_cstring(value: &str) -> VulkanResult<CString> {
    CString::new(value).map_err(|e| VulkanError::InitializationFailed(format!("Invalid name {value:?}: {e}")))
}

/// Debug callback for validation layers
#[cfg(debug_assertions)]
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let callback_data = *callback_data;
    let message = CStr::from_ptr(callback_data.p_message).to_string_lossy();

    if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        log::error!("[Vulkan] {:?} - {}", message_type, message);
    } else if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        log::warn!("[Vulkan] {:?} - {}", message_type, message);
    } else {
        log::debug!("[Vulkan] {:?} - {}", message_type, message);
    }

    vk::FALSE
}

/// Physical device selection and capabilities
pub struct PhysicalDeviceInfo {
    /// Vulkan physical device handle
    pub device: vk::PhysicalDevice,
    /// Device properties and limits
    pub properties: vk::PhysicalDeviceProperties,
    /// Memory heaps and types
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Ray tracing pipeline limits: handle size, alignments, recursion depth
    pub ray_tracing_properties: vk::PhysicalDeviceRayTracingPipelinePropertiesKHR,
    /// Index of the graphics queue family
    pub graphics_family: u32,
    /// Index of the presentation queue family
    pub present_family: u32,
}

impl PhysicalDeviceInfo {
    /// Select the first device that can present and ray trace
    pub fn select_suitable_device(
        instance: &Instance,
        surface: vk::SurfaceKHR,
        surface_loader: &Surface,
    ) -> VulkanResult<Self> {
        let devices = unsafe { instance.enumerate_physical_devices().map_err(VulkanError::Api)? };

        for device in devices {
            match Self::evaluate_device(instance, device, surface, surface_loader) {
                Ok(device_info) => {
                    log::info!("Selected GPU: {}", device_info.name());
                    return Ok(device_info);
                }
                Err(e) => log::debug!("Skipping GPU: {}", e),
            }
        }

        Err(VulkanError::InitializationFailed(
            "No GPU with ray tracing and presentation support found".to_string(),
        ))
    }

    fn evaluate_device(
        instance: &Instance,
        device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        surface_loader: &Surface,
    ) -> VulkanResult<Self> {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let queue_families = unsafe { instance.get_physical_device_queue_family_properties(device) };

        let mut graphics_family = None;
        let mut present_family = None;

        for (index, family) in queue_families.iter().enumerate() {
            let index = u32::try_from(index)
                .map_err(|_| VulkanError::InitializationFailed("Queue family index overflow".to_string()))?;

            if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) && graphics_family.is_none() {
                graphics_family = Some(index);
            }

            let present_support = unsafe {
                surface_loader
                    .get_physical_device_surface_support(device, index, surface)
                    .map_err(VulkanError::Api)?
            };

            if present_support && present_family.is_none() {
                present_family = Some(index);
            }

            if graphics_family.is_some() && present_family.is_some() {
                break;
            }
        }

        let graphics_family = graphics_family
            .ok_or_else(|| VulkanError::InitializationFailed("No graphics queue family found".to_string()))?;
        let present_family = present_family
            .ok_or_else(|| VulkanError::InitializationFailed("No present queue family found".to_string()))?;

        let extensions = unsafe {
            instance
                .enumerate_device_extension_properties(device)
                .map_err(VulkanError::Api)?
        };
        let available: Vec<&CStr> = extensions
            .iter()
            .map(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) })
            .collect();
        let missing = missing_extensions(&available, &required_device_extensions());
        if !missing.is_empty() {
            return Err(VulkanError::InitializationFailed(format!(
                "Missing device extensions: {}",
                missing.join(", ")
            )));
        }

        let missing_features = FeatureSupport::query(instance, device).missing();
        if !missing_features.is_empty() {
            return Err(VulkanError::InitializationFailed(format!(
                "Missing device features: {}",
                missing_features.join(", ")
            )));
        }

        let memory_properties = unsafe { instance.get_physical_device_memory_properties(device) };
        let ray_tracing_properties = unsafe { RayTracingPipeline::get_properties(instance, device) };

        Ok(Self {
            device,
            properties,
            memory_properties,
            ray_tracing_properties,
            graphics_family,
            present_family,
        })
    }

    /// Device name as reported by the driver
    pub fn name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }

    /// First depth format usable as an optimal-tiling depth attachment
    pub fn find_depth_format(&self, instance: &Instance) -> VulkanResult<vk::Format> {
        first_supported_format(&DEPTH_FORMAT_CANDIDATES, |format| {
            let props = unsafe { instance.get_physical_device_format_properties(self.device, format) };
            props
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        })
        .ok_or_else(|| VulkanError::InitializationFailed("No supported depth format".to_string()))
    }

    /// `minUniformBufferOffsetAlignment`
    pub const fn min_uniform_alignment(&self) -> u64 {
        self.properties.limits.min_uniform_buffer_offset_alignment
    }
}

/// Logical device wrapper with RAII cleanup
pub struct LogicalDevice {
    /// Vulkan logical device handle
    pub device: Device,
    /// Graphics operations queue
    pub graphics_queue: vk::Queue,
    /// Surface presentation queue
    pub present_queue: vk::Queue,
    /// Swapchain extension loader
    pub swapchain_loader: SwapchainLoader,
}

impl LogicalDevice {
    /// Create the logical device with ray tracing features enabled
    pub fn new(instance: &Instance, physical_device_info: &PhysicalDeviceInfo) -> VulkanResult<Self> {
        let unique_families: std::collections::BTreeSet<u32> = [
            physical_device_info.graphics_family,
            physical_device_info.present_family,
        ]
        .into_iter()
        .collect();

        let priorities = [1.0];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
                    .build()
            })
            .collect();

        let required_extensions: Vec<*const i8> =
            required_device_extensions().iter().map(|name| name.as_ptr()).collect();

        let device_features = vk::PhysicalDeviceFeatures::builder()
            .sampler_anisotropy(true)
            .sample_rate_shading(true)
            .shader_int64(true)
            .build();

        let mut features12 = vk::PhysicalDeviceVulkan12Features::builder()
            .buffer_device_address(true)
            .descriptor_indexing(true)
            .runtime_descriptor_array(true)
            .shader_storage_buffer_array_non_uniform_indexing(true)
            .shader_sampled_image_array_non_uniform_indexing(true)
            .scalar_block_layout(true);
        let mut as_features =
            vk::PhysicalDeviceAccelerationStructureFeaturesKHR::builder().acceleration_structure(true);
        let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::builder().ray_tracing_pipeline(true);

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&required_extensions)
            .enabled_features(&device_features)
            .push_next(&mut features12)
            .push_next(&mut as_features)
            .push_next(&mut rt_features);

        let device = unsafe {
            instance
                .create_device(physical_device_info.device, &create_info, None)
                .map_err(VulkanError::Api)?
        };

        let graphics_queue = unsafe { device.get_device_queue(physical_device_info.graphics_family, 0) };
        let present_queue = unsafe { device.get_device_queue(physical_device_info.present_family, 0) };
        let swapchain_loader = SwapchainLoader::new(instance, &device);

        Ok(Self {
            device,
            graphics_queue,
            present_queue,
            swapchain_loader,
        })
    }
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
        }
    }
}

/// Ray tracing extension loaders
pub struct RayTracingLoaders {
    /// `VK_KHR_acceleration_structure`
    pub acceleration_structure: AccelerationStructure,
    /// `VK_KHR_ray_tracing_pipeline`
    pub pipeline: RayTracingPipeline,
}

/// Main Vulkan context that owns all core Vulkan resources
///
/// At most one context exists per process; construction fails with
/// [`VulkanError::SecondContext`] while another one is alive.
pub struct VulkanContext {
    /// Vulkan surface for rendering
    pub surface: vk::SurfaceKHR,
    /// Surface extension loader
    pub surface_loader: Surface,
    /// Selected physical device information
    pub physical_device: PhysicalDeviceInfo,
    /// Swapchain for presenting frames
    pub swapchain: Option<Swapchain>,
    /// Ray tracing loaders
    pub ray_tracing: RayTracingLoaders,
    /// Logical device for operations
    pub device: LogicalDevice,
    /// Vulkan instance and debug utilities
    pub instance: VulkanInstance,
    _guard: InstanceGuard,
}

impl VulkanContext {
    /// Create a new Vulkan context for the window
    pub fn new(window: &mut Window, config: &RendererConfig) -> VulkanResult<Self> {
        let guard = InstanceGuard::acquire()?;

        let instance = VulkanInstance::new(window, &config.application_name, config.validation_enabled())?;

        let surface_loader = Surface::new(&instance.entry, &instance.instance);
        let surface = window
            .create_vulkan_surface(instance.instance.handle())
            .map_err(|e| VulkanError::InitializationFailed(format!("Surface creation: {e}")))?;

        let physical_device = PhysicalDeviceInfo::select_suitable_device(&instance.instance, surface, &surface_loader)?;
        let device = LogicalDevice::new(&instance.instance, &physical_device)?;

        let ray_tracing = RayTracingLoaders {
            acceleration_structure: AccelerationStructure::new(&instance.instance, &device.device),
            pipeline: RayTracingPipeline::new(&instance.instance, &device.device),
        };

        let (width, height) = window.framebuffer_size();
        let swapchain = Swapchain::new(
            &instance.instance,
            device.device.clone(),
            surface,
            &surface_loader,
            &physical_device,
            vk::Extent2D { width, height },
            vk::SwapchainKHR::null(),
        )?;

        Ok(Self {
            surface,
            surface_loader,
            physical_device,
            swapchain: Some(swapchain),
            ray_tracing,
            device,
            instance,
            _guard: guard,
        })
    }

    /// Get a reference to the Vulkan instance
    pub const fn instance(&self) -> &Instance {
        &self.instance.instance
    }

    /// Get the raw Device handle
    pub const fn device(&self) -> &Device {
        &self.device.device
    }

    /// Get the swapchain
    pub fn swapchain(&self) -> VulkanResult<&Swapchain> {
        self.swapchain.as_ref().ok_or_else(|| VulkanError::InvalidOperation {
            reason: "Swapchain not created".to_string(),
        })
    }

    /// Get the graphics queue
    pub const fn graphics_queue(&self) -> vk::Queue {
        self.device.graphics_queue
    }

    /// Get the present queue
    pub const fn present_queue(&self) -> vk::Queue {
        self.device.present_queue
    }

    /// Get the graphics queue family index
    pub const fn graphics_queue_family(&self) -> u32 {
        self.physical_device.graphics_family
    }

    /// Recreate the swapchain at `extent`, passing the old one to the driver
    pub fn recreate_swapchain(&mut self, extent: vk::Extent2D) -> VulkanResult<()> {
        unsafe {
            self.device.device.device_wait_idle().map_err(VulkanError::Api)?;
        }

        let old = self.swapchain.take();
        let old_handle = old.as_ref().map_or(vk::SwapchainKHR::null(), Swapchain::handle);

        let new_swapchain = Swapchain::new(
            &self.instance.instance,
            self.device.device.clone(),
            self.surface,
            &self.surface_loader,
            &self.physical_device,
            extent,
            old_handle,
        )?;

        // Retired swapchain is destroyed only after its replacement exists
        drop(old);
        self.swapchain = Some(new_swapchain);
        Ok(())
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device.device_wait_idle();
            self.swapchain.take();
            self.surface_loader.destroy_surface(self.surface, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_extensions_lists_only_absent_names() {
        let available = [SwapchainLoader::name(), AccelerationStructure::name()];
        let missing = missing_extensions(&available, &required_device_extensions());
        assert_eq!(missing.len(), 2);
        assert!(missing.iter().any(|name| name == "VK_KHR_ray_tracing_pipeline"));
        assert!(missing.iter().any(|name| name == "VK_KHR_deferred_host_operations"));
    }

    #[test]
    fn test_feature_support_reports_missing_names() {
        let support = FeatureSupport {
            buffer_device_address: true,
            runtime_descriptor_array: true,
            storage_buffer_non_uniform_indexing: true,
            sampled_image_non_uniform_indexing: true,
            scalar_block_layout: false,
            acceleration_structure: true,
            ray_tracing_pipeline: false,
        };
        assert_eq!(support.missing(), vec!["scalarBlockLayout", "rayTracingPipeline"]);
    }

    #[test]
    fn test_depth_format_follows_preference_order() {
        let picked = first_supported_format(&DEPTH_FORMAT_CANDIDATES, |f| f != vk::Format::D32_SFLOAT);
        assert_eq!(picked, Some(vk::Format::D32_SFLOAT_S8_UINT));
        assert_eq!(first_supported_format(&DEPTH_FORMAT_CANDIDATES, |_| false), None);
    }
}
