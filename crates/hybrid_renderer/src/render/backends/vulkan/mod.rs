//! Vulkan backend implementation
//!
//! Organized into initialization, resources, acceleration, rendering and state
//! modules, with the frame orchestration in [`renderer`].

/// Vulkan initialization types (instance, device, context)
pub mod initialization;

/// Vulkan resource management (memory, descriptors, textures)
pub mod resources;

/// Bottom- and top-level acceleration structures
pub mod acceleration;

/// Vulkan rendering operations (shaders, pipelines, render passes, commands)
pub mod rendering;

/// Frame lifecycle and swapchain state
pub mod state;

/// Mode and light parameters
pub mod settings;

/// Scene uploads and scene descriptor writes
pub mod scene_resources;

/// Main hybrid renderer implementation
pub mod renderer;

// Re-export main renderer
pub use renderer::HybridRenderer;
pub use settings::{LightType, RenderMode, RenderSettings};

// Re-export core initialization types
pub use initialization::context::{PhysicalDeviceInfo, VulkanContext, VulkanError, VulkanResult};

// Re-export state types
pub use state::{FrameState, Swapchain};
