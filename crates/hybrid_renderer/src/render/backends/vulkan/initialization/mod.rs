//! Instance, device and context setup

pub mod context;
pub mod guard;

pub use context::{
    LogicalDevice, PhysicalDeviceInfo, RayTracingLoaders, VulkanContext, VulkanError, VulkanInstance,
    VulkanResult,
};
pub use guard::InstanceGuard;
