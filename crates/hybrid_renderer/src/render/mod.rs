//! Rendering: window, camera, scene data and the Vulkan backend

pub mod backends;
pub mod camera;
pub mod overlay;
pub mod scene;
pub mod window;
