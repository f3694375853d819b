//! # Hybrid Renderer
//!
//! A Vulkan renderer core that draws one scene two ways: rasterized forward
//! rendering or GPU ray tracing. Both paths write the same HDR offscreen image,
//! which a post pass tone-maps onto the swapchain before an overlay pass.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hybrid_renderer::prelude::*;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     hybrid_renderer::foundation::logging::init();
//!     let config = ApplicationConfig::default();
//!     let mut window = Window::new(&config.window)?;
//!     let mut renderer = HybridRenderer::new(&mut window, &config.renderer)?;
//!     renderer.load_scene(SceneDescription::default())?;
//!
//!     let camera = Camera::default();
//!     while !window.should_close() {
//!         window.poll_events();
//!         if renderer.begin_frame(&mut window)? {
//!             renderer.begin_scene(&camera)?;
//!             renderer.rasterize()?;
//!             renderer.end_scene()?;
//!             renderer.end_frame(&mut window)?;
//!         }
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod config;
pub mod core;
pub mod events;
pub mod foundation;
pub mod render;

/// Common imports for renderer users
pub mod prelude {
    pub use crate::{
        core::config::{ApplicationConfig, RendererConfig, ShaderConfig, WindowConfig},
        events::{EventHandler, KeyCode, WindowEvent},
        foundation::{
            math::{Mat4, Transform, Vec3},
            time::FrameTimer,
        },
        render::{
            backends::vulkan::{HybridRenderer, RenderMode, VulkanError, VulkanResult},
            camera::{Camera, CameraController},
            overlay::OverlayRenderer,
            scene::{Material, MeshData, ModelInstance, SceneDescription, TextureSource, Vertex},
            window::{Window, WindowEvents},
        },
    };
}
