//! Command recording, shaders, pipelines and render passes

pub mod commands;
pub mod pipeline;
pub mod ray_tracing;
pub mod render_pass;
pub mod shader;

pub use commands::{ActiveRenderPass, CommandPool, CommandRecorder};
pub use pipeline::{GraphicsPipeline, GraphicsPipelineBuilder, PipelineLayout};
pub use ray_tracing::{RayTracingPipeline, RayTracingShaders, SbtLayout, ShaderBindingTable};
pub use render_pass::{Framebuffer, RenderPass, RenderPassDesc};
pub use shader::ShaderModule;
