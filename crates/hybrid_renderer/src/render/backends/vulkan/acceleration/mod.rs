//! Ray tracing acceleration structures

pub mod builder;
pub mod instance;

pub use builder::{AccelerationBuilder, BlasInput, SceneAccelerations};
pub use instance::{plan_tlas, GeometryInstance};
