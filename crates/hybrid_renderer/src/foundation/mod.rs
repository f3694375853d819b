//! Foundation module - Core utilities and types
//!
//! - Math types and camera conventions
//! - Frame timing
//! - Logging setup

pub mod logging;
pub mod math;
pub mod time;
