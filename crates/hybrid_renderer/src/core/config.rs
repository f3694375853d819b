//! # Renderer Configuration
//!
//! Configuration for the window, the Vulkan renderer and the shader set.
//! Every type here is serializable so a whole [`ApplicationConfig`] can be
//! loaded from TOML or RON, and each one validates itself before use.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub use crate::config::{Config, ConfigError};

/// Directories searched, in order, when resolving the shader directory
const SHADER_SEARCH_DIRS: &[&str] = &[
    "target/shaders/",
    "shaders/",
    "resources/shaders/",
    "../target/shaders/",
    "../../target/shaders/",
    "./",
];

/// # Shader Configuration
///
/// Names the SPIR-V binaries for every pipeline stage the renderer builds.
/// File names are relative to `directory`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShaderConfig {
    /// Directory holding the compiled `.spv` files
    pub directory: PathBuf,
    /// Offscreen raster vertex stage
    pub raster_vertex: String,
    /// Offscreen raster fragment stage
    pub raster_fragment: String,
    /// Full-screen post vertex stage
    pub post_vertex: String,
    /// Full-screen post fragment stage
    pub post_fragment: String,
    /// Ray generation stage
    pub ray_gen: String,
    /// Primary miss stage
    pub ray_miss: String,
    /// Shadow ray miss stage
    pub ray_shadow_miss: String,
    /// Closest hit stage
    pub ray_closest_hit: String,
}

impl ShaderConfig {
    /// Shader set rooted at `directory`
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            raster_vertex: "raster.vert.spv".to_string(),
            raster_fragment: "raster.frag.spv".to_string(),
            post_vertex: "post.vert.spv".to_string(),
            post_fragment: "post.frag.spv".to_string(),
            ray_gen: "raytrace.rgen.spv".to_string(),
            ray_miss: "raytrace.rmiss.spv".to_string(),
            ray_shadow_miss: "raytrace_shadow.rmiss.spv".to_string(),
            ray_closest_hit: "raytrace.rchit.spv".to_string(),
        }
    }

    /// Create shader config with automatic path resolution
    ///
    /// Picks the first search directory that contains the ray generation
    /// binary, so the renderer can be started from the workspace root or from
    /// inside a crate.
    pub fn with_path_resolution() -> Self {
        let probe = Self::new("");
        let directory = SHADER_SEARCH_DIRS
            .iter()
            .map(PathBuf::from)
            .find(|dir| dir.join(&probe.ray_gen).exists())
            .unwrap_or_else(|| PathBuf::from("target/shaders/"));
        Self { directory, ..probe }
    }

    /// Full path of a shader file
    pub fn path(&self, file: &str) -> PathBuf {
        self.directory.join(file)
    }

    /// All shader file names in pipeline order
    pub fn files(&self) -> [&str; 8] {
        [
            &self.raster_vertex,
            &self.raster_fragment,
            &self.post_vertex,
            &self.post_fragment,
            &self.ray_gen,
            &self.ray_miss,
            &self.ray_shadow_miss,
            &self.ray_closest_hit,
        ]
    }

    /// Validate that shader files exist
    pub fn validate(&self) -> Result<(), String> {
        for file in self.files() {
            let path = self.path(file);
            if !Path::new(&path).exists() {
                return Err(format!("Shader not found: {}", path.display()));
            }
        }
        Ok(())
    }
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self::with_path_resolution()
    }
}

/// # Renderer Configuration
///
/// Settings for the Vulkan renderer: application metadata, frame pacing,
/// multisampling and ray tracing limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RendererConfig {
    /// Application name for Vulkan instance creation
    pub application_name: String,
    /// Shader configuration
    pub shaders: ShaderConfig,
    /// Number of frame slots (semaphore pair plus fence each)
    pub max_frames_in_flight: usize,
    /// Sample count of the offscreen raster target
    pub msaa_samples: u32,
    /// Requested ray recursion depth, clamped to the device limit
    pub max_ray_recursion_depth: u32,
    /// Upper bound for a single fence wait in nanoseconds. Expiry is fatal.
    pub fence_timeout_ns: u64,
    /// Whether to enable Vulkan validation layers
    pub enable_validation: Option<bool>,
}

impl RendererConfig {
    /// Create a new renderer configuration
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            application_name: app_name.into(),
            shaders: ShaderConfig::default(),
            max_frames_in_flight: 1,
            msaa_samples: 8,
            max_ray_recursion_depth: 10,
            fence_timeout_ns: 5_000_000_000,
            enable_validation: None,
        }
    }

    /// Set custom shader configuration
    #[must_use]
    pub fn with_shaders(mut self, shaders: ShaderConfig) -> Self {
        self.shaders = shaders;
        self
    }

    /// Set maximum frames in flight
    #[must_use]
    pub fn with_max_frames_in_flight(mut self, frames: usize) -> Self {
        self.max_frames_in_flight = frames;
        self
    }

    /// Set the offscreen sample count
    #[must_use]
    pub fn with_msaa_samples(mut self, samples: u32) -> Self {
        self.msaa_samples = samples;
        self
    }

    /// Set the fence wait timeout
    #[must_use]
    pub fn with_fence_timeout_ns(mut self, timeout_ns: u64) -> Self {
        self.fence_timeout_ns = timeout_ns;
        self
    }

    /// Enable or disable validation layers
    #[must_use]
    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.enable_validation = Some(enabled);
        self
    }

    /// Enables validation in debug builds and disables it in release builds
    #[must_use]
    pub fn with_auto_validation(mut self) -> Self {
        self.enable_validation = Some(cfg!(debug_assertions));
        self
    }

    /// Resolved validation setting
    pub fn validation_enabled(&self) -> bool {
        self.enable_validation.unwrap_or(cfg!(debug_assertions))
    }

    /// Validate the configuration without touching the filesystem
    pub fn validate_settings(&self) -> Result<(), String> {
        if self.application_name.is_empty() {
            return Err("Application name cannot be empty".to_string());
        }
        if self.max_frames_in_flight == 0 {
            return Err("Max frames in flight must be at least 1".to_string());
        }
        if self.max_frames_in_flight > 8 {
            return Err("Max frames in flight should not exceed 8".to_string());
        }
        if !matches!(self.msaa_samples, 1 | 2 | 4 | 8 | 16 | 32 | 64) {
            return Err(format!("MSAA sample count must be a power of two up to 64, got {}", self.msaa_samples));
        }
        if self.max_ray_recursion_depth == 0 {
            return Err("Ray recursion depth must be at least 1".to_string());
        }
        if self.fence_timeout_ns == 0 {
            return Err("Fence timeout must be non-zero".to_string());
        }
        Ok(())
    }

    /// Validate the configuration, including shader presence
    pub fn validate(&self) -> Result<(), String> {
        self.validate_settings()?;
        self.shaders.validate()
    }
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self::new("Hybrid Renderer").with_auto_validation()
    }
}

/// Window creation settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Window title
    pub title: String,
    /// Initial width in screen coordinates
    pub width: u32,
    /// Initial height in screen coordinates
    pub height: u32,
}

impl WindowConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.width == 0 || self.height == 0 {
            return Err(format!("Window size must be non-zero, got {}x{}", self.width, self.height));
        }
        Ok(())
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Hybrid Renderer".to_string(),
            width: 1280,
            height: 720,
        }
    }
}

/// # Application Configuration
///
/// Everything an application needs to open a window and start the renderer.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Window settings
    pub window: WindowConfig,
    /// Renderer settings
    pub renderer: RendererConfig,
}

impl ApplicationConfig {
    /// Validate every section, including shader presence
    pub fn validate(&self) -> Result<(), String> {
        self.window.validate()?;
        self.renderer.validate()
    }
}

impl Config for ApplicationConfig {}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RendererConfig {
        RendererConfig::new("test").with_shaders(ShaderConfig::new("does/not/exist"))
    }

    #[test]
    fn test_defaults_match_single_frame_setup() {
        let config = config();
        assert_eq!(config.max_frames_in_flight, 1);
        assert_eq!(config.msaa_samples, 8);
        assert_eq!(config.max_ray_recursion_depth, 10);
        assert!(config.validate_settings().is_ok());
    }

    #[test]
    fn test_frames_in_flight_bounds() {
        assert!(config().with_max_frames_in_flight(0).validate_settings().is_err());
        assert!(config().with_max_frames_in_flight(3).validate_settings().is_ok());
        assert!(config().with_max_frames_in_flight(9).validate_settings().is_err());
    }

    #[test]
    fn test_msaa_must_be_power_of_two() {
        assert!(config().with_msaa_samples(6).validate_settings().is_err());
        assert!(config().with_msaa_samples(4).validate_settings().is_ok());
    }

    #[test]
    fn test_zero_fence_timeout_rejected() {
        assert!(config().with_fence_timeout_ns(0).validate_settings().is_err());
    }

    #[test]
    fn test_missing_shaders_fail_validation() {
        let err = config().validate().unwrap_err();
        assert!(err.contains("raster.vert.spv"));
    }

    #[test]
    fn test_window_size_must_be_non_zero() {
        let window = WindowConfig { width: 0, ..WindowConfig::default() };
        assert!(window.validate().is_err());
    }

    #[test]
    fn test_application_config_toml_round_trip() {
        let mut original = ApplicationConfig::default();
        original.renderer = config().with_max_frames_in_flight(2);
        let text = original.to_string_with_format("app.toml").unwrap();
        let parsed = ApplicationConfig::from_str_with_format(&text, "app.toml").unwrap();
        assert_eq!(parsed, original);
    }
}
