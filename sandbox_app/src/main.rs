//! Hybrid renderer sandbox
//!
//! Loads a small scene of three models and renders it with either path.
//! WASD/QE fly the camera, R switches between raster and ray tracing,
//! Escape quits.

use hybrid_renderer::config::{Config, ConfigError};
use hybrid_renderer::events::dispatch;
use hybrid_renderer::prelude::*;
use hybrid_renderer::render::window::WindowError;

const CONFIG_PATH: &str = "sandbox.toml";
const FPS_LOG_INTERVAL: u64 = 300;

/// Errors that end the sandbox
#[derive(thiserror::Error, Debug)]
enum SandboxError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("window: {0}")]
    Window(#[from] WindowError),

    #[error("renderer: {0}")]
    Renderer(#[from] VulkanError),
}

/// Toggles the render mode and closes on Escape
#[derive(Default)]
struct SandboxKeys {
    toggle_mode: bool,
    close: bool,
}

impl EventHandler for SandboxKeys {
    fn on_event(&mut self, event: &WindowEvent) -> bool {
        match event {
            WindowEvent::KeyDown(KeyCode::R) => {
                self.toggle_mode = true;
                true
            }
            WindowEvent::KeyDown(KeyCode::Escape) | WindowEvent::Close => {
                self.close = true;
                true
            }
            _ => false,
        }
    }
}

fn load_config() -> Result<ApplicationConfig, SandboxError> {
    let config = if std::path::Path::new(CONFIG_PATH).exists() {
        log::info!("Loading configuration from {}", CONFIG_PATH);
        ApplicationConfig::load_from_file(CONFIG_PATH)?
    } else {
        let mut config = ApplicationConfig::default();
        config.window.title = "Hybrid Renderer Sandbox".to_string();
        config.renderer.shaders = ShaderConfig::with_path_resolution();
        config
    };
    config.validate().map_err(SandboxError::InvalidConfig)?;
    Ok(config)
}

fn build_scene() -> SceneDescription {
    let floor = MeshData::plane(20.0).with_material(Material::diffuse([0.6, 0.6, 0.6]));
    let cube = MeshData::cube(1.5).with_material(Material::diffuse([0.8, 0.25, 0.2]));
    let sphere = MeshData::uv_sphere(1.0, 48, 24).with_material(Material::diffuse([0.2, 0.4, 0.85]));

    let place = |model_index: u32, position: Vec3| ModelInstance::new(model_index, &Transform::from_position(position));

    SceneDescription {
        models: vec![floor, cube, sphere],
        instances: vec![
            place(0, Vec3::new(0.0, -1.0, 0.0)),
            place(1, Vec3::new(-2.0, 0.0, 0.0)),
            place(2, Vec3::new(2.0, 0.0, 0.0)),
        ],
        sky: None,
        hdr_sky: None,
    }
}

fn run() -> Result<(), SandboxError> {
    let config = load_config()?;
    let mut window = Window::new(&config.window)?;
    let mut renderer = HybridRenderer::new(&mut window, &config.renderer)?;
    renderer.load_scene(build_scene())?;

    #[allow(clippy::cast_precision_loss)]
    let aspect = config.window.width as f32 / config.window.height.max(1) as f32;
    let mut camera = Camera::perspective(Vec3::new(0.0, 3.0, 10.0), 45.0, aspect, 0.1, 1000.0);
    camera.look_at(Vec3::zeros(), Vec3::new(0.0, 1.0, 0.0));
    let mut controller = CameraController::new(camera, 5.0);
    let mut keys = SandboxKeys::default();
    let mut timer = FrameTimer::new();

    log::info!("Sandbox running in {} mode; press R to switch", renderer.mode());

    while !window.should_close() {
        window.poll_events();
        for event in window.drain_events() {
            dispatch(&event, &mut [&mut keys, &mut controller]);
        }
        if std::mem::take(&mut keys.close) {
            window.set_should_close(true);
            continue;
        }
        if std::mem::take(&mut keys.toggle_mode) {
            renderer.toggle_mode();
        }

        timer.update();
        controller.update(timer.delta_time());

        if !renderer.begin_frame(&mut window)? {
            continue;
        }
        renderer.begin_scene(controller.camera())?;
        match renderer.mode() {
            RenderMode::Raster => renderer.rasterize()?,
            RenderMode::RayTrace => renderer.raytrace()?,
        }
        renderer.end_scene()?;
        renderer.end_frame(&mut window)?;

        if timer.frame_count() % FPS_LOG_INTERVAL == 0 {
            log::info!(
                "{:.1} fps ({:.2} ms) in {} mode",
                timer.average_fps(),
                timer.average_frame_time(),
                renderer.mode()
            );
        }
    }

    log::info!("Sandbox closed after {} frames", timer.frame_count());
    Ok(())
}

fn main() {
    hybrid_renderer::foundation::logging::init();

    if let Err(e) = run() {
        log::error!("Sandbox failed: {}", e);
        std::process::exit(1);
    }
}
