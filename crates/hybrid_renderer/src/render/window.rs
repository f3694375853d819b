//! Window management using GLFW
//!
//! Wraps a GLFW window created without a client API, translates GLFW events
//! into [`WindowEvent`]s and keeps the resize flag the renderer polls.

use crate::core::config::WindowConfig;
use crate::events::{KeyCode, WindowEvent};
use thiserror::Error;

/// Window management errors
#[derive(Error, Debug)]
pub enum WindowError {
    /// GLFW could not be initialized
    #[error("GLFW initialization failed")]
    InitializationFailed,

    /// The window could not be created
    #[error("Window creation failed")]
    CreationFailed,

    /// Any other GLFW failure
    #[error("GLFW error: {0}")]
    GlfwError(String),
}

/// Result type for window operations
pub type WindowResult<T> = Result<T, WindowError>;

/// What the frame orchestrator needs from a window
pub trait WindowEvents {
    /// Current framebuffer size in pixels
    fn framebuffer_size(&self) -> (u32, u32);
    /// Block until at least one event arrives, then process it
    fn wait_events(&mut self);
    /// Whether the window has been asked to close
    fn should_close(&self) -> bool;
    /// Return and clear the pending resize flag
    fn take_resized(&mut self) -> bool;
}

/// GLFW window wrapper with proper resource management
pub struct Window {
    glfw: glfw::Glfw,
    window: glfw::PWindow,
    events: glfw::GlfwReceiver<(f64, glfw::WindowEvent)>,
    pending: Vec<WindowEvent>,
    resized: bool,
}

impl Window {
    /// Create a resizable window without an OpenGL context
    pub fn new(config: &WindowConfig) -> WindowResult<Self> {
        let mut glfw = glfw::init(glfw::fail_on_errors).map_err(|_| WindowError::InitializationFailed)?;

        glfw.window_hint(glfw::WindowHint::ClientApi(glfw::ClientApiHint::NoApi));
        glfw.window_hint(glfw::WindowHint::Resizable(true));

        let (mut window, events) = glfw
            .create_window(config.width, config.height, &config.title, glfw::WindowMode::Windowed)
            .ok_or(WindowError::CreationFailed)?;

        window.set_key_polling(true);
        window.set_close_polling(true);
        window.set_framebuffer_size_polling(true);

        log::info!("[WINDOW] Created '{}' {}x{}", config.title, config.width, config.height);

        Ok(Self {
            glfw,
            window,
            events,
            pending: Vec::new(),
            resized: false,
        })
    }

    /// Process pending platform events without blocking
    pub fn poll_events(&mut self) {
        self.glfw.poll_events();
        self.collect_events();
    }

    /// Take every event translated since the last call
    pub fn drain_events(&mut self) -> Vec<WindowEvent> {
        std::mem::take(&mut self.pending)
    }

    /// Mark the window for closing
    pub fn set_should_close(&mut self, should_close: bool) {
        self.window.set_should_close(should_close);
    }

    /// Get required Vulkan instance extensions from GLFW
    pub fn get_required_instance_extensions(&self) -> WindowResult<Vec<String>> {
        self.glfw
            .get_required_instance_extensions()
            .ok_or_else(|| WindowError::GlfwError("Failed to get required extensions".to_string()))
    }

    /// Create Vulkan surface using GLFW's built-in functionality
    pub fn create_vulkan_surface(&mut self, instance: ash::vk::Instance) -> WindowResult<ash::vk::SurfaceKHR> {
        let mut surface = ash::vk::SurfaceKHR::null();
        let result = self.window.create_window_surface(instance, std::ptr::null(), &mut surface);

        if result == ash::vk::Result::SUCCESS {
            Ok(surface)
        } else {
            Err(WindowError::GlfwError(format!("Failed to create Vulkan surface: {result:?}")))
        }
    }

    fn collect_events(&mut self) {
        for (_, event) in glfw::flush_messages(&self.events) {
            if let Some(translated) = translate_event(&event) {
                if let WindowEvent::Resize(..) = translated {
                    self.resized = true;
                }
                self.pending.push(translated);
            }
        }
    }
}

impl WindowEvents for Window {
    #[allow(clippy::cast_sign_loss)]
    fn framebuffer_size(&self) -> (u32, u32) {
        let (width, height) = self.window.get_framebuffer_size();
        (width.max(0) as u32, height.max(0) as u32)
    }

    fn wait_events(&mut self) {
        self.glfw.wait_events();
        self.collect_events();
    }

    fn should_close(&self) -> bool {
        self.window.should_close()
    }

    fn take_resized(&mut self) -> bool {
        std::mem::take(&mut self.resized)
    }
}

#[allow(clippy::cast_sign_loss)]
fn translate_event(event: &glfw::WindowEvent) -> Option<WindowEvent> {
    match *event {
        glfw::WindowEvent::Close => Some(WindowEvent::Close),
        glfw::WindowEvent::FramebufferSize(width, height) => {
            Some(WindowEvent::Resize(width.max(0) as u32, height.max(0) as u32))
        }
        glfw::WindowEvent::Key(key, _, glfw::Action::Press, _) => Some(WindowEvent::KeyDown(translate_key(key))),
        glfw::WindowEvent::Key(key, _, glfw::Action::Release, _) => Some(WindowEvent::KeyUp(translate_key(key))),
        _ => None,
    }
}

const fn translate_key(key: glfw::Key) -> KeyCode {
    match key {
        glfw::Key::W => KeyCode::W,
        glfw::Key::A => KeyCode::A,
        glfw::Key::S => KeyCode::S,
        glfw::Key::D => KeyCode::D,
        glfw::Key::Q => KeyCode::Q,
        glfw::Key::E => KeyCode::E,
        glfw::Key::R => KeyCode::R,
        glfw::Key::Escape => KeyCode::Escape,
        other => KeyCode::Other(other as i32),
    }
}
