//! Window events
//!
//! The window layer translates platform events into the closed [`WindowEvent`]
//! set below. Consumers receive them through [`EventHandler`], returning `true`
//! when an event is consumed so later handlers do not see it.

/// Keys the renderer and demo applications react to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyCode {
    /// Forward
    W,
    /// Left
    A,
    /// Backward
    S,
    /// Right
    D,
    /// Down
    Q,
    /// Up
    E,
    /// Raster / ray trace toggle
    R,
    /// Close request
    Escape,
    /// Any other key, carrying the platform key code
    Other(i32),
}

/// Everything the window reports to the application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowEvent {
    /// The user asked to close the window
    Close,
    /// The framebuffer was resized to (width, height) pixels
    Resize(u32, u32),
    /// A key was pressed
    KeyDown(KeyCode),
    /// A key was released
    KeyUp(KeyCode),
}

/// Receives window events
pub trait EventHandler {
    /// Handle an event, return true if consumed
    fn on_event(&mut self, event: &WindowEvent) -> bool;
}

/// Offer `event` to each handler in order until one consumes it
pub fn dispatch(event: &WindowEvent, handlers: &mut [&mut dyn EventHandler]) -> bool {
    handlers.iter_mut().any(|handler| handler.on_event(event))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        consume: bool,
        seen: Vec<WindowEvent>,
    }

    impl EventHandler for Recorder {
        fn on_event(&mut self, event: &WindowEvent) -> bool {
            self.seen.push(*event);
            self.consume
        }
    }

    #[test]
    fn test_consumed_event_stops_forwarding() {
        let mut first = Recorder { consume: true, seen: Vec::new() };
        let mut second = Recorder { consume: false, seen: Vec::new() };

        let consumed = dispatch(&WindowEvent::KeyDown(KeyCode::R), &mut [&mut first, &mut second]);

        assert!(consumed);
        assert_eq!(first.seen, vec![WindowEvent::KeyDown(KeyCode::R)]);
        assert!(second.seen.is_empty());
    }

    #[test]
    fn test_unconsumed_event_reaches_every_handler() {
        let mut first = Recorder { consume: false, seen: Vec::new() };
        let mut second = Recorder { consume: false, seen: Vec::new() };

        let consumed = dispatch(&WindowEvent::Resize(0, 0), &mut [&mut first, &mut second]);

        assert!(!consumed);
        assert_eq!(second.seen.len(), 1);
    }
}
