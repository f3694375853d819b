//! Frame lifecycle state machine
//!
//! ```text
//! Idle -> Acquiring -> Recording -> Submitted -> Presenting -> Idle
//! Acquiring | Presenting -> SwapchainStale -> Rebuilding -> Idle
//! Rebuilding -> SwapchainStale (window closed while minimized)
//! ```

use std::fmt;

use crate::render::backends::vulkan::{VulkanError, VulkanResult};

/// Where the current frame is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameState {
    /// No frame in progress
    #[default]
    Idle,
    /// Waiting on the slot fence and acquiring an image
    Acquiring,
    /// Command buffer open
    Recording,
    /// Commands submitted to the graphics queue
    Submitted,
    /// Present queued
    Presenting,
    /// Acquire or present reported the swapchain unusable, or a resize is pending
    SwapchainStale,
    /// Swapchain and dependents being recreated
    Rebuilding,
}

impl fmt::Display for FrameState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Inputs that move the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameEvent {
    /// `begin_frame` started
    BeginFrame,
    /// An image was acquired and the command buffer opened
    ImageAcquired,
    /// Acquire or present found the swapchain stale
    SwapchainStale,
    /// The command buffer was submitted
    Submitted,
    /// Present was queued
    PresentQueued,
    /// Present succeeded and no resize is pending
    PresentComplete,
    /// Rebuild started
    RebuildStarted,
    /// Rebuild finished
    RebuildComplete,
    /// Window closed before the framebuffer had a usable size
    RebuildAborted,
}

/// Successor of `state` under `event`, or `None` when the event is illegal there
pub const fn transition(state: FrameState, event: FrameEvent) -> Option<FrameState> {
    use FrameEvent as E;
    use FrameState as S;
    match (state, event) {
        (S::Idle, E::BeginFrame) => Some(S::Acquiring),
        (S::Acquiring, E::ImageAcquired) => Some(S::Recording),
        (S::Acquiring | S::Presenting, E::SwapchainStale) => Some(S::SwapchainStale),
        (S::Recording, E::Submitted) => Some(S::Submitted),
        (S::Submitted, E::PresentQueued) => Some(S::Presenting),
        (S::Presenting, E::PresentComplete) => Some(S::Idle),
        (S::SwapchainStale, E::RebuildStarted) => Some(S::Rebuilding),
        (S::Rebuilding, E::RebuildComplete) => Some(S::Idle),
        (S::Rebuilding, E::RebuildAborted) => Some(S::SwapchainStale),
        _ => None,
    }
}

/// Tracks the frame lifecycle and rejects out-of-order calls
#[derive(Debug, Default, Clone)]
pub struct FrameStateMachine {
    state: FrameState,
}

impl FrameStateMachine {
    /// Start in [`FrameState::Idle`]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state
    pub const fn state(&self) -> FrameState {
        self.state
    }

    /// Apply `event`, failing without changing state when it is illegal
    pub fn apply(&mut self, event: FrameEvent) -> VulkanResult<FrameState> {
        let next = transition(self.state, event).ok_or_else(|| VulkanError::InvalidOperation {
            reason: format!("{event:?} is not valid in frame state {}", self.state),
        })?;
        log::trace!("[FRAME] {} -> {}", self.state, next);
        self.state = next;
        Ok(next)
    }

    /// Fail unless the machine is in `expected`
    pub fn expect(&self, expected: FrameState) -> VulkanResult<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(VulkanError::InvalidOperation {
                reason: format!("Expected frame state {expected}, found {}", self.state),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_returns_to_idle() {
        let mut machine = FrameStateMachine::new();
        for (event, expected) in [
            (FrameEvent::BeginFrame, FrameState::Acquiring),
            (FrameEvent::ImageAcquired, FrameState::Recording),
            (FrameEvent::Submitted, FrameState::Submitted),
            (FrameEvent::PresentQueued, FrameState::Presenting),
            (FrameEvent::PresentComplete, FrameState::Idle),
        ] {
            assert_eq!(machine.apply(event).unwrap(), expected);
        }
    }

    #[test]
    fn test_stale_acquire_goes_through_rebuild() {
        let mut machine = FrameStateMachine::new();
        machine.apply(FrameEvent::BeginFrame).unwrap();
        machine.apply(FrameEvent::SwapchainStale).unwrap();
        assert_eq!(machine.state(), FrameState::SwapchainStale);
        machine.apply(FrameEvent::RebuildStarted).unwrap();
        assert_eq!(machine.apply(FrameEvent::RebuildComplete).unwrap(), FrameState::Idle);
    }

    #[test]
    fn test_stale_present_goes_through_rebuild() {
        let mut machine = FrameStateMachine::new();
        for event in [
            FrameEvent::BeginFrame,
            FrameEvent::ImageAcquired,
            FrameEvent::Submitted,
            FrameEvent::PresentQueued,
            FrameEvent::SwapchainStale,
            FrameEvent::RebuildStarted,
            FrameEvent::RebuildComplete,
        ] {
            machine.apply(event).unwrap();
        }
        assert_eq!(machine.state(), FrameState::Idle);
    }

    #[test]
    fn test_aborted_rebuild_stays_stale() {
        let mut machine = FrameStateMachine::new();
        machine.apply(FrameEvent::BeginFrame).unwrap();
        machine.apply(FrameEvent::SwapchainStale).unwrap();
        machine.apply(FrameEvent::RebuildStarted).unwrap();
        assert_eq!(machine.apply(FrameEvent::RebuildAborted).unwrap(), FrameState::SwapchainStale);
        assert!(machine.apply(FrameEvent::BeginFrame).is_err());
    }

    #[test]
    fn test_illegal_event_keeps_state() {
        let mut machine = FrameStateMachine::new();
        assert!(machine.apply(FrameEvent::Submitted).is_err());
        assert_eq!(machine.state(), FrameState::Idle);

        machine.apply(FrameEvent::BeginFrame).unwrap();
        machine.apply(FrameEvent::ImageAcquired).unwrap();
        assert!(machine.apply(FrameEvent::SwapchainStale).is_err());
        assert_eq!(machine.state(), FrameState::Recording);
    }

    #[test]
    fn test_expect_reports_mismatch() {
        let machine = FrameStateMachine::new();
        assert!(machine.expect(FrameState::Idle).is_ok());
        assert!(machine.expect(FrameState::Recording).is_err());
    }
}
