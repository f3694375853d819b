//! Frame lifecycle: synchronization, swapchain, per-image targets and rebuilds

pub mod frame_state;
pub mod rebuild;
pub mod swapchain;
pub mod sync;
pub mod targets;

pub use frame_state::{FrameEvent, FrameState, FrameStateMachine};
pub use rebuild::{rebuild_swapchain, wait_for_nonzero_size, RebuildOutcome, RebuildReason, SwapchainBackend};
pub use swapchain::Swapchain;
pub use sync::{Fence, FrameSlot, FrameSlots, FrameSync, Semaphore};
pub use targets::{ImageKey, SwapchainTargets, TargetFactory};
