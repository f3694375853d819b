//! Process-wide single-context guard

use std::sync::atomic::{AtomicBool, Ordering};

use super::context::{VulkanError, VulkanResult};

static CONTEXT_ALIVE: AtomicBool = AtomicBool::new(false);

/// Held by the one live [`super::VulkanContext`]; released on drop
#[derive(Debug)]
pub struct InstanceGuard(());

impl InstanceGuard {
    /// Claim the process-wide context slot
    pub fn acquire() -> VulkanResult<Self> {
        CONTEXT_ALIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| Self(()))
            .map_err(|_| VulkanError::SecondContext)
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        CONTEXT_ALIVE.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Only test in the crate touching the static, so no cross-test races
    #[test]
    fn test_second_acquire_fails_until_first_released() {
        let first = InstanceGuard::acquire().unwrap();
        assert!(matches!(InstanceGuard::acquire(), Err(VulkanError::SecondContext)));
        drop(first);
        let again = InstanceGuard::acquire();
        assert!(again.is_ok());
    }
}
