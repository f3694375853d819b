//! Deferred release of staging buffers
//!
//! Uploads record a copy out of a host-visible buffer into a command buffer
//! that has not necessarily run yet. The source buffer is parked here and
//! released by [`StagingQueue::flush`] once the caller knows the reading
//! command buffer has completed.

use std::collections::VecDeque;

/// FIFO of owners waiting for GPU completion before they may drop
#[derive(Debug)]
pub struct StagingQueue<B> {
    pending: VecDeque<B>,
}

impl<B> Default for StagingQueue<B> {
    fn default() -> Self {
        Self {
            pending: VecDeque::new(),
        }
    }
}

impl<B> StagingQueue<B> {
    /// Empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a buffer until the next flush
    pub fn push(&mut self, buffer: B) {
        self.pending.push_back(buffer);
    }

    /// Number of parked buffers
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is parked
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop everything parked so far, returning how many were released.
    ///
    /// The caller must have waited for every command buffer that reads the
    /// parked buffers.
    pub fn flush(&mut self) -> usize {
        let released = self.pending.len();
        self.pending.clear();
        if released > 0 {
            log::debug!("[ALLOC] Released {} staging buffers", released);
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Tracked {
        id: u32,
        dropped: Rc<RefCell<Vec<u32>>>,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.dropped.borrow_mut().push(self.id);
        }
    }

    #[test]
    fn test_flush_releases_only_what_was_queued_before() {
        let dropped = Rc::new(RefCell::new(Vec::new()));
        let mut queue = StagingQueue::new();
        for id in 0..3 {
            queue.push(Tracked { id, dropped: Rc::clone(&dropped) });
        }

        assert_eq!(queue.flush(), 3);
        assert_eq!(*dropped.borrow(), vec![0, 1, 2]);

        queue.push(Tracked { id: 7, dropped: Rc::clone(&dropped) });
        assert_eq!(dropped.borrow().len(), 3);
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.flush(), 1);
        assert_eq!(*dropped.borrow(), vec![0, 1, 2, 7]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_flush_on_empty_queue_is_noop() {
        let mut queue: StagingQueue<Tracked> = StagingQueue::new();
        assert_eq!(queue.flush(), 0);
    }
}
