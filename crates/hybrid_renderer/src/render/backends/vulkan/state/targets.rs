//! Per-swapchain-image resources in a generation-checked table
//!
//! Framebuffers and command buffers exist once per swapchain image and are
//! recreated with the swapchain. Keys handed out before a rebuild stop
//! resolving afterwards instead of aliasing a new resource.

use slotmap::{new_key_type, SlotMap};

use crate::render::backends::vulkan::{VulkanError, VulkanResult};

new_key_type! {
    /// Key of one image's resources; invalidated by every rebuild
    pub struct ImageKey;
}

/// Creates the resources of one swapchain image
pub trait TargetFactory<T> {
    /// Resources for swapchain image `image_index`
    fn create_target(&mut self, image_index: usize) -> VulkanResult<T>;
}

impl<T, F> TargetFactory<T> for F
where
    F: FnMut(usize) -> VulkanResult<T>,
{
    fn create_target(&mut self, image_index: usize) -> VulkanResult<T> {
        self(image_index)
    }
}

/// One `T` per swapchain image
pub struct SwapchainTargets<T> {
    table: SlotMap<ImageKey, T>,
    keys: Vec<ImageKey>,
    generation: u64,
}

impl<T> Default for SwapchainTargets<T> {
    fn default() -> Self {
        Self {
            table: SlotMap::with_key(),
            keys: Vec::new(),
            generation: 0,
        }
    }
}

impl<T> SwapchainTargets<T> {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every target, then create `image_count` new ones
    ///
    /// On failure the table is left empty rather than half built.
    pub fn rebuild(&mut self, image_count: usize, factory: &mut impl TargetFactory<T>) -> VulkanResult<()> {
        self.clear();
        for image_index in 0..image_count {
            match factory.create_target(image_index) {
                Ok(target) => {
                    let key = self.table.insert(target);
                    self.keys.push(key);
                }
                Err(e) => {
                    self.clear();
                    return Err(e);
                }
            }
        }
        self.generation += 1;
        log::debug!(
            "[SWAPCHAIN] Targets generation {} with {} images",
            self.generation,
            image_count
        );
        Ok(())
    }

    /// Drop every target
    pub fn clear(&mut self) {
        self.keys.clear();
        self.table.clear();
    }

    /// Take every target out, leaving the table empty
    pub fn drain(&mut self) -> Vec<T> {
        let keys = std::mem::take(&mut self.keys);
        keys.into_iter().filter_map(|key| self.table.remove(key)).collect()
    }

    /// Key of image `image_index` in the current generation
    pub fn key(&self, image_index: usize) -> Option<ImageKey> {
        self.keys.get(image_index).copied()
    }

    /// Target behind `key`, `None` once the key's generation is gone
    pub fn resolve(&self, key: ImageKey) -> Option<&T> {
        self.table.get(key)
    }

    /// Target of image `image_index`
    pub fn get(&self, image_index: usize) -> VulkanResult<&T> {
        self.key(image_index)
            .and_then(|key| self.table.get(key))
            .ok_or_else(|| VulkanError::InvalidOperation {
                reason: format!("No target for swapchain image {image_index} ({} images)", self.len()),
            })
    }

    /// Targets in image order
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.keys.iter().filter_map(|&key| self.table.get(key))
    }

    /// Number of live targets
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Number of successful rebuilds
    pub const fn generation(&self) -> u64 {
        self.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    struct Tracked {
        image: usize,
        live: Rc<Cell<usize>>,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.live.set(self.live.get() - 1);
        }
    }

    fn factory(live: &Rc<Cell<usize>>) -> impl FnMut(usize) -> VulkanResult<Tracked> + '_ {
        move |image| {
            live.set(live.get() + 1);
            Ok(Tracked {
                image,
                live: Rc::clone(live),
            })
        }
    }

    #[test]
    fn test_rebuild_replaces_without_duplicates() {
        let live = Rc::new(Cell::new(0));
        let mut targets = SwapchainTargets::new();

        targets.rebuild(3, &mut factory(&live)).unwrap();
        assert_eq!(live.get(), 3);
        targets.rebuild(2, &mut factory(&live)).unwrap();
        assert_eq!(live.get(), 2);
        assert_eq!(targets.len(), 2);
        assert_eq!(targets.generation(), 2);
        assert_eq!(targets.get(1).unwrap().image, 1);
        assert!(targets.get(2).is_err());
    }

    #[test]
    fn test_old_keys_do_not_resolve_after_rebuild() {
        let live = Rc::new(Cell::new(0));
        let mut targets = SwapchainTargets::new();
        targets.rebuild(2, &mut factory(&live)).unwrap();
        let stale = targets.key(0).unwrap();
        assert!(targets.resolve(stale).is_some());

        targets.rebuild(2, &mut factory(&live)).unwrap();
        assert!(targets.resolve(stale).is_none());
        assert!(targets.resolve(targets.key(0).unwrap()).is_some());
    }

    #[test]
    fn test_failed_rebuild_leaves_table_empty() {
        let live = Rc::new(Cell::new(0));
        let mut targets = SwapchainTargets::new();
        targets.rebuild(2, &mut factory(&live)).unwrap();

        let mut failing = |image: usize| -> VulkanResult<Tracked> {
            if image == 1 {
                return Err(VulkanError::InvalidOperation {
                    reason: "boom".to_string(),
                });
            }
            live.set(live.get() + 1);
            Ok(Tracked {
                image,
                live: Rc::clone(&live),
            })
        };
        assert!(targets.rebuild(3, &mut failing).is_err());
        assert!(targets.is_empty());
        assert_eq!(live.get(), 0);
        assert_eq!(targets.generation(), 1);
    }

    #[test]
    fn test_drain_returns_targets_in_image_order() {
        let live = Rc::new(Cell::new(0));
        let mut targets = SwapchainTargets::new();
        targets.rebuild(3, &mut factory(&live)).unwrap();
        let drained: Vec<usize> = targets.drain().iter().map(|t| t.image).collect();
        assert_eq!(drained, vec![0, 1, 2]);
        assert!(targets.is_empty());
        assert_eq!(live.get(), 0);
    }
}
