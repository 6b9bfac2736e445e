use std::collections::{HashMap, VecDeque};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use parking_lot::Mutex;
use tile_protocol::PixelRect;

use crate::region::Plane;

pub const DEFAULT_MASK_CACHE_ENTRIES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct MaskKey {
    pub rect: PixelRect,
    pub input_hash: u64,
    pub sigma_bits: u32,
}

impl MaskKey {
    pub fn new(rect: PixelRect, input: &Plane, sigma: f32) -> Self {
        let mut hasher = DefaultHasher::new();
        for value in &input.values {
            value.to_bits().hash(&mut hasher);
        }
        Self {
            rect,
            input_hash: hasher.finish(),
            sigma_bits: sigma.to_bits(),
        }
    }
}

#[derive(Debug, Default)]
struct MaskCacheState {
    masks: HashMap<MaskKey, Arc<Plane>>,
    order: VecDeque<MaskKey>,
}

/// Bounded cache of blurred luminance masks for the tone mapper.
///
/// A mask depends only on its input luminance and blur radius, so a change
/// to shadows, highlights or detail reuses it. Oldest masks go first.
#[derive(Debug)]
pub struct MaskCache {
    capacity: usize,
    state: Mutex<MaskCacheState>,
}

impl Default for MaskCache {
    fn default() -> Self {
        Self::new(DEFAULT_MASK_CACHE_ENTRIES)
    }
}

impl MaskCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(MaskCacheState::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().masks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn invalidate_all(&self) {
        let mut state = self.state.lock();
        state.masks.clear();
        state.order.clear();
    }

    /// Returns the cached mask for `key`, building it outside the lock on a miss.
    pub(crate) fn get_or_build(&self, key: MaskKey, build: impl FnOnce() -> Plane) -> Arc<Plane> {
        if let Some(mask) = self.state.lock().masks.get(&key) {
            return Arc::clone(mask);
        }
        let mask = Arc::new(build());
        if self.capacity == 0 {
            return mask;
        }
        let mut state = self.state.lock();
        if let Some(existing) = state.masks.get(&key) {
            return Arc::clone(existing);
        }
        while state.masks.len() >= self.capacity {
            let Some(oldest) = state.order.pop_front() else {
                break;
            };
            state.masks.remove(&oldest);
        }
        state.masks.insert(key, Arc::clone(&mask));
        state.order.push_back(key);
        mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plane(fill: f32) -> Plane {
        Plane {
            width: 2,
            height: 2,
            values: vec![fill; 4],
        }
    }

    #[test]
    fn identical_input_reuses_mask() {
        let cache = MaskCache::new(4);
        let key = MaskKey::new(PixelRect::new(0, 0, 2, 2), &plane(1.0), 2.0);
        let mut builds = 0;
        let first = cache.get_or_build(key, || {
            builds += 1;
            plane(5.0)
        });
        let second = cache.get_or_build(key, || {
            builds += 1;
            plane(6.0)
        });
        assert_eq!(builds, 1);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn changed_input_or_radius_misses() {
        let rect = PixelRect::new(0, 0, 2, 2);
        let base = MaskKey::new(rect, &plane(1.0), 2.0);
        assert_ne!(base, MaskKey::new(rect, &plane(2.0), 2.0));
        assert_ne!(base, MaskKey::new(rect, &plane(1.0), 3.0));
    }

    #[test]
    fn capacity_evicts_oldest_and_invalidate_clears() {
        let cache = MaskCache::new(2);
        for fill in 0..3 {
            let key = MaskKey::new(PixelRect::new(0, 0, 2, 2), &plane(fill as f32), 1.0);
            cache.get_or_build(key, || plane(0.0));
        }
        assert_eq!(cache.len(), 2);
        cache.invalidate_all();
        assert!(cache.is_empty());
    }
}
