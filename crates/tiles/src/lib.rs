use std::collections::{BTreeMap, HashMap};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tile_protocol::{Epoch, ImageId, TileBuffer, TileCoordinate};
use tracing::{debug, trace};

pub const DEFAULT_CAPACITY_BYTES: usize = 256 * 1024 * 1024;
pub const DEFAULT_SHARDS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileKey {
    pub image: ImageId,
    pub epoch: Epoch,
    pub coord: TileCoordinate,
}

impl TileKey {
    pub fn new(image: ImageId, epoch: Epoch, coord: TileCoordinate) -> Self {
        Self {
            image,
            epoch,
            coord,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TileStoreConfig {
    pub capacity_bytes: usize,
    pub shards: usize,
}

impl Default for TileStoreConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: DEFAULT_CAPACITY_BYTES,
            shards: DEFAULT_SHARDS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("tile of {bytes} bytes exceeds the per-shard budget of {budget} bytes")]
pub struct CapacityError {
    pub bytes: usize,
    pub budget: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TileStoreStats {
    pub entries: usize,
    pub bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub rejected: u64,
}

#[derive(Debug)]
struct Entry {
    buffer: TileBuffer,
    last_access: u64,
}

/// One slice of the index with exact LRU ordering inside the slice.
#[derive(Debug, Default)]
struct Shard {
    entries: HashMap<TileKey, Entry>,
    recency: BTreeMap<u64, TileKey>,
    bytes: usize,
}

impl Shard {
    fn get(&mut self, key: &TileKey, tick: u64) -> Option<TileBuffer> {
        let entry = self.entries.get_mut(key)?;
        let previous = std::mem::replace(&mut entry.last_access, tick);
        self.recency.remove(&previous);
        self.recency.insert(tick, *key);
        Some(entry.buffer.clone())
    }

    fn remove(&mut self, key: &TileKey) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.last_access);
        self.bytes -= entry.buffer.byte_len();
        Some(entry)
    }

    /// Inserts and returns how many older entries were evicted to make room.
    fn insert(&mut self, key: TileKey, buffer: TileBuffer, tick: u64, budget: usize) -> u64 {
        self.remove(&key);
        let incoming = buffer.byte_len();
        let mut evicted = 0;
        while self.bytes + incoming > budget {
            let Some((_, oldest)) = self.recency.pop_first() else {
                break;
            };
            let entry = self
                .entries
                .remove(&oldest)
                .expect("recency index points to missing tile entry");
            self.bytes -= entry.buffer.byte_len();
            evicted += 1;
        }
        self.bytes += incoming;
        self.recency.insert(tick, key);
        self.entries.insert(
            key,
            Entry {
                buffer,
                last_access: tick,
            },
        );
        evicted
    }

    fn retain(&mut self, mut keep: impl FnMut(&TileKey) -> bool) -> u64 {
        let doomed: Vec<TileKey> = self
            .entries
            .keys()
            .filter(|key| !keep(key))
            .copied()
            .collect();
        for key in &doomed {
            self.remove(key);
        }
        doomed.len() as u64
    }
}

/// Bounded, shared cache of computed tiles.
///
/// Entries are keyed by `(image, epoch, coord)`. Epoch bumps evict eagerly
/// through [`TileStore::evict_superseded`], which also raises a per-image
/// floor so that late results of a superseded epoch are rejected by `put`
/// instead of being stored. Nothing here is a correctness dependency: any
/// entry may disappear at any time and callers recompute on a miss.
#[derive(Debug)]
pub struct TileStore {
    shards: Box<[Mutex<Shard>]>,
    shard_budget: usize,
    epoch_floors: Mutex<HashMap<ImageId, Epoch>>,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    rejected: AtomicU64,
}

impl Default for TileStore {
    fn default() -> Self {
        Self::new(TileStoreConfig::default())
    }
}

impl TileStore {
    pub fn new(config: TileStoreConfig) -> Self {
        assert!(config.shards > 0, "tile store needs at least one shard");
        Self {
            shards: (0..config.shards).map(|_| Mutex::default()).collect(),
            shard_budget: config.capacity_bytes / config.shards,
            epoch_floors: Mutex::new(HashMap::new()),
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &TileKey) -> Option<TileBuffer> {
        let tick = self.tick();
        let found = self.shard(key).lock().get(key, tick);
        let counter = if found.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    pub fn contains(&self, key: &TileKey) -> bool {
        self.shard(key).lock().entries.contains_key(key)
    }

    /// Stores `buffer`, evicting least recently used tiles of the same shard
    /// when over budget. Writes below the image's epoch floor are dropped.
    pub fn put(&self, key: TileKey, buffer: TileBuffer) -> Result<(), CapacityError> {
        let bytes = buffer.byte_len();
        if bytes > self.shard_budget {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(CapacityError {
                bytes,
                budget: self.shard_budget,
            });
        }
        let tick = self.tick();
        let mut shard = self.shard(&key).lock();
        // Floor is read under the shard lock so a concurrent sweep either
        // sees this entry or this write sees the raised floor.
        if self.is_below_floor(&key) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            trace!(coord = %key.coord, epoch = %key.epoch, "dropping superseded tile write");
            return Ok(());
        }
        let evicted = shard.insert(key, buffer, tick, self.shard_budget);
        drop(shard);
        if evicted > 0 {
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
            debug!(evicted, "tile store evicted under memory pressure");
        }
        Ok(())
    }

    /// Drops every cached tile of `image`, all epochs included.
    pub fn evict_all(&self, image: ImageId) -> u64 {
        let evicted = self.sweep(|key| key.image != image);
        self.evictions.fetch_add(evicted, Ordering::Relaxed);
        evicted
    }

    /// Drops tiles of `image` older than `current` and rejects later writes
    /// for those epochs.
    pub fn evict_superseded(&self, image: ImageId, current: Epoch) -> u64 {
        {
            let mut floors = self.epoch_floors.lock();
            let floor = floors.entry(image).or_default();
            *floor = (*floor).max(current);
        }
        let evicted = self.sweep(|key| key.image != image || key.epoch >= current);
        self.evictions.fetch_add(evicted, Ordering::Relaxed);
        evicted
    }

    /// Releases all memory held for a disposed image.
    ///
    /// Image ids are never reused, so the image stays tombstoned and any
    /// in-flight write for it is rejected.
    pub fn remove_tiles(&self, image: ImageId) -> u64 {
        self.epoch_floors.lock().insert(image, Epoch(u64::MAX));
        let removed = self.sweep(|key| key.image != image);
        debug!(removed, "released tiles of disposed image");
        removed
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> TileStoreStats {
        let (entries, bytes) = self.shards.iter().fold((0, 0), |(entries, bytes), shard| {
            let shard = shard.lock();
            (entries + shard.entries.len(), bytes + shard.bytes)
        });
        TileStoreStats {
            entries,
            bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    fn is_below_floor(&self, key: &TileKey) -> bool {
        self.epoch_floors
            .lock()
            .get(&key.image)
            .is_some_and(|floor| key.epoch < *floor)
    }

    fn sweep(&self, mut keep: impl FnMut(&TileKey) -> bool) -> u64 {
        self.shards
            .iter()
            .map(|shard| shard.lock().retain(&mut keep))
            .sum()
    }

    fn shard(&self, key: &TileKey) -> &Mutex<Shard> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() % self.shards.len() as u64) as usize;
        &self.shards[index]
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }
}
