//! Shared cache of decoded tiles with count and byte-footprint caps.

use std::sync::Arc;

use parking_lot::Mutex;
use quick_cache::{unsync::Cache, DefaultHashBuilder, Lifecycle, Weighter};

use crate::tile::{SourceId, Tile, TileId};

pub type TileKey = (SourceId, TileId);

const DEFAULT_BYTE_CAPACITY: u64 = 64_000_000;
const DEFAULT_TILE_CAPACITY: u64 = 512;

/// Weighs tiles by their byte footprint.
///
/// The floor weight makes the byte cap double as a tile-count cap: no more than
/// `byte_capacity / floor` entries fit regardless of their size.
#[derive(Debug, Clone)]
struct TileWeighter {
    floor: u32,
}

impl Weighter<TileKey, Arc<Tile>> for TileWeighter {
    fn weight(&self, _key: &TileKey, tile: &Arc<Tile>) -> u64 {
        (tile.memory_usage() as u64).min(u32::MAX as u64).max(self.floor as u64)
    }
}

/// Keeps tiles referenced outside the cache from being evicted.
#[derive(Debug, Clone)]
struct TileLifecycle;

impl Lifecycle<TileKey, Arc<Tile>> for TileLifecycle {
    type RequestState = ();

    fn begin_request(&self) -> Self::RequestState {}

    fn is_pinned(&self, _key: &TileKey, tile: &Arc<Tile>) -> bool {
        Arc::strong_count(tile) > 1
    }

    fn on_evict(&self, _state: &mut Self::RequestState, key: TileKey, _tile: Arc<Tile>) {
        log::trace!("Tile {}/{} evicted from cache", key.0, key.1);
    }
}

type InnerCache = Cache<TileKey, Arc<Tile>, TileWeighter, DefaultHashBuilder, TileLifecycle>;

/// LRU cache of decoded tiles keyed by `(source id, tile id)`.
///
/// Tiles held by an outside owner (the active tile sets) are pinned and survive eviction, so the
/// configured caps hold for unpinned tiles only.
pub struct TileCache {
    cache: Mutex<InnerCache>,
}

impl TileCache {
    pub fn new(tile_capacity: u64, byte_capacity: u64) -> Self {
        let tile_capacity = tile_capacity.max(1);
        let floor = (byte_capacity / tile_capacity).clamp(1, u32::MAX as u64) as u32;

        Self {
            cache: Mutex::new(Cache::with(
                tile_capacity as usize,
                byte_capacity,
                TileWeighter { floor },
                DefaultHashBuilder::default(),
                TileLifecycle,
            )),
        }
    }

    pub fn get(&self, key: &TileKey) -> Option<Arc<Tile>> {
        self.cache.lock().get(key).cloned()
    }

    /// Checks for the tile without promoting it in the LRU order.
    pub fn peek(&self, key: &TileKey) -> Option<Arc<Tile>> {
        self.cache.lock().peek(key).cloned()
    }

    pub fn put(&self, key: TileKey, tile: Arc<Tile>) {
        self.cache.lock().insert(key, tile);
    }

    pub fn remove(&self, key: &TileKey) -> Option<Arc<Tile>> {
        self.cache.lock().remove(key).map(|(_, tile)| tile)
    }

    /// Drops every entry, pinned or not.
    pub fn clear(&self) {
        self.cache.lock().clear();
    }

    /// Drops the entries no outside owner holds a reference to.
    pub fn clear_unpinned(&self) {
        let mut cache = self.cache.lock();

        let mut unpinned = Vec::new();
        for (key, tile) in cache.iter() {
            if Arc::strong_count(tile) == 1 {
                unpinned.push(*key);
            }
        }

        for key in unpinned {
            cache.remove(&key);
        }
    }

    /// Drops all entries that belong to the source.
    pub fn clear_source(&self, source: SourceId) {
        let mut cache = self.cache.lock();

        let mut keys = Vec::new();
        for (key, _) in cache.iter() {
            if key.0 == source {
                keys.push(*key);
            }
        }

        for key in keys {
            cache.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total weight of the cached tiles in bytes (floored per entry).
    pub fn weight(&self) -> u64 {
        self.cache.lock().weight()
    }
}

impl std::fmt::Debug for TileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileCache")
            .field("len", &self.len())
            .field("weight", &self.weight())
            .finish()
    }
}

impl Default for TileCache {
    fn default() -> Self {
        Self::new(DEFAULT_TILE_CAPACITY, DEFAULT_BYTE_CAPACITY)
    }
}
