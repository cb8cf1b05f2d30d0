//! Camera-driven tile scheduling.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::map::debug::{get_debug_flag, DebugFlag};
use crate::platform::Platform;
use crate::tile::cache::TileCache;
use crate::tile::grid::TileGrid;
use crate::tile::source::{SourceId, TileError, TileResult, TileSource};
use crate::tile::{Tile, TileId};
use crate::view::View;

const DEFAULT_RETAIN_FRAMES: u64 = 2;
const DEFAULT_PREFETCH_RADIUS: u32 = 1;

#[derive(Debug)]
enum EntryState {
    Loading,
    Ready(Arc<Tile>),
    Failed,
}

#[derive(Debug)]
struct TileEntry {
    state: EntryState,
    last_used_frame: u64,
}

struct TileSet {
    source: Arc<TileSource>,
    tiles: HashMap<TileId, TileEntry, ahash::RandomState>,
    client: bool,
}

impl TileSet {
    fn new(source: Arc<TileSource>, client: bool) -> Self {
        Self {
            source,
            tiles: HashMap::default(),
            client,
        }
    }

    fn loading_count(&self) -> usize {
        self.tiles
            .values()
            .filter(|entry| matches!(entry.state, EntryState::Loading))
            .count()
    }

    fn cancel_loading(&mut self) {
        for (tile, entry) in &self.tiles {
            if matches!(entry.state, EntryState::Loading) {
                self.source.cancel_tile(*tile);
            }
        }
    }
}

/// State of the tile sets after an update tick.
#[derive(Debug, Default, Clone, Copy)]
pub struct TilesUpdateState {
    pub tiles_loading: bool,
    pub tiles_changed: bool,
}

/// Maintains, for each tile source, the minimal set of decoded tiles covering the view, plus
/// proxies for tiles that are not ready yet and a prefetch ring around the viewport.
///
/// The manager is only driven from the scene thread; completed loads arrive through an internal
/// queue filled by worker threads.
pub struct TileManager {
    grid: TileGrid,
    cache: Arc<TileCache>,
    platform: Arc<dyn Platform>,
    tile_sets: HashMap<SourceId, TileSet, ahash::RandomState>,
    completed: Arc<Mutex<Vec<TileResult>>>,
    frame: u64,
    retain_frames: u64,
    prefetch_radius: u32,
}

impl TileManager {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self {
            grid: TileGrid::web(),
            cache: Arc::new(TileCache::default()),
            platform,
            tile_sets: HashMap::default(),
            completed: Arc::new(Mutex::new(Vec::new())),
            frame: 0,
            retain_frames: DEFAULT_RETAIN_FRAMES,
            prefetch_radius: DEFAULT_PREFETCH_RADIUS,
        }
    }

    pub fn cache(&self) -> &Arc<TileCache> {
        &self.cache
    }

    pub fn add_tile_source(&mut self, source: Arc<TileSource>) {
        self.tile_sets
            .entry(source.id())
            .or_insert_with(|| TileSet::new(source, false));
    }

    pub fn add_client_tile_source(&mut self, source: Arc<TileSource>) {
        self.tile_sets
            .entry(source.id())
            .or_insert_with(|| TileSet::new(source, true));
    }

    pub fn remove_client_tile_source(&mut self, id: SourceId) {
        let Some(mut set) = self.tile_sets.remove(&id) else {
            return;
        };
        if !set.client {
            log::error!("Tried to remove tile source {id} that is not a client source");
            self.tile_sets.insert(id, set);
            return;
        }

        set.cancel_loading();
        set.tiles.clear();
        self.cache.clear_source(id);
    }

    /// Drops the tracked tiles of the source but keeps the source registered.
    pub fn clear_tile_set(&mut self, id: SourceId) {
        if let Some(set) = self.tile_sets.get_mut(&id) {
            set.cancel_loading();
            set.tiles.clear();
            self.cache.clear_source(id);
        }
    }

    /// Cancels every outstanding tile request.
    pub fn cancel_loading(&mut self) {
        for set in self.tile_sets.values_mut() {
            set.cancel_loading();
        }
    }

    pub fn has_source(&self, id: SourceId) -> bool {
        self.tile_sets.contains_key(&id)
    }

    pub fn sources(&self) -> impl Iterator<Item = &Arc<TileSource>> {
        self.tile_sets.values().map(|set| &set.source)
    }

    /// Per-frame update: drains completed loads, recomputes the visible set, requests missing
    /// tiles, promotes proxies, prefetches around the viewport and sweeps stale entries.
    pub fn update(&mut self, view: &View) -> TilesUpdateState {
        if get_debug_flag(DebugFlag::FreezeTiles) {
            return TilesUpdateState {
                tiles_loading: self.tiles_loading(),
                tiles_changed: false,
            };
        }

        self.frame += 1;
        let mut state = TilesUpdateState::default();
        state.tiles_changed |= self.drain_completed();

        let ids: Vec<SourceId> = self.tile_sets.keys().copied().collect();
        for id in ids {
            let set_state = self.update_tile_set(id, view);
            state.tiles_loading |= set_state.tiles_loading;
            state.tiles_changed |= set_state.tiles_changed;
        }

        state
    }

    /// Requests the tiles that cover the view ahead of the next full update.
    pub fn prefetch_tiles(&mut self, view: &View) {
        let frame = self.frame;
        let cache = self.cache.clone();
        let grid = self.grid;

        let ids: Vec<SourceId> = self.tile_sets.keys().copied().collect();
        for id in ids {
            let Some(set) = self.tile_sets.get_mut(&id) else {
                continue;
            };

            let visible = grid.visible_tiles(view, set.source.max_zoom());
            let mut missing = Vec::new();
            for tile in visible {
                if set.tiles.contains_key(&tile) || cache.peek(&(id, tile)).is_some() {
                    continue;
                }

                set.tiles.insert(
                    tile,
                    TileEntry {
                        state: EntryState::Loading,
                        last_used_frame: frame,
                    },
                );
                missing.push(tile);
            }

            for tile in missing {
                self.request_tile(id, tile);
            }
        }
    }

    /// All ready tiles in draw order: lower zoom first so proxies render underneath.
    pub fn render_tiles(&self) -> Vec<Arc<Tile>> {
        let mut tiles: Vec<Arc<Tile>> = self
            .tile_sets
            .values()
            .flat_map(|set| set.tiles.values())
            .filter_map(|entry| match &entry.state {
                EntryState::Ready(tile) => Some(tile.clone()),
                _ => None,
            })
            .collect();

        tiles.sort_by_key(|tile| (tile.id(), tile.source()));
        tiles
    }

    pub fn tiles_loading(&self) -> bool {
        self.tile_sets.values().any(|set| set.loading_count() > 0)
    }

    fn drain_completed(&mut self) -> bool {
        let results: Vec<TileResult> = std::mem::take(&mut *self.completed.lock());
        let mut changed = false;

        for result in results {
            let Some(set) = self.tile_sets.get_mut(&result.source) else {
                continue;
            };

            match result.result {
                Ok(tile) => {
                    self.cache.put((result.source, result.tile), tile.clone());
                    if let Some(entry) = set.tiles.get_mut(&result.tile) {
                        if matches!(entry.state, EntryState::Loading) {
                            entry.state = EntryState::Ready(tile);
                            changed = true;
                        }
                    }
                }
                Err(TileError::Canceled) => {
                    // Cancellation already removed the entry in the usual case; a generation
                    // change can still leave one behind.
                    if let Some(entry) = set.tiles.get(&result.tile) {
                        if matches!(entry.state, EntryState::Loading) {
                            set.tiles.remove(&result.tile);
                        }
                    }
                }
                Err(err) => {
                    log::debug!("Failed to load tile {}: {err:?}", result.tile);
                    if let Some(entry) = set.tiles.get_mut(&result.tile) {
                        if matches!(entry.state, EntryState::Loading) {
                            entry.state = EntryState::Failed;
                        }
                    }
                }
            }
        }

        changed
    }

    fn update_tile_set(&mut self, id: SourceId, view: &View) -> TilesUpdateState {
        let mut state = TilesUpdateState::default();
        let frame = self.frame;
        let cache = self.cache.clone();
        let grid = self.grid;

        let Some(set) = self.tile_sets.get_mut(&id) else {
            return state;
        };

        let visible = grid.visible_tiles(view, set.source.max_zoom());
        let mut missing = Vec::new();
        let mut not_ready = Vec::new();

        for &tile in &visible {
            match set.tiles.get_mut(&tile) {
                Some(entry) => {
                    entry.last_used_frame = frame;
                    match &entry.state {
                        EntryState::Ready(ready) => {
                            ready.mark_used(frame);
                            // Promote in the LRU order.
                            cache.get(&(id, tile));
                        }
                        EntryState::Loading => {
                            state.tiles_loading = true;
                            not_ready.push(tile);
                        }
                        EntryState::Failed => not_ready.push(tile),
                    }
                }
                None => {
                    if let Some(cached) = cache.get(&(id, tile)) {
                        cached.mark_used(frame);
                        set.tiles.insert(
                            tile,
                            TileEntry {
                                state: EntryState::Ready(cached),
                                last_used_frame: frame,
                            },
                        );
                        state.tiles_changed = true;
                    } else {
                        not_ready.push(tile);
                        missing.push(tile);
                    }
                }
            }
        }

        let proxy_depth = set.source.proxy_depth();
        let max_zoom = set.source.max_zoom();
        for tile in not_ready {
            Self::attach_proxies(set, id, tile, frame, &cache, proxy_depth, max_zoom);
        }

        // Load priority: distance from the view center, then deeper zoom first.
        let center = view.position();
        let priority = |tile: &TileId| {
            let tile_center = grid.tile_bbox(*tile).center();
            (tile_center - center).norm_squared()
        };
        missing.sort_by(|a, b| {
            priority(a)
                .total_cmp(&priority(b))
                .then(b.z.cmp(&a.z))
        });

        for tile in &missing {
            set.tiles.insert(
                *tile,
                TileEntry {
                    state: EntryState::Loading,
                    last_used_frame: frame,
                },
            );
            state.tiles_loading = true;
        }

        // Visible requests are always issued; the prefetch ring honors the in-flight limit.
        for tile in missing {
            self.request_tile(id, tile);
        }

        self.prefetch_ring(id, view, &visible);

        let Some(set) = self.tile_sets.get_mut(&id) else {
            return state;
        };

        let retain_frames = self.retain_frames;
        let source = set.source.clone();
        let mut removed = false;
        set.tiles.retain(|tile, entry| {
            let unused = frame.saturating_sub(entry.last_used_frame);
            if unused < retain_frames {
                return true;
            }

            if matches!(entry.state, EntryState::Loading) {
                source.cancel_tile(*tile);
            }
            removed = true;
            false
        });
        state.tiles_changed |= removed;

        state
    }

    fn attach_proxies(
        set: &mut TileSet,
        id: SourceId,
        tile: TileId,
        frame: u64,
        cache: &TileCache,
        proxy_depth: u8,
        max_zoom: u8,
    ) {
        let mut current = tile;
        for _ in 0..proxy_depth {
            let Some(parent) = current.parent() else {
                break;
            };

            if let Some(cached) = cache.get(&(id, parent)) {
                cached.mark_used(frame);
                set.tiles
                    .entry(parent)
                    .or_insert_with(|| TileEntry {
                        state: EntryState::Ready(cached),
                        last_used_frame: frame,
                    })
                    .last_used_frame = frame;
                break;
            }

            current = parent;
        }

        if tile.z >= max_zoom {
            return;
        }

        for child in tile.children() {
            if let Some(cached) = cache.get(&(id, child)) {
                cached.mark_used(frame);
                set.tiles
                    .entry(child)
                    .or_insert_with(|| TileEntry {
                        state: EntryState::Ready(cached),
                        last_used_frame: frame,
                    })
                    .last_used_frame = frame;
            }
        }
    }

    fn prefetch_ring(&mut self, id: SourceId, view: &View, visible: &BTreeSet<TileId>) {
        if self.prefetch_radius == 0 {
            return;
        }

        let Some(set) = self.tile_sets.get_mut(&id) else {
            return;
        };

        let Some(bbox) = view.bbox() else {
            return;
        };
        let z = view.integer_zoom().min(set.source.max_zoom());
        let tile_span =
            crate::tile::grid::resolution_at_zoom(z as f64) * crate::tile::grid::TILE_SIZE as f64;
        let expanded = bbox.expand(tile_span * self.prefetch_radius as f64);

        let grid = self.grid;
        let center = view.position();
        let mut ring: Vec<TileId> = grid
            .tiles_in_rect(expanded, z)
            .into_iter()
            .filter(|tile| !visible.contains(tile))
            .collect();
        ring.sort_by(|a, b| {
            let da = (grid.tile_bbox(*a).center() - center).norm_squared();
            let db = (grid.tile_bbox(*b).center() - center).norm_squared();
            da.total_cmp(&db)
        });

        let max_in_flight = set.source.max_in_flight();
        let frame = self.frame;
        let mut to_request = Vec::new();
        let mut in_flight = set.loading_count();

        for tile in ring {
            match set.tiles.get_mut(&tile) {
                Some(entry) => {
                    // Keep in-flight prefetches alive while they stay in the ring.
                    if matches!(entry.state, EntryState::Loading) {
                        entry.last_used_frame = frame;
                    }
                }
                None => {
                    if in_flight >= max_in_flight {
                        continue;
                    }
                    if self.cache.peek(&(id, tile)).is_some() {
                        continue;
                    }

                    set.tiles.insert(
                        tile,
                        TileEntry {
                            state: EntryState::Loading,
                            last_used_frame: frame,
                        },
                    );
                    in_flight += 1;
                    to_request.push(tile);
                }
            }
        }

        for tile in to_request {
            self.request_tile(id, tile);
        }
    }

    fn request_tile(&self, id: SourceId, tile: TileId) {
        let Some(set) = self.tile_sets.get(&id) else {
            return;
        };

        let completed = self.completed.clone();
        let platform = self.platform.clone();
        set.source.load_tile(
            tile,
            Box::new(move |result| {
                completed.lock().push(result);
                platform.request_render();
            }),
        );
    }
}

impl Drop for TileManager {
    fn drop(&mut self) {
        self.cancel_loading();
    }
}

impl std::fmt::Debug for TileManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileManager")
            .field("sources", &self.tile_sets.len())
            .field("frame", &self.frame)
            .finish()
    }
}
