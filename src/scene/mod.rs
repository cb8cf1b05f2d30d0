//! Scene assembly and lifecycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_yaml::Value;

use crate::platform::Platform;
use crate::resource::ResourceUrl;
use crate::tile::manager::TileManager;
use crate::tile::source::{TileSource, TileSourceConfig};
use crate::tile::{Tile, TileBuilder};
use crate::util::worker::WorkerPool;
use crate::view::View;

pub mod importer;
pub mod label;
pub mod marker;
pub mod style;

pub use importer::{Document, Importer};
pub use label::LabelManager;
pub use marker::{MarkerBitmap, MarkerGeometry, MarkerId, MarkerManager};
pub use style::{build_styles, BlendMode, Style, StyleKind};

/// Monotonically increasing scene identifier. Callbacks carry it so clients can discard stale
/// results after rapid scene swaps.
pub type SceneId = u64;

const DEFAULT_DECODE_WORKERS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneErrorKind {
    DocumentParse,
    Fetch,
    Archive,
    SceneBuild,
}

/// An error collected while loading or building a scene. Delivered with the scene-ready
/// callback; never fatal for the map.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneError {
    pub url: Option<String>,
    pub kind: SceneErrorKind,
    pub message: String,
}

/// The request to load a scene. Immutable after construction.
#[derive(Debug, Clone)]
pub struct SceneOptions {
    /// Root document URL. Relative references in the root resolve against it.
    pub url: ResourceUrl,
    /// Inline text used as the root document instead of fetching `url`.
    pub yaml: Option<String>,
    /// Per-source URL overrides applied after the import completes.
    pub url_overrides: HashMap<String, String>,
    /// Pixel scale of the render target.
    pub pixel_scale: f64,
}

impl SceneOptions {
    pub fn new(url: ResourceUrl) -> Self {
        Self {
            url,
            yaml: None,
            url_overrides: HashMap::new(),
            pixel_scale: 1.0,
        }
    }

    pub fn with_yaml(mut self, yaml: impl Into<String>) -> Self {
        self.yaml = Some(yaml.into());
        self
    }
}

/// RGBA color in `0xRRGGBBAA` layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Color(pub u32);

impl Color {
    pub const WHITE: Color = Color(0xffffffff);
    pub const BLACK: Color = Color(0x000000ff);

    /// Parses `#rgb`, `#rrggbb`, `#rrggbbaa` and a few named colors.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        if let Some(hex) = input.strip_prefix('#') {
            return match hex.len() {
                3 => {
                    let value = u32::from_str_radix(hex, 16).ok()?;
                    let (r, g, b) = ((value >> 8) & 0xf, (value >> 4) & 0xf, value & 0xf);
                    Some(Color(
                        (r * 17) << 24 | (g * 17) << 16 | (b * 17) << 8 | 0xff,
                    ))
                }
                6 => Some(Color(u32::from_str_radix(hex, 16).ok()? << 8 | 0xff)),
                8 => Some(Color(u32::from_str_radix(hex, 16).ok()?)),
                _ => None,
            };
        }

        match input {
            "white" => Some(Self::WHITE),
            "black" => Some(Self::BLACK),
            "transparent" => Some(Color(0)),
            _ => None,
        }
    }

    pub fn rgba_f32(&self) -> [f32; 4] {
        [
            ((self.0 >> 24) & 0xff) as f32 / 255.0,
            ((self.0 >> 16) & 0xff) as f32 / 255.0,
            ((self.0 >> 8) & 0xff) as f32 / 255.0,
            (self.0 & 0xff) as f32 / 255.0,
        ]
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SceneUpdateState {
    pub tiles_loading: bool,
    pub animate_labels: bool,
    pub animate_markers: bool,
}

pub type PrefetchCallback = Box<dyn Fn(SceneId) + Send + Sync>;

/// Output of [`Scene::load`], applied on the main thread by [`Scene::complete_scene`].
struct PendingScene {
    config: Document,
    styles: Vec<Style>,
    sources: Vec<Arc<TileSource>>,
    background: Color,
}

/// The assembled, ready-to-render state of one stylesheet and its resources.
///
/// `load` runs on the scene worker; `complete_scene`, `update` and the managers are driven from
/// the main thread. Exactly one scene is current in the map; a second may transiently be held by
/// an in-flight async load task.
pub struct Scene {
    id: SceneId,
    options: SceneOptions,
    platform: Arc<dyn Platform>,
    importer: Arc<Importer>,
    decode_pool: Arc<WorkerPool>,
    builder: Arc<dyn TileBuilder>,
    canceled: AtomicBool,
    ready: AtomicBool,
    pending: Mutex<Option<PendingScene>>,
    config: Mutex<Document>,
    styles: Mutex<Vec<Style>>,
    tile_manager: Mutex<Option<TileManager>>,
    markers: Mutex<MarkerManager>,
    labels: Mutex<LabelManager>,
    errors: Mutex<Vec<SceneError>>,
    background: Mutex<Color>,
    prefetch_callback: Option<PrefetchCallback>,
}

impl Scene {
    pub fn new(
        platform: Arc<dyn Platform>,
        options: SceneOptions,
        builder: Arc<dyn TileBuilder>,
        prefetch_callback: Option<PrefetchCallback>,
    ) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);

        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            options,
            platform,
            importer: Arc::new(Importer::new()),
            decode_pool: Arc::new(WorkerPool::new(DEFAULT_DECODE_WORKERS, "meridian-decode")),
            builder,
            canceled: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            pending: Mutex::new(None),
            config: Mutex::new(Value::Null),
            styles: Mutex::new(Vec::new()),
            tile_manager: Mutex::new(None),
            markers: Mutex::new(MarkerManager::new()),
            labels: Mutex::new(LabelManager::new()),
            errors: Mutex::new(Vec::new()),
            background: Mutex::new(Color::WHITE),
            prefetch_callback,
        }
    }

    pub fn id(&self) -> SceneId {
        self.id
    }

    pub fn options(&self) -> &SceneOptions {
        &self.options
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    pub fn errors(&self) -> Vec<SceneError> {
        self.errors.lock().clone()
    }

    pub fn background(&self) -> Color {
        *self.background.lock()
    }

    pub fn styles(&self) -> Vec<Style> {
        self.styles.lock().clone()
    }

    /// Runs the importer and builds styles and tile sources. Blocks on outstanding fetches, so
    /// this belongs on the scene worker.
    pub fn load(&self) {
        let root = self.importer.load(
            &self.platform,
            &self.options.url,
            self.options.yaml.as_deref(),
        );

        let mut errors = self.importer.take_errors();

        if self.is_canceled() {
            self.errors.lock().append(&mut errors);
            return;
        }

        let mut config = root;
        if config.is_null() {
            errors.push(SceneError {
                url: Some(self.options.url.to_string()),
                kind: SceneErrorKind::SceneBuild,
                message: "root scene document failed to load".to_owned(),
            });
        }

        self.apply_url_overrides(&mut config);

        let (styles, style_errors) = build_styles(&config);
        errors.extend(style_errors);

        let mut sources = Vec::new();
        if let Some(sources_config) = config.get("sources").and_then(Value::as_mapping) {
            for (name, source_config) in sources_config {
                let Some(name) = name.as_str() else {
                    continue;
                };

                match TileSourceConfig::from_document(name, source_config) {
                    Ok(source_config) => sources.push(Arc::new(TileSource::new(
                        source_config,
                        self.platform.clone(),
                        self.decode_pool.clone(),
                        self.builder.clone(),
                    ))),
                    Err(error) => errors.push(error),
                }
            }
        }

        let background = config
            .get("scene")
            .and_then(|scene| scene.get("background"))
            .and_then(|background| background.get("color"))
            .and_then(Value::as_str)
            .and_then(|color| {
                let parsed = Color::parse(color);
                if parsed.is_none() {
                    log::warn!("Unknown background color '{color}'");
                }
                parsed
            })
            .unwrap_or(Color::WHITE);

        self.errors.lock().append(&mut errors);
        *self.pending.lock() = Some(PendingScene {
            config,
            styles,
            sources,
            background,
        });

        if let Some(callback) = &self.prefetch_callback {
            callback(self.id);
        }
    }

    fn apply_url_overrides(&self, config: &mut Document) {
        if self.options.url_overrides.is_empty() {
            return;
        }

        let Some(sources) = config.get_mut("sources") else {
            return;
        };

        for (name, url) in &self.options.url_overrides {
            match sources.get_mut(name.as_str()).and_then(|s| s.get_mut("url")) {
                Some(value) => *value = Value::String(url.clone()),
                None => log::warn!("Url override for unknown source '{name}'"),
            }
        }
    }

    /// Finishes the main-thread part of the scene build. Returns `true` once the scene is
    /// ready to be updated and rendered.
    pub fn complete_scene(&self, view: &View) -> bool {
        if self.is_ready() {
            return true;
        }

        let Some(pending) = self.pending.lock().take() else {
            return false;
        };

        let mut manager = TileManager::new(self.platform.clone());
        for source in &pending.sources {
            manager.add_tile_source(source.clone());
        }
        manager.prefetch_tiles(view);

        *self.config.lock() = pending.config;
        *self.styles.lock() = pending.styles;
        *self.background.lock() = pending.background;
        *self.tile_manager.lock() = Some(manager);
        self.ready.store(true, Ordering::Release);

        true
    }

    /// Per-frame tick of the scene's managers.
    pub fn update(&self, view: &View, dt: f32) -> SceneUpdateState {
        let mut state = SceneUpdateState::default();

        if let Some(manager) = self.tile_manager.lock().as_mut() {
            let tiles = manager.update(view);
            state.tiles_loading = tiles.tiles_loading;
            if tiles.tiles_changed {
                self.labels.lock().on_tiles_changed();
            }
        }

        state.animate_markers = self.markers.lock().update(dt);
        state.animate_labels = self.labels.lock().update(dt);

        state
    }

    /// Requests the tiles covering the view ahead of the first full update.
    pub fn prefetch_tiles(&self, view: &View) {
        if self.is_canceled() {
            return;
        }

        if let Some(manager) = self.tile_manager.lock().as_mut() {
            manager.prefetch_tiles(view);
        }
    }

    /// Flags the scene canceled and cancels all its outstanding work: the importer's URL
    /// requests and every in-flight tile request.
    pub fn cancel_tasks(&self) {
        self.canceled.store(true, Ordering::Release);
        self.importer.cancel(&*self.platform);

        if let Some(manager) = self.tile_manager.lock().as_mut() {
            manager.cancel_loading();
        }
    }

    /// Ready tiles in draw order for the renderer.
    pub fn render_tiles(&self) -> Vec<Arc<Tile>> {
        self.tile_manager
            .lock()
            .as_ref()
            .map(|manager| manager.render_tiles())
            .unwrap_or_default()
    }

    pub fn with_tile_manager<R>(&self, f: impl FnOnce(&mut TileManager) -> R) -> Option<R> {
        self.tile_manager.lock().as_mut().map(f)
    }

    pub fn with_markers<R>(&self, f: impl FnOnce(&mut MarkerManager) -> R) -> R {
        f(&mut self.markers.lock())
    }

    /// Merged configuration tree of the loaded scene.
    pub fn config(&self) -> Document {
        self.config.lock().clone()
    }
}

impl std::fmt::Debug for Scene {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scene")
            .field("id", &self.id)
            .field("url", &self.options.url.as_str())
            .field("ready", &self.is_ready())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_parsing() {
        assert_eq!(Color::parse("#ff0000"), Some(Color(0xff0000ff)));
        assert_eq!(Color::parse("#ff000080"), Some(Color(0xff000080)));
        assert_eq!(Color::parse("#f00"), Some(Color(0xff0000ff)));
        assert_eq!(Color::parse("white"), Some(Color::WHITE));
        assert_eq!(Color::parse("#zzz"), None);
        assert_eq!(Color::parse("chartreuse"), None);

        assert_eq!(Color(0x80402000).rgba_f32()[3], 0.0);
    }

    #[test]
    fn scene_ids_are_unique_and_increasing() {
        let platform: Arc<dyn Platform> = Arc::new(crate::tests::TestPlatform::new());
        let builder: Arc<dyn crate::tile::TileBuilder> = Arc::new(crate::tile::RawTileBuilder);
        let url = ResourceUrl::parse("https://example.com/scene.yaml").unwrap();

        let first = Scene::new(
            platform.clone(),
            SceneOptions::new(url.clone()),
            builder.clone(),
            None,
        );
        let second = Scene::new(platform, SceneOptions::new(url), builder, None);

        assert!(second.id() > first.id());
    }
}
