//! Per-layer tile fetching and decoding.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::MeridianError;
use crate::platform::{Platform, RequestError, RequestHandle};
use crate::resource::ResourceUrl;
use crate::scene::{SceneError, SceneErrorKind};
use crate::tile::{Tile, TileBuilder, TileId};
use crate::util::worker::WorkerPool;

pub type SourceId = i32;

const DEFAULT_MAX_ZOOM: u8 = 18;
const DEFAULT_PROXY_DEPTH: u8 = 1;
const DEFAULT_MAX_IN_FLIGHT: usize = 8;

/// Payload format of a tile source. The decoding itself is delegated to the [`TileBuilder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TileFormat {
    Mvt,
    GeoJson,
    TopoJson,
    Raster,
}

impl TileFormat {
    fn parse(input: &str) -> Option<Self> {
        match input {
            "MVT" => Some(Self::Mvt),
            "GeoJSON" => Some(Self::GeoJson),
            "TopoJSON" => Some(Self::TopoJson),
            "Raster" => Some(Self::Raster),
            _ => None,
        }
    }
}

/// Configuration of one tile source, parsed from the `sources` block of a scene document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileSourceConfig {
    pub name: String,
    pub format: TileFormat,
    pub url_template: String,
    #[serde(default)]
    pub url_params: HashMap<String, String>,
    pub max_zoom: u8,
    pub proxy_depth: u8,
    pub max_in_flight: usize,
}

impl TileSourceConfig {
    pub fn new(name: impl Into<String>, format: TileFormat, url_template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            format,
            url_template: url_template.into(),
            url_params: HashMap::new(),
            max_zoom: DEFAULT_MAX_ZOOM,
            proxy_depth: DEFAULT_PROXY_DEPTH,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }

    /// Parses a `sources.<name>` entry.
    pub fn from_document(name: &str, config: &serde_yaml::Value) -> Result<Self, SceneError> {
        let error = |message: String| SceneError {
            url: None,
            kind: SceneErrorKind::SceneBuild,
            message,
        };

        if !config.is_mapping() {
            return Err(error(format!("source '{name}' is not a map")));
        }

        let kind = config
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| error(format!("source '{name}' has no type")))?;
        let format = TileFormat::parse(kind)
            .ok_or_else(|| error(format!("source '{name}' has unknown type '{kind}'")))?;

        let url_template = config
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| error(format!("source '{name}' has no url")))?
            .to_owned();

        let mut url_params = HashMap::new();
        if let Some(params) = config.get("url_params").and_then(|v| v.as_mapping()) {
            for (key, value) in params {
                if let (Some(key), Some(value)) = (key.as_str(), value.as_str()) {
                    url_params.insert(key.to_owned(), value.to_owned());
                }
            }
        }

        let max_zoom = config
            .get("max_zoom")
            .and_then(|v| v.as_u64())
            .map(|z| z.min(u8::MAX as u64) as u8)
            .unwrap_or(DEFAULT_MAX_ZOOM);

        Ok(Self {
            name: name.to_owned(),
            format,
            url_template,
            url_params,
            max_zoom,
            proxy_depth: DEFAULT_PROXY_DEPTH,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        })
    }
}

/// Outcome of a tile load, delivered to the manager's completion queue.
#[derive(Debug)]
pub struct TileResult {
    pub source: SourceId,
    pub tile: TileId,
    pub result: Result<Arc<Tile>, TileError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TileError {
    Canceled,
    Fetch(String),
    Decode,
}

pub type TileCallback = Box<dyn FnOnce(TileResult) + Send + 'static>;

/// Fetches and decodes tiles of one logical layer.
///
/// At most one fetch per tile id is in flight at a time; the manager guarantees this by tracking
/// entry states, the source guarantees it by its in-flight map.
pub struct TileSource {
    id: SourceId,
    config: TileSourceConfig,
    platform: Arc<dyn Platform>,
    decode_pool: Arc<WorkerPool>,
    builder: Arc<dyn TileBuilder>,
    in_flight: Mutex<HashMap<TileId, RequestHandle>>,
    generation: AtomicU64,
}

impl TileSource {
    pub fn new(
        config: TileSourceConfig,
        platform: Arc<dyn Platform>,
        decode_pool: Arc<WorkerPool>,
        builder: Arc<dyn TileBuilder>,
    ) -> Self {
        static NEXT_ID: AtomicI32 = AtomicI32::new(1);

        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            config,
            platform,
            decode_pool,
            builder,
            in_flight: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> SourceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn max_zoom(&self) -> u8 {
        self.config.max_zoom
    }

    pub fn proxy_depth(&self) -> u8 {
        self.config.proxy_depth
    }

    pub fn max_in_flight(&self) -> usize {
        self.config.max_in_flight
    }

    /// Resolves the URL template for the tile.
    pub fn tile_url(&self, tile: TileId) -> Result<ResourceUrl, MeridianError> {
        let mut url = self
            .config
            .url_template
            .replace("{z}", &tile.z.to_string())
            .replace("{x}", &tile.x.to_string())
            .replace("{y}", &tile.y.to_string());

        for (token, value) in &self.config.url_params {
            url = url.replace(&format!("{{{token}}}"), value);
        }

        ResourceUrl::parse(&url)
    }

    /// Starts loading the tile: resolves the URL, fetches it through the platform and decodes the
    /// payload on the decode pool. The callback fires exactly once, on an arbitrary thread.
    pub fn load_tile(self: &Arc<Self>, tile: TileId, callback: TileCallback) {
        let url = match self.tile_url(tile) {
            Ok(url) => url,
            Err(err) => {
                callback(TileResult {
                    source: self.id,
                    tile,
                    result: Err(TileError::Fetch(err.to_string())),
                });
                return;
            }
        };

        log::trace!("Loading tile {tile} from url {url}");

        // Reserve the in-flight slot before starting the request so that an inline callback can
        // find it. A tile that is already in flight is never fetched twice.
        {
            let mut in_flight = self.in_flight.lock();
            if in_flight.contains_key(&tile) {
                log::trace!("Tile {tile} is already being loaded");
                return;
            }
            in_flight.insert(tile, RequestHandle(0));
        }

        let this = self.clone();
        let generation = self.generation.load(Ordering::Acquire);
        let handle = self.platform.start_url_request(
            &url,
            Box::new(move |response| this.on_response(tile, generation, response, callback)),
        );

        let mut in_flight = self.in_flight.lock();
        if let Some(entry) = in_flight.get_mut(&tile) {
            *entry = handle;
        }
    }

    /// Cancels the outstanding fetch for the tile, if any.
    pub fn cancel_tile(&self, tile: TileId) {
        if let Some(handle) = self.in_flight.lock().remove(&tile) {
            self.platform.cancel_url_request(handle);
        }
    }

    /// Drops source-side bookkeeping; responses of requests started before the call are
    /// discarded as canceled.
    pub fn clear_data(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    fn on_response(
        self: Arc<Self>,
        tile: TileId,
        generation: u64,
        response: Result<bytes::Bytes, RequestError>,
        callback: TileCallback,
    ) {
        self.in_flight.lock().remove(&tile);

        let source = self.id;
        let bytes = match response {
            Ok(bytes) => bytes,
            Err(RequestError::Canceled) | Err(RequestError::ShutDown) => {
                callback(TileResult {
                    source,
                    tile,
                    result: Err(TileError::Canceled),
                });
                return;
            }
            Err(err) => {
                log::debug!("Failed to load tile {tile}: {err}");
                callback(TileResult {
                    source,
                    tile,
                    result: Err(TileError::Fetch(err.to_string())),
                });
                return;
            }
        };

        let this = self.clone();
        self.decode_pool.enqueue(move || {
            if this.generation.load(Ordering::Acquire) != generation {
                callback(TileResult {
                    source,
                    tile,
                    result: Err(TileError::Canceled),
                });
                return;
            }

            let result = match this
                .builder
                .build(source, tile, this.config.format, bytes)
            {
                Ok(geometry) => Ok(Arc::new(Tile::new(source, tile, geometry))),
                Err(err) => {
                    log::debug!("Failed to decode tile {tile}: {err}");
                    Err(TileError::Decode)
                }
            };

            callback(TileResult {
                source,
                tile,
                result,
            });
        });
    }
}

impl std::fmt::Debug for TileSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileSource")
            .field("id", &self.id)
            .field("name", &self.config.name)
            .field("url_template", &self.config.url_template)
            .finish()
    }
}
