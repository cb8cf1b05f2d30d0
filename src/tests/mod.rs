//! Test doubles and end-to-end scenarios for the scene and tile pipeline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::cartesian::{Point2, Size};
use crate::map::{Map, MapState};
use crate::platform::{Platform, RequestError, RequestHandle, UrlCallback, UrlResponse};
use crate::resource::ResourceUrl;
use crate::scene::{Importer, Scene, SceneErrorKind, SceneOptions};
use crate::tile::manager::TileManager;
use crate::tile::{RawTileBuilder, Tile, TileFormat, TileGeometry, TileId, TileSource, TileSourceConfig};
use crate::util::worker::WorkerPool;
use crate::view::View;

/// Serves canned responses. In the default mode callbacks fire inline from
/// `start_url_request`; in manual mode they are held until [`TestPlatform::deliver_all`].
pub struct TestPlatform {
    responses: Mutex<HashMap<String, Result<Bytes, RequestError>>>,
    started: Mutex<Vec<String>>,
    pending: Mutex<HashMap<u64, (String, UrlCallback)>>,
    next_handle: AtomicU64,
    manual: bool,
    shut_down: AtomicBool,
    render_requests: AtomicUsize,
    continuous: AtomicBool,
}

impl TestPlatform {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            started: Mutex::new(Vec::new()),
            pending: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            manual: false,
            shut_down: AtomicBool::new(false),
            render_requests: AtomicUsize::new(0),
            continuous: AtomicBool::new(false),
        }
    }

    pub fn manual() -> Self {
        Self {
            manual: true,
            ..Self::new()
        }
    }

    pub fn add_response(&self, url: &str, bytes: impl Into<Bytes>) {
        self.responses
            .lock()
            .insert(url.to_owned(), Ok(bytes.into()));
    }

    pub fn add_error(&self, url: &str, error: RequestError) {
        self.responses.lock().insert(url.to_owned(), Err(error));
    }

    /// Urls of all requests started so far.
    pub fn started_requests(&self) -> Vec<String> {
        self.started.lock().clone()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Delivers every held response (manual mode).
    pub fn deliver_all(&self) {
        let pending: Vec<(String, UrlCallback)> = {
            let mut held = self.pending.lock();
            held.drain().map(|(_, request)| request).collect()
        };

        for (url, callback) in pending {
            callback(self.response_for(&url));
        }
    }

    pub fn render_requests(&self) -> usize {
        self.render_requests.load(Ordering::Relaxed)
    }

    fn response_for(&self, url: &str) -> UrlResponse {
        self.responses
            .lock()
            .get(url)
            .cloned()
            .unwrap_or(Err(RequestError::NotFound))
    }
}

impl Default for TestPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for TestPlatform {
    fn start_url_request(&self, url: &ResourceUrl, callback: UrlCallback) -> RequestHandle {
        if self.shut_down.load(Ordering::Acquire) {
            callback(Err(RequestError::ShutDown));
            return RequestHandle(0);
        }

        let url = url.to_string();
        self.started.lock().push(url.clone());

        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        if self.manual {
            self.pending.lock().insert(id, (url, callback));
        } else {
            callback(self.response_for(&url));
        }

        RequestHandle(id)
    }

    fn cancel_url_request(&self, handle: RequestHandle) {
        if let Some((_, callback)) = self.pending.lock().remove(&handle.0) {
            callback(Err(RequestError::Canceled));
        }
    }

    fn request_render(&self) {
        self.render_requests.fetch_add(1, Ordering::Relaxed);
    }

    fn set_continuous_rendering(&self, enabled: bool) {
        self.continuous.store(enabled, Ordering::Relaxed);
    }

    fn is_continuous_rendering(&self) -> bool {
        self.continuous.load(Ordering::Relaxed)
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);

        let pending: Vec<(String, UrlCallback)> = {
            let mut held = self.pending.lock();
            held.drain().map(|(_, request)| request).collect()
        };
        for (_, callback) in pending {
            callback(Err(RequestError::Canceled));
        }
    }
}

/// Builds an in-memory zip archive from `(path, content)` pairs.
pub(crate) fn build_archive(files: &[(&str, &[u8])]) -> Bytes {
    use std::io::Write;

    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (path, content) in files {
        writer
            .start_file(*path, zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(content).unwrap();
    }

    writer.finish().unwrap().into_inner().into()
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }

    condition()
}

fn url(input: &str) -> ResourceUrl {
    ResourceUrl::parse(input).unwrap()
}

fn load(platform: &Arc<dyn Platform>, root: &str) -> serde_yaml::Value {
    let importer = Arc::new(Importer::new());
    importer.load(platform, &url(root), None)
}

mod importer_scenarios {
    use super::*;

    #[test]
    fn linear_import_chain() {
        let platform = TestPlatform::new();
        platform.add_response(
            "https://example.com/root.yaml",
            "import: a.yaml\nname: root\nlayers: { water: { order: 1 } }",
        );
        platform.add_response(
            "https://example.com/a.yaml",
            "import: b.yaml\nname: a\nlayers: { roads: { order: 2 } }",
        );
        platform.add_response(
            "https://example.com/b.yaml",
            "name: b\nonly_in_b: true\nlayers: { water: { order: 9, color: blue } }",
        );

        let platform: Arc<dyn Platform> = Arc::new(platform);
        let root = load(&platform, "https://example.com/root.yaml");

        // Merge order is [b, a, root]: later documents override scalars, maps merge.
        assert_eq!(root.get("name").and_then(|v| v.as_str()), Some("root"));
        assert_eq!(root.get("only_in_b").and_then(|v| v.as_bool()), Some(true));

        let water = root.get("layers").and_then(|l| l.get("water")).unwrap();
        assert_eq!(water.get("order").and_then(|v| v.as_i64()), Some(1));
        assert_eq!(water.get("color").and_then(|v| v.as_str()), Some("blue"));

        let roads = root.get("layers").and_then(|l| l.get("roads")).unwrap();
        assert_eq!(roads.get("order").and_then(|v| v.as_i64()), Some(2));

        assert!(root.get("import").is_none());
    }

    #[test]
    fn diamond_import_fetches_and_merges_once() {
        let test_platform = Arc::new(TestPlatform::new());
        test_platform.add_response(
            "https://example.com/root.yaml",
            "import: [a.yaml, b.yaml]",
        );
        test_platform.add_response("https://example.com/a.yaml", "import: c.yaml\nfrom_a: 1");
        test_platform.add_response("https://example.com/b.yaml", "import: c.yaml\nfrom_b: 2");
        test_platform.add_response("https://example.com/c.yaml", "only_in_c: 3");

        let platform: Arc<dyn Platform> = test_platform.clone();
        let root = load(&platform, "https://example.com/root.yaml");

        assert_eq!(root.get("from_a").and_then(|v| v.as_i64()), Some(1));
        assert_eq!(root.get("from_b").and_then(|v| v.as_i64()), Some(2));
        assert_eq!(root.get("only_in_c").and_then(|v| v.as_i64()), Some(3));

        let c_fetches = test_platform
            .started_requests()
            .iter()
            .filter(|u| u.ends_with("c.yaml"))
            .count();
        assert_eq!(c_fetches, 1, "diamond import must fetch C exactly once");
    }

    #[test]
    fn import_cycle_terminates() {
        let platform = TestPlatform::new();
        platform.add_response(
            "https://example.com/root.yaml",
            "import: a.yaml\nname: root",
        );
        platform.add_response(
            "https://example.com/a.yaml",
            "import: root.yaml\nfrom_a: true",
        );

        let platform: Arc<dyn Platform> = Arc::new(platform);
        let root = load(&platform, "https://example.com/root.yaml");

        assert_eq!(root.get("name").and_then(|v| v.as_str()), Some("root"));
        assert_eq!(root.get("from_a").and_then(|v| v.as_bool()), Some(true));
    }

    #[test]
    fn self_import_terminates() {
        let platform = TestPlatform::new();
        platform.add_response("https://example.com/self.yaml", "import: self.yaml");

        let platform: Arc<dyn Platform> = Arc::new(platform);
        let root = load(&platform, "https://example.com/self.yaml");

        // The tree equals the parsed document minus `import`.
        assert!(root.is_mapping());
        assert_eq!(root.as_mapping().unwrap().len(), 0);
    }

    #[test]
    fn failed_import_is_skipped_with_error() {
        let platform = TestPlatform::new();
        platform.add_response(
            "https://example.com/root.yaml",
            "import: [missing.yaml, broken.yaml]\nname: root",
        );
        platform.add_error(
            "https://example.com/missing.yaml",
            RequestError::Network("connection refused".to_owned()),
        );
        platform.add_response("https://example.com/broken.yaml", "styles: [unclosed");

        let platform: Arc<dyn Platform> = Arc::new(platform);
        let importer = Arc::new(Importer::new());
        let root = importer.load(&platform, &url("https://example.com/root.yaml"), None);

        assert_eq!(root.get("name").and_then(|v| v.as_str()), Some("root"));

        let errors = importer.take_errors();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.kind == SceneErrorKind::Fetch));
        assert!(errors
            .iter()
            .any(|e| e.kind == SceneErrorKind::DocumentParse));
    }

    #[test]
    fn inline_document_is_used_as_root() {
        let platform = TestPlatform::new();
        platform.add_response("https://example.com/a.yaml", "from_a: 1");

        let platform: Arc<dyn Platform> = Arc::new(platform);
        let importer = Arc::new(Importer::new());
        let root = importer.load(
            &platform,
            &url("https://example.com/root.yaml"),
            Some("import: a.yaml\ninline: true"),
        );

        assert_eq!(root.get("inline").and_then(|v| v.as_bool()), Some(true));
        assert_eq!(root.get("from_a").and_then(|v| v.as_i64()), Some(1));
    }

    #[test]
    fn texture_name_is_kept_and_url_is_rewritten() {
        let platform = TestPlatform::new();
        platform.add_response(
            "https://example.com/scenes/root.yaml",
            r#"
            textures:
                pois: { url: "images/pois.png" }
            styles:
                named: { texture: pois }
                pathed: { texture: "icons.png" }
            "#,
        );

        let platform: Arc<dyn Platform> = Arc::new(platform);
        let root = load(&platform, "https://example.com/scenes/root.yaml");

        let styles = root.get("styles").unwrap();
        // A scalar naming an entry of the merged `textures` map stays a named reference.
        assert_eq!(
            styles.get("named").and_then(|s| s.get("texture")).and_then(|v| v.as_str()),
            Some("pois")
        );
        // Any other scalar resolves as a URL against the document it came from.
        assert_eq!(
            styles.get("pathed").and_then(|s| s.get("texture")).and_then(|v| v.as_str()),
            Some("https://example.com/scenes/icons.png")
        );
        // The texture definition's own URL resolves too.
        assert_eq!(
            root.get("textures")
                .and_then(|t| t.get("pois"))
                .and_then(|p| p.get("url"))
                .and_then(|v| v.as_str()),
            Some("https://example.com/scenes/images/pois.png")
        );
    }

    #[test]
    fn texture_rewrite_uses_the_declaring_document() {
        let platform = TestPlatform::new();
        platform.add_response(
            "https://example.com/scenes/root.yaml",
            "import: sub/imported.yaml",
        );
        platform.add_response(
            "https://example.com/scenes/sub/imported.yaml",
            "styles: { s: { texture: tex.png } }",
        );

        let platform: Arc<dyn Platform> = Arc::new(platform);
        let root = load(&platform, "https://example.com/scenes/root.yaml");

        assert_eq!(
            root.get("styles")
                .and_then(|s| s.get("s"))
                .and_then(|s| s.get("texture"))
                .and_then(|v| v.as_str()),
            Some("https://example.com/scenes/sub/tex.png")
        );
    }

    #[test]
    fn source_urls_resolve_against_their_document() {
        let platform = TestPlatform::new();
        platform.add_response(
            "https://example.com/scenes/root.yaml",
            r#"
            sources:
                osm: { type: MVT, url: "tiles/{z}/{x}/{y}.mvt" }
            "#,
        );

        let platform: Arc<dyn Platform> = Arc::new(platform);
        let root = load(&platform, "https://example.com/scenes/root.yaml");

        assert_eq!(
            root.get("sources")
                .and_then(|s| s.get("osm"))
                .and_then(|s| s.get("url"))
                .and_then(|v| v.as_str()),
            Some("https://example.com/scenes/tiles/{z}/{x}/{y}.mvt")
        );
    }

    #[test]
    fn zip_archive_scene() {
        let archive_bytes = super::build_archive(&[
            (
                "base.yaml",
                b"import: extra.yaml\nstyles: { s: { texture: \"img/x.png\" } }" as &[u8],
            ),
            ("extra.yaml", b"from_extra: 7"),
            ("img/x.png", b"\x89PNG"),
        ]);

        let platform = TestPlatform::new();
        platform.add_response("https://example.com/bundle.zip", archive_bytes);

        let platform: Arc<dyn Platform> = Arc::new(platform);
        let archive_url = url("https://example.com/bundle.zip");
        let root = load(&platform, "https://example.com/bundle.zip");

        // The base document and the entry it imports are both merged.
        assert_eq!(root.get("from_extra").and_then(|v| v.as_i64()), Some(7));

        // The texture reference resolves to a zip-scheme URL with the entry path.
        let texture = root
            .get("styles")
            .and_then(|s| s.get("s"))
            .and_then(|s| s.get("texture"))
            .and_then(|v| v.as_str())
            .unwrap();
        let texture_url = url(texture);
        assert_eq!(texture_url.scheme(), "zip");
        assert_eq!(texture_url.entry_path(), "img/x.png");
        assert_eq!(texture_url.archive_url().unwrap(), archive_url);
    }

    #[test]
    fn cancel_returns_empty_tree() {
        let test_platform = Arc::new(TestPlatform::manual());
        let platform: Arc<dyn Platform> = test_platform.clone();
        let importer = Arc::new(Importer::new());

        let load_importer = importer.clone();
        let load_platform = platform.clone();
        let handle = std::thread::spawn(move || {
            load_importer.load(&load_platform, &url("https://example.com/root.yaml"), None)
        });

        assert!(wait_until(Duration::from_secs(2), || {
            test_platform.pending_count() > 0
        }));

        importer.cancel(&*platform);
        let root = handle.join().unwrap();
        assert!(root.is_null());
    }
}

mod tile_pipeline {
    use super::*;

    fn world_view(zoom: f64) -> View {
        let resolution = crate::tile::grid::resolution_at_zoom(zoom);
        let extent = crate::geo::EARTH_HALF_CIRCUMFERENCE * 2.0;
        View::new(Point2::new(0.0, 0.0), zoom).with_size(Size::new(
            extent / resolution,
            extent / resolution,
        ))
    }

    fn test_source(
        platform: &Arc<dyn Platform>,
        pool: &Arc<WorkerPool>,
        max_zoom: u8,
    ) -> Arc<TileSource> {
        let mut config = TileSourceConfig::new(
            "test",
            TileFormat::GeoJson,
            "https://tiles.example.com/{z}/{x}/{y}.json",
        );
        config.max_zoom = max_zoom;

        Arc::new(TileSource::new(
            config,
            platform.clone(),
            pool.clone(),
            Arc::new(RawTileBuilder),
        ))
    }

    fn serve_world_tiles(platform: &TestPlatform, z: u8) {
        let n = 1 << z;
        for x in 0..n {
            for y in 0..n {
                platform.add_response(
                    &format!("https://tiles.example.com/{z}/{x}/{y}.json"),
                    r#"{"type":"FeatureCollection","features":[]}"#,
                );
            }
        }
    }

    #[test]
    fn visible_tiles_load_and_become_ready() {
        let test_platform = Arc::new(TestPlatform::new());
        serve_world_tiles(&test_platform, 1);
        let platform: Arc<dyn Platform> = test_platform.clone();
        let pool = Arc::new(WorkerPool::new(2, "decode"));

        let mut manager = TileManager::new(platform.clone());
        manager.add_tile_source(test_source(&platform, &pool, 18));

        let view = world_view(1.0);
        let state = manager.update(&view);
        assert!(state.tiles_loading);

        // Four z1 tiles requested, one request per tile.
        let mut requested = test_platform.started_requests();
        requested.sort();
        requested.dedup();
        assert_eq!(requested.len(), 4);

        assert!(wait_until(Duration::from_secs(2), || {
            manager.update(&view);
            manager.render_tiles().len() == 4
        }));
        assert!(test_platform.render_requests() > 0);

        let state = manager.update(&view);
        assert!(!state.tiles_loading);

        // Updating again does not re-request ready tiles.
        let total_requests = test_platform.started_requests().len();
        manager.update(&view);
        assert_eq!(test_platform.started_requests().len(), total_requests);
    }

    #[test]
    fn max_zoom_is_never_overzoomed() {
        let test_platform = Arc::new(TestPlatform::new());
        serve_world_tiles(&test_platform, 2);
        let platform: Arc<dyn Platform> = test_platform.clone();
        let pool = Arc::new(WorkerPool::new(2, "decode"));

        let mut manager = TileManager::new(platform.clone());
        manager.add_tile_source(test_source(&platform, &pool, 2));

        let view = world_view(5.0);
        manager.update(&view);

        for requested in test_platform.started_requests() {
            assert!(
                requested.starts_with("https://tiles.example.com/2/"),
                "unexpected over-zoomed request: {requested}"
            );
        }
    }

    #[test]
    fn ready_ancestor_serves_as_proxy() {
        let test_platform = Arc::new(TestPlatform::manual());
        let platform: Arc<dyn Platform> = test_platform.clone();
        let pool = Arc::new(WorkerPool::new(2, "decode"));

        let mut manager = TileManager::new(platform.clone());
        let source = test_source(&platform, &pool, 18);
        let source_id = source.id();
        manager.add_tile_source(source);

        // A ready world tile from prior coverage sits in the cache.
        let root_tile = Arc::new(Tile::new(
            source_id,
            TileId::new(0, 0, 0),
            TileGeometry::default(),
        ));
        manager
            .cache()
            .put((source_id, TileId::new(0, 0, 0)), root_tile);

        let view = world_view(1.0);
        let state = manager.update(&view);
        assert!(state.tiles_loading);

        // While the visible z1 tiles are in flight, the z0 ancestor is promoted as proxy.
        let rendered = manager.render_tiles();
        assert_eq!(rendered.len(), 1);
        assert_eq!(rendered[0].id(), TileId::new(0, 0, 0));
    }

    #[test]
    fn stale_entries_are_swept_after_retain_frames() {
        let test_platform = Arc::new(TestPlatform::new());
        serve_world_tiles(&test_platform, 3);
        let platform: Arc<dyn Platform> = test_platform.clone();
        let pool = Arc::new(WorkerPool::new(2, "decode"));

        let mut manager = TileManager::new(platform.clone());
        let source = test_source(&platform, &pool, 3);
        let source_id = source.id();
        manager.add_tile_source(source);

        let extent = crate::geo::EARTH_HALF_CIRCUMFERENCE;
        let resolution = crate::tile::grid::resolution_at_zoom(3.0);
        let size = Size::new(
            extent / 8.0 / resolution,
            extent / 8.0 / resolution,
        );
        let west = View::new(Point2::new(-extent / 2.0, 0.0), 3.0).with_size(size);
        let east = View::new(Point2::new(extent / 2.0, 0.0), 3.0).with_size(size);

        manager.update(&west);
        assert!(wait_until(Duration::from_secs(2), || {
            manager.update(&west);
            !manager.render_tiles().is_empty()
        }));
        let west_tile = manager.render_tiles()[0].id();

        // Move away; after the retain grace the west entries are dropped from the tile set but
        // stay cached for proxy reuse.
        for _ in 0..4 {
            manager.update(&east);
        }

        assert!(manager
            .render_tiles()
            .iter()
            .all(|tile| tile.id() != west_tile));
        assert!(manager.cache().peek(&(source_id, west_tile)).is_some());
    }

    #[test]
    fn single_in_flight_request_per_tile() {
        let test_platform = Arc::new(TestPlatform::manual());
        let platform: Arc<dyn Platform> = test_platform.clone();
        let pool = Arc::new(WorkerPool::new(2, "decode"));

        let mut manager = TileManager::new(platform.clone());
        manager.add_tile_source(test_source(&platform, &pool, 18));

        let view = world_view(1.0);
        manager.update(&view);
        manager.update(&view);
        manager.update(&view);

        let mut requested = test_platform.started_requests();
        let total = requested.len();
        requested.sort();
        requested.dedup();
        assert_eq!(requested.len(), total, "duplicate in-flight tile requests");

        // Draining the held responses completes the tiles without extra requests.
        for url in &requested {
            test_platform.add_response(url, r#"{"type":"FeatureCollection","features":[]}"#);
        }
        test_platform.deliver_all();
        assert!(wait_until(Duration::from_secs(2), || {
            manager.update(&view);
            manager.render_tiles().len() == 4
        }));
        assert_eq!(test_platform.started_requests().len(), total);
    }

    #[test]
    fn prefetch_ring_requests_neighbors() {
        let test_platform = Arc::new(TestPlatform::new());
        serve_world_tiles(&test_platform, 3);
        let platform: Arc<dyn Platform> = test_platform.clone();
        let pool = Arc::new(WorkerPool::new(2, "decode"));

        let mut manager = TileManager::new(platform.clone());
        manager.add_tile_source(test_source(&platform, &pool, 3));

        // A viewport covering exactly one z3 tile.
        let grid = crate::tile::grid::TileGrid::web();
        let center = grid.tile_bbox(TileId::new(3, 3, 3)).center();
        let view = View::new(center, 3.0).with_size(Size::new(256.0, 256.0));

        manager.update(&view);

        let requested = test_platform.started_requests();
        assert!(requested.contains(&"https://tiles.example.com/3/3/3.json".to_owned()));
        // The ring around the visible tile is prefetched as well.
        assert!(
            requested.len() > 1,
            "expected prefetch requests around the viewport"
        );
        assert!(requested
            .iter()
            .all(|u| u.starts_with("https://tiles.example.com/3/")));
    }
}

mod scene_lifecycle {
    use super::*;

    fn scene_yaml() -> &'static str {
        r##"
        sources:
            osm: { type: GeoJSON, url: "https://tiles.example.com/{z}/{x}/{y}.json", max_zoom: 3 }
        scene:
            background: { color: "#102030" }
        "##
    }

    #[test]
    fn sync_load_becomes_ready_on_first_update() {
        let test_platform = Arc::new(TestPlatform::new());
        test_platform.add_response("https://example.com/scene.yaml", scene_yaml());
        super::tile_pipeline_serve(&test_platform);

        let platform: Arc<dyn Platform> = test_platform.clone();
        let mut map = Map::new(platform);
        map.resize(512.0, 512.0);

        let ready: Arc<Mutex<Vec<crate::scene::SceneId>>> = Arc::new(Mutex::new(Vec::new()));
        let ready_clone = ready.clone();
        map.set_scene_ready_listener(Arc::new(move |id, errors| {
            assert!(errors.is_empty(), "unexpected scene errors: {errors:?}");
            ready_clone.lock().push(id);
        }));

        let scene_id = map.load_scene(
            SceneOptions::new(url("https://example.com/scene.yaml")),
            false,
        );
        assert_eq!(ready.lock().as_slice(), &[scene_id]);

        let state = map.update(0.016);
        assert!(!state.contains(MapState::SCENE_LOADING));
        assert_eq!(map.scene().background(), crate::scene::Color(0x102030ff));

        assert!(wait_until(Duration::from_secs(2), || {
            map.update(0.016);
            !map.scene().render_tiles().is_empty()
        }));
    }

    #[test]
    fn async_swap_disposes_old_scene_in_order() {
        let test_platform = Arc::new(TestPlatform::new());
        test_platform.add_response("https://example.com/a.yaml", "name: a");
        test_platform.add_response("https://example.com/b.yaml", "name: b");

        let platform: Arc<dyn Platform> = test_platform.clone();
        let mut map = Map::new(platform);
        map.resize(256.0, 256.0);

        let ready: Arc<Mutex<Vec<crate::scene::SceneId>>> = Arc::new(Mutex::new(Vec::new()));
        let ready_clone = ready.clone();
        map.set_scene_ready_listener(Arc::new(move |id, _| ready_clone.lock().push(id)));

        let a_id = map.load_scene(SceneOptions::new(url("https://example.com/a.yaml")), true);
        let weak_a: Weak<Scene> = Arc::downgrade(map.scene());

        let b_id = map.load_scene(SceneOptions::new(url("https://example.com/b.yaml")), true);
        assert!(b_id > a_id);
        assert_eq!(map.scene_id(), b_id);

        // Ready callbacks arrive in submission order.
        assert!(wait_until(Duration::from_secs(2), || ready.lock().len() == 2));
        assert_eq!(ready.lock().as_slice(), &[a_id, b_id]);

        // The ordered worker disposes scene A after its load task; no references remain.
        assert!(wait_until(Duration::from_secs(2), || weak_a
            .upgrade()
            .is_none()));

        assert!(wait_until(Duration::from_secs(2), || {
            map.update(0.016);
            map.scene().is_ready()
        }));
        assert_eq!(
            map.scene().config().get("name").and_then(|v| v.as_str()),
            Some("b")
        );
    }

    #[test]
    fn cancel_then_reload_behaves_like_cold_load() {
        let test_platform = Arc::new(TestPlatform::new());
        test_platform.add_response("https://example.com/scene.yaml", scene_yaml());
        super::tile_pipeline_serve(&test_platform);

        let platform: Arc<dyn Platform> = test_platform.clone();
        let mut map = Map::new(platform);
        map.resize(512.0, 512.0);

        let options = SceneOptions::new(url("https://example.com/scene.yaml"));
        map.load_scene(options.clone(), true);
        // Immediately replace it with the same options.
        let second = map.load_scene(options, true);

        assert!(wait_until(Duration::from_secs(2), || {
            map.update(0.016);
            map.scene().is_ready()
        }));
        assert_eq!(map.scene_id(), second);
        assert!(map.scene().errors().is_empty());
        assert!(wait_until(Duration::from_secs(2), || {
            map.update(0.016);
            !map.scene().render_tiles().is_empty()
        }));
    }

    #[test]
    fn client_tile_sources_are_applied_on_update() {
        let test_platform = Arc::new(TestPlatform::new());
        test_platform.add_response("https://example.com/empty.yaml", "name: empty");
        super::tile_pipeline_serve(&test_platform);

        let platform: Arc<dyn Platform> = test_platform.clone();
        let mut map = Map::new(platform.clone());
        map.resize(512.0, 512.0);
        map.load_scene(
            SceneOptions::new(url("https://example.com/empty.yaml")),
            false,
        );

        let pool = Arc::new(WorkerPool::new(1, "decode"));
        let mut config = TileSourceConfig::new(
            "client",
            TileFormat::GeoJson,
            "https://tiles.example.com/{z}/{x}/{y}.json",
        );
        config.max_zoom = 3;
        let source = Arc::new(TileSource::new(
            config,
            platform.clone(),
            pool,
            Arc::new(RawTileBuilder),
        ));
        let source_id = source.id();

        map.add_tile_source(source);
        map.update(0.016);
        assert!(map
            .scene()
            .with_tile_manager(|manager| manager.has_source(source_id))
            .unwrap_or(false));

        // The staged source survives a scene swap: it is re-added on the first update of the
        // next scene.
        map.load_scene(
            SceneOptions::new(url("https://example.com/empty.yaml")),
            false,
        );
        assert!(wait_until(Duration::from_secs(2), || {
            map.update(0.016);
            map.scene()
                .with_tile_manager(|manager| manager.has_source(source_id))
                .unwrap_or(false)
        }));

        map.remove_tile_source(source_id);
        map.update(0.016);
        assert!(!map
            .scene()
            .with_tile_manager(|manager| manager.has_source(source_id))
            .unwrap_or(false));
    }

    #[test]
    fn marker_round_trip_through_map() {
        let test_platform = Arc::new(TestPlatform::new());
        test_platform.add_response("https://example.com/empty.yaml", "name: empty");

        let platform: Arc<dyn Platform> = test_platform.clone();
        let mut map = Map::new(platform);
        map.resize(512.0, 512.0);
        map.load_scene(
            SceneOptions::new(url("https://example.com/empty.yaml")),
            false,
        );

        let marker = map.marker_add();
        assert!(map.marker_set_point(marker, crate::geo::LngLat::new(0.0, 0.0)));
        assert!(map.marker_set_styling(marker, "{ style: points }"));

        let picked: Arc<Mutex<Option<Option<crate::scene::MarkerId>>>> =
            Arc::new(Mutex::new(None));
        let picked_clone = picked.clone();
        map.pick_marker_at(
            256.0,
            256.0,
            Box::new(move |result| *picked_clone.lock() = Some(result)),
        );

        map.update(0.016);
        assert_eq!(*picked.lock(), Some(Some(marker)));

        assert!(map.marker_remove(marker));
        assert!(!map.marker_remove(marker));
    }
}

// Tiles shared by the lifecycle tests: a z0..z3 pyramid of empty feature collections.
fn tile_pipeline_serve(platform: &TestPlatform) {
    for z in 0..=3u8 {
        let n = 1i32 << z;
        for x in 0..n {
            for y in 0..n {
                platform.add_response(
                    &format!("https://tiles.example.com/{z}/{x}/{y}.json"),
                    r#"{"type":"FeatureCollection","features":[]}"#,
                );
            }
        }
    }
}
