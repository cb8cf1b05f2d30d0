//! The map façade: the single public entry point of the pipeline.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::cartesian::{Point2, Size};
use crate::geo::LngLat;
use crate::platform::Platform;
use crate::scene::marker::MarkerId;
use crate::scene::{
    Color, PrefetchCallback, Scene, SceneError, SceneId, SceneOptions, Style,
};
use crate::tile::source::SourceId;
use crate::tile::{RawTileBuilder, Tile, TileBuilder, TileSource};
use crate::util::worker::AsyncWorker;
use crate::view::{EdgePadding, View};

pub mod debug;
pub mod job_queue;

pub use debug::{get_debug_flag, set_debug_flag, toggle_debug_flag, DebugFlag};
pub use job_queue::JobQueue;

const TWO_PI: f64 = std::f64::consts::PI * 2.0;

/// Flags describing what changed during an update tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MapState(u32);

impl MapState {
    pub const VIEW_CHANGING: MapState = MapState(1);
    pub const SCENE_LOADING: MapState = MapState(1 << 1);
    pub const TILES_LOADING: MapState = MapState(1 << 2);
    pub const LABELS_CHANGING: MapState = MapState(1 << 3);
    pub const IS_ANIMATING: MapState = MapState(1 << 4);

    pub fn contains(self, flag: MapState) -> bool {
        self.0 & flag.0 == flag.0
    }

    pub fn insert(&mut self, flag: MapState) {
        self.0 |= flag.0;
    }

    /// `true` when nothing changed and no further frames are needed.
    pub fn is_idle(self) -> bool {
        self.0 == 0
    }
}

/// Camera state exposed to clients in geographic terms.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CameraPosition {
    pub longitude: f64,
    pub latitude: f64,
    pub zoom: f64,
    pub rotation: f64,
    pub tilt: f64,
}

/// Partial camera change; unset fields keep their current value.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CameraUpdate {
    pub lng_lat: Option<LngLat>,
    pub zoom: Option<f64>,
    pub zoom_by: Option<f64>,
    pub rotation: Option<f64>,
    pub rotation_by: Option<f64>,
    pub tilt: Option<f64>,
    pub tilt_by: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EaseType {
    Linear,
    #[default]
    Cubic,
    Quint,
    Sine,
}

fn ease(start: f64, end: f64, t: f64, kind: EaseType) -> f64 {
    let t = t.clamp(0.0, 1.0);
    let k = match kind {
        EaseType::Linear => t,
        EaseType::Cubic => {
            if t < 0.5 {
                4.0 * t * t * t
            } else {
                1.0 - (-2.0 * t + 2.0).powi(3) / 2.0
            }
        }
        EaseType::Quint => {
            if t < 0.5 {
                16.0 * t.powi(5)
            } else {
                1.0 - (-2.0 * t + 2.0).powi(5) / 2.0
            }
        }
        EaseType::Sine => (1.0 - (t * std::f64::consts::PI).cos()) / 2.0,
    };

    start + (end - start) * k
}

struct CameraEase {
    start: View,
    end: View,
    elapsed: f32,
    duration: f32,
    kind: EaseType,
}

struct ClientTileSourceEntry {
    source: Arc<TileSource>,
    added: bool,
    clear: bool,
    remove: bool,
}

pub type SceneReadyCallback = Arc<dyn Fn(SceneId, &[SceneError]) + Send + Sync>;
pub type CameraAnimationCallback = Box<dyn Fn(bool) + Send>;
pub type MarkerPickCallback = Box<dyn FnOnce(Option<MarkerId>) + Send>;
pub type FeaturePickCallback = Box<dyn FnOnce(Option<Point2>) + Send>;
pub type LabelPickCallback = Box<dyn FnOnce(Option<Point2>) + Send>;

/// A picking query queued for the next frame. Marker queries are resolved by the map itself;
/// feature and label queries are handed to the renderer with the frame.
pub enum SelectionQuery {
    Feature {
        position: Point2,
        radius: f64,
        callback: FeaturePickCallback,
    },
    Label {
        position: Point2,
        radius: f64,
        callback: LabelPickCallback,
    },
    Marker {
        position: Point2,
        radius: f64,
        callback: MarkerPickCallback,
    },
}

/// Everything the renderer needs to draw one frame.
pub struct RenderFrame<'a> {
    pub view: &'a View,
    pub background: Color,
    pub styles: Vec<Style>,
    pub tiles: Vec<Arc<Tile>>,
    pub selection_queries: Vec<SelectionQuery>,
}

/// External renderer collaborator. Receives ready-to-draw tile geometry every frame.
pub trait Renderer {
    fn render(&mut self, frame: RenderFrame<'_>);
}

/// The public map object.
///
/// `update` and `render` are driven from the main thread. Scene loads and disposes are
/// serialized on an ordered worker, so the previous scene's resources are released only after
/// any earlier load task completed. Client mutations are funneled through the job queue and the
/// client-tile-source staging map, and are observed at frame boundaries.
pub struct Map {
    platform: Arc<dyn Platform>,
    view: Arc<Mutex<View>>,
    job_queue: Arc<JobQueue>,
    scene_worker: AsyncWorker,
    scene: Arc<Scene>,
    builder: Arc<dyn TileBuilder>,
    client_tile_sources: Mutex<HashMap<SourceId, ClientTileSourceEntry>>,
    selection_queries: Vec<SelectionQuery>,
    ease: Option<CameraEase>,
    on_scene_ready: Option<SceneReadyCallback>,
    on_camera_animation: Option<CameraAnimationCallback>,
    pick_radius: f64,
    was_animating: bool,
}

impl Map {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self::with_tile_builder(platform, Arc::new(RawTileBuilder))
    }

    pub fn with_tile_builder(platform: Arc<dyn Platform>, builder: Arc<dyn TileBuilder>) -> Self {
        let blank = SceneOptions::new(
            crate::resource::ResourceUrl::parse("about:blank").expect("valid constant url"),
        );

        Self {
            scene: Arc::new(Scene::new(
                platform.clone(),
                blank,
                builder.clone(),
                None,
            )),
            platform,
            view: Arc::new(Mutex::new(View::default())),
            job_queue: Arc::new(JobQueue::new()),
            scene_worker: AsyncWorker::new("meridian-scene"),
            builder,
            client_tile_sources: Mutex::new(HashMap::new()),
            selection_queries: Vec::new(),
            ease: None,
            on_scene_ready: None,
            on_camera_animation: None,
            pick_radius: 0.5,
            was_animating: false,
        }
    }

    pub fn set_scene_ready_listener(&mut self, listener: SceneReadyCallback) {
        self.on_scene_ready = Some(listener);
    }

    pub fn set_camera_animation_listener(&mut self, listener: CameraAnimationCallback) {
        self.on_camera_animation = Some(listener);
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    pub fn scene_id(&self) -> SceneId {
        self.scene.id()
    }

    pub fn scene(&self) -> &Arc<Scene> {
        &self.scene
    }

    /// Loads a scene, replacing the current one.
    ///
    /// The synchronous path blocks the calling thread until the scene is assembled. The async
    /// path returns immediately; the load and the disposal of the outgoing scene are enqueued
    /// in order on the scene worker.
    pub fn load_scene(&mut self, options: SceneOptions, load_async: bool) -> SceneId {
        if load_async {
            self.load_scene_async(options)
        } else {
            self.load_scene_sync(options)
        }
    }

    fn load_scene_sync(&mut self, options: SceneOptions) -> SceneId {
        let scene = Arc::new(Scene::new(
            self.platform.clone(),
            options,
            self.builder.clone(),
            None,
        ));

        // Replacing disposes the old scene inline.
        let old = std::mem::replace(&mut self.scene, scene.clone());
        old.cancel_tasks();
        drop(old);

        scene.load();

        if let Some(listener) = &self.on_scene_ready {
            listener(scene.id(), &scene.errors());
        }

        scene.id()
    }

    fn load_scene_async(&mut self, options: SceneOptions) -> SceneId {
        let scene = {
            let job_queue = self.job_queue.clone();
            let shared_view = self.view.clone();
            let platform = self.platform.clone();
            let builder = self.builder.clone();
            let scene_platform = self.platform.clone();

            Arc::new_cyclic(move |weak: &Weak<Scene>| {
                let weak = weak.clone();
                let prefetch: PrefetchCallback = Box::new(move |_id| {
                    let weak = weak.clone();
                    let shared_view = shared_view.clone();
                    job_queue.add(move || {
                        if let Some(scene) = weak.upgrade() {
                            let view = shared_view.lock().clone();
                            scene.prefetch_tiles(&view);
                        }
                    });
                    platform.request_render();
                });

                Scene::new(scene_platform, options, builder, Some(prefetch))
            })
        };

        let old = std::mem::replace(&mut self.scene, scene.clone());
        old.cancel_tasks();

        // The load task holds the new scene; the next task takes ownership of the old one.
        // Tasks on the scene worker run one at a time in FIFO order, so even if another scene
        // starts loading right away, the current scene is not freed until this load finished.
        let new_scene = scene.clone();
        let listener = self.on_scene_ready.clone();
        let platform = self.platform.clone();
        self.scene_worker.enqueue(move || {
            new_scene.load();

            if let Some(listener) = &listener {
                listener(new_scene.id(), &new_scene.errors());
            }

            platform.request_render();
        });

        self.scene_worker.enqueue(move || {
            let count = Arc::strong_count(&old);
            if count != 1 {
                log::error!("Incorrect use count for old scene pointer: {count}. Scene may be leaked!");
            }
            drop(old);
        });

        scene.id()
    }

    /// Drains the job queue, advances camera eases and ticks the scene.
    pub fn update(&mut self, dt: f32) -> MapState {
        self.job_queue.run_jobs();

        let mut state = MapState::default();
        if self.update_camera_ease(dt) {
            state.insert(MapState::VIEW_CHANGING);
            state.insert(MapState::IS_ANIMATING);
        }

        let scene = self.scene.clone();
        let was_ready = scene.is_ready();
        let view = self.view.lock().clone();

        if !scene.complete_scene(&view) {
            state.insert(MapState::SCENE_LOADING);
        } else {
            let first_update = !was_ready;
            self.sync_client_tile_sources(&scene, first_update);

            let scene_state = scene.update(&view, dt);
            if scene_state.animate_labels || scene_state.animate_markers {
                state.insert(MapState::LABELS_CHANGING);
                state.insert(MapState::IS_ANIMATING);
            }
            if scene_state.tiles_loading {
                state.insert(MapState::TILES_LOADING);
            }
        }

        self.resolve_marker_queries(&view);

        let animating = state.contains(MapState::IS_ANIMATING);
        if animating != self.was_animating {
            self.platform.set_continuous_rendering(animating);
            self.was_animating = animating;
        }

        state
    }

    /// Hands the current frame to the renderer. While the scene is loading only the background
    /// is drawn.
    pub fn render(&mut self, renderer: &mut dyn Renderer) {
        let view = self.view.lock().clone();
        let selection_queries = std::mem::take(&mut self.selection_queries);
        let scene = &self.scene;

        let frame = if scene.is_ready() {
            RenderFrame {
                view: &view,
                background: scene.background(),
                styles: scene.styles(),
                tiles: scene.render_tiles(),
                selection_queries,
            }
        } else {
            RenderFrame {
                view: &view,
                background: scene.background(),
                styles: Vec::new(),
                tiles: Vec::new(),
                selection_queries,
            }
        };

        renderer.render(frame);
    }

    pub fn resize(&mut self, width: f64, height: f64) {
        self.view.lock().set_size(Size::new(width, height));
        self.platform.request_render();
    }

    pub fn set_pixel_scale(&mut self, pixel_scale: f64) {
        let mut view = self.view.lock();
        if view.pixel_scale() == pixel_scale {
            return;
        }
        view.set_pixel_scale(pixel_scale);
        drop(view);
        self.platform.request_render();
    }

    pub fn view(&self) -> View {
        self.view.lock().clone()
    }

    pub fn camera_position(&self) -> CameraPosition {
        let view = self.view.lock();
        let center = view.center_coordinates();
        CameraPosition {
            longitude: center.longitude,
            latitude: center.latitude,
            zoom: view.zoom(),
            rotation: view.rotation(),
            tilt: view.tilt(),
        }
    }

    pub fn set_camera_position(&mut self, camera: CameraPosition) {
        self.cancel_camera_animation();

        {
            let mut view = self.view.lock();
            view.set_center_coordinates(LngLat::new(camera.longitude, camera.latitude));
            view.set_zoom(camera.zoom);
            view.set_rotation(camera.rotation);
            view.set_tilt(camera.tilt);
        }

        self.platform.request_render();
        // Clients listening for camera changes get notified even without an animation.
        if let Some(listener) = &self.on_camera_animation {
            listener(true);
        }
    }

    pub fn set_camera_position_eased(
        &mut self,
        camera: CameraPosition,
        duration: f32,
        kind: EaseType,
    ) {
        if duration <= 0.0 {
            self.set_camera_position(camera);
            return;
        }

        self.cancel_camera_animation();

        let start = self.view.lock().clone();
        let mut end = start.clone();

        let mut longitude = camera.longitude;
        let start_center = start.center_coordinates();
        let d_longitude = longitude - start_center.longitude;
        if d_longitude > 180.0 {
            longitude -= 360.0;
        } else if d_longitude < -180.0 {
            longitude += 360.0;
        }

        end.set_center_coordinates(LngLat::new(longitude, camera.latitude));
        end.set_zoom(camera.zoom);
        end.set_tilt(camera.tilt);

        // Rotate over the smallest angular distance.
        let mut rotation_delta = (camera.rotation - start.rotation()) % TWO_PI;
        if rotation_delta > std::f64::consts::PI {
            rotation_delta -= TWO_PI;
        } else if rotation_delta < -std::f64::consts::PI {
            rotation_delta += TWO_PI;
        }
        end.set_rotation(start.rotation() + rotation_delta);

        self.ease = Some(CameraEase {
            start,
            end,
            elapsed: 0.0,
            duration,
            kind,
        });
        self.platform.request_render();
    }

    pub fn update_camera_position(
        &mut self,
        update: CameraUpdate,
        duration: f32,
        kind: EaseType,
    ) {
        let mut camera = self.camera_position();

        if let Some(lng_lat) = update.lng_lat {
            camera.longitude = lng_lat.longitude;
            camera.latitude = lng_lat.latitude;
        }
        if let Some(zoom) = update.zoom {
            camera.zoom = zoom;
        }
        if let Some(zoom_by) = update.zoom_by {
            camera.zoom += zoom_by;
        }
        if let Some(rotation) = update.rotation {
            camera.rotation = rotation;
        }
        if let Some(rotation_by) = update.rotation_by {
            camera.rotation += rotation_by;
        }
        if let Some(tilt) = update.tilt {
            camera.tilt = tilt;
        }
        if let Some(tilt_by) = update.tilt_by {
            camera.tilt += tilt_by;
        }

        if duration <= 0.0 {
            self.set_camera_position(camera);
        } else {
            self.set_camera_position_eased(camera, duration, kind);
        }
    }

    pub fn cancel_camera_animation(&mut self) {
        if self.ease.take().is_some() {
            if let Some(listener) = &self.on_camera_animation {
                listener(false);
            }
        }
    }

    fn update_camera_ease(&mut self, dt: f32) -> bool {
        let Some(animation) = &mut self.ease else {
            return false;
        };

        animation.elapsed += dt;
        let t = (animation.elapsed / animation.duration).clamp(0.0, 1.0) as f64;
        let k = ease(0.0, 1.0, t, animation.kind);

        let interpolated = animation.start.interpolate(&animation.end, k);
        let finished = animation.elapsed >= animation.duration;

        {
            let mut view = self.view.lock();
            let size = view.size();
            let pixel_scale = view.pixel_scale();
            let padding = view.padding();
            *view = interpolated;
            view.set_size(size);
            view.set_pixel_scale(pixel_scale);
            view.set_padding(padding);
        }

        if finished {
            self.ease = None;
            if let Some(listener) = &self.on_camera_animation {
                listener(true);
            }
            return false;
        }

        true
    }

    pub fn position(&self) -> LngLat {
        self.view.lock().center_coordinates()
    }

    pub fn set_position(&mut self, position: LngLat) {
        self.cancel_camera_animation();
        self.view.lock().set_center_coordinates(position);
        self.platform.request_render();
    }

    pub fn zoom(&self) -> f64 {
        self.view.lock().zoom()
    }

    pub fn set_zoom(&mut self, zoom: f64) {
        self.cancel_camera_animation();
        self.view.lock().set_zoom(zoom);
        self.platform.request_render();
    }

    pub fn rotation(&self) -> f64 {
        self.view.lock().rotation()
    }

    pub fn set_rotation(&mut self, rotation: f64) {
        self.cancel_camera_animation();
        self.view.lock().set_rotation(rotation);
        self.platform.request_render();
    }

    pub fn tilt(&self) -> f64 {
        self.view.lock().tilt()
    }

    pub fn set_tilt(&mut self, tilt: f64) {
        self.cancel_camera_animation();
        self.view.lock().set_tilt(tilt);
        self.platform.request_render();
    }

    /// Unprojects a screen position into geographic coordinates, if it hits the map plane.
    pub fn screen_position_to_lng_lat(&self, x: f64, y: f64) -> Option<LngLat> {
        self.view
            .lock()
            .screen_to_map(Point2::new(x, y))
            .map(crate::geo::meters_to_lng_lat)
    }

    pub fn set_padding(&mut self, padding: EdgePadding) {
        self.view.lock().set_padding(padding);
    }

    pub fn padding(&self) -> EdgePadding {
        self.view.lock().padding()
    }

    pub fn set_min_zoom(&mut self, min_zoom: f64) {
        self.view.lock().set_min_zoom(min_zoom);
    }

    pub fn set_max_zoom(&mut self, max_zoom: f64) {
        self.view.lock().set_max_zoom(max_zoom);
    }

    // Gestures mutate the view directly through the same paths as the camera setters.

    pub fn handle_pan_gesture(&mut self, start_x: f64, start_y: f64, end_x: f64, end_y: f64) {
        self.cancel_camera_animation();
        self.view
            .lock()
            .translate_by_pixels(Point2::new(start_x, start_y), Point2::new(end_x, end_y));
        self.platform.request_render();
    }

    pub fn handle_pinch_gesture(&mut self, x: f64, y: f64, scale: f64) {
        if scale <= 0.0 {
            return;
        }
        self.cancel_camera_animation();
        self.view.lock().zoom_around(scale.log2(), Point2::new(x, y));
        self.platform.request_render();
    }

    pub fn handle_rotate_gesture(&mut self, _x: f64, _y: f64, radians: f64) {
        self.cancel_camera_animation();
        let mut view = self.view.lock();
        let rotation = view.rotation() + radians;
        view.set_rotation(rotation);
        drop(view);
        self.platform.request_render();
    }

    pub fn handle_shove_gesture(&mut self, distance: f64) {
        const TILT_PER_PIXEL: f64 = 0.005;
        self.cancel_camera_animation();
        let mut view = self.view.lock();
        let tilt = view.tilt() - distance * TILT_PER_PIXEL;
        view.set_tilt(tilt);
        drop(view);
        self.platform.request_render();
    }

    pub fn handle_double_tap_gesture(&mut self, x: f64, y: f64) {
        self.cancel_camera_animation();
        self.view.lock().zoom_around(1.0, Point2::new(x, y));
        self.platform.request_render();
    }

    pub fn handle_tap_gesture(&mut self, _x: f64, _y: f64) {
        self.cancel_camera_animation();
        self.platform.request_render();
    }

    pub fn handle_fling_gesture(&mut self, x: f64, y: f64, velocity_x: f64, velocity_y: f64) {
        const FLING_DURATION: f32 = 0.5;

        self.cancel_camera_animation();

        let start = self.view.lock().clone();
        let resolution = start.resolution();
        let mut end = start.clone();
        end.set_position(
            start.position()
                + nalgebra::Vector2::new(
                    -velocity_x * FLING_DURATION as f64 * resolution,
                    velocity_y * FLING_DURATION as f64 * resolution,
                ),
        );

        log::trace!("Fling at ({x}, {y})");
        self.ease = Some(CameraEase {
            start,
            end,
            elapsed: 0.0,
            duration: FLING_DURATION,
            kind: EaseType::Cubic,
        });
        self.platform.request_render();
    }

    // Client tile sources are staged under their own mutex and applied at the head of the next
    // update on the scene thread.

    pub fn add_tile_source(&self, source: Arc<TileSource>) {
        let mut staged = self.client_tile_sources.lock();
        let entry = staged
            .entry(source.id())
            .or_insert_with(|| ClientTileSourceEntry {
                source: source.clone(),
                added: false,
                clear: false,
                remove: false,
            });

        entry.source = source;
        entry.added = true;
        entry.remove = false;
    }

    pub fn remove_tile_source(&self, id: SourceId) -> bool {
        let mut staged = self.client_tile_sources.lock();
        match staged.get_mut(&id) {
            Some(entry) => {
                entry.remove = true;
                true
            }
            None => false,
        }
    }

    pub fn clear_tile_source(&self, id: SourceId, data: bool, tiles: bool) -> bool {
        let mut staged = self.client_tile_sources.lock();
        let Some(entry) = staged.get_mut(&id) else {
            return false;
        };

        if data {
            entry.source.clear_data();
        }
        if tiles {
            entry.clear = true;
        }

        true
    }

    fn sync_client_tile_sources(&self, scene: &Scene, first_update: bool) {
        let mut staged = self.client_tile_sources.lock();

        staged.retain(|id, entry| {
            if entry.remove {
                scene.with_tile_manager(|manager| manager.remove_client_tile_source(*id));
                return false;
            }

            if entry.added || first_update {
                entry.added = false;
                let source = entry.source.clone();
                scene.with_tile_manager(move |manager| manager.add_client_tile_source(source));
            }

            if entry.clear {
                entry.clear = false;
                scene.with_tile_manager(|manager| manager.clear_tile_set(*id));
            }

            true
        });
    }

    // Markers live in the current scene.

    pub fn marker_add(&self) -> MarkerId {
        self.scene.with_markers(|markers| markers.add())
    }

    pub fn marker_remove(&self, id: MarkerId) -> bool {
        let removed = self.scene.with_markers(|markers| markers.remove(id));
        self.platform.request_render();
        removed
    }

    pub fn marker_set_point(&self, id: MarkerId, position: LngLat) -> bool {
        let updated = self
            .scene
            .with_markers(|markers| markers.set_point(id, position));
        self.platform.request_render();
        updated
    }

    pub fn marker_set_point_eased(
        &self,
        id: MarkerId,
        position: LngLat,
        duration: std::time::Duration,
    ) -> bool {
        let updated = self
            .scene
            .with_markers(|markers| markers.set_point_eased(id, position, duration));
        self.platform.request_render();
        updated
    }

    pub fn marker_set_polyline(&self, id: MarkerId, coordinates: &[LngLat]) -> bool {
        let updated = self
            .scene
            .with_markers(|markers| markers.set_polyline(id, coordinates));
        self.platform.request_render();
        updated
    }

    pub fn marker_set_polygon(&self, id: MarkerId, rings: &[Vec<LngLat>]) -> bool {
        let updated = self
            .scene
            .with_markers(|markers| markers.set_polygon(id, rings));
        self.platform.request_render();
        updated
    }

    pub fn marker_set_styling(&self, id: MarkerId, styling: &str) -> bool {
        let updated = self
            .scene
            .with_markers(|markers| markers.set_styling(id, styling));
        self.platform.request_render();
        updated
    }

    pub fn marker_set_bitmap(
        &self,
        id: MarkerId,
        bitmap: crate::scene::marker::MarkerBitmap,
    ) -> bool {
        let updated = self
            .scene
            .with_markers(|markers| markers.set_bitmap(id, bitmap));
        self.platform.request_render();
        updated
    }

    pub fn marker_set_visible(&self, id: MarkerId, visible: bool) -> bool {
        let updated = self
            .scene
            .with_markers(|markers| markers.set_visible(id, visible));
        self.platform.request_render();
        updated
    }

    pub fn marker_set_draw_order(&self, id: MarkerId, draw_order: i32) -> bool {
        let updated = self
            .scene
            .with_markers(|markers| markers.set_draw_order(id, draw_order));
        self.platform.request_render();
        updated
    }

    pub fn marker_remove_all(&self) {
        self.scene.with_markers(|markers| markers.remove_all());
        self.platform.request_render();
    }

    // Picking.

    pub fn set_pick_radius(&mut self, radius: f64) {
        self.pick_radius = radius;
    }

    pub fn pick_feature_at(&mut self, x: f64, y: f64, callback: FeaturePickCallback) {
        self.selection_queries.push(SelectionQuery::Feature {
            position: Point2::new(x, y),
            radius: self.pick_radius,
            callback,
        });
        self.platform.request_render();
    }

    pub fn pick_label_at(&mut self, x: f64, y: f64, callback: LabelPickCallback) {
        self.selection_queries.push(SelectionQuery::Label {
            position: Point2::new(x, y),
            radius: self.pick_radius,
            callback,
        });
        self.platform.request_render();
    }

    pub fn pick_marker_at(&mut self, x: f64, y: f64, callback: MarkerPickCallback) {
        self.selection_queries.push(SelectionQuery::Marker {
            position: Point2::new(x, y),
            radius: self.pick_radius,
            callback,
        });
        self.platform.request_render();
    }

    fn resolve_marker_queries(&mut self, view: &View) {
        if self.selection_queries.is_empty() {
            return;
        }

        let queries = std::mem::take(&mut self.selection_queries);
        for query in queries {
            match query {
                SelectionQuery::Marker {
                    position,
                    radius,
                    callback,
                } => {
                    let result = self.scene.with_markers(|markers| {
                        markers.pick_at(view, position.x, position.y, radius)
                    });
                    callback(result);
                }
                other => self.selection_queries.push(other),
            }
        }
    }

    /// Releases memory that can be recomputed: unpinned cached tiles.
    pub fn on_memory_warning(&self) {
        self.scene
            .with_tile_manager(|manager| manager.cache().clear_unpinned());
    }
}

impl Drop for Map {
    fn drop(&mut self) {
        // The platform must not call back into the map after shutdown.
        self.platform.shutdown();

        // The scene worker joins before the job queue stops so that load and dispose tasks can
        // still post jobs; afterwards jobs run inline.
        self.scene_worker.stop();
        self.job_queue.stop();
    }
}
