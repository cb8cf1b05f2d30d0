//! Camera view over the projected map plane.

use nalgebra::{Point3, Rotation3, Translation3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::cartesian::{Point2, Rect, Size};
use crate::geo::{lng_lat_to_meters, meters_to_lng_lat, LngLat};
use crate::tile::grid::{resolution_at_zoom, MAX_ZOOM};

pub const DEFAULT_MIN_ZOOM: f64 = 0.0;
pub const DEFAULT_MAX_ZOOM: f64 = 20.5;

/// Padding applied to the viewport edges, in pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EdgePadding {
    pub left: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
}

/// Position, zoom, rotation and tilt of the camera, plus the viewport it projects into.
///
/// The position is kept in projected web mercator meters; screen positions have the origin at
/// the top-left corner of the viewport.
#[derive(Debug, Clone, PartialEq)]
pub struct View {
    position: Point2,
    zoom: f64,
    min_zoom: f64,
    max_zoom: f64,
    rotation: f64,
    tilt: f64,
    size: Size,
    pixel_scale: f64,
    padding: EdgePadding,
}

impl View {
    pub fn new(position: Point2, zoom: f64) -> Self {
        Self {
            position,
            zoom: zoom.clamp(DEFAULT_MIN_ZOOM, DEFAULT_MAX_ZOOM),
            min_zoom: DEFAULT_MIN_ZOOM,
            max_zoom: DEFAULT_MAX_ZOOM,
            rotation: 0.0,
            tilt: 0.0,
            size: Size::default(),
            pixel_scale: 1.0,
            padding: EdgePadding::default(),
        }
    }

    pub fn position(&self) -> Point2 {
        self.position
    }

    pub fn set_position(&mut self, position: Point2) {
        self.position = position;
    }

    pub fn center_coordinates(&self) -> LngLat {
        meters_to_lng_lat(self.position)
    }

    pub fn set_center_coordinates(&mut self, center: LngLat) {
        self.position = lng_lat_to_meters(center);
    }

    pub fn zoom(&self) -> f64 {
        self.zoom
    }

    pub fn set_zoom(&mut self, zoom: f64) {
        self.zoom = zoom.clamp(self.min_zoom, self.max_zoom);
    }

    /// Integer zoom level used for tile selection.
    pub fn integer_zoom(&self) -> u8 {
        self.zoom.floor().clamp(0.0, MAX_ZOOM as f64) as u8
    }

    pub fn min_zoom(&self) -> f64 {
        self.min_zoom
    }

    pub fn set_min_zoom(&mut self, min_zoom: f64) {
        self.min_zoom = min_zoom;
        self.set_zoom(self.zoom);
    }

    pub fn max_zoom(&self) -> f64 {
        self.max_zoom
    }

    pub fn set_max_zoom(&mut self, max_zoom: f64) {
        self.max_zoom = max_zoom;
        self.set_zoom(self.zoom);
    }

    /// Resolution of the view in meters per pixel.
    pub fn resolution(&self) -> f64 {
        resolution_at_zoom(self.zoom)
    }

    pub fn rotation(&self) -> f64 {
        self.rotation
    }

    pub fn set_rotation(&mut self, rotation: f64) {
        self.rotation = rotation;
    }

    pub fn tilt(&self) -> f64 {
        self.tilt
    }

    pub fn set_tilt(&mut self, tilt: f64) {
        self.tilt = tilt.clamp(0.0, std::f64::consts::FRAC_PI_2 * 0.9);
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn set_size(&mut self, size: Size) {
        self.size = size;
    }

    pub fn with_size(mut self, size: Size) -> Self {
        self.size = size;
        self
    }

    pub fn pixel_scale(&self) -> f64 {
        self.pixel_scale
    }

    pub fn set_pixel_scale(&mut self, pixel_scale: f64) {
        if pixel_scale > 0.0 {
            self.pixel_scale = pixel_scale;
        }
    }

    pub fn padding(&self) -> EdgePadding {
        self.padding
    }

    pub fn set_padding(&mut self, padding: EdgePadding) {
        self.padding = padding;
    }

    /// Bounding box of the visible map area in projected meters.
    ///
    /// Under tilt the far corners can unproject past the horizon; the result is then limited to
    /// a sane multiple of the viewport extent around the view center.
    pub fn bbox(&self) -> Option<Rect> {
        if self.size.is_zero() {
            return None;
        }

        let resolution = self.resolution();
        let max_bbox = Rect::new(
            self.position.x - self.size.half_width() * resolution,
            self.position.y - self.size.half_height() * resolution,
            self.position.x + self.size.half_width() * resolution,
            self.position.y + self.size.half_height() * resolution,
        )
        .magnify(4.0);

        let corners = [
            Point2::new(0.0, 0.0),
            Point2::new(self.size.width(), 0.0),
            Point2::new(0.0, self.size.height()),
            Point2::new(self.size.width(), self.size.height()),
        ];

        let unprojected: Option<Vec<Point2>> = corners
            .into_iter()
            .map(|corner| self.screen_to_map(corner))
            .collect();

        match unprojected {
            Some(points) => Some(Rect::from_points(points.iter())?.limit(max_bbox)),
            None => Some(max_bbox),
        }
    }

    /// Unprojects a screen position onto the map plane.
    ///
    /// Returns `None` for a zero-sized viewport or when the position lies above the horizon of
    /// a tilted view.
    pub fn screen_to_map(&self, px_position: Point2) -> Option<Point2> {
        if self.size.is_zero() {
            return None;
        }

        let x = px_position.x;
        let y = px_position.y;
        let a = (self.size.half_height() - y) * std::f64::consts::FRAC_PI_4.tan()
            / self.size.half_height();

        let s = 1.0 / ((std::f64::consts::FRAC_PI_2 - self.tilt).tan() / a - 1.0) + 1.0;
        if s.is_infinite() || s.is_nan() || s <= 0.0 {
            return None;
        }

        let resolution = self.resolution();
        let x0 = (x - self.size.half_width()) * resolution;
        let y0 = (self.size.half_height() - y) * resolution;

        let y0_tilted = y0 / self.tilt.cos();

        let x0_scaled = x0 * s;
        let y0_scaled = y0_tilted * s;

        let rotation = Rotation3::new(Vector3::new(0.0, 0.0, -self.rotation));
        let translation = Translation3::new(self.position.x, self.position.y, 0.0);

        let point = Point3::new(x0_scaled, y0_scaled, 0.0);
        let transformed = translation * rotation * point;

        Some(Point2::new(transformed.x, transformed.y))
    }

    /// Moves the view so that the map position under `from` appears under `to`.
    pub fn translate_by_pixels(&mut self, from: Point2, to: Point2) {
        let (Some(from_projected), Some(to_projected)) =
            (self.screen_to_map(from), self.screen_to_map(to))
        else {
            return;
        };

        const MAX_TRANSLATE_PX: f64 = 100.0;
        let max_translate = MAX_TRANSLATE_PX * self.resolution();
        let mut delta = to_projected - from_projected;
        if delta.x.abs() > max_translate {
            delta.x = max_translate * delta.x.signum();
        }
        if delta.y.abs() > max_translate {
            delta.y = max_translate * delta.y.signum();
        }

        self.translate(delta);
    }

    pub fn translate(&mut self, delta: Vector2<f64>) {
        self.position -= delta;
    }

    /// Zooms by `2^zoom_delta` keeping the map position under `base_point` fixed on screen.
    pub fn zoom_around(&mut self, zoom_delta: f64, base_point: Point2) {
        let base = self.screen_to_map(base_point);

        let old_zoom = self.zoom;
        self.set_zoom(self.zoom + zoom_delta);
        let factor = resolution_at_zoom(self.zoom) / resolution_at_zoom(old_zoom);

        if let Some(base) = base {
            self.position = base + (self.position - base) * factor;
        }
    }

    /// Linear interpolation towards `target`, used by camera eases.
    pub fn interpolate(&self, target: &View, k: f64) -> Self {
        let mut result = self.clone();
        result.position = self.position + (target.position - self.position) * k;
        result.set_zoom(self.zoom + (target.zoom - self.zoom) * k);
        result.rotation = self.rotation + (target.rotation - self.rotation) * k;
        result.set_tilt(self.tilt + (target.tilt - self.tilt) * k);
        result
    }
}

impl Default for View {
    fn default() -> Self {
        Self::new(Point2::new(0.0, 0.0), 0.0)
    }
}
