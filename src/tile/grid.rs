//! Web mercator tile grid: maps a view to the tile indices that cover it.

use std::collections::BTreeSet;

use crate::cartesian::{Point2, Rect};
use crate::geo::EARTH_HALF_CIRCUMFERENCE;
use crate::tile::TileId;
use crate::view::View;

/// Width and height of a single tile in pixels.
pub const TILE_SIZE: u32 = 256;

/// Resolution of zoom level 0 in meters per pixel.
pub const TOP_RESOLUTION: f64 = 156543.03392800014;

/// Highest zoom level the grid addresses.
pub const MAX_ZOOM: u8 = 22;

const EDGE_TOLERANCE: f64 = 0.001;

/// Resolution of the given fractional zoom level in meters per pixel.
pub fn resolution_at_zoom(zoom: f64) -> f64 {
    TOP_RESOLUTION / 2f64.powf(zoom)
}

/// Zoom level at which one pixel covers `resolution` meters.
pub fn zoom_at_resolution(resolution: f64) -> f64 {
    (TOP_RESOLUTION / resolution).log2()
}

/// The standard web mercator tile grid (origin at the top-left corner of the projected world,
/// Y indices growing south).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileGrid {
    origin: Point2,
    bounds: Rect,
}

impl TileGrid {
    pub fn web() -> Self {
        Self {
            origin: Point2::new(-EARTH_HALF_CIRCUMFERENCE, EARTH_HALF_CIRCUMFERENCE),
            bounds: Rect::new(
                -EARTH_HALF_CIRCUMFERENCE,
                -EARTH_HALF_CIRCUMFERENCE,
                EARTH_HALF_CIRCUMFERENCE,
                EARTH_HALF_CIRCUMFERENCE,
            ),
        }
    }

    pub fn bounds(&self) -> Rect {
        self.bounds
    }

    /// Tile indices covering the view at its integer zoom, clamped to `max_zoom`.
    ///
    /// X indices are wrapped over the antimeridian, so the result contains each tile at most
    /// once. Returns tiles ordered by `(z, x, y)`.
    pub fn visible_tiles(&self, view: &View, max_zoom: u8) -> BTreeSet<TileId> {
        let z = view.integer_zoom().min(max_zoom).min(MAX_ZOOM);
        let Some(bbox) = view.bbox() else {
            return BTreeSet::new();
        };

        self.tiles_in_rect(bbox, z)
    }

    /// Tile indices at zoom `z` intersecting the rectangle, with x wrap.
    pub fn tiles_in_rect(&self, rect: Rect, z: u8) -> BTreeSet<TileId> {
        let tile_span = resolution_at_zoom(z as f64) * TILE_SIZE as f64;
        let row_count = 1i64 << z;

        let x_min = ((rect.x_min() - self.origin.x) / tile_span).floor() as i64;
        let x_max = index_before_edge((rect.x_max() - self.origin.x) / tile_span);

        let y_min = (((self.origin.y - rect.y_max()) / tile_span).floor() as i64).max(0);
        let y_max = index_before_edge((self.origin.y - rect.y_min()) / tile_span).min(row_count - 1);

        let mut tiles = BTreeSet::new();
        // A viewport wider than the world would otherwise produce every x index many times over.
        let x_max = x_max.min(x_min + row_count - 1);

        for x in x_min..=x_max {
            let wrapped_x = x.rem_euclid(row_count) as i32;
            for y in y_min..=y_max {
                tiles.insert(TileId::new(z, wrapped_x, y as i32));
            }
        }

        tiles
    }

    /// Bounding rectangle of the tile in projected meters.
    pub fn tile_bbox(&self, id: TileId) -> Rect {
        let tile_span = resolution_at_zoom(id.z as f64) * TILE_SIZE as f64;
        let x_min = self.origin.x + id.x as f64 * tile_span;
        let y_max = self.origin.y - id.y as f64 * tile_span;

        Rect::new(x_min, y_max - tile_span, x_min + tile_span, y_max)
    }
}

impl Default for TileGrid {
    fn default() -> Self {
        Self::web()
    }
}

// A bounding box edge exactly on a tile boundary must not pull in the next tile row.
fn index_before_edge(scaled: f64) -> i64 {
    let floored = scaled.floor();
    if scaled - floored < EDGE_TOLERANCE {
        floored as i64 - 1
    } else {
        floored as i64
    }
}
