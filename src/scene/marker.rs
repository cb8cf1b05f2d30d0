//! Client-added map markers.

use std::collections::HashMap;

use web_time::{Duration, Instant};

use crate::cartesian::{Point2, Rect};
use crate::geo::{lng_lat_to_meters, LngLat};
use crate::view::View;

pub type MarkerId = u64;

#[derive(Debug, Clone, Default, PartialEq)]
pub enum MarkerGeometry {
    #[default]
    None,
    Point(Point2),
    Polyline(Vec<Point2>),
    Polygon(Vec<Vec<Point2>>),
}

#[derive(Debug)]
struct PointEase {
    from: Point2,
    to: Point2,
    started: Instant,
    duration: Duration,
}

/// Pixel data for an image marker. Interpreted by the renderer.
#[derive(Debug, Clone)]
pub struct MarkerBitmap {
    pub width: u32,
    pub height: u32,
    pub density: f32,
    pub pixels: Vec<u32>,
}

#[derive(Debug)]
pub struct Marker {
    pub geometry: MarkerGeometry,
    pub styling: Option<String>,
    pub bitmap: Option<MarkerBitmap>,
    pub visible: bool,
    pub draw_order: i32,
    ease: Option<PointEase>,
}

impl Marker {
    fn new() -> Self {
        Self {
            geometry: MarkerGeometry::None,
            styling: None,
            bitmap: None,
            visible: true,
            draw_order: 0,
            ease: None,
        }
    }
}

/// Owns the markers of one scene. All mutations go through the map façade on the main thread.
#[derive(Debug, Default)]
pub struct MarkerManager {
    markers: HashMap<MarkerId, Marker>,
    next_id: MarkerId,
}

impl MarkerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self) -> MarkerId {
        self.next_id += 1;
        self.markers.insert(self.next_id, Marker::new());
        self.next_id
    }

    pub fn remove(&mut self, id: MarkerId) -> bool {
        self.markers.remove(&id).is_some()
    }

    pub fn remove_all(&mut self) {
        self.markers.clear();
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    pub fn set_point(&mut self, id: MarkerId, position: LngLat) -> bool {
        let Some(marker) = self.markers.get_mut(&id) else {
            return false;
        };

        marker.geometry = MarkerGeometry::Point(lng_lat_to_meters(position));
        marker.ease = None;
        true
    }

    pub fn set_point_eased(&mut self, id: MarkerId, position: LngLat, duration: Duration) -> bool {
        let Some(marker) = self.markers.get_mut(&id) else {
            return false;
        };

        match marker.geometry {
            MarkerGeometry::Point(from) => {
                marker.ease = Some(PointEase {
                    from,
                    to: lng_lat_to_meters(position),
                    started: Instant::now(),
                    duration,
                });
            }
            // No current point to ease from.
            _ => {
                marker.geometry = MarkerGeometry::Point(lng_lat_to_meters(position));
                marker.ease = None;
            }
        }

        true
    }

    pub fn set_polyline(&mut self, id: MarkerId, coordinates: &[LngLat]) -> bool {
        let Some(marker) = self.markers.get_mut(&id) else {
            return false;
        };

        marker.geometry =
            MarkerGeometry::Polyline(coordinates.iter().map(|c| lng_lat_to_meters(*c)).collect());
        marker.ease = None;
        true
    }

    pub fn set_polygon(&mut self, id: MarkerId, rings: &[Vec<LngLat>]) -> bool {
        let Some(marker) = self.markers.get_mut(&id) else {
            return false;
        };

        marker.geometry = MarkerGeometry::Polygon(
            rings
                .iter()
                .map(|ring| ring.iter().map(|c| lng_lat_to_meters(*c)).collect())
                .collect(),
        );
        marker.ease = None;
        true
    }

    pub fn set_styling(&mut self, id: MarkerId, styling: &str) -> bool {
        match self.markers.get_mut(&id) {
            Some(marker) => {
                marker.styling = Some(styling.to_owned());
                true
            }
            None => false,
        }
    }

    pub fn set_bitmap(&mut self, id: MarkerId, bitmap: MarkerBitmap) -> bool {
        match self.markers.get_mut(&id) {
            Some(marker) => {
                marker.bitmap = Some(bitmap);
                true
            }
            None => false,
        }
    }

    pub fn set_visible(&mut self, id: MarkerId, visible: bool) -> bool {
        match self.markers.get_mut(&id) {
            Some(marker) => {
                marker.visible = visible;
                true
            }
            None => false,
        }
    }

    pub fn set_draw_order(&mut self, id: MarkerId, draw_order: i32) -> bool {
        match self.markers.get_mut(&id) {
            Some(marker) => {
                marker.draw_order = draw_order;
                true
            }
            None => false,
        }
    }

    /// Advances point eases. Returns whether any marker is still animating.
    pub fn update(&mut self, _dt: f32) -> bool {
        let now = Instant::now();
        let mut animating = false;

        for marker in self.markers.values_mut() {
            let Some(ease) = &marker.ease else {
                continue;
            };

            let k = now.duration_since(ease.started).as_secs_f64()
                / ease.duration.as_secs_f64().max(f64::EPSILON);
            if k >= 1.0 {
                marker.geometry = MarkerGeometry::Point(ease.to);
                marker.ease = None;
            } else {
                let position = ease.from + (ease.to - ease.from) * k;
                marker.geometry = MarkerGeometry::Point(position);
                animating = true;
            }
        }

        animating
    }

    /// Finds the top-most visible marker within `radius` screen pixels of the position.
    pub fn pick_at(&self, view: &View, x: f64, y: f64, radius: f64) -> Option<MarkerId> {
        let position = view.screen_to_map(Point2::new(x, y))?;
        let tolerance = radius.max(0.5) * view.resolution();

        let mut best: Option<(MarkerId, i32)> = None;
        for (id, marker) in &self.markers {
            if !marker.visible {
                continue;
            }

            let hit = match &marker.geometry {
                MarkerGeometry::None => false,
                MarkerGeometry::Point(point) => (point - position).norm() <= tolerance,
                MarkerGeometry::Polyline(points) => Rect::from_points(points.iter())
                    .map(|rect| rect.expand(tolerance).contains(&position))
                    .unwrap_or(false),
                MarkerGeometry::Polygon(rings) => rings.first().is_some_and(|ring| {
                    Rect::from_points(ring.iter())
                        .map(|rect| rect.expand(tolerance).contains(&position))
                        .unwrap_or(false)
                }),
            };

            if hit && best.map(|(_, order)| marker.draw_order >= order).unwrap_or(true) {
                best = Some((*id, marker.draw_order));
            }
        }

        best.map(|(id, _)| id)
    }

    pub fn get(&self, id: MarkerId) -> Option<&Marker> {
        self.markers.get(&id)
    }
}

#[cfg(test)]
mod tests {
    use crate::cartesian::Size;

    use super::*;

    #[test]
    fn crud_round_trip() {
        let mut markers = MarkerManager::new();
        let id = markers.add();
        assert_ne!(id, 0);

        assert!(markers.set_point(id, LngLat::new(10.0, 20.0)));
        assert!(markers.set_styling(id, "{ style: points }"));
        assert!(markers.set_visible(id, false));
        assert!(markers.set_draw_order(id, 5));

        let marker = markers.get(id).unwrap();
        assert!(matches!(marker.geometry, MarkerGeometry::Point(_)));
        assert!(!marker.visible);
        assert_eq!(marker.draw_order, 5);

        assert!(markers.remove(id));
        assert!(!markers.remove(id));
        assert!(!markers.set_point(id, LngLat::new(0.0, 0.0)));
    }

    #[test]
    fn eased_point_animates() {
        let mut markers = MarkerManager::new();
        let id = markers.add();
        markers.set_point(id, LngLat::new(0.0, 0.0));
        markers.set_point_eased(id, LngLat::new(10.0, 0.0), Duration::from_secs(60));

        assert!(markers.update(0.016));
    }

    #[test]
    fn pick_finds_point_marker() {
        let view = View::new(Point2::new(0.0, 0.0), 10.0).with_size(Size::new(512.0, 512.0));

        let mut markers = MarkerManager::new();
        let id = markers.add();
        markers.set_point(id, LngLat::new(0.0, 0.0));

        // The view is centered on the marker, so the screen center hits it.
        assert_eq!(markers.pick_at(&view, 256.0, 256.0, 2.0), Some(id));
        assert_eq!(markers.pick_at(&view, 0.0, 0.0, 2.0), None);

        markers.set_visible(id, false);
        assert_eq!(markers.pick_at(&view, 256.0, 256.0, 2.0), None);
    }
}
