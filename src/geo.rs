//! Geographic coordinates and the web mercator projection.

use serde::{Deserialize, Serialize};

use crate::cartesian::Point2;

pub const EARTH_RADIUS: f64 = 6378137.0;
pub const EARTH_HALF_CIRCUMFERENCE: f64 = std::f64::consts::PI * EARTH_RADIUS;

/// Maximum latitude that can be represented in the web mercator projection.
pub const MAX_LATITUDE: f64 = 85.05112878;

/// Geographic position in degrees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LngLat {
    pub longitude: f64,
    pub latitude: f64,
}

impl LngLat {
    pub fn new(longitude: f64, latitude: f64) -> Self {
        Self {
            longitude,
            latitude,
        }
    }
}

/// Projects a geographic position into web mercator meters.
pub fn lng_lat_to_meters(position: LngLat) -> Point2 {
    let latitude = position.latitude.clamp(-MAX_LATITUDE, MAX_LATITUDE);
    let x = position.longitude.to_radians() * EARTH_RADIUS;
    let y = (std::f64::consts::FRAC_PI_4 + latitude.to_radians() / 2.0)
        .tan()
        .ln()
        * EARTH_RADIUS;

    Point2::new(x, y)
}

/// Unprojects web mercator meters into a geographic position.
pub fn meters_to_lng_lat(point: Point2) -> LngLat {
    let longitude = (point.x / EARTH_RADIUS).to_degrees();
    let latitude =
        (2.0 * (point.y / EARTH_RADIUS).exp().atan() - std::f64::consts::FRAC_PI_2).to_degrees();

    LngLat {
        longitude,
        latitude,
    }
}
