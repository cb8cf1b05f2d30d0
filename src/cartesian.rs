//! Cartesian primitives used by the view and the tile grid.

use serde::{Deserialize, Serialize};

pub type Point2 = nalgebra::Point2<f64>;

/// Rectangle in 2d projected coordinate space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    x_min: f64,
    y_min: f64,
    x_max: f64,
    y_max: f64,
}

impl Rect {
    /// Creates a new rectangle.
    pub fn new(x_min: f64, y_min: f64, x_max: f64, y_max: f64) -> Self {
        let (x_min, x_max) = if x_min > x_max {
            (x_max, x_min)
        } else {
            (x_min, x_max)
        };
        let (y_min, y_max) = if y_min > y_max {
            (y_max, y_min)
        } else {
            (y_min, y_max)
        };

        Self {
            x_min,
            y_min,
            x_max,
            y_max,
        }
    }

    pub fn x_min(&self) -> f64 {
        self.x_min
    }

    pub fn x_max(&self) -> f64 {
        self.x_max
    }

    pub fn y_min(&self) -> f64 {
        self.y_min
    }

    pub fn y_max(&self) -> f64 {
        self.y_max
    }

    /// Width of the rectangle. Guaranteed to be non-negative.
    pub fn width(&self) -> f64 {
        self.x_max - self.x_min
    }

    /// Height of the rectangle. Guaranteed to be non-negative.
    pub fn height(&self) -> f64 {
        self.y_max - self.y_min
    }

    /// Returns a minimum rectangle that contains all the points in the iterator.
    ///
    /// Returns `None` if the iterator is empty.
    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a Point2>) -> Option<Self> {
        let mut iterator = points.into_iter();
        let first = iterator.next()?;
        let mut x_min = first.x;
        let mut y_min = first.y;
        let mut x_max = first.x;
        let mut y_max = first.y;

        for p in iterator {
            if x_min > p.x {
                x_min = p.x;
            }
            if y_min > p.y {
                y_min = p.y;
            }
            if x_max < p.x {
                x_max = p.x;
            }
            if y_max < p.y {
                y_max = p.y;
            }
        }

        Some(Self {
            x_min,
            y_min,
            x_max,
            y_max,
        })
    }

    /// Returns `true` if the point is inside (or on a side) of the rectangle.
    pub fn contains(&self, point: &Point2) -> bool {
        self.x_min <= point.x
            && self.x_max >= point.x
            && self.y_min <= point.y
            && self.y_max >= point.y
    }

    /// Changes the width and height of the rectangle by the factor of `factor`, keeping the center
    /// of the rectangle at the same place.
    pub fn magnify(&self, factor: f64) -> Self {
        let cx = (self.x_min + self.x_max) / 2.0;
        let cy = (self.y_min + self.y_max) / 2.0;
        let half_width = self.width() / 2.0 * factor;
        let half_height = self.height() / 2.0 * factor;
        Self {
            x_min: cx - half_width,
            x_max: cx + half_width,
            y_min: cy - half_height,
            y_max: cy + half_height,
        }
    }

    /// Grows the rectangle by `amount` in every direction.
    pub fn expand(&self, amount: f64) -> Self {
        Self {
            x_min: self.x_min - amount,
            y_min: self.y_min - amount,
            x_max: self.x_max + amount,
            y_max: self.y_max + amount,
        }
    }

    /// Returns a new rectangle, boundaries of which are inside of boundaries of this and the
    /// `other` rectangles.
    pub fn limit(&self, other: Self) -> Self {
        Self {
            x_min: self.x_min.max(other.x_min),
            y_min: self.y_min.max(other.y_min),
            x_max: self.x_max.min(other.x_max),
            y_max: self.y_max.min(other.y_max),
        }
    }

    /// Returns the center point of the rectangle.
    pub fn center(&self) -> Point2 {
        Point2::new(
            (self.x_min + self.x_max) / 2.0,
            (self.y_min + self.y_max) / 2.0,
        )
    }

    /// Returns true if two rectangles have at least one common point.
    pub fn intersects(&self, other: Rect) -> bool {
        self.x_max >= other.x_min
            && self.x_min <= other.x_max
            && self.y_max >= other.y_min
            && self.y_min <= other.y_max
    }
}

/// Size of a rectangular area in pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Size {
    width: f64,
    height: f64,
}

impl Size {
    pub fn new(width: f64, height: f64) -> Self {
        Self {
            width: width.max(0.0),
            height: height.max(0.0),
        }
    }

    pub fn width(&self) -> f64 {
        self.width
    }

    pub fn half_width(&self) -> f64 {
        self.width / 2.0
    }

    pub fn height(&self) -> f64 {
        self.height
    }

    pub fn half_height(&self) -> f64 {
        self.height / 2.0
    }

    pub fn is_zero(&self) -> bool {
        self.width == 0.0 || self.height == 0.0
    }
}
