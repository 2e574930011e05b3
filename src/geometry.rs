//! Coordinate utilities: normalized (0..1) versus pixel geometry.
//!
//! Boxes are always materialised as four vertices in the order
//! bottom-left, top-left, top-right, bottom-right, in image coordinates where
//! `y` grows downward (so "bottom" is the larger `y`).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::error::{KiliError, Result};

/// A vertex. Points parsed from a payload remember which coordinates were
/// written as integers so they are re-emitted the same way.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
    #[serde(skip)]
    integral: (bool, bool),
}

impl PartialEq for Point {
    fn eq(&self, other: &Self) -> bool {
        self.x == other.x && self.y == other.y
    }
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            integral: (false, false),
        }
    }

    pub(crate) fn from_value(value: &Value) -> Result<Self> {
        let coordinate = |key: &str| {
            value
                .get(key)
                .and_then(|v| v.as_f64().map(|f| (f, v.is_i64())))
        };
        match (coordinate("x"), coordinate("y")) {
            (Some((x, x_integral)), Some((y, y_integral))) => Ok(Self {
                x,
                y,
                integral: (x_integral, y_integral),
            }),
            _ => Err(KiliError::geometry(format!("malformed point {}", value))),
        }
    }

    pub(crate) fn to_value(self) -> Value {
        let number = |value: f64, integral: bool| {
            if integral {
                Value::Number(Number::from(value as i64))
            } else {
                Number::from_f64(value).map_or(Value::Null, Value::Number)
            }
        };
        let mut map = Map::new();
        map.insert("x".to_string(), number(self.x, self.integral.0));
        map.insert("y".to_string(), number(self.y, self.integral.1));
        Value::Object(map)
    }

    fn is_normalized(&self) -> bool {
        (0.0..=1.0).contains(&self.x) && (0.0..=1.0).contains(&self.y)
    }
}

/// Check that a point lies inside the unit square.
pub fn validate_normalized_point(point: &Point) -> Result<()> {
    if point.x.is_finite() && point.y.is_finite() && point.is_normalized() {
        Ok(())
    } else {
        Err(KiliError::geometry(format!(
            "point ({}, {}) is outside [0, 1]",
            point.x, point.y
        )))
    }
}

/// Closed ring of vertices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polygon {
    pub vertices: Vec<Point>,
}

impl Polygon {
    pub fn new(vertices: Vec<Point>) -> Self {
        Self { vertices }
    }

    pub fn distinct_vertices(&self) -> usize {
        let mut distinct: Vec<Point> = Vec::with_capacity(self.vertices.len());
        for vertex in &self.vertices {
            if !distinct.contains(vertex) {
                distinct.push(*vertex);
            }
        }
        distinct.len()
    }

    /// A normalized polygon needs three distinct vertices inside the unit square.
    pub fn validate(&self) -> Result<()> {
        if self.distinct_vertices() < 3 {
            return Err(KiliError::geometry(format!(
                "polygon has {} distinct vertices, at least 3 are required",
                self.distinct_vertices()
            )));
        }
        self.vertices.iter().try_for_each(validate_normalized_point)
    }

    pub fn bounding_box(&self) -> Result<BoundingBox> {
        BoundingBox::from_vertices(&self.vertices)
    }

    /// Vertices flattened as `[x0, y0, x1, y1, ...]`.
    pub fn flatten(&self) -> Vec<f64> {
        self.vertices.iter().flat_map(|p| [p.x, p.y]).collect()
    }

    pub fn area(&self) -> f64 {
        polygon_area(&self.flatten())
    }
}

/// Axis-aligned box given by its extremes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x_min: f64,
    pub y_min: f64,
    pub x_max: f64,
    pub y_max: f64,
}

impl BoundingBox {
    pub fn new(x_min: f64, y_min: f64, x_max: f64, y_max: f64) -> Result<Self> {
        if !(x_min < x_max && y_min < y_max) {
            return Err(KiliError::geometry(format!(
                "box ({}, {}) - ({}, {}) has zero or negative area",
                x_min, y_min, x_max, y_max
            )));
        }
        Ok(Self {
            x_min,
            y_min,
            x_max,
            y_max,
        })
    }

    /// Smallest box enclosing the given vertices.
    pub fn from_vertices(vertices: &[Point]) -> Result<Self> {
        if Polygon::new(vertices.to_vec()).distinct_vertices() < 3 {
            return Err(KiliError::geometry(format!(
                "box needs at least 3 distinct vertices, got {}",
                vertices.len()
            )));
        }
        let (x_min, y_min, x_max, y_max) = vertices.iter().fold(
            (f64::MAX, f64::MAX, f64::MIN, f64::MIN),
            |(x_min, y_min, x_max, y_max), p| {
                (x_min.min(p.x), y_min.min(p.y), x_max.max(p.x), y_max.max(p.y))
            },
        );
        Self::new(x_min, y_min, x_max, y_max)
    }

    /// Box from a center point and its size (the YOLO convention).
    pub fn from_center(center_x: f64, center_y: f64, width: f64, height: f64) -> Result<Self> {
        Self::new(
            center_x - width / 2.0,
            center_y - height / 2.0,
            center_x + width / 2.0,
            center_y + height / 2.0,
        )
    }

    /// Box from a top-left corner and its size (the COCO convention).
    pub fn from_xywh(x: f64, y: f64, width: f64, height: f64) -> Result<Self> {
        Self::new(x, y, x + width, y + height)
    }

    pub fn width(&self) -> f64 {
        self.x_max - self.x_min
    }

    pub fn height(&self) -> f64 {
        self.y_max - self.y_min
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.x_min + self.x_max) / 2.0,
            (self.y_min + self.y_max) / 2.0,
        )
    }

    pub fn area(&self) -> f64 {
        self.width() * self.height()
    }

    /// `[x, y, width, height]` with `(x, y)` the top-left corner.
    pub fn to_xywh(&self) -> [f64; 4] {
        [self.x_min, self.y_min, self.width(), self.height()]
    }

    /// Bottom-left, top-left, top-right, bottom-right.
    pub fn to_vertices(&self) -> [Point; 4] {
        [
            Point::new(self.x_min, self.y_max),
            Point::new(self.x_min, self.y_min),
            Point::new(self.x_max, self.y_min),
            Point::new(self.x_max, self.y_max),
        ]
    }

    pub fn to_polygon(&self) -> Polygon {
        Polygon::new(self.to_vertices().to_vec())
    }

    /// Clamp to the unit square, for boxes decoded from lossy formats.
    pub fn clamp_normalized(&self) -> Result<Self> {
        Self::new(
            self.x_min.clamp(0.0, 1.0),
            self.y_min.clamp(0.0, 1.0),
            self.x_max.clamp(0.0, 1.0),
            self.y_max.clamp(0.0, 1.0),
        )
    }
}

/// Geometry that can be rescaled between normalized and pixel space.
pub trait Coordinates: Sized {
    fn scale(&self, sx: f64, sy: f64) -> Self;
}

impl Coordinates for Point {
    fn scale(&self, sx: f64, sy: f64) -> Self {
        Point::new(self.x * sx, self.y * sy)
    }
}

impl Coordinates for BoundingBox {
    fn scale(&self, sx: f64, sy: f64) -> Self {
        BoundingBox {
            x_min: self.x_min * sx,
            y_min: self.y_min * sy,
            x_max: self.x_max * sx,
            y_max: self.y_max * sy,
        }
    }
}

impl Coordinates for Polygon {
    fn scale(&self, sx: f64, sy: f64) -> Self {
        Polygon::new(self.vertices.iter().map(|p| p.scale(sx, sy)).collect())
    }
}

impl Coordinates for Vec<Point> {
    fn scale(&self, sx: f64, sy: f64) -> Self {
        self.iter().map(|p| p.scale(sx, sy)).collect()
    }
}

fn check_dimensions(width: f64, height: f64) -> Result<()> {
    if width > 0.0 && height > 0.0 && width.is_finite() && height.is_finite() {
        Ok(())
    } else {
        Err(KiliError::geometry(format!(
            "image dimensions {}x{} must be positive",
            width, height
        )))
    }
}

/// Pixel → normalized.
pub fn normalize<T: Coordinates>(value: &T, width: f64, height: f64) -> Result<T> {
    check_dimensions(width, height)?;
    Ok(value.scale(1.0 / width, 1.0 / height))
}

/// Normalized → pixel.
pub fn denormalize<T: Coordinates>(value: &T, width: f64, height: f64) -> Result<T> {
    check_dimensions(width, height)?;
    Ok(value.scale(width, height))
}

/// Normalized rectangle vertices from pixel corners, in the fixed box order.
pub fn normalized_rectangle(
    x_min: f64,
    y_min: f64,
    x_max: f64,
    y_max: f64,
    width: f64,
    height: f64,
) -> Result<Polygon> {
    let pixel_box = BoundingBox::new(x_min, y_min, x_max, y_max)?;
    let polygon = normalize(&pixel_box, width, height)?.to_polygon();
    polygon.validate()?;
    Ok(polygon)
}

/// Calculate polygon area using the shoelace formula
pub fn polygon_area(polygon: &[f64]) -> f64 {
    if polygon.len() < 6 || polygon.len() % 2 != 0 {
        return 0.0;
    }

    let n = polygon.len() / 2;
    let twice_area: f64 = (0..n)
        .map(|i| {
            let j = (i + 1) % n;
            polygon[i * 2] * polygon[j * 2 + 1] - polygon[j * 2] * polygon[i * 2 + 1]
        })
        .sum();

    twice_area.abs() / 2.0
}
