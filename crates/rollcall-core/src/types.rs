use serde::{Deserialize, Serialize};

/// Human-readable label a face is enrolled and classified under.
pub type Identity = String;

/// Axis-aligned face region in frame pixel coordinates.
///
/// Detectors may report boxes that spill past the frame edge, so the origin is
/// signed. Use [`Region::clip`] before touching pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    /// Intersect this region with a `frame_width` × `frame_height` frame.
    ///
    /// Returns `None` when no pixel of the region lies inside the frame.
    pub fn clip(&self, frame_width: u32, frame_height: u32) -> Option<Region> {
        let x0 = i64::from(self.x).max(0);
        let y0 = i64::from(self.y).max(0);
        let x1 = (i64::from(self.x) + i64::from(self.width)).min(i64::from(frame_width));
        let y1 = (i64::from(self.y) + i64::from(self.height)).min(i64::from(frame_height));

        if x1 <= x0 || y1 <= y0 {
            return None;
        }

        Some(Region {
            x: x0 as i32,
            y: y0 as i32,
            width: (x1 - x0) as u32,
            height: (y1 - y0) as u32,
        })
    }
}

/// Fixed-length feature vector produced by the encoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub values: Vec<f32>,
}

impl FeatureVector {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Squared Euclidean distance.
    ///
    /// Accumulates in `f64`: luminance vectors are integral, so sums stay exact
    /// and equidistant training entries compare equal.
    pub fn squared_distance(&self, other: &FeatureVector) -> f64 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| {
                let d = f64::from(*a) - f64::from(*b);
                d * d
            })
            .sum()
    }

    /// Euclidean distance between two vectors.
    pub fn euclidean_distance(&self, other: &FeatureVector) -> f64 {
        self.squared_distance(other).sqrt()
    }
}

/// Result of classifying one feature vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub identity: Identity,
    /// Euclidean distance to the nearest training vector.
    pub distance: f64,
    /// Insertion index of the nearest training vector.
    pub index: usize,
}
