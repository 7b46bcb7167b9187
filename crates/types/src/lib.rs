//! Shared point-cloud and keypoint types for sweep-slam.

use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};

/// Point label: transient points can be resampled out of the map,
/// fixed points are never overwritten.
pub const LABEL_TRANSIENT: u8 = 0;
pub const LABEL_FIXED: u8 = 1;

/// A single LiDAR return.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Point {
    /// Cartesian position in the cloud's frame (meters)
    pub x: f64,
    pub y: f64,
    pub z: f64,
    /// Return intensity (sensor units)
    pub intensity: f64,
    /// Acquisition time relative to the start of the sweep (seconds)
    pub time: f64,
    /// Laser ring id, dense and ascending upward
    pub ring: u16,
    /// 0 = transient, 1 = fixed (anchored in the map)
    pub label: u8,
}

impl Point {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self {
            x,
            y,
            z,
            ..Default::default()
        }
    }

    pub fn position(&self) -> Vector3<f64> {
        Vector3::new(self.x, self.y, self.z)
    }

    pub fn point3(&self) -> Point3<f64> {
        Point3::new(self.x, self.y, self.z)
    }

    /// Distance from the sensor origin of the cloud's frame.
    pub fn range(&self) -> f64 {
        self.position().norm()
    }

    /// Same return moved to a new position, all scalar fields kept.
    pub fn with_position(&self, p: Vector3<f64>) -> Self {
        Self {
            x: p.x,
            y: p.y,
            z: p.z,
            ..*self
        }
    }
}

/// Coordinate frame identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Frame {
    /// LiDAR sensor frame
    Lidar,
    /// Robot body frame, rigidly linked to the LiDAR
    #[default]
    Base,
    /// Fixed world frame, coincides with Base at the first frame
    World,
}

/// Cloud header: acquisition stamp and frame bookkeeping.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Header {
    /// Sweep start time (seconds, sensor clock)
    pub stamp: f64,
    /// Frame the points are expressed in
    pub frame: Frame,
    /// Monotonic frame counter assigned by the driver
    pub seq: u64,
}

/// An ordered collection of points with a header.
///
/// Ordering matters only inside the keypoint extractor, where points
/// must be azimuthally monotonic within each scanline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PointCloud {
    pub header: Header,
    pub points: Vec<Point>,
}

impl PointCloud {
    pub fn new(header: Header) -> Self {
        Self {
            header,
            points: Vec::new(),
        }
    }

    pub fn with_points(header: Header, points: Vec<Point>) -> Self {
        Self { header, points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Axis-aligned bounding box of the cloud, None when empty.
    pub fn bounding_box(&self) -> Option<(Vector3<f64>, Vector3<f64>)> {
        let first = self.points.first()?.position();
        let mut min = first;
        let mut max = first;
        for p in &self.points[1..] {
            let v = p.position();
            min = min.inf(&v);
            max = max.sup(&v);
        }
        Some((min, max))
    }
}

/// Keypoint category. Every keypoint in the map carries exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    /// Sharp depth or angle discontinuity
    Edge,
    /// Locally flat surface
    Planar,
    /// Neither edge nor planar, subsampled
    Blob,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Edge, Category::Planar, Category::Blob];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Edge => "edges",
            Category::Planar => "planars",
            Category::Blob => "blobs",
        }
    }
}

/// One cloud per keypoint category, all in the same frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Keypoints {
    pub edges: PointCloud,
    pub planars: PointCloud,
    pub blobs: PointCloud,
}

impl Keypoints {
    pub fn get(&self, category: Category) -> &PointCloud {
        match category {
            Category::Edge => &self.edges,
            Category::Planar => &self.planars,
            Category::Blob => &self.blobs,
        }
    }

    pub fn get_mut(&mut self, category: Category) -> &mut PointCloud {
        match category {
            Category::Edge => &mut self.edges,
            Category::Planar => &mut self.planars,
            Category::Blob => &mut self.blobs,
        }
    }

    pub fn total_len(&self) -> usize {
        self.edges.len() + self.planars.len() + self.blobs.len()
    }

    /// Bounding box over all three categories together.
    pub fn bounding_box(&self) -> Option<(Vector3<f64>, Vector3<f64>)> {
        let mut bounds: Option<(Vector3<f64>, Vector3<f64>)> = None;
        for category in Category::ALL {
            if let Some((lo, hi)) = self.get(category).bounding_box() {
                bounds = Some(match bounds {
                    Some((min, max)) => (min.inf(&lo), max.sup(&hi)),
                    None => (lo, hi),
                });
            }
        }
        bounds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_serde_roundtrip() {
        let p = Point {
            x: 1.5,
            y: -2.0,
            z: 0.25,
            intensity: 42.0,
            time: 0.05,
            ring: 7,
            label: LABEL_FIXED,
        };
        let json = serde_json::to_string(&p).unwrap();
        let decoded: Point = serde_json::from_str(&json).unwrap();
        assert!((decoded.x - p.x).abs() < 1e-12);
        assert!((decoded.intensity - p.intensity).abs() < 1e-12);
        assert_eq!(decoded.ring, p.ring);
        assert_eq!(decoded.label, p.label);
    }

    #[test]
    fn test_point_range() {
        let p = Point::new(3.0, 4.0, 0.0);
        assert!((p.range() - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_with_position_keeps_fields() {
        let p = Point {
            intensity: 9.0,
            time: 0.1,
            ring: 3,
            ..Point::new(1.0, 2.0, 3.0)
        };
        let moved = p.with_position(Vector3::new(-1.0, 0.0, 1.0));
        assert_eq!(moved.ring, 3);
        assert!((moved.intensity - 9.0).abs() < 1e-12);
        assert!((moved.x + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_cloud_bounding_box() {
        let mut cloud = PointCloud::default();
        assert!(cloud.bounding_box().is_none());

        cloud.points.push(Point::new(1.0, -1.0, 0.0));
        cloud.points.push(Point::new(-2.0, 3.0, 5.0));
        let (min, max) = cloud.bounding_box().unwrap();
        assert!((min.x + 2.0).abs() < 1e-12);
        assert!((min.y + 1.0).abs() < 1e-12);
        assert!((max.y - 3.0).abs() < 1e-12);
        assert!((max.z - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_keypoints_access_by_category() {
        let mut kp = Keypoints::default();
        kp.get_mut(Category::Edge).points.push(Point::new(1.0, 0.0, 0.0));
        kp.get_mut(Category::Blob).points.push(Point::new(0.0, 1.0, 0.0));
        assert_eq!(kp.get(Category::Edge).len(), 1);
        assert_eq!(kp.get(Category::Planar).len(), 0);
        assert_eq!(kp.total_len(), 2);
    }

    #[test]
    fn test_keypoints_bounding_box_spans_categories() {
        let mut kp = Keypoints::default();
        kp.edges.points.push(Point::new(-1.0, 0.0, 0.0));
        kp.planars.points.push(Point::new(4.0, 2.0, -3.0));
        let (min, max) = kp.bounding_box().unwrap();
        assert!((min.x + 1.0).abs() < 1e-12);
        assert!((max.x - 4.0).abs() < 1e-12);
        assert!((min.z + 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_category_names() {
        assert_eq!(Category::Edge.as_str(), "edges");
        assert_eq!(Category::Planar.as_str(), "planars");
        assert_eq!(Category::Blob.as_str(), "blobs");
    }
}
