//! Rolling two-level voxel grid for keypoint maps.
//!
//! The outer grid is a cube of N³ cells at `voxel_resolution`, keyed
//! by a flattened 3D index and centered near the sensor; the center
//! rolls in whole-voxel increments so the window tracks the
//! trajectory. Each occupied outer cell holds a sparse inner grid at
//! `leaf_size` resolution storing at most one point per leaf.
//!
//! A KD-tree over a sub-map (the voxels intersecting a query bounding
//! box) is cached for the registration nearest-neighbor queries and
//! invalidated by any mutation.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use kdtree::distance::squared_euclidean;
use kdtree::KdTree;
use nalgebra::Vector3;
use thiserror::Error;
use tracing::debug;
use types::{Frame, Header, Point, PointCloud, LABEL_FIXED, LABEL_TRANSIENT};

#[derive(Error, Debug)]
pub enum MapError {
    #[error("Grid size must be positive")]
    ZeroGridSize,
    #[error("Resolution must be positive, got {0}")]
    BadResolution(f64),
}

/// How an incoming point merges with the point already stored in its
/// inner voxel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SamplingMode {
    /// Keep the first point ever stored
    First,
    /// Overwrite with the newest point
    Last,
    /// Keep the more reflective point
    #[default]
    MaxIntensity,
    /// Keep the point closest to the leaf center
    CenterPoint,
    /// Blend the batch mean into the stored point by update count
    Centroid,
}

/// Inner storage unit: one point and its update count.
#[derive(Debug, Clone, Copy)]
pub struct Voxel {
    pub point: Point,
    pub count: u32,
}

/// Outer 3D index to flat key, `z·N² + y·N + x`.
pub fn flatten(idx: Vector3<usize>, n: usize) -> usize {
    idx.z * n * n + idx.y * n + idx.x
}

/// Inverse of [`flatten`].
pub fn unflatten(key: usize, n: usize) -> Vector3<usize> {
    Vector3::new(key % n, (key / n) % n, key / (n * n))
}

struct SubMap {
    tree: KdTree<usize, [f64; 3]>,
    points: Vec<Point>,
}

/// Accumulator for reducing one `add` batch to one candidate per leaf.
struct BatchSlot {
    candidate: Point,
    position_sum: Vector3<f64>,
    intensity_sum: f64,
    time_sum: f64,
    count: u32,
}

/// Rolling voxel grid holding one keypoint category.
pub struct RollingGrid {
    /// Cells per axis of the outer grid
    grid_size: usize,
    /// Outer cell edge length (meters), snapped to a whole number of leaves
    voxel_resolution: f64,
    /// Inner leaf edge length (meters)
    leaf_size: f64,
    /// Leaves per outer cell per axis
    leaves_per_voxel: usize,
    /// Geometric center of the outer grid, voxel-aligned
    position: Vector3<f64>,
    grid: HashMap<usize, HashMap<usize, Voxel>>,
    n_points: usize,
    sampling: SamplingMode,
    submap: Option<SubMap>,
}

impl RollingGrid {
    pub fn new(grid_size: usize, voxel_resolution: f64, leaf_size: f64) -> Self {
        let leaves = (voxel_resolution / leaf_size).round().max(1.0) as usize;
        Self {
            grid_size,
            voxel_resolution: leaves as f64 * leaf_size,
            leaf_size,
            leaves_per_voxel: leaves,
            position: Vector3::zeros(),
            grid: HashMap::new(),
            n_points: 0,
            sampling: SamplingMode::default(),
            submap: None,
        }
    }

    /// Clear all voxels and recenter the grid on `center`, snapped to
    /// the voxel lattice.
    pub fn reset(&mut self, center: Vector3<f64>) {
        self.grid.clear();
        self.n_points = 0;
        self.submap = None;
        self.position = center.map(|c| (c / self.voxel_resolution).floor() * self.voxel_resolution);
    }

    /// Drop all voxels, keep the geometry.
    pub fn clear(&mut self) {
        self.grid.clear();
        self.n_points = 0;
        self.submap = None;
    }

    pub fn size(&self) -> usize {
        self.n_points
    }

    pub fn is_empty(&self) -> bool {
        self.n_points == 0
    }

    pub fn grid_size(&self) -> usize {
        self.grid_size
    }

    pub fn voxel_resolution(&self) -> f64 {
        self.voxel_resolution
    }

    pub fn leaf_size(&self) -> f64 {
        self.leaf_size
    }

    pub fn position(&self) -> Vector3<f64> {
        self.position
    }

    pub fn sampling_mode(&self) -> SamplingMode {
        self.sampling
    }

    pub fn set_sampling_mode(&mut self, mode: SamplingMode) {
        self.sampling = mode;
    }

    /// World bounds of the current window.
    pub fn bounds(&self) -> (Vector3<f64>, Vector3<f64>) {
        let half = self.grid_size as f64 / 2.0 * self.voxel_resolution;
        (self.position.add_scalar(-half), self.position.add_scalar(half))
    }

    fn window_min(&self) -> Vector3<f64> {
        self.bounds().0
    }

    /// Outer cell index of a point, None when outside the window.
    fn outer_index(&self, p: Vector3<f64>) -> Option<Vector3<usize>> {
        let rel = (p - self.window_min()) / self.voxel_resolution;
        let mut idx = Vector3::zeros();
        for axis in 0..3 {
            let c = rel[axis].floor();
            if c < 0.0 || c >= self.grid_size as f64 {
                return None;
            }
            idx[axis] = c as usize;
        }
        Some(idx)
    }

    fn cell_min(&self, idx: Vector3<usize>) -> Vector3<f64> {
        self.window_min() + idx.map(|i| i as f64) * self.voxel_resolution
    }

    fn inner_index(&self, p: Vector3<f64>, outer: Vector3<usize>) -> usize {
        let rel = (p - self.cell_min(outer)) / self.leaf_size;
        let m = self.leaves_per_voxel;
        let idx = rel.map(|c| (c.floor() as isize).clamp(0, m as isize - 1) as usize);
        flatten(idx, m)
    }

    /// Center of the leaf holding flat inner key `key` in outer cell `outer`.
    fn leaf_center(&self, outer: Vector3<usize>, key: usize) -> Vector3<f64> {
        let idx = unflatten(key, self.leaves_per_voxel);
        self.cell_min(outer) + (idx.map(|i| i as f64).add_scalar(0.5)) * self.leaf_size
    }

    /// Concatenate all stored voxel points, in deterministic key order.
    pub fn get(&self) -> PointCloud {
        let mut cloud = PointCloud::new(Header {
            frame: Frame::World,
            ..Header::default()
        });
        let mut outer_keys: Vec<&usize> = self.grid.keys().collect();
        outer_keys.sort_unstable();
        for &outer in outer_keys {
            let inner = &self.grid[&outer];
            let mut inner_keys: Vec<&usize> = inner.keys().collect();
            inner_keys.sort_unstable();
            for &key in inner_keys {
                cloud.points.push(inner[&key].point);
            }
        }
        cloud
    }

    /// Translate the window by whole voxels so `[bbox_min, bbox_max]`
    /// fits. Voxels leaving the window are dropped; the rest keep
    /// their contents under shifted keys. No-op when the box already
    /// fits.
    pub fn roll(&mut self, bbox_min: Vector3<f64>, bbox_max: Vector3<f64>) {
        let (window_min, window_max) = self.bounds();
        let mut shift = Vector3::<i64>::zeros();
        for axis in 0..3 {
            if bbox_min[axis] < window_min[axis] {
                shift[axis] =
                    ((bbox_min[axis] - window_min[axis]) / self.voxel_resolution).floor() as i64;
            } else if bbox_max[axis] > window_max[axis] {
                shift[axis] =
                    ((bbox_max[axis] - window_max[axis]) / self.voxel_resolution).ceil() as i64;
            }
        }
        if shift == Vector3::zeros() {
            return;
        }

        let n = self.grid_size;
        let mut rolled: HashMap<usize, HashMap<usize, Voxel>> = HashMap::new();
        let mut dropped = 0usize;
        let drained: Vec<(usize, HashMap<usize, Voxel>)> = self.grid.drain().collect();
        for (key, inner) in drained {
            let old = unflatten(key, n).map(|i| i as i64);
            let new = old - shift;
            if (0..3).all(|a| new[a] >= 0 && new[a] < n as i64) {
                let new_key = flatten(new.map(|i| i as usize), n);
                rolled.insert(new_key, inner);
            } else {
                dropped += inner.len();
            }
        }
        self.grid = rolled;
        self.n_points -= dropped;
        self.position += shift.map(|s| s as f64) * self.voxel_resolution;
        self.submap = None;
        debug!(
            dx = shift.x,
            dy = shift.y,
            dz = shift.z,
            dropped,
            "Rolled voxel grid"
        );
    }

    /// Insert a cloud. `fixed` anchors the points (label 1, never
    /// overwritten later); `roll` first translates the window to fit
    /// the cloud's bounding box.
    pub fn add(&mut self, cloud: &PointCloud, fixed: bool, roll: bool) {
        if cloud.is_empty() {
            return;
        }
        if roll {
            if let Some((lo, hi)) = cloud.bounding_box() {
                self.roll(lo, hi);
            }
        }

        // Reduce the batch to one candidate per leaf so the update
        // count moves once per leaf per call.
        let mut batch: HashMap<(usize, usize), BatchSlot> = HashMap::new();
        let mut skipped = 0usize;
        for p in &cloud.points {
            let position = p.position();
            if !position.iter().all(|v| v.is_finite()) {
                skipped += 1;
                continue;
            }
            let Some(outer) = self.outer_index(position) else {
                skipped += 1;
                continue;
            };
            let outer_key = flatten(outer, self.grid_size);
            let inner_key = self.inner_index(position, outer);
            let mut point = *p;
            point.label = if fixed { LABEL_FIXED } else { LABEL_TRANSIENT };

            let slot = batch
                .entry((outer_key, inner_key))
                .or_insert_with(|| BatchSlot {
                    candidate: point,
                    position_sum: Vector3::zeros(),
                    intensity_sum: 0.0,
                    time_sum: 0.0,
                    count: 0,
                });
            slot.position_sum += position;
            slot.intensity_sum += point.intensity;
            slot.time_sum += point.time;
            slot.count += 1;
            match self.sampling {
                SamplingMode::First => {}
                SamplingMode::Last => slot.candidate = point,
                SamplingMode::MaxIntensity => {
                    if point.intensity > slot.candidate.intensity {
                        slot.candidate = point;
                    }
                }
                SamplingMode::CenterPoint => {
                    let center = self.leaf_center(outer, inner_key);
                    if (position - center).norm_squared()
                        < (slot.candidate.position() - center).norm_squared()
                    {
                        slot.candidate = point;
                    }
                }
                SamplingMode::Centroid => {}
            }
        }
        if skipped > 0 {
            debug!(skipped, "Points outside the rolling window were not added");
        }

        for ((outer_key, inner_key), slot) in batch {
            let candidate = match self.sampling {
                SamplingMode::Centroid => {
                    let inv = 1.0 / slot.count as f64;
                    let mut mean = slot.candidate;
                    let p = slot.position_sum * inv;
                    mean.x = p.x;
                    mean.y = p.y;
                    mean.z = p.z;
                    mean.intensity = slot.intensity_sum * inv;
                    mean.time = slot.time_sum * inv;
                    mean
                }
                _ => slot.candidate,
            };

            let center = match self.sampling {
                SamplingMode::CenterPoint => {
                    Some(self.leaf_center(unflatten(outer_key, self.grid_size), inner_key))
                }
                _ => None,
            };
            let inner = self.grid.entry(outer_key).or_default();
            match inner.entry(inner_key) {
                Entry::Vacant(entry) => {
                    entry.insert(Voxel {
                        point: candidate,
                        count: 1,
                    });
                    self.n_points += 1;
                }
                Entry::Occupied(mut entry) => {
                    let voxel = entry.get_mut();
                    if voxel.point.label == LABEL_FIXED {
                        continue;
                    }
                    match self.sampling {
                        SamplingMode::First => {}
                        SamplingMode::Last => voxel.point = candidate,
                        SamplingMode::MaxIntensity => {
                            if candidate.intensity > voxel.point.intensity {
                                voxel.point = candidate;
                            }
                        }
                        SamplingMode::CenterPoint => {
                            let center = center.unwrap();
                            if (candidate.position() - center).norm_squared()
                                < (voxel.point.position() - center).norm_squared()
                            {
                                voxel.point = candidate;
                            }
                        }
                        SamplingMode::Centroid => {
                            let count = voxel.count as f64;
                            let blended = (voxel.point.position() * count
                                + candidate.position())
                                / (count + 1.0);
                            let intensity = (voxel.point.intensity * count
                                + candidate.intensity)
                                / (count + 1.0);
                            voxel.point = Point {
                                intensity,
                                ..voxel.point.with_position(blended)
                            };
                        }
                    }
                    voxel.count += 1;
                }
            }
        }

        self.submap = None;
    }

    /// Change the outer grid extent, re-binning all stored points.
    pub fn set_grid_size(&mut self, grid_size: usize) -> Result<(), MapError> {
        if grid_size == 0 {
            return Err(MapError::ZeroGridSize);
        }
        let drained = self.get();
        self.grid_size = grid_size;
        self.rebin(drained);
        Ok(())
    }

    /// Change the outer voxel resolution, re-binning all stored points.
    pub fn set_voxel_resolution(&mut self, resolution: f64) -> Result<(), MapError> {
        if resolution <= 0.0 {
            return Err(MapError::BadResolution(resolution));
        }
        let drained = self.get();
        let leaves = (resolution / self.leaf_size).round().max(1.0) as usize;
        self.leaves_per_voxel = leaves;
        self.voxel_resolution = leaves as f64 * self.leaf_size;
        self.rebin(drained);
        Ok(())
    }

    /// Change the inner leaf size, re-binning all stored points.
    pub fn set_leaf_size(&mut self, leaf_size: f64) -> Result<(), MapError> {
        if leaf_size <= 0.0 {
            return Err(MapError::BadResolution(leaf_size));
        }
        let drained = self.get();
        self.leaf_size = leaf_size;
        let leaves = (self.voxel_resolution / leaf_size).round().max(1.0) as usize;
        self.leaves_per_voxel = leaves;
        self.voxel_resolution = leaves as f64 * leaf_size;
        self.rebin(drained);
        Ok(())
    }

    fn rebin(&mut self, drained: PointCloud) {
        let center = self.position;
        self.reset(center);
        let (fixed, transient): (Vec<Point>, Vec<Point>) = drained
            .points
            .into_iter()
            .partition(|p| p.label == LABEL_FIXED);
        let header = drained.header;
        self.add(&PointCloud::with_points(header, transient), false, false);
        self.add(&PointCloud::with_points(header, fixed), true, false);
    }

    /// Rebuild the cached KD-tree from all stored points, or from the
    /// voxels whose outer cell intersects `bbox`.
    pub fn build_submap_kdtree(&mut self, bbox: Option<(Vector3<f64>, Vector3<f64>)>) {
        let mut points = Vec::new();
        let mut outer_keys: Vec<&usize> = self.grid.keys().collect();
        outer_keys.sort_unstable();
        for &outer_key in outer_keys {
            if let Some((lo, hi)) = bbox {
                let idx = unflatten(outer_key, self.grid_size);
                let cell_lo = self.cell_min(idx);
                let cell_hi = cell_lo.add_scalar(self.voxel_resolution);
                let intersects =
                    (0..3).all(|a| cell_hi[a] >= lo[a] && cell_lo[a] <= hi[a]);
                if !intersects {
                    continue;
                }
            }
            let inner = &self.grid[&outer_key];
            let mut inner_keys: Vec<&usize> = inner.keys().collect();
            inner_keys.sort_unstable();
            for &key in inner_keys {
                points.push(inner[&key].point);
            }
        }

        let mut tree = KdTree::new(3);
        for (i, p) in points.iter().enumerate() {
            // finite by construction, add cannot fail
            let _ = tree.add([p.x, p.y, p.z], i);
        }
        self.submap = Some(SubMap { tree, points });
    }

    /// False iff no KD-tree is cached (any mutation drops it).
    pub fn submap_kdtree_valid(&self) -> bool {
        self.submap.is_some()
    }

    /// Points currently indexed by the cached KD-tree.
    pub fn submap_len(&self) -> usize {
        self.submap.as_ref().map_or(0, |s| s.points.len())
    }

    /// K nearest sub-map points to `query`, closest first, with
    /// Euclidean distances. Empty when no KD-tree is cached.
    pub fn submap_knn(&self, query: Vector3<f64>, k: usize) -> Vec<(f64, &Point)> {
        let Some(submap) = &self.submap else {
            return Vec::new();
        };
        match submap
            .tree
            .nearest(&[query.x, query.y, query.z], k, &squared_euclidean)
        {
            Ok(found) => found
                .into_iter()
                .map(|(d2, &i)| (d2.sqrt(), &submap.points[i]))
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Sum of inner map sizes, for consistency checks.
    pub fn stored_points(&self) -> usize {
        self.grid.values().map(|inner| inner.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(x: f64, y: f64, z: f64, intensity: f64) -> Point {
        Point {
            intensity,
            ..Point::new(x, y, z)
        }
    }

    fn cloud_of(points: Vec<Point>) -> PointCloud {
        PointCloud::with_points(Header::default(), points)
    }

    #[test]
    fn test_flatten_roundtrip() {
        let n = 5;
        for z in 0..n {
            for y in 0..n {
                for x in 0..n {
                    let idx = Vector3::new(x, y, z);
                    assert_eq!(unflatten(flatten(idx, n), n), idx);
                }
            }
        }
    }

    #[test]
    fn test_empty_map_add_single_point() {
        let mut grid = RollingGrid::new(50, 10.0, 0.2);
        grid.reset(Vector3::zeros());
        grid.add(&cloud_of(vec![point(0.1, 0.0, 0.0, 1.0)]), false, false);

        assert_eq!(grid.size(), 1);
        let out = grid.get();
        assert_eq!(out.len(), 1);
        assert!((out.points[0].x - 0.1).abs() < 1e-12);
        assert!(!grid.submap_kdtree_valid());
    }

    #[test]
    fn test_size_matches_inner_maps() {
        let mut grid = RollingGrid::new(20, 5.0, 0.5);
        grid.reset(Vector3::zeros());
        let points: Vec<Point> = (0..100)
            .map(|i| point(i as f64 * 0.3 - 15.0, (i % 7) as f64, 0.0, 1.0))
            .collect();
        grid.add(&cloud_of(points), false, false);
        assert_eq!(grid.size(), grid.stored_points());
    }

    #[test]
    fn test_stored_point_within_window() {
        let mut grid = RollingGrid::new(10, 2.0, 0.5);
        grid.reset(Vector3::zeros());
        grid.add(&cloud_of(vec![point(3.3, -2.7, 1.1, 1.0)]), false, false);
        let (lo, hi) = grid.bounds();
        for p in grid.get().points {
            let v = p.position();
            for a in 0..3 {
                assert!(v[a] >= lo[a] && v[a] <= hi[a]);
            }
        }
    }

    #[test]
    fn test_sampling_max_intensity() {
        let mut grid = RollingGrid::new(10, 1.0, 0.2);
        grid.reset(Vector3::zeros());
        grid.set_sampling_mode(SamplingMode::MaxIntensity);
        grid.add(&cloud_of(vec![point(0.0, 0.0, 0.0, 5.0)]), false, false);
        grid.add(&cloud_of(vec![point(0.01, 0.0, 0.0, 9.0)]), false, false);

        assert_eq!(grid.size(), 1);
        let out = grid.get();
        assert!((out.points[0].intensity - 9.0).abs() < 1e-12);
    }

    #[test]
    fn test_sampling_first_and_last() {
        for (mode, expected_x) in [(SamplingMode::First, 0.0), (SamplingMode::Last, 0.01)] {
            let mut grid = RollingGrid::new(10, 1.0, 0.2);
            grid.reset(Vector3::zeros());
            grid.set_sampling_mode(mode);
            grid.add(&cloud_of(vec![point(0.0, 0.0, 0.0, 1.0)]), false, false);
            grid.add(&cloud_of(vec![point(0.01, 0.0, 0.0, 1.0)]), false, false);
            let out = grid.get();
            assert_eq!(out.len(), 1);
            assert!(
                (out.points[0].x - expected_x).abs() < 1e-12,
                "mode {mode:?}"
            );
        }
    }

    #[test]
    fn test_sampling_center_point() {
        let mut grid = RollingGrid::new(10, 1.0, 0.5);
        grid.reset(Vector3::zeros());
        grid.set_sampling_mode(SamplingMode::CenterPoint);
        // leaf [0, 0.5)³ has center (0.25, 0.25, 0.25)
        grid.add(&cloud_of(vec![point(0.05, 0.05, 0.05, 1.0)]), false, false);
        grid.add(&cloud_of(vec![point(0.2, 0.2, 0.2, 2.0)]), false, false);
        let out = grid.get();
        assert_eq!(out.len(), 1);
        assert!((out.points[0].x - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_sampling_centroid_blends_batch_mean() {
        let mut grid = RollingGrid::new(10, 1.0, 0.5);
        grid.reset(Vector3::zeros());
        grid.set_sampling_mode(SamplingMode::Centroid);
        grid.add(&cloud_of(vec![point(0.0, 0.0, 0.0, 4.0)]), false, false);
        // batch mean: position (0.03, 0, 0), intensity 7
        grid.add(
            &cloud_of(vec![
                point(0.02, 0.0, 0.0, 6.0),
                point(0.04, 0.0, 0.0, 8.0),
            ]),
            false,
            false,
        );
        let out = grid.get();
        assert_eq!(out.len(), 1);
        assert!((out.points[0].x - 0.015).abs() < 1e-12);
        assert!((out.points[0].intensity - 5.5).abs() < 1e-12);
    }

    #[test]
    fn test_count_bumps_once_per_batch() {
        let mut grid = RollingGrid::new(10, 1.0, 0.5);
        grid.reset(Vector3::zeros());
        // two points into the same leaf within one call
        grid.add(
            &cloud_of(vec![
                point(0.1, 0.1, 0.1, 1.0),
                point(0.12, 0.1, 0.1, 2.0),
            ]),
            false,
            false,
        );
        let voxel_count: u32 = grid
            .grid
            .values()
            .flat_map(|inner| inner.values())
            .map(|v| v.count)
            .sum();
        assert_eq!(voxel_count, 1);
    }

    #[test]
    fn test_fixed_points_never_overwritten() {
        let mut grid = RollingGrid::new(10, 1.0, 0.2);
        grid.reset(Vector3::zeros());
        grid.set_sampling_mode(SamplingMode::Last);
        grid.add(&cloud_of(vec![point(0.0, 0.0, 0.0, 5.0)]), true, false);
        grid.add(&cloud_of(vec![point(0.01, 0.0, 0.0, 9.0)]), false, false);
        let out = grid.get();
        assert_eq!(out.len(), 1);
        assert!((out.points[0].intensity - 5.0).abs() < 1e-12);
        assert_eq!(out.points[0].label, LABEL_FIXED);
    }

    #[test]
    fn test_rolling_drop() {
        let mut grid = RollingGrid::new(3, 1.0, 0.2);
        grid.reset(Vector3::zeros());
        grid.add(&cloud_of(vec![point(0.5, 0.0, 0.0, 1.0)]), false, false);
        assert_eq!(grid.size(), 1);

        grid.roll(Vector3::new(5.0, 0.0, 0.0), Vector3::new(6.0, 0.0, 0.0));
        assert_eq!(grid.size(), 0);
        // window was [-1.5, 1.5]; fitting max 6.0 needs ceil(4.5) = 5 voxels
        assert!((grid.position().x - 5.0).abs() < 1e-12);
        assert!((grid.position().y - 0.0).abs() < 1e-12);
    }

    #[test]
    fn test_roll_idempotent_on_own_bbox() {
        let mut grid = RollingGrid::new(10, 1.0, 0.2);
        grid.reset(Vector3::zeros());
        let points = vec![
            point(0.5, 0.5, 0.0, 1.0),
            point(-1.2, 2.0, 0.3, 2.0),
            point(3.0, -3.0, 1.0, 3.0),
        ];
        grid.add(&cloud_of(points), false, false);
        let before = grid.get();
        let position = grid.position();

        let (lo, hi) = before.bounding_box().unwrap();
        grid.roll(lo, hi);

        let after = grid.get();
        assert_eq!(after.len(), before.len());
        assert!((grid.position() - position).norm() < 1e-12);
        for (a, b) in after.points.iter().zip(before.points.iter()) {
            assert!((a.position() - b.position()).norm() < 1e-12);
        }
    }

    #[test]
    fn test_roll_keeps_surviving_voxels() {
        let mut grid = RollingGrid::new(5, 1.0, 0.2);
        grid.reset(Vector3::zeros());
        grid.add(
            &cloud_of(vec![point(0.5, 0.0, 0.0, 1.0), point(2.0, 0.0, 0.0, 2.0)]),
            false,
            false,
        );
        // shift by one voxel: both points stay inside the new window
        grid.roll(Vector3::new(3.0, 0.0, 0.0), Vector3::new(3.2, 0.0, 0.0));
        assert_eq!(grid.size(), 2);
        let out = grid.get();
        let xs: Vec<f64> = out.points.iter().map(|p| p.x).collect();
        assert!(xs.iter().any(|&x| (x - 0.5).abs() < 1e-12));
        assert!(xs.iter().any(|&x| (x - 2.0).abs() < 1e-12));
    }

    #[test]
    fn test_kdtree_validity_bit() {
        let mut grid = RollingGrid::new(10, 1.0, 0.2);
        grid.reset(Vector3::zeros());
        assert!(!grid.submap_kdtree_valid());

        grid.add(&cloud_of(vec![point(0.5, 0.5, 0.0, 1.0)]), false, false);
        grid.build_submap_kdtree(None);
        assert!(grid.submap_kdtree_valid());

        grid.add(&cloud_of(vec![point(1.5, 0.5, 0.0, 1.0)]), false, false);
        assert!(!grid.submap_kdtree_valid());

        grid.build_submap_kdtree(None);
        grid.roll(Vector3::new(20.0, 0.0, 0.0), Vector3::new(21.0, 0.0, 0.0));
        assert!(!grid.submap_kdtree_valid());

        grid.build_submap_kdtree(None);
        grid.clear();
        assert!(!grid.submap_kdtree_valid());

        grid.add(&cloud_of(vec![point(20.5, 0.0, 0.0, 1.0)]), false, false);
        grid.build_submap_kdtree(None);
        grid.set_grid_size(12).unwrap();
        assert!(!grid.submap_kdtree_valid());

        grid.build_submap_kdtree(None);
        grid.set_voxel_resolution(2.0).unwrap();
        assert!(!grid.submap_kdtree_valid());
    }

    #[test]
    fn test_submap_knn_returns_nearest() {
        let mut grid = RollingGrid::new(10, 1.0, 0.2);
        grid.reset(Vector3::zeros());
        grid.add(
            &cloud_of(vec![
                point(0.0, 0.0, 0.0, 1.0),
                point(1.0, 0.0, 0.0, 2.0),
                point(3.0, 0.0, 0.0, 3.0),
            ]),
            false,
            false,
        );
        grid.build_submap_kdtree(None);
        let found = grid.submap_knn(Vector3::new(0.9, 0.0, 0.0), 2);
        assert_eq!(found.len(), 2);
        assert!((found[0].1.x - 1.0).abs() < 1e-12);
        assert!((found[1].1.x - 0.0).abs() < 1e-12);
        assert!((found[0].0 - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_submap_bbox_filters_outer_cells() {
        let mut grid = RollingGrid::new(10, 1.0, 0.2);
        grid.reset(Vector3::zeros());
        grid.add(
            &cloud_of(vec![point(0.1, 0.0, 0.0, 1.0), point(4.0, 0.0, 0.0, 2.0)]),
            false,
            false,
        );
        grid.build_submap_kdtree(Some((
            Vector3::new(-0.5, -0.5, -0.5),
            Vector3::new(0.5, 0.5, 0.5),
        )));
        assert_eq!(grid.submap_len(), 1);
    }

    #[test]
    fn test_rebin_preserves_points_and_labels() {
        let mut grid = RollingGrid::new(10, 2.0, 0.5);
        grid.reset(Vector3::zeros());
        grid.add(&cloud_of(vec![point(0.3, 0.3, 0.0, 1.0)]), true, false);
        grid.add(&cloud_of(vec![point(3.0, -2.0, 0.4, 2.0)]), false, false);

        grid.set_voxel_resolution(1.0).unwrap();
        assert_eq!(grid.size(), 2);
        let out = grid.get();
        let fixed = out.points.iter().find(|p| p.label == LABEL_FIXED).unwrap();
        assert!((fixed.x - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_reset_snaps_center_to_lattice() {
        let mut grid = RollingGrid::new(10, 2.0, 0.5);
        grid.reset(Vector3::new(3.7, -1.2, 0.0));
        assert!((grid.position().x - 2.0).abs() < 1e-12);
        assert!((grid.position().y + 2.0).abs() < 1e-12);
    }
}
