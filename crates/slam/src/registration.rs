//! Registration cost model.
//!
//! Each keypoint is matched against a neighborhood retrieved from a
//! KD-tree (previous frame or sub-map). A local PCA of the
//! neighborhood yields a model point P and a weighting matrix A, and
//! the optimizer minimizes ‖A·(R·X + T − P)‖ over the pose
//! parameters. Rejection outcomes are tagged for debug histograms.

use kdtree::distance::squared_euclidean;
use kdtree::KdTree;
use nalgebra::{Matrix3, Vector3};
use types::{Category, Point, PointCloud};

/// Why a keypoint produced no residual, or Success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStatus {
    Success,
    NotEnoughNeighbors,
    NeighborsTooFar,
    BadPcaStructure,
    InvalidNumerical,
    MseTooLarge,
}

/// Per-category tally of match outcomes.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchHistogram {
    pub success: usize,
    pub not_enough_neighbors: usize,
    pub neighbors_too_far: usize,
    pub bad_pca_structure: usize,
    pub invalid_numerical: usize,
    pub mse_too_large: usize,
}

impl MatchHistogram {
    pub fn record(&mut self, status: MatchStatus) {
        match status {
            MatchStatus::Success => self.success += 1,
            MatchStatus::NotEnoughNeighbors => self.not_enough_neighbors += 1,
            MatchStatus::NeighborsTooFar => self.neighbors_too_far += 1,
            MatchStatus::BadPcaStructure => self.bad_pca_structure += 1,
            MatchStatus::InvalidNumerical => self.invalid_numerical += 1,
            MatchStatus::MseTooLarge => self.mse_too_large += 1,
        }
    }

    pub fn merge(&mut self, other: &MatchHistogram) {
        self.success += other.success;
        self.not_enough_neighbors += other.not_enough_neighbors;
        self.neighbors_too_far += other.neighbors_too_far;
        self.bad_pca_structure += other.bad_pca_structure;
        self.invalid_numerical += other.invalid_numerical;
        self.mse_too_large += other.mse_too_large;
    }

    pub fn total(&self) -> usize {
        self.success
            + self.not_enough_neighbors
            + self.neighbors_too_far
            + self.bad_pca_structure
            + self.invalid_numerical
            + self.mse_too_large
    }
}

/// Neighborhood fit thresholds, one instance per ICP stage.
#[derive(Debug, Clone)]
pub struct MatchingConfig {
    /// Neighbors fetched for a line fit
    pub line_neighbors: usize,
    /// Minimum neighbors surviving the distance filter
    pub min_line_neighbors: usize,
    /// Farthest neighbor must lie within factor x median distance
    pub line_distance_factor: f64,
    /// Largest/second eigenvalue ratio required for a line
    pub line_eigen_ratio: f64,
    /// Max mean squared point-to-line distance (m²)
    pub line_max_mse: f64,
    /// Neighbors fetched for a plane fit
    pub plane_neighbors: usize,
    /// Farthest neighbor must lie within factor x median distance
    pub plane_distance_factor: f64,
    /// Second/smallest eigenvalue ratio required for a plane
    pub plane_eigen_ratio: f64,
    /// Max mean squared point-to-plane distance (m²)
    pub plane_max_mse: f64,
    /// Neighbors fetched for an ellipsoid fit
    pub blob_neighbors: usize,
    /// Robustifier scale at the first ICP iteration (meters)
    pub init_loss_scale: f64,
    /// Robustifier scale at the last ICP iteration (meters)
    pub final_loss_scale: f64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            line_neighbors: 10,
            min_line_neighbors: 4,
            line_distance_factor: 5.0,
            line_eigen_ratio: 5.0,
            line_max_mse: 0.06,
            plane_neighbors: 5,
            plane_distance_factor: 5.0,
            plane_eigen_ratio: 8.0,
            plane_max_mse: 0.05,
            blob_neighbors: 12,
            init_loss_scale: 0.7,
            final_loss_scale: 0.05,
        }
    }
}

impl MatchingConfig {
    pub fn neighbors_for(&self, category: Category) -> usize {
        match category {
            Category::Edge => self.line_neighbors,
            Category::Planar => self.plane_neighbors,
            Category::Blob => self.blob_neighbors,
        }
    }

    /// Robustifier scale for ICP iteration `iter` of `n_iter`,
    /// annealed linearly from init to final.
    pub fn loss_scale(&self, iter: usize, n_iter: usize) -> f64 {
        if n_iter <= 1 {
            return self.final_loss_scale;
        }
        let t = iter as f64 / (n_iter - 1) as f64;
        self.init_loss_scale * (1.0 - t) + self.final_loss_scale * t
    }
}

/// Saturating robust factor: residuals of norm r contribute
/// s·atan(r/s) instead of r, discounting outliers without dropping
/// them. Returns the multiplier to apply to the residual vector.
pub fn robust_factor(r: f64, scale: f64) -> f64 {
    if r < 1e-12 || scale <= 0.0 {
        1.0
    } else {
        scale * (r / scale).atan() / r
    }
}

/// Model fit of one neighborhood: weighting matrix and model point.
#[derive(Debug, Clone, Copy)]
pub struct NeighborhoodFit {
    pub a: Matrix3<f64>,
    pub p: Vector3<f64>,
}

/// Eigen decomposition of the neighborhood covariance, eigenvalues
/// sorted descending with matching unit eigenvectors.
fn sorted_eigen(cov: &Matrix3<f64>) -> Option<([f64; 3], [Vector3<f64>; 3])> {
    let eigen = cov.symmetric_eigen();
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));
    let values = [
        eigen.eigenvalues[order[0]],
        eigen.eigenvalues[order[1]],
        eigen.eigenvalues[order[2]],
    ];
    if values.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let vectors = [
        eigen.eigenvectors.column(order[0]).into_owned(),
        eigen.eigenvectors.column(order[1]).into_owned(),
        eigen.eigenvectors.column(order[2]).into_owned(),
    ];
    Some((values, vectors))
}

fn centroid_and_covariance(neighbors: &[(f64, &Point)]) -> (Vector3<f64>, Matrix3<f64>) {
    let n = neighbors.len() as f64;
    let mut centroid = Vector3::zeros();
    for (_, p) in neighbors {
        centroid += p.position();
    }
    centroid /= n;
    let mut cov = Matrix3::zeros();
    for (_, p) in neighbors {
        let d = p.position() - centroid;
        cov += d * d.transpose();
    }
    cov /= n;
    (centroid, cov)
}

/// Farthest neighbor beyond `factor` times the median distance means
/// the neighborhood spans disconnected structures.
fn neighbors_too_far(neighbors: &[(f64, &Point)], factor: f64) -> bool {
    let median = neighbors[neighbors.len() / 2].0;
    let farthest = neighbors[neighbors.len() - 1].0;
    farthest > factor * median.max(1e-6)
}

/// Fit a line through the neighborhood; A projects onto the plane
/// orthogonal to it.
pub fn fit_line(
    neighbors: &[(f64, &Point)],
    cfg: &MatchingConfig,
) -> Result<NeighborhoodFit, MatchStatus> {
    if neighbors.len() < cfg.min_line_neighbors {
        return Err(MatchStatus::NotEnoughNeighbors);
    }
    if neighbors_too_far(neighbors, cfg.line_distance_factor) {
        return Err(MatchStatus::NeighborsTooFar);
    }
    let (centroid, cov) = centroid_and_covariance(neighbors);
    let (values, vectors) = sorted_eigen(&cov).ok_or(MatchStatus::InvalidNumerical)?;
    if values[0] < cfg.line_eigen_ratio * values[1].max(1e-12) {
        return Err(MatchStatus::BadPcaStructure);
    }
    let n = vectors[0];
    let projector = Matrix3::identity() - n * n.transpose();
    let a = projector.transpose() * projector;

    let mse = neighbors
        .iter()
        .map(|(_, p)| (projector * (p.position() - centroid)).norm_squared())
        .sum::<f64>()
        / neighbors.len() as f64;
    if mse > cfg.line_max_mse {
        return Err(MatchStatus::MseTooLarge);
    }
    Ok(NeighborhoodFit { a, p: centroid })
}

/// Fit a plane through the neighborhood; A = n·nᵀ measures the
/// distance along the normal.
pub fn fit_plane(
    neighbors: &[(f64, &Point)],
    cfg: &MatchingConfig,
) -> Result<NeighborhoodFit, MatchStatus> {
    if neighbors.len() < cfg.plane_neighbors {
        return Err(MatchStatus::NotEnoughNeighbors);
    }
    if neighbors_too_far(neighbors, cfg.plane_distance_factor) {
        return Err(MatchStatus::NeighborsTooFar);
    }
    let (centroid, cov) = centroid_and_covariance(neighbors);
    let (values, vectors) = sorted_eigen(&cov).ok_or(MatchStatus::InvalidNumerical)?;
    // plane-likeness: the smallest eigenvalue must be negligible
    // against the middle one
    if values[1] < cfg.plane_eigen_ratio * values[2].max(1e-12) {
        return Err(MatchStatus::BadPcaStructure);
    }
    let n = vectors[2];
    let a = n * n.transpose();

    let mse = neighbors
        .iter()
        .map(|(_, p)| {
            let d = n.dot(&(p.position() - centroid));
            d * d
        })
        .sum::<f64>()
        / neighbors.len() as f64;
    if mse > cfg.plane_max_mse {
        return Err(MatchStatus::MseTooLarge);
    }
    Ok(NeighborhoodFit { a, p: centroid })
}

/// Fit an ellipsoid to the neighborhood; A = C^(-1/2) turns the
/// residual into a Mahalanobis distance.
pub fn fit_blob(
    neighbors: &[(f64, &Point)],
    cfg: &MatchingConfig,
) -> Result<NeighborhoodFit, MatchStatus> {
    if neighbors.len() < 4 {
        return Err(MatchStatus::NotEnoughNeighbors);
    }
    if neighbors_too_far(neighbors, cfg.line_distance_factor) {
        return Err(MatchStatus::NeighborsTooFar);
    }
    let (centroid, cov) = centroid_and_covariance(neighbors);
    let (values, vectors) = sorted_eigen(&cov).ok_or(MatchStatus::InvalidNumerical)?;
    if values[2] < 1e-9 {
        return Err(MatchStatus::InvalidNumerical);
    }
    let mut a = Matrix3::zeros();
    for i in 0..3 {
        a += vectors[i] * vectors[i].transpose() / values[i].sqrt();
    }
    Ok(NeighborhoodFit { a, p: centroid })
}

/// Dispatch on category.
pub fn fit_neighborhood(
    category: Category,
    neighbors: &[(f64, &Point)],
    cfg: &MatchingConfig,
) -> Result<NeighborhoodFit, MatchStatus> {
    if neighbors.is_empty() {
        return Err(MatchStatus::NotEnoughNeighbors);
    }
    match category {
        Category::Edge => fit_line(neighbors, cfg),
        Category::Planar => fit_plane(neighbors, cfg),
        Category::Blob => fit_blob(neighbors, cfg),
    }
}

/// KD-tree over one frame's keypoints, for the ego-motion stage.
pub struct PointKdTree {
    tree: KdTree<usize, [f64; 3]>,
    points: Vec<Point>,
}

impl PointKdTree {
    pub fn build(cloud: &PointCloud) -> Self {
        let points: Vec<Point> = cloud
            .points
            .iter()
            .filter(|p| p.position().iter().all(|v| v.is_finite()))
            .copied()
            .collect();
        let mut tree = KdTree::new(3);
        for (i, p) in points.iter().enumerate() {
            let _ = tree.add([p.x, p.y, p.z], i);
        }
        Self { tree, points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// K nearest points, closest first, with Euclidean distances.
    pub fn knn(&self, query: Vector3<f64>, k: usize) -> Vec<(f64, &Point)> {
        if self.points.is_empty() {
            return Vec::new();
        }
        match self
            .tree
            .nearest(&[query.x, query.y, query.z], k, &squared_euclidean)
        {
            Ok(found) => found
                .into_iter()
                .map(|(d2, &i)| (d2.sqrt(), &self.points[i]))
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn neighbors_from(points: &[Point]) -> Vec<(f64, &Point)> {
        // distances measured from the first point, sorted like a
        // KD-tree query result
        let origin = points[0].position();
        let mut out: Vec<(f64, &Point)> = points
            .iter()
            .map(|p| ((p.position() - origin).norm(), p))
            .collect();
        out.sort_by(|a, b| a.0.total_cmp(&b.0));
        out
    }

    #[test]
    fn test_fit_line_along_x() {
        let points: Vec<Point> = (0..10)
            .map(|i| Point::new(i as f64 * 0.1, 0.001 * (i % 2) as f64, 0.0))
            .collect();
        let neighbors = neighbors_from(&points);
        let fit = fit_line(&neighbors, &MatchingConfig::default()).unwrap();

        // A annihilates the line direction and keeps the orthogonal plane
        let along = fit.a * Vector3::new(1.0, 0.0, 0.0);
        assert!(along.norm() < 1e-2);
        let across = fit.a * Vector3::new(0.0, 0.0, 1.0);
        assert_relative_eq!(across.norm(), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_fit_line_rejects_isotropic_cloud() {
        // points spread evenly in a plane have no dominant direction
        let mut points = Vec::new();
        for i in 0..4 {
            for j in 0..4 {
                points.push(Point::new(i as f64 * 0.1, j as f64 * 0.1, 0.0));
            }
        }
        let neighbors = neighbors_from(&points);
        assert_eq!(
            fit_line(&neighbors, &MatchingConfig::default()).unwrap_err(),
            MatchStatus::BadPcaStructure
        );
    }

    #[test]
    fn test_fit_line_rejects_small_neighborhoods() {
        let points = vec![Point::new(0.0, 0.0, 0.0), Point::new(0.1, 0.0, 0.0)];
        let neighbors = neighbors_from(&points);
        assert_eq!(
            fit_line(&neighbors, &MatchingConfig::default()).unwrap_err(),
            MatchStatus::NotEnoughNeighbors
        );
    }

    #[test]
    fn test_fit_plane_normal_is_z() {
        let mut points = Vec::new();
        for i in 0..3 {
            for j in 0..3 {
                points.push(Point::new(i as f64 * 0.2, j as f64 * 0.2, 0.0));
            }
        }
        let neighbors = neighbors_from(&points);
        let fit = fit_plane(&neighbors, &MatchingConfig::default()).unwrap();

        // A keeps only the normal component
        let normal = fit.a * Vector3::new(0.0, 0.0, 1.0);
        assert_relative_eq!(normal.norm(), 1.0, epsilon = 1e-6);
        let tangent = fit.a * Vector3::new(1.0, 0.0, 0.0);
        assert!(tangent.norm() < 1e-6);
    }

    #[test]
    fn test_fit_plane_rejects_far_neighbors() {
        let mut points = Vec::new();
        for i in 0..8 {
            points.push(Point::new(i as f64 * 0.05, 0.0, 0.0));
        }
        // one neighbor from a different structure
        points.push(Point::new(50.0, 0.0, 0.0));
        let neighbors = neighbors_from(&points);
        assert_eq!(
            fit_plane(&neighbors, &MatchingConfig::default()).unwrap_err(),
            MatchStatus::NeighborsTooFar
        );
    }

    #[test]
    fn test_fit_blob_is_mahalanobis() {
        let mut points = Vec::new();
        for i in -2..=2 {
            for j in -2..=2 {
                for k in -2..=2 {
                    points.push(Point::new(i as f64 * 0.1, j as f64 * 0.1, k as f64 * 0.05));
                }
            }
        }
        let neighbors = neighbors_from(&points);
        let fit = fit_blob(&neighbors, &MatchingConfig::default()).unwrap();
        // tighter axis weighs more
        let wz = (fit.a * Vector3::new(0.0, 0.0, 1.0)).norm();
        let wx = (fit.a * Vector3::new(1.0, 0.0, 0.0)).norm();
        assert!(wz > wx);
    }

    #[test]
    fn test_robust_factor_saturates() {
        let scale = 0.5;
        // small residuals pass almost unchanged
        assert_relative_eq!(robust_factor(1e-6, scale), 1.0, epsilon = 1e-3);
        // large residuals are capped near s·π/2 / r
        let r = 100.0;
        let f = robust_factor(r, scale);
        assert!((f * r - scale * std::f64::consts::FRAC_PI_2).abs() < 0.01);
    }

    #[test]
    fn test_loss_scale_anneals_linearly() {
        let cfg = MatchingConfig {
            init_loss_scale: 1.0,
            final_loss_scale: 0.0,
            ..MatchingConfig::default()
        };
        assert_relative_eq!(cfg.loss_scale(0, 5), 1.0, epsilon = 1e-12);
        assert_relative_eq!(cfg.loss_scale(4, 5), 0.0, epsilon = 1e-12);
        assert_relative_eq!(cfg.loss_scale(2, 5), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_point_kdtree_nearest() {
        let cloud = PointCloud::with_points(
            types::Header::default(),
            vec![
                Point::new(0.0, 0.0, 0.0),
                Point::new(1.0, 0.0, 0.0),
                Point::new(0.0, 2.0, 0.0),
            ],
        );
        let tree = PointKdTree::build(&cloud);
        assert_eq!(tree.len(), 3);
        let found = tree.knn(Vector3::new(0.9, 0.1, 0.0), 1);
        assert_eq!(found.len(), 1);
        assert_relative_eq!(found[0].1.x, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_histogram_tallies() {
        let mut h = MatchHistogram::default();
        h.record(MatchStatus::Success);
        h.record(MatchStatus::Success);
        h.record(MatchStatus::NeighborsTooFar);
        assert_eq!(h.success, 2);
        assert_eq!(h.neighbors_too_far, 1);
        assert_eq!(h.total(), 3);
    }
}
