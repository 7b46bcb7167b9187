//! Feature detection for spinning multi-beam sensors.
//!
//! Points are grouped into scanlines by laser ring id; within a
//! scanline the caller guarantees azimuthally monotonic ordering.
//! Scanlines are independent, so they are processed in parallel and
//! the results concatenated in ring order to keep the output
//! deterministic.

use nalgebra::Vector3;
use rayon::prelude::*;
use tracing::debug;
use types::{Keypoints, PointCloud};

use crate::{FrameFeatures, KeypointExtractor};

/// Extractor tunables. Thresholds apply to per-point features
/// computed over a symmetric window of `neighbor_width` points.
#[derive(Debug, Clone)]
pub struct SpinningExtractorConfig {
    /// Half-width of the neighborhood window (points per side)
    pub neighbor_width: usize,
    /// Returns closer than this are ignored entirely (meters)
    pub min_distance_to_sensor: f64,
    /// Angle-sine above which a point is an edge candidate
    pub edge_sin_angle_threshold: f64,
    /// Angle-sine below which a point is a planar candidate
    pub plane_sin_angle_threshold: f64,
    /// Range jump to a direct neighbor marking a depth edge (meters)
    pub edge_depth_gap_threshold: f64,
    /// Neighborhood asymmetry marking a protruding edge (meters)
    pub edge_saliency_threshold: f64,
    /// Intensity jump marking a reflectivity edge (sensor units)
    pub edge_intensity_gap_threshold: f64,
    /// Minimum sine of the beam-to-surface angle; flatter incidence
    /// invalidates the point
    pub min_beam_surface_sin: f64,
    /// Range discontinuity treated as an occlusion boundary (meters)
    pub occlusion_gap_threshold: f64,
    /// Stride for sampling blob keypoints from unlabeled points
    pub blob_stride: usize,
}

impl Default for SpinningExtractorConfig {
    fn default() -> Self {
        Self {
            neighbor_width: 4,
            min_distance_to_sensor: 1.5,
            edge_sin_angle_threshold: 0.86,
            plane_sin_angle_threshold: 0.5,
            edge_depth_gap_threshold: 0.15,
            edge_saliency_threshold: 1.5,
            edge_intensity_gap_threshold: 50.0,
            min_beam_surface_sin: 0.17, // ~10 degrees
            occlusion_gap_threshold: 1.0,
            blob_stride: 3,
        }
    }
}

/// Keypoint extractor for spinning multi-beam LiDARs.
pub struct SpinningExtractor {
    config: SpinningExtractorConfig,
    features: FrameFeatures,
}

/// Labels produced for one scanline, as indices into the input cloud.
#[derive(Debug, Default)]
struct ScanlineLabels {
    edges: Vec<usize>,
    planars: Vec<usize>,
    blobs: Vec<usize>,
    features: Vec<(usize, PointFeatures)>,
}

#[derive(Debug, Clone, Copy, Default)]
struct PointFeatures {
    sin_angle: f64,
    depth_gap: f64,
    saliency: f64,
    intensity_gap: f64,
    edge_valid: bool,
    planar_valid: bool,
}

impl SpinningExtractor {
    pub fn new(config: SpinningExtractorConfig) -> Self {
        Self {
            config,
            features: FrameFeatures::default(),
        }
    }

    pub fn config(&self) -> &SpinningExtractorConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: SpinningExtractorConfig) {
        self.config = config;
    }

    /// Group point indices by ring id, preserving input order.
    fn split_scanlines(cloud: &PointCloud) -> Vec<Vec<usize>> {
        let n_rings = cloud
            .points
            .iter()
            .map(|p| p.ring as usize + 1)
            .max()
            .unwrap_or(0);
        let mut lines = vec![Vec::new(); n_rings];
        for (i, p) in cloud.points.iter().enumerate() {
            lines[p.ring as usize].push(i);
        }
        lines
    }

    fn process_scanline(&self, cloud: &PointCloud, line: &[usize]) -> ScanlineLabels {
        let cfg = &self.config;
        let nw = cfg.neighbor_width;
        let mut out = ScanlineLabels::default();
        if line.len() < 2 * nw + 1 {
            return out;
        }

        let pos: Vec<Vector3<f64>> = line.iter().map(|&i| cloud.points[i].position()).collect();
        let range: Vec<f64> = pos.iter().map(|p| p.norm()).collect();
        let intensity: Vec<f64> = line.iter().map(|&i| cloud.points[i].intensity).collect();
        let n = line.len();

        let mut edge_valid = vec![true; n];
        let mut planar_valid = vec![true; n];
        let mut blob_valid = vec![true; n];

        // Too close to the sensor
        for j in 0..n {
            if range[j] < cfg.min_distance_to_sensor {
                edge_valid[j] = false;
                planar_valid[j] = false;
                blob_valid[j] = false;
            }
        }

        // Beam nearly parallel to the local surface
        for j in 1..n - 1 {
            let chord = pos[j + 1] - pos[j - 1];
            let chord_norm = chord.norm();
            if chord_norm < 1e-9 || range[j] < 1e-9 {
                continue;
            }
            let beam = pos[j] / range[j];
            let sin_incidence = chord.cross(&beam).norm() / chord_norm;
            if sin_incidence < cfg.min_beam_surface_sin {
                edge_valid[j] = false;
                planar_valid[j] = false;
                blob_valid[j] = false;
            }
        }

        // Occlusion boundaries: the window on the far side of a large
        // range discontinuity is unreliable for every category.
        for j in 0..n - 1 {
            let gap = range[j + 1] - range[j];
            if gap.abs() <= cfg.occlusion_gap_threshold {
                continue;
            }
            if gap > 0.0 {
                // far side starts at j+1
                for k in (j + 1)..(j + 1 + nw).min(n) {
                    edge_valid[k] = false;
                    planar_valid[k] = false;
                    blob_valid[k] = false;
                }
            } else {
                // far side ends at j
                for k in j.saturating_sub(nw - 1)..=j {
                    edge_valid[k] = false;
                    planar_valid[k] = false;
                    blob_valid[k] = false;
                }
            }
        }

        for j in nw..n - nw {
            let x = pos[j];
            let left = x - pos[j - nw];
            let right = pos[j + nw] - x;
            let denom = left.norm() * right.norm();
            let sin_angle = if denom > 1e-12 {
                left.cross(&right).norm() / denom
            } else {
                0.0
            };

            let depth_gap = (range[j - 1] - range[j])
                .abs()
                .max((range[j + 1] - range[j]).abs());

            let mut offset_sum = Vector3::zeros();
            for k in j - nw..=j + nw {
                offset_sum += pos[k] - x;
            }
            let saliency = offset_sum.norm();

            let intensity_gap = (intensity[j - 1] - intensity[j])
                .abs()
                .max((intensity[j + 1] - intensity[j]).abs());

            let is_edge = edge_valid[j]
                && (sin_angle > cfg.edge_sin_angle_threshold
                    || depth_gap > cfg.edge_depth_gap_threshold
                    || saliency > cfg.edge_saliency_threshold
                    || intensity_gap > cfg.edge_intensity_gap_threshold);
            let is_planar =
                planar_valid[j] && !is_edge && sin_angle < cfg.plane_sin_angle_threshold;

            let orig = line[j];
            if is_edge {
                out.edges.push(orig);
            } else if is_planar {
                out.planars.push(orig);
            } else if blob_valid[j] && j % cfg.blob_stride == 0 {
                out.blobs.push(orig);
            }

            out.features.push((
                orig,
                PointFeatures {
                    sin_angle,
                    depth_gap,
                    saliency,
                    intensity_gap,
                    edge_valid: edge_valid[j],
                    planar_valid: planar_valid[j],
                },
            ));
        }

        out
    }
}

impl KeypointExtractor for SpinningExtractor {
    fn compute_keypoints(&mut self, cloud: &PointCloud) -> Keypoints {
        let mut keypoints = Keypoints::default();
        keypoints.edges.header = cloud.header;
        keypoints.planars.header = cloud.header;
        keypoints.blobs.header = cloud.header;
        self.features = FrameFeatures::sized(cloud.len());
        if cloud.is_empty() {
            return keypoints;
        }

        let lines = Self::split_scanlines(cloud);
        let labels: Vec<ScanlineLabels> = lines
            .par_iter()
            .map(|line| self.process_scanline(cloud, line))
            .collect();

        for line in &labels {
            for &i in &line.edges {
                keypoints.edges.points.push(cloud.points[i]);
            }
            for &i in &line.planars {
                keypoints.planars.points.push(cloud.points[i]);
            }
            for &i in &line.blobs {
                keypoints.blobs.points.push(cloud.points[i]);
            }
            for &(i, f) in &line.features {
                self.features.sin_angle[i] = f.sin_angle;
                self.features.depth_gap[i] = f.depth_gap;
                self.features.saliency[i] = f.saliency;
                self.features.intensity_gap[i] = f.intensity_gap;
                self.features.edge_valid[i] = f.edge_valid;
                self.features.planar_valid[i] = f.planar_valid;
            }
        }

        debug!(
            edges = keypoints.edges.len(),
            planars = keypoints.planars.len(),
            blobs = keypoints.blobs.len(),
            "Extracted keypoints"
        );
        keypoints
    }

    fn frame_features(&self) -> &FrameFeatures {
        &self.features
    }
}
