//! Keypoint extraction from spinning multi-beam LiDAR sweeps.
//!
//! Provides:
//! - Per-scanline feature computation (angle, depth gap, saliency,
//!   intensity gap)
//! - Edge / planar / blob labeling with per-category invalidation
//! - Per-point debug arrays retained from the last frame
//!
//! The extractor sits behind the [`KeypointExtractor`] trait so the
//! SLAM engine can swap implementations at runtime.

use types::{Keypoints, PointCloud};

mod spinning;

pub use spinning::{SpinningExtractor, SpinningExtractorConfig};

/// Per-point feature values and validity flags for the last frame,
/// indexed like the input cloud. Exposed for diagnostics only.
#[derive(Debug, Clone, Default)]
pub struct FrameFeatures {
    /// Sine of the angle between the left and right chords
    pub sin_angle: Vec<f64>,
    /// Max range difference to the direct neighbors
    pub depth_gap: Vec<f64>,
    /// Norm of the summed neighborhood offsets
    pub saliency: Vec<f64>,
    /// Max intensity jump across the point
    pub intensity_gap: Vec<f64>,
    /// Point may still be labeled as an edge
    pub edge_valid: Vec<bool>,
    /// Point may still be labeled as planar
    pub planar_valid: Vec<bool>,
}

impl FrameFeatures {
    pub(crate) fn sized(n: usize) -> Self {
        Self {
            sin_angle: vec![0.0; n],
            depth_gap: vec![0.0; n],
            saliency: vec![0.0; n],
            intensity_gap: vec![0.0; n],
            edge_valid: vec![false; n],
            planar_valid: vec![false; n],
        }
    }
}

/// Capability the SLAM engine requires from an extractor.
pub trait KeypointExtractor: Send {
    /// Compute the three keypoint clouds for one sweep. Outputs stay
    /// in the input cloud's frame.
    fn compute_keypoints(&mut self, cloud: &PointCloud) -> Keypoints;

    /// Debug arrays of the last processed frame.
    fn frame_features(&self) -> &FrameFeatures;
}
