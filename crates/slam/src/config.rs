//! Engine configuration.
//!
//! The source of truth for every tunable. Components receive their
//! slice of this struct at construction; there are no setter/getter
//! pairs, fields are plain and public.

use transforms::Transform;
use voxelmap::SamplingMode;

use crate::registration::MatchingConfig;

/// How keypoints are undistorted within a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UndistortionMode {
    /// Points are assumed simultaneous at end of sweep
    None,
    /// Points are warped by the interpolated previous motion before a
    /// rigid solve
    #[default]
    Approximated,
    /// The solver optimizes both sweep endpoints (12 parameters)
    Optimized,
}

/// What the trajectory log keeps besides poses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoggingStorage {
    /// Poses and covariances only
    None,
    /// Deep-copied keypoint clouds, enabling map rebuilds after a
    /// pose-graph relaxation
    #[default]
    Clone,
}

/// Per-stage ICP budget.
#[derive(Debug, Clone)]
pub struct IcpConfig {
    /// Outer matching iterations
    pub icp_max_iter: usize,
    /// Inner Levenberg-Marquardt iterations per matching pass
    pub lm_max_iter: usize,
    /// Minimum surviving residuals for the stage to run
    pub min_matched_keypoints: usize,
    /// Neighborhood fit thresholds
    pub matching: MatchingConfig,
}

impl Default for IcpConfig {
    fn default() -> Self {
        Self {
            icp_max_iter: 4,
            lm_max_iter: 15,
            min_matched_keypoints: 20,
            matching: MatchingConfig::default(),
        }
    }
}

/// Rolling-grid geometry shared by the three keypoint maps.
#[derive(Debug, Clone)]
pub struct MapConfig {
    /// Outer cells per axis
    pub grid_size: usize,
    /// Outer cell edge length (meters)
    pub voxel_resolution: f64,
    /// Leaf edge length per category (meters): edges, planars, blobs
    pub leaf_sizes: [f64; 3],
    /// Merge policy for points landing in an occupied leaf
    pub sampling_mode: SamplingMode,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            grid_size: 50,
            voxel_resolution: 10.0,
            leaf_sizes: [0.3, 0.6, 0.3],
            sampling_mode: SamplingMode::MaxIntensity,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct SlamConfig {
    /// Worker threads for extraction and residual construction
    pub nb_threads: usize,
    /// Static LIDAR pose in the BASE frame
    pub base_to_lidar: Transform,
    /// Nominal sweep period (seconds), normalizes per-point times
    pub frame_duration: f64,
    pub undistortion: UndistortionMode,
    pub ego_motion: IcpConfig,
    pub mapping: IcpConfig,
    /// Ego-motion translation above this declares the solve failed (meters)
    pub max_distance_for_icp_matching: f64,
    /// Push undistorted keypoints into the maps each frame
    pub update_map: bool,
    /// Log retention in sweep time: <0 unbounded, 0 disabled, else
    /// entries older than latest - timeout are evicted (seconds)
    pub logging_timeout: f64,
    pub logging_storage: LoggingStorage,
    pub map: MapConfig,
}

impl Default for SlamConfig {
    fn default() -> Self {
        Self {
            nb_threads: 1,
            base_to_lidar: Transform::identity(),
            frame_duration: 0.1,
            undistortion: UndistortionMode::default(),
            ego_motion: IcpConfig::default(),
            mapping: IcpConfig {
                icp_max_iter: 3,
                ..IcpConfig::default()
            },
            max_distance_for_icp_matching: 20.0,
            update_map: true,
            logging_timeout: -1.0,
            logging_storage: LoggingStorage::default(),
            map: MapConfig::default(),
        }
    }
}
