//! LiDAR SLAM engine.
//!
//! Provides:
//! - Per-frame two-pass pose estimation: a short-range ego-motion
//!   solve against the previous frame's keypoints, then a mapping
//!   solve against sub-maps of the rolling keypoint grids
//! - Intra-sweep motion model for undistortion
//! - External-sensor constraints folded into the mapping solve
//! - Trajectory log and offline pose-graph relaxation against GPS
//!
//! The engine serializes its mutating operations through `&mut self`;
//! read-only getters clone snapshots and can be shared freely. A host
//! needing cross-thread mutation wraps the engine in its own lock.

use std::collections::VecDeque;
use std::path::Path;
use std::time::Instant;

use nalgebra::{DVector, Matrix6, UnitQuaternion, Vector3};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use thiserror::Error;
use tracing::{debug, info, warn};

use keypoints::{FrameFeatures, KeypointExtractor, SpinningExtractor, SpinningExtractorConfig};
use transforms::{SampledTrajectory, Transform};
use types::{Category, Frame, Keypoints, PointCloud};
use voxelmap::RollingGrid;

mod config;
mod optim;
mod pcd_io;
mod pose_graph;
mod registration;
pub mod sensors;

pub use config::{IcpConfig, LoggingStorage, MapConfig, SlamConfig, UndistortionMode};
pub use optim::{
    DistanceResidual, EvalContext, LmConfig, LmReport, OrientationResidual, PointResidual,
    ResidualBlock,
};
pub use pcd_io::{PcdFormat, PcdIoError};
pub use pose_graph::{PoseGraphConfig, PoseGraphError};
pub use registration::{MatchHistogram, MatchStatus, MatchingConfig};
pub use sensors::{
    GpsManager, GpsMeasurement, GravityManager, GravityMeasurement, ImuManager, ImuPreintegrator,
    ImuSample, LandmarkManager, LandmarkMeasurement, OdomMeasurement, PoseMeasurement,
    PoseSensorManager, SensorConfig, WheelOdometryManager,
};

use optim::{end_pose, end_pose_hessian, pose_at, solve_lm};
use registration::{fit_neighborhood, PointKdTree};

#[derive(Error, Debug)]
pub enum SlamError {
    #[error("Empty point cloud, frame skipped")]
    EmptyCloud,
    #[error("Frame {seq} is not newer than frame {last}, skipped")]
    OutOfOrderFrame { seq: u64, last: u64 },
    #[error("Worker pool construction failed: {0}")]
    ThreadPool(String),
    #[error(transparent)]
    PoseGraph(#[from] PoseGraphError),
    #[error(transparent)]
    PcdIo(#[from] PcdIoError),
    #[error(transparent)]
    Map(#[from] voxelmap::MapError),
}

/// All external-sensor managers, one mutex each.
pub struct SensorHub {
    pub odometry: WheelOdometryManager,
    pub gravity: GravityManager,
    pub landmark: LandmarkManager,
    pub gps: GpsManager,
    pub pose: PoseSensorManager,
    pub imu: ImuManager,
}

impl SensorHub {
    fn new() -> Self {
        let config = SensorConfig::default();
        Self {
            odometry: WheelOdometryManager::new(config, true),
            gravity: GravityManager::new(config),
            landmark: LandmarkManager::new(config),
            gps: GpsManager::new(config, Transform::identity()),
            pose: PoseSensorManager::new(config, Transform::identity()),
            imu: ImuManager::new(config, None),
        }
    }

    /// Collect every usable constraint for the mapping solve at
    /// `time`. Sensors that cannot synchronize are simply omitted.
    fn constraints(&self, time: f64, rotation_guess: &UnitQuaternion<f64>) -> Vec<ResidualBlock> {
        let mut blocks = Vec::new();
        if let Some(b) = self.odometry.constraint(time) {
            blocks.push(b);
        }
        if let Some(b) = self.gravity.constraint(time, rotation_guess) {
            blocks.push(b);
        }
        if let Some(b) = self.landmark.constraint(time) {
            blocks.push(b);
        }
        if let Some(b) = self.gps.constraint(time) {
            blocks.push(b);
        }
        blocks.extend(self.pose.constraints(time));
        blocks
    }

    fn clear(&self) {
        self.odometry.buffer.clear();
        self.gravity.buffer.clear();
        self.landmark.buffer.clear();
        self.gps.buffer.clear();
        self.pose.buffer.clear();
        self.imu.buffer.clear();
    }
}

/// One trajectory log entry.
#[derive(Debug, Clone)]
pub struct TrajectoryEntry {
    pub pose: Transform,
    /// 6×6 covariance in (rX, rY, rZ, X, Y, Z) order
    pub covariance: Matrix6<f64>,
    /// Undistorted BASE-frame keypoints, when storage keeps them
    pub keypoints: Option<Keypoints>,
}

/// Wall-time spent in the stages of the last frame (seconds).
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameTimings {
    pub extraction: f64,
    pub ego_motion: f64,
    pub mapping: f64,
    pub map_update: f64,
    pub total: f64,
}

/// What `add_frame` reports back to the host.
#[derive(Debug, Clone)]
pub struct FrameSummary {
    pub seq: u64,
    pub world_pose: Transform,
    /// 6×6 covariance in (rX, rY, rZ, X, Y, Z) order
    pub covariance: Matrix6<f64>,
    pub ego_motion_converged: bool,
    pub mapping_converged: bool,
    pub matched_keypoints: usize,
    pub latency: f64,
}

fn category_index(category: Category) -> usize {
    match category {
        Category::Edge => 0,
        Category::Planar => 1,
        Category::Blob => 2,
    }
}

/// Where an ICP stage looks up neighborhoods.
enum IcpTarget<'a> {
    PrevFrame(&'a [PointKdTree; 3]),
    Maps(&'a [RollingGrid; 3]),
}

impl IcpTarget<'_> {
    fn knn(&self, category: Category, query: Vector3<f64>, k: usize) -> Vec<(f64, &types::Point)> {
        match self {
            IcpTarget::PrevFrame(trees) => trees[category_index(category)].knn(query, k),
            IcpTarget::Maps(maps) => maps[category_index(category)].submap_knn(query, k),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            IcpTarget::PrevFrame(trees) => trees.iter().all(|t| t.is_empty()),
            IcpTarget::Maps(maps) => maps.iter().all(|m| m.submap_len() == 0),
        }
    }
}

struct IcpOutcome {
    params: DVector<f64>,
    histograms: [MatchHistogram; 3],
    matched: usize,
    report: Option<LmReport>,
}

/// One ICP stage: repeated matching passes, each followed by an LM
/// solve, with the robustifier scale annealed across passes.
fn run_icp(
    pool: &ThreadPool,
    sources: &Keypoints,
    target: &IcpTarget<'_>,
    initial: DVector<f64>,
    cfg: &IcpConfig,
    frame_duration: f64,
    extra_blocks: &[ResidualBlock],
) -> IcpOutcome {
    let mut params = initial;
    let mut histograms = [MatchHistogram::default(); 3];
    let mut matched = 0usize;
    let mut report = None;

    for iter in 0..cfg.icp_max_iter {
        let scale = cfg.matching.loss_scale(iter, cfg.icp_max_iter);
        let ctx = EvalContext { loss_scale: scale };

        histograms = [MatchHistogram::default(); 3];
        let mut blocks: Vec<ResidualBlock> = extra_blocks.to_vec();
        for category in Category::ALL {
            let cloud = sources.get(category);
            let k = cfg.matching.neighbors_for(category);
            let params_ref = &params;
            let matching = &cfg.matching;
            let results: Vec<Result<PointResidual, MatchStatus>> = pool.install(|| {
                cloud
                    .points
                    .par_iter()
                    .map(|p| {
                        let tau = if frame_duration > 0.0 {
                            (p.time / frame_duration).clamp(0.0, 1.0)
                        } else {
                            1.0
                        };
                        let pose = pose_at(params_ref, tau);
                        let warped = pose.transform_vector(p.position());
                        let neighbors = target.knn(category, warped, k);
                        let fit = fit_neighborhood(category, &neighbors, matching)?;
                        Ok(PointResidual {
                            a: fit.a,
                            p: fit.p,
                            x: p.position(),
                            time: tau,
                            weight: 1.0,
                        })
                    })
                    .collect()
            });
            for result in results {
                match result {
                    Ok(residual) => {
                        histograms[category_index(category)].record(MatchStatus::Success);
                        blocks.push(ResidualBlock::Point(residual));
                    }
                    Err(status) => histograms[category_index(category)].record(status),
                }
            }
        }

        matched = blocks.len() - extra_blocks.len();
        if matched < cfg.min_matched_keypoints {
            debug!(matched, "Not enough matches, stage aborted");
            report = None;
            break;
        }

        let lm = solve_lm(&blocks, params.clone(), &ctx, &LmConfig {
            max_iterations: cfg.lm_max_iter,
            ..LmConfig::default()
        });
        params = lm.params.clone();
        report = Some(lm);
    }

    IcpOutcome {
        params,
        histograms,
        matched,
        report,
    }
}

/// Warp every keypoint to the sensor pose at end of sweep, given the
/// relative motion over the sweep.
fn undistort_to_sweep_end(kp: &Keypoints, motion: &Transform, frame_duration: f64) -> Keypoints {
    let mut out = kp.clone();
    let inverse_end = motion.inverse();
    for category in Category::ALL {
        let cloud = out.get_mut(category);
        for p in cloud.points.iter_mut() {
            let tau = if frame_duration > 0.0 {
                (p.time / frame_duration).clamp(0.0, 1.0)
            } else {
                1.0
            };
            let pose = inverse_end.compose(&motion.scaled(tau));
            *p = pose.transform_point(p);
        }
    }
    out
}

/// Covariance reordered from the parameter layout (X, Y, Z, rX, rY,
/// rZ) to the published (rX, rY, rZ, X, Y, Z) order.
fn reorder_covariance(cov: &Matrix6<f64>) -> Matrix6<f64> {
    const PERM: [usize; 6] = [3, 4, 5, 0, 1, 2];
    let mut out = Matrix6::zeros();
    for i in 0..6 {
        for j in 0..6 {
            out[(i, j)] = cov[(PERM[i], PERM[j])];
        }
    }
    out
}

const LARGE_COVARIANCE: f64 = 1e6;

/// The SLAM engine. One instance per sensor; `add_frame` must see
/// frames in monotonic sequence order.
pub struct SlamEngine {
    config: SlamConfig,
    extractor: Box<dyn KeypointExtractor>,
    pool: ThreadPool,
    /// One rolling grid per keypoint category
    maps: [RollingGrid; 3],
    t_world: Transform,
    /// Cache of the pose before the current frame; never exposed
    previous_t_world: Transform,
    t_relative: Transform,
    /// Last mapping covariance, (rX, rY, rZ, X, Y, Z) order
    mapping_covariance: Matrix6<f64>,
    ego_motion_endpoints: (Transform, Transform),
    mapping_endpoints: (Transform, Transform),
    n_frames: u64,
    last_seq: Option<u64>,
    last_stamp: f64,
    latency: f64,
    previous_keypoints: Option<Keypoints>,
    log: VecDeque<TrajectoryEntry>,
    pub sensors: SensorHub,
    ego_histograms: [MatchHistogram; 3],
    mapping_histograms: [MatchHistogram; 3],
    timings: FrameTimings,
}

impl SlamEngine {
    pub fn new(config: SlamConfig) -> Result<Self, SlamError> {
        let extractor = Box::new(SpinningExtractor::new(SpinningExtractorConfig::default()));
        Self::with_extractor(config, extractor)
    }

    /// Build with a caller-supplied extractor implementation.
    pub fn with_extractor(
        config: SlamConfig,
        extractor: Box<dyn KeypointExtractor>,
    ) -> Result<Self, SlamError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.nb_threads)
            .build()
            .map_err(|e| SlamError::ThreadPool(e.to_string()))?;
        let maps = std::array::from_fn(|i| {
            let mut grid = RollingGrid::new(
                config.map.grid_size,
                config.map.voxel_resolution,
                config.map.leaf_sizes[i],
            );
            grid.set_sampling_mode(config.map.sampling_mode);
            grid.reset(Vector3::zeros());
            grid
        });
        Ok(Self {
            config,
            extractor,
            pool,
            maps,
            t_world: Transform::identity(),
            previous_t_world: Transform::identity(),
            t_relative: Transform::identity(),
            mapping_covariance: Matrix6::identity(),
            ego_motion_endpoints: (Transform::identity(), Transform::identity()),
            mapping_endpoints: (Transform::identity(), Transform::identity()),
            n_frames: 0,
            last_seq: None,
            last_stamp: 0.0,
            latency: 0.0,
            previous_keypoints: None,
            log: VecDeque::new(),
            sensors: SensorHub::new(),
            ego_histograms: [MatchHistogram::default(); 3],
            mapping_histograms: [MatchHistogram::default(); 3],
            timings: FrameTimings::default(),
        })
    }

    /// Swap the keypoint extractor at runtime.
    pub fn set_extractor(&mut self, extractor: Box<dyn KeypointExtractor>) {
        self.extractor = extractor;
    }

    pub fn config(&self) -> &SlamConfig {
        &self.config
    }

    /// Run the full per-frame pipeline.
    pub fn add_frame(&mut self, cloud: &PointCloud) -> Result<FrameSummary, SlamError> {
        let frame_start = Instant::now();

        // 1. Prepare: input checks and sweep-relative time
        if cloud.is_empty() {
            warn!(seq = cloud.header.seq, "Empty cloud, frame skipped");
            return Err(SlamError::EmptyCloud);
        }
        if let Some(last) = self.last_seq {
            if cloud.header.seq <= last {
                warn!(seq = cloud.header.seq, last, "Out-of-order frame dropped");
                return Err(SlamError::OutOfOrderFrame {
                    seq: cloud.header.seq,
                    last,
                });
            }
        }
        self.last_seq = Some(cloud.header.seq);
        let stamp = cloud.header.stamp;
        let previous_stamp = self.last_stamp;
        self.last_stamp = stamp;

        let mut lidar_cloud = cloud.clone();
        let t_min = lidar_cloud
            .points
            .iter()
            .map(|p| p.time)
            .fold(f64::INFINITY, f64::min);
        for p in lidar_cloud.points.iter_mut() {
            p.time = (p.time - t_min).clamp(0.0, self.config.frame_duration);
        }

        // 2. Extract keypoints, move them to BASE
        let t_extract = Instant::now();
        let extractor = self.extractor.as_mut();
        let pool = &self.pool;
        let kp_lidar = pool.install(|| extractor.compute_keypoints(&lidar_cloud));
        let mut kp_base = kp_lidar.clone();
        let base_to_lidar = self.config.base_to_lidar;
        for category in Category::ALL {
            let cloud = kp_base.get_mut(category);
            cloud.header.frame = Frame::Base;
            for p in cloud.points.iter_mut() {
                *p = base_to_lidar.transform_point(p);
            }
        }
        self.timings.extraction = t_extract.elapsed().as_secs_f64();
        debug!(
            seq = cloud.header.seq,
            edges = kp_base.edges.len(),
            planars = kp_base.planars.len(),
            blobs = kp_base.blobs.len(),
            "Frame prepared"
        );

        // 3. Ego-motion against the previous frame
        let t_ego = Instant::now();
        let mut ego_converged = false;
        let initial_relative = self
            .sensors
            .imu
            .predict_relative(previous_stamp, stamp)
            .filter(|_| self.n_frames > 0)
            .unwrap_or(self.t_relative);

        if let Some(previous) = &self.previous_keypoints {
            let trees: [PointKdTree; 3] = [
                PointKdTree::build(&previous.edges),
                PointKdTree::build(&previous.planars),
                PointKdTree::build(&previous.blobs),
            ];
            let target = IcpTarget::PrevFrame(&trees);
            if target.is_empty() {
                warn!("Previous frame has no keypoints, ego-motion skipped");
            } else {
                let initial = self.stage_initial(&initial_relative);
                let outcome = run_icp(
                    &self.pool,
                    &kp_base,
                    &target,
                    initial,
                    &self.config.ego_motion,
                    self.config.frame_duration,
                    &[],
                );
                self.ego_histograms = outcome.histograms;
                if let Some(report) = &outcome.report {
                    let solved = end_pose(&outcome.params);
                    if solved.translation().norm() > self.config.max_distance_for_icp_matching {
                        warn!(
                            distance = solved.translation().norm(),
                            "Ego-motion gate failed, falling back to identity"
                        );
                        self.t_relative = Transform::identity();
                    } else {
                        self.t_relative = solved;
                        self.ego_motion_endpoints = (
                            pose_at(&outcome.params, 0.0)
                                .stamped(stamp - self.config.frame_duration),
                            pose_at(&outcome.params, 1.0).stamped(stamp),
                        );
                        ego_converged = report.converged;
                    }
                } else {
                    warn!("Ego-motion matched too few keypoints, constant velocity kept");
                }
            }
        }

        self.timings.ego_motion = t_ego.elapsed().as_secs_f64();

        // 4. Compose the world pose guess
        self.previous_t_world = self.t_world;
        let world_guess = self.t_world.compose(&self.t_relative);

        // 5. Mapping against the rolled sub-maps
        let t_mapping = Instant::now();
        let mapping_sources = match self.config.undistortion {
            UndistortionMode::Approximated => {
                undistort_to_sweep_end(&kp_base, &self.t_relative, self.config.frame_duration)
            }
            _ => kp_base.clone(),
        };

        // world-frame bounding box of the frame's keypoints
        let mut world_kp = mapping_sources.clone();
        for category in Category::ALL {
            let cloud = world_kp.get_mut(category);
            cloud.header.frame = Frame::World;
            for p in cloud.points.iter_mut() {
                *p = world_guess.transform_point(p);
            }
        }

        let mut mapping_converged = false;
        let mut matched_keypoints = 0;
        if let Some((lo, hi)) = world_kp.bounding_box() {
            for map in self.maps.iter_mut() {
                map.roll(lo, hi);
                map.build_submap_kdtree(Some((lo, hi)));
            }

            let target = IcpTarget::Maps(&self.maps);
            if target.is_empty() {
                debug!("Maps are empty, mapping solves nothing this frame");
                self.t_world = world_guess;
                self.mapping_covariance = Matrix6::identity() * LARGE_COVARIANCE;
            } else {
                let extra = self
                    .sensors
                    .constraints(stamp, &world_guess.rotation());
                let initial = self.mapping_initial(&world_guess);
                let outcome = run_icp(
                    &self.pool,
                    &mapping_sources,
                    &target,
                    initial,
                    &self.config.mapping,
                    self.config.frame_duration,
                    &extra,
                );
                self.mapping_histograms = outcome.histograms;
                matched_keypoints = outcome.matched;
                match &outcome.report {
                    Some(report) => {
                        self.t_world = end_pose(&outcome.params);
                        self.mapping_endpoints = (
                            pose_at(&outcome.params, 0.0)
                                .stamped(stamp - self.config.frame_duration),
                            pose_at(&outcome.params, 1.0).stamped(stamp),
                        );
                        let hessian = end_pose_hessian(report);
                        let covariance = hessian
                            .try_inverse()
                            .filter(|c| c.iter().all(|v| v.is_finite()))
                            .unwrap_or_else(|| Matrix6::identity() * LARGE_COVARIANCE);
                        self.mapping_covariance = reorder_covariance(&covariance);
                        mapping_converged = true;
                    }
                    None => {
                        warn!("Mapping matched too few keypoints, constant velocity kept");
                        self.t_world = world_guess;
                        self.mapping_covariance = Matrix6::identity() * LARGE_COVARIANCE;
                    }
                }
            }
        } else {
            self.t_world = world_guess;
            self.mapping_covariance = Matrix6::identity() * LARGE_COVARIANCE;
        }
        self.t_world = self.t_world.stamped(stamp).in_frame(Frame::World);
        self.t_relative = self.previous_t_world.relative_to(&self.t_world);
        self.timings.mapping = t_mapping.elapsed().as_secs_f64();

        // 6. Undistort with the refined motion
        let undistorted = match self.config.undistortion {
            UndistortionMode::None => kp_base,
            _ => undistort_to_sweep_end(&kp_base, &self.t_relative, self.config.frame_duration),
        };

        // 7. Map update
        let t_update = Instant::now();
        if self.config.update_map {
            for category in Category::ALL {
                let mut world_cloud = undistorted.get(category).clone();
                world_cloud.header.frame = Frame::World;
                for p in world_cloud.points.iter_mut() {
                    *p = self.t_world.transform_point(p);
                }
                self.maps[category_index(category)].add(&world_cloud, false, true);
            }
        }
        self.timings.map_update = t_update.elapsed().as_secs_f64();

        // 8. Log
        if self.config.logging_timeout != 0.0 {
            let keypoints = match self.config.logging_storage {
                LoggingStorage::None => None,
                LoggingStorage::Clone => Some(undistorted.clone()),
            };
            self.log.push_back(TrajectoryEntry {
                pose: self.t_world,
                covariance: self.mapping_covariance,
                keypoints,
            });
            if self.config.logging_timeout > 0.0 {
                let horizon = stamp - self.config.logging_timeout;
                while self
                    .log
                    .front()
                    .is_some_and(|entry| entry.pose.time < horizon)
                {
                    self.log.pop_front();
                }
            }
        }

        // sensor bookkeeping for the next frame
        self.sensors
            .odometry
            .set_reference(stamp, self.t_world.translation());
        self.sensors.landmark.update_absolute(stamp, &self.t_world);

        self.previous_keypoints = Some(undistorted);
        self.n_frames += 1;

        // 9. Latency
        self.latency = frame_start.elapsed().as_secs_f64();
        self.timings.total = self.latency;
        info!(
            seq = cloud.header.seq,
            x = self.t_world.translation().x,
            y = self.t_world.translation().y,
            z = self.t_world.translation().z,
            latency_ms = self.latency * 1e3,
            "Frame registered"
        );

        Ok(FrameSummary {
            seq: cloud.header.seq,
            world_pose: self.t_world,
            covariance: self.mapping_covariance,
            ego_motion_converged: ego_converged,
            mapping_converged,
            matched_keypoints,
            latency: self.latency,
        })
    }

    /// Initial parameter vector for the ego-motion stage.
    fn stage_initial(&self, relative: &Transform) -> DVector<f64> {
        match self.config.undistortion {
            UndistortionMode::Optimized => {
                let mut params = DVector::zeros(12);
                params
                    .rows_mut(6, 6)
                    .copy_from(&relative.params());
                params
            }
            _ => DVector::from_column_slice(relative.params().as_slice()),
        }
    }

    /// Initial parameter vector for the mapping stage.
    fn mapping_initial(&self, world_guess: &Transform) -> DVector<f64> {
        match self.config.undistortion {
            UndistortionMode::Optimized => {
                let mut params = DVector::zeros(12);
                params
                    .rows_mut(0, 6)
                    .copy_from(&self.previous_t_world.params());
                params.rows_mut(6, 6).copy_from(&world_guess.params());
                params
            }
            _ => DVector::from_column_slice(world_guess.params().as_slice()),
        }
    }

    /// Current BASE-in-WORLD pose.
    pub fn world_transform(&self) -> Transform {
        self.t_world
    }

    /// World pose projected forward by the last measured latency,
    /// assuming the current relative motion continues.
    pub fn latency_compensated_world_transform(&self) -> Transform {
        if self.config.frame_duration <= 0.0 {
            return self.t_world;
        }
        let fraction = self.latency / self.config.frame_duration;
        self.t_world.compose(&self.t_relative.scaled(fraction))
    }

    /// Relative motion of the last frame (BASE k in BASE k−1).
    pub fn relative_transform(&self) -> Transform {
        self.t_relative
    }

    /// Last mapping covariance, (rX, rY, rZ, X, Y, Z) order.
    pub fn mapping_covariance(&self) -> Matrix6<f64> {
        self.mapping_covariance
    }

    /// Sweep start/end poses of the last ego-motion solve.
    pub fn ego_motion_endpoints(&self) -> (Transform, Transform) {
        self.ego_motion_endpoints
    }

    /// Sweep start/end poses of the last mapping solve.
    pub fn mapping_endpoints(&self) -> (Transform, Transform) {
        self.mapping_endpoints
    }

    /// Sensor path over the last sweep from the ego-motion endpoints,
    /// queryable at any within-sweep time.
    pub fn ego_motion_path(&self) -> SampledTrajectory {
        SampledTrajectory::from_samples(vec![
            self.ego_motion_endpoints.0,
            self.ego_motion_endpoints.1,
        ])
    }

    /// Sensor path over the last sweep from the mapping endpoints.
    pub fn mapping_path(&self) -> SampledTrajectory {
        SampledTrajectory::from_samples(vec![self.mapping_endpoints.0, self.mapping_endpoints.1])
    }

    pub fn n_frames(&self) -> u64 {
        self.n_frames
    }

    pub fn latency(&self) -> f64 {
        self.latency
    }

    pub fn timings(&self) -> FrameTimings {
        self.timings
    }

    /// Logged poses with covariances, oldest first.
    pub fn trajectory(&self) -> Vec<(Transform, Matrix6<f64>)> {
        self.log
            .iter()
            .map(|entry| (entry.pose, entry.covariance))
            .collect()
    }

    pub fn log_len(&self) -> usize {
        self.log.len()
    }

    /// Dense cloud of one keypoint map.
    pub fn map(&self, category: Category) -> PointCloud {
        self.maps[category_index(category)].get()
    }

    /// Match-outcome histograms of the last ego-motion pass, indexed
    /// edge / planar / blob.
    pub fn ego_motion_histograms(&self) -> &[MatchHistogram; 3] {
        &self.ego_histograms
    }

    /// Match-outcome histograms of the last mapping pass.
    pub fn mapping_histograms(&self) -> &[MatchHistogram; 3] {
        &self.mapping_histograms
    }

    /// Per-point feature arrays from the last extraction.
    pub fn frame_features(&self) -> &FrameFeatures {
        self.extractor.frame_features()
    }

    /// Initial BASE-in-WORLD pose; call before the first frame.
    pub fn set_world_transform(&mut self, pose: Transform) {
        self.t_world = pose;
        self.previous_t_world = pose;
    }

    /// Drop all maps, the log and the pose state; configuration and
    /// sensor calibrations survive.
    pub fn reset(&mut self) {
        for map in self.maps.iter_mut() {
            map.reset(Vector3::zeros());
        }
        self.log.clear();
        self.t_world = Transform::identity();
        self.previous_t_world = Transform::identity();
        self.t_relative = Transform::identity();
        self.mapping_covariance = Matrix6::identity();
        self.ego_motion_endpoints = (Transform::identity(), Transform::identity());
        self.mapping_endpoints = (Transform::identity(), Transform::identity());
        self.n_frames = 0;
        self.last_seq = None;
        self.last_stamp = 0.0;
        self.latency = 0.0;
        self.previous_keypoints = None;
        self.sensors.clear();
        info!("Engine reset");
    }

    /// Write the three maps as `<prefix>_{edges,planars,blobs}.pcd`.
    pub fn save_maps(&self, prefix: &str, format: PcdFormat) -> Result<(), SlamError> {
        for category in Category::ALL {
            let cloud = self.map(category);
            pcd_io::save_cloud(&pcd_io::map_path(prefix, category), &cloud, format)?;
        }
        Ok(())
    }

    /// Replace the three maps from `<prefix>_*.pcd`; the trajectory
    /// log is preserved.
    pub fn load_maps(&mut self, prefix: &str) -> Result<(), SlamError> {
        for category in Category::ALL {
            let path = pcd_io::map_path(prefix, category);
            let cloud = pcd_io::load_cloud(Path::new(&path))?;
            let map = &mut self.maps[category_index(category)];
            let center = cloud
                .bounding_box()
                .map(|(lo, hi)| (lo + hi) / 2.0)
                .unwrap_or_else(Vector3::zeros);
            map.reset(center);
            let (fixed, transient): (Vec<types::Point>, Vec<types::Point>) = cloud
                .points
                .into_iter()
                .partition(|p| p.label == types::LABEL_FIXED);
            map.add(
                &PointCloud::with_points(cloud.header, transient),
                false,
                true,
            );
            map.add(&PointCloud::with_points(cloud.header, fixed), true, true);
        }
        info!(prefix, "Maps loaded");
        Ok(())
    }

    /// Relax the logged trajectory against a GPS track, then rebuild
    /// the maps from the logged keypoints under the new poses. On
    /// failure nothing is modified.
    pub fn pose_graph_optimization(
        &mut self,
        gps: &[GpsMeasurement],
        gps_offset: &Transform,
        cfg: &PoseGraphConfig,
    ) -> Result<(), SlamError> {
        let trajectory = self.trajectory();
        let optimized = pose_graph::optimize(&trajectory, gps, gps_offset, cfg)?;

        for (entry, pose) in self.log.iter_mut().zip(optimized.iter()) {
            entry.pose = *pose;
        }

        let have_keypoints = self.log.iter().any(|e| e.keypoints.is_some());
        if have_keypoints {
            let center = optimized
                .last()
                .map(|tf| tf.translation())
                .unwrap_or_else(Vector3::zeros);
            for map in self.maps.iter_mut() {
                map.reset(center);
            }
            for entry in &self.log {
                let Some(kp) = &entry.keypoints else { continue };
                for category in Category::ALL {
                    let mut world_cloud = kp.get(category).clone();
                    world_cloud.header.frame = Frame::World;
                    for p in world_cloud.points.iter_mut() {
                        *p = entry.pose.transform_point(p);
                    }
                    self.maps[category_index(category)].add(&world_cloud, false, true);
                }
            }
        } else {
            warn!("No logged keypoints, maps were not rebuilt");
        }

        if let Some(last) = optimized.last() {
            self.t_world = *last;
            self.previous_t_world = if optimized.len() >= 2 {
                optimized[optimized.len() - 2]
            } else {
                *last
            };
            self.t_relative = self.previous_t_world.relative_to(&self.t_world);
        }
        info!(poses = optimized.len(), "Trajectory replaced after relaxation");
        Ok(())
    }
}
