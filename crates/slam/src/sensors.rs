//! External-sensor constraint managers.
//!
//! Every manager buffers a time-sorted list of typed measurements
//! behind its own mutex, so feeding measurements and synchronizing
//! against LiDAR frames may happen from different threads. A
//! per-buffer cursor accelerates monotonic queries and resets itself
//! whenever the buffer is rewound.

use std::sync::Mutex;

use nalgebra::{Matrix3, Matrix6, UnitQuaternion, Vector3};
use tracing::debug;
use transforms::{interpolate, Transform};

use crate::optim::{DistanceResidual, OrientationResidual, PointResidual, ResidualBlock};

/// A time-stamped measurement that can be linearly interpolated.
pub trait Measurement: Clone + Send {
    fn time(&self) -> f64;
    fn lerp(a: &Self, b: &Self, t: f64) -> Self;
}

#[derive(Debug, Clone, Copy)]
pub struct OdomMeasurement {
    pub time: f64,
    /// Cumulative traveled distance (meters)
    pub distance: f64,
}

impl Measurement for OdomMeasurement {
    fn time(&self) -> f64 {
        self.time
    }

    fn lerp(a: &Self, b: &Self, t: f64) -> Self {
        Self {
            time: a.time * (1.0 - t) + b.time * t,
            distance: a.distance * (1.0 - t) + b.distance * t,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GravityMeasurement {
    pub time: f64,
    /// Acceleration in the BASE frame (m/s²)
    pub acceleration: Vector3<f64>,
}

impl Measurement for GravityMeasurement {
    fn time(&self) -> f64 {
        self.time
    }

    fn lerp(a: &Self, b: &Self, t: f64) -> Self {
        Self {
            time: a.time * (1.0 - t) + b.time * t,
            acceleration: a.acceleration * (1.0 - t) + b.acceleration * t,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LandmarkMeasurement {
    pub time: f64,
    /// Tag pose in the BASE frame
    pub pose: Transform,
    pub covariance: Matrix6<f64>,
}

impl Measurement for LandmarkMeasurement {
    fn time(&self) -> f64 {
        self.time
    }

    fn lerp(a: &Self, b: &Self, t: f64) -> Self {
        Self {
            time: a.time * (1.0 - t) + b.time * t,
            pose: interpolate(&a.pose, &b.pose, t),
            covariance: a.covariance * (1.0 - t) + b.covariance * t,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GpsMeasurement {
    pub time: f64,
    /// Antenna position in the WORLD frame
    pub position: Vector3<f64>,
    pub covariance: Matrix3<f64>,
}

impl Measurement for GpsMeasurement {
    fn time(&self) -> f64 {
        self.time
    }

    fn lerp(a: &Self, b: &Self, t: f64) -> Self {
        Self {
            time: a.time * (1.0 - t) + b.time * t,
            position: a.position * (1.0 - t) + b.position * t,
            covariance: a.covariance * (1.0 - t) + b.covariance * t,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoseMeasurement {
    pub time: f64,
    /// Sensor pose in the WORLD frame
    pub pose: Transform,
    pub covariance: Matrix6<f64>,
}

impl Measurement for PoseMeasurement {
    fn time(&self) -> f64 {
        self.time
    }

    fn lerp(a: &Self, b: &Self, t: f64) -> Self {
        Self {
            time: a.time * (1.0 - t) + b.time * t,
            pose: interpolate(&a.pose, &b.pose, t),
            covariance: a.covariance * (1.0 - t) + b.covariance * t,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ImuSample {
    pub time: f64,
    pub acceleration: Vector3<f64>,
    pub angular_velocity: Vector3<f64>,
}

impl Measurement for ImuSample {
    fn time(&self) -> f64 {
        self.time
    }

    fn lerp(a: &Self, b: &Self, t: f64) -> Self {
        Self {
            time: a.time * (1.0 - t) + b.time * t,
            acceleration: a.acceleration * (1.0 - t) + b.acceleration * t,
            angular_velocity: a.angular_velocity * (1.0 - t) + b.angular_velocity * t,
        }
    }
}

struct BufferState<M> {
    measures: Vec<M>,
    cursor: usize,
}

/// Bounded, time-sorted measurement buffer with a monotonic-query
/// cursor.
pub struct MeasurementBuffer<M: Measurement> {
    state: Mutex<BufferState<M>>,
    /// Oldest measurements are evicted past this size
    pub max_measures: usize,
    /// Max extrapolation outside the buffer and max bracket width (s)
    pub time_threshold: f64,
}

impl<M: Measurement> MeasurementBuffer<M> {
    pub fn new(max_measures: usize, time_threshold: f64) -> Self {
        Self {
            state: Mutex::new(BufferState {
                measures: Vec::new(),
                cursor: 0,
            }),
            max_measures,
            time_threshold,
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().measures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.measures.clear();
        state.cursor = 0;
    }

    /// Sorted insert; an out-of-order arrival rewinds the cursor.
    pub fn add(&self, m: M) {
        let mut state = self.state.lock().unwrap();
        let pos = state
            .measures
            .partition_point(|x| x.time() <= m.time());
        if pos < state.measures.len() {
            state.cursor = 0;
        }
        state.measures.insert(pos, m);
        while state.measures.len() > self.max_measures {
            state.measures.remove(0);
            state.cursor = state.cursor.saturating_sub(1);
        }
    }

    /// Measurement interpolated at `time`, None when the buffer
    /// cannot bracket it closely enough.
    pub fn synchronize(&self, time: f64) -> Option<M> {
        let mut state = self.state.lock().unwrap();
        let measures = &state.measures;
        let first = measures.first()?;
        let last = measures.last().unwrap();

        if time < first.time() {
            return (first.time() - time <= self.time_threshold).then(|| first.clone());
        }
        if time > last.time() {
            return (time - last.time() <= self.time_threshold).then(|| last.clone());
        }

        let mut cursor = state.cursor;
        if cursor >= measures.len() || measures[cursor].time() > time {
            cursor = 0;
        }
        while cursor + 1 < measures.len() && measures[cursor + 1].time() <= time {
            cursor += 1;
        }
        let result = if cursor + 1 == measures.len() {
            Some(measures[cursor].clone())
        } else {
            let prev = &measures[cursor];
            let post = &measures[cursor + 1];
            let gap = post.time() - prev.time();
            if gap > self.time_threshold {
                None
            } else {
                let t = if gap > 0.0 {
                    (time - prev.time()) / gap
                } else {
                    0.0
                };
                Some(M::lerp(prev, post, t))
            }
        };
        state.cursor = cursor;
        result
    }
}

/// Common knobs shared by all managers.
#[derive(Debug, Clone, Copy)]
pub struct SensorConfig {
    pub weight: f64,
    /// Robustifier scale for the produced residual (meters)
    pub saturation_distance: f64,
    pub time_threshold: f64,
    pub max_measures: usize,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            weight: 1.0,
            saturation_distance: 5.0,
            time_threshold: 0.5,
            max_measures: 1_000,
        }
    }
}

/// Wheel odometer: scalar traveled distance, relative to the last
/// reference or absolute from the odometer zero.
pub struct WheelOdometryManager {
    pub buffer: MeasurementBuffer<OdomMeasurement>,
    config: SensorConfig,
    relative: bool,
    reference: Mutex<Option<(OdomMeasurement, Vector3<f64>)>>,
}

impl WheelOdometryManager {
    pub fn new(config: SensorConfig, relative: bool) -> Self {
        Self {
            buffer: MeasurementBuffer::new(config.max_measures, config.time_threshold),
            config,
            relative,
            reference: Mutex::new(None),
        }
    }

    /// Anchor the next constraint at the pose the engine had at `time`.
    pub fn set_reference(&self, time: f64, position: Vector3<f64>) {
        if let Some(m) = self.buffer.synchronize(time) {
            *self.reference.lock().unwrap() = Some((m, position));
        }
    }

    pub fn constraint(&self, time: f64) -> Option<ResidualBlock> {
        let m = self.buffer.synchronize(time)?;
        let reference = self.reference.lock().unwrap();
        let (m0, position) = reference.as_ref()?;
        let distance = if self.relative {
            m.distance - m0.distance
        } else {
            m.distance
        };
        Some(ResidualBlock::Distance(DistanceResidual {
            reference: *position,
            distance,
            weight: self.config.weight,
            saturation: self.config.saturation_distance,
        }))
    }
}

/// Gravity reference: aligns the measured gravity axis with the
/// direction captured at startup.
pub struct GravityManager {
    pub buffer: MeasurementBuffer<GravityMeasurement>,
    config: SensorConfig,
    reference: Mutex<Option<Vector3<f64>>>,
}

impl GravityManager {
    pub fn new(config: SensorConfig) -> Self {
        Self {
            buffer: MeasurementBuffer::new(config.max_measures, config.time_threshold),
            config,
            reference: Mutex::new(None),
        }
    }

    /// The first usable measurement, rotated by the pose estimate of
    /// its frame, becomes the WORLD gravity direction.
    pub fn constraint(&self, time: f64, world_rotation: &UnitQuaternion<f64>) -> Option<ResidualBlock> {
        let m = self.buffer.synchronize(time)?;
        let norm = m.acceleration.norm();
        if norm < 1e-6 {
            return None;
        }
        let direction = m.acceleration / norm;
        let mut reference = self.reference.lock().unwrap();
        let reference = reference.get_or_insert_with(|| world_rotation * direction);
        Some(ResidualBlock::Orientation(OrientationResidual {
            direction,
            reference: *reference,
            weight: self.config.weight,
            saturation: self.config.saturation_distance,
        }))
    }
}

/// Tag detections: constrains the BASE pose through the tag's
/// absolute position, estimated incrementally when not supplied.
pub struct LandmarkManager {
    pub buffer: MeasurementBuffer<LandmarkMeasurement>,
    config: SensorConfig,
    absolute: Mutex<Option<(Vector3<f64>, usize)>>,
}

impl LandmarkManager {
    pub fn new(config: SensorConfig) -> Self {
        Self {
            buffer: MeasurementBuffer::new(config.max_measures, config.time_threshold),
            config,
            absolute: Mutex::new(None),
        }
    }

    /// Pre-supplied absolute tag position in WORLD.
    pub fn set_absolute_position(&self, position: Vector3<f64>) {
        *self.absolute.lock().unwrap() = Some((position, usize::MAX));
    }

    /// Fold a new observation into the running absolute estimate.
    pub fn update_absolute(&self, time: f64, world_pose: &Transform) {
        let Some(m) = self.buffer.synchronize(time) else {
            return;
        };
        let observed = world_pose.transform_vector(m.pose.translation());
        let mut absolute = self.absolute.lock().unwrap();
        *absolute = Some(match *absolute {
            None => (observed, 1),
            Some((_, usize::MAX)) => return,
            Some((mean, count)) => {
                let n = count as f64;
                ((mean * n + observed) / (n + 1.0), count + 1)
            }
        });
    }

    pub fn constraint(&self, time: f64) -> Option<ResidualBlock> {
        let m = self.buffer.synchronize(time)?;
        let (position, count) = (*self.absolute.lock().unwrap())?;
        // a single observation carries no world information yet
        if count < 2 {
            return None;
        }
        Some(ResidualBlock::Point(PointResidual {
            a: Matrix3::identity(),
            p: position,
            x: m.pose.translation(),
            time: 1.0,
            weight: self.config.weight,
        }))
    }
}

/// GPS positions with covariance, through a calibrated antenna offset.
pub struct GpsManager {
    pub buffer: MeasurementBuffer<GpsMeasurement>,
    config: SensorConfig,
    /// Antenna pose in the BASE frame
    pub offset: Transform,
}

impl GpsManager {
    pub fn new(config: SensorConfig, offset: Transform) -> Self {
        Self {
            buffer: MeasurementBuffer::new(config.max_measures, config.time_threshold),
            config,
            offset,
        }
    }

    pub fn constraint(&self, time: f64) -> Option<ResidualBlock> {
        let m = self.buffer.synchronize(time)?;
        let a = inverse_sqrt(&m.covariance).unwrap_or_else(Matrix3::identity);
        Some(ResidualBlock::Point(PointResidual {
            a,
            p: m.position,
            x: self.offset.translation(),
            time: 1.0,
            weight: self.config.weight,
        }))
    }
}

/// Generic 6-DoF pose sensor.
pub struct PoseSensorManager {
    pub buffer: MeasurementBuffer<PoseMeasurement>,
    config: SensorConfig,
    /// Sensor pose in the BASE frame
    pub calibration: Transform,
}

impl PoseSensorManager {
    pub fn new(config: SensorConfig, calibration: Transform) -> Self {
        Self {
            buffer: MeasurementBuffer::new(config.max_measures, config.time_threshold),
            config,
            calibration,
        }
    }

    /// One translation residual plus two axis alignments.
    pub fn constraints(&self, time: f64) -> Vec<ResidualBlock> {
        let Some(m) = self.buffer.synchronize(time) else {
            return Vec::new();
        };
        let position_info = inverse_sqrt(&m.covariance.fixed_view::<3, 3>(3, 3).into_owned())
            .unwrap_or_else(Matrix3::identity);
        let meas_rotation = m.pose.rotation_matrix();
        let calib_rotation = self.calibration.rotation_matrix();
        let mut out = vec![ResidualBlock::Point(PointResidual {
            a: position_info,
            p: m.pose.translation(),
            x: self.calibration.translation(),
            time: 1.0,
            weight: self.config.weight,
        })];
        for axis in [Vector3::x(), Vector3::z()] {
            out.push(ResidualBlock::Orientation(OrientationResidual {
                direction: calib_rotation * axis,
                reference: meas_rotation * axis,
                weight: self.config.weight,
                saturation: self.config.saturation_distance,
            }));
        }
        out
    }
}

/// Midpoint preintegration of raw IMU samples into a relative pose
/// prediction.
pub struct ImuPreintegrator {
    pub gravity: Vector3<f64>,
}

impl ImuPreintegrator {
    pub fn integrate(&self, samples: &[ImuSample], t0: f64, t1: f64) -> Option<Transform> {
        let window: Vec<&ImuSample> = samples
            .iter()
            .filter(|s| s.time >= t0 && s.time <= t1)
            .collect();
        if window.len() < 2 {
            return None;
        }
        let mut rotation = UnitQuaternion::identity();
        let mut velocity = Vector3::zeros();
        let mut translation = Vector3::zeros();
        for pair in window.windows(2) {
            let dt = pair[1].time - pair[0].time;
            let omega = (pair[0].angular_velocity + pair[1].angular_velocity) / 2.0;
            let accel = (pair[0].acceleration + pair[1].acceleration) / 2.0;
            let linear = rotation * accel + self.gravity;
            translation += velocity * dt + linear * (0.5 * dt * dt);
            velocity += linear * dt;
            rotation *= UnitQuaternion::from_scaled_axis(omega * dt);
        }
        Some(Transform::new(t1, translation, rotation))
    }
}

/// IMU manager; with no preintegrator configured it is a no-op.
pub struct ImuManager {
    pub buffer: MeasurementBuffer<ImuSample>,
    preintegrator: Option<ImuPreintegrator>,
}

impl ImuManager {
    pub fn new(config: SensorConfig, preintegrator: Option<ImuPreintegrator>) -> Self {
        Self {
            buffer: MeasurementBuffer::new(config.max_measures, config.time_threshold),
            preintegrator,
        }
    }

    /// Predicted relative motion over [t0, t1], None without a
    /// preintegrator or enough samples.
    pub fn predict_relative(&self, t0: f64, t1: f64) -> Option<Transform> {
        let integrator = self.preintegrator.as_ref()?;
        let state = self.buffer.state.lock().unwrap();
        let predicted = integrator.integrate(&state.measures, t0, t1);
        if predicted.is_none() {
            debug!(t0, t1, "IMU preintegration skipped: not enough samples");
        }
        predicted
    }
}

/// Square root of the inverse of a symmetric positive matrix, used to
/// whiten measurement residuals.
fn inverse_sqrt(m: &Matrix3<f64>) -> Option<Matrix3<f64>> {
    let eigen = m.symmetric_eigen();
    let mut out = Matrix3::zeros();
    for i in 0..3 {
        let value = eigen.eigenvalues[i];
        if !value.is_finite() || value <= 1e-12 {
            return None;
        }
        let v = eigen.eigenvectors.column(i);
        out += v * v.transpose() / value.sqrt();
    }
    Some(out)
}
