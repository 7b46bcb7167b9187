//! Stamped SE(3) transforms and trajectory interpolation.
//!
//! The motion model is deliberately simple: between two endpoint poses
//! the sensor is assumed to move with constant velocity, so a pose at
//! a fractional time is obtained by interpolating the translation
//! linearly and the rotation by slerp. The same interpolation serves
//! within-frame undistortion and the intra-sweep term of both
//! registration passes.

use nalgebra::{Isometry3, Matrix3, Rotation3, Translation3, UnitQuaternion, Vector3, Vector6};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use types::Frame;

#[derive(Error, Debug)]
pub enum TrajectoryError {
    #[error("Trajectory has no samples")]
    Empty,
}

/// A rigid isometry with an attached timestamp and frame id.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Transform {
    /// Time the pose refers to (seconds, sensor clock)
    pub time: f64,
    /// Frame the pose is expressed in
    pub frame: Frame,
    iso: Isometry3<f64>,
}

impl Transform {
    pub fn identity() -> Self {
        Self {
            time: 0.0,
            frame: Frame::World,
            iso: Isometry3::identity(),
        }
    }

    pub fn new(time: f64, translation: Vector3<f64>, rotation: UnitQuaternion<f64>) -> Self {
        Self {
            time,
            frame: Frame::World,
            iso: Isometry3::from_parts(Translation3::from(translation), rotation),
        }
    }

    pub fn from_isometry(iso: Isometry3<f64>) -> Self {
        Self {
            time: 0.0,
            frame: Frame::World,
            iso,
        }
    }

    /// Pose from a 6-parameter block (Tx, Ty, Tz, rX, rY, rZ),
    /// rotation built from Euler angles in Z·Y·X order.
    pub fn from_params(params: &Vector6<f64>) -> Self {
        let rotation = rotation_from_euler(params[3], params[4], params[5]);
        Self::new(
            0.0,
            Vector3::new(params[0], params[1], params[2]),
            UnitQuaternion::from_rotation_matrix(&rotation),
        )
    }

    /// The inverse mapping of [`Transform::from_params`].
    pub fn params(&self) -> Vector6<f64> {
        let t = self.translation();
        let (rx, ry, rz) = self.iso.rotation.euler_angles();
        Vector6::new(t.x, t.y, t.z, rx, ry, rz)
    }

    pub fn stamped(mut self, time: f64) -> Self {
        self.time = time;
        self
    }

    pub fn in_frame(mut self, frame: Frame) -> Self {
        self.frame = frame;
        self
    }

    pub fn isometry(&self) -> &Isometry3<f64> {
        &self.iso
    }

    pub fn translation(&self) -> Vector3<f64> {
        self.iso.translation.vector
    }

    pub fn rotation(&self) -> UnitQuaternion<f64> {
        self.iso.rotation
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.iso.rotation.to_rotation_matrix().into_inner()
    }

    pub fn inverse(&self) -> Self {
        Self {
            time: self.time,
            frame: self.frame,
            iso: self.iso.inverse(),
        }
    }

    /// Compose transforms: self * other.
    /// If self maps B->A and other maps C->B, the result maps C->A.
    pub fn compose(&self, other: &Transform) -> Transform {
        Transform {
            time: other.time,
            frame: self.frame,
            iso: self.iso * other.iso,
        }
    }

    /// Relative transform taking self to other (self⁻¹ · other).
    pub fn relative_to(&self, other: &Transform) -> Transform {
        Transform {
            time: other.time,
            frame: self.frame,
            iso: self.iso.inverse() * other.iso,
        }
    }

    pub fn transform_vector(&self, v: Vector3<f64>) -> Vector3<f64> {
        self.iso
            .transform_point(&nalgebra::Point3::from(v))
            .coords
    }

    /// Move a LiDAR return to this transform's parent frame.
    pub fn transform_point(&self, p: &types::Point) -> types::Point {
        p.with_position(self.transform_vector(p.position()))
    }

    /// Fraction of this motion: interpolate(identity, self, t).
    pub fn scaled(&self, t: f64) -> Transform {
        interpolate(&Transform::identity(), self, t)
    }

    pub fn is_finite(&self) -> bool {
        self.translation().iter().all(|v| v.is_finite())
            && self.iso.rotation.coords.iter().all(|v| v.is_finite())
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::identity()
    }
}

impl std::ops::Mul for Transform {
    type Output = Transform;

    fn mul(self, rhs: Transform) -> Transform {
        self.compose(&rhs)
    }
}

impl std::ops::Mul<&Transform> for &Transform {
    type Output = Transform;

    fn mul(self, rhs: &Transform) -> Transform {
        self.compose(rhs)
    }
}

/// Linear SE(3) interpolation between h0 (t=0) and h1 (t=1):
/// translation lerped, rotation slerped. t is not clamped so callers
/// can extrapolate slightly past either endpoint.
pub fn interpolate(h0: &Transform, h1: &Transform, t: f64) -> Transform {
    let translation = h0.translation() * (1.0 - t) + h1.translation() * t;
    let r0 = h0.rotation();
    let r1 = h1.rotation();
    let rotation = r0
        .try_slerp(&r1, t, 1e-9)
        .unwrap_or(if t < 0.5 { r0 } else { r1 });
    Transform {
        time: h0.time * (1.0 - t) + h1.time * t,
        frame: h0.frame,
        iso: Isometry3::from_parts(Translation3::from(translation), rotation),
    }
}

/// Rotation from Euler angles applied in Z·Y·X order:
/// R = Rz(rz) · Ry(ry) · Rx(rx).
pub fn rotation_from_euler(rx: f64, ry: f64, rz: f64) -> Rotation3<f64> {
    Rotation3::from_euler_angles(rx, ry, rz)
}

/// A monotonically time-indexed sequence of transforms supporting
/// query-by-time with endpoint clamping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SampledTrajectory {
    samples: Vec<Transform>,
}

impl SampledTrajectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_samples(mut samples: Vec<Transform>) -> Self {
        samples.sort_by(|a, b| a.time.total_cmp(&b.time));
        Self { samples }
    }

    /// Insert keeping time order; out-of-order samples are sorted in.
    pub fn push(&mut self, tf: Transform) {
        match self.samples.last() {
            Some(last) if tf.time < last.time => {
                let idx = self
                    .samples
                    .partition_point(|s| s.time <= tf.time);
                self.samples.insert(idx, tf);
            }
            _ => self.samples.push(tf),
        }
    }

    pub fn samples(&self) -> &[Transform] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn start_time(&self) -> Option<f64> {
        self.samples.first().map(|s| s.time)
    }

    pub fn end_time(&self) -> Option<f64> {
        self.samples.last().map(|s| s.time)
    }

    /// Pose at `time`, clamped at both endpoints.
    pub fn interpolate_at(&self, time: f64) -> Result<Transform, TrajectoryError> {
        let first = self.samples.first().ok_or(TrajectoryError::Empty)?;
        let last = self.samples.last().unwrap();
        if time <= first.time {
            return Ok(first.stamped(first.time));
        }
        if time >= last.time {
            return Ok(last.stamped(last.time));
        }
        // first sample with sample.time > time; the bracket is [hi-1, hi]
        let hi = self.samples.partition_point(|s| s.time <= time);
        let h0 = &self.samples[hi - 1];
        let h1 = &self.samples[hi];
        let span = h1.time - h0.time;
        let t = if span > 0.0 {
            (time - h0.time) / span
        } else {
            0.0
        };
        Ok(interpolate(h0, h1, t).stamped(time))
    }
}
