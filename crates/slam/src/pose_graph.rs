//! Offline pose-graph relaxation of the SLAM trajectory against a
//! correlated GPS track.
//!
//! One vertex per SLAM pose; SE(3) edges between consecutive poses
//! weighted by the SLAM covariances, ℝ³ edges from matched vertices
//! to GPS positions weighted by the GPS covariances through the
//! antenna offset. Solved by damped Gauss-Newton with the first
//! vertex gauge-fixed.

use std::path::PathBuf;

use nalgebra::{DMatrix, DVector, Matrix3, Matrix6, Vector6};
use thiserror::Error;
use tracing::{debug, info, warn};
use transforms::Transform;

use crate::sensors::GpsMeasurement;

#[derive(Error, Debug)]
pub enum PoseGraphError {
    #[error("SLAM and GPS time windows do not overlap")]
    NoTimeOverlap,
    #[error("Need at least two poses, got {0}")]
    TooFewPoses(usize),
    #[error("Linear solve failed at iteration {0}")]
    SolveFailed(usize),
}

#[derive(Debug, Clone)]
pub struct PoseGraphConfig {
    pub n_iterations: usize,
    pub convergence_threshold: f64,
    /// Added to GPS stamps before matching (seconds)
    pub time_offset: f64,
    /// Dump the graph to this file before solving
    pub g2o_file: Option<PathBuf>,
}

impl Default for PoseGraphConfig {
    fn default() -> Self {
        Self {
            n_iterations: 30,
            convergence_threshold: 1e-6,
            time_offset: 0.0,
            g2o_file: None,
        }
    }
}

struct SequentialEdge {
    from: usize,
    to: usize,
    measurement: Transform,
    information: Matrix6<f64>,
}

struct GpsEdge {
    vertex: usize,
    position: nalgebra::Vector3<f64>,
    information: Matrix3<f64>,
}

/// Relax the trajectory. Returns the optimized poses with their
/// original stamps; the inputs are untouched.
pub fn optimize(
    trajectory: &[(Transform, Matrix6<f64>)],
    gps: &[GpsMeasurement],
    gps_offset: &Transform,
    cfg: &PoseGraphConfig,
) -> Result<Vec<Transform>, PoseGraphError> {
    if trajectory.len() < 2 {
        return Err(PoseGraphError::TooFewPoses(trajectory.len()));
    }
    let t_first = trajectory.first().unwrap().0.time;
    let t_last = trajectory.last().unwrap().0.time;

    // Time-align: every GPS sample inside the SLAM window constrains
    // its two bracketing vertices, with the information split by time
    // proximity so the interpolated pose carries the full weight.
    let times: Vec<f64> = trajectory.iter().map(|(tf, _)| tf.time).collect();
    let mut gps_edges = Vec::new();
    for sample in gps {
        let time = sample.time + cfg.time_offset;
        if time < t_first || time > t_last {
            continue;
        }
        let hi = times.partition_point(|&t| t <= time).min(times.len() - 1);
        let lo = hi.saturating_sub(1);
        let span = times[hi] - times[lo];
        let w_hi = if span > 0.0 {
            ((time - times[lo]) / span).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let information = sample
            .covariance
            .try_inverse()
            .unwrap_or_else(Matrix3::identity);
        for (vertex, weight) in [(lo, 1.0 - w_hi), (hi, w_hi)] {
            if weight > 1e-9 {
                gps_edges.push(GpsEdge {
                    vertex,
                    position: sample.position,
                    information: information * weight,
                });
            }
        }
    }
    if gps_edges.is_empty() {
        return Err(PoseGraphError::NoTimeOverlap);
    }

    let seq_edges: Vec<SequentialEdge> = trajectory
        .windows(2)
        .enumerate()
        .map(|(i, pair)| SequentialEdge {
            from: i,
            to: i + 1,
            measurement: pair[0].0.relative_to(&pair[1].0),
            information: pair[1].1.try_inverse().unwrap_or_else(Matrix6::identity),
        })
        .collect();

    let mut vertices: Vec<Transform> = trajectory.iter().map(|(tf, _)| *tf).collect();

    if let Some(path) = &cfg.g2o_file {
        if let Err(e) = dump_g2o(path, &vertices, &seq_edges, &gps_edges) {
            warn!(?path, error = %e, "Could not write pose graph dump");
        }
    }

    let n = vertices.len();
    info!(
        vertices = n,
        seq_edges = seq_edges.len(),
        gps_edges = gps_edges.len(),
        "Pose graph optimization started"
    );

    for iteration in 0..cfg.n_iterations {
        let mut h = DMatrix::<f64>::zeros(6 * n, 6 * n);
        let mut b = DVector::<f64>::zeros(6 * n);

        for edge in &seq_edges {
            let predicted = vertices[edge.from].relative_to(&vertices[edge.to]);
            let error: Vector6<f64> = edge.measurement.relative_to(&predicted).params();
            let omega = &edge.information;

            // J_from = -I, J_to = I in parameter space
            let i = edge.from * 6;
            let j = edge.to * 6;
            for r in 0..6 {
                for c in 0..6 {
                    h[(i + r, i + c)] += omega[(r, c)];
                    h[(j + r, j + c)] += omega[(r, c)];
                    h[(i + r, j + c)] -= omega[(r, c)];
                    h[(j + r, i + c)] -= omega[(r, c)];
                }
            }
            let weighted = omega * error;
            for r in 0..6 {
                b[i + r] -= weighted[r];
                b[j + r] += weighted[r];
            }
        }

        for edge in &gps_edges {
            let predicted = vertices[edge.vertex].compose(gps_offset).translation();
            let error = predicted - edge.position;
            let v = edge.vertex * 6;
            for r in 0..3 {
                for c in 0..3 {
                    h[(v + r, v + c)] += edge.information[(r, c)];
                }
            }
            let weighted = edge.information * error;
            for r in 0..3 {
                b[v + r] += weighted[r];
            }
        }

        // gauge freedom: pin the first vertex
        for r in 0..6 {
            h[(r, r)] += 1e10;
        }
        // damping
        for r in 0..6 * n {
            h[(r, r)] += 1e-3;
        }

        let dx = h
            .lu()
            .solve(&(-&b))
            .ok_or(PoseGraphError::SolveFailed(iteration))?;

        for (i, vertex) in vertices.iter_mut().enumerate() {
            let mut params = vertex.params();
            for r in 0..6 {
                params[r] += dx[i * 6 + r];
            }
            *vertex = Transform::from_params(&params)
                .stamped(vertex.time)
                .in_frame(vertex.frame);
        }

        let step = dx.norm();
        debug!(iteration, step, "Pose graph iteration");
        if step < cfg.convergence_threshold {
            break;
        }
    }

    Ok(vertices)
}

fn dump_g2o(
    path: &PathBuf,
    vertices: &[Transform],
    seq_edges: &[SequentialEdge],
    gps_edges: &[GpsEdge],
) -> std::io::Result<()> {
    use std::io::Write;

    let mut out = std::fs::File::create(path)?;
    for (i, v) in vertices.iter().enumerate() {
        let t = v.translation();
        let q = v.rotation();
        writeln!(
            out,
            "VERTEX_SE3:QUAT {i} {} {} {} {} {} {} {}",
            t.x, t.y, t.z, q.i, q.j, q.k, q.w
        )?;
    }
    for e in seq_edges {
        let t = e.measurement.translation();
        let q = e.measurement.rotation();
        writeln!(
            out,
            "EDGE_SE3:QUAT {} {} {} {} {} {} {} {} {}",
            e.from, e.to, t.x, t.y, t.z, q.i, q.j, q.k, q.w
        )?;
    }
    for (i, e) in gps_edges.iter().enumerate() {
        writeln!(
            out,
            "VERTEX_XYZ {} {} {} {}",
            vertices.len() + i,
            e.position.x,
            e.position.y,
            e.position.z
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{UnitQuaternion, Vector3};

    fn straight_trajectory(n: usize) -> Vec<(Transform, Matrix6<f64>)> {
        (0..n)
            .map(|i| {
                (
                    Transform::new(
                        i as f64,
                        Vector3::new(i as f64, 0.0, 0.0),
                        UnitQuaternion::identity(),
                    ),
                    Matrix6::identity(),
                )
            })
            .collect()
    }

    fn gps_from(trajectory: &[(Transform, Matrix6<f64>)]) -> Vec<GpsMeasurement> {
        trajectory
            .iter()
            .map(|(tf, _)| GpsMeasurement {
                time: tf.time,
                position: tf.translation(),
                covariance: Matrix3::identity(),
            })
            .collect()
    }

    #[test]
    fn test_consistent_inputs_are_a_fixpoint() {
        let trajectory = straight_trajectory(6);
        let gps = gps_from(&trajectory);
        let optimized = optimize(
            &trajectory,
            &gps,
            &Transform::identity(),
            &PoseGraphConfig::default(),
        )
        .unwrap();

        for ((before, _), after) in trajectory.iter().zip(optimized.iter()) {
            assert_relative_eq!(
                (before.translation() - after.translation()).norm(),
                0.0,
                epsilon = 1e-4
            );
            assert_relative_eq!(after.time, before.time, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_gps_pulls_drifted_endpoint() {
        let trajectory = straight_trajectory(6);
        // GPS disagrees: the trajectory ended 1 m further in y
        let mut gps = gps_from(&trajectory);
        for (i, sample) in gps.iter_mut().enumerate() {
            sample.position.y += i as f64 * 0.2;
        }
        let optimized = optimize(
            &trajectory,
            &gps,
            &Transform::identity(),
            &PoseGraphConfig::default(),
        )
        .unwrap();

        let drift_before = (trajectory[5].0.translation() - gps[5].position).norm();
        let drift_after = (optimized[5].translation() - gps[5].position).norm();
        assert!(drift_after < drift_before * 0.5);
    }

    #[test]
    fn test_no_time_overlap_fails() {
        let trajectory = straight_trajectory(4);
        let gps = vec![GpsMeasurement {
            time: 100.0,
            position: Vector3::zeros(),
            covariance: Matrix3::identity(),
        }];
        assert!(matches!(
            optimize(
                &trajectory,
                &gps,
                &Transform::identity(),
                &PoseGraphConfig::default()
            ),
            Err(PoseGraphError::NoTimeOverlap)
        ));
    }

    #[test]
    fn test_too_few_poses_fails() {
        let trajectory = straight_trajectory(1);
        assert!(matches!(
            optimize(
                &trajectory,
                &[],
                &Transform::identity(),
                &PoseGraphConfig::default()
            ),
            Err(PoseGraphError::TooFewPoses(1))
        ));
    }

    #[test]
    fn test_g2o_dump_written() {
        let path = std::env::temp_dir().join("sweep_slam_pose_graph_test.g2o");
        let trajectory = straight_trajectory(3);
        let gps = gps_from(&trajectory);
        let cfg = PoseGraphConfig {
            g2o_file: Some(path.clone()),
            ..PoseGraphConfig::default()
        };
        optimize(&trajectory, &gps, &Transform::identity(), &cfg).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("VERTEX_SE3:QUAT 0"));
        assert!(text.contains("EDGE_SE3:QUAT 0 1"));
        let _ = std::fs::remove_file(&path);
    }
}
