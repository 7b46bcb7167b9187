//! Common test utilities for the SLAM pipeline scenarios.

use nalgebra::Vector3;
use transforms::Transform;
use types::{Frame, Header, Point, PointCloud};

/// Exit distance of a ray cast from inside an axis-aligned box.
fn ray_exit(
    origin: Vector3<f64>,
    dir: Vector3<f64>,
    lo: Vector3<f64>,
    hi: Vector3<f64>,
) -> f64 {
    let mut t = f64::INFINITY;
    for a in 0..3 {
        if dir[a] > 1e-12 {
            t = t.min((hi[a] - origin[a]) / dir[a]);
        } else if dir[a] < -1e-12 {
            t = t.min((lo[a] - origin[a]) / dir[a]);
        }
    }
    t
}

/// Simulate one sweep of an 8-ring spinning sensor at `pose` inside
/// a 24x16x5 m hall with a square pillar.
///
/// The pillar breaks the room's symmetry so registration has
/// unambiguous structure in every direction.
pub fn hall_frame(seq: u64, pose: &Transform) -> PointCloud {
    let lo = Vector3::new(-12.0, -8.0, -2.0);
    let hi = Vector3::new(12.0, 8.0, 3.0);
    let pillar_lo = Vector3::new(4.0, 2.0, -2.0);
    let pillar_hi = Vector3::new(6.0, 4.0, 3.0);

    let origin = pose.translation();
    let mut cloud = PointCloud::new(Header {
        stamp: seq as f64 * 0.1,
        frame: Frame::Lidar,
        seq,
    });
    for ring in 0..8u16 {
        let elevation = (-15.0 + ring as f64 * 3.5).to_radians();
        for step in 0..240 {
            let azimuth = (step as f64 * 1.5).to_radians();
            let local = Vector3::new(
                elevation.cos() * azimuth.cos(),
                elevation.cos() * azimuth.sin(),
                elevation.sin(),
            );
            let world_dir = pose.rotation() * local;
            let mut range = ray_exit(origin, world_dir, lo, hi);
            // pillar occludes the wall behind it
            if let Some(hit) = ray_box_entry(origin, world_dir, pillar_lo, pillar_hi) {
                if hit < range {
                    range = hit;
                }
            }
            cloud.points.push(Point {
                intensity: 100.0,
                time: step as f64 / 240.0 * 0.1,
                ring,
                ..Point::new(local.x * range, local.y * range, local.z * range)
            });
        }
    }
    cloud
}

/// Entry distance of a ray into an axis-aligned box from outside,
/// None when the ray misses.
fn ray_box_entry(
    origin: Vector3<f64>,
    dir: Vector3<f64>,
    lo: Vector3<f64>,
    hi: Vector3<f64>,
) -> Option<f64> {
    let mut t_enter = f64::NEG_INFINITY;
    let mut t_exit = f64::INFINITY;
    for a in 0..3 {
        if dir[a].abs() < 1e-12 {
            if origin[a] < lo[a] || origin[a] > hi[a] {
                return None;
            }
            continue;
        }
        let t0 = (lo[a] - origin[a]) / dir[a];
        let t1 = (hi[a] - origin[a]) / dir[a];
        t_enter = t_enter.max(t0.min(t1));
        t_exit = t_exit.min(t0.max(t1));
    }
    (t_enter <= t_exit && t_enter > 0.0).then_some(t_enter)
}

/// Poses along a straight line in x, one per frame.
pub fn straight_poses(n: usize, step: f64) -> Vec<Transform> {
    (0..n)
        .map(|i| {
            Transform::new(
                i as f64 * 0.1,
                Vector3::new(i as f64 * step, 0.0, 0.0),
                nalgebra::UnitQuaternion::identity(),
            )
        })
        .collect()
}
