//! Nonlinear least-squares solve for the registration passes.
//!
//! Parameters are either a single pose block (Tx,Ty,Tz,rX,rY,rZ) or
//! two such blocks bounding the sweep, in which case every residual
//! interpolates the pose at its own acquisition time. Jacobians are
//! central finite differences; the damping schedule follows Madsen,
//! Nielsen and Tingleff.

use nalgebra::{DMatrix, DVector, Matrix6, Vector3, Vector6};
use rayon::prelude::*;
use transforms::{interpolate, Transform};

use crate::registration::robust_factor;

/// Per-solve context: the annealed robustifier scale for point
/// residuals (sensor residuals carry their own saturation).
#[derive(Debug, Clone, Copy)]
pub struct EvalContext {
    pub loss_scale: f64,
}

/// Point-to-model residual A·(R·X + T − P).
#[derive(Debug, Clone, Copy)]
pub struct PointResidual {
    pub a: nalgebra::Matrix3<f64>,
    /// Model point in the target frame
    pub p: Vector3<f64>,
    /// Keypoint in the moving frame
    pub x: Vector3<f64>,
    /// Normalized acquisition time in [0, 1]
    pub time: f64,
    pub weight: f64,
}

/// Wheel-odometry style constraint on the traveled distance.
#[derive(Debug, Clone, Copy)]
pub struct DistanceResidual {
    /// Translation of the reference pose
    pub reference: Vector3<f64>,
    /// Measured distance from the reference (meters)
    pub distance: f64,
    pub weight: f64,
    pub saturation: f64,
}

/// Axis-alignment constraint (gravity, pose orientation).
#[derive(Debug, Clone, Copy)]
pub struct OrientationResidual {
    /// Direction in the moving frame
    pub direction: Vector3<f64>,
    /// Reference direction in the target frame
    pub reference: Vector3<f64>,
    pub weight: f64,
    pub saturation: f64,
}

#[derive(Debug, Clone, Copy)]
pub enum ResidualBlock {
    Point(PointResidual),
    Distance(DistanceResidual),
    Orientation(OrientationResidual),
}

impl ResidualBlock {
    pub fn dim(&self) -> usize {
        match self {
            ResidualBlock::Point(_) => 3,
            ResidualBlock::Distance(_) => 1,
            ResidualBlock::Orientation(_) => 3,
        }
    }

    fn eval_into(&self, params: &DVector<f64>, ctx: &EvalContext, out: &mut [f64]) {
        match self {
            ResidualBlock::Point(res) => {
                let tf = pose_at(params, res.time);
                let r = res.a
                    * (tf.rotation_matrix() * res.x + tf.translation() - res.p)
                    * res.weight;
                let f = robust_factor(r.norm(), ctx.loss_scale);
                out[0] = r.x * f;
                out[1] = r.y * f;
                out[2] = r.z * f;
            }
            ResidualBlock::Distance(res) => {
                let tf = pose_at(params, 1.0);
                let traveled = (tf.translation() - res.reference).norm();
                let r = (traveled - res.distance) * res.weight;
                out[0] = r * robust_factor(r.abs(), res.saturation);
            }
            ResidualBlock::Orientation(res) => {
                let tf = pose_at(params, 1.0);
                let r = (tf.rotation_matrix() * res.direction - res.reference) * res.weight;
                let f = robust_factor(r.norm(), res.saturation);
                out[0] = r.x * f;
                out[1] = r.y * f;
                out[2] = r.z * f;
            }
        }
    }
}

/// Pose encoded by the parameter vector at a normalized sweep time:
/// 6 parameters form a rigid pose, 12 parameters are interpolated
/// between the sweep start and end blocks.
pub fn pose_at(params: &DVector<f64>, time: f64) -> Transform {
    debug_assert!(params.len() == 6 || params.len() == 12);
    if params.len() == 6 {
        Transform::from_params(&Vector6::from_row_slice(params.as_slice()))
    } else {
        let h0 = Transform::from_params(&Vector6::from_row_slice(&params.as_slice()[..6]));
        let h1 = Transform::from_params(&Vector6::from_row_slice(&params.as_slice()[6..]));
        interpolate(&h0, &h1, time)
    }
}

/// End-of-sweep pose encoded by the parameter vector.
pub fn end_pose(params: &DVector<f64>) -> Transform {
    pose_at(params, 1.0)
}

fn stack_residuals(
    blocks: &[ResidualBlock],
    offsets: &[usize],
    total: usize,
    params: &DVector<f64>,
    ctx: &EvalContext,
) -> DVector<f64> {
    let mut r = DVector::zeros(total);
    // each block owns a disjoint slice; fill sequentially per chunk
    let chunks: Vec<Vec<f64>> = blocks
        .par_iter()
        .map(|b| {
            let mut out = vec![0.0; b.dim()];
            b.eval_into(params, ctx, &mut out);
            out
        })
        .collect();
    for (chunk, &offset) in chunks.iter().zip(offsets.iter()) {
        r.as_mut_slice()[offset..offset + chunk.len()].copy_from_slice(chunk);
    }
    r
}

fn jacobian(
    blocks: &[ResidualBlock],
    offsets: &[usize],
    total: usize,
    params: &DVector<f64>,
    ctx: &EvalContext,
) -> DMatrix<f64> {
    let n = params.len();
    let h = 1e-6;
    let columns: Vec<DVector<f64>> = (0..n)
        .into_par_iter()
        .map(|j| {
            let mut plus = params.clone();
            plus[j] += h;
            let mut minus = params.clone();
            minus[j] -= h;
            let rp = stack_residuals(blocks, offsets, total, &plus, ctx);
            let rm = stack_residuals(blocks, offsets, total, &minus, ctx);
            (rp - rm) / (2.0 * h)
        })
        .collect();
    let mut jac = DMatrix::zeros(total, n);
    for (j, col) in columns.into_iter().enumerate() {
        jac.set_column(j, &col);
    }
    jac
}

#[derive(Debug, Clone)]
pub struct LmConfig {
    pub max_iterations: usize,
    /// Initial damping as a fraction of the largest Hessian diagonal
    pub tau: f64,
    pub eps_dx: f64,
    pub eps_gradient: f64,
}

impl Default for LmConfig {
    fn default() -> Self {
        Self {
            max_iterations: 15,
            tau: 1e-4,
            eps_dx: 1e-10,
            eps_gradient: 1e-12,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LmReport {
    pub params: DVector<f64>,
    pub cost: f64,
    /// Gauss-Newton Hessian JᵀJ at the final iterate
    pub hessian: DMatrix<f64>,
    pub iterations: usize,
    pub converged: bool,
}

/// Damped least squares over the stacked residual blocks.
pub fn solve_lm(
    blocks: &[ResidualBlock],
    initial: DVector<f64>,
    ctx: &EvalContext,
    cfg: &LmConfig,
) -> LmReport {
    let mut offsets = Vec::with_capacity(blocks.len());
    let mut total = 0usize;
    for b in blocks {
        offsets.push(total);
        total += b.dim();
    }

    let n = initial.len();
    let mut params = initial;
    let mut r = stack_residuals(blocks, &offsets, total, &params, ctx);
    let mut cost = 0.5 * r.norm_squared();
    let mut jac = jacobian(blocks, &offsets, total, &params, ctx);
    let mut hessian = jac.transpose() * &jac;
    let mut gradient = jac.transpose() * &r;

    let mut mu = cfg.tau * hessian.diagonal().amax().max(1e-12);
    let mut nu = 2.0;
    let mut converged = false;
    let mut iterations = 0;

    for _ in 0..cfg.max_iterations {
        iterations += 1;

        let mut damped = hessian.clone();
        for i in 0..n {
            damped[(i, i)] += mu;
        }
        let Some(dx) = damped.lu().solve(&(-&gradient)) else {
            mu *= nu;
            nu *= 2.0;
            continue;
        };

        if dx.norm() < cfg.eps_dx * (params.norm() + cfg.eps_dx) {
            converged = true;
            break;
        }

        let candidate = &params + &dx;
        // a non-finite step keeps the previous iterate
        if !candidate.iter().all(|v| v.is_finite()) {
            mu *= nu;
            nu *= 2.0;
            continue;
        }

        let r_new = stack_residuals(blocks, &offsets, total, &candidate, ctx);
        let cost_new = 0.5 * r_new.norm_squared();
        let predicted = 0.5 * dx.dot(&(&dx * mu - &gradient));
        let rho = (cost - cost_new) / predicted.max(1e-16);

        if rho > 0.0 && cost_new.is_finite() {
            params = candidate;
            r = r_new;
            cost = cost_new;
            jac = jacobian(blocks, &offsets, total, &params, ctx);
            hessian = jac.transpose() * &jac;
            gradient = jac.transpose() * &r;
            mu *= (1.0f64 / 3.0).max(1.0 - (2.0 * rho - 1.0).powi(3));
            nu = 2.0;
            if gradient.amax() < cfg.eps_gradient {
                converged = true;
                break;
            }
        } else {
            mu *= nu;
            nu *= 2.0;
        }
    }

    LmReport {
        params,
        cost,
        hessian,
        iterations,
        converged,
    }
}

/// 6×6 Hessian of the end pose: the full matrix for a rigid solve,
/// the trailing block for an interpolated solve.
pub fn end_pose_hessian(report: &LmReport) -> Matrix6<f64> {
    let n = report.params.len();
    let mut out = Matrix6::zeros();
    let base = n - 6;
    for i in 0..6 {
        for j in 0..6 {
            out[(i, j)] = report.hessian[(base + i, base + j)];
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Matrix3;

    fn synthetic_blocks(truth: &Transform, n: usize) -> Vec<ResidualBlock> {
        (0..n)
            .map(|i| {
                let x = Vector3::new(
                    (i % 5) as f64 - 2.0,
                    ((i / 5) % 5) as f64 - 2.0,
                    (i % 3) as f64,
                );
                let p = truth.rotation_matrix() * x + truth.translation();
                ResidualBlock::Point(PointResidual {
                    a: Matrix3::identity(),
                    p,
                    x,
                    time: 1.0,
                    weight: 1.0,
                })
            })
            .collect()
    }

    #[test]
    fn test_recovers_rigid_transform() {
        let truth = Transform::from_params(&Vector6::new(0.3, -0.2, 0.1, 0.05, -0.03, 0.08));
        let blocks = synthetic_blocks(&truth, 40);
        let ctx = EvalContext { loss_scale: 1.0 };
        let report = solve_lm(&blocks, DVector::zeros(6), &ctx, &LmConfig::default());

        for i in 0..6 {
            assert_relative_eq!(report.params[i], truth.params()[i], epsilon = 1e-4);
        }
        assert!(report.cost < 1e-8);
    }

    #[test]
    fn test_recovers_interpolated_end_pose() {
        let truth = Transform::from_params(&Vector6::new(0.2, 0.1, 0.0, 0.0, 0.0, 0.04));
        // all residuals stamped at the end of the sweep constrain w1
        let blocks = synthetic_blocks(&truth, 40);
        let ctx = EvalContext { loss_scale: 1.0 };
        let report = solve_lm(&blocks, DVector::zeros(12), &ctx, &LmConfig::default());

        let end = end_pose(&report.params);
        assert_relative_eq!(
            (end.translation() - truth.translation()).norm(),
            0.0,
            epsilon = 1e-3
        );
    }

    #[test]
    fn test_distance_residual_pulls_translation_norm() {
        let blocks = vec![
            ResidualBlock::Distance(DistanceResidual {
                reference: Vector3::zeros(),
                distance: 2.0,
                weight: 1.0,
                saturation: 10.0,
            }),
            // pin the direction with one point residual
            ResidualBlock::Point(PointResidual {
                a: Matrix3::identity(),
                p: Vector3::new(2.0, 0.0, 0.0),
                x: Vector3::zeros(),
                time: 1.0,
                weight: 0.1,
            }),
        ];
        let ctx = EvalContext { loss_scale: 10.0 };
        let report = solve_lm(&blocks, DVector::zeros(6), &ctx, &LmConfig {
            max_iterations: 50,
            ..LmConfig::default()
        });
        let t = end_pose(&report.params).translation();
        assert_relative_eq!(t.norm(), 2.0, epsilon = 1e-2);
    }

    #[test]
    fn test_orientation_residual_aligns_axis() {
        let mut blocks = vec![ResidualBlock::Orientation(OrientationResidual {
            direction: Vector3::z(),
            reference: Vector3::new(0.0, (0.1f64).sin(), (0.1f64).cos()),
            weight: 1.0,
            saturation: 10.0,
        })];
        // pin translation
        blocks.push(ResidualBlock::Point(PointResidual {
            a: Matrix3::identity(),
            p: Vector3::zeros(),
            x: Vector3::zeros(),
            time: 1.0,
            weight: 1.0,
        }));
        let ctx = EvalContext { loss_scale: 10.0 };
        let report = solve_lm(&blocks, DVector::zeros(6), &ctx, &LmConfig {
            max_iterations: 40,
            ..LmConfig::default()
        });
        let rotated = end_pose(&report.params).rotation_matrix() * Vector3::z();
        assert_relative_eq!(rotated.y, (0.1f64).sin(), epsilon = 1e-3);
    }

    #[test]
    fn test_hessian_block_shape() {
        let truth = Transform::from_params(&Vector6::new(0.1, 0.0, 0.0, 0.0, 0.0, 0.0));
        let blocks = synthetic_blocks(&truth, 10);
        let ctx = EvalContext { loss_scale: 1.0 };
        let rigid = solve_lm(&blocks, DVector::zeros(6), &ctx, &LmConfig::default());
        let h6 = end_pose_hessian(&rigid);
        assert!(h6[(0, 0)] > 0.0);

        let interp = solve_lm(&blocks, DVector::zeros(12), &ctx, &LmConfig::default());
        let h12 = end_pose_hessian(&interp);
        assert!(h12[(0, 0)] >= 0.0);
    }
}
