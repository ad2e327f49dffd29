//! Two-view bootstrap via the eight-point algorithm and essential-matrix
//! decomposition, per §4.4.

use nalgebra::{DMatrix, Matrix3, Vector3};
use scene_solver_math::{svd3, Prng};

use crate::camera::{Intrinsics, Pose};

/// A single matched pair of normalized (undistorted, intrinsics-divided)
/// image coordinates between two views.
#[derive(Clone, Copy, Debug)]
pub struct NormalizedMatch {
    pub a: (f64, f64),
    pub b: (f64, f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EssentialFailureReason {
    TooFewMatches,
    DegenerateMatrix,
    NoValidCheiralityCandidate,
}

#[derive(Debug, Clone)]
pub struct EssentialResult {
    pub success: bool,
    /// Pose of camera B relative to camera A (A is assumed to be at the
    /// coordinate-frame origin with identity rotation).
    pub relative_pose: Option<Pose>,
    pub reason: Option<EssentialFailureReason>,
}

const MIN_MATCHES: usize = 8;

/// Build the essential matrix from >=8 normalized correspondences via the
/// linear eight-point algorithm: each match gives one row of the Kronecker
/// system `e^T vec(a (x) b) = 0`, solved via the null space of the stacked
/// matrix, then projected onto the closest valid essential matrix (equal
/// nonzero singular values, third singular value zero).
pub fn estimate_essential_matrix(matches: &[NormalizedMatch], rng: &mut Prng) -> Option<Matrix3<f64>> {
    if matches.len() < MIN_MATCHES {
        return None;
    }
    let rows: Vec<f64> = matches
        .iter()
        .flat_map(|m| {
            let (xa, ya) = m.a;
            let (xb, yb) = m.b;
            [xb * xa, xb * ya, xb, yb * xa, yb * ya, yb, xa, ya, 1.0]
        })
        .collect();
    let a = DMatrix::from_row_slice(matches.len(), 9, &rows);

    // The null space of the stacked 9-column system is 9-dimensional
    // regardless of match count, so we use nalgebra's general SVD here
    // rather than our 3x3 kernel.
    let svd = nalgebra::linalg::SVD::new(a, true, true);
    let v_t = svd.v_t?;
    let e_vec = v_t.row(v_t.nrows() - 1).transpose();
    let e_raw = Matrix3::new(
        e_vec[0], e_vec[1], e_vec[2], e_vec[3], e_vec[4], e_vec[5], e_vec[6], e_vec[7], e_vec[8],
    );

    // Enforce the essential-matrix singular-value constraint (1,1,0) using
    // our own 3x3 SVD kernel.
    let svd3_e = svd3(&e_raw, rng);
    let avg = (svd3_e.singular_values.x + svd3_e.singular_values.y) / 2.0;
    if avg < 1e-12 {
        return None;
    }
    let corrected_singular = Matrix3::from_diagonal(&Vector3::new(avg, avg, 0.0));
    Some(svd3_e.u * corrected_singular * svd3_e.v_t)
}

fn cheirality_candidates(e: &Matrix3<f64>, rng: &mut Prng) -> Vec<Pose> {
    let svd = svd3(e, rng);
    let mut u = svd.u;
    let mut v_t = svd.v_t;
    if u.determinant() < 0.0 {
        u = -u;
    }
    if v_t.determinant() < 0.0 {
        v_t = -v_t;
    }
    let w = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);

    let r1 = u * w * v_t;
    let r2 = u * w.transpose() * v_t;
    let t = u.column(2).into_owned();

    [r1, r2]
        .into_iter()
        .flat_map(|r| {
            [t, -t].into_iter().map(move |t_cand| Pose {
                rotation: scene_solver_math::matrix_to_quat(&r),
                position: t_cand,
            })
        })
        .collect()
}

fn triangulate_midpoint(pose_b: &Pose, a_dir: Vector3<f64>, b_dir: Vector3<f64>) -> Option<Vector3<f64>> {
    // Camera A at origin with identity rotation; camera B at pose_b.
    let origin_a = Vector3::zeros();
    let origin_b = pose_b.position;
    let dir_a = a_dir;
    let dir_b = pose_b.rotation.inverse() * b_dir;

    // Closest points between the two rays, via the standard 2x2 normal-equations solve.
    let w0 = origin_a - origin_b;
    let aa = dir_a.dot(&dir_a);
    let bb = dir_b.dot(&dir_b);
    let ab = dir_a.dot(&dir_b);
    let d_a = dir_a.dot(&w0);
    let d_b = dir_b.dot(&w0);
    let denom = aa * bb - ab * ab;
    if denom.abs() < 1e-12 {
        return None;
    }
    let s = (ab * d_b - bb * d_a) / denom;
    let t = (aa * d_b - ab * d_a) / denom;
    if s <= 0.0 || t <= 0.0 {
        return None;
    }
    let p_on_a = origin_a + dir_a * s;
    let p_on_b = origin_b + (pose_b.rotation.inverse() * b_dir) * t;
    Some((p_on_a + p_on_b) / 2.0)
}

/// Select the cheirality-valid (R, t) candidate by triangulating a sample of
/// matches and counting how many land in front of both cameras.
pub fn solve_two_view(
    matches: &[NormalizedMatch],
    _intr_a: &Intrinsics,
    _intr_b: &Intrinsics,
    rng: &mut Prng,
) -> EssentialResult {
    let Some(e) = estimate_essential_matrix(matches, rng) else {
        return EssentialResult {
            success: false,
            relative_pose: None,
            reason: Some(EssentialFailureReason::TooFewMatches),
        };
    };

    let candidates = cheirality_candidates(&e, rng);
    let mut best: Option<(Pose, usize)> = None;
    for cand in candidates {
        let mut count = 0;
        for m in matches {
            let dir_a = Vector3::new(m.a.0, m.a.1, 1.0);
            let dir_b = Vector3::new(m.b.0, m.b.1, 1.0);
            if let Some(p) = triangulate_midpoint(&cand, dir_a, dir_b) {
                let in_front_a = p.z > 0.0;
                let p_cam_b = cand.rotation * (p - cand.position);
                let in_front_b = p_cam_b.z > 0.0;
                if in_front_a && in_front_b {
                    count += 1;
                }
            }
        }
        if best.as_ref().is_none_or(|(_, best_count)| count > *best_count) {
            best = Some((cand, count));
        }
    }

    match best {
        Some((pose, count)) if count * 2 >= matches.len() => EssentialResult {
            success: true,
            relative_pose: Some(pose),
            reason: None,
        },
        _ => EssentialResult {
            success: false,
            relative_pose: None,
            reason: Some(EssentialFailureReason::NoValidCheiralityCandidate),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::UnitQuaternion;

    fn synthetic_two_view() -> (Pose, Vec<NormalizedMatch>) {
        let pose_b = Pose {
            rotation: UnitQuaternion::from_euler_angles(0.0, 0.3, 0.0),
            position: Vector3::new(1.0, 0.0, 0.2),
        };
        let world_pts = [
            Vector3::new(0.2, 0.1, 5.0),
            Vector3::new(-0.3, 0.2, 4.0),
            Vector3::new(0.1, -0.2, 6.0),
            Vector3::new(0.4, 0.3, 5.5),
            Vector3::new(-0.1, -0.1, 4.5),
            Vector3::new(0.3, -0.3, 5.2),
            Vector3::new(-0.2, 0.4, 6.5),
            Vector3::new(0.0, 0.0, 5.0),
            Vector3::new(0.5, 0.1, 4.8),
            Vector3::new(-0.4, -0.2, 5.3),
        ];
        let matches = world_pts
            .iter()
            .map(|&p| {
                let a = (p.x / p.z, p.y / p.z);
                let p_b = pose_b.rotation * (p - pose_b.position);
                let b = (p_b.x / p_b.z, p_b.y / p_b.z);
                NormalizedMatch { a, b }
            })
            .collect();
        (pose_b, matches)
    }

    #[test]
    fn recovers_relative_rotation_up_to_scale() {
        let (true_pose, matches) = synthetic_two_view();
        let intr = Intrinsics::new_default(1.0, 0.0, 0.0);
        let mut rng = Prng::new(3);
        let result = solve_two_view(&matches, &intr, &intr, &mut rng);
        assert!(result.success);
        let pose = result.relative_pose.unwrap();
        let angle_err = pose.rotation.angle_to(&true_pose.rotation);
        assert!(angle_err < 0.05, "angle_err={angle_err}");
    }

    #[test]
    fn too_few_matches_fails_cleanly() {
        let intr = Intrinsics::new_default(1.0, 0.0, 0.0);
        let mut rng = Prng::new(1);
        let matches = vec![NormalizedMatch { a: (0.0, 0.0), b: (0.0, 0.0) }; 3];
        let result = solve_two_view(&matches, &intr, &intr, &mut rng);
        assert!(!result.success);
        assert_eq!(result.reason, Some(EssentialFailureReason::TooFewMatches));
    }
}
