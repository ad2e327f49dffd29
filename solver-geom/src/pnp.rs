//! Perspective-n-Point pose recovery via RANSAC + Horn's closed-form
//! absolute-orientation solve + Gauss-Newton refinement, per §4.3.

use nalgebra::{Matrix3, UnitQuaternion, Vector3};
use scene_solver_math::{normalize3, svd3, Prng};

use crate::camera::{Intrinsics, Pose};

/// One 3D-to-2D correspondence used as PnP input.
#[derive(Clone, Copy, Debug)]
pub struct Correspondence {
    pub world: Vector3<f64>,
    pub pixel: (f64, f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PnpFailureReason {
    TooFewCorrespondences,
    NoConsensus,
    DegenerateGeometry,
}

#[derive(Debug, Clone)]
pub struct PnpResult {
    pub success: bool,
    /// Whether the solve should be trusted for downstream use (enough
    /// inliers and a low enough residual), independent of `success`.
    pub reliable: bool,
    pub pose: Option<Pose>,
    pub reason: Option<PnpFailureReason>,
    pub inlier_count: usize,
    /// Median reprojection residual (px) over the final inlier set.
    pub median_inlier_residual_px: Option<f64>,
}

const MIN_CORRESPONDENCES: usize = 3;
const RANSAC_ITERATIONS: usize = 256;
const INLIER_THRESHOLD_PX: f64 = 8.0;
/// Minimum inlier count for a PnP solve to be trusted, per §4.3.
const MIN_RELIABLE_INLIERS: usize = 5;
const GN_ITERATIONS: usize = 10;

fn median(mut values: Vec<f64>) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

/// Horn's closed-form absolute orientation: given paired 3D points in two
/// frames (here: world points and their back-projected camera-space rays
/// scaled to an assumed common depth), find the rotation+translation that
/// best aligns them in the least-squares sense.
///
/// This module uses the minimal 3-point variant directly on back-projected
/// rays: each world point's corresponding camera-space direction defines a
/// ray from the (unknown) camera center, and we solve for the rigid
/// transform via the same SVD machinery as general absolute orientation,
/// operating on the centroids of the two point sets.
fn horn_absolute_orientation(
    world_pts: &[Vector3<f64>],
    cam_pts: &[Vector3<f64>],
    rng: &mut Prng,
) -> Option<Pose> {
    let n = world_pts.len();
    if n < 3 || cam_pts.len() != n {
        return None;
    }
    let centroid_w: Vector3<f64> = world_pts.iter().sum::<Vector3<f64>>() / n as f64;
    let centroid_c: Vector3<f64> = cam_pts.iter().sum::<Vector3<f64>>() / n as f64;

    let mut h = Matrix3::zeros();
    for i in 0..n {
        let dw = world_pts[i] - centroid_w;
        let dc = cam_pts[i] - centroid_c;
        h += dw * dc.transpose();
    }

    let svd = svd3(&h, rng);
    let mut rotation = svd.v_t.transpose() * svd.u.transpose();
    if rotation.determinant() < 0.0 {
        // Reflection: flip the sign of the smallest singular vector's column.
        let mut v = svd.v_t.transpose();
        v.set_column(2, &(-v.column(2)));
        rotation = v * svd.u.transpose();
    }
    let rotation = UnitQuaternion::from_matrix(&rotation);
    // centroid_c = R * (centroid_w - C)  =>  C = centroid_w - R^-1 * centroid_c
    let position = centroid_w - rotation.inverse() * centroid_c;
    Some(Pose { rotation, position })
}

/// Solve a minimal 3-point PnP sample: back-project each pixel to a camera
/// ray, assume unit depth along that ray as the "camera-space point" used
/// for absolute orientation (valid for the minimal-sample closed form since
/// the subsequent RANSAC consensus + Gauss-Newton refinement correct for
/// the true scale and remaining error).
fn solve_minimal_sample(
    sample: &[Correspondence],
    intr: &Intrinsics,
    rng: &mut Prng,
) -> Option<Pose> {
    let world: Vec<Vector3<f64>> = sample.iter().map(|c| c.world).collect();
    let cam: Vec<Vector3<f64>> = sample
        .iter()
        .map(|c| intr.pixel_to_camera_ray(c.pixel.0, c.pixel.1))
        .collect();
    horn_absolute_orientation(&world, &cam, rng)
}

fn reprojection_residual(pose: &Pose, intr: &Intrinsics, corr: &Correspondence) -> Option<f64> {
    let p_cam = pose.world_to_camera(corr.world);
    let (u, v) = intr.project_camera_space(p_cam)?;
    Some(((u - corr.pixel.0).powi(2) + (v - corr.pixel.1).powi(2)).sqrt())
}

/// Refine `pose` against all correspondences with Gauss-Newton over a
/// 6-parameter (axis-angle + translation) local update, for a fixed
/// iteration budget (§9 Open Question: a fixed 10-iteration budget is used
/// rather than a convergence-tolerance loop, matching the rest of the
/// solver's bounded-iteration style).
fn refine_gauss_newton(pose: Pose, intr: &Intrinsics, correspondences: &[Correspondence]) -> Pose {
    let mut pose = pose;
    for _ in 0..GN_ITERATIONS {
        let mut jtj = nalgebra::Matrix6::zeros();
        let mut jtr = nalgebra::Vector6::zeros();
        for corr in correspondences {
            let p_cam = pose.world_to_camera(corr.world);
            if p_cam.z <= 1e-9 {
                continue;
            }
            let Some((u, v)) = intr.project_camera_space(p_cam) else {
                continue;
            };
            let ru = u - corr.pixel.0;
            let rv = v - corr.pixel.1;

            // d(projection)/d(p_cam), ignoring distortion derivatives (small
            // effect for a refinement step; distortion is re-evaluated each
            // outer iteration via the full projection above).
            let inv_z = 1.0 / p_cam.z;
            let fx = intr.fx();
            let fy = intr.fy();
            let d_u = Vector3::new(fx * inv_z, 0.0, -fx * p_cam.x * inv_z * inv_z);
            let d_v = Vector3::new(0.0, fy * inv_z, -fy * p_cam.y * inv_z * inv_z);

            // d(p_cam)/d(axis-angle) = -[p_cam]_x ; d(p_cam)/d(translation-of-center) = -R
            let skew = Matrix3::new(
                0.0, -p_cam.z, p_cam.y, p_cam.z, 0.0, -p_cam.x, -p_cam.y, p_cam.x, 0.0,
            );
            let r = scene_solver_math::quat_to_matrix(pose.rotation);

            let mut j_row_u = nalgebra::Vector6::zeros();
            let mut j_row_v = nalgebra::Vector6::zeros();
            let d_u_d_theta = -skew.transpose() * d_u;
            let d_u_d_c = -r * d_u;
            let d_v_d_theta = -skew.transpose() * d_v;
            let d_v_d_c = -r * d_v;
            for k in 0..3 {
                j_row_u[k] = d_u_d_theta[k];
                j_row_u[k + 3] = d_u_d_c[k];
                j_row_v[k] = d_v_d_theta[k];
                j_row_v[k + 3] = d_v_d_c[k];
            }
            jtj += j_row_u * j_row_u.transpose() + j_row_v * j_row_v.transpose();
            jtr += j_row_u * ru + j_row_v * rv;
        }
        for k in 0..6 {
            jtj[(k, k)] += 1e-9;
        }
        let Some(delta) = jtj.lu().solve(&(-jtr)) else {
            break;
        };
        let dtheta = Vector3::new(delta[0], delta[1], delta[2]);
        let dc = Vector3::new(delta[3], delta[4], delta[5]);
        let angle = dtheta.norm();
        if angle > 1e-14 {
            if let Some(dr) = scene_solver_math::rodrigues(dtheta, angle) {
                let dr_quat = scene_solver_math::matrix_to_quat(&dr);
                pose.rotation = dr_quat * pose.rotation;
            }
        }
        pose.position += dc;
    }
    pose
}

/// Run RANSAC PnP over `correspondences`, returning a [`PnpResult`].
/// `initialized_camera_names` restriction (§4.3: PnP only runs against
/// points already triangulated via already-initialized cameras) is enforced
/// by the caller filtering `correspondences` before calling this function.
pub fn solve_pnp_ransac(
    correspondences: &[Correspondence],
    intr: &Intrinsics,
    rng: &mut Prng,
) -> PnpResult {
    if correspondences.len() < MIN_CORRESPONDENCES {
        return PnpResult {
            success: false,
            reliable: false,
            pose: None,
            reason: Some(PnpFailureReason::TooFewCorrespondences),
            inlier_count: 0,
            median_inlier_residual_px: None,
        };
    }

    let mut best_pose: Option<Pose> = None;
    let mut best_inliers = 0usize;

    for _ in 0..RANSAC_ITERATIONS {
        let idx = rng.sample_without_replacement(correspondences.len(), MIN_CORRESPONDENCES);
        let sample: Vec<Correspondence> = idx.iter().map(|&i| correspondences[i]).collect();
        let Some(pose) = solve_minimal_sample(&sample, intr, rng) else {
            continue;
        };
        let inliers = correspondences
            .iter()
            .filter(|c| reprojection_residual(&pose, intr, c).is_some_and(|e| e < INLIER_THRESHOLD_PX))
            .count();
        if inliers > best_inliers {
            best_inliers = inliers;
            best_pose = Some(pose);
        }
    }

    let Some(pose) = best_pose else {
        return PnpResult {
            success: false,
            reliable: false,
            pose: None,
            reason: Some(PnpFailureReason::NoConsensus),
            inlier_count: 0,
            median_inlier_residual_px: None,
        };
    };

    let inlier_set: Vec<Correspondence> = correspondences
        .iter()
        .copied()
        .filter(|c| reprojection_residual(&pose, intr, c).is_some_and(|e| e < INLIER_THRESHOLD_PX))
        .collect();
    let refined = refine_gauss_newton(pose, intr, &inlier_set);

    let final_inlier_residuals: Vec<f64> = correspondences
        .iter()
        .filter_map(|c| reprojection_residual(&refined, intr, c))
        .filter(|&e| e < INLIER_THRESHOLD_PX)
        .collect();
    let final_inliers = final_inlier_residuals.len();
    let median_residual = median(final_inlier_residuals);
    let reliable = final_inliers >= MIN_RELIABLE_INLIERS
        && median_residual.is_some_and(|m| m <= INLIER_THRESHOLD_PX);

    PnpResult {
        success: true,
        reliable,
        pose: Some(refined),
        reason: if reliable {
            None
        } else {
            Some(PnpFailureReason::DegenerateGeometry)
        },
        inlier_count: final_inliers,
        median_inlier_residual_px: median_residual,
    }
}
