//! World-point initializer (§4.6): axis-constraint propagation to fixpoint,
//! multi-view DLT triangulation with Gauss-Newton refinement, and
//! single-camera back-projection for features only seen once.

use nalgebra::{DMatrix, Matrix3x4, Vector3, Vector4};

use crate::context::SolveContext;
use crate::project::{FeatureId, Project, AXIS_X};

/// A single branch choice for one ambiguous axis-constrained line: which
/// endpoint gets the positive value along the constrained axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchChoice {
    pub line_index: usize,
    pub positive_endpoint_is_a: bool,
}

/// Propagate axis constraints along every `x`/`y`/`z`-direction line to a
/// fixpoint (§4.6 step 1). Lines whose sign is ambiguous (both endpoints
/// free on the constrained axis) are recorded for the candidate driver
/// (§4.12) rather than guessed.
pub fn propagate_axis_constraints(
    project: &mut Project,
    branch: &[BranchChoice],
) -> Vec<(usize, (FeatureId, FeatureId, usize))> {
    let branch_by_line: std::collections::HashMap<usize, bool> =
        branch.iter().map(|b| (b.line_index, b.positive_endpoint_is_a)).collect();

    let line_ids: Vec<_> = project.lines().map(|l| l.id).collect();

    loop {
        let mut changed = false;
        for &line_id in &line_ids {
            let line = project.line(line_id).clone();
            let Some(axis) = line.direction.single_axis() else {
                continue;
            };
            let other_axes: Vec<usize> = (0..3).filter(|&a| a != axis).collect();

            let a = project.feature(line.feature_a).clone();
            let b = project.feature(line.feature_b).clone();

            for &oa in &other_axes {
                let a_val = a.locked_xyz[oa].or(a.inferred_xyz[oa]);
                let b_val = b.locked_xyz[oa].or(b.inferred_xyz[oa]);
                match (a_val, b_val) {
                    (Some(v), None) => {
                        project.feature_mut(line.feature_b).inferred_xyz[oa] = Some(v);
                        changed = true;
                    }
                    (None, Some(v)) => {
                        project.feature_mut(line.feature_a).inferred_xyz[oa] = Some(v);
                        changed = true;
                    }
                    _ => {}
                }
            }
        }
        if !changed {
            break;
        }
    }

    // Single pass over the converged state: a line still ambiguous here stays
    // ambiguous regardless of how many fixpoint passes ran, so each line is
    // recorded exactly once.
    let mut ambiguous = Vec::new();
    for (idx, &line_id) in line_ids.iter().enumerate() {
        let line = project.line(line_id).clone();
        let Some(axis) = line.direction.single_axis() else {
            continue;
        };
        let a = project.feature(line.feature_a).clone();
        let b = project.feature(line.feature_b).clone();
        let a_known = a.locked_xyz[axis].or(a.inferred_xyz[axis]);
        let b_known = b.locked_xyz[axis].or(b.inferred_xyz[axis]);
        if a_known.is_none() && b_known.is_none() && !branch_by_line.contains_key(&idx) {
            ambiguous.push((idx, (line.feature_a, line.feature_b, axis)));
        }
    }
    ambiguous
}

fn camera_projection_matrix(vp: &crate::project::Viewpoint) -> Matrix3x4<f64> {
    let r = scene_solver_math::quat_to_matrix(vp.rotation);
    let t = -(r * vp.position);
    let k = nalgebra::Matrix3::new(
        vp.intrinsics.fx(), vp.intrinsics.skew, vp.intrinsics.cx,
        0.0, vp.intrinsics.fy(), vp.intrinsics.cy,
        0.0, 0.0, 1.0,
    );
    let rt = Matrix3x4::new(
        r[(0, 0)], r[(0, 1)], r[(0, 2)], t.x,
        r[(1, 0)], r[(1, 1)], r[(1, 2)], t.y,
        r[(2, 0)], r[(2, 1)], r[(2, 2)], t.z,
    );
    k * rt
}

/// Linear (DLT) triangulation of a feature seen by `observations` (each a
/// `(projection_matrix, pixel)` pair), followed by a short Gauss-Newton
/// reprojection-error refinement.
pub fn triangulate_multi_view(observations: &[(Matrix3x4<f64>, (f64, f64))]) -> Option<Vector3<f64>> {
    if observations.len() < 2 {
        return None;
    }
    let mut a = DMatrix::<f64>::zeros(observations.len() * 2, 4);
    for (i, (p, (u, v))) in observations.iter().enumerate() {
        let row0 = p.row(2) * *u - p.row(0);
        let row1 = p.row(2) * *v - p.row(1);
        a.set_row(i * 2, &row0);
        a.set_row(i * 2 + 1, &row1);
    }
    let svd = nalgebra::linalg::SVD::new(a, true, true);
    let v_t = svd.v_t?;
    let last = v_t.row(v_t.nrows() - 1);
    if last[3].abs() < 1e-12 {
        return None;
    }
    let mut point = Vector3::new(last[0], last[1], last[2]) / last[3];

    // Gauss-Newton refinement of reprojection error over the 3 coordinates.
    for _ in 0..5 {
        let mut jtj = nalgebra::Matrix3::zeros();
        let mut jtr = Vector3::zeros();
        for (p, (u, v)) in observations {
            let hp = p * Vector4::new(point.x, point.y, point.z, 1.0);
            if hp.z.abs() < 1e-9 {
                continue;
            }
            let pred_u = hp.x / hp.z;
            let pred_v = hp.y / hp.z;
            let ru = pred_u - u;
            let rv = pred_v - v;
            let inv_z = 1.0 / hp.z;
            let p3 = p.fixed_view::<3, 3>(0, 0);
            let du = (p3.row(0) * inv_z - p3.row(2) * (pred_u * inv_z)).transpose();
            let dv = (p3.row(1) * inv_z - p3.row(2) * (pred_v * inv_z)).transpose();
            jtj += du * du.transpose() + dv * dv.transpose();
            jtr += du * ru + dv * rv;
        }
        for k in 0..3 {
            jtj[(k, k)] += 1e-9;
        }
        if let Some(delta) = jtj.lu().solve(&(-jtr)) {
            point += delta;
        } else {
            break;
        }
    }
    Some(point)
}

/// Single-camera back-projection for a feature seen in exactly one
/// initialized camera, intersected against a connected line's axis-plane
/// constraint (§4.6 step 3). `known_point_on_line` and `axis` describe the
/// plane the ray must hit.
pub fn back_project_single_camera(
    ray_origin: Vector3<f64>,
    ray_dir: Vector3<f64>,
    known_point_on_line: Vector3<f64>,
    axis: usize,
) -> Option<Vector3<f64>> {
    let denom = ray_dir[axis];
    if denom.abs() < 1e-12 {
        return None;
    }
    let t = (known_point_on_line[axis] - ray_origin[axis]) / denom;
    if t <= 0.0 {
        return None;
    }
    Some(ray_origin + ray_dir * t)
}

/// Run the full world-point initialization pipeline over every feature that
/// is not already fully constrained: multi-view triangulation first, then
/// single-camera back-projection for the remainder. The solve context is
/// threaded through for future quality-callback hooks (§4.6) even though
/// this pass itself is deterministic.
pub fn initialize_world_points(project: &mut Project, _ctx: &mut SolveContext) {
    let feature_ids = project.feature_ids();
    for fid in feature_ids {
        if project.feature(fid).is_fully_constrained() {
            continue;
        }
        let observing_viewpoints: Vec<_> = project
            .feature(fid)
            .observations
            .iter()
            .map(|&oid| project.observation(oid).clone())
            .filter(|obs| project.viewpoint(obs.viewpoint).is_initialized)
            .collect();

        if observing_viewpoints.len() >= 2 {
            let obs_data: Vec<(Matrix3x4<f64>, (f64, f64))> = observing_viewpoints
                .iter()
                .map(|obs| (camera_projection_matrix(project.viewpoint(obs.viewpoint)), obs.pixel))
                .collect();
            if let Some(point) = triangulate_multi_view(&obs_data) {
                project.feature_mut(fid).optimized_xyz = point;
            }
        } else if observing_viewpoints.len() == 1 {
            let obs = &observing_viewpoints[0];
            let vp = project.viewpoint(obs.viewpoint);
            let cam = scene_solver_geom::Camera {
                pose: scene_solver_geom::Pose {
                    rotation: vp.rotation,
                    position: vp.position,
                },
                intrinsics: vp.intrinsics,
            };
            let (origin, dir) = cam.pixel_to_world_ray(obs.pixel.0, obs.pixel.1);

            let connected_constraint = project
                .feature(fid)
                .lines
                .iter()
                .filter_map(|&lid| {
                    let line = project.line(lid);
                    let axis = line.direction.single_axis()?;
                    let other = if line.feature_a == fid { line.feature_b } else { line.feature_a };
                    let other_feat = project.feature(other);
                    if other_feat.is_fully_constrained() {
                        Some((other_feat.effective_xyz(), axis))
                    } else {
                        None
                    }
                })
                .next();

            if let Some((known_point, axis)) = connected_constraint {
                if let Some(point) = back_project_single_camera(origin, dir, known_point, axis) {
                    project.feature_mut(fid).optimized_xyz = point;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::LineDirection as LD;

    #[test]
    fn axis_propagation_copies_plane_coordinates() {
        let mut project = Project::new();
        let a = project.add_feature("a");
        let b = project.add_feature("b");
        project.feature_mut(a).locked_xyz = [Some(1.0), Some(2.0), None];
        project.add_line(a, b, LD::Z);
        propagate_axis_constraints(&mut project, &[]);
        assert_eq!(project.feature(b).inferred_xyz[AXIS_X], Some(1.0));
        assert_eq!(project.feature(b).inferred_xyz[crate::project::AXIS_Y], Some(2.0));
    }

    #[test]
    fn ambiguous_line_is_reported_when_both_ends_free_on_axis() {
        let mut project = Project::new();
        let a = project.add_feature("a");
        let b = project.add_feature("b");
        project.feature_mut(a).locked_xyz = [None, Some(0.0), Some(0.0)];
        project.feature_mut(b).locked_xyz = [None, Some(0.0), Some(0.0)];
        project.add_line(a, b, LD::X);
        let ambiguous = propagate_axis_constraints(&mut project, &[]);
        assert_eq!(ambiguous.len(), 1);
        assert_eq!(ambiguous[0].1 .2, AXIS_X);
    }

    #[test]
    fn triangulation_recovers_known_point() {
        let true_point = Vector3::new(0.3, -0.2, 5.0);
        let make_p = |cx: f64| {
            let k = nalgebra::Matrix3::new(800.0, 0.0, 320.0, 0.0, 800.0, 240.0, 0.0, 0.0, 1.0);
            let r = nalgebra::Matrix3::identity();
            let c = Vector3::new(cx, 0.0, 0.0);
            let t = -(r * c);
            let rt = Matrix3x4::new(1.0, 0.0, 0.0, t.x, 0.0, 1.0, 0.0, t.y, 0.0, 0.0, 1.0, t.z);
            k * rt
        };
        let p1 = make_p(0.0);
        let p2 = make_p(1.0);
        let proj = |p: &Matrix3x4<f64>, pt: Vector3<f64>| {
            let hp = p * Vector4::new(pt.x, pt.y, pt.z, 1.0);
            (hp.x / hp.z, hp.y / hp.z)
        };
        let obs = vec![(p1, proj(&p1, true_point)), (p2, proj(&p2, true_point))];
        let recovered = triangulate_multi_view(&obs).unwrap();
        assert!((recovered - true_point).norm() < 1e-2);
    }
}
