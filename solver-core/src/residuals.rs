//! Residual + analytic-Jacobian construction for every residual kind in
//! §4.8: reprojection, distance/equal-distance, parallel/perpendicular,
//! collinear/coplanar, fixed-coordinate, mirrored-points (the symmetry
//! variant from §3), quaternion unit-norm, axis-line direction, and
//! line-target-length.
//!
//! Each residual contributes one row: a scalar value and a sparse list of
//! `(param_index, partial_derivative)` pairs, assembled into a dense
//! `DVector`/`DMatrix` pair by [`crate::lm::build_residuals`].

use nalgebra::{Matrix3, Vector3};

use crate::params::ParamLayout;
use crate::project::{Constraint, FeatureId, LineId, Project, ViewpointId};

/// One residual row before assembly into the dense system.
pub struct ResidualRow {
    pub value: f64,
    pub grad: Vec<(usize, f64)>,
}

impl ResidualRow {
    fn new(value: f64) -> Self {
        ResidualRow { value, grad: Vec::new() }
    }

    fn push(&mut self, idx: usize, partial: f64) {
        if partial != 0.0 {
            self.grad.push((idx, partial));
        }
    }
}

/// `dR(q)/dq_i`, `i in [w, x, y, z]`, for the standard unit-quaternion
/// rotation-matrix formula (valid to first order even when `q` has drifted
/// slightly from unit norm, which is the regime the LM inner loop runs in
/// between unit-norm-residual corrections).
fn rotation_matrix_partials(q: &nalgebra::Quaternion<f64>) -> [Matrix3<f64>; 4] {
    let (w, x, y, z) = (q.w, q.i, q.j, q.k);
    let dw = Matrix3::new(0.0, -2.0 * z, 2.0 * y, 2.0 * z, 0.0, -2.0 * x, -2.0 * y, 2.0 * x, 0.0);
    let dx = Matrix3::new(0.0, 2.0 * y, 2.0 * z, 2.0 * y, -4.0 * x, -2.0 * w, 2.0 * z, 2.0 * w, -4.0 * x);
    let dy = Matrix3::new(-4.0 * y, 2.0 * x, 2.0 * w, 2.0 * x, 0.0, 2.0 * z, -2.0 * w, 2.0 * z, -4.0 * y);
    let dz = Matrix3::new(-4.0 * z, -2.0 * w, 2.0 * x, 2.0 * w, -4.0 * z, 2.0 * y, 2.0 * x, 2.0 * y, 0.0);
    [dw, dx, dy, dz]
}

fn rotation_matrix_unnormalized(q: &nalgebra::Quaternion<f64>) -> Matrix3<f64> {
    let (w, x, y, z) = (q.w, q.i, q.j, q.k);
    Matrix3::new(
        1.0 - 2.0 * (y * y + z * z),
        2.0 * (x * y - w * z),
        2.0 * (x * z + w * y),
        2.0 * (x * y + w * z),
        1.0 - 2.0 * (x * x + z * z),
        2.0 * (y * z - w * x),
        2.0 * (x * z - w * y),
        2.0 * (y * z + w * x),
        1.0 - 2.0 * (x * x + y * y),
    )
}

/// Reprojection residuals for every non-outlier observation of an enabled
/// camera (two rows per observation: u and v), per §4.8.
pub fn reprojection_residuals(project: &Project, layout: &ParamLayout, rows: &mut Vec<ResidualRow>) {
    for obs in project.observations() {
        if obs.is_outlier {
            continue;
        }
        let vp = project.viewpoint(obs.viewpoint);
        if !vp.enabled_in_solve {
            continue;
        }
        let feat = project.feature(obs.feature);
        let q = vp.rotation.quaternion();
        let r = rotation_matrix_unnormalized(q);
        let world = feat.effective_xyz();
        let p_cam = r * (world - vp.position);
        if p_cam.z <= 1e-9 {
            // Behind the camera: contributes no well-defined gradient: skip
            // rather than poison the system with a discontinuous residual.
            continue;
        }
        let Some((pu, pv)) = vp.intrinsics.project_camera_space(p_cam) else {
            continue;
        };
        let xn = p_cam.x / p_cam.z;
        let yn = p_cam.y / p_cam.z;
        let r2 = xn * xn + yn * yn;
        let fx = vp.intrinsics.fx();
        let fy = vp.intrinsics.fy();
        let skew = vp.intrinsics.skew;

        let mut row_u = ResidualRow::new(pu - obs.pixel.0);
        let mut row_v = ResidualRow::new(pv - obs.pixel.1);

        // d(xn,yn)/d(p_cam)
        let inv_z = 1.0 / p_cam.z;
        let dxn = Vector3::new(inv_z, 0.0, -p_cam.x * inv_z * inv_z);
        let dyn_ = Vector3::new(0.0, inv_z, -p_cam.y * inv_z * inv_z);
        // chain through distortion: du/dxn = fx*(radial + ...), approximate
        // via the same first-order distortion-ignoring chain precedent
        // used by the PnP refine step (pnp.rs), but keep the *undistorted*
        // pinhole term exact and fold the (small, near-1) radial factor in
        // directly since it costs nothing extra here.
        let radial = 1.0 + vp.intrinsics.k1 * r2 + vp.intrinsics.k2 * r2 * r2 + vp.intrinsics.k3 * r2 * r2 * r2;
        let du_dpcam = dxn * (fx * radial) + dyn_ * skew;
        let dv_dpcam = dyn_ * (fy * radial);

        if let Some(fidx) = feature_axis_grad(layout, obs.feature) {
            for (axis, idx) in fidx {
                let d_pcam_d_axis = r.column(axis).into_owned();
                row_u.push(idx, du_dpcam.dot(&d_pcam_d_axis));
                row_v.push(idx, dv_dpcam.dot(&d_pcam_d_axis));
            }
        }

        if let Some(&rot_idx) = layout.camera_rotation.get(&obs.viewpoint) {
            let partials = rotation_matrix_partials(q);
            for (k, dr) in partials.iter().enumerate() {
                let d_pcam = dr * (world - vp.position);
                row_u.push(rot_idx + k, du_dpcam.dot(&d_pcam));
                row_v.push(rot_idx + k, dv_dpcam.dot(&d_pcam));
            }
        }
        if let Some(&pos_idx) = layout.camera_position.get(&obs.viewpoint) {
            let d_pcam_d_c = -r; // d(p_cam)/d(C) columns
            for k in 0..3 {
                let d_pcam = d_pcam_d_c.column(k).into_owned();
                row_u.push(pos_idx + k, du_dpcam.dot(&d_pcam));
                row_v.push(pos_idx + k, dv_dpcam.dot(&d_pcam));
            }
        }
        if let Some(&intr_idx) = layout.camera_intrinsics.get(&obs.viewpoint) {
            let (xd, yd) = vp.intrinsics.distort_normalized(xn, yn);
            // d(u)/d(focal_length, cx, cy, aspect, skew)
            row_u.push(intr_idx, xd);
            row_u.push(intr_idx + 1, 1.0);
            row_u.push(intr_idx + 4, yd);
            row_v.push(intr_idx, vp.intrinsics.aspect_ratio * yd);
            row_v.push(intr_idx + 2, 1.0);
            row_v.push(intr_idx + 3, vp.intrinsics.focal_length * yd);
            // d(xd)/d(k1,k2,k3,p1,p2), d(yd)/d(..)
            let d_xd = [xn * r2, xn * r2 * r2, xn * r2 * r2 * r2, 2.0 * xn * yn, r2 + 2.0 * xn * xn];
            let d_yd = [yn * r2, yn * r2 * r2, yn * r2 * r2 * r2, r2 + 2.0 * yn * yn, 2.0 * xn * yn];
            for k in 0..5 {
                row_u.push(intr_idx + 5 + k, fx * d_xd[k] + skew * d_yd[k]);
                row_v.push(intr_idx + 5 + k, fy * d_yd[k]);
            }
        }

        rows.push(row_u);
        rows.push(row_v);
    }
}

fn feature_axis_grad(layout: &ParamLayout, fid: FeatureId) -> Option<Vec<(usize, usize)>> {
    let mut out = Vec::new();
    for axis in 0..3 {
        if let Some(&idx) = layout.feature_axis.get(&(fid, axis)) {
            out.push((axis, idx));
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

fn push_point_grad(row: &mut ResidualRow, layout: &ParamLayout, fid: FeatureId, d_residual_d_point: Vector3<f64>) {
    for axis in 0..3 {
        if let Some(&idx) = layout.feature_axis.get(&(fid, axis)) {
            row.push(idx, d_residual_d_point[axis]);
        }
    }
}

/// Quaternion unit-norm residual, `sqrt(weight) * (w^2+x^2+y^2+z^2 - 1)`,
/// one per free camera (§4.8).
pub fn quaternion_unit_norm_residuals(project: &Project, layout: &ParamLayout, weight: f64, rows: &mut Vec<ResidualRow>) {
    let sw = weight.sqrt();
    for (&vid, &idx) in &layout.camera_rotation {
        let q = project.viewpoint(vid).rotation.quaternion();
        let norm2 = q.w * q.w + q.i * q.i + q.j * q.j + q.k * q.k;
        let mut row = ResidualRow::new(sw * (norm2 - 1.0));
        row.push(idx, sw * 2.0 * q.w);
        row.push(idx + 1, sw * 2.0 * q.i);
        row.push(idx + 2, sw * 2.0 * q.j);
        row.push(idx + 3, sw * 2.0 * q.k);
        rows.push(row);
    }
}

fn point_of(project: &Project, layout: &ParamLayout, fid: FeatureId) -> Vector3<f64> {
    let _ = layout;
    project.feature(fid).effective_xyz()
}

fn distance_row(project: &Project, layout: &ParamLayout, a: FeatureId, b: FeatureId, target: f64, weight: f64) -> ResidualRow {
    let pa = point_of(project, layout, a);
    let pb = point_of(project, layout, b);
    let diff = pa - pb;
    let len = diff.norm().max(1e-12);
    let sw = weight.sqrt();
    let mut row = ResidualRow::new(sw * (len - target));
    let d_dir = diff / len;
    push_point_grad(&mut row, layout, a, sw * d_dir);
    push_point_grad(&mut row, layout, b, -sw * d_dir);
    row
}

fn fixed_coord_row(project: &Project, layout: &ParamLayout, point: FeatureId, axis: usize, value: f64, weight: f64) -> ResidualRow {
    let p = point_of(project, layout, point);
    let sw = weight.sqrt();
    let mut row = ResidualRow::new(sw * (p[axis] - value));
    if let Some(&idx) = layout.feature_axis.get(&(point, axis)) {
        row.push(idx, sw);
    }
    row
}

/// Symmetry residual (§3 `points_mirrored`): one row per non-mirror axis
/// equating `a`/`b`'s coordinate, plus one row pinning their mirror-axis
/// displacement from `plane_point` to be equal and opposite.
fn mirrored_rows(
    project: &Project,
    layout: &ParamLayout,
    a: FeatureId,
    b: FeatureId,
    axis: usize,
    plane_point: FeatureId,
    weight: f64,
    rows: &mut Vec<ResidualRow>,
) {
    let pa = point_of(project, layout, a);
    let pb = point_of(project, layout, b);
    let plane = point_of(project, layout, plane_point);
    let sw = weight.sqrt();

    for other in (0..3).filter(|&ax| ax != axis) {
        let mut row = ResidualRow::new(sw * (pb[other] - pa[other]));
        push_point_grad(&mut row, layout, b, sw * Vector3::ith(other, 1.0));
        push_point_grad(&mut row, layout, a, -sw * Vector3::ith(other, 1.0));
        rows.push(row);
    }

    let mut row = ResidualRow::new(sw * ((pa[axis] - plane[axis]) + (pb[axis] - plane[axis])));
    push_point_grad(&mut row, layout, a, sw * Vector3::ith(axis, 1.0));
    push_point_grad(&mut row, layout, b, sw * Vector3::ith(axis, 1.0));
    push_point_grad(&mut row, layout, plane_point, -sw * 2.0 * Vector3::ith(axis, 1.0));
    rows.push(row);
}

fn collinear_rows(project: &Project, layout: &ParamLayout, set: &[FeatureId], weight: f64, rows: &mut Vec<ResidualRow>) {
    if set.len() < 3 {
        return;
    }
    let sw = weight.sqrt();
    let p0 = point_of(project, layout, set[0]);
    for &pid in &set[2..] {
        let p1 = point_of(project, layout, set[1]);
        let pk = point_of(project, layout, pid);
        let d1 = p1 - p0;
        let dk = pk - p0;
        let cross = d1.cross(&dk);
        for axis in 0..3 {
            let mut row = ResidualRow::new(sw * cross[axis]);
            // d(cross)/d(p0,p1,pk) via product-rule cross-product derivative.
            let e = Vector3::ith(axis, 1.0);
            let _ = e;
            // Numerically-stable closed form: treat cross_axis as a trilinear
            // function of the three points' coordinates; differentiate each
            // point's contribution directly through d1 x dk.
            let grad_p1 = d_cross_d_a(dk, axis);
            let grad_pk = d_cross_d_b(d1, axis);
            let grad_p0 = -(grad_p1 + grad_pk);
            push_point_grad(&mut row, layout, set[1], sw * grad_p1);
            push_point_grad(&mut row, layout, pid, sw * grad_pk);
            push_point_grad(&mut row, layout, set[0], sw * grad_p0);
            rows.push(row);
        }
    }
}

/// `d(a x b)_axis / d(a)`, i.e. the row of the cross-product's Jacobian
/// with respect to its first operand.
fn d_cross_d_a(b: Vector3<f64>, axis: usize) -> Vector3<f64> {
    // (a x b)_0 = a1 b2 - a2 b1 ; (a x b)_1 = a2 b0 - a0 b2 ; (a x b)_2 = a0 b1 - a1 b0
    match axis {
        0 => Vector3::new(0.0, b.z, -b.y),
        1 => Vector3::new(-b.z, 0.0, b.x),
        _ => Vector3::new(b.y, -b.x, 0.0),
    }
}

fn d_cross_d_b(a: Vector3<f64>, axis: usize) -> Vector3<f64> {
    match axis {
        0 => Vector3::new(0.0, -a.z, a.y),
        1 => Vector3::new(a.z, 0.0, -a.x),
        _ => Vector3::new(-a.y, a.x, 0.0),
    }
}

/// Scalar-triple-product coplanarity residual `(p1-p0) x (p2-p0) . (pk-p0)`
/// for every point beyond the first three in `set`. Uses the full
/// four-point gradient (via the cyclic identity `a.(b x c) = b.(c x a) =
/// c.(a x b)`) rather than holding the anchor triple fixed, since all four
/// points are free parameters in general.
fn coplanar_rows(project: &Project, layout: &ParamLayout, set: &[FeatureId], weight: f64, rows: &mut Vec<ResidualRow>) {
    if set.len() < 4 {
        return;
    }
    let sw = weight.sqrt();
    let p0 = point_of(project, layout, set[0]);
    let p1 = point_of(project, layout, set[1]);
    let p2 = point_of(project, layout, set[2]);
    let d1 = p1 - p0;
    let d2 = p2 - p0;
    let normal = d1.cross(&d2);
    for &pid in &set[3..] {
        let pk = point_of(project, layout, pid);
        let dk = pk - p0;
        let value = sw * normal.dot(&dk);
        let mut row = ResidualRow::new(value);
        let grad_p1 = d2.cross(&dk);
        let grad_p2 = dk.cross(&d1);
        let grad_pk = normal;
        let grad_p0 = -(grad_p1 + grad_p2 + grad_pk);
        push_point_grad(&mut row, layout, set[1], sw * grad_p1);
        push_point_grad(&mut row, layout, set[2], sw * grad_p2);
        push_point_grad(&mut row, layout, pid, sw * grad_pk);
        push_point_grad(&mut row, layout, set[0], sw * grad_p0);
        rows.push(row);
    }
}

fn line_direction(project: &Project, lid: LineId) -> (Vector3<f64>, FeatureId, FeatureId) {
    let line = project.line(lid);
    let a = project.feature(line.feature_a).effective_xyz();
    let b = project.feature(line.feature_b).effective_xyz();
    (b - a, line.feature_a, line.feature_b)
}

fn parallel_perpendicular_rows(
    project: &Project,
    layout: &ParamLayout,
    a: LineId,
    b: LineId,
    weight: f64,
    perpendicular: bool,
    rows: &mut Vec<ResidualRow>,
) {
    let (da, fa0, fa1) = line_direction(project, a);
    let (db, fb0, fb1) = line_direction(project, b);
    let sw = weight.sqrt();
    let value = if perpendicular { da.dot(&db) } else { da.cross(&db).norm() };
    if perpendicular {
        let mut row = ResidualRow::new(sw * value);
        push_point_grad(&mut row, layout, fa1, sw * db);
        push_point_grad(&mut row, layout, fa0, -sw * db);
        push_point_grad(&mut row, layout, fb1, sw * da);
        push_point_grad(&mut row, layout, fb0, -sw * da);
        rows.push(row);
    } else {
        let cross = da.cross(&db);
        for axis in 0..3 {
            let mut row = ResidualRow::new(sw * cross[axis]);
            let grad_da = d_cross_d_a(db, axis);
            let grad_db = d_cross_d_b(da, axis);
            push_point_grad(&mut row, layout, fa1, sw * grad_da);
            push_point_grad(&mut row, layout, fa0, -sw * grad_da);
            push_point_grad(&mut row, layout, fb1, sw * grad_db);
            push_point_grad(&mut row, layout, fb0, -sw * grad_db);
            rows.push(row);
        }
    }
}

/// Axis-line-direction residual: cross product of a line's direction with
/// the world axis it is constrained to, one residual component per axis
/// (§4.8; complements the hard propagation in `world_init.rs` with a soft
/// term so the LM solve keeps such lines aligned under further refinement).
fn axis_line_rows(project: &Project, layout: &ParamLayout, lid: LineId, axis: usize, weight: f64, rows: &mut Vec<ResidualRow>) {
    let (dir, fa, fb) = line_direction(project, lid);
    let world_axis = Vector3::ith(axis, 1.0);
    let sw = weight.sqrt();
    let cross = dir.cross(&world_axis);
    for comp in 0..3 {
        let mut row = ResidualRow::new(sw * cross[comp]);
        let grad = d_cross_d_a(world_axis, comp);
        push_point_grad(&mut row, layout, fb, sw * grad);
        push_point_grad(&mut row, layout, fa, -sw * grad);
        rows.push(row);
    }
}

fn line_length_row(project: &Project, layout: &ParamLayout, lid: LineId, target: f64, scale: f64, rows: &mut Vec<ResidualRow>) {
    let line = project.line(lid);
    let row = distance_row(project, layout, line.feature_a, line.feature_b, target, 1.0);
    let mut scaled = ResidualRow::new(row.value * scale);
    for (idx, partial) in row.grad {
        scaled.push(idx, partial * scale);
    }
    rows.push(scaled);
}

/// Build every constraint residual enabled in the project, per §4.8 and §3
/// (`Constraint`'s tagged-variant list).
pub fn constraint_residuals(project: &Project, layout: &ParamLayout, rows: &mut Vec<ResidualRow>) {
    for constraint in project.constraints() {
        if !constraint.is_enabled() {
            continue;
        }
        match constraint {
            Constraint::PointsDistance { a, b, distance, weight, .. } => {
                rows.push(distance_row(project, layout, *a, *b, *distance, *weight));
            }
            Constraint::PointsEqualDistance { set, weight, .. } => {
                if let Some((first_a, first_b)) = set.first() {
                    let target_len = (project.feature(*first_a).effective_xyz() - project.feature(*first_b).effective_xyz()).norm();
                    for &(a, b) in &set[1..] {
                        rows.push(distance_row(project, layout, a, b, target_len, *weight));
                    }
                }
            }
            Constraint::PointsColinear { set, weight, .. } => {
                collinear_rows(project, layout, set, *weight, rows);
            }
            Constraint::PointsCoplanar { set, weight, .. } => {
                coplanar_rows(project, layout, set, *weight, rows);
            }
            Constraint::LinesParallel { a, b, weight, .. } => {
                parallel_perpendicular_rows(project, layout, *a, *b, *weight, false, rows);
            }
            Constraint::LinesPerpendicular { a, b, weight, .. } => {
                parallel_perpendicular_rows(project, layout, *a, *b, *weight, true, rows);
            }
            Constraint::PointFixedCoord { point, axis, value, weight, .. } => {
                rows.push(fixed_coord_row(project, layout, *point, *axis, *value, *weight));
            }
            Constraint::PointsMirrored { a, b, axis, plane_point, weight, .. } => {
                mirrored_rows(project, layout, *a, *b, *axis, *plane_point, *weight, rows);
            }
        }
    }

    for line in project.lines() {
        if let Some(axis) = line.direction.single_axis() {
            axis_line_rows(project, layout, line.id, axis, 1.0, rows);
        }
        if let Some(target) = line.target_length {
            let scale = 1.0 / line.tolerance.unwrap_or(1.0).max(1e-9);
            line_length_row(project, layout, line.id, target, scale, rows);
        }
    }
}

/// Regularization residual for a free axis on a feature constrained by only
/// a single axis-line relation, preventing the remaining degrees of
/// freedom from drifting unbounded when no observation pins them (§4.8
/// "regularization weight for single-axis-constraint cases").
pub fn single_axis_regularization_rows(
    project: &Project,
    layout: &ParamLayout,
    weight: f64,
    underconstrained: &[(FeatureId, usize)],
    rows: &mut Vec<ResidualRow>,
) {
    if weight <= 0.0 {
        return;
    }
    let sw = weight.sqrt();
    for &(fid, axis) in underconstrained {
        if let Some(&idx) = layout.feature_axis.get(&(fid, axis)) {
            let mut row = ResidualRow::new(sw * project.feature(fid).optimized_xyz[axis]);
            row.push(idx, sw);
            rows.push(row);
        }
    }
}

#[allow(dead_code)]
fn camera_ids(project: &Project) -> Vec<ViewpointId> {
    project.viewpoint_ids()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::{LineDirection as LD, Project};
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    #[test]
    fn distance_residual_matches_closed_form() {
        let mut project = Project::new();
        let a = project.add_feature("a");
        let b = project.add_feature("b");
        project.feature_mut(a).optimized_xyz = Vector3::new(0.0, 0.0, 0.0);
        project.feature_mut(b).optimized_xyz = Vector3::new(3.0, 4.0, 0.0);
        let layout = ParamLayout::build(&project, crate::params::IntrinsicsMode::Never, false);
        let row = distance_row(&project, &layout, a, b, 4.0, 1.0);
        assert_relative_eq!(row.value, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn distance_jacobian_matches_central_difference() {
        let mut project = Project::new();
        let a = project.add_feature("a");
        let b = project.add_feature("b");
        project.feature_mut(a).optimized_xyz = Vector3::new(0.1, 0.2, 0.3);
        project.feature_mut(b).optimized_xyz = Vector3::new(1.3, -0.4, 2.0);
        let layout = ParamLayout::build(&project, crate::params::IntrinsicsMode::Never, false);
        let base = distance_row(&project, &layout, a, b, 1.0, 1.0);

        for &(axis, idx) in &[(0usize, 0usize), (1, 1), (2, 2)] {
            let h = 1e-6;
            let mut p_plus = project.clone();
            p_plus.feature_mut(a).optimized_xyz[axis] += h;
            let r_plus = distance_row(&p_plus, &layout, a, b, 1.0, 1.0).value;
            let mut p_minus = project.clone();
            p_minus.feature_mut(a).optimized_xyz[axis] -= h;
            let r_minus = distance_row(&p_minus, &layout, a, b, 1.0, 1.0).value;
            let numeric = (r_plus - r_minus) / (2.0 * h);
            let analytic = base.grad.iter().find(|(i, _)| *i == idx).map(|(_, g)| *g).unwrap_or(0.0);
            assert_relative_eq!(analytic, numeric, epsilon = 1e-4);
        }
    }

    #[test]
    fn fixed_coord_jacobian_matches_central_difference() {
        let mut project = Project::new();
        let a = project.add_feature("a");
        project.feature_mut(a).optimized_xyz = Vector3::new(1.0, 2.0, 3.0);
        let layout = ParamLayout::build(&project, crate::params::IntrinsicsMode::Never, false);
        let row = fixed_coord_row(&project, &layout, a, 1, 5.0, 2.0);
        assert_relative_eq!(row.value, 2f64.sqrt() * (2.0 - 5.0), epsilon = 1e-9);
        let h = 1e-6;
        let mut p_plus = project.clone();
        p_plus.feature_mut(a).optimized_xyz[1] += h;
        let r_plus = fixed_coord_row(&p_plus, &layout, a, 1, 5.0, 2.0).value;
        let mut p_minus = project.clone();
        p_minus.feature_mut(a).optimized_xyz[1] -= h;
        let r_minus = fixed_coord_row(&p_minus, &layout, a, 1, 5.0, 2.0).value;
        let numeric = (r_plus - r_minus) / (2.0 * h);
        let analytic = row.grad.iter().find(|(i, _)| *i == 1).map(|(_, g)| *g).unwrap();
        assert_relative_eq!(analytic, numeric, epsilon = 1e-4);
    }

    #[test]
    fn reprojection_jacobian_matches_central_difference_for_feature_point() {
        let mut project = Project::new();
        let f = project.add_feature("p");
        project.feature_mut(f).optimized_xyz = Vector3::new(0.3, -0.2, 5.0);
        let v = project.add_viewpoint("cam", 640.0, 480.0);
        project.viewpoint_mut(v).position = Vector3::new(0.0, 0.0, -2.0);
        project.add_observation(v, f, (330.0, 210.0));
        let layout = ParamLayout::build(&project, crate::params::IntrinsicsMode::Never, false);

        let mut rows = Vec::new();
        reprojection_residuals(&project, &layout, &mut rows);
        assert_eq!(rows.len(), 2);

        for axis in 0..3 {
            let idx = layout.feature_axis[&(f, axis)];
            let h = 1e-6;
            let mut p_plus = project.clone();
            p_plus.feature_mut(f).optimized_xyz[axis] += h;
            let mut rows_plus = Vec::new();
            reprojection_residuals(&p_plus, &layout, &mut rows_plus);
            let mut p_minus = project.clone();
            p_minus.feature_mut(f).optimized_xyz[axis] -= h;
            let mut rows_minus = Vec::new();
            reprojection_residuals(&p_minus, &layout, &mut rows_minus);

            for r in 0..2 {
                let numeric = (rows_plus[r].value - rows_minus[r].value) / (2.0 * h);
                let analytic = rows[r].grad.iter().find(|(i, _)| *i == idx).map(|(_, g)| *g).unwrap_or(0.0);
                assert_relative_eq!(analytic, numeric, epsilon = 1e-3);
            }
        }
    }

    #[test]
    fn coplanar_jacobian_matches_central_difference() {
        let mut project = Project::new();
        let p0 = project.add_feature("p0");
        let p1 = project.add_feature("p1");
        let p2 = project.add_feature("p2");
        let pk = project.add_feature("pk");
        project.feature_mut(p0).optimized_xyz = Vector3::new(0.0, 0.0, 0.0);
        project.feature_mut(p1).optimized_xyz = Vector3::new(1.0, 0.3, 0.1);
        project.feature_mut(p2).optimized_xyz = Vector3::new(0.2, 1.0, -0.2);
        project.feature_mut(pk).optimized_xyz = Vector3::new(0.5, 0.4, 0.7);
        let layout = ParamLayout::build(&project, crate::params::IntrinsicsMode::Never, false);
        let set = vec![p0, p1, p2, pk];
        let mut rows = Vec::new();
        coplanar_rows(&project, &layout, &set, 1.0, &mut rows);
        assert_eq!(rows.len(), 1);
        let base = &rows[0];

        for &(fid, axis) in &[(p0, 0usize), (p1, 1), (p2, 2), (pk, 0)] {
            let idx = layout.feature_axis[&(fid, axis)];
            let h = 1e-6;
            let mut p_plus = project.clone();
            p_plus.feature_mut(fid).optimized_xyz[axis] += h;
            let mut rows_plus = Vec::new();
            coplanar_rows(&p_plus, &layout, &set, 1.0, &mut rows_plus);
            let mut p_minus = project.clone();
            p_minus.feature_mut(fid).optimized_xyz[axis] -= h;
            let mut rows_minus = Vec::new();
            coplanar_rows(&p_minus, &layout, &set, 1.0, &mut rows_minus);
            let numeric = (rows_plus[0].value - rows_minus[0].value) / (2.0 * h);
            let analytic = base.grad.iter().find(|(i, _)| *i == idx).map(|(_, g)| *g).unwrap_or(0.0);
            assert_relative_eq!(analytic, numeric, epsilon = 1e-4);
        }
    }

    #[test]
    fn axis_line_ambiguity_helper_compiles_with_free_line_direction() {
        let mut project = Project::new();
        let a = project.add_feature("a");
        let b = project.add_feature("b");
        project.feature_mut(a).optimized_xyz = Vector3::new(0.0, 0.0, 0.0);
        project.feature_mut(b).optimized_xyz = Vector3::new(0.0, 0.0, 2.0);
        project.add_line(a, b, LD::Z);
        let layout = ParamLayout::build(&project, crate::params::IntrinsicsMode::Never, false);
        let mut rows = Vec::new();
        constraint_residuals(&project, &layout, &mut rows);
        assert_eq!(rows.len(), 3);
        for r in &rows {
            assert_relative_eq!(r.value, 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn mirrored_jacobian_matches_central_difference() {
        let mut project = Project::new();
        let a = project.add_feature("a");
        let b = project.add_feature("b");
        let plane = project.add_feature("plane");
        project.feature_mut(a).optimized_xyz = Vector3::new(1.2, 0.3, -0.4);
        project.feature_mut(b).optimized_xyz = Vector3::new(-0.9, 0.35, -0.38);
        project.feature_mut(plane).optimized_xyz = Vector3::new(0.1, 5.0, 9.0);
        let layout = ParamLayout::build(&project, crate::params::IntrinsicsMode::Never, false);

        let mut rows = Vec::new();
        mirrored_rows(&project, &layout, a, b, 0, plane, 1.0, &mut rows);
        assert_eq!(rows.len(), 3);

        for (fid, axis) in [(a, 0usize), (a, 1), (a, 2), (b, 0), (b, 1), (b, 2), (plane, 0)] {
            let idx = layout.feature_axis[&(fid, axis)];
            let h = 1e-6;
            let mut p_plus = project.clone();
            p_plus.feature_mut(fid).optimized_xyz[axis] += h;
            let mut rows_plus = Vec::new();
            mirrored_rows(&p_plus, &layout, a, b, 0, plane, 1.0, &mut rows_plus);
            let mut p_minus = project.clone();
            p_minus.feature_mut(fid).optimized_xyz[axis] -= h;
            let mut rows_minus = Vec::new();
            mirrored_rows(&p_minus, &layout, a, b, 0, plane, 1.0, &mut rows_minus);
            for r in 0..3 {
                let numeric = (rows_plus[r].value - rows_minus[r].value) / (2.0 * h);
                let analytic = rows[r].grad.iter().find(|(i, _)| *i == idx).map(|(_, g)| *g).unwrap_or(0.0);
                assert_relative_eq!(analytic, numeric, epsilon = 1e-4);
            }
        }
    }
}
