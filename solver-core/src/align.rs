//! Coordinate alignment (§4.7): orient the scene to the axis-line
//! directions, scale it from target lengths or locked-point pairs, and
//! translate it so the chosen anchor lands at its locked value (or the
//! origin).

use nalgebra::{Matrix3, Vector3};

use scene_solver_math::{normalize3, svd3, Prng};

use crate::project::{AXIS_X, AXIS_Y, AXIS_Z, Project};

/// Compute the direction vector of a line's two endpoints using their
/// effective coordinates.
fn line_direction(project: &Project, line_id: crate::project::LineId) -> Option<Vector3<f64>> {
    let line = project.line(line_id);
    let a = project.feature(line.feature_a).effective_xyz();
    let b = project.feature(line.feature_b).effective_xyz();
    normalize3(b - a)
}

/// Apply `rotation` to every feature's `optimized_xyz` and every enabled
/// camera's pose, atomically (§4.7: "each step updates both features and
/// cameras atomically").
fn apply_rotation(project: &mut Project, rotation: &Matrix3<f64>) {
    let feature_ids = project.feature_ids();
    for fid in feature_ids {
        let feat = project.feature_mut(fid);
        feat.optimized_xyz = rotation * feat.optimized_xyz;
    }
    let rotation_quat = scene_solver_math::matrix_to_quat(rotation);
    let viewpoint_ids = project.viewpoint_ids();
    for vid in viewpoint_ids {
        let vp = project.viewpoint_mut(vid);
        vp.position = rotation * vp.position;
        vp.rotation = vp.rotation * rotation_quat.inverse();
    }
}

fn apply_scale(project: &mut Project, factor: f64) {
    let feature_ids = project.feature_ids();
    for fid in feature_ids {
        let feat = project.feature_mut(fid);
        feat.optimized_xyz /= factor;
    }
    let viewpoint_ids = project.viewpoint_ids();
    for vid in viewpoint_ids {
        project.viewpoint_mut(vid).position /= factor;
    }
}

fn apply_translation(project: &mut Project, delta: Vector3<f64>) {
    let feature_ids = project.feature_ids();
    for fid in feature_ids {
        project.feature_mut(fid).optimized_xyz += delta;
    }
    let viewpoint_ids = project.viewpoint_ids();
    for vid in viewpoint_ids {
        project.viewpoint_mut(vid).position += delta;
    }
}

/// Axis-alignment step: SVD of the axis-labelled line direction vectors,
/// assign the three principal directions to X/Y/Z by nearest absolute dot
/// product, rotate the scene onto that basis. Returns the rotation applied,
/// or `None` if no axis-labelled lines exist.
pub fn align_to_axis_lines(project: &mut Project, rng: &mut Prng) -> Option<Matrix3<f64>> {
    let mut directions = Vec::new();
    let line_ids: Vec<_> = project.lines().map(|l| l.id).collect();
    for lid in &line_ids {
        if project.line(*lid).direction.single_axis().is_some() {
            if let Some(dir) = line_direction(project, *lid) {
                directions.push(dir);
            }
        }
    }
    if directions.is_empty() {
        return None;
    }

    let mut m = Matrix3::zeros();
    for d in &directions {
        m += d * d.transpose();
    }
    let svd = svd3(&m, rng);
    let principal: [Vector3<f64>; 3] = [svd.u.column(0).into(), svd.u.column(1).into(), svd.u.column(2).into()];

    // Assign each principal direction to the world axis it best matches,
    // defaulting the sign to positive (§4.7: "otherwise defaults to
    // positive" when no quality callback disambiguates it).
    let mut assigned = [Vector3::zeros(); 3];
    let mut used = [false; 3];
    for axis in [AXIS_X, AXIS_Y, AXIS_Z] {
        let world_axis = Vector3::ith(axis, 1.0);
        let (best_idx, best_dir) = principal
            .iter()
            .enumerate()
            .filter(|(i, _)| !used[*i])
            .map(|(i, d)| {
                let dir = if d.dot(&world_axis) < 0.0 { -d } else { *d };
                (i, dir)
            })
            .max_by(|(_, a), (_, b)| {
                a.dot(&world_axis).partial_cmp(&b.dot(&world_axis)).unwrap()
            })
            .unwrap();
        used[best_idx] = true;
        assigned[axis] = best_dir;
    }

    // `target`'s columns are the observed directions assigned to each world
    // axis, i.e. it maps world-axis basis vectors to their observed
    // counterparts; its inverse (= transpose, since it is orthonormal) is
    // the rotation that brings the scene onto the world axes.
    let target = Matrix3::from_columns(&assigned);
    let rotation = target.transpose();
    apply_rotation(project, &rotation);
    Some(rotation)
}

/// Scale step: median(current length / target length) across every line
/// with a `target_length`; divides every coordinate and camera position by
/// that factor. Returns the factor so callers can un-scale fixed points.
pub fn scale_from_target_lengths(project: &mut Project) -> Option<f64> {
    let mut ratios = Vec::new();
    for line in project.lines().collect::<Vec<_>>() {
        if let Some(target) = line.target_length {
            let a = project.feature(line.feature_a).effective_xyz();
            let b = project.feature(line.feature_b).effective_xyz();
            let current = (a - b).norm();
            if target > 1e-12 {
                ratios.push(current / target);
            }
        }
    }
    if ratios.is_empty() {
        return None;
    }
    ratios.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let factor = ratios[ratios.len() / 2];
    if factor.abs() > 1e-12 {
        apply_scale(project, factor);
    }
    Some(factor)
}

/// Scale from locked-point pairs when no target lengths exist (§4.7): any
/// two fully-locked features fix scale via the median ratio of their
/// optimized vs. locked Euclidean distance.
pub fn scale_from_locked_pairs(project: &mut Project) -> Option<f64> {
    let locked: Vec<_> = project
        .feature_ids()
        .into_iter()
        .filter(|&id| project.feature(id).locked_xyz.iter().all(|c| c.is_some()))
        .collect();
    if locked.len() < 2 {
        return None;
    }
    let mut ratios = Vec::new();
    for i in 0..locked.len() {
        for j in (i + 1)..locked.len() {
            let fi = project.feature(locked[i]);
            let fj = project.feature(locked[j]);
            let locked_dist = (fi.effective_xyz() - fj.effective_xyz()).norm();
            let current_dist = (fi.optimized_xyz - fj.optimized_xyz).norm();
            if locked_dist > 1e-12 && current_dist > 1e-12 {
                ratios.push(current_dist / locked_dist);
            }
        }
    }
    if ratios.is_empty() {
        return None;
    }
    ratios.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let factor = ratios[ratios.len() / 2];
    if factor.abs() > 1e-12 {
        apply_scale(project, factor);
    }
    Some(factor)
}

/// Translation step: pick the first locked point (else the feature
/// centroid) as anchor and translate the scene so it lands on its locked
/// value (or the origin).
pub fn translate_to_anchor(project: &mut Project) {
    let anchor = project
        .feature_ids()
        .into_iter()
        .find(|&id| project.feature(id).locked_xyz.iter().all(|c| c.is_some()));

    let delta = match anchor {
        Some(id) => {
            let feat = project.feature(id);
            feat.effective_xyz() - feat.optimized_xyz
        }
        None => {
            let ids = project.feature_ids();
            if ids.is_empty() {
                return;
            }
            let centroid: Vector3<f64> =
                ids.iter().map(|&id| project.feature(id).optimized_xyz).sum::<Vector3<f64>>() / ids.len() as f64;
            -centroid
        }
    };
    apply_translation(project, delta);
}

/// Run all alignment steps in order, per §4.7.
pub fn align_scene(project: &mut Project, rng: &mut Prng) {
    align_to_axis_lines(project, rng);
    if scale_from_target_lengths(project).is_none() {
        scale_from_locked_pairs(project);
    }
    translate_to_anchor(project);
}
