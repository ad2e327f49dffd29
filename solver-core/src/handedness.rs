//! Handedness corrector (§4.10): the final phase when `force_right_handed`
//! is set. Detects a sign mismatch between locked and optimized
//! coordinates (or, absent locked points, a left-handed anchor basis), and
//! applies the flip as a pure rotation whenever the flip count is even.

use nalgebra::{Matrix3, Vector3};

use crate::context::SolveContext;
use crate::project::{Project, AXIS_X, AXIS_Y, AXIS_Z};

/// Which axes need their sign flipped to match the locked data (or, absent
/// locked data, to reach a right-handed basis).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlipSet {
    pub x: bool,
    pub y: bool,
    pub z: bool,
}

impl FlipSet {
    pub fn count(&self) -> usize {
        [self.x, self.y, self.z].iter().filter(|b| **b).count()
    }
}

/// Step 1 (§4.10): compare the sign of every locked axis against the sign
/// of its optimized value; mark a mismatching axis for flipping.
fn scan_locked_signs(project: &Project) -> Option<FlipSet> {
    let mut flips = FlipSet::default();
    let mut any_locked = false;
    for feat in project.features() {
        for (axis, slot) in [(AXIS_X, &mut flips.x), (AXIS_Y, &mut flips.y), (AXIS_Z, &mut flips.z)] {
            if let Some(locked) = feat.locked_xyz[axis] {
                if locked.abs() < 1e-9 {
                    continue;
                }
                any_locked = true;
                let optimized = feat.optimized_xyz[axis];
                if locked.signum() != optimized.signum() && optimized.abs() > 1e-9 {
                    *slot = true;
                }
            }
        }
    }
    if any_locked {
        Some(flips)
    } else {
        None
    }
}

/// Step 2 (§4.10): absent locked coordinates, check the determinant of the
/// basis implied by three axis-anchor features (origin, +X, +Z); a
/// negative determinant marks Z for flipping. `anchors` is
/// `(origin, plus_x, plus_z)`.
fn scan_anchor_basis(project: &Project, anchors: (crate::project::FeatureId, crate::project::FeatureId, crate::project::FeatureId)) -> FlipSet {
    let (o, x, z) = anchors;
    let origin = project.feature(o).effective_xyz();
    let ex = project.feature(x).effective_xyz() - origin;
    let ez = project.feature(z).effective_xyz() - origin;
    let ey = ez.cross(&ex);
    let basis = Matrix3::from_columns(&[ex, ey, ez]);
    FlipSet {
        x: false,
        y: false,
        z: basis.determinant() < 0.0,
    }
}

fn flip_diagonal(flips: FlipSet) -> Vector3<f64> {
    Vector3::new(if flips.x { -1.0 } else { 1.0 }, if flips.y { -1.0 } else { 1.0 }, if flips.z { -1.0 } else { 1.0 })
}

fn apply_rotation(project: &mut Project, rotation: &Matrix3<f64>) {
    let feature_ids = project.feature_ids();
    for fid in feature_ids {
        let feat = project.feature_mut(fid);
        feat.optimized_xyz = rotation * feat.optimized_xyz;
    }
    let rotation_quat = scene_solver_math::matrix_to_quat(rotation);
    for vid in project.viewpoint_ids() {
        let vp = project.viewpoint_mut(vid);
        vp.position = rotation * vp.position;
        vp.rotation = vp.rotation * rotation_quat.inverse();
    }
}

/// Run the handedness correction phase. `anchor_triple` supplies the
/// (origin, +X, +Z) features used by step 2 when no locked coordinates
/// exist; pass `None` when no such triple can be identified (in which case
/// a left-handed scene with no locked points and no anchors cannot be
/// detected, matching §4.10's silence on that case).
pub fn correct_handedness(
    project: &mut Project,
    ctx: &mut SolveContext,
    anchor_triple: Option<(crate::project::FeatureId, crate::project::FeatureId, crate::project::FeatureId)>,
) {
    let flips = scan_locked_signs(project).unwrap_or_else(|| {
        anchor_triple.map(|t| scan_anchor_basis(project, t)).unwrap_or_default()
    });

    match flips.count() {
        0 => {
            for vid in project.viewpoint_ids() {
                project.viewpoint_mut(vid).is_z_reflected = false;
            }
            ctx.log.push("[Handedness] scene already right-handed, no flip applied".to_string());
        }
        2 => {
            let diag = flip_diagonal(flips);
            let rotation = Matrix3::from_diagonal(&diag);
            apply_rotation(project, &rotation);
            for vid in project.viewpoint_ids() {
                project.viewpoint_mut(vid).is_z_reflected = false;
            }
            ctx.log.push(format!("[Handedness] applied 180deg rotation for flip set {:?}", flips));
        }
        1 | 3 => {
            // Odd flip counts cannot be expressed as a pure rotation. Emulate
            // via the matching 2-flip rotation (flip the two axes other than
            // whichever single axis would otherwise be the odd one out) and
            // mark every camera as Z-reflected so the downstream renderer
            // compensates (§4.10).
            let even_approx = match flips.count() {
                1 => FlipSet {
                    x: !flips.x,
                    y: !flips.y,
                    z: !flips.z,
                },
                _ => flips,
            };
            let diag = flip_diagonal(even_approx);
            let rotation = Matrix3::from_diagonal(&diag);
            apply_rotation(project, &rotation);
            for vid in project.viewpoint_ids() {
                project.viewpoint_mut(vid).is_z_reflected = true;
            }
            ctx.log.push(format!(
                "[Handedness] odd flip count {} cannot be a pure rotation; applied nearest 2-flip rotation and set is_z_reflected",
                flips.count()
            ));
        }
        _ => unreachable!("flip count is always 0..=3"),
    }
}
