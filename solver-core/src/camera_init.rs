//! Project-level camera-initialization glue (§4.5): bridges the project
//! graph's vanishing lines and observations to the strategy primitives in
//! `scene_solver_geom`, writing the result back onto each [`Viewpoint`].

use nalgebra::{Vector2, Vector3};

use scene_solver_geom::{
    detect_vanishing_point, disambiguate_sign, initialize_via_essential_matrix,
    initialize_via_late_pnp, rotation_candidates_from_vps, Axis as GeomAxis, Correspondence,
    ImageLine, NormalizedMatch, ScoredObservation,
};
use scene_solver_math::Prng;

use crate::context::SolveContext;
use crate::project::{Project, ViewpointId, VpAxis};

const MIN_SHARED_MATCHES: usize = 8;
const MIN_LATE_PNP_CORRESPONDENCES: usize = 4;

/// Which strategy actually initialized a viewpoint, recorded for
/// diagnostics and for late-PnP-specific outlier handling (§4.9). `VpPnp`
/// is the strict VP path (>=2 already-known world points to resolve
/// position/sign against); `SteppedVp` is the relaxed path (0 or 1 known
/// points), parked at the origin or disambiguated against a single probe,
/// pending later correction once more points are triangulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStrategy {
    VpPnp,
    SteppedVp,
    Essential,
    LatePnp,
}

/// §4.5 diagnostics describing which camera-initialization strategies
/// fired during a solve attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CameraInitDiagnostics {
    pub used_essential_matrix: bool,
    pub stepped_vp_reverted: bool,
    pub vp_em_hybrid_applied: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CameraInitReport {
    pub initialized: Vec<(ViewpointId, InitStrategy)>,
    pub late_pnp_cameras: Vec<ViewpointId>,
    pub notes: Vec<String>,
    pub diagnostics: CameraInitDiagnostics,
}

fn to_geom_axis(axis: VpAxis) -> GeomAxis {
    match axis {
        VpAxis::X => GeomAxis::X,
        VpAxis::Y => GeomAxis::Y,
        VpAxis::Z => GeomAxis::Z,
    }
}

fn vanishing_lines_for_axis(project: &Project, vid: ViewpointId, axis: VpAxis) -> Vec<ImageLine> {
    project
        .viewpoint(vid)
        .vanishing_lines
        .iter()
        .filter(|l| l.axis == axis)
        .map(|l| ImageLine {
            p0: Vector2::new(l.p0.0, l.p0.1),
            p1: Vector2::new(l.p1.0, l.p1.1),
        })
        .collect()
}

/// True when a feature's world position is trustworthy as a 3D
/// correspondence: either locked/inferred outright, or triangulated from
/// >=2 already-initialized cameras. Excludes points that only have a
/// single-camera back-projection, per §4.3's `initialized_camera_names`
/// note ("distinguishing true triangulation from single-view
/// back-projection") — using a back-projected point from camera A to
/// initialize camera A's own pose would be circular.
fn is_trustworthy_3d_point(project: &Project, fid: crate::project::FeatureId) -> bool {
    let feat = project.feature(fid);
    if feat.is_fully_constrained() {
        return true;
    }
    feat.observations
        .iter()
        .filter(|&&oid| {
            let obs = project.observation(oid);
            project.viewpoint(obs.viewpoint).is_initialized
        })
        .count()
        >= 2
}

/// Observations of this viewpoint whose feature already has a fully known
/// world position, usable as position-solving and sign-disambiguation
/// probes.
fn known_point_observations(project: &Project, vid: ViewpointId) -> Vec<(Vector3<f64>, (f64, f64))> {
    project
        .viewpoint(vid)
        .observations
        .iter()
        .filter_map(|&oid| {
            let obs = project.observation(oid);
            is_trustworthy_3d_point(project, obs.feature).then(|| (project.feature(obs.feature).effective_xyz(), obs.pixel))
        })
        .collect()
}

/// Attempt the `vp_pnp`/`stepped_vp` strategy on one viewpoint: derive
/// rotation candidates from its observed axis VPs, then resolve position
/// and sign against any already-known world points (§4.2, §4.5).
fn try_vp_strategy(project: &mut Project, ctx: &mut SolveContext, vid: ViewpointId) -> Option<InitStrategy> {
    let x_lines = vanishing_lines_for_axis(project, vid, VpAxis::X);
    let y_lines = vanishing_lines_for_axis(project, vid, VpAxis::Y);
    let z_lines = vanishing_lines_for_axis(project, vid, VpAxis::Z);
    if x_lines.len() < 2 && y_lines.len() < 2 && z_lines.len() < 2 {
        return None;
    }

    let intr = project.viewpoint(vid).intrinsics;
    let mut rng = Prng::new(42);
    let vp_x = detect_vanishing_point(to_geom_axis(VpAxis::X), &x_lines, &mut rng).map(|v| v.uv);
    let vp_y = detect_vanishing_point(to_geom_axis(VpAxis::Y), &y_lines, &mut rng).map(|v| v.uv);
    let vp_z = detect_vanishing_point(to_geom_axis(VpAxis::Z), &z_lines, &mut rng).map(|v| v.uv);
    let candidates = rotation_candidates_from_vps(vp_x, vp_y, vp_z, &intr);
    let first = candidates.first()?;

    let known = known_point_observations(project, vid);
    // >=2 known points is the strict `vp_pnp` path; fewer is the relaxed
    // `stepped_vp` path, which may later be revisited via
    // `revert_stepped_vp_cameras` once more points are triangulated (§4.5).
    let strategy = if known.len() >= 2 { InitStrategy::VpPnp } else { InitStrategy::SteppedVp };
    let (rotation, position) = if known.is_empty() {
        // No known world points yet to resolve position or sign against;
        // park the camera at the origin with the raw candidate rotation as
        // a neutral seed for the world-point initializer to triangulate
        // against (§4.5).
        (first.rotation, Vector3::zeros())
    } else {
        let scored: Vec<ScoredObservation> = known
            .iter()
            .map(|(w, p)| ScoredObservation { world_point: *w, pixel: *p })
            .collect();
        match disambiguate_sign(first.rotation, &intr, &known, &scored) {
            Some(result) => result,
            None => {
                ctx.log.push(format!(
                    "[CameraInit] {} sign disambiguation rejected (reprojection error too high)",
                    project.viewpoint(vid).name
                ));
                return None;
            }
        }
    };

    let vp = project.viewpoint_mut(vid);
    vp.rotation = rotation;
    vp.position = position;
    vp.is_initialized = true;
    vp.initialized_via_vp = true;
    ctx.log.push(format!("[CameraInit] {} initialized via vanishing points ({strategy:?})", vp.name));
    Some(strategy)
}

/// Attempt the `essential_matrix` strategy between two uninitialized
/// viewpoints that share enough observations of the same features
/// (§4.4, §4.5). Anchors `a` at the world origin with identity rotation.
fn try_essential_strategy(project: &mut Project, ctx: &mut SolveContext, a: ViewpointId, b: ViewpointId) -> bool {
    let obs_a = &project.viewpoint(a).observations;
    let obs_b_features: std::collections::HashMap<_, _> = project
        .viewpoint(b)
        .observations
        .iter()
        .map(|&oid| (project.observation(oid).feature, project.observation(oid).pixel))
        .collect();

    let intr_a = project.viewpoint(a).intrinsics;
    let intr_b = project.viewpoint(b).intrinsics;
    let matches: Vec<NormalizedMatch> = obs_a
        .iter()
        .filter_map(|&oid| {
            let obs = project.observation(oid);
            let pixel_b = obs_b_features.get(&obs.feature)?;
            let ray_a = intr_a.pixel_to_camera_ray(obs.pixel.0, obs.pixel.1);
            let ray_b = intr_b.pixel_to_camera_ray(pixel_b.0, pixel_b.1);
            Some(NormalizedMatch {
                a: (ray_a.x, ray_a.y),
                b: (ray_b.x, ray_b.y),
            })
        })
        .collect();

    if matches.len() < MIN_SHARED_MATCHES {
        return false;
    }

    let Some((cam_a, cam_b, note)) = initialize_via_essential_matrix(&intr_a, &intr_b, &matches, &mut ctx.rng) else {
        return false;
    };

    {
        let vp_a = project.viewpoint_mut(a);
        vp_a.rotation = cam_a.pose.rotation;
        vp_a.position = cam_a.pose.position;
        vp_a.is_initialized = true;
        vp_a.initialized_via_vp = false;
    }
    {
        let vp_b = project.viewpoint_mut(b);
        vp_b.rotation = cam_b.pose.rotation;
        vp_b.position = cam_b.pose.position;
        vp_b.is_initialized = true;
        vp_b.initialized_via_vp = false;
    }
    ctx.log.push(format!(
        "[CameraInit] {} / {} bootstrapped via essential matrix ({note})",
        project.viewpoint(a).name,
        project.viewpoint(b).name
    ));
    true
}

/// Attempt the `late_pnp_only` strategy on one viewpoint against whatever
/// world points are already known (§4.3, §4.5).
fn try_late_pnp_strategy(project: &mut Project, ctx: &mut SolveContext, vid: ViewpointId) -> bool {
    let intr = project.viewpoint(vid).intrinsics;
    let correspondences: Vec<Correspondence> = project
        .viewpoint(vid)
        .observations
        .iter()
        .filter_map(|&oid| {
            let obs = project.observation(oid);
            is_trustworthy_3d_point(project, obs.feature).then(|| Correspondence {
                world: project.feature(obs.feature).effective_xyz(),
                pixel: obs.pixel,
            })
        })
        .collect();

    if correspondences.len() < MIN_LATE_PNP_CORRESPONDENCES {
        return false;
    }

    let result = initialize_via_late_pnp(&correspondences, &intr, &mut ctx.rng);
    if !result.success {
        return false;
    }
    let Some(pose) = result.pose else {
        return false;
    };

    let vp = project.viewpoint_mut(vid);
    vp.rotation = pose.rotation;
    vp.position = pose.position;
    vp.is_initialized = true;
    vp.initialized_via_vp = false;
    ctx.log.push(format!(
        "[CameraInit] {} initialized via late PnP ({} inliers, reliable={})",
        vp.name, result.inlier_count, result.reliable
    ));
    true
}

/// Run camera initialization over every uninitialized viewpoint: `late_pnp`
/// first (it needs no other camera, just >=4 locked/inferred/triangulated
/// correspondences — the direct path for e.g. an all-locked-points scene
/// with no vanishing lines), then `vp_pnp`, then `essential_matrix` between
/// remaining pairs, then one more `late_pnp` pass to mop up any viewpoint
/// that can now resolve against a sibling camera's locked-point
/// observations (§4.5). Call this again after `initialize_world_points`
/// widens the set of triangulated features, to pick up any viewpoint that
/// could not be bootstrapped on the first pass (the "Late PnP" phase,
/// §2's phase list).
pub fn initialize_cameras(project: &mut Project, ctx: &mut SolveContext) -> CameraInitReport {
    let mut report = CameraInitReport::default();

    let run_late_pnp_pass = |project: &mut Project, ctx: &mut SolveContext, report: &mut CameraInitReport| {
        let pending: Vec<ViewpointId> = project.viewpoint_ids().into_iter().filter(|&v| !project.viewpoint(v).is_initialized).collect();
        for vid in pending {
            if try_late_pnp_strategy(project, ctx, vid) {
                report.initialized.push((vid, InitStrategy::LatePnp));
                report.late_pnp_cameras.push(vid);
            }
        }
    };

    run_late_pnp_pass(project, ctx, &mut report);

    let pending: Vec<ViewpointId> = project.viewpoint_ids().into_iter().filter(|&v| !project.viewpoint(v).is_initialized).collect();
    for &vid in &pending {
        if project.viewpoint(vid).is_initialized {
            continue;
        }
        if let Some(strategy) = try_vp_strategy(project, ctx, vid) {
            report.initialized.push((vid, strategy));
        }
    }

    let still_pending: Vec<ViewpointId> = project.viewpoint_ids().into_iter().filter(|&v| !project.viewpoint(v).is_initialized).collect();
    for i in 0..still_pending.len() {
        for j in (i + 1)..still_pending.len() {
            let (a, b) = (still_pending[i], still_pending[j]);
            if project.viewpoint(a).is_initialized || project.viewpoint(b).is_initialized {
                continue;
            }
            if try_essential_strategy(project, ctx, a, b) {
                report.initialized.push((a, InitStrategy::Essential));
                report.initialized.push((b, InitStrategy::Essential));
            }
        }
    }

    run_late_pnp_pass(project, ctx, &mut report);

    let uninitialized: Vec<String> = project
        .viewpoints()
        .filter(|v| !v.is_initialized)
        .map(|v| v.name.clone())
        .collect();
    if !uninitialized.is_empty() {
        report.notes.push(format!("could not initialize: {}", uninitialized.join(", ")));
    }

    let used_essential_matrix = report.initialized.iter().any(|&(_, s)| s == InitStrategy::Essential);
    let vp_based = report
        .initialized
        .iter()
        .any(|&(_, s)| matches!(s, InitStrategy::VpPnp | InitStrategy::SteppedVp));
    report.diagnostics.used_essential_matrix = used_essential_matrix;
    report.diagnostics.vp_em_hybrid_applied = used_essential_matrix && vp_based;

    report
}

/// Retry late PnP on any viewpoint initialized via the relaxed
/// `stepped_vp` path, now that world-point initialization and scene
/// alignment may have triangulated enough correspondences to resolve it
/// properly. Sets the `stepped_vp_reverted` diagnostic on success (§4.5).
pub fn revert_stepped_vp_cameras(project: &mut Project, ctx: &mut SolveContext, report: &mut CameraInitReport) {
    let stepped: Vec<ViewpointId> = report
        .initialized
        .iter()
        .filter(|&&(_, s)| s == InitStrategy::SteppedVp)
        .map(|&(id, _)| id)
        .collect();

    for vid in stepped {
        let intr = project.viewpoint(vid).intrinsics;
        let correspondences: Vec<Correspondence> = project
            .viewpoint(vid)
            .observations
            .iter()
            .filter_map(|&oid| {
                let obs = project.observation(oid);
                is_trustworthy_3d_point(project, obs.feature).then(|| Correspondence {
                    world: project.feature(obs.feature).effective_xyz(),
                    pixel: obs.pixel,
                })
            })
            .collect();
        if correspondences.len() < MIN_LATE_PNP_CORRESPONDENCES {
            continue;
        }

        let result = initialize_via_late_pnp(&correspondences, &intr, &mut ctx.rng);
        let (Some(pose), true) = (result.pose, result.success && result.reliable) else {
            continue;
        };

        let vp = project.viewpoint_mut(vid);
        vp.rotation = pose.rotation;
        vp.position = pose.position;
        vp.initialized_via_vp = false;
        let name = vp.name.clone();
        if let Some(entry) = report.initialized.iter_mut().find(|(id, _)| *id == vid) {
            entry.1 = InitStrategy::LatePnp;
        }
        report.diagnostics.stepped_vp_reverted = true;
        ctx.log.push(format!("[CameraInit] {name} reverted from stepped-VP to late PnP"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::{Project, VanishingLine};

    fn add_axis_lines(project: &mut Project, vid: ViewpointId, axis: VpAxis, lines: &[((f64, f64), (f64, f64))]) {
        for &(p0, p1) in lines {
            project.viewpoint_mut(vid).vanishing_lines.push(VanishingLine { viewpoint: vid, p0, p1, axis });
        }
    }

    #[test]
    fn vp_strategy_initializes_camera_with_two_axes_of_lines() {
        let mut project = Project::new();
        let v = project.add_viewpoint("cam", 640.0, 480.0);
        // Two near-vertical lines converging toward a point above the image
        // (an X-axis vanishing point) and two near-horizontal lines
        // converging toward a point to the right (a Y-axis vanishing point).
        add_axis_lines(&mut project, v, VpAxis::X, &[((300.0, 100.0), (320.0, 400.0)), ((340.0, 100.0), (330.0, 400.0))]);
        add_axis_lines(&mut project, v, VpAxis::Y, &[((100.0, 200.0), (500.0, 240.0)), ((100.0, 260.0), (500.0, 230.0))]);
        let mut ctx = SolveContext::new(1);
        let report = initialize_cameras(&mut project, &mut ctx);
        assert!(report.initialized.iter().any(|&(id, s)| id == v && s == InitStrategy::SteppedVp));
        assert!(project.viewpoint(v).is_initialized);
    }

    #[test]
    fn camera_with_no_lines_and_no_points_is_left_uninitialized() {
        let mut project = Project::new();
        project.add_viewpoint("cam", 640.0, 480.0);
        let mut ctx = SolveContext::new(1);
        let report = initialize_cameras(&mut project, &mut ctx);
        assert!(report.initialized.is_empty());
        assert!(!report.notes.is_empty());
    }
}
