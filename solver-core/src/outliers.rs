//! Outlier detection & re-solve (§4.9): per-observation reprojection
//! error, median/MAD threshold, late-PnP-camera exclusion, and
//! all-cameras-excluded fatal detection.

use crate::context::SolveContext;
use crate::project::{ObservationId, Project, ViewpointId};

fn reprojection_error(project: &Project, obs_id: ObservationId) -> Option<f64> {
    let obs = project.observation(obs_id);
    let vp = project.viewpoint(obs.viewpoint);
    if !vp.enabled_in_solve {
        return None;
    }
    let feat = project.feature(obs.feature);
    let cam = scene_solver_geom::Camera {
        pose: scene_solver_geom::Pose {
            rotation: vp.rotation,
            position: vp.position,
        },
        intrinsics: vp.intrinsics,
    };
    cam.reprojection_error(feat.effective_xyz(), obs.pixel)
}

fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap());
    values[values.len() / 2]
}

/// Flag every observation whose reprojection error exceeds
/// `max(3*median, outlier_threshold_px)` (§4.9). Returns the per-viewpoint
/// outlier fraction for callers that need it (e.g. late-PnP exclusion).
pub fn detect_outliers(project: &mut Project, outlier_threshold_px: f64) -> std::collections::HashMap<ViewpointId, f64> {
    let obs_ids: Vec<_> = project.observations().map(|o| o.id).collect();
    let mut errors: Vec<(ObservationId, f64)> = obs_ids
        .iter()
        .filter_map(|&id| reprojection_error(project, id).map(|e| (id, e)))
        .collect();

    let mut values: Vec<f64> = errors.iter().map(|(_, e)| *e).collect();
    let med = median(&mut values);
    let threshold = (3.0 * med).max(outlier_threshold_px);

    for (id, err) in errors.drain(..) {
        project.observation_mut(id).is_outlier = err > threshold;
    }

    let mut per_viewpoint_total: std::collections::HashMap<ViewpointId, usize> = std::collections::HashMap::new();
    let mut per_viewpoint_outliers: std::collections::HashMap<ViewpointId, usize> = std::collections::HashMap::new();
    for obs in project.observations() {
        if !project.viewpoint(obs.viewpoint).enabled_in_solve {
            continue;
        }
        *per_viewpoint_total.entry(obs.viewpoint).or_insert(0) += 1;
        if obs.is_outlier {
            *per_viewpoint_outliers.entry(obs.viewpoint).or_insert(0) += 1;
        }
    }

    per_viewpoint_total
        .into_iter()
        .map(|(vid, total)| {
            let outliers = *per_viewpoint_outliers.get(&vid).unwrap_or(&0);
            (vid, if total == 0 { 0.0 } else { outliers as f64 / total as f64 })
        })
        .collect()
}

/// Exclude any viewpoint initialized via late PnP whose observations are
/// 100% outliers (§4.9). Returns the excluded viewpoint ids.
pub fn exclude_fully_outlier_late_pnp_cameras(
    project: &mut Project,
    ctx: &mut SolveContext,
    outlier_fractions: &std::collections::HashMap<ViewpointId, f64>,
    late_pnp_cameras: &[ViewpointId],
) -> Vec<ViewpointId> {
    let mut excluded = Vec::new();
    for &vid in late_pnp_cameras {
        if outlier_fractions.get(&vid).copied().unwrap_or(0.0) >= 1.0 {
            project.viewpoint_mut(vid).enabled_in_solve = false;
            excluded.push(vid);
            ctx.log.push(format!("[Outliers] excluded camera {} (100% outlier observations)", project.viewpoint(vid).name));
        }
    }
    excluded
}

/// True when every viewpoint has been excluded from the solve (§4.9, §7:
/// fatal case, returned result has `residual = infinity`).
pub fn all_cameras_excluded(project: &Project) -> bool {
    project.viewpoints().all(|v| !v.enabled_in_solve)
}

/// Reset any feature that is not fully constrained back to the origin so
/// the world-point initializer can rebuild it from scratch (§4.9, the
/// re-init path taken after excluding late-PnP cameras).
pub fn reset_unconstrained_features(project: &mut Project) {
    for fid in project.feature_ids() {
        let feat = project.feature_mut(fid);
        if !feat.is_fully_constrained() {
            feat.optimized_xyz = nalgebra::Vector3::zeros();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::Project;

    #[test]
    fn detects_observation_far_from_median() {
        let mut project = Project::new();
        let v = project.add_viewpoint("cam", 640.0, 480.0);
        project.viewpoint_mut(v).position = nalgebra::Vector3::new(0.0, 0.0, -5.0);
        let good = project.add_feature("good");
        project.feature_mut(good).optimized_xyz = nalgebra::Vector3::new(0.0, 0.0, 0.0);
        let bad = project.add_feature("bad");
        project.feature_mut(bad).optimized_xyz = nalgebra::Vector3::new(0.0, 0.0, 0.0);

        let (u, v_px) = {
            let vp = project.viewpoint(v);
            let cam = scene_solver_geom::Camera {
                pose: scene_solver_geom::Pose { rotation: vp.rotation, position: vp.position },
                intrinsics: vp.intrinsics,
            };
            cam.project(nalgebra::Vector3::zeros()).unwrap()
        };
        project.add_observation(v, good, (u, v_px));
        project.add_observation(v, bad, (u + 200.0, v_px));

        let fractions = detect_outliers(&mut project, 3.0);
        assert!(fractions.contains_key(&v));
        let outlier_obs: Vec<_> = project.observations().filter(|o| o.is_outlier).collect();
        assert_eq!(outlier_obs.len(), 1);
        assert_eq!(outlier_obs[0].feature, bad);
    }

    #[test]
    fn all_cameras_excluded_detects_fatal_state() {
        let mut project = Project::new();
        let v = project.add_viewpoint("cam", 640.0, 480.0);
        assert!(!all_cameras_excluded(&project));
        project.viewpoint_mut(v).enabled_in_solve = false;
        assert!(all_cameras_excluded(&project));
    }
}
