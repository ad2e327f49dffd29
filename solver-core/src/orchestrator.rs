//! Top-level pipeline sequencing (§2, §4.13, §5, §6): configuration
//! validation, the candidate-tested init/solve bundle, outlier handling,
//! handedness correction, and result assembly, with a cooperative
//! single-suspension-point hand-off between phases.

use crate::candidate;
use crate::context::SolveContext;
use crate::error::{ConfigurationError, SolveError};
use crate::params::{IntrinsicsMode, ParamLayout};
use crate::project::{self, FeatureId, Project, ViewpointId};
use crate::snapshot::SolverStateSnapshot;
use crate::{align, handedness, lm, outliers, world_init};

/// Named phase boundaries the orchestrator hands off to `yield_to_ui` at
/// (§2, §5). Phases 1/2/4/5 (Camera Init, World-Point Init, Stage-1, Full
/// BA) are fused into one atomic candidate-tested solve by
/// [`candidate::run_candidate_testing`], so the suspension points this
/// orchestrator actually controls are the coarser boundaries between that
/// bundle and the phases that follow it — consistent with §5's single-
/// suspension-point cooperative model, which only requires a hand-off
/// *between* phases, not mid-phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// After candidate testing (Camera Init, World-Point Init, Stage-1,
    /// Full BA), before Outlier Handling.
    AfterInitAndSolve,
    /// After Outlier Handling, before Handedness.
    AfterOutliers,
    /// After Handedness, before Result assembly.
    AfterHandedness,
}

/// §6's options table.
pub struct OptimizeOptions {
    pub auto_initialize_cameras: bool,
    pub auto_initialize_world_points: bool,
    pub detect_outliers: bool,
    pub outlier_threshold_px: f64,
    pub tolerance: f64,
    pub max_iterations: usize,
    pub max_attempts: usize,
    pub damping: f64,
    pub optimize_camera_intrinsics: IntrinsicsMode,
    pub lock_vp_cameras: bool,
    pub force_right_handed: bool,
    /// Seeds the top-level [`SolveContext`]; candidate probes derive their
    /// own seeds from the enumeration in §4.12 regardless of this value.
    pub seed: u64,
    /// Escape hatch equivalent to §6's internal `_skip_candidate_testing`:
    /// solve the project's current state directly instead of enumerating
    /// strategies/seeds/branches/signs. Exposed for callers re-solving
    /// after a small interactive edit who already trust the existing
    /// initialization.
    pub skip_candidate_testing: bool,
    /// Cooperative single-suspension-point hand-off between phases (§5).
    /// Returning `Err` requests cancellation; the orchestrator restores
    /// the pre-solve snapshot and returns a cancellation result.
    pub yield_to_ui: Option<Box<dyn FnMut(Phase) -> Result<(), ()>>>,
}

impl Default for OptimizeOptions {
    fn default() -> Self {
        OptimizeOptions {
            auto_initialize_cameras: true,
            auto_initialize_world_points: true,
            detect_outliers: true,
            outlier_threshold_px: 3.0,
            tolerance: 1e-6,
            max_iterations: 500,
            max_attempts: 3,
            damping: 0.1,
            optimize_camera_intrinsics: IntrinsicsMode::Auto,
            lock_vp_cameras: false,
            force_right_handed: true,
            seed: 42,
            skip_candidate_testing: false,
            yield_to_ui: None,
        }
    }
}

/// A qualitative rating of the final solve, derived from the RMS
/// reprojection error (§6 `result.quality`).
#[derive(Debug, Clone, PartialEq)]
pub struct Quality {
    /// 1 (worst) to 5 (best).
    pub stars: u8,
    pub label: String,
}

fn rate_quality(rms_px: Option<f64>) -> Quality {
    let Some(rms) = rms_px else {
        return Quality { stars: 1, label: "Unreliable".to_string() };
    };
    if !rms.is_finite() {
        Quality { stars: 1, label: "Unreliable".to_string() }
    } else if rms < 0.5 {
        Quality { stars: 5, label: "Excellent".to_string() }
    } else if rms < 1.0 {
        Quality { stars: 4, label: "Good".to_string() }
    } else if rms < 3.0 {
        Quality { stars: 3, label: "Fair".to_string() }
    } else if rms < 10.0 {
        Quality { stars: 2, label: "Poor".to_string() }
    } else {
        Quality { stars: 1, label: "Unreliable".to_string() }
    }
}

/// §6's result record.
#[derive(Debug, Clone)]
pub struct OptimizeResult {
    pub converged: bool,
    pub iterations: usize,
    pub residual: f64,
    pub error: Option<String>,
    pub cameras_initialized: Vec<ViewpointId>,
    pub cameras_excluded: Vec<ViewpointId>,
    pub outliers: Vec<project::ObservationId>,
    pub rms_reprojection_px: Option<f64>,
    pub median_reprojection_px: Option<f64>,
    pub solve_time_ms: f64,
    pub quality: Quality,
}

impl OptimizeResult {
    fn fatal(error: impl Into<String>, started: std::time::Instant) -> Self {
        OptimizeResult {
            converged: false,
            iterations: 0,
            residual: f64::INFINITY,
            error: Some(error.into()),
            cameras_initialized: Vec::new(),
            cameras_excluded: Vec::new(),
            outliers: Vec::new(),
            rms_reprojection_px: None,
            median_reprojection_px: None,
            solve_time_ms: started.elapsed().as_secs_f64() * 1000.0,
            quality: rate_quality(None),
        }
    }
}

/// Fail-fast configuration checks (§7): run before any mutation.
fn validate_configuration(project: &Project) -> Result<(), ConfigurationError> {
    if project.viewpoint_ids().is_empty() {
        return Err(ConfigurationError::NoViewpoints);
    }
    if project.feature_ids().is_empty() {
        return Err(ConfigurationError::NoFeatures);
    }

    let fully_locked: Vec<FeatureId> = project
        .feature_ids()
        .into_iter()
        .filter(|&id| project.feature(id).locked_xyz.iter().all(|c| c.is_some()))
        .collect();
    if fully_locked.is_empty() {
        return Err(ConfigurationError::NoLockedPoints);
    }

    let has_target_length = project.lines().any(|l| l.target_length.is_some());
    if !has_target_length && fully_locked.len() < 2 {
        return Err(ConfigurationError::NoScaleConstraint);
    }

    Ok(())
}

/// Per-observation reprojection error for every enabled, non-outlier
/// observation in the final solved state, used for the `rms`/`median`
/// summary stats in the result (§6).
fn reprojection_error_stats(project: &Project) -> (Option<f64>, Option<f64>) {
    let mut errors: Vec<f64> = project
        .observations()
        .filter(|o| !o.is_outlier && project.viewpoint(o.viewpoint).enabled_in_solve)
        .filter_map(|o| {
            let vp = project.viewpoint(o.viewpoint);
            let cam = scene_solver_geom::Camera {
                pose: scene_solver_geom::Pose { rotation: vp.rotation, position: vp.position },
                intrinsics: vp.intrinsics,
            };
            cam.reprojection_error(project.feature(o.feature).effective_xyz(), o.pixel)
        })
        .collect();
    if errors.is_empty() {
        return (None, None);
    }
    let rms = (errors.iter().map(|e| e * e).sum::<f64>() / errors.len() as f64).sqrt();
    errors.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let median = errors[errors.len() / 2];
    (Some(rms), Some(median))
}

/// Best-effort (origin, +X, +Z) anchor triple for the handedness
/// corrector's step 2 (§4.10): a feature locked at the origin, one locked
/// purely along +X, and one locked purely along +Z. Returns `None` when no
/// such triple is identifiable, matching §4.10's silence on that case.
fn find_anchor_triple(project: &Project) -> Option<(FeatureId, FeatureId, FeatureId)> {
    let is_origin = |f: &project::Feature| f.locked_xyz.iter().all(|c| matches!(c, Some(v) if v.abs() < 1e-9));
    let is_plus_axis = |f: &project::Feature, axis: usize| {
        f.locked_xyz[axis].map(|v| v > 1e-9).unwrap_or(false)
            && (0..3).filter(|&a| a != axis).all(|a| matches!(f.locked_xyz[a], Some(v) if v.abs() < 1e-9))
    };

    let origin = project.features().find(|f| is_origin(f))?.id;
    let plus_x = project.features().find(|f| is_plus_axis(f, project::AXIS_X))?.id;
    let plus_z = project.features().find(|f| is_plus_axis(f, project::AXIS_Z))?.id;
    Some((origin, plus_x, plus_z))
}

/// Run the full optimization pipeline over `project`, mutating it in place
/// (§6). Phases 1-8 run in strict order (§2, §5); configuration errors and
/// cancellation are the only faults that propagate as `Err`, everything
/// else (degeneracy, divergence, all-cameras-excluded) is reported inside
/// the returned [`OptimizeResult`] (§7).
pub fn optimize_project(project: &mut Project, options: OptimizeOptions) -> Result<OptimizeResult, SolveError> {
    let started = std::time::Instant::now();
    let mut yield_to_ui = options.yield_to_ui;

    validate_configuration(project).map_err(SolveError::Configuration)?;

    let entry_snapshot = SolverStateSnapshot::capture(project);
    project.reset_outlier_flags();
    let mut ctx = SolveContext::new(options.seed);

    // Phases 1 (Camera Init), 2 (World-Point Init), 3 (Late PnP, folded
    // into camera_init's second pass), 4 (Stage-1), 5 (Full BA): the
    // candidate-testing driver (§4.12) wraps all of them, enumerating
    // strategy/seed/branch/sign combinations when more than one is
    // plausible and running the winner once more at full budget.
    let candidate_options = candidate::CandidateOptions {
        skip_candidate_testing: options.skip_candidate_testing,
        max_iterations: options.max_iterations,
        tolerance: options.tolerance,
        damping: options.damping,
        intrinsics_mode: options.optimize_camera_intrinsics,
        max_attempts: options.max_attempts,
        auto_initialize_cameras: options.auto_initialize_cameras,
        auto_initialize_world_points: options.auto_initialize_world_points,
        lock_vp_cameras: options.lock_vp_cameras,
    };
    let (solved, candidate_result) = candidate::run_candidate_testing(project, &mut ctx, &candidate_options);
    *project = solved;

    let cameras_initialized: Vec<ViewpointId> = candidate_result.camera_report.initialized.iter().map(|&(id, _)| id).collect();
    let late_pnp_cameras = candidate_result.camera_report.late_pnp_cameras.clone();

    if let Some(cb) = yield_to_ui.as_mut() {
        if cb(Phase::AfterInitAndSolve).is_err() {
            entry_snapshot.restore(project);
            ctx.log.push("[Solve] cancelled by yield_to_ui after init/solve phase".to_string());
            return Err(SolveError::Cancelled);
        }
    }

    // Phase 6: Outlier Handling (§4.9).
    let mut cameras_excluded: Vec<ViewpointId> = Vec::new();
    if options.detect_outliers {
        let fractions = outliers::detect_outliers(project, options.outlier_threshold_px);
        let excluded = outliers::exclude_fully_outlier_late_pnp_cameras(project, &mut ctx, &fractions, &late_pnp_cameras);
        if !excluded.is_empty() {
            cameras_excluded.extend(excluded);

            if outliers::all_cameras_excluded(project) {
                ctx.log.push("[Outliers] every camera excluded, fatal".to_string());
                entry_snapshot.restore(project);
                let mut result = OptimizeResult::fatal("all cameras excluded from the solve", started);
                result.cameras_excluded = cameras_excluded;
                result.iterations = candidate_result.iterations;
                return Ok(result);
            }

            outliers::reset_unconstrained_features(project);
            world_init::initialize_world_points(project, &mut ctx);
            align::align_scene(project, &mut ctx.rng);

            let has_ambiguity = false;
            let layout = ParamLayout::build(project, options.optimize_camera_intrinsics, has_ambiguity);
            let lm_options = lm::LmOptions {
                max_iterations: options.max_iterations,
                tolerance: options.tolerance,
                damping: options.damping,
                intrinsics_mode: options.optimize_camera_intrinsics,
                mode: lm::SolverMode::Dense,
                ..lm::LmOptions::default()
            };
            let outcome = lm::solve(project, &layout, &lm_options, &[]);
            ctx.log.push(format!(
                "[Outliers] re-solved after exclusion, residual={:.4} converged={}",
                outcome.residual, outcome.converged
            ));
            outliers::detect_outliers(project, options.outlier_threshold_px);
        }
    }

    if let Some(cb) = yield_to_ui.as_mut() {
        if cb(Phase::AfterOutliers).is_err() {
            entry_snapshot.restore(project);
            ctx.log.push("[Solve] cancelled by yield_to_ui after outlier handling".to_string());
            return Err(SolveError::Cancelled);
        }
    }

    // Phase 7: Handedness (§4.10).
    if options.force_right_handed {
        let anchor_triple = find_anchor_triple(project);
        handedness::correct_handedness(project, &mut ctx, anchor_triple);
    }

    if let Some(cb) = yield_to_ui.as_mut() {
        if cb(Phase::AfterHandedness).is_err() {
            entry_snapshot.restore(project);
            ctx.log.push("[Solve] cancelled by yield_to_ui after handedness".to_string());
            return Err(SolveError::Cancelled);
        }
    }

    // Phase 8: Result (§2, §6).
    let outlier_ids: Vec<project::ObservationId> = project.observations().filter(|o| o.is_outlier).map(|o| o.id).collect();
    let (rms, median) = reprojection_error_stats(project);
    let quality = rate_quality(rms);

    ctx.log.push(format!(
        "[Summary] residual={:.4} converged={} cameras_initialized={} cameras_excluded={} outliers={}",
        candidate_result.residual,
        candidate_result.residual.is_finite(),
        cameras_initialized.len(),
        cameras_excluded.len(),
        outlier_ids.len()
    ));

    Ok(OptimizeResult {
        converged: candidate_result.residual.is_finite(),
        iterations: candidate_result.iterations,
        residual: candidate_result.residual,
        error: None,
        cameras_initialized,
        cameras_excluded,
        outliers: outlier_ids,
        rms_reprojection_px: rms,
        median_reprojection_px: median,
        solve_time_ms: started.elapsed().as_secs_f64() * 1000.0,
        quality,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::{Constraint, LineDirection as LD};
    use nalgebra::Vector3;

    fn pinhole_pixel(cam_z: f64, point: Vector3<f64>, f: f64, cx: f64, cy: f64) -> (f64, f64) {
        let dz = point.z - cam_z;
        (cx + f * (point.x) / dz, cy - f * (point.y) / dz)
    }

    /// S1 (§8): three locked points, two cameras, no vanishing points.
    /// Expect both cameras to initialize via PnP/essential fallback and the
    /// solve to converge with locked coordinates preserved.
    #[test]
    fn s1_three_locked_points_two_cameras_converges() {
        let mut project = Project::new();
        let o = project.add_feature("O");
        project.feature_mut(o).locked_xyz = [Some(0.0), Some(0.0), Some(0.0)];
        let x = project.add_feature("X");
        project.feature_mut(x).locked_xyz = [Some(1.0), Some(0.0), Some(0.0)];
        let y = project.add_feature("Y");
        project.feature_mut(y).locked_xyz = [Some(0.0), Some(1.0), Some(0.0)];

        let f = 800.0;
        let (cx, cy) = (320.0, 240.0);
        for (name, cam_pos) in [("cam1", Vector3::new(0.5, 0.5, -5.0)), ("cam2", Vector3::new(-0.5, 0.3, -6.0))] {
            let v = project.add_viewpoint(name, 640.0, 480.0);
            project.viewpoint_mut(v).position = cam_pos;
            project.viewpoint_mut(v).intrinsics = scene_solver_geom::Intrinsics::new_default(f, cx, cy);
            for fid in [o, x, y] {
                let world = project.feature(fid).effective_xyz();
                let pixel = (
                    cx + f * (world.x - cam_pos.x) / (world.z - cam_pos.z),
                    cy + f * (world.y - cam_pos.y) / (world.z - cam_pos.z),
                );
                project.add_observation(v, fid, pixel);
            }
        }

        let options = OptimizeOptions {
            max_iterations: 300,
            ..OptimizeOptions::default()
        };
        let result = optimize_project(&mut project, options).expect("s1 should not error");
        assert!(result.residual < 1e-2, "residual={}", result.residual);
        assert!((project.feature(o).optimized_xyz).norm() < 1e-3);
        assert!((project.feature(x).optimized_xyz - Vector3::new(1.0, 0.0, 0.0)).norm() < 1e-2);
    }

    #[test]
    fn missing_locked_points_is_a_configuration_error() {
        let mut project = Project::new();
        project.add_viewpoint("cam", 640.0, 480.0);
        project.add_feature("free");
        let err = optimize_project(&mut project, OptimizeOptions::default()).unwrap_err();
        assert!(matches!(err, SolveError::Configuration(ConfigurationError::NoLockedPoints)));
    }

    #[test]
    fn no_viewpoints_is_a_configuration_error() {
        let mut project = Project::new();
        project.add_feature("free");
        let err = optimize_project(&mut project, OptimizeOptions::default()).unwrap_err();
        assert!(matches!(err, SolveError::Configuration(ConfigurationError::NoViewpoints)));
    }

    #[test]
    fn cancellation_restores_entry_snapshot() {
        let mut project = Project::new();
        let o = project.add_feature("O");
        project.feature_mut(o).locked_xyz = [Some(0.0), Some(0.0), Some(0.0)];
        let x = project.add_feature("X");
        project.feature_mut(x).locked_xyz = [Some(1.0), Some(0.0), Some(0.0)];
        let v = project.add_viewpoint("cam", 640.0, 480.0);
        project.viewpoint_mut(v).position = Vector3::new(0.0, 0.0, -5.0);
        project.add_observation(v, o, (320.0, 240.0));
        project.add_observation(v, x, (380.0, 240.0));

        let before = project.feature(x).optimized_xyz;
        let options = OptimizeOptions {
            yield_to_ui: Some(Box::new(|_phase| Err(()))),
            ..OptimizeOptions::default()
        };
        let err = optimize_project(&mut project, options).unwrap_err();
        assert!(matches!(err, SolveError::Cancelled));
        assert_eq!(project.feature(x).optimized_xyz, before);
    }

    #[test]
    fn constraint_weighted_distance_is_satisfied_after_solve() {
        let mut project = Project::new();
        let o = project.add_feature("O");
        project.feature_mut(o).locked_xyz = [Some(0.0), Some(0.0), Some(0.0)];
        let x = project.add_feature("X");
        project.feature_mut(x).locked_xyz = [None, Some(0.0), Some(0.0)];
        project.feature_mut(x).optimized_xyz = Vector3::new(0.5, 0.0, 0.0);
        project.add_line(o, x, LD::Free);
        project.add_constraint(Constraint::PointsDistance { a: o, b: x, distance: 2.0, weight: 1.0, enabled: true });

        let y = project.add_feature("Y");
        project.feature_mut(y).locked_xyz = [Some(0.0), Some(1.0), Some(0.0)];

        let v = project.add_viewpoint("cam", 640.0, 480.0);
        project.viewpoint_mut(v).position = Vector3::new(0.3, 0.3, -5.0);
        let f = 800.0;
        let (cx, cy) = (320.0, 240.0);
        project.viewpoint_mut(v).intrinsics = scene_solver_geom::Intrinsics::new_default(f, cx, cy);
        for fid in [o, y] {
            let world = project.feature(fid).effective_xyz();
            let cam_pos = project.viewpoint(v).position;
            let pixel = pinhole_pixel(cam_pos.z, world, f, cx, cy);
            project.add_observation(v, fid, pixel);
        }

        let options = OptimizeOptions {
            auto_initialize_cameras: false,
            max_iterations: 300,
            ..OptimizeOptions::default()
        };
        project.viewpoint_mut(v).is_initialized = true;
        let result = optimize_project(&mut project, options).expect("should not error");
        let dist = (project.feature(o).effective_xyz() - project.feature(x).effective_xyz()).norm();
        assert!((dist - 2.0).abs() < 1e-2, "dist={} residual={}", dist, result.residual);
    }
}
