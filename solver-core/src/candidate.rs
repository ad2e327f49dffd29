//! Candidate-testing driver (§4.12): enumerates camera-initialization
//! seed, world-point inference-branch, and global-sign combinations,
//! probes each cheaply, and commits the best one at full solve budget.
//!
//! A "candidate" is one combination of:
//! - an RNG seed fed to the probabilistic bootstrap steps (VP detection's
//!   null-space solve, essential-matrix RANSAC, PnP RANSAC),
//! - a branch assignment for every axis-constrained line left ambiguous by
//!   [`crate::world_init::propagate_axis_constraints`] (which endpoint is
//!   the positive one),
//! - whether the whole scene is reflected through the origin before
//!   alignment, covering the residual global point-reflection ambiguity
//!   that remains before handedness correction locks the final sign.

use std::collections::HashSet;

use crate::camera_init::initialize_cameras;
use crate::context::SolveContext;
use crate::lm::{solve as lm_solve, LmOptions, SolverMode};
use crate::params::{IntrinsicsMode, ParamLayout};
use crate::project::{FeatureId, Project};
use crate::snapshot::SolverStateSnapshot;
use crate::world_init::{initialize_world_points, propagate_axis_constraints, BranchChoice};
use crate::align::align_scene;

/// Fraction of a probe's iteration budget spent on the Stage-1
/// multi-camera-only solve before Full BA frees the remaining
/// single-camera back-projected points (§2, §4.11). A fixed third leaves
/// Full BA the majority of the budget, since it is the pass that has to
/// re-settle every point, not just the ones Stage-1 already moved.
const STAGE1_BUDGET_FRACTION: f64 = 1.0 / 3.0;
const MIN_STAGE_ITERATIONS: usize = 10;

/// Features resolved only by a single camera's back-projection (§4.6 step
/// 3): not fully constrained by locks/inference, and observed by exactly
/// one camera that is itself initialized. Stage-1 holds these fixed so the
/// multi-camera solve can't be dragged around by a weaker single-view
/// estimate; Full BA frees them afterward (§2's phase list).
fn single_camera_only_features(project: &Project) -> HashSet<FeatureId> {
    project
        .feature_ids()
        .into_iter()
        .filter(|&fid| {
            let feat = project.feature(fid);
            if feat.is_fully_constrained() {
                return false;
            }
            let initialized_observers = feat
                .observations
                .iter()
                .filter(|&&oid| project.viewpoint(project.observation(oid).viewpoint).is_initialized)
                .count();
            initialized_observers == 1
        })
        .collect()
}

/// Residual (sum of squared residuals) at or below which a probe is
/// accepted immediately, short-circuiting the rest of the candidate scan
/// (§4.12).
pub const GOOD_ENOUGH_THRESHOLD: f64 = 10.0;

/// A tighter threshold used to stop enumerating branches for a single
/// seed/sign pair once one branch already looks solved (§4.12).
pub const BRANCH_GOOD_ENOUGH_THRESHOLD: f64 = 2.0;

const TIER_1_MAX_ITERATIONS: usize = 50;
const TIER_1_KEEP: usize = 8;
const TIER_2_MAX_ITERATIONS: usize = 200;
/// Below this many total candidates, skip the two-tier split and probe
/// every candidate directly at the tier-2 budget (§4.12).
const SINGLE_TIER_CANDIDATE_LIMIT: usize = 24;

const VP_SEEDS: [u64; 1] = [42];
const ESSENTIAL_MATRIX_BASE_SEEDS: [u64; 2] = [42, 12345];
const ESSENTIAL_MATRIX_EXTRA_SEED_BASE: u64 = 98765;

/// `max_attempts` seeds for the essential-matrix bootstrap (§4.12, §6):
/// the first two are fixed (`42`, `12345`), and any attempt beyond that
/// uses `98765 + attempt`.
fn essential_matrix_seeds(max_attempts: usize) -> Vec<u64> {
    let mut seeds: Vec<u64> = ESSENTIAL_MATRIX_BASE_SEEDS
        .iter()
        .copied()
        .take(max_attempts.max(1))
        .collect();
    for attempt in seeds.len()..max_attempts {
        seeds.push(ESSENTIAL_MATRIX_EXTRA_SEED_BASE + attempt as u64);
    }
    seeds
}

/// One fully-specified candidate: a seed, a branch assignment for every
/// ambiguous line, and whether the scene is globally reflected.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub seed: u64,
    pub branches: Vec<BranchChoice>,
    pub reflect: bool,
}

#[derive(Debug, Clone)]
pub struct CandidateResult {
    pub candidate: Candidate,
    pub residual: f64,
    pub iterations: usize,
    pub camera_report: crate::camera_init::CameraInitReport,
}

#[derive(Debug, Clone)]
pub struct CandidateOptions {
    /// Skip enumeration entirely and solve once with the project's current
    /// state (§6 `_skip_candidate_testing`, an escape hatch for callers
    /// that already trust their initial guess, e.g. re-solving after a
    /// small interactive edit).
    pub skip_candidate_testing: bool,
    pub max_iterations: usize,
    pub tolerance: f64,
    pub damping: f64,
    pub intrinsics_mode: IntrinsicsMode,
    /// `max_attempts` from §6: number of seeds tried for strategies with a
    /// probabilistic bootstrap (essential-matrix RANSAC). VP-based seeding
    /// is always deterministic and ignores this (§4.12).
    pub max_attempts: usize,
    /// Phase 1 (§2): run camera initialization inside every probe. Disabled
    /// when the caller already supplied initialized cameras and only wants
    /// world points (re-)solved, e.g. a small interactive re-solve.
    pub auto_initialize_cameras: bool,
    /// Phase 2 (§2): run world-point initialization and scene alignment
    /// inside every probe.
    pub auto_initialize_world_points: bool,
    /// Pose-lock VP-initialized cameras during the Full BA sub-stage
    /// (§6 `lock_vp_cameras`).
    pub lock_vp_cameras: bool,
}

impl Default for CandidateOptions {
    fn default() -> Self {
        CandidateOptions {
            skip_candidate_testing: false,
            max_iterations: 500,
            tolerance: 1e-6,
            damping: 0.1,
            intrinsics_mode: IntrinsicsMode::Auto,
            max_attempts: 3,
            auto_initialize_cameras: true,
            auto_initialize_world_points: true,
            lock_vp_cameras: false,
        }
    }
}

/// Enumerate every branch assignment for the lines `propagate_axis_constraints`
/// reports as ambiguous, each line independently toggled. Capped the same
/// way the rest of this driver caps combinatorial blowup: beyond
/// `SINGLE_TIER_CANDIDATE_LIMIT` ambiguous lines this would be absurd
/// (2^24 branches), so only the first handful of lines are branched and the
/// rest default to `positive_endpoint_is_a: true`.
fn enumerate_branches(ambiguous: &[(usize, (crate::project::FeatureId, crate::project::FeatureId, usize))]) -> Vec<Vec<BranchChoice>> {
    const MAX_BRANCHED_LINES: usize = 4;
    if ambiguous.is_empty() {
        return vec![Vec::new()];
    }
    let branched = &ambiguous[..ambiguous.len().min(MAX_BRANCHED_LINES)];
    let defaulted = &ambiguous[ambiguous.len().min(MAX_BRANCHED_LINES)..];

    let mut combos: Vec<Vec<BranchChoice>> = vec![Vec::new()];
    for &(idx, _) in branched {
        let mut next = Vec::with_capacity(combos.len() * 2);
        for combo in &combos {
            for positive_endpoint_is_a in [true, false] {
                let mut c = combo.clone();
                c.push(BranchChoice { line_index: idx, positive_endpoint_is_a });
                next.push(c);
            }
        }
        combos = next;
    }
    for combo in &mut combos {
        for &(idx, _) in defaulted {
            combo.push(BranchChoice { line_index: idx, positive_endpoint_is_a: true });
        }
    }
    combos
}

fn build_candidates(project: &Project, seeds: &[u64]) -> Vec<Candidate> {
    let mut probe_project = project.clone();
    let ambiguous = propagate_axis_constraints(&mut probe_project, &[]);
    let branch_combos = enumerate_branches(&ambiguous);

    let mut candidates = Vec::new();
    for &seed in seeds {
        for branches in &branch_combos {
            for reflect in [false, true] {
                candidates.push(Candidate { seed, branches: branches.clone(), reflect });
            }
        }
    }
    candidates
}

fn reflect_scene(project: &mut Project) {
    for fid in project.feature_ids() {
        let f = project.feature_mut(fid);
        f.optimized_xyz = -f.optimized_xyz;
    }
    for vid in project.viewpoint_ids() {
        let vp = project.viewpoint_mut(vid);
        vp.position = -vp.position;
    }
}

/// Run one candidate to completion at `max_iterations` on a scratch copy of
/// `project` and return its residual and the solve log generated against
/// this candidate's own seeded [`SolveContext`], without mutating
/// `project`. Runs the full pipeline per §4.12: camera init, world-point
/// init + alignment, a Stage-1 multi-camera-only solve, then Full BA with
/// single-camera points freed, restoring to the Stage-1 state if Full BA
/// diverges (§4.11).
fn probe(
    project: &Project,
    candidate: &Candidate,
    max_iterations: usize,
    options: &CandidateOptions,
) -> (Project, f64, usize, Vec<String>, crate::camera_init::CameraInitReport) {
    let mut probe_project = project.clone();
    let mut ctx = SolveContext::new(candidate.seed);

    if candidate.reflect {
        reflect_scene(&mut probe_project);
    }
    let mut camera_report = if options.auto_initialize_cameras {
        initialize_cameras(&mut probe_project, &mut ctx)
    } else {
        crate::camera_init::CameraInitReport::default()
    };
    propagate_axis_constraints(&mut probe_project, &candidate.branches);
    if options.auto_initialize_world_points {
        initialize_world_points(&mut probe_project, &mut ctx);
        align_scene(&mut probe_project, &mut ctx.rng);
        crate::camera_init::revert_stepped_vp_cameras(&mut probe_project, &mut ctx, &mut camera_report);
    }

    let has_axis_ambiguity = !candidate.branches.is_empty();
    let deferred = single_camera_only_features(&probe_project);

    let stage1_iterations = ((max_iterations as f64 * STAGE1_BUDGET_FRACTION) as usize)
        .max(MIN_STAGE_ITERATIONS)
        .min(max_iterations);
    let full_iterations = max_iterations.saturating_sub(stage1_iterations).max(MIN_STAGE_ITERATIONS);

    let stage1_layout = ParamLayout::build_excluding(&probe_project, options.intrinsics_mode, has_axis_ambiguity, &deferred);
    let stage1_options = LmOptions {
        max_iterations: stage1_iterations,
        tolerance: options.tolerance,
        damping: options.damping,
        intrinsics_mode: options.intrinsics_mode,
        mode: SolverMode::Sparse,
        ..LmOptions::default()
    };
    let stage1_outcome = lm_solve(&mut probe_project, &stage1_layout, &stage1_options, &[]);
    ctx.log.push(format!(
        "[Stage1] residual={:.4} iterations={} converged={}",
        stage1_outcome.residual, stage1_outcome.iterations, stage1_outcome.converged
    ));

    let post_stage1 = SolverStateSnapshot::capture(&probe_project);

    if options.lock_vp_cameras {
        for vid in probe_project.viewpoint_ids() {
            if probe_project.viewpoint(vid).initialized_via_vp {
                probe_project.viewpoint_mut(vid).is_pose_locked = true;
            }
        }
    }

    let full_layout = ParamLayout::build(&probe_project, options.intrinsics_mode, has_axis_ambiguity);
    let full_options = LmOptions {
        max_iterations: full_iterations,
        tolerance: options.tolerance,
        damping: options.damping,
        intrinsics_mode: options.intrinsics_mode,
        mode: SolverMode::Dense,
        ..LmOptions::default()
    };
    let full_outcome = lm_solve(&mut probe_project, &full_layout, &full_options, &[]);

    let (final_residual, iterations) = if stage1_outcome.residual > 0.0 && full_outcome.residual > 10.0 * stage1_outcome.residual {
        post_stage1.restore(&mut probe_project);
        ctx.log.push(format!(
            "[Solve] full BA diverged (residual={:.4} > 10x stage-1 residual={:.4}); restored stage-1 state",
            full_outcome.residual, stage1_outcome.residual
        ));
        (stage1_outcome.residual, stage1_outcome.iterations)
    } else {
        ctx.log.push(format!(
            "[Solve] full BA residual={:.4} iterations={} converged={}",
            full_outcome.residual, full_outcome.iterations, full_outcome.converged
        ));
        (full_outcome.residual, full_outcome.iterations)
    };

    (probe_project, final_residual, iterations, ctx.log.lines().to_vec(), camera_report)
}

/// Run the candidate-testing driver and return the winning, fully-solved
/// project state plus which candidate produced it.
pub fn run_candidate_testing(project: &Project, ctx: &mut SolveContext, options: &CandidateOptions) -> (Project, CandidateResult) {
    if options.skip_candidate_testing {
        let (solved, residual, iterations, log, camera_report) = probe(
            project,
            &Candidate { seed: ctx.rng.seed(), branches: Vec::new(), reflect: false },
            options.max_iterations,
            options,
        );
        for line in log {
            ctx.log.push(line);
        }
        ctx.log.push("[Candidates] skipped candidate testing, solved current state directly".to_string());
        return (
            solved,
            CandidateResult {
                candidate: Candidate { seed: ctx.rng.seed(), branches: Vec::new(), reflect: false },
                residual,
                iterations,
                camera_report,
            },
        );
    }

    let has_essential_pairs = project.viewpoints().filter(|v| !v.is_initialized).count() >= 2;
    let seeds: Vec<u64> = if has_essential_pairs {
        essential_matrix_seeds(options.max_attempts)
    } else {
        VP_SEEDS.to_vec()
    };

    let candidates = build_candidates(project, &seeds);
    ctx.log.push(format!("[Candidates] enumerated {} candidates", candidates.len()));

    let single_tier = candidates.len() <= SINGLE_TIER_CANDIDATE_LIMIT;
    let tier1_budget = if single_tier { TIER_2_MAX_ITERATIONS } else { TIER_1_MAX_ITERATIONS };

    let mut scored: Vec<(Candidate, Project, f64)> = Vec::new();
    let mut found_good_enough = false;
    for candidate in &candidates {
        let (solved, residual, _iterations, _log, _report) = probe(project, candidate, tier1_budget, options);
        let good_enough = residual <= GOOD_ENOUGH_THRESHOLD;
        scored.push((candidate.clone(), solved, residual));
        if good_enough {
            found_good_enough = true;
            break;
        }
    }

    scored.sort_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal));

    let winner = if single_tier || found_good_enough {
        scored.into_iter().next().expect("at least one candidate is always probed")
    } else {
        let mut finalists = scored;
        finalists.truncate(TIER_1_KEEP);
        ctx.log.push(format!("[Candidates] tier 1 kept {} finalists for tier 2", finalists.len()));
        let mut tier2: Vec<(Candidate, Project, f64)> = finalists
            .into_iter()
            .map(|(candidate, _, _)| {
                let (solved, residual, _iterations, _log, _report) = probe(project, &candidate, TIER_2_MAX_ITERATIONS, options);
                (candidate, solved, residual)
            })
            .collect();
        tier2.sort_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal));
        tier2.into_iter().next().expect("tier 1 always keeps at least one finalist")
    };

    let (winning_candidate, _winning_probe_state, winning_probe_residual) = winner;
    ctx.log.push(format!(
        "[Candidates] winner seed={} reflect={} probe_residual={:.4}, re-solving at full budget",
        winning_candidate.seed, winning_candidate.reflect, winning_probe_residual
    ));

    let (final_project, final_residual, final_iterations, final_log, camera_report) =
        probe(project, &winning_candidate, options.max_iterations, options);
    for line in final_log {
        ctx.log.push(line);
    }
    (
        final_project,
        CandidateResult {
            candidate: winning_candidate,
            residual: final_residual,
            iterations: final_iterations,
            camera_report,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::{LineDirection as LD, Project};
    use nalgebra::Vector3;

    #[test]
    fn skip_candidate_testing_solves_once_without_enumeration() {
        let mut project = Project::new();
        let a = project.add_feature("a");
        let b = project.add_feature("b");
        project.feature_mut(a).locked_xyz = [Some(0.0), Some(0.0), Some(0.0)];
        project.feature_mut(b).optimized_xyz = Vector3::new(0.5, 0.0, 0.0);
        project.add_constraint(crate::project::Constraint::PointsDistance {
            a,
            b,
            distance: 1.0,
            weight: 1.0,
            enabled: true,
        });
        let mut ctx = SolveContext::new(1);
        let options = CandidateOptions {
            skip_candidate_testing: true,
            ..CandidateOptions::default()
        };
        let (solved, result) = run_candidate_testing(&project, &mut ctx, &options);
        assert!(result.residual < 1.0);
        let dist = (solved.feature(a).effective_xyz() - solved.feature(b).effective_xyz()).norm();
        assert!((dist - 1.0).abs() < 1e-2);
    }

    #[test]
    fn candidate_enumeration_tries_both_branches_of_an_ambiguous_line() {
        let mut project = Project::new();
        let a = project.add_feature("a");
        let b = project.add_feature("b");
        project.feature_mut(a).locked_xyz = [None, Some(0.0), Some(0.0)];
        project.feature_mut(b).locked_xyz = [None, Some(0.0), Some(0.0)];
        project.add_line(a, b, LD::X);
        let mut ctx = SolveContext::new(7);
        let options = CandidateOptions::default();
        let (_solved, result) = run_candidate_testing(&project, &mut ctx, &options);
        assert!(result.residual.is_finite());
    }
}
