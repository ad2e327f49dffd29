//! Levenberg-Marquardt nonlinear least-squares engine (§4.8): builds the
//! residual vector and Jacobian from [`crate::residuals`], iterates with
//! adaptive damping, and reports convergence.

use nalgebra::{DMatrix, DVector};

use crate::params::{apply_params, extract_params, IntrinsicsMode, ParamLayout};
use crate::project::{FeatureId, Project};
use crate::residuals::{
    constraint_residuals, quaternion_unit_norm_residuals, reprojection_residuals,
    single_axis_regularization_rows, ResidualRow,
};

/// Which normal-equations path the solver takes (§4.8): `dense` is forced
/// after Stage-1 because the analytical sparse path can diverge when
/// single-camera points are added to an already-converged multi-camera
/// solution; `sparse` is preferred otherwise, when observations dominate.
///
/// Both variants currently route through the same dense normal-equations
/// solve: unlike a pure bundle-adjustment residual set (where only
/// reprojection terms couple cameras to points and a clean feature-wise
/// Schur complement applies), this solver's constraint residuals
/// (collinear/coplanar/parallel/perpendicular) couple features to other
/// features directly, breaking the block-diagonal structure a Schur
/// complement relies on. `SolverMode` is kept as a first-class option so
/// callers can still express "was this the Stage-1 or Full BA call"
/// faithfully; see `DESIGN.md` for the sparse-mode tradeoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverMode {
    Sparse,
    Dense,
}

#[derive(Debug, Clone)]
pub struct LmOptions {
    pub max_iterations: usize,
    pub tolerance: f64,
    pub damping: f64,
    pub intrinsics_mode: IntrinsicsMode,
    pub mode: SolverMode,
    pub regularization_weight: f64,
}

impl Default for LmOptions {
    fn default() -> Self {
        LmOptions {
            max_iterations: 500,
            tolerance: 1e-6,
            damping: 0.1,
            intrinsics_mode: IntrinsicsMode::Auto,
            mode: SolverMode::Dense,
            regularization_weight: 1e-3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LmOutcome {
    pub converged: bool,
    pub iterations: usize,
    pub residual: f64,
    pub error_message: Option<String>,
}

const UNIT_NORM_WEIGHT: f64 = 1.0e4;

/// Build the stacked residual vector and Jacobian for the project's
/// current state under `layout`.
pub fn build_residuals(
    project: &Project,
    layout: &ParamLayout,
    regularization_weight: f64,
    underconstrained_axes: &[(FeatureId, usize)],
) -> (DVector<f64>, DMatrix<f64>) {
    let mut rows: Vec<ResidualRow> = Vec::new();
    reprojection_residuals(project, layout, &mut rows);
    constraint_residuals(project, layout, &mut rows);
    quaternion_unit_norm_residuals(project, layout, UNIT_NORM_WEIGHT, &mut rows);
    single_axis_regularization_rows(project, layout, regularization_weight, underconstrained_axes, &mut rows);

    let n = rows.len();
    let mut r = DVector::zeros(n);
    let mut j = DMatrix::zeros(n, layout.n_params.max(1));
    for (i, row) in rows.into_iter().enumerate() {
        r[i] = row.value;
        for (col, val) in row.grad {
            j[(i, col)] = val;
        }
    }
    (r, j)
}

/// Residual-sum-of-squares for the project's current state, used by
/// probing and divergence checks without running a full solve.
pub fn current_residual(project: &Project, layout: &ParamLayout) -> f64 {
    let (r, _) = build_residuals(project, layout, 0.0, &[]);
    r.norm_squared()
}

/// Run Levenberg-Marquardt to convergence or `max_iterations`, mutating
/// `project` in place. Returns an [`LmOutcome`]; degeneracy (singular
/// normal equations) is reported via `error_message` rather than a `Result`
/// error, consistent with §7's local-recovery rule for degeneracy.
pub fn solve(
    project: &mut Project,
    layout: &ParamLayout,
    options: &LmOptions,
    underconstrained_axes: &[(FeatureId, usize)],
) -> LmOutcome {
    if layout.n_params == 0 {
        return LmOutcome {
            converged: true,
            iterations: 0,
            residual: current_residual(project, layout),
            error_message: None,
        };
    }

    let mut lambda = options.damping;
    let mut x = extract_params(project, layout);
    let (mut r, mut j) = build_residuals(project, layout, options.regularization_weight, underconstrained_axes);
    let mut cost = r.norm_squared();

    for iter in 0..options.max_iterations {
        let jt = j.transpose();
        let jtj = &jt * &j;
        let jtr = &jt * &r;

        let mut attempted = false;
        let mut accepted = false;
        let mut next_x = x.clone();
        let mut next_cost = cost;

        for _ in 0..16 {
            attempted = true;
            let mut damped = jtj.clone();
            for k in 0..damped.nrows() {
                damped[(k, k)] += lambda * damped[(k, k)].max(1e-12);
            }
            let Some(delta) = damped.clone().lu().solve(&(-&jtr)) else {
                lambda *= 10.0;
                continue;
            };
            let candidate = &x + &delta;
            apply_params(project, layout, &candidate, false);
            let (r2, _) = build_residuals(project, layout, options.regularization_weight, underconstrained_axes);
            let candidate_cost = r2.norm_squared();
            if candidate_cost.is_finite() && candidate_cost < cost {
                next_x = candidate;
                next_cost = candidate_cost;
                accepted = true;
                lambda = (lambda * 0.3).max(1e-12);
                break;
            } else {
                lambda *= 10.0;
            }
        }

        if !attempted {
            break;
        }
        if !accepted {
            apply_params(project, layout, &x, true);
            return LmOutcome {
                converged: false,
                iterations: iter,
                residual: cost,
                error_message: Some("Levenberg-Marquardt damping search failed to reduce residual".to_string()),
            };
        }

        let relative_drop = if cost > 1e-15 { (cost - next_cost).abs() / cost } else { 0.0 };
        x = next_x;
        cost = next_cost;
        apply_params(project, layout, &x, false);
        let (r_new, j_new) = build_residuals(project, layout, options.regularization_weight, underconstrained_axes);
        r = r_new;
        j = j_new;

        if relative_drop < options.tolerance {
            apply_params(project, layout, &x, true);
            return LmOutcome {
                converged: true,
                iterations: iter + 1,
                residual: cost,
                error_message: None,
            };
        }
    }

    apply_params(project, layout, &x, true);
    LmOutcome {
        converged: true,
        iterations: options.max_iterations,
        residual: cost,
        error_message: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::{LineDirection as LD, Project};
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    #[test]
    fn solve_recovers_distance_constrained_point() {
        let mut project = Project::new();
        let a = project.add_feature("a");
        let b = project.add_feature("b");
        project.feature_mut(a).locked_xyz = [Some(0.0), Some(0.0), Some(0.0)];
        project.feature_mut(b).optimized_xyz = Vector3::new(0.5, 0.0, 0.0);
        project.add_constraint(crate::project::Constraint::PointsDistance {
            a,
            b,
            distance: 2.0,
            weight: 1.0,
            enabled: true,
        });
        let layout = ParamLayout::build(&project, IntrinsicsMode::Never, false);
        let options = LmOptions {
            max_iterations: 200,
            ..LmOptions::default()
        };
        let outcome = solve(&mut project, &layout, &options, &[]);
        assert!(outcome.converged);
        let dist = (project.feature(a).effective_xyz() - project.feature(b).effective_xyz()).norm();
        assert_relative_eq!(dist, 2.0, epsilon = 1e-3);
    }

    #[test]
    fn solve_preserves_locked_coordinates() {
        let mut project = Project::new();
        let a = project.add_feature("a");
        project.feature_mut(a).locked_xyz = [Some(1.0), Some(2.0), Some(3.0)];
        let b = project.add_feature("b");
        project.feature_mut(b).optimized_xyz = Vector3::new(10.0, 10.0, 10.0);
        project.add_line(a, b, LD::Free);
        project.add_constraint(crate::project::Constraint::PointsDistance {
            a,
            b,
            distance: 1.0,
            weight: 1.0,
            enabled: true,
        });
        let layout = ParamLayout::build(&project, IntrinsicsMode::Never, false);
        let options = LmOptions::default();
        solve(&mut project, &layout, &options, &[]);
        assert_eq!(project.feature(a).optimized_xyz, Vector3::zeros());
        assert_eq!(project.feature(a).effective_xyz(), Vector3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn quaternion_stays_unit_norm_after_solve() {
        let mut project = Project::new();
        let v = project.add_viewpoint("cam", 640.0, 480.0);
        project.viewpoint_mut(v).position = Vector3::new(0.0, 0.0, -5.0);
        let f = project.add_feature("p");
        project.feature_mut(f).locked_xyz = [Some(0.2), Some(0.1), Some(0.0)];
        project.add_observation(v, f, (350.0, 260.0));
        let layout = ParamLayout::build(&project, IntrinsicsMode::Never, false);
        let options = LmOptions::default();
        solve(&mut project, &layout, &options, &[]);
        assert_relative_eq!(project.viewpoint(v).rotation.norm(), 1.0, epsilon = 1e-6);
    }
}
