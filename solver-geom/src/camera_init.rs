//! Camera-initialization primitives used by the live orchestration in
//! `scene-solver-core`, per §4.5 (`essential_matrix` and `late_pnp_only`).

use scene_solver_math::Prng;

use crate::camera::{Camera, Intrinsics, Pose};
use crate::essential::{self, NormalizedMatch};
use crate::pnp::{self, Correspondence, PnpResult};

/// `essential_matrix` strategy: bootstrap the relative pose between two
/// cameras from normalized point matches, anchoring camera `a` at the
/// origin with identity rotation.
pub fn initialize_via_essential_matrix(
    intr_a: &Intrinsics,
    intr_b: &Intrinsics,
    matches: &[NormalizedMatch],
    rng: &mut Prng,
) -> Option<(Camera, Camera, String)> {
    let result = essential::solve_two_view(matches, intr_a, intr_b, rng);
    if !result.success {
        return None;
    }
    let relative = result.relative_pose?;
    let cam_a = Camera {
        pose: Pose::identity_at_origin(),
        intrinsics: *intr_a,
    };
    let cam_b = Camera {
        pose: relative,
        intrinsics: *intr_b,
    };
    let note = "essential-matrix pose has only arbitrary translation scale; scene alignment must supply the true scale".to_string();
    Some((cam_a, cam_b, note))
}

/// `late_pnp_only` strategy: solve a single camera's pose against
/// already-triangulated world points via PnP.
pub fn initialize_via_late_pnp(
    correspondences: &[Correspondence],
    intr: &Intrinsics,
    rng: &mut Prng,
) -> PnpResult {
    pnp::solve_pnp_ransac(correspondences, intr, rng)
}
