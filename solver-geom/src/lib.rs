//! Single-view and two-view geometry: camera model, vanishing-point
//! analysis, PnP, and the essential-matrix bootstrap primitives that
//! `scene_solver_core` drives its camera-initialization orchestration with.

pub mod camera;
pub mod camera_init;
pub mod essential;
pub mod pnp;
pub mod vanishing_point;

pub use camera::{Camera, Intrinsics, Pose};
pub use camera_init::{initialize_via_essential_matrix, initialize_via_late_pnp};
pub use essential::{estimate_essential_matrix, solve_two_view, EssentialFailureReason, EssentialResult, NormalizedMatch};
pub use pnp::{solve_pnp_ransac, Correspondence, PnpFailureReason, PnpResult};
pub use vanishing_point::{
    derive_rotation_candidates, detect_vanishing_point, disambiguate_sign, estimate_focal_length,
    focal_length_from_vp_pair, rotation_candidates_from_vps, score_flip_candidate,
    solve_camera_position, vp_pair_angle_degrees, Axis, AxisFlip, ImageLine, RotationCandidate,
    ScoredObservation, VanishingPoint, EVEN_PARITY_FLIPS, MAX_VP_DISTANCE_PX, RIGHT_HANDED_BONUS,
    SIGN_DISAMBIGUATION_MAX_MEAN_ERROR_PX, SINGLE_RAY_DEFAULT_DISTANCE,
};
