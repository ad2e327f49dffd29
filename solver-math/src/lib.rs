//! 3x3 linear algebra kernel and seeded PRNG shared by every stage of the
//! scene solver: vector/matrix primitives, Cramer/Gaussian solves, power
//! iteration, a from-scratch 3x3 SVD, quaternion/rotation-matrix conversion,
//! and Rodrigues' rotation.
//!
//! All routines return `None` on a singular input (determinant or norm below
//! [`linalg::SINGULARITY_EPS`]) rather than producing NaNs; callers are
//! expected to fall back to an alternative strategy.

pub mod linalg;
pub mod rng;
pub mod rotation;

pub use linalg::{
    gaussian_elimination, inverse_power_iteration, mat3_det, mat3_invert, mat3_mul,
    mat3_transpose, normalize3, null_space_3, power_iteration, solve_3x3, svd3, Svd3,
    SINGULARITY_EPS,
};
pub use rng::Prng;
pub use rotation::{matrix_to_quat, quat_to_matrix, rodrigues};
