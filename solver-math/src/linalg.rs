use nalgebra::{DMatrix, DVector, Matrix3, Vector3};

use crate::Prng;

/// Singularity threshold shared by every routine in this module. Below this,
/// a determinant or a vector norm is treated as exactly zero.
pub const SINGULARITY_EPS: f64 = 1e-10;

/// Normalize `v`, returning `None` if its norm is below [`SINGULARITY_EPS`].
pub fn normalize3(v: Vector3<f64>) -> Option<Vector3<f64>> {
    let n = v.norm();
    if n < SINGULARITY_EPS {
        None
    } else {
        Some(v / n)
    }
}

/// 3x3 matrix multiply, spelled out for callers that want to avoid pulling in
/// nalgebra's generic `Mul` machinery at call sites that are already verbose.
pub fn mat3_mul(a: &Matrix3<f64>, b: &Matrix3<f64>) -> Matrix3<f64> {
    a * b
}

pub fn mat3_transpose(a: &Matrix3<f64>) -> Matrix3<f64> {
    a.transpose()
}

pub fn mat3_det(a: &Matrix3<f64>) -> f64 {
    a.determinant()
}

/// Invert a 3x3 matrix, returning `None` when the determinant is singular.
pub fn mat3_invert(a: &Matrix3<f64>) -> Option<Matrix3<f64>> {
    let det = a.determinant();
    if det.abs() < SINGULARITY_EPS {
        return None;
    }
    a.try_inverse()
}

/// Solve `A x = b` for a 3x3 system via Cramer's rule.
///
/// Used throughout the solver wherever an explicit, non-iterative 3x3 solve
/// is cheaper and clearer than a general factorization (e.g. camera-position
/// back-projection, §4.2).
pub fn solve_3x3(a: &Matrix3<f64>, b: &Vector3<f64>) -> Option<Vector3<f64>> {
    let det = a.determinant();
    if det.abs() < SINGULARITY_EPS {
        return None;
    }
    let mut ax = *a;
    ax.set_column(0, b);
    let mut ay = *a;
    ay.set_column(1, b);
    let mut az = *a;
    az.set_column(2, b);
    Some(Vector3::new(
        ax.determinant() / det,
        ay.determinant() / det,
        az.determinant() / det,
    ))
}

/// General Gaussian elimination with partial pivoting for `A x = b`.
///
/// Used for the world-point linear-triangulation DLT system (§4.6) and
/// anywhere the system size is not known at compile time.
pub fn gaussian_elimination(a: &DMatrix<f64>, b: &DVector<f64>) -> Option<DVector<f64>> {
    let n = a.nrows();
    if a.ncols() != n || b.nrows() != n {
        return None;
    }
    let mut m = a.clone();
    let mut rhs = b.clone();

    for col in 0..n {
        // Partial pivot: find the largest-magnitude entry in this column at
        // or below the diagonal.
        let mut pivot_row = col;
        let mut pivot_val = m[(col, col)].abs();
        for row in (col + 1)..n {
            let v = m[(row, col)].abs();
            if v > pivot_val {
                pivot_val = v;
                pivot_row = row;
            }
        }
        if pivot_val < SINGULARITY_EPS {
            return None;
        }
        if pivot_row != col {
            m.swap_rows(col, pivot_row);
            rhs.swap_rows(col, pivot_row);
        }

        let pivot = m[(col, col)];
        for row in (col + 1)..n {
            let factor = m[(row, col)] / pivot;
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                m[(row, k)] -= factor * m[(col, k)];
            }
            rhs[row] -= factor * rhs[col];
        }
    }

    let mut x = DVector::zeros(n);
    for row in (0..n).rev() {
        let mut acc = rhs[row];
        for k in (row + 1)..n {
            acc -= m[(row, k)] * x[k];
        }
        let diag = m[(row, row)];
        if diag.abs() < SINGULARITY_EPS {
            return None;
        }
        x[row] = acc / diag;
    }
    Some(x)
}

/// Dominant eigenvector of a symmetric 3x3 matrix via power iteration.
///
/// Returns `(eigenvalue, unit eigenvector)`. `rng` supplies the random
/// starting vector so that degenerate (near-isotropic) matrices don't always
/// converge to the same arbitrary direction.
pub fn power_iteration(m: &Matrix3<f64>, rng: &mut Prng, iters: usize) -> Option<(f64, Vector3<f64>)> {
    let mut v = Vector3::new(
        rng.random() - 0.5,
        rng.random() - 0.5,
        rng.random() - 0.5,
    );
    v = normalize3(v)?;
    let mut eigenvalue = 0.0;
    for _ in 0..iters {
        let mv = m * v;
        let next = normalize3(mv)?;
        eigenvalue = next.dot(&(m * next));
        if (next - v).norm() < 1e-14 || (next + v).norm() < 1e-14 {
            v = next;
            break;
        }
        v = next;
    }
    Some((eigenvalue, v))
}

/// Smallest-eigenvalue eigenvector of a symmetric 3x3 matrix via inverse
/// power iteration with a small ridge shift to keep the system solvable when
/// `m` itself is singular (the common case: we want the null space).
pub fn inverse_power_iteration(
    m: &Matrix3<f64>,
    rng: &mut Prng,
    iters: usize,
) -> Option<(f64, Vector3<f64>)> {
    let shift = 1e-9;
    let shifted = m + Matrix3::identity() * shift;
    let mut v = Vector3::new(
        rng.random() - 0.5,
        rng.random() - 0.5,
        rng.random() - 0.5,
    );
    v = normalize3(v)?;
    for _ in 0..iters {
        let solved = solve_3x3(&shifted, &v)?;
        let next = normalize3(solved)?;
        if (next - v).norm() < 1e-14 || (next + v).norm() < 1e-14 {
            v = next;
            break;
        }
        v = next;
    }
    let eigenvalue = v.dot(&(m * v));
    Some((eigenvalue, v))
}

/// A 3x3 SVD: `m = u * diag(singular_values) * v_t`.
pub struct Svd3 {
    pub u: Matrix3<f64>,
    pub singular_values: Vector3<f64>,
    pub v_t: Matrix3<f64>,
}

/// 3x3 SVD built from the eigendecomposition of `AᵀA`, per §4.1.
///
/// `AᵀA` is symmetric positive semi-definite, so its eigenvectors (found by
/// repeated power iteration with deflation) give `V` directly; singular
/// values are the square roots of the eigenvalues, and `U` columns come from
/// `A v_i / sigma_i` (falling back to an arbitrary orthogonal completion when
/// `sigma_i` is ~0).
pub fn svd3(a: &Matrix3<f64>, rng: &mut Prng) -> Svd3 {
    let ata = a.transpose() * a;

    let mut eigs: Vec<(f64, Vector3<f64>)> = Vec::with_capacity(3);
    let mut deflated = ata;
    for _ in 0..3 {
        let (val, vec) = power_iteration(&deflated, rng, 200).unwrap_or((0.0, Vector3::x()));
        let val = val.max(0.0);
        eigs.push((val, vec));
        deflated -= val * vec * vec.transpose();
    }
    // Sort descending by eigenvalue.
    eigs.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap());

    let v = Matrix3::from_columns(&[eigs[0].1, eigs[1].1, eigs[2].1]);
    let v = orthonormalize_columns(&v);

    let singular_values = Vector3::new(
        eigs[0].0.max(0.0).sqrt(),
        eigs[1].0.max(0.0).sqrt(),
        eigs[2].0.max(0.0).sqrt(),
    );

    let mut u_cols = [Vector3::zeros(); 3];
    for i in 0..3 {
        if singular_values[i] > SINGULARITY_EPS {
            u_cols[i] = (a * v.column(i)) / singular_values[i];
        }
    }
    // Fill any near-zero-singular-value columns with an orthogonal completion.
    fill_orthogonal_gaps(&mut u_cols);

    Svd3 {
        u: Matrix3::from_columns(&u_cols),
        singular_values,
        v_t: v.transpose(),
    }
}

/// Re-orthonormalize the columns of a near-orthogonal 3x3 matrix via
/// Gram-Schmidt. Deflation in [`svd3`] accumulates floating point drift that
/// this corrects before it is returned to callers.
fn orthonormalize_columns(m: &Matrix3<f64>) -> Matrix3<f64> {
    let mut cols = [m.column(0).into_owned(), m.column(1).into_owned(), m.column(2).into_owned()];
    cols[0] = normalize3(cols[0]).unwrap_or(Vector3::x());
    cols[1] = (cols[1] - cols[0] * cols[0].dot(&cols[1])).normalize();
    cols[2] = cols[0].cross(&cols[1]);
    Matrix3::from_columns(&cols)
}

fn fill_orthogonal_gaps(cols: &mut [Vector3<f64>; 3]) {
    let present: Vec<usize> = (0..3).filter(|&i| cols[i].norm() > 0.5).collect();
    if present.len() == 3 {
        return;
    }
    if present.len() == 2 {
        let missing = (0..3).find(|i| !present.contains(i)).unwrap();
        cols[missing] = cols[present[0]].cross(&cols[present[1]]);
        return;
    }
    if present.len() == 1 {
        let basis = if cols[present[0]].x.abs() < 0.9 {
            Vector3::x()
        } else {
            Vector3::y()
        };
        let b = (basis - cols[present[0]] * cols[present[0]].dot(&basis)).normalize();
        let c = cols[present[0]].cross(&b);
        let missing: Vec<usize> = (0..3).filter(|i| *i != present[0]).collect();
        cols[missing[0]] = b;
        cols[missing[1]] = c;
        return;
    }
    cols[0] = Vector3::x();
    cols[1] = Vector3::y();
    cols[2] = Vector3::z();
}

/// Null space vector of the system `A x = 0` for a tall `A` (more rows than
/// columns), via power iteration on `AᵀA`'s smallest eigenvector. Used by the
/// vanishing-point module when stacking >=3 homogeneous line equations.
pub fn null_space_3(a: &DMatrix<f64>, rng: &mut Prng) -> Option<Vector3<f64>> {
    if a.ncols() != 3 {
        return None;
    }
    let ata = a.transpose() * a;
    let ata3 = Matrix3::from_iterator(ata.iter().copied());
    let (_, v) = inverse_power_iteration(&ata3, rng, 300)?;
    normalize3(v)
}
