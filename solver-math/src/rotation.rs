use nalgebra::{Matrix3, Quaternion, UnitQuaternion, Vector3};

/// Convert a unit quaternion `(w, x, y, z)` to a rotation matrix.
pub fn quat_to_matrix(q: UnitQuaternion<f64>) -> Matrix3<f64> {
    *q.to_rotation_matrix().matrix()
}

/// Convert a rotation matrix to a unit quaternion using Shepperd's
/// trace-based branch selection, which avoids the numerical blowup of the
/// naive `w = sqrt(1+trace)/2` formula when the trace is negative.
///
/// Always re-normalizes the result (§4.1): floating-point drift in `m` can
/// leave it slightly non-orthogonal.
pub fn matrix_to_quat(m: &Matrix3<f64>) -> UnitQuaternion<f64> {
    let trace = m[(0, 0)] + m[(1, 1)] + m[(2, 2)];

    let (w, x, y, z) = if trace > 0.0 {
        let s = (trace + 1.0).sqrt() * 2.0; // s = 4w
        let w = 0.25 * s;
        let x = (m[(2, 1)] - m[(1, 2)]) / s;
        let y = (m[(0, 2)] - m[(2, 0)]) / s;
        let z = (m[(1, 0)] - m[(0, 1)]) / s;
        (w, x, y, z)
    } else if m[(0, 0)] > m[(1, 1)] && m[(0, 0)] > m[(2, 2)] {
        let s = (1.0 + m[(0, 0)] - m[(1, 1)] - m[(2, 2)]).sqrt() * 2.0; // s = 4x
        let w = (m[(2, 1)] - m[(1, 2)]) / s;
        let x = 0.25 * s;
        let y = (m[(0, 1)] + m[(1, 0)]) / s;
        let z = (m[(0, 2)] + m[(2, 0)]) / s;
        (w, x, y, z)
    } else if m[(1, 1)] > m[(2, 2)] {
        let s = (1.0 + m[(1, 1)] - m[(0, 0)] - m[(2, 2)]).sqrt() * 2.0; // s = 4y
        let w = (m[(0, 2)] - m[(2, 0)]) / s;
        let x = (m[(0, 1)] + m[(1, 0)]) / s;
        let y = 0.25 * s;
        let z = (m[(1, 2)] + m[(2, 1)]) / s;
        (w, x, y, z)
    } else {
        let s = (1.0 + m[(2, 2)] - m[(0, 0)] - m[(1, 1)]).sqrt() * 2.0; // s = 4z
        let w = (m[(1, 0)] - m[(0, 1)]) / s;
        let x = (m[(0, 2)] + m[(2, 0)]) / s;
        let y = (m[(1, 2)] + m[(2, 1)]) / s;
        let z = 0.25 * s;
        (w, x, y, z)
    };

    UnitQuaternion::new_normalize(Quaternion::new(w, x, y, z))
}

/// Rodrigues' rotation formula: rotate by `angle` radians around `axis`
/// (need not be normalized). Used by coordinate alignment (§4.7) to rotate
/// the whole scene onto the axis-line-derived basis.
pub fn rodrigues(axis: Vector3<f64>, angle: f64) -> Option<Matrix3<f64>> {
    let k = crate::linalg::normalize3(axis)?;
    let kx = Matrix3::new(0.0, -k.z, k.y, k.z, 0.0, -k.x, -k.y, k.x, 0.0);
    let i = Matrix3::identity();
    Some(i + kx * angle.sin() + kx * kx * (1.0 - angle.cos()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn quat_matrix_roundtrip_identity() {
        let m = Matrix3::identity();
        let q = matrix_to_quat(&m);
        assert_relative_eq!(q.norm(), 1.0, epsilon = 1e-12);
        let m2 = quat_to_matrix(q);
        assert_relative_eq!(m2, m, epsilon = 1e-12);
    }

    #[test]
    fn quat_matrix_roundtrip_negative_trace() {
        // 180 degree rotation about Z: trace = -1, exercises the m22-branch.
        let m = Matrix3::new(-1.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0, 1.0);
        let q = matrix_to_quat(&m);
        assert_relative_eq!(q.norm(), 1.0, epsilon = 1e-12);
        let m2 = quat_to_matrix(q);
        assert_relative_eq!(m2, m, epsilon = 1e-9);
    }

    #[test]
    fn quat_matrix_roundtrip_many_axes() {
        for (axis, angle) in [
            (Vector3::x(), 0.3),
            (Vector3::y(), 1.2),
            (Vector3::z(), 2.5),
            (Vector3::new(1.0, 1.0, 1.0), 1.0),
        ] {
            let r = rodrigues(axis, angle).unwrap();
            let q = matrix_to_quat(&r);
            let r2 = quat_to_matrix(q);
            assert_relative_eq!(r2, r, epsilon = 1e-8);
        }
    }

    #[test]
    fn rodrigues_z_axis_matches_explicit_rotation() {
        let angle = std::f64::consts::FRAC_PI_2;
        let r = rodrigues(Vector3::z(), angle).unwrap();
        let expected = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
        assert_relative_eq!(r, expected, epsilon = 1e-9);
    }

    #[test]
    fn rodrigues_rejects_zero_axis() {
        assert!(rodrigues(Vector3::zeros(), 1.0).is_none());
    }
}
