//! SO(3) and SE_K(3) helpers for the invariant filter.
//!
//! The group state is the "extended pose" matrix
//!
//! ```text
//!     | R  v  p  d_1 ... d_K |
//! X = | 0  1  0   0  ...  0  |
//!     | .        ...         |
//!     | 0  0  0   0  ...  1  |
//! ```
//!
//! whose Lie algebra element is stacked as `[ξ_R, ξ_v, ξ_p, ξ_d1, ..., ξ_dK]` (3 rows each). The
//! functions here never build the full homogeneous matrix; they operate on the rotation and the
//! column vectors directly.

use nalgebra::{DMatrix, DVector, Matrix3, Rotation3, Vector3};

/// Below this rotation angle the series expansions are used.
const SMALL_ANGLE_THRESHOLD: f64 = 1e-10;

/// Constructs the skew-symmetric matrix [v]× such that [v]× u = v × u.
///
/// ```text
/// [v]× = |  0   -v_z   v_y |
///        |  v_z   0   -v_x |
///        | -v_y  v_x    0  |
/// ```
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Inverse of [`skew`]
#[inline]
pub fn unskew(m: &Matrix3<f64>) -> Vector3<f64> {
    Vector3::new(m[(2, 1)], m[(0, 2)], m[(1, 0)])
}

fn factorial(m: u32) -> f64 {
    (1..=m).fold(1.0, |acc, k| acc * k as f64)
}

/// The Γ_m family of SO(3) series:
///
/// ```text
/// Γ_m(φ) = Σ_n  [φ]×^n / (n + m)!
/// ```
///
/// Γ_0 is the exponential map, Γ_1 the left Jacobian and Γ_2 the double-integral kernel that
/// appears in the exact discretization of the IMU kinematics with constant body-frame inputs.
pub fn gamma_so3(phi: &Vector3<f64>, m: u32) -> Matrix3<f64> {
    let theta = phi.norm();
    let identity = Matrix3::identity();
    if theta < SMALL_ANGLE_THRESHOLD {
        return identity / factorial(m);
    }
    let a = skew(phi);
    let a2 = a * a;
    let theta2 = theta * theta;
    let (s, c) = theta.sin_cos();
    match m {
        0 => identity + (s / theta) * a + ((1.0 - c) / theta2) * a2,
        1 => identity + ((1.0 - c) / theta2) * a + ((theta - s) / (theta2 * theta)) * a2,
        2 => {
            0.5 * identity
                + ((theta - s) / (theta2 * theta)) * a
                + ((theta2 + 2.0 * c - 2.0) / (2.0 * theta2 * theta2)) * a2
        }
        _ => {
            // Truncated series for the higher orders (not used on the hot path)
            let mut out = Matrix3::zeros();
            let mut power = identity;
            for n in 0..20u32 {
                out += power / factorial(n + m);
                power *= a;
            }
            out
        }
    }
}

/// SO(3) exponential map
#[inline]
pub fn exp_so3(phi: &Vector3<f64>) -> Matrix3<f64> {
    gamma_so3(phi, 0)
}

/// SO(3) left Jacobian
#[inline]
pub fn left_jacobian_so3(phi: &Vector3<f64>) -> Matrix3<f64> {
    gamma_so3(phi, 1)
}

/// SO(3) logarithm, returning the rotation vector of `r`.
pub fn log_so3(r: &Matrix3<f64>) -> Vector3<f64> {
    let cos_theta = ((r.trace() - 1.0) * 0.5).clamp(-1.0, 1.0);
    let theta = cos_theta.acos();
    let w = unskew(&(r - r.transpose())) * 0.5;
    if theta < 1e-7 {
        return w;
    }
    if std::f64::consts::PI - theta < 1e-6 {
        // Near π the antisymmetric part vanishes, recover the axis from the symmetric part
        // B = (R + I) / 2 = n nᵀ at θ = π, so any column with a non-zero diagonal gives the axis
        let b = (r + Matrix3::identity()) * 0.5;
        let i = b.diagonal().imax();
        let axis: Vector3<f64> = b.column(i).into_owned() / b[(i, i)].max(1e-300).sqrt();
        return axis.normalize() * theta;
    }
    w * (theta / theta.sin())
}

/// Closest rotation to `m` in the Frobenius sense (`U Vᵀ` of its SVD, reflection removed).
pub fn orthonormalize(m: &Matrix3<f64>) -> Rotation3<f64> {
    let svd = m.svd(true, true);
    match (svd.u, svd.v_t) {
        (Some(mut u), Some(v_t)) => {
            if (u * v_t).determinant() < 0.0 {
                u.column_mut(2).neg_mut();
            }
            Rotation3::from_matrix_unchecked(u * v_t)
        }
        _ => Rotation3::from_matrix(m),
    }
}

/// SE_K(3) exponential restricted to the active blocks.
///
/// `xi` holds `[ξ_R, ξ_1, ..., ξ_K]`; the result is the rotation `Exp(ξ_R)` and the K translation
/// columns `J_l(ξ_R) ξ_k`.
pub fn exp_sek3(xi: &DVector<f64>) -> (Matrix3<f64>, Vec<Vector3<f64>>) {
    assert!(
        xi.len() >= 3 && xi.len() % 3 == 0,
        "exp_sek3: tangent vector length must be a multiple of 3"
    );
    let phi = Vector3::new(xi[0], xi[1], xi[2]);
    let r = exp_so3(&phi);
    let jl = left_jacobian_so3(&phi);
    let columns = (1..xi.len() / 3)
        .map(|k| jl * Vector3::new(xi[3 * k], xi[3 * k + 1], xi[3 * k + 2]))
        .collect();
    (r, columns)
}

/// Adjoint of an SE_K(3) element given its rotation and translation columns.
///
/// ```text
///        | R          0  ...  0 |
/// Ad_X = | [t_1]× R   R  ...  0 |
///        |   ...          ...   |
///        | [t_K]× R   0  ...  R |
/// ```
pub fn adjoint_sek3(r: &Matrix3<f64>, columns: &[Vector3<f64>]) -> DMatrix<f64> {
    let dim = 3 * (columns.len() + 1);
    let mut adj = DMatrix::<f64>::zeros(dim, dim);
    adj.view_mut((0, 0), (3, 3)).copy_from(r);
    for (k, t) in columns.iter().enumerate() {
        let row = 3 * (k + 1);
        adj.view_mut((row, 0), (3, 3)).copy_from(&(skew(t) * r));
        adj.view_mut((row, row), (3, 3)).copy_from(r);
    }
    adj
}
