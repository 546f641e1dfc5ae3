//! Covariance algebra shared by the filter and the contact estimator.
//!
//! Innovation covariances and `J Jᵀ` products are symmetric positive definite in exact
//! arithmetic but routinely lose a few digits. Solves therefore symmetrize first, then try a
//! plain Cholesky factorization, then a short ramp of diagonal loadings, and only then an
//! explicit inverse. Every failure is reported as `None` so the caller can reject the update.

use nalgebra::DMatrix;
use nalgebra::linalg::{Cholesky, SymmetricEigen};

/// P ← ½ (P + Pᵀ)
#[inline]
pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    0.5 * (m + m.transpose())
}

/// Diagonal loadings tried after a plain Cholesky factorization fails.
#[derive(Debug, Clone, Copy)]
pub struct SolveOptions {
    /// First loading added to the diagonal
    pub initial_jitter: f64,
    /// Largest loading ever tried
    pub max_jitter: f64,
    /// Growth factor between attempts
    pub growth: f64,
}

impl Default for SolveOptions {
    fn default() -> Self {
        SolveOptions {
            initial_jitter: 1e-12,
            max_jitter: 1e-6,
            growth: 10.0,
        }
    }
}

impl SolveOptions {
    /// `0, initial_jitter, initial_jitter * growth, ...` up to `max_jitter`.
    fn loadings(&self) -> impl Iterator<Item = f64> + '_ {
        std::iter::once(0.0).chain(
            std::iter::successors(Some(self.initial_jitter), move |j| Some(j * self.growth))
                .take_while(move |j| *j <= self.max_jitter * (1.0 + 1e-9)),
        )
    }
}

/// Solve `A X = B` for a symmetric positive (semi)definite `A` by Cholesky with diagonal
/// loading. `None` on a shape mismatch or when no loading makes `A` factorizable.
pub fn chol_solve_spd(
    a: &DMatrix<f64>,
    b: &DMatrix<f64>,
    opt: SolveOptions,
) -> Option<DMatrix<f64>> {
    if !a.is_square() || a.nrows() != b.nrows() {
        return None;
    }
    let a_sym = symmetrize(a);
    let n = a_sym.nrows();
    opt.loadings().find_map(|jitter| {
        let loaded = &a_sym + DMatrix::<f64>::identity(n, n) * jitter;
        Cholesky::new(loaded).map(|ch| ch.solve(b))
    })
}

/// [`chol_solve_spd`] with default loadings, falling back to an explicit inverse.
pub fn robust_spd_solve(a: &DMatrix<f64>, b: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    chol_solve_spd(a, b, SolveOptions::default()).or_else(|| {
        if a.nrows() != b.nrows() {
            return None;
        }
        symmetrize(a).try_inverse().map(|inv| inv * b)
    })
}

/// Smallest eigenvalue of the symmetric part of `m`. NaN entries yield NaN.
pub fn min_symmetric_eigenvalue(m: &DMatrix<f64>) -> f64 {
    if m.nrows() == 0 {
        return 0.0;
    }
    if m.iter().any(|x| !x.is_finite()) {
        return f64::NAN;
    }
    let se = SymmetricEigen::new(symmetrize(m));
    se.eigenvalues.iter().cloned().fold(f64::INFINITY, f64::min)
}

/// Cheap PSD test: finite, symmetric to `tol` (relative), and no eigenvalue below `-tol` scaled
/// by the largest diagonal entry.
pub fn is_positive_semidefinite(m: &DMatrix<f64>, tol: f64) -> bool {
    if !m.is_square() {
        return false;
    }
    if m.iter().any(|x| !x.is_finite()) {
        return false;
    }
    let scale = m.diagonal().iter().fold(1.0_f64, |acc, d| acc.max(d.abs()));
    let asym = (m - m.transpose()).abs().max();
    if asym > tol * scale {
        return false;
    }
    min_symmetric_eigenvalue(m) >= -tol * scale
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: &DMatrix<f64>, b: &DMatrix<f64>, tol: f64) -> bool {
        if a.shape() != b.shape() {
            return false;
        }
        (a - b).abs().max() <= tol
    }

    #[test]
    fn symmetrize_averages_off_diagonal() {
        let m = DMatrix::from_row_slice(2, 2, &[2.0, 4.0, 0.0, 1.0]);
        let s = symmetrize(&m);
        assert!(approx_eq(&s, &DMatrix::from_row_slice(2, 2, &[2.0, 2.0, 2.0, 1.0]), 1e-15));
    }

    #[test]
    fn loading_ramp_stops_at_max() {
        let loadings: Vec<f64> = SolveOptions::default().loadings().collect();
        assert_eq!(loadings.len(), 8);
        assert_eq!(loadings[0], 0.0);
        assert!((loadings[7] - 1e-6).abs() < 1e-18);
    }

    #[test]
    fn innovation_solve() {
        let s = DMatrix::from_row_slice(3, 3, &[2.0, 0.3, 0.0, 0.3, 1.5, 0.1, 0.0, 0.1, 0.8]);
        let hp = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 0.5, 2.0, -1.0, 0.3]);
        let k = chol_solve_spd(&s, &hp, SolveOptions::default()).unwrap();
        assert!(approx_eq(&(&s * &k), &hp, 1e-12));
    }

    #[test]
    fn rank_deficient_needs_loading() {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        let b = DMatrix::from_row_slice(2, 1, &[1.0, 1.0]);
        assert!(chol_solve_spd(&a, &b, SolveOptions::default()).is_some());
    }

    #[test]
    fn zero_or_misshapen_systems_are_rejected() {
        let b = DMatrix::from_row_slice(2, 1, &[1.0, 1.0]);
        let singular_indefinite = DMatrix::from_row_slice(2, 2, &[0.0, 0.0, 0.0, -1.0]);
        assert!(robust_spd_solve(&singular_indefinite, &b).is_none());
        assert!(robust_spd_solve(&DMatrix::identity(3, 3), &b).is_none());
        assert!(chol_solve_spd(&DMatrix::zeros(3, 2), &b, SolveOptions::default()).is_none());
    }

    #[test]
    fn t_psd_check() {
        let a = DMatrix::from_row_slice(3, 3, &[1.0, 2.0, 0.5, 0.0, 1.0, -1.0, 0.0, 0.0, 0.2]);
        let p = &a * a.transpose();
        assert!(is_positive_semidefinite(&p, 1e-9));

        let indefinite = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]); // eigenvalues 3, -1
        assert!(!is_positive_semidefinite(&indefinite, 1e-9));
        assert!((min_symmetric_eigenvalue(&indefinite) + 1.0).abs() < 1e-12);

        let asymmetric = DMatrix::from_row_slice(2, 2, &[1.0, 0.5, 0.0, 1.0]);
        assert!(!is_positive_semidefinite(&asymmetric, 1e-9));

        let mut nan = DMatrix::<f64>::identity(2, 2);
        nan[(0, 1)] = f64::NAN;
        assert!(!is_positive_semidefinite(&nan, 1e-9));
    }

    #[test]
    fn t_zero_matrix_is_psd() {
        assert!(is_positive_semidefinite(&DMatrix::zeros(4, 4), 1e-12));
    }
}
