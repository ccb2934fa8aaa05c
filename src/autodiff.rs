//! Forward-mode differentiation for discipline closures using `num-dual`.
//!
//! Disciplines that want analytic Jacobian blocks without hand-coding
//! derivatives can write their computation once over dual numbers and let
//! [`compute_jacobian`] extract exact partial derivatives.
//!
//! # Example
//!
//! ```
//! use num_dual::Dual64;
//! use tandem::autodiff::compute_jacobian;
//!
//! // f(x, y) = [x^2, x*y]
//! let f = |vars: &[Dual64]| vec![vars[0] * vars[0], vars[0] * vars[1]];
//! let jac = compute_jacobian(f, &[2.0, 3.0]);
//!
//! assert!((jac[(0, 0)] - 4.0).abs() < 1e-12);
//! assert!((jac[(1, 0)] - 3.0).abs() < 1e-12);
//! ```

use nalgebra::DMatrix;
use num_dual::*;

/// Computes the dense Jacobian of a vector function by a forward-mode
/// column sweep.
///
/// The closure is evaluated once per variable with that variable's dual
/// part seeded to one; the dual parts of the results form one Jacobian
/// column.
pub fn compute_jacobian<F>(f: F, x: &[f64]) -> DMatrix<f64>
where
    F: Fn(&[Dual64]) -> Vec<Dual64>,
{
    let n_vars = x.len();
    let mut n_eqs = 0;
    let mut columns: Vec<Vec<f64>> = Vec::with_capacity(n_vars);

    for j in 0..n_vars {
        let mut x_dual: Vec<Dual64> = x.iter().map(|&v| Dual64::from(v)).collect();
        x_dual[j] = Dual64::from(x[j]).derivative();

        let residuals = f(&x_dual);
        if j == 0 {
            n_eqs = residuals.len();
        }
        columns.push(residuals.iter().map(|r| r.eps).collect());
    }

    DMatrix::from_fn(n_eqs, n_vars, |i, j| columns[j][i])
}

/// Evaluates a dual-number closure at a real point.
pub fn evaluate_real<F>(f: F, x: &[f64]) -> Vec<f64>
where
    F: Fn(&[Dual64]) -> Vec<Dual64>,
{
    let x_dual: Vec<Dual64> = x.iter().map(|&v| Dual64::from(v)).collect();
    f(&x_dual).iter().map(|r| r.re).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_jacobian_simple() {
        // f(x, y) = [x^2, xy]
        let f = |vars: &[Dual64]| {
            let x = vars[0];
            let y = vars[1];
            vec![x * x, x * y]
        };

        let jac = compute_jacobian(f, &[2.0, 3.0]);

        // [[2x, 0], [y, x]] at (2, 3)
        assert_eq!(jac.nrows(), 2);
        assert_eq!(jac.ncols(), 2);
        assert!((jac[(0, 0)] - 4.0).abs() < 1e-12);
        assert!((jac[(0, 1)] - 0.0).abs() < 1e-12);
        assert!((jac[(1, 0)] - 3.0).abs() < 1e-12);
        assert!((jac[(1, 1)] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_evaluate_real() {
        let f = |vars: &[Dual64]| vec![vars[0] * vars[0] + vars[1]];
        let values = evaluate_real(f, &[3.0, 1.0]);
        assert_eq!(values, vec![10.0]);
    }
}
