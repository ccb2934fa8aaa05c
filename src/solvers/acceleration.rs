//! Convergence acceleration for fixed-point iterations.
//!
//! Both accelerators consume the pair `(x, g(x))` of each iteration and
//! propose the next iterate. When the update is degenerate (not enough
//! history, a vanishing denominator, a singular least-squares system, or a
//! non-finite result) they fall back to plain substitution `g(x)` so that
//! the outer solve is never aborted by the accelerator.

use nalgebra::{DMatrix, DVector};

/// Acceleration strategy applied to the fixed-point iterates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Acceleration {
    /// Plain substitution, no acceleration
    #[default]
    None,
    /// Per-component secant update with bounded relaxation
    Secant,
    /// Least-squares combination of a window of past iterates
    M2d,
}

/// Per-component secant acceleration.
///
/// Given g(x) with fixed point x = g(x), the next iterate is the blend
/// `x_next = q*x + (1-q)*g(x)` where for each component the slope
/// `a = (g(x) - g(x_prev)) / (x - x_prev)` gives `q = a / (a - 1)`,
/// bounded for stability.
pub struct SecantAccelerator {
    x_history: Vec<DVector<f64>>,
    g_history: Vec<DVector<f64>>,
    q_min: f64,
    q_max: f64,
}

impl SecantAccelerator {
    /// Creates an accelerator with explicit relaxation bounds.
    pub fn new(q_min: f64, q_max: f64) -> Self {
        SecantAccelerator { x_history: Vec::new(), g_history: Vec::new(), q_min, q_max }
    }

    /// Default bounds: strong extrapolation allowed, no damping beyond
    /// plain substitution.
    pub fn with_defaults() -> Self {
        Self::new(-5.0, 0.0)
    }

    /// Proposes the next iterate from the current pair `(x, g(x))`.
    pub fn accelerate(&mut self, x: &DVector<f64>, gx: &DVector<f64>) -> DVector<f64> {
        let n = x.len();
        self.x_history.push(x.clone());
        self.g_history.push(gx.clone());

        // Substitution until enough history exists
        if self.x_history.len() < 2 {
            return gx.clone();
        }

        let len = self.x_history.len();
        let x_prev = &self.x_history[len - 2];
        let g_prev = &self.g_history[len - 2];

        let mut next = DVector::zeros(n);
        for i in 0..n {
            let dx = x[i] - x_prev[i];
            let a = if dx.abs() > 1e-14 { (gx[i] - g_prev[i]) / dx } else { 0.0 };
            let q = if (a - 1.0).abs() > 1e-14 { a / (a - 1.0) } else { 0.0 };
            let q = q.clamp(self.q_min, self.q_max);
            next[i] = q * x[i] + (1.0 - q) * gx[i];
        }

        if next.iter().all(|v| v.is_finite()) {
            next
        } else {
            gx.clone()
        }
    }

    /// Clears the stored history.
    pub fn reset(&mut self) {
        self.x_history.clear();
        self.g_history.clear();
    }
}

/// Windowed least-squares acceleration.
///
/// Combines the last iterates so that the combined residual
/// `f(x) = g(x) - x` is minimized in the least-squares sense, then takes
/// the same combination of the g values as the next iterate.
pub struct M2dAccelerator {
    window: usize,
    x_history: Vec<DVector<f64>>,
    g_history: Vec<DVector<f64>>,
}

impl M2dAccelerator {
    /// Creates an accelerator keeping `window` past residual differences.
    pub fn new(window: usize) -> Self {
        M2dAccelerator { window: window.max(1), x_history: Vec::new(), g_history: Vec::new() }
    }

    /// Default window depth of five iterates.
    pub fn with_defaults() -> Self {
        Self::new(5)
    }

    /// Proposes the next iterate from the current pair `(x, g(x))`.
    pub fn accelerate(&mut self, x: &DVector<f64>, gx: &DVector<f64>) -> DVector<f64> {
        self.x_history.push(x.clone());
        self.g_history.push(gx.clone());

        let k = self.x_history.len() - 1;
        if k == 0 {
            return gx.clone();
        }
        let m = self.window.min(k);

        let residual = |j: usize| &self.g_history[j] - &self.x_history[j];
        let f_k = residual(k);

        // Columns of residual and g differences over the window
        let df: Vec<DVector<f64>> =
            (k - m..k).map(|j| residual(j + 1) - residual(j)).collect();
        let dg: Vec<DVector<f64>> =
            (k - m..k).map(|j| &self.g_history[j + 1] - &self.g_history[j]).collect();

        let f_mat = DMatrix::from_columns(&df);
        let svd = f_mat.svd(true, true);
        let gamma = match svd.solve(&f_k, 1e-12) {
            Ok(gamma) => gamma,
            Err(_) => return gx.clone(),
        };

        let mut next = gx.clone();
        for (j, column) in dg.iter().enumerate() {
            next -= column * gamma[j];
        }

        if next.iter().all(|v| v.is_finite()) {
            next
        } else {
            gx.clone()
        }
    }

    /// Clears the stored history.
    pub fn reset(&mut self) {
        self.x_history.clear();
        self.g_history.clear();
    }
}
