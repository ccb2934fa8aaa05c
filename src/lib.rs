//! # Tandem: Coupled Multidisciplinary Analysis
//!
//! A library for driving a set of coupled black-box disciplines to a
//! self-consistent fixed point and computing total derivatives through the
//! converged coupled system.
//!
//! A *discipline* maps named input arrays to named output arrays. When the
//! output of one discipline feeds the input of another, the two are coupled;
//! cycles in the coupling graph require fixed-point iteration to resolve.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use nalgebra::DVector;
//! use tandem::{data_map, Discipline, FnDiscipline, MdaSolver, SolverConfig, SolverMethod};
//!
//! // y1 = 1 - 0.5*y2
//! let one = FnDiscipline::new("one", &["y2"], &["y1"], |data| {
//!     let y2 = data["y2"][0];
//!     Ok(data_map(&[("y1", &[1.0 - 0.5 * y2])]))
//! })
//! .with_default("y2", DVector::from_element(1, 1.0));
//!
//! // y2 = 2 - 0.3*y1
//! let two = FnDiscipline::new("two", &["y1"], &["y2"], |data| {
//!     let y1 = data["y1"][0];
//!     Ok(data_map(&[("y2", &[2.0 - 0.3 * y1])]))
//! })
//! .with_default("y1", DVector::from_element(1, 1.0));
//!
//! let disciplines: Vec<Arc<dyn Discipline>> = vec![Arc::new(one), Arc::new(two)];
//! let config = SolverConfig::default().with_method(SolverMethod::GaussSeidel);
//! let mut solver = MdaSolver::new(disciplines, config)?;
//!
//! let solution = solver.solve(&data_map(&[]))?;
//! assert!(solution.converged);
//! assert!((solution.data["y1"][0] - 0.0).abs() < 1e-5);
//! assert!((solution.data["y2"][0] - 2.0).abs() < 1e-5);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::collections::HashMap;

use nalgebra::{DMatrix, DVector};

pub mod autodiff;
pub mod coupling;
pub mod jacobian;
pub mod parallel;
pub mod solvers;

pub use coupling::{ConfigurationError, CouplingGraph};
pub use jacobian::{
    AssemblyError, DerivationMode, JacobianAssembly, LinearAlgebraError, MatrixType,
};
pub use parallel::ParallelDisciplineRunner;
pub use solvers::{
    Acceleration, MdaSolution, MdaSolver, ResidualHistory, ResidualRecord, ResidualScaling,
    SolverConfig, SolverError, SolverMethod, SolverStatus,
};

/// Named arrays exchanged between disciplines.
pub type DataMap = HashMap<String, DVector<f64>>;

/// Partial derivatives keyed output-then-input: `jac[output][input]` is the
/// dense block d(output)/d(input).
pub type JacobianMap = HashMap<String, HashMap<String, DMatrix<f64>>>;

/// Builds a [`DataMap`] from `(name, values)` pairs.
///
/// ```
/// use tandem::data_map;
///
/// let data = data_map(&[("x", &[1.0, 2.0][..]), ("y", &[0.5][..])]);
/// assert_eq!(data["x"].len(), 2);
/// ```
pub fn data_map(entries: &[(&str, &[f64])]) -> DataMap {
    entries
        .iter()
        .map(|(name, values)| (name.to_string(), DVector::from_column_slice(values)))
        .collect()
}

/// Errors raised by a discipline during evaluation or linearization.
#[derive(Debug, thiserror::Error)]
pub enum EvaluationError {
    /// A declared input is absent from the data passed to the discipline
    #[error("discipline '{discipline}' is missing input '{name}'")]
    MissingInput { discipline: String, name: String },
    /// The discipline computation itself failed
    #[error("discipline '{discipline}' failed: {message}")]
    Failed { discipline: String, message: String },
    /// A Jacobian block does not match the declared array sizes
    #[error(
        "jacobian block d{output}/d{input} of '{discipline}' is {rows}x{cols}, \
         expected {expected_rows}x{expected_cols}"
    )]
    ShapeMismatch {
        discipline: String,
        output: String,
        input: String,
        rows: usize,
        cols: usize,
        expected_rows: usize,
        expected_cols: usize,
    },
}

/// A black-box computation with named input and output arrays.
///
/// Implementations must be `Send + Sync` so that independent evaluations can
/// be dispatched to a worker pool.
pub trait Discipline: Send + Sync {
    /// Unique name, used in error messages and coupling validation.
    fn name(&self) -> &str;

    /// Names of the input arrays the discipline consumes.
    fn input_names(&self) -> &[String];

    /// Names of the output arrays the discipline produces.
    fn output_names(&self) -> &[String];

    /// Default values for (a subset of) the inputs.
    ///
    /// Coupling inputs need a default so that the solver has an initial
    /// guess; the declared sizes also drive consistency validation.
    fn default_inputs(&self) -> DataMap;

    /// Computes the outputs from the given inputs.
    fn evaluate(&self, inputs: &DataMap) -> Result<DataMap, EvaluationError>;

    /// Computes the partial derivatives of every output with respect to
    /// every input at the given point.
    ///
    /// The returned map must contain one block per (output, input) pair,
    /// including blocks that are identically zero.
    fn linearize(&self, inputs: &DataMap) -> Result<JacobianMap, EvaluationError>;

    /// Outputs the discipline resolves internally (its own residuals).
    ///
    /// These variables are excluded from the coupled variable set even when
    /// they appear as couplings.
    fn residual_variables(&self) -> &[String] {
        &[]
    }
}

type EvalFn = dyn Fn(&DataMap) -> Result<DataMap, EvaluationError> + Send + Sync;
type JacFn = dyn Fn(&DataMap) -> Result<JacobianMap, EvaluationError> + Send + Sync;

/// A discipline backed by a closure.
///
/// The closure receives the full input [`DataMap`] and returns the computed
/// outputs. Derivatives come from an optional analytic closure set with
/// [`with_jacobian`](FnDiscipline::with_jacobian), or from forward finite
/// differences by default.
///
/// # Example
///
/// ```
/// use tandem::{data_map, Discipline, FnDiscipline};
///
/// let disc = FnDiscipline::new("square", &["x"], &["y"], |data| {
///     let x = data["x"][0];
///     Ok(data_map(&[("y", &[x * x])]))
/// });
///
/// let out = disc.evaluate(&data_map(&[("x", &[3.0])])).unwrap();
/// assert_eq!(out["y"][0], 9.0);
/// ```
pub struct FnDiscipline {
    name: String,
    inputs: Vec<String>,
    outputs: Vec<String>,
    defaults: DataMap,
    residuals: Vec<String>,
    func: Box<EvalFn>,
    jacobian: Option<Box<JacFn>>,
    fd_step: f64,
}

impl FnDiscipline {
    /// Creates a discipline from a computation closure.
    pub fn new<F>(name: impl Into<String>, inputs: &[&str], outputs: &[&str], func: F) -> Self
    where
        F: Fn(&DataMap) -> Result<DataMap, EvaluationError> + Send + Sync + 'static,
    {
        FnDiscipline {
            name: name.into(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            defaults: DataMap::new(),
            residuals: Vec::new(),
            func: Box::new(func),
            jacobian: None,
            fd_step: 1e-7,
        }
    }

    /// Sets the default value of one input.
    pub fn with_default(mut self, name: impl Into<String>, value: DVector<f64>) -> Self {
        self.defaults.insert(name.into(), value);
        self
    }

    /// Sets default values for several inputs at once.
    pub fn with_defaults(mut self, defaults: DataMap) -> Self {
        self.defaults.extend(defaults);
        self
    }

    /// Sets an analytic Jacobian closure, replacing finite differences.
    pub fn with_jacobian<J>(mut self, jacobian: J) -> Self
    where
        J: Fn(&DataMap) -> Result<JacobianMap, EvaluationError> + Send + Sync + 'static,
    {
        self.jacobian = Some(Box::new(jacobian));
        self
    }

    /// Declares outputs the discipline resolves internally.
    pub fn with_residual_variables(mut self, names: &[&str]) -> Self {
        self.residuals = names.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Sets the relative step used by the finite-difference fallback.
    pub fn with_fd_step(mut self, step: f64) -> Self {
        self.fd_step = step;
        self
    }
}

fn expect_array<'a>(
    data: &'a DataMap,
    name: &str,
    discipline: &str,
) -> Result<&'a DVector<f64>, EvaluationError> {
    data.get(name).ok_or_else(|| EvaluationError::MissingInput {
        discipline: discipline.to_string(),
        name: name.to_string(),
    })
}

impl Discipline for FnDiscipline {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_names(&self) -> &[String] {
        &self.inputs
    }

    fn output_names(&self) -> &[String] {
        &self.outputs
    }

    fn default_inputs(&self) -> DataMap {
        self.defaults.clone()
    }

    fn evaluate(&self, inputs: &DataMap) -> Result<DataMap, EvaluationError> {
        for name in &self.inputs {
            expect_array(inputs, name, &self.name)?;
        }

        let out = (self.func)(inputs)?;

        for name in &self.outputs {
            if !out.contains_key(name) {
                return Err(EvaluationError::Failed {
                    discipline: self.name.clone(),
                    message: format!("output '{}' was not computed", name),
                });
            }
        }
        Ok(out)
    }

    fn linearize(&self, inputs: &DataMap) -> Result<JacobianMap, EvaluationError> {
        if let Some(jacobian) = &self.jacobian {
            return jacobian(inputs);
        }

        // Forward finite differences around the current point
        let base = self.evaluate(inputs)?;
        let mut result: JacobianMap = HashMap::new();
        for output in &self.outputs {
            result.insert(output.clone(), HashMap::new());
        }

        for input in &self.inputs {
            let x = expect_array(inputs, input, &self.name)?.clone();
            let dim = x.len();

            let mut blocks: HashMap<String, DMatrix<f64>> = self
                .outputs
                .iter()
                .map(|output| {
                    let rows = base[output].len();
                    (output.clone(), DMatrix::zeros(rows, dim))
                })
                .collect();

            for j in 0..dim {
                let h = self.fd_step * (1.0 + x[j].abs());
                let mut shifted = inputs.clone();
                if let Some(column) = shifted.get_mut(input) {
                    column[j] += h;
                }
                let perturbed = self.evaluate(&shifted)?;

                for output in &self.outputs {
                    let column = (&perturbed[output] - &base[output]) / h;
                    if let Some(block) = blocks.get_mut(output) {
                        block.set_column(j, &column);
                    }
                }
            }

            for (output, block) in blocks {
                if let Some(row) = result.get_mut(&output) {
                    row.insert(input.clone(), block);
                }
            }
        }

        Ok(result)
    }

    fn residual_variables(&self) -> &[String] {
        &self.residuals
    }
}

/// Contiguous flattening of a sorted list of named arrays into one vector.
///
/// Each name owns a block of the flattened vector; the order is the order of
/// `names` as given (callers pass lexicographically sorted names).
pub(crate) struct Layout {
    names: Vec<String>,
    sizes: Vec<usize>,
    offsets: Vec<usize>,
    pub(crate) total: usize,
}

impl Layout {
    /// Builds the layout from the sizes found in `data`.
    ///
    /// Fails with the missing name if one of the arrays is absent.
    pub(crate) fn from_data(names: &[String], data: &DataMap) -> Result<Self, String> {
        let mut sizes = Vec::with_capacity(names.len());
        let mut offsets = Vec::with_capacity(names.len());
        let mut total = 0;
        for name in names {
            let size = data.get(name).ok_or_else(|| name.clone())?.len();
            offsets.push(total);
            sizes.push(size);
            total += size;
        }
        Ok(Layout { names: names.to_vec(), sizes, offsets, total })
    }

    pub(crate) fn names(&self) -> &[String] {
        &self.names
    }

    /// Offset and size of the block owned by `name`.
    pub(crate) fn span(&self, name: &str) -> Option<(usize, usize)> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| (self.offsets[i], self.sizes[i]))
    }

    pub(crate) fn blocks(&self) -> impl Iterator<Item = (&str, usize, usize)> {
        self.names
            .iter()
            .zip(self.offsets.iter().zip(self.sizes.iter()))
            .map(|(name, (&offset, &size))| (name.as_str(), offset, size))
    }

    /// Concatenates the named arrays; missing names contribute zeros.
    pub(crate) fn flatten(&self, data: &DataMap) -> DVector<f64> {
        let mut out = DVector::zeros(self.total);
        for (i, name) in self.names.iter().enumerate() {
            if let Some(values) = data.get(name) {
                let len = values.len().min(self.sizes[i]);
                out.rows_mut(self.offsets[i], len).copy_from(&values.rows(0, len));
            }
        }
        out
    }

    /// Writes the blocks of `values` back into `data` under their names.
    pub(crate) fn scatter(&self, values: &DVector<f64>, data: &mut DataMap) {
        for (i, name) in self.names.iter().enumerate() {
            let block = values.rows(self.offsets[i], self.sizes[i]).into_owned();
            data.insert(name.clone(), block);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_disc() -> FnDiscipline {
        // y = [2*a + b, a - b] with a scalar, b scalar
        FnDiscipline::new("lin", &["a", "b"], &["y"], |data| {
            let a = data["a"][0];
            let b = data["b"][0];
            Ok(data_map(&[("y", &[2.0 * a + b, a - b])]))
        })
    }

    #[test]
    fn test_fn_discipline_evaluate() {
        let disc = linear_disc();
        let out = disc.evaluate(&data_map(&[("a", &[1.0]), ("b", &[3.0])])).unwrap();
        assert_eq!(out["y"][0], 5.0);
        assert_eq!(out["y"][1], -2.0);
    }

    #[test]
    fn test_fn_discipline_missing_input() {
        let disc = linear_disc();
        let err = disc.evaluate(&data_map(&[("a", &[1.0])])).unwrap_err();
        assert!(matches!(err, EvaluationError::MissingInput { ref name, .. } if name == "b"));
    }

    #[test]
    fn test_fn_discipline_missing_output() {
        let disc = FnDiscipline::new("bad", &[], &["y"], |_| Ok(DataMap::new()));
        let err = disc.evaluate(&DataMap::new()).unwrap_err();
        assert!(matches!(err, EvaluationError::Failed { .. }));
    }

    #[test]
    fn test_finite_difference_linearize() {
        let disc = linear_disc();
        let jac = disc.linearize(&data_map(&[("a", &[1.0]), ("b", &[3.0])])).unwrap();

        let dy_da = &jac["y"]["a"];
        let dy_db = &jac["y"]["b"];
        assert!((dy_da[(0, 0)] - 2.0).abs() < 1e-5);
        assert!((dy_da[(1, 0)] - 1.0).abs() < 1e-5);
        assert!((dy_db[(0, 0)] - 1.0).abs() < 1e-5);
        assert!((dy_db[(1, 0)] - (-1.0)).abs() < 1e-5);
    }

    #[test]
    fn test_analytic_jacobian_override() {
        let disc = linear_disc().with_jacobian(|_| {
            let mut jac: JacobianMap = HashMap::new();
            let mut row = HashMap::new();
            row.insert("a".to_string(), DMatrix::from_row_slice(2, 1, &[2.0, 1.0]));
            row.insert("b".to_string(), DMatrix::from_row_slice(2, 1, &[1.0, -1.0]));
            jac.insert("y".to_string(), row);
            Ok(jac)
        });
        let jac = disc.linearize(&data_map(&[("a", &[0.0]), ("b", &[0.0])])).unwrap();
        assert_eq!(jac["y"]["a"][(0, 0)], 2.0);
    }

    #[test]
    fn test_layout_flatten_scatter() {
        let data = data_map(&[("a", &[1.0, 2.0]), ("b", &[3.0])]);
        let names = vec!["a".to_string(), "b".to_string()];
        let layout = Layout::from_data(&names, &data).unwrap();

        assert_eq!(layout.total, 3);
        assert_eq!(layout.span("b"), Some((2, 1)));

        let flat = layout.flatten(&data);
        assert_eq!(flat.as_slice(), &[1.0, 2.0, 3.0]);

        let mut out = DataMap::new();
        layout.scatter(&DVector::from_column_slice(&[4.0, 5.0, 6.0]), &mut out);
        assert_eq!(out["a"].as_slice(), &[4.0, 5.0]);
        assert_eq!(out["b"][0], 6.0);
    }
}
