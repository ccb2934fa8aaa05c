//! Fixed-point solvers for coupled discipline sets.
//!
//! The [`MdaSolver`] drives a set of coupled disciplines to a
//! self-consistent state: every coupling variable equals the output that
//! produces it. Weak couplings are resolved by a single sweep in
//! topological order; strong couplings are iterated with one of four step
//! strategies selected by [`SolverMethod`]:
//!
//! - **Gauss-Seidel** (default): sequential sweeps with immediate
//!   substitution, later disciplines see the updates of earlier ones.
//! - **Jacobi**: every discipline evaluates from the previous iterate, so
//!   the sweep can be dispatched to a worker pool.
//! - **Newton**: solves the linearized coupled system for the update,
//!   using the per-discipline Jacobian blocks.
//! - **Quasi-Newton**: Broyden rank-one updates of the inverse Jacobian,
//!   no linearization needed after the first step.
//!
//! Termination compares a scaled residual norm against the tolerance; the
//! scaling policy is selected by [`ResidualScaling`]. Gauss-Seidel and
//! Jacobi iterates can additionally be accelerated
//! ([`Acceleration`](acceleration::Acceleration)).
//!
//! # Example
//!
//! ```ignore
//! let config = SolverConfig::default()
//!     .with_method(SolverMethod::Newton)
//!     .with_tolerance(1e-10);
//! let mut solver = MdaSolver::new(disciplines, config)?;
//! let solution = solver.solve(&data_map(&[("x", &[1.0])]))?;
//! assert!(solution.converged);
//! ```

pub mod acceleration;

use std::sync::Arc;

use nalgebra::{DMatrix, DVector};

use crate::coupling::{ConfigurationError, CouplingGraph};
use crate::jacobian::{
    AssemblyError, DerivationMode, JacobianAssembly, LinearAlgebraError, MatrixType,
};
use crate::parallel::ParallelDisciplineRunner;
use crate::{DataMap, Discipline, EvaluationError, JacobianMap, Layout};

pub use acceleration::Acceleration;
use acceleration::{M2dAccelerator, SecantAccelerator};

/// Result type for solver operations.
pub type SolverResult<T> = Result<T, SolverError>;

/// Errors that can occur while solving a coupled system.
#[derive(Debug, thiserror::Error)]
pub enum SolverError {
    /// The iteration budget was exhausted (strict mode only)
    #[error("did not converge after {iterations} iterations (normed residual {residual:.6e})")]
    NotConverged { iterations: usize, residual: f64 },
    /// A discipline failed during a batch sweep (strict mode only)
    #[error("discipline '{0}' failed during a sweep")]
    DisciplineFailed(String),
    /// A coupling variable has neither a default nor a provided value
    #[error("no initial value for coupling variable '{0}'")]
    MissingCoupling(String),
    /// A discipline failed to evaluate or linearize
    #[error(transparent)]
    Evaluation(#[from] EvaluationError),
    /// The coupled linear system could not be solved
    #[error(transparent)]
    LinearAlgebra(#[from] LinearAlgebraError),
    /// The discipline set is inconsistent
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    /// Total-derivative assembly failed
    #[error(transparent)]
    Assembly(#[from] AssemblyError),
}

/// Step strategy for the fixed-point iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SolverMethod {
    /// Sequential sweeps with immediate substitution
    #[default]
    GaussSeidel,
    /// Simultaneous evaluation from the previous iterate
    Jacobi,
    /// Newton steps on the coupled residual
    Newton,
    /// Broyden updates of the inverse coupled Jacobian
    QuasiNewton,
}

/// Scaling applied to the raw residual norm before the tolerance test.
///
/// Denominators derived from the first residual are frozen in solver state
/// the first time they are computed and reused until the solver is reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResidualScaling {
    /// Euclidean norm of the raw residual
    NoScaling,
    /// Norm divided by the first residual norm (1 if the first norm is 0)
    #[default]
    InitialResidualNorm,
    /// Largest per-variable block norm ratio against the first residual
    InitialSubresidualNorm,
    /// Norm divided by the square root of the residual dimension
    NCouplingVariables,
    /// Largest component ratio against the first residual
    InitialResidualComponent,
    /// Norm of the component-wise ratios, divided by sqrt(n)
    ScaledInitialResidualComponent,
}

/// Lifecycle of one [`MdaSolver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SolverStatus {
    /// No run has started yet
    #[default]
    NotStarted,
    /// A run is in progress
    Iterating,
    /// The last run reached the tolerance
    Converged,
    /// The last run stopped at the iteration budget or on a failed sweep
    MaxIterReached,
}

/// One entry of the residual history.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResidualRecord {
    /// Scaled residual norm
    pub normed_residual: f64,
    /// Iteration index within the run
    pub iteration: usize,
    /// True for the first record of a run
    pub is_first: bool,
}

/// Append-only record of the scaled residuals of every iteration.
///
/// The history accumulates across runs; it is cleared only when
/// [`SolverConfig::with_reset_history_each_run`] asks for it or the solver
/// is reset.
#[derive(Debug, Default)]
pub struct ResidualHistory {
    records: Vec<ResidualRecord>,
}

impl ResidualHistory {
    /// All records, oldest first.
    pub fn records(&self) -> &[ResidualRecord] {
        &self.records
    }

    /// The most recent record.
    pub fn last(&self) -> Option<&ResidualRecord> {
        self.records.last()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    fn push(&mut self, record: ResidualRecord) {
        self.records.push(record);
    }

    fn clear(&mut self) {
        self.records.clear();
    }
}

/// Configuration of an [`MdaSolver`].
#[derive(Debug, Clone)]
pub struct SolverConfig {
    /// Step strategy
    pub method: SolverMethod,
    /// Iteration budget per run
    pub max_iterations: usize,
    /// Tolerance on the scaled residual norm
    pub tolerance: f64,
    /// Relative tolerance of the iterative linear solver (sparse path)
    pub linear_solver_tolerance: f64,
    /// Seed each run with the couplings of the previous run
    pub warm_start: bool,
    /// Cache LU factorizations of the coupled matrix between solves
    pub use_lu_factorization: bool,
    /// Residual scaling policy
    pub scaling: ResidualScaling,
    /// Acceleration of the Gauss-Seidel/Jacobi iterates
    pub acceleration: Acceleration,
    /// Workers for batch sweeps; 1 runs sequentially
    pub n_workers: usize,
    /// Representation of the coupled matrix in derivative assembly
    pub matrix_type: MatrixType,
    /// Turn forced stops into errors
    pub strict: bool,
    /// Log one line per iteration with the scaled residual
    pub log_convergence: bool,
    /// Skip re-evaluation before linearization when inputs moved less than
    /// this (0 disables the cache)
    pub exec_cache_tolerance: f64,
    /// Clear the residual history (and frozen scaling denominators) at the
    /// start of every run
    pub reset_history_each_run: bool,
    /// Step length factor for Newton and quasi-Newton updates
    pub newton_relaxation: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        SolverConfig {
            method: SolverMethod::default(),
            max_iterations: 20,
            tolerance: 1e-6,
            linear_solver_tolerance: 1e-12,
            warm_start: false,
            use_lu_factorization: false,
            scaling: ResidualScaling::default(),
            acceleration: Acceleration::default(),
            n_workers: 1,
            matrix_type: MatrixType::default(),
            strict: false,
            log_convergence: false,
            exec_cache_tolerance: 0.0,
            reset_history_each_run: false,
            newton_relaxation: 1.0,
        }
    }
}

impl SolverConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the step strategy.
    pub fn with_method(mut self, method: SolverMethod) -> Self {
        self.method = method;
        self
    }

    /// Sets the iteration budget.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Sets the tolerance on the scaled residual.
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Sets the relative tolerance of the iterative linear solver.
    pub fn with_linear_solver_tolerance(mut self, tolerance: f64) -> Self {
        self.linear_solver_tolerance = tolerance;
        self
    }

    /// Enables warm starting from the previous run.
    pub fn with_warm_start(mut self, warm_start: bool) -> Self {
        self.warm_start = warm_start;
        self
    }

    /// Enables LU factorization caching in derivative assembly.
    pub fn with_lu_factorization(mut self, enabled: bool) -> Self {
        self.use_lu_factorization = enabled;
        self
    }

    /// Sets the residual scaling policy.
    pub fn with_scaling(mut self, scaling: ResidualScaling) -> Self {
        self.scaling = scaling;
        self
    }

    /// Sets the acceleration strategy.
    pub fn with_acceleration(mut self, acceleration: Acceleration) -> Self {
        self.acceleration = acceleration;
        self
    }

    /// Sets the number of workers for batch sweeps.
    pub fn with_n_workers(mut self, n_workers: usize) -> Self {
        self.n_workers = n_workers.max(1);
        self
    }

    /// Sets the coupled matrix representation.
    pub fn with_matrix_type(mut self, matrix_type: MatrixType) -> Self {
        self.matrix_type = matrix_type;
        self
    }

    /// Turns forced stops into errors.
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Logs one line per iteration.
    pub fn with_log_convergence(mut self, enabled: bool) -> Self {
        self.log_convergence = enabled;
        self
    }

    /// Sets the execution cache tolerance (0 disables it).
    pub fn with_exec_cache_tolerance(mut self, tolerance: f64) -> Self {
        self.exec_cache_tolerance = tolerance;
        self
    }

    /// Clears history and scaling state at the start of every run.
    pub fn with_reset_history_each_run(mut self, enabled: bool) -> Self {
        self.reset_history_each_run = enabled;
        self
    }

    /// Sets the Newton/quasi-Newton step length factor.
    pub fn with_newton_relaxation(mut self, relaxation: f64) -> Self {
        self.newton_relaxation = relaxation;
        self
    }
}

/// Converged (or last) state of a run.
#[derive(Debug, Clone)]
pub struct MdaSolution {
    /// All variable values at the final iterate
    pub data: DataMap,
    /// Scaled residual norm at the final iterate
    pub normed_residual: f64,
    /// Whether the tolerance was reached
    pub converged: bool,
    /// Number of iterations performed
    pub iterations: usize,
}

impl MdaSolution {
    /// Value of one variable at the final iterate.
    pub fn coupling(&self, name: &str) -> Option<&DVector<f64>> {
        self.data.get(name)
    }
}

/// Frozen denominators of the residual scaling policies.
#[derive(Debug, Default)]
struct ScalingState {
    norm0: Option<f64>,
    block_norms0: Option<Vec<f64>>,
    components0: Option<DVector<f64>>,
}

impl ScalingState {
    fn clear(&mut self) {
        self.norm0 = None;
        self.block_norms0 = None;
        self.components0 = None;
    }

    fn scale(&mut self, policy: ResidualScaling, r: &DVector<f64>, layout: &Layout) -> f64 {
        let norm = r.norm();
        match policy {
            ResidualScaling::NoScaling => norm,
            ResidualScaling::InitialResidualNorm => {
                let denom = *self.norm0.get_or_insert(if norm > 0.0 { norm } else { 1.0 });
                norm / denom
            }
            ResidualScaling::InitialSubresidualNorm => {
                let blocks: Vec<f64> = layout
                    .blocks()
                    .map(|(_, offset, size)| r.rows(offset, size).norm())
                    .collect();
                let denoms = self.block_norms0.get_or_insert_with(|| {
                    blocks.iter().map(|&b| if b > 0.0 { b } else { 1.0 }).collect()
                });
                blocks
                    .iter()
                    .zip(denoms.iter())
                    .map(|(b, d)| b / d)
                    .fold(0.0, f64::max)
            }
            ResidualScaling::NCouplingVariables => norm / (r.len() as f64).sqrt(),
            ResidualScaling::InitialResidualComponent => {
                let denoms = self
                    .components0
                    .get_or_insert_with(|| r.map(|v| if v.abs() > 0.0 { v.abs() } else { 1.0 }));
                r.iter()
                    .zip(denoms.iter())
                    .map(|(v, d)| (v / d).abs())
                    .fold(0.0, f64::max)
            }
            ResidualScaling::ScaledInitialResidualComponent => {
                let denoms = self
                    .components0
                    .get_or_insert_with(|| r.map(|v| if v.abs() > 0.0 { v.abs() } else { 1.0 }));
                let scaled = DVector::from_iterator(
                    r.len(),
                    r.iter().zip(denoms.iter()).map(|(v, d)| v / d),
                );
                scaled.norm() / (r.len() as f64).sqrt()
            }
        }
    }
}

/// Fixed-point solver for a coupled discipline set.
///
/// Owns the coupling analysis, the residual history, the warm-start state
/// and a derivative assembly configured consistently with the solver.
pub struct MdaSolver {
    disciplines: Vec<Arc<dyn Discipline>>,
    graph: CouplingGraph,
    config: SolverConfig,
    runner: ParallelDisciplineRunner,
    assembly: JacobianAssembly,
    status: SolverStatus,
    history: ResidualHistory,
    scaling_state: ScalingState,
    warm: Option<DataMap>,
}

impl MdaSolver {
    /// Builds the solver, validating the coupling structure.
    pub fn new(
        disciplines: Vec<Arc<dyn Discipline>>,
        config: SolverConfig,
    ) -> Result<Self, ConfigurationError> {
        let graph = CouplingGraph::new(&disciplines)?;
        let runner = ParallelDisciplineRunner::new(config.n_workers);
        let assembly = JacobianAssembly::new(disciplines.clone(), &graph)
            .with_matrix_type(config.matrix_type)
            .with_lu_caching(config.use_lu_factorization)
            .with_linear_solver_tolerance(config.linear_solver_tolerance)
            .with_exec_cache_tolerance(config.exec_cache_tolerance);
        Ok(MdaSolver {
            disciplines,
            graph,
            config,
            runner,
            assembly,
            status: SolverStatus::default(),
            history: ResidualHistory::default(),
            scaling_state: ScalingState::default(),
            warm: None,
        })
    }

    /// The coupling analysis of the discipline set.
    pub fn graph(&self) -> &CouplingGraph {
        &self.graph
    }

    /// The active configuration.
    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn status(&self) -> SolverStatus {
        self.status
    }

    /// Scaled residuals of every iteration so far.
    pub fn residual_history(&self) -> &ResidualHistory {
        &self.history
    }

    /// Clears history, warm-start state and frozen scaling denominators.
    pub fn reset(&mut self) {
        self.history.clear();
        self.scaling_state.clear();
        self.warm = None;
        self.status = SolverStatus::NotStarted;
    }

    /// Total derivatives of `outputs` with respect to `inputs` through the
    /// converged coupled system at `data`.
    pub fn jacobian(
        &mut self,
        data: &DataMap,
        outputs: &[&str],
        inputs: &[&str],
        mode: DerivationMode,
    ) -> SolverResult<JacobianMap> {
        Ok(self.assembly.total_derivatives(data, outputs, inputs, mode)?)
    }

    /// Drives the coupled system to a fixed point.
    ///
    /// `inputs` overrides the discipline defaults; warm-start values of the
    /// coupling variables override both when enabled.
    pub fn solve(&mut self, inputs: &DataMap) -> SolverResult<MdaSolution> {
        if self.config.reset_history_each_run {
            self.history.clear();
            self.scaling_state.clear();
        }
        let data = self.initial_data(inputs);
        self.status = SolverStatus::Iterating;

        let coupled = self.graph.coupled_variables();
        if coupled.is_empty() {
            let mut data = data;
            self.sweep_sequential(&mut data)?;
            self.history.push(ResidualRecord {
                normed_residual: 0.0,
                iteration: 0,
                is_first: true,
            });
            self.status = SolverStatus::Converged;
            self.store_warm(&data, &coupled);
            return Ok(MdaSolution { data, normed_residual: 0.0, converged: true, iterations: 1 });
        }

        self.iterate(data, &coupled)
    }

    fn iterate(&mut self, mut data: DataMap, coupled: &[String]) -> SolverResult<MdaSolution> {
        let layout = Layout::from_data(coupled, &data).map_err(SolverError::MissingCoupling)?;

        let mut secant = SecantAccelerator::with_defaults();
        let mut m2d = M2dAccelerator::with_defaults();
        // Broyden state: approximate inverse of d(g - y)/dy, and the last
        // (step, residual) pair
        let mut inverse_jacobian: Option<DMatrix<f64>> = None;
        let mut previous: Option<(DVector<f64>, DVector<f64>)> = None;

        let mut normed = f64::INFINITY;
        let mut iterations = 0;

        for iteration in 0..self.config.max_iterations {
            iterations = iteration + 1;
            let y_old = layout.flatten(&data);
            // Newton linearizes where the residual is evaluated, i.e. at
            // the iterate the sweep starts from
            let pre_sweep = match self.config.method {
                SolverMethod::Newton => Some(data.clone()),
                _ => None,
            };

            let failed = match self.config.method {
                SolverMethod::GaussSeidel => {
                    self.sweep_sequential(&mut data)?;
                    None
                }
                _ => self.sweep_snapshot(&mut data),
            };
            if let Some(name) = failed {
                self.status = SolverStatus::MaxIterReached;
                if self.config.strict {
                    return Err(SolverError::DisciplineFailed(name));
                }
                log::warn!("discipline '{}' failed, stopping the iteration", name);
                self.store_warm(&data, coupled);
                return Ok(MdaSolution {
                    data,
                    normed_residual: normed,
                    converged: false,
                    iterations: iteration,
                });
            }

            let y_new = layout.flatten(&data);
            let r = &y_new - &y_old;
            normed = self.scaling_state.scale(self.config.scaling, &r, &layout);
            self.history.push(ResidualRecord {
                normed_residual: normed,
                iteration,
                is_first: iteration == 0,
            });
            if self.config.log_convergence {
                log::info!(
                    "{:?} running... Normed residual = {:.2e} (iter. {})",
                    self.config.method,
                    normed,
                    iteration
                );
            }

            if normed <= self.config.tolerance {
                self.status = SolverStatus::Converged;
                self.store_warm(&data, coupled);
                return Ok(MdaSolution {
                    data,
                    normed_residual: normed,
                    converged: true,
                    iterations,
                });
            }

            match self.config.method {
                SolverMethod::GaussSeidel | SolverMethod::Jacobi => {
                    let next = match self.config.acceleration {
                        Acceleration::None => y_new,
                        Acceleration::Secant => secant.accelerate(&y_old, &y_new),
                        Acceleration::M2d => m2d.accelerate(&y_old, &y_new),
                    };
                    layout.scatter(&next, &mut data);
                }
                SolverMethod::Newton => {
                    let point = pre_sweep.as_ref().unwrap_or(&data);
                    let partial = self.coupled_partial_jacobian(point, &layout)?;
                    let system = partial - DMatrix::identity(layout.total, layout.total);
                    let step = match system.lu().solve(&(-&r)) {
                        Some(step) => step,
                        None => return Err(LinearAlgebraError::SingularMatrix.into()),
                    };
                    let next = &y_old + self.config.newton_relaxation * step;
                    layout.scatter(&next, &mut data);
                }
                SolverMethod::QuasiNewton => {
                    let b = inverse_jacobian.get_or_insert_with(|| {
                        -DMatrix::identity(layout.total, layout.total)
                    });
                    if let Some((step_prev, r_prev)) = &previous {
                        let df = &r - r_prev;
                        let bf = &*b * &df;
                        let denom = step_prev.dot(&bf);
                        if denom.abs() > 1e-14 {
                            let left = step_prev - &bf;
                            let right = b.transpose() * step_prev;
                            *b += (left * right.transpose()) / denom;
                        }
                    }
                    let step = -(&*b * &r) * self.config.newton_relaxation;
                    let next = &y_old + &step;
                    layout.scatter(&next, &mut data);
                    previous = Some((step, r));
                }
            }
        }

        self.status = SolverStatus::MaxIterReached;
        log::warn!(
            "{:?} reached the maximum number of iterations ({}) with normed residual {:.2e}",
            self.config.method,
            self.config.max_iterations,
            normed
        );
        self.store_warm(&data, coupled);
        if self.config.strict {
            return Err(SolverError::NotConverged { iterations, residual: normed });
        }
        Ok(MdaSolution { data, normed_residual: normed, converged: false, iterations })
    }

    /// Merges discipline defaults, caller inputs and warm-start values.
    fn initial_data(&self, inputs: &DataMap) -> DataMap {
        let mut data = DataMap::new();
        for disc in &self.disciplines {
            for (name, value) in disc.default_inputs() {
                data.entry(name).or_insert(value);
            }
        }
        for (name, value) in inputs {
            data.insert(name.clone(), value.clone());
        }
        if self.config.warm_start {
            if let Some(warm) = &self.warm {
                for (name, value) in warm {
                    data.insert(name.clone(), value.clone());
                }
            }
        }
        data
    }

    fn store_warm(&mut self, data: &DataMap, coupled: &[String]) {
        let warm: DataMap = coupled
            .iter()
            .filter_map(|name| data.get(name).map(|v| (name.clone(), v.clone())))
            .collect();
        self.warm = Some(warm);
    }

    /// One sweep in topological order with immediate substitution.
    fn sweep_sequential(&self, data: &mut DataMap) -> SolverResult<()> {
        for component in self.graph.execution_sequence() {
            for &i in component {
                let out = self.disciplines[i].evaluate(data)?;
                data.extend(out);
            }
        }
        Ok(())
    }

    /// One batch sweep where every discipline sees the previous iterate.
    ///
    /// Returns the name of the first failed discipline, if any; its output
    /// slots keep their previous values.
    fn sweep_snapshot(&self, data: &mut DataMap) -> Option<String> {
        let snapshot = data.clone();
        let inputs: Vec<DataMap> = self.disciplines.iter().map(|_| snapshot.clone()).collect();
        let results = self.runner.execute(&self.disciplines, &inputs);

        let mut failed = None;
        for (i, result) in results.into_iter().enumerate() {
            match result {
                Some(out) => {
                    data.extend(out);
                }
                None => {
                    failed.get_or_insert_with(|| self.disciplines[i].name().to_string());
                }
            }
        }
        failed
    }

    /// Assembles d(couplings)/d(couplings) from the discipline blocks.
    fn coupled_partial_jacobian(
        &self,
        data: &DataMap,
        layout: &Layout,
    ) -> SolverResult<DMatrix<f64>> {
        let mut matrix = DMatrix::zeros(layout.total, layout.total);
        for disc in &self.disciplines {
            let produced: Vec<(&String, usize, usize)> = disc
                .output_names()
                .iter()
                .filter_map(|o| layout.span(o).map(|(offset, size)| (o, offset, size)))
                .collect();
            if produced.is_empty() {
                continue;
            }
            let jac = disc.linearize(data)?;
            for (output, row_offset, rows) in produced {
                for input in disc.input_names() {
                    let Some((col_offset, cols)) = layout.span(input) else {
                        continue;
                    };
                    let block = jac.get(output).and_then(|row| row.get(input)).ok_or_else(|| {
                        LinearAlgebraError::MissingBlock {
                            discipline: disc.name().to_string(),
                            output: output.clone(),
                            input: input.clone(),
                        }
                    })?;
                    if block.nrows() != rows || block.ncols() != cols {
                        return Err(EvaluationError::ShapeMismatch {
                            discipline: disc.name().to_string(),
                            output: output.clone(),
                            input: input.clone(),
                            rows: block.nrows(),
                            cols: block.ncols(),
                            expected_rows: rows,
                            expected_cols: cols,
                        }
                        .into());
                    }
                    matrix
                        .view_mut((row_offset, col_offset), (rows, cols))
                        .copy_from(block);
                }
            }
        }
        Ok(matrix)
    }
}
