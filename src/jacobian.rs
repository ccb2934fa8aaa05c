//! Total derivatives through a converged coupled system.
//!
//! With the coupled variables written as a fixed point `y = F(y, x)`, the
//! implicit function theorem gives
//!
//! ```text
//! (I - dF/dy) dy/dx = dF/dx
//! ```
//!
//! [`JacobianAssembly`] collects the per-discipline Jacobian blocks into
//! this linear system and chains any non-coupled output `o = f(y, x)`
//! through it:
//!
//! ```text
//! do/dx = df/dx + df/dy * dy/dx
//! ```
//!
//! The system is solved in *direct* mode (one solve per input dimension)
//! or *adjoint* mode (one transposed solve per output dimension); *auto*
//! picks whichever needs fewer solves. The coupled matrix is either
//! assembled densely and LU-factorized, with optional factorization reuse
//! keyed by a content hash of the evaluation point, or kept matrix-free
//! and solved column by column with restarted GMRES.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use nalgebra::{DMatrix, DVector, Dyn, LU};

use crate::coupling::CouplingGraph;
use crate::{DataMap, Discipline, EvaluationError, JacobianMap, Layout};

/// Which form of the coupled linear system is solved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DerivationMode {
    /// One linear solve per input dimension
    Direct,
    /// One transposed solve per output dimension
    Adjoint,
    /// Direct when the inputs are no larger than the outputs, else adjoint
    #[default]
    Auto,
}

/// Representation of the coupled matrix `I - dF/dy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatrixType {
    /// Assembled densely and LU-factorized
    #[default]
    Dense,
    /// Matrix-free block products, solved iteratively
    Sparse,
}

/// Errors raised while solving the coupled linear system.
#[derive(Debug, thiserror::Error)]
pub enum LinearAlgebraError {
    /// The coupled matrix is singular at the evaluation point
    #[error("the coupled system matrix is singular")]
    SingularMatrix,
    /// The iterative solver stalled above its tolerance
    #[error("linear solver did not converge after {iterations} iterations \
             (relative residual {residual:.6e})")]
    NotConverged { iterations: usize, residual: f64 },
    /// A discipline did not provide a declared Jacobian block
    #[error("discipline '{discipline}' provided no jacobian block d{output}/d{input}")]
    MissingBlock { discipline: String, output: String, input: String },
    /// A requested variable is not part of the analysis
    #[error("unknown variable '{0}'")]
    UnknownVariable(String),
}

/// Errors raised by [`JacobianAssembly::total_derivatives`].
#[derive(Debug, thiserror::Error)]
pub enum AssemblyError {
    /// A discipline failed to evaluate or linearize
    #[error(transparent)]
    Evaluation(#[from] EvaluationError),
    /// The coupled linear system could not be solved
    #[error(transparent)]
    LinearAlgebra(#[from] LinearAlgebraError),
}

/// Assembles total derivatives of outputs with respect to inputs through
/// the coupled system.
///
/// The assembly owns two caches: LU factorizations of the coupled matrix
/// (and its transpose), keyed by a content hash of the evaluation point,
/// and the last evaluation inputs of each discipline, used to skip
/// re-evaluation when the point moved less than `exec_cache_tolerance`.
pub struct JacobianAssembly {
    disciplines: Vec<Arc<dyn Discipline>>,
    couplings: Vec<String>,
    producers: HashMap<String, usize>,
    sequence: Vec<Vec<usize>>,
    matrix_type: MatrixType,
    lu_caching: bool,
    linear_solver_tolerance: f64,
    exec_cache_tolerance: f64,
    lu_cache: Option<(u64, LU<f64, Dyn, Dyn>)>,
    lu_cache_transposed: Option<(u64, LU<f64, Dyn, Dyn>)>,
    exec_cache: HashMap<usize, DataMap>,
}

impl JacobianAssembly {
    /// Builds an assembly over every coupling of `graph`, weak ones
    /// included (a derivative path may run through a single-sweep
    /// variable); self-residual variables are excluded.
    pub fn new(disciplines: Vec<Arc<dyn Discipline>>, graph: &CouplingGraph) -> Self {
        let producers = disciplines
            .iter()
            .enumerate()
            .flat_map(|(i, disc)| {
                disc.output_names().iter().map(move |o| (o.clone(), i))
            })
            .collect();
        JacobianAssembly {
            couplings: graph.unresolved_couplings(),
            sequence: graph.execution_sequence().to_vec(),
            disciplines,
            producers,
            matrix_type: MatrixType::default(),
            lu_caching: false,
            linear_solver_tolerance: 1e-12,
            exec_cache_tolerance: 0.0,
            lu_cache: None,
            lu_cache_transposed: None,
            exec_cache: HashMap::new(),
        }
    }

    /// Sets the coupled matrix representation.
    pub fn with_matrix_type(mut self, matrix_type: MatrixType) -> Self {
        self.matrix_type = matrix_type;
        self
    }

    /// Enables reuse of LU factorizations across calls at the same point.
    pub fn with_lu_caching(mut self, enabled: bool) -> Self {
        self.lu_caching = enabled;
        self
    }

    /// Sets the relative tolerance of the iterative solver.
    pub fn with_linear_solver_tolerance(mut self, tolerance: f64) -> Self {
        self.linear_solver_tolerance = tolerance;
        self
    }

    /// Sets the re-evaluation skip tolerance (0 disables the cache).
    pub fn with_exec_cache_tolerance(mut self, tolerance: f64) -> Self {
        self.exec_cache_tolerance = tolerance;
        self
    }

    /// Computes d(outputs)/d(inputs) through the coupled system at `point`.
    ///
    /// The point is refreshed by one sweep in execution order before
    /// linearization, so callers may pass inputs only; passing the
    /// converged state of a solve avoids re-evaluations.
    pub fn total_derivatives(
        &mut self,
        point: &DataMap,
        outputs: &[&str],
        inputs: &[&str],
        mode: DerivationMode,
    ) -> Result<JacobianMap, AssemblyError> {
        let data = self.refresh(point)?;
        let jacobians = self.linearize_all(&data)?;
        let layout = Layout::from_data(&self.couplings, &data)
            .map_err(LinearAlgebraError::UnknownVariable)?;
        let n = layout.total;

        // Blocks of dF/dy over all couplings
        let mut partial_blocks: Vec<(usize, usize, DMatrix<f64>)> = Vec::new();
        let mut coupling_producers: Vec<usize> = Vec::with_capacity(self.couplings.len());
        for name in &self.couplings {
            let p = *self
                .producers
                .get(name)
                .ok_or_else(|| LinearAlgebraError::UnknownVariable(name.clone()))?;
            coupling_producers.push(p);
            let Some((row, _)) = layout.span(name) else { continue };
            for input in self.disciplines[p].input_names() {
                if let Some((col, _)) = layout.span(input) {
                    let block =
                        block_of(&jacobians[p], name, input, self.disciplines[p].name())?;
                    partial_blocks.push((row, col, block.clone()));
                }
            }
        }

        // Column spans of the requested inputs in the stacked right-hand side
        let mut input_spans: Vec<(String, usize, usize)> = Vec::with_capacity(inputs.len());
        let mut total_in = 0;
        for x in inputs {
            let dim = data
                .get(*x)
                .ok_or_else(|| LinearAlgebraError::UnknownVariable(x.to_string()))?
                .len();
            input_spans.push((x.to_string(), total_in, dim));
            total_in += dim;
        }

        // dF/dx, one column group per input
        let mut rhs = DMatrix::zeros(n, total_in);
        for (name, &p) in self.couplings.iter().zip(coupling_producers.iter()) {
            let disc = &self.disciplines[p];
            let Some((row, rows)) = layout.span(name) else { continue };
            for (x, offset, dim) in &input_spans {
                if disc.input_names().iter().any(|i| i == x) {
                    let block = block_of(&jacobians[p], name, x, disc.name())?;
                    rhs.view_mut((row, *offset), (rows, *dim)).copy_from(block);
                }
            }
        }

        // Row spans of the requested outputs, the selector/chain matrix C
        // (do/dy) and the direct term D (do/dx)
        let mut output_spans: Vec<(String, usize, usize)> = Vec::with_capacity(outputs.len());
        let mut total_out = 0;
        for o in outputs {
            let dim = data
                .get(*o)
                .ok_or_else(|| LinearAlgebraError::UnknownVariable(o.to_string()))?
                .len();
            output_spans.push((o.to_string(), total_out, dim));
            total_out += dim;
        }

        let mut chain = DMatrix::zeros(total_out, n);
        let mut direct_term = DMatrix::zeros(total_out, total_in);
        for (o, out_offset, out_dim) in &output_spans {
            if let Some((row, _)) = layout.span(o) {
                // Coupled output: its total derivative is a row block of
                // dy/dx, selected by an identity block in C
                for k in 0..*out_dim {
                    chain[(out_offset + k, row + k)] = 1.0;
                }
                continue;
            }
            let p = *self
                .producers
                .get(o)
                .ok_or_else(|| LinearAlgebraError::UnknownVariable(o.clone()))?;
            let disc = &self.disciplines[p];
            for input in disc.input_names() {
                if let Some((col, cols)) = layout.span(input) {
                    let block = block_of(&jacobians[p], o, input, disc.name())?;
                    chain
                        .view_mut((*out_offset, col), (*out_dim, cols))
                        .copy_from(block);
                }
            }
            for (x, in_offset, in_dim) in &input_spans {
                if disc.input_names().iter().any(|i| i == x) {
                    let block = block_of(&jacobians[p], o, x, disc.name())?;
                    direct_term
                        .view_mut((*out_offset, *in_offset), (*out_dim, *in_dim))
                        .copy_from(block);
                }
            }
        }

        let mode = match mode {
            DerivationMode::Auto if total_in <= total_out => DerivationMode::Direct,
            DerivationMode::Auto => DerivationMode::Adjoint,
            fixed => fixed,
        };

        // J = D + C * (I - dF/dy)^-1 * dF/dx; the adjoint path solves the
        // transposed system for C instead
        let key = point_hash(&data);
        let jacobian = if n == 0 {
            direct_term
        } else {
            match (mode, self.matrix_type) {
                (DerivationMode::Direct | DerivationMode::Auto, MatrixType::Dense) => {
                    let w = self.solve_dense(key, false, &rhs, &partial_blocks, n)?;
                    &direct_term + &chain * w
                }
                (DerivationMode::Adjoint, MatrixType::Dense) => {
                    let lambda =
                        self.solve_dense(key, true, &chain.transpose(), &partial_blocks, n)?;
                    &direct_term + lambda.transpose() * &rhs
                }
                (DerivationMode::Direct | DerivationMode::Auto, MatrixType::Sparse) => {
                    let apply = |v: &DVector<f64>| {
                        let mut out = v.clone();
                        for (r, c, block) in &partial_blocks {
                            let update = block * v.rows(*c, block.ncols());
                            let mut rows = out.rows_mut(*r, block.nrows());
                            rows -= update;
                        }
                        out
                    };
                    let w = solve_iterative(apply, &rhs, self.linear_solver_tolerance)?;
                    &direct_term + &chain * w
                }
                (DerivationMode::Adjoint, MatrixType::Sparse) => {
                    let apply = |v: &DVector<f64>| {
                        let mut out = v.clone();
                        for (r, c, block) in &partial_blocks {
                            let update = block.transpose() * v.rows(*r, block.nrows());
                            let mut rows = out.rows_mut(*c, block.ncols());
                            rows -= update;
                        }
                        out
                    };
                    let lambda = solve_iterative(
                        apply,
                        &chain.transpose(),
                        self.linear_solver_tolerance,
                    )?;
                    &direct_term + lambda.transpose() * &rhs
                }
            }
        };

        let mut result: JacobianMap = HashMap::new();
        for (o, out_offset, out_dim) in &output_spans {
            let mut row = HashMap::new();
            for (x, in_offset, in_dim) in &input_spans {
                let block = jacobian
                    .view((*out_offset, *in_offset), (*out_dim, *in_dim))
                    .into_owned();
                row.insert(x.clone(), block);
            }
            result.insert(o.clone(), row);
        }
        Ok(result)
    }

    /// One sweep in execution order so every output is consistent with
    /// `point`, honouring the exec cache.
    ///
    /// Discipline defaults seed the sweep; `point` overrides them.
    fn refresh(&mut self, point: &DataMap) -> Result<DataMap, AssemblyError> {
        let mut data = DataMap::new();
        for disc in &self.disciplines {
            for (name, value) in disc.default_inputs() {
                data.entry(name).or_insert(value);
            }
        }
        for (name, value) in point {
            data.insert(name.clone(), value.clone());
        }
        let order: Vec<usize> = self.sequence.iter().flatten().copied().collect();
        for i in order {
            let disc = &self.disciplines[i];
            if self.exec_cache_tolerance > 0.0 {
                let current: DataMap = disc
                    .input_names()
                    .iter()
                    .filter_map(|name| data.get(name).map(|v| (name.clone(), v.clone())))
                    .collect();
                let fresh_outputs = disc.output_names().iter().all(|o| data.contains_key(o));
                let hit = fresh_outputs
                    && self
                        .exec_cache
                        .get(&i)
                        .is_some_and(|cached| {
                            within_tolerance(cached, &current, self.exec_cache_tolerance)
                        });
                if hit {
                    continue;
                }
                let out = disc.evaluate(&data)?;
                data.extend(out);
                self.exec_cache.insert(i, current);
            } else {
                let out = disc.evaluate(&data)?;
                data.extend(out);
            }
        }
        Ok(data)
    }

    /// Linearizes every discipline and validates that each declared
    /// (output, input) block exists with the right shape.
    fn linearize_all(&self, data: &DataMap) -> Result<Vec<JacobianMap>, AssemblyError> {
        let mut all = Vec::with_capacity(self.disciplines.len());
        for disc in &self.disciplines {
            let jac = disc.linearize(data)?;
            for output in disc.output_names() {
                let rows = data
                    .get(output)
                    .ok_or_else(|| LinearAlgebraError::UnknownVariable(output.clone()))?
                    .len();
                for input in disc.input_names() {
                    let cols = data
                        .get(input)
                        .ok_or_else(|| LinearAlgebraError::UnknownVariable(input.clone()))?
                        .len();
                    let block = block_of(&jac, output, input, disc.name())?;
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
                }
            }
            all.push(jac);
        }
        Ok(all)
    }

    /// Solves the dense coupled system, reusing the cached factorization
    /// when the point hash matches.
    fn solve_dense(
        &mut self,
        key: u64,
        transposed: bool,
        rhs: &DMatrix<f64>,
        blocks: &[(usize, usize, DMatrix<f64>)],
        n: usize,
    ) -> Result<DMatrix<f64>, LinearAlgebraError> {
        let slot = if transposed { &mut self.lu_cache_transposed } else { &mut self.lu_cache };
        let hit = self.lu_caching && matches!(slot, Some((k, _)) if *k == key);
        if !hit {
            let mut matrix = DMatrix::identity(n, n);
            for (r, c, block) in blocks {
                let mut view = matrix.view_mut((*r, *c), (block.nrows(), block.ncols()));
                view -= block;
            }
            if transposed {
                matrix = matrix.transpose();
            }
            *slot = Some((key, matrix.lu()));
        }
        let Some((_, lu)) = slot else {
            return Err(LinearAlgebraError::SingularMatrix);
        };
        lu.solve(rhs).ok_or(LinearAlgebraError::SingularMatrix)
    }
}

fn block_of<'a>(
    jac: &'a JacobianMap,
    output: &str,
    input: &str,
    discipline: &str,
) -> Result<&'a DMatrix<f64>, LinearAlgebraError> {
    jac.get(output)
        .and_then(|row| row.get(input))
        .ok_or_else(|| LinearAlgebraError::MissingBlock {
            discipline: discipline.to_string(),
            output: output.to_string(),
            input: input.to_string(),
        })
}

/// Content hash of a data map, insensitive to map iteration order.
fn point_hash(data: &DataMap) -> u64 {
    let mut names: Vec<&String> = data.keys().collect();
    names.sort();
    let mut hasher = DefaultHasher::new();
    for name in names {
        name.hash(&mut hasher);
        for value in &data[name] {
            value.to_bits().hash(&mut hasher);
        }
    }
    hasher.finish()
}

/// Per-name l-infinity comparison of two input snapshots.
fn within_tolerance(cached: &DataMap, current: &DataMap, tolerance: f64) -> bool {
    if cached.len() != current.len() {
        return false;
    }
    current.iter().all(|(name, value)| match cached.get(name) {
        Some(old) if old.len() == value.len() => (old - value).amax() <= tolerance,
        _ => false,
    })
}

/// Solves one system per right-hand-side column with restarted GMRES.
fn solve_iterative<A>(
    apply: A,
    rhs: &DMatrix<f64>,
    tolerance: f64,
) -> Result<DMatrix<f64>, LinearAlgebraError>
where
    A: Fn(&DVector<f64>) -> DVector<f64>,
{
    let mut solution = DMatrix::zeros(rhs.nrows(), rhs.ncols());
    for j in 0..rhs.ncols() {
        let column = gmres(&apply, &rhs.column(j).into_owned(), tolerance)?;
        solution.set_column(j, &column);
    }
    Ok(solution)
}

const GMRES_RESTART: usize = 50;
const GMRES_MAX_OUTER: usize = 100;

/// Restarted GMRES with modified Gram-Schmidt orthogonalization and Givens
/// rotations on the Hessenberg system.
///
/// `tolerance` is relative to the right-hand-side norm; a zero right-hand
/// side yields the zero solution.
fn gmres<A>(apply: A, b: &DVector<f64>, tolerance: f64) -> Result<DVector<f64>, LinearAlgebraError>
where
    A: Fn(&DVector<f64>) -> DVector<f64>,
{
    let n = b.len();
    let b_norm = b.norm();
    if n == 0 || b_norm == 0.0 {
        return Ok(DVector::zeros(n));
    }
    let restart = n.min(GMRES_RESTART);

    let mut x = DVector::zeros(n);
    let mut relative = f64::INFINITY;
    for _ in 0..GMRES_MAX_OUTER {
        let r = b - apply(&x);
        let beta = r.norm();
        relative = beta / b_norm;
        if relative <= tolerance {
            return Ok(x);
        }

        let mut basis: Vec<DVector<f64>> = vec![r / beta];
        let mut h = DMatrix::zeros(restart + 1, restart);
        let mut cs = vec![0.0; restart];
        let mut sn = vec![0.0; restart];
        let mut g = DVector::zeros(restart + 1);
        g[0] = beta;

        let mut used = 0;
        for k in 0..restart {
            let mut w = apply(&basis[k]);
            for j in 0..=k {
                h[(j, k)] = basis[j].dot(&w);
                w -= &basis[j] * h[(j, k)];
            }
            let h_next = w.norm();
            h[(k + 1, k)] = h_next;
            if h_next > 1e-14 {
                basis.push(w / h_next);
            }

            for j in 0..k {
                let upper = h[(j, k)];
                let lower = h[(j + 1, k)];
                h[(j, k)] = cs[j] * upper + sn[j] * lower;
                h[(j + 1, k)] = -sn[j] * upper + cs[j] * lower;
            }
            let denom = (h[(k, k)].powi(2) + h[(k + 1, k)].powi(2)).sqrt();
            if denom > 0.0 {
                cs[k] = h[(k, k)] / denom;
                sn[k] = h[(k + 1, k)] / denom;
            } else {
                cs[k] = 1.0;
                sn[k] = 0.0;
            }
            h[(k, k)] = cs[k] * h[(k, k)] + sn[k] * h[(k + 1, k)];
            h[(k + 1, k)] = 0.0;
            g[k + 1] = -sn[k] * g[k];
            g[k] *= cs[k];

            used = k + 1;
            if g[k + 1].abs() / b_norm <= tolerance || h_next <= 1e-14 {
                break;
            }
        }

        // Back substitution on the rotated Hessenberg system
        let mut y = DVector::zeros(used);
        for i in (0..used).rev() {
            let mut sum = g[i];
            for j in i + 1..used {
                sum -= h[(i, j)] * y[j];
            }
            if h[(i, i)] == 0.0 {
                return Err(LinearAlgebraError::SingularMatrix);
            }
            y[i] = sum / h[(i, i)];
        }
        for i in 0..used {
            x += &basis[i] * y[i];
        }
    }

    Err(LinearAlgebraError::NotConverged {
        iterations: GMRES_MAX_OUTER * restart,
        residual: relative,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{data_map, FnDiscipline};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn scalar_block(value: f64) -> DMatrix<f64> {
        DMatrix::from_element(1, 1, value)
    }

    fn jac_entry(blocks: &[(&str, &str, f64)]) -> JacobianMap {
        let mut jac: JacobianMap = HashMap::new();
        for (output, input, value) in blocks {
            jac.entry(output.to_string())
                .or_default()
                .insert(input.to_string(), scalar_block(*value));
        }
        jac
    }

    // y1 = 2*x + 0.5*y2, y2 = 0.3*y1, f = y1 + 3*x
    // dy1/dx = 2/0.85, dy2/dx = 0.6/0.85, df/dx = dy1/dx + 3
    fn linear_system() -> (Vec<Arc<dyn Discipline>>, CouplingGraph) {
        let one = FnDiscipline::new("one", &["x", "y2"], &["y1"], |data| {
            Ok(data_map(&[("y1", &[2.0 * data["x"][0] + 0.5 * data["y2"][0]])]))
        })
        .with_default("x", DVector::from_element(1, 1.0))
        .with_default("y2", DVector::from_element(1, 0.0))
        .with_jacobian(|_| Ok(jac_entry(&[("y1", "x", 2.0), ("y1", "y2", 0.5)])));

        let two = FnDiscipline::new("two", &["y1"], &["y2"], |data| {
            Ok(data_map(&[("y2", &[0.3 * data["y1"][0]])]))
        })
        .with_default("y1", DVector::from_element(1, 0.0))
        .with_jacobian(|_| Ok(jac_entry(&[("y2", "y1", 0.3)])));

        let report = FnDiscipline::new("report", &["x", "y1"], &["f"], |data| {
            Ok(data_map(&[("f", &[data["y1"][0] + 3.0 * data["x"][0]])]))
        })
        .with_jacobian(|_| Ok(jac_entry(&[("f", "x", 3.0), ("f", "y1", 1.0)])));

        let disciplines: Vec<Arc<dyn Discipline>> =
            vec![Arc::new(one), Arc::new(two), Arc::new(report)];
        let graph = CouplingGraph::new(&disciplines).unwrap();
        (disciplines, graph)
    }

    fn assert_linear_derivatives(jac: &JacobianMap) {
        let dy1 = 2.0 / 0.85;
        assert!((jac["y1"]["x"][(0, 0)] - dy1).abs() < 1e-10);
        assert!((jac["y2"]["x"][(0, 0)] - 0.3 * dy1).abs() < 1e-10);
        assert!((jac["f"]["x"][(0, 0)] - (dy1 + 3.0)).abs() < 1e-10);
    }

    #[test]
    fn test_direct_mode_matches_analytic() {
        let (disciplines, graph) = linear_system();
        let mut assembly = JacobianAssembly::new(disciplines, &graph);
        let point = data_map(&[("x", &[1.0])]);
        let jac = assembly
            .total_derivatives(&point, &["y1", "y2", "f"], &["x"], DerivationMode::Direct)
            .unwrap();
        assert_linear_derivatives(&jac);
    }

    #[test]
    fn test_adjoint_mode_matches_direct() {
        let (disciplines, graph) = linear_system();
        let mut assembly = JacobianAssembly::new(disciplines, &graph);
        let point = data_map(&[("x", &[1.0])]);
        let jac = assembly
            .total_derivatives(&point, &["y1", "y2", "f"], &["x"], DerivationMode::Adjoint)
            .unwrap();
        assert_linear_derivatives(&jac);
    }

    #[test]
    fn test_auto_mode_matches_analytic() {
        let (disciplines, graph) = linear_system();
        let mut assembly = JacobianAssembly::new(disciplines, &graph);
        let point = data_map(&[("x", &[1.0])]);
        let jac = assembly
            .total_derivatives(&point, &["y1", "y2", "f"], &["x"], DerivationMode::Auto)
            .unwrap();
        assert_linear_derivatives(&jac);
    }

    #[test]
    fn test_sparse_matches_dense() {
        let (disciplines, graph) = linear_system();
        let mut assembly = JacobianAssembly::new(disciplines, &graph)
            .with_matrix_type(MatrixType::Sparse)
            .with_linear_solver_tolerance(1e-14);
        let point = data_map(&[("x", &[1.0])]);

        let direct = assembly
            .total_derivatives(&point, &["y1", "y2", "f"], &["x"], DerivationMode::Direct)
            .unwrap();
        assert_linear_derivatives(&direct);

        let adjoint = assembly
            .total_derivatives(&point, &["y1", "y2", "f"], &["x"], DerivationMode::Adjoint)
            .unwrap();
        assert_linear_derivatives(&adjoint);
    }

    // c_out = 2*x feeds both the a<->b cycle and a downstream chain, so
    // every requested derivative runs through a weakly coupled variable:
    // a_out = c_out + 0.5*b_out, b_out = 0.25*a_out, d_out = c_out + 1
    // da_out/dx = 2/0.875, db_out/dx = 0.25*2/0.875, dd_out/dx = 2
    fn weak_mediated_system() -> (Vec<Arc<dyn Discipline>>, CouplingGraph) {
        let c = FnDiscipline::new("c", &["x"], &["c_out"], |data| {
            Ok(data_map(&[("c_out", &[2.0 * data["x"][0]])]))
        })
        .with_jacobian(|_| Ok(jac_entry(&[("c_out", "x", 2.0)])));

        let a = FnDiscipline::new("a", &["c_out", "b_out"], &["a_out"], |data| {
            Ok(data_map(&[("a_out", &[data["c_out"][0] + 0.5 * data["b_out"][0]])]))
        })
        .with_default("b_out", DVector::from_element(1, 0.0))
        .with_jacobian(|_| Ok(jac_entry(&[("a_out", "c_out", 1.0), ("a_out", "b_out", 0.5)])));

        let b = FnDiscipline::new("b", &["a_out"], &["b_out"], |data| {
            Ok(data_map(&[("b_out", &[0.25 * data["a_out"][0]])]))
        })
        .with_default("a_out", DVector::from_element(1, 0.0))
        .with_jacobian(|_| Ok(jac_entry(&[("b_out", "a_out", 0.25)])));

        let d = FnDiscipline::new("d", &["c_out"], &["d_out"], |data| {
            Ok(data_map(&[("d_out", &[data["c_out"][0] + 1.0])]))
        })
        .with_jacobian(|_| Ok(jac_entry(&[("d_out", "c_out", 1.0)])));

        let disciplines: Vec<Arc<dyn Discipline>> =
            vec![Arc::new(c), Arc::new(a), Arc::new(b), Arc::new(d)];
        let graph = CouplingGraph::new(&disciplines).unwrap();
        (disciplines, graph)
    }

    fn assert_weak_mediated_derivatives(jac: &JacobianMap) {
        let da = 2.0 / 0.875;
        assert!((jac["a_out"]["x"][(0, 0)] - da).abs() < 1e-10);
        assert!((jac["b_out"]["x"][(0, 0)] - 0.25 * da).abs() < 1e-10);
        assert!((jac["d_out"]["x"][(0, 0)] - 2.0).abs() < 1e-10);
    }

    #[test]
    fn test_derivatives_through_weak_couplings() {
        let (disciplines, graph) = weak_mediated_system();
        let mut assembly = JacobianAssembly::new(disciplines, &graph);
        let point = data_map(&[("x", &[1.0])]);
        let outputs = ["a_out", "b_out", "d_out"];

        let direct = assembly
            .total_derivatives(&point, &outputs, &["x"], DerivationMode::Direct)
            .unwrap();
        assert_weak_mediated_derivatives(&direct);

        let adjoint = assembly
            .total_derivatives(&point, &outputs, &["x"], DerivationMode::Adjoint)
            .unwrap();
        assert_weak_mediated_derivatives(&adjoint);
    }

    #[test]
    fn test_lu_cache_refreshes_at_new_point() {
        // y1 = x^2 + 0.5*y2 makes dy1/dx point-dependent
        let one = FnDiscipline::new("one", &["x", "y2"], &["y1"], |data| {
            let x = data["x"][0];
            Ok(data_map(&[("y1", &[x * x + 0.5 * data["y2"][0]])]))
        })
        .with_default("y2", DVector::from_element(1, 0.0))
        .with_jacobian(|data| {
            Ok(jac_entry(&[("y1", "x", 2.0 * data["x"][0]), ("y1", "y2", 0.5)]))
        });
        let two = FnDiscipline::new("two", &["y1"], &["y2"], |data| {
            Ok(data_map(&[("y2", &[0.3 * data["y1"][0]])]))
        })
        .with_default("y1", DVector::from_element(1, 0.0))
        .with_jacobian(|_| Ok(jac_entry(&[("y2", "y1", 0.3)])));

        let disciplines: Vec<Arc<dyn Discipline>> = vec![Arc::new(one), Arc::new(two)];
        let graph = CouplingGraph::new(&disciplines).unwrap();
        let mut assembly = JacobianAssembly::new(disciplines, &graph).with_lu_caching(true);

        let at = |assembly: &mut JacobianAssembly, x: f64| {
            let jac = assembly
                .total_derivatives(
                    &data_map(&[("x", &[x])]),
                    &["y1"],
                    &["x"],
                    DerivationMode::Direct,
                )
                .unwrap();
            jac["y1"]["x"][(0, 0)]
        };

        assert!((at(&mut assembly, 1.0) - 2.0 / 0.85).abs() < 1e-10);
        // A second call at the same point hits the cache
        assert!((at(&mut assembly, 1.0) - 2.0 / 0.85).abs() < 1e-10);
        // A different point must not reuse the stale factorization
        assert!((at(&mut assembly, 2.0) - 4.0 / 0.85).abs() < 1e-10);
    }

    #[test]
    fn test_missing_block_is_reported() {
        let one = FnDiscipline::new("one", &["x", "y2"], &["y1"], |data| {
            Ok(data_map(&[("y1", &[data["x"][0] + 0.5 * data["y2"][0]])]))
        })
        .with_default("y2", DVector::from_element(1, 0.0))
        // d y1/d y2 is deliberately absent
        .with_jacobian(|_| Ok(jac_entry(&[("y1", "x", 1.0)])));
        let two = FnDiscipline::new("two", &["y1"], &["y2"], |data| {
            Ok(data_map(&[("y2", &[0.3 * data["y1"][0]])]))
        })
        .with_default("y1", DVector::from_element(1, 0.0))
        .with_jacobian(|_| Ok(jac_entry(&[("y2", "y1", 0.3)])));

        let disciplines: Vec<Arc<dyn Discipline>> = vec![Arc::new(one), Arc::new(two)];
        let graph = CouplingGraph::new(&disciplines).unwrap();
        let mut assembly = JacobianAssembly::new(disciplines, &graph);

        let err = assembly
            .total_derivatives(&data_map(&[("x", &[1.0])]), &["y1"], &["x"], DerivationMode::Direct)
            .unwrap_err();
        assert!(matches!(
            err,
            AssemblyError::LinearAlgebra(LinearAlgebraError::MissingBlock { ref input, .. })
                if input == "y2"
        ));
    }

    #[test]
    fn test_wrong_block_shape_is_reported() {
        let disc = FnDiscipline::new("square", &["x"], &["y"], |data| {
            Ok(data_map(&[("y", &[data["x"][0] * data["x"][0]])]))
        })
        .with_jacobian(|_| {
            let mut jac: JacobianMap = HashMap::new();
            let mut row = HashMap::new();
            row.insert("x".to_string(), DMatrix::zeros(2, 3));
            jac.insert("y".to_string(), row);
            Ok(jac)
        });

        let disciplines: Vec<Arc<dyn Discipline>> = vec![Arc::new(disc)];
        let graph = CouplingGraph::new(&disciplines).unwrap();
        let mut assembly = JacobianAssembly::new(disciplines, &graph);

        let err = assembly
            .total_derivatives(&data_map(&[("x", &[1.0])]), &["y"], &["x"], DerivationMode::Direct)
            .unwrap_err();
        assert!(matches!(
            err,
            AssemblyError::Evaluation(EvaluationError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_unknown_input_is_rejected() {
        let (disciplines, graph) = linear_system();
        let mut assembly = JacobianAssembly::new(disciplines, &graph);
        let err = assembly
            .total_derivatives(
                &data_map(&[("x", &[1.0])]),
                &["y1"],
                &["nonexistent"],
                DerivationMode::Direct,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            AssemblyError::LinearAlgebra(LinearAlgebraError::UnknownVariable(ref name))
                if name == "nonexistent"
        ));
    }

    #[test]
    fn test_exec_cache_skips_reevaluation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let disc = FnDiscipline::new("counted", &["x"], &["y"], move |data| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(data_map(&[("y", &[2.0 * data["x"][0]])]))
        });

        let disciplines: Vec<Arc<dyn Discipline>> = vec![Arc::new(disc)];
        let graph = CouplingGraph::new(&disciplines).unwrap();
        let mut assembly =
            JacobianAssembly::new(disciplines, &graph).with_exec_cache_tolerance(1e-9);

        // The point carries the output, so a cache hit can skip evaluation
        let point = data_map(&[("x", &[1.0]), ("y", &[2.0])]);
        assembly
            .total_derivatives(&point, &["y"], &["x"], DerivationMode::Direct)
            .unwrap();
        let after_first = calls.load(Ordering::SeqCst);
        assert!(after_first >= 1);

        assembly
            .total_derivatives(&point, &["y"], &["x"], DerivationMode::Direct)
            .unwrap();
        // Only the finite-difference linearization re-evaluates; the
        // refresh sweep is skipped
        assert_eq!(calls.load(Ordering::SeqCst), 2 * after_first - 1);
    }

    #[test]
    fn test_gmres_small_system() {
        let matrix = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 3.0]);
        let apply = |v: &DVector<f64>| &matrix * v;
        let b = DVector::from_column_slice(&[1.0, 2.0]);

        let x = gmres(apply, &b, 1e-12).unwrap();
        let residual = &b - &matrix * &x;
        assert!(residual.norm() < 1e-10);
    }

    #[test]
    fn test_gmres_zero_rhs() {
        let apply = |v: &DVector<f64>| v.clone();
        let x = gmres(apply, &DVector::zeros(3), 1e-12).unwrap();
        assert_eq!(x, DVector::zeros(3));
    }
}
