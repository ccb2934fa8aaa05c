//! Batch execution of independent discipline calls on a worker pool.
//!
//! The runner owns an optional rayon pool and dispatches evaluation or
//! linearization batches to it. Results come back by index; a failed call
//! yields a `None` slot and a logged warning, and never cancels its
//! siblings. With a single worker the batch runs sequentially in the
//! calling thread.

use std::sync::Arc;

use rayon::prelude::*;

use crate::{DataMap, Discipline, JacobianMap};

/// Dispatches batches of discipline calls to a worker pool.
pub struct ParallelDisciplineRunner {
    n_workers: usize,
    pool: Option<rayon::ThreadPool>,
}

impl ParallelDisciplineRunner {
    /// Creates a runner with the given number of workers.
    ///
    /// `n_workers <= 1` disables the pool entirely.
    pub fn new(n_workers: usize) -> Self {
        let pool = if n_workers > 1 {
            match rayon::ThreadPoolBuilder::new().num_threads(n_workers).build() {
                Ok(pool) => Some(pool),
                Err(err) => {
                    log::warn!("failed to build a {} worker pool, running sequentially: {}",
                        n_workers, err);
                    None
                }
            }
        } else {
            None
        };
        ParallelDisciplineRunner { n_workers, pool }
    }

    /// Number of workers requested at construction.
    pub fn n_workers(&self) -> usize {
        self.n_workers
    }

    /// Evaluates each discipline on its paired input map.
    ///
    /// The result has one slot per call, in order; failures become `None`.
    pub fn execute(
        &self,
        disciplines: &[Arc<dyn Discipline>],
        inputs: &[DataMap],
    ) -> Vec<Option<DataMap>> {
        let run = |disc: &Arc<dyn Discipline>, data: &DataMap| match disc.evaluate(data) {
            Ok(out) => Some(out),
            Err(err) => {
                log::warn!("discipline '{}' failed during a batch evaluation: {}",
                    disc.name(), err);
                None
            }
        };
        match &self.pool {
            Some(pool) => pool.install(|| {
                disciplines
                    .par_iter()
                    .zip(inputs.par_iter())
                    .map(|(disc, data)| run(disc, data))
                    .collect()
            }),
            None => disciplines
                .iter()
                .zip(inputs.iter())
                .map(|(disc, data)| run(disc, data))
                .collect(),
        }
    }

    /// Linearizes each discipline on its paired input map.
    pub fn linearize(
        &self,
        disciplines: &[Arc<dyn Discipline>],
        inputs: &[DataMap],
    ) -> Vec<Option<JacobianMap>> {
        let run = |disc: &Arc<dyn Discipline>, data: &DataMap| match disc.linearize(data) {
            Ok(jac) => Some(jac),
            Err(err) => {
                log::warn!("discipline '{}' failed during a batch linearization: {}",
                    disc.name(), err);
                None
            }
        };
        match &self.pool {
            Some(pool) => pool.install(|| {
                disciplines
                    .par_iter()
                    .zip(inputs.par_iter())
                    .map(|(disc, data)| run(disc, data))
                    .collect()
            }),
            None => disciplines
                .iter()
                .zip(inputs.iter())
                .map(|(disc, data)| run(disc, data))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{data_map, EvaluationError, FnDiscipline};

    fn doubler(name: &str) -> Arc<dyn Discipline> {
        Arc::new(FnDiscipline::new(name, &["x"], &["y"], |data| {
            Ok(data_map(&[("y", &[2.0 * data["x"][0]])]))
        }))
    }

    fn failing(name: &str) -> Arc<dyn Discipline> {
        let owner = name.to_string();
        Arc::new(FnDiscipline::new(name, &["x"], &["y"], move |_| {
            Err(EvaluationError::Failed {
                discipline: owner.clone(),
                message: "synthetic failure".to_string(),
            })
        }))
    }

    #[test]
    fn test_sequential_batch() {
        let runner = ParallelDisciplineRunner::new(1);
        let disciplines = vec![doubler("a"), doubler("b")];
        let inputs = vec![data_map(&[("x", &[1.0])]), data_map(&[("x", &[3.0])])];

        let results = runner.execute(&disciplines, &inputs);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap()["y"][0], 2.0);
        assert_eq!(results[1].as_ref().unwrap()["y"][0], 6.0);
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let disciplines = vec![doubler("a"), doubler("b"), doubler("c")];
        let inputs: Vec<DataMap> =
            (0..3).map(|i| data_map(&[("x", &[i as f64])])).collect();

        let sequential = ParallelDisciplineRunner::new(1).execute(&disciplines, &inputs);
        let parallel = ParallelDisciplineRunner::new(2).execute(&disciplines, &inputs);

        for (s, p) in sequential.iter().zip(parallel.iter()) {
            assert_eq!(s.as_ref().unwrap()["y"], p.as_ref().unwrap()["y"]);
        }
    }

    #[test]
    fn test_failure_isolated_to_slot() {
        let runner = ParallelDisciplineRunner::new(2);
        let disciplines = vec![doubler("a"), failing("bad"), doubler("c")];
        let inputs: Vec<DataMap> =
            (0..3).map(|_| data_map(&[("x", &[1.0])])).collect();

        let results = runner.execute(&disciplines, &inputs);
        assert!(results[0].is_some());
        assert!(results[1].is_none());
        assert!(results[2].is_some());
    }

    #[test]
    fn test_batch_linearize() {
        let runner = ParallelDisciplineRunner::new(1);
        let disciplines = vec![doubler("a")];
        let inputs = vec![data_map(&[("x", &[1.0])])];

        let results = runner.linearize(&disciplines, &inputs);
        let jac = results[0].as_ref().unwrap();
        assert!((jac["y"]["x"][(0, 0)] - 2.0).abs() < 1e-5);
    }
}
