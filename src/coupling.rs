//! Coupling structure of a set of disciplines.
//!
//! The coupling graph is a directed multigraph over discipline indices: an
//! edge `i -> j` labelled `y` means discipline `i` produces `y` and
//! discipline `j` consumes it. Strongly connected components of this graph
//! are the groups that must be converged by fixed-point iteration; couplings
//! whose producer and consumer sit in the same component are *strong*, all
//! others are *weak* and can be resolved by a single sweep in topological
//! order.
//!
//! # Example
//!
//! ```ignore
//! let graph = CouplingGraph::new(&disciplines)?;
//! for component in graph.execution_sequence() {
//!     // evaluate the members of `component`
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::Discipline;

/// Errors detected when building the coupling graph.
///
/// All of these are fatal: the discipline set cannot be solved as given.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    /// Two disciplines produce the same output
    #[error("the following outputs are defined multiple times: {}", .0.join(", "))]
    DuplicateOutputs(Vec<String>),
    /// A self-coupled discipline also belongs to a larger strong group
    #[error(
        "the disciplines {} are self-coupled and belong to a larger strongly \
         coupled group, which is not supported",
        .0.join(", ")
    )]
    SelfCoupledStrongGroup(Vec<String>),
    /// The same coupling variable is declared with two different sizes
    #[error(
        "coupling variable '{name}' is declared with size {first_size} by \
         '{first}' and size {other_size} by '{other}'"
    )]
    InconsistentSize {
        name: String,
        first: String,
        first_size: usize,
        other: String,
        other_size: usize,
    },
}

/// One labelled edge of the coupling multigraph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CouplingEdge {
    /// Index of the producing discipline
    pub from: usize,
    /// Index of the consuming discipline
    pub to: usize,
    /// Name of the exchanged variable
    pub variable: String,
}

/// Coupling analysis of a discipline set.
#[derive(Debug)]
pub struct CouplingGraph {
    names: Vec<String>,
    edges: Vec<CouplingEdge>,
    /// Strongly connected components, topological order of the condensation
    components: Vec<Vec<usize>>,
    component_of: Vec<usize>,
    self_coupled: Vec<usize>,
    all: BTreeSet<String>,
    strong: BTreeSet<String>,
    resolved: BTreeSet<String>,
}

impl CouplingGraph {
    /// Analyzes the coupling structure and validates it.
    pub fn new(disciplines: &[Arc<dyn Discipline>]) -> Result<Self, ConfigurationError> {
        let names: Vec<String> = disciplines.iter().map(|d| d.name().to_string()).collect();

        // Each output must have a single producer
        let mut producer: HashMap<&String, usize> = HashMap::new();
        let mut duplicates = BTreeSet::new();
        for (i, disc) in disciplines.iter().enumerate() {
            for output in disc.output_names() {
                if producer.insert(output, i).is_some() {
                    duplicates.insert(output.clone());
                }
            }
        }
        if !duplicates.is_empty() {
            return Err(ConfigurationError::DuplicateOutputs(duplicates.into_iter().collect()));
        }

        let mut edges = Vec::new();
        let mut all = BTreeSet::new();
        for (j, disc) in disciplines.iter().enumerate() {
            for input in disc.input_names() {
                if let Some(&i) = producer.get(input) {
                    edges.push(CouplingEdge { from: i, to: j, variable: input.clone() });
                    all.insert(input.clone());
                }
            }
        }

        Self::check_sizes(disciplines, &all)?;

        let mut adjacency: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); disciplines.len()];
        for edge in &edges {
            adjacency[edge.from].insert(edge.to);
        }
        let components = tarjan(&adjacency);

        let mut component_of = vec![0; disciplines.len()];
        for (c, members) in components.iter().enumerate() {
            for &i in members {
                component_of[i] = c;
            }
        }

        let strong: BTreeSet<String> = edges
            .iter()
            .filter(|e| component_of[e.from] == component_of[e.to])
            .map(|e| e.variable.clone())
            .collect();

        let self_coupled: Vec<usize> = edges
            .iter()
            .filter(|e| e.from == e.to)
            .map(|e| e.from)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        // A discipline feeding itself inside a larger cycle would need its
        // self-coupling and the group coupling converged at once
        let offenders: Vec<String> = self_coupled
            .iter()
            .filter(|&&i| components[component_of[i]].len() > 1)
            .map(|&i| names[i].clone())
            .collect();
        if !offenders.is_empty() {
            return Err(ConfigurationError::SelfCoupledStrongGroup(offenders));
        }

        let resolved: BTreeSet<String> = disciplines
            .iter()
            .flat_map(|d| d.residual_variables().iter().cloned())
            .collect();

        Ok(CouplingGraph {
            names,
            edges,
            components,
            component_of,
            self_coupled,
            all,
            strong,
            resolved,
        })
    }

    fn check_sizes(
        disciplines: &[Arc<dyn Discipline>],
        couplings: &BTreeSet<String>,
    ) -> Result<(), ConfigurationError> {
        let mut declared: BTreeMap<&String, (usize, usize)> = BTreeMap::new();
        for (i, disc) in disciplines.iter().enumerate() {
            for (name, value) in disc.default_inputs() {
                let Some(name_ref) = couplings.get(&name) else {
                    continue;
                };
                match declared.get(name_ref) {
                    None => {
                        declared.insert(name_ref, (i, value.len()));
                    }
                    Some(&(first, first_size)) if first_size != value.len() => {
                        return Err(ConfigurationError::InconsistentSize {
                            name: name_ref.to_string(),
                            first: disciplines[first].name().to_string(),
                            first_size,
                            other: disc.name().to_string(),
                            other_size: value.len(),
                        });
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }

    /// Name of the discipline at `index`.
    pub fn discipline_name(&self, index: usize) -> &str {
        &self.names[index]
    }

    /// All labelled coupling edges.
    pub fn edges(&self) -> &[CouplingEdge] {
        &self.edges
    }

    /// Every variable produced by one discipline and consumed by another
    /// (or by itself), sorted by name.
    pub fn all_couplings(&self) -> &BTreeSet<String> {
        &self.all
    }

    /// Couplings whose producer and consumer are in the same strong group.
    pub fn strong_couplings(&self) -> &BTreeSet<String> {
        &self.strong
    }

    /// Couplings resolved by a single sweep in topological order.
    pub fn weak_couplings(&self) -> BTreeSet<String> {
        self.all.difference(&self.strong).cloned().collect()
    }

    /// Strong couplings that the fixed-point iteration must drive, i.e. the
    /// strong couplings minus the variables disciplines resolve internally.
    pub fn coupled_variables(&self) -> Vec<String> {
        self.strong.difference(&self.resolved).cloned().collect()
    }

    /// Every coupling the derivative assembly must treat as an unknown:
    /// all couplings minus the variables disciplines resolve internally.
    ///
    /// Unlike [`coupled_variables`](Self::coupled_variables) this keeps the
    /// weak couplings, so derivative paths running through a single-sweep
    /// variable still get a row in the coupled linear system.
    pub fn unresolved_couplings(&self) -> Vec<String> {
        self.all.difference(&self.resolved).cloned().collect()
    }

    /// Strongly connected components in topological order of the
    /// condensation; members are in declaration order.
    pub fn execution_sequence(&self) -> &[Vec<usize>] {
        &self.components
    }

    /// True if any component needs fixed-point iteration.
    pub fn has_strong_coupling(&self) -> bool {
        !self.strong.is_empty()
    }

    /// Indices of disciplines belonging to an iterated group.
    pub fn strongly_coupled_disciplines(&self) -> Vec<usize> {
        let mut result = BTreeSet::new();
        for members in &self.components {
            if members.len() > 1 {
                result.extend(members.iter().copied());
            }
        }
        result.extend(self.self_coupled.iter().copied());
        result.into_iter().collect()
    }

    /// Component index of a discipline.
    pub fn component_of(&self, index: usize) -> usize {
        self.component_of[index]
    }
}

/// Strongly connected components, returned in topological order of the
/// condensation with members sorted by index.
fn tarjan(adjacency: &[BTreeSet<usize>]) -> Vec<Vec<usize>> {
    struct State {
        counter: usize,
        index: Vec<Option<usize>>,
        lowlink: Vec<usize>,
        stack: Vec<usize>,
        on_stack: Vec<bool>,
        components: Vec<Vec<usize>>,
    }

    fn connect(v: usize, adjacency: &[BTreeSet<usize>], st: &mut State) {
        st.index[v] = Some(st.counter);
        st.lowlink[v] = st.counter;
        st.counter += 1;
        st.stack.push(v);
        st.on_stack[v] = true;

        for &w in &adjacency[v] {
            match st.index[w] {
                None => {
                    connect(w, adjacency, st);
                    st.lowlink[v] = st.lowlink[v].min(st.lowlink[w]);
                }
                Some(index) if st.on_stack[w] => {
                    st.lowlink[v] = st.lowlink[v].min(index);
                }
                Some(_) => {}
            }
        }

        if Some(st.lowlink[v]) == st.index[v] {
            let mut component = Vec::new();
            while let Some(w) = st.stack.pop() {
                st.on_stack[w] = false;
                component.push(w);
                if w == v {
                    break;
                }
            }
            component.sort_unstable();
            st.components.push(component);
        }
    }

    let n = adjacency.len();
    let mut st = State {
        counter: 0,
        index: vec![None; n],
        lowlink: vec![0; n],
        stack: Vec::new(),
        on_stack: vec![false; n],
        components: Vec::new(),
    };
    for v in 0..n {
        if st.index[v].is_none() {
            connect(v, adjacency, &mut st);
        }
    }
    // Tarjan emits components in reverse topological order
    st.components.reverse();
    st.components
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{data_map, DataMap, FnDiscipline};
    use nalgebra::DVector;

    fn disc(name: &str, inputs: &[&str], outputs: &[&str]) -> Arc<dyn Discipline> {
        let produced: Vec<String> = outputs.iter().map(|s| s.to_string()).collect();
        let mut built = FnDiscipline::new(name, inputs, outputs, move |_| {
            Ok(produced
                .iter()
                .map(|n| (n.clone(), DVector::from_element(1, 0.0)))
                .collect::<DataMap>())
        });
        for input in inputs {
            built = built.with_default(*input, DVector::from_element(1, 0.0));
        }
        Arc::new(built)
    }

    #[test]
    fn test_acyclic_chain_is_weak() {
        let graph = CouplingGraph::new(&[
            disc("a", &["x"], &["u"]),
            disc("b", &["u"], &["v"]),
            disc("c", &["v"], &["w"]),
        ])
        .unwrap();

        assert!(!graph.has_strong_coupling());
        assert_eq!(graph.weak_couplings().len(), 2);
        assert!(graph.strong_couplings().is_empty());
        assert_eq!(graph.execution_sequence().to_vec(), vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn test_two_way_cycle_is_strong() {
        let graph =
            CouplingGraph::new(&[disc("a", &["y2"], &["y1"]), disc("b", &["y1"], &["y2"])])
                .unwrap();

        assert!(graph.has_strong_coupling());
        let strong: Vec<&String> = graph.strong_couplings().iter().collect();
        assert_eq!(strong, [&"y1".to_string(), &"y2".to_string()]);
        assert!(graph.weak_couplings().is_empty());
        assert_eq!(graph.execution_sequence().len(), 1);
        assert_eq!(graph.strongly_coupled_disciplines(), vec![0, 1]);
    }

    #[test]
    fn test_partition_cycle_and_chain() {
        // a <-> b form a cycle; c -> d is a weak chain fed by b
        let graph = CouplingGraph::new(&[
            disc("a", &["y_b"], &["y_a"]),
            disc("b", &["y_a"], &["y_b"]),
            disc("c", &["y_b"], &["y_c"]),
            disc("d", &["y_c"], &["y_d"]),
        ])
        .unwrap();

        // y_b is strong: its edge back into the cycle sits inside the
        // component, even though c also consumes it
        assert_eq!(graph.strong_couplings().len(), 2);
        let weak = graph.weak_couplings();
        assert_eq!(weak.len(), 1);
        assert!(weak.contains("y_c"));

        let sequence = graph.execution_sequence();
        assert_eq!(sequence.len(), 3);
        assert_eq!(sequence[0], vec![0, 1]);
        assert_eq!(sequence[1], vec![2]);
        assert_eq!(sequence[2], vec![3]);
        assert_eq!(graph.strongly_coupled_disciplines(), vec![0, 1]);

        // Iteration drives the strong pair only; derivative assembly keeps
        // the weak coupling as an unknown too
        assert_eq!(graph.coupled_variables(), vec!["y_a".to_string(), "y_b".to_string()]);
        assert_eq!(
            graph.unresolved_couplings(),
            vec!["y_a".to_string(), "y_b".to_string(), "y_c".to_string()]
        );
    }

    #[test]
    fn test_self_coupled_singleton() {
        let graph = CouplingGraph::new(&[disc("s", &["y"], &["y"])]).unwrap();
        assert!(graph.has_strong_coupling());
        assert_eq!(graph.coupled_variables(), vec!["y".to_string()]);
        assert_eq!(graph.strongly_coupled_disciplines(), vec![0]);
    }

    #[test]
    fn test_duplicate_outputs_rejected() {
        let err = CouplingGraph::new(&[
            disc("a", &[], &["y", "z"]),
            disc("b", &[], &["y"]),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigurationError::DuplicateOutputs(ref names) if names == &["y"]));
    }

    #[test]
    fn test_self_coupled_in_strong_group_rejected() {
        // a consumes its own output and is in a cycle with b
        let err = CouplingGraph::new(&[
            disc("a", &["y_a", "y_b"], &["y_a", "u"]),
            disc("b", &["u"], &["y_b"]),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigurationError::SelfCoupledStrongGroup(ref names)
            if names == &["a"]));
    }

    #[test]
    fn test_inconsistent_sizes_rejected() {
        let two = {
            let mut built = FnDiscipline::new("two", &["y"], &["z"], |_| {
                Ok(data_map(&[("z", &[0.0])]))
            });
            built = built.with_default("y", DVector::from_element(2, 0.0));
            Arc::new(built) as Arc<dyn Discipline>
        };
        let err = CouplingGraph::new(&[disc("p", &[], &["y"]), disc("one", &["y"], &["w"]), two])
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::InconsistentSize { ref name, .. }
            if name == "y"));
    }

    #[test]
    fn test_resolved_variables_excluded() {
        let solved = {
            let built = FnDiscipline::new("inner", &["y_in", "y_self"], &["y_self", "y_out"], |_| {
                Ok(data_map(&[("y_self", &[0.0]), ("y_out", &[0.0])]))
            })
            .with_default("y_in", DVector::from_element(1, 0.0))
            .with_default("y_self", DVector::from_element(1, 0.0))
            .with_residual_variables(&["y_self"]);
            Arc::new(built) as Arc<dyn Discipline>
        };
        let graph = CouplingGraph::new(&[solved]).unwrap();
        assert!(graph.strong_couplings().contains("y_self"));
        assert!(graph.coupled_variables().is_empty());
    }
}
