//! Dependency graph over plan steps
//!
//! [`DependencyGraph`] indexes a step list into forward and reverse
//! adjacency keyed by step id. Edges are id-to-id mappings, never pointers,
//! so the graph is cheap to build and serialisation-friendly.
//!
//! Construction never fails: cycle detection is a query, reported by
//! [`topological_sort`](DependencyGraph::topological_sort) (Kahn's
//! algorithm) when fewer nodes emerge than exist. Ties in topological order
//! break on insertion order, so identical input yields identical output.

use crate::error::{EngineError, Result};
use crate::plan::Step;
use std::collections::{HashMap, HashSet, VecDeque};

/// Id-indexed dependency graph for one plan
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Node ids in insertion order
    order: Vec<String>,
    /// node -> steps that depend on it
    dependents: HashMap<String, Vec<String>>,
    /// node -> its direct dependencies
    dependencies: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// Build the graph from a step list.
    ///
    /// Unknown dependency ids are indexed as-is; `Plan::validate` rejects
    /// them before execution ever reaches this point.
    pub fn build(steps: &[Step]) -> Self {
        let mut order = Vec::with_capacity(steps.len());
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        let mut dependencies: HashMap<String, Vec<String>> = HashMap::new();

        for step in steps {
            order.push(step.id.clone());
            dependencies.insert(step.id.clone(), step.depends_on.clone());
            dependents.entry(step.id.clone()).or_default();
        }
        for step in steps {
            for dep in &step.depends_on {
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(step.id.clone());
            }
        }

        Self {
            order,
            dependents,
            dependencies,
        }
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True when the graph has no nodes
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Direct dependents of a node, in edge insertion order
    pub fn dependents(&self, id: &str) -> &[String] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Direct dependencies of a node
    pub fn dependencies(&self, id: &str) -> &[String] {
        self.dependencies
            .get(id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Kahn's algorithm. Fails with `CyclicDependency` when fewer nodes
    /// emerge than exist.
    pub fn topological_sort(&self) -> Result<Vec<String>> {
        let mut in_degree: HashMap<&str, usize> = self
            .order
            .iter()
            .map(|id| (id.as_str(), self.dependencies(id).len()))
            .collect();

        let mut queue: VecDeque<&str> = self
            .order
            .iter()
            .filter(|id| in_degree[id.as_str()] == 0)
            .map(String::as_str)
            .collect();

        let mut sorted = Vec::with_capacity(self.order.len());
        while let Some(id) = queue.pop_front() {
            sorted.push(id.to_string());
            for dependent in self.dependents(id) {
                if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(dependent.as_str());
                    }
                }
            }
        }

        if sorted.len() != self.order.len() {
            let stuck: Vec<&str> = self
                .order
                .iter()
                .filter(|id| !sorted.contains(*id))
                .map(String::as_str)
                .collect();
            return Err(EngineError::CyclicDependency(format!(
                "steps [{}] form a cycle",
                stuck.join(", ")
            )));
        }
        Ok(sorted)
    }

    /// True when the dependency relation contains a cycle
    pub fn has_cycle(&self) -> bool {
        self.topological_sort().is_err()
    }

    /// Partition nodes by longest distance from any source.
    ///
    /// Group `k` contains every node whose longest incoming path has length
    /// `k`; groups come back in ascending `k`. Nodes in the same group have
    /// no dependency relation between them and may run in parallel.
    pub fn parallel_groups(&self) -> Result<Vec<Vec<String>>> {
        let sorted = self.topological_sort()?;

        let mut level: HashMap<&str, usize> = HashMap::with_capacity(sorted.len());
        let mut depth = 0;
        for id in &sorted {
            let node_level = self
                .dependencies(id)
                .iter()
                .filter_map(|dep| level.get(dep.as_str()))
                .max()
                .map(|l| l + 1)
                .unwrap_or(0);
            depth = depth.max(node_level);
            level.insert(id.as_str(), node_level);
        }

        let mut groups = vec![Vec::new(); depth + 1];
        for id in &self.order {
            groups[level[id.as_str()]].push(id.clone());
        }
        Ok(groups)
    }

    /// Ids whose dependencies are all in `completed` and which are not
    /// themselves completed, in insertion order.
    pub fn executable_frontier(&self, completed: &HashSet<String>) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| !completed.contains(*id))
            .filter(|id| {
                self.dependencies(id)
                    .iter()
                    .all(|dep| completed.contains(dep))
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Action, Step};
    use proptest::prelude::*;

    fn step(id: &str, deps: &[&str]) -> Step {
        let mut step = Step::new(
            id,
            id,
            Action::Condition {
                expression: "true".into(),
            },
        );
        for dep in deps {
            step = step.depends_on(*dep);
        }
        step
    }

    #[test]
    fn test_topological_sort_respects_edges() {
        let steps = vec![
            step("c", &["a", "b"]),
            step("a", &[]),
            step("b", &["a"]),
        ];
        let graph = DependencyGraph::build(&steps);
        let sorted = graph.topological_sort().unwrap();
        assert_eq!(sorted, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_sort_ties_break_on_insertion_order() {
        let steps = vec![step("x", &[]), step("y", &[]), step("z", &[])];
        let graph = DependencyGraph::build(&steps);
        assert_eq!(graph.topological_sort().unwrap(), vec!["x", "y", "z"]);
    }

    #[test]
    fn test_cycle_is_detected() {
        let steps = vec![step("a", &["b"]), step("b", &["a"])];
        let graph = DependencyGraph::build(&steps);
        assert!(graph.has_cycle());
        let err = graph.topological_sort().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_parallel_groups_use_longest_path() {
        // a -> b -> d, a -> c -> d, plus a long chain a -> e forcing d to
        // sit at its longest distance
        let steps = vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["a"]),
            step("d", &["b", "c"]),
            step("e", &["d"]),
        ];
        let graph = DependencyGraph::build(&steps);
        let groups = graph.parallel_groups().unwrap();
        assert_eq!(
            groups,
            vec![
                vec!["a".to_string()],
                vec!["b".to_string(), "c".to_string()],
                vec!["d".to_string()],
                vec!["e".to_string()],
            ]
        );
    }

    #[test]
    fn test_diamond_with_shortcut_uses_longest_distance() {
        // d depends on both a (distance 1) and c (distance 2): group is 3
        let steps = vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["b"]),
            step("d", &["a", "c"]),
        ];
        let graph = DependencyGraph::build(&steps);
        let groups = graph.parallel_groups().unwrap();
        assert_eq!(groups[3], vec!["d".to_string()]);
    }

    #[test]
    fn test_executable_frontier() {
        let steps = vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["a", "b"]),
        ];
        let graph = DependencyGraph::build(&steps);

        let none = HashSet::new();
        assert_eq!(graph.executable_frontier(&none), vec!["a"]);

        let a_done: HashSet<String> = ["a".to_string()].into();
        assert_eq!(graph.executable_frontier(&a_done), vec!["b"]);

        let ab_done: HashSet<String> = ["a".to_string(), "b".to_string()].into();
        assert_eq!(graph.executable_frontier(&ab_done), vec!["c"]);
    }

    #[test]
    fn test_neighbor_lookups() {
        let steps = vec![step("a", &[]), step("b", &["a"]), step("c", &["a"])];
        let graph = DependencyGraph::build(&steps);
        assert_eq!(graph.dependents("a"), &["b", "c"]);
        assert_eq!(graph.dependencies("b"), &["a"]);
        assert!(graph.dependents("c").is_empty());
    }

    proptest! {
        /// Any plan whose steps only depend on earlier steps is acyclic, and
        /// the sort must yield every node exactly once with edges respected.
        #[test]
        fn prop_topological_sort_is_complete_and_ordered(
            dep_picks in prop::collection::vec(prop::collection::vec(any::<prop::sample::Index>(), 0..3), 1..20)
        ) {
            let mut steps: Vec<Step> = Vec::new();
            for (i, picks) in dep_picks.iter().enumerate() {
                let id = format!("s{i}");
                let mut deps: Vec<String> = picks
                    .iter()
                    .filter(|_| i > 0)
                    .map(|pick| format!("s{}", pick.index(i)))
                    .collect();
                deps.sort();
                deps.dedup();
                let dep_refs: Vec<&str> = deps.iter().map(String::as_str).collect();
                steps.push(step(&id, &dep_refs));
            }

            let graph = DependencyGraph::build(&steps);
            let sorted = graph.topological_sort().unwrap();

            prop_assert_eq!(sorted.len(), steps.len());
            let position: HashMap<&str, usize> = sorted
                .iter()
                .enumerate()
                .map(|(i, id)| (id.as_str(), i))
                .collect();
            for s in &steps {
                for dep in &s.depends_on {
                    prop_assert!(position[dep.as_str()] < position[s.id.as_str()]);
                }
            }

            // Level groups cover every node and sit strictly above their deps
            let groups = graph.parallel_groups().unwrap();
            let total: usize = groups.iter().map(Vec::len).sum();
            prop_assert_eq!(total, steps.len());
        }
    }
}
