use std::collections::{BTreeSet, HashMap};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{depth_first_search, Bfs, Control, DfsEvent};
use petgraph::Direction;

use lisa_core::error::{LisaError, Result};
use lisa_core::types::Task;

/// Validated dependency graph of one submission.
///
/// Construction fails on empty or duplicate ids, on dependencies that name
/// no task in the submission, and on cycles. Edges point from a dependency
/// to its dependents; node `i` is the `i`-th submitted task.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    tasks: Vec<Task>,
    index: HashMap<String, NodeIndex>,
    dag: DiGraph<String, ()>,
    order: Vec<NodeIndex>,
}

impl TaskGraph {
    pub fn build(tasks: Vec<Task>) -> Result<Self> {
        let mut dag = DiGraph::with_capacity(tasks.len(), tasks.len());
        let mut index = HashMap::with_capacity(tasks.len());
        for (i, task) in tasks.iter().enumerate() {
            if task.id.trim().is_empty() {
                return Err(LisaError::Validation(format!("task #{} has an empty id", i)));
            }
            if task.capability.trim().is_empty() {
                return Err(LisaError::Validation(format!("task '{}' has no capability", task.id)));
            }
            if index.contains_key(&task.id) {
                return Err(LisaError::DuplicateTask(task.id.clone()));
            }
            index.insert(task.id.clone(), dag.add_node(task.id.clone()));
        }

        for (i, task) in tasks.iter().enumerate() {
            let node = NodeIndex::new(i);
            for dep in &task.dependencies {
                let &from = index.get(dep).ok_or_else(|| LisaError::UnknownDependency {
                    task: task.id.clone(),
                    dependency: dep.clone(),
                })?;
                dag.add_edge(from, node, ());
            }
        }

        let mut graph = Self {
            tasks,
            index,
            dag,
            order: Vec::new(),
        };
        if let Some(cycle) = graph.find_cycle() {
            return Err(LisaError::CyclicDependency { cycle });
        }
        graph.order = toposort(&graph.dag, None).map_err(|cycle| LisaError::CyclicDependency {
            cycle: vec![graph.dag[cycle.node_id()].clone()],
        })?;
        Ok(graph)
    }

    /// The first back edge found by a depth-first walk closes a cycle; the
    /// path is rebuilt from the tree edges and returned closed (`[a, b, a]`).
    fn find_cycle(&self) -> Option<Vec<String>> {
        let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        let found = depth_first_search(&self.dag, self.dag.node_indices(), |event| {
            match event {
                DfsEvent::TreeEdge(from, to) => {
                    parent.insert(to, from);
                }
                DfsEvent::BackEdge(from, to) => {
                    let mut path = vec![from];
                    let mut node = from;
                    while node != to {
                        match parent.get(&node) {
                            Some(&up) => {
                                path.push(up);
                                node = up;
                            }
                            None => break,
                        }
                    }
                    path.reverse();
                    path.push(to);
                    return Control::Break(path);
                }
                _ => {}
            }
            Control::Continue
        });
        found
            .break_value()
            .map(|path| path.into_iter().map(|n| self.dag[n].clone()).collect())
    }

    fn task(&self, node: NodeIndex) -> &Task {
        &self.tasks[node.index()]
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.index.get(id).map(|&n| self.task(n))
    }

    /// Tasks in submission order.
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Task ids in a valid execution order.
    pub fn topological_order(&self) -> Vec<&str> {
        self.order.iter().map(|&n| self.task(n).id.as_str()).collect()
    }

    /// Unresolved dependency count per task.
    pub fn in_degrees(&self) -> HashMap<String, usize> {
        self.index
            .iter()
            .map(|(id, &n)| (id.clone(), self.dag.neighbors_directed(n, Direction::Incoming).count()))
            .collect()
    }

    /// Tasks with no dependencies, in submission order.
    pub fn roots(&self) -> Vec<&str> {
        self.tasks
            .iter()
            .filter(|t| t.dependencies.is_empty())
            .map(|t| t.id.as_str())
            .collect()
    }

    /// Tasks that list `id` as a direct dependency, in submission order.
    pub fn dependents(&self, id: &str) -> Vec<&str> {
        let Some(&node) = self.index.get(id) else {
            return Vec::new();
        };
        let mut direct: Vec<NodeIndex> = self.dag.neighbors_directed(node, Direction::Outgoing).collect();
        direct.sort();
        direct.into_iter().map(|n| self.task(n).id.as_str()).collect()
    }

    /// Everything downstream of `id`, excluding `id` itself.
    pub fn transitive_dependents(&self, id: &str) -> BTreeSet<String> {
        let Some(&start) = self.index.get(id) else {
            return BTreeSet::new();
        };
        let mut downstream = BTreeSet::new();
        let mut bfs = Bfs::new(&self.dag, start);
        while let Some(node) = bfs.next(&self.dag) {
            if node != start {
                downstream.insert(self.dag[node].clone());
            }
        }
        downstream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lisa_test_utils::{task, task_with_deps};

    #[test]
    fn test_topological_order_respects_dependencies() {
        let graph = TaskGraph::build(vec![
            task_with_deps("d", "echo", &["b", "c"]),
            task_with_deps("b", "echo", &["a"]),
            task_with_deps("c", "echo", &["a"]),
            task("a", "echo"),
        ])
        .unwrap();

        let order = graph.topological_order();
        let position = |id: &str| order.iter().position(|o| *o == id).unwrap();
        assert_eq!(order.len(), 4);
        assert!(position("a") < position("b"));
        assert!(position("a") < position("c"));
        assert!(position("b") < position("d"));
        assert!(position("c") < position("d"));
        assert_eq!(graph.roots(), vec!["a"]);
        assert_eq!(graph.dependents("a"), vec!["b", "c"]);
        assert_eq!(graph.in_degrees()["d"], 2);
    }

    #[test]
    fn test_cycle_reports_path() {
        let err = TaskGraph::build(vec![
            task("root", "echo"),
            task_with_deps("a", "echo", &["c"]),
            task_with_deps("b", "echo", &["a"]),
            task_with_deps("c", "echo", &["b"]),
        ])
        .unwrap_err();

        match err {
            LisaError::CyclicDependency { cycle } => {
                assert_eq!(cycle.first(), cycle.last());
                assert_eq!(cycle.len(), 4);
                for id in ["a", "b", "c"] {
                    assert!(cycle.contains(&id.to_string()));
                }
                assert!(!cycle.contains(&"root".to_string()));
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let err = TaskGraph::build(vec![task_with_deps("a", "echo", &["a"])]).unwrap_err();
        match err {
            LisaError::CyclicDependency { cycle } => assert_eq!(cycle, vec!["a", "a"]),
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_dependency() {
        let err = TaskGraph::build(vec![task_with_deps("a", "echo", &["ghost"])]).unwrap_err();
        assert!(matches!(
            err,
            LisaError::UnknownDependency { ref task, ref dependency } if task == "a" && dependency == "ghost"
        ));
        assert!(err.is_validation());
    }

    #[test]
    fn test_duplicate_and_empty_ids() {
        let err = TaskGraph::build(vec![task("a", "echo"), task("a", "echo")]).unwrap_err();
        assert!(matches!(err, LisaError::DuplicateTask(ref id) if id == "a"));

        let err = TaskGraph::build(vec![task(" ", "echo")]).unwrap_err();
        assert!(err.is_validation());

        let err = TaskGraph::build(vec![task("a", "")]).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_transitive_dependents() {
        let graph = TaskGraph::build(vec![
            task("a", "echo"),
            task_with_deps("b", "echo", &["a"]),
            task_with_deps("c", "echo", &["b"]),
            task("x", "echo"),
            task_with_deps("y", "echo", &["x", "c"]),
        ])
        .unwrap();

        let downstream: Vec<_> = graph.transitive_dependents("a").into_iter().collect();
        assert_eq!(downstream, vec!["b", "c", "y"]);
        assert!(graph.transitive_dependents("y").is_empty());
        assert_eq!(graph.transitive_dependents("x").len(), 1);
        assert!(graph.transitive_dependents("ghost").is_empty());
    }

    #[test]
    fn test_diamond_visits_shared_dependent_once() {
        let graph = TaskGraph::build(vec![
            task("a", "echo"),
            task_with_deps("b", "echo", &["a"]),
            task_with_deps("c", "echo", &["a"]),
            task_with_deps("d", "echo", &["c", "b"]),
        ])
        .unwrap();

        assert_eq!(graph.dependents("b"), vec!["d"]);
        let downstream: Vec<_> = graph.transitive_dependents("a").into_iter().collect();
        assert_eq!(downstream, vec!["b", "c", "d"]);
        assert_eq!(graph.in_degrees()["a"], 0);
    }

    #[test]
    fn test_empty_graph() {
        let graph = TaskGraph::build(vec![]).unwrap();
        assert!(graph.is_empty());
        assert!(graph.topological_order().is_empty());
    }
}
