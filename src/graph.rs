use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

use crate::cycle_check::find_cycle;
use crate::state::{TaskState, TaskStatus};
use crate::task::Task;
use crate::DagError;

/// Declarative run input, as handed over by a scheduler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunDefinition {
    pub tasks: Vec<Task>,
}

#[derive(Debug, Default)]
pub struct GraphBuilder {
    tasks: Vec<Task>,
    edges: Vec<(String, String)>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Never fails; duplicate names surface from [`validate`](Self::validate)
    /// and [`build`](Self::build).
    pub fn add_task(&mut self, task: Task) -> &mut Self {
        self.tasks.push(task);
        self
    }

    /// `to` may only start once `from` has succeeded.
    pub fn add_edge(&mut self, from: impl Into<String>, to: impl Into<String>) -> &mut Self {
        self.edges.push((from.into(), to.into()));
        self
    }

    pub fn validate(&self) -> Result<(), DagError> {
        self.resolve().map(|_| ())
    }

    pub fn build(&self) -> Result<DependencyGraph, DagError> {
        let tasks = self.resolve()?;
        Ok(DependencyGraph::from_resolved(tasks))
    }

    /// Merges explicit edges into each task's predecessor list and checks
    /// every structural invariant.
    fn resolve(&self) -> Result<Vec<Task>, DagError> {
        let mut index = HashMap::new();
        for (i, task) in self.tasks.iter().enumerate() {
            if index.insert(task.name.clone(), i).is_some() {
                return Err(DagError::DuplicateTask(task.name.clone()));
            }
        }

        let mut tasks = self.tasks.clone();
        for (from, to) in &self.edges {
            let unknown = || DagError::UnknownDependency {
                task: to.clone(),
                dependency: from.clone(),
            };
            if !index.contains_key(from) {
                return Err(unknown());
            }
            let target = index.get(to).copied().ok_or_else(unknown)?;
            tasks[target].depends_on.push(from.clone());
        }

        for task in &mut tasks {
            let mut seen = HashSet::new();
            task.depends_on.retain(|d| seen.insert(d.clone()));
            if let Some(dep) = task.depends_on.iter().find(|d| !index.contains_key(*d)) {
                return Err(DagError::UnknownDependency {
                    task: task.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }

        let order: Vec<String> = tasks.iter().map(|t| t.name.clone()).collect();
        let predecessors: HashMap<String, Vec<String>> = tasks
            .iter()
            .map(|t| (t.name.clone(), t.depends_on.clone()))
            .collect();
        if let Some(path) = find_cycle(&order, &predecessors) {
            return Err(DagError::CycleDetected { path });
        }

        Ok(tasks)
    }
}

/// A validated, immutable task graph. Only [`GraphBuilder::build`] and
/// [`DependencyGraph::from_definition`] produce one, so holding a value
/// means the graph is acyclic and closed over its dependency names.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    tasks: Vec<Task>,
    index: HashMap<String, usize>,
    dependents: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    pub fn from_definition(def: RunDefinition) -> Result<Self, DagError> {
        let mut builder = GraphBuilder::new();
        for task in def.tasks {
            builder.add_task(task);
        }
        builder.build()
    }

    fn from_resolved(tasks: Vec<Task>) -> Self {
        let mut index = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();

        for (i, task) in tasks.iter().enumerate() {
            index.insert(task.name.clone(), i);
            for dep in &task.depends_on {
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(task.name.clone());
            }
        }

        Self {
            tasks,
            index,
            dependents,
        }
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn get(&self, name: &str) -> Option<&Task> {
        self.index.get(name).map(|&i| &self.tasks[i])
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn initial_states(&self) -> HashMap<String, TaskState> {
        self.tasks
            .iter()
            .map(|t| (t.name.clone(), TaskState::default()))
            .collect()
    }

    /// Pending tasks whose every predecessor has succeeded, in definition
    /// order.
    pub fn ready_tasks(&self, states: &HashMap<String, TaskState>) -> Vec<&Task> {
        let status = |name: &str| states.get(name).map(|s| s.status);
        self.tasks
            .iter()
            .filter(|t| status(&t.name) == Some(TaskStatus::Pending))
            .filter(|t| {
                t.depends_on
                    .iter()
                    .all(|d| status(d) == Some(TaskStatus::Succeeded))
            })
            .collect()
    }

    /// Every task transitively depending on `name`, nearest first.
    pub fn downstream_of(&self, name: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut queue = VecDeque::from([name.to_string()]);

        while let Some(current) = queue.pop_front() {
            let Some(children) = self.dependents.get(&current) else {
                continue;
            };
            for child in children {
                if seen.insert(child.clone()) {
                    out.push(child.clone());
                    queue.push_back(child.clone());
                }
            }
        }
        out
    }

    /// Kahn's algorithm; ties are broken by definition order.
    pub fn topological_order(&self) -> Vec<&Task> {
        let mut in_degree: Vec<usize> = self.tasks.iter().map(|t| t.depends_on.len()).collect();
        let mut ready: VecDeque<usize> = (0..self.tasks.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut out = Vec::with_capacity(self.tasks.len());

        while let Some(i) = ready.pop_front() {
            let task = &self.tasks[i];
            out.push(task);
            for child in self.dependents.get(&task.name).into_iter().flatten() {
                let c = self.index[child];
                in_degree[c] -= 1;
                if in_degree[c] == 0 {
                    ready.push_back(c);
                }
            }
        }
        out
    }

    /// ASCII rendering of each root and the chains hanging off it.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for root in self.tasks.iter().filter(|t| t.depends_on.is_empty()) {
            out.push_str(&format!("{} [{}]\n", root.name, root.kind.label()));
            self.render_chain(&root.name, "  ", &mut out);
        }
        out
    }

    fn render_chain(&self, name: &str, prefix: &str, out: &mut String) {
        if let Some(children) = self.dependents.get(name) {
            for child in children {
                out.push_str(&format!("{prefix}└─> {child}\n"));
                self.render_chain(child, &format!("{prefix}    "), out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(tasks: &[&Task]) -> Vec<String> {
        tasks.iter().map(|t| t.name.clone()).collect()
    }

    fn diamond() -> DependencyGraph {
        let mut b = GraphBuilder::new();
        b.add_task(Task::no_op("root"))
            .add_task(Task::no_op("left").after(["root"]))
            .add_task(Task::no_op("right"))
            .add_task(Task::no_op("join").after(["left", "right"]))
            .add_edge("root", "right");
        b.build().unwrap()
    }

    #[test]
    fn explicit_edges_merge_with_declared_predecessors() {
        let g = diamond();
        assert_eq!(g.get("right").unwrap().dependencies(), ["root".to_string()]);
        assert_eq!(names(&g.topological_order()), ["root", "left", "right", "join"]);
    }

    #[test]
    fn cycle_is_rejected() {
        let mut b = GraphBuilder::new();
        b.add_task(Task::no_op("a").after(["b"]))
            .add_task(Task::no_op("b"))
            .add_edge("a", "b");
        assert!(matches!(b.validate(), Err(DagError::CycleDetected { .. })));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let mut b = GraphBuilder::new();
        b.add_task(Task::no_op("fact").after(["stage"]));
        assert_eq!(
            b.validate(),
            Err(DagError::UnknownDependency {
                task: "fact".into(),
                dependency: "stage".into()
            })
        );

        let mut b = GraphBuilder::new();
        b.add_task(Task::no_op("a")).add_edge("a", "ghost");
        assert!(matches!(b.validate(), Err(DagError::UnknownDependency { .. })));
    }

    #[test]
    fn edges_may_be_added_before_their_tasks() {
        let mut b = GraphBuilder::new();
        b.add_edge("stage", "load")
            .add_task(Task::no_op("load"))
            .add_task(Task::no_op("stage"));
        let g = b.build().unwrap();
        assert_eq!(g.get("load").unwrap().dependencies(), ["stage"]);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut b = GraphBuilder::new();
        b.add_task(Task::no_op("a")).add_task(Task::no_op("a"));
        assert_eq!(b.validate(), Err(DagError::DuplicateTask("a".into())));
        assert!(matches!(b.build(), Err(DagError::DuplicateTask(name)) if name == "a"));
    }

    #[test]
    fn ready_tasks_wait_for_every_predecessor() {
        let g = diamond();
        let mut states = g.initial_states();
        assert_eq!(names(&g.ready_tasks(&states)), ["root"]);

        states.get_mut("root").unwrap().status = TaskStatus::Succeeded;
        assert_eq!(names(&g.ready_tasks(&states)), ["left", "right"]);

        states.get_mut("left").unwrap().status = TaskStatus::Succeeded;
        states.get_mut("right").unwrap().status = TaskStatus::Running;
        assert!(g.ready_tasks(&states).is_empty());

        states.get_mut("right").unwrap().status = TaskStatus::Succeeded;
        assert_eq!(names(&g.ready_tasks(&states)), ["join"]);
    }

    #[test]
    fn downstream_is_transitive() {
        let g = diamond();
        assert_eq!(g.downstream_of("root"), ["left", "right", "join"]);
        assert_eq!(g.downstream_of("right"), ["join"]);
        assert!(g.downstream_of("join").is_empty());
    }

    #[test]
    fn definition_round_trips_through_json() {
        let def: RunDefinition = serde_json::from_value(serde_json::json!({
            "tasks": [
                {"name": "Begin_execution", "kind": "no_op"},
                {"name": "create_tables", "kind": "sql",
                 "statements": ["CREATE TABLE IF NOT EXISTS users (userid int)"],
                 "depends_on": ["Begin_execution"]}
            ]
        }))
        .unwrap();

        let g = DependencyGraph::from_definition(def).unwrap();
        assert_eq!(g.len(), 2);
        assert!(g.render().contains("└─> create_tables"));
    }
}
