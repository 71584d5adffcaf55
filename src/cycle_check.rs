use std::collections::{HashMap, HashSet};

/// Depth-first search over predecessor edges. Returns one cycle as a path
/// that starts and ends on the same task, or `None` when the graph is
/// acyclic. `order` fixes the visiting order so the reported cycle is
/// deterministic.
pub fn find_cycle(
    order: &[String],
    predecessors: &HashMap<String, Vec<String>>,
) -> Option<Vec<String>> {
    let mut visited = HashSet::new();
    let mut stack: Vec<String> = Vec::new();
    let mut on_stack = HashSet::new();

    fn dfs(
        name: &str,
        predecessors: &HashMap<String, Vec<String>>,
        visited: &mut HashSet<String>,
        stack: &mut Vec<String>,
        on_stack: &mut HashSet<String>,
    ) -> Option<Vec<String>> {
        if on_stack.contains(name) {
            let start = stack.iter().position(|n| n == name).unwrap_or(0);
            let mut cycle: Vec<String> = stack[start..].to_vec();
            cycle.push(name.to_string());
            // Walked along predecessor edges; report in execution direction.
            cycle.reverse();
            return Some(cycle);
        }
        if visited.contains(name) {
            return None;
        }

        visited.insert(name.to_string());
        on_stack.insert(name.to_string());
        stack.push(name.to_string());

        if let Some(deps) = predecessors.get(name) {
            for dep in deps {
                if let Some(cycle) = dfs(dep, predecessors, visited, stack, on_stack) {
                    return Some(cycle);
                }
            }
        }

        stack.pop();
        on_stack.remove(name);
        None
    }

    for name in order {
        if !visited.contains(name) {
            if let Some(cycle) = dfs(name, predecessors, &mut visited, &mut stack, &mut on_stack) {
                return Some(cycle);
            }
        }
    }

    None
}
