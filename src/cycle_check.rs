use std::collections::{HashMap, HashSet};
use crate::Task;

/// Returns one dependency cycle, as the path of task names that closes on
/// itself (`[a, b, a]`), or `None` if the graph is acyclic.
///
/// Unregistered dependency names are ignored here; they starve their
/// dependents instead of forming a cycle. Roots are visited in name order so
/// the reported cycle is stable.
pub fn find_cycle(tasks: &HashMap<String, Task>) -> Option<Vec<String>> {
    let mut visited = HashSet::new();
    let mut path = Vec::new();

    fn dfs<'a>(
        task_name: &'a str,
        tasks: &'a HashMap<String, Task>,
        visited: &mut HashSet<&'a str>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        if let Some(pos) = path.iter().position(|n| *n == task_name) {
            let mut cycle: Vec<String> = path[pos..].iter().map(|n| n.to_string()).collect();
            cycle.push(task_name.to_string());
            return Some(cycle);
        }
        if visited.contains(task_name) {
            return None;
        }

        let task = tasks.get(task_name)?;
        visited.insert(task_name);
        path.push(task_name);

        for dep in task.dependencies() {
            if let Some(cycle) = dfs(dep, tasks, visited, path) {
                return Some(cycle);
            }
        }

        path.pop();
        None
    }

    let mut names: Vec<&String> = tasks.keys().collect();
    names.sort();

    for task_name in names {
        if !visited.contains(task_name.as_str()) {
            if let Some(cycle) = dfs(task_name, tasks, &mut visited, &mut path) {
                return Some(cycle);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::task_fn;

    fn graph(edges: &[(&str, &[&str])]) -> HashMap<String, Task> {
        edges
            .iter()
            .map(|(name, deps)| {
                let task = Task::new(
                    name.to_string(),
                    task_fn(|| async { Ok(()) }),
                    deps.iter().map(|d| d.to_string()).collect(),
                    None,
                );
                (name.to_string(), task)
            })
            .collect()
    }

    #[test]
    fn acyclic_graph_has_no_cycle() {
        let tasks = graph(&[("a", &[]), ("b", &["a"]), ("c", &["a", "b"])]);
        assert_eq!(find_cycle(&tasks), None);
    }

    #[test]
    fn two_node_cycle() {
        let tasks = graph(&[("a", &["b"]), ("b", &["a"])]);
        assert_eq!(
            find_cycle(&tasks),
            Some(vec!["a".to_string(), "b".to_string(), "a".to_string()])
        );
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let tasks = graph(&[("a", &["a"])]);
        assert_eq!(find_cycle(&tasks), Some(vec!["a".to_string(), "a".to_string()]));
    }

    #[test]
    fn cycle_below_a_root() {
        let tasks = graph(&[("a", &["b"]), ("b", &["c"]), ("c", &["b"])]);
        assert_eq!(
            find_cycle(&tasks),
            Some(vec!["b".to_string(), "c".to_string(), "b".to_string()])
        );
    }

    #[test]
    fn unknown_dependency_is_not_a_cycle() {
        let tasks = graph(&[("a", &["ghost"])]);
        assert_eq!(find_cycle(&tasks), None);
    }
}
