use std::collections::{HashMap, HashSet};

use crate::model::TimelineItem;

/// Dependency edges of one project: item id → ids it must wait for.
pub struct DependencyGraph<'a> {
    /// Insertion order of item ids, so traversal is deterministic.
    order: Vec<&'a str>,
    edges: HashMap<&'a str, &'a [String]>,
}

impl<'a> DependencyGraph<'a> {
    /// Later items with a repeated id replace earlier ones.
    pub fn from_items(items: impl IntoIterator<Item = &'a TimelineItem>) -> Self {
        let mut order = Vec::new();
        let mut edges = HashMap::new();
        for item in items {
            if edges
                .insert(item.id.as_str(), item.dependencies.as_slice())
                .is_none()
            {
                order.push(item.id.as_str());
            }
        }
        Self { order, edges }
    }

    /// Ids with no item behind them have no outgoing edges.
    fn neighbors(&self, id: &str) -> &'a [String] {
        self.edges.get(id).copied().unwrap_or(&[])
    }

    /// Depth-first three-colouring over an explicit stack.
    ///
    /// Grey nodes are in `visiting` (on the current path), black nodes in
    /// `visited`. The first back edge to a grey node ends the search and the
    /// cycle is returned as a closed path, e.g. `[a, b, c, a]`.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut visiting: HashSet<&'a str> = HashSet::new();
        let mut visited: HashSet<&'a str> = HashSet::new();
        // (node, index of the next dependency to explore)
        let mut stack: Vec<(&'a str, usize)> = Vec::new();

        for &root in &self.order {
            if visited.contains(root) {
                continue;
            }
            visiting.insert(root);
            stack.push((root, 0));

            while let Some(frame) = stack.last_mut() {
                let (node, next) = *frame;
                let Some(dep) = self.neighbors(node).get(next) else {
                    visiting.remove(node);
                    visited.insert(node);
                    stack.pop();
                    continue;
                };
                frame.1 += 1;
                let dep = dep.as_str();

                if visiting.contains(dep) {
                    let from = stack.iter().position(|(n, _)| *n == dep).unwrap_or(0);
                    let mut path: Vec<String> =
                        stack[from..].iter().map(|(n, _)| n.to_string()).collect();
                    path.push(dep.to_string());
                    return Some(path);
                }
                if !visited.contains(dep) {
                    visiting.insert(dep);
                    stack.push((dep, 0));
                }
            }
        }
        None
    }

    pub fn has_cycle(&self) -> bool {
        self.find_cycle().is_some()
    }
}
