//! Module dependency graph.
//!
//! Resolves the order in which module migrations run. Pure graph analysis,
//! sorted traversal everywhere so every replica derives the same order.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::ConfigurationError;

/// Adjacency: module -> modules it depends on (which must migrate first).
pub type DependencyGraph = BTreeMap<String, BTreeSet<String>>;

/// Topological order of `graph`, dependencies first, ties broken
/// lexicographically (Kahn's algorithm with an ordered ready set).
pub fn migration_order(graph: &DependencyGraph) -> Result<Vec<String>, ConfigurationError> {
    for (module, deps) in graph {
        if let Some(unknown) = deps.iter().find(|d| !graph.contains_key(*d)) {
            return Err(ConfigurationError::InvalidMigrationOrder(format!(
                "module {:?} depends on unknown module {:?}",
                module, unknown
            )));
        }
        if deps.contains(module) {
            return Err(ConfigurationError::InvalidMigrationOrder(format!(
                "module {:?} depends on itself",
                module
            )));
        }
    }

    let mut remaining: BTreeMap<&str, usize> = graph
        .iter()
        .map(|(m, deps)| (m.as_str(), deps.len()))
        .collect();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (module, deps) in graph {
        for dep in deps {
            dependents.entry(dep.as_str()).or_default().push(module.as_str());
        }
    }

    let mut ready: BTreeSet<&str> = remaining
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(m, _)| *m)
        .collect();
    let mut order = Vec::with_capacity(graph.len());

    while let Some(next) = ready.pop_first() {
        order.push(next.to_string());
        for dependent in dependents.get(next).map(Vec::as_slice).unwrap_or(&[]) {
            if let Some(n) = remaining.get_mut(dependent) {
                *n -= 1;
                if *n == 0 {
                    ready.insert(*dependent);
                }
            }
        }
    }

    if order.len() != graph.len() {
        let cycle = detect_cycles(graph)
            .into_iter()
            .next()
            .map(|c| c.join(" -> "))
            .unwrap_or_default();
        return Err(ConfigurationError::InvalidMigrationOrder(format!(
            "dependency cycle: {}",
            cycle
        )));
    }
    Ok(order)
}

/// Detect dependency cycles.
/// Iterative DFS with explicit colour tracking, sorted traversal.
pub fn detect_cycles(graph: &DependencyGraph) -> Vec<Vec<String>> {
    const WHITE: u8 = 0;
    const GREY: u8 = 1;
    const BLACK: u8 = 2;

    let mut colour: BTreeMap<&str, u8> = graph.keys().map(|m| (m.as_str(), WHITE)).collect();
    let mut cycles: Vec<Vec<String>> = Vec::new();

    for start in graph.keys() {
        let start = start.as_str();
        if colour.get(start).copied().unwrap_or(WHITE) != WHITE {
            continue;
        }

        let mut stack: Vec<(&str, usize)> = vec![(start, 0)];
        colour.insert(start, GREY);

        while let Some((node, idx)) = stack.last().copied() {
            let neighbours: Vec<&str> = graph
                .get(node)
                .map(|deps| deps.iter().map(String::as_str).collect())
                .unwrap_or_default();

            if idx < neighbours.len() {
                if let Some(top) = stack.last_mut() {
                    top.1 = idx + 1;
                }
                let nbr = neighbours[idx];
                match colour.get(nbr).copied().unwrap_or(WHITE) {
                    GREY => {
                        let mut cycle = vec![nbr.to_string()];
                        for (sn, _) in stack.iter().rev() {
                            cycle.push(sn.to_string());
                            if *sn == nbr {
                                break;
                            }
                        }
                        cycles.push(cycle);
                    }
                    WHITE => {
                        colour.insert(nbr, GREY);
                        stack.push((nbr, 0));
                    }
                    _ => {}
                }
            } else {
                colour.insert(node, BLACK);
                stack.pop();
            }
        }
    }

    cycles
}
