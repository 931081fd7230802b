//! Directed acyclic dependency graph over variable ids
//!
//! An edge `from -> to` means `to` is recomputed when `from` changes. The
//! graph refuses any edge that would close a cycle, and hands out a
//! topological propagation order for a changed variable. Recomputing the
//! dependents is left to a [`Propagator`](crate::domain::collaborators::Propagator).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use super::variable::VariableId;
use crate::error::{VarError, VarResult};

/// Why one variable depends on another
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    /// `to` is computed from `from`
    Data,
    /// `from` bounds the valid range of `to`
    Constraint,
    /// `to` is tuned together with `from`
    Optimization,
}

/// A single dependency edge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    /// Prerequisite
    pub from: VariableId,
    /// Dependent
    pub to: VariableId,
    /// Edge kind
    pub kind: DependencyKind,
}

/// Dependency graph for one session
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    forward: HashMap<VariableId, BTreeMap<VariableId, DependencyKind>>,
    reverse: HashMap<VariableId, BTreeSet<VariableId>>,
}

impl DependencyGraph {
    /// Empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a graph from exported edges, rejecting cycles
    pub fn from_edges(edges: &[DependencyEdge]) -> VarResult<Self> {
        let mut graph = Self::new();
        for edge in edges {
            graph.add_dependency(&edge.from, &edge.to, edge.kind)?;
        }
        Ok(graph)
    }

    /// Insert `from -> to`.
    ///
    /// Returns `Ok(false)` when the exact edge already exists. The cycle check
    /// runs before any mutation, so a rejected edge leaves the graph untouched.
    pub fn add_dependency(&mut self, from: &VariableId, to: &VariableId, kind: DependencyKind) -> VarResult<bool> {
        if from == to || self.reaches(to, from) {
            return Err(VarError::WouldCreateCycle {
                from: from.0.clone(),
                to: to.0.clone(),
            });
        }

        let targets = self.forward.entry(from.clone()).or_default();
        let previous = targets.insert(to.clone(), kind);
        self.reverse.entry(to.clone()).or_default().insert(from.clone());
        Ok(previous != Some(kind))
    }

    /// Remove `from -> to`; returns whether it existed
    pub fn remove_dependency(&mut self, from: &VariableId, to: &VariableId) -> bool {
        let removed = match self.forward.get_mut(from) {
            Some(targets) => {
                let removed = targets.remove(to).is_some();
                if targets.is_empty() {
                    self.forward.remove(from);
                }
                removed
            }
            None => false,
        };

        if removed {
            if let Some(sources) = self.reverse.get_mut(to) {
                sources.remove(from);
                if sources.is_empty() {
                    self.reverse.remove(to);
                }
            }
        }
        removed
    }

    /// Whether `target` is reachable from `start` along forward edges
    pub fn reaches(&self, start: &VariableId, target: &VariableId) -> bool {
        if start == target {
            return true;
        }
        let mut visited = BTreeSet::new();
        let mut stack = vec![start];

        while let Some(node) = stack.pop() {
            if !visited.insert(node) {
                continue;
            }
            if let Some(targets) = self.forward.get(node) {
                for next in targets.keys() {
                    if next == target {
                        return true;
                    }
                    stack.push(next);
                }
            }
        }
        false
    }

    /// Direct dependents of a variable
    pub fn dependents(&self, id: &VariableId) -> Vec<VariableId> {
        self.forward
            .get(id)
            .map(|targets| targets.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Direct prerequisites of a variable
    pub fn prerequisites(&self, id: &VariableId) -> Vec<VariableId> {
        self.reverse
            .get(id)
            .map(|sources| sources.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether anything depends on the variable
    pub fn has_dependents(&self, id: &VariableId) -> bool {
        self.forward.get(id).map_or(false, |targets| !targets.is_empty())
    }

    /// `changed` followed by every transitive dependent in topological order.
    ///
    /// Only edges inside the affected set count, so a dependent is never
    /// listed before one of its affected prerequisites. Ties are broken by id
    /// to keep the order deterministic.
    pub fn get_update_order(&self, changed: &VariableId) -> Vec<VariableId> {
        let mut affected = BTreeSet::new();
        let mut queue = VecDeque::from([changed.clone()]);
        while let Some(node) = queue.pop_front() {
            if !affected.insert(node.clone()) {
                continue;
            }
            if let Some(targets) = self.forward.get(&node) {
                queue.extend(targets.keys().cloned());
            }
        }

        let mut in_degree: BTreeMap<&VariableId, usize> = affected
            .iter()
            .map(|node| {
                let degree = self
                    .reverse
                    .get(node)
                    .map_or(0, |sources| sources.iter().filter(|s| affected.contains(*s)).count());
                (node, degree)
            })
            .collect();

        let mut ready: BTreeSet<&VariableId> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(node, _)| *node)
            .collect();
        let mut order = Vec::with_capacity(affected.len());

        while let Some(node) = ready.pop_first() {
            order.push(node.clone());
            if let Some(targets) = self.forward.get(node) {
                for next in targets.keys() {
                    if let Some(degree) = in_degree.get_mut(next) {
                        *degree -= 1;
                        if *degree == 0 {
                            ready.insert(next);
                        }
                    }
                }
            }
        }
        order
    }

    /// Drop every edge touching the variable; returns how many were removed
    pub fn remove_variable(&mut self, id: &VariableId) -> usize {
        let mut removed = 0;
        for dependent in self.dependents(id) {
            if self.remove_dependency(id, &dependent) {
                removed += 1;
            }
        }
        for prerequisite in self.prerequisites(id) {
            if self.remove_dependency(&prerequisite, id) {
                removed += 1;
            }
        }
        removed
    }

    /// Whether the exact edge exists
    pub fn contains_edge(&self, from: &VariableId, to: &VariableId) -> bool {
        self.forward.get(from).map_or(false, |targets| targets.contains_key(to))
    }

    /// All edges, sorted by `(from, to)`
    pub fn edges(&self) -> Vec<DependencyEdge> {
        let mut edges: Vec<DependencyEdge> = self
            .forward
            .iter()
            .flat_map(|(from, targets)| {
                targets.iter().map(move |(to, kind)| DependencyEdge {
                    from: from.clone(),
                    to: to.clone(),
                    kind: *kind,
                })
            })
            .collect();
        edges.sort_by(|a, b| (&a.from, &a.to).cmp(&(&b.from, &b.to)));
        edges
    }

    /// Number of edges
    pub fn edge_count(&self) -> usize {
        self.forward.values().map(BTreeMap::len).sum()
    }
}
