//! Version→version state transforms and path search between versions.
//!
//! Migrations form a directed graph keyed by source version. To move state
//! from one version to another, [`MigrationRegistry::find_path`] runs an
//! unweighted breadth-first search and takes the first path it reaches.
//! Outgoing edges are explored in registration order, so the same registry
//! always yields the same path. The search gives up after `max_steps` node
//! expansions.
//!
//! ```
//! use plexus_state::migration::MigrationRegistry;
//! use serde_json::json;
//!
//! let mut registry = MigrationRegistry::default();
//! registry.register("v1", "v2", |mut s| { s["hp"] = json!(100); Ok(s) });
//! registry.register("v2", "v3", |mut s| { s["mp"] = json!(50); Ok(s) });
//!
//! let state = registry.migrate_state(json!({}), "v1", "v3").unwrap();
//! assert_eq!(state, json!({ "hp": 100, "mp": 50 }));
//! ```

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::StateError;

/// A migration transform.
pub type TransformFn = Box<dyn Fn(Value) -> anyhow::Result<Value>>;

/// Default bound on node expansions during path search.
pub const DEFAULT_MAX_STEPS: usize = 64;

struct MigrationEdge {
    to: String,
    transform: TransformFn,
}

/// One hop of a migration path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationStep {
    pub from: String,
    pub to: String,
    /// Position of the edge among `from`'s outgoing edges.
    #[serde(skip)]
    edge: usize,
}

/// Adjacency list of migrations keyed by source version.
pub struct MigrationRegistry {
    edges: BTreeMap<String, Vec<MigrationEdge>>,
    max_steps: usize,
}

impl MigrationRegistry {
    pub fn new(max_steps: usize) -> Self {
        Self {
            edges: BTreeMap::new(),
            max_steps,
        }
    }

    /// Add an edge `from` → `to`.
    ///
    /// Registering a second edge between the same versions keeps both; the
    /// earlier one wins during search.
    pub fn register<F>(&mut self, from: &str, to: &str, transform: F)
    where
        F: Fn(Value) -> anyhow::Result<Value> + 'static,
    {
        tracing::debug!(from, to, "migration registered");
        self.edges.entry(from.to_owned()).or_default().push(MigrationEdge {
            to: to.to_owned(),
            transform: Box::new(transform),
        });
    }

    /// Total number of edges.
    pub fn edge_count(&self) -> usize {
        self.edges.values().map(Vec::len).sum()
    }

    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    pub fn clear(&mut self) {
        self.edges.clear();
    }

    /// Breadth-first search for a path `from` → `to`.
    ///
    /// # Errors
    ///
    /// [`StateError::NoMigrationPath`] when the target is unreachable or
    /// lies beyond the step budget.
    pub fn find_path(&self, from: &str, to: &str) -> Result<Vec<MigrationStep>, StateError> {
        if from == to {
            return Ok(Vec::new());
        }

        let mut queue: VecDeque<&str> = VecDeque::from([from]);
        let mut visited: HashSet<&str> = HashSet::from([from]);
        // target version -> (source version, edge index)
        let mut parent: HashMap<&str, (&str, usize)> = HashMap::new();
        let mut steps = 0;

        while let Some(node) = queue.pop_front() {
            if steps >= self.max_steps {
                tracing::debug!(from, to, steps, "migration search budget exhausted");
                break;
            }
            steps += 1;

            let Some(outgoing) = self.edges.get(node) else {
                continue;
            };
            for (index, edge) in outgoing.iter().enumerate() {
                let next = edge.to.as_str();
                if !visited.insert(next) {
                    continue;
                }
                parent.insert(next, (node, index));
                if next == to {
                    return Ok(unwind(&parent, from, to));
                }
                queue.push_back(next);
            }
        }

        Err(StateError::NoMigrationPath {
            from: from.to_owned(),
            to: to.to_owned(),
        })
    }

    /// Bring `state` from version `from` to version `to`.
    ///
    /// `from == to` returns the state untouched.
    ///
    /// # Errors
    ///
    /// [`StateError::NoMigrationPath`] if no path exists, or
    /// [`StateError::TransformFailed`] if a transform along it fails.
    pub fn migrate_state(&self, state: Value, from: &str, to: &str) -> Result<Value, StateError> {
        let path = self.find_path(from, to)?;
        let mut state = state;
        for step in &path {
            let edge = &self.edges[&step.from][step.edge];
            state = (edge.transform)(state).map_err(|e| StateError::TransformFailed {
                from: step.from.clone(),
                to: step.to.clone(),
                source: e.into(),
            })?;
            tracing::debug!(from = %step.from, to = %step.to, "migration applied");
        }
        Ok(state)
    }
}

fn unwind(parent: &HashMap<&str, (&str, usize)>, from: &str, to: &str) -> Vec<MigrationStep> {
    let mut path = Vec::new();
    let mut current = to;
    while current != from {
        let Some(&(prev, edge)) = parent.get(current) else {
            break;
        };
        path.push(MigrationStep {
            from: prev.to_owned(),
            to: current.to_owned(),
            edge,
        });
        current = prev;
    }
    path.reverse();
    path
}

impl Default for MigrationRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_STEPS)
    }
}

impl fmt::Debug for MigrationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let edges: Vec<(&str, &str)> = self
            .edges
            .iter()
            .flat_map(|(from, out)| out.iter().map(move |e| (from.as_str(), e.to.as_str())))
            .collect();
        f.debug_struct("MigrationRegistry")
            .field("edges", &edges)
            .field("max_steps", &self.max_steps)
            .finish()
    }
}
