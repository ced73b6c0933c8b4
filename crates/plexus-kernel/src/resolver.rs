//! Depth-first dependency resolution.
//!
//! Plugins are visited in registration order. Each visit walks hard
//! dependencies first, then soft dependencies that are registered, and emits
//! the plugin after all of them (post-order). Reaching a plugin that is
//! still on the walk stack is a cycle; the error carries the full path.

use std::collections::HashMap;

use crate::plugin::Descriptor;
use crate::KernelError;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

struct Walk<'a> {
    nodes: &'a [Descriptor],
    index: &'a HashMap<String, usize>,
    marks: Vec<Mark>,
    stack: Vec<usize>,
    order: Vec<usize>,
}

/// Indices into `nodes` with every dependency before its dependents.
pub(crate) fn resolve(
    nodes: &[Descriptor],
    index: &HashMap<String, usize>,
) -> Result<Vec<usize>, KernelError> {
    let mut walk = Walk {
        nodes,
        index,
        marks: vec![Mark::Unvisited; nodes.len()],
        stack: Vec::new(),
        order: Vec::with_capacity(nodes.len()),
    };
    for node in 0..nodes.len() {
        walk.visit(node)?;
    }
    Ok(walk.order)
}

impl Walk<'_> {
    fn visit(&mut self, node: usize) -> Result<(), KernelError> {
        match self.marks[node] {
            Mark::Done => return Ok(()),
            Mark::OnStack => return Err(self.cycle_through(node)),
            Mark::Unvisited => {}
        }
        self.marks[node] = Mark::OnStack;
        self.stack.push(node);

        let nodes = self.nodes;
        let descriptor = &nodes[node];
        for dependency in &descriptor.requires {
            let Some(&next) = self.index.get(dependency) else {
                return Err(KernelError::MissingDependency {
                    plugin: descriptor.id.clone(),
                    dependency: dependency.clone(),
                });
            };
            self.visit(next)?;
        }
        for dependency in &descriptor.optional_requires {
            if let Some(&next) = self.index.get(dependency) {
                self.visit(next)?;
            }
        }

        self.stack.pop();
        self.marks[node] = Mark::Done;
        self.order.push(node);
        Ok(())
    }

    /// `node` is on the stack: the cycle is the stack from `node` onwards,
    /// closed by `node` again.
    fn cycle_through(&self, node: usize) -> KernelError {
        let start = self
            .stack
            .iter()
            .position(|&n| n == node)
            .unwrap_or_default();
        let path = self.stack[start..]
            .iter()
            .chain(std::iter::once(&node))
            .map(|&n| self.nodes[n].id.clone())
            .collect();
        KernelError::DependencyCycle { path }
    }
}
