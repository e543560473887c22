use ahash::AHashMap;
use flowgraph_core::{Policy, Port, ValidationIssue};

use crate::node::NodeHandle;

/// A declared connection between one node's output port and another's
/// input port, not yet backed by a live queue.
pub struct EdgeSpec {
    pub from: Port,
    pub to: Port,
    pub capacity: usize,
    pub policy: Policy,
}

/// A declarative description of a wiring: the nodes that exist, the
/// edges between their ports, and which of a subgraph's internal
/// ports are exposed as its own boundary (relevant when a subgraph is
/// itself nested inside a larger one).
///
/// A `Subgraph` on its own does nothing; [`crate::RuntimePlan::build_from_graphs`]
/// flattens one or more of them into something the scheduler can run.
#[derive(Default)]
pub struct Subgraph {
    nodes: AHashMap<String, NodeHandle>,
    edges: Vec<EdgeSpec>,
    exposed_inputs: AHashMap<String, Port>,
    exposed_outputs: AHashMap<String, Port>,
    /// Aliases passed to `expose_input`/`expose_output` a second time.
    /// The first registration wins; `validate()` reports the rest.
    duplicate_exposed_inputs: Vec<String>,
    duplicate_exposed_outputs: Vec<String>,
}

impl Subgraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: NodeHandle) -> Result<(), ValidationIssue> {
        let name = node.name().to_string();
        if self.nodes.contains_key(&name) {
            return Err(ValidationIssue::DuplicateNode(name));
        }
        self.nodes.insert(name, node);
        Ok(())
    }

    pub fn add_edge(&mut self, from: Port, to: Port, capacity: usize, policy: Policy) {
        self.edges.push(EdgeSpec { from, to, capacity, policy });
    }

    pub fn expose_input(&mut self, alias: impl Into<String>, port: Port) {
        let alias = alias.into();
        if self.exposed_inputs.contains_key(&alias) {
            self.duplicate_exposed_inputs.push(alias);
        } else {
            self.exposed_inputs.insert(alias, port);
        }
    }

    pub fn expose_output(&mut self, alias: impl Into<String>, port: Port) {
        let alias = alias.into();
        if self.exposed_outputs.contains_key(&alias) {
            self.duplicate_exposed_outputs.push(alias);
        } else {
            self.exposed_outputs.insert(alias, port);
        }
    }

    pub fn nodes(&self) -> &AHashMap<String, NodeHandle> {
        &self.nodes
    }

    pub fn into_nodes(self) -> AHashMap<String, NodeHandle> {
        self.nodes
    }

    pub fn edges(&self) -> &[EdgeSpec] {
        &self.edges
    }

    pub fn exposed_inputs(&self) -> &AHashMap<String, Port> {
        &self.exposed_inputs
    }

    pub fn exposed_outputs(&self) -> &AHashMap<String, Port> {
        &self.exposed_outputs
    }

    /// Checks internal consistency without mutating anything. Returns
    /// every issue found rather than stopping at the first one, so a
    /// caller can report a complete picture of what is wrong with the
    /// wiring in one pass.
    pub fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        let mut seen_edges = ahash::AHashSet::new();

        for edge in &self.edges {
            let edge_id = format!("{}->{}", edge.from, edge.to);
            if !seen_edges.insert(edge_id.clone()) {
                issues.push(ValidationIssue::DuplicateEdge(edge_id));
            }

            match self.nodes.get(&edge.from.node) {
                Some(node) => {
                    if !node.validate_port(&edge.from.port) {
                        issues.push(ValidationIssue::NoSourcePort {
                            node: edge.from.node.clone(),
                            port: edge.from.port.clone(),
                        });
                    }
                }
                None => issues.push(ValidationIssue::UnknownNode(edge.from.node.clone())),
            }

            match self.nodes.get(&edge.to.node) {
                Some(node) => {
                    if !node.validate_port(&edge.to.port) {
                        issues.push(ValidationIssue::NoDestPort {
                            node: edge.to.node.clone(),
                            port: edge.to.port.clone(),
                        });
                    }
                }
                None => issues.push(ValidationIssue::UnknownNode(edge.to.node.clone())),
            }

            if edge.capacity == 0 {
                issues.push(ValidationIssue::BadCapacity(edge.capacity));
            }
        }

        for (alias, port) in &self.exposed_inputs {
            let known = self.nodes.get(&port.node).map(|n| n.validate_port(&port.port)).unwrap_or(false);
            if !known {
                issues.push(ValidationIssue::BadExposedInput(alias.clone()));
            }
        }
        for (alias, port) in &self.exposed_outputs {
            let known = self.nodes.get(&port.node).map(|n| n.validate_port(&port.port)).unwrap_or(false);
            if !known {
                issues.push(ValidationIssue::BadExposedOutput(alias.clone()));
            }
        }
        for alias in &self.duplicate_exposed_inputs {
            issues.push(ValidationIssue::DuplicateExposedInput(alias.clone()));
        }
        for alias in &self.duplicate_exposed_outputs {
            issues.push(ValidationIssue::DuplicateExposedOutput(alias.clone()));
        }

        issues
    }
}
