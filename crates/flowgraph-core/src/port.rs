use std::fmt;
use std::sync::Arc;

use crate::message::Payload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Input,
    Output,
}

/// A named, directional port declared by a node.
///
/// Validation is optional: a port with no validator accepts any
/// payload. When present, the validator is consulted once per message
/// on the emitting side (see `Node::emit`), not per enqueue, so a
/// slow validator does not run once per overflow-policy retry.
#[derive(Clone)]
pub struct PortSpec {
    name: String,
    direction: Direction,
    validate: Option<Arc<dyn Fn(&Payload) -> bool + Send + Sync>>,
}

impl fmt::Debug for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortSpec")
            .field("name", &self.name)
            .field("direction", &self.direction)
            .field("typed", &self.validate.is_some())
            .finish()
    }
}

impl PortSpec {
    pub fn input(name: impl Into<String>) -> Self {
        Self { name: name.into(), direction: Direction::Input, validate: None }
    }

    pub fn output(name: impl Into<String>) -> Self {
        Self { name: name.into(), direction: Direction::Output, validate: None }
    }

    pub fn with_validator<F>(mut self, validate: F) -> Self
    where
        F: Fn(&Payload) -> bool + Send + Sync + 'static,
    {
        self.validate = Some(Arc::new(validate));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn validate(&self, payload: &Payload) -> bool {
        match &self.validate {
            Some(f) => f(payload),
            None => true,
        }
    }
}

/// A concrete port instance on a node, carrying just the identity a
/// [`crate::Subgraph`] needs to wire edges up; the behavior lives in
/// the owning node's [`PortSpec`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Port {
    pub node: String,
    pub port: String,
}

impl Port {
    pub fn new(node: impl Into<String>, port: impl Into<String>) -> Self {
        Self { node: node.into(), port: port.into() }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.port)
    }
}
