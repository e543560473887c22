use std::sync::Arc;
use std::time::Instant;

use flowgraph_core::{
    Counter, HeaderOverrides, Histogram, LifecycleError, Message, MetricsSink, Payload, Port,
    PortSpec, UserError, WiringError,
};

/// The lifecycle states a node moves through. Transitions are strictly
/// forward: `Created -> Started -> Running -> Stopped`, with `Running`
/// re-entered after every successful `on_message`/`on_tick` (it is not
/// a terminal state distinct from "started and ticking").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Created,
    Started,
    Running,
    Stopped,
}

impl NodeState {
    fn label(self) -> &'static str {
        match self {
            NodeState::Created => "created",
            NodeState::Started => "started",
            NodeState::Running => "running",
            NodeState::Stopped => "stopped",
        }
    }
}

/// The interface a node uses to send messages downstream. Implemented
/// by the scheduler; a node never touches an [`crate::Edge`] directly.
pub trait EmitSink {
    fn emit(&mut self, node: &str, port: &str, message: Message) -> Result<Message, WiringError>;
}

/// Context handed to every node callback invocation.
pub struct NodeContext<'a> {
    node_name: &'a str,
    sink: &'a mut dyn EmitSink,
    ambient_trace_id: String,
}

impl<'a> NodeContext<'a> {
    fn new(node_name: &'a str, sink: &'a mut dyn EmitSink, ambient_trace_id: String) -> Self {
        Self { node_name, sink, ambient_trace_id }
    }

    /// Sends `message` out of `port`. When this callback was triggered
    /// by an inbound message, that message's trace id is attached so
    /// the whole causal chain correlates; a tick or lifecycle callback
    /// has no ambient trace id to propagate, so `message` is forwarded
    /// exactly as given, keeping whatever trace id it already carries.
    pub fn emit(&mut self, port: &str, message: Message) -> Result<Message, WiringError> {
        let message = if self.ambient_trace_id.is_empty() {
            message
        } else {
            message.with_headers(HeaderOverrides::default().with_trace_id(self.ambient_trace_id.clone()))
        };
        self.sink.emit(self.node_name, port, message)
    }

    pub fn node_name(&self) -> &str {
        self.node_name
    }
}

/// User-implemented processing behavior for one node in the graph.
///
/// All four callbacks default to doing nothing so a node can implement
/// only the ones it needs. Returning an error from any callback is
/// reported and counted by the owning [`NodeHandle`] but does not
/// panic the scheduler: errors are isolated per node.
pub trait Node: Send {
    fn name(&self) -> &str;

    fn ports(&self) -> &[PortSpec];

    fn on_start(&mut self, _ctx: &mut NodeContext) -> Result<(), UserError> {
        Ok(())
    }

    fn on_message(&mut self, _port: &str, _message: Message, _ctx: &mut NodeContext) -> Result<(), UserError> {
        Ok(())
    }

    fn on_tick(&mut self, _ctx: &mut NodeContext) -> Result<(), UserError> {
        Ok(())
    }

    fn on_stop(&mut self, _ctx: &mut NodeContext) -> Result<(), UserError> {
        Ok(())
    }
}

/// Owns a [`Node`] implementation plus the lifecycle bookkeeping,
/// metrics, and error isolation the scheduler relies on. Every
/// callback invocation goes through this wrapper rather than calling
/// the inner node directly.
pub struct NodeHandle {
    inner: Box<dyn Node>,
    state: NodeState,
    messages_total: Option<Arc<dyn Counter>>,
    errors_total: Option<Arc<dyn Counter>>,
    tick_duration: Option<Arc<dyn Histogram>>,
}

impl NodeHandle {
    pub fn new(inner: Box<dyn Node>) -> Self {
        Self {
            inner,
            state: NodeState::Created,
            messages_total: None,
            errors_total: None,
            tick_duration: None,
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn ports(&self) -> &[PortSpec] {
        self.inner.ports()
    }

    pub fn bind_metrics(&mut self, sink: &dyn MetricsSink) {
        if self.messages_total.is_some() {
            return;
        }
        let labels = vec![("node", self.name().to_string())];
        self.messages_total = Some(sink.counter("node_messages_total", labels.clone()));
        self.errors_total = Some(sink.counter("node_errors_total", labels.clone()));
        self.tick_duration = Some(sink.histogram("node_tick_duration_seconds", labels));
    }

    fn require_state(&self, allowed: &[NodeState], operation: &'static str) -> Result<(), LifecycleError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(LifecycleError::InvalidTransition {
                node: self.name().to_string(),
                state: self.state.label(),
                operation,
            })
        }
    }

    pub fn start(&mut self, sink: &mut dyn EmitSink) -> Result<(), UserError> {
        self.require_state(&[NodeState::Created], "on_start")
            .unwrap_or_else(|e| tracing::warn!(event = "node.lifecycle_warning", error = %e));
        let name = self.inner.name().to_string();
        let _span = tracing::info_span!("node.on_start", node = %name).entered();
        let mut ctx = NodeContext::new(&name, sink, String::new());
        let result = self.inner.on_start(&mut ctx);
        if result.is_ok() {
            self.state = NodeState::Started;
            tracing::info!(event = "node.start", node = %name);
        } else if let Some(c) = &self.errors_total {
            c.increment(1);
        }
        result
    }

    pub fn dispatch_message(
        &mut self,
        port: &str,
        message: Message,
        sink: &mut dyn EmitSink,
    ) -> Result<(), UserError> {
        let name = self.inner.name().to_string();
        let trace_id = message.trace_id().to_string();
        let _span = tracing::info_span!("node.on_message", node = %name, port = %port, trace_id = %trace_id).entered();

        let start = Instant::now();
        let mut ctx = NodeContext::new(&name, sink, trace_id);
        let result = self.inner.on_message(port, message, &mut ctx);
        let elapsed = start.elapsed().as_secs_f64();
        if let Some(h) = &self.tick_duration {
            h.observe(elapsed);
        }

        match &result {
            Ok(()) => {
                self.state = NodeState::Running;
                if let Some(c) = &self.messages_total {
                    c.increment(1);
                }
            }
            Err(err) => {
                if let Some(c) = &self.errors_total {
                    c.increment(1);
                }
                tracing::error!(event = "node.message_error", node = %name, port = %port, error = %err);
            }
        }
        result
    }

    pub fn dispatch_tick(&mut self, sink: &mut dyn EmitSink) -> Result<(), UserError> {
        let name = self.inner.name().to_string();
        let _span = tracing::info_span!("node.on_tick", node = %name).entered();

        let start = Instant::now();
        let mut ctx = NodeContext::new(&name, sink, String::new());
        let result = self.inner.on_tick(&mut ctx);
        let elapsed = start.elapsed().as_secs_f64();
        if let Some(h) = &self.tick_duration {
            h.observe(elapsed);
        }

        match &result {
            Ok(()) => self.state = NodeState::Running,
            Err(err) => {
                if let Some(c) = &self.errors_total {
                    c.increment(1);
                }
                tracing::error!(event = "node.tick_error", node = %name, error = %err);
            }
        }
        result
    }

    pub fn stop(&mut self, sink: &mut dyn EmitSink) -> Result<(), UserError> {
        let name = self.inner.name().to_string();
        let _span = tracing::info_span!("node.on_stop", node = %name).entered();
        let mut ctx = NodeContext::new(&name, sink, String::new());
        let result = self.inner.on_stop(&mut ctx);
        self.state = NodeState::Stopped;
        if result.is_ok() {
            tracing::info!(event = "node.stop", node = %name);
        } else if let Some(c) = &self.errors_total {
            c.increment(1);
        }
        result
    }

    pub fn validate_port(&self, port: &str) -> bool {
        self.inner.ports().iter().any(|p| p.name() == port)
    }

    pub fn port_spec(&self, port: &str) -> Option<&PortSpec> {
        self.inner.ports().iter().find(|p| p.name() == port)
    }
}

pub(crate) fn check_payload(port_spec: Option<&PortSpec>, payload: &Payload, port: &Port) -> Result<(), flowgraph_core::TypeError> {
    match port_spec {
        Some(spec) if !spec.validate(payload) => Err(flowgraph_core::TypeError { port: port.clone() }),
        _ => Ok(()),
    }
}
