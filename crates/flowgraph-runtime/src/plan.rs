use ahash::AHashMap;
use flowgraph_core::{Message, MetricsSink, Policy, Port, PriorityBand, PutResult, ValidationIssue, WiringError};
use smallvec::SmallVec;

use crate::edge::Edge;
use crate::node::{check_payload, NodeHandle};
use crate::subgraph::Subgraph;

/// Per-node readiness as seen by the scheduler's selection loop.
#[derive(Debug, Clone, Default)]
pub struct ReadyState {
    /// True when at least one input edge has a message waiting.
    pub message_ready: bool,
    /// Edge ids this node most recently failed to emit into because
    /// the edge was full and its policy is `Block`.
    pub blocked_edges: Vec<String>,
}

/// A flattened, index-addressable view of one or more [`Subgraph`]s:
/// every node and edge gets a stable string id, and readiness is
/// tracked per node so the scheduler can decide what is runnable
/// without re-walking the original graph structure each tick.
pub struct RuntimePlan {
    nodes: AHashMap<String, NodeHandle>,
    node_order: Vec<String>,
    edges: AHashMap<String, Edge>,
    /// node -> (input port, edge id) feeding it, in the order those
    /// edges were declared.
    in_edges: AHashMap<String, SmallVec<[(String, String); 4]>>,
    /// (node, output port) -> edge id, for O(1) emit routing.
    out_routes: AHashMap<(String, String), String>,
    ready_states: AHashMap<String, ReadyState>,
}

impl RuntimePlan {
    /// Validates and flattens `graphs` into a single runnable plan.
    /// Fails with the combined validation issues from every subgraph
    /// if any are found; no partial plan is left behind on failure.
    ///
    /// `pending_priorities` applies to the edges it names; an id with
    /// no matching edge is silently ignored, since it may belong to a
    /// future registration.
    pub fn build_from_graphs(
        graphs: Vec<Subgraph>,
        metrics: &dyn MetricsSink,
        pending_priorities: &AHashMap<String, PriorityBand>,
    ) -> Result<Self, WiringError> {
        let mut issues = Vec::new();
        for graph in &graphs {
            issues.extend(graph.validate());
        }
        if !issues.is_empty() {
            return Err(WiringError::Invalid(issues));
        }

        let mut nodes = AHashMap::new();
        let mut node_order = Vec::new();
        let mut edges = AHashMap::new();
        let mut in_edges: AHashMap<String, SmallVec<[(String, String); 4]>> = AHashMap::new();
        let mut out_routes = AHashMap::new();
        let mut ready_states = AHashMap::new();
        let mut duplicate_nodes = Vec::new();

        for graph in graphs {
            let edge_specs: Vec<_> = graph.edges().iter().map(|e| (e.from.clone(), e.to.clone(), e.capacity, e.policy.clone())).collect();
            for (name, mut handle) in graph.into_nodes() {
                if nodes.contains_key(&name) {
                    duplicate_nodes.push(ValidationIssue::DuplicateNode(name));
                    continue;
                }
                handle.bind_metrics(metrics);
                node_order.push(name.clone());
                ready_states.insert(name.clone(), ReadyState::default());
                nodes.insert(name, handle);
            }

            for (from, to, capacity, policy) in edge_specs {
                let edge_id = format!("{}->{}", from, to);
                let mut edge = Edge::new(edge_id.clone(), capacity, policy);
                edge.bind_metrics(metrics);
                if let Some(band) = pending_priorities.get(&edge_id) {
                    edge.set_band(*band);
                }
                edges.insert(edge_id.clone(), edge);
                in_edges.entry(to.node.clone()).or_default().push((to.port.clone(), edge_id.clone()));
                out_routes.insert((from.node.clone(), from.port.clone()), edge_id);
            }
        }

        if !duplicate_nodes.is_empty() {
            return Err(WiringError::Invalid(duplicate_nodes));
        }

        Ok(Self { nodes, node_order, edges, in_edges, out_routes, ready_states })
    }

    pub fn node_order(&self) -> &[String] {
        &self.node_order
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn node(&self, name: &str) -> Option<&NodeHandle> {
        self.nodes.get(name)
    }

    pub fn node_mut(&mut self, name: &str) -> Option<&mut NodeHandle> {
        self.nodes.get_mut(name)
    }

    /// Removes `name`'s handle from the plan so the caller can invoke
    /// a callback on it while still holding a mutable borrow of the
    /// rest of the plan (for routing that callback's `emit` calls).
    /// Pair with [`Self::put_node`] to put it back.
    pub fn take_node(&mut self, name: &str) -> Option<NodeHandle> {
        self.nodes.remove(name)
    }

    pub fn put_node(&mut self, name: &str, node: NodeHandle) {
        self.nodes.insert(name.to_string(), node);
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = &mut NodeHandle> {
        self.nodes.values_mut()
    }

    pub fn in_edges(&self, node: &str) -> &[(String, String)] {
        self.in_edges.get(node).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn edge(&self, edge_id: &str) -> Option<&Edge> {
        self.edges.get(edge_id)
    }

    pub fn edge_mut(&mut self, edge_id: &str) -> Option<&mut Edge> {
        self.edges.get_mut(edge_id)
    }

    /// A node's effective priority is the highest band among its input
    /// edges that currently hold a message; a node with nothing waiting
    /// (and not otherwise message-ready) is `Normal`.
    pub fn get_node_priority(&self, node: &str) -> PriorityBand {
        let message_ready = self.ready_states.get(node).map(|s| s.message_ready).unwrap_or(false);
        if !message_ready {
            return PriorityBand::Normal;
        }
        self.in_edges(node)
            .iter()
            .filter_map(|(_, edge_id)| self.edges.get(edge_id))
            .filter(|edge| !edge.is_empty())
            .map(|edge| edge.band())
            .min()
            .unwrap_or(PriorityBand::Normal)
    }

    pub fn ready_state(&self, node: &str) -> Option<&ReadyState> {
        self.ready_states.get(node)
    }

    /// Applies a new priority band to the edge `edge_id`, logging
    /// instead of failing if the edge does not exist, matching the
    /// runtime mutator semantics in effect once the scheduler is
    /// running (queueing for unknown edges is the scheduler's job, not
    /// this method's — see `Scheduler::set_edge_priority`).
    pub fn set_edge_priority(&mut self, edge_id: &str, band: PriorityBand) {
        match self.edges.get_mut(edge_id) {
            Some(edge) => {
                edge.set_band(band);
                tracing::info!(event = "scheduler.priority_changed", edge = %edge_id, band = ?band);
            }
            None => tracing::warn!(event = "plan.unknown_edge", edge = %edge_id, operation = "set_edge_priority"),
        }
    }

    pub fn set_edge_capacity(&mut self, edge_id: &str, capacity: usize) {
        match self.edges.get_mut(edge_id) {
            Some(edge) => {
                edge.set_capacity(capacity);
                tracing::info!(event = "scheduler.capacity_changed", edge = %edge_id, capacity);
            }
            None => tracing::warn!(event = "plan.unknown_edge", edge = %edge_id, operation = "set_capacity"),
        }
    }

    pub fn set_edge_policy(&mut self, edge_id: &str, policy: Policy) {
        match self.edges.get_mut(edge_id) {
            Some(edge) => edge.set_policy(policy),
            None => tracing::warn!(event = "plan.unknown_edge", edge = %edge_id, operation = "set_policy"),
        }
    }

    /// Recomputes `message_ready` for every node from current edge
    /// depths. Called once per scheduler loop iteration before
    /// selecting the next node to service.
    pub fn update_readiness(&mut self) {
        for (node, edge_ids) in &self.in_edges {
            let ready = edge_ids.iter().any(|(_, id)| self.edges.get(id).map(|e| !e.is_empty()).unwrap_or(false));
            if let Some(state) = self.ready_states.get_mut(node) {
                state.message_ready = ready;
            }
        }
    }

    /// Delivers `message` from `node`'s `port` into whatever edge is
    /// wired to that output, applying the edge's overflow policy.
    /// Control messages always use [`Policy::Block`] regardless of
    /// the edge's configured policy, so lifecycle/shutdown signaling
    /// is never silently dropped or coalesced.
    pub fn route_emit(&mut self, node: &str, port: &str, message: Message) -> Result<Message, WiringError> {
        let port_spec = self.nodes.get(node).and_then(|n| n.port_spec(port)).cloned();
        if self.nodes.get(node).map(|n| !n.validate_port(port)).unwrap_or(true) {
            return Err(WiringError::UnknownNode(node.to_string()));
        }

        let from = Port::new(node, port);
        if let Err(type_err) = check_payload(port_spec.as_ref(), message.payload(), &from) {
            tracing::warn!(event = "edge.type_rejected", port = %from, error = %type_err);
            return Err(WiringError::RejectedType(type_err));
        }

        let edge_id = match self.out_routes.get(&(node.to_string(), port.to_string())) {
            Some(id) => id.clone(),
            None => return Ok(message), // unwired output port: message has nowhere to go
        };

        let edge = self.edges.get_mut(&edge_id).expect("routed edge id always exists");
        let effective_policy_is_block = message.is_control();
        let result = if effective_policy_is_block && !matches!(edge_policy_kind(edge), PolicyKind::Block) {
            edge.try_put_blocking_override(message.clone())
        } else {
            edge.try_put(message.clone())
        };

        let state = self.ready_states.entry(node.to_string()).or_default();
        match result {
            PutResult::Blocked => {
                if !state.blocked_edges.contains(&edge_id) {
                    state.blocked_edges.push(edge_id.clone());
                }
                tracing::debug!(event = "scheduler.backpressure", edge = %edge_id);
            }
            PutResult::Dropped => {
                state.blocked_edges.retain(|e| e != &edge_id);
                tracing::warn!(event = "scheduler.message_dropped", edge = %edge_id);
            }
            _ => {
                state.blocked_edges.retain(|e| e != &edge_id);
            }
        }

        Ok(message)
    }
}

enum PolicyKind {
    Block,
    Other,
}

fn edge_policy_kind(edge: &Edge) -> PolicyKind {
    if edge.is_block_policy() {
        PolicyKind::Block
    } else {
        PolicyKind::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Node, NodeHandle};
    use flowgraph_core::{NoopMetrics, Payload, PortSpec};

    fn node(name: &str, ports: Vec<PortSpec>) -> NodeHandle {
        struct WithPorts {
            name: String,
            ports: Vec<PortSpec>,
        }
        impl Node for WithPorts {
            fn name(&self) -> &str {
                &self.name
            }
            fn ports(&self) -> &[PortSpec] {
                &self.ports
            }
        }
        NodeHandle::new(Box::new(WithPorts { name: name.into(), ports }))
    }

    fn build_chain() -> RuntimePlan {
        let mut g = Subgraph::new();
        g.add_node(node("a", vec![PortSpec::output("out")])).unwrap();
        g.add_node(node("b", vec![PortSpec::input("in")])).unwrap();
        g.add_edge(Port::new("a", "out"), Port::new("b", "in"), 2, Policy::Drop);
        RuntimePlan::build_from_graphs(vec![g], &NoopMetrics, &AHashMap::new()).unwrap()
    }

    #[test]
    fn build_from_graphs_rejects_a_node_name_shared_across_subgraphs() {
        let mut g1 = Subgraph::new();
        g1.add_node(node("a", vec![PortSpec::output("out")])).unwrap();
        let mut g2 = Subgraph::new();
        g2.add_node(node("a", vec![PortSpec::input("in")])).unwrap();

        let err = RuntimePlan::build_from_graphs(vec![g1, g2], &NoopMetrics, &AHashMap::new()).unwrap_err();
        match err {
            WiringError::Invalid(issues) => {
                assert_eq!(issues, vec![ValidationIssue::DuplicateNode("a".to_string())]);
            }
            other => panic!("expected WiringError::Invalid, got {other:?}"),
        }
    }

    #[test]
    fn route_emit_delivers_into_the_wired_edge() {
        let mut plan = build_chain();
        plan.route_emit("a", "out", Message::data(Payload::Int(1))).unwrap();
        assert_eq!(plan.edge("a:out->b:in").unwrap().depth(), 1);
        plan.update_readiness();
        assert!(plan.ready_state("b").unwrap().message_ready);
    }

    #[test]
    fn route_emit_rejects_a_payload_the_destination_port_does_not_accept() {
        let mut g = Subgraph::new();
        g.add_node(node("a", vec![PortSpec::output("out")])).unwrap();
        g.add_node(node("b", vec![PortSpec::input("in").with_validator(|p| matches!(p, Payload::Int(_)))]))
            .unwrap();
        g.add_edge(Port::new("a", "out"), Port::new("b", "in"), 2, Policy::Drop);
        let mut plan = RuntimePlan::build_from_graphs(vec![g], &NoopMetrics, &AHashMap::new()).unwrap();

        let result = plan.route_emit("a", "out", Message::data(Payload::Text("not an int".into())));
        assert!(matches!(result, Err(WiringError::RejectedType(_))));
        assert_eq!(plan.edge("a:out->b:in").unwrap().depth(), 0);
    }

    #[test]
    fn control_messages_always_block_even_on_a_drop_edge() {
        let mut plan = build_chain();
        let edge_id = plan.in_edges("b")[0].1.clone();
        plan.edge_mut(&edge_id).unwrap().try_put(Message::data(Payload::Unit));
        plan.edge_mut(&edge_id).unwrap().try_put(Message::data(Payload::Unit));
        // edge is Drop-policy and full; a data message would be dropped silently
        plan.route_emit("a", "out", Message::control(Payload::Unit)).unwrap();
        assert!(plan.ready_state("a").unwrap().blocked_edges.contains(&edge_id));
    }

    #[test]
    fn node_priority_tracks_the_highest_band_among_its_ready_input_edges() {
        let mut plan = build_chain();
        assert_eq!(plan.get_node_priority("b"), PriorityBand::Normal);

        plan.route_emit("a", "out", Message::data(Payload::Int(1))).unwrap();
        plan.update_readiness();
        assert_eq!(plan.get_node_priority("b"), PriorityBand::Normal);

        plan.set_edge_priority("a:out->b:in", PriorityBand::High);
        plan.update_readiness();
        assert_eq!(plan.get_node_priority("b"), PriorityBand::High);

        plan.set_edge_priority("a:out->b:in", PriorityBand::Control);
        plan.update_readiness();
        assert_eq!(plan.get_node_priority("b"), PriorityBand::Control);
    }

    #[test]
    fn pending_priorities_apply_to_matching_edges_and_ignore_the_rest() {
        let mut g = Subgraph::new();
        g.add_node(node("a", vec![PortSpec::output("out")])).unwrap();
        g.add_node(node("b", vec![PortSpec::input("in")])).unwrap();
        g.add_edge(Port::new("a", "out"), Port::new("b", "in"), 2, Policy::Drop);

        let mut pending = AHashMap::new();
        pending.insert("a:out->b:in".to_string(), PriorityBand::High);
        pending.insert("nonexistent:edge".to_string(), PriorityBand::Control);

        let plan = RuntimePlan::build_from_graphs(vec![g], &NoopMetrics, &pending).unwrap();
        assert_eq!(plan.edge("a:out->b:in").unwrap().band(), PriorityBand::High);
    }
}
