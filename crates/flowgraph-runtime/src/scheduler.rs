use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use flowgraph_core::{
    ConfigError, Counter, FairnessRatio, Gauge, Histogram, Message, MetricsSink, NoopMetrics,
    PriorityBand, WiringError,
};
use smallvec::SmallVec;
use thiserror::Error;

use crate::node::EmitSink;
use crate::plan::RuntimePlan;
use crate::subgraph::Subgraph;

/// Failure modes of [`Scheduler::run`].
#[derive(Debug, Error)]
pub enum RunError {
    #[error("scheduler config is invalid: {0}")]
    Config(#[from] ConfigError),
    #[error("run() called before register()")]
    NotRegistered,
}

/// Tunable knobs for a [`Scheduler`]'s main loop. Defaults match the
/// values a graph behaves sanely with out of the box; none of them
/// need to be touched for a small graph to run correctly.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often a node with no pending messages still gets ticked.
    pub tick_interval_ms: u64,
    /// Consecutive turns granted to each priority band before moving
    /// on to the next, when more than one band has runnable work.
    pub fairness_ratio: FairnessRatio,
    /// Maximum number of messages drained from a single node's input
    /// edges during one servicing.
    pub max_batch_per_node: usize,
    /// How long the loop sleeps when no node is runnable.
    pub idle_sleep_ms: u64,
    /// How long `run()` waits for `on_stop` callbacks to finish once
    /// shutdown has been observed, before giving up and returning
    /// anyway.
    pub shutdown_timeout_s: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 50,
            fairness_ratio: FairnessRatio::default(),
            max_batch_per_node: 8,
            idle_sleep_ms: 1,
            shutdown_timeout_s: 2.0,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch_per_node == 0 {
            return Err(ConfigError::NotPositive { field: "max_batch_per_node", value: 0 });
        }
        if self.shutdown_timeout_s <= 0.0 {
            return Err(ConfigError::NotPositive { field: "shutdown_timeout_s", value: self.shutdown_timeout_s as i64 });
        }
        let r = &self.fairness_ratio;
        if r.control == 0 || r.high == 0 || r.normal == 0 {
            return Err(ConfigError::BadFairnessRatio);
        }
        Ok(())
    }
}

/// A snapshot of scheduler-wide counters, returned by [`Scheduler::stats`].
#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    pub nodes_registered: usize,
    pub edges_registered: usize,
    pub loop_iterations: u64,
}

/// The weighted band sequence rarely exceeds a handful of entries (a
/// fairness ratio of 4:2:1 is 7), so it lives inline rather than on
/// the heap.
struct FairnessCursor {
    sequence: SmallVec<[PriorityBand; 8]>,
    position: usize,
}

impl FairnessCursor {
    fn new(ratio: &FairnessRatio) -> Self {
        let mut sequence = SmallVec::new();
        for _ in 0..ratio.control {
            sequence.push(PriorityBand::Control);
        }
        for _ in 0..ratio.high {
            sequence.push(PriorityBand::High);
        }
        for _ in 0..ratio.normal {
            sequence.push(PriorityBand::Normal);
        }
        Self { sequence, position: 0 }
    }

    fn next_band(&mut self) -> PriorityBand {
        let band = self.sequence[self.position % self.sequence.len()];
        self.position = (self.position + 1) % self.sequence.len();
        band
    }

    fn len(&self) -> usize {
        self.sequence.len()
    }
}

/// The cooperative, single-threaded dataflow scheduler.
///
/// `run()` drives the main loop from the calling thread until
/// `shutdown()` is observed (or panics/returns on its own — it never
/// spawns threads itself). `shutdown()` may be called from any
/// thread; it only flips an atomic flag, so it is safe to call from
/// a signal handler or another node's callback.
pub struct Scheduler {
    config: SchedulerConfig,
    plan: Option<RuntimePlan>,
    metrics: Arc<dyn MetricsSink>,
    shutdown_flag: Arc<AtomicBool>,
    last_tick: AHashMap<String, Instant>,
    round_robin: AHashMap<PriorityBand, usize>,
    pending_priorities: AHashMap<String, PriorityBand>,
    stats: SchedulerStats,
    priority_applied_total: Arc<dyn Counter>,
    runnable_nodes: Arc<dyn Gauge>,
    loop_latency: Arc<dyn Histogram>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_metrics(config, Arc::new(NoopMetrics))
    }

    pub fn with_metrics(config: SchedulerConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        let priority_applied_total = metrics.counter("scheduler_priority_applied_total", Vec::new());
        let runnable_nodes = metrics.gauge("scheduler_runnable_nodes", Vec::new());
        let loop_latency = metrics.histogram("scheduler_loop_latency_seconds", Vec::new());
        Self {
            config,
            plan: None,
            metrics,
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            last_tick: AHashMap::new(),
            round_robin: AHashMap::new(),
            pending_priorities: AHashMap::new(),
            stats: SchedulerStats::default(),
            priority_applied_total,
            runnable_nodes,
            loop_latency,
        }
    }

    /// Returns a handle that can be used to request shutdown from
    /// another thread while `run()` is executing on this one.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle { flag: Arc::clone(&self.shutdown_flag) }
    }

    /// Validates and flattens `graphs` into this scheduler's runtime
    /// plan. Must be called before `run()`. Any priority set via
    /// `set_edge_priority` before this call and still pending is
    /// applied to its matching edge now.
    pub fn register(&mut self, graphs: Vec<Subgraph>) -> Result<(), WiringError> {
        let plan = RuntimePlan::build_from_graphs(graphs, self.metrics.as_ref(), &self.pending_priorities)?;
        self.pending_priorities.clear();
        self.stats.nodes_registered = plan.node_order().len();
        self.stats.edges_registered = plan.edge_count();
        self.plan = Some(plan);
        Ok(())
    }

    /// Callable before or during `run()`. If the plan isn't built yet,
    /// the change is queued and applied to the matching edge at the
    /// next `register()`. If the plan is built but `edge_id` is
    /// unknown, the change is logged and dropped.
    pub fn set_edge_priority(&mut self, edge_id: &str, band: PriorityBand) {
        match &mut self.plan {
            Some(plan) => {
                plan.set_edge_priority(edge_id, band);
                self.priority_applied_total.increment(1);
            }
            None => {
                self.pending_priorities.insert(edge_id.to_string(), band);
            }
        }
    }

    pub fn set_capacity(&mut self, edge_id: &str, capacity: usize) {
        if let Some(plan) = &mut self.plan {
            plan.set_edge_capacity(edge_id, capacity);
        }
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    /// Idempotent: flips the shutdown flag. Safe to call more than
    /// once, and safe to call before `run()` has even started (the
    /// first loop iteration will then exit immediately).
    pub fn shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::SeqCst);
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown_flag.load(Ordering::SeqCst)
    }

    /// Runs the main loop until shutdown is requested, then tears
    /// nodes down in reverse registration order. Returns once torn
    /// down; never spawns a thread of its own.
    pub fn run(&mut self) -> Result<(), RunError> {
        self.config.validate()?;
        if self.plan.is_none() {
            return Err(RunError::NotRegistered);
        }

        tracing::info!(event = "scheduler.start");
        self.start_all_nodes();
        tracing::info!(event = "scheduler.ready");

        let mut cursor = FairnessCursor::new(&self.config.fairness_ratio);
        let shutdown_observed_at = self.run_main_loop(&mut cursor);

        self.stop_all_nodes();
        tracing::info!(event = "scheduler.shutdown_complete");

        if let Some(observed) = shutdown_observed_at {
            let elapsed = observed.elapsed().as_secs_f64();
            if elapsed > self.config.shutdown_timeout_s {
                tracing::warn!(event = "scheduler.shutdown_timeout", elapsed_s = elapsed);
            }
        }
        Ok(())
    }

    /// Takes `name`'s node handle out of the plan, runs `f` on it with
    /// a sink that can still route emits through the rest of the plan,
    /// then puts it back. This is how every callback invocation avoids
    /// holding two conflicting mutable borrows of the plan at once.
    fn with_node<F>(&mut self, name: &str, f: F)
    where
        F: FnOnce(&mut crate::node::NodeHandle, &mut PlanEmitSink<'_>),
    {
        let plan = self.plan.as_mut().expect("plan present");
        let mut node = match plan.take_node(name) {
            Some(node) => node,
            None => return,
        };
        let mut sink = PlanEmitSink { plan };
        f(&mut node, &mut sink);
        self.plan.as_mut().expect("plan present").put_node(name, node);
    }

    fn start_all_nodes(&mut self) {
        let order: Vec<String> = self.plan.as_ref().expect("plan present").node_order().to_vec();
        let now = Instant::now();
        for name in &order {
            self.last_tick.insert(name.clone(), now);
        }
        for name in &order {
            self.with_node(name, |node, sink| {
                if let Err(err) = node.start(sink) {
                    tracing::error!(event = "node.start_error", node = %name, error = %err);
                }
            });
        }
    }

    fn stop_all_nodes(&mut self) {
        let mut order: Vec<String> = self.plan.as_ref().expect("plan present").node_order().to_vec();
        order.reverse();
        for name in &order {
            self.with_node(name, |node, sink| {
                if let Err(err) = node.stop(sink) {
                    tracing::error!(event = "node.stop_error", node = %name, error = %err);
                }
            });
        }
    }

    /// Reports the number of nodes that would be picked up this
    /// iteration — either message-ready or due for a tick.
    fn report_runnable_nodes(&self, now: Instant) {
        let plan = self.plan.as_ref().expect("plan present");
        let count = plan
            .node_order()
            .iter()
            .filter(|name| {
                let message_ready = plan.ready_state(name).map(|s| s.message_ready).unwrap_or(false);
                message_ready || self.tick_due(name, now)
            })
            .count();
        self.runnable_nodes.set(count as i64);
    }

    fn tick_due(&self, node: &str, now: Instant) -> bool {
        match self.last_tick.get(node) {
            Some(last) => now.duration_since(*last) >= Duration::from_millis(self.config.tick_interval_ms),
            None => true,
        }
    }

    /// Picks the next node to service. Control preempts unconditionally:
    /// a runnable Control-band node is always serviced next, regardless
    /// of where the fairness cursor currently points, since `Control`
    /// MUST be serviced whenever it is non-empty. Only once no Control
    /// candidate is runnable does selection fall back to the weighted
    /// cursor across High/Normal, with round-robin ordering within a
    /// band so no single node can starve its band-mates. Returns `None`
    /// only after a full cycle through every band finds nothing
    /// runnable.
    fn pick_next_runnable(&mut self, cursor: &mut FairnessCursor, now: Instant) -> Option<(String, bool)> {
        if let Some(found) = self.try_service_band(PriorityBand::Control, now) {
            return Some(found);
        }

        let attempts = cursor.len().max(3);
        for _ in 0..attempts {
            let band = cursor.next_band();
            if band == PriorityBand::Control {
                continue;
            }
            if let Some(found) = self.try_service_band(band, now) {
                return Some(found);
            }
        }
        None
    }

    /// Scans `band`'s candidates in round-robin order starting from
    /// where that band last left off, returning the first runnable one.
    fn try_service_band(&mut self, band: PriorityBand, now: Instant) -> Option<(String, bool)> {
        let plan = self.plan.as_ref().expect("plan present");
        let mut candidates: Vec<&String> =
            plan.node_order().iter().filter(|name| plan.get_node_priority(name) == band).collect();
        if candidates.is_empty() {
            return None;
        }
        candidates.sort();
        let start = *self.round_robin.get(&band).unwrap_or(&0) % candidates.len();
        for offset in 0..candidates.len() {
            let idx = (start + offset) % candidates.len();
            let name = candidates[idx];
            let message_ready = plan.ready_state(name).map(|s| s.message_ready).unwrap_or(false);
            let due = self.tick_due(name, now);
            if message_ready || due {
                self.round_robin.insert(band, idx + 1);
                return Some((name.clone(), message_ready));
            }
        }
        None
    }

    fn service_node(&mut self, name: &str, message_ready: bool, now: Instant) {
        if message_ready {
            let in_edges: Vec<(String, String)> = self.plan.as_ref().expect("plan present").in_edges(name).to_vec();
            let mut budget = self.config.max_batch_per_node;
            'ports: for (port, edge_id) in &in_edges {
                while budget > 0 {
                    let message = match self.plan.as_mut().expect("plan present").edge_mut(edge_id).and_then(|e| e.try_get()) {
                        Some(m) => m,
                        None => continue 'ports,
                    };
                    budget -= 1;
                    self.with_node(name, |node, sink| {
                        if let Err(err) = node.dispatch_message(port, message, sink) {
                            tracing::error!(event = "node.message_error", node = %name, port = %port, error = %err);
                        }
                    });
                    if budget == 0 {
                        break 'ports;
                    }
                }
            }
        } else {
            self.last_tick.insert(name.to_string(), now);
            self.with_node(name, |node, sink| {
                if let Err(err) = node.dispatch_tick(sink) {
                    tracing::error!(event = "node.tick_error", node = %name, error = %err);
                }
            });
        }
    }

    /// Runs until shutdown is observed. Shutdown is checked once at
    /// the top of every iteration (so it is seen within one loop
    /// iteration plus, at worst, one `idle_sleep_ms` sleep, per the
    /// suspension-point model) and the loop exits immediately rather
    /// than finishing a partial batch.
    fn run_main_loop(&mut self, cursor: &mut FairnessCursor) -> Option<Instant> {
        loop {
            let loop_start = Instant::now();
            if self.is_shutting_down() {
                tracing::info!(event = "scheduler.shutdown_requested");
                return Some(loop_start);
            }

            self.plan.as_mut().expect("plan present").update_readiness();
            self.report_runnable_nodes(loop_start);

            match self.pick_next_runnable(cursor, loop_start) {
                Some((name, message_ready)) => {
                    self.service_node(&name, message_ready, loop_start);
                }
                None => {
                    std::thread::sleep(Duration::from_millis(self.config.idle_sleep_ms));
                }
            }

            self.stats.loop_iterations += 1;
            self.loop_latency.observe(loop_start.elapsed().as_secs_f64());
        }
    }
}

/// A cheap, `Send + Sync` handle that can request shutdown of a
/// running [`Scheduler`] from another thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

struct PlanEmitSink<'a> {
    plan: &'a mut RuntimePlan,
}

impl<'a> EmitSink for PlanEmitSink<'a> {
    fn emit(&mut self, node: &str, port: &str, message: Message) -> Result<Message, WiringError> {
        self.plan.route_emit(node, port, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_is_idempotent() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let handle = scheduler.shutdown_handle();
        handle.shutdown();
        handle.shutdown();
        handle.shutdown();
        assert!(scheduler.is_shutting_down());
    }

    #[test]
    fn run_before_register_fails_fast() {
        let mut scheduler = Scheduler::new(SchedulerConfig::default());
        assert!(matches!(scheduler.run(), Err(RunError::NotRegistered)));
    }

    #[test]
    fn invalid_fairness_ratio_is_rejected_by_validate() {
        let config = SchedulerConfig { fairness_ratio: FairnessRatio { control: 0, high: 1, normal: 1 }, ..SchedulerConfig::default() };
        assert!(matches!(config.validate(), Err(ConfigError::BadFairnessRatio)));
    }

    #[test]
    fn control_band_node_preempts_even_when_the_fairness_cursor_points_elsewhere() {
        use flowgraph_core::{Payload, Policy, Port, PortSpec};

        struct Stub {
            name: &'static str,
            ports: Vec<PortSpec>,
        }
        impl crate::node::Node for Stub {
            fn name(&self) -> &str {
                self.name
            }
            fn ports(&self) -> &[PortSpec] {
                &self.ports
            }
        }

        let mut graph = Subgraph::new();
        for (name, ports) in [
            ("p1", vec![PortSpec::output("out")]),
            ("ctrl", vec![PortSpec::input("in")]),
            ("p2", vec![PortSpec::output("out")]),
            ("normal", vec![PortSpec::input("in")]),
        ] {
            graph.add_node(crate::node::NodeHandle::new(Box::new(Stub { name, ports }))).unwrap();
        }
        graph.add_edge(Port::new("p1", "out"), Port::new("ctrl", "in"), 4, Policy::Drop);
        graph.add_edge(Port::new("p2", "out"), Port::new("normal", "in"), 4, Policy::Drop);

        let mut scheduler = Scheduler::new(SchedulerConfig::default());
        scheduler.set_edge_priority("p1:out->ctrl:in", PriorityBand::Control);
        scheduler.register(vec![graph]).unwrap();

        {
            let plan = scheduler.plan.as_mut().unwrap();
            plan.route_emit("p1", "out", Message::data(Payload::Int(1))).unwrap();
            plan.route_emit("p2", "out", Message::data(Payload::Int(2))).unwrap();
            plan.update_readiness();
        }

        // Consume the fairness ratio's Control slots so the cursor's next
        // pick would otherwise land on High.
        let mut cursor = FairnessCursor::new(&SchedulerConfig::default().fairness_ratio);
        for _ in 0..SchedulerConfig::default().fairness_ratio.control {
            cursor.next_band();
        }

        let (name, message_ready) =
            scheduler.pick_next_runnable(&mut cursor, Instant::now()).expect("a node should be runnable");
        assert_eq!(name, "ctrl");
        assert!(message_ready);
    }

    #[test]
    fn edge_priority_set_before_register_is_applied_once_the_plan_is_built() {
        use flowgraph_core::PortSpec;

        struct Stub {
            name: &'static str,
            ports: Vec<PortSpec>,
        }
        impl crate::node::Node for Stub {
            fn name(&self) -> &str {
                self.name
            }
            fn ports(&self) -> &[PortSpec] {
                &self.ports
            }
        }

        let mut graph = Subgraph::new();
        graph
            .add_node(crate::node::NodeHandle::new(Box::new(Stub { name: "a", ports: vec![PortSpec::output("out")] })))
            .unwrap();
        graph
            .add_node(crate::node::NodeHandle::new(Box::new(Stub { name: "b", ports: vec![PortSpec::input("in")] })))
            .unwrap();
        graph.add_edge(
            flowgraph_core::Port::new("a", "out"),
            flowgraph_core::Port::new("b", "in"),
            4,
            flowgraph_core::Policy::Drop,
        );

        let mut scheduler = Scheduler::new(SchedulerConfig::default());
        scheduler.set_edge_priority("a:out->b:in", PriorityBand::High);
        scheduler.register(vec![graph]).unwrap();

        let plan = scheduler.plan.as_ref().unwrap();
        assert_eq!(plan.edge("a:out->b:in").unwrap().band(), PriorityBand::High);
    }
}
