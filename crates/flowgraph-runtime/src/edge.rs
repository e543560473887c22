use std::collections::VecDeque;
use std::sync::Arc;

use flowgraph_core::{Counter, Gauge, Message, MetricsSink, Policy, PriorityBand, PutResult};

/// A bounded, single-producer single-consumer queue connecting one
/// output port to one input port.
///
/// Capacity and policy can both be changed at runtime (see
/// `set_capacity`/`set_policy`); neither requires the queue to be
/// empty first. Shrinking the capacity below the current depth is
/// allowed — it simply means the edge reports `is_full` until enough
/// messages have been drained.
pub struct Edge {
    id: String,
    capacity: usize,
    policy: Policy,
    band: PriorityBand,
    queue: VecDeque<Message>,
    enqueued_total: Option<Arc<dyn Counter>>,
    dequeued_total: Option<Arc<dyn Counter>>,
    dropped_total: Option<Arc<dyn Counter>>,
    depth_gauge: Option<Arc<dyn Gauge>>,
}

impl Edge {
    pub fn new(id: impl Into<String>, capacity: usize, policy: Policy) -> Self {
        Self {
            id: id.into(),
            capacity: capacity.max(1),
            policy,
            band: PriorityBand::Normal,
            queue: VecDeque::new(),
            enqueued_total: None,
            dequeued_total: None,
            dropped_total: None,
            depth_gauge: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
    }

    pub fn set_policy(&mut self, policy: Policy) {
        self.policy = policy;
    }

    pub fn band(&self) -> PriorityBand {
        self.band
    }

    pub fn set_band(&mut self, band: PriorityBand) {
        self.band = band;
    }

    pub fn depth(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.queue.len() >= self.capacity
    }

    /// Lazily binds this edge's metric handles against `sink`, keyed
    /// by its own id. Safe to call more than once; only the first
    /// call takes effect.
    pub fn bind_metrics(&mut self, sink: &dyn MetricsSink) {
        if self.enqueued_total.is_some() {
            return;
        }
        let labels = vec![("edge", self.id.clone())];
        self.enqueued_total = Some(sink.counter("edge_enqueued_total", labels.clone()));
        self.dequeued_total = Some(sink.counter("edge_dequeued_total", labels.clone()));
        self.dropped_total = Some(sink.counter("edge_drops_total", labels.clone()));
        self.depth_gauge = Some(sink.gauge("queue_depth", labels));
    }

    fn report_depth(&self) {
        if let Some(gauge) = &self.depth_gauge {
            gauge.set(self.queue.len() as i64);
        }
    }

    /// Attempts to enqueue `message`, applying the overflow policy
    /// when the queue is already at capacity. Always returns a
    /// result; never blocks the calling thread itself (`Blocked`
    /// communicates backpressure to the caller, who decides what to
    /// do about it).
    pub fn try_put(&mut self, message: Message) -> PutResult {
        if self.queue.len() < self.capacity {
            self.queue.push_back(message);
            if let Some(c) = &self.enqueued_total {
                c.increment(1);
            }
            self.report_depth();
            return PutResult::Ok;
        }

        let tail = match self.queue.back() {
            Some(tail) => tail.clone(),
            None => {
                // Capacity is zero after clamping to 1 this cannot
                // happen, but stay correct if it ever does.
                self.queue.push_back(message);
                self.report_depth();
                return PutResult::Ok;
            }
        };

        let (replacement, result) = self.policy.on_full(&tail, message);
        match &result {
            PutResult::Blocked => {}
            PutResult::Dropped => {
                if let Some(c) = &self.dropped_total {
                    c.increment(1);
                }
            }
            PutResult::Replaced | PutResult::Coalesced => {
                if let Some(replacement) = replacement {
                    *self.queue.back_mut().expect("queue non-empty when full") = replacement;
                }
            }
            PutResult::Ok => unreachable!("on_full never returns Ok"),
        }
        self.report_depth();
        result
    }

    pub fn is_block_policy(&self) -> bool {
        matches!(self.policy, Policy::Block)
    }

    /// Enqueues `message` as if this edge's policy were [`Policy::Block`],
    /// regardless of its actual configured policy. Used for `Control`
    /// messages, which must never be dropped, replaced, or coalesced.
    pub fn try_put_blocking_override(&mut self, message: Message) -> PutResult {
        if self.queue.len() < self.capacity {
            self.queue.push_back(message);
            if let Some(c) = &self.enqueued_total {
                c.increment(1);
            }
            self.report_depth();
            PutResult::Ok
        } else {
            PutResult::Blocked
        }
    }

    /// Removes and returns the oldest message, if any.
    pub fn try_get(&mut self) -> Option<Message> {
        let message = self.queue.pop_front();
        if message.is_some() {
            if let Some(c) = &self.dequeued_total {
                c.increment(1);
            }
            self.report_depth();
        }
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgraph_core::Payload;

    fn msg(v: i64) -> Message {
        Message::data(Payload::Int(v))
    }

    #[test]
    fn fifo_ordering_preserved() {
        let mut edge = Edge::new("a:o->b:i", 4, Policy::Drop);
        for i in 0..3 {
            assert_eq!(edge.try_put(msg(i)), PutResult::Ok);
        }
        assert_eq!(edge.try_get().unwrap().payload().as_int(), Some(0));
        assert_eq!(edge.try_get().unwrap().payload().as_int(), Some(1));
        assert_eq!(edge.try_get().unwrap().payload().as_int(), Some(2));
        assert!(edge.try_get().is_none());
    }

    #[test]
    fn block_policy_reports_blocked_without_mutating_queue() {
        let mut edge = Edge::new("a:o->b:i", 1, Policy::Block);
        assert_eq!(edge.try_put(msg(1)), PutResult::Ok);
        assert_eq!(edge.try_put(msg(2)), PutResult::Blocked);
        assert_eq!(edge.depth(), 1);
        assert_eq!(edge.try_get().unwrap().payload().as_int(), Some(1));
    }

    #[test]
    fn drop_policy_discards_incoming() {
        let mut edge = Edge::new("a:o->b:i", 1, Policy::Drop);
        edge.try_put(msg(1));
        assert_eq!(edge.try_put(msg(2)), PutResult::Dropped);
        assert_eq!(edge.try_get().unwrap().payload().as_int(), Some(1));
    }

    #[test]
    fn latest_policy_replaces_tail() {
        let mut edge = Edge::new("a:o->b:i", 2, Policy::Latest);
        edge.try_put(msg(1));
        edge.try_put(msg(2));
        assert_eq!(edge.try_put(msg(3)), PutResult::Replaced);
        assert_eq!(edge.try_get().unwrap().payload().as_int(), Some(1));
        assert_eq!(edge.try_get().unwrap().payload().as_int(), Some(3));
    }

    #[test]
    fn coalesce_merges_into_tail() {
        let merge = Arc::new(|tail: &Message, incoming: &Message| {
            let sum = tail.payload().as_int().unwrap_or(0) + incoming.payload().as_int().unwrap_or(0);
            Message::data(Payload::Int(sum))
        });
        let mut edge = Edge::new("a:o->b:i", 1, Policy::Coalesce(merge));
        edge.try_put(msg(1));
        assert_eq!(edge.try_put(msg(2)), PutResult::Coalesced);
        assert_eq!(edge.try_get().unwrap().payload().as_int(), Some(3));
    }

    #[test]
    fn coalesce_panic_falls_back_to_appending_incoming_unchanged() {
        let merge: flowgraph_core::CoalesceFn = Arc::new(|_tail, _incoming| panic!("boom"));
        let mut edge = Edge::new("a:o->b:i", 1, Policy::Coalesce(merge));
        edge.try_put(msg(1));
        assert_eq!(edge.try_put(msg(2)), PutResult::Coalesced);
        assert_eq!(edge.try_get().unwrap().payload().as_int(), Some(2));
    }

    #[test]
    fn capacity_can_shrink_below_current_depth() {
        let mut edge = Edge::new("a:o->b:i", 4, Policy::Block);
        edge.try_put(msg(1));
        edge.try_put(msg(2));
        edge.set_capacity(1);
        assert!(edge.is_full());
        assert_eq!(edge.try_put(msg(3)), PutResult::Blocked);
    }

    #[test]
    fn empty_edge_get_returns_absent_without_error() {
        let mut edge = Edge::new("a:o->b:i", 4, Policy::Drop);
        assert!(edge.try_get().is_none());
    }

    proptest::proptest! {
        #[test]
        fn depth_never_exceeds_capacity_under_block(capacity in 1usize..8, puts in 0usize..20) {
            let mut edge = Edge::new("a:o->b:i", capacity, Policy::Block);
            for i in 0..puts {
                edge.try_put(msg(i as i64));
                proptest::prop_assert!(edge.depth() <= edge.capacity());
            }
        }

        #[test]
        fn drop_policy_leaves_depth_unchanged_and_drops_exactly_the_overflow(capacity in 1usize..6, puts in 0usize..20) {
            let mut edge = Edge::new("a:o->b:i", capacity, Policy::Drop);
            let mut accepted = 0usize;
            for i in 0..puts {
                match edge.try_put(msg(i as i64)) {
                    PutResult::Ok => accepted += 1,
                    PutResult::Dropped => {}
                    other => proptest::prop_assert!(false, "unexpected result {:?}", other),
                }
            }
            proptest::prop_assert_eq!(edge.depth(), accepted.min(capacity));
            proptest::prop_assert!(edge.depth() <= capacity);
        }

        #[test]
        fn fifo_order_holds_for_any_sequence_of_accepted_puts(capacity in 1usize..8, puts in 1usize..16) {
            let mut edge = Edge::new("a:o->b:i", capacity, Policy::Block);
            let mut sent = Vec::new();
            for i in 0..puts {
                if edge.try_put(msg(i as i64)) == PutResult::Ok {
                    sent.push(i as i64);
                }
            }
            let mut drained = Vec::new();
            while let Some(m) = edge.try_get() {
                drained.push(m.payload().as_int().unwrap());
            }
            proptest::prop_assert_eq!(drained, sent);
        }
    }
}
