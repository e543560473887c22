mod error;
mod message;
mod metrics;
mod policy;
mod port;
mod priority;

pub use error::{ConfigError, LifecycleError, TypeError, UserError, ValidationIssue, WiringError};
pub use message::{HeaderOverrides, Headers, Message, MessageKind, Payload};
pub use metrics::{
    Counter, Gauge, Histogram, Labels, MetricsSink, NoopMetrics, RecordingMetrics,
    DEFAULT_LATENCY_BUCKETS,
};
pub use policy::{CoalesceFn, Policy, PutResult};
pub use port::{Direction, Port, PortSpec};
pub use priority::{FairnessRatio, PriorityBand};
