mod edge;
mod node;
mod plan;
mod scheduler;
mod subgraph;

pub use edge::Edge;
pub use node::{EmitSink, Node, NodeContext, NodeHandle, NodeState};
pub use plan::{ReadyState, RuntimePlan};
pub use scheduler::{RunError, Scheduler, SchedulerConfig, SchedulerStats, ShutdownHandle};
pub use subgraph::{EdgeSpec, Subgraph};
