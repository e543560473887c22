pub use flowgraph_core::*;
pub use flowgraph_runtime::*;
