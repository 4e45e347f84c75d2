//! The workflow model: parsed tasks, the compiled node graph, per-node
//! state, the DSL error payload, and the driver that threads them together.

pub mod error;
pub mod instance;
pub mod node;
pub mod state;
pub mod task;

pub use error::{ErrorKind, WorkflowError};
pub use instance::{DispatchTarget, RunOutcome, Status, WaitRequest, WorkflowInstance};
pub use node::{CompiledWorkflow, Node};
pub use state::NodeState;
pub use task::Task;
