//! One module per task kind's own semantics (spec §4.3). Kinds that are
//! pure functions of a scope (`set`, `raise`, `switch`) or self-contained
//! side effects (`call_http`, `run_script`/`run_shell`, `emit`) live here as
//! free functions. Kinds whose suspension/resumption bookkeeping is
//! entangled with the position graph (`for`, `try`, `wait`, `run_workflow`,
//! `listen`, `fork`) are driven directly by
//! [`crate::workflow::instance::WorkflowInstance`], which calls into the
//! matching module here only for the stateless parts of their behaviour
//! (duration parsing, branch-message shaping, correlation-filter matching).

pub mod call_http;
pub mod emit_task;
pub mod fork_task;
pub mod listen_task;
pub mod raise_task;
pub mod run_task;
pub mod run_workflow;
pub mod set_task;
pub mod switch_task;
pub mod wait_task;
