//! # Serverless Workflow Runtime
//!
//! A message-broker-driven interpreter for the Serverless Workflow DSL:
//! stateless between steps, with every bit of progress carried in the
//! envelope that crosses the broker.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Consumer                              │
//! │  (one Message in, one WorkflowInstance step, route the       │
//! │   outcome: ack, outbox row, or fan-out messages)             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     WorkflowInstance                         │
//! │  (compiled Node graph + per-position NodeState, drives the   │
//! │   Do/For/Switch/Try/... interpreter to the next suspension)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │   DefinitionStore / OutboxScheduler / JoinStore / ListenStore │
//! │  (definitions(name,version); outbox_wait / outbox_retry,     │
//! │   claimed via FOR UPDATE SKIP LOCKED; fork_joins fan-in;     │
//! │   listen_waits parked until a matching event arrives)        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use workflow_runtime::prelude::*;
//!
//! let compiled = CompiledWorkflow::compile(root_task)?;
//! let mut instance = WorkflowInstance::new("inst-1", "greet", "1.0.0", compiled, input);
//! match instance.run().await {
//!     RunOutcome::Completed { output, .. } => { /* ... */ }
//!     RunOutcome::Waiting { request, .. } => { /* persist and suspend */ }
//!     RunOutcome::Faulted { error, .. } => { /* ... */ }
//! }
//! ```

pub mod auth;
pub mod expr;
pub mod interpreter;
pub mod message;
pub mod persistence;
pub mod position;
pub mod reliability;
pub mod worker;
pub mod workflow;

/// Prelude for common imports.
pub mod prelude {
    pub use crate::message::{Correlation, Message};
    pub use crate::persistence::{
        DefinitionRow, DefinitionStore, InMemoryDefinitionStore, InMemoryJoinStore,
        InMemoryListenStore, InMemoryOutboxStore, JoinStore, ListenStore, OutboxKind, OutboxRow,
        OutboxStore, ParkedListen, StoreError,
    };
    pub use crate::position::{Position, Segment, Token};
    pub use crate::reliability::{Backoff, RetryPolicy};
    pub use crate::worker::{Consumer, ConsumerOutcome, OutboxScheduler, Publisher};
    pub use crate::workflow::{
        CompiledWorkflow, DispatchTarget, ErrorKind, Node, RunOutcome, Status, WaitRequest,
        WorkflowError, WorkflowInstance,
    };
}

// Re-export key types at crate root.
pub use message::{Correlation, Message};
pub use persistence::{DefinitionStore, JoinStore, ListenStore, OutboxStore, StoreError};
pub use position::Position;
pub use reliability::RetryPolicy;
pub use worker::{Consumer, OutboxScheduler};
pub use workflow::{CompiledWorkflow, RunOutcome, Status, WorkflowError, WorkflowInstance};
