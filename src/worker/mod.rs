//! The two runtime loops that sit around the interpreter: the broker
//! Consumer Loop (spec §4.5) and the Outbox Scheduler (spec §4.6).

pub mod consumer;
pub mod scheduler;

pub use consumer::{Consumer, ConsumerError, ConsumerOutcome};
pub use scheduler::{OutboxScheduler, PublishError, Publisher, SchedulerConfig};
