//! Reliability patterns shared by the interpreter and the outbox scheduler.
//!
//! - [`RetryPolicy`] — constant, linear and exponential backoff with jitter,
//!   used both by `TryTask`'s `retry` clause and by the scheduler's
//!   `outbox_retry` delay calculation.

mod retry;

pub use retry::{Backoff, RetryPolicy};
