//! Persistence: the definition cache, the outbox, the fork join table, and
//! the listen parking lot, plus in-memory and Postgres implementations of
//! all four.

pub mod memory;
pub mod postgres;
pub mod store;

pub use memory::{
    InMemoryDefinitionStore, InMemoryJoinStore, InMemoryListenStore, InMemoryOutboxStore,
};
pub use postgres::{
    PostgresDefinitionStore, PostgresJoinStore, PostgresListenStore, PostgresOutboxStore,
};
pub use store::{
    DefinitionRow, DefinitionStore, JoinStore, ListenStore, OutboxKind, OutboxRow, OutboxStatus,
    OutboxStore, ParkedListen, StoreError,
};
