//! Task Records
//!
//! The persisted and in-memory representation of one scan: identity,
//! configuration, counters and status, plus the stores that upsert and
//! reload them.

pub mod record;
pub mod store;

pub use record::{CounterSnapshot, TaskCounters, TaskRecord, TaskStatus};
pub use store::{mark_interrupted, FileTaskStore, MemoryTaskStore, TaskQuery, TaskStore, INTERRUPTED_REASON};
