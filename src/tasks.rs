//! Context record tracking: the persistent task/thread registry (spec §3).

pub mod store;

pub use store::{ContextNote, ContextRecord, ContextStatus, TaskStore, UpsertContextInput};
