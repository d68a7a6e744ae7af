//! Persistent scheduler state.

mod kv;
mod store;

pub use kv::{KeyCursor, KvError, KvStore, MemoryKv, SqliteKv};
pub use store::{StoreError, TaskStore};
