//! Storage crate: thread-node persistence and usage recording.
//!
//! ## Modules
//!
//! - [`error`] – Storage error types
//! - [`store`] – `MessageStore` and `UsageSink` traits
//! - [`sqlite_store`] – `SqliteMessageStore` (SQLite via sqlx)
//! - [`inmemory`] – `InMemoryMessageStore`
//! - [`sqlite_pool`] – `SqlitePoolManager`

mod error;
mod inmemory;
mod sqlite_pool;
mod sqlite_store;
mod store;

pub use error::StorageError;
pub use inmemory::InMemoryMessageStore;
pub use sqlite_pool::SqlitePoolManager;
pub use sqlite_store::SqliteMessageStore;
pub use store::{MessageStore, UsageSink};
