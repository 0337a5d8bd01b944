//! SQLite backend for the wavelink merge engine.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated thread
//! without blocking the async runtime. Implements both
//! [`MergeStore`](wavelink_core::store::MergeStore) and
//! [`ReviewQueue`](wavelink_core::review::ReviewQueue).

mod encode;
mod schema;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use store::SqliteStore;
