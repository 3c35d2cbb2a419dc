//! # Warden Persistence
//!
//! SQLite-backed [`JobStore`](warden_queue::JobStore).
//!
//! `enqueue` and `garbage_collect` accept any sqlx executor, so callers can
//! run them inside the transaction of the business write that triggers them.

pub mod queue;
pub mod sqlite;

pub use queue::{enqueue, garbage_collect, SqliteJobStore};
pub use sqlite::{connect, migrate, SqliteConfig};
