//! # Warden Queue
//!
//! Durable, at-least-once background job queue.
//!
//! Features:
//! - Idempotent enqueue keyed by `(type, reference)`
//! - Pluggable store (`MemoryQueue` here, SQLite in `warden-persist`)
//! - Worker pool with lease-based locking and crash recovery
//! - Retry with bounded exponential backoff
//! - Post-execution observer and retention-based garbage collection

pub mod backend;
pub mod backoff;
pub mod error;
pub mod gc;
pub mod handle;
pub mod job;
pub mod memory;
pub mod observer;
pub mod processor;
pub mod reference;
pub mod worker;

pub use backend::{JobFilter, JobStore, OrderBy, QueueStat};
pub use backoff::Exponential;
pub use error::QueueError;
pub use gc::{GarbageCollector, GcReport, MaintenanceProcessor, HEARTBEAT_TYPE};
pub use handle::{JobHandle, Outcome};
pub use job::{JobId, JobRow, JobStatus, NewJob};
pub use memory::MemoryQueue;
pub use observer::{FnObserver, Observer};
pub use processor::{JobContext, Processor, ProcessorRegistry};
pub use reference::content_reference;
pub use worker::{WorkerConfig, WorkerPool, WorkerPoolBuilder};
