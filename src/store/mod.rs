//! fjall-based persistence for jobs, aggregations, and the two queue shapes.
//!
//! This is the only module that touches the key-value store. It persists:
//!
//! - Job records (download/callback state, counters, meta)
//! - Aggregation records (limit, proxy, timeout)
//! - Per-aggregation pending-download queues (FIFO of job ids)
//! - The global pending-callback queue (FIFO of job ids)
//!
//! Durability is delegated entirely to the store: the service restarts
//! without losing queued work. Queue order is encoded in the keys themselves
//! (a zero-padded persisted sequence number), so FIFO survives restarts too.
//!
//! An empty queue is a distinguished `Ok(None)`, never an error; callers
//! loop on it with backoff. Transport errors propagate.

mod error;
mod keys;
#[allow(clippy::module_inception)]
mod store;

pub use error::{Result, StoreError};
pub use store::Store;
