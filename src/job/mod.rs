//! Domain model: jobs, aggregations, and their state machines.
//!
//! A [`Job`] is a single download request with a callback obligation. An
//! [`Aggregation`] is the unit of rate limiting: jobs sharing an aggregation
//! share a concurrency cap, an optional proxy, and a client timeout.
//!
//! Both entities live in the [`Store`](crate::store::Store); every state
//! mutation here saves back immediately so the store is always the source of
//! truth.

mod model;
mod submission;

pub use model::{Aggregation, Job, RetryOutcome, State, DEFAULT_TIMEOUT_SECS};
pub use submission::{Submission, ValidationError};
