//! Generation job system: transport, retry policy and the dispatcher.
//!
//! ## Components
//!
//! - `JobQueue`: at-least-once transport of request ids
//! - `RetryPolicy`: bounded attempts with backoff, async sleeps only
//! - `JobDispatcher`: runs one generation per delivery, turns the outcome into
//!   request state and triggers rollback on terminal failure

pub mod dispatcher;
pub mod queue;
pub mod retry;
pub mod types;

pub use dispatcher::{
    DispatcherConfig, DispatcherHandle, DispatcherStats, JobDispatcher, ProcessOutcome,
    DEFAULT_GENERATION_TIMEOUT,
};
pub use queue::{InMemoryJobQueue, JobQueue, JobReceiver, QueueError};
pub use retry::{RetryError, Retryable};
pub use types::{BackoffStrategy, RetryPolicy};
