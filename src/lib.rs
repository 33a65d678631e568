//! Single-threaded promises with chaining and aggregate combinators.
//!
//! A [`Promise`] holds a value that arrives later, or the reason it never
//! will. It settles exactly once. Continuations attached with
//! [`then`](Promise::then), [`catch`](Promise::catch) and
//! [`finally`](Promise::finally) are never run synchronously: they are handed
//! to a [`Scheduler`] and run, first in first out, when its owner drives it.
//! [`TaskQueue`] is the scheduler shipped with the crate.
//!
//! # Examples
//!
//! ```
//! use promise_chain::{Promise, Resolution, TaskQueue};
//!
//! let queue = TaskQueue::new();
//! let scheduler = queue.scheduler();
//!
//! let (request, resolver) = Promise::<u16, String>::with_resolvers(&scheduler);
//! let body = request
//!     .then(
//!         |status| {
//!             if status == 200 {
//!                 Ok(Resolution::Value("ok"))
//!             } else {
//!                 Err(format!("status {status}"))
//!             }
//!         },
//!         |reason| Err(reason),
//!     )
//!     .catch(|_| Ok(Resolution::Value("fallback")));
//!
//! resolver.resolve(503);
//! assert!(body.peek().is_none());
//! queue.run_until_stalled().unwrap();
//! assert_eq!(body.peek(), Some(Ok("fallback")));
//! ```
mod combinators;
mod config;
mod promise;
mod scheduler;

pub use combinators::Settled;
pub use config::QueueConfig;
pub use promise::{Promise, PromiseState, Resolution, Resolver, Settlement, Wait};
pub use scheduler::{Schedule, Scheduler, Task, TaskQueue};

/// Errors raised by the task queue itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("task queue still has work after {limit} turns")]
    TurnBudgetExhausted { limit: usize },
}

/// Rejection reason of [`Promise::any`] when no input fulfilled.
///
/// `errors` holds every input's rejection reason, in input order.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("all promises were rejected ({} errors)", .errors.len())]
pub struct AggregateError<E> {
    pub errors: Vec<E>,
}
