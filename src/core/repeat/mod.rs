//! Repeat operations: drive a callback until a completion policy says stop.
//!
//! # Module Architecture
//!
//! - [`context`]: the per-loop [`RepeatContext`], linked to its parent for nested loops.
//! - [`policy`]: completion policies (fixed size, timeout, composite, result driven).
//! - [`exception`]: exception handlers deciding whether a failure aborts the loop.
//! - [`listener`]: hooks around the loop and each iteration.
//! - [`template`]: the synchronous [`RepeatTemplate`].
//! - [`executor`]: [`TaskExecutorRepeatTemplate`], dispatching iterations to a worker pool.
//! - [`callback`]: callbacks built on item readers and writers.
//!
//! # Examples
//!
//! Processing items in chunks of three, the inner loop nested under the outer one:
//!
//! ```
//! use std::sync::{Arc, Mutex};
//!
//! use spring_batch_core::core::exit_status::ExitStatus;
//! use spring_batch_core::core::repeat::{
//!     RepeatContext, RepeatResult, RepeatTemplate, RepeatTemplateBuilder, SimpleCompletionPolicy,
//! };
//!
//! let items = Mutex::new((1..=7).collect::<Vec<u32>>());
//! let chunks = Mutex::new(Vec::new());
//!
//! let outer = RepeatTemplate::new();
//! let inner = RepeatTemplateBuilder::new()
//!     .completion_policy(SimpleCompletionPolicy::new(3))
//!     .build();
//!
//! let status = outer
//!     .iterate(&|context: &Arc<RepeatContext>| -> RepeatResult {
//!         let chunk = Mutex::new(Vec::new());
//!         let status = inner.iterate_in(context, &|_: &Arc<RepeatContext>| -> RepeatResult {
//!             match items.lock().unwrap().pop() {
//!                 Some(item) => {
//!                     chunk.lock().unwrap().push(item);
//!                     Ok(ExitStatus::CONTINUABLE)
//!                 }
//!                 None => Ok(ExitStatus::FINISHED),
//!             }
//!         })?;
//!         chunks.lock().unwrap().push(chunk.into_inner().unwrap());
//!         Ok(status)
//!     })
//!     .unwrap();
//!
//! assert!(!status.is_continuable());
//! assert_eq!(chunks.lock().unwrap().len(), 3);
//! ```

use std::sync::Arc;

use crate::{core::exit_status::ExitStatus, error::BatchError};

pub mod callback;
pub mod context;
pub mod exception;
pub mod executor;
pub mod listener;
pub mod policy;
pub mod template;

pub use context::RepeatContext;
pub use exception::{
    CompositeExceptionHandler, DefaultExceptionHandler, ErrorAction, ExceptionHandler,
    LogOrRethrowExceptionHandler, RethrowOnThresholdExceptionHandler,
    SimpleLimitExceptionHandler,
};
pub use executor::{
    SyncTaskExecutor, TaskExecutor, TaskExecutorRepeatTemplate, ThreadTaskExecutor,
    TokioTaskExecutor,
};
pub use listener::{CompositeRepeatListener, RepeatListener};
pub use policy::{
    CompletionPolicy, CompositeCompletionPolicy, CountingCompletionPolicy,
    DefaultResultCompletionPolicy, SimpleCompletionPolicy, TimeoutTerminationPolicy,
};
pub use template::{RepeatTemplate, RepeatTemplateBuilder};

/// Result of one iteration.
pub type RepeatResult = Result<ExitStatus, BatchError>;

/// The unit of work run once per iteration.
///
/// Returning a non-continuable status asks the completion policy to stop the
/// loop; returning an error hands it to the template's exception handler.
pub trait RepeatCallback {
    fn do_in_iteration(&self, context: &Arc<RepeatContext>) -> RepeatResult;
}

impl<F> RepeatCallback for F
where
    F: Fn(&Arc<RepeatContext>) -> RepeatResult,
{
    fn do_in_iteration(&self, context: &Arc<RepeatContext>) -> RepeatResult {
        self(context)
    }
}
