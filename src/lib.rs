#![cfg_attr(docsrs, feature(doc_cfg))]

/*!
 # Spring Batch core for Rust

 Repeat, retry and chunk-completion building blocks for batch applications:
 the machinery that decides how many items go into a chunk, whether a failed
 write is attempted again, and how many bad records a step can skip before
 it gives up.

 ## Core Concepts

- **RepeatTemplate:** runs a callback until a completion policy says the loop
  is done. Loops nest: a step loop drives chunk loops.
- **CompletionPolicy:** decides when a loop is complete (fixed chunk size,
  timeout, callback result, or any combination).
- **ExceptionHandler:** decides whether an iteration's error aborts the loop
  or is absorbed, typically by counting errors against a skip limit.
- **RetryTemplate:** runs an operation again when it fails, as long as a
  retry policy allows, pausing between attempts with a back-off policy.
  Stateful retry keeps the budget of an item across separate submissions.
- **TaskExecutorRepeatTemplate:** dispatches iterations to a worker pool,
  threads or a tokio blocking pool, with a bound on work in flight.
- **ChunkOrientedStep:** reads, processes and writes items a chunk at a
  time on top of the above.

 ## Getting Started

```rust
use spring_batch_core::core::retry::{RetryState, RetryTemplateBuilder};
use spring_batch_core::error::{BatchError, IO};

let template = RetryTemplateBuilder::new().max_attempts(2).build();
let state = RetryState::new("order-42");

// First submission fails and the error comes back to the caller.
let first: Result<&str, BatchError> =
    template.execute_stateful_with_recovery(&state, |_| Err(BatchError::failure(&IO, "timeout")), |_| Ok("parked"));
assert!(first.is_err());

// Second submission fails again, which spends the budget.
let second: Result<&str, BatchError> =
    template.execute_stateful_with_recovery(&state, |_| Err(BatchError::failure(&IO, "timeout")), |_| Ok("parked"));
assert!(second.is_err());

// The next submission goes straight to recovery.
let third = template.execute_stateful_with_recovery(&state, |_| Ok("written"), |_| Ok("parked"));
assert_eq!(third.unwrap(), "parked");
```

 Settings can also be loaded from JSON, see [`core::settings::BatchSettings`].
*/

/// Core module for batch operations
pub mod core;

/// Error types for batch operations
pub mod error;

#[doc(inline)]
pub use error::*;
