//! Retry operations: run an operation again when it fails, up to a budget.
//!
//! - [`policy`]: when to retry (attempt count, timeout, per failure type, composites).
//! - [`backoff`]: how long to pause between attempts.
//! - [`context`]: the [`RetryContext`] of one retry sequence.
//! - [`cache`]: contexts kept between submissions for stateful retry.
//! - [`listener`]: hooks around a retry sequence.
//! - [`template`]: the [`RetryTemplate`] tying it all together.

pub mod backoff;
pub mod cache;
pub mod context;
pub mod listener;
pub mod policy;
pub mod template;

pub use backoff::{
    BackOffContext, BackOffPolicy, ExponentialBackOffPolicy, FixedBackOffPolicy,
    InterruptibleSleeper, NoBackOffPolicy, Sleeper, ThreadSleeper, UniformRandomBackOffPolicy,
};
pub use cache::{MapRetryContextCache, RetryState};
pub use context::{RetryContext, RetryPhase};
pub use listener::{CompositeRetryListener, RetryListener};
pub use policy::{
    AlwaysRetryPolicy, CompositeRetryPolicy, ExceptionClassifierRetryPolicy, NeverRetryPolicy,
    RecoveryCallbackRetryPolicy, RetryPolicy, SimpleRetryPolicy, TimeoutRetryPolicy,
};
pub use template::{RetryTemplate, RetryTemplateBuilder};
