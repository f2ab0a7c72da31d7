use std::sync::{Arc, PoisonError, RwLock};

use log::{debug, info, warn};

use super::{
    backoff::{BackOffPolicy, NoBackOffPolicy},
    cache::{MapRetryContextCache, RetryState},
    context::RetryContext,
    listener::{CompositeRetryListener, RetryListener},
    policy::{RecoveryCallbackRetryPolicy, RetryPolicy, SimpleRetryPolicy},
};
use crate::error::{BatchError, RETRY_EXHAUSTED};

type Recovery<'r, T> = Box<dyn FnOnce(&RetryContext) -> Result<T, BatchError> + 'r>;

enum Outcome<T> {
    /// The sequence concluded: success, recovery, exhaustion or abort.
    Done(Result<T, BatchError>),
    /// A failure handed back to the caller; the sequence continues on the next submission.
    Rethrown(BatchError),
}

/// Runs an operation, retrying it on failure according to a [`RetryPolicy`].
///
/// Stateless calls ([`execute`](Self::execute) and friends) retry inside the
/// call, pausing with the [`BackOffPolicy`] between attempts. When the budget
/// is spent the recovery callback runs, or the last error is returned.
///
/// Stateful calls ([`execute_stateful`](Self::execute_stateful)) keep the
/// retry context in a cache keyed by [`RetryState`]. Every failure is
/// returned to the caller, who is expected to submit the same item again.
/// Once the budget is spent, the next submission skips the operation and
/// recovers.
///
/// Policies are read once per call, so replacing them with
/// [`set_retry_policy`](Self::set_retry_policy) while calls are in flight is
/// safe.
///
/// # Examples
///
/// ```
/// use std::cell::Cell;
///
/// use spring_batch_core::core::retry::RetryTemplateBuilder;
/// use spring_batch_core::error::{BatchError, IO};
///
/// let template = RetryTemplateBuilder::new().max_attempts(3).build();
/// let calls = Cell::new(0);
///
/// let value = template
///     .execute(|_| {
///         calls.set(calls.get() + 1);
///         if calls.get() < 3 {
///             Err(BatchError::failure(&IO, "connection reset"))
///         } else {
///             Ok("done")
///         }
///     })
///     .unwrap();
///
/// assert_eq!(value, "done");
/// assert_eq!(calls.get(), 3);
/// ```
pub struct RetryTemplate {
    retry_policy: RwLock<Arc<dyn RetryPolicy>>,
    back_off_policy: RwLock<Arc<dyn BackOffPolicy>>,
    listener: CompositeRetryListener,
    context_cache: MapRetryContextCache,
}

impl RetryTemplate {
    /// Three attempts, no pause between them.
    pub fn new() -> Self {
        RetryTemplateBuilder::new().build()
    }

    pub fn retry_policy(&self) -> Arc<dyn RetryPolicy> {
        Arc::clone(&self.retry_policy.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn set_retry_policy(&self, policy: Arc<dyn RetryPolicy>) {
        *self.retry_policy.write().unwrap_or_else(PoisonError::into_inner) = policy;
    }

    pub fn back_off_policy(&self) -> Arc<dyn BackOffPolicy> {
        Arc::clone(
            &self
                .back_off_policy
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    pub fn set_back_off_policy(&self, policy: Arc<dyn BackOffPolicy>) {
        *self
            .back_off_policy
            .write()
            .unwrap_or_else(PoisonError::into_inner) = policy;
    }

    pub fn context_cache(&self) -> &MapRetryContextCache {
        &self.context_cache
    }

    /// Retries `callback`; on exhaustion returns the last error it produced.
    pub fn execute<T, F>(&self, mut callback: F) -> Result<T, BatchError>
    where
        F: FnMut(&Arc<RetryContext>) -> Result<T, BatchError>,
    {
        self.do_execute(None, None, &mut callback, None)
    }

    /// Retries `callback` in a context nested under `parent`.
    pub fn execute_in<T, F>(&self, parent: &Arc<RetryContext>, mut callback: F) -> Result<T, BatchError>
    where
        F: FnMut(&Arc<RetryContext>) -> Result<T, BatchError>,
    {
        self.do_execute(Some(parent), None, &mut callback, None)
    }

    /// Retries `callback`; on exhaustion returns what `recovery` returns.
    pub fn execute_with_recovery<T, F, R>(&self, mut callback: F, recovery: R) -> Result<T, BatchError>
    where
        F: FnMut(&Arc<RetryContext>) -> Result<T, BatchError>,
        R: FnOnce(&RetryContext) -> Result<T, BatchError>,
    {
        self.do_execute(None, None, &mut callback, Some(Box::new(recovery)))
    }

    /// One attempt of a stateful retry sequence.
    ///
    /// Once the budget is spent, the next submission returns
    /// [`BatchError::RetryExhausted`] without running `callback`.
    pub fn execute_stateful<T, F>(&self, state: &RetryState, mut callback: F) -> Result<T, BatchError>
    where
        F: FnMut(&Arc<RetryContext>) -> Result<T, BatchError>,
    {
        self.do_execute(None, Some(state), &mut callback, None)
    }

    /// One attempt of a stateful retry sequence with a recovery path.
    pub fn execute_stateful_with_recovery<T, F, R>(
        &self,
        state: &RetryState,
        mut callback: F,
        recovery: R,
    ) -> Result<T, BatchError>
    where
        F: FnMut(&Arc<RetryContext>) -> Result<T, BatchError>,
        R: FnOnce(&RetryContext) -> Result<T, BatchError>,
    {
        self.do_execute(None, Some(state), &mut callback, Some(Box::new(recovery)))
    }

    fn do_execute<T>(
        &self,
        parent: Option<&Arc<RetryContext>>,
        state: Option<&RetryState>,
        callback: &mut dyn FnMut(&Arc<RetryContext>) -> Result<T, BatchError>,
        recovery: Option<Recovery<'_, T>>,
    ) -> Result<T, BatchError> {
        let retry_policy: Arc<dyn RetryPolicy> = match state {
            Some(_) => Arc::new(RecoveryCallbackRetryPolicy::new(self.retry_policy())),
            None => self.retry_policy(),
        };
        let back_off_policy = self.back_off_policy();

        let context = self.open_context(retry_policy.as_ref(), parent, state)?;

        let outcome = if self.listener.open(&context) {
            self.run(
                &context,
                retry_policy.as_ref(),
                back_off_policy.as_ref(),
                state,
                callback,
                recovery,
            )
        } else {
            Outcome::Done(Err(BatchError::RetryTerminated(
                "vetoed by a retry listener".to_string(),
            )))
        };

        let result = match outcome {
            Outcome::Done(result) => {
                if let Some(state) = state {
                    self.context_cache.remove(state.key());
                }
                retry_policy.close(&context);
                result
            }
            Outcome::Rethrown(err) => Err(err),
        };

        self.listener.close(&context, result.as_ref().err());
        result
    }

    fn open_context(
        &self,
        retry_policy: &dyn RetryPolicy,
        parent: Option<&Arc<RetryContext>>,
        state: Option<&RetryState>,
    ) -> Result<Arc<RetryContext>, BatchError> {
        let Some(state) = state else {
            return Ok(retry_policy.open(parent));
        };

        if state.is_force_refresh() && self.context_cache.remove(state.key()).is_some() {
            debug!("Discarded cached retry context for key {}", state.key());
        }

        if let Some(context) = self.context_cache.get(state.key()) {
            debug!(
                "Resuming retry for key {} after {} attempt(s)",
                state.key(),
                context.retry_count()
            );
            return Ok(context);
        }

        let context = retry_policy.open(parent);
        self.context_cache.put(state.key(), Arc::clone(&context))?;
        Ok(context)
    }

    fn run<T>(
        &self,
        context: &Arc<RetryContext>,
        retry_policy: &dyn RetryPolicy,
        back_off_policy: &dyn BackOffPolicy,
        state: Option<&RetryState>,
        callback: &mut dyn FnMut(&Arc<RetryContext>) -> Result<T, BatchError>,
        recovery: Option<Recovery<'_, T>>,
    ) -> Outcome<T> {
        let mut back_off = context
            .back_off_context()
            .unwrap_or_else(|| back_off_policy.start(context));

        while retry_policy.can_retry(context) && !context.is_exhausted_only() {
            debug!("Retry: count={}", context.retry_count());

            let err = match callback(context) {
                Ok(value) => return Outcome::Done(Ok(value)),
                Err(err) => err,
            };

            retry_policy.register_error(context, &err);
            self.listener.on_error(context, &err);

            if retry_policy.can_retry(context) && !context.is_exhausted_only() {
                if let Err(interrupted) = back_off_policy.back_off(&mut back_off) {
                    warn!("Retry aborted during back off: {}", interrupted);
                    return Outcome::Done(Err(interrupted));
                }
                context.store_back_off_context(back_off.clone());
            }

            if retry_policy.should_rethrow(context) {
                debug!("Rethrow in retry: count={}", context.retry_count());
                return Outcome::Rethrown(err);
            }
        }

        debug!("Retry failed last attempt: count={}", context.retry_count());
        Outcome::Done(self.handle_exhausted(context, state, recovery))
    }

    fn handle_exhausted<T>(
        &self,
        context: &RetryContext,
        state: Option<&RetryState>,
        recovery: Option<Recovery<'_, T>>,
    ) -> Result<T, BatchError> {
        if let Some(recover) = recovery {
            info!(
                "Retry exhausted after {} attempt(s), recovering",
                context.retry_count()
            );
            return recover(context);
        }

        match (state, context.last_error()) {
            (None, Some(err)) => Err(err),
            (_, last_error) => Err(BatchError::RetryExhausted {
                attempts: context.retry_count(),
                source: Box::new(last_error.unwrap_or_else(|| {
                    BatchError::failure(&RETRY_EXHAUSTED, "no attempt was allowed")
                })),
            }),
        }
    }
}

impl Default for RetryTemplate {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`RetryTemplate`].
///
/// ```
/// use std::time::Duration;
///
/// use spring_batch_core::core::retry::{ExponentialBackOffPolicy, RetryTemplateBuilder};
///
/// let template = RetryTemplateBuilder::new()
///     .max_attempts(5)
///     .back_off_policy(ExponentialBackOffPolicy::new(
///         Duration::from_millis(10),
///         2.0,
///         Duration::from_millis(100),
///     ))
///     .build();
/// ```
pub struct RetryTemplateBuilder {
    retry_policy: Arc<dyn RetryPolicy>,
    back_off_policy: Arc<dyn BackOffPolicy>,
    listener: CompositeRetryListener,
    cache_capacity: usize,
}

impl RetryTemplateBuilder {
    pub fn new() -> Self {
        Self {
            retry_policy: Arc::new(SimpleRetryPolicy::default()),
            back_off_policy: Arc::new(NoBackOffPolicy),
            listener: CompositeRetryListener::new(),
            cache_capacity: MapRetryContextCache::DEFAULT_CAPACITY,
        }
    }

    pub fn retry_policy(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.retry_policy = Arc::new(policy);
        self
    }

    pub fn shared_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Shortcut for a [`SimpleRetryPolicy`] allowing `max_attempts` attempts.
    pub fn max_attempts(self, max_attempts: usize) -> Self {
        self.retry_policy(SimpleRetryPolicy::new(max_attempts))
    }

    pub fn back_off_policy(mut self, policy: impl BackOffPolicy + 'static) -> Self {
        self.back_off_policy = Arc::new(policy);
        self
    }

    pub fn shared_back_off_policy(mut self, policy: Arc<dyn BackOffPolicy>) -> Self {
        self.back_off_policy = policy;
        self
    }

    pub fn listener(mut self, listener: Arc<dyn RetryListener>) -> Self {
        self.listener.register(listener);
        self
    }

    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn build(self) -> RetryTemplate {
        RetryTemplate {
            retry_policy: RwLock::new(self.retry_policy),
            back_off_policy: RwLock::new(self.back_off_policy),
            listener: self.listener,
            context_cache: MapRetryContextCache::new(self.cache_capacity),
        }
    }
}

impl Default for RetryTemplateBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        cell::Cell,
        sync::{
            Mutex,
            atomic::{AtomicBool, AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use super::*;
    use crate::{
        core::{
            classify::BinaryExceptionClassifier,
            retry::{
                backoff::{
                    ExponentialBackOffPolicy, FixedBackOffPolicy, InterruptibleSleeper,
                    tests::RecordingSleeper,
                },
                policy::{AlwaysRetryPolicy, NeverRetryPolicy},
            },
        },
        error::{INVALID, IO},
    };

    fn io_error() -> BatchError {
        BatchError::failure(&IO, "connection reset")
    }

    #[test]
    fn single_attempt_propagates_original_error() {
        let template = RetryTemplateBuilder::new().max_attempts(1).build();
        let calls = Cell::new(0);

        let result: Result<(), BatchError> = template.execute(|_| {
            calls.set(calls.get() + 1);
            Err(io_error())
        });

        assert_eq!(calls.get(), 1);
        match result {
            Err(BatchError::Failure { kind, message }) => {
                assert_eq!(kind, &IO);
                assert_eq!(message, "connection reset");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn second_attempt_succeeds() {
        let template = RetryTemplateBuilder::new().max_attempts(2).build();
        let calls = Cell::new(0);

        let result = template.execute(|context| {
            calls.set(calls.get() + 1);
            if context.retry_count() == 0 {
                Err(io_error())
            } else {
                Ok(context.retry_count())
            }
        });

        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn recovery_runs_on_exhaustion() {
        let template = RetryTemplate::new();
        let calls = Cell::new(0);

        let result = template.execute_with_recovery(
            |_| -> Result<&'static str, BatchError> {
                calls.set(calls.get() + 1);
                Err(io_error())
            },
            |context| {
                assert_eq!(context.retry_count(), 3);
                Ok("recovered")
            },
        );

        assert_eq!(result.unwrap(), "recovered");
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn non_retryable_error_is_not_retried() {
        let template = RetryTemplateBuilder::new()
            .retry_policy(SimpleRetryPolicy::with_classifier(
                5,
                BinaryExceptionClassifier::only(&[&IO]),
            ))
            .build();
        let calls = Cell::new(0);

        let result: Result<(), BatchError> = template.execute(|_| {
            calls.set(calls.get() + 1);
            Err(BatchError::failure(&INVALID, "bad record"))
        });

        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn stateful_never_retry_recovers_on_second_submission() {
        let template = RetryTemplateBuilder::new()
            .retry_policy(NeverRetryPolicy)
            .build();
        let state = RetryState::new("item-1");
        let calls = Cell::new(0);

        let first = template.execute_stateful_with_recovery(
            &state,
            |_| -> Result<&'static str, BatchError> {
                calls.set(calls.get() + 1);
                Err(io_error())
            },
            |_| Ok("recovered"),
        );
        assert!(matches!(first, Err(BatchError::Failure { .. })));
        assert!(template.context_cache().contains_key("item-1"));

        let second = template.execute_stateful_with_recovery(
            &state,
            |_| -> Result<&'static str, BatchError> {
                calls.set(calls.get() + 1);
                Err(io_error())
            },
            |_| Ok("recovered"),
        );
        assert_eq!(second.unwrap(), "recovered");
        assert_eq!(calls.get(), 1);
        assert!(!template.context_cache().contains_key("item-1"));
    }

    #[test]
    fn stateful_without_recovery_reports_exhaustion() {
        let template = RetryTemplateBuilder::new().max_attempts(2).build();
        let state = RetryState::new("item-2");
        let attempt = || template.execute_stateful(&state, |_| -> Result<(), BatchError> { Err(io_error()) });

        assert!(matches!(attempt(), Err(BatchError::Failure { .. })));
        assert!(matches!(attempt(), Err(BatchError::Failure { .. })));
        match attempt() {
            Err(BatchError::RetryExhausted { attempts, source }) => {
                assert_eq!(attempts, 2);
                assert_eq!(source.failure_type(), &IO);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(template.context_cache().is_empty());
    }

    #[test]
    fn stateful_success_clears_cache() {
        let template = RetryTemplate::new();
        let state = RetryState::new("item-3");

        let _ = template.execute_stateful(&state, |_| -> Result<(), BatchError> { Err(io_error()) });
        assert_eq!(template.context_cache().len(), 1);

        let value = template.execute_stateful(&state, |context| Ok(context.retry_count()));
        assert_eq!(value.unwrap(), 1);
        assert!(template.context_cache().is_empty());
    }

    #[test]
    fn force_refresh_starts_a_new_sequence() {
        let template = RetryTemplateBuilder::new().retry_policy(NeverRetryPolicy).build();
        let state = RetryState::new("item-4");

        let _ = template.execute_stateful(&state, |_| -> Result<(), BatchError> { Err(io_error()) });

        let refreshed = state.clone().force_refresh(true);
        let value = template.execute_stateful(&refreshed, |context| Ok(context.retry_count()));
        assert_eq!(value.unwrap(), 0);
    }

    #[test]
    fn full_cache_rejects_new_keys() {
        let template = RetryTemplateBuilder::new().cache_capacity(1).build();

        let _ = template.execute_stateful(&RetryState::new("a"), |_| -> Result<(), BatchError> {
            Err(io_error())
        });
        let result = template.execute_stateful(&RetryState::new("b"), |_| Ok(()));

        assert!(matches!(result, Err(BatchError::RetryCacheCapacityExceeded(1))));
    }

    struct Veto {
        closed: AtomicBool,
    }

    impl RetryListener for Veto {
        fn open(&self, _context: &RetryContext) -> bool {
            false
        }

        fn close(&self, _context: &RetryContext, error: Option<&BatchError>) {
            assert!(matches!(error, Some(BatchError::RetryTerminated(_))));
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn listener_veto_terminates_without_attempt() {
        let veto = Arc::new(Veto {
            closed: AtomicBool::new(false),
        });
        let template = RetryTemplateBuilder::new().listener(veto.clone()).build();
        let calls = Cell::new(0);

        let result = template.execute(|_| {
            calls.set(calls.get() + 1);
            Ok(())
        });

        assert!(matches!(result, Err(BatchError::RetryTerminated(_))));
        assert_eq!(calls.get(), 0);
        assert!(veto.closed.load(Ordering::SeqCst));
    }

    #[derive(Default)]
    struct ErrorCounter {
        errors: AtomicUsize,
    }

    impl RetryListener for ErrorCounter {
        fn on_error(&self, _context: &RetryContext, _error: &BatchError) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn listener_sees_every_failure() {
        let counter = Arc::new(ErrorCounter::default());
        let template = RetryTemplateBuilder::new().listener(counter.clone()).build();

        let _ = template.execute(|_| -> Result<(), BatchError> { Err(io_error()) });
        assert_eq!(counter.errors.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn backs_off_between_attempts_only() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let template = RetryTemplateBuilder::new()
            .max_attempts(4)
            .back_off_policy(
                ExponentialBackOffPolicy::new(
                    Duration::from_millis(10),
                    2.0,
                    Duration::from_secs(1),
                )
                .with_sleeper(sleeper.clone()),
            )
            .build();

        let _ = template.execute(|_| -> Result<(), BatchError> { Err(io_error()) });

        let millis: Vec<u128> = sleeper
            .pauses
            .lock()
            .unwrap()
            .iter()
            .map(Duration::as_millis)
            .collect();
        assert_eq!(millis, vec![10, 20, 40]);
    }

    #[test]
    fn interrupted_back_off_aborts_the_sequence() {
        let sleeper = Arc::new(InterruptibleSleeper::new());
        sleeper.interrupt();

        let template = RetryTemplateBuilder::new()
            .retry_policy(AlwaysRetryPolicy)
            .back_off_policy(
                FixedBackOffPolicy::new(Duration::from_secs(10)).with_sleeper(sleeper.clone()),
            )
            .build();
        let calls = Cell::new(0);

        let result: Result<(), BatchError> = template.execute(|_| {
            calls.set(calls.get() + 1);
            Err(io_error())
        });

        assert!(matches!(result, Err(BatchError::BackOffInterrupted(_))));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn nested_retry_links_contexts() {
        let outer = RetryTemplate::new();
        let inner = RetryTemplateBuilder::new().max_attempts(2).build();
        let parents = Mutex::new(Vec::new());

        let result = outer.execute(|outer_context| {
            inner.execute_in(outer_context, |inner_context| {
                parents
                    .lock()
                    .unwrap()
                    .push(inner_context.parent().map(|parent| parent.id()));
                Ok(outer_context.id())
            })
        });

        let outer_id = result.unwrap();
        assert_eq!(*parents.lock().unwrap(), vec![Some(outer_id)]);
    }

    #[test]
    fn policy_can_be_replaced_between_calls() {
        let template = RetryTemplate::new();
        template.set_retry_policy(Arc::new(NeverRetryPolicy));
        let calls = Cell::new(0);

        let _ = template.execute(|_| -> Result<(), BatchError> {
            calls.set(calls.get() + 1);
            Err(io_error())
        });
        assert_eq!(calls.get(), 1);
    }
}
