use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use log::{debug, warn};

use super::context::RetryContext;
use crate::{
    core::classify::{BinaryExceptionClassifier, SubclassClassifier},
    error::BatchError,
};

/// Decides whether a failed operation may be attempted again.
///
/// A policy is stateless: everything it needs to remember about one retry
/// sequence lives in the [`RetryContext`] it opened. One policy instance may
/// therefore serve many concurrent sequences.
pub trait RetryPolicy: Send + Sync {
    /// Opens the context of a new retry sequence.
    fn open(&self, parent: Option<&Arc<RetryContext>>) -> Arc<RetryContext> {
        Arc::new(RetryContext::new(parent.cloned()))
    }

    /// Returns `true` if another attempt is allowed.
    fn can_retry(&self, context: &RetryContext) -> bool;

    /// Records a failed attempt.
    fn register_error(&self, context: &RetryContext, error: &BatchError) {
        context.register_error(error);
    }

    /// Releases whatever the policy attached to the context.
    fn close(&self, _context: &RetryContext) {}

    /// Returns `true` if every failure must be handed back to the caller
    /// immediately, leaving further attempts to a later submission.
    fn should_rethrow(&self, _context: &RetryContext) -> bool {
        false
    }
}

/// Retries up to a fixed number of attempts, for retryable failure types only.
///
/// `max_attempts` counts the first attempt: a limit of 1 means no retry.
pub struct SimpleRetryPolicy {
    max_attempts: usize,
    retryable: BinaryExceptionClassifier,
}

impl SimpleRetryPolicy {
    pub const DEFAULT_MAX_ATTEMPTS: usize = 3;

    /// Retries every failure except fatal ones.
    pub fn new(max_attempts: usize) -> Self {
        Self::with_classifier(max_attempts, BinaryExceptionClassifier::default())
    }

    pub fn with_classifier(max_attempts: usize, retryable: BinaryExceptionClassifier) -> Self {
        Self {
            max_attempts,
            retryable,
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }
}

impl Default for SimpleRetryPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_ATTEMPTS)
    }
}

impl RetryPolicy for SimpleRetryPolicy {
    fn can_retry(&self, context: &RetryContext) -> bool {
        let retryable = context
            .last_error_type()
            .is_none_or(|failure_type| self.retryable.classify_type(failure_type));
        retryable && context.retry_count() < self.max_attempts
    }
}

/// Allows the first attempt only.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverRetryPolicy;

impl RetryPolicy for NeverRetryPolicy {
    fn can_retry(&self, context: &RetryContext) -> bool {
        context.retry_count() == 0
    }
}

/// Retries forever. Pair it with a timeout or a listener that can veto.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysRetryPolicy;

impl RetryPolicy for AlwaysRetryPolicy {
    fn can_retry(&self, _context: &RetryContext) -> bool {
        true
    }
}

/// Retries until a wall-clock budget measured from the start of the sequence runs out.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutRetryPolicy {
    timeout: Duration,
}

impl TimeoutRetryPolicy {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for TimeoutRetryPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TIMEOUT)
    }
}

impl RetryPolicy for TimeoutRetryPolicy {
    fn can_retry(&self, context: &RetryContext) -> bool {
        context.elapsed() <= self.timeout
    }
}

/// Decorator turning a policy into one that rethrows every failure and
/// marks the context exhausted once the delegate gives up.
///
/// Used for stateful retry: the caller gets each failure back, and the
/// submission after the last allowed one goes straight to recovery.
pub struct RecoveryCallbackRetryPolicy {
    delegate: Arc<dyn RetryPolicy>,
}

impl RecoveryCallbackRetryPolicy {
    pub fn new(delegate: Arc<dyn RetryPolicy>) -> Self {
        Self { delegate }
    }
}

impl RetryPolicy for RecoveryCallbackRetryPolicy {
    fn open(&self, parent: Option<&Arc<RetryContext>>) -> Arc<RetryContext> {
        self.delegate.open(parent)
    }

    fn can_retry(&self, context: &RetryContext) -> bool {
        self.delegate.can_retry(context)
    }

    fn register_error(&self, context: &RetryContext, error: &BatchError) {
        self.delegate.register_error(context, error);
        if !self.delegate.can_retry(context) {
            debug!(
                "Retry budget spent after {} attempt(s), recovery is next",
                context.retry_count()
            );
            context.set_exhausted_only();
        }
    }

    fn close(&self, context: &RetryContext) {
        self.delegate.close(context);
    }

    fn should_rethrow(&self, _context: &RetryContext) -> bool {
        true
    }
}

struct CompositeState {
    contexts: Vec<Arc<RetryContext>>,
}

/// Combines several policies.
///
/// A pessimistic composite (the default) retries only while every delegate
/// allows it; an optimistic one retries while any delegate does.
pub struct CompositeRetryPolicy {
    policies: Vec<Arc<dyn RetryPolicy>>,
    optimistic: bool,
}

impl CompositeRetryPolicy {
    pub fn new(policies: Vec<Arc<dyn RetryPolicy>>) -> Self {
        Self {
            policies,
            optimistic: false,
        }
    }

    pub fn optimistic(mut self, optimistic: bool) -> Self {
        self.optimistic = optimistic;
        self
    }

    fn sub_contexts<'a>(&self, context: &'a RetryContext) -> &'a [Arc<RetryContext>] {
        match context.policy_state::<CompositeState>() {
            Some(state) => &state.contexts,
            None => {
                warn!("Retry context {} was not opened by a composite policy", context.id());
                &[]
            }
        }
    }
}

impl RetryPolicy for CompositeRetryPolicy {
    fn open(&self, parent: Option<&Arc<RetryContext>>) -> Arc<RetryContext> {
        let contexts = self.policies.iter().map(|policy| policy.open(parent)).collect();
        Arc::new(RetryContext::with_policy_state(
            parent.cloned(),
            CompositeState { contexts },
        ))
    }

    fn can_retry(&self, context: &RetryContext) -> bool {
        let mut verdicts = self
            .policies
            .iter()
            .zip(self.sub_contexts(context))
            .map(|(policy, sub_context)| policy.can_retry(sub_context));

        if self.optimistic {
            verdicts.any(|verdict| verdict)
        } else {
            verdicts.all(|verdict| verdict)
        }
    }

    fn register_error(&self, context: &RetryContext, error: &BatchError) {
        for (policy, sub_context) in self.policies.iter().zip(self.sub_contexts(context)) {
            policy.register_error(sub_context, error);
        }
        context.register_error(error);
    }

    fn close(&self, context: &RetryContext) {
        for (policy, sub_context) in self.policies.iter().zip(self.sub_contexts(context)) {
            policy.close(sub_context);
        }
    }
}

#[derive(Default)]
struct ClassifierState {
    current: Option<String>,
    contexts: HashMap<String, Arc<RetryContext>>,
}

/// Picks a retry policy per failure type.
///
/// Each failure is classified to a label, and the policy registered under
/// that label decides about the next attempt. Every label keeps its own
/// sub-context, so budgets of different failure types don't mix.
pub struct ExceptionClassifierRetryPolicy {
    classifier: SubclassClassifier<String>,
    policies: HashMap<String, Arc<dyn RetryPolicy>>,
    default_policy: Arc<dyn RetryPolicy>,
}

impl ExceptionClassifierRetryPolicy {
    /// Unclassified failures are never retried.
    pub fn new(classifier: SubclassClassifier<String>) -> Self {
        Self {
            classifier,
            policies: HashMap::new(),
            default_policy: Arc::new(NeverRetryPolicy),
        }
    }

    pub fn policy(mut self, label: impl Into<String>, policy: Arc<dyn RetryPolicy>) -> Self {
        self.policies.insert(label.into(), policy);
        self
    }

    pub fn default_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.default_policy = policy;
        self
    }

    fn policy_for(&self, label: &str) -> &Arc<dyn RetryPolicy> {
        self.policies.get(label).unwrap_or(&self.default_policy)
    }

    fn with_state<R>(&self, context: &RetryContext, f: impl FnOnce(&mut ClassifierState) -> R) -> Option<R> {
        let state = context.policy_state::<Mutex<ClassifierState>>()?;
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        Some(f(&mut state))
    }
}

impl RetryPolicy for ExceptionClassifierRetryPolicy {
    fn open(&self, parent: Option<&Arc<RetryContext>>) -> Arc<RetryContext> {
        Arc::new(RetryContext::with_policy_state(
            parent.cloned(),
            Mutex::new(ClassifierState::default()),
        ))
    }

    fn can_retry(&self, context: &RetryContext) -> bool {
        let current = self.with_state(context, |state| {
            let label = state.current.clone()?;
            let sub_context = state.contexts.get(&label).cloned()?;
            Some((label, sub_context))
        });

        match current.flatten() {
            Some((label, sub_context)) => self.policy_for(&label).can_retry(&sub_context),
            None => true,
        }
    }

    fn register_error(&self, context: &RetryContext, error: &BatchError) {
        let label = self.classifier.classify_type(error.failure_type());
        let policy = self.policy_for(&label);

        let sub_context = self.with_state(context, |state| {
            state.current = Some(label.clone());
            Arc::clone(
                state
                    .contexts
                    .entry(label.clone())
                    .or_insert_with(|| policy.open(context.parent())),
            )
        });

        if let Some(sub_context) = sub_context {
            policy.register_error(&sub_context, error);
        }
        context.register_error(error);
    }

    fn close(&self, context: &RetryContext) {
        let contexts = self
            .with_state(context, |state| state.contexts.drain().collect::<Vec<_>>())
            .unwrap_or_default();
        for (label, sub_context) in contexts {
            self.policy_for(&label).close(&sub_context);
        }
    }
}
