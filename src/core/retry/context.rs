use std::{
    any::Any,
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use serde_json::Value;
use uuid::Uuid;

use super::backoff::BackOffContext;
use crate::error::{BatchError, FailureType};

/// Where a retry sequence stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPhase {
    /// No attempt has failed yet.
    Fresh,
    /// At least one attempt failed and the policy may allow another.
    Retrying,
    /// The budget is spent. The operation is not invoked again; the next
    /// submission goes straight to recovery.
    Exhausted,
}

/// State of one logical retry sequence.
///
/// Created by [`RetryPolicy::open`](super::policy::RetryPolicy::open), updated
/// on each failure and closed when the sequence concludes. With stateful
/// retry the same context is reused across separate submissions of the same
/// item, so all state is interior and the context is shared as an `Arc`.
pub struct RetryContext {
    id: Uuid,
    parent: Option<Arc<RetryContext>>,
    started_at: Instant,
    retry_count: AtomicUsize,
    phase: Mutex<RetryPhase>,
    last_error: Mutex<Option<BatchError>>,
    back_off: Mutex<Option<BackOffContext>>,
    attributes: Mutex<HashMap<String, Value>>,
    policy_state: Option<Box<dyn Any + Send + Sync>>,
}

impl RetryContext {
    pub fn new(parent: Option<Arc<RetryContext>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent,
            started_at: Instant::now(),
            retry_count: AtomicUsize::new(0),
            phase: Mutex::new(RetryPhase::Fresh),
            last_error: Mutex::new(None),
            back_off: Mutex::new(None),
            attributes: Mutex::new(HashMap::new()),
            policy_state: None,
        }
    }

    /// Creates a context carrying state private to the retry policy that opened it.
    pub fn with_policy_state<S>(parent: Option<Arc<RetryContext>>, state: S) -> Self
    where
        S: Any + Send + Sync,
    {
        Self {
            policy_state: Some(Box::new(state)),
            ..Self::new(parent)
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn parent(&self) -> Option<&Arc<RetryContext>> {
        self.parent.as_ref()
    }

    pub fn policy_state<S: Any>(&self) -> Option<&S> {
        self.policy_state.as_ref()?.downcast_ref::<S>()
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Number of failed attempts registered so far.
    pub fn retry_count(&self) -> usize {
        self.retry_count.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> RetryPhase {
        *lock(&self.phase)
    }

    pub fn is_exhausted_only(&self) -> bool {
        self.phase() == RetryPhase::Exhausted
    }

    /// Stops further attempts; the template goes straight to recovery.
    pub fn set_exhausted_only(&self) {
        *lock(&self.phase) = RetryPhase::Exhausted;
    }

    /// Records a failed attempt.
    pub fn register_error(&self, error: &BatchError) {
        self.retry_count.fetch_add(1, Ordering::SeqCst);
        *lock(&self.last_error) = Some(error.clone());

        let mut phase = lock(&self.phase);
        if *phase == RetryPhase::Fresh {
            *phase = RetryPhase::Retrying;
        }
    }

    pub fn last_error(&self) -> Option<BatchError> {
        lock(&self.last_error).clone()
    }

    pub fn last_error_type(&self) -> Option<&'static FailureType> {
        lock(&self.last_error).as_ref().map(BatchError::failure_type)
    }

    pub(crate) fn back_off_context(&self) -> Option<BackOffContext> {
        lock(&self.back_off).clone()
    }

    pub(crate) fn store_back_off_context(&self, back_off: BackOffContext) {
        *lock(&self.back_off) = Some(back_off);
    }

    pub fn attribute(&self, name: &str) -> Option<Value> {
        lock(&self.attributes).get(name).cloned()
    }

    pub fn set_attribute(&self, name: impl Into<String>, value: impl Into<Value>) {
        lock(&self.attributes).insert(name.into(), value.into());
    }
}

impl Default for RetryContext {
    fn default() -> Self {
        Self::new(None)
    }
}

impl fmt::Debug for RetryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryContext")
            .field("id", &self.id)
            .field("retry_count", &self.retry_count())
            .field("phase", &self.phase())
            .field("last_error", &self.last_error())
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
