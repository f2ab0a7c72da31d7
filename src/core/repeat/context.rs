use std::{
    any::Any,
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use log::warn;
use serde_json::Value;

type DestructionCallback = Box<dyn FnOnce(&RepeatContext) + Send>;

/// State of one repeat loop invocation.
///
/// A context is created by a completion policy when a loop starts and is
/// shared with every iteration of that loop. Nested loops get their own
/// context linked to the outer one through [`RepeatContext::parent`].
///
/// All state is behind atomics or mutexes so that iterations running on a
/// worker pool can read and update it concurrently.
pub struct RepeatContext {
    parent: Option<Arc<RepeatContext>>,
    started_at: Instant,
    started_count: AtomicUsize,
    complete_only: AtomicBool,
    closed: AtomicBool,
    attributes: Mutex<HashMap<String, Value>>,
    policy_state: Option<Box<dyn Any + Send + Sync>>,
    destruction_callbacks: Mutex<Vec<(String, DestructionCallback)>>,
}

impl RepeatContext {
    pub fn new(parent: Option<Arc<RepeatContext>>) -> Self {
        Self {
            parent,
            started_at: Instant::now(),
            started_count: AtomicUsize::new(0),
            complete_only: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            attributes: Mutex::new(HashMap::new()),
            policy_state: None,
            destruction_callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Creates a context carrying state private to the completion policy that created it.
    pub fn with_policy_state<S>(parent: Option<Arc<RepeatContext>>, state: S) -> Self
    where
        S: Any + Send + Sync,
    {
        Self {
            policy_state: Some(Box::new(state)),
            ..Self::new(parent)
        }
    }

    pub fn parent(&self) -> Option<&Arc<RepeatContext>> {
        self.parent.as_ref()
    }

    pub fn policy_state<S: Any>(&self) -> Option<&S> {
        self.policy_state.as_ref()?.downcast_ref::<S>()
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Number of iterations recorded so far.
    pub fn started_count(&self) -> usize {
        self.started_count.load(Ordering::SeqCst)
    }

    pub fn increment(&self) -> usize {
        self.started_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Asks the loop owning this context to stop after the current iteration.
    pub fn set_complete_only(&self) {
        self.complete_only.store(true, Ordering::SeqCst);
    }

    pub fn is_complete_only(&self) -> bool {
        self.complete_only.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Looks `name` up here, then in each parent in turn.
    pub fn attribute(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.attributes().get(name) {
            return Some(value.clone());
        }
        self.parent.as_ref().and_then(|parent| parent.attribute(name))
    }

    /// Returns `true` if `name` is set here or in any parent.
    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes().contains_key(name)
            || self
                .parent
                .as_ref()
                .is_some_and(|parent| parent.has_attribute(name))
    }

    /// Writes are always local and shadow a parent's value.
    pub fn set_attribute(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.attributes().insert(name.into(), value.into());
    }

    pub fn remove_attribute(&self, name: &str) -> Option<Value> {
        self.attributes().remove(name)
    }

    /// Atomically replaces an attribute with `f(current)` and returns the new value.
    pub fn update_attribute<F>(&self, name: &str, f: F) -> Value
    where
        F: FnOnce(Option<&Value>) -> Value,
    {
        let mut attributes = self.attributes();
        let value = f(attributes.get(name));
        attributes.insert(name.to_string(), value.clone());
        value
    }

    /// Adds `delta` to a numeric counter attribute, starting from zero.
    pub fn increment_counter(&self, name: &str, delta: u64) -> u64 {
        let value = self.update_attribute(name, |current| {
            let count = current.and_then(Value::as_u64).unwrap_or(0);
            Value::from(count + delta)
        });
        value.as_u64().unwrap_or(0)
    }

    /// Reads a counter of this context only; parents keep their own counts.
    pub fn counter(&self, name: &str) -> u64 {
        self.attributes()
            .get(name)
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    /// Registers a callback run once when the context is closed.
    ///
    /// The attribute named `name` is removed before the callback runs.
    pub fn register_destruction_callback<F>(&self, name: impl Into<String>, callback: F)
    where
        F: FnOnce(&RepeatContext) + Send + 'static,
    {
        self.destruction_callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name.into(), Box::new(callback)));
    }

    /// Marks the context closed and runs the destruction callbacks, in registration order.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            warn!("Repeat context closed twice");
            return;
        }

        let callbacks = std::mem::take(
            &mut *self
                .destruction_callbacks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );

        for (name, callback) in callbacks {
            self.remove_attribute(&name);
            callback(self);
        }
    }

    fn attributes(&self) -> std::sync::MutexGuard<'_, HashMap<String, Value>> {
        self.attributes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for RepeatContext {
    fn default() -> Self {
        Self::new(None)
    }
}

impl fmt::Debug for RepeatContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepeatContext")
            .field("started_count", &self.started_count())
            .field("complete_only", &self.is_complete_only())
            .field("closed", &self.is_closed())
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}
