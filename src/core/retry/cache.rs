use std::sync::Arc;

use dashmap::DashMap;
use log::debug;

use super::context::RetryContext;
use crate::error::BatchError;

/// Identifies the item a stateful retry sequence belongs to.
///
/// Submissions carrying the same key share one [`RetryContext`], so the
/// retry budget survives across separate calls, typically one per
/// transaction attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RetryState {
    key: String,
    force_refresh: bool,
}

impl RetryState {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            force_refresh: false,
        }
    }

    /// Discards any cached context for the key and starts a fresh sequence.
    pub fn force_refresh(mut self, force_refresh: bool) -> Self {
        self.force_refresh = force_refresh;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_force_refresh(&self) -> bool {
        self.force_refresh
    }
}

/// Bounded map from item key to in-flight retry context.
///
/// Contexts are never evicted. Putting a new key into a full cache fails
/// with [`BatchError::RetryCacheCapacityExceeded`].
#[derive(Debug)]
pub struct MapRetryContextCache {
    contexts: DashMap<String, Arc<RetryContext>>,
    capacity: usize,
}

impl MapRetryContextCache {
    pub const DEFAULT_CAPACITY: usize = 4096;

    pub fn new(capacity: usize) -> Self {
        Self {
            contexts: DashMap::new(),
            capacity,
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<RetryContext>> {
        self.contexts.get(key).map(|entry| Arc::clone(entry.value()))
    }

    pub fn put(&self, key: &str, context: Arc<RetryContext>) -> Result<(), BatchError> {
        if !self.contexts.contains_key(key) && self.contexts.len() >= self.capacity {
            return Err(BatchError::RetryCacheCapacityExceeded(self.capacity));
        }
        debug!("Caching retry context for key {}", key);
        self.contexts.insert(key.to_string(), context);
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Option<Arc<RetryContext>> {
        self.contexts.remove(key).map(|(_, context)| context)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.contexts.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for MapRetryContextCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
