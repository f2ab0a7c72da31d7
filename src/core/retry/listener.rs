use std::sync::Arc;

use log::debug;

use super::context::RetryContext;
use crate::error::BatchError;

/// Hooks around a retry sequence.
///
/// `open` runs in registration order before the first attempt; returning
/// `false` vetoes the whole sequence. `on_error` and `close` run in reverse
/// order.
pub trait RetryListener: Send + Sync {
    fn open(&self, _context: &RetryContext) -> bool {
        true
    }

    fn on_error(&self, _context: &RetryContext, _error: &BatchError) {}

    /// Called once the template is done with the context, with the last error if any.
    fn close(&self, _context: &RetryContext, _error: Option<&BatchError>) {}
}

/// Fans the hooks out to registered listeners.
#[derive(Default, Clone)]
pub struct CompositeRetryListener {
    listeners: Vec<Arc<dyn RetryListener>>,
}

impl CompositeRetryListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, listener: Arc<dyn RetryListener>) {
        self.listeners.push(listener);
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

impl RetryListener for CompositeRetryListener {
    /// Stops at the first veto; later listeners are not opened.
    fn open(&self, context: &RetryContext) -> bool {
        let vetoed = self.listeners.iter().position(|listener| !listener.open(context));
        if let Some(index) = vetoed {
            debug!("Retry vetoed by listener #{}", index);
            return false;
        }
        true
    }

    fn on_error(&self, context: &RetryContext, error: &BatchError) {
        for listener in self.listeners.iter().rev() {
            listener.on_error(context, error);
        }
    }

    fn close(&self, context: &RetryContext, error: Option<&BatchError>) {
        for listener in self.listeners.iter().rev() {
            listener.close(context, error);
        }
    }
}
