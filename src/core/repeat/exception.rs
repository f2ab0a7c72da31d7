//! Exception handlers decide whether a failed iteration aborts its loop.
//!
//! The repeat template passes every error raised by a callback to its
//! [`ExceptionHandler`]. Returning `Ok(())` absorbs the error and the loop
//! continues; returning `Err` aborts the loop with that error.

use std::{collections::HashMap, sync::Arc};

use log::{debug, error, info, warn};

use super::context::RepeatContext;
use crate::{
    core::classify::{Classifier, SubclassClassifier},
    error::{BatchError, FATAL, FailureType, RECOVERABLE},
};

pub trait ExceptionHandler: Send + Sync {
    fn handle_exception(&self, context: &RepeatContext, error: BatchError)
    -> Result<(), BatchError>;
}

/// Rethrows every error.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultExceptionHandler;

impl ExceptionHandler for DefaultExceptionHandler {
    fn handle_exception(
        &self,
        _context: &RepeatContext,
        error: BatchError,
    ) -> Result<(), BatchError> {
        Err(error)
    }
}

const COUNTER_KEY_PREFIX: &str = "RethrowOnThresholdExceptionHandler.";

/// Counts errors per label and rethrows once a label's threshold is exceeded.
///
/// A label with threshold `n` absorbs `n` errors; the next one is rethrown.
/// Labels without a configured threshold use zero, so they are always
/// rethrown. With `use_parent`, counters live in the parent context and are
/// shared by every sibling loop under it.
pub struct RethrowOnThresholdExceptionHandler {
    classifier: SubclassClassifier<String>,
    thresholds: HashMap<String, usize>,
    use_parent: bool,
}

impl RethrowOnThresholdExceptionHandler {
    pub fn new(classifier: SubclassClassifier<String>, thresholds: HashMap<String, usize>) -> Self {
        Self {
            classifier,
            thresholds,
            use_parent: false,
        }
    }

    pub fn use_parent(mut self, use_parent: bool) -> Self {
        self.use_parent = use_parent;
        self
    }

    fn counting_context<'a>(&self, context: &'a RepeatContext) -> &'a RepeatContext {
        match context.parent() {
            Some(parent) if self.use_parent => parent,
            _ => context,
        }
    }

    /// Number of errors counted so far for `label`.
    pub fn count(&self, context: &RepeatContext, label: &str) -> u64 {
        self.counting_context(context)
            .counter(&format!("{COUNTER_KEY_PREFIX}{label}"))
    }
}

impl ExceptionHandler for RethrowOnThresholdExceptionHandler {
    fn handle_exception(
        &self,
        context: &RepeatContext,
        error: BatchError,
    ) -> Result<(), BatchError> {
        let label = self.classifier.classify(Some(&error));
        let threshold = self.thresholds.get(&label).copied().unwrap_or(0);

        let count = self
            .counting_context(context)
            .increment_counter(&format!("{COUNTER_KEY_PREFIX}{label}"), 1);

        if count > threshold as u64 {
            error!(
                "Exception threshold of {} exceeded for {}: {}",
                threshold, label, error
            );
            return Err(error);
        }

        warn!(
            "Absorbed error {}/{} for {}: {}",
            count, threshold, label, error
        );
        Ok(())
    }
}

const FATAL_LABEL: &str = "fatal";
const COUNTED_LABEL: &str = "counted";
const OTHER_LABEL: &str = "other";

/// Tolerates up to `limit` errors of the counted types.
///
/// Fatal types are always rethrown, counted types (by default every
/// recoverable failure) go against the limit, anything else is rethrown too.
pub struct SimpleLimitExceptionHandler {
    delegate: RethrowOnThresholdExceptionHandler,
}

impl SimpleLimitExceptionHandler {
    pub fn new(limit: usize) -> Self {
        SimpleLimitExceptionHandlerBuilder::new().limit(limit).build()
    }

    pub fn builder() -> SimpleLimitExceptionHandlerBuilder {
        SimpleLimitExceptionHandlerBuilder::new()
    }

    /// Errors counted so far against the limit.
    pub fn count(&self, context: &RepeatContext) -> u64 {
        self.delegate.count(context, COUNTED_LABEL)
    }
}

impl ExceptionHandler for SimpleLimitExceptionHandler {
    fn handle_exception(
        &self,
        context: &RepeatContext,
        error: BatchError,
    ) -> Result<(), BatchError> {
        self.delegate.handle_exception(context, error)
    }
}

pub struct SimpleLimitExceptionHandlerBuilder {
    limit: usize,
    exception_types: Vec<&'static FailureType>,
    fatal_types: Vec<&'static FailureType>,
    use_parent: bool,
}

impl SimpleLimitExceptionHandlerBuilder {
    pub fn new() -> Self {
        Self {
            limit: 0,
            exception_types: vec![&RECOVERABLE],
            fatal_types: vec![&FATAL],
            use_parent: false,
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn exception_types(mut self, exception_types: Vec<&'static FailureType>) -> Self {
        self.exception_types = exception_types;
        self
    }

    pub fn fatal_types(mut self, fatal_types: Vec<&'static FailureType>) -> Self {
        self.fatal_types = fatal_types;
        self
    }

    /// Counts errors in the parent context so the limit spans sibling loops.
    pub fn use_parent(mut self, use_parent: bool) -> Self {
        self.use_parent = use_parent;
        self
    }

    pub fn build(self) -> SimpleLimitExceptionHandler {
        let classifier = self
            .exception_types
            .into_iter()
            .fold(SubclassClassifier::new(OTHER_LABEL.to_string()), |c, t| {
                c.add(t, COUNTED_LABEL.to_string())
            });
        let classifier = self
            .fatal_types
            .into_iter()
            .fold(classifier, |c, t| c.add(t, FATAL_LABEL.to_string()));

        let thresholds = HashMap::from([
            (COUNTED_LABEL.to_string(), self.limit),
            (FATAL_LABEL.to_string(), 0),
            (OTHER_LABEL.to_string(), 0),
        ]);

        SimpleLimitExceptionHandler {
            delegate: RethrowOnThresholdExceptionHandler::new(classifier, thresholds)
                .use_parent(self.use_parent),
        }
    }
}

impl Default for SimpleLimitExceptionHandlerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// What [`LogOrRethrowExceptionHandler`] does with an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    Rethrow,
    LogDebug,
    LogInfo,
    LogWarn,
    LogError,
    Ignore,
}

/// Logs or rethrows depending on the error's classification.
///
/// By default every error is rethrown.
pub struct LogOrRethrowExceptionHandler {
    classifier: SubclassClassifier<ErrorAction>,
}

impl LogOrRethrowExceptionHandler {
    pub fn new(classifier: SubclassClassifier<ErrorAction>) -> Self {
        Self { classifier }
    }
}

impl Default for LogOrRethrowExceptionHandler {
    fn default() -> Self {
        Self::new(SubclassClassifier::new(ErrorAction::Rethrow))
    }
}

impl ExceptionHandler for LogOrRethrowExceptionHandler {
    fn handle_exception(
        &self,
        _context: &RepeatContext,
        error: BatchError,
    ) -> Result<(), BatchError> {
        match self.classifier.classify(Some(&error)) {
            ErrorAction::Rethrow => return Err(error),
            ErrorAction::LogDebug => debug!("Iteration failed: {}", error),
            ErrorAction::LogInfo => info!("Iteration failed: {}", error),
            ErrorAction::LogWarn => warn!("Iteration failed: {}", error),
            ErrorAction::LogError => error!("Iteration failed: {}", error),
            ErrorAction::Ignore => {}
        }
        Ok(())
    }
}

/// Runs handlers in order; the first one to rethrow wins.
#[derive(Clone, Default)]
pub struct CompositeExceptionHandler {
    handlers: Vec<Arc<dyn ExceptionHandler>>,
}

impl CompositeExceptionHandler {
    pub fn new(handlers: Vec<Arc<dyn ExceptionHandler>>) -> Self {
        Self { handlers }
    }
}

impl ExceptionHandler for CompositeExceptionHandler {
    fn handle_exception(
        &self,
        context: &RepeatContext,
        error: BatchError,
    ) -> Result<(), BatchError> {
        for handler in &self.handlers {
            handler.handle_exception(context, error.clone())?;
        }
        Ok(())
    }
}
