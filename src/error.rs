use std::{
    fmt,
    hash::{Hash, Hasher},
};

use thiserror::Error;

/// A node in the tree of failure categories.
///
/// Every [`BatchError`] carries a failure type. Classifiers, retry policies and
/// exception handlers reason about these types rather than about the concrete
/// error value: a rule registered for a type applies to every type below it in
/// the tree, unless a more specific rule exists.
///
/// Applications declare their own categories as statics parented anywhere in
/// the tree:
///
/// ```
/// use spring_batch_core::error::{BatchError, FailureType, INVALID};
///
/// static DUPLICATE_KEY: FailureType = FailureType::new("DuplicateKey", &INVALID);
///
/// let error = BatchError::failure(&DUPLICATE_KEY, "key 42 already exists");
/// assert!(error.failure_type().is_a(&INVALID));
/// ```
pub struct FailureType {
    name: &'static str,
    parent: Option<&'static FailureType>,
}

impl FailureType {
    /// Creates a failure type below `parent`.
    pub const fn new(name: &'static str, parent: &'static FailureType) -> Self {
        Self {
            name,
            parent: Some(parent),
        }
    }

    /// Creates a root failure type.
    pub const fn root(name: &'static str) -> Self {
        Self { name, parent: None }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn parent(&self) -> Option<&'static FailureType> {
        self.parent
    }

    /// Iterates over this type and then its ancestors, nearest first.
    pub fn lineage(&'static self) -> impl Iterator<Item = &'static FailureType> {
        std::iter::successors(Some(self), |current| current.parent)
    }

    /// Returns `true` if this type is `other` or one of its descendants.
    pub fn is_a(&self, other: &FailureType) -> bool {
        let mut current = Some(self);
        while let Some(failure_type) = current {
            if failure_type == other {
                return true;
            }
            current = failure_type.parent;
        }
        false
    }
}

// Types are compared by identity: two statics sharing a name are distinct.
impl PartialEq for FailureType {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

impl Eq for FailureType {}

impl Hash for FailureType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(self, state);
    }
}

impl fmt::Debug for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Root of every failure.
pub static FAILURE: FailureType = FailureType::root("Failure");
/// Unrecoverable faults. Never counted and never retried by the default policies.
pub static FATAL: FailureType = FailureType::new("Fatal", &FAILURE);
/// Failures an application may reasonably absorb or retry.
pub static RECOVERABLE: FailureType = FailureType::new("Recoverable", &FAILURE);
pub static IO: FailureType = FailureType::new("Io", &RECOVERABLE);
pub static INTERRUPTED: FailureType = FailureType::new("Interrupted", &RECOVERABLE);
pub static INVALID: FailureType = FailureType::new("Invalid", &RECOVERABLE);
pub static INVALID_STATE: FailureType = FailureType::new("InvalidState", &INVALID);
pub static INVALID_ARGUMENT: FailureType = FailureType::new("InvalidArgument", &INVALID);
pub static ITEM_READ: FailureType = FailureType::new("ItemRead", &RECOVERABLE);
pub static ITEM_PROCESS: FailureType = FailureType::new("ItemProcess", &RECOVERABLE);
pub static ITEM_WRITE: FailureType = FailureType::new("ItemWrite", &RECOVERABLE);
pub static RETRY: FailureType = FailureType::new("Retry", &RECOVERABLE);
pub static RETRY_EXHAUSTED: FailureType = FailureType::new("RetryExhausted", &RETRY);
pub static RETRY_TERMINATED: FailureType = FailureType::new("RetryTerminated", &RETRY);
pub static RETRY_CACHE_CAPACITY_EXCEEDED: FailureType =
    FailureType::new("RetryCacheCapacityExceeded", &RETRY);

#[derive(Error, Debug, Clone)]
/// Batch error
pub enum BatchError {
    #[error("ItemWriter from: {0}")]
    ItemWriter(String),

    #[error("ItemReader from: {0}")]
    ItemReader(String),

    #[error("ItemProcessor from: {0}")]
    ItemProcessor(String),

    #[error("Step {0} failed")]
    Step(String),

    #[error("{kind}: {message}")]
    Failure {
        kind: &'static FailureType,
        message: String,
    },

    /// Retry budget spent and no recovery path available.
    #[error("Retry exhausted after {attempts} attempt(s): {source}")]
    RetryExhausted {
        attempts: usize,
        #[source]
        source: Box<BatchError>,
    },

    /// A retry listener vetoed the retry sequence before the first attempt.
    #[error("Retry terminated: {0}")]
    RetryTerminated(String),

    #[error("Back off interrupted: {0}")]
    BackOffInterrupted(String),

    #[error("Retry context cache capacity of {0} exceeded")]
    RetryCacheCapacityExceeded(usize),

    #[error("Configuration: {0}")]
    Configuration(String),

    #[error("Task executor: {0}")]
    Executor(String),
}

impl BatchError {
    /// Creates a failure of the given type.
    pub fn failure(kind: &'static FailureType, message: impl Into<String>) -> Self {
        BatchError::Failure {
            kind,
            message: message.into(),
        }
    }

    /// Creates an unrecoverable failure.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::failure(&FATAL, message)
    }

    /// The category this error belongs to.
    pub fn failure_type(&self) -> &'static FailureType {
        match self {
            BatchError::ItemWriter(_) => &ITEM_WRITE,
            BatchError::ItemReader(_) => &ITEM_READ,
            BatchError::ItemProcessor(_) => &ITEM_PROCESS,
            BatchError::Step(_) => &RECOVERABLE,
            BatchError::Failure { kind, .. } => kind,
            BatchError::RetryExhausted { .. } => &RETRY_EXHAUSTED,
            BatchError::RetryTerminated(_) => &RETRY_TERMINATED,
            BatchError::BackOffInterrupted(_) => &INTERRUPTED,
            BatchError::RetryCacheCapacityExceeded(_) => &RETRY_CACHE_CAPACITY_EXCEEDED,
            BatchError::Configuration(_) => &INVALID_ARGUMENT,
            BatchError::Executor(_) => &FATAL,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.failure_type().is_a(&FATAL)
    }
}
