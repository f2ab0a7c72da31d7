//! Mapping of failures to policy labels.
//!
//! Exception handlers and retry policies don't look at concrete errors, they
//! look at a *label* obtained by classifying the error's [`FailureType`]. The
//! [`SubclassClassifier`] resolves a label by exact type first, then by the
//! nearest registered ancestor, then falls back to a default.

use std::collections::HashMap;

use dashmap::DashMap;
use log::debug;

use crate::error::{BatchError, FATAL, FailureType};

/// Anything that can be placed in the failure type tree.
pub trait Classifiable {
    fn failure_type(&self) -> &'static FailureType;
}

impl Classifiable for BatchError {
    fn failure_type(&self) -> &'static FailureType {
        BatchError::failure_type(self)
    }
}

impl Classifiable for &'static FailureType {
    fn failure_type(&self) -> &'static FailureType {
        self
    }
}

/// Maps a classifiable value to a label.
///
/// Classifying `None` always yields the classifier's default label.
pub trait Classifier<C: ?Sized, T> {
    fn classify(&self, classifiable: Option<&C>) -> T;
}

/// Classifier resolving labels through the failure type tree.
///
/// Once an ancestor match is found for a concrete type, the result is stored
/// under that type so later lookups are a single map access. The map is a
/// [`DashMap`], so classification is safe from worker threads.
///
/// # Examples
///
/// ```
/// use spring_batch_core::core::classify::{Classifier, SubclassClassifier};
/// use spring_batch_core::error::{BatchError, INVALID, INVALID_STATE, RECOVERABLE};
///
/// let classifier = SubclassClassifier::new("default").add(&INVALID, "bucket");
///
/// let error = BatchError::failure(&INVALID_STATE, "closed");
/// assert_eq!(classifier.classify(Some(&error)), "bucket");
///
/// let other = BatchError::failure(&RECOVERABLE, "other");
/// assert_eq!(classifier.classify(Some(&other)), "default");
/// assert_eq!(classifier.classify(None::<&BatchError>), "default");
/// ```
#[derive(Debug)]
pub struct SubclassClassifier<T> {
    type_map: DashMap<&'static FailureType, T>,
    default_value: T,
}

impl<T: Clone> SubclassClassifier<T> {
    pub fn new(default_value: T) -> Self {
        Self {
            type_map: DashMap::new(),
            default_value,
        }
    }

    pub fn with_type_map(type_map: HashMap<&'static FailureType, T>, default_value: T) -> Self {
        Self {
            type_map: type_map.into_iter().collect(),
            default_value,
        }
    }

    /// Registers a label for a type and all of its descendants.
    pub fn add(self, failure_type: &'static FailureType, value: T) -> Self {
        self.type_map.insert(failure_type, value);
        self
    }

    pub fn default_value(&self) -> &T {
        &self.default_value
    }

    /// Resolves the label for a failure type.
    pub fn classify_type(&self, failure_type: &'static FailureType) -> T {
        if let Some(value) = self.type_map.get(failure_type) {
            return value.clone();
        }

        let inherited = failure_type
            .lineage()
            .skip(1)
            .find_map(|ancestor| self.type_map.get(ancestor).map(|value| value.clone()));

        match inherited {
            Some(value) => {
                debug!("Memoizing classification of {}", failure_type);
                self.type_map
                    .entry(failure_type)
                    .or_insert(value)
                    .value()
                    .clone()
            }
            None => self.default_value.clone(),
        }
    }
}

impl<C, T> Classifier<C, T> for SubclassClassifier<T>
where
    C: Classifiable + ?Sized,
    T: Clone,
{
    fn classify(&self, classifiable: Option<&C>) -> T {
        match classifiable {
            Some(classifiable) => self.classify_type(classifiable.failure_type()),
            None => self.default_value.clone(),
        }
    }
}

/// Yes/no classifier over failure types.
///
/// Types registered with [`BinaryExceptionClassifier::new`] classify to
/// `!default_value`; everything else to `default_value`.
#[derive(Debug)]
pub struct BinaryExceptionClassifier {
    delegate: SubclassClassifier<bool>,
}

impl BinaryExceptionClassifier {
    pub fn new(types: &[&'static FailureType], default_value: bool) -> Self {
        let delegate = types.iter().fold(
            SubclassClassifier::new(default_value),
            |classifier, &failure_type| classifier.add(failure_type, !default_value),
        );
        Self { delegate }
    }

    /// Only the listed types (and their descendants) classify as `true`.
    pub fn only(types: &[&'static FailureType]) -> Self {
        Self::new(types, false)
    }

    /// Everything classifies as `true` except the listed types.
    pub fn all_except(types: &[&'static FailureType]) -> Self {
        Self::new(types, true)
    }

    pub fn classify_error(&self, error: &BatchError) -> bool {
        self.classify_type(error.failure_type())
    }

    pub fn classify_type(&self, failure_type: &'static FailureType) -> bool {
        self.delegate.classify_type(failure_type)
    }
}

impl Default for BinaryExceptionClassifier {
    /// Everything is `true` except fatal failures.
    fn default() -> Self {
        Self::all_except(&[&FATAL])
    }
}

impl<C: Classifiable + ?Sized> Classifier<C, bool> for BinaryExceptionClassifier {
    fn classify(&self, classifiable: Option<&C>) -> bool {
        self.delegate.classify(classifiable)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::error::{FAILURE, FATAL, INVALID, INVALID_ARGUMENT, INVALID_STATE, IO, RECOVERABLE};

    static CLOSED_CURSOR: FailureType = FailureType::new("ClosedCursor", &INVALID_STATE);
    static FATAL_IO: FailureType = FailureType::new("Io", &FATAL);

    #[test]
    fn exact_match_wins_over_ancestor() {
        let classifier = SubclassClassifier::new("default")
            .add(&INVALID, "invalid")
            .add(&INVALID_STATE, "state");

        let error = BatchError::failure(&INVALID_STATE, "closed");
        assert_eq!(classifier.classify(Some(&error)), "state");
    }

    #[test]
    fn nearest_ancestor_wins() {
        let classifier = SubclassClassifier::new("default")
            .add(&RECOVERABLE, "recoverable")
            .add(&INVALID_STATE, "state");

        let error = BatchError::failure(&CLOSED_CURSOR, "cursor closed");
        assert_eq!(classifier.classify(Some(&error)), "state");
    }

    #[test]
    fn subclass_of_registered_type_gets_its_label() {
        let classifier = SubclassClassifier::new("default").add(&INVALID, "bucket");

        let error = BatchError::failure(&INVALID_STATE, "closed");
        assert_eq!(classifier.classify(Some(&error)), "bucket");
    }

    #[test]
    fn unrelated_type_gets_default() {
        let classifier = SubclassClassifier::new("default").add(&INVALID, "bucket");

        let error = BatchError::failure(&RECOVERABLE, "unrelated");
        assert_eq!(classifier.classify(Some(&error)), "default");
        assert_eq!(classifier.classify(None::<&BatchError>), "default");
    }

    #[test]
    fn same_name_in_another_branch_is_not_matched() {
        let classifier = SubclassClassifier::new("default").add(&IO, "io");

        assert_eq!(classifier.classify_type(&FATAL_IO), "default");
        assert_eq!(classifier.classify_type(&IO), "io");
        assert_eq!(classifier.classify_type(&FATAL_IO), "default");
    }

    #[test]
    fn ancestor_match_is_memoized() {
        let classifier = SubclassClassifier::new(0).add(&INVALID, 7);
        assert_eq!(classifier.type_map.len(), 1);

        assert_eq!(classifier.classify_type(&INVALID_ARGUMENT), 7);
        assert_eq!(classifier.type_map.len(), 2);
        assert_eq!(*classifier.type_map.get(&INVALID_ARGUMENT).unwrap(), 7);

        assert_eq!(classifier.classify_type(&INVALID_ARGUMENT), 7);
        assert_eq!(classifier.type_map.len(), 2);
    }

    #[test]
    fn unmatched_types_are_not_memoized() {
        let classifier = SubclassClassifier::new(0).add(&INVALID, 7);
        assert_eq!(classifier.classify_type(&IO), 0);
        assert_eq!(classifier.type_map.len(), 1);
    }

    #[test]
    fn classification_is_safe_across_threads() {
        let classifier = Arc::new(SubclassClassifier::new("default").add(&FAILURE, "any"));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let classifier = Arc::clone(&classifier);
                std::thread::spawn(move || classifier.classify_type(&CLOSED_CURSOR))
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), "any");
        }
    }

    #[test]
    fn binary_classifier_defaults_to_non_fatal() {
        let classifier = BinaryExceptionClassifier::default();
        assert!(classifier.classify_error(&BatchError::failure(&IO, "reset")));
        assert!(!classifier.classify_error(&BatchError::fatal("stack overflow")));
    }

    #[test]
    fn binary_classifier_only_listed_types() {
        let classifier = BinaryExceptionClassifier::only(&[&IO]);
        assert!(classifier.classify_error(&BatchError::failure(&IO, "reset")));
        assert!(!classifier.classify_error(&BatchError::ItemReader("bad".to_string())));
    }
}
