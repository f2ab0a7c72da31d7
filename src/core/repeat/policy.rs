//! Completion policies decide when a repeat loop stops.
//!
//! A policy creates the loop's [`RepeatContext`] in [`CompletionPolicy::start`],
//! is told about each finished iteration through [`CompletionPolicy::update`]
//! and is asked before and after each iteration whether the loop is complete.
//! The `is_complete*` methods never mutate the context.

use std::{sync::Arc, time::Duration};

use log::debug;

use super::context::RepeatContext;
use crate::core::exit_status::ExitStatus;

/// Default number of iterations for [`SimpleCompletionPolicy`].
pub const DEFAULT_CHUNK_SIZE: usize = 5;

/// Default timeout for [`TimeoutTerminationPolicy`].
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub trait CompletionPolicy: Send + Sync {
    /// Creates the context for a new loop, nested under `parent` if given.
    fn start(&self, parent: Option<&Arc<RepeatContext>>) -> Arc<RepeatContext> {
        Arc::new(RepeatContext::new(parent.cloned()))
    }

    /// Checks completion before an iteration, without a result.
    fn is_complete(&self, context: &RepeatContext) -> bool;

    /// Checks completion after an iteration that produced `result`.
    fn is_complete_with(&self, context: &RepeatContext, result: &ExitStatus) -> bool {
        !result.is_continuable() || self.is_complete(context)
    }

    /// Checks completion before submitting another iteration while `pending`
    /// iterations are still running and will each call `update`.
    fn is_complete_with_pending(&self, context: &RepeatContext, _pending: usize) -> bool {
        self.is_complete(context)
    }

    /// Records one more finished iteration.
    fn update(&self, context: &RepeatContext) {
        context.increment();
    }
}

/// Runs until an iteration returns a non-continuable result.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultResultCompletionPolicy;

impl CompletionPolicy for DefaultResultCompletionPolicy {
    fn is_complete(&self, _context: &RepeatContext) -> bool {
        false
    }

    fn is_complete_with(&self, _context: &RepeatContext, result: &ExitStatus) -> bool {
        !result.is_continuable()
    }
}

/// Completes after a fixed number of iterations.
#[derive(Debug, Clone, Copy)]
pub struct SimpleCompletionPolicy {
    chunk_size: usize,
}

impl SimpleCompletionPolicy {
    pub fn new(chunk_size: usize) -> Self {
        Self { chunk_size }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

impl Default for SimpleCompletionPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl CompletionPolicy for SimpleCompletionPolicy {
    fn is_complete(&self, context: &RepeatContext) -> bool {
        context.started_count() >= self.chunk_size
    }

    fn is_complete_with_pending(&self, context: &RepeatContext, pending: usize) -> bool {
        context.started_count() + pending >= self.chunk_size
    }
}

/// Completes once the loop has been running for longer than a timeout.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutTerminationPolicy {
    timeout: Duration,
}

impl TimeoutTerminationPolicy {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TimeoutTerminationPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl CompletionPolicy for TimeoutTerminationPolicy {
    fn is_complete(&self, context: &RepeatContext) -> bool {
        context.elapsed() > self.timeout
    }
}

/// Completes once a counter kept by the caller reaches a maximum.
///
/// The counter is read from the context attribute `counter_name`, or from the
/// parent context's attribute when `use_parent` is set, so a limit can span
/// several sibling loops.
#[derive(Debug, Clone)]
pub struct CountingCompletionPolicy {
    counter_name: String,
    max_count: u64,
    use_parent: bool,
}

impl CountingCompletionPolicy {
    pub fn new(counter_name: impl Into<String>, max_count: u64) -> Self {
        Self {
            counter_name: counter_name.into(),
            max_count,
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
}

impl CompletionPolicy for CountingCompletionPolicy {
    fn is_complete(&self, context: &RepeatContext) -> bool {
        self.counting_context(context).counter(&self.counter_name) >= self.max_count
    }
}

struct CompositeState {
    contexts: Vec<Arc<RepeatContext>>,
}

/// Completes as soon as any of its policies is complete.
#[derive(Clone, Default)]
pub struct CompositeCompletionPolicy {
    policies: Vec<Arc<dyn CompletionPolicy>>,
}

impl CompositeCompletionPolicy {
    pub fn new(policies: Vec<Arc<dyn CompletionPolicy>>) -> Self {
        Self { policies }
    }

    pub fn add(mut self, policy: impl CompletionPolicy + 'static) -> Self {
        self.policies.push(Arc::new(policy));
        self
    }

    fn for_each_pair<F>(&self, context: &RepeatContext, mut f: F) -> bool
    where
        F: FnMut(&dyn CompletionPolicy, &RepeatContext) -> bool,
    {
        let Some(state) = context.policy_state::<CompositeState>() else {
            debug!("Composite completion policy used with a foreign context");
            return false;
        };
        self.policies
            .iter()
            .zip(&state.contexts)
            .any(|(policy, child)| f(policy.as_ref(), child))
    }
}

impl CompletionPolicy for CompositeCompletionPolicy {
    fn start(&self, parent: Option<&Arc<RepeatContext>>) -> Arc<RepeatContext> {
        let contexts = self
            .policies
            .iter()
            .map(|policy| policy.start(parent))
            .collect();
        Arc::new(RepeatContext::with_policy_state(
            parent.cloned(),
            CompositeState { contexts },
        ))
    }

    fn is_complete(&self, context: &RepeatContext) -> bool {
        self.for_each_pair(context, |policy, child| policy.is_complete(child))
    }

    fn is_complete_with(&self, context: &RepeatContext, result: &ExitStatus) -> bool {
        self.for_each_pair(context, |policy, child| {
            policy.is_complete_with(child, result)
        })
    }

    fn is_complete_with_pending(&self, context: &RepeatContext, pending: usize) -> bool {
        self.for_each_pair(context, |policy, child| {
            policy.is_complete_with_pending(child, pending)
        })
    }

    fn update(&self, context: &RepeatContext) {
        context.increment();
        self.for_each_pair(context, |policy, child| {
            policy.update(child);
            false
        });
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn update_times(policy: &dyn CompletionPolicy, context: &RepeatContext, times: usize) {
        for _ in 0..times {
            policy.update(context);
        }
    }

    #[test]
    fn policies_are_incomplete_after_start() {
        let policies: Vec<Box<dyn CompletionPolicy>> = vec![
            Box::new(DefaultResultCompletionPolicy),
            Box::new(SimpleCompletionPolicy::default()),
            Box::new(TimeoutTerminationPolicy::default()),
            Box::new(CompositeCompletionPolicy::default().add(SimpleCompletionPolicy::new(2))),
        ];
        for policy in policies {
            let context = policy.start(None);
            assert!(!policy.is_complete(&context));
            assert!(!policy.is_complete_with(&context, &ExitStatus::CONTINUABLE));
        }
    }

    #[test]
    fn default_policy_completes_on_terminal_result() {
        let policy = DefaultResultCompletionPolicy;
        let context = policy.start(None);
        assert!(policy.is_complete_with(&context, &ExitStatus::FINISHED));
        update_times(&policy, &context, 100);
        assert!(!policy.is_complete(&context));
    }

    #[test]
    fn simple_policy_requires_exactly_n_updates() {
        for chunk_size in [1, 2, DEFAULT_CHUNK_SIZE] {
            let policy = SimpleCompletionPolicy::new(chunk_size);
            let context = policy.start(None);
            update_times(&policy, &context, chunk_size - 1);
            assert!(!policy.is_complete(&context), "chunk size {chunk_size}");
            policy.update(&context);
            assert!(policy.is_complete(&context), "chunk size {chunk_size}");
        }
    }

    #[test]
    fn simple_policy_completes_on_terminal_result() {
        let policy = SimpleCompletionPolicy::new(10);
        let context = policy.start(None);
        policy.update(&context);
        assert!(policy.is_complete_with(&context, &ExitStatus::FINISHED));
        assert!(!policy.is_complete_with(&context, &ExitStatus::CONTINUABLE));
    }

    #[test]
    fn simple_policy_counts_pending_iterations() {
        let policy = SimpleCompletionPolicy::new(3);
        let context = policy.start(None);
        assert!(!policy.is_complete_with_pending(&context, 2));
        assert!(policy.is_complete_with_pending(&context, 3));

        policy.update(&context);
        assert!(policy.is_complete_with_pending(&context, 2));
        assert!(!policy.is_complete(&context));
    }

    #[test]
    fn composite_forwards_pending_iterations() {
        let policy = CompositeCompletionPolicy::default()
            .add(DefaultResultCompletionPolicy)
            .add(SimpleCompletionPolicy::new(2));
        let context = policy.start(None);
        assert!(!policy.is_complete_with_pending(&context, 1));
        assert!(policy.is_complete_with_pending(&context, 2));
    }

    #[test]
    fn timeout_policy_completes_after_timeout() {
        let policy = TimeoutTerminationPolicy::new(Duration::from_millis(20));
        let context = policy.start(None);
        update_times(&policy, &context, 50);
        assert!(!policy.is_complete(&context));

        thread::sleep(Duration::from_millis(40));
        assert!(policy.is_complete(&context));
    }

    #[test]
    fn timeout_policy_completes_on_terminal_result() {
        let policy = TimeoutTerminationPolicy::default();
        let context = policy.start(None);
        assert!(policy.is_complete_with(&context, &ExitStatus::NOOP));
    }

    #[test]
    fn composite_with_no_policy_never_completes() {
        let policy = CompositeCompletionPolicy::default();
        let context = policy.start(None);
        update_times(&policy, &context, 10);
        assert!(!policy.is_complete(&context));
        assert_eq!(context.started_count(), 10);
    }

    #[test]
    fn composite_completes_when_any_policy_completes() {
        let policy = CompositeCompletionPolicy::default()
            .add(SimpleCompletionPolicy::new(2))
            .add(SimpleCompletionPolicy::new(4));
        let context = policy.start(None);

        policy.update(&context);
        assert!(!policy.is_complete(&context));

        policy.update(&context);
        assert!(policy.is_complete(&context));
        assert_eq!(context.started_count(), 2);
    }

    #[test]
    fn composite_completes_when_all_policies_complete() {
        let policy = CompositeCompletionPolicy::default()
            .add(SimpleCompletionPolicy::new(1))
            .add(SimpleCompletionPolicy::new(1));
        let context = policy.start(None);
        policy.update(&context);
        assert!(policy.is_complete(&context));
    }

    #[test]
    fn composite_propagates_terminal_result() {
        let policy = CompositeCompletionPolicy::default().add(SimpleCompletionPolicy::new(3));
        let context = policy.start(None);
        assert!(policy.is_complete_with(&context, &ExitStatus::FINISHED));
    }

    #[test]
    fn counting_policy_can_read_parent_counter() {
        let parent = Arc::new(RepeatContext::default());
        let policy = CountingCompletionPolicy::new("items", 3).use_parent(true);
        let context = policy.start(Some(&parent));

        parent.increment_counter("items", 2);
        assert!(!policy.is_complete(&context));
        parent.increment_counter("items", 1);
        assert!(policy.is_complete(&context));

        let local = CountingCompletionPolicy::new("items", 3).start(Some(&parent));
        assert!(!CountingCompletionPolicy::new("items", 3).is_complete(&local));
    }
}
