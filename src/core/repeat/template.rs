use std::sync::Arc;

use log::{debug, error};

use super::{
    RepeatCallback, RepeatResult,
    context::RepeatContext,
    exception::{DefaultExceptionHandler, ExceptionHandler},
    listener::{CompositeRepeatListener, RepeatListener},
    policy::{CompletionPolicy, DefaultResultCompletionPolicy, SimpleCompletionPolicy},
};
use crate::core::exit_status::ExitStatus;

/// Runs a callback repeatedly on the calling thread.
///
/// Each call to [`RepeatTemplate::iterate`] starts a fresh context from the
/// completion policy, runs the callback until the policy reports completion
/// and returns the `and` of every iteration's exit status. Errors go through
/// the exception handler: absorbed errors count as an iteration, rethrown
/// errors abort the loop.
///
/// The template holds no per-call state and can be shared between threads.
#[derive(Clone)]
pub struct RepeatTemplate {
    pub(crate) completion_policy: Arc<dyn CompletionPolicy>,
    pub(crate) exception_handler: Arc<dyn ExceptionHandler>,
    pub(crate) listener: CompositeRepeatListener,
}

impl RepeatTemplate {
    /// Runs until the callback returns a terminal status; errors are rethrown.
    pub fn new() -> Self {
        RepeatTemplateBuilder::new().build()
    }

    pub fn iterate(&self, callback: &dyn RepeatCallback) -> RepeatResult {
        self.execute(None, callback)
    }

    /// Runs a loop nested under `parent`.
    pub fn iterate_in(
        &self,
        parent: &Arc<RepeatContext>,
        callback: &dyn RepeatCallback,
    ) -> RepeatResult {
        self.execute(Some(parent), callback)
    }

    fn execute(
        &self,
        parent: Option<&Arc<RepeatContext>>,
        callback: &dyn RepeatCallback,
    ) -> RepeatResult {
        let context = self.completion_policy.start(parent);
        debug!("Starting repeat loop, nested: {}", parent.is_some());

        self.listener.open(&context);
        let outcome = self.run(&context, callback);
        self.listener.close(&context);
        context.close();

        match &outcome {
            Ok(status) => debug!(
                "Repeat loop ended after {} iteration(s): {}",
                context.started_count(),
                status
            ),
            Err(err) => error!("Repeat loop aborted: {}", err),
        }
        outcome
    }

    fn run(&self, context: &Arc<RepeatContext>, callback: &dyn RepeatCallback) -> RepeatResult {
        let mut result = ExitStatus::CONTINUABLE;

        while !self.is_complete(context) {
            self.listener.before(context);

            match callback.do_in_iteration(context) {
                Ok(status) => {
                    self.completion_policy.update(context);
                    result = result.and(&status);
                    self.listener.after(context, &status);

                    if self.completion_policy.is_complete_with(context, &status) {
                        break;
                    }
                }
                Err(err) => {
                    self.listener.on_error(context, &err);
                    self.exception_handler.handle_exception(context, err)?;
                    self.completion_policy.update(context);
                }
            }
        }

        Ok(result)
    }

    pub(crate) fn is_complete(&self, context: &RepeatContext) -> bool {
        context.is_complete_only() || self.completion_policy.is_complete(context)
    }
}

impl Default for RepeatTemplate {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`RepeatTemplate`].
///
/// ```
/// use spring_batch_core::core::repeat::{RepeatTemplateBuilder, SimpleLimitExceptionHandler};
///
/// let template = RepeatTemplateBuilder::new()
///     .chunk_size(10)
///     .exception_handler(SimpleLimitExceptionHandler::new(2))
///     .build();
/// ```
pub struct RepeatTemplateBuilder {
    completion_policy: Arc<dyn CompletionPolicy>,
    exception_handler: Arc<dyn ExceptionHandler>,
    listener: CompositeRepeatListener,
}

impl RepeatTemplateBuilder {
    pub fn new() -> Self {
        Self {
            completion_policy: Arc::new(DefaultResultCompletionPolicy),
            exception_handler: Arc::new(DefaultExceptionHandler),
            listener: CompositeRepeatListener::default(),
        }
    }

    pub fn completion_policy(mut self, policy: impl CompletionPolicy + 'static) -> Self {
        self.completion_policy = Arc::new(policy);
        self
    }

    pub fn shared_completion_policy(mut self, policy: Arc<dyn CompletionPolicy>) -> Self {
        self.completion_policy = policy;
        self
    }

    /// Shortcut for a [`SimpleCompletionPolicy`] of `chunk_size` iterations.
    pub fn chunk_size(self, chunk_size: usize) -> Self {
        self.completion_policy(SimpleCompletionPolicy::new(chunk_size))
    }

    pub fn exception_handler(mut self, handler: impl ExceptionHandler + 'static) -> Self {
        self.exception_handler = Arc::new(handler);
        self
    }

    /// Uses a handler shared with other templates, e.g. to share counters.
    pub fn shared_exception_handler(mut self, handler: Arc<dyn ExceptionHandler>) -> Self {
        self.exception_handler = handler;
        self
    }

    pub fn listener(mut self, listener: Arc<dyn RepeatListener>) -> Self {
        self.listener.register(listener);
        self
    }

    pub fn build(self) -> RepeatTemplate {
        RepeatTemplate {
            completion_policy: self.completion_policy,
            exception_handler: self.exception_handler,
            listener: self.listener,
        }
    }
}

impl Default for RepeatTemplateBuilder {
    fn default() -> Self {
        Self::new()
    }
}
