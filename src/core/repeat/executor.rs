//! Repeat operations whose iterations run on a worker pool.
//!
//! [`TaskExecutorRepeatTemplate`] submits each iteration to a [`TaskExecutor`]
//! and keeps at most `throttle_limit` iterations in flight. Results come back
//! to the calling thread over a channel in completion order; the completion
//! policy, the exception handler and the listeners are only ever consulted
//! from the calling thread.

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
        mpsc,
    },
    thread,
};

use log::{debug, error, warn};
use tokio::runtime::Handle;

use super::{
    RepeatCallback, RepeatResult, context::RepeatContext, listener::RepeatListener,
    template::RepeatTemplate,
};
use crate::{core::exit_status::ExitStatus, error::BatchError};

/// Default number of iterations allowed in flight at once.
pub const DEFAULT_THROTTLE_LIMIT: usize = 4;

/// A unit of work submitted to a [`TaskExecutor`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs units of work, possibly on other threads.
pub trait TaskExecutor: Send + Sync {
    fn execute(&self, task: Task) -> Result<(), BatchError>;
}

/// Runs every task immediately on the submitting thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyncTaskExecutor;

impl TaskExecutor for SyncTaskExecutor {
    fn execute(&self, task: Task) -> Result<(), BatchError> {
        task();
        Ok(())
    }
}

/// Starts a new named thread per task.
#[derive(Debug)]
pub struct ThreadTaskExecutor {
    name_prefix: String,
    counter: AtomicUsize,
}

impl ThreadTaskExecutor {
    pub fn new(name_prefix: impl Into<String>) -> Self {
        Self {
            name_prefix: name_prefix.into(),
            counter: AtomicUsize::new(0),
        }
    }
}

impl Default for ThreadTaskExecutor {
    fn default() -> Self {
        Self::new("repeat-worker")
    }
}

impl TaskExecutor for ThreadTaskExecutor {
    fn execute(&self, task: Task) -> Result<(), BatchError> {
        let id = self.counter.fetch_add(1, Ordering::Relaxed);
        thread::Builder::new()
            .name(format!("{}-{}", self.name_prefix, id))
            .spawn(task)
            .map(|_| ())
            .map_err(|err| BatchError::Executor(err.to_string()))
    }
}

/// Runs tasks on the blocking thread pool of a tokio runtime.
///
/// [`TaskExecutorRepeatTemplate::iterate`] blocks the calling thread until
/// every iteration has reported back. From async code, call it inside
/// `tokio::task::spawn_blocking` rather than directly on a runtime worker.
#[derive(Debug, Clone)]
pub struct TokioTaskExecutor {
    handle: Handle,
}

impl TokioTaskExecutor {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Uses the runtime the caller is running in.
    pub fn current() -> Result<Self, BatchError> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|err| BatchError::Executor(err.to_string()))
    }
}

impl TaskExecutor for TokioTaskExecutor {
    fn execute(&self, task: Task) -> Result<(), BatchError> {
        // Dropping the join handle detaches the task; its result comes back through the channel.
        drop(self.handle.spawn_blocking(task));
        Ok(())
    }
}

/// A shareable callback for iterations running on other threads.
pub type SharedRepeatCallback = Arc<dyn RepeatCallback + Send + Sync>;

/// Repeat template running iterations concurrently through a [`TaskExecutor`].
///
/// Iterations may complete in any order; exit statuses are combined with
/// [`ExitStatus::and`], which does not depend on that order. Once the policy
/// reports completion or an error is rethrown, no more iterations are
/// submitted and the ones in flight are waited for before the loop closes.
/// Errors rethrown after the first one are logged and dropped.
pub struct TaskExecutorRepeatTemplate {
    template: RepeatTemplate,
    task_executor: Arc<dyn TaskExecutor>,
    throttle_limit: usize,
}

#[derive(Default)]
struct Aggregate {
    status: Option<ExitStatus>,
    error: Option<BatchError>,
    complete: bool,
}

impl TaskExecutorRepeatTemplate {
    /// Uses the policy, exception handler and listeners of `template`.
    pub fn new(template: RepeatTemplate, task_executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            template,
            task_executor,
            throttle_limit: DEFAULT_THROTTLE_LIMIT,
        }
    }

    pub fn throttle_limit(mut self, throttle_limit: usize) -> Self {
        self.throttle_limit = throttle_limit.max(1);
        self
    }

    /// Blocks until the loop completes; must not be called on an async runtime worker.
    pub fn iterate(&self, callback: SharedRepeatCallback) -> RepeatResult {
        self.execute(None, callback)
    }

    pub fn iterate_in(
        &self,
        parent: &Arc<RepeatContext>,
        callback: SharedRepeatCallback,
    ) -> RepeatResult {
        self.execute(Some(parent), callback)
    }

    fn execute(
        &self,
        parent: Option<&Arc<RepeatContext>>,
        callback: SharedRepeatCallback,
    ) -> RepeatResult {
        let context = self.template.completion_policy.start(parent);
        debug!(
            "Starting concurrent repeat loop, throttle limit: {}",
            self.throttle_limit
        );

        self.template.listener.open(&context);
        let outcome = self.run(&context, callback);
        self.template.listener.close(&context);
        context.close();

        if let Err(err) = &outcome {
            error!("Concurrent repeat loop aborted: {}", err);
        }
        outcome
    }

    fn run(&self, context: &Arc<RepeatContext>, callback: SharedRepeatCallback) -> RepeatResult {
        let (sender, receiver) = mpsc::channel::<RepeatResult>();
        let mut aggregate = Aggregate::default();
        let mut in_flight = 0usize;

        loop {
            while let Ok(result) = receiver.try_recv() {
                in_flight -= 1;
                self.handle_result(context, result, &mut aggregate);
            }

            if aggregate.complete
                || context.is_complete_only()
                || self
                    .template
                    .completion_policy
                    .is_complete_with_pending(context, in_flight)
            {
                break;
            }

            if in_flight >= self.throttle_limit {
                match receiver.recv() {
                    Ok(result) => {
                        in_flight -= 1;
                        self.handle_result(context, result, &mut aggregate);
                    }
                    Err(_) => break,
                }
                continue;
            }

            self.template.listener.before(context);

            let task_sender = sender.clone();
            let task_callback = Arc::clone(&callback);
            let task_context = Arc::clone(context);
            let task: Task = Box::new(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    task_callback.do_in_iteration(&task_context)
                }))
                .unwrap_or_else(|payload| Err(BatchError::fatal(panic_message(payload))));
                // The loop only stops listening once every submitted task has reported.
                let _ = task_sender.send(result);
            });

            if let Err(err) = self.task_executor.execute(task) {
                error!("Unable to submit iteration: {}", err);
                aggregate.error.get_or_insert(err);
                break;
            }
            in_flight += 1;
        }

        drop(sender);
        while in_flight > 0 {
            match receiver.recv() {
                Ok(result) => {
                    in_flight -= 1;
                    self.handle_result(context, result, &mut aggregate);
                }
                Err(_) => {
                    warn!("{} iteration(s) never reported back", in_flight);
                    break;
                }
            }
        }

        match aggregate.error {
            Some(err) => Err(err),
            None => Ok(aggregate.status.unwrap_or(ExitStatus::CONTINUABLE)),
        }
    }

    fn handle_result(
        &self,
        context: &Arc<RepeatContext>,
        result: RepeatResult,
        aggregate: &mut Aggregate,
    ) {
        let policy = &self.template.completion_policy;

        match result {
            Ok(status) => {
                policy.update(context);
                aggregate.status = Some(match aggregate.status.take() {
                    Some(current) => current.and(&status),
                    None => ExitStatus::CONTINUABLE.and(&status),
                });
                self.template.listener.after(context, &status);

                if policy.is_complete_with(context, &status) {
                    aggregate.complete = true;
                }
            }
            Err(err) => {
                self.template.listener.on_error(context, &err);
                match self.template.exception_handler.handle_exception(context, err) {
                    Ok(()) => policy.update(context),
                    Err(err) => {
                        aggregate.complete = true;
                        match aggregate.error {
                            Some(_) => warn!("Dropping error after loop abort: {}", err),
                            None => aggregate.error = Some(err),
                        }
                    }
                }
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("iteration panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("iteration panicked: {message}")
    } else {
        "iteration panicked".to_string()
    }
}
