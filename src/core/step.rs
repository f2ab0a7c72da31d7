use std::{
    cell::{Cell, RefCell},
    sync::Arc,
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
    build_name,
    exit_status::ExitStatus,
    item::{ItemProcessor, ItemReader, ItemWriter},
    repeat::{
        CompletionPolicy, ExceptionHandler, RepeatContext, RepeatResult, RepeatTemplate,
        RepeatTemplateBuilder, SimpleCompletionPolicy, SimpleLimitExceptionHandler,
    },
    retry::{BackOffPolicy, NoBackOffPolicy, RetryTemplate, RetryTemplateBuilder},
    settings::BatchSettings,
};
use crate::error::BatchError;

/// Status of a step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Starting,
    Started,
    Success,
    Failed,
}

/// Outcome and counters of one step run.
#[derive(Debug, Clone)]
pub struct StepExecution {
    /// Unique identifier for this step run
    pub id: Uuid,
    pub name: String,
    pub status: StepStatus,
    pub exit_status: ExitStatus,
    pub start_time: Instant,
    pub end_time: Instant,
    pub duration: Duration,
    /// Number of items successfully read
    pub read_count: usize,
    /// Number of items successfully written
    pub write_count: usize,
    /// Number of chunks written
    pub chunk_count: usize,
    pub read_error_count: usize,
    pub process_error_count: usize,
    /// Number of items in chunks whose write failed after all retries
    pub write_error_count: usize,
}

impl StepExecution {
    pub fn new(name: &str) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            status: StepStatus::Starting,
            exit_status: ExitStatus::UNKNOWN,
            start_time: now,
            end_time: now,
            duration: Duration::ZERO,
            read_count: 0,
            write_count: 0,
            chunk_count: 0,
            read_error_count: 0,
            process_error_count: 0,
            write_error_count: 0,
        }
    }

    /// Errors absorbed or raised over the whole run.
    pub fn error_count(&self) -> usize {
        self.read_error_count + self.process_error_count + self.write_error_count
    }
}

/// A phase of a batch run.
pub trait Step {
    fn get_name(&self) -> &str;

    /// Runs the step, recording its progress in `step_execution`.
    fn execute(&self, step_execution: &mut StepExecution) -> Result<(), BatchError>;

    /// Runs the step with a fresh [`StepExecution`].
    fn run(&self) -> StepExecution {
        let mut step_execution = StepExecution::new(self.get_name());
        if let Err(err) = self.execute(&mut step_execution) {
            error!("Step {} failed: {}", step_execution.name, err);
        }
        step_execution
    }
}

#[derive(Default)]
struct StepCounters {
    read: Cell<usize>,
    write: Cell<usize>,
    chunks: Cell<usize>,
    read_errors: Cell<usize>,
    process_errors: Cell<usize>,
    write_errors: Cell<usize>,
}

impl StepCounters {
    fn add(counter: &Cell<usize>, delta: usize) {
        counter.set(counter.get() + delta);
    }

    fn copy_to(&self, step_execution: &mut StepExecution) {
        step_execution.read_count = self.read.get();
        step_execution.write_count = self.write.get();
        step_execution.chunk_count = self.chunks.get();
        step_execution.read_error_count = self.read_errors.get();
        step_execution.process_error_count = self.process_errors.get();
        step_execution.write_error_count = self.write_errors.get();
    }
}

/// Reads, processes and writes items a chunk at a time.
///
/// The step loop and the chunk loop are both [`RepeatTemplate`]s: the outer
/// one runs until the reader is exhausted, the inner one until the chunk is
/// full. Each chunk is written through a [`RetryTemplate`].
///
/// Read, process and write failures share one [`SimpleLimitExceptionHandler`]
/// whose counters live in the step loop's context, so the skip limit covers
/// the whole run rather than a single chunk.
pub struct ChunkOrientedStep<'a, I, O> {
    name: String,
    reader: &'a dyn ItemReader<I>,
    processor: &'a dyn ItemProcessor<I, O>,
    writer: &'a dyn ItemWriter<O>,
    step_operations: RepeatTemplate,
    chunk_operations: RepeatTemplate,
    write_operations: RetryTemplate,
    counters: StepCounters,
}

impl<I, O> Step for ChunkOrientedStep<'_, I, O> {
    fn get_name(&self) -> &str {
        &self.name
    }

    fn execute(&self, step_execution: &mut StepExecution) -> Result<(), BatchError> {
        info!("Start of step: {}, id: {}", step_execution.name, step_execution.id);
        step_execution.status = StepStatus::Started;
        step_execution.start_time = Instant::now();

        let result = self.writer.open().and_then(|()| {
            self.step_operations
                .iterate(&|step_context: &Arc<RepeatContext>| -> RepeatResult {
                    self.do_chunk(step_context)
                })
        });

        if let Err(err) = self.writer.close() {
            warn!("Non-fatal error closing writer: {}", err);
        }

        self.counters.copy_to(step_execution);
        step_execution.end_time = Instant::now();
        step_execution.duration = step_execution.start_time.elapsed();

        match result {
            Ok(_) => {
                step_execution.status = StepStatus::Success;
                step_execution.exit_status = ExitStatus::FINISHED;
                info!(
                    "End of step: {}, read: {}, written: {}, errors: {}",
                    step_execution.name,
                    step_execution.read_count,
                    step_execution.write_count,
                    step_execution.error_count()
                );
                Ok(())
            }
            Err(err) => {
                step_execution.status = StepStatus::Failed;
                step_execution.exit_status = ExitStatus::FAILED.with_description(err.to_string());
                error!("Step {} failed: {}", step_execution.name, err);
                Err(BatchError::Step(step_execution.name.clone()))
            }
        }
    }
}

impl<I, O> ChunkOrientedStep<'_, I, O> {
    fn do_chunk(&self, step_context: &Arc<RepeatContext>) -> RepeatResult {
        let items = RefCell::new(Vec::new());

        let status = self.chunk_operations.iterate_in(
            step_context,
            &|_: &Arc<RepeatContext>| -> RepeatResult { self.read_and_process(&items) },
        )?;

        let items = items.into_inner();
        if !items.is_empty() {
            self.write_chunk(&items)?;
        }
        Ok(status)
    }

    fn read_and_process(&self, items: &RefCell<Vec<O>>) -> RepeatResult {
        let item = match self.reader.read() {
            Ok(Some(item)) => item,
            Ok(None) => {
                debug!("Reader exhausted");
                return Ok(ExitStatus::FINISHED);
            }
            Err(err) => {
                StepCounters::add(&self.counters.read_errors, 1);
                return Err(err);
            }
        };
        StepCounters::add(&self.counters.read, 1);

        match self.processor.process(&item) {
            Ok(processed) => {
                items.borrow_mut().push(processed);
                Ok(ExitStatus::CONTINUABLE)
            }
            Err(err) => {
                StepCounters::add(&self.counters.process_errors, 1);
                Err(err)
            }
        }
    }

    fn write_chunk(&self, items: &[O]) -> Result<(), BatchError> {
        debug!("Writing chunk of {} items", items.len());

        let result = self.write_operations.execute(|context| {
            if context.retry_count() > 0 {
                debug!("Retrying write, attempt {}", context.retry_count() + 1);
            }
            self.writer.write(items)?;
            self.writer.flush()
        });

        match result {
            Ok(()) => {
                StepCounters::add(&self.counters.write, items.len());
                StepCounters::add(&self.counters.chunks, 1);
                Ok(())
            }
            Err(err) => {
                StepCounters::add(&self.counters.write_errors, items.len());
                Err(err)
            }
        }
    }
}

/// Builder for [`ChunkOrientedStep`].
///
/// ```
/// use spring_batch_core::core::item::{ItemWriter, ItemWriterResult, ListItemReader, PassThroughProcessor};
/// use spring_batch_core::core::step::{Step, StepBuilder, StepStatus};
///
/// struct StdoutWriter;
///
/// impl ItemWriter<u32> for StdoutWriter {
///     fn write(&self, items: &[u32]) -> ItemWriterResult {
///         println!("{:?}", items);
///         Ok(())
///     }
/// }
///
/// let reader = ListItemReader::new((1..=10).collect());
/// let step = StepBuilder::new()
///     .name("print")
///     .reader(&reader)
///     .processor(&PassThroughProcessor)
///     .writer(&StdoutWriter)
///     .chunk(4)
///     .build()
///     .unwrap();
///
/// let execution = step.run();
/// assert_eq!(execution.status, StepStatus::Success);
/// assert_eq!(execution.chunk_count, 3);
/// ```
pub struct StepBuilder<'a, I, O> {
    name: Option<String>,
    reader: Option<&'a dyn ItemReader<I>>,
    processor: Option<&'a dyn ItemProcessor<I, O>>,
    writer: Option<&'a dyn ItemWriter<O>>,
    chunk_completion_policy: Option<Arc<dyn CompletionPolicy>>,
    chunk_size: usize,
    skip_limit: usize,
    retry_limit: usize,
    back_off_policy: Arc<dyn BackOffPolicy>,
}

impl<'a, I, O> StepBuilder<'a, I, O> {
    pub fn new() -> Self {
        Self {
            name: None,
            reader: None,
            processor: None,
            writer: None,
            chunk_completion_policy: None,
            chunk_size: 1,
            skip_limit: 0,
            retry_limit: 1,
            back_off_policy: Arc::new(NoBackOffPolicy),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn reader(mut self, reader: &'a impl ItemReader<I>) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn processor(mut self, processor: &'a impl ItemProcessor<I, O>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn writer(mut self, writer: &'a impl ItemWriter<O>) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn chunk(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Ends chunks with a custom policy instead of a fixed size.
    pub fn chunk_completion_policy(mut self, policy: Arc<dyn CompletionPolicy>) -> Self {
        self.chunk_completion_policy = Some(policy);
        self
    }

    /// Number of failed items tolerated over the whole step.
    pub fn skip_limit(mut self, skip_limit: usize) -> Self {
        self.skip_limit = skip_limit;
        self
    }

    /// Attempts allowed per chunk write; 1 means no retry.
    pub fn retry_limit(mut self, retry_limit: usize) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn back_off_policy(mut self, policy: Arc<dyn BackOffPolicy>) -> Self {
        self.back_off_policy = policy;
        self
    }

    /// Applies chunk size, chunk timeout, skip limit, retry limit and back off.
    pub fn settings(mut self, settings: &BatchSettings) -> Self {
        self.chunk_size = settings.chunk_size;
        self.chunk_completion_policy = Some(settings.chunk_completion_policy());
        self.skip_limit = settings.skip_limit;
        self.retry_limit = settings.retry_limit;
        self.back_off_policy = settings.back_off.to_policy();
        self
    }

    pub fn build(self) -> Result<ChunkOrientedStep<'a, I, O>, BatchError> {
        let reader = self
            .reader
            .ok_or_else(|| BatchError::Configuration("a step needs a reader".to_string()))?;
        let processor = self
            .processor
            .ok_or_else(|| BatchError::Configuration("a step needs a processor".to_string()))?;
        let writer = self
            .writer
            .ok_or_else(|| BatchError::Configuration("a step needs a writer".to_string()))?;
        if self.chunk_size == 0 {
            return Err(BatchError::Configuration(
                "chunk size must be at least 1".to_string(),
            ));
        }

        let skip_handler: Arc<dyn ExceptionHandler> = Arc::new(
            SimpleLimitExceptionHandler::builder()
                .limit(self.skip_limit)
                .use_parent(true)
                .build(),
        );
        let chunk_completion_policy = self
            .chunk_completion_policy
            .unwrap_or_else(|| Arc::new(SimpleCompletionPolicy::new(self.chunk_size)));

        Ok(ChunkOrientedStep {
            name: self.name.unwrap_or_else(build_name),
            reader,
            processor,
            writer,
            step_operations: RepeatTemplateBuilder::new()
                .shared_exception_handler(Arc::clone(&skip_handler))
                .build(),
            chunk_operations: RepeatTemplateBuilder::new()
                .shared_completion_policy(chunk_completion_policy)
                .shared_exception_handler(skip_handler)
                .build(),
            write_operations: RetryTemplateBuilder::new()
                .max_attempts(self.retry_limit.max(1))
                .shared_back_off_policy(self.back_off_policy)
                .build(),
            counters: StepCounters::default(),
        })
    }
}

impl<I, O> Default for StepBuilder<'_, I, O> {
    fn default() -> Self {
        Self::new()
    }
}
