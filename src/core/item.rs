use std::{cell::RefCell, collections::VecDeque};

use crate::error::BatchError;

/// Represents the result of reading an item from the reader.
///
/// `Ok(None)` means the input is exhausted.
pub type ItemReaderResult<R> = Result<Option<R>, BatchError>;

/// Represents the result of processing an item by the processor.
pub type ItemProcessorResult<W> = Result<W, BatchError>;

/// Represents the result of writing items by the writer.
pub type ItemWriterResult = Result<(), BatchError>;

/// Source of items, read one at a time.
pub trait ItemReader<R> {
    fn read(&self) -> ItemReaderResult<R>;
}

/// Business logic applied to each item between reading and writing.
pub trait ItemProcessor<R, W> {
    fn process(&self, item: &R) -> ItemProcessorResult<W>;
}

/// Destination of items, written a chunk at a time.
pub trait ItemWriter<W> {
    fn write(&self, items: &[W]) -> ItemWriterResult;

    fn flush(&self) -> ItemWriterResult {
        Ok(())
    }

    fn open(&self) -> ItemWriterResult {
        Ok(())
    }

    fn close(&self) -> ItemWriterResult {
        Ok(())
    }
}

/// Processor returning a clone of its input.
#[derive(Default)]
pub struct PassThroughProcessor;

impl<R: Clone> ItemProcessor<R, R> for PassThroughProcessor {
    fn process(&self, item: &R) -> ItemProcessorResult<R> {
        Ok(item.clone())
    }
}

/// Reader handing out the items of an in-memory list, in order.
pub struct ListItemReader<R> {
    items: RefCell<VecDeque<R>>,
}

impl<R> ListItemReader<R> {
    pub fn new(items: Vec<R>) -> Self {
        Self {
            items: RefCell::new(items.into()),
        }
    }

    pub fn remaining(&self) -> usize {
        self.items.borrow().len()
    }
}

impl<R> ItemReader<R> for ListItemReader<R> {
    fn read(&self) -> ItemReaderResult<R> {
        Ok(self.items.borrow_mut().pop_front())
    }
}
