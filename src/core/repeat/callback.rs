use std::sync::Arc;

use log::debug;

use super::{RepeatCallback, RepeatResult, context::RepeatContext};
use crate::core::{
    exit_status::ExitStatus,
    item::{ItemReader, ItemWriter},
};

/// Reads one item and writes it, once per iteration.
///
/// A `None` from the reader returns [`ExitStatus::FINISHED`], which asks the
/// completion policy to end the loop.
pub struct ItemReaderRepeatCallback<'a, I> {
    reader: &'a dyn ItemReader<I>,
    writer: &'a dyn ItemWriter<I>,
}

impl<'a, I> ItemReaderRepeatCallback<'a, I> {
    pub fn new(reader: &'a dyn ItemReader<I>, writer: &'a dyn ItemWriter<I>) -> Self {
        Self { reader, writer }
    }
}

impl<I> RepeatCallback for ItemReaderRepeatCallback<'_, I> {
    fn do_in_iteration(&self, _context: &Arc<RepeatContext>) -> RepeatResult {
        match self.reader.read()? {
            Some(item) => {
                self.writer.write(std::slice::from_ref(&item))?;
                Ok(ExitStatus::CONTINUABLE)
            }
            None => {
                debug!("Reader exhausted");
                Ok(ExitStatus::FINISHED)
            }
        }
    }
}
