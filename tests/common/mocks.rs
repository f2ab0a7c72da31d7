//! Mock versions of the collaborator traits.
use mockall::mock;

use spring_batch_core::{
    BatchError,
    core::{
        item::{ItemWriter, ItemWriterResult},
        retry::{RetryContext, RetryListener},
    },
};

mock! {
    pub Writer {}
    impl ItemWriter<u32> for Writer {
        fn write(&self, items: &[u32]) -> ItemWriterResult;
        fn flush(&self) -> ItemWriterResult;
        fn open(&self) -> ItemWriterResult;
        fn close(&self) -> ItemWriterResult;
    }
}

mock! {
    pub Listener {}
    impl RetryListener for Listener {
        fn open(&self, context: &RetryContext) -> bool;
        fn on_error(&self, context: &RetryContext, error: &BatchError);
    }
}
