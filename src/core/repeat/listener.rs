use std::sync::Arc;

use crate::{core::exit_status::ExitStatus, error::BatchError};

use super::context::RepeatContext;

/// Hooks around a repeat loop and its iterations.
///
/// Listeners are notified in registration order for [`RepeatListener::open`]
/// and [`RepeatListener::before`], and in reverse order for
/// [`RepeatListener::after`], [`RepeatListener::on_error`] and
/// [`RepeatListener::close`].
pub trait RepeatListener: Send + Sync {
    /// Called once when the loop starts.
    fn open(&self, _context: &RepeatContext) {}

    /// Called before each iteration.
    fn before(&self, _context: &RepeatContext) {}

    /// Called after each successful iteration.
    fn after(&self, _context: &RepeatContext, _result: &ExitStatus) {}

    /// Called when an iteration fails, before the exception handler sees the error.
    fn on_error(&self, _context: &RepeatContext, _error: &BatchError) {}

    /// Called once when the loop ends, whether it succeeded or not.
    fn close(&self, _context: &RepeatContext) {}
}

/// Ordered list of listeners with forward and reverse notification.
#[derive(Clone, Default)]
pub struct CompositeRepeatListener {
    listeners: Vec<Arc<dyn RepeatListener>>,
}

impl CompositeRepeatListener {
    pub fn register(&mut self, listener: Arc<dyn RepeatListener>) {
        self.listeners.push(listener);
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    fn forward(&self) -> impl Iterator<Item = &Arc<dyn RepeatListener>> {
        self.listeners.iter()
    }

    fn reverse(&self) -> impl Iterator<Item = &Arc<dyn RepeatListener>> {
        self.listeners.iter().rev()
    }
}

impl RepeatListener for CompositeRepeatListener {
    fn open(&self, context: &RepeatContext) {
        self.forward().for_each(|listener| listener.open(context));
    }

    fn before(&self, context: &RepeatContext) {
        self.forward().for_each(|listener| listener.before(context));
    }

    fn after(&self, context: &RepeatContext, result: &ExitStatus) {
        self.reverse()
            .for_each(|listener| listener.after(context, result));
    }

    fn on_error(&self, context: &RepeatContext, error: &BatchError) {
        self.reverse()
            .for_each(|listener| listener.on_error(context, error));
    }

    fn close(&self, context: &RepeatContext) {
        self.reverse().for_each(|listener| listener.close(context));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct Recording {
        name: &'static str,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl RepeatListener for Recording {
        fn open(&self, _context: &RepeatContext) {
            self.calls.lock().unwrap().push(format!("open:{}", self.name));
        }

        fn after(&self, _context: &RepeatContext, _result: &ExitStatus) {
            self.calls.lock().unwrap().push(format!("after:{}", self.name));
        }

        fn close(&self, _context: &RepeatContext) {
            self.calls.lock().unwrap().push(format!("close:{}", self.name));
        }
    }

    #[test]
    fn open_forward_after_and_close_reverse() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut composite = CompositeRepeatListener::default();
        for name in ["first", "second"] {
            composite.register(Arc::new(Recording {
                name,
                calls: Arc::clone(&calls),
            }));
        }

        let context = RepeatContext::default();
        composite.open(&context);
        composite.after(&context, &ExitStatus::CONTINUABLE);
        composite.close(&context);

        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                "open:first",
                "open:second",
                "after:second",
                "after:first",
                "close:second",
                "close:first"
            ]
        );
    }
}
