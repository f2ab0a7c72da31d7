//! Pauses between retry attempts.
//!
//! A [`BackOffPolicy`] computes how long to wait; a [`Sleeper`] does the
//! waiting. Swapping the sleeper lets tests observe the pauses without
//! blocking, and lets a coordinator interrupt a pause with
//! [`InterruptibleSleeper::interrupt`].

use std::{
    sync::{Arc, Condvar, Mutex, PoisonError},
    time::Duration,
};

use log::debug;
use rand::distr::{Distribution, Uniform};

use super::context::RetryContext;
use crate::error::BatchError;

/// Waits for a duration.
pub trait Sleeper: Send + Sync {
    /// Returns [`BatchError::BackOffInterrupted`] if the pause was cut short.
    fn sleep(&self, duration: Duration) -> Result<(), BatchError>;
}

/// Blocks the current thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) -> Result<(), BatchError> {
        std::thread::sleep(duration);
        Ok(())
    }
}

/// Sleeper that another thread can wake early.
///
/// An interrupt raised while nobody sleeps is kept and aborts the next pause.
/// Each interrupt is consumed by exactly one pause.
#[derive(Debug, Default)]
pub struct InterruptibleSleeper {
    interrupted: Mutex<bool>,
    wakeup: Condvar,
}

impl InterruptibleSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        *self
            .interrupted
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = true;
        self.wakeup.notify_all();
    }
}

impl Sleeper for InterruptibleSleeper {
    fn sleep(&self, duration: Duration) -> Result<(), BatchError> {
        let guard = self
            .interrupted
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (mut interrupted, _) = self
            .wakeup
            .wait_timeout_while(guard, duration, |interrupted| !*interrupted)
            .unwrap_or_else(PoisonError::into_inner);

        if *interrupted {
            *interrupted = false;
            return Err(BatchError::BackOffInterrupted(format!(
                "interrupted during a pause of {:?}",
                duration
            )));
        }
        Ok(())
    }
}

/// Back-off state of one retry sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackOffContext {
    interval: Duration,
    back_offs: usize,
}

impl BackOffContext {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            back_offs: 0,
        }
    }

    /// The pause the next back off will use.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Number of pauses taken so far.
    pub fn back_offs(&self) -> usize {
        self.back_offs
    }
}

/// Decides how long to pause between two attempts.
pub trait BackOffPolicy: Send + Sync {
    /// Starts the back-off state for a new retry sequence.
    fn start(&self, _context: &RetryContext) -> BackOffContext {
        BackOffContext::default()
    }

    /// Pauses before the next attempt.
    ///
    /// An interrupted pause aborts the retry sequence.
    fn back_off(&self, back_off_context: &mut BackOffContext) -> Result<(), BatchError>;
}

/// Retries immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBackOffPolicy;

impl BackOffPolicy for NoBackOffPolicy {
    fn back_off(&self, back_off_context: &mut BackOffContext) -> Result<(), BatchError> {
        back_off_context.back_offs += 1;
        Ok(())
    }
}

/// Pauses for the same period before every retry.
pub struct FixedBackOffPolicy {
    period: Duration,
    sleeper: Arc<dyn Sleeper>,
}

impl FixedBackOffPolicy {
    pub const DEFAULT_PERIOD: Duration = Duration::from_secs(1);

    pub fn new(period: Duration) -> Self {
        Self {
            period,
            sleeper: Arc::new(ThreadSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

impl Default for FixedBackOffPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_PERIOD)
    }
}

impl BackOffPolicy for FixedBackOffPolicy {
    fn start(&self, _context: &RetryContext) -> BackOffContext {
        BackOffContext::new(self.period)
    }

    fn back_off(&self, back_off_context: &mut BackOffContext) -> Result<(), BatchError> {
        debug!("Fixed back off for {:?}", self.period);
        self.sleeper.sleep(self.period)?;
        back_off_context.back_offs += 1;
        Ok(())
    }
}

/// Pause grows by `multiplier` after each retry, capped at `max_interval`.
pub struct ExponentialBackOffPolicy {
    initial_interval: Duration,
    multiplier: f64,
    max_interval: Duration,
    sleeper: Arc<dyn Sleeper>,
}

impl ExponentialBackOffPolicy {
    pub const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_millis(100);
    pub const DEFAULT_MULTIPLIER: f64 = 2.0;
    pub const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(30);

    pub fn new(initial_interval: Duration, multiplier: f64, max_interval: Duration) -> Self {
        Self {
            initial_interval,
            multiplier: multiplier.max(1.0),
            max_interval: max_interval.max(initial_interval),
            sleeper: Arc::new(ThreadSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn initial_interval(&self) -> Duration {
        self.initial_interval
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    pub fn max_interval(&self) -> Duration {
        self.max_interval
    }

    fn next_interval(&self, current: Duration) -> Duration {
        Duration::try_from_secs_f64(current.as_secs_f64() * self.multiplier)
            .map_or(self.max_interval, |next| next.min(self.max_interval))
    }
}

impl Default for ExponentialBackOffPolicy {
    fn default() -> Self {
        Self::new(
            Self::DEFAULT_INITIAL_INTERVAL,
            Self::DEFAULT_MULTIPLIER,
            Self::DEFAULT_MAX_INTERVAL,
        )
    }
}

impl BackOffPolicy for ExponentialBackOffPolicy {
    fn start(&self, _context: &RetryContext) -> BackOffContext {
        BackOffContext::new(self.initial_interval)
    }

    fn back_off(&self, back_off_context: &mut BackOffContext) -> Result<(), BatchError> {
        let interval = back_off_context.interval;
        debug!("Exponential back off for {:?}", interval);
        self.sleeper.sleep(interval)?;
        back_off_context.interval = self.next_interval(interval);
        back_off_context.back_offs += 1;
        Ok(())
    }
}

/// Pauses for a random period drawn uniformly from `[min, max)`.
pub struct UniformRandomBackOffPolicy {
    min: Duration,
    max: Duration,
    sleeper: Arc<dyn Sleeper>,
}

impl UniformRandomBackOffPolicy {
    pub const DEFAULT_MIN: Duration = Duration::from_millis(500);
    pub const DEFAULT_MAX: Duration = Duration::from_millis(1500);

    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            sleeper: Arc::new(ThreadSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    fn pick(&self) -> Result<Duration, BatchError> {
        if self.max <= self.min {
            return Ok(self.min);
        }
        let range = Uniform::new(millis(self.min)?, millis(self.max)?)
            .map_err(|err| BatchError::Configuration(err.to_string()))?;
        Ok(Duration::from_millis(range.sample(&mut rand::rng())))
    }
}

fn millis(duration: Duration) -> Result<u64, BatchError> {
    u64::try_from(duration.as_millis()).map_err(|_| {
        BatchError::Configuration(format!("back-off bound {:?} is out of range", duration))
    })
}

impl Default for UniformRandomBackOffPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MIN, Self::DEFAULT_MAX)
    }
}

impl BackOffPolicy for UniformRandomBackOffPolicy {
    fn back_off(&self, back_off_context: &mut BackOffContext) -> Result<(), BatchError> {
        let interval = self.pick()?;
        debug!("Random back off for {:?}", interval);
        self.sleeper.sleep(interval)?;
        back_off_context.interval = interval;
        back_off_context.back_offs += 1;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{sync::Mutex, time::Instant};

    use super::*;

    /// Records requested pauses instead of sleeping.
    #[derive(Default)]
    pub(crate) struct RecordingSleeper {
        pub(crate) pauses: Mutex<Vec<Duration>>,
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration) -> Result<(), BatchError> {
            self.pauses.lock().unwrap().push(duration);
            Ok(())
        }
    }

    #[test]
    fn exponential_doubles_up_to_max() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let policy = ExponentialBackOffPolicy::new(
            Duration::from_millis(100),
            2.0,
            Duration::from_millis(500),
        )
        .with_sleeper(sleeper.clone());

        let mut back_off = policy.start(&RetryContext::default());
        for _ in 0..5 {
            policy.back_off(&mut back_off).unwrap();
        }

        let millis: Vec<u128> = sleeper
            .pauses
            .lock()
            .unwrap()
            .iter()
            .map(Duration::as_millis)
            .collect();
        assert_eq!(millis, vec![100, 200, 400, 500, 500]);
        assert_eq!(back_off.back_offs(), 5);
    }

    #[test]
    fn exponential_defaults() {
        let policy = ExponentialBackOffPolicy::default();
        assert_eq!(policy.initial_interval(), Duration::from_millis(100));
        assert_eq!(policy.multiplier(), 2.0);
        assert_eq!(policy.max_interval(), Duration::from_secs(30));
    }

    #[test]
    fn fixed_uses_same_period() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let policy = FixedBackOffPolicy::new(Duration::from_millis(50)).with_sleeper(sleeper.clone());

        let mut back_off = policy.start(&RetryContext::default());
        policy.back_off(&mut back_off).unwrap();
        policy.back_off(&mut back_off).unwrap();

        assert_eq!(
            *sleeper.pauses.lock().unwrap(),
            vec![Duration::from_millis(50); 2]
        );
        assert_eq!(FixedBackOffPolicy::default().period(), Duration::from_secs(1));
    }

    #[test]
    fn uniform_random_stays_in_range() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let policy =
            UniformRandomBackOffPolicy::new(Duration::from_millis(10), Duration::from_millis(20))
                .with_sleeper(sleeper.clone());

        let mut back_off = policy.start(&RetryContext::default());
        for _ in 0..20 {
            policy.back_off(&mut back_off).unwrap();
        }

        for pause in sleeper.pauses.lock().unwrap().iter() {
            assert!(*pause >= Duration::from_millis(10));
            assert!(*pause < Duration::from_millis(20));
        }
    }

    #[test]
    fn exponential_growth_saturates_at_max_interval() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let policy = ExponentialBackOffPolicy::new(
            Duration::from_millis(1),
            1e300,
            Duration::from_millis(2),
        )
        .with_sleeper(sleeper.clone());
        let mut back_off = policy.start(&RetryContext::default());

        for _ in 0..3 {
            policy.back_off(&mut back_off).unwrap();
        }

        assert_eq!(
            *sleeper.pauses.lock().unwrap(),
            vec![
                Duration::from_millis(1),
                Duration::from_millis(2),
                Duration::from_millis(2)
            ]
        );

        let unbounded =
            ExponentialBackOffPolicy::new(Duration::from_secs(1), f64::INFINITY, Duration::MAX);
        assert_eq!(unbounded.next_interval(Duration::from_secs(1)), Duration::MAX);
    }

    #[test]
    fn uniform_random_rejects_bounds_beyond_u64_millis() {
        let policy = UniformRandomBackOffPolicy::new(Duration::from_millis(1), Duration::MAX)
            .with_sleeper(Arc::new(RecordingSleeper::default()));
        let mut back_off = BackOffContext::new(Duration::ZERO);

        let result = policy.back_off(&mut back_off);

        assert!(matches!(result, Err(BatchError::Configuration(_))));
        assert_eq!(back_off.back_offs(), 0);
    }

    #[test]
    fn uniform_random_with_empty_range_uses_min() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let policy =
            UniformRandomBackOffPolicy::new(Duration::from_millis(30), Duration::from_millis(30))
                .with_sleeper(sleeper.clone());

        let mut back_off = policy.start(&RetryContext::default());
        policy.back_off(&mut back_off).unwrap();
        assert_eq!(*sleeper.pauses.lock().unwrap(), vec![Duration::from_millis(30)]);
    }

    #[test]
    fn interrupt_aborts_pause() {
        let sleeper = Arc::new(InterruptibleSleeper::new());
        let interrupter = Arc::clone(&sleeper);

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            interrupter.interrupt();
        });

        let start = Instant::now();
        let result = sleeper.sleep(Duration::from_secs(10));
        handle.join().unwrap();

        assert!(matches!(result, Err(BatchError::BackOffInterrupted(_))));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn pending_interrupt_is_consumed_once() {
        let sleeper = InterruptibleSleeper::new();
        sleeper.interrupt();

        assert!(sleeper.sleep(Duration::from_millis(1)).is_err());
        assert!(sleeper.sleep(Duration::from_millis(1)).is_ok());
    }
}
