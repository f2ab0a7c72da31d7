//! Plain-value configuration for templates and steps.
//!
//! Settings are read once when a template or step is built. Durations are
//! expressed in milliseconds so the JSON form stays flat:
//!
//! ```
//! use spring_batch_core::core::settings::{BackOffSettings, BatchSettings};
//!
//! let settings = BatchSettings::from_json(
//!     r#"{
//!         "chunk_size": 100,
//!         "skip_limit": 10,
//!         "back_off": { "type": "exponential", "initial_interval_ms": 50 }
//!     }"#,
//! )
//! .unwrap();
//!
//! assert_eq!(settings.chunk_size, 100);
//! assert_eq!(settings.retry_limit, 3);
//! assert!(matches!(settings.back_off, BackOffSettings::Exponential { multiplier, .. } if multiplier == 2.0));
//! ```

use std::{sync::Arc, time::Duration};

use log::debug;
use serde::{Deserialize, Serialize};

use super::{
    repeat::{
        CompletionPolicy, CompositeCompletionPolicy, RepeatTemplate, SimpleCompletionPolicy,
        SimpleLimitExceptionHandler, TaskExecutor, TaskExecutorRepeatTemplate,
        TimeoutTerminationPolicy, executor::DEFAULT_THROTTLE_LIMIT, policy::DEFAULT_CHUNK_SIZE,
    },
    retry::{
        BackOffPolicy, ExponentialBackOffPolicy, FixedBackOffPolicy, NoBackOffPolicy,
        RetryTemplate, RetryTemplateBuilder, SimpleRetryPolicy, TimeoutRetryPolicy,
        UniformRandomBackOffPolicy,
    },
};
use crate::error::BatchError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    /// Items per chunk.
    pub chunk_size: usize,
    /// Ends a chunk early once it has been open this long.
    pub chunk_timeout_ms: Option<u64>,
    /// Failed items tolerated per step.
    pub skip_limit: usize,
    /// Attempts per retried operation, the first one included.
    pub retry_limit: usize,
    /// Wall-clock budget of a retry sequence; replaces the attempt limit when set.
    pub retry_timeout_ms: Option<u64>,
    pub back_off: BackOffSettings,
    /// Iterations in flight at once in the worker-pool template.
    pub throttle_limit: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_timeout_ms: None,
            skip_limit: 0,
            retry_limit: SimpleRetryPolicy::DEFAULT_MAX_ATTEMPTS,
            retry_timeout_ms: None,
            back_off: BackOffSettings::default(),
            throttle_limit: DEFAULT_THROTTLE_LIMIT,
        }
    }
}

impl BatchSettings {
    /// Parses and validates settings; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, BatchError> {
        let settings: BatchSettings = serde_json::from_str(json)
            .map_err(|err| BatchError::Configuration(format!("invalid settings: {}", err)))?;
        settings.validate()?;
        debug!("Loaded batch settings: {:?}", settings);
        Ok(settings)
    }

    pub fn to_json(&self) -> Result<String, BatchError> {
        serde_json::to_string_pretty(self).map_err(|err| BatchError::Configuration(err.to_string()))
    }

    pub fn validate(&self) -> Result<(), BatchError> {
        if self.chunk_size == 0 {
            return Err(BatchError::Configuration(
                "chunk_size must be at least 1".to_string(),
            ));
        }
        if self.retry_limit == 0 {
            return Err(BatchError::Configuration(
                "retry_limit must be at least 1".to_string(),
            ));
        }
        if self.throttle_limit == 0 {
            return Err(BatchError::Configuration(
                "throttle_limit must be at least 1".to_string(),
            ));
        }
        self.back_off.validate()
    }

    /// Fixed-size chunks, also ended by the chunk timeout when one is set.
    pub fn chunk_completion_policy(&self) -> Arc<dyn CompletionPolicy> {
        let size = SimpleCompletionPolicy::new(self.chunk_size);
        match self.chunk_timeout_ms {
            Some(timeout) => Arc::new(
                CompositeCompletionPolicy::new(Vec::new())
                    .add(size)
                    .add(TimeoutTerminationPolicy::new(Duration::from_millis(timeout))),
            ),
            None => Arc::new(size),
        }
    }

    /// Skip handler counting in the parent context, for use by nested loops.
    pub fn skip_handler(&self) -> SimpleLimitExceptionHandler {
        SimpleLimitExceptionHandler::builder()
            .limit(self.skip_limit)
            .use_parent(true)
            .build()
    }

    pub fn task_executor_template(
        &self,
        template: RepeatTemplate,
        task_executor: Arc<dyn TaskExecutor>,
    ) -> TaskExecutorRepeatTemplate {
        TaskExecutorRepeatTemplate::new(template, task_executor).throttle_limit(self.throttle_limit)
    }

    pub fn retry_template(&self) -> RetryTemplate {
        let builder = match self.retry_timeout_ms {
            Some(timeout) => RetryTemplateBuilder::new()
                .retry_policy(TimeoutRetryPolicy::new(Duration::from_millis(timeout))),
            None => RetryTemplateBuilder::new().max_attempts(self.retry_limit),
        };
        builder.shared_back_off_policy(self.back_off.to_policy()).build()
    }
}

/// Back-off policy selection, tagged by `type` in JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackOffSettings {
    #[default]
    None,
    Fixed {
        #[serde(default = "default_period_ms")]
        period_ms: u64,
    },
    Exponential {
        #[serde(default = "default_initial_interval_ms")]
        initial_interval_ms: u64,
        #[serde(default = "default_multiplier")]
        multiplier: f64,
        #[serde(default = "default_max_interval_ms")]
        max_interval_ms: u64,
    },
    UniformRandom {
        #[serde(default = "default_min_ms")]
        min_ms: u64,
        #[serde(default = "default_max_ms")]
        max_ms: u64,
    },
}

fn default_period_ms() -> u64 {
    FixedBackOffPolicy::DEFAULT_PERIOD.as_millis() as u64
}

fn default_initial_interval_ms() -> u64 {
    ExponentialBackOffPolicy::DEFAULT_INITIAL_INTERVAL.as_millis() as u64
}

fn default_multiplier() -> f64 {
    ExponentialBackOffPolicy::DEFAULT_MULTIPLIER
}

fn default_max_interval_ms() -> u64 {
    ExponentialBackOffPolicy::DEFAULT_MAX_INTERVAL.as_millis() as u64
}

fn default_min_ms() -> u64 {
    UniformRandomBackOffPolicy::DEFAULT_MIN.as_millis() as u64
}

fn default_max_ms() -> u64 {
    UniformRandomBackOffPolicy::DEFAULT_MAX.as_millis() as u64
}

impl BackOffSettings {
    pub fn validate(&self) -> Result<(), BatchError> {
        match self {
            BackOffSettings::Exponential { multiplier, .. }
                if !multiplier.is_finite() || *multiplier < 1.0 =>
            {
                Err(BatchError::Configuration(format!(
                    "multiplier {} must be a finite number of at least 1.0",
                    multiplier
                )))
            }
            BackOffSettings::UniformRandom { min_ms, max_ms } if min_ms > max_ms => {
                Err(BatchError::Configuration(format!(
                    "min_ms {} is above max_ms {}",
                    min_ms, max_ms
                )))
            }
            _ => Ok(()),
        }
    }

    pub fn to_policy(&self) -> Arc<dyn BackOffPolicy> {
        match *self {
            BackOffSettings::None => Arc::new(NoBackOffPolicy),
            BackOffSettings::Fixed { period_ms } => {
                Arc::new(FixedBackOffPolicy::new(Duration::from_millis(period_ms)))
            }
            BackOffSettings::Exponential {
                initial_interval_ms,
                multiplier,
                max_interval_ms,
            } => Arc::new(ExponentialBackOffPolicy::new(
                Duration::from_millis(initial_interval_ms),
                multiplier,
                Duration::from_millis(max_interval_ms),
            )),
            BackOffSettings::UniformRandom { min_ms, max_ms } => Arc::new(
                UniformRandomBackOffPolicy::new(
                    Duration::from_millis(min_ms),
                    Duration::from_millis(max_ms),
                ),
            ),
        }
    }
}
