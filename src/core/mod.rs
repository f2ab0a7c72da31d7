use rand::distr::{Alphanumeric, SampleString};

pub mod classify;
pub mod exit_status;
pub mod item;
pub mod repeat;
pub mod retry;
pub mod settings;
pub mod step;

/// Generates a random name consisting of alphanumeric characters.
pub(crate) fn build_name() -> String {
    Alphanumeric.sample_string(&mut rand::rng(), 8)
}
