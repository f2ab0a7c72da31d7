#![allow(dead_code)]

mod mocks;

pub use mocks::{MockListener, MockWriter};

use std::sync::Once;

static LOGGER: Once = Once::new();

/// Installs `env_logger` once per test binary; honours `RUST_LOG`.
pub fn init_logger() {
    LOGGER.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}
