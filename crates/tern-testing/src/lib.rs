#![warn(
    rust_2018_idioms,
    nonstandard_style,
    future_incompatible,
    clippy::mod_module_files,
    clippy::undocumented_unsafe_blocks
)]

//! Test helpers for the tern workspace.

mod chunks;

pub use chunks::*;
use tracing_subscriber::prelude::__tracing_subscriber_SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

static INIT_TEST_LOGGING: std::sync::Once = std::sync::Once::new();

/// Makes sure logging is initialized for test.
///
/// This needs to be called on each test.
pub fn init_test_logging() {
    INIT_TEST_LOGGING.call_once(|| {
        let fmt_layer = tracing_subscriber::fmt::layer().with_test_writer();

        tracing_subscriber::registry()
            .with(EnvFilter::new("tern_=debug,info"))
            .with(fmt_layer)
            .try_init()
            .unwrap();
    });
}
