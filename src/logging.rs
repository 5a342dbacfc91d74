//! Process-wide `tracing` subscriber for the binary
//!
//! The library only emits events; installing a subscriber is the
//! application's call.

use tracing_subscriber::filter::{EnvFilter, LevelFilter};

/// `RUST_LOG` directives on top of an `info` baseline
fn filter() -> EnvFilter {
    EnvFilter::from_default_env().add_directive(LevelFilter::INFO.into())
}

/// Install the fmt subscriber on stderr
///
/// Calling this twice is harmless; the second install is reported and ignored.
pub fn init() {
    let result = tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .try_init();

    match result {
        Ok(()) => tracing::debug!("logging initialized"),
        Err(error) => tracing::warn!(%error, "logging already initialized"),
    }
}
