//! Tracing setup for the `agora` binary and tests
//!
//! What each level carries:
//!
//! - `warn`: failed or panicking decisions, ledger rejections, dropped
//!   messages, failing listeners and plugins
//! - `info`: engine start and stop, leader elections, context construction
//! - `debug`: consensus, rate-limit rejections, swarm coordination
//! - `trace`: every enqueued message and every completed priority tier

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the stderr subscriber, filtered by `RUST_LOG` or `warn`
///
/// `RUST_LOG=agora::bus=trace,agora::engine=debug` follows a single
/// round's message traffic without the per-agent noise.
///
/// # Errors
/// Fails if a global subscriber is already installed.
pub fn init() -> crate::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    install(env_filter)
}

/// Initialize the tracing subscriber with an explicit level
///
/// RUST_LOG still wins when set; `level` replaces the "warn" default.
pub fn init_with_level(level: &str) -> crate::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    install(env_filter)
}

fn install(env_filter: EnvFilter) -> crate::Result<()> {
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true)
                .pretty(),
        )
        .try_init()
        .map_err(|e| crate::AgoraError::Other(format!("Failed to initialize tracing: {}", e)))?;

    Ok(())
}

/// Initialize logging for tests (no-op if already initialized)
pub fn init_test() {
    let _ = init();
}
