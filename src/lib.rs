pub mod api;
pub mod commands;
pub mod config;
pub mod db;
pub mod identity;
pub mod pending;
pub mod session;

use tracing_subscriber::EnvFilter;

/// Install the global `fmt` subscriber, writing to stderr. Filter comes from `RUST_LOG`,
/// defaulting to `info`. Safe to call more than once.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
