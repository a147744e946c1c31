//! A3S Bake CLI - bake a data archive into a container image.

pub mod commands;
pub mod output;

use a3s_bake_core::config::LogLevel;
use tracing_subscriber::EnvFilter;

/// Initialize tracing.
///
/// `RUST_LOG` wins when set; otherwise events at `level` and above are shown.
pub fn init_tracing(level: LogLevel) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string())),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
