//! A3S Bake Core - Foundational Types
//!
//! Error taxonomy and configuration shared by the bake runtime and CLI.

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::{BakeConfig, LayerSource, LogLevel, Ownership};
pub use error::{BakeError, ExtractionError, Result};

/// A3S Bake version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
