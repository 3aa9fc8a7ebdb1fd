//! Configuration for the Flux sync core.
//!
//! Settings persist to disk as a RON file, can be overridden from the
//! command line via clap, and support hot-reload detection. Every section is
//! `#[serde(default)]` so older or partial files keep loading.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{ActionConfig, Config, DebugConfig, NetworkConfig, default_config_dir};
pub use error::ConfigError;
