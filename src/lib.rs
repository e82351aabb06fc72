//! Framecast command-line support
//!
//! Configuration loading and logging setup shared by the `framecast` binary.

pub mod config;
pub mod logging;

pub use config::{load_config, Config, LoadedConfig};
pub use logging::{init_logging, LogFormat};
