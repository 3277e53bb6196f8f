//! Common utilities for wirecat
//!
//! Shared error type, logging setup, and path helpers used by the
//! wirecat crates.

pub mod error;
pub mod logging;
pub mod paths;

pub use error::{Result, WirecatError};
pub use logging::{init_logging, init_logging_with_config, LogConfig, LogOutput};
