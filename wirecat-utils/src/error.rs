//! Error types for wirecat
//!
//! Provides a unified error type used across all wirecat crates.

use std::path::PathBuf;

/// Main error type for wirecat operations
#[derive(Debug, thiserror::Error)]
pub enum WirecatError {
    // === IO Errors ===

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    // === Child Process Errors ===

    #[error("Failed to spawn process: {0}")]
    Spawn(String),

    #[error("Failed to reap child process: {0}")]
    ChildWait(String),

    // === Transfer Errors ===

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Filter error: {0}")]
    Filter(String),

    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    // === Configuration Errors ===

    #[error("Configuration error: {0}")]
    Config(String),

    // === Internal Errors ===

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WirecatError {
    /// Create a spawn error
    pub fn spawn(msg: impl Into<String>) -> Self {
        Self::Spawn(msg.into())
    }

    /// Create a child-wait error
    pub fn child_wait(msg: impl Into<String>) -> Self {
        Self::ChildWait(msg.into())
    }

    /// Create an out-of-memory error
    pub fn out_of_memory(msg: impl Into<String>) -> Self {
        Self::OutOfMemory(msg.into())
    }

    /// Create a filter error
    pub fn filter(msg: impl Into<String>) -> Self {
        Self::Filter(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error was fatal before any transfer started
    pub fn is_pre_transfer(&self) -> bool {
        matches!(self, Self::Spawn(_) | Self::Config(_))
    }
}

/// Result type alias using WirecatError
pub type Result<T> = std::result::Result<T, WirecatError>;
