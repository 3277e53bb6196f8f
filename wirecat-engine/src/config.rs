//! Session configuration
//!
//! Serde-backed TOML schema with per-section defaults, so a partial config
//! file only overrides what it names. `validate` rejects combinations the
//! flow controller and relay cannot honor.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use wirecat_utils::{Result, WirecatError};

use crate::child::ChildOptions;
use crate::codec::CrlfMode;
use crate::flow::FlowController;
use crate::relay::RelayConfig;

/// Default configuration as TOML (for reference/documentation)
pub const DEFAULT_CONFIG_TOML: &str = r##"
# wirecat session configuration

[buffers]
read_chunk_bytes = 4096
stdin_capacity = 65536
stdout_capacity = 65536
stderr_capacity = 65536
max_total_buffer_bytes = 1048576

[flow]
pause_threshold = 0.9
resume_threshold = 0.5

[timeouts]
# All optional; absent means the timeout is disabled.
# execution_timeout_ms = 30000
# idle_timeout_ms = 60000
# connection_timeout_ms = 5000

[behavior]
# crlf: "off", "near_to_far", "far_to_near", or "both"
crlf = "off"
close_on_eof_near_to_far = true
close_on_eof_far_to_near = true
"##;

/// Complete per-session configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub buffers: BufferConfig,
    pub flow: FlowConfig,
    pub timeouts: TimeoutConfig,
    pub behavior: BehaviorConfig,
}

/// Chunk and channel sizing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Bounded read size per transfer cycle
    pub read_chunk_bytes: usize,
    /// Channel capacity in bytes for data headed to a child's stdin
    pub stdin_capacity: usize,
    /// Channel capacity in bytes for a child's stdout
    pub stdout_capacity: usize,
    /// Channel capacity in bytes for a child's stderr
    pub stderr_capacity: usize,
    /// Ceiling for the flow controller's buffered-byte count
    pub max_total_buffer_bytes: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            read_chunk_bytes: 4096,
            stdin_capacity: 64 * 1024,
            stdout_capacity: 64 * 1024,
            stderr_capacity: 64 * 1024,
            max_total_buffer_bytes: 1024 * 1024,
        }
    }
}

/// Pause/resume hysteresis thresholds, as fractions of the buffer ceiling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    pub pause_threshold: f64,
    pub resume_threshold: f64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            pause_threshold: 0.9,
            resume_threshold: 0.5,
        }
    }
}

/// Timeout policies, all optional
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Wall-clock ceiling on the whole transfer phase
    pub execution_timeout_ms: Option<u64>,
    /// Ends the session after this long without a read or write
    pub idle_timeout_ms: Option<u64>,
    /// Ceiling on the pre-transfer connection phase
    pub connection_timeout_ms: Option<u64>,
}

/// Relay behavior toggles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorConfig {
    pub crlf: CrlfMode,
    pub close_on_eof_near_to_far: bool,
    pub close_on_eof_far_to_near: bool,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            crlf: CrlfMode::Off,
            close_on_eof_near_to_far: true,
            close_on_eof_far_to_near: true,
        }
    }
}

impl SessionConfig {
    /// Parse a TOML document. Missing sections and fields take defaults.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| WirecatError::config(format!("config parse failed: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a config file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            WirecatError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&text)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.buffers.read_chunk_bytes == 0 {
            return Err(WirecatError::config("read_chunk_bytes must be positive"));
        }
        if self.buffers.max_total_buffer_bytes == 0 {
            return Err(WirecatError::config(
                "max_total_buffer_bytes must be positive",
            ));
        }
        for (name, value) in [
            ("stdin_capacity", self.buffers.stdin_capacity),
            ("stdout_capacity", self.buffers.stdout_capacity),
            ("stderr_capacity", self.buffers.stderr_capacity),
        ] {
            if value == 0 {
                return Err(WirecatError::config(format!("{} must be positive", name)));
            }
        }

        let pause = self.flow.pause_threshold;
        let resume = self.flow.resume_threshold;
        if !(0.0..=1.0).contains(&pause) || pause == 0.0 {
            return Err(WirecatError::config(format!(
                "pause_threshold must be in (0, 1], got {}",
                pause
            )));
        }
        if !(0.0..=1.0).contains(&resume) || resume == 0.0 {
            return Err(WirecatError::config(format!(
                "resume_threshold must be in (0, 1], got {}",
                resume
            )));
        }
        if resume >= pause {
            return Err(WirecatError::config(format!(
                "resume_threshold ({}) must be below pause_threshold ({})",
                resume, pause
            )));
        }

        Ok(())
    }

    pub fn execution_timeout(&self) -> Option<Duration> {
        self.timeouts.execution_timeout_ms.map(Duration::from_millis)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.timeouts.idle_timeout_ms.map(Duration::from_millis)
    }

    pub fn connection_timeout(&self) -> Option<Duration> {
        self.timeouts.connection_timeout_ms.map(Duration::from_millis)
    }

    /// Flow controller sized and thresholded from this config
    pub fn flow_controller(&self) -> FlowController {
        FlowController::new(
            self.buffers.max_total_buffer_bytes,
            self.flow.pause_threshold,
            self.flow.resume_threshold,
        )
    }

    /// Relay tunables derived from this config
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            read_chunk_bytes: self.buffers.read_chunk_bytes,
            crlf: self.behavior.crlf,
            close_on_eof_near_to_far: self.behavior.close_on_eof_near_to_far,
            close_on_eof_far_to_near: self.behavior.close_on_eof_far_to_near,
        }
    }

    /// Child spawn options derived from this config. Working directory and
    /// environment are per-target concerns layered on by the caller.
    pub fn child_options(&self) -> ChildOptions {
        ChildOptions {
            read_chunk_bytes: self.buffers.read_chunk_bytes,
            stdin_capacity: self.buffers.stdin_capacity,
            stdout_capacity: self.buffers.stdout_capacity,
            stderr_capacity: self.buffers.stderr_capacity,
            ..ChildOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // ==================== Default Tests ====================

    #[test]
    fn test_defaults_are_valid() {
        SessionConfig::default().validate().unwrap();
    }

    #[test]
    fn test_embedded_toml_matches_defaults() {
        let parsed = SessionConfig::from_toml(DEFAULT_CONFIG_TOML).unwrap();
        assert_eq!(parsed, SessionConfig::default());
    }

    #[test]
    fn test_empty_document_takes_defaults() {
        let config = SessionConfig::from_toml("").unwrap();
        assert_eq!(config, SessionConfig::default());
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config = SessionConfig::from_toml(
            r#"
            [buffers]
            read_chunk_bytes = 512
            "#,
        )
        .unwrap();
        assert_eq!(config.buffers.read_chunk_bytes, 512);
        assert_eq!(config.buffers.stdin_capacity, 64 * 1024);
        assert_eq!(config.flow.pause_threshold, 0.9);
    }

    // ==================== Validation Tests ====================

    #[test]
    fn test_zero_chunk_rejected() {
        let mut config = SessionConfig::default();
        config.buffers.read_chunk_bytes = 0;
        assert!(matches!(
            config.validate(),
            Err(WirecatError::Config(_))
        ));
    }

    #[test]
    fn test_thresholds_must_be_ordered() {
        let mut config = SessionConfig::default();
        config.flow.pause_threshold = 0.5;
        config.flow.resume_threshold = 0.5;
        assert!(config.validate().is_err());

        config.flow.resume_threshold = 0.4;
        config.validate().unwrap();
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        let mut config = SessionConfig::default();
        config.flow.pause_threshold = 1.5;
        assert!(config.validate().is_err());

        config.flow.pause_threshold = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let err = SessionConfig::from_toml("buffers = 3").unwrap_err();
        assert!(matches!(err, WirecatError::Config(_)));
    }

    // ==================== Derivation Tests ====================

    #[test]
    fn test_timeout_helpers() {
        let config = SessionConfig::from_toml(
            r#"
            [timeouts]
            execution_timeout_ms = 30000
            idle_timeout_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.execution_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.idle_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.connection_timeout(), None);
    }

    #[test]
    fn test_relay_config_derivation() {
        let config = SessionConfig::from_toml(
            r#"
            [behavior]
            crlf = "both"
            close_on_eof_far_to_near = false
            "#,
        )
        .unwrap();
        let relay = config.relay_config();
        assert_eq!(relay.crlf, CrlfMode::Both);
        assert!(relay.close_on_eof_near_to_far);
        assert!(!relay.close_on_eof_far_to_near);
    }

    #[test]
    fn test_child_options_derivation() {
        let mut config = SessionConfig::default();
        config.buffers.stdout_capacity = 8192;
        let options = config.child_options();
        assert_eq!(options.stdout_capacity, 8192);
        assert!(options.cwd.is_none());
        assert!(options.env.is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[flow]\npause_threshold = 0.8\nresume_threshold = 0.3").unwrap();
        let config = SessionConfig::load(file.path()).unwrap();
        assert_eq!(config.flow.pause_threshold, 0.8);
    }

    #[test]
    fn test_load_missing_file_is_config_error() {
        let err = SessionConfig::load(Path::new("/nonexistent/wirecat.toml")).unwrap_err();
        assert!(matches!(err, WirecatError::Config(_)));
    }
}
