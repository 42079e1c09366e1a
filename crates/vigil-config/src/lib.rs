#![deny(unsafe_code)]

//! Configuration loading and validation for the Vigil privileged helper.
//!
//! Loads an optional TOML file into [`HelperConfig`] and resolves the Unix
//! socket path the helper binds, honouring the `VIGIL_SOCKET_PATH`
//! environment override.
//!
//! The rule-compiler executable and its arguments are deliberately absent
//! from this file: they are compile-time constants of the helper.

use std::ffi::OsString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default Unix socket path for the helper.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/vigil.sock";

/// Environment variable that overrides the socket path.
pub const SOCKET_PATH_ENV: &str = "VIGIL_SOCKET_PATH";

/// Size of `sockaddr_un.sun_path`, including the trailing NUL.
#[cfg(target_os = "linux")]
pub const SUN_PATH_CAPACITY: usize = 108;
/// Size of `sockaddr_un.sun_path`, including the trailing NUL.
#[cfg(not(target_os = "linux"))]
pub const SUN_PATH_CAPACITY: usize = 104;

/// Reference bound on a single ruleset request.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 8192;

/// Upper bound accepted for `listener.max_payload_bytes`.
pub const MAX_PAYLOAD_LIMIT: usize = 64 * 1024;

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level helper configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct HelperConfig {
    /// Socket listener configuration.
    #[serde(default)]
    pub listener: ListenerConfig,

    /// Ruleset applicator configuration.
    #[serde(default)]
    pub applicator: ApplicatorConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Configuration for the socket listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Socket path. `VIGIL_SOCKET_PATH` takes precedence when set.
    #[serde(default)]
    pub socket_path: Option<String>,

    /// Maximum accepted request size in bytes.
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,

    /// Deadline for the client to deliver its request (0 = no deadline).
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            max_payload_bytes: default_max_payload_bytes(),
            read_timeout_secs: default_read_timeout_secs(),
        }
    }
}

impl ListenerConfig {
    /// The read deadline, or `None` when disabled.
    pub fn read_timeout(&self) -> Option<Duration> {
        nonzero_secs(self.read_timeout_secs)
    }
}

fn default_max_payload_bytes() -> usize {
    DEFAULT_MAX_PAYLOAD_BYTES
}

fn default_read_timeout_secs() -> u64 {
    10
}

/// Configuration for the ruleset applicator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicatorConfig {
    /// Deadline for the rule-compiler to consume its input and exit
    /// (0 = no deadline).
    #[serde(default = "default_apply_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ApplicatorConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_apply_timeout_secs(),
        }
    }
}

impl ApplicatorConfig {
    /// The apply deadline, or `None` when disabled.
    pub fn timeout(&self) -> Option<Duration> {
        nonzero_secs(self.timeout_secs)
    }
}

fn default_apply_timeout_secs() -> u64 {
    30
}

fn nonzero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "trace").
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Where the resolved socket path came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketPathSource {
    Default,
    ConfigFile,
    Environment,
}

/// An override that was ignored because it cannot fit in `sun_path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedOverride {
    pub source: SocketPathSource,
    pub len: usize,
}

/// Result of socket path resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSocketPath {
    pub path: PathBuf,
    pub source: SocketPathSource,
    /// Set when an override was discarded in favour of the default.
    pub rejected: Option<RejectedOverride>,
}

/// Whether a socket path fits in `sun_path` with its terminating NUL.
pub fn fits_sun_path(path: &Path) -> bool {
    path.as_os_str().as_bytes().len() < SUN_PATH_CAPACITY
}

impl HelperConfig {
    /// Load configuration from a TOML file at the given path using async I/O.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: HelperConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // A socket path too long for `sun_path` is not an error here; it is
        // replaced by the default in `resolve_socket_path`.
        if self.listener.socket_path.as_deref() == Some("") {
            return Err(ConfigError::Validation(
                "listener.socket_path must not be empty".to_string(),
            ));
        }
        if self.listener.max_payload_bytes == 0
            || self.listener.max_payload_bytes > MAX_PAYLOAD_LIMIT
        {
            return Err(ConfigError::Validation(format!(
                "listener.max_payload_bytes must be in 1..={MAX_PAYLOAD_LIMIT}, got {}",
                self.listener.max_payload_bytes
            )));
        }

        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "logging.level must be one of {:?}, got {:?}",
                valid_levels, self.logging.level
            )));
        }

        Ok(())
    }

    /// Resolve the socket path to bind.
    ///
    /// Precedence is the environment override (when non-empty), then the
    /// config file, then [`DEFAULT_SOCKET_PATH`]. An override that does not
    /// fit in `sun_path` is discarded and the default is used instead; the
    /// caller is expected to log [`ResolvedSocketPath::rejected`].
    pub fn resolve_socket_path(&self, env_override: Option<OsString>) -> ResolvedSocketPath {
        let (candidate, source) = match env_override.filter(|v| !v.is_empty()) {
            Some(env) => (PathBuf::from(env), SocketPathSource::Environment),
            None => match self.listener.socket_path.as_deref() {
                Some(p) if !p.is_empty() => (PathBuf::from(p), SocketPathSource::ConfigFile),
                _ => (PathBuf::from(DEFAULT_SOCKET_PATH), SocketPathSource::Default),
            },
        };

        if source == SocketPathSource::Default || fits_sun_path(&candidate) {
            return ResolvedSocketPath {
                path: candidate,
                source,
                rejected: None,
            };
        }

        ResolvedSocketPath {
            path: PathBuf::from(DEFAULT_SOCKET_PATH),
            source: SocketPathSource::Default,
            rejected: Some(RejectedOverride {
                source,
                len: candidate.as_os_str().as_bytes().len(),
            }),
        }
    }
}
