//! Proxy configuration.
//!
//! [`ProxyConfig`] carries the runtime knobs of the session core. The binary
//! builds it from [`Cli`], which reads flags and `HOPPER_*` environment
//! variables; backends may also come from a TOML file:
//!
//! ```toml
//! [[backend]]
//! name = "lobby"
//! host = "10.0.0.10"
//! port = 19132
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use thiserror::Error;

use crate::command::DEFAULT_TRANSFER_COMMAND;
use crate::directory::Backend;
use crate::transport::packet::{DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_MAX_PACKET_SIZE};
use crate::transport::ProxyProtocol;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:19132";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_RELAY_QUEUE_CAPACITY: usize = 64;
pub const DEFAULT_MAX_PENDING_BYTES: usize = 1024 * 1024;
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid backend '{value}': {reason}")]
    InvalidBackend { value: String, reason: String },

    #[error("invalid transfer failure policy '{0}' (expected close, retry:<n> or fallback)")]
    InvalidPolicy(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Exponential backoff between connect retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound for any delay.
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(2),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// What to do when the transfer target cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferFailurePolicy {
    /// Tell the client and close the session.
    #[default]
    Close,
    /// Retry the target, then close.
    Retry {
        attempts: u32,
        backoff: BackoffPolicy,
    },
    /// Reconnect to the backend the client came from.
    FallbackToPrevious,
}

impl FromStr for TransferFailurePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "close" => Ok(Self::Close),
            "fallback" | "fallback-to-previous" => Ok(Self::FallbackToPrevious),
            other => {
                let attempts = other
                    .strip_prefix("retry:")
                    .and_then(|n| n.parse::<u32>().ok())
                    .filter(|n| *n > 0)
                    .ok_or_else(|| ConfigError::InvalidPolicy(s.to_string()))?;
                Ok(Self::Retry {
                    attempts,
                    backoff: BackoffPolicy::default(),
                })
            }
        }
    }
}

impl fmt::Display for TransferFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Close => f.write_str("close"),
            Self::Retry { attempts, .. } => write!(f, "retry:{attempts}"),
            Self::FallbackToPrevious => f.write_str("fallback"),
        }
    }
}

/// Runtime knobs of the session core.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Upper bound for opening a backend connection.
    pub connect_timeout: Duration,
    /// Capacity (in units) of each writer queue.
    pub relay_queue_capacity: usize,
    /// Ceiling for units buffered while a session is not `Active`.
    pub max_pending_bytes: usize,
    /// How long a retired link may take to flush before it is aborted.
    pub drain_timeout: Duration,
    pub transfer_failure_policy: TransferFailurePolicy,
    /// Command word of the transfer directive.
    pub directive_command: String,
    /// Concurrent connections accepted by the listener.
    pub max_connections: usize,
    /// PROXY header sent to backends (raw transport).
    pub proxy_protocol: ProxyProtocol,
    /// Largest accepted frame (packet transport).
    pub max_packet_size: usize,
    /// Deadline for the client login (packet transport).
    pub handshake_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            relay_queue_capacity: DEFAULT_RELAY_QUEUE_CAPACITY,
            max_pending_bytes: DEFAULT_MAX_PENDING_BYTES,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            transfer_failure_policy: TransferFailurePolicy::default(),
            directive_command: DEFAULT_TRANSFER_COMMAND.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            proxy_protocol: ProxyProtocol::Off,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl ProxyConfig {
    /// Reject values the session core cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.relay_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "relay queue capacity must be at least 1".into(),
            ));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max connections must be at least 1".into(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::Invalid("connect timeout must be non-zero".into()));
        }
        if self.directive_command.trim().is_empty()
            || self.directive_command.contains(char::is_whitespace)
        {
            return Err(ConfigError::Invalid(format!(
                "directive command '{}' must be a single word",
                self.directive_command
            )));
        }
        Ok(())
    }
}

/// Wire format spoken with clients and backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportKind {
    /// Opaque TCP byte stream.
    Raw,
    /// Length-prefixed packets with a login handshake.
    Packet,
}

/// Command-line interface of the `hopper` binary.
#[derive(Debug, Parser)]
#[command(name = "hopper", version, about = "Session-transfer proxy")]
pub struct Cli {
    /// Address to accept clients on.
    #[arg(long, env = "HOPPER_LISTEN_ADDR", default_value = DEFAULT_LISTEN_ADDR)]
    pub listen: SocketAddr,

    /// Backend as name=host:port. The first one is the default.
    #[arg(long = "backend", env = "HOPPER_BACKENDS", value_delimiter = ',')]
    pub backends: Vec<String>,

    /// TOML file with [[backend]] tables, loaded before --backend entries.
    #[arg(long, env = "HOPPER_BACKENDS_FILE")]
    pub backends_file: Option<PathBuf>,

    #[arg(long, env = "HOPPER_TRANSPORT", value_enum, default_value_t = TransportKind::Raw)]
    pub transport: TransportKind,

    /// Send a PROXY v2 header to backends (raw transport).
    #[arg(long, env = "HOPPER_PROXY_PROTOCOL")]
    pub proxy_protocol: bool,

    #[arg(long, env = "HOPPER_CONNECT_TIMEOUT_MS", default_value_t = 2000)]
    pub connect_timeout_ms: u64,

    #[arg(long, env = "HOPPER_DRAIN_TIMEOUT_MS", default_value_t = 5000)]
    pub drain_timeout_ms: u64,

    #[arg(long, env = "HOPPER_RELAY_QUEUE_CAPACITY", default_value_t = DEFAULT_RELAY_QUEUE_CAPACITY)]
    pub relay_queue_capacity: usize,

    #[arg(long, env = "HOPPER_MAX_PENDING_BYTES", default_value_t = DEFAULT_MAX_PENDING_BYTES)]
    pub max_pending_bytes: usize,

    #[arg(long, env = "HOPPER_MAX_CONNECTIONS", default_value_t = DEFAULT_MAX_CONNECTIONS)]
    pub max_connections: usize,

    /// close, retry:<n> or fallback.
    #[arg(long, env = "HOPPER_TRANSFER_FAILURE_POLICY", default_value = "close")]
    pub transfer_failure_policy: String,

    #[arg(long, env = "HOPPER_DIRECTIVE_COMMAND", default_value = DEFAULT_TRANSFER_COMMAND)]
    pub directive_command: String,

    #[arg(long, env = "HOPPER_MAX_PACKET_SIZE", default_value_t = DEFAULT_MAX_PACKET_SIZE)]
    pub max_packet_size: usize,

    #[arg(long, env = "HOPPER_HANDSHAKE_TIMEOUT_MS", default_value_t = 5000)]
    pub handshake_timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error). RUST_LOG wins if set.
    #[arg(long, env = "HOPPER_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Cli {
    /// Build and validate the session core configuration.
    pub fn proxy_config(&self) -> Result<ProxyConfig, ConfigError> {
        let config = ProxyConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            relay_queue_capacity: self.relay_queue_capacity,
            max_pending_bytes: self.max_pending_bytes,
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
            transfer_failure_policy: self.transfer_failure_policy.parse()?,
            directive_command: self.directive_command.clone(),
            max_connections: self.max_connections,
            proxy_protocol: if self.proxy_protocol {
                ProxyProtocol::V2
            } else {
                ProxyProtocol::Off
            },
            max_packet_size: self.max_packet_size,
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
        };
        config.validate()?;
        Ok(config)
    }

    /// Backends in configuration order: file entries, then flag entries.
    pub fn load_backends(&self) -> Result<Vec<Backend>, ConfigError> {
        let mut backends = match &self.backends_file {
            Some(path) => load_backends_file(path)?,
            None => Vec::new(),
        };
        for value in self.backends.iter().filter(|s| !s.trim().is_empty()) {
            backends.push(parse_backend_arg(value)?);
        }
        Ok(backends)
    }
}

/// Parse `name=host:port`. IPv6 hosts must be bracketed.
pub fn parse_backend_arg(value: &str) -> Result<Backend, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidBackend {
        value: value.to_string(),
        reason: reason.to_string(),
    };

    let (name, addr) = value
        .trim()
        .split_once('=')
        .ok_or_else(|| invalid("expected name=host:port"))?;
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| invalid("missing port"))?;
    let port: u16 = port
        .trim()
        .parse()
        .map_err(|_| invalid("port is not a number"))?;

    let host = host.trim();
    let host = match host.strip_prefix('[') {
        Some(inner) => inner
            .strip_suffix(']')
            .ok_or_else(|| invalid("unterminated IPv6 bracket"))?,
        None if host.contains(':') => return Err(invalid("IPv6 hosts must be bracketed")),
        None => host,
    };

    let backend = Backend::new(name.trim(), host, port);
    validate_backend(&backend).map_err(|reason| invalid(&reason))?;
    Ok(backend)
}

fn validate_backend(backend: &Backend) -> Result<(), String> {
    if backend.name.is_empty() || backend.name.contains(char::is_whitespace) {
        return Err("name must be a non-empty word".into());
    }
    if backend.host.is_empty() {
        return Err("host is empty".into());
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct BackendFile {
    #[serde(default, rename = "backend")]
    backends: Vec<Backend>,
}

/// Load `[[backend]]` tables from a TOML file.
pub fn load_backends_file(path: &Path) -> Result<Vec<Backend>, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_backends_toml(&contents).map_err(|err| match err {
        ConfigError::Toml { source, .. } => ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        },
        other => other,
    })
}

fn parse_backends_toml(contents: &str) -> Result<Vec<Backend>, ConfigError> {
    let file: BackendFile = toml::from_str(contents).map_err(|source| ConfigError::Toml {
        path: PathBuf::new(),
        source,
    })?;
    for backend in &file.backends {
        validate_backend(backend).map_err(|reason| ConfigError::InvalidBackend {
            value: backend.name.clone(),
            reason,
        })?;
    }
    Ok(file.backends)
}
