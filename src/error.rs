use std::fmt;
use thiserror::Error;
use tokio::time::Duration;

/// Main error type for the Fluxgate edge router
#[derive(Error, Debug, Clone)]
pub enum FluxgateError {
    /// Configuration errors: unresolved references, invalid rules, cycles.
    /// Recorded on the owning entity, never fatal for the build.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Invalid routing rule syntax
    #[error("Rule error: {message}")]
    Rule { message: String },

    /// Network errors on the data path (dial failure, reset, upstream 5xx)
    #[error("Network error: {message}")]
    Network { message: String },

    /// Operation exceeded its deadline
    #[error("Operation timed out after {duration:?}: {operation}")]
    Timeout {
        duration: Duration,
        operation: String,
    },

    /// TLS configuration or handshake errors
    #[error("TLS error: {message}")]
    Tls { message: String },

    /// No healthy upstream available for a service
    #[error("Service unavailable: {message}")]
    ServiceUnavailable { message: String },

    /// Errors raised while forwarding a request
    #[error("Proxy error: {message}")]
    Proxy { message: String },

    /// Client-side errors (malformed request, failed client auth)
    #[error("Client error: {message}")]
    Client { message: String },

    /// File system errors
    #[error("File system error: {message}")]
    FileSystem { message: String },

    /// IO related errors
    #[error("IO error: {message}")]
    Io { message: String },

    /// Request body exceeded a configured cap
    #[error("Payload too large: {message}")]
    PayloadTooLarge { message: String },

    /// Fatal startup errors (listener bind, invalid static configuration)
    #[error("Fatal error: {message}")]
    Fatal { message: String },

    /// Internal invariant violations
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl FluxgateError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a rule syntax error
    pub fn rule<S: Into<String>>(message: S) -> Self {
        Self::Rule {
            message: message.into(),
        }
    }

    /// Create a network error
    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(duration: Duration, operation: S) -> Self {
        Self::Timeout {
            duration,
            operation: operation.into(),
        }
    }

    /// Create a TLS error
    pub fn tls<S: Into<String>>(message: S) -> Self {
        Self::Tls {
            message: message.into(),
        }
    }

    /// Create a service unavailable error
    pub fn service_unavailable<S: Into<String>>(message: S) -> Self {
        Self::ServiceUnavailable {
            message: message.into(),
        }
    }

    /// Create a proxy error
    pub fn proxy<S: Into<String>>(message: S) -> Self {
        Self::Proxy {
            message: message.into(),
        }
    }

    /// Create a client error
    pub fn client<S: Into<String>>(message: S) -> Self {
        Self::Client {
            message: message.into(),
        }
    }

    /// Create a file system error
    pub fn file_system<S: Into<String>>(message: S) -> Self {
        Self::FileSystem {
            message: message.into(),
        }
    }

    /// Create an IO error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Create a fatal startup error
    pub fn fatal<S: Into<String>>(message: S) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Transient upstream errors feed the retry and failover subsystems.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FluxgateError::Network { .. }
                | FluxgateError::Timeout { .. }
                | FluxgateError::ServiceUnavailable { .. }
                | FluxgateError::Tls { .. }
        )
    }

    /// Configuration errors are recorded on the offending entity and
    /// reported through the API instead of failing the build.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            FluxgateError::Config { .. } | FluxgateError::Rule { .. }
        )
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            FluxgateError::Fatal { .. } => ErrorSeverity::Critical,
            FluxgateError::Config { .. } => ErrorSeverity::High,
            FluxgateError::Rule { .. } => ErrorSeverity::High,
            FluxgateError::Tls { .. } => ErrorSeverity::High,
            FluxgateError::Internal { .. } => ErrorSeverity::High,
            FluxgateError::ServiceUnavailable { .. } => ErrorSeverity::High,
            FluxgateError::FileSystem { .. } => ErrorSeverity::Medium,
            FluxgateError::Network { .. } => ErrorSeverity::Medium,
            FluxgateError::Timeout { .. } => ErrorSeverity::Medium,
            FluxgateError::Io { .. } => ErrorSeverity::Medium,
            FluxgateError::Proxy { .. } => ErrorSeverity::Low,
            FluxgateError::Client { .. } => ErrorSeverity::Low,
            FluxgateError::PayloadTooLarge { .. } => ErrorSeverity::Low,
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Low => write!(f, "LOW"),
            ErrorSeverity::Medium => write!(f, "MEDIUM"),
            ErrorSeverity::High => write!(f, "HIGH"),
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Result type alias for Fluxgate operations
pub type FluxgateResult<T> = Result<T, FluxgateError>;

/// Convert from anyhow::Error to FluxgateError
impl From<anyhow::Error> for FluxgateError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
            return FluxgateError::io(format!("IO error: {}", io_err));
        }

        if let Some(hyper_err) = err.downcast_ref::<hyper::Error>() {
            return FluxgateError::network(format!("HTTP error: {}", hyper_err));
        }

        FluxgateError::internal(err.to_string())
    }
}

/// Convert from std::io::Error to FluxgateError
impl From<std::io::Error> for FluxgateError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => {
                FluxgateError::timeout(Duration::from_secs(0), "socket IO")
            }
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => {
                FluxgateError::network(format!("connection error: {}", err))
            }
            _ => FluxgateError::io(format!("IO error: {}", err)),
        }
    }
}

/// Convert from hyper::Error to FluxgateError
impl From<hyper::Error> for FluxgateError {
    fn from(err: hyper::Error) -> Self {
        if err.is_timeout() {
            FluxgateError::timeout(Duration::from_secs(30), "HTTP request")
        } else if err.is_connect() {
            FluxgateError::network(format!("connection error: {}", err))
        } else {
            FluxgateError::network(format!("HTTP error: {}", err))
        }
    }
}

/// Convert from toml::de::Error to FluxgateError
impl From<toml::de::Error> for FluxgateError {
    fn from(err: toml::de::Error) -> Self {
        FluxgateError::config(format!("TOML parsing error: {}", err))
    }
}

/// Convert from notify::Error to FluxgateError
impl From<notify::Error> for FluxgateError {
    fn from(err: notify::Error) -> Self {
        FluxgateError::file_system(format!("file watching error: {}", err))
    }
}

/// Convert from serde_json::Error to FluxgateError
impl From<serde_json::Error> for FluxgateError {
    fn from(err: serde_json::Error) -> Self {
        FluxgateError::internal(format!("JSON serialization error: {}", err))
    }
}

/// Convert from hyper::http::uri::InvalidUri to FluxgateError
impl From<hyper::http::uri::InvalidUri> for FluxgateError {
    fn from(err: hyper::http::uri::InvalidUri) -> Self {
        FluxgateError::config(format!("invalid URI: {}", err))
    }
}

/// Convert from hyper::http::Error to FluxgateError
impl From<hyper::http::Error> for FluxgateError {
    fn from(err: hyper::http::Error) -> Self {
        FluxgateError::network(format!("HTTP error: {}", err))
    }
}

/// Convert from tokio::time::Elapsed to FluxgateError
impl From<tokio::time::error::Elapsed> for FluxgateError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        FluxgateError::timeout(Duration::from_secs(30), "operation")
    }
}
