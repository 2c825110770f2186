//! Raw error types.
//!
//! These errors are produced before classification: reference parsing,
//! registry client failures and configuration problems. User-facing
//! classification lives in [`crate::classify`].

use std::path::PathBuf;
use thiserror::Error;

/// Failure to parse an image reference.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid image reference '{reference}': {reason}")]
pub struct ReferenceError {
    /// The raw input that failed to parse.
    pub reference: String,
    /// Why it was rejected.
    pub reason: String,
}

impl ReferenceError {
    /// Creates a new reference error.
    pub fn new(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            reason: reason.into(),
        }
    }
}

/// A single entry of a registry API error response body.
///
/// Registries answer failed requests with `{"errors": [{"code": ..., "message": ...}]}`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct Diagnostic {
    /// Error code (e.g. `MANIFEST_UNKNOWN`, `DENIED`).
    pub code: String,
    /// Human readable message.
    #[serde(default)]
    pub message: String,
}

impl Diagnostic {
    /// Creates a diagnostic entry.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Errors reported by a registry client implementation.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The registry answered, but rejected the request.
    #[error("{url} returned {status}{}", format_diagnostics(.diagnostics))]
    Api {
        /// Request URL.
        url: String,
        /// HTTP status code.
        status: u16,
        /// Parsed error entries from the response body.
        diagnostics: Vec<Diagnostic>,
    },

    /// The registry could not be reached.
    #[error("failed to connect to {url}: {message}")]
    Connection {
        /// Target URL or host.
        url: String,
        /// Underlying failure description.
        message: String,
    },

    /// An operation exceeded its deadline.
    #[error("operation timed out: {operation}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
    },

    /// Local I/O failure (typically while writing the archive).
    #[error("file I/O error at {path}: {source}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Anything else the client could not express more precisely.
    #[error("{0}")]
    Other(String),
}

impl RegistryError {
    /// Creates an API error.
    pub fn api(url: impl Into<String>, status: u16, diagnostics: Vec<Diagnostic>) -> Self {
        Self::Api {
            url: url.into(),
            status,
            diagnostics,
        }
    }

    /// Creates a connection error.
    pub fn connection(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Creates a timeout error.
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Returns the registry error codes carried by this error.
    pub fn codes(&self) -> impl Iterator<Item = &str> {
        let diagnostics: &[Diagnostic] = match self {
            Self::Api { diagnostics, .. } => diagnostics,
            _ => &[],
        };
        diagnostics.iter().map(|d| d.code.as_str())
    }

    /// HTTP status of a registry answer.
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Failure description without the request URL or file path.
    pub fn detail(&self) -> String {
        match self {
            Self::Api { diagnostics, .. } => format_diagnostics(diagnostics),
            Self::Connection { message, .. } => message.clone(),
            Self::Timeout { .. } => "timed out".to_string(),
            Self::Io { source, .. } => source.to_string(),
            Self::Other(message) => message.clone(),
        }
    }

    /// Returns true if the registry was reached and produced a response.
    pub const fn is_registry_response(&self) -> bool {
        matches!(self, Self::Api { .. })
    }

    /// Returns true for connection-level failures.
    pub const fn is_connection_failure(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }
}

fn format_diagnostics(diagnostics: &[Diagnostic]) -> String {
    if diagnostics.is_empty() {
        return String::new();
    }
    let joined = diagnostics
        .iter()
        .map(|d| {
            if d.message.is_empty() {
                d.code.clone()
            } else {
                format!("{}: {}", d.code, d.message)
            }
        })
        .collect::<Vec<_>>()
        .join("; ");
    format!(" ({joined})")
}

impl From<reqwest::Error> for RegistryError {
    fn from(err: reqwest::Error) -> Self {
        let url = err
            .url()
            .map_or_else(|| "unknown".to_string(), ToString::to_string);
        if err.is_timeout() {
            Self::Timeout { operation: url }
        } else if err.is_connect() {
            Self::Connection {
                url,
                message: err.to_string(),
            }
        } else if let Some(status) = err.status() {
            Self::Api {
                url,
                status: status.as_u16(),
                diagnostics: Vec::new(),
            }
        } else {
            Self::Other(err.to_string())
        }
    }
}

/// Errors raised while loading, validating or saving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading or writing a configuration file failed.
    #[error("config file I/O error at {path}: {source}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A configuration file is not valid JSON for the expected schema.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// A value failed validation.
    #[error("invalid value for '{key}': {reason}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Unknown configuration key.
    #[error("unknown config key: {0}")]
    UnknownKey(String),

    /// The mirror is already configured.
    #[error("mirror already configured: {0}")]
    DuplicateMirror(String),

    /// The mirror is not configured.
    #[error("mirror not configured: {0}")]
    UnknownMirror(String),

    /// A file that must not be overwritten already exists.
    #[error("refusing to overwrite existing file {0}")]
    AlreadyExists(PathBuf),

    /// The home directory could not be determined.
    #[error("could not determine the home directory")]
    NoHomeDir,
}
