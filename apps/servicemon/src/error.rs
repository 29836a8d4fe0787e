use std::io::Error as IoError;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failures talking to the backing datastore.
#[derive(Debug, Error)]
pub enum DatastoreError {
    #[error("failed to open datastore: {0}")]
    Open(#[source] libsql::Error),
    #[error("failed to build connection pool: {0}")]
    Pool(String),
    #[error("no datastore connection available: {0}")]
    Connection(String),
    #[error("{context} failed: {source}")]
    Query {
        context: &'static str,
        #[source]
        source: libsql::Error,
    },
    #[error("schema migration failed: {0:#}")]
    Migration(anyhow::Error),
}

/// Failures building or running a protocol checker.
#[derive(Debug, Error)]
pub enum CheckerError {
    #[error("no such checker: {0}")]
    UnknownHandler(String),
    #[error("checker {handler} does not support IPv6 targets")]
    Ipv6Unsupported { handler: String },
    #[error("missing required argument: {0}")]
    MissingArgument(&'static str),
    #[error("invalid value {value:?} for argument {name}: {reason}")]
    InvalidArgument { name: &'static str, value: String, reason: String },
    #[error("timeout after {:.1}s", .0.as_secs_f64())]
    Timeout(Duration),
    #[error("connection failed: {0}")]
    Connect(#[source] IoError),
    #[error("request failed: {0}")]
    Http(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl CheckerError {
    pub fn invalid(name: &'static str, value: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidArgument { name, value: value.into(), reason: reason.to_string() }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine a configuration directory")]
    ConfigPathUnavailable,
    #[error("failed to read {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: IoError,
    },
    #[error("failed to write {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: IoError,
    },
    #[error("failed to parse {path}: {source}")]
    ParseFailed {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to serialize configuration: {0}")]
    SerializeFailed(#[from] toml::ser::Error),
    #[error("invalid setting {setting}: {reason}")]
    Invalid { setting: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("servicemon is already running (pid: {})", .pid.map_or_else(|| "unknown".to_string(), |pid| pid.to_string()))]
    AlreadyRunning { pid: Option<u32> },
    #[error("pid file {path}: {source}")]
    PidFile {
        path: PathBuf,
        #[source]
        source: IoError,
    },
    #[error("failed to open log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: IoError,
    },
    #[error("failed to daemonize: {0}")]
    Daemonize(String),
    #[error("failed to install signal handler: {0}")]
    Signal(#[source] IoError),
}
