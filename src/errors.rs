//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Missing or invalid dependency at assembly time.
    Construction(String),
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// Spawn or startup-handshake failure when launching a session.
    Launch(String),
    /// Failure persisting the reattach record.
    Reattach(String),
    /// Command-channel timeout or malformed reply.
    Topic(String),
    /// Build registry storage unavailable or corrupt.
    Registry(String),
    /// Operation invoked from a state that does not permit it.
    InvalidState(String),
    /// Caller-initiated cancellation; always unwinds cleanly.
    Cancelled,
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Construction(msg) => write!(f, "construction: {msg}"),
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Launch(msg) => write!(f, "launch: {msg}"),
            Self::Reattach(msg) => write!(f, "reattach: {msg}"),
            Self::Topic(msg) => write!(f, "topic: {msg}"),
            Self::Registry(msg) => write!(f, "registry: {msg}"),
            Self::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
