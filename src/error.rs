//! Crate-wide error types.

use std::time::Duration;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error for engine, store and configuration operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn account_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "email account",
            id: id.into(),
        }
    }
}

/// Failures raised by a mail transport.
///
/// `AuthFailure` is never retried and demotes the account. `Timeout` is a
/// connect failure whose outcome is ambiguous: reads may retry it, sends must
/// not, because the server may already have accepted the message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("authentication rejected: {0}")]
    AuthFailure(String),

    #[error("connection failed: {0}")]
    ConnectFailure(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("protocol failure: {0}")]
    ProtocolFailure(String),
}

impl TransportError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::AuthFailure(_))
    }

    /// Whether an idempotent operation may be attempted again.
    pub fn is_retryable(&self) -> bool {
        !self.is_auth()
    }

    /// Whether a send that failed this way may have been accepted anyway.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Short stable label for logs and persisted error columns.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthFailure(_) => "auth_failure",
            Self::ConnectFailure(_) => "connect_failure",
            Self::Timeout(_) => "timeout",
            Self::ProtocolFailure(_) => "protocol_failure",
        }
    }
}

/// Illegal account state transitions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("cannot {action} an account in state '{from}'")]
    InvalidTransition { from: String, action: &'static str },

    #[error("warmup config is not active")]
    ConfigInactive,

    /// Another process holds the account's lease.
    #[error("account is busy in another warmupd process")]
    AccountBusy,
}

/// Invalid warmup or daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid warmup config: {0}")]
    InvalidWarmupConfig(String),

    #[error("invalid account: {0}")]
    InvalidAccount(String),
}
