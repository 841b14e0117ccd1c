use thiserror::Error;
use ulid::Ulid;

/// Stable, machine-readable classification of an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Unavailable,
    Conflict,
    NotFound,
    Forbidden,
    Persistence,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Conflict => "conflict",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::Persistence => "persistence",
        }
    }

    /// SQLSTATE reported to pgwire clients.
    pub fn sqlstate(self) -> &'static str {
        match self {
            ErrorKind::Validation => "22023",
            ErrorKind::Unavailable => "P0001",
            ErrorKind::Conflict => "23P01",
            ErrorKind::NotFound => "P0002",
            ErrorKind::Forbidden => "42501",
            ErrorKind::Persistence => "58030",
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("room {0} still has active reservations")]
    RoomInUse(Ulid),
    #[error("room not available: {0}")]
    Unavailable(String),
    #[error("time slot already booked at equal or higher priority (reservation {blocking_code})")]
    Conflict { blocking_code: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    Forbidden(String),
    #[error("duplicate reservation code: {0}")]
    DuplicateCode(String),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    pub fn not_found(what: &str, id: impl std::fmt::Display) -> Self {
        EngineError::NotFound(format!("{what} {id}"))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_)
            | EngineError::LimitExceeded(_)
            | EngineError::AlreadyExists(_)
            | EngineError::RoomInUse(_) => ErrorKind::Validation,
            EngineError::Unavailable(_) => ErrorKind::Unavailable,
            EngineError::Conflict { .. } => ErrorKind::Conflict,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::Forbidden(_) => ErrorKind::Forbidden,
            EngineError::DuplicateCode(_) | EngineError::WalError(_) => ErrorKind::Persistence,
        }
    }
}
