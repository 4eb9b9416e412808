//! Error taxonomy shared by every component.
//!
//! Each variant maps to one stable [`ErrorKind`] tag. Tags are what leave the
//! process (API bodies, log fields); variant and type names never do.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Stable category of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Config,
    NotFound,
    Conflict,
    Validation,
    PermissionDenied,
    Transient,
    Fatal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Config => "config_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Validation => "validation",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::Transient => "transient",
            ErrorKind::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// Malformed stage or connection configuration. Raised at create/update time.
    #[error("{0}")]
    Config(String),

    /// A lookup did not resolve. Authorization denials are collapsed into this.
    #[error("{0}")]
    NotFound(String),

    /// Duplicate name, duplicate approval, or a state that no longer allows the operation.
    #[error("{0}")]
    Conflict(String),

    /// Malformed request input (bad UUID, missing field, runtime expression failure).
    #[error("{0}")]
    Validation(String),

    /// Internal only. Converted to [`Error::NotFound`] at the boundary.
    #[error("{0}")]
    PermissionDenied(String),

    /// Retryable: database aborts, pool timeouts, executor unavailability.
    #[error("{0}")]
    Transient(String),

    /// Runtime invariant violation. Workers abort on it.
    #[error("{0}")]
    Fatal(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Config,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Validation(_) => ErrorKind::Validation,
            Error::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Error::Transient(_) => ErrorKind::Transient,
            Error::Fatal(_) => ErrorKind::Fatal,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Error::Config(m)
            | Error::NotFound(m)
            | Error::Conflict(m)
            | Error::Validation(m)
            | Error::PermissionDenied(m)
            | Error::Transient(m)
            | Error::Fatal(m) => m,
        }
    }

    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Error::NotFound(format!("{what} not found"))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }

    /// Collapse denials into "not found" so callers cannot probe for existence.
    pub fn into_public(self) -> Self {
        match self {
            Error::PermissionDenied(_) => Error::NotFound("not found".into()),
            other => other,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Validation(format!("invalid JSON: {err}"))
    }
}

impl From<uuid::Error> for Error {
    fn from(err: uuid::Error) -> Self {
        Error::Validation(format!("invalid UUID: {err}"))
    }
}

/// Parse a UUID carried in a request, reporting the field that was malformed.
pub fn parse_uuid(field: &str, value: &str) -> Result<uuid::Uuid> {
    uuid::Uuid::parse_str(value).map_err(|_| Error::Validation(format!("invalid {field}: {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_have_stable_tags() {
        assert_eq!(Error::Config("x".into()).kind().as_str(), "config_error");
        assert_eq!(Error::not_found("stage").kind().as_str(), "not_found");
        assert_eq!(Error::Fatal("x".into()).kind().as_str(), "fatal");
    }

    #[test]
    fn denial_is_published_as_not_found() {
        let err = Error::PermissionDenied("user u cannot read canvas".into()).into_public();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.message(), "not found");
    }

    #[test]
    fn uuid_parse_failures_name_the_field() {
        let err = parse_uuid("canvas_id", "nope").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.message().contains("canvas_id"));
    }
}
