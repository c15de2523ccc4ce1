use std::path::PathBuf;
use thiserror::Error;

/// Fatal errors that abort the run.
#[derive(Error, Debug)]
pub enum AuditError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("failed to resolve group: {0}")]
    Group(String),

    #[error(transparent)]
    Report(#[from] ReportError),
}

/// Per-identifier lookup failures. These never abort the batch; they are
/// demoted to an Error-status row and the runner moves on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    #[error("no directory account matches this identifier")]
    NotFound,

    /// The flag marks a 403 on the sign-in-activity sub-query specifically,
    /// which gets its own classification tag.
    #[error("caller lacks permission for the requested directory data")]
    Forbidden(bool),

    #[error("the session token was rejected")]
    Unauthorized,

    #[error("rate limited by the directory service")]
    Throttled,

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("identifier is not a valid email address")]
    InvalidIdentifier,
}

impl LookupError {
    /// Only throttling and transient conditions are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LookupError::Throttled | LookupError::Transient(_))
    }

    /// Classification tag surfaced in the report's Details column.
    pub fn detail_tag(&self) -> &'static str {
        match self {
            LookupError::NotFound => "UserNotFound",
            LookupError::Forbidden(true) => "SignInPermissionsMissing",
            LookupError::Forbidden(false) => "InsufficientPermissions",
            LookupError::Unauthorized => "Unauthorized",
            LookupError::InvalidIdentifier => "InvalidIdentifier",
            LookupError::Throttled | LookupError::Transient(_) => "Unknown",
        }
    }
}

/// Report export failures.
#[derive(Error, Debug)]
pub enum ReportError {
    #[error("failed to write report to {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error(
        "failed to write report to {} ({primary}) and to fallback {} ({fallback})",
        primary_path.display(),
        fallback_path.display()
    )]
    FallbackFailed {
        primary_path: PathBuf,
        primary: String,
        fallback_path: PathBuf,
        fallback: String,
    },
}

pub type Result<T> = std::result::Result<T, AuditError>;
