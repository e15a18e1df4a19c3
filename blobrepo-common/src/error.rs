use crate::path::Scheme;

/// Errors surfaced by every layer of the repository.
///
/// Lower layers never swallow these; the repository facade is the only
/// place where a caller-visible decision (ignore, log, propagate) is made.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    /// Malformed or empty logical path. Always a caller bug.
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("URI must begin with '{expected}:' scheme, got '{found}'")]
    SchemeMismatch { expected: Scheme, found: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Path is a directory: {0}")]
    IsDirectory(String),

    /// The local source is shorter than its footer or its footer does not
    /// match its content. Never retried.
    #[error("Corrupt source '{name}': {reason}")]
    CorruptSource { name: String, reason: String },

    #[error("Transfer of '{key}' failed: {source}")]
    Transfer {
        key: String,
        #[source]
        source: Box<RepoError>,
    },

    /// Network, authentication or protocol failure reported by the store.
    #[error("Object store error: {0}")]
    Transport(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RepoError>;

impl RepoError {
    /// Attach the object key to a failure raised mid-transfer.
    ///
    /// Corruption is reported as-is so callers can tell a bad source file
    /// apart from a failed copy.
    pub fn transfer(key: impl Into<String>, err: impl Into<RepoError>) -> Self {
        match err.into() {
            err @ RepoError::CorruptSource { .. } => err,
            err @ RepoError::Transfer { .. } => err,
            err => RepoError::Transfer {
                key: key.into(),
                source: Box::new(err),
            },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RepoError::NotFound(_))
    }

    /// The innermost error, looking through `Transfer` wrappers.
    pub fn root_cause(&self) -> &RepoError {
        match self {
            RepoError::Transfer { source, .. } => source.root_cause(),
            other => other,
        }
    }
}
