use std::io;

/// Closed error taxonomy, per spec §7.
///
/// Each variant maps to one of the named error kinds. Lower layers wrap
/// their failures in the kind they know about; the storage interface
/// adds path context on the way up (§7 "Propagation").
#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    #[error("file missing: {0}")]
    FileMissing(String),

    #[error("path missing: {0}")]
    PathMissing(String),

    #[error("{op} failed for '{path}': {source}")]
    Io {
        op: &'static str,
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("format error: {0}")]
    Format(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("service error {code}: {message}")]
    Service { code: u16, message: String },

    #[error("assertion failed: {0}")]
    Assert(String),

    #[error(
        "WAL segment {segment} was not archived before the {timeout_ms}ms timeout\n\
         HINT: check the archive_command to ensure that all options are correct (especially --stanza).\n\
         HINT: check the PostgreSQL server log for errors.\n\
         HINT: run the 'start' command if the stanza was previously stopped."
    )]
    ArchiveTimeout { segment: String, timeout_ms: u64 },

    #[error(
        "duplicates found in archive for WAL segment {segment}: {}\n\
         HINT: are multiple primaries archiving to this stanza?",
        .candidates.join(", ")
    )]
    ArchiveDuplicate {
        segment: String,
        candidates: Vec<String>,
    },

    #[error("archive mismatch: {0}")]
    ArchiveMismatch(String),

    #[error("option invalid: {0}")]
    OptionInvalid(String),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::FileMissing(_) | CoreError::PathMissing(_) => ErrorKind::Missing,
            CoreError::Io { .. } => ErrorKind::Io,
            CoreError::Protocol(_) => ErrorKind::Protocol,
            CoreError::Format(_) => ErrorKind::Format,
            CoreError::Crypto(_) => ErrorKind::Crypto,
            CoreError::Service { .. } => ErrorKind::Service,
            CoreError::Assert(_) => ErrorKind::Assert,
            CoreError::ArchiveTimeout { .. } => ErrorKind::ArchiveTimeout,
            CoreError::ArchiveDuplicate { .. } => ErrorKind::ArchiveDuplicate,
            CoreError::ArchiveMismatch(_) => ErrorKind::ArchiveMismatch,
            CoreError::OptionInvalid(_) => ErrorKind::OptionInvalid,
        }
    }

    /// True if this error is never worth retrying by an upper layer.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Service { code, .. } if (500..600).contains(code))
    }

    pub fn io(op: &'static str, path: impl Into<String>, source: io::Error) -> Self {
        CoreError::Io {
            op,
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Missing,
    Io,
    Protocol,
    Format,
    Crypto,
    Service,
    Assert,
    ArchiveTimeout,
    ArchiveDuplicate,
    ArchiveMismatch,
    OptionInvalid,
}
