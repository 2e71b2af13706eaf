//! Path-context wrapping for errors surfaced above the storage interface
//! (spec §7 "Propagation": "Errors below the storage interface are wrapped
//! with path context before surfacing").

use pg_util::CoreError;

pub fn with_path(result: std::io::Result<()>, op: &'static str, path: &str) -> Result<(), CoreError> {
    result.map_err(|e| CoreError::io(op, path, e))
}

pub fn io_err(op: &'static str, path: &str, source: std::io::Error) -> CoreError {
    CoreError::io(op, path, source)
}
