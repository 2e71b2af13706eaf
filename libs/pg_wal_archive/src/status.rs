//! Async archive push/get status-file protocol (spec §6 "Status-file
//! protocol for async archive"), grounded on
//! `original_source/src/command/archive/common.c`'s `archiveAsyncStatus`.
//! The push (`archive_out`) and get (`archive_in`) sides share this
//! exact format; which spool subdirectory is scanned is a parameter
//! (spec §9 open question: "the mode is a parameter that selects which
//! spool subdirectory to scan").

use pg_io::Buffer;
use pg_storage::{InfoLevel, NewWriteParams, StorageBackend};
use pg_util::CoreError;
use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpoolDirection {
    ArchiveIn,
    ArchiveOut,
}

impl SpoolDirection {
    fn tag(self) -> &'static str {
        match self {
            SpoolDirection::ArchiveIn => "SPOOL:ARCHIVE_IN",
            SpoolDirection::ArchiveOut => "SPOOL:ARCHIVE_OUT",
        }
    }

    fn dir(self) -> String {
        format!("<{}>", self.tag())
    }
}

async fn write_status_file<B: StorageBackend>(
    storage: &B,
    direction: SpoolDirection,
    segment: &str,
    ext: &str,
    content: &str,
) -> Result<(), CoreError> {
    let path = format!("{}/{segment}.{ext}", direction.dir());
    let mut write = storage.new_write(&path, NewWriteParams::default()).await?;
    if !content.is_empty() {
        write.write(content.as_bytes()).await?;
    }
    write.close().await
}

/// Writes `<segment>.ok`. An empty `message` with `code == 0` means plain
/// success; a non-zero `code` records that a previously-errored segment
/// was manually skipped (a warning on the consuming side, not a failure).
pub async fn write_ok<B: StorageBackend>(
    storage: &B,
    direction: SpoolDirection,
    segment: &str,
    code: i32,
    message: Option<&str>,
) -> Result<(), CoreError> {
    let content = match message {
        Some(m) if !m.is_empty() => format!("{code}\n{m}"),
        _ => String::new(),
    };
    write_status_file(storage, direction, segment, "ok", &content).await
}

/// Writes `<segment>.error`. Per protocol an `.error` file must always
/// carry content; an empty one is treated by the reader as an assertion
/// failure.
pub async fn write_error<B: StorageBackend>(
    storage: &B,
    direction: SpoolDirection,
    segment: &str,
    code: i32,
    message: &str,
) -> Result<(), CoreError> {
    write_status_file(storage, direction, segment, "error", &format!("{code}\n{message}")).await
}

/// Scans `direction`'s spool directory for a status file belonging to
/// `segment`. Returns `Ok(true)` if an `.ok` file (possibly a warning)
/// was found, `Ok(false)` if nothing was found (or an `.error` file was
/// found but `confess_on_error` is false), and `Err` if an `.error` file
/// was found with `confess_on_error` true, or a protocol invariant was
/// violated (multiple status files, or an empty `.error`).
pub async fn check_status<B: StorageBackend>(
    storage: &B,
    direction: SpoolDirection,
    segment: &str,
    confess_on_error: bool,
) -> Result<bool, CoreError> {
    let entries = storage.list(&direction.dir(), InfoLevel::Basic, None).await?;
    let pattern = format!("^{}\\.(ok|error)$", regex::escape(segment));
    let regex = Regex::new(&pattern).map_err(|e| CoreError::Assert(format!("bad status file match expression: {e}")))?;

    let matches: Vec<&str> = entries.iter().map(|e| e.name.as_str()).filter(|n| regex.is_match(n)).collect();

    if matches.is_empty() {
        return Ok(false);
    }
    if matches.len() != 1 {
        return Err(CoreError::Assert(format!(
            "multiple status files found in '{}' for WAL segment '{segment}'",
            direction.dir()
        )));
    }

    let file = matches[0];
    let path = format!("{}/{file}", direction.dir());
    let mut read = storage
        .new_read(&path, false, 0, None)
        .await?
        .ok_or_else(|| CoreError::Assert(format!("status file '{file}' disappeared while being read")))?;

    let mut buf = Buffer::new(64 * 1024);
    read.read(&mut buf).await?;
    let content = String::from_utf8_lossy(buf.as_slice()).into_owned();

    let parsed = if content.is_empty() {
        None
    } else {
        let mut lines = content.splitn(2, '\n');
        let code_str = lines.next().unwrap_or_default();
        let rest = lines
            .next()
            .ok_or_else(|| CoreError::Format(format!("{file} content must have at least two lines")))?;
        let message = rest.trim();
        if message.is_empty() {
            return Err(CoreError::Format(format!("{file} message must be > 0")));
        }
        let code: i32 = code_str
            .trim()
            .parse()
            .map_err(|_| CoreError::Format(format!("{file} has an invalid error code")))?;
        Some((code, message.to_string()))
    };

    if file.ends_with(".ok") {
        if let Some((code, message)) = parsed {
            let logged = if code != 0 {
                format!("WAL segment '{segment}' was not pushed due to error [{code}] and was manually skipped: {message}")
            } else {
                message
            };
            tracing::warn!("{logged}");
        }
        Ok(true)
    } else if confess_on_error {
        match parsed {
            None => Err(CoreError::Assert(format!("status file '{file}' has no content"))),
            Some((code, message)) => Err(CoreError::Format(format!("WAL segment '{segment}' push failed [{code}]: {message}"))),
        }
    } else {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pg_storage::backend::posix::PosixBackend;
    use pg_storage::StorageBase;

    fn spool_backend(base_path: &camino::Utf8Path) -> PosixBackend {
        PosixBackend::new(StorageBase {
            base_path: base_path.to_path_buf(),
            expression: pg_storage::spool_path_expression(),
        })
    }

    #[tokio::test]
    async fn ok_with_error_code_logs_as_manual_skip_warning() {
        let tmp = camino_tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(tmp.path().join("archive_out")).await.unwrap();
        let backend = spool_backend(tmp.path());
        tokio::fs::write(
            tmp.path().join("archive_out/000000010000000100000001.ok"),
            b"25\nmessage",
        )
        .await
        .unwrap();

        let found = check_status(&backend, SpoolDirection::ArchiveOut, "000000010000000100000001", false)
            .await
            .unwrap();
        assert!(found);
    }

    #[tokio::test]
    async fn empty_error_with_confess_is_assert_error() {
        let tmp = camino_tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(tmp.path().join("archive_out")).await.unwrap();
        let backend = spool_backend(tmp.path());
        tokio::fs::write(tmp.path().join("archive_out/000000010000000100000001.error"), b"")
            .await
            .unwrap();

        let err = check_status(&backend, SpoolDirection::ArchiveOut, "000000010000000100000001", true)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Assert(_)));
    }

    #[tokio::test]
    async fn no_status_file_returns_false() {
        let tmp = camino_tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(tmp.path().join("archive_out")).await.unwrap();
        let backend = spool_backend(tmp.path());
        let found = check_status(&backend, SpoolDirection::ArchiveOut, "000000010000000100000001", true)
            .await
            .unwrap();
        assert!(!found);
    }

    #[tokio::test]
    async fn write_then_check_round_trips() {
        let tmp = camino_tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(tmp.path().join("archive_out")).await.unwrap();
        let backend = spool_backend(tmp.path());
        write_ok(&backend, SpoolDirection::ArchiveOut, "000000010000000100000001", 0, None)
            .await
            .unwrap();
        let found = check_status(&backend, SpoolDirection::ArchiveOut, "000000010000000100000001", true)
            .await
            .unwrap();
        assert!(found);
    }
}
