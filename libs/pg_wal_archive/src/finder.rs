//! Stateful WAL segment scanner (spec §4.5 "WAL Segment Finder").
//!
//! Grounded on `original_source/src/command/archive/find.c`
//! (`walSegmentFindNew`/`walSegmentFind`): a `single`-mode finder
//! re-lists and filters on every call (it's only ever asked about one
//! segment at a time), while multi-mode caches an unfiltered, sorted
//! listing and drains matches off its head across calls, only refilling
//! once it runs dry.

use std::time::Duration;

use pg_io::Wait;
use pg_storage::{InfoLevel, StorageBackend};
use pg_util::CoreError;
use regex::Regex;

use crate::segment::{is_partial, segment_prefix};

/// `<REPO:ARCHIVE>/<archive_id>` plus one level of directory sharding by
/// the segment's first 16 hex characters, matching the repository layout
/// in spec §4.5.
fn list_path(archive_id: &str, prefix16: &str) -> String {
    format!("<REPO:ARCHIVE>/{archive_id}/{prefix16}")
}

fn match_expression(wal_segment: &str) -> String {
    let prefix = segment_prefix(wal_segment);
    let partial = if is_partial(wal_segment) { "\\.partial" } else { "" };
    format!(r"^{prefix}{partial}-[0-9a-f]{{40}}(\.gz|\.zst)?$")
}

pub struct WalSegmentFind<'a, B: StorageBackend> {
    storage: &'a B,
    archive_id: String,
    single: bool,
    timeout: Duration,
    prefix: Option<String>,
    list: Option<Vec<String>>,
}

impl<'a, B: StorageBackend> WalSegmentFind<'a, B> {
    pub fn new(storage: &'a B, archive_id: impl Into<String>, single: bool, timeout: Duration) -> Self {
        Self {
            storage,
            archive_id: archive_id.into(),
            single,
            timeout,
            prefix: None,
            list: None,
        }
    }

    /// Locate `wal_segment` (a 24-hex segment name, optionally
    /// `.partial`-suffixed), waiting up to `self.timeout` for it to
    /// appear. Returns `Ok(None)` only when `timeout` is zero and the
    /// single attempt found nothing; any positive timeout that expires
    /// without a match is an [`CoreError::ArchiveTimeout`].
    pub async fn find(&mut self, wal_segment: &str) -> Result<Option<String>, CoreError> {
        let prefix16 = &segment_prefix(wal_segment)[..16];
        let expression = match_expression(wal_segment);
        let regex = Regex::new(&expression).map_err(|e| CoreError::Assert(format!("bad WAL match expression: {e}")))?;

        let mut wait = Wait::new(self.timeout);
        let mut result = None;

        loop {
            if self.list.is_none() || self.prefix.as_deref() != Some(prefix16) {
                self.prefix = Some(prefix16.to_string());
                let entries = self.storage.list(&list_path(&self.archive_id, prefix16), InfoLevel::Basic, None).await?;
                let mut names: Vec<String> = entries.into_iter().map(|e| e.name).collect();
                names.sort();
                if self.single {
                    names.retain(|n| regex.is_match(n));
                }
                self.list = Some(names);
            }

            if let Some(list) = self.list.as_mut() {
                if !list.is_empty() {
                    let mut match_count = list.len();

                    if !self.single {
                        while !list.is_empty() && !regex.is_match(&list[0]) {
                            list.remove(0);
                        }
                        match_count = 0;
                        while match_count < list.len() && regex.is_match(&list[match_count]) {
                            match_count += 1;
                        }
                    }

                    if match_count > 1 {
                        let candidates = list[..match_count].to_vec();
                        self.list = None;
                        return Err(CoreError::ArchiveDuplicate {
                            segment: wal_segment.to_string(),
                            candidates,
                        });
                    }

                    if match_count == 1 {
                        result = Some(list[0].clone());
                    }

                    if !self.single {
                        while !list.is_empty() && regex.is_match(&list[0]) {
                            list.remove(0);
                        }
                    }
                }
            }

            if self.single || self.list.as_ref().is_some_and(|l| l.is_empty()) {
                self.list = None;
            }

            if result.is_some() || self.timeout.is_zero() {
                break;
            }
            if !wait.more_async().await {
                break;
            }
        }

        if result.is_none() && !self.timeout.is_zero() {
            return Err(CoreError::ArchiveTimeout {
                segment: wal_segment.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            });
        }
        Ok(result)
    }
}

/// Single-shot convenience matching `walSegmentFindOne`: construct a
/// single-mode finder, look up one segment, discard the finder.
pub async fn find_one<B: StorageBackend>(
    storage: &B,
    archive_id: &str,
    wal_segment: &str,
    timeout: Duration,
) -> Result<Option<String>, CoreError> {
    WalSegmentFind::new(storage, archive_id, true, timeout).find(wal_segment).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use pg_storage::backend::posix::PosixBackend;
    use pg_storage::StorageBase;

    fn segment_file(name: &str) -> String {
        format!("{name}-0000000000000000000000000000000000000000")
    }

    #[tokio::test]
    async fn finds_exactly_one_match() {
        let tmp = camino_tempfile::tempdir().unwrap();
        let archive_dir = tmp.path().join("archive/demo/0000000100000001");
        tokio::fs::create_dir_all(&archive_dir).await.unwrap();
        let name = segment_file("000000010000000100000001");
        tokio::fs::write(archive_dir.join(&name), b"").await.unwrap();

        let backend = PosixBackend::new(StorageBase {
            base_path: tmp.path().to_path_buf(),
            expression: pg_storage::repo_path_expression("demo"),
        });
        let mut finder = WalSegmentFind::new(&backend, "demo", true, Duration::ZERO);
        let result = finder.find("000000010000000100000001").await.unwrap();
        assert_eq!(result.as_deref(), Some(name.as_str()));
    }

    #[tokio::test]
    async fn duplicate_matches_error() {
        let tmp = camino_tempfile::tempdir().unwrap();
        let archive_dir = tmp.path().join("archive/demo/0000000100000001");
        tokio::fs::create_dir_all(&archive_dir).await.unwrap();
        tokio::fs::write(archive_dir.join(segment_file("000000010000000100000001")), b"")
            .await
            .unwrap();
        tokio::fs::write(
            archive_dir.join(format!("{}.gz", segment_file("000000010000000100000001"))),
            b"",
        )
        .await
        .unwrap();

        let backend = PosixBackend::new(StorageBase {
            base_path: tmp.path().to_path_buf(),
            expression: pg_storage::repo_path_expression("demo"),
        });
        let mut finder = WalSegmentFind::new(&backend, "demo", true, Duration::ZERO);
        let err = finder.find("000000010000000100000001").await.unwrap_err();
        assert!(matches!(err, CoreError::ArchiveDuplicate { .. }));
    }

    #[tokio::test]
    async fn zero_timeout_missing_segment_is_not_an_error() {
        let tmp = camino_tempfile::tempdir().unwrap();
        let archive_dir = tmp.path().join("archive/demo/0000000100000001");
        tokio::fs::create_dir_all(&archive_dir).await.unwrap();

        let backend = PosixBackend::new(StorageBase {
            base_path: tmp.path().to_path_buf(),
            expression: pg_storage::repo_path_expression("demo"),
        });
        let mut finder = WalSegmentFind::new(&backend, "demo", true, Duration::ZERO);
        let result = finder.find("000000010000000100000001").await.unwrap();
        assert!(result.is_none());
    }
}
