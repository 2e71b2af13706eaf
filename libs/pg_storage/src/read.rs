//! Storage read stream with the retry wrapper (spec §4.4 "Retry wrapper").
//!
//! On failure the wrapper closes the underlying driver, advances
//! `offset += bytes_already_read`, shrinks `limit -= bytes_already_read`,
//! and reopens through the backend's `reopen` closure. After the first
//! successful open, `ignore_missing` is cleared so a subsequent
//! disappearance is a hard error (spec: "a subsequent disappearance is a
//! hard error").

use std::pin::Pin;
use std::sync::Arc;

use futures::future::BoxFuture;
use pg_io::{Buffer, FilterGroup, IoRead};
use pg_util::CoreError;
use tokio::io::AsyncRead;

pub type DynAsyncRead = Pin<Box<dyn AsyncRead + Unpin + Send>>;

/// Re-dials the backend's underlying driver at a new `(offset, limit)`.
pub type ReopenFn = Arc<dyn Fn(u64, Option<u64>) -> BoxFuture<'static, Result<DynAsyncRead, CoreError>> + Send + Sync>;

const MAX_ATTEMPTS: u32 = 3;

/// Builds a fresh `FilterGroup` for a (re)open — called once at
/// construction and again on every reopen, since a filter's internal
/// state (a partial hash, a half-decoded compression frame) cannot be
/// resumed mid-stream; only the raw byte position can.
pub type GroupFactory = Arc<dyn Fn() -> FilterGroup + Send + Sync>;

pub struct StorageRead {
    io: IoRead<DynAsyncRead>,
    reopen: ReopenFn,
    group_factory: GroupFactory,
    offset: u64,
    limit: Option<u64>,
    bytes_delivered: u64,
    ignore_missing: bool,
    attempts_used: u32,
}

impl StorageRead {
    pub fn new(
        driver: DynAsyncRead,
        group_factory: GroupFactory,
        reopen: ReopenFn,
        offset: u64,
        limit: Option<u64>,
        ignore_missing: bool,
    ) -> Self {
        let group = group_factory();
        Self {
            io: IoRead::new(driver, group),
            reopen,
            group_factory,
            offset,
            limit,
            bytes_delivered: 0,
            ignore_missing,
            attempts_used: 1,
        }
    }

    /// ∀ read with retry=true that fails on byte N then succeeds: bytes
    /// delivered form prefix + suffix with no duplicates and no gaps —
    /// guaranteed here because `bytes_delivered` only ever grows by what
    /// was actually handed to the caller before the failure.
    pub async fn read(&mut self, out: &mut Buffer) -> Result<usize, CoreError> {
        loop {
            match self.io.read(out).await {
                Ok(n) => {
                    self.bytes_delivered += n as u64;
                    return Ok(n);
                }
                Err(e) => {
                    self.attempts_used += 1;
                    if self.attempts_used > MAX_ATTEMPTS {
                        return Err(e);
                    }
                    self.reopen_at_current_offset().await?;
                }
            }
        }
    }

    async fn reopen_at_current_offset(&mut self) -> Result<(), CoreError> {
        let new_offset = self.offset + self.bytes_delivered;
        let new_limit = self.limit.map(|l| l.saturating_sub(self.bytes_delivered));
        let driver = (self.reopen)(new_offset, new_limit).await?;
        self.ignore_missing = false;
        self.io = IoRead::new(driver, (self.group_factory)());
        Ok(())
    }

    pub fn is_eof(&self) -> bool {
        self.io.is_eof()
    }
}
