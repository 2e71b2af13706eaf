//! Storage write stream (spec §4.4 `new_write(path, modes, owners, times,
//! create_path, sync_file, sync_path, atomic, truncate)`).
//!
//! Atomicity, final rename/complete-multipart/put-blocklist, and
//! directory sync are backend-specific, so they're modeled as a single
//! `finalize` closure invoked from `close()` after the filter group and
//! driver have flushed — this is the "teardown order follows construction
//! order reversed" shape from spec §9.

use std::pin::Pin;

use pg_io::{FilterGroup, IoWrite};
use pg_util::CoreError;
use tokio::io::AsyncWrite;

pub type DynAsyncWrite = Pin<Box<dyn AsyncWrite + Unpin + Send>>;
pub type FinalizeFn = Box<dyn FnOnce() -> futures::future::BoxFuture<'static, Result<(), CoreError>> + Send>;

#[derive(Debug, Clone, Default)]
pub struct NewWriteParams {
    pub mode: Option<u32>,
    pub user: Option<String>,
    pub group: Option<String>,
    pub modify_time: Option<std::time::SystemTime>,
    pub create_path: bool,
    pub sync_file: bool,
    pub sync_path: bool,
    pub atomic: bool,
    pub truncate: bool,
}

pub struct StorageWrite {
    io: IoWrite<DynAsyncWrite>,
    finalize: Option<FinalizeFn>,
}

impl StorageWrite {
    pub fn new(driver: DynAsyncWrite, group: FilterGroup, stage_capacity: usize, finalize: FinalizeFn) -> Self {
        Self {
            io: IoWrite::new(driver, group, stage_capacity),
            finalize: Some(finalize),
        }
    }

    pub async fn write(&mut self, buf: &[u8]) -> Result<(), CoreError> {
        self.io.write(buf).await
    }

    pub async fn close(&mut self) -> Result<(), CoreError> {
        self.io.close().await?;
        if let Some(finalize) = self.finalize.take() {
            finalize().await?;
        }
        Ok(())
    }
}
