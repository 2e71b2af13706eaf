//! CIFS/SMB-mounted backend (spec §4.4 "CIFS backend", supplemented from
//! `original_source/src/storage/cifs/storage.c`): identical to the POSIX
//! backend except `path_sync` is a no-op, since `fsync()` on a directory
//! over SMB is either unsupported or unreliable depending on the client
//! mount options.

use std::time::SystemTime;

use pg_util::CoreError;

use crate::info::{InfoLevel, ListEntry, StorageInfo};
use crate::read::StorageRead;
use crate::write::{NewWriteParams, StorageWrite};
use crate::{Capabilities, LinkType, PathCreateParams, StorageBackend, StorageBase};

use super::posix::PosixBackend;

pub struct CifsBackend {
    inner: PosixBackend,
}

impl CifsBackend {
    pub fn new(base: StorageBase) -> Self {
        Self {
            inner: PosixBackend::new(base),
        }
    }
}

impl StorageBackend for CifsBackend {
    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    async fn info(&self, path: &str, level: InfoLevel, follow_link: bool) -> Result<StorageInfo, CoreError> {
        self.inner.info(path, level, follow_link).await
    }

    async fn list(&self, path: &str, level: InfoLevel, target_time: Option<SystemTime>) -> Result<Vec<ListEntry>, CoreError> {
        self.inner.list(path, level, target_time).await
    }

    async fn new_read(
        &self,
        path: &str,
        ignore_missing: bool,
        offset: u64,
        limit: Option<u64>,
    ) -> Result<Option<StorageRead>, CoreError> {
        self.inner.new_read(path, ignore_missing, offset, limit).await
    }

    async fn new_write(&self, path: &str, params: NewWriteParams) -> Result<StorageWrite, CoreError> {
        self.inner.new_write(path, params).await
    }

    async fn path_create(&self, path: &str, params: PathCreateParams) -> Result<(), CoreError> {
        self.inner.path_create(path, params).await
    }

    async fn path_remove(&self, path: &str, recurse: bool) -> Result<(), CoreError> {
        self.inner.path_remove(path, recurse).await
    }

    /// No-op: see module docs.
    async fn path_sync(&self, _path: &str) -> Result<(), CoreError> {
        Ok(())
    }

    async fn remove(&self, path: &str, error_on_missing: bool) -> Result<(), CoreError> {
        self.inner.remove(path, error_on_missing).await
    }

    async fn link_create(&self, target: &str, link_path: &str, link_type: LinkType) -> Result<(), CoreError> {
        self.inner.link_create(target, link_path, link_type).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::default_base;

    #[tokio::test]
    async fn path_sync_is_a_no_op() {
        let tmp = camino_tempfile::tempdir().unwrap();
        let backend = CifsBackend::new(default_base(tmp.path()));
        backend.path_sync(".").await.unwrap();
    }
}
