//! Storage interface and backends (spec §4.4): POSIX, S3, Azure, GCS,
//! CIFS, and a framed-RPC remote proxy, unified behind one capability-
//! gated trait (generalizing the teacher's `RemoteStorage` trait, spec §9
//! "Replacing the `THIS_VOID` / interface pattern").

pub mod backend;
pub mod error;
pub mod info;
pub mod path;
pub mod read;
pub mod write;

use std::time::SystemTime;

use camino::Utf8Path;
use pg_util::CoreError;

pub use info::{EntryType, InfoLevel, ListEntry, StorageInfo};
pub use path::{repo_path_expression, spool_path_expression, PathExpressionCallback};
pub use read::StorageRead;
pub use write::{NewWriteParams, StorageWrite};

/// Feature bitset a backend declares (spec §4.4 "Each backend declares a
/// feature bitset"). Operations outside a backend's set either no-op
/// (object stores have no `path_create`) or assert-fail; which of the two
/// is up to the backend, matching the source's per-call behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub path: bool,
    pub compress: bool,
    pub hardlink: bool,
    pub symlink: bool,
    pub info_detail: bool,
    pub versioning: bool,
    pub truncate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Hard,
    Soft,
}

#[derive(Debug, Clone, Default)]
pub struct PathCreateParams {
    pub error_on_exists: bool,
    pub no_parent_create: bool,
    pub mode: Option<u32>,
}

/// A storage backend implements some subset of this interface; unsupported
/// operations return `CoreError::Assert` (per spec, assertion-fail is the
/// required behavior when a no-op isn't sensible).
#[allow(async_fn_in_trait)]
pub trait StorageBackend: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    async fn info(&self, path: &str, level: InfoLevel, follow_link: bool) -> Result<StorageInfo, CoreError>;

    async fn list(&self, path: &str, level: InfoLevel, target_time: Option<SystemTime>) -> Result<Vec<ListEntry>, CoreError>;

    async fn new_read(
        &self,
        path: &str,
        ignore_missing: bool,
        offset: u64,
        limit: Option<u64>,
    ) -> Result<Option<StorageRead>, CoreError>;

    async fn new_write(&self, path: &str, params: NewWriteParams) -> Result<StorageWrite, CoreError>;

    async fn path_create(&self, _path: &str, _params: PathCreateParams) -> Result<(), CoreError> {
        Err(unsupported("path_create"))
    }

    async fn path_remove(&self, _path: &str, _recurse: bool) -> Result<(), CoreError> {
        Err(unsupported("path_remove"))
    }

    async fn path_sync(&self, _path: &str) -> Result<(), CoreError> {
        Err(unsupported("path_sync"))
    }

    async fn remove(&self, path: &str, error_on_missing: bool) -> Result<(), CoreError>;

    async fn link_create(&self, _target: &str, _link_path: &str, _link_type: LinkType) -> Result<(), CoreError> {
        Err(unsupported("link_create"))
    }
}

fn unsupported(op: &'static str) -> CoreError {
    CoreError::Assert(format!("operation '{op}' is not supported by this storage backend"))
}

/// Base path + path-expression callback shared by every backend
/// constructor (spec §6 "Storage path expressions").
#[derive(Clone)]
pub struct StorageBase {
    pub base_path: camino::Utf8PathBuf,
    pub expression: PathExpressionCallback,
}

impl StorageBase {
    pub fn resolve(&self, raw: &str) -> Result<camino::Utf8PathBuf, CoreError> {
        path::resolve(&self.base_path, raw, &self.expression)
    }
}

pub fn default_base(base_path: impl AsRef<Utf8Path>) -> StorageBase {
    StorageBase {
        base_path: base_path.as_ref().to_path_buf(),
        expression: std::sync::Arc::new(|_: &str| None),
    }
}
