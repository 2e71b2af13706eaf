//! Storage info result and its detail-level selector (spec §4.4
//! "Operations": `info(path, level, follow_link?)`).

use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoLevel {
    /// Existence + type only.
    Basic,
    /// Full metadata: size, mtime, mode/user/group where the backend has it.
    Detail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    File,
    Path,
    Link,
    Special,
}

#[derive(Debug, Clone)]
pub struct StorageInfo {
    pub exists: bool,
    pub file_type: EntryType,
    /// `None` unless `level == Detail` or the backend always has it cheaply.
    pub size: Option<u64>,
    pub modify_time: Option<SystemTime>,
    pub mode: Option<u32>,
    pub user: Option<String>,
    pub group: Option<String>,
    /// Resolved link target, when `file_type == Link`.
    pub link_destination: Option<String>,
}

impl StorageInfo {
    pub fn missing() -> Self {
        Self {
            exists: false,
            file_type: EntryType::File,
            size: None,
            modify_time: None,
            mode: None,
            user: None,
            group: None,
            link_destination: None,
        }
    }
}

/// One entry from a `list()` call.
#[derive(Debug, Clone)]
pub struct ListEntry {
    pub name: String,
    pub info: StorageInfo,
}
