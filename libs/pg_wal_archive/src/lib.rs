//! WAL segment discovery (spec §4.5) and the async archive push/get
//! status-file protocol (spec §6), built on `pg_storage`'s storage
//! interface the way the teacher's higher-level crates build on
//! `remote_storage`.

pub mod finder;
pub mod segment;
pub mod status;

pub use finder::{find_one, WalSegmentFind};
pub use segment::{is_partial, is_segment, next_segment, parse, PgVersion, WalSegment, PG_VERSION_92, PG_VERSION_93};
pub use status::{check_status, write_error, write_ok, SpoolDirection};
