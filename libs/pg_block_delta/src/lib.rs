//! Block map encoding and block-delta planning/streaming (spec §4.6),
//! plus the on-disk super-block layout (spec §6) blocks are framed in.
//!
//! Built standalone from `pg_io`'s [`Filter`](pg_io::filter::Filter)
//! chain and buffer types; it has no dependency on `pg_storage` because
//! everything here operates on an already-open byte stream positioned
//! at the start of a bundle read, the same boundary `pg_io::read`/`write`
//! draw between "move bytes" and "know what a backend is".

pub mod codec;
pub mod delta;
pub mod map;

pub use delta::{compute_delta, stream_blocks, BlockDeltaRead, BlockDeltaWrite, BlockPlan, SuperBlockPlan};
pub use map::{BlockMap, BlockMapEntry, CHECKSUM_LEN};
