//! Buffered, filterable I/O primitives shared by the network and storage
//! layers: growable buffers, retry backoff timing, and a filter-chain
//! abstraction (hashing, compression, encryption) wrapped around any
//! `tokio::io::{AsyncRead, AsyncWrite}` driver (spec §3, §4.1).

pub mod buffer;
pub mod filter;
pub mod filters;
pub mod io;
pub mod wait;

pub use buffer::Buffer;
pub use filter::{Filter, FilterGroup, FilterResult};
pub use filters::{Codec, CompressFilter, CryptoError, DecompressFilter, DecryptFilter, EncryptFilter, HashAlgorithm, HashFilter};
pub use io::{IoRead, IoWrite};
pub use wait::Wait;
