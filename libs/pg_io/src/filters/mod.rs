pub mod compress;
pub mod crypto;
pub mod hash;

pub use compress::{CompressFilter, Codec, DecompressFilter};
pub use crypto::{CryptoError, DecryptFilter, EncryptFilter};
pub use hash::{HashAlgorithm, HashFilter};
