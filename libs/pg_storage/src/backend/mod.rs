pub mod azure;
pub mod cifs;
pub mod gcs;
pub mod posix;
pub mod remote;
pub mod s3;

pub use azure::AzureBackend;
pub use cifs::CifsBackend;
pub use gcs::GcsBackend;
pub use posix::PosixBackend;
pub use remote::RemoteBackend;
pub use s3::S3Backend;
