//! Cross-cutting pieces shared by the storage, net and archive crates:
//! the error taxonomy (spec §7), a process-wide stats counter map, and
//! the narrow boundary traits the core consumes from its host (spec §1).

mod boundary;
mod error;
mod stats;

pub use boundary::{Clock, ConfigSource, LogLevel, Logger};
pub use error::{CoreError, ErrorKind};
pub use stats::StatCounters;
