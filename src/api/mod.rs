//! Purpose: Define the public Rust API boundary for linespool.
//! Exports: Command log, record assembly, protocol, and server types.
//! Role: The one public path for the binary and integration tests.
//! Invariants: Internal module layout may move; this surface stays additive.

#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::log::{CommandLog, DEFAULT_CAPACITY};
pub use crate::core::record::{DELIMITER, PendingRecord, Record};
pub use crate::protocol::{Inbound, SEEK_PREFIX, SeekRequest, classify_record};
pub use crate::serve::{DEFAULT_PORT, ServeConfig, Server, ShutdownHandle};
