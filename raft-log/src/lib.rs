//! Durable, append-only record log used by the raft crate.
//!
//! A log is a single growing file made of back-to-back framed records. Each
//! record is `{4-byte LE length, 4-byte LE CRC32C of the payload, payload}`,
//! optionally preceded by zero-padding so that it doesn't straddle a
//! `block_size` boundary when it comfortably fits in one. Recovery never
//! trusts block alignment: it always re-derives record boundaries from the
//! length + checksum fields, falling back to block-boundary skipping only to
//! step over padding gaps (see `store::LogStore::open` for the scan).

mod store;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use store::{LogReader, LogStore};

/// Size of a record header: 4 bytes length + 4 bytes CRC32C.
pub(crate) const HEADER_LEN: u64 = 8;

/// Opaque, totally-ordered identifier for a byte offset inside the log.
///
/// Names the *start* of a record. `LogPos::ZERO` is the distinguished
/// empty-log sentinel and orders before every real position. `file_ordinal`
/// is carried for forward compatibility with log file rollover; this
/// implementation never rolls the log over, so it is always zero today.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogPos {
	pub file_ordinal: u32,
	pub offset: u64,
}

impl LogPos {
	pub const ZERO: LogPos = LogPos { file_ordinal: 0, offset: 0 };

	pub fn is_zero(&self) -> bool {
		*self == LogPos::ZERO
	}
}

impl fmt::Display for LogPos {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.file_ordinal, self.offset)
	}
}

impl Default for LogPos {
	fn default() -> Self {
		LogPos::ZERO
	}
}

#[derive(thiserror::Error, Debug)]
pub enum LogStoreError {
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),

	#[error("position {0} does not align with a record boundary still in the log")]
	InvalidPosition(LogPos),

	#[error("log store only supports non-empty payloads")]
	EmptyPayload,
}

pub type Result<T> = std::result::Result<T, LogStoreError>;

/// A single decoded record read back from the log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
	pub pos: LogPos,
	pub payload: Vec<u8>,
}
