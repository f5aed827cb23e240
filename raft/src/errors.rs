use crate::types::LogPos;

/// Externally-visible failures a caller (client router, operator) can
/// actually observe. Stale-term and log-mismatch conditions never reach this
/// type: they're absorbed inside the replica loop and turned into protocol
/// actions (a rejection response, a backtracked `next_pos`) instead, and
/// not-leader/not-leader-anymore is reported to clients via `ErrorCode`
/// rather than through this enum.
#[derive(thiserror::Error, Debug)]
pub enum ReplicaError {
	#[error("rpc timed out")]
	Timeout,

	#[error("transport error: {0}")]
	TransportError(String),

	#[error("log or state file io failed: {0}")]
	IoError(#[from] raft_log::LogStoreError),

	#[error("invalid position: {0}")]
	InvalidPosition(LogPos),
}

pub type Result<T> = std::result::Result<T, ReplicaError>;
