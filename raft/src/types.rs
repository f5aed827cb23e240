use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub use raft_log::LogPos;

/// A cluster-wide monotonically increasing term number.
pub type Term = i64;

/// Stable peer identity, assigned at startup, in `[0, N)`.
pub type NodeId = i32;

/// `voted_for`'s "nobody yet this term" value.
pub const NO_VOTE: NodeId = -1;

/// `leader_id`'s "no known leader" value.
pub const NO_LEADER: NodeId = -1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
	Follower,
	Candidate,
	Leader,
}

/// A record in the replicated log.
///
/// Raft's Log Matching Property requires that two entries at the same
/// `LogPos` with the same `term` be byte-identical, and so are all entries
/// preceding them; this type only carries data, never a position, since the
/// position is assigned by the log store on append.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
	pub term: Term,
	#[serde(with = "bytes_as_vec")]
	pub payload: Bytes,
	pub client_id: Option<i64>,
	pub request_id: Option<i64>,
}

mod bytes_as_vec {
	use bytes::Bytes;
	use serde::{Deserialize, Deserializer, Serialize, Serializer};

	pub fn serialize<S: Serializer>(bytes: &Bytes, s: S) -> Result<S::Ok, S::Error> {
		bytes.as_ref().serialize(s)
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
		Ok(Bytes::from(Vec::<u8>::deserialize(d)?))
	}
}

impl LogEntry {
	pub fn command(term: Term, payload: Bytes) -> Self {
		LogEntry { term, payload, client_id: None, request_id: None }
	}

	/// Entries are framed on disk as JSON, matching the durable state file's
	/// format and keeping the log human-inspectable with a text editor.
	pub fn encode(&self) -> Vec<u8> {
		serde_json::to_vec(self).expect("LogEntry always serializes")
	}

	pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
		serde_json::from_slice(bytes)
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteRequest {
	pub term: Term,
	pub candidate_id: NodeId,
	pub last_log_pos: LogPos,
	pub last_log_term: Term,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteResponse {
	pub term: Term,
	pub vote_granted: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendRequest {
	pub term: Term,
	pub leader_id: NodeId,
	pub prev_pos: LogPos,
	pub prev_term: Term,
	pub entries: Vec<LogEntry>,
	/// The leader's own `commit_pos`, or `None` if the leader hasn't
	/// committed anything yet. Plain `LogPos` can't carry this distinction:
	/// `LogPos::ZERO` is both "nothing committed" and the real position of
	/// the log's first record, so the wire format says so explicitly instead
	/// of asking the follower to infer it.
	pub leader_commit: Option<LogPos>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendResponse {
	pub term: Term,
	pub success: bool,
	pub match_pos: LogPos,
	pub conflict_hint_pos: Option<LogPos>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SaveRequest {
	#[serde(with = "bytes_as_vec")]
	pub payload: Bytes,
	pub client_id: Option<i64>,
	pub request_id: Option<i64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
	Ok,
	NotLeader,
	NotLeaderAnymore,
	Timeout,
	TransportError,
	IoError,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SaveResponse {
	pub committed_pos: Option<LogPos>,
	pub leader_hint: Option<NodeId>,
	pub error_code: ErrorCode,
	pub error_reason: Option<String>,
}
