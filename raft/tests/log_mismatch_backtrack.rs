//! S5: a replica holding an uncommitted suffix from one leader's term gets
//! that suffix truncated and overwritten once a later leader's term
//! supersedes it — and the commit observer is only ever told about the
//! entries that actually survive, never the discarded ones, and never
//! twice.
//!
//! This drives a single `Replica` directly through two "leaders'" worth of
//! `AppendEntries`, the same way `raft::replica`'s own unit tests do,
//! because the property under test (Log Matching, §8 invariant 3, plus the
//! observer's exactly-once guarantee) is deterministic given a fixed
//! sequence of RPCs and doesn't need a running cluster to exercise.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;

use raft::commit::CommitObserver;
use raft::config::Config;
use raft::types::{AppendRequest, LogEntry, LogPos};
use raft::Replica;

struct RecordingObserver(Mutex<Vec<(LogPos, Vec<u8>)>>);

impl RecordingObserver {
	fn new() -> Arc<Self> {
		Arc::new(RecordingObserver(Mutex::new(Vec::new())))
	}

	fn payloads(&self) -> Vec<Vec<u8>> {
		self.0.lock().unwrap().iter().map(|(_, p)| p.clone()).collect()
	}
}

impl CommitObserver for RecordingObserver {
	fn on_committed(&self, pos: LogPos, payload: &[u8]) {
		self.0.lock().unwrap().push((pos, payload.to_vec()));
	}
}

#[test]
fn conflicting_uncommitted_suffix_is_discarded_and_never_reported_committed() {
	let dir = tempfile::tempdir().unwrap();
	let config = Config { data_dir: dir.path().to_path_buf(), block_size: 160, ..Config::default() };
	let observer = RecordingObserver::new();
	let mut replica = Replica::new(2, vec![0, 1], config, observer.clone()).unwrap();

	// The term-1 leader (node 0) replicates two entries that never reach a
	// quorum before it is deposed.
	let stale = AppendRequest {
		term: 1,
		leader_id: 0,
		prev_pos: LogPos::ZERO,
		prev_term: 0,
		entries: vec![LogEntry::command(1, Bytes::from_static(b"stale-1")), LogEntry::command(1, Bytes::from_static(b"stale-2"))],
		leader_commit: None,
	};
	let (resp, _) = replica.handle_append(stale, Instant::now()).unwrap();
	assert!(resp.success);
	assert!(observer.payloads().is_empty(), "nothing has been reported committed yet");

	// A term-2 leader (node 1) wins an election in F's absence and
	// replicates a different entry at the same starting position. F must
	// adopt the new term, discard its conflicting suffix, and accept the
	// new entry.
	let fresh_entry = LogEntry::command(2, Bytes::from_static(b"fresh-1"));
	let fresh = AppendRequest { term: 2, leader_id: 1, prev_pos: LogPos::ZERO, prev_term: 0, entries: vec![fresh_entry], leader_commit: None };
	let (resp2, _) = replica.handle_append(fresh, Instant::now()).unwrap();
	assert!(resp2.success, "the term-2 leader's entry must be accepted despite the conflicting local suffix");

	// The new leader's heartbeat now reports its commit, which (per the
	// safety gate) is only ever computed over the replica's own current
	// term's entries on the leader side; here we just confirm the follower
	// advances to what it's told and observes exactly the surviving entry.
	let heartbeat = AppendRequest { term: 2, leader_id: 1, prev_pos: resp2.match_pos, prev_term: 2, entries: vec![], leader_commit: Some(resp2.match_pos) };
	let (resp3, _) = replica.handle_append(heartbeat, Instant::now()).unwrap();
	assert!(resp3.success);

	assert_eq!(observer.payloads(), vec![b"fresh-1".to_vec()], "only the surviving entry is ever reported committed, exactly once");
}
