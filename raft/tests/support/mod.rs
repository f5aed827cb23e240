//! Shared harness for the multi-node scenarios in spec §8 (S1-S6): an
//! in-process cluster of `Replica` + `raft::driver` tasks wired over one
//! [`ChannelHub`], the same shape `raft-cli`'s demo cluster uses, plus a
//! recording [`CommitObserver`] so a test can assert on what each node
//! actually delivered and in what order.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use raft::commit::CommitObserver;
use raft::config::Config;
use raft::transport::{ChannelHub, ChannelTransport, Transport};
use raft::types::{ErrorCode, LogPos, NodeId, SaveRequest};
use raft::Replica;

/// A `CommitObserver` that records every delivery in the order it arrived,
/// for a single node.
pub struct RecordingObserver {
	committed: Mutex<Vec<(LogPos, Vec<u8>)>>,
}

impl RecordingObserver {
	pub fn new() -> Arc<Self> {
		Arc::new(RecordingObserver { committed: Mutex::new(Vec::new()) })
	}

	pub fn payloads(&self) -> Vec<Vec<u8>> {
		self.committed.lock().unwrap().iter().map(|(_, p)| p.clone()).collect()
	}

	pub fn len(&self) -> usize {
		self.committed.lock().unwrap().len()
	}
}

impl CommitObserver for RecordingObserver {
	fn on_committed(&self, pos: LogPos, payload: &[u8]) {
		let mut committed = self.committed.lock().unwrap();
		// Never the same entry twice, never out of order (spec §5).
		if let Some((last, _)) = committed.last() {
			assert!(pos > *last, "commit observer saw {} after {}, out of order", pos, last);
		}
		committed.push((pos, payload.to_vec()));
	}
}

struct RunningNode {
	join: JoinHandle<()>,
	status: watch::Receiver<String>,
}

/// One node's identity and durable state across however many times it gets
/// stopped and restarted during a test; `observer` is shared across restarts
/// so a test can see what it ever committed, cluster-lifetime.
struct NodeSlot {
	dir: PathBuf,
	observer: Arc<RecordingObserver>,
	running: Option<RunningNode>,
}

pub struct TestCluster {
	hub: Arc<ChannelHub>,
	nodes: Vec<NodeSlot>,
	_base_dir: TempDir,
	election_timeout_ms: u64,
}

impl TestCluster {
	/// Starts `n` replicas, all healthy, wired over a shared `ChannelHub`.
	/// `election_timeout_ms` is kept small (tens of milliseconds) so tests
	/// converge quickly; randomised per spec §4.C, so actual timeouts are
	/// drawn from `[election_timeout_ms, 2*election_timeout_ms)`.
	pub async fn start(n: usize, election_timeout_ms: u64) -> Self {
		let base_dir = tempfile::tempdir().unwrap();
		let hub = ChannelHub::new();
		let mut cluster = TestCluster {
			hub,
			nodes: (0..n)
				.map(|i| NodeSlot { dir: base_dir.path().join(format!("node-{}", i)), observer: RecordingObserver::new(), running: None })
				.collect(),
			_base_dir: base_dir,
			election_timeout_ms,
		};
		for i in 0..n {
			cluster.start_node(i).await;
		}
		cluster
	}

	pub fn len(&self) -> usize {
		self.nodes.len()
	}

	fn peers_of(&self, id: NodeId) -> Vec<NodeId> {
		(0..self.nodes.len() as NodeId).filter(|p| *p != id).collect()
	}

	fn request_timeout(&self) -> Duration {
		Duration::from_millis(self.election_timeout_ms * 8)
	}

	pub fn observer(&self, idx: usize) -> Arc<RecordingObserver> {
		self.nodes[idx].observer.clone()
	}

	/// (Re)starts node `idx` against its existing data directory: a fresh
	/// `Replica::new` recovers `current_term`/`voted_for` and the log from
	/// disk exactly as a real process restart would (spec §3's durable
	/// state + log file are both on disk, keyed only by `data_dir`).
	pub async fn start_node(&mut self, idx: usize) {
		assert!(self.nodes[idx].running.is_none(), "node {} is already up", idx);
		let id = idx as NodeId;
		let config = Config {
			data_dir: self.nodes[idx].dir.clone(),
			election_timeout_ms: self.election_timeout_ms,
			request_timeout_ms: self.request_timeout().as_millis() as u64,
			block_size: 4096,
			..Config::default()
		};

		// `DirLock` is released when the previous task's `Replica` drops;
		// `stop_node` aborts that task but cancellation lands on the next
		// `.await` point, so give it a moment before retrying the acquire.
		let mut replica = None;
		for _ in 0..50 {
			match Replica::new(id, self.peers_of(id), config.clone(), self.nodes[idx].observer.clone()) {
				Ok(r) => {
					replica = Some(r);
					break;
				}
				Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
			}
		}
		let replica = replica.unwrap_or_else(|| panic!("node {} data directory still locked", idx));

		let inbound = self.hub.register(id);
		let transport = Arc::new(ChannelTransport::with_node_id(self.hub.clone(), self.request_timeout(), id));
		let (join, status) = raft::driver::spawn(replica, inbound, transport);
		self.nodes[idx].running = Some(RunningNode { join, status });
	}

	pub async fn stop_node(&mut self, idx: usize) {
		if let Some(node) = self.nodes[idx].running.take() {
			self.hub.unregister(idx as NodeId);
			node.join.abort();
		}
	}

	pub fn pause_node(&self, idx: usize) {
		self.hub.pause(idx as NodeId);
	}

	pub fn resume_node(&self, idx: usize) {
		self.hub.resume(idx as NodeId);
	}

	fn status_of(&self, idx: usize) -> Option<String> {
		self.nodes[idx].running.as_ref().map(|n| n.status.borrow().clone())
	}

	fn leader_from_status(s: &str) -> bool {
		s.contains("role=Leader")
	}

	/// Polls every running node's status string until exactly one reports
	/// `role=Leader`, or `timeout` elapses.
	pub async fn wait_for_leader(&self, timeout: Duration) -> Option<NodeId> {
		let deadline = Instant::now() + timeout;
		while Instant::now() < deadline {
			for idx in 0..self.nodes.len() {
				if let Some(s) = self.status_of(idx) {
					if Self::leader_from_status(&s) {
						return Some(idx as NodeId);
					}
				}
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		None
	}

	/// Polls until node `idx`'s observer has recorded at least `n` commits,
	/// or `timeout` elapses.
	pub async fn wait_for_commits(&self, idx: usize, n: usize, timeout: Duration) -> bool {
		let deadline = Instant::now() + timeout;
		while Instant::now() < deadline {
			if self.nodes[idx].observer.len() >= n {
				return true;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		false
	}

	/// A minimal client loop for tests that don't need the full
	/// `raft-client` router: tries `candidate`, follows `NotLeader` hints,
	/// otherwise round-robins, bounded by `timeout`. Returns the committed
	/// position on success.
	pub async fn submit(&self, payload: &[u8], timeout: Duration) -> Result<LogPos, String> {
		let transport = ChannelTransport::new(self.hub.clone(), self.request_timeout());
		let deadline = Instant::now() + timeout;
		let mut candidate: NodeId = 0;
		let mut last_error = String::from("not attempted");

		loop {
			if Instant::now() >= deadline {
				return Err(format!("deadline exceeded, last error: {}", last_error));
			}
			let req = SaveRequest { payload: Bytes::copy_from_slice(payload), client_id: None, request_id: None };
			match transport.send_save(candidate, req).await {
				Ok(resp) => match resp.error_code {
					ErrorCode::Ok => return Ok(resp.committed_pos.expect("Ok carries a position")),
					ErrorCode::NotLeader | ErrorCode::NotLeaderAnymore => {
						last_error = resp.error_reason.unwrap_or_default();
						candidate = resp.leader_hint.unwrap_or((candidate + 1) % self.nodes.len() as NodeId);
					}
					_ => {
						last_error = resp.error_reason.unwrap_or_default();
						candidate = (candidate + 1) % self.nodes.len() as NodeId;
						tokio::time::sleep(Duration::from_millis(10)).await;
					}
				},
				Err(e) => {
					last_error = e.to_string();
					candidate = (candidate + 1) % self.nodes.len() as NodeId;
					tokio::time::sleep(Duration::from_millis(10)).await;
				}
			}
		}
	}
}
