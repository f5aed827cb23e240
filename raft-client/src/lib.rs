//! The client-side half of spec §4.G: routes a write to whichever peer is
//! currently leading the cluster, tracking the last leader seen and falling
//! back to round-robin probing, on its own `Transport` distinct from the
//! replica's peer-to-peer one (see SPEC_FULL.md §9: "independent pools
//! chosen").
//!
//! This crate does not attempt deduplication: a `Save` that timed out may
//! still have committed. Callers that need exactly-once delivery must embed
//! an idempotency key in the payload and deduplicate in their own
//! [`raft::commit::CommitObserver`].

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use raft::transport::Transport;
use raft::types::{ErrorCode, LogPos, NodeId, SaveRequest, NO_LEADER};

#[derive(thiserror::Error, Debug)]
pub enum RouterError {
	#[error("no peers configured")]
	NoPeers,
	#[error("deadline exceeded after {attempts} attempt(s), last error: {last_error}")]
	DeadlineExceeded { attempts: u32, last_error: String },
	#[error("retries exhausted after {attempts} attempt(s), last error: {last_error}")]
	RetriesExhausted { attempts: u32, last_error: String },
}

/// Tunables for [`Router::submit`], mirroring `spec.md` §4.G's defaults
/// (`num_retries`, the 50ms initial backoff) and `Config`'s
/// `request_timeout_ms`.
#[derive(Clone, Debug)]
pub struct RouterConfig {
	pub num_retries: u32,
	pub request_timeout: Duration,
	pub initial_backoff: Duration,
	pub max_backoff: Duration,
}

impl Default for RouterConfig {
	fn default() -> Self {
		RouterConfig {
			num_retries: 5,
			request_timeout: Duration::from_millis(120_000),
			initial_backoff: Duration::from_millis(50),
			max_backoff: Duration::from_secs(2),
		}
	}
}

/// Routes writes to the cluster. Cheap to clone-share via `Arc`: the only
/// mutable state is the last-known-leader hint and the round-robin cursor,
/// both plain atomics so concurrent callers never block each other.
pub struct Router {
	peers: Vec<NodeId>,
	transport: Arc<dyn Transport>,
	config: RouterConfig,
	last_leader: AtomicI32,
	round_robin: AtomicUsize,
}

impl Router {
	pub fn new(peers: Vec<NodeId>, transport: Arc<dyn Transport>, config: RouterConfig) -> Self {
		Router { peers, transport, config, last_leader: AtomicI32::new(NO_LEADER), round_robin: AtomicUsize::new(0) }
	}

	fn next_round_robin(&self) -> NodeId {
		let idx = self.round_robin.fetch_add(1, Ordering::Relaxed) % self.peers.len();
		self.peers[idx]
	}

	fn pick_initial_candidate(&self) -> NodeId {
		let hint = self.last_leader.load(Ordering::Relaxed);
		if hint != NO_LEADER {
			hint
		} else {
			self.next_round_robin()
		}
	}

	/// Delivers `payload` as a committed log entry, retrying per spec
	/// §4.G's algorithm, and returns the position it committed at. Returns
	/// once, either with the committed position or with the reason delivery
	/// was given up on — there is no separate callback type in this
	/// implementation; an `async fn` already invokes its continuation
	/// exactly once.
	pub async fn submit(&self, payload: Bytes, client_id: Option<i64>, request_id: Option<i64>, deadline: Instant) -> Result<LogPos, RouterError> {
		if self.peers.is_empty() {
			return Err(RouterError::NoPeers);
		}

		let mut candidate = self.pick_initial_candidate();
		let mut backoff = self.config.initial_backoff;
		let mut last_error = String::from("not attempted");

		for attempt in 0..=self.config.num_retries {
			if Instant::now() >= deadline {
				return Err(RouterError::DeadlineExceeded { attempts: attempt, last_error });
			}

			let req = SaveRequest { payload: payload.clone(), client_id, request_id };
			let remaining = deadline.saturating_duration_since(Instant::now());
			let attempt_timeout = self.config.request_timeout.min(remaining);

			match tokio::time::timeout(attempt_timeout, self.transport.send_save(candidate, req)).await {
				Ok(Ok(resp)) => match resp.error_code {
					ErrorCode::Ok => {
						self.last_leader.store(candidate, Ordering::Relaxed);
						return Ok(resp.committed_pos.expect("Ok response always carries a committed position"));
					}
					ErrorCode::NotLeader | ErrorCode::NotLeaderAnymore => {
						last_error = resp.error_reason.unwrap_or_else(|| format!("{:?}", resp.error_code));
						candidate = match resp.leader_hint {
							Some(hint) => {
								self.last_leader.store(hint, Ordering::Relaxed);
								hint
							}
							None => {
								self.last_leader.store(NO_LEADER, Ordering::Relaxed);
								self.next_round_robin()
							}
						};
						// A leadership redirect is not a failure of the peer we
						// reached; retry immediately, no backoff.
						continue;
					}
					ErrorCode::Timeout | ErrorCode::TransportError | ErrorCode::IoError => {
						last_error = resp.error_reason.unwrap_or_else(|| format!("{:?}", resp.error_code));
						candidate = self.backoff_and_pick_next(&mut backoff, deadline).await;
					}
				},
				Ok(Err(e)) => {
					last_error = e.to_string();
					candidate = self.backoff_and_pick_next(&mut backoff, deadline).await;
				}
				Err(_) => {
					last_error = format!("request to node {} timed out", candidate);
					candidate = self.backoff_and_pick_next(&mut backoff, deadline).await;
				}
			}
		}

		Err(RouterError::RetriesExhausted { attempts: self.config.num_retries, last_error })
	}

	/// Sleeps the current backoff (bounded by what's left before `deadline`),
	/// doubles it towards `max_backoff` for next time, and returns the next
	/// peer to try.
	async fn backoff_and_pick_next(&self, backoff: &mut Duration, deadline: Instant) -> NodeId {
		let remaining = deadline.saturating_duration_since(Instant::now());
		let sleep_for = (*backoff).min(remaining);
		if !sleep_for.is_zero() {
			tokio::time::sleep(sleep_for).await;
		}
		*backoff = (*backoff * 2).min(self.config.max_backoff);
		self.next_round_robin()
	}
}
