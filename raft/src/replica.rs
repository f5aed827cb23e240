use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::oneshot;

use raft_log::{LogPos, LogStore};

use crate::commit::{safety_gate, CommitObserver, CommitTracker, SaveOutcome};
use crate::config::Config;
use crate::durable::{DirLock, DurableState};
use crate::errors::{ReplicaError, Result};
use crate::replication::PeerState;
use crate::types::*;

/// Side effects requested by a single `Replica` transition: whether the
/// durable state must be flushed before anything below becomes observable,
/// which messages go out, and when the driver should next call `tick`. The
/// shape mirrors the teacher's `consensus.rs::Tick` — every handler below
/// computes one `Effects` value instead of performing I/O inline, keeping
/// this module synchronous and unit-testable without a fake network (see
/// spec §4.C's implementation note).
#[derive(Default)]
pub struct Effects {
	pub persist: bool,
	pub messages: Vec<Outbound>,
	pub next_tick: Option<Duration>,
}

impl Effects {
	fn persisted() -> Self {
		Effects { persist: true, ..Effects::default() }
	}
}

/// An outbound RPC the driver must send through the `Transport`.
pub enum Outbound {
	Vote { to: NodeId, req: VoteRequest },
	Append { to: NodeId, req: AppendRequest },
}

/// What `handle_save` produced: either an immediate rejection (not leader)
/// or a receiver the driver awaits to answer the client once the entry's
/// fate (committed, or abandoned on step-down) is decided.
pub enum SaveHandled {
	Rejected(SaveResponse),
	Pending(LogPos, oneshot::Receiver<SaveOutcome>),
}

/// The Raft consensus core: terms, votes, role, election/heartbeat timers,
/// and the log itself. All mutation happens through the handlers below,
/// called from the single replica loop described in spec §5; no handler
/// performs blocking I/O beyond the log store's own synchronous fsync path.
pub struct Replica {
	id: NodeId,
	peers: Vec<NodeId>,
	config: Config,
	log: LogStore,
	log_index: Vec<(LogPos, Term)>,
	durable: DurableState,
	role: Role,
	leader_id: Option<NodeId>,
	commit_pos: LogPos,
	/// Whether `commit_pos` has ever been advanced past the empty-log
	/// sentinel. Needed because `LogPos::ZERO` is simultaneously "nothing
	/// committed yet" and the genuine on-disk position of the very first
	/// log record (see the log store's `LogPos::ZERO` doc comment) — without
	/// this flag, a freshly-started replica would look like it had already
	/// committed position zero and refuse to ever truncate a conflicting
	/// first entry.
	committed_any: bool,
	election_deadline: Instant,
	candidate_votes: std::collections::HashSet<NodeId>,
	peer_states: HashMap<NodeId, PeerState>,
	commit_tracker: CommitTracker,
	observer: Arc<dyn CommitObserver>,
	/// Set when an `IOError` hits the critical path (log append ahead of a
	/// response). Per spec §7, a halted replica stops acknowledging writes
	/// but keeps serving votes/status from its last persisted state.
	halted: bool,
	/// Held for the replica's lifetime so two `Replica`s never open the same
	/// `data_dir` at once; released on drop.
	_lock: DirLock,
}

impl Replica {
	pub fn new(
		id: NodeId,
		peers: Vec<NodeId>,
		config: Config,
		observer: Arc<dyn CommitObserver>,
	) -> Result<Self> {
		let lock = DirLock::acquire(&config.data_dir).map_err(|e| ReplicaError::IoError(e.into()))?;
		let log = LogStore::open(&config.data_dir, "log", config.block_size)?;
		let log_index = Self::rebuild_index(&log)?;
		let durable = DurableState::load(&config.data_dir)?;
		let cluster_size = peers.len() + 1;
		let now = Instant::now();

		let mut replica = Replica {
			id,
			peers,
			config,
			log,
			log_index,
			durable,
			role: Role::Follower,
			leader_id: None,
			commit_pos: LogPos::ZERO,
			committed_any: false,
			election_deadline: now,
			candidate_votes: Default::default(),
			peer_states: HashMap::new(),
			commit_tracker: CommitTracker::new(cluster_size),
			observer,
			halted: false,
			_lock: lock,
		};
		replica.reset_election_timer(now);
		Ok(replica)
	}

	fn rebuild_index(log: &LogStore) -> Result<Vec<(LogPos, Term)>> {
		let mut index = Vec::new();
		for record in log.reader(LogPos::ZERO)? {
			let record = record?;
			let entry = LogEntry::decode(&record.payload)
				.map_err(|_| ReplicaError::InvalidPosition(record.pos))?;
			index.push((record.pos, entry.term));
		}
		Ok(index)
	}

	pub fn id(&self) -> NodeId {
		self.id
	}

	pub fn role(&self) -> Role {
		self.role
	}

	pub fn current_term(&self) -> Term {
		self.durable.current_term
	}

	pub fn commit_pos(&self) -> LogPos {
		self.commit_pos
	}

	pub fn is_halted(&self) -> bool {
		self.halted
	}

	pub fn status_string(&self, detailed: bool) -> String {
		let mut s = format!(
			"node {} term={} role={:?} leader={:?} last_log={} commit={}",
			self.id,
			self.durable.current_term,
			self.role,
			self.leader_id,
			self.last_log_pos(),
			self.commit_pos
		);
		if detailed && self.role == Role::Leader {
			for (peer, p) in &self.peer_states {
				s.push_str(&format!("\n  peer {}: next={} match={}", peer, p.next_pos, p.match_pos));
			}
		}
		s
	}

	fn last_log_pos(&self) -> LogPos {
		self.log_index.last().map(|(p, _)| *p).unwrap_or(LogPos::ZERO)
	}

	fn last_log_term(&self) -> Term {
		self.log_index.last().map(|(_, t)| *t).unwrap_or(0)
	}

	fn find_index(&self, pos: LogPos) -> Option<usize> {
		self.log_index.binary_search_by_key(&pos, |(p, _)| *p).ok()
	}

	fn new_election_timeout(&self) -> Duration {
		let base = self.config.election_timeout_ms;
		let extra = rand::thread_rng().gen_range(0, base.max(1));
		Duration::from_millis(base + extra)
	}

	fn reset_election_timer(&mut self, now: Instant) {
		self.election_deadline = now + self.new_election_timeout();
	}

	fn heartbeat_interval(&self) -> Duration {
		Duration::from_millis((self.config.election_timeout_ms / 4).max(1))
	}

	fn persist(&mut self) -> Result<()> {
		self.durable.persist(&self.config.data_dir)?;
		Ok(())
	}

	/// Candidate's log is at least as up-to-date as ours: later term wins;
	/// on a tie, the longer (further-along) log wins (spec §4.C).
	fn candidate_is_up_to_date(&self, last_log_term: Term, last_log_pos: LogPos) -> bool {
		let (my_term, my_pos) = (self.last_log_term(), self.last_log_pos());
		(last_log_term, last_log_pos) >= (my_term, my_pos)
	}

	/// Adopts `term` if it is strictly newer than ours, resetting
	/// `voted_for`, persisting before returning, and stepping down to
	/// Follower. Returns whether adoption happened. Run on every inbound
	/// message per spec §4.C.
	fn observe_term(&mut self, term: Term, now: Instant) -> Result<bool> {
		if term > self.durable.current_term {
			self.durable.current_term = term;
			self.durable.voted_for = NO_VOTE;
			self.persist()?;
			self.step_down(now);
			Ok(true)
		} else {
			Ok(false)
		}
	}

	fn step_down(&mut self, now: Instant) {
		if self.role == Role::Leader {
			self.commit_tracker.abandon_all();
		}
		self.role = Role::Follower;
		self.candidate_votes.clear();
		self.peer_states.clear();
		self.reset_election_timer(now);
	}

	// ---- RequestVote -----------------------------------------------------

	pub fn handle_vote(&mut self, req: VoteRequest, now: Instant) -> Result<(VoteResponse, Effects)> {
		let mut effects = Effects::default();

		if req.term < self.durable.current_term {
			return Ok((VoteResponse { term: self.durable.current_term, vote_granted: false }, effects));
		}
		if self.observe_term(req.term, now)? {
			effects.persist = true;
		}

		let up_to_date = self.candidate_is_up_to_date(req.last_log_term, req.last_log_pos);
		let can_vote = self.durable.voted_for == NO_VOTE || self.durable.voted_for == req.candidate_id;
		let granted = up_to_date && can_vote;

		if granted {
			self.durable.voted_for = req.candidate_id;
			self.persist()?;
			effects.persist = true;
			self.reset_election_timer(now);
		}

		Ok((VoteResponse { term: self.durable.current_term, vote_granted: granted }, effects))
	}

	pub fn on_vote_response(&mut self, from: NodeId, resp: VoteResponse, now: Instant) -> Result<Effects> {
		if self.observe_term(resp.term, now)? {
			return Ok(Effects::persisted());
		}
		if resp.term != self.durable.current_term || self.role != Role::Candidate {
			return Ok(Effects::default());
		}
		if resp.vote_granted {
			self.candidate_votes.insert(from);
		}
		let majority = self.commit_tracker.majority();
		if 1 + self.candidate_votes.len() >= majority {
			return Ok(self.become_leader(now));
		}
		Ok(Effects::default())
	}

	// ---- Role transitions --------------------------------------------------

	pub fn start_election(&mut self, now: Instant) -> Result<Effects> {
		self.durable.current_term += 1;
		self.durable.voted_for = self.id;
		self.persist()?;

		self.role = Role::Candidate;
		self.leader_id = None;
		self.candidate_votes.clear();
		self.reset_election_timer(now);

		let req = VoteRequest {
			term: self.durable.current_term,
			candidate_id: self.id,
			last_log_pos: self.last_log_pos(),
			last_log_term: self.last_log_term(),
		};
		let messages = self.peers.iter().map(|p| Outbound::Vote { to: *p, req: req.clone() }).collect();

		if self.peers.is_empty() {
			// Single-node cluster: we already hold a majority of one.
			return Ok(self.become_leader(now));
		}

		Ok(Effects { persist: true, messages, next_tick: Some(self.election_deadline - now) })
	}

	fn become_leader(&mut self, now: Instant) -> Effects {
		self.role = Role::Leader;
		self.leader_id = Some(self.id);
		self.candidate_votes.clear();
		let tell = self.log.tell();
		self.peer_states = self.peers.iter().map(|p| (*p, PeerState::new(tell))).collect();
		self.replicate_to_all(now)
	}

	// ---- AppendEntries ------------------------------------------------------

	pub fn handle_append(&mut self, req: AppendRequest, now: Instant) -> Result<(AppendResponse, Effects)> {
		let mut effects = Effects::default();
		let current_term = self.durable.current_term;

		if req.term < current_term {
			return Ok((
				AppendResponse { term: current_term, success: false, match_pos: LogPos::ZERO, conflict_hint_pos: None },
				effects,
			));
		}

		if self.observe_term(req.term, now)? {
			effects.persist = true;
		} else if self.role == Role::Candidate {
			self.step_down(now);
		} else {
			self.reset_election_timer(now);
		}
		self.leader_id = Some(req.leader_id);

		let current_term = self.durable.current_term;
		let reject = |hint: Option<LogPos>| {
			(AppendResponse { term: current_term, success: false, match_pos: LogPos::ZERO, conflict_hint_pos: hint }, Effects::default())
		};

		let start_idx = if req.prev_pos.is_zero() {
			0
		} else {
			match self.find_index(req.prev_pos) {
				Some(idx) if self.log_index[idx].1 == req.prev_term => idx + 1,
				Some(_) => {
					let (resp, _) = reject(Some(self.commit_pos));
					return Ok((resp, effects));
				}
				None => {
					let (resp, _) = reject(Some(self.last_log_pos()));
					return Ok((resp, effects));
				}
			}
		};

		let mut i = start_idx;
		let mut new_start = req.entries.len();
		for (k, e) in req.entries.iter().enumerate() {
			if i < self.log_index.len() {
				if self.log_index[i].1 == e.term {
					i += 1;
					continue;
				}
				let conflict_pos = self.log_index[i].0;
				if self.committed_any && self.commit_pos >= conflict_pos {
					return Err(ReplicaError::InvalidPosition(conflict_pos));
				}
				self.log.truncate_at(conflict_pos)?;
				self.log_index.truncate(i);
				new_start = k;
				break;
			} else {
				new_start = k;
				break;
			}
		}

		let mut match_pos = if start_idx > 0 { self.log_index[start_idx - 1].0 } else { LogPos::ZERO };

		for e in &req.entries[new_start..] {
			let pos = self.log.append(&e.encode())?;
			self.log_index.push((pos, e.term));
		}
		if !req.entries.is_empty() {
			match_pos = self.log_index[start_idx + req.entries.len() - 1].0;
		}

		if let Some(leader_commit) = req.leader_commit {
			let new_commit = leader_commit.min(self.last_log_pos());
			if self.commit_is_advance(new_commit) {
				self.advance_commit_to(new_commit);
			}
		}

		Ok((
			AppendResponse { term: current_term, success: true, match_pos, conflict_hint_pos: None },
			effects,
		))
	}

	pub fn on_append_transport_error(&mut self, from: NodeId) {
		if let Some(p) = self.peer_states.get_mut(&from) {
			p.on_transport_error();
		}
	}

	pub fn on_append_response(
		&mut self,
		from: NodeId,
		resp: AppendResponse,
		now: Instant,
	) -> Result<Effects> {
		if self.observe_term(resp.term, now)? {
			return Ok(Effects::persisted());
		}
		if self.role != Role::Leader {
			return Ok(Effects::default());
		}

		let log_index = &self.log_index;
		let decrement = |cur: LogPos| -> LogPos {
			match log_index.binary_search_by_key(&cur, |(p, _)| *p) {
				Ok(idx) if idx > 0 => log_index[idx - 1].0,
				_ => LogPos::ZERO,
			}
		};

		if let Some(p) = self.peer_states.get_mut(&from) {
			if resp.success {
				// `resp.match_pos` is the follower's own authoritative account of
				// what it now holds; a stale, reordered response reporting a
				// position behind what we've already recorded is a no-op here
				// because `on_success` never regresses `match_pos`.
				let pos_after = self.log_index.iter().find(|(pos, _)| *pos > resp.match_pos).map(|(pos, _)| *pos).unwrap_or_else(|| self.log.tell());
				p.on_success(resp.match_pos, pos_after);
			} else {
				p.on_mismatch(resp.conflict_hint_pos, decrement);
			}
		}

		self.maybe_advance_commit();
		Ok(self.replicate_to_all(now))
	}

	/// Whether `candidate` would be real progress for `commit_pos`: `candidate`
	/// must name an entry actually in the log (the log is non-empty), and
	/// either nothing has ever committed yet, or `candidate` is strictly past
	/// the current commit position. The `committed_any` half of this check
	/// exists only because `LogPos::ZERO` is both "nothing committed" and the
	/// genuine position of the log's first entry; without it, a replica
	/// whose first-ever entry is the commit candidate would see
	/// `candidate == commit_pos == LogPos::ZERO` and wrongly conclude there
	/// was nothing new to commit.
	fn commit_is_advance(&self, candidate: LogPos) -> bool {
		!self.log_index.is_empty() && (!self.committed_any || candidate > self.commit_pos)
	}

	/// Advances `commit_pos` to `new_commit` and notifies the commit
	/// observer of every entry newly covered, in `LogPos` order, exactly
	/// once. This runs identically whether the caller is a leader (via
	/// `maybe_advance_commit`, after a quorum check) or a follower applying
	/// its leader's `leader_commit` (via `handle_append`) — every replica
	/// that ever reports an entry committed must hand it to its observer,
	/// not just the one that happened to register a `Save` waiter for it.
	fn advance_commit_to(&mut self, new_commit: LogPos) {
		let start_idx = if self.committed_any {
			self.log_index.partition_point(|(p, _)| *p <= self.commit_pos)
		} else {
			0
		};
		let end_idx = self.log_index.partition_point(|(p, _)| *p <= new_commit);

		self.commit_pos = new_commit;
		self.committed_any = true;

		for i in start_idx..end_idx {
			let pos = self.log_index[i].0;
			if let Ok(Some(record)) = self.log.read_at(pos) {
				self.observer.on_committed(pos, &record.payload);
			}
		}

		self.commit_tracker.fire_waiters_upto(new_commit);
	}

	fn maybe_advance_commit(&mut self) {
		if self.role != Role::Leader {
			return;
		}
		let mut positions: Vec<LogPos> = self.peer_states.values().map(|p| p.match_pos).collect();
		positions.push(self.last_log_pos());
		let Some(candidate) = self.commit_tracker.quorum_candidate(&positions) else { return };
		if !self.commit_is_advance(candidate) {
			return;
		}
		let Some(idx) = self.find_index(candidate) else { return };
		if !safety_gate(self.log_index[idx].1, self.durable.current_term) {
			return;
		}
		self.advance_commit_to(candidate);
	}

	// ---- Replication (leader only) -----------------------------------------

	fn replicate_to_all(&mut self, now: Instant) -> Effects {
		let mut messages = Vec::new();
		let last_log_pos = self.last_log_pos();
		let term = self.durable.current_term;
		let leader_commit = self.committed_any.then_some(self.commit_pos);
		let heartbeat_interval = self.heartbeat_interval();
		let max_entries_size = self.config.max_entries_size;

		let peers: Vec<NodeId> = self.peer_states.keys().copied().collect();
		for peer in peers {
			let needs_send = {
				let p = self.peer_states.get(&peer).unwrap();
				p.needs_send(now, last_log_pos, heartbeat_interval)
			};
			if !needs_send {
				continue;
			}

			let next_pos = self.peer_states.get(&peer).unwrap().next_pos;
			let (prev_pos, prev_term, entries) = self.entries_from(next_pos, max_entries_size);

			self.peer_states.get_mut(&peer).unwrap().mark_sent(now);
			messages.push(Outbound::Append {
				to: peer,
				req: AppendRequest { term, leader_id: self.id, prev_pos, prev_term, entries, leader_commit },
			});
		}

		Effects { persist: false, messages, next_tick: Some(heartbeat_interval) }
	}

	/// Builds `(prev_pos, prev_term, entries)` for a peer whose next entry
	/// to send starts at `next_pos`: `next_pos` either names a real entry in
	/// `log_index` or equals `tell()` (peer fully caught up, heartbeat).
	fn entries_from(&mut self, next_pos: LogPos, max_entries_size: usize) -> (LogPos, Term, Vec<LogEntry>) {
		let start_idx = self.find_index(next_pos).unwrap_or(self.log_index.len());
		let (prev_pos, prev_term) =
			if start_idx == 0 { (LogPos::ZERO, 0) } else { self.log_index[start_idx - 1] };

		let mut entries = Vec::new();
		let mut budget = max_entries_size;
		for &(pos, _term) in &self.log_index[start_idx..] {
			let record = match self.log.read_at(pos) {
				Ok(Some(r)) => r,
				_ => break,
			};
			if !entries.is_empty() && record.payload.len() > budget {
				break;
			}
			budget = budget.saturating_sub(record.payload.len());
			match LogEntry::decode(&record.payload) {
				Ok(entry) => entries.push(entry),
				Err(_) => break,
			}
		}
		(prev_pos, prev_term, entries)
	}

	// ---- Save (client write path) ------------------------------------------

	pub fn handle_save(&mut self, req: SaveRequest, now: Instant) -> Result<(SaveHandled, Effects)> {
		if self.role != Role::Leader {
			return Ok((
				SaveHandled::Rejected(SaveResponse {
					committed_pos: None,
					leader_hint: self.leader_id,
					error_code: ErrorCode::NotLeader,
					error_reason: Some("not the current leader".into()),
				}),
				Effects::default(),
			));
		}
		if self.halted {
			return Ok((
				SaveHandled::Rejected(SaveResponse {
					committed_pos: None,
					leader_hint: None,
					error_code: ErrorCode::IoError,
					error_reason: Some("log store is halted after an earlier write failure".into()),
				}),
				Effects::default(),
			));
		}

		let entry = LogEntry { term: self.durable.current_term, payload: req.payload, client_id: req.client_id, request_id: req.request_id };
		let pos = match self.log.append(&entry.encode()) {
			Ok(pos) => pos,
			Err(e) => {
				self.halted = true;
				return Err(e.into());
			}
		};
		self.log_index.push((pos, entry.term));

		let (tx, rx) = oneshot::channel();
		self.commit_tracker.register(pos, tx);
		self.maybe_advance_commit();

		let effects = self.replicate_to_all(now);
		Ok((SaveHandled::Pending(pos, rx), effects))
	}

	// ---- Periodic driver tick ------------------------------------------------

	pub fn tick(&mut self, now: Instant) -> Result<Effects> {
		match self.role {
			Role::Follower | Role::Candidate => {
				if now >= self.election_deadline {
					self.start_election(now)
				} else {
					Ok(Effects { next_tick: Some(self.election_deadline - now), ..Effects::default() })
				}
			}
			Role::Leader => Ok(self.replicate_to_all(now)),
		}
	}
}
