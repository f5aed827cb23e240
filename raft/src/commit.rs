use std::collections::BTreeMap;

use tokio::sync::oneshot;

use crate::types::{LogPos, NodeId, Term};

/// Invoked once per newly-committed entry, strictly in `LogPos` order, never
/// twice for the same entry. The application-level state machine that
/// consumes committed entries is out of this crate's scope (spec §1); this
/// trait is the seam it plugs into.
pub trait CommitObserver: Send + Sync {
	fn on_committed(&self, pos: LogPos, payload: &[u8]);
}

/// A `CommitObserver` that does nothing, for tests and demos that only care
/// about `Save`'s return value.
pub struct NullObserver;

impl CommitObserver for NullObserver {
	fn on_committed(&self, _pos: LogPos, _payload: &[u8]) {}
}

/// Outcome delivered to a `Save` caller once its entry's fate is decided.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveOutcome {
	Committed(LogPos),
	NotLeaderAnymore,
}

/// Per-peer replication progress as seen by the leader's commit computation.
/// `match_pos` is the highest position known to be durably stored on that
/// peer; the leader's own entry counts via its own `match_pos`, which always
/// equals its local `last_log_pos`.
///
/// Holds the waiters registered by `Save` (keyed by the position their entry
/// landed at) and fires them once `commit_pos` advances past their key.
pub struct CommitTracker {
	cluster_size: usize,
	waiters: BTreeMap<LogPos, Vec<oneshot::Sender<SaveOutcome>>>,
}

impl CommitTracker {
	pub fn new(cluster_size: usize) -> Self {
		CommitTracker { cluster_size, waiters: BTreeMap::new() }
	}

	/// Registers a waiter for the entry at `pos`; its sender fires exactly
	/// once, either with `Committed` (quorum reached it while still the
	/// current term's leader) or `NotLeaderAnymore` (this replica lost
	/// leadership, or stepped down, before that happened).
	pub fn register(&mut self, pos: LogPos, tx: oneshot::Sender<SaveOutcome>) {
		self.waiters.entry(pos).or_default().push(tx);
	}

	/// Majority size for this cluster: `floor(N/2) + 1`.
	pub fn majority(&self) -> usize {
		self.cluster_size / 2 + 1
	}

	/// Computes the candidate new commit position from a set of match
	/// positions (including the leader's own). Per spec §4.E: sort
	/// decreasing, take the entry at index `floor(N/2)` — the position a
	/// majority has reached or exceeded. Returns `None` for a cluster with
	/// no reported positions (shouldn't happen; the leader always reports
	/// its own).
	pub fn quorum_candidate(&self, match_positions: &[LogPos]) -> Option<LogPos> {
		if match_positions.is_empty() {
			return None;
		}
		let mut sorted: Vec<LogPos> = match_positions.to_vec();
		sorted.sort_unstable_by(|a, b| b.cmp(a));
		let idx = self.cluster_size / 2;
		sorted.get(idx).copied()
	}

	/// Fires every waiter at or before `commit_pos` with `Committed`, in
	/// `LogPos` order, exactly once per entry.
	///
	/// This only ever touches `Save` waiters, which are registered solely
	/// on the leader that appended the entry (`Replica::handle_save`).
	/// Notifying the `CommitObserver` is `Replica::advance_commit_to`'s job
	/// instead, driven off the log directly rather than off this map — a
	/// follower advancing `commit_pos` from an AppendEntries has no waiters
	/// here at all, but must still hand every newly committed entry to its
	/// observer (spec §4.E step 4, §5: "the replica must not expose an
	/// entry as committed before the observer has been given the chance to
	/// process it" applies to every replica, not just the leader).
	pub fn fire_waiters_upto(&mut self, commit_pos: LogPos) {
		let keys: Vec<LogPos> = self
			.waiters
			.range(..=commit_pos)
			.map(|(k, _)| *k)
			.collect();
		for key in keys {
			if let Some(txs) = self.waiters.remove(&key) {
				for tx in txs {
					let _ = tx.send(SaveOutcome::Committed(key));
				}
			}
		}
	}

	/// Fires every still-pending waiter with `NotLeaderAnymore`. Called when
	/// this replica steps down (observes a higher term, or loses an
	/// election) before some entries it appended as leader ever reached
	/// quorum.
	pub fn abandon_all(&mut self) {
		for (_, txs) in self.waiters.split_off(&LogPos::ZERO) {
			for tx in txs {
				let _ = tx.send(SaveOutcome::NotLeaderAnymore);
			}
		}
		self.waiters.clear();
	}
}

/// Checks the safety gate (spec §4.E step 3): an entry may only be counted
/// into a new commit position if it was created in the leader's *current*
/// term. Older-term entries are committed transitively, once a current-term
/// entry at or after them commits, never by vote-counting alone.
pub fn safety_gate(candidate_term: Term, current_term: Term) -> bool {
	candidate_term == current_term
}
