use std::time::Instant;

use raft_log::LogPos;

/// Leader-side replication cursor for one peer (spec §4.D). `next_pos` is
/// where the leader will try to send next; `match_pos` is the highest
/// position known to be durably stored there. Both start optimistically at
/// the leader's own `last_log_pos` when a new term begins, the same way the
/// teacher's `ServerProgress::new(last_log_index)` seeds a freshly-elected
/// leader's view of every follower.
#[derive(Clone, Debug)]
pub struct PeerState {
	pub next_pos: LogPos,
	pub match_pos: LogPos,
	pub in_flight: bool,
	pub last_sent: Option<Instant>,
}

impl PeerState {
	pub fn new(last_log_pos: LogPos) -> Self {
		PeerState { next_pos: last_log_pos, match_pos: LogPos::ZERO, in_flight: false, last_sent: None }
	}

	/// Whether this peer is due a send: nothing currently in flight to it,
	/// and either it isn't caught up or its last contact predates the
	/// heartbeat interval (spec §4.C: "each [heartbeat] fire schedules an
	/// empty AppendEntries...to every peer that does not already have a
	/// pending append").
	pub fn needs_send(&self, now: Instant, last_log_pos: LogPos, heartbeat_interval: std::time::Duration) -> bool {
		if self.in_flight {
			return false;
		}
		if self.match_pos < last_log_pos {
			return true;
		}
		match self.last_sent {
			None => true,
			Some(t) => now.duration_since(t) >= heartbeat_interval,
		}
	}

	pub fn mark_sent(&mut self, now: Instant) {
		self.in_flight = true;
		self.last_sent = Some(now);
	}

	/// A successful AppendEntries response: this peer is now known to have
	/// everything up to and including `sent_up_to`.
	pub fn on_success(&mut self, sent_up_to: LogPos, pos_after: LogPos) {
		self.in_flight = false;
		if sent_up_to > self.match_pos {
			self.match_pos = sent_up_to;
			self.next_pos = pos_after;
		}
	}

	/// A failed consistency check: back the cursor off towards the leader's
	/// hint (or by one record with no hint), never below the start of the
	/// log. `decrement` does the "no hint" single-step backtrack by reading
	/// the one record preceding `next_pos` from the log.
	pub fn on_mismatch(&mut self, hint: Option<LogPos>, decrement: impl FnOnce(LogPos) -> LogPos) {
		self.in_flight = false;
		self.next_pos = match hint {
			Some(h) if h < self.next_pos => h,
			Some(_) => decrement(self.next_pos),
			None => decrement(self.next_pos),
		};
	}

	/// A transport error or timeout: cursors are left untouched, to be
	/// retried on the next heartbeat tick (spec §4.D response handling).
	pub fn on_transport_error(&mut self) {
		self.in_flight = false;
	}
}
