use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::replica::{Effects, Outbound, Replica, SaveHandled};
use crate::transport::{Inbound, Transport};
use crate::types::*;

/// Responses to RPCs this replica itself sent, looped back onto the same
/// queue as inbound requests so every mutation of replica state happens on
/// one task (spec §5).
enum Reply {
	Vote { from: NodeId, resp: VoteResponse },
	Append { from: NodeId, resp: AppendResponse },
	Failed { from: NodeId },
}

enum Event {
	In(Inbound),
	Back(Reply),
}

/// Runs a replica to completion: owns it exclusively, pulls inbound RPCs off
/// `inbound` (the receiver a node registers with a [`crate::transport::ChannelHub`]
/// or socket listener), dispatches the `Effects` each transition produces,
/// and fires `tick` on its own timer. Exits once `inbound` and every
/// in-flight reply channel are closed.
///
/// The returned `watch::Receiver` carries a `status_string(true)` snapshot,
/// refreshed after every event the loop processes — the read-only window
/// `raft-cli`'s `status`/`stat` commands look through without taking a lock
/// on the replica itself.
pub fn spawn(mut replica: Replica, inbound: mpsc::UnboundedReceiver<Inbound>, transport: Arc<dyn Transport>) -> (JoinHandle<()>, watch::Receiver<String>) {
	let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Reply>();
	let mut inbound = inbound;
	let (status_tx, status_rx) = watch::channel(replica.status_string(true));

	let join = tokio::spawn(async move {
		let mut next_tick = Duration::from_millis(0);
		loop {
			let sleep = tokio::time::sleep(next_tick);
			let event = tokio::select! {
				biased;
				msg = inbound.recv() => match msg {
					Some(m) => Event::In(m),
					None => break,
				},
				msg = reply_rx.recv() => match msg {
					Some(m) => Event::Back(m),
					None => continue,
				},
				_ = sleep => {
					let now = Instant::now();
					next_tick = apply(replica.tick(now), &transport, &reply_tx);
					let _ = status_tx.send(replica.status_string(true));
					continue;
				}
			};

			let now = Instant::now();
			let effects = handle_event(&mut replica, event, now);
			next_tick = apply(effects, &transport, &reply_tx);
			let _ = status_tx.send(replica.status_string(true));
		}
		tracing::info!(node = replica.id(), "replica loop exiting: inbound channel closed");
	});

	(join, status_rx)
}

fn handle_event(replica: &mut Replica, event: Event, now: Instant) -> crate::errors::Result<Effects> {
	match event {
		Event::In(Inbound::Vote(req, reply)) => {
			let (resp, effects) = replica.handle_vote(req, now)?;
			let _ = reply.send(resp);
			Ok(effects)
		}
		Event::In(Inbound::Append(req, reply)) => {
			let (resp, effects) = replica.handle_append(req, now)?;
			let _ = reply.send(resp);
			Ok(effects)
		}
		Event::In(Inbound::Save(req, reply)) => {
			let (handled, effects) = replica.handle_save(req, now)?;
			match handled {
				SaveHandled::Rejected(resp) => {
					let _ = reply.send(resp);
				}
				SaveHandled::Pending(_pos, rx) => {
					tokio::spawn(async move {
						let resp = match rx.await {
							Ok(crate::commit::SaveOutcome::Committed(pos)) => SaveResponse {
								committed_pos: Some(pos),
								leader_hint: None,
								error_code: ErrorCode::Ok,
								error_reason: None,
							},
							Ok(crate::commit::SaveOutcome::NotLeaderAnymore) => SaveResponse {
								committed_pos: None,
								leader_hint: None,
								error_code: ErrorCode::NotLeaderAnymore,
								error_reason: Some("leader stepped down before this entry committed".into()),
							},
							Err(_) => SaveResponse {
								committed_pos: None,
								leader_hint: None,
								error_code: ErrorCode::NotLeaderAnymore,
								error_reason: Some("replica shut down before this entry committed".into()),
							},
						};
						let _ = reply.send(resp);
					});
				}
			}
			Ok(effects)
		}
		Event::Back(Reply::Vote { from, resp }) => replica.on_vote_response(from, resp, now),
		Event::Back(Reply::Append { from, resp }) => replica.on_append_response(from, resp, now),
		Event::Back(Reply::Failed { from }) => {
			replica.on_append_transport_error(from);
			Ok(Effects::default())
		}
	}
}

/// Fans `effects.messages` out onto their own tasks so replication to
/// distinct peers proceeds concurrently, with responses looped back through
/// `reply_tx`. Returns the driver's next wakeup interval.
fn apply(effects: crate::errors::Result<Effects>, transport: &Arc<dyn Transport>, reply_tx: &mpsc::UnboundedSender<Reply>) -> Duration {
	let effects = match effects {
		Ok(e) => e,
		Err(e) => {
			tracing::error!(error = %e, "replica transition failed");
			return Duration::from_millis(50);
		}
	};

	for msg in effects.messages {
		let transport = transport.clone();
		let reply_tx = reply_tx.clone();
		match msg {
			Outbound::Vote { to, req } => {
				tokio::spawn(async move {
					// A lost or timed-out vote request just means one fewer vote
					// counted; the candidate's own election timer is the only
					// recovery path, so failures here need no signal back.
					if let Ok(resp) = transport.send_vote(to, req).await {
						let _ = reply_tx.send(Reply::Vote { from: to, resp });
					}
				});
			}
			Outbound::Append { to, req } => {
				tokio::spawn(async move {
					match transport.send_append(to, req).await {
						Ok(resp) => {
							let _ = reply_tx.send(Reply::Append { from: to, resp });
						}
						Err(_) => {
							let _ = reply_tx.send(Reply::Failed { from: to });
						}
					}
				});
			}
		}
	}

	effects.next_tick.unwrap_or(Duration::from_millis(250))
}
