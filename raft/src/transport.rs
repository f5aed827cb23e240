use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::errors::ReplicaError;
use crate::types::{AppendRequest, AppendResponse, NodeId, SaveRequest, SaveResponse, VoteRequest, VoteResponse};

/// The RPC boundary a replica talks through. Peer transport is an external
/// collaborator in this crate's scope (bootstrap, connection pooling, and
/// retries at the socket level are someone else's problem); this trait is
/// the abstraction the replica and replication engine are written against,
/// with one concrete, in-process implementation below for tests and the
/// bundled demo binary.
#[async_trait]
pub trait Transport: Send + Sync {
	async fn send_vote(&self, peer: NodeId, req: VoteRequest) -> Result<VoteResponse, ReplicaError>;
	async fn send_append(&self, peer: NodeId, req: AppendRequest) -> Result<AppendResponse, ReplicaError>;
	async fn send_save(&self, peer: NodeId, req: SaveRequest) -> Result<SaveResponse, ReplicaError>;
}

/// An inbound request delivered to a node's event loop, paired with the
/// channel its reply goes out on.
pub enum Inbound {
	Vote(VoteRequest, oneshot::Sender<VoteResponse>),
	Append(AppendRequest, oneshot::Sender<AppendResponse>),
	Save(SaveRequest, oneshot::Sender<SaveResponse>),
}

/// A registry of in-process mailboxes, one per node, used to wire a whole
/// cluster together without sockets. This is the transport the integration
/// tests and `raft-cli`'s single-process demo cluster run on; a real
/// deployment would swap in a socket-backed `Transport` without touching
/// the replica or replication engine.
pub struct ChannelHub {
	senders: Mutex<HashMap<NodeId, mpsc::UnboundedSender<Inbound>>>,
	paused: Mutex<HashSet<NodeId>>,
}

impl ChannelHub {
	pub fn new() -> Arc<Self> {
		Arc::new(ChannelHub { senders: Mutex::new(HashMap::new()), paused: Mutex::new(HashSet::new()) })
	}

	/// Registers `node_id`'s mailbox, returning the receiving half its event
	/// loop should poll. Replacing an existing registration (e.g. after
	/// `down`/`up` in the demo CLI) drops the old receiver, and sends to the
	/// stale sender will simply fail as if the peer were unreachable.
	pub fn register(&self, node_id: NodeId) -> mpsc::UnboundedReceiver<Inbound> {
		let (tx, rx) = mpsc::unbounded_channel();
		self.senders.lock().unwrap().insert(node_id, tx);
		rx
	}

	pub fn unregister(&self, node_id: NodeId) {
		self.senders.lock().unwrap().remove(&node_id);
	}

	/// Simulates a network partition around `node_id`: every message to or
	/// from it is dropped until [`Self::resume`], without touching its
	/// mailbox registration, so a paused node's own event loop keeps running
	/// (unlike `unregister`, which would close it). Used by the integration
	/// tests to isolate a leader without restarting it.
	pub fn pause(&self, node_id: NodeId) {
		self.paused.lock().unwrap().insert(node_id);
	}

	pub fn resume(&self, node_id: NodeId) {
		self.paused.lock().unwrap().remove(&node_id);
	}

	fn is_paused(&self, node_id: NodeId) -> bool {
		self.paused.lock().unwrap().contains(&node_id)
	}

	fn deliver(&self, from: Option<NodeId>, peer: NodeId, msg: Inbound) -> Result<(), ReplicaError> {
		if self.is_paused(peer) || from.map_or(false, |f| self.is_paused(f)) {
			return Err(ReplicaError::TransportError(format!("node {} unreachable (partitioned)", peer)));
		}
		let senders = self.senders.lock().unwrap();
		let tx = senders
			.get(&peer)
			.ok_or_else(|| ReplicaError::TransportError(format!("no route to node {}", peer)))?;
		tx.send(msg).map_err(|_| ReplicaError::TransportError(format!("node {} mailbox closed", peer)))
	}
}

/// A `Transport` implementation bound to one [`ChannelHub`] and one request
/// timeout. Every peer's node id is looked up in the hub at call time, so
/// taking a node `down` and bringing it `up` again (registering a new
/// mailbox) is immediately reflected in every other node's transport.
pub struct ChannelTransport {
	hub: Arc<ChannelHub>,
	request_timeout: Duration,
	self_id: Option<NodeId>,
}

impl ChannelTransport {
	/// A transport with no identity of its own (e.g. a client router's pool):
	/// `pause`/`resume` only affects messages addressed *to* a paused peer.
	pub fn new(hub: Arc<ChannelHub>, request_timeout: Duration) -> Self {
		ChannelTransport { hub, request_timeout, self_id: None }
	}

	/// A transport scoped to `self_id` (a server's own outbound connection):
	/// pausing `self_id` also blocks its sends to everyone else, simulating a
	/// two-way partition rather than just a deaf peer.
	pub fn with_node_id(hub: Arc<ChannelHub>, request_timeout: Duration, self_id: NodeId) -> Self {
		ChannelTransport { hub, request_timeout, self_id: Some(self_id) }
	}

	async fn call<Req, Resp>(
		&self,
		peer: NodeId,
		req: Req,
		wrap: impl FnOnce(Req, oneshot::Sender<Resp>) -> Inbound,
	) -> Result<Resp, ReplicaError> {
		let (tx, rx) = oneshot::channel();
		self.hub.deliver(self.self_id, peer, wrap(req, tx))?;
		match tokio::time::timeout(self.request_timeout, rx).await {
			Ok(Ok(resp)) => Ok(resp),
			Ok(Err(_)) => Err(ReplicaError::TransportError(format!("node {} dropped the request", peer))),
			Err(_) => Err(ReplicaError::Timeout),
		}
	}
}

#[async_trait]
impl Transport for ChannelTransport {
	async fn send_vote(&self, peer: NodeId, req: VoteRequest) -> Result<VoteResponse, ReplicaError> {
		self.call(peer, req, Inbound::Vote).await
	}

	async fn send_append(&self, peer: NodeId, req: AppendRequest) -> Result<AppendResponse, ReplicaError> {
		self.call(peer, req, Inbound::Append).await
	}

	async fn send_save(&self, peer: NodeId, req: SaveRequest) -> Result<SaveResponse, ReplicaError> {
		self.call(peer, req, Inbound::Save).await
	}
}
