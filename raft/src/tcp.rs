//! A socket-backed [`Transport`], the production counterpart to
//! [`crate::transport::ChannelTransport`]'s in-process one.
//!
//! Messages are newline-delimited JSON: `{WireRequest}\n` out, `{WireResponse}\n`
//! back, one request in flight per connection at a time (the replica and
//! router never need more than that — `PeerState::needs_send` already gates
//! concurrent sends to the same peer, and `Router` dispatches one `Save` per
//! call). This mirrors the teacher's own preference for JSON over the wire
//! (`pkg/haystack/src/http.rs`'s `json_response`) without carrying forward
//! its `hyper`/`futures 0.1` stack, which predates this crate's `tokio` 1.0
//! runtime.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::errors::ReplicaError;
use crate::transport::{Inbound, Transport};
use crate::types::{AppendRequest, AppendResponse, NodeId, SaveRequest, SaveResponse, VoteRequest, VoteResponse};

#[derive(Serialize, Deserialize)]
enum WireRequest {
	Vote(VoteRequest),
	Append(AppendRequest),
	Save(SaveRequest),
}

#[derive(Serialize, Deserialize)]
enum WireResponse {
	Vote(VoteResponse),
	Append(AppendResponse),
	Save(SaveResponse),
}

/// One peer's connection state: either a live stream, or the time its last
/// attempt failed so [`TcpTransport::call`] can honor
/// `reopen_connection_interval_ms` instead of reconnecting on every send.
enum Conn {
	Live(BufReader<TcpStream>),
	Down(Instant),
}

/// A [`Transport`] that dials peers over TCP, reconnecting lazily on demand.
/// One connection is held open per peer and reused across calls; a send that
/// hits a closed or broken connection drops it and is reported as a
/// [`ReplicaError::TransportError`] rather than retried inline — retrying is
/// the driver's and the client router's job (spec §4.D, §4.G), not the
/// transport's.
pub struct TcpTransport {
	addrs: HashMap<NodeId, SocketAddr>,
	conns: Mutex<HashMap<NodeId, Arc<Mutex<Conn>>>>,
	request_timeout: Duration,
	reopen_interval: Duration,
}

impl TcpTransport {
	pub fn new(addrs: HashMap<NodeId, SocketAddr>, request_timeout: Duration, reopen_interval: Duration) -> Self {
		TcpTransport { addrs, conns: Mutex::new(HashMap::new()), request_timeout, reopen_interval }
	}

	/// Returns this peer's connection slot, creating an empty (`Down`,
	/// already-elapsed) one on first use. The outer map lock is held only
	/// long enough to fetch or insert the slot — never across a dial or an
	/// exchange — so a slow peer never blocks calls to any other peer.
	async fn slot(&self, peer: NodeId) -> Arc<Mutex<Conn>> {
		let mut conns = self.conns.lock().await;
		conns.entry(peer).or_insert_with(|| Arc::new(Mutex::new(Conn::Down(Instant::now() - Duration::from_secs(3600))))).clone()
	}

	async fn call<Resp>(
		&self,
		peer: NodeId,
		req: WireRequest,
		unwrap: impl FnOnce(WireResponse) -> Option<Resp>,
	) -> Result<Resp, ReplicaError> {
		let addr = *self
			.addrs
			.get(&peer)
			.ok_or_else(|| ReplicaError::TransportError(format!("no address configured for node {}", peer)))?;

		let body = serde_json::to_string(&req).expect("wire request always serializes");

		tokio::time::timeout(self.request_timeout, self.call_inner(peer, addr, body)).await.map_err(|_| ReplicaError::Timeout)?
			.and_then(|resp| unwrap(resp).ok_or_else(|| ReplicaError::TransportError("response/request method mismatch".into())))
	}

	/// Writes `body` as one line and reads one line back over whatever
	/// connection is live for this peer. A missing/dead connection here is a
	/// logic error in the caller, which always dials first.
	async fn exchange(conn: &mut Conn, body: &str) -> std::io::Result<WireResponse> {
		let stream = match conn {
			Conn::Live(s) => s,
			Conn::Down(_) => unreachable!("exchange called without a live connection"),
		};
		stream.get_mut().write_all(body.as_bytes()).await?;
		stream.get_mut().write_all(b"\n").await?;
		stream.get_mut().flush().await?;

		let mut line = String::new();
		let n = stream.read_line(&mut line).await?;
		if n == 0 {
			return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "peer closed connection"));
		}
		serde_json::from_str::<WireResponse>(line.trim_end())
			.map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
	}

	async fn call_inner(&self, peer: NodeId, addr: SocketAddr, body: String) -> Result<WireResponse, ReplicaError> {
		let slot = self.slot(peer).await;
		let mut conn = slot.lock().await;

		if let Conn::Down(since) = &*conn {
			if since.elapsed() < self.reopen_interval {
				return Err(ReplicaError::TransportError(format!("node {} still in backoff after last failure", peer)));
			}
		}
		if !matches!(&*conn, Conn::Live(_)) {
			match TcpStream::connect(addr).await {
				Ok(stream) => *conn = Conn::Live(BufReader::new(stream)),
				Err(e) => {
					*conn = Conn::Down(Instant::now());
					return Err(ReplicaError::TransportError(format!("connect to node {} failed: {}", peer, e)));
				}
			}
		}

		match Self::exchange(&mut conn, &body).await {
			Ok(resp) => Ok(resp),
			Err(e) => {
				*conn = Conn::Down(Instant::now());
				Err(ReplicaError::TransportError(format!("request to node {} failed: {}", peer, e)))
			}
		}
	}
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
	async fn send_vote(&self, peer: NodeId, req: VoteRequest) -> Result<VoteResponse, ReplicaError> {
		self.call(peer, WireRequest::Vote(req), |r| match r {
			WireResponse::Vote(v) => Some(v),
			_ => None,
		})
		.await
	}

	async fn send_append(&self, peer: NodeId, req: AppendRequest) -> Result<AppendResponse, ReplicaError> {
		self.call(peer, WireRequest::Append(req), |r| match r {
			WireResponse::Append(v) => Some(v),
			_ => None,
		})
		.await
	}

	async fn send_save(&self, peer: NodeId, req: SaveRequest) -> Result<SaveResponse, ReplicaError> {
		self.call(peer, WireRequest::Save(req), |r| match r {
			WireResponse::Save(v) => Some(v),
			_ => None,
		})
		.await
	}
}

/// Accepts connections on `listener` forever, decoding one `WireRequest` at a
/// time per connection and forwarding it as an [`Inbound`] onto `inbound_tx`
/// (the same channel a node's [`crate::driver`] loop polls when wired over
/// [`crate::transport::ChannelHub`]). A connection handles its requests
/// serially — the client never pipelines a second request ahead of the first
/// response — so no correlation id is needed on the wire.
pub async fn serve_tcp(listener: TcpListener, inbound_tx: mpsc::UnboundedSender<Inbound>) -> std::io::Result<()> {
	loop {
		let (stream, peer_addr) = listener.accept().await?;
		let inbound_tx = inbound_tx.clone();
		tokio::spawn(async move {
			if let Err(e) = serve_connection(stream, inbound_tx).await {
				tracing::debug!(peer = %peer_addr, error = %e, "tcp connection closed");
			}
		});
	}
}

async fn serve_connection(stream: TcpStream, inbound_tx: mpsc::UnboundedSender<Inbound>) -> std::io::Result<()> {
	let mut reader = BufReader::new(stream);
	let mut line = String::new();
	loop {
		line.clear();
		let n = reader.read_line(&mut line).await?;
		if n == 0 {
			return Ok(());
		}
		let req: WireRequest = match serde_json::from_str(line.trim_end()) {
			Ok(r) => r,
			Err(e) => return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
		};

		let resp = match req {
			WireRequest::Vote(req) => {
				let (tx, rx) = oneshot::channel();
				if inbound_tx.send(Inbound::Vote(req, tx)).is_err() {
					return Ok(());
				}
				let Ok(resp) = rx.await else { return Ok(()) };
				WireResponse::Vote(resp)
			}
			WireRequest::Append(req) => {
				let (tx, rx) = oneshot::channel();
				if inbound_tx.send(Inbound::Append(req, tx)).is_err() {
					return Ok(());
				}
				let Ok(resp) = rx.await else { return Ok(()) };
				WireResponse::Append(resp)
			}
			WireRequest::Save(req) => {
				let (tx, rx) = oneshot::channel();
				if inbound_tx.send(Inbound::Save(req, tx)).is_err() {
					return Ok(());
				}
				let Ok(resp) = rx.await else { return Ok(()) };
				WireResponse::Save(resp)
			}
		};

		let body = serde_json::to_string(&resp).expect("wire response always serializes");
		reader.get_mut().write_all(body.as_bytes()).await?;
		reader.get_mut().write_all(b"\n").await?;
		reader.get_mut().flush().await?;
	}
}
