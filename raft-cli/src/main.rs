//! Demo console for a whole in-process Raft cluster, restated from the
//! original `raft_test.cc` command loop (`status`/`stat`, `down <idx>`,
//! `up <idx>`, `send <n> [client]`, `quit`) in this teacher's idiom: `tokio`
//! tasks standing in for the original's `Selector` threads, one `Replica` +
//! driver per server wired over an in-process [`raft::transport::ChannelHub`]
//! instead of real TCP connections between `127.0.0.1:<port+idx>`.

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use bytes::Bytes;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use raft::commit::NullObserver;
use raft::config::Config;
use raft::transport::ChannelHub;
use raft::transport::ChannelTransport;
use raft::types::NodeId;
use raft::Replica;
use raft_client::{Router, RouterConfig};

#[derive(Parser, Debug)]
#[command(name = "raft-cli", about = "Sample Raft cluster, driven interactively")]
struct Cli {
	/// Base directory; each server gets its own `node-<idx>` subdirectory.
	#[arg(short, long, default_value = "/tmp/raft-cli")]
	dir: PathBuf,

	/// Number of replicas to start.
	#[arg(long, default_value_t = 3)]
	num_servers: usize,

	/// Number of independent client routers to make available to `send`.
	#[arg(long, default_value_t = 3)]
	num_clients: usize,

	/// Base election timeout, shortened from the library default so the demo
	/// elects a leader and reacts to `down`/`up` in a few seconds.
	#[arg(long, default_value_t = 300)]
	election_timeout_ms: u64,
}

struct RunningNode {
	join: JoinHandle<()>,
	status: watch::Receiver<String>,
}

struct Cluster {
	hub: Arc<ChannelHub>,
	nodes: Mutex<Vec<Option<RunningNode>>>,
	dir: PathBuf,
	election_timeout_ms: u64,
	num_servers: usize,
}

impl Cluster {
	fn peers_of(&self, id: NodeId) -> Vec<NodeId> {
		(0..self.num_servers as NodeId).filter(|p| *p != id).collect()
	}

	fn request_timeout(&self) -> Duration {
		Duration::from_millis(self.election_timeout_ms * 4)
	}

	fn build_replica(&self, idx: usize) -> Result<Replica> {
		let id = idx as NodeId;
		let config = Config {
			data_dir: self.dir.join(format!("node-{}", idx)),
			election_timeout_ms: self.election_timeout_ms,
			request_timeout_ms: self.request_timeout().as_millis() as u64,
			..Config::default()
		};
		Ok(Replica::new(id, self.peers_of(id), config, Arc::new(NullObserver))?)
	}

	async fn start_node(&self, idx: usize) -> Result<()> {
		let mut nodes = self.nodes.lock().await;
		if nodes[idx].is_some() {
			return Err(anyhow!("server {} is already up", idx));
		}
		let replica = self.build_replica(idx)?;
		let inbound = self.hub.register(idx as NodeId);
		let transport = Arc::new(ChannelTransport::with_node_id(self.hub.clone(), self.request_timeout(), idx as NodeId));
		let (join, status) = raft::driver::spawn(replica, inbound, transport);
		nodes[idx] = Some(RunningNode { join, status });
		Ok(())
	}

	async fn stop_node(&self, idx: usize) -> Result<()> {
		let mut nodes = self.nodes.lock().await;
		match nodes[idx].take() {
			Some(node) => {
				self.hub.unregister(idx as NodeId);
				node.join.abort();
				Ok(())
			}
			None => Err(anyhow!("server {} is already down", idx)),
		}
	}

	async fn status_of(&self, idx: usize, detailed: bool) -> Option<String> {
		let nodes = self.nodes.lock().await;
		let node = nodes.get(idx)?.as_ref()?;
		let snapshot = node.status.borrow().clone();
		if detailed {
			Some(snapshot)
		} else {
			Some(snapshot.lines().next().unwrap_or("").to_string())
		}
	}
}

fn print_status(label: &str, body: Option<String>) {
	match body {
		Some(s) => println!("#==================== STATUS {}\n{}", label, s),
		None => println!("#==================== STATUS {}\nDOWN", label),
	}
}

async fn run_status(cluster: &Cluster, args: &[&str]) {
	let detailed = args[0] == "status";
	if let Some(raw) = args.get(1) {
		match raw.parse::<usize>() {
			Ok(idx) if idx < cluster.num_servers => {
				print_status(&idx.to_string(), cluster.status_of(idx, detailed).await);
			}
			_ => println!("# bad server index: {}", raw),
		}
		return;
	}
	for idx in 0..cluster.num_servers {
		print_status(&idx.to_string(), cluster.status_of(idx, detailed).await);
	}
}

async fn run_send(cluster: &Arc<Cluster>, clients: &Arc<Vec<Router>>, message_id: &Arc<AtomicI64>, args: &[&str]) {
	let num: i64 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(1);
	if num <= 0 {
		return;
	}
	let targets: Vec<usize> = match args.get(2).and_then(|s| s.parse::<usize>().ok()) {
		Some(idx) if idx < clients.len() => vec![idx],
		Some(idx) => {
			println!("# bad client index: {}", idx);
			return;
		}
		None => (0..clients.len()).collect(),
	};

	for client_idx in targets {
		let start = message_id.fetch_add(num, Ordering::SeqCst);
		println!("# Client {} sending {} messages start: {}", client_idx, num, start);
		let clients = clients.clone();
		let cluster = cluster.clone();
		tokio::spawn(async move {
			for i in 0..num {
				let id = start + i;
				let payload = Bytes::from(format!("{:010}", id).into_bytes());
				let began = Instant::now();
				let deadline = began + Duration::from_secs(30);
				let result = clients[client_idx].submit(payload, Some(client_idx as i64), Some(id), deadline).await;
				let elapsed = began.elapsed().as_secs_f64();
				match result {
					Ok(pos) => println!("# [{}] Message committed: {} [{:.2} sec] @{}", client_idx, id, elapsed, pos),
					Err(e) => println!("# [{}] Message NOT committed: {} [{:.2} sec]: {}", client_idx, id, elapsed, e),
				}
			}
			let _ = cluster;
		});
	}
}

#[tokio::main]
async fn main() -> Result<()> {
	tracing_subscriber::fmt::init();
	let cli = Cli::parse();

	let hub = ChannelHub::new();
	let cluster = Arc::new(Cluster {
		hub,
		nodes: Mutex::new((0..cli.num_servers).map(|_| None).collect()),
		dir: cli.dir.clone(),
		election_timeout_ms: cli.election_timeout_ms,
		num_servers: cli.num_servers,
	});

	for idx in 0..cli.num_servers {
		cluster.start_node(idx).await?;
		tracing::info!(node = idx, dir = %cluster.dir.join(format!("node-{}", idx)).display(), "server started");
	}

	let client_transport = Arc::new(ChannelTransport::new(cluster.hub.clone(), cluster.request_timeout()));
	let clients: Arc<Vec<Router>> = Arc::new(
		(0..cli.num_clients)
			.map(|_| Router::new((0..cli.num_servers as NodeId).collect(), client_transport.clone(), RouterConfig::default()))
			.collect(),
	);
	let message_id = Arc::new(AtomicI64::new(0));

	println!("# started {} servers, {} clients; type 'quit' to exit", cli.num_servers, cli.num_clients);

	let mut lines = BufReader::new(tokio::io::stdin()).lines();
	loop {
		print!("===> ");
		std::io::stdout().flush().ok();

		let line = match lines.next_line().await? {
			Some(l) => l,
			None => break,
		};
		let comp: Vec<&str> = line.trim().split_whitespace().collect();
		if comp.is_empty() {
			continue;
		}

		match comp[0] {
			"quit" => break,
			"down" => match comp.get(1).and_then(|s| s.parse::<usize>().ok()) {
				Some(idx) if idx < cluster.num_servers => {
					println!("# Taking down server {}", idx);
					if let Err(e) = cluster.stop_node(idx).await {
						println!("# {}", e);
					}
				}
				_ => println!("# usage: down <idx>"),
			},
			"up" => match comp.get(1).and_then(|s| s.parse::<usize>().ok()) {
				Some(idx) if idx < cluster.num_servers => {
					println!("# Putting up server {}", idx);
					if let Err(e) = cluster.start_node(idx).await {
						println!("# {}", e);
					}
				}
				_ => println!("# usage: up <idx>"),
			},
			"status" | "stat" => run_status(&cluster, &comp).await,
			"send" => run_send(&cluster, &clients, &message_id, &comp).await,
			other => println!("# unknown command: {}", other),
		}
	}

	println!("DONE");
	Ok(())
}
