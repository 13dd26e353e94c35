//! CLI entry point: parses a node's configuration, recovers its durable
//! state, and runs it until `Ctrl-C` asks for a graceful shutdown.

use std::collections::HashMap;
use std::fs::{self, File};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use fs2::FileExt;
use tokio::net::TcpListener;
use tracing::{error, info};

use raftkv::client::serve_clients;
use raftkv::errors::*;
use raftkv::node::Node;
use raftkv::protos::ServerId;
use raftkv::state_machine::MemoryKVStateMachine;
use raftkv::transport::{serve_tcp, TcpTransport};

#[derive(Parser, Debug)]
#[command(name = "raftkv-node", about = "A replicated key-value node")]
struct Opt {
	/// Directory to store this node's durable state. Locked for the
	/// lifetime of the process; a second instance pointed at the same
	/// directory refuses to start.
	#[arg(long, short = 'd')]
	dir: PathBuf,

	/// This node's own id. Must appear in `--peers`.
	#[arg(long)]
	id: ServerId,

	/// The full cluster membership as a comma-separated `id@host:port` list,
	/// including this node itself. Membership is fixed for the process's
	/// lifetime; there is no runtime join/leave.
	#[arg(long, value_delimiter = ',')]
	peers: Vec<String>,

	/// Marks this invocation as the first node of a brand-new cluster. Has
	/// no effect on recovery of an already-initialised data directory; kept
	/// so an operator's bring-up script can pass it unconditionally.
	#[arg(long)]
	bootstrap: bool,
}

struct PeerAddr {
	id: ServerId,
	raft_addr: SocketAddr,
	client_addr: SocketAddr,
	metrics_addr: SocketAddr,
}

fn parse_peers(raw: &[String]) -> Result<Vec<PeerAddr>> {
	let mut out = Vec::with_capacity(raw.len());

	for entry in raw {
		let (id_str, addr_str) = entry
			.split_once('@')
			.ok_or_else(|| Error::from(format!("peer entry '{}' is not in id@host:port form", entry)))?;

		let id: ServerId = id_str
			.parse()
			.map_err(|_| Error::from(format!("peer entry '{}' has a non-numeric id", entry)))?;

		let raft_addr: SocketAddr = addr_str
			.parse()
			.map_err(|_| Error::from(format!("peer entry '{}' has an invalid address", entry)))?;

		// The raft port hosts inter-node RPCs; client and metrics traffic
		// each get their own port one and two above it, so a single
		// `id@host:port` entry is enough to address all three surfaces of
		// a given node.
		let client_addr = SocketAddr::new(raft_addr.ip(), raft_addr.port() + 1);
		let metrics_addr = SocketAddr::new(raft_addr.ip(), raft_addr.port() + 2);

		out.push(PeerAddr { id, raft_addr, client_addr, metrics_addr });
	}

	Ok(out)
}

/// Holds an exclusive lock on `dir/LOCK` for the lifetime of the process, so
/// two node processes can never share a data directory.
struct DirLock {
	_file: File,
}

impl DirLock {
	fn acquire(dir: &std::path::Path) -> Result<DirLock> {
		fs::create_dir_all(dir)?;
		let path = dir.join("LOCK");
		let file = File::create(&path)?;
		file.try_lock_exclusive()
			.map_err(|_| Error::from(format!("data directory {} is already locked by another process", dir.display())))?;
		Ok(DirLock { _file: file })
	}
}

#[tokio::main]
async fn main() -> Result<()> {
	tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

	let opt = Opt::parse();

	if opt.bootstrap {
		info!(id = opt.id, "starting as the first node of a new cluster");
	}

	let peers = parse_peers(&opt.peers)?;
	let this_peer = peers
		.iter()
		.find(|p| p.id == opt.id)
		.ok_or_else(|| Error::from(format!("--id {} is not present in --peers", opt.id)))?;

	let _lock = DirLock::acquire(&opt.dir)?;

	let peer_ids = peers.iter().map(|p| p.id).collect();
	let raft_addresses: HashMap<ServerId, String> = peers.iter().map(|p| (p.id, p.raft_addr.to_string())).collect();

	let state_machine = Arc::new(MemoryKVStateMachine::new());
	let transport = Arc::new(TcpTransport::new(raft_addresses));

	let node = Node::open(&opt.dir, opt.id, peer_ids, state_machine, transport)?;

	let raft_listener = TcpListener::bind(this_peer.raft_addr).await?;
	let client_listener = TcpListener::bind(this_peer.client_addr).await?;
	info!(raft = %this_peer.raft_addr, client = %this_peer.client_addr, metrics = %this_peer.metrics_addr, "node listening");

	let rpc_node = node.clone();
	tokio::spawn(async move {
		if let Err(e) = serve_tcp(raft_listener, rpc_node).await {
			error!(error = %e, "raft rpc listener exited");
		}
	});

	let client_node = node.clone();
	tokio::spawn(async move {
		if let Err(e) = serve_clients(client_listener, client_node).await {
			error!(error = %e, "client rpc listener exited");
		}
	});

	let metrics_module = node.module();
	let metrics_metrics = node.metrics();
	let metrics_log = node.log();
	let metrics_addr = this_peer.metrics_addr;
	tokio::spawn(async move {
		let result = raftkv::metrics::serve_metrics(metrics_addr, metrics_module, metrics_metrics, move || metrics_log.last_index().unwrap_or(0));
		if let Err(e) = result.await {
			error!(error = %e, "metrics server exited");
		}
	});

	let run_node = node.clone();
	let run_handle = tokio::spawn(async move { run_node.run().await });

	tokio::signal::ctrl_c().await?;
	info!("received ctrl-c, shutting down");
	node.stop();
	let _ = run_handle.await;

	Ok(())
}
