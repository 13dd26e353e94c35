//! The node shell: owns the consensus module, log, state machine and
//! transport, drains `Tick`s, and is the only place in this crate that does
//! real I/O or awaits anything on behalf of the consensus core.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use super::consensus::{ConsensusModule, ConsensusModuleHandle, ProposeError, Tick};
use super::errors::*;
use super::log::{FileLogStorage, LogStorage};
use super::protos::*;
use super::state_machine::KeyValueStateMachine;
use super::client::ClientHandler;
use super::transport::{LoopbackPeer, RaftTransport, DEFAULT_DEADLINE};

/// The running counters a `/metrics` endpoint reads without touching the
/// consensus lock.
#[derive(Default)]
pub struct NodeMetrics {
	pub last_applied: AtomicU64,
}

pub struct Node {
	id: ServerId,
	dir: PathBuf,
	module: ConsensusModuleHandle,
	log: Arc<dyn LogStorage>,
	state_machine: Arc<dyn KeyValueStateMachine>,
	transport: Arc<dyn RaftTransport>,
	metrics: Arc<NodeMetrics>,
	running: Arc<AtomicBool>,
	/// Lets `&self`-only trait methods (`ClientHandler`) recover an `Arc<Self>`
	/// to call the `Arc`-based `put`, which needs to spawn dispatch tasks.
	self_weak: Mutex<Weak<Node>>,
}

fn meta_path(dir: &Path) -> PathBuf {
	dir.join("meta.bin")
}

fn load_metadata(dir: &Path) -> Result<Metadata> {
	let path = meta_path(dir);
	if !path.exists() {
		return Ok(Metadata::default());
	}
	let bytes = fs::read(&path)?;
	Ok(rmp_serde::from_slice(&bytes)?)
}

/// Writes `meta` durably via write-temp-then-rename, the same discipline
/// used for the snapshot file (§6): a crash never leaves a half-written
/// metadata file for the next `open()` to trip over.
fn persist_metadata(dir: &Path, meta: &Metadata) -> Result<()> {
	let tmp_path = dir.join("meta.bin.tmp");
	let encoded = rmp_serde::to_vec(meta)?;
	fs::write(&tmp_path, &encoded)?;
	fs::rename(&tmp_path, meta_path(dir))?;
	Ok(())
}

/// A log/snapshot I/O failure (or a consensus invariant violation) means we
/// can no longer trust this node's durable state. We would rather crash than
/// risk acknowledging a write that was never made durable, so this never
/// returns.
fn crash_on_fatal(e: &Error) -> ! {
	error!(error = %e, "fatal storage error; terminating process");
	std::process::exit(1);
}

impl Node {
	/// Recovers (or initialises) a node's durable state in `dir` and wires up
	/// the consensus module against `peers` (which must include `id`).
	pub fn open(dir: &Path, id: ServerId, peers: HashSet<ServerId>, state_machine: Arc<dyn KeyValueStateMachine>, transport: Arc<dyn RaftTransport>) -> Result<Arc<Node>> {
		let log: Arc<dyn LogStorage> = Arc::new(FileLogStorage::open(dir)?);
		let meta = load_metadata(dir)?;

		if let Some(snapshot) = log.load_snapshot() {
			state_machine.restore(&snapshot.data)?;
		}

		let module = ConsensusModule::new(id, meta, peers, log.clone());

		let node = Arc::new(Node {
			id,
			dir: dir.to_owned(),
			module: Arc::new(Mutex::new(module)),
			log,
			state_machine,
			transport,
			metrics: Arc::new(NodeMetrics::default()),
			running: Arc::new(AtomicBool::new(true)),
			self_weak: Mutex::new(Weak::new()),
		});
		*node.self_weak.lock().unwrap() = Arc::downgrade(&node);

		Ok(node)
	}

	pub fn id(&self) -> ServerId {
		self.id
	}

	pub fn metrics(&self) -> Arc<NodeMetrics> {
		self.metrics.clone()
	}

	pub fn module(&self) -> ConsensusModuleHandle {
		self.module.clone()
	}

	pub fn log(&self) -> Arc<dyn LogStorage> {
		self.log.clone()
	}

	pub fn stop(&self) {
		self.running.store(false, Ordering::SeqCst);
	}

	/// Runs the election/timer loop until `stop()` is called. Each pass locks
	/// the consensus module exactly once, drains the resulting `Tick`, then
	/// sleeps until the tick says to come back.
	pub async fn run(self: &Arc<Self>) {
		loop {
			if !self.running.load(Ordering::SeqCst) {
				return;
			}

			let mut tick = Tick::empty();
			{
				let mut module = self.module.lock().unwrap();
				module.cycle(&mut tick);
			}

			let wait = self.drain_tick(tick).await;

			tokio::time::sleep(wait.unwrap_or(Duration::from_millis(50))).await;
		}
	}

	/// Applies everything a `Tick` asked for: persists metadata, restores a
	/// just-installed snapshot, replays newly-committed entries into the
	/// state machine, and dispatches outbound messages. Returns the
	/// requested `next_tick` duration, if any.
	async fn drain_tick(self: &Arc<Self>, mut tick: Tick) -> Option<Duration> {
		let messages = std::mem::take(&mut tick.messages);
		let next_tick = tick.next_tick;

		self.drain_local(tick).await;

		for msg in messages {
			self.dispatch_message(msg);
		}

		next_tick
	}

	fn dispatch_message(self: &Arc<Self>, msg: Message) {
		for peer in msg.to {
			let this = self.clone();
			let body = msg.body.clone();

			tokio::spawn(async move {
				this.send_one(peer, body).await;
			});
		}
	}

	async fn send_one(self: Arc<Self>, peer: ServerId, body: MessageBody) {
		let mut tick = Tick::empty();

		match body {
			MessageBody::RequestVote(req) => match self.transport.request_vote(peer, req, DEFAULT_DEADLINE).await {
				Ok(resp) => self.module.lock().unwrap().request_vote_callback(peer, resp, &mut tick),
				Err(e) => {
					debug!(peer, error = %e, "request_vote failed");
					return;
				}
			},
			MessageBody::AppendEntries(req, last_index) => match self.transport.append_entries(peer, req, DEFAULT_DEADLINE).await {
				Ok(resp) => self.module.lock().unwrap().append_entries_callback(peer, last_index, resp, &mut tick),
				Err(e) => {
					debug!(peer, error = %e, "append_entries failed");
					self.module.lock().unwrap().append_entries_noresponse(peer, &mut tick);
				}
			},
			MessageBody::InstallSnapshot(req) => {
				let last_included_index = req.last_included_index;
				match self.transport.install_snapshot_chunk(peer, req, DEFAULT_DEADLINE).await {
					Ok(resp) => self.module.lock().unwrap().install_snapshot_callback(peer, last_included_index, resp, &mut tick),
					Err(e) => {
						debug!(peer, error = %e, "install_snapshot_chunk failed");
						self.module.lock().unwrap().append_entries_noresponse(peer, &mut tick);
					}
				}
			}
		}

		self.drain_tick(tick).await;
	}

	/// Proposes a write. On success, waits (by polling `proposal_status`)
	/// until the entry commits or is abandoned.
	pub async fn put(self: &Arc<Self>, key: Vec<u8>, value: Vec<u8>) -> std::result::Result<(), NotLeader> {
		let proposal = {
			let mut module = self.module.lock().unwrap();
			let mut tick = Tick::empty();
			let result = module.propose_command(key, value, &mut tick);
			drop(module);
			self.drain_tick(tick).await;

			match result {
				Ok(p) => p,
				Err(ProposeError::NotLeader { leader_hint }) => return Err(NotLeader { leader_hint }),
			}
		};

		loop {
			use super::consensus::ProposalStatus;

			let status = self.module.lock().unwrap().proposal_status(&proposal);
			match status {
				ProposalStatus::Committed => return Ok(()),
				ProposalStatus::Failed | ProposalStatus::Unavailable => {
					return Err(NotLeader { leader_hint: None });
				}
				ProposalStatus::Pending => {
					tokio::time::sleep(Duration::from_millis(5)).await;
				}
			}
		}
	}

	pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
		self.state_machine.get(key)
	}

	pub fn current_leader_hint(&self) -> Option<ServerId> {
		let module = self.module.lock().unwrap();
		if module.role_name() == "leader" {
			Some(module.id())
		} else {
			module.meta().voted_for
		}
	}
}

/// Wires the node up as the target of a `LoopbackTransport`, or as the
/// handler behind `serve_tcp`.
#[async_trait]
impl LoopbackPeer for Node {
	async fn handle_append_entries(&self, req: AppendEntriesRequest) -> AppendEntriesResponse {
		let mut tick = Tick::empty();
		let result = self.module.lock().unwrap().append_entries(req, &mut tick);

		match result {
			Ok(constraint) => {
				// The entries this response vouches for are already durable:
				// `ConsensusModule::append_entries` only returns success after
				// `log.append` returned, so releasing immediately is sound.
				let response = constraint.release();
				self.drain_local(tick).await;
				response
			}
			Err(e) => {
				if e.is_fatal() {
					crash_on_fatal(&e);
				}
				warn!(error = %e, "append_entries rejected");
				AppendEntriesResponse { term: self.module.lock().unwrap().meta().current_term, success: false, last_log_index: None }
			}
		}
	}

	async fn handle_request_vote(&self, req: RequestVoteRequest) -> RequestVoteResponse {
		let mut tick = Tick::empty();
		let resp = self.module.lock().unwrap().request_vote(req, &mut tick).persisted();
		self.drain_local(tick).await;
		resp
	}

	async fn handle_install_snapshot(&self, req: InstallSnapshotChunk) -> InstallSnapshotResponse {
		let mut tick = Tick::empty();
		let result = self.module.lock().unwrap().install_snapshot(req, &mut tick);

		match result {
			Ok(resp) => {
				self.drain_local(tick).await;
				resp
			}
			Err(e) => {
				if e.is_fatal() {
					crash_on_fatal(&e);
				}
				error!(error = %e, "install_snapshot failed");
				InstallSnapshotResponse { term: self.module.lock().unwrap().meta().current_term, success: false }
			}
		}
	}
}

impl Node {
	/// The subset of `drain_tick` that only needs `&self`: persist metadata
	/// and replay newly-committed entries. Used by the inbound-RPC handlers
	/// above, which by construction never need to dispatch outbound messages
	/// — an inbound AppendEntries/RequestVote/InstallSnapshot never itself
	/// causes this node to reply to third parties; only the leader-driven
	/// tick loop (`run`) does, and it observes any resulting state change
	/// (e.g. a demotion) on its own next pass.
	async fn drain_local(&self, tick: Tick) {
		if tick.meta {
			let meta = self.module.lock().unwrap().meta().clone();
			if let Err(e) = persist_metadata(&self.dir, &meta) {
				error!(error = %e, "failed to persist metadata; node cannot continue safely");
				self.stop();
				return;
			}
		}

		if let Some((index, data)) = tick.snapshot_installed {
			if let Err(e) = self.state_machine.restore(&data) {
				error!(error = %e, "failed to restore state machine from installed snapshot");
				self.stop();
				return;
			}
			self.metrics.last_applied.store(index, Ordering::SeqCst);
		}

		let commit_index = self.module.lock().unwrap().commit_index();
		let mut last_applied = self.metrics.last_applied.load(Ordering::SeqCst);
		while last_applied < commit_index {
			let next = last_applied + 1;
			let entry = match self.log.entry(next) {
				Some(e) => e,
				None => break,
			};
			if let LogEntryData::Command { key, value } = entry.data {
				self.state_machine.put(key, value);
			}
			last_applied = next;
			self.metrics.last_applied.store(last_applied, Ordering::SeqCst);
		}

		debug_assert!(tick.messages.is_empty(), "inbound RPC handling should never itself produce outbound messages");
	}
}

#[async_trait]
impl ClientHandler for Node {
	async fn handle_put(&self, req: PutRequest) -> PutResponse {
		let this = self.self_weak.lock().unwrap().upgrade().expect("node dropped while handling a client request");

		match this.put(req.key, req.value).await {
			Ok(()) => PutResponse { success: true, leader_hint: Some(this.id()) },
			Err(NotLeader { leader_hint }) => PutResponse { success: false, leader_hint },
		}
	}

	async fn handle_get(&self, req: GetRequest) -> GetResponse {
		match self.get(&req.key) {
			Some(value) => GetResponse { found: true, value: Some(value) },
			None => GetResponse { found: false, value: None },
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::state_machine::MemoryKVStateMachine;
	use crate::transport::LoopbackTransport;

	fn peers(ids: &[ServerId]) -> HashSet<ServerId> {
		ids.iter().copied().collect()
	}

	#[tokio::test]
	async fn single_node_put_then_get() {
		let dir = tempfile::tempdir().unwrap();
		let sm = Arc::new(MemoryKVStateMachine::new());
		let transport = Arc::new(LoopbackTransport::new());
		let node = Node::open(dir.path(), 1, peers(&[1]), sm, transport).unwrap();

		let node_clone = node.clone();
		let handle = tokio::spawn(async move { node_clone.run().await });

		node.put(b"x".to_vec(), b"1".to_vec()).await.unwrap();
		assert_eq!(node.get(b"x"), Some(b"1".to_vec()));

		node.stop();
		let _ = tokio::time::timeout(Duration::from_millis(200), handle).await;
	}
}
