//! The synchronous consensus core (C3/C4/C5): everything here is a plain
//! method that mutates in-memory state and returns a `Tick` describing side
//! effects. Nothing in this module awaits or blocks on I/O or network —
//! that's the node shell's job, one layer up.

use super::constraint::*;
use super::errors::*;
use super::log::LogStorage;
use super::protos::*;
use super::state::*;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::RngCore;

/// Election timer draws uniformly from this range each cycle.
const ELECTION_TIMEOUT: (u64, u64) = (150, 300);

/// If the leader has sent nothing to a follower within this long, it sends an
/// empty heartbeat. Must be well under `ELECTION_TIMEOUT.0`.
const HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(50);

/// Same type as `LogPosition`; kept distinct so callers don't need to know
/// a proposal is implemented as one.
pub type Proposal = LogPosition;

/// On success, the entry has been accepted into the log and may eventually
/// commit at the given position.
pub type ProposeResult = std::result::Result<Proposal, ProposeError>;

#[derive(Debug)]
pub enum ProposeError {
	/// This server can't propose right now because it isn't the leader.
	NotLeader { leader_hint: Option<ServerId> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalStatus {
	/// Safely replicated; will be (or has been) applied to the state machine.
	Committed,
	/// Abandoned — typically superseded by a new leader before it replicated.
	Failed,
	/// Still pending replication.
	Pending,
	/// Before the start of this node's log (snapshotted away or never seen).
	Unavailable,
}

pub type ConsensusModuleHandle = Arc<Mutex<ConsensusModule>>;

/// Everything the consensus core asked the node shell to do as a result of a
/// single externally visible event (a tick, an inbound RPC, an RPC response).
pub struct Tick {
	/// Monotonic time at which this tick occurred.
	pub time: Instant,

	/// Persisted `Metadata` (`current_term`, `voted_for`) changed and must be
	/// written to disk before any message in `messages` is sent.
	pub meta: bool,

	/// New entries were appended to the log during this tick.
	pub new_entries: bool,

	/// A snapshot was just installed locally: `(lastIncludedIndex, kvBytes)`.
	/// The node shell must restore the state machine from `kvBytes` and
	/// advance its `lastApplied` mirror to match before driving anything else.
	pub snapshot_installed: Option<(LogIndex, Vec<u8>)>,

	/// Messages that need to be sent out as a result of this tick.
	pub messages: Vec<Message>,

	/// If set, the node shell should wake this module again after this
	/// duration elapses (assuming no earlier event preempts it).
	pub next_tick: Option<Duration>,
}

impl Tick {
	pub fn empty() -> Self {
		Tick {
			time: Instant::now(),
			meta: false,
			new_entries: false,
			snapshot_installed: None,
			messages: vec![],
			next_tick: None,
		}
	}

	pub fn write_meta(&mut self) {
		self.meta = true;
	}

	pub fn send(&mut self, msg: Message) {
		self.messages.push(msg);
	}
}

/// A value that can only be returned to its caller once the metadata changes
/// it implies have actually been written to disk. Mostly a self-check: there
/// is no way to generically verify the caller actually persisted it.
pub struct MustPersistMetadata<T> {
	inner: T,
}

impl<T> MustPersistMetadata<T> {
	fn new(inner: T) -> Self {
		MustPersistMetadata { inner }
	}

	pub fn persisted(self) -> T {
		self.inner
	}
}

pub struct ConsensusModule {
	/// Id of the server this module represents.
	id: ServerId,

	meta: Metadata,

	/// The full cluster membership, including `id` itself. Fixed for the
	/// lifetime of the module: membership changes are out of scope.
	peers: HashSet<ServerId>,

	/// Highest index known committed. Volatile — not persisted; after a
	/// restart it is safe to start low and let replication/heartbeats drive
	/// it back up, since the underlying data is already durable in the log.
	commit_index: LogIndex,

	/// A reader (and, exclusively for this module, writer) of the durable log.
	log: Arc<dyn LogStorage>,

	state: ServerState,

	/// Lifetime count of elections this node has started, for `/metrics`.
	elections_started: u64,

	/// Lifetime count of negative AppendEntries/InstallSnapshot acks (or
	/// lost responses) observed while leading, for `/metrics`.
	replication_failures: u64,
}

impl ConsensusModule {
	/// Creates a new consensus module from persisted state recovered at
	/// startup. `log` must already have replayed whatever was durable.
	pub fn new(id: ServerId, mut meta: Metadata, peers: HashSet<ServerId>, log: Arc<dyn LogStorage>) -> ConsensusModule {
		// If we never persisted a vote in a term but our own log contains
		// entries from a later term (e.g. we crashed right after appending but
		// before persisting metadata), we know we did not cast a vote in that
		// later term either.
		let last_log_index = log.last_index().unwrap_or(0);
		let last_log_term = log.term(last_log_index).unwrap_or(0);
		if last_log_term > meta.current_term {
			meta.current_term = last_log_term;
			meta.voted_for = None;
		}

		ConsensusModule {
			id,
			meta,
			peers,
			commit_index: 0,
			log,
			state: Self::new_follower(Instant::now()),
			elections_started: 0,
			replication_failures: 0,
		}
	}

	pub fn id(&self) -> ServerId {
		self.id
	}

	pub fn meta(&self) -> &Metadata {
		&self.meta
	}

	pub fn commit_index(&self) -> LogIndex {
		self.commit_index
	}

	pub fn last_index(&self) -> LogIndex {
		self.log.last_index().unwrap_or(0)
	}

	pub fn role_name(&self) -> &'static str {
		self.state.role_name()
	}

	pub fn elections_started(&self) -> u64 {
		self.elections_started
	}

	pub fn replication_failures(&self) -> u64 {
		self.replication_failures
	}

	/// Restores volatile state after a locally-installed snapshot moved the
	/// log's virtual start forward. Called by the node shell right after it
	/// observes `Tick::snapshot_installed`.
	pub fn set_commit_index_floor(&mut self, index: LogIndex) {
		if index > self.commit_index {
			self.commit_index = index;
		}
	}

	/// Proposes a `put(key, value)` command. Only succeeds on the leader.
	pub fn propose_command(&mut self, key: Vec<u8>, value: Vec<u8>, out: &mut Tick) -> ProposeResult {
		self.propose_entry(LogEntryData::Command { key, value }, out)
	}

	pub fn propose_noop(&mut self, out: &mut Tick) -> ProposeResult {
		self.propose_entry(LogEntryData::Noop, out)
	}

	/// Checks the progress of a previously initiated proposal. Safe to query
	/// on any server, though the answer converges fastest on the leader.
	pub fn proposal_status(&self, prop: &Proposal) -> ProposalStatus {
		let last_log_index = self.log.last_index().unwrap_or(0);

		if prop.index > last_log_index {
			return ProposalStatus::Pending;
		}

		let cur_term = match self.log.term(prop.index) {
			Some(v) => v,
			None => return ProposalStatus::Unavailable,
		};

		if cur_term != prop.term {
			// A different entry now occupies this index: ours was truncated
			// away in favor of a conflicting one from a later leader.
			return ProposalStatus::Failed;
		}

		if self.commit_index >= prop.index {
			ProposalStatus::Committed
		} else {
			ProposalStatus::Pending
		}
	}

	fn propose_entry(&mut self, data: LogEntryData, out: &mut Tick) -> ProposeResult {
		if let ServerState::Leader(_) = self.state {
			let index = self.log.last_index().unwrap_or(0) + 1;
			let term = self.meta.current_term;
			assert!(term > 0, "a leader always has a current_term > 0");

			out.new_entries = true;
			self.log
				.append(LogEntry { term, index, data })
				.expect("log append failed on leader; this is fatal to the node");

			self.cycle(out);

			Ok(Proposal { term, index })
		} else if let ServerState::Follower(ref s) = self.state {
			Err(ProposeError::NotLeader {
				leader_hint: s.last_leader_id.or(self.meta.voted_for),
			})
		} else {
			Err(ProposeError::NotLeader { leader_hint: None })
		}
	}

	/// Advances local state based on elapsed time and the current role, and
	/// issues whatever RPCs / elections are now due. Safe (and necessary) to
	/// call repeatedly; it always produces a `next_tick` when there is
	/// nothing further to do right away.
	pub fn cycle(&mut self, tick: &mut Tick) {
		enum Summary {
			Follower { elapsed: Duration, election_timeout: Duration },
			Candidate { vote_count: usize, election_start: Instant, election_timeout: Duration },
			Leader { next_commit_index: Option<LogIndex> },
		}

		let summary = match self.state {
			ServerState::Follower(ref s) => Summary::Follower {
				elapsed: tick.time.duration_since(s.last_heartbeat),
				election_timeout: s.election_timeout,
			},
			ServerState::Candidate(ref s) => Summary::Candidate {
				vote_count: 1 + s.votes_received.len(),
				election_start: s.election_start,
				election_timeout: s.election_timeout,
			},
			ServerState::Leader(ref s) => Summary::Leader {
				next_commit_index: self.find_next_commit_index(s),
			},
		};

		match summary {
			Summary::Follower { elapsed, election_timeout } => {
				if !self.can_be_leader() {
					if self.peers.len() == 1 {
						panic!("corrupt log prevents the sole node in a single-node cluster from ever becoming leader");
					}
					self.state = Self::new_follower(tick.time);
				} else if elapsed >= election_timeout || self.peers.len() == 1 {
					self.start_election(tick);
				} else {
					tick.next_tick = Some(election_timeout - elapsed);
					return;
				}
			}
			Summary::Candidate { vote_count, election_start, election_timeout } => {
				let majority = self.majority_size();

				if vote_count >= majority {
					let last_log_index = self.log.last_index().unwrap_or(0);

					let servers = self
						.peers
						.iter()
						.filter(|s| **s != self.id)
						.map(|s| (*s, ServerProgress::new(last_log_index)))
						.collect();

					self.state = ServerState::Leader(ServerLeaderState { servers });

					// Commit across the term boundary requires an entry in our
					// own term; if our log tail predates this term, force one.
					if self.commit_index < last_log_index {
						self.propose_noop(tick).expect("propose_noop failed immediately after leader install");
					}

					self.cycle(tick);
					return;
				}

				let elapsed = tick.time.duration_since(election_start);
				if elapsed >= election_timeout {
					self.start_election(tick);
				} else {
					tick.next_tick = Some(election_timeout - elapsed);
					return;
				}
			}
			Summary::Leader { next_commit_index } => {
				if let Some(ci) = next_commit_index {
					self.update_committed(ci, tick);
				}

				let mut next_heartbeat = self.replicate_entries(tick);
				if self.peers.len() == 1 {
					next_heartbeat = Duration::from_secs(2);
				}
				tick.next_tick = Some(next_heartbeat);
				return;
			}
		}
	}

	/// A leader may have committed entries it never locally persisted past
	/// (e.g. by counting followers alone); such a node cannot be trusted to
	/// lead again until it resyncs to at least its own commit point.
	fn can_be_leader(&self) -> bool {
		self.log.last_index().unwrap_or(0) >= self.commit_index
	}

	fn find_next_commit_index(&self, s: &ServerLeaderState) -> Option<LogIndex> {
		let mut ci = self.log.last_index().unwrap_or(0);
		let majority = self.majority_size();

		while ci > self.commit_index {
			let term = match self.log.term(ci) {
				Some(t) => t,
				None => break,
			};

			if term < self.meta.current_term {
				// Terms are monotone by index: nothing further back can be
				// from the current term either.
				break;
			} else if term == self.meta.current_term {
				// The from-current-term restriction (Raft Figure 8): a
				// leader only ever advances commitIndex to an entry from its
				// own term, even if an earlier entry already has majority.
				let mut count = 1; // ourselves

				for (id, progress) in s.servers.iter() {
					if *id == self.id || !self.peers.contains(id) {
						continue;
					}
					if progress.match_index >= ci {
						count += 1;
					}
				}

				if count >= majority {
					return Some(ci);
				}
			}

			ci -= 1;
		}

		None
	}

	/// Produces (and records onto `tick`) whatever AppendEntries/InstallSnapshot
	/// requests are currently due, and returns how long until the next
	/// heartbeat is due assuming nothing else happens first.
	fn replicate_entries(&mut self, tick: &mut Tick) -> Duration {
		let id = self.id;
		let term = self.meta.current_term;
		let leader_commit = self.commit_index;
		let peers = self.peers.clone();
		let log = self.log.clone();
		let snapshot = log.load_snapshot();

		let state = match self.state {
			ServerState::Leader(ref mut s) => s,
			_ => panic!("replicate_entries called while not the leader"),
		};

		let last_log_index = log.last_index().unwrap_or(0);

		let mut message_map: HashMap<LogIndex, Message> = HashMap::new();
		let mut since_last_heartbeat = Duration::from_millis(0);

		for peer_id in peers.iter() {
			if *peer_id == id {
				continue;
			}

			let progress = state.servers.entry(*peer_id).or_insert_with(|| ServerProgress::new(last_log_index));

			if progress.request_pending {
				continue;
			}

			if progress.match_index >= last_log_index {
				if let Some(last_sent) = progress.last_sent {
					let elapsed = tick.time.duration_since(last_sent);
					if elapsed < HEARTBEAT_TIMEOUT {
						since_last_heartbeat = since_last_heartbeat.max(elapsed);
						continue;
					}
				}
			}

			progress.request_pending = true;
			progress.last_sent = Some(tick.time);

			if let Some(ref snap) = snapshot {
				if progress.next_index <= snap.last_included_index {
					tick.send(Message {
						to: vec![*peer_id],
						body: MessageBody::InstallSnapshot(InstallSnapshotChunk {
							term,
							leader_id: id,
							last_included_index: snap.last_included_index,
							last_included_term: snap.last_included_term,
							data: snap.data.clone(),
							done: true,
						}),
					});
					continue;
				}
			}

			let prev_log_index = progress.next_index - 1;
			let msg_key = prev_log_index;

			if let Some(msg) = message_map.get_mut(&msg_key) {
				msg.to.push(*peer_id);
			} else {
				let mut entries = vec![];
				for i in (prev_log_index + 1)..=last_log_index {
					entries.push(log.entry(i).expect("entry within [first_index, last_index] must exist"));
				}

				let req = AppendEntriesRequest {
					term,
					leader_id: id,
					prev_log_index,
					prev_log_term: log.term(prev_log_index).unwrap_or(0),
					entries,
					leader_commit,
				};

				message_map.insert(
					msg_key,
					Message {
						to: vec![*peer_id],
						body: MessageBody::AppendEntries(req, last_log_index),
					},
				);
			}
		}

		for (_, msg) in message_map.into_iter() {
			tick.send(msg);
		}

		HEARTBEAT_TIMEOUT.saturating_sub(since_last_heartbeat)
	}

	fn start_election(&mut self, tick: &mut Tick) {
		if !self.can_be_leader() {
			panic!("this node cannot lead the cluster until it resyncs its log");
		}

		let must_increment = match self.state {
			ServerState::Candidate(ref s) => s.some_rejected,
			_ => true,
		};

		if must_increment {
			self.meta.current_term += 1;
			self.meta.voted_for = Some(self.id);
			tick.write_meta();
		}

		self.state = ServerState::Candidate(ServerCandidateState {
			election_start: tick.time,
			election_timeout: Self::new_election_timeout(),
			votes_received: HashSet::new(),
			some_rejected: false,
		});
		self.elections_started += 1;

		self.perform_election(tick);
		self.cycle(tick);
	}

	fn perform_election(&self, tick: &mut Tick) {
		let last_log_index = self.log.last_index().unwrap_or(0);
		let last_log_term = self.log.term(last_log_index).unwrap_or(0);

		let req = RequestVoteRequest {
			term: self.meta.current_term,
			candidate_id: self.id,
			last_log_index,
			last_log_term,
		};

		let ids: Vec<ServerId> = self.peers.iter().copied().filter(|s| *s != self.id).collect();
		if ids.is_empty() {
			return;
		}

		tick.send(Message { to: ids, body: MessageBody::RequestVote(req) });
	}

	fn new_follower(now: Instant) -> ServerState {
		ServerState::Follower(ServerFollowerState {
			election_timeout: Self::new_election_timeout(),
			last_leader_id: None,
			last_heartbeat: now,
		})
	}

	fn become_follower(&mut self, tick: &mut Tick) {
		self.state = Self::new_follower(tick.time);
		self.cycle(tick);
	}

	/// Called whenever a term is observed in a remote request or response. A
	/// higher term always demotes us to follower in that term.
	fn observe_term(&mut self, term: Term, tick: &mut Tick) {
		if term > self.meta.current_term {
			self.meta.current_term = term;
			self.meta.voted_for = None;
			tick.write_meta();
			self.become_follower(tick);
		}
	}

	fn update_committed(&mut self, index: LogIndex, tick: &mut Tick) {
		assert!(index > self.commit_index);
		self.commit_index = index;
		// commit_index is volatile (not part of `Metadata`), so no write_meta.
		let _ = tick;
	}

	/// Number of affirmative votes (including our own) needed to decide
	/// anything. Always at least 1, so an (impossible) empty cluster can
	/// never spuriously reach a majority.
	fn majority_size(&self) -> usize {
		if self.peers.is_empty() {
			return usize::MAX;
		}
		(self.peers.len() / 2) + 1
	}

	pub fn request_vote_callback(&mut self, from_id: ServerId, resp: RequestVoteResponse, tick: &mut Tick) {
		self.observe_term(resp.term, tick);

		if self.meta.current_term != resp.term {
			return;
		}
		if from_id == self.id {
			return;
		}

		let should_cycle = if let ServerState::Candidate(ref mut s) = self.state {
			if resp.vote_granted {
				s.votes_received.insert(from_id);
			} else {
				s.some_rejected = true;
			}
			true
		} else {
			false
		};

		if should_cycle {
			self.cycle(tick);
		}
	}

	pub fn append_entries_callback(&mut self, from_id: ServerId, last_index: LogIndex, resp: AppendEntriesResponse, tick: &mut Tick) {
		self.observe_term(resp.term, tick);

		let mut should_noop = false;

		let should_cycle = if let ServerState::Leader(ref mut s) = self.state {
			let progress = match s.servers.get_mut(&from_id) {
				Some(p) => p,
				None => return,
			};

			if resp.success {
				if last_index > progress.match_index {
					progress.match_index = last_index;
					progress.next_index = last_index + 1;
				}

				// A follower reporting a longer log than we just sent it is
				// either a stale former leader or talking to one; force a
				// no-op in our term so the follower's tail gets overwritten
				// once we out-rank it.
				if let Some(idx) = resp.last_log_index {
					let last_log_index = self.log.last_index().unwrap_or(0);
					let last_log_term = self.log.term(last_log_index).unwrap_or(0);
					if idx > last_log_index && last_log_term != self.meta.current_term {
						should_noop = true;
					}
				}
			} else if let Some(hint) = resp.last_log_index {
				// Conflict-index hint: jump straight to one past whatever the
				// follower says its log ends at, instead of decrementing by one.
				progress.next_index = (hint + 1).max(1);
				self.replication_failures += 1;
			} else {
				progress.next_index = progress.next_index.saturating_sub(1).max(1);
				self.replication_failures += 1;
			}

			progress.request_pending = false;
			true
		} else {
			false
		};

		if should_noop {
			self.propose_noop(tick).expect("propose_noop failed while handling append_entries_callback");
		} else if should_cycle {
			self.cycle(tick);
		}
	}

	pub fn append_entries_noresponse(&mut self, from_id: ServerId, _tick: &mut Tick) {
		if let ServerState::Leader(ref mut s) = self.state {
			if let Some(progress) = s.servers.get_mut(&from_id) {
				progress.request_pending = false;
			}
		}
		self.replication_failures += 1;
	}

	pub fn install_snapshot_callback(&mut self, from_id: ServerId, last_included_index: LogIndex, resp: InstallSnapshotResponse, tick: &mut Tick) {
		self.observe_term(resp.term, tick);

		let should_cycle = if let ServerState::Leader(ref mut s) = self.state {
			if let Some(progress) = s.servers.get_mut(&from_id) {
				if resp.success {
					progress.match_index = last_included_index;
					progress.next_index = last_included_index + 1;
				} else {
					self.replication_failures += 1;
				}
				progress.request_pending = false;
			}
			true
		} else {
			false
		};

		if should_cycle {
			self.cycle(tick);
		}
	}

	fn new_election_timeout() -> Duration {
		let mut rng = rand::thread_rng();
		let span = ELECTION_TIMEOUT.1 - ELECTION_TIMEOUT.0;
		let time = ELECTION_TIMEOUT.0 + ((rng.next_u32() as u64) * span) / (u32::MAX as u64);
		Duration::from_millis(time)
	}

	/// Checks whether a `RequestVote` would be granted, without mutating
	/// anything but the term-observation side effects already applied by the
	/// caller. Split out so a non-mutating pre-vote phase could reuse it.
	fn pre_vote(&self, req: &RequestVoteRequest) -> bool {
		if req.term < self.meta.current_term {
			return false;
		}

		let last_log_index = self.log.last_index().unwrap_or(0);
		let last_log_term = self.log.term(last_log_index).unwrap_or(0);

		let up_to_date = req.last_log_term > last_log_term || (req.last_log_term == last_log_term && req.last_log_index >= last_log_index);

		if !up_to_date {
			return false;
		}

		if req.term > self.meta.current_term {
			return true;
		}

		match self.meta.voted_for {
			Some(id) => id == req.candidate_id,
			None => true,
		}
	}

	pub fn request_vote(&mut self, req: RequestVoteRequest, tick: &mut Tick) -> MustPersistMetadata<RequestVoteResponse> {
		let candidate_id = req.candidate_id;
		self.observe_term(req.term, tick);

		let granted = self.pre_vote(&req);

		if granted {
			match self.state {
				ServerState::Follower(ref mut s) => {
					s.last_heartbeat = tick.time;
				}
				_ => panic!("granted a vote but did not transition back to follower"),
			}

			self.meta.voted_for = Some(candidate_id);
			tick.write_meta();
		}

		MustPersistMetadata::new(RequestVoteResponse {
			term: self.meta.current_term,
			vote_granted: granted,
		})
	}

	pub fn append_entries(&mut self, req: AppendEntriesRequest, tick: &mut Tick) -> Result<MatchConstraint<AppendEntriesResponse>> {
		self.observe_term(req.term, tick);

		if req.term == self.meta.current_term {
			if let ServerState::Candidate(_) = self.state {
				self.become_follower(tick);
			}
		}

		let current_term = self.meta.current_term;
		let response = |success: bool, last_log_index: Option<LogIndex>| AppendEntriesResponse {
			term: current_term,
			success,
			last_log_index,
		};

		if req.term < self.meta.current_term {
			return Ok(response(false, None).into());
		}

		match self.state {
			ServerState::Follower(ref mut s) => {
				s.last_heartbeat = tick.time;
				s.last_leader_id = Some(req.leader_id);
			}
			ServerState::Leader(_) => {
				if req.leader_id != self.id {
					return Err(ErrorKind::InvariantViolation("two leaders observed in the same term".into()).into());
				}
			}
			ServerState::Candidate(_) => {
				return Err(ErrorKind::InvariantViolation("still a candidate after observing current-term append_entries".into()).into());
			}
		}

		if req.entries.len() >= 1 {
			let first = &req.entries[0];
			if first.term < req.prev_log_term || first.index != req.prev_log_index + 1 {
				return Err(ErrorKind::InvariantViolation("first entry does not follow prev_log_index".into()).into());
			}
			for w in req.entries.windows(2) {
				if w[0].term > w[1].term || w[1].index != w[0].index + 1 {
					return Err(ErrorKind::InvariantViolation("entries are unsorted or non-contiguous".into()).into());
				}
			}
		}

		let first_index = self.log.first_index().unwrap_or(1);
		if req.prev_log_index < first_index.saturating_sub(1) {
			return Err(ErrorKind::InvariantViolation("prev_log_index is before the start of the log".into()).into());
		}

		match self.log.term(req.prev_log_index) {
			Some(term) => {
				if term != req.prev_log_term {
					// Ask the leader to back off to our last known commit
					// point rather than decrementing one index at a time.
					return Ok(response(false, Some(self.commit_index)).into());
				}
			}
			None => return Ok(response(false, Some(self.log.last_index().unwrap_or(0))).into()),
		}

		let mut first_new = 0;
		for e in req.entries.iter() {
			match self.log.term(e.index) {
				Some(t) if t == e.term => first_new += 1,
				Some(_) => {
					if self.commit_index >= e.index {
						return Err(ErrorKind::InvariantViolation("refusing to truncate already-committed entries".into()).into());
					}
					self.log.truncate_suffix(e.index)?;
					break;
				}
				None => break,
			}
		}

		let mut last_new = req.prev_log_index;
		let mut last_new_term = req.prev_log_term;

		if req.entries.len() > first_new {
			let new_entries = &req.entries[first_new..];
			last_new = new_entries.last().unwrap().index;
			last_new_term = new_entries.last().unwrap().term;

			for e in new_entries {
				tick.new_entries = true;
				self.log.append(e.clone())?;
			}
		}

		if req.leader_commit > self.commit_index {
			let next_commit_index = std::cmp::min(req.leader_commit, last_new);
			if next_commit_index > self.commit_index {
				self.update_committed(next_commit_index, tick);
			}
		}

		let pos = LogPosition { term: last_new_term, index: last_new };
		let last_log_index = self.log.last_index().unwrap_or(0);

		Ok(MatchConstraint::new(
			response(true, if last_log_index != last_new { Some(last_log_index) } else { None }),
			pos,
		))
	}

	pub fn install_snapshot(&mut self, req: InstallSnapshotChunk, tick: &mut Tick) -> Result<InstallSnapshotResponse> {
		self.observe_term(req.term, tick);

		if req.term < self.meta.current_term || req.last_included_term < self.meta.current_term {
			return Ok(InstallSnapshotResponse { term: self.meta.current_term, success: false });
		}

		self.log.create_snapshot(req.data.clone(), req.last_included_index, req.last_included_term)?;
		self.set_commit_index_floor(req.last_included_index);

		tick.snapshot_installed = Some((req.last_included_index, req.data));

		Ok(InstallSnapshotResponse {
			term: self.meta.current_term,
			success: true,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::log::FileLogStorage;

	fn module(id: ServerId, peers: &[ServerId]) -> (ConsensusModule, tempfile::TempDir) {
		let dir = tempfile::tempdir().unwrap();
		let log = Arc::new(FileLogStorage::open(dir.path()).unwrap());
		let cm = ConsensusModule::new(id, Metadata::default(), peers.iter().copied().collect(), log);
		(cm, dir)
	}

	#[test]
	fn single_node_cluster_elects_itself() {
		let (mut cm, _dir) = module(1, &[1]);
		let mut tick = Tick::empty();
		cm.cycle(&mut tick);
		assert_eq!(cm.role_name(), "leader");
	}

	#[test]
	fn follower_starts_election_after_timeout() {
		let (mut cm, _dir) = module(1, &[1, 2, 3]);
		let mut tick = Tick::empty();
		tick.time = Instant::now() + Duration::from_millis(301);
		cm.cycle(&mut tick);
		assert_eq!(cm.role_name(), "candidate");
		assert!(tick.meta);
		assert_eq!(cm.meta().current_term, 1);
	}

	#[test]
	fn candidate_becomes_leader_on_majority_votes() {
		let (mut cm, _dir) = module(1, &[1, 2, 3]);
		let mut tick = Tick::empty();
		tick.time = Instant::now() + Duration::from_millis(301);
		cm.cycle(&mut tick);
		assert_eq!(cm.role_name(), "candidate");

		let term = cm.meta().current_term;
		let mut tick2 = Tick::empty();
		cm.request_vote_callback(2, RequestVoteResponse { term, vote_granted: true }, &mut tick2);
		assert_eq!(cm.role_name(), "leader");
	}

	#[test]
	fn higher_term_demotes_leader() {
		let (mut cm, _dir) = module(1, &[1]);
		let mut tick = Tick::empty();
		cm.cycle(&mut tick);
		assert_eq!(cm.role_name(), "leader");

		let mut tick2 = Tick::empty();
		cm.append_entries_callback(
			2,
			0,
			AppendEntriesResponse { term: cm.meta().current_term + 5, success: false, last_log_index: None },
			&mut tick2,
		);
		assert_eq!(cm.role_name(), "follower");
	}

	#[test]
	fn reject_append_entries_with_stale_term() {
		let (mut cm, _dir) = module(1, &[1, 2]);
		let mut tick = Tick::empty();
		let resp = cm
			.append_entries(
				AppendEntriesRequest {
					term: 0,
					leader_id: 2,
					prev_log_index: 0,
					prev_log_term: 0,
					entries: vec![],
					leader_commit: 0,
				},
				&mut tick,
			)
			.unwrap()
			.release();
		assert!(!resp.success);
		assert_eq!(cm.last_index(), 0);
	}

	#[test]
	fn propose_command_fails_on_follower() {
		let (mut cm, _dir) = module(1, &[1, 2, 3]);
		let mut tick = Tick::empty();
		let result = cm.propose_command(b"k".to_vec(), b"v".to_vec(), &mut tick);
		assert!(matches!(result, Err(ProposeError::NotLeader { .. })));
	}
}
