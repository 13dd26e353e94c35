//! Wire and persistence types shared by every other module in this crate.
//!
//! Field names are semantic; encoding (for both the wire and the on-disk log)
//! is `rmp-serde` (MessagePack) everywhere these derive `Serialize`/`Deserialize`.

use serde::{Deserialize, Serialize};

/// Uniquely identifies a server. Assigned out of band (CLI configuration), never
/// derived from log contents. Id `0` is not reserved; a node always votes for
/// itself using its real id, never a sentinel.
pub type ServerId = u64;

pub type Term = u64;

pub type LogIndex = u64;

/// Identifies a single log entry by its `(term, index)` pair. Two entries in any
/// two logs that share a `LogPosition` are, by the log-matching property,
/// required to be identical, as are their entire prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LogPosition {
	pub term: Term,
	pub index: LogIndex,
}

/// Persistent information describing the state of the current server. Written
/// to disk every time either field changes; everything else in `NodeState` is
/// either re-derived from the log/snapshot at startup or does not need to
/// survive a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
	/// Latest term seen by this server (starts at 0).
	pub current_term: Term,

	/// The id of the server we have voted for in `current_term`, if any.
	pub voted_for: Option<ServerId>,
}

impl Default for Metadata {
	fn default() -> Self {
		Metadata {
			current_term: 0,
			voted_for: None,
		}
	}
}

/// The data carried by a single log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogEntryData {
	/// Occupies a log index without touching the state machine. Used by a newly
	/// elected leader to get an entry in its own term committed, which is what
	/// lets it (and only it, per the from-current-term commit rule) safely
	/// advance `commitIndex` across entries inherited from earlier terms.
	Noop,

	/// A `put(key, value)` to apply to the key-value state machine once committed.
	Command { key: Vec<u8>, value: Vec<u8> },
}

/// The format of a single entry in every server's durable log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
	pub index: LogIndex,
	pub term: Term,
	pub data: LogEntryData,
}

impl LogEntry {
	pub fn position(&self) -> LogPosition {
		LogPosition {
			term: self.term,
			index: self.index,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
	pub term: Term,
	pub leader_id: ServerId,
	pub prev_log_index: LogIndex,
	pub prev_log_term: Term,
	/// Assumed to carry sequential indices starting at `prev_log_index + 1`.
	pub entries: Vec<LogEntry>,
	pub leader_commit: LogIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
	pub term: Term,
	pub success: bool,

	/// On success: the last index in our log after applying the request, if it
	/// differs from the request's tail (tells the leader we had a longer log,
	/// likely as a stale former leader, so it should consider a no-op).
	/// On failure: the index the leader should retry from instead of
	/// decrementing one at a time (the "conflict index" optimisation).
	pub last_log_index: Option<LogIndex>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
	pub term: Term,
	pub candidate_id: ServerId,
	pub last_log_index: LogIndex,
	pub last_log_term: Term,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
	pub term: Term,
	pub vote_granted: bool,
}

/// One chunk of a streamed snapshot install. `done` marks the final chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotChunk {
	pub term: Term,
	pub leader_id: ServerId,
	pub last_included_index: LogIndex,
	pub last_included_term: Term,
	pub data: Vec<u8>,
	pub done: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
	pub term: Term,
	pub success: bool,
}

/// Returned by a node that cannot service a client write itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotLeader {
	pub leader_hint: Option<ServerId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutRequest {
	pub key: Vec<u8>,
	pub value: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutResponse {
	pub success: bool,
	pub leader_hint: Option<ServerId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRequest {
	pub key: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetResponse {
	pub found: bool,
	pub value: Option<Vec<u8>>,
}

/// An outbound message the consensus core asked the node shell to deliver, as
/// recorded on a `Tick`. Kept distinct from the request type itself so a single
/// `Tick` can address many peers with the same `AppendEntriesRequest` without
/// cloning it once per peer.
#[derive(Debug, Clone)]
pub enum MessageBody {
	RequestVote(RequestVoteRequest),
	/// The `LogIndex` is the last index in the request, so the callback can be
	/// matched back up without retaining the original request.
	AppendEntries(AppendEntriesRequest, LogIndex),
	/// Sent to a follower whose `nextIndex` has fallen behind the leader's
	/// snapshot. Carries the whole snapshot already assembled: splitting it
	/// into ~64KiB wire segments is the transport's job, not the consensus
	/// core's, so by the time this reaches either side of the core `data` is
	/// always complete and `done` is always `true`.
	InstallSnapshot(InstallSnapshotChunk),
}

#[derive(Debug, Clone)]
pub struct Message {
	pub to: Vec<ServerId>,
	pub body: MessageBody,
}
