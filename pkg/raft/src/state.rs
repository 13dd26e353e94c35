//! The volatile (non-persisted) half of `NodeState`: which role this server is
//! currently playing, and whatever bookkeeping that role needs.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use super::protos::{LogIndex, ServerId};

#[derive(Debug)]
pub struct ServerFollowerState {
	pub election_timeout: std::time::Duration,
	/// The leader this follower most recently accepted an AppendEntries from,
	/// used only to give clients a hint about who to retry against.
	pub last_leader_id: Option<ServerId>,
	pub last_heartbeat: Instant,
}

#[derive(Debug)]
pub struct ServerCandidateState {
	pub election_start: Instant,
	pub election_timeout: std::time::Duration,
	pub votes_received: HashSet<ServerId>,
	/// Set once any peer has rejected our vote request in this term, which
	/// forces a fresh `currentTerm` increment on the next election attempt
	/// rather than re-running the same term.
	pub some_rejected: bool,
}

/// Per-follower replication bookkeeping, live only while this server is the
/// leader of the term in which it was created.
#[derive(Debug, Clone)]
pub struct ServerProgress {
	pub next_index: LogIndex,
	pub match_index: LogIndex,
	/// True while an AppendEntries/InstallSnapshot to this peer is in flight;
	/// enforces the one-request-per-peer-at-a-time contract.
	pub request_pending: bool,
	pub last_sent: Option<Instant>,
}

impl ServerProgress {
	pub fn new(last_log_index: LogIndex) -> Self {
		ServerProgress {
			next_index: last_log_index + 1,
			match_index: 0,
			request_pending: false,
			last_sent: None,
		}
	}
}

#[derive(Debug)]
pub struct ServerLeaderState {
	pub servers: HashMap<ServerId, ServerProgress>,
}

#[derive(Debug)]
pub enum ServerState {
	Follower(ServerFollowerState),
	Candidate(ServerCandidateState),
	Leader(ServerLeaderState),
}

impl ServerState {
	pub fn role_name(&self) -> &'static str {
		match self {
			ServerState::Follower(_) => "follower",
			ServerState::Candidate(_) => "candidate",
			ServerState::Leader(_) => "leader",
		}
	}
}
