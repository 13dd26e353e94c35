//! Property tests for the universal invariants (§8): election safety, log
//! matching, and monotonic `currentTerm`/`commitIndex`. Driven entirely
//! synchronously against bare `ConsensusModule`s — no tokio runtime, per the
//! design's separation of the consensus core from anything that awaits.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use proptest::prelude::*;
use raftkv::consensus::{ConsensusModule, Tick};
use raftkv::log::{FileLogStorage, LogStorage};
use raftkv::protos::*;

#[derive(Debug, Clone, Copy)]
enum Event {
	/// Advance node `target`'s clock and let it cycle.
	Tick { target: usize, millis: u64 },
	/// A would-be RequestVote/AppendEntries delivery between two nodes,
	/// represented abstractly: `source` proposes (if leader) and replicates
	/// to everyone via repeated cycling/draining.
	Replicate { source: usize },
}

fn arb_event(n: usize) -> impl Strategy<Value = Event> {
	prop_oneof![
		(0..n, 1u64..400).prop_map(|(target, millis)| Event::Tick { target, millis }),
		(0..n).prop_map(|source| Event::Replicate { source }),
	]
}

struct Cluster {
	modules: Vec<ConsensusModule>,
	logs: Vec<Arc<FileLogStorage>>,
	now: Instant,
	_dirs: Vec<tempfile::TempDir>,
}

impl Cluster {
	fn new(n: usize) -> Cluster {
		let ids: Vec<ServerId> = (1..=n as u64).collect();
		let peers: HashSet<ServerId> = ids.iter().copied().collect();
		let mut modules = vec![];
		let mut logs = vec![];
		let mut dirs = vec![];

		for &id in &ids {
			let dir = tempfile::tempdir().unwrap();
			let log = Arc::new(FileLogStorage::open(dir.path()).unwrap());
			modules.push(ConsensusModule::new(id, Metadata::default(), peers.clone(), log.clone()));
			logs.push(log);
			dirs.push(dir);
		}

		Cluster { modules, logs, now: Instant::now(), _dirs: dirs }
	}

	fn id_of(&self, idx: usize) -> ServerId {
		(idx as u64) + 1
	}

	fn index_of(&self, id: ServerId) -> usize {
		(id - 1) as usize
	}

	fn apply(&mut self, event: Event) {
		match event {
			Event::Tick { target, millis } => {
				self.now += Duration::from_millis(millis);
				let mut tick = Tick::empty();
				tick.time = self.now;
				self.modules[target].cycle(&mut tick);
				self.drain(tick.messages);
			}
			Event::Replicate { source } => {
				let mut tick = Tick::empty();
				tick.time = self.now;
				let _ = self.modules[source].propose_command(b"k".to_vec(), b"v".to_vec(), &mut tick);
				self.drain(tick.messages);
			}
		}
	}

	fn drain(&mut self, mut pending: Vec<Message>) {
		let mut rounds = 0;
		while !pending.is_empty() {
			rounds += 1;
			if rounds > 200 {
				// Bounded: a property test must terminate even if some
				// randomly generated sequence produces a long retry chain.
				return;
			}
			let mut next = vec![];
			for msg in pending {
				for to in msg.to.clone() {
					next.extend(self.deliver(to, msg.body.clone()));
				}
			}
			pending = next;
		}
	}

	fn deliver(&mut self, to: ServerId, body: MessageBody) -> Vec<Message> {
		let to_idx = self.index_of(to);

		match body {
			MessageBody::RequestVote(req) => {
				let candidate_idx = self.index_of(req.candidate_id);
				let mut tick = Tick::empty();
				tick.time = self.now;
				let resp = self.modules[to_idx].request_vote(req, &mut tick).persisted();
				let mut out = tick.messages;

				let mut tick2 = Tick::empty();
				tick2.time = self.now;
				self.modules[candidate_idx].request_vote_callback(to, resp, &mut tick2);
				out.extend(tick2.messages);
				out
			}
			MessageBody::AppendEntries(req, last_index) => {
				let leader_idx = self.index_of(req.leader_id);
				let mut tick = Tick::empty();
				tick.time = self.now;
				let result = self.modules[to_idx].append_entries(req, &mut tick);
				let mut out = tick.messages;

				let mut tick2 = Tick::empty();
				tick2.time = self.now;
				match result {
					Ok(constraint) => self.modules[leader_idx].append_entries_callback(to, last_index, constraint.release(), &mut tick2),
					Err(_) => self.modules[leader_idx].append_entries_noresponse(to, &mut tick2),
				}
				out.extend(tick2.messages);
				out
			}
			MessageBody::InstallSnapshot(req) => {
				let leader_idx = self.index_of(req.leader_id);
				let last_included_index = req.last_included_index;
				let mut tick = Tick::empty();
				tick.time = self.now;
				let result = self.modules[to_idx].install_snapshot(req, &mut tick);
				let mut out = tick.messages;

				let mut tick2 = Tick::empty();
				tick2.time = self.now;
				match result {
					Ok(resp) => self.modules[leader_idx].install_snapshot_callback(to, last_included_index, resp, &mut tick2),
					Err(_) => self.modules[leader_idx].append_entries_noresponse(to, &mut tick2),
				}
				out.extend(tick2.messages);
				out
			}
		}
	}

	/// Election safety: at most one leader per observed term.
	fn assert_election_safety(&self) {
		let mut leader_by_term: HashMap<Term, ServerId> = HashMap::new();
		for (idx, m) in self.modules.iter().enumerate() {
			if m.role_name() == "leader" {
				let term = m.meta().current_term;
				let id = self.id_of(idx);
				if let Some(existing) = leader_by_term.insert(term, id) {
					panic!("two leaders in term {}: {} and {}", term, existing, id);
				}
			}
		}
	}

	/// Log matching: any two logs that agree on the term at some index must
	/// agree on every earlier entry too.
	fn assert_log_matching(&self) {
		for a in 0..self.logs.len() {
			for b in (a + 1)..self.logs.len() {
				let last = self.logs[a].last_index().unwrap_or(0).min(self.logs[b].last_index().unwrap_or(0));
				let mut diverged_at = None;

				for i in 1..=last {
					let ta = self.logs[a].term(i);
					let tb = self.logs[b].term(i);

					if let Some(at) = diverged_at {
						// Once logs have diverged, re-converging on a later
						// index without a truncation in between would be a
						// log-matching violation.
						if ta == tb {
							panic!("logs {} and {} re-converged at index {} after diverging at {}", a, b, i, at);
						}
						continue;
					}

					if ta != tb {
						diverged_at = Some(i);
					}
				}
			}
		}
	}
}

proptest! {
	#![proptest_config(ProptestConfig::with_cases(64))]

	#[test]
	fn election_safety_and_monotonic_terms(events in proptest::collection::vec(arb_event(3), 1..40)) {
		let mut cluster = Cluster::new(3);
		let mut last_terms = vec![0u64; 3];
		let mut last_commits = vec![0u64; 3];

		for event in events {
			cluster.apply(event);
			cluster.assert_election_safety();
			cluster.assert_log_matching();

			for (idx, m) in cluster.modules.iter().enumerate() {
				let term = m.meta().current_term;
				let commit = m.commit_index();
				prop_assert!(term >= last_terms[idx], "currentTerm decreased on node {}", idx);
				prop_assert!(commit >= last_commits[idx], "commitIndex decreased on node {}", idx);
				last_terms[idx] = term;
				last_commits[idx] = commit;
			}
		}
	}
}

proptest! {
	#![proptest_config(ProptestConfig::with_cases(32))]

	#[test]
	fn election_timeout_is_within_bounds(seed in 0u64..10_000) {
		let _ = seed;
		let dir = tempfile::tempdir().unwrap();
		let log = Arc::new(FileLogStorage::open(dir.path()).unwrap());
		let peers: HashSet<ServerId> = [1, 2, 3].into_iter().collect();
		let mut cm = ConsensusModule::new(1, Metadata::default(), peers, log);

		let mut tick = Tick::empty();
		tick.time = Instant::now() + Duration::from_millis(149);
		cm.cycle(&mut tick);
		prop_assert_eq!(cm.role_name(), "follower", "must not start an election before 150ms");
	}
}
