//! The opaque, deterministic state machine applied entries are played into
//! (C2). Every node's copy must reach byte-identical snapshots given the same
//! sequence of applied commands, so `serialize` must not depend on hashmap
//! iteration order — we use `BTreeMap` for exactly that reason.

use std::collections::BTreeMap;
use std::sync::Mutex;

use super::errors::*;

/// A deterministic key-value store driven purely by committed log entries.
pub trait KeyValueStateMachine: Send + Sync {
	fn put(&self, key: Vec<u8>, value: Vec<u8>);
	fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

	/// A byte-identical snapshot of the current contents across any two nodes
	/// that applied the same commands, regardless of insertion order.
	fn serialize(&self) -> Vec<u8>;

	/// Replaces the machine's entire contents with a previously-`serialize`d
	/// image (used when installing a snapshot, whether locally created or
	/// received from a leader).
	fn restore(&self, data: &[u8]) -> Result<()>;
}

/// A `BTreeMap`-backed `KeyValueStateMachine`.
pub struct MemoryKVStateMachine {
	data: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryKVStateMachine {
	pub fn new() -> Self {
		MemoryKVStateMachine {
			data: Mutex::new(BTreeMap::new()),
		}
	}
}

impl Default for MemoryKVStateMachine {
	fn default() -> Self {
		Self::new()
	}
}

impl KeyValueStateMachine for MemoryKVStateMachine {
	fn put(&self, key: Vec<u8>, value: Vec<u8>) {
		self.data.lock().unwrap().insert(key, value);
	}

	fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
		self.data.lock().unwrap().get(key).cloned()
	}

	fn serialize(&self) -> Vec<u8> {
		let data = self.data.lock().unwrap();
		// BTreeMap's Serialize impl walks keys in sorted order, which is the
		// whole reason this isn't a HashMap: two nodes that applied the same
		// puts in different arrival orders must still produce the same bytes.
		rmp_serde::to_vec(&*data).expect("in-memory map always encodes")
	}

	fn restore(&self, bytes: &[u8]) -> Result<()> {
		let decoded: BTreeMap<Vec<u8>, Vec<u8>> = rmp_serde::from_slice(bytes)?;
		*self.data.lock().unwrap() = decoded;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn put_then_get() {
		let sm = MemoryKVStateMachine::new();
		sm.put(b"a".to_vec(), b"1".to_vec());
		sm.put(b"b".to_vec(), b"2".to_vec());
		assert_eq!(sm.get(b"a"), Some(b"1".to_vec()));
		assert_eq!(sm.get(b"z"), None);
	}

	#[test]
	fn serialize_is_order_independent() {
		let a = MemoryKVStateMachine::new();
		a.put(b"x".to_vec(), b"1".to_vec());
		a.put(b"y".to_vec(), b"2".to_vec());

		let b = MemoryKVStateMachine::new();
		b.put(b"y".to_vec(), b"2".to_vec());
		b.put(b"x".to_vec(), b"1".to_vec());

		assert_eq!(a.serialize(), b.serialize());
	}

	#[test]
	fn restore_round_trips() {
		let a = MemoryKVStateMachine::new();
		a.put(b"k".to_vec(), b"v".to_vec());
		let bytes = a.serialize();

		let b = MemoryKVStateMachine::new();
		b.restore(&bytes).unwrap();
		assert_eq!(b.get(b"k"), Some(b"v".to_vec()));
	}
}
