//! The durable, index-addressable operation log (C1).
//!
//! On-disk layout is two files in the node's data directory:
//!
//! - `log.bin`: an append-only stream of `[len: u32 LE][crc32c: u32 LE][rmp-serde LogEntry]`
//!   records. A record is only considered present if the full length-prefixed
//!   span exists and its checksum matches; anything shorter or corrupt at the
//!   tail is silently dropped on replay (it means the write never completed).
//! - `snapshot.bin`: the single most recent snapshot, written via
//!   write-temp-then-rename so a reader never observes a half-written file.
//!
//! An in-memory mirror (`Vec<LogEntry>` plus a parallel `Vec<u64>` of each
//! entry's end offset in `log.bin`) makes every read in this module O(1) or
//! O(log n), and lets `truncate_suffix`/`create_snapshot` reduce to a single
//! `set_len` on the segment file once the matching offset is known.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crc32fast::Hasher as Crc32;

use super::errors::*;
use super::protos::{LogEntry, LogIndex, Term};

/// The log's snapshot header: a serialised state-machine image plus the
/// `(lastIncludedIndex, lastIncludedTerm)` that produced it.
#[derive(Debug, Clone)]
pub struct SnapshotHeader {
	pub last_included_index: LogIndex,
	pub last_included_term: Term,
	pub data: Vec<u8>,
}

/// Durable ordered log plus a single most-recent snapshot header.
///
/// Implementations must guarantee: after any crash, `replay` returns exactly
/// the entries whose `append` completed before the crash, filtered by
/// whatever `create_snapshot` truncation completed before the crash.
pub trait LogStorage: Send + Sync {
	/// `snapshotLastIndex + 1`: the virtual first index, which holds even
	/// when every physical entry has been compacted away. `None` only when
	/// there is no snapshot and no entry has ever been appended.
	fn first_index(&self) -> Option<LogIndex>;

	/// The highest index covered by this log, physical or virtual: equal to
	/// `snapshotLastIndex` when the in-memory mirror is empty but a snapshot
	/// exists. `None` only when there is no snapshot and no entry has ever
	/// been appended.
	fn last_index(&self) -> Option<LogIndex>;

	/// The term of the entry at `index`, or of `snapshotLastIndex` if `index`
	/// equals it. `None` if `index` is outside `[snapshotLastIndex, lastIndex]`.
	fn term(&self, index: LogIndex) -> Option<Term>;

	/// A clone of the entry at `index`, if physically present.
	fn entry(&self, index: LogIndex) -> Option<LogEntry>;

	/// Appends `entry`, which must have `index == last_index() + 1` (or `1` if
	/// the log is empty). Durable (fsync'd) before returning.
	fn append(&self, entry: LogEntry) -> Result<()>;

	/// Discards every entry with `idx >= index`. No-op if none exist.
	fn truncate_suffix(&self, index: LogIndex) -> Result<()>;

	/// Atomically installs `data` as the new snapshot covering up to and
	/// including `last_included_index`/`last_included_term`, and removes every
	/// log entry with `index <= last_included_index`.
	fn create_snapshot(&self, data: Vec<u8>, last_included_index: LogIndex, last_included_term: Term) -> Result<()>;

	/// The current snapshot header, if one has been installed.
	fn load_snapshot(&self) -> Option<SnapshotHeader>;
}

struct Inner {
	file: File,
	/// `first_index - 1`, i.e. `snapshotLastIndex` (0 if no snapshot yet).
	base_index: LogIndex,
	base_term: Term,
	entries: Vec<LogEntry>,
	/// `offsets[i]` is the byte offset in `file` immediately after the record
	/// for `entries[i]`, so `truncate_suffix`/compaction need no file scan.
	offsets: Vec<u64>,
	snapshot: Option<SnapshotHeader>,
}

impl Inner {
	/// Vector position of `index`, if physically present.
	fn slot(&self, index: LogIndex) -> Option<usize> {
		if index <= self.base_index {
			return None;
		}
		let slot = (index - self.base_index - 1) as usize;
		if slot < self.entries.len() {
			Some(slot)
		} else {
			None
		}
	}
}

/// A `LogStorage` backed by two files in a directory on local disk.
pub struct FileLogStorage {
	dir: PathBuf,
	inner: Mutex<Inner>,
}

fn encode_record(entry: &LogEntry) -> Result<Vec<u8>> {
	let payload = rmp_serde::to_vec(entry)?;
	let mut crc = Crc32::new();
	crc.update(&payload);
	let checksum = crc.finalize();

	let mut record = Vec::with_capacity(8 + payload.len());
	record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
	record.extend_from_slice(&checksum.to_le_bytes());
	record.extend_from_slice(&payload);
	Ok(record)
}

/// Reads every intact record from `file` (from its current position to EOF),
/// dropping a trailing short/corrupt record rather than erroring.
fn replay_records(file: &mut File) -> Result<Vec<(LogEntry, u64)>> {
	let mut buf = Vec::new();
	file.read_to_end(&mut buf)?;

	let mut out = Vec::new();
	let mut pos = 0usize;

	loop {
		if pos + 8 > buf.len() {
			break;
		}
		let len = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
		let checksum = u32::from_le_bytes(buf[pos + 4..pos + 8].try_into().unwrap());

		let payload_start = pos + 8;
		let payload_end = payload_start + len;
		if payload_end > buf.len() {
			// Trailing partial record: the write never completed.
			break;
		}

		let payload = &buf[payload_start..payload_end];
		let mut crc = Crc32::new();
		crc.update(payload);
		if crc.finalize() != checksum {
			// Trailing corrupt record: same treatment as a partial write.
			break;
		}

		let entry: LogEntry = rmp_serde::from_slice(payload)?;
		out.push((entry, payload_end as u64));
		pos = payload_end;
	}

	Ok(out)
}

impl FileLogStorage {
	pub fn log_path(dir: &Path) -> PathBuf {
		dir.join("log.bin")
	}

	pub fn snapshot_path(dir: &Path) -> PathBuf {
		dir.join("snapshot.bin")
	}

	/// Opens (creating if absent) the log and snapshot files in `dir`, and
	/// replays whatever is durable into the in-memory mirror.
	pub fn open(dir: &Path) -> Result<Self> {
		fs::create_dir_all(dir)?;

		let snapshot = Self::read_snapshot(&Self::snapshot_path(dir))?;
		let (base_index, base_term) = match &snapshot {
			Some(s) => (s.last_included_index, s.last_included_term),
			None => (0, 0),
		};

		let mut file = OpenOptions::new()
			.read(true)
			.write(true)
			.create(true)
			.open(Self::log_path(dir))?;

		let records = replay_records(&mut file)?;

		let mut entries = Vec::with_capacity(records.len());
		let mut offsets = Vec::with_capacity(records.len());
		for (entry, end_offset) in records {
			if entry.index <= base_index {
				// Covered by the snapshot; a crash between writing the snapshot
				// and rolling the log segment can leave these physically present.
				continue;
			}
			entries.push(entry);
			offsets.push(end_offset);
		}

		file.seek(SeekFrom::End(0))?;

		Ok(FileLogStorage {
			dir: dir.to_owned(),
			inner: Mutex::new(Inner {
				file,
				base_index,
				base_term,
				entries,
				offsets,
				snapshot,
			}),
		})
	}

	fn read_snapshot(path: &Path) -> Result<Option<SnapshotHeader>> {
		if !path.exists() {
			return Ok(None);
		}

		#[derive(serde::Serialize, serde::Deserialize)]
		struct OnDisk {
			last_included_index: LogIndex,
			last_included_term: Term,
			data: Vec<u8>,
		}

		let bytes = fs::read(path)?;
		let decoded: OnDisk = rmp_serde::from_slice(&bytes)?;
		Ok(Some(SnapshotHeader {
			last_included_index: decoded.last_included_index,
			last_included_term: decoded.last_included_term,
			data: decoded.data,
		}))
	}
}

impl LogStorage for FileLogStorage {
	fn first_index(&self) -> Option<LogIndex> {
		let inner = self.inner.lock().unwrap();
		// A fully-compacted log (entries empty but base_index > 0, i.e. a
		// snapshot exists) still has a virtual first index of base_index+1;
		// only a log with no snapshot and no entries is truly empty.
		if inner.entries.is_empty() && inner.base_index == 0 {
			None
		} else {
			Some(inner.base_index + 1)
		}
	}

	fn last_index(&self) -> Option<LogIndex> {
		let inner = self.inner.lock().unwrap();
		if inner.entries.is_empty() && inner.base_index == 0 {
			None
		} else {
			Some(inner.base_index + inner.entries.len() as LogIndex)
		}
	}

	fn term(&self, index: LogIndex) -> Option<Term> {
		let inner = self.inner.lock().unwrap();
		if index == inner.base_index {
			return Some(inner.base_term);
		}
		inner.slot(index).map(|slot| inner.entries[slot].term)
	}

	fn entry(&self, index: LogIndex) -> Option<LogEntry> {
		let inner = self.inner.lock().unwrap();
		inner.slot(index).map(|slot| inner.entries[slot].clone())
	}

	fn append(&self, entry: LogEntry) -> Result<()> {
		let mut inner = self.inner.lock().unwrap();

		let expected = inner.base_index + inner.entries.len() as LogIndex + 1;
		if entry.index != expected {
			return Err(ErrorKind::InvariantViolation(format!(
				"append index {} does not follow last index {}",
				entry.index,
				expected - 1
			))
			.into());
		}

		let record = encode_record(&entry)?;
		inner.file.write_all(&record)?;
		inner.file.sync_data()?;

		let offset = inner.file.stream_position()?;
		inner.entries.push(entry);
		inner.offsets.push(offset);
		Ok(())
	}

	fn truncate_suffix(&self, index: LogIndex) -> Result<()> {
		let mut inner = self.inner.lock().unwrap();

		let Some(slot) = inner.slot(index) else {
			// Either already shorter than `index`, or `index <= base_index`
			// (which would mean truncating committed/snapshotted history — a
			// caller bug, not a disk condition this layer should paper over).
			return Ok(());
		};

		let new_len = if slot == 0 { 0 } else { inner.offsets[slot - 1] };
		inner.file.set_len(new_len)?;
		inner.file.seek(SeekFrom::Start(new_len))?;

		inner.entries.truncate(slot);
		inner.offsets.truncate(slot);
		Ok(())
	}

	fn create_snapshot(&self, data: Vec<u8>, last_included_index: LogIndex, last_included_term: Term) -> Result<()> {
		let mut inner = self.inner.lock().unwrap();

		#[derive(serde::Serialize)]
		struct OnDisk<'a> {
			last_included_index: LogIndex,
			last_included_term: Term,
			data: &'a [u8],
		}

		let encoded = rmp_serde::to_vec(&OnDisk {
			last_included_index,
			last_included_term,
			data: &data,
		})?;

		let tmp_path = self.dir.join("snapshot.bin.tmp");
		{
			let mut tmp = File::create(&tmp_path)?;
			tmp.write_all(&encoded)?;
			tmp.sync_all()?;
		}
		fs::rename(&tmp_path, Self::snapshot_path(&self.dir))?;

		// Roll the log segment so only entries past the new base remain.
		let keep_from = match inner.slot(last_included_index) {
			Some(slot) => slot + 1,
			None => {
				if last_included_index < inner.base_index {
					0
				} else {
					inner.entries.len()
				}
			}
		};

		let remaining: Vec<LogEntry> = inner.entries.split_off(keep_from);

		let tmp_log_path = self.dir.join("log.bin.tmp");
		{
			let mut tmp_log = File::create(&tmp_log_path)?;
			let mut offsets = Vec::with_capacity(remaining.len());
			let mut pos = 0u64;
			for entry in &remaining {
				let record = encode_record(entry)?;
				tmp_log.write_all(&record)?;
				pos += record.len() as u64;
				offsets.push(pos);
			}
			tmp_log.sync_all()?;
			inner.offsets = offsets;
		}
		fs::rename(&tmp_log_path, Self::log_path(&self.dir))?;

		inner.file = OpenOptions::new()
			.read(true)
			.write(true)
			.open(Self::log_path(&self.dir))?;
		inner.file.seek(SeekFrom::End(0))?;

		inner.entries = remaining;
		inner.base_index = last_included_index;
		inner.base_term = last_included_term;
		inner.snapshot = Some(SnapshotHeader {
			last_included_index,
			last_included_term,
			data,
		});

		Ok(())
	}

	fn load_snapshot(&self) -> Option<SnapshotHeader> {
		self.inner.lock().unwrap().snapshot.clone()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::protos::LogEntryData;

	fn entry(index: LogIndex, term: Term) -> LogEntry {
		LogEntry {
			index,
			term,
			data: LogEntryData::Command {
				key: format!("k{}", index).into_bytes(),
				value: format!("v{}", index).into_bytes(),
			},
		}
	}

	#[test]
	fn append_and_read_back() {
		let dir = tempfile::tempdir().unwrap();
		let log = FileLogStorage::open(dir.path()).unwrap();

		assert_eq!(log.last_index(), None);
		log.append(entry(1, 1)).unwrap();
		log.append(entry(2, 1)).unwrap();
		log.append(entry(3, 2)).unwrap();

		assert_eq!(log.last_index(), Some(3));
		assert_eq!(log.term(3), Some(2));
		assert_eq!(log.term(1), Some(1));
		assert!(log.entry(2).is_some());
		assert!(log.entry(4).is_none());
	}

	#[test]
	fn rejects_out_of_order_append() {
		let dir = tempfile::tempdir().unwrap();
		let log = FileLogStorage::open(dir.path()).unwrap();
		log.append(entry(1, 1)).unwrap();
		assert!(log.append(entry(3, 1)).is_err());
	}

	#[test]
	fn truncate_suffix_drops_tail_and_shrinks_file() {
		let dir = tempfile::tempdir().unwrap();
		let log = FileLogStorage::open(dir.path()).unwrap();
		for i in 1..=5 {
			log.append(entry(i, 1)).unwrap();
		}

		log.truncate_suffix(3).unwrap();
		assert_eq!(log.last_index(), Some(2));
		assert!(log.entry(3).is_none());

		// Surviving entries, and only they, replay back after reopening.
		drop(log);
		let log = FileLogStorage::open(dir.path()).unwrap();
		assert_eq!(log.last_index(), Some(2));
	}

	#[test]
	fn replays_across_reopen() {
		let dir = tempfile::tempdir().unwrap();
		{
			let log = FileLogStorage::open(dir.path()).unwrap();
			for i in 1..=4 {
				log.append(entry(i, 1)).unwrap();
			}
		}

		let log = FileLogStorage::open(dir.path()).unwrap();
		assert_eq!(log.last_index(), Some(4));
		assert_eq!(log.first_index(), Some(1));
	}

	#[test]
	fn replay_drops_trailing_partial_record() {
		let dir = tempfile::tempdir().unwrap();
		{
			let log = FileLogStorage::open(dir.path()).unwrap();
			log.append(entry(1, 1)).unwrap();
		}

		// Simulate a crash mid-write: append a few garbage bytes that look like
		// the start of a length-prefixed record but never finish.
		{
			let mut f = OpenOptions::new()
				.append(true)
				.open(FileLogStorage::log_path(dir.path()))
				.unwrap();
			f.write_all(&[9, 0, 0, 0, 1, 2, 3, 4, 0xaa, 0xbb]).unwrap();
		}

		let log = FileLogStorage::open(dir.path()).unwrap();
		assert_eq!(log.last_index(), Some(1));

		// The log remains writable after the garbage tail was dropped.
		log.append(entry(2, 1)).unwrap();
		assert_eq!(log.last_index(), Some(2));
	}

	#[test]
	fn create_snapshot_truncates_covered_prefix() {
		let dir = tempfile::tempdir().unwrap();
		let log = FileLogStorage::open(dir.path()).unwrap();
		for i in 1..=5 {
			log.append(entry(i, 1)).unwrap();
		}

		log.create_snapshot(b"state".to_vec(), 3, 1).unwrap();

		assert_eq!(log.first_index(), Some(4));
		assert_eq!(log.last_index(), Some(5));
		assert!(log.entry(3).is_none());
		assert!(log.entry(4).is_some());
		assert_eq!(log.term(3), Some(1)); // snapshotLastIndex still answers termAt

		let snap = log.load_snapshot().unwrap();
		assert_eq!(snap.last_included_index, 3);
		assert_eq!(snap.data, b"state");

		drop(log);
		let log = FileLogStorage::open(dir.path()).unwrap();
		assert_eq!(log.first_index(), Some(4));
		assert_eq!(log.last_index(), Some(5));
	}

	#[test]
	fn fully_compacted_log_reports_virtual_indices() {
		let dir = tempfile::tempdir().unwrap();
		let log = FileLogStorage::open(dir.path()).unwrap();
		for i in 1..=3 {
			log.append(entry(i, 1)).unwrap();
		}

		// Snapshot covers every entry currently in the log: the in-memory
		// mirror goes empty, but first/last index must still reflect the
		// snapshot boundary rather than collapsing to "log is empty".
		log.create_snapshot(b"state".to_vec(), 3, 1).unwrap();

		assert_eq!(log.first_index(), Some(4));
		assert_eq!(log.last_index(), Some(3));
		assert!(log.entry(3).is_none());
		assert_eq!(log.term(3), Some(1));

		log.append(entry(4, 1)).unwrap();
		assert_eq!(log.last_index(), Some(4));
	}
}
