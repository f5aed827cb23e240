use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::{LogPos, LogStoreError, Record, Result, HEADER_LEN};

/// Bytes needed to pad `end_offset` up to the next multiple of `block_size`.
///
/// Adapted from the block-alignment arithmetic the original workspace's
/// `core` crate used for its own record framing (`block_size_remainder`).
fn block_padding(block_size: u64, end_offset: u64) -> u64 {
	let rem = end_offset % block_size;
	if rem == 0 {
		return 0;
	}
	block_size - rem
}

/// Walks `file` forward from offset 0, establishing every valid record start
/// boundary up to `limit` (an exclusive upper bound — the file's length when
/// called from `recover`, or a store's already-established `tail` when
/// re-validating boundaries for `seek`/`truncate_at`).
///
/// A gap shorter than a full header can only ever be padding: the smallest
/// real record is `HEADER_LEN + 1` bytes, so `append` always pads such a gap
/// away rather than start a record inside it. Reading a length field out of
/// a gap like that would read across the padding into the next record's own
/// bytes and misread a bogus, nonzero length — so any offset with less than
/// `HEADER_LEN` bytes before the next block boundary is skipped straight to
/// that boundary without attempting a header read. A `length == 0` read at a
/// boundary where a full header's worth of room remains is genuine zero
/// padding (or the un-written end of the file) and is skipped the same way.
/// A torn length/payload or a checksum mismatch both terminate the scan at
/// that offset.
fn scan_boundaries(file: &mut File, block_size: u64, limit: u64) -> Result<(Vec<u64>, u64)> {
	let mut starts = Vec::new();
	let mut offset = 0u64;

	loop {
		let remaining_in_block = block_size - offset % block_size;
		if remaining_in_block < HEADER_LEN {
			let next_boundary = offset + remaining_in_block;
			if next_boundary > limit {
				break;
			}
			offset = next_boundary;
			continue;
		}

		if offset + HEADER_LEN > limit {
			break;
		}
		file.seek(SeekFrom::Start(offset))?;
		let length = file.read_u32::<LittleEndian>()?;
		let checksum = file.read_u32::<LittleEndian>()?;

		if length == 0 {
			// Either block padding inserted by a previous append (more
			// bytes follow) or the genuine, never-written end of the file.
			// Disambiguate using `limit`.
			let next_boundary = (offset / block_size + 1) * block_size;
			if next_boundary > offset && next_boundary <= limit {
				offset = next_boundary;
				continue;
			}
			break;
		}

		let length = length as u64;
		if offset + HEADER_LEN + length > limit {
			tracing::warn!(offset, length, "torn tail record, truncating recovery here");
			break;
		}

		let mut payload = vec![0u8; length as usize];
		file.read_exact(&mut payload)?;
		let computed = crc32c::crc32c(&payload);
		if computed != checksum {
			tracing::warn!(offset, "checksum mismatch, truncating recovery here");
			break;
		}

		starts.push(offset);
		offset += HEADER_LEN + length;
	}

	Ok((starts, offset))
}

/// A durable, append-only, crash-recoverable record log.
///
/// One `LogStore` owns exactly one file on disk. All writes happen through
/// `append`/`truncate_at`; every write is followed by an `fsync` before the
/// call returns, per the durability contract in the Log Store's component
/// design ("block until durable").
pub struct LogStore {
	path: PathBuf,
	file: File,
	block_size: u64,
	tail: u64,
}

impl LogStore {
	/// Opens (creating if necessary) the log file `<dir>/<name>.log`, scans
	/// it forward from the start, and positions the store at the last
	/// known-good record boundary. Any bytes after that boundary (a torn
	/// tail from a crash mid-write) are invisible to readers and will be
	/// overwritten by the next `append`.
	pub fn open<P: AsRef<Path>>(dir: P, name: &str, block_size: u64) -> Result<Self> {
		assert!(block_size >= HEADER_LEN, "block_size must fit at least one record header");
		std::fs::create_dir_all(&dir)?;
		let path = dir.as_ref().join(format!("{}.log", name));
		let file = OpenOptions::new()
			.read(true)
			.write(true)
			.create(true)
			.open(&path)?;

		let mut store = LogStore { path, file, block_size, tail: 0 };
		store.tail = store.recover()?;
		Ok(store)
	}

	/// Forward scan establishing the last known-good tail offset. Never
	/// trusts block alignment: record boundaries come from length + CRC32C.
	/// A run of zero bytes that isn't immediately followed by end-of-file is
	/// treated as inter-record padding and skipped to the next block
	/// boundary; a run of zero bytes at end-of-file, a torn length/payload,
	/// or a checksum mismatch all terminate the scan at the same offset.
	fn recover(&mut self) -> Result<u64> {
		let file_len = self.file.metadata()?.len();
		let (_, tail) = scan_boundaries(&mut self.file, self.block_size, file_len)?;
		Ok(tail)
	}

	/// Every record start offset currently in the log, established the same
	/// way `recover` establishes `tail` on reopen. Used to validate that a
	/// position names a real record boundary rather than an offset that
	/// merely falls within `[0, tail]`.
	fn record_starts(&self) -> Result<Vec<u64>> {
		let mut file = OpenOptions::new().read(true).open(&self.path)?;
		let (starts, _) = scan_boundaries(&mut file, self.block_size, self.tail)?;
		Ok(starts)
	}

	/// Position at which the next `append` would land.
	pub fn tell(&self) -> LogPos {
		LogPos { file_ordinal: 0, offset: self.tail }
	}

	/// Appends a framed record, fsyncs, and returns its starting position.
	pub fn append(&mut self, payload: &[u8]) -> Result<LogPos> {
		if payload.is_empty() {
			return Err(LogStoreError::EmptyPayload);
		}

		let record_len = HEADER_LEN + payload.len() as u64;
		let mut offset = self.tail;
		let offset_in_block = offset % self.block_size;
		let remaining_in_block = self.block_size - offset_in_block;

		if record_len <= self.block_size && record_len > remaining_in_block {
			// Pad to the next block boundary so this record doesn't straddle.
			self.file.seek(SeekFrom::Start(offset))?;
			let zeros = vec![0u8; remaining_in_block as usize];
			self.file.write_all(&zeros)?;
			offset += remaining_in_block;
		}
		// Larger-than-block records straddle explicitly; no pre-padding.

		self.file.seek(SeekFrom::Start(offset))?;
		self.file.write_u32::<LittleEndian>(payload.len() as u32)?;
		self.file.write_u32::<LittleEndian>(crc32c::crc32c(payload))?;
		self.file.write_all(payload)?;
		self.file.sync_data()?;

		self.tail = offset + record_len;
		Ok(LogPos { file_ordinal: 0, offset })
	}

	/// Reads a single record starting exactly at `pos`, if the log contains
	/// one there. Returns `Ok(None)` for `LogPos::ZERO` when the log is
	/// empty, since the sentinel never names a real record.
	pub fn read_at(&mut self, pos: LogPos) -> Result<Option<Record>> {
		if pos.offset >= self.tail {
			return Ok(None);
		}
		self.file.seek(SeekFrom::Start(pos.offset))?;
		let length = self.file.read_u32::<LittleEndian>()?;
		let _checksum = self.file.read_u32::<LittleEndian>()?;
		let mut payload = vec![0u8; length as usize];
		self.file.read_exact(&mut payload)?;
		Ok(Some(Record { pos, payload }))
	}

	/// Position of the record immediately following the one at `pos`.
	/// `pos` must equal `tell()` (no next record yet) or name a record
	/// actually present in the log.
	pub fn pos_after(&mut self, pos: LogPos) -> Result<LogPos> {
		if pos.offset == self.tail {
			return Ok(pos);
		}
		self.file.seek(SeekFrom::Start(pos.offset))?;
		let length = self.file.read_u32::<LittleEndian>()?;
		Ok(LogPos { file_ordinal: 0, offset: pos.offset + HEADER_LEN + length as u64 })
	}

	/// Opens a fresh, independent reader positioned at `start`.
	pub fn reader(&self, start: LogPos) -> Result<LogReader> {
		let file = OpenOptions::new().read(true).open(&self.path)?;
		Ok(LogReader { file, offset: start.offset, tail: self.tail })
	}

	/// Returns `true` iff `pos` is a valid boundary to read from (either the
	/// tail itself, meaning an empty read, or the start of a stored record).
	/// Checked against the actual record boundaries established by
	/// `record_starts`, never by reading a length field straight off `pos`:
	/// an offset that merely falls inside a record's payload would misread
	/// whatever bytes happen to sit there as a bogus length, rather than
	/// report the clean "not a boundary" this method promises.
	pub fn seek(&self, pos: LogPos) -> Result<bool> {
		if pos.offset == self.tail {
			return Ok(true);
		}
		if pos.offset > self.tail {
			return Ok(false);
		}
		Ok(self.record_starts()?.binary_search(&pos.offset).is_ok())
	}

	/// Atomically drops all records at or after `pos`. `pos` must align with
	/// a record boundary still present in the log (or equal `tell()`, a
	/// no-op truncate), otherwise `InvalidPosition` is returned.
	pub fn truncate_at(&mut self, pos: LogPos) -> Result<()> {
		if pos.offset > self.tail {
			return Err(LogStoreError::InvalidPosition(pos));
		}
		if pos.offset < self.tail && !self.seek(pos)? {
			return Err(LogStoreError::InvalidPosition(pos));
		}
		self.file.set_len(pos.offset)?;
		self.file.sync_all()?;
		self.tail = pos.offset;
		Ok(())
	}
}

/// A finite, forward-only iterator over `(LogPos, payload)` pairs. Not
/// restartable; callers needing to re-read from an earlier position open a
/// fresh reader via `LogStore::reader`.
pub struct LogReader {
	file: File,
	offset: u64,
	tail: u64,
}

impl Iterator for LogReader {
	type Item = Result<Record>;

	fn next(&mut self) -> Option<Self::Item> {
		if self.offset >= self.tail {
			return None;
		}
		let result = (|| -> Result<Record> {
			self.file.seek(SeekFrom::Start(self.offset))?;
			let length = self.file.read_u32::<LittleEndian>()?;
			let _checksum = self.file.read_u32::<LittleEndian>()?;
			let mut payload = vec![0u8; length as usize];
			self.file.read_exact(&mut payload)?;
			let pos = LogPos { file_ordinal: 0, offset: self.offset };
			self.offset += HEADER_LEN + length as u64;
			Ok(Record { pos, payload })
		})();
		Some(result)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn open_tmp(block_size: u64) -> (tempfile::TempDir, LogStore) {
		let dir = tempfile::tempdir().unwrap();
		let store = LogStore::open(dir.path(), "test", block_size).unwrap();
		(dir, store)
	}

	#[test]
	fn append_then_read_round_trips() {
		let (_dir, mut store) = open_tmp(160);
		let p1 = store.append(b"hello").unwrap();
		let p2 = store.append(b"world").unwrap();
		assert!(p1 < p2);

		let entries: Vec<_> = store.reader(LogPos::ZERO).unwrap().collect::<Result<_>>().unwrap();
		assert_eq!(entries.len(), 2);
		assert_eq!(entries[0].payload, b"hello");
		assert_eq!(entries[1].payload, b"world");
	}

	#[test]
	fn truncate_then_append_then_read_sees_new_entry() {
		let (_dir, mut store) = open_tmp(160);
		let p1 = store.append(b"A").unwrap();
		store.append(b"B").unwrap();

		store.truncate_at(p1).unwrap();
		assert_eq!(store.tell(), p1);

		let p1b = store.append(b"C").unwrap();
		assert_eq!(p1, p1b);

		let entries: Vec<_> = store.reader(LogPos::ZERO).unwrap().collect::<Result<_>>().unwrap();
		assert_eq!(entries.len(), 1);
		assert_eq!(entries[0].payload, b"C");
	}

	#[test]
	fn truncate_to_non_boundary_is_rejected() {
		let (_dir, mut store) = open_tmp(160);
		let p1 = store.append(b"hello").unwrap();
		let bogus = LogPos { file_ordinal: 0, offset: p1.offset + 1 };
		assert!(matches!(store.truncate_at(bogus), Err(LogStoreError::InvalidPosition(_))));
	}

	#[test]
	fn recovers_past_many_small_records_in_tiny_blocks() {
		let dir = tempfile::tempdir().unwrap();
		let positions = {
			let mut store = LogStore::open(dir.path(), "test", 160).unwrap();
			let mut positions = Vec::new();
			for i in 0..50u32 {
				positions.push(store.append(format!("entry-{}", i).as_bytes()).unwrap());
			}
			positions
		};

		let store = LogStore::open(dir.path(), "test", 160).unwrap();
		let entries: Vec<_> = store.reader(LogPos::ZERO).unwrap().collect::<Result<_>>().unwrap();
		assert_eq!(entries.len(), positions.len());
		for (i, e) in entries.iter().enumerate() {
			assert_eq!(e.pos, positions[i]);
			assert_eq!(e.payload, format!("entry-{}", i).as_bytes());
		}
	}

	#[test]
	fn straddling_record_larger_than_block_recovers() {
		let dir = tempfile::tempdir().unwrap();
		let big = vec![7u8; 500];
		{
			let mut store = LogStore::open(dir.path(), "test", 160).unwrap();
			store.append(b"small").unwrap();
			store.append(&big).unwrap();
			store.append(b"after-big").unwrap();
		}
		let store = LogStore::open(dir.path(), "test", 160).unwrap();
		let entries: Vec<_> = store.reader(LogPos::ZERO).unwrap().collect::<Result<_>>().unwrap();
		assert_eq!(entries.len(), 3);
		assert_eq!(entries[1].payload, big);
		assert_eq!(entries[2].payload, b"after-big");
	}

	#[test]
	fn torn_tail_record_is_not_visible_after_reopen() {
		let dir = tempfile::tempdir().unwrap();
		let good_tail;
		{
			let mut store = LogStore::open(dir.path(), "test", 4096).unwrap();
			store.append(b"committed").unwrap();
			good_tail = store.tell();
			// Simulate a crash mid-write: a length header with no payload
			// behind it.
			use std::io::Write as _;
			let mut f = OpenOptions::new().write(true).open(dir.path().join("test.log")).unwrap();
			f.seek(SeekFrom::End(0)).unwrap();
			f.write_all(&100u32.to_le_bytes()).unwrap();
			f.write_all(&0u32.to_le_bytes()).unwrap();
			f.write_all(b"short").unwrap();
		}

		let store = LogStore::open(dir.path(), "test", 4096).unwrap();
		assert_eq!(store.tell(), good_tail);
	}

	#[test]
	fn rejects_empty_payload() {
		let (_dir, mut store) = open_tmp(160);
		assert!(matches!(store.append(b""), Err(LogStoreError::EmptyPayload)));
	}

	#[test]
	fn truncate_inside_later_record_in_multi_record_log_is_rejected() {
		let (_dir, mut store) = open_tmp(160);
		store.append(b"hello").unwrap();
		let p2 = store.append(b"world").unwrap();
		store.append(b"more").unwrap();

		let bogus = LogPos { file_ordinal: 0, offset: p2.offset + 2 };
		assert!(matches!(store.truncate_at(bogus), Err(LogStoreError::InvalidPosition(_))));
		assert!(!store.seek(bogus).unwrap());
	}

	#[test]
	fn recovers_records_separated_by_short_padding_gap() {
		// block_size chosen so a record's end lands 1-3 bytes short of the
		// next boundary, forcing append's padding path to leave a gap
		// shorter than HEADER_LEN before the next record.
		let dir = tempfile::tempdir().unwrap();
		let positions = {
			let mut store = LogStore::open(dir.path(), "test", 16).unwrap();
			let mut positions = Vec::new();
			// HEADER_LEN(8) + 5 = 13 bytes, leaving a 3-byte gap to the next
			// 16-byte block boundary.
			positions.push(store.append(b"abcde").unwrap());
			positions.push(store.append(b"fghij").unwrap());
			positions.push(store.append(b"klmno").unwrap());
			positions
		};

		let store = LogStore::open(dir.path(), "test", 16).unwrap();
		let entries: Vec<_> = store.reader(LogPos::ZERO).unwrap().collect::<Result<_>>().unwrap();
		assert_eq!(entries.len(), positions.len());
		assert_eq!(entries[0].payload, b"abcde");
		assert_eq!(entries[1].payload, b"fghij");
		assert_eq!(entries[2].payload, b"klmno");
	}
}
