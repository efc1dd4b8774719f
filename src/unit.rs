// Copyright 2015-2020 Parity Technologies (UK) Ltd.
// This file is part of Parity.

// Parity is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// Parity is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with Parity.  If not, see <http://www.gnu.org/licenses/>.

// The unit journal.
//
// A unit is the transactional scope every mutating operation runs in. Before
// a byte range of a data file is overwritten, its current contents are
// appended to the journal as a before-image; before a file is grown, its
// current length is recorded. Rollback (and crash recovery on open) applies
// the records in reverse. Commit fsyncs every file on the force list and
// deletes the journal.
//
// Journal file format:
//
// [MAGIC: 4] = "RDBU"
// followed by records:
// [TAG: 1][PATH_LEN: 2][PATH][POS: 8][LEN: 4][BYTES: LEN][CRC32: 4]
// TAG 1 - before-image, BYTES are the old contents at POS.
// TAG 2 - old file length in POS, LEN = 0.
// CRC32 covers TAG..BYTES. A record with a bad checksum marks the torn tail
// of a crashed write; it and everything after it is ignored.

use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use crate::{
	error::{Error, Result},
	file::DataFile,
	util,
};

const MAGIC: &[u8] = b"RDBU";
const TAG_BEFORE: u8 = 1;
const TAG_LENGTH: u8 = 2;

pub const JOURNAL_FILE: &str = "unit-journal";

/// The transactional scope consumed by the storage layers.
pub trait Unit {
	/// Records the stored bytes at `pos` so they can be restored on rollback.
	/// Must be called before the range is overwritten.
	fn record_before(&mut self, file: &Arc<DataFile>, pos: u64, before: &[u8]) -> Result<()>;
	/// Records the current file length so growth can be undone by truncation.
	fn record_old_length(&mut self, file: &Arc<DataFile>) -> Result<()>;
	/// Adds the file to the set fsynced when the unit commits.
	fn force(&mut self, file: &Arc<DataFile>);
}

/// A unit that records nothing. Used by the offline operations (accommodate,
/// compaction) which declare the files inconsistent-until-close instead of
/// journaling.
pub struct NoUnit;

impl Unit for NoUnit {
	fn record_before(&mut self, _file: &Arc<DataFile>, _pos: u64, _before: &[u8]) -> Result<()> {
		Ok(())
	}
	fn record_old_length(&mut self, _file: &Arc<DataFile>) -> Result<()> {
		Ok(())
	}
	fn force(&mut self, _file: &Arc<DataFile>) {}
}

pub struct JournalUnit {
	path: std::path::PathBuf,
	journal: std::fs::File,
	force_list: Vec<Arc<DataFile>>,
	broken: bool,
	recorded: u64,
}

impl JournalUnit {
	/// Starts a fresh unit. Fails if an unrecovered journal is still present.
	pub fn begin(dir: &std::path::Path) -> Result<JournalUnit> {
		let path = dir.join(JOURNAL_FILE);
		if path.exists() {
			return Err(Error::UnitBroken("previous unit journal was not recovered".into()));
		}
		let mut journal = std::fs::OpenOptions::new().create_new(true).write(true).open(&path)?;
		journal.write_all(MAGIC)?;
		Ok(JournalUnit { path, journal, force_list: Vec::new(), broken: false, recorded: 0 })
	}

	fn append(&mut self, tag: u8, path: &std::path::Path, pos: u64, bytes: &[u8]) -> Result<()> {
		if self.broken {
			return Err(Error::UnitBroken("unit already broken".into()));
		}
		let res = self.append_inner(tag, path, pos, bytes);
		if res.is_err() {
			self.broken = true;
			return Err(Error::UnitBroken("failed to record before image".into()));
		}
		self.recorded += 1;
		Ok(())
	}

	fn append_inner(&mut self, tag: u8, path: &std::path::Path, pos: u64, bytes: &[u8]) -> Result<()> {
		let path_bytes = path.to_string_lossy().into_owned().into_bytes();
		if path_bytes.len() > u16::MAX as usize {
			return Err(Error::Validation("file path too long".into()));
		}
		let mut record = Vec::with_capacity(1 + 2 + path_bytes.len() + 8 + 4 + bytes.len() + 4);
		record.push(tag);
		let mut scratch = [0u8; 8];
		util::write_uint(&mut scratch, path_bytes.len() as u64, 2);
		record.extend_from_slice(&scratch[..2]);
		record.extend_from_slice(&path_bytes);
		util::write_uint(&mut scratch, pos, 8);
		record.extend_from_slice(&scratch);
		util::write_uint(&mut scratch, bytes.len() as u64, 4);
		record.extend_from_slice(&scratch[..4]);
		record.extend_from_slice(bytes);
		let mut hasher = crc32fast::Hasher::new();
		hasher.update(&record);
		util::write_uint(&mut scratch, hasher.finalize() as u64, 4);
		record.extend_from_slice(&scratch[..4]);
		self.journal.write_all(&record)?;
		// The before image must be durable before the data write it protects.
		self.journal.sync_data()?;
		Ok(())
	}

	/// Fsyncs the force list and discards the journal.
	pub fn commit(self) -> Result<()> {
		if self.broken {
			return Err(Error::UnitBroken("cannot commit a broken unit".into()));
		}
		for file in &self.force_list {
			file.sync()?;
		}
		log::trace!(target: "rowdb", "Unit committed, {} records", self.recorded);
		let JournalUnit { path, journal, .. } = self;
		drop(journal);
		std::fs::remove_file(&path)?;
		Ok(())
	}

	/// Restores every recorded range and length, newest first.
	pub fn rollback(self) -> Result<()> {
		let path = self.path.clone();
		drop(self);
		log::debug!(target: "rowdb", "Rolling back unit {:?}", path);
		apply_journal(&path)
	}
}

impl Unit for JournalUnit {
	fn record_before(&mut self, file: &Arc<DataFile>, pos: u64, before: &[u8]) -> Result<()> {
		self.append(TAG_BEFORE, file.path(), pos, before)
	}

	fn record_old_length(&mut self, file: &Arc<DataFile>) -> Result<()> {
		let len = file.size().unwrap_or(0);
		self.append(TAG_LENGTH, file.path(), len, &[])
	}

	fn force(&mut self, file: &Arc<DataFile>) {
		if !self.force_list.iter().any(|f| f.path() == file.path()) {
			self.force_list.push(file.clone());
		}
	}
}

struct Record {
	tag: u8,
	path: std::path::PathBuf,
	pos: u64,
	bytes: Vec<u8>,
}

fn parse_journal(data: &[u8]) -> Vec<Record> {
	let mut records = Vec::new();
	if data.len() < MAGIC.len() || &data[..MAGIC.len()] != MAGIC {
		return records;
	}
	let mut at = MAGIC.len();
	loop {
		let start = at;
		if data.len() < start + 1 + 2 {
			break;
		}
		let tag = data[start];
		let path_len = util::read_uint(&data[start + 1..], 2) as usize;
		let fixed = 1 + 2 + path_len + 8 + 4;
		if data.len() < start + fixed {
			break;
		}
		let pos = util::read_uint(&data[start + 1 + 2 + path_len..], 8);
		let len = util::read_uint(&data[start + 1 + 2 + path_len + 8..], 4) as usize;
		if data.len() < start + fixed + len + 4 {
			break;
		}
		let mut hasher = crc32fast::Hasher::new();
		hasher.update(&data[start..start + fixed + len]);
		if hasher.finalize() as u64 != util::read_uint(&data[start + fixed + len..], 4) {
			// Torn tail.
			break;
		}
		let path_bytes = &data[start + 1 + 2..start + 1 + 2 + path_len];
		records.push(Record {
			tag,
			path: std::path::PathBuf::from(String::from_utf8_lossy(path_bytes).into_owned()),
			pos,
			bytes: data[start + fixed..start + fixed + len].to_vec(),
		});
		at = start + fixed + len + 4;
	}
	records
}

fn apply_journal(path: &std::path::Path) -> Result<()> {
	let mut data = Vec::new();
	std::fs::File::open(path)?.read_to_end(&mut data)?;
	let records = parse_journal(&data);
	let shutdown = Arc::new(AtomicBool::new(false));
	for record in records.iter().rev() {
		let file = DataFile::new(record.path.clone(), shutdown.clone(), false);
		match record.tag {
			TAG_BEFORE => file.write_at(&record.bytes, record.pos)?,
			TAG_LENGTH => file.truncate(record.pos)?,
			_ => return Err(Error::Corruption("unknown journal record tag".into())),
		}
		file.sync()?;
	}
	std::fs::remove_file(path)?;
	Ok(())
}

/// Records the whole current contents of a file, in bunches, so a rollback
/// can restore it after a truncation. The length record comes first, so it
/// is applied last, trimming the restored bytes back to the original size.
pub fn record_whole_file(unit: &mut dyn Unit, file: &Arc<DataFile>) -> Result<()> {
	unit.record_old_length(file)?;
	if !file.path().exists() {
		return Ok(());
	}
	let size = file.size()?;
	let mut buf = Vec::new();
	let mut at = 0u64;
	while at < size {
		let chunk = ((size - at) as usize).min(crate::db::BUNCH_BYTES);
		buf.resize(chunk, 0);
		file.read_at(&mut buf, at)?;
		unit.record_before(file, at, &buf)?;
		at += chunk as u64;
	}
	Ok(())
}

/// Applies and removes a leftover journal. Called when the database opens.
pub fn recover(dir: &std::path::Path) -> Result<bool> {
	let path = dir.join(JOURNAL_FILE);
	if !path.exists() {
		return Ok(false);
	}
	log::info!(target: "rowdb", "Recovering crashed unit from {:?}", path);
	apply_journal(&path)?;
	Ok(true)
}

#[cfg(test)]
mod test {
	use super::*;
	use std::sync::atomic::AtomicBool;

	fn temp_dir(name: &'static str) -> std::path::PathBuf {
		let mut path = std::env::temp_dir();
		path.push("rowdb-test");
		path.push("unit");
		path.push(name);
		if path.exists() {
			std::fs::remove_dir_all(&path).unwrap();
		}
		std::fs::create_dir_all(&path).unwrap();
		path
	}

	#[test]
	fn rollback_restores_bytes_and_length() {
		let dir = temp_dir("rollback");
		let shutdown = Arc::new(AtomicBool::new(false));
		let data = DataFile::new(dir.join("data"), shutdown, false);
		data.write_at(&[1, 2, 3, 4], 0).unwrap();

		let mut unit = JournalUnit::begin(&dir).unwrap();
		unit.record_before(&data, 0, &[1, 2, 3, 4]).unwrap();
		data.write_at(&[9, 9, 9, 9], 0).unwrap();
		unit.record_old_length(&data).unwrap();
		data.write_at(&[5, 5], 4).unwrap();
		assert_eq!(data.size().unwrap(), 6);

		unit.rollback().unwrap();
		let mut buf = [0u8; 4];
		data.read_at(&mut buf, 0).unwrap();
		assert_eq!(buf, [1, 2, 3, 4]);
		assert_eq!(data.size().unwrap(), 4);
	}

	#[test]
	fn commit_removes_journal() {
		let dir = temp_dir("commit");
		let shutdown = Arc::new(AtomicBool::new(false));
		let data = DataFile::new(dir.join("data"), shutdown, false);
		data.write_at(&[7u8; 8], 0).unwrap();

		let mut unit = JournalUnit::begin(&dir).unwrap();
		unit.record_before(&data, 0, &[7u8; 8]).unwrap();
		unit.force(&data);
		data.write_at(&[8u8; 8], 0).unwrap();
		unit.commit().unwrap();
		assert!(!dir.join(JOURNAL_FILE).exists());
		let mut buf = [0u8; 8];
		data.read_at(&mut buf, 0).unwrap();
		assert_eq!(buf, [8u8; 8]);
	}

	#[test]
	fn recover_applies_leftover_journal() {
		let dir = temp_dir("recover");
		let shutdown = Arc::new(AtomicBool::new(false));
		let data = DataFile::new(dir.join("data"), shutdown, false);
		data.write_at(&[1u8; 8], 0).unwrap();

		let mut unit = JournalUnit::begin(&dir).unwrap();
		unit.record_before(&data, 0, &[1u8; 8]).unwrap();
		data.write_at(&[2u8; 8], 0).unwrap();
		// Simulate a crash: the unit is forgotten without commit or rollback.
		std::mem::forget(unit);

		assert!(recover(&dir).unwrap());
		let mut buf = [0u8; 8];
		data.read_at(&mut buf, 0).unwrap();
		assert_eq!(buf, [1u8; 8]);
		assert!(!recover(&dir).unwrap());
	}

	#[test]
	fn torn_tail_is_ignored() {
		let dir = temp_dir("torn");
		let shutdown = Arc::new(AtomicBool::new(false));
		let data = DataFile::new(dir.join("data"), shutdown, false);
		data.write_at(&[3u8; 4], 0).unwrap();

		let mut unit = JournalUnit::begin(&dir).unwrap();
		unit.record_before(&data, 0, &[3u8; 4]).unwrap();
		data.write_at(&[4u8; 4], 0).unwrap();
		std::mem::forget(unit);

		// Corrupt the journal tail.
		use std::io::Write;
		let mut journal = std::fs::OpenOptions::new().append(true).open(dir.join(JOURNAL_FILE)).unwrap();
		journal.write_all(&[TAG_BEFORE, 0, 1]).unwrap();
		drop(journal);

		assert!(recover(&dir).unwrap());
		let mut buf = [0u8; 4];
		data.read_at(&mut buf, 0).unwrap();
		assert_eq!(buf, [3u8; 4]);
	}
}
