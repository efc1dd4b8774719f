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

// Variable-length space.
//
// [M: 8][payload: size - 8]
// M - big-endian count of deallocated payload bytes.
//
// Allocation appends at the end of the file; deallocation only increments M.
// Live bytes = size - START - M. Pointer 0 is the null reference, pointer 1
// is the empty payload; real pointers start at START = 8.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use crate::{
	error::{Error, Result},
	file::DataFile,
	unit::Unit,
	util,
};

pub const START: u64 = 8;
pub const NULL_PTR: u64 = 0;
pub const EMPTY_PTR: u64 = 1;

pub struct VlFileSpace {
	file: Arc<DataFile>,
	nobs_outrow_ptr: usize,
	m: AtomicU64,
	pos: AtomicU64,
}

impl VlFileSpace {
	pub fn open(file: Arc<DataFile>, nobs_outrow_ptr: usize) -> Result<VlFileSpace> {
		assert!(nobs_outrow_ptr >= 1 && nobs_outrow_ptr <= 8);
		let size = if file.path().exists() { file.size()? } else { 0 };
		let m = if size >= START {
			let mut buf = [0u8; 8];
			file.read_at(&mut buf, 0)?;
			util::read_uint(&buf, 8)
		} else {
			if !file.read_only() {
				file.write_at(&[0u8; 8], 0)?;
			}
			0
		};
		let pos = size.max(START);
		if m > pos - START {
			return Err(Error::Corruption(format!(
				"deallocated byte count {} exceeds the payload region {}", m, pos - START
			)));
		}
		log::debug!(target: "rowdb", "Opened VL space {:?}: {} payload bytes, {} deallocated",
			file.path(), pos - START, m);
		Ok(VlFileSpace {
			file,
			nobs_outrow_ptr,
			m: AtomicU64::new(m),
			pos: AtomicU64::new(pos),
		})
	}

	pub fn file(&self) -> &Arc<DataFile> {
		&self.file
	}

	pub fn deallocated(&self) -> u64 {
		self.m.load(Ordering::Relaxed)
	}

	/// Next append position; equals the file size once pending payload writes
	/// land.
	pub fn end(&self) -> u64 {
		self.pos.load(Ordering::Relaxed)
	}

	pub fn live(&self) -> u64 {
		self.end() - START - self.deallocated()
	}

	fn persist_m(&self, unit: &mut dyn Unit) -> Result<()> {
		let mut old = [0u8; 8];
		self.file.read_at(&mut old, 0)?;
		unit.record_before(&self.file, 0, &old)?;
		let mut buf = [0u8; 8];
		util::write_uint(&mut buf, self.deallocated(), 8);
		self.file.write_at(&buf, 0)?;
		unit.force(&self.file);
		Ok(())
	}

	/// Reserves `len` bytes and returns their pointer. The caller writes the
	/// payload, growing the file. A zero-length payload allocates nothing.
	pub fn allocate(&self, len: u64, unit: &mut dyn Unit) -> Result<u64> {
		if len == 0 {
			return Ok(EMPTY_PTR);
		}
		let pos = self.pos.load(Ordering::Relaxed);
		let max = util::max_value(self.nobs_outrow_ptr);
		if pos.checked_add(len).map_or(true, |end| end > max) {
			return Err(Error::Maximum(format!(
				"VL position {} + {} exceeds the {}-byte pointer width", pos, len, self.nobs_outrow_ptr
			)));
		}
		unit.record_old_length(&self.file)?;
		unit.force(&self.file);
		self.pos.store(pos + len, Ordering::Relaxed);
		Ok(pos)
	}

	/// Marks `len` payload bytes as dead. The bytes stay where they are until
	/// the VL compactor runs.
	pub fn deallocate(&self, len: u64, unit: &mut dyn Unit) -> Result<()> {
		if len == 0 {
			return Ok(());
		}
		self.m.fetch_add(len, Ordering::Relaxed);
		self.persist_m(unit)
	}

	/// Installs the append position after an external rewrite of the file.
	pub fn reset(&self, new_size: u64) {
		self.pos.store(new_size.max(START), Ordering::Relaxed);
	}

	/// Overwrites `m` with the externally recomputed live byte count.
	pub fn correct_m(&self, live: u64, unit: &mut dyn Unit) -> Result<()> {
		let m = self.end() - START - live;
		self.m.store(m, Ordering::Relaxed);
		self.persist_m(unit)
	}

	/// Re-reads `m` and the append position from the file, after a rollback
	/// restored its on-disk contents.
	pub fn refresh(&self) -> Result<()> {
		let size = if self.file.path().exists() { self.file.size()? } else { 0 };
		let m = if size >= START {
			let mut buf = [0u8; 8];
			self.file.read_at(&mut buf, 0)?;
			util::read_uint(&buf, 8)
		} else {
			0
		};
		self.m.store(m, Ordering::Relaxed);
		self.pos.store(size.max(START), Ordering::Relaxed);
		Ok(())
	}

	pub fn clear_and_truncate(&self, unit: &mut dyn Unit) -> Result<()> {
		crate::unit::record_whole_file(unit, &self.file)?;
		self.file.truncate(START)?;
		self.m.store(0, Ordering::Relaxed);
		self.pos.store(START, Ordering::Relaxed);
		let mut buf = [0u8; 8];
		util::write_uint(&mut buf, 0, 8);
		self.file.write_at(&buf, 0)?;
		self.file.sync()?;
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::unit::NoUnit;
	use std::sync::atomic::AtomicBool;

	fn space(name: &'static str, nobs: usize) -> VlFileSpace {
		let mut path = std::env::temp_dir();
		path.push("rowdb-test");
		path.push("vl-space");
		path.push(name);
		if path.exists() {
			std::fs::remove_dir_all(&path).unwrap();
		}
		std::fs::create_dir_all(&path).unwrap();
		let shutdown = Arc::new(AtomicBool::new(false));
		VlFileSpace::open(DataFile::new(path.join("vl"), shutdown, false), nobs).unwrap()
	}

	#[test]
	fn allocation_appends() {
		let vl = space("append", 4);
		let mut unit = NoUnit;
		assert_eq!(vl.allocate(0, &mut unit).unwrap(), EMPTY_PTR);
		assert_eq!(vl.allocate(3, &mut unit).unwrap(), 8);
		vl.file().write_at(b"abc", 8).unwrap();
		assert_eq!(vl.allocate(5, &mut unit).unwrap(), 11);
		vl.file().write_at(b"defgh", 11).unwrap();
		assert_eq!(vl.end(), 16);
		assert_eq!(vl.live(), 8);
		assert_eq!(vl.deallocated(), 0);
	}

	#[test]
	fn deallocation_only_counts() {
		let vl = space("dealloc", 4);
		let mut unit = NoUnit;
		let ptr = vl.allocate(10, &mut unit).unwrap();
		vl.file().write_at(&[7u8; 10], ptr).unwrap();
		vl.deallocate(4, &mut unit).unwrap();
		assert_eq!(vl.deallocated(), 4);
		assert_eq!(vl.live(), 6);
		assert_eq!(vl.file().size().unwrap(), 18);
		// m is persisted at offset 0.
		let mut buf = [0u8; 8];
		vl.file().read_at(&mut buf, 0).unwrap();
		assert_eq!(util::read_uint(&buf, 8), 4);
	}

	#[test]
	fn pointer_width_is_enforced() {
		let vl = space("max", 1);
		let mut unit = NoUnit;
		// 8 + 247 = 255 still fits a 1-byte pointer.
		assert_eq!(vl.allocate(247, &mut unit).unwrap(), 8);
		assert!(matches!(vl.allocate(1, &mut unit), Err(Error::Maximum(_))));
	}

	#[test]
	fn clear_and_truncate_resets() {
		let vl = space("clear", 4);
		let mut unit = NoUnit;
		let ptr = vl.allocate(6, &mut unit).unwrap();
		vl.file().write_at(&[1u8; 6], ptr).unwrap();
		vl.deallocate(2, &mut unit).unwrap();
		vl.clear_and_truncate(&mut unit).unwrap();
		assert_eq!(vl.deallocated(), 0);
		assert_eq!(vl.live(), 0);
		assert_eq!(vl.file().size().unwrap(), START);
	}
}
