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

// Fixed-length block space.
//
// The FL data file is an array of n-byte blocks, n >= 8, block 0 at offset
// 0. A deallocated block is a gap. Gaps form a linked list threaded through
// the blocks themselves:
//
// [GAP WORD: 8][stale bytes: n - 8]
// GAP WORD - big-endian u64; the most significant bit is the gap marker, the
// low 63 bits hold the index of the next gap plus one (0 = end of chain).
//
// The head of the chain and the gap count are persisted by the file-space
// state tracker. The chain is therefore recoverable two ways: by walking it
// from the head, or by scanning every block's first byte for the marker bit.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use crate::{
	error::{Error, Result},
	file::DataFile,
	state::FileSpaceState,
	unit::Unit,
	util,
};

const GAP_BIT: u64 = 1 << 63;

pub fn is_gap_marker(first_byte: u8) -> bool {
	first_byte & 0x80 != 0
}

fn encode_gap_word(next: i64) -> [u8; 8] {
	let mut buf = [0u8; 8];
	util::write_uint(&mut buf, GAP_BIT | (next + 1) as u64, 8);
	buf
}

fn decode_gap_word(buf: &[u8]) -> Result<i64> {
	let word = util::read_uint(buf, 8);
	if word & GAP_BIT == 0 {
		return Err(Error::Corruption("block on the gap chain is not marked as a gap".into()));
	}
	Ok((word & !GAP_BIT) as i64 - 1)
}

pub struct FlFileSpace {
	file: Arc<DataFile>,
	state: FileSpaceState,
	n: u64,
	blocks: AtomicU64,
	gap_count: AtomicU64,
	first_gap: AtomicI64,
}

impl FlFileSpace {
	pub fn open(file: Arc<DataFile>, state: FileSpaceState, n: u64) -> Result<FlFileSpace> {
		assert!(n >= 8);
		let size = if file.path().exists() { file.size()? } else { 0 };
		if size % n != 0 {
			return Err(Error::Corruption(format!(
				"FL file size {} is not a multiple of the block size {}", size, n
			)));
		}
		let (first_gap, gap_count) = state.read()?;
		let blocks = size / n;
		if first_gap >= blocks as i64 {
			return Err(Error::Corruption("gap chain head beyond the last block".into()));
		}
		log::debug!(target: "rowdb", "Opened FL space {:?}: {} blocks of {} bytes, {} gaps",
			file.path(), blocks, n, gap_count);
		Ok(FlFileSpace {
			file,
			state,
			n,
			blocks: AtomicU64::new(blocks),
			gap_count: AtomicU64::new(gap_count),
			first_gap: AtomicI64::new(first_gap),
		})
	}

	pub fn file(&self) -> &Arc<DataFile> {
		&self.file
	}

	pub fn block_size(&self) -> u64 {
		self.n
	}

	pub fn block_count(&self) -> u64 {
		self.blocks.load(Ordering::Relaxed)
	}

	pub fn gap_count(&self) -> u64 {
		self.gap_count.load(Ordering::Relaxed)
	}

	pub fn index_to_pos(&self, index: u64) -> u64 {
		index * self.n
	}

	pub fn pos_to_index(&self, pos: u64) -> u64 {
		pos / self.n
	}

	pub fn is_gap(&self, index: u64) -> Result<bool> {
		if index >= self.block_count() {
			return Err(Error::IllegalReference(format!("block {} beyond the last block", index)));
		}
		let mut first = [0u8];
		self.file.read_at(&mut first, self.index_to_pos(index))?;
		Ok(is_gap_marker(first[0]))
	}

	/// Pops a gap off the chain, or grows the file by one block. Returns the
	/// block index. The caller writes the block contents.
	pub fn allocate(&self, unit: &mut dyn Unit) -> Result<u64> {
		let first_gap = self.first_gap.load(Ordering::Relaxed);
		let index = if first_gap >= 0 {
			let index = first_gap as u64;
			let mut block = vec![0u8; self.n as usize];
			self.file.read_at(&mut block, self.index_to_pos(index))?;
			unit.record_before(&self.file, self.index_to_pos(index), &block)?;
			let next = decode_gap_word(&block)?;
			self.first_gap.store(next, Ordering::Relaxed);
			self.gap_count.fetch_sub(1, Ordering::Relaxed);
			self.state.write(next, self.gap_count(), unit)?;
			log::trace!(target: "rowdb", "{:?}: allocating into gap {}", self.file.path(), index);
			index
		} else {
			unit.record_old_length(&self.file)?;
			let index = self.blocks.fetch_add(1, Ordering::Relaxed);
			log::trace!(target: "rowdb", "{:?}: allocating new block {}", self.file.path(), index);
			index
		};
		unit.force(&self.file);
		Ok(index)
	}

	/// Pushes the block onto the gap chain and sets the gap marker. Stale row
	/// bytes past the gap word stay in place until the block is reused.
	pub fn free(&self, index: u64, unit: &mut dyn Unit) -> Result<()> {
		if index >= self.block_count() {
			return Err(Error::IllegalReference(format!("cannot free block {} beyond the last block", index)));
		}
		let pos = self.index_to_pos(index);
		let mut old = [0u8; 8];
		self.file.read_at(&mut old, pos)?;
		if is_gap_marker(old[0]) {
			return Err(Error::IllegalReference(format!("block {} is already a gap", index)));
		}
		unit.record_before(&self.file, pos, &old)?;
		let first_gap = self.first_gap.load(Ordering::Relaxed);
		self.file.write_at(&encode_gap_word(first_gap), pos)?;
		self.first_gap.store(index as i64, Ordering::Relaxed);
		self.gap_count.fetch_add(1, Ordering::Relaxed);
		self.state.write(index as i64, self.gap_count(), unit)?;
		unit.force(&self.file);
		log::trace!(target: "rowdb", "{:?}: freed block {}", self.file.path(), index);
		Ok(())
	}

	/// Walks the chain and returns the gap indices in ascending order.
	pub fn gaps(&self) -> Result<Vec<u64>> {
		let expected = self.gap_count();
		if expected > i32::MAX as u64 {
			return Err(Error::ImplementationRestriction(format!("{} gaps", expected)));
		}
		let mut gaps = Vec::with_capacity(expected as usize);
		let mut at = self.first_gap.load(Ordering::Relaxed);
		let mut word = [0u8; 8];
		while at >= 0 {
			if gaps.len() as u64 >= expected {
				return Err(Error::Corruption("gap chain longer than the gap count".into()));
			}
			gaps.push(at as u64);
			self.file.read_at(&mut word, self.index_to_pos(at as u64))?;
			at = decode_gap_word(&word)?;
		}
		if gaps.len() as u64 != expected {
			return Err(Error::Corruption("gap chain shorter than the gap count".into()));
		}
		gaps.sort_unstable();
		Ok(gaps)
	}

	/// Re-threads the chain from the marker bits, scanning every block.
	pub fn rebuild_chain_of_gaps(&self) -> Result<()> {
		let blocks = self.block_count();
		let mut gaps = Vec::new();
		let mut first = [0u8];
		for index in 0..blocks {
			self.file.read_at(&mut first, self.index_to_pos(index))?;
			if is_gap_marker(first[0]) {
				gaps.push(index);
			}
		}
		let mut next = -1i64;
		for &index in gaps.iter().rev() {
			self.file.write_at(&encode_gap_word(next), self.index_to_pos(index))?;
			next = index as i64;
		}
		self.first_gap.store(next, Ordering::Relaxed);
		self.gap_count.store(gaps.len() as u64, Ordering::Relaxed);
		let mut unit = crate::unit::NoUnit;
		self.state.write(next, gaps.len() as u64, &mut unit)?;
		self.file.sync()?;
		log::debug!(target: "rowdb", "{:?}: rebuilt chain of {} gaps", self.file.path(), gaps.len());
		Ok(())
	}

	/// Drops every block and truncates the file.
	pub fn clear_and_truncate(&self, unit: &mut dyn Unit) -> Result<()> {
		crate::unit::record_whole_file(unit, &self.file)?;
		self.file.truncate(0)?;
		self.blocks.store(0, Ordering::Relaxed);
		self.gap_count.store(0, Ordering::Relaxed);
		self.first_gap.store(-1, Ordering::Relaxed);
		self.state.write(-1, 0, unit)?;
		self.file.sync()?;
		Ok(())
	}

	/// Re-reads the allocator state from the file and the sidecar, after a
	/// rollback restored their on-disk contents.
	pub fn refresh(&self) -> Result<()> {
		let size = if self.file.path().exists() { self.file.size()? } else { 0 };
		if size % self.n != 0 {
			return Err(Error::Corruption(format!(
				"FL file size {} is not a multiple of the block size {}", size, self.n
			)));
		}
		let (first_gap, gap_count) = self.state.read()?;
		self.blocks.store(size / self.n, Ordering::Relaxed);
		self.first_gap.store(first_gap, Ordering::Relaxed);
		self.gap_count.store(gap_count, Ordering::Relaxed);
		Ok(())
	}

	/// Installs a rebuilt, gap-free state after offline compaction.
	pub fn reset_after_compaction(&self, blocks: u64) -> Result<()> {
		self.blocks.store(blocks, Ordering::Relaxed);
		self.gap_count.store(0, Ordering::Relaxed);
		self.first_gap.store(-1, Ordering::Relaxed);
		let mut unit = crate::unit::NoUnit;
		self.state.write(-1, 0, &mut unit)?;
		Ok(())
	}

	pub fn state(&self) -> &FileSpaceState {
		&self.state
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::unit::NoUnit;
	use std::sync::atomic::AtomicBool;

	fn space(name: &'static str, n: u64) -> FlFileSpace {
		let mut path = std::env::temp_dir();
		path.push("rowdb-test");
		path.push("fl-space");
		path.push(name);
		if path.exists() {
			std::fs::remove_dir_all(&path).unwrap();
		}
		std::fs::create_dir_all(&path).unwrap();
		let shutdown = Arc::new(AtomicBool::new(false));
		let file = DataFile::new(path.join("fl"), shutdown.clone(), false);
		let state = FileSpaceState::new(DataFile::new(path.join("fl.fss"), shutdown, false));
		FlFileSpace::open(file, state, n).unwrap()
	}

	#[test]
	fn allocate_appends_then_reuses_gaps() {
		let fl = space("allocate", 16);
		let mut unit = NoUnit;
		assert_eq!(fl.allocate(&mut unit).unwrap(), 0);
		fl.file().write_at(&[0u8; 16], 0).unwrap();
		assert_eq!(fl.allocate(&mut unit).unwrap(), 1);
		fl.file().write_at(&[0u8; 16], 16).unwrap();
		assert_eq!(fl.allocate(&mut unit).unwrap(), 2);
		fl.file().write_at(&[0u8; 16], 32).unwrap();

		fl.free(1, &mut unit).unwrap();
		fl.free(2, &mut unit).unwrap();
		assert_eq!(fl.gap_count(), 2);
		assert_eq!(fl.gaps().unwrap(), vec![1, 2]);

		// Chain pops newest first.
		assert_eq!(fl.allocate(&mut unit).unwrap(), 2);
		assert_eq!(fl.allocate(&mut unit).unwrap(), 1);
		assert_eq!(fl.allocate(&mut unit).unwrap(), 3);
		assert_eq!(fl.gap_count(), 0);
		assert_eq!(fl.pos_to_index(fl.index_to_pos(3)), 3);
	}

	#[test]
	fn chain_and_marker_bits_agree() {
		let fl = space("duality", 8);
		let mut unit = NoUnit;
		for i in 0..5 {
			assert_eq!(fl.allocate(&mut unit).unwrap(), i);
			fl.file().write_at(&[0u8; 8], i * 8).unwrap();
		}
		fl.free(0, &mut unit).unwrap();
		fl.free(3, &mut unit).unwrap();

		let chain = fl.gaps().unwrap();
		let mut scanned = Vec::new();
		for i in 0..fl.block_count() {
			if fl.is_gap(i).unwrap() {
				scanned.push(i);
			}
		}
		assert_eq!(chain, scanned);
		assert_eq!(chain, vec![0, 3]);
	}

	#[test]
	fn rebuild_recovers_the_chain() {
		let fl = space("rebuild", 8);
		let mut unit = NoUnit;
		for i in 0..4 {
			fl.allocate(&mut unit).unwrap();
			fl.file().write_at(&[0u8; 8], i * 8).unwrap();
		}
		fl.free(1, &mut unit).unwrap();
		fl.free(2, &mut unit).unwrap();

		// Wreck the persisted head, then rebuild from the marker bits.
		fl.first_gap.store(-1, Ordering::Relaxed);
		fl.gap_count.store(0, Ordering::Relaxed);
		fl.rebuild_chain_of_gaps().unwrap();
		assert_eq!(fl.gaps().unwrap(), vec![1, 2]);
		assert_eq!(fl.gap_count(), 2);
	}

	#[test]
	fn clear_and_truncate_drops_everything() {
		let fl = space("clear", 8);
		let mut unit = NoUnit;
		for i in 0..3 {
			fl.allocate(&mut unit).unwrap();
			fl.file().write_at(&[0u8; 8], i * 8).unwrap();
		}
		fl.free(1, &mut unit).unwrap();
		fl.clear_and_truncate(&mut unit).unwrap();
		assert_eq!(fl.block_count(), 0);
		assert_eq!(fl.gap_count(), 0);
		assert_eq!(fl.file().size().unwrap(), 0);
		assert_eq!(fl.allocate(&mut unit).unwrap(), 0);
	}
}
