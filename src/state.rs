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

// File-space state tracker.
//
// The FL data file has no header of its own (block 0 starts at offset 0), so
// the head of the gap chain lives in a 16-byte sidecar next to it:
//
// [FIRST_GAP + 1: 8][GAP_COUNT: 8]
// FIRST_GAP + 1 - index of the first gap, offset by one so that 0 means "no
// gaps".
// GAP_COUNT - number of blocks on the chain.

use std::sync::Arc;
use crate::{
	error::{Error, Result},
	file::DataFile,
	unit::Unit,
	util,
};

pub const STATE_SUFFIX: &str = ".fss";

pub struct FileSpaceState {
	file: Arc<DataFile>,
}

impl FileSpaceState {
	pub fn new(file: Arc<DataFile>) -> FileSpaceState {
		FileSpaceState { file }
	}

	pub fn file(&self) -> &Arc<DataFile> {
		&self.file
	}

	/// Reads `(first_gap, gap_count)`. A missing or empty sidecar reads as an
	/// empty chain.
	pub fn read(&self) -> Result<(i64, u64)> {
		if !self.file.path().exists() || self.file.size()? < 16 {
			return Ok((-1, 0));
		}
		let mut buf = [0u8; 16];
		self.file.read_at(&mut buf, 0)?;
		let head = util::read_uint(&buf, 8);
		let count = util::read_uint(&buf[8..], 8);
		if head == 0 && count != 0 {
			return Err(Error::Corruption("gap count without a chain head".into()));
		}
		Ok((head as i64 - 1, count))
	}

	pub fn write(&self, first_gap: i64, gap_count: u64, unit: &mut dyn Unit) -> Result<()> {
		let mut old = [0u8; 16];
		if self.file.path().exists() && self.file.size()? >= 16 {
			self.file.read_at(&mut old, 0)?;
			unit.record_before(&self.file, 0, &old)?;
		} else {
			unit.record_old_length(&self.file)?;
		}
		let mut buf = [0u8; 16];
		util::write_uint(&mut buf, (first_gap + 1) as u64, 8);
		util::write_uint(&mut buf[8..], gap_count, 8);
		self.file.write_at(&buf, 0)?;
		unit.force(&self.file);
		Ok(())
	}

	pub fn delete(&self) -> Result<()> {
		self.file.delete()
	}
}
