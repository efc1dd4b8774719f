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

// Sectioned and blockwise reads of FL blocks.
//
// A caller names the columns it wants; the reader either fetches the
// requested byte ranges with separate positional reads or fetches the whole
// block, whichever is cheaper: with p disjoint ranges of summed length L
// (bitmap included) against a block of n bytes, separate reads win when
// L < n / p.

use crate::{
	error::{Error, Result},
	fl_space::{is_gap_marker, FlFileSpace},
	store::WrStore,
	util,
};

/// The outcome of reading one block.
pub enum RowData {
	Gap,
	Data(FlData),
}

/// A view of one row's FL bytes, indexed by in-block offsets. The backing
/// buffer is always block sized; `ranges` lists which parts of it hold
/// fetched bytes.
pub struct FlData {
	buf: Vec<u8>,
	bitmap: u64,
	ranges: Vec<(usize, usize)>,
}

impl FlData {
	pub fn bitmap(&self) -> u64 {
		self.bitmap
	}

	pub fn set_bitmap(&mut self, bitmap: u64, n_bm: usize) {
		self.bitmap = bitmap;
		util::write_uint(&mut self.buf, bitmap, n_bm);
	}

	/// The fetched byte ranges as `(in-block offset, bytes)`.
	pub fn ranges(&self) -> impl Iterator<Item = (usize, &[u8])> {
		self.ranges.iter().map(move |&(off, len)| (off, &self.buf[off..off + len]))
	}

	pub fn buf(&self) -> &[u8] {
		&self.buf
	}

	pub fn buf_mut(&mut self) -> &mut [u8] {
		&mut self.buf
	}
}

fn column_ranges(store: &WrStore, cols: &[usize]) -> Vec<(usize, usize)> {
	let mut ranges: Vec<(usize, usize)> = Vec::with_capacity(cols.len() + 1);
	ranges.push((0, store.n_bm()));
	let mut sorted: Vec<usize> = cols.to_vec();
	sorted.sort_unstable();
	sorted.dedup();
	for &c in &sorted {
		let ci = &store.columns()[c];
		let (off, len) = (ci.offset as usize, ci.len as usize);
		match ranges.last_mut() {
			Some(last) if last.0 + last.1 == off => last.1 += len,
			_ => ranges.push((off, len)),
		}
	}
	ranges
}

/// Reads the bitmap and the named columns of block `index`.
pub fn read(store: &WrStore, index: u64, cols: &[usize]) -> Result<RowData> {
	if index >= store.fl().block_count() {
		return Err(Error::IllegalReference(format!("row {} does not exist", index + 1)));
	}
	let n = store.n() as usize;
	let pos = store.fl().index_to_pos(index);
	let ranges = column_ranges(store, cols);
	let p = ranges.len();
	let total: usize = ranges.iter().map(|&(_, len)| len).sum();
	let mut buf = vec![0u8; n];
	let ranges = if total < n / p {
		for &(off, len) in &ranges {
			store.fl().file().read_at(&mut buf[off..off + len], pos + off as u64)?;
		}
		ranges
	} else {
		store.fl().file().read_at(&mut buf, pos)?;
		vec![(0, n)]
	};
	if is_gap_marker(buf[0]) {
		return Ok(RowData::Gap);
	}
	let bitmap = util::read_uint(&buf, store.n_bm());
	Ok(RowData::Data(FlData { buf, bitmap, ranges }))
}

/// Reads consecutive whole blocks in bunches, for table scans. Yields every
/// block, gaps included; the caller checks the gap marker.
pub struct FlScanner<'a> {
	fl: &'a FlFileSpace,
	buf: Vec<u8>,
	n: usize,
	next: u64,
	end: u64,
	bunch: u64,
	in_buf: u64,
	at: u64,
}

impl<'a> FlScanner<'a> {
	pub fn new(fl: &'a FlFileSpace, bunch_bytes: usize) -> FlScanner<'a> {
		let n = fl.block_size() as usize;
		let bunch = (bunch_bytes / n).max(1) as u64;
		FlScanner {
			fl,
			buf: Vec::new(),
			n,
			next: 0,
			end: fl.block_count(),
			bunch,
			in_buf: 0,
			at: 0,
		}
	}

	pub fn next(&mut self) -> Result<Option<(u64, &[u8])>> {
		if self.at == self.in_buf {
			if self.next == self.end {
				return Ok(None);
			}
			let count = self.bunch.min(self.end - self.next);
			self.buf.resize(count as usize * self.n, 0);
			self.fl.file().read_at(&mut self.buf, self.fl.index_to_pos(self.next))?;
			self.at = 0;
			self.in_buf = count;
			self.next += count;
		}
		let index = self.next - self.in_buf + self.at;
		let start = self.at as usize * self.n;
		self.at += 1;
		Ok(Some((index, &self.buf[start..start + self.n])))
	}
}
