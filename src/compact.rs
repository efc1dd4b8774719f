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

// Offline compaction.
//
// The VL compactor collects every live outrow area into an interval treap,
// packs the areas to the left end of the payload region, rewrites the
// pointers on the FL side and resets the deallocation counter. The FL
// compactor packs out the gap blocks and rewrites every row reference in
// every table through the gap-adjusted index mapping.

use crate::{
	codec,
	error::{Error, Result},
	fl_space::is_gap_marker,
	reader::FlScanner,
	store::WrStore,
	treap::IntervalTreap,
	types::{ColumnType, Scheme},
	unit::NoUnit,
	util,
	vl_space::START,
};

/// `i - |{g in gaps : g < i - 1}|` for a 1-based row index over 0-based gap
/// block indices, the rewrite every stored reference goes through when gaps
/// are packed out.
pub fn adjust_row_index(row: u64, gaps: &[u64]) -> u64 {
	let dropped = gaps.partition_point(|&g| g < row - 1) as u64;
	row - dropped
}

/// Collects the live `(ptr, len)` areas of every row into a treap, failing
/// on overlaps or areas outside the payload region.
fn collect_live_areas(store: &WrStore) -> Result<IntervalTreap> {
	let vl_end = match store.vl() {
		Some(vl) => vl.end(),
		None => return Ok(IntervalTreap::new()),
	};
	let mut treap = IntervalTreap::new();
	let mut scanner = FlScanner::new(store.fl(), crate::db::BUNCH_BYTES);
	while let Some((index, block)) = scanner.next()? {
		if is_gap_marker(block[0]) {
			continue;
		}
		for ci in store.columns() {
			if !ci.ty.has_outrow() {
				continue;
			}
			let (len, ptr) = codec::outrow_fields(ci, block, store.nobs_outrow_ptr());
			if ptr < START {
				continue;
			}
			if ptr + len > vl_end {
				return Err(Error::Corruption(format!(
					"row {} column {}: area [{}, {}) beyond the VL end {}",
					index + 1, ci.name, ptr, ptr + len, vl_end
				)));
			}
			treap.insert(ptr, len)?;
		}
	}
	Ok(treap)
}

/// Maps an old pointer through the packed layout of `intervals`, whose new
/// start positions are `new_starts`.
fn shifted_ptr(ptr: u64, intervals: &[(u64, u64)], new_starts: &[u64]) -> Result<u64> {
	let i = intervals.partition_point(|&(start, _)| start <= ptr);
	if i == 0 {
		return Err(Error::Corruption(format!("pointer {} outside every live area", ptr)));
	}
	let (start, len) = intervals[i - 1];
	if ptr >= start + len {
		return Err(Error::Corruption(format!("pointer {} outside every live area", ptr)));
	}
	Ok(new_starts[i - 1] + (ptr - start))
}

/// Packs the live VL areas to the left, updates every outrow pointer and
/// truncates the file. Afterwards `m = 0`.
pub fn compact_vl(store: &WrStore) -> Result<()> {
	let vl = match store.vl() {
		Some(vl) => vl,
		None => return Ok(()),
	};
	let treap = collect_live_areas(store)?;
	let live = treap.total();
	let intervals = treap.sorted();
	let mut new_starts = Vec::with_capacity(intervals.len());
	let mut at = START;
	for &(_, len) in &intervals {
		new_starts.push(at);
		at += len;
	}
	log::info!(target: "rowdb", "{}: VL compaction, {} live areas, {} -> {} payload bytes",
		store.name(), intervals.len(), vl.end() - START, live);

	// Move the areas, low to high; targets never overtake unread sources.
	let mut buf = vec![0u8; crate::db::BUNCH_BYTES];
	for (&(start, len), &new_start) in intervals.iter().zip(&new_starts) {
		if start == new_start {
			continue;
		}
		let mut moved = 0u64;
		while moved < len {
			let chunk = (len - moved).min(buf.len() as u64) as usize;
			vl.file().read_at(&mut buf[..chunk], start + moved)?;
			vl.file().write_at(&buf[..chunk], new_start + moved)?;
			moved += chunk as u64;
		}
	}

	// Rewrite the pointers on the FL side.
	let ptr_w = store.nobs_outrow_ptr();
	let mut scanner = FlScanner::new(store.fl(), crate::db::BUNCH_BYTES);
	let mut field = [0u8; 8];
	while let Some((index, block)) = scanner.next()? {
		if is_gap_marker(block[0]) {
			continue;
		}
		let block_pos = store.fl().index_to_pos(index);
		for ci in store.columns() {
			if !ci.ty.has_outrow() {
				continue;
			}
			let (_len, ptr) = codec::outrow_fields(ci, block, ptr_w);
			if ptr < START {
				continue;
			}
			let new_ptr = shifted_ptr(ptr, &intervals, &new_starts)?;
			if new_ptr == ptr {
				continue;
			}
			let ll = ci.len as usize - ptr_w;
			util::write_uint(&mut field, new_ptr, ptr_w);
			store.fl().file().write_at(&field[..ptr_w], block_pos + ci.offset + ll as u64)?;
		}
	}

	vl.file().truncate(START + live)?;
	vl.reset(START + live);
	vl.correct_m(live, &mut NoUnit)?;
	vl.file().sync()?;
	store.fl().file().sync()?;
	Ok(())
}

/// Rewrites every reference to `table` in `referrer` through the adjusted
/// index mapping.
fn rewrite_references(referrer: &WrStore, table: usize, gaps: &[u64]) -> Result<()> {
	let cols: Vec<_> = referrer
		.columns()
		.iter()
		.filter(|ci| ci.target == Some(table))
		.cloned()
		.collect();
	if cols.is_empty() {
		return Ok(());
	}
	let n_bm = referrer.n_bm();
	let ptr_w = referrer.nobs_outrow_ptr();
	let mut scanner = FlScanner::new(referrer.fl(), crate::db::BUNCH_BYTES);
	let mut scratch = Vec::new();
	while let Some((index, block)) = scanner.next()? {
		if is_gap_marker(block[0]) {
			continue;
		}
		let block_pos = referrer.fl().index_to_pos(index);
		let bitmap = util::read_uint(block, n_bm);
		for ci in &cols {
			match &ci.ty {
				ColumnType::Reference { .. } => {
					let w = ci.target_nobs;
					let r = util::read_uint(&block[ci.offset as usize..], w);
					if r == 0 {
						continue;
					}
					let mut field = [0u8; 8];
					util::write_uint(&mut field, adjust_row_index(r, gaps), w);
					referrer.fl().file().write_at(&field[..w], block_pos + ci.offset)?;
				}
				ColumnType::ArrayOfRef { scheme: Scheme::InRow, .. } => {
					if bitmap & ci.null_mask != 0 {
						continue;
					}
					let region = &block[ci.offset as usize..(ci.offset + ci.len) as usize];
					scratch.clear();
					scratch.extend_from_slice(region);
					if adjust_ref_payload(&mut scratch, ci.ty.size_len(), ci.target_nobs, gaps) {
						referrer.fl().file().write_at(&scratch, block_pos + ci.offset)?;
					}
				}
				ColumnType::ArrayOfRef { scheme: Scheme::OutRow, .. } => {
					let (len, ptr) = codec::outrow_fields(ci, block, ptr_w);
					if ptr < START || len == 0 {
						continue;
					}
					let vl = referrer.vl().ok_or_else(|| {
						Error::Corruption("outrow column without a VL file".into())
					})?;
					scratch.clear();
					scratch.resize(len as usize, 0);
					vl.file().read_at(&mut scratch, ptr)?;
					if adjust_ref_payload(&mut scratch, ci.ty.size_len(), ci.target_nobs, gaps) {
						vl.file().write_at(&scratch, ptr)?;
					}
				}
				_ => {}
			}
		}
	}
	Ok(())
}

/// Adjusts every non-null reference of a `[size][refs]` payload in place.
/// Returns whether anything changed.
fn adjust_ref_payload(payload: &mut [u8], size_len: usize, w: usize, gaps: &[u64]) -> bool {
	let size = util::read_uint(payload, size_len);
	let mut changed = false;
	for i in 0..size as usize {
		let at = size_len + i * w;
		let r = util::read_uint(&payload[at..], w);
		if r == 0 {
			continue;
		}
		let adjusted = adjust_row_index(r, gaps);
		if adjusted != r {
			util::write_uint(&mut payload[at..], adjusted, w);
			changed = true;
		}
	}
	changed
}

/// Packs out the gap blocks of `table` and rewrites every reference to it,
/// in every table. The gap chain ends empty.
pub fn compact_fl(stores: &[WrStore], table: usize) -> Result<()> {
	let store = &stores[table];
	let gaps = store.fl().gaps()?;
	if gaps.is_empty() {
		return Ok(());
	}
	log::info!(target: "rowdb", "{}: FL compaction, packing out {} gaps", store.name(), gaps.len());

	for referrer in stores {
		rewrite_references(referrer, table, &gaps)?;
	}

	// Pack the surviving blocks down. Reads stay ahead of writes.
	let n = store.fl().block_size();
	let mut write_at = 0u64;
	let mut buf = vec![0u8; n as usize];
	for index in 0..store.fl().block_count() {
		store.fl().file().read_at(&mut buf, store.fl().index_to_pos(index))?;
		if is_gap_marker(buf[0]) {
			continue;
		}
		if write_at != index {
			store.fl().file().write_at(&buf, write_at * n)?;
		}
		write_at += 1;
	}
	store.fl().file().truncate(write_at * n)?;
	store.fl().reset_after_compaction(write_at)?;
	store.fl().file().sync()?;
	Ok(())
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn adjusts_indices_around_gaps() {
		// Blocks 1 and 3 are gaps; rows sit in blocks 0, 2 and 4.
		let gaps = vec![1, 3];
		assert_eq!(adjust_row_index(1, &gaps), 1);
		assert_eq!(adjust_row_index(3, &gaps), 2);
		assert_eq!(adjust_row_index(5, &gaps), 3);
	}

	#[test]
	fn adjusts_nothing_without_gaps() {
		for r in 1..10 {
			assert_eq!(adjust_row_index(r, &[]), r);
		}
	}
}
