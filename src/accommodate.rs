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

// FL file accommodation: rewriting every block under a specification of
// position-ordered spots.
//
// A spot names a position inside the block and either cuts bytes there,
// inserts zero bytes, rewrites bytes through an updater, or both changes
// length and rewrites. Gap blocks keep their 8-byte chain word and are
// otherwise not interpreted. An optional presenter sees every old live
// block before it is rewritten, for side effects such as decrementing
// reference counters or deallocating VL payload.
//
// Three paths:
// 1. a single contraction with no updater rewrites the file in place, front
//    to back, and truncates it;
// 2. a single expansion with no updater rewrites in place when the insert is
//    absorbed by the excess padding, through a side file otherwise;
// 3. the general path streams every block through a side file, applying the
//    spots, and atomically replaces the original.
//
// While any path runs the file-space state is unreliable; the database is
// expected to be closed right after the schema operation finishes. An error
// before the side file is renamed leaves the original file untouched.

use crate::{
	error::{Error, Result},
	file::DataFile,
	fl_space::{is_gap_marker, FlFileSpace},
	};

pub struct Updater<'a> {
	/// Number of bytes this updater writes at the spot position.
	pub len: usize,
	/// Receives the whole old block and the output region of `len` bytes.
	pub write: Box<dyn FnMut(&[u8], &mut [u8]) -> Result<()> + 'a>,
}

pub struct Spot<'a> {
	/// Position within the block, bitmap included.
	pub pos: u64,
	/// Net length change at `pos`: negative cuts bytes, positive inserts
	/// zero-filled bytes, zero updates in place.
	pub c_len: i64,
	pub updater: Option<Updater<'a>>,
}

impl<'a> Spot<'a> {
	pub fn contract(pos: u64, len: u64) -> Spot<'a> {
		Spot { pos, c_len: -(len as i64), updater: None }
	}

	pub fn expand(pos: u64, len: u64) -> Spot<'a> {
		Spot { pos, c_len: len as i64, updater: None }
	}

	pub fn update(pos: u64, updater: Updater<'a>) -> Spot<'a> {
		Spot { pos, c_len: 0, updater: Some(updater) }
	}
}

#[derive(Default)]
pub struct SpotList<'a> {
	spots: Vec<Spot<'a>>,
}

impl<'a> SpotList<'a> {
	pub fn new() -> SpotList<'a> {
		Default::default()
	}

	/// Appends a spot. Positions must be strictly ascending and spots must
	/// not overlap the bytes a predecessor cuts or rewrites.
	pub fn add(&mut self, spot: Spot<'a>) -> Result<()> {
		if let Some(last) = self.spots.last() {
			let consumed = (-last.c_len).max(0) as u64
				+ last.updater.as_ref().map_or(0, |u| (u.len as i64 - last.c_len.max(0)).max(0) as u64);
			if spot.pos < last.pos + consumed || spot.pos <= last.pos {
				return Err(Error::Validation(format!(
					"spot at {} is not strictly after the previous spot at {}", spot.pos, last.pos
				)));
			}
		}
		self.spots.push(spot);
		Ok(())
	}

	pub fn is_empty(&self) -> bool {
		self.spots.is_empty()
	}

	/// Net block length change of the whole specification.
	pub fn net(&self) -> i64 {
		self.spots.iter().map(|s| s.c_len).sum()
	}
}

pub type Presenter<'a> = dyn FnMut(&[u8]) -> Result<()> + 'a;

/// Derives the new block size from the old content length (block minus
/// excess) and the net change, clamped to the 8-byte minimum.
pub fn new_block_size(old_content: u64, net: i64) -> u64 {
	((old_content as i64 + net) as u64).max(8)
}

/// Rewrites every block of `fl` under `spots`. `old_content` is the old
/// block length without the excess padding. Returns the new block size; the
/// store must be reopened afterwards.
pub fn accommodate(
	fl: &FlFileSpace,
	old_content: u64,
	mut spots: SpotList,
	mut presenter: Option<&mut Presenter<'_>>,
	buf_in: &mut Vec<u8>,
	buf_out: &mut Vec<u8>,
) -> Result<u64> {
	let old_n = fl.block_size();
	debug_assert!(old_content <= old_n);
	for spot in &spots.spots {
		let cut = (-spot.c_len).max(0) as u64;
		if spot.pos + cut > old_content {
			return Err(Error::Validation(format!(
				"spot at {} cuts past the block content of {} bytes", spot.pos, old_content
			)));
		}
	}
	let new_n = new_block_size(old_content, spots.net());
	log::info!(target: "rowdb", "{:?}: accommodating {} blocks, n {} -> {}",
		fl.file().path(), fl.block_count(), old_n, new_n);

	let single_plain = spots.spots.len() == 1 && spots.spots[0].updater.is_none();
	if single_plain && presenter.is_none() && spots.spots[0].c_len < 0 {
		contract_in_place(fl, old_content, new_n, &spots.spots[0], buf_in, buf_out)?;
	} else if single_plain && presenter.is_none() && spots.spots[0].c_len > 0 && new_n == old_n {
		expand_in_place(fl, old_content, &spots.spots[0], buf_in)?;
	} else {
		rewrite_through_side_file(fl, old_content, new_n, &mut spots, &mut presenter, buf_in, buf_out)?;
	}
	Ok(new_n)
}

fn for_bunches<F: FnMut(&[u8], u64) -> Result<()>>(
	fl: &FlFileSpace,
	buf_in: &mut Vec<u8>,
	mut f: F,
) -> Result<()> {
	let old_n = fl.block_size() as usize;
	let bunch = (crate::db::BUNCH_BYTES / old_n).max(1) as u64;
	let blocks = fl.block_count();
	let mut at = 0u64;
	while at < blocks {
		let count = bunch.min(blocks - at);
		buf_in.clear();
		buf_in.resize(count as usize * old_n, 0);
		fl.file().read_at(buf_in, fl.index_to_pos(at))?;
		f(buf_in, at)?;
		at += count;
	}
	Ok(())
}

/// Path 1: one cut, no updater, no presenter. Blocks shrink, so converted
/// bunches are written ahead of the unread region and the file is truncated
/// at the end. Gap blocks are cut past their chain word instead.
fn contract_in_place(
	fl: &FlFileSpace,
	old_content: u64,
	new_n: u64,
	spot: &Spot,
	buf_in: &mut Vec<u8>,
	buf_out: &mut Vec<u8>,
) -> Result<()> {
	let old_n = fl.block_size() as usize;
	let cut = (-spot.c_len) as usize;
	let pos = spot.pos as usize;
	let file = fl.file().clone();
	let new_n_us = new_n as usize;
	let result = for_bunches(fl, buf_in, |bunch, first| {
		let count = bunch.len() / old_n;
		buf_out.clear();
		buf_out.resize(count * new_n_us, 0);
		for b in 0..count {
			let old = &bunch[b * old_n..(b + 1) * old_n];
			let out = &mut buf_out[b * new_n_us..(b + 1) * new_n_us];
			if is_gap_marker(old[0]) {
				out[..8].copy_from_slice(&old[..8]);
				copy_clamped(&old[(8 + cut).min(old_n)..], &mut out[8..]);
			} else {
				out[..pos].copy_from_slice(&old[..pos]);
				copy_clamped(&old[pos + cut..old_content as usize], &mut out[pos..]);
			}
		}
		file.write_at(buf_out, first * new_n)?;
		Ok(())
	});
	result?;
	file.truncate(fl.block_count() * new_n)?;
	file.sync()?;
	Ok(())
}

/// Path 2, in-place case: one insert fully absorbed by the excess padding.
/// The block size does not change, so every bunch is rewritten where it was
/// read.
fn expand_in_place(
	fl: &FlFileSpace,
	old_content: u64,
	spot: &Spot,
	buf_in: &mut Vec<u8>,
) -> Result<()> {
	let old_n = fl.block_size() as usize;
	let ins = spot.c_len as usize;
	let pos = spot.pos as usize;
	let content = old_content as usize;
	let file = fl.file().clone();
	let mut out = vec![0u8; old_n];
	for_bunches(fl, buf_in, |bunch, first| {
		let count = bunch.len() / old_n;
		for b in 0..count {
			let old = &bunch[b * old_n..(b + 1) * old_n];
			if is_gap_marker(old[0]) {
				continue;
			}
			for byte in out.iter_mut() {
				*byte = 0;
			}
			out[..pos].copy_from_slice(&old[..pos]);
			out[pos + ins..pos + ins + (content - pos)].copy_from_slice(&old[pos..content]);
			file.write_at(&out, (first + b as u64) * old_n as u64)?;
		}
		Ok(())
	})?;
	file.sync()?;
	Ok(())
}

/// Path 3 (and the growing half of path 2): stream every block through a
/// side file, then atomically replace the original.
fn rewrite_through_side_file(
	fl: &FlFileSpace,
	old_content: u64,
	new_n: u64,
	spots: &mut SpotList,
	presenter: &mut Option<&mut Presenter<'_>>,
	buf_in: &mut Vec<u8>,
	buf_out: &mut Vec<u8>,
) -> Result<()> {
	let old_n = fl.block_size() as usize;
	let new_n_us = new_n as usize;
	let content = old_content as usize;
	let side_path = {
		let mut p = fl.file().path().to_path_buf().into_os_string();
		p.push(".acc");
		std::path::PathBuf::from(p)
	};
	if side_path.exists() {
		std::fs::remove_file(&side_path)?;
	}
	let side = DataFile::new(side_path.clone(), Default::default(), false);

	let result = for_bunches(fl, buf_in, |bunch, first| {
		let count = bunch.len() / old_n;
		buf_out.clear();
		buf_out.resize(count * new_n_us, 0);
		for b in 0..count {
			let old = &bunch[b * old_n..(b + 1) * old_n];
			let out = &mut buf_out[b * new_n_us..(b + 1) * new_n_us];
			if is_gap_marker(old[0]) {
				out[..8].copy_from_slice(&old[..8]);
				continue;
			}
			if let Some(p) = presenter.as_mut() {
				p(old)?;
			}
			let mut rd = 0usize;
			let mut wr = 0usize;
			for spot in spots.spots.iter_mut() {
				let pos = spot.pos as usize;
				out[wr..wr + (pos - rd)].copy_from_slice(&old[rd..pos]);
				wr += pos - rd;
				rd = pos;
				let up_len = spot.updater.as_ref().map_or(0, |u| u.len);
				let written = up_len.max(spot.c_len.max(0) as usize);
				if let Some(updater) = spot.updater.as_mut() {
					(updater.write)(old, &mut out[wr..wr + up_len])?;
				}
				// Bytes past the updater output are the inserted zeros.
				wr += written;
				rd += (up_len as i64 - spot.c_len).max(0) as usize;
			}
			out[wr..wr + (content - rd)].copy_from_slice(&old[rd..content]);
		}
		side.write_at(buf_out, first * new_n)?;
		Ok(())
	});
	if let Err(e) = result {
		let _ = side.delete();
		return Err(e);
	}
	side.sync()?;
	side.close()?;
	fl.file().close()?;
	std::fs::rename(&side_path, fl.file().path())?;
	Ok(())
}

fn copy_clamped(src: &[u8], dst: &mut [u8]) {
	let len = src.len().min(dst.len());
	dst[..len].copy_from_slice(&src[..len]);
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::file::DataFile;
	use crate::state::FileSpaceState;
	use crate::unit::NoUnit;
	use std::sync::Arc;
	use std::sync::atomic::AtomicBool;

	fn space(name: &'static str, n: u64) -> FlFileSpace {
		let mut path = std::env::temp_dir();
		path.push("rowdb-test");
		path.push("accommodate");
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

	fn reopen(fl: &FlFileSpace, n: u64) -> FlFileSpace {
		let shutdown = Arc::new(AtomicBool::new(false));
		let file = DataFile::new(fl.file().path().to_path_buf(), shutdown.clone(), false);
		let state = FileSpaceState::new(DataFile::new(
			fl.state().file().path().to_path_buf(),
			shutdown,
			false,
		));
		FlFileSpace::open(file, state, n).unwrap()
	}

	fn fill(fl: &FlFileSpace, rows: &[&[u8]]) {
		let mut unit = NoUnit;
		for row in rows {
			let i = fl.allocate(&mut unit).unwrap();
			fl.file().write_at(row, fl.index_to_pos(i)).unwrap();
		}
	}

	fn block(fl: &FlFileSpace, i: u64, n: usize) -> Vec<u8> {
		let mut buf = vec![0u8; n];
		fl.file().read_at(&mut buf, i * n as u64).unwrap();
		buf
	}

	#[test]
	fn single_contraction_in_place() {
		let fl = space("contract", 12);
		fill(&fl, &[
			&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12],
			&[21, 22, 23, 24, 25, 26, 27, 28, 29, 30, 31, 32],
		]);
		let mut unit = NoUnit;
		fl.free(1, &mut unit).unwrap();

		let mut spots = SpotList::new();
		spots.add(Spot::contract(4, 3)).unwrap();
		let mut bi = Vec::new();
		let mut bo = Vec::new();
		let new_n = accommodate(&fl, 12, spots, None, &mut bi, &mut bo).unwrap();
		assert_eq!(new_n, 9);
		assert_eq!(fl.file().size().unwrap(), 18);

		let fl = reopen(&fl, 9);
		assert_eq!(block(&fl, 0, 9), vec![1, 2, 3, 4, 8, 9, 10, 11, 12]);
		// The gap keeps its chain word.
		let gap = block(&fl, 1, 9);
		assert!(is_gap_marker(gap[0]));
		assert_eq!(fl.gaps().unwrap(), vec![1]);
	}

	#[test]
	fn contraction_clamps_to_minimum_block() {
		let fl = space("clamp", 8);
		fill(&fl, &[&[1, 2, 3, 4, 5, 6, 7, 8]]);
		let mut spots = SpotList::new();
		spots.add(Spot::contract(2, 2)).unwrap();
		let mut bi = Vec::new();
		let mut bo = Vec::new();
		// Content shrinks to 6, the block stays at the 8-byte minimum.
		let new_n = accommodate(&fl, 8, spots, None, &mut bi, &mut bo).unwrap();
		assert_eq!(new_n, 8);
		let fl = reopen(&fl, 8);
		assert_eq!(block(&fl, 0, 8), vec![1, 2, 5, 6, 7, 8, 0, 0]);
	}

	#[test]
	fn expansion_absorbed_by_excess() {
		// Content is 6 of an 8-byte block, leaving 2 bytes of excess.
		let fl = space("absorb", 8);
		fill(&fl, &[&[1, 2, 3, 4, 5, 6, 0, 0]]);
		let mut spots = SpotList::new();
		spots.add(Spot::expand(2, 2)).unwrap();
		let mut bi = Vec::new();
		let mut bo = Vec::new();
		let new_n = accommodate(&fl, 6, spots, None, &mut bi, &mut bo).unwrap();
		assert_eq!(new_n, 8);
		let fl = reopen(&fl, 8);
		assert_eq!(block(&fl, 0, 8), vec![1, 2, 0, 0, 3, 4, 5, 6]);
	}

	#[test]
	fn expansion_through_side_file() {
		let fl = space("grow", 8);
		fill(&fl, &[
			&[1, 2, 3, 4, 5, 6, 7, 8],
			&[11, 12, 13, 14, 15, 16, 17, 18],
		]);
		let mut unit = NoUnit;
		fl.free(0, &mut unit).unwrap();
		let mut spots = SpotList::new();
		spots.add(Spot::expand(8, 2)).unwrap();
		let mut bi = Vec::new();
		let mut bo = Vec::new();
		let new_n = accommodate(&fl, 8, spots, None, &mut bi, &mut bo).unwrap();
		assert_eq!(new_n, 10);
		let fl = reopen(&fl, 10);
		assert_eq!(fl.file().size().unwrap(), 20);
		let gap = block(&fl, 0, 10);
		assert!(is_gap_marker(gap[0]));
		assert_eq!(fl.gaps().unwrap(), vec![0]);
		assert_eq!(block(&fl, 1, 10), vec![11, 12, 13, 14, 15, 16, 17, 18, 0, 0]);
	}

	#[test]
	fn general_path_updates_and_presents() {
		let fl = space("general", 10);
		fill(&fl, &[
			&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10],
			&[21, 22, 23, 24, 25, 26, 27, 28, 29, 30],
		]);
		let mut seen = Vec::new();
		let mut spots = SpotList::new();
		// Replace bytes 2..4 with their sum, cutting one byte.
		spots.add(Spot {
			pos: 2,
			c_len: -1,
			updater: Some(Updater {
				len: 1,
				write: Box::new(|old, out| {
					out[0] = old[2] + old[3];
					Ok(())
				}),
			}),
		}).unwrap();
		// Insert two zero bytes before the last content byte.
		spots.add(Spot::expand(9, 2)).unwrap();
		let mut bi = Vec::new();
		let mut bo = Vec::new();
		let new_n = {
			let mut presenter = |old: &[u8]| {
				seen.push(old[0]);
				Ok(())
			};
			accommodate(&fl, 10, spots, Some(&mut presenter), &mut bi, &mut bo).unwrap()
		};
		assert_eq!(new_n, 11);
		assert_eq!(seen, vec![1, 21]);
		let fl = reopen(&fl, 11);
		assert_eq!(block(&fl, 0, 11), vec![1, 2, 7, 5, 6, 7, 8, 9, 0, 0, 10]);
		assert_eq!(block(&fl, 1, 11), vec![21, 22, 47, 25, 26, 27, 28, 29, 0, 0, 30]);
	}
}
