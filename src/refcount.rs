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

// Referenced-row counters.
//
// A referenced table stores an inbound-reference counter in every row block,
// right after the bitmap. Write operations accumulate per-target-row deltas
// while converting values and apply the net result in one pass, so a row
// moved from one slot of a reference array to another never sees a spurious
// transition through zero or the maximum.

use std::collections::HashMap;
use crate::{
	error::{Error, Result},
	fl_space::is_gap_marker,
	store::WrStore,
	unit::Unit,
	util,
};

/// Net reference-count changes keyed by `(table index, 1-based row)`.
#[derive(Default)]
pub struct RefDeltas {
	map: HashMap<(usize, u64), i64>,
}

impl RefDeltas {
	pub fn new() -> RefDeltas {
		Default::default()
	}

	pub fn add(&mut self, table: usize, row: u64, delta: i64) {
		*self.map.entry((table, row)).or_insert(0) += delta;
	}

	pub fn is_empty(&self) -> bool {
		self.map.values().all(|&d| d == 0)
	}
}

/// Fails unless `row` is an existing, live row of `store`.
pub fn validate_target(store: &WrStore, row: u64) -> Result<()> {
	if row < 1 || row > store.fl().block_count() {
		return Err(Error::IllegalReference(format!(
			"row {} does not exist in table {}", row, store.name()
		)));
	}
	let mut first = [0u8];
	store.fl().file().read_at(&mut first, store.fl().index_to_pos(row - 1))?;
	if is_gap_marker(first[0]) {
		return Err(Error::IllegalReference(format!(
			"row {} of table {} is a gap", row, store.name()
		)));
	}
	Ok(())
}

/// Reads the stored counter of a live row.
pub fn read_count(store: &WrStore, row: u64) -> Result<u64> {
	let w = store.nobs_ref_count();
	if w == 0 {
		return Ok(0);
	}
	let mut buf = [0u8; 8];
	let pos = store.fl().index_to_pos(row - 1) + store.n_bm() as u64;
	store.fl().file().read_at(&mut buf[..w], pos)?;
	Ok(util::read_uint(&buf, w))
}

/// Applies the accumulated deltas. Counters never underflow (that would mean
/// the stored state already violates referential integrity) and never exceed
/// the configured width.
pub fn apply(stores: &[WrStore], deltas: &RefDeltas, unit: &mut dyn Unit) -> Result<()> {
	let mut buf = [0u8; 8];
	for (&(table, row), &delta) in &deltas.map {
		if delta == 0 {
			continue;
		}
		let store = &stores[table];
		let w = store.nobs_ref_count();
		if w == 0 {
			return Err(Error::Corruption(format!(
				"table {} is referenced but has no reference counter", store.name()
			)));
		}
		let pos = store.fl().index_to_pos(row - 1) + store.n_bm() as u64;
		store.fl().file().read_at(&mut buf[..w], pos)?;
		let old = util::read_uint(&buf, w);
		let new = old as i64 + delta;
		if new < 0 {
			return Err(Error::Corruption(format!(
				"reference counter of row {} in table {} would underflow", row, store.name()
			)));
		}
		if new as u64 > util::max_value(w) {
			return Err(Error::Maximum(format!(
				"reference counter of row {} in table {} exceeds its {}-byte width", row, store.name(), w
			)));
		}
		unit.record_before(store.fl().file(), pos, &buf[..w])?;
		util::write_uint(&mut buf, new as u64, w);
		store.fl().file().write_at(&buf[..w], pos)?;
		unit.force(store.fl().file());
		log::trace!(target: "rowdb", "{}: row {} refcount {} -> {}", store.name(), row, old, new);
	}
	Ok(())
}
