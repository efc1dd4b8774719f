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

// Integrity checks. The engine tries never to create the states these
// detect; they exist for crash forensics and for the test suite.

use std::collections::HashMap;
use crate::{
	codec,
	error::{Error, Result},
	fl_space::is_gap_marker,
	reader::FlScanner,
	store::WrStore,
	treap::IntervalTreap,
	unit::NoUnit,
	util,
	vl_space::START,
};

/// Verifies one store:
/// - the file is a whole number of blocks;
/// - the gap chain and the gap marker bits agree;
/// - every live area of the VL file lies inside the payload region and no
///   two overlap;
/// - the deallocation counter agrees with the live byte total (repaired via
///   `correct_m` when `fix` is set);
/// - every reference counter equals the number of inbound references.
pub fn verify_store(stores: &[WrStore], table: usize, fix: bool) -> Result<()> {
	let store = &stores[table];
	let n = store.fl().block_size();
	let size = if store.fl().file().path().exists() { store.fl().file().size()? } else { 0 };
	if size != store.fl().block_count() * n {
		return Err(Error::Corruption(format!(
			"table {}: file size {} is not {} blocks of {} bytes",
			store.name(), size, store.fl().block_count(), n
		)));
	}

	// Gap duality.
	let chain = store.fl().gaps()?;
	let mut scanned = Vec::new();
	let mut first = [0u8];
	for index in 0..store.fl().block_count() {
		store.fl().file().read_at(&mut first, store.fl().index_to_pos(index))?;
		if is_gap_marker(first[0]) {
			scanned.push(index);
		}
	}
	if chain != scanned {
		return Err(Error::Corruption(format!(
			"table {}: gap chain {:?} does not match the marker bits {:?}",
			store.name(), chain, scanned
		)));
	}

	// VL accounting.
	if let Some(vl) = store.vl() {
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
				if ptr + len > vl.end() {
					return Err(Error::Corruption(format!(
						"table {} row {}: area [{}, {}) beyond the VL end {}",
						store.name(), index + 1, ptr, ptr + len, vl.end()
					)));
				}
				treap.insert(ptr, len)?;
			}
		}
		let live = treap.total();
		if vl.end() - START - vl.deallocated() != live {
			if fix {
				log::warn!(target: "rowdb", "{}: correcting m, {} live bytes", store.name(), live);
				vl.correct_m(live, &mut NoUnit)?;
			} else {
				return Err(Error::Corruption(format!(
					"table {}: {} live VL bytes, accounting says {}",
					store.name(), live, vl.end() - START - vl.deallocated()
				)));
			}
		}
	}

	// Reference counter correctness.
	if store.nobs_ref_count() > 0 {
		let mut inbound: HashMap<u64, u64> = HashMap::new();
		for referrer in stores {
			let ctx = referrer.codec_ctx(stores, None);
			let cols: Vec<_> = referrer
				.columns()
				.iter()
				.filter(|ci| ci.target == Some(table))
				.cloned()
				.collect();
			if cols.is_empty() {
				continue;
			}
			let mut scanner = FlScanner::new(referrer.fl(), crate::db::BUNCH_BYTES);
			while let Some((_, block)) = scanner.next()? {
				if is_gap_marker(block[0]) {
					continue;
				}
				let bitmap = util::read_uint(block, referrer.n_bm());
				for ci in &cols {
					for r in codec::stored_refs(&ctx, ci, bitmap, block)? {
						*inbound.entry(r).or_insert(0) += 1;
					}
				}
			}
		}
		let mut scanner = FlScanner::new(store.fl(), crate::db::BUNCH_BYTES);
		while let Some((index, block)) = scanner.next()? {
			if is_gap_marker(block[0]) {
				continue;
			}
			let stored = util::read_uint(&block[store.n_bm()..], store.nobs_ref_count());
			let counted = inbound.get(&(index + 1)).copied().unwrap_or(0);
			if stored != counted {
				return Err(Error::Corruption(format!(
					"table {} row {}: stored reference count {}, found {} inbound references",
					store.name(), index + 1, stored, counted
				)));
			}
		}
		for (&r, _) in &inbound {
			if r == 0 || r > store.fl().block_count() {
				return Err(Error::Corruption(format!(
					"table {}: reference to nonexistent row {}", store.name(), r
				)));
			}
			if store.fl().is_gap(r - 1)? {
				return Err(Error::Corruption(format!(
					"table {}: reference to the row gap {}", store.name(), r
				)));
			}
		}
	}
	log::debug!(target: "rowdb", "{}: verified", store.name());
	Ok(())
}
