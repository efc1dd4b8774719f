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

// Column lifecycle: inserting, removing and modifying columns, changing a
// table's row-reference width, and installing or removing the inbound
// reference counter of a referenced table.
//
// Every operation builds a spot specification over the old block layout and
// hands it to the accommodation engine. The caller saves the layout and
// reopens the stores afterwards; reference-count deltas produced against
// rewritten geometry are applied only after the reopen.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use crate::{
	accommodate::{accommodate, Presenter, Spot, SpotList, Updater},
	codec::{self, CodecCtx},
	crypto::Cipher,
	error::{Error, Result},
	file::DataFile,
	layout::Layout,
	refcount::RefDeltas,
	store::{self, ColumnInfo, StoreTarget, WrStore},
	types::{Column, ColumnType, Scheme},
	unit::NoUnit,
	util,
	value::Value,
	vl_space::{VlFileSpace, NULL_PTR, START},
};

/// Width given to newly installed reference counters and newly created VL
/// pointer fields.
pub const DEFAULT_NOBS: usize = 8;

pub struct SchemaCtx<'a> {
	pub dir: &'a std::path::Path,
	pub layout: &'a mut Layout,
	pub defs: &'a mut [Vec<Column>],
	pub stores: &'a [WrStore],
	pub cipher: Option<&'a dyn Cipher>,
	pub shutdown: &'a Arc<AtomicBool>,
	pub buf1: &'a mut Vec<u8>,
	pub buf2: &'a mut Vec<u8>,
}

impl<'a> SchemaCtx<'a> {
	fn table_index(&self, name: &str) -> Result<usize> {
		self.layout
			.tables
			.iter()
			.position(|t| t.name == name)
			.ok_or_else(|| Error::InvalidConfiguration(format!("unknown table {}", name)))
	}

	fn targets(&self) -> HashMap<String, StoreTarget> {
		self.layout
			.tables
			.iter()
			.enumerate()
			.map(|(i, t)| (t.name.clone(), StoreTarget { index: i, nobs_row_ref: t.nobs_row_ref }))
			.collect()
	}

	/// Whether any column of any table references `name`, with table
	/// `table`'s definition replaced by `defs`.
	fn referenced_with(&self, name: &str, table: usize, defs: &[Column]) -> bool {
		self.defs
			.iter()
			.enumerate()
			.flat_map(|(i, d)| if i == table { defs.iter() } else { d.iter() })
			.any(|c| c.ty.references() == Some(name))
	}
}

fn old_content(store: &WrStore) -> u64 {
	store.n() - store.n_e() as u64
}

/// Describes how the block header changes: bitmap width, null-bit
/// remapping, and the reference-counter width.
struct HeaderPlan<'a> {
	old_n_bm: usize,
	old_w: usize,
	new_n_bm: usize,
	new_w: usize,
	/// `(old mask, new mask)` for every surviving null-info column.
	remap: Vec<(u64, u64)>,
	/// Sets the changed column's bit from a per-row test.
	modified: Option<(u64, Box<dyn FnMut(&[u8]) -> Result<bool> + 'a>)>,
}

impl<'a> HeaderPlan<'a> {
	fn is_identity(&self) -> bool {
		self.old_n_bm == self.new_n_bm
			&& self.old_w == self.new_w
			&& self.modified.is_none()
			&& self.remap.iter().all(|(o, n)| o == n)
	}

	fn into_spot(mut self) -> Option<Spot<'a>> {
		if self.is_identity() {
			return None;
		}
		let c_len = (self.new_n_bm + self.new_w) as i64 - (self.old_n_bm + self.old_w) as i64;
		let len = self.new_n_bm + self.new_w;
		let write = Box::new(move |old: &[u8], out: &mut [u8]| -> Result<()> {
			let old_bitmap = util::read_uint(old, self.old_n_bm);
			let mut bitmap = 0u64;
			for &(om, nm) in &self.remap {
				if old_bitmap & om != 0 {
					bitmap |= nm;
				}
			}
			if let Some((mask, test)) = self.modified.as_mut() {
				if test(old)? {
					bitmap |= *mask;
				}
			}
			util::write_uint(out, bitmap, self.new_n_bm);
			if self.new_w > 0 {
				let count = if self.old_w > 0 {
					util::read_uint(&old[self.old_n_bm..], self.old_w)
				} else {
					0
				};
				if count > util::max_value(self.new_w) {
					return Err(Error::Maximum(format!(
						"reference counter {} does not fit {} bytes", count, self.new_w
					)));
				}
				util::write_uint(&mut out[self.new_n_bm..], count, self.new_w);
			}
			Ok(())
		});
		Some(Spot { pos: 0, c_len, updater: Some(Updater { len, write }) })
	}
}

/// Builds the null-bit remapping between two column sets related by
/// `new_index_of` (`None` when the old column is dropped or re-handled).
fn remap_bits<F: Fn(usize) -> Option<usize>>(
	old_cols: &[ColumnInfo],
	new_cols: &[ColumnInfo],
	new_index_of: F,
) -> Vec<(u64, u64)> {
	let mut remap = Vec::new();
	for (k, old) in old_cols.iter().enumerate() {
		if old.null_mask == 0 {
			continue;
		}
		if let Some(nk) = new_index_of(k) {
			if new_cols[nk].null_mask != 0 {
				remap.push((old.null_mask, new_cols[nk].null_mask));
			}
		}
	}
	remap
}

/// Expands, contracts or installs the reference-counter field of a table
/// that is not otherwise being rewritten. Installed counters start at zero;
/// a counter is only removed once nothing references the table, when every
/// stored count is zero already.
fn resize_ref_count(ctx: &mut SchemaCtx, table: usize, new_w: usize) -> Result<()> {
	let store = &ctx.stores[table];
	let old_w = store.nobs_ref_count();
	if old_w == new_w {
		return Ok(());
	}
	let mut spots = SpotList::new();
	if old_w == 0 {
		spots.add(Spot::expand(store.n_bm() as u64, new_w as u64))?;
	} else if new_w == 0 {
		spots.add(Spot::contract(store.n_bm() as u64, old_w as u64))?;
	} else {
		let plan = HeaderPlan {
			old_n_bm: store.n_bm(),
			old_w,
			new_n_bm: store.n_bm(),
			new_w,
			remap: store
				.columns()
				.iter()
				.filter(|c| c.null_mask != 0)
				.map(|c| (c.null_mask, c.null_mask))
				.collect(),
			modified: None,
		};
		if let Some(spot) = plan.into_spot() {
			spots.add(spot)?;
		}
	}
	accommodate(store.fl(), old_content(store), spots, None, ctx.buf1, ctx.buf2)?;
	ctx.layout.tables[table].nobs_ref_count = if new_w == 0 { None } else { Some(new_w) };
	log::info!(target: "rowdb", "{}: reference counter width {} -> {}", store.name(), old_w, new_w);
	Ok(())
}

/// Removes the reference counter of a table that lost its last referencing
/// column, after the decrements have been applied.
pub fn remove_ref_count(ctx: &mut SchemaCtx, table: usize) -> Result<()> {
	resize_ref_count(ctx, table, 0)
}

/// Opens and registers the VL space of a table gaining its first outrow
/// column.
fn create_vl(ctx: &mut SchemaCtx, table: usize) -> Result<VlFileSpace> {
	let name = ctx.layout.tables[table].name.clone();
	let rel = format!("{}.vl", name);
	let file = DataFile::new(ctx.dir.join(&rel), ctx.shutdown.clone(), false);
	let vl = VlFileSpace::open(file, DEFAULT_NOBS)?;
	let lt = &mut ctx.layout.tables[table];
	lt.vl_data_file = Some(rel);
	lt.nobs_outrow_ptr = Some(DEFAULT_NOBS);
	Ok(vl)
}

/// Inserts a column at `position`, writing `init` into every existing row.
/// Returns the reference-count deltas to apply once the stores are
/// reopened.
pub fn insert_column(
	ctx: &mut SchemaCtx,
	table: usize,
	position: usize,
	column: Column,
	init: Value,
) -> Result<RefDeltas> {
	column.ty.validate()?;
	if position > ctx.defs[table].len() {
		return Err(Error::Validation(format!(
			"position {} beyond the {} columns", position, ctx.defs[table].len()
		)));
	}
	if ctx.defs[table].iter().any(|c| c.name == column.name) {
		return Err(Error::Validation(format!(
			"table {} already has a column {}", ctx.layout.tables[table].name, column.name
		)));
	}

	// A reference column may newly require a counter on its target. For the
	// table itself it folds into the header rewrite below; for another
	// table it runs after this table's rewrite, so the per-row reference
	// validation still sees the target's current geometry.
	let mut self_new_w = ctx.stores[table].nobs_ref_count();
	let mut install_on: Option<usize> = None;
	if let Some(target_name) = column.ty.references().map(|s| s.to_string()) {
		let ti = ctx.table_index(&target_name)?;
		if ctx.layout.tables[ti].nobs_ref_count.is_none() {
			if ti == table {
				self_new_w = DEFAULT_NOBS;
				ctx.layout.tables[ti].nobs_ref_count = Some(DEFAULT_NOBS);
			} else {
				install_on = Some(ti);
			}
		}
	}

	// The first outrow column brings the VL file with it.
	let store = &ctx.stores[table];
	let had_outrow = ctx.defs[table].iter().any(|c| c.ty.has_outrow());
	let mut created_vl = None;
	let nobs_outrow_ptr = if column.ty.has_outrow() && !had_outrow {
		created_vl = Some(create_vl(ctx, table)?);
		DEFAULT_NOBS
	} else {
		store.nobs_outrow_ptr()
	};
	let store = &ctx.stores[table];

	let mut new_defs = ctx.defs[table].clone();
	new_defs.insert(position, column);
	let targets = ctx.targets();
	let (new_cols, new_n_bm, _, _) = store::geometry(&new_defs, &targets, nobs_outrow_ptr, self_new_w)?;
	let new_ci = new_cols[position].clone();

	let codec_ctx = CodecCtx {
		stores: ctx.stores,
		vl: created_vl.as_ref().or_else(|| store.vl()),
		nobs_outrow_ptr,
		cipher: ctx.cipher,
	};

	// A null init the column cannot hold is rejected before anything is
	// rewritten. Bad non-null inits abort inside the side-file rewrite,
	// which leaves the original file untouched.
	if init.is_null() {
		let mut probe = RefDeltas::new();
		let mut scratch = vec![0u8; new_ci.len as usize];
		let mut local = new_ci.clone();
		local.offset = 0;
		codec::to_bytes(&codec_ctx, &local, &init, 0, None, &mut probe, &mut NoUnit, &mut scratch)?;
	}

	let mut deltas = RefDeltas::new();
	let mut spots = SpotList::new();
	let plan = HeaderPlan {
		old_n_bm: store.n_bm(),
		old_w: store.nobs_ref_count(),
		new_n_bm,
		new_w: self_new_w,
		remap: remap_bits(store.columns(), &new_cols, |k| {
			Some(if k < position { k } else { k + 1 })
		}),
		modified: if new_ci.null_mask != 0 && init.is_null() {
			Some((new_ci.null_mask, Box::new(|_old: &[u8]| Ok(true))))
		} else {
			None
		},
	};
	if let Some(spot) = plan.into_spot() {
		spots.add(spot)?;
	}

	let insert_pos = if position < store.columns().len() {
		store.columns()[position].offset
	} else {
		old_content(store)
	};
	{
		let mut local = new_ci.clone();
		local.offset = 0;
		let init = init.clone();
		let deltas_ref = &mut deltas;
		spots.add(Spot {
			pos: insert_pos,
			c_len: new_ci.len as i64,
			updater: Some(Updater {
				len: new_ci.len as usize,
				write: Box::new(move |_old: &[u8], out: &mut [u8]| {
					codec::to_bytes(&codec_ctx, &local, &init, 0, None, deltas_ref, &mut NoUnit, out)?;
					Ok(())
				}),
			}),
		})?;
		accommodate(store.fl(), old_content(store), spots, None, ctx.buf1, ctx.buf2)?;
	}
	if let Some(ti) = install_on {
		resize_ref_count(ctx, ti, DEFAULT_NOBS)?;
	}
	log::info!(target: "rowdb", "{}: inserted column {} at {}",
		ctx.layout.tables[table].name, new_defs[position].name, position);
	ctx.defs[table] = new_defs;
	Ok(deltas)
}

/// Removes a column. Reference counters of rows the column pointed at are
/// decremented, outrow payload is deallocated, and a counter or VL file
/// that loses its last user disappears with the column.
pub fn remove_column(ctx: &mut SchemaCtx, table: usize, col: usize) -> Result<()> {
	let store = &ctx.stores[table];
	if col >= store.columns().len() {
		return Err(Error::Validation(format!("table {} has no column {}", store.name(), col)));
	}
	if store.columns().len() == 1 {
		return Err(Error::Validation(format!(
			"cannot remove the only column of table {}", store.name()
		)));
	}
	let ci = store.columns()[col].clone();
	let self_name = store.name().to_string();

	// Null out self references through the regular update path first: rows
	// already copied into the side file must not be decremented again.
	if ci.ty.references() == Some(self_name.as_str()) {
		for index in 0..store.fl().block_count() {
			if store.fl().is_gap(index)? {
				continue;
			}
			store.update(ctx.stores, index + 1, &[(col, Value::Null)], ctx.cipher, &mut NoUnit)?;
		}
	}

	let mut new_defs = ctx.defs[table].clone();
	new_defs.remove(col);

	let self_new_w = if ctx.referenced_with(&self_name, table, &new_defs) {
		store.nobs_ref_count()
	} else {
		0
	};
	if self_new_w == 0 && store.nobs_ref_count() != 0 {
		ctx.layout.tables[table].nobs_ref_count = None;
	}

	let still_outrow = new_defs.iter().any(|c| c.ty.has_outrow());
	let drop_vl = ci.ty.has_outrow() && !still_outrow;
	let nobs_outrow_ptr = if still_outrow { store.nobs_outrow_ptr() } else { 0 };

	let targets = ctx.targets();
	let (new_cols, new_n_bm, _, _) = store::geometry(&new_defs, &targets, nobs_outrow_ptr, self_new_w)?;

	let mut spots = SpotList::new();
	let plan = HeaderPlan {
		old_n_bm: store.n_bm(),
		old_w: store.nobs_ref_count(),
		new_n_bm,
		new_w: self_new_w,
		remap: remap_bits(store.columns(), &new_cols, |k| {
			if k == col {
				None
			} else if k < col {
				Some(k)
			} else {
				Some(k - 1)
			}
		}),
		modified: None,
	};
	if let Some(spot) = plan.into_spot() {
		spots.add(spot)?;
	}
	spots.add(Spot::contract(ci.offset, ci.len))?;

	let dec_refs = ci.ty.references().is_some() && ci.ty.references() != Some(self_name.as_str());
	let dealloc = ci.ty.has_outrow() && !drop_vl;
	let mut deltas = RefDeltas::new();
	{
		let codec_ctx = store.codec_ctx(ctx.stores, ctx.cipher);
		let n_bm = store.n_bm();
		let deltas_ref = &mut deltas;
		let ci_ref = &ci;
		let mut presenter = move |old: &[u8]| -> Result<()> {
			let bitmap = util::read_uint(old, n_bm);
			if dec_refs {
				for r in codec::stored_refs(&codec_ctx, ci_ref, bitmap, old)? {
					deltas_ref.add(ci_ref.target.unwrap_or(0), r, -1);
				}
			}
			if dealloc {
				let (len, ptr) = codec::outrow_fields(ci_ref, old, codec_ctx.nobs_outrow_ptr);
				if ptr >= START {
					if let Some(vl) = codec_ctx.vl {
						vl.deallocate(len, &mut NoUnit)?;
					}
				}
			}
			Ok(())
		};
		let presenter_opt: Option<&mut Presenter<'_>> = if dec_refs || dealloc {
			Some(&mut presenter)
		} else {
			None
		};
		accommodate(store.fl(), old_content(store), spots, presenter_opt, ctx.buf1, ctx.buf2)?;
	}
	// Counter decrements land on other tables whose geometry is untouched,
	// so the still-open stores are the right targets.
	crate::refcount::apply(ctx.stores, &deltas, &mut NoUnit)?;

	if drop_vl {
		if let Some(vl) = store.vl() {
			vl.file().delete()?;
		}
		let lt = &mut ctx.layout.tables[table];
		lt.vl_data_file = None;
		lt.nobs_outrow_ptr = None;
	}
	ctx.defs[table] = new_defs;

	// The removed column may have been the last one referencing its target.
	if let Some(target_name) = ci.ty.references() {
		if target_name != self_name && !ctx.referenced_with(target_name, table, &ctx.defs[table].clone()) {
			let ti = ctx.table_index(target_name)?;
			resize_ref_count(ctx, ti, 0)?;
		}
	}
	log::info!(target: "rowdb", "{}: removed column {}", self_name, ci.name);
	Ok(())
}

/// Per-row null test of an existing column against its old encoding.
fn null_test(store: &WrStore, ci: ColumnInfo) -> Box<dyn FnMut(&[u8]) -> Result<bool>> {
	let n_bm = store.n_bm();
	let ptr_w = store.nobs_outrow_ptr();
	Box::new(move |old: &[u8]| {
		if ci.null_mask != 0 {
			return Ok(util::read_uint(old, n_bm) & ci.null_mask != 0);
		}
		match &ci.ty {
			ColumnType::Reference { .. } => {
				Ok(util::read_uint(&old[ci.offset as usize..], ci.target_nobs) == 0)
			}
			t if t.has_outrow() => {
				let (len, ptr) = codec::outrow_fields(&ci, old, ptr_w);
				Ok(len == 0 && ptr == NULL_PTR)
			}
			_ => Ok(false),
		}
	})
}

/// The value changer applied by `modify_column`.
pub type ValueChanger<'a> = dyn Fn(Value) -> Result<Value> + 'a;

fn same_value_shape(old: &ColumnInfo, new: &ColumnInfo) -> bool {
	match (&old.ty, &new.ty) {
		(ColumnType::Simple(a), ColumnType::Simple(b)) => {
			a.kind == b.kind && a.scheme == b.scheme && a.length == b.length && a.variable == b.variable
		}
		_ => false,
	}
}

/// Changes a column's type in place, converting every stored value. With a
/// `changer` the old value is read, transformed and re-encoded; without one
/// the stored value must be losslessly representable in the new type.
///
/// Returns the reference-count deltas to apply after the stores reopen,
/// and the index of a table whose counter must be removed once they have
/// been applied (the old target, when this column was the last to
/// reference it).
pub fn modify_column(
	ctx: &mut SchemaCtx,
	table: usize,
	col: usize,
	new_column: Column,
	changer: Option<&ValueChanger<'_>>,
) -> Result<(RefDeltas, Option<usize>)> {
	new_column.ty.validate()?;
	let store = &ctx.stores[table];
	if col >= store.columns().len() {
		return Err(Error::Validation(format!("table {} has no column {}", store.name(), col)));
	}
	let old_ci = store.columns()[col].clone();
	let self_name = store.name().to_string();
	let old_target = old_ci.ty.references().map(|s| s.to_string());
	let new_target = new_column.ty.references().map(|s| s.to_string());

	let mut new_defs = ctx.defs[table].clone();
	new_defs[col] = new_column;

	// Keep, install or drop this table's own counter.
	let self_new_w = if ctx.referenced_with(&self_name, table, &new_defs) {
		if store.nobs_ref_count() == 0 { DEFAULT_NOBS } else { store.nobs_ref_count() }
	} else {
		0
	};
	ctx.layout.tables[table].nobs_ref_count = if self_new_w == 0 { None } else { Some(self_new_w) };

	// A counter on a newly referenced other table is installed after this
	// table's rewrite, so the per-row reference validation still sees the
	// target's current geometry.
	let mut install_on: Option<usize> = None;
	if let Some(t) = new_target.clone() {
		if t != self_name {
			let ti = ctx.table_index(&t)?;
			if ctx.layout.tables[ti].nobs_ref_count.is_none() {
				install_on = Some(ti);
			}
		}
	}
	let store = &ctx.stores[table];

	let had_outrow = ctx.defs[table].iter().any(|c| c.ty.has_outrow());
	let still_outrow = new_defs.iter().any(|c| c.ty.has_outrow());
	let mut created_vl = None;
	let mut drop_vl = false;
	let nobs_outrow_ptr = match (had_outrow, still_outrow) {
		(false, true) => {
			created_vl = Some(create_vl(ctx, table)?);
			DEFAULT_NOBS
		}
		(true, false) => {
			drop_vl = true;
			0
		}
		_ => store.nobs_outrow_ptr(),
	};
	let store = &ctx.stores[table];

	let targets = ctx.targets();
	let (new_cols, new_n_bm, _, _) = store::geometry(&new_defs, &targets, nobs_outrow_ptr, self_new_w)?;
	let new_ci = new_cols[col].clone();

	let mut deltas = RefDeltas::new();
	{
		let n_bm = store.n_bm();
		let old_codec = store.codec_ctx(ctx.stores, ctx.cipher);
		let new_codec = CodecCtx {
			stores: ctx.stores,
			vl: created_vl.as_ref().or_else(|| if drop_vl { None } else { store.vl() }),
			nobs_outrow_ptr,
			cipher: ctx.cipher,
		};

		// Per-row read-and-transform shared by the header and column
		// updaters.
		let convert = {
			let old_ci = old_ci.clone();
			move |old: &[u8]| -> Result<Value> {
				let bitmap = util::read_uint(old, n_bm);
				let value = codec::from_bytes(&old_codec, &old_ci, bitmap, old)?;
				match changer {
					Some(f) => f(value),
					None => Ok(value),
				}
			}
		};

		// A pure nullability change leaves the column bytes alone.
		let pure_header = changer.is_none()
			&& same_value_shape(&old_ci, &new_ci)
			&& old_ci.len == new_ci.len;

		let mut spots = SpotList::new();
		let plan = HeaderPlan {
			old_n_bm: store.n_bm(),
			old_w: store.nobs_ref_count(),
			new_n_bm,
			new_w: self_new_w,
			remap: remap_bits(store.columns(), &new_cols, |k| {
				if k == col { None } else { Some(k) }
			}),
			modified: if new_ci.null_mask != 0 {
				let test: Box<dyn FnMut(&[u8]) -> Result<bool>> = if pure_header {
					null_test(store, old_ci.clone())
				} else {
					let convert = convert.clone();
					Box::new(move |old: &[u8]| Ok(convert(old)?.is_null()))
				};
				Some((new_ci.null_mask, test))
			} else {
				None
			},
		};
		if let Some(spot) = plan.into_spot() {
			spots.add(spot)?;
		}

		if pure_header {
			// Narrowing to non-nullable must not meet a stored null, whether
			// it was encoded as a bitmap bit or as a zero length and pointer.
			let old_nullable = matches!(&old_ci.ty, ColumnType::Simple(st) if st.nullable);
			let new_nullable = matches!(&new_ci.ty, ColumnType::Simple(st) if st.nullable);
			let narrowing = old_nullable && !new_nullable;
			if narrowing {
				let mut test = null_test(store, old_ci.clone());
				let name = old_ci.name.clone();
				let mut presenter = move |old: &[u8]| -> Result<()> {
					if test(old)? {
						return Err(Error::Validation(format!(
							"column {} stores a null and cannot become non-nullable", name
						)));
					}
					Ok(())
				};
				accommodate(store.fl(), old_content(store), spots, Some(&mut presenter), ctx.buf1, ctx.buf2)?;
			} else if !spots.is_empty() {
				accommodate(store.fl(), old_content(store), spots, None, ctx.buf1, ctx.buf2)?;
			}
		} else {
			let old_codec2 = store.codec_ctx(ctx.stores, ctx.cipher);
			let old_ci2 = old_ci.clone();
			let mut local = new_ci.clone();
			local.offset = 0;
			let deltas_ref = &mut deltas;
			let convert2 = convert.clone();
			spots.add(Spot {
				pos: old_ci.offset,
				c_len: new_ci.len as i64 - old_ci.len as i64,
				updater: Some(Updater {
					len: new_ci.len as usize,
					write: Box::new(move |old: &[u8], out: &mut [u8]| {
						let bitmap = util::read_uint(old, n_bm);
						// The old encoding's references and payload die with
						// the rewrite.
						for r in codec::stored_refs(&old_codec2, &old_ci2, bitmap, old)? {
							deltas_ref.add(old_ci2.target.unwrap_or(0), r, -1);
						}
						if old_ci2.ty.has_outrow() && !drop_vl {
							let (len, ptr) = codec::outrow_fields(&old_ci2, old, old_codec2.nobs_outrow_ptr);
							if ptr >= START {
								if let Some(vl) = old_codec2.vl {
									vl.deallocate(len, &mut NoUnit)?;
								}
							}
						}
						let value = convert2(old)?;
						codec::to_bytes(&new_codec, &local, &value, 0, None, deltas_ref, &mut NoUnit, out)?;
						Ok(())
					}),
				}),
			})?;
			accommodate(store.fl(), old_content(store), spots, None, ctx.buf1, ctx.buf2)?;
		}
	}

	if drop_vl {
		if let Some(vl) = store.vl() {
			vl.file().delete()?;
		}
		let lt = &mut ctx.layout.tables[table];
		lt.vl_data_file = None;
		lt.nobs_outrow_ptr = None;
	}
	ctx.defs[table] = new_defs;
	if let Some(ti) = install_on {
		resize_ref_count(ctx, ti, DEFAULT_NOBS)?;
	}

	// A target that lost its last referencing column drops its counter,
	// but only once the decrements above have been applied: the caller
	// runs that removal after the reopen.
	let mut drop_counter_of = None;
	if let Some(t) = old_target {
		if t != self_name && Some(&t) != new_target.as_ref()
			&& !ctx.referenced_with(&t, table, &ctx.defs[table].clone())
		{
			drop_counter_of = Some(ctx.table_index(&t)?);
		}
	}
	log::info!(target: "rowdb", "{}: modified column {}", self_name, old_ci.name);
	Ok((deltas, drop_counter_of))
}

/// Changes the row-reference width of `table`, re-encoding every reference
/// column that points at it, in every table.
pub fn change_row_ref_width(ctx: &mut SchemaCtx, table: usize, new_w: usize) -> Result<()> {
	if new_w < 1 || new_w > 8 {
		return Err(Error::Validation(format!("reference width {} outside 1..=8", new_w)));
	}
	let name = ctx.layout.tables[table].name.clone();
	let old_w = ctx.layout.tables[table].nobs_row_ref;
	if old_w == new_w {
		return Ok(());
	}
	if ctx.stores[table].fl().block_count() > util::max_value(new_w) {
		return Err(Error::Validation(format!(
			"table {} has {} blocks, too many for {} reference bytes",
			name, ctx.stores[table].fl().block_count(), new_w
		)));
	}
	ctx.layout.tables[table].nobs_row_ref = new_w;
	let targets = ctx.targets();

	for u in 0..ctx.defs.len() {
		if !ctx.defs[u].iter().any(|c| c.ty.references() == Some(name.as_str())) {
			continue;
		}
		let store = &ctx.stores[u];
		let (new_cols, _, _, _) = store::geometry(
			&ctx.defs[u],
			&targets,
			store.nobs_outrow_ptr(),
			store.nobs_ref_count(),
		)?;
		let mut spots = SpotList::new();
		for (k, old_ci) in store.columns().iter().enumerate() {
			if old_ci.ty.references() != Some(name.as_str()) {
				continue;
			}
			spots.add(recode_reference_spot(store, old_ci.clone(), new_cols[k].clone(), old_w, new_w)?)?;
		}
		accommodate(store.fl(), old_content(store), spots, None, ctx.buf1, ctx.buf2)?;
		log::info!(target: "rowdb", "{}: references to {} recoded to {} bytes", store.name(), name, new_w);
	}
	Ok(())
}

/// Builds the spot re-encoding one reference column to the target's new
/// width.
fn recode_reference_spot<'a>(
	store: &'a WrStore,
	old_ci: ColumnInfo,
	new_ci: ColumnInfo,
	old_w: usize,
	new_w: usize,
) -> Result<Spot<'a>> {
	let n_bm = store.n_bm();
	let ptr_w = store.nobs_outrow_ptr();
	let c_len = new_ci.len as i64 - old_ci.len as i64;
	let len = new_ci.len as usize;
	let pos = old_ci.offset;
	let write: Box<dyn FnMut(&[u8], &mut [u8]) -> Result<()> + 'a> = match old_ci.ty.clone() {
		ColumnType::Reference { .. } => Box::new(move |old: &[u8], out: &mut [u8]| {
			let r = util::read_uint(&old[old_ci.offset as usize..], old_w);
			util::write_uint(out, r, new_w);
			Ok(())
		}),
		ColumnType::ArrayOfRef { scheme: Scheme::InRow, .. } => {
			Box::new(move |old: &[u8], out: &mut [u8]| {
				for b in out.iter_mut() {
					*b = 0;
				}
				if util::read_uint(old, n_bm) & old_ci.null_mask != 0 {
					return Ok(());
				}
				let region = &old[old_ci.offset as usize..(old_ci.offset + old_ci.len) as usize];
				recode_ref_payload(region, old_ci.ty.size_len(), old_w, new_w, out);
				Ok(())
			})
		}
		ColumnType::ArrayOfRef { scheme: Scheme::OutRow, .. } => {
			let vl = store
				.vl()
				.ok_or_else(|| Error::Corruption("outrow column without a VL file".into()))?;
			Box::new(move |old: &[u8], out: &mut [u8]| {
				let (plen, ptr) = codec::outrow_fields(&old_ci, old, ptr_w);
				if ptr == NULL_PTR {
					for b in out.iter_mut() {
						*b = 0;
					}
					return Ok(());
				}
				let mut payload = vec![0u8; plen as usize];
				if plen > 0 {
					vl.file().read_at(&mut payload, ptr)?;
				}
				let size_len = old_ci.ty.size_len();
				let size = util::read_uint(&payload, size_len);
				let new_plen = size_len as u64 + size * new_w as u64;
				let mut new_payload = vec![0u8; new_plen as usize];
				recode_ref_payload(&payload, size_len, old_w, new_w, &mut new_payload);
				let new_ptr = if new_plen <= plen {
					vl.file().write_at(&new_payload, ptr)?;
					vl.deallocate(plen - new_plen, &mut NoUnit)?;
					ptr
				} else {
					let p = vl.allocate(new_plen, &mut NoUnit)?;
					vl.file().write_at(&new_payload, p)?;
					vl.deallocate(plen, &mut NoUnit)?;
					p
				};
				let ll = new_ci.len as usize - ptr_w;
				util::write_uint(out, new_plen, ll);
				util::write_uint(&mut out[ll..], new_ptr, ptr_w);
				Ok(())
			})
		}
		_ => {
			return Err(Error::Validation(format!(
				"column {} is not a reference column", old_ci.name
			)));
		}
	};
	Ok(Spot { pos, c_len, updater: Some(Updater { len, write }) })
}

/// Copies `[size][refs]`, re-encoding each reference from `old_w` to
/// `new_w` bytes. The output is pre-sized; unused slots stay zero.
fn recode_ref_payload(old: &[u8], size_len: usize, old_w: usize, new_w: usize, out: &mut [u8]) {
	let size = util::read_uint(old, size_len);
	util::write_uint(out, size, size_len);
	for i in 0..size as usize {
		let r = util::read_uint(&old[size_len + i * old_w..], old_w);
		util::write_uint(&mut out[size_len + i * new_w..], r, new_w);
	}
}
