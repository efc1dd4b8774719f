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

// The WR store: one table's persistent state and its row operations.
//
// On-disk row block layout:
//
// [BITMAP: nBM][REF COUNT: nobsRefCount][COLUMN DATA][EXCESS]
// BITMAP - big-endian; the most significant bit is the row-gap marker, the
// low bits hold one null bit per column that participates in the null info,
// first such column highest.
// REF COUNT - inbound-reference counter, present iff the table is referenced
// by some column of some table.
// COLUMN DATA - per-column FL data in table definition order.
// EXCESS - zero padding lifting the block to the 8-byte minimum.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use crate::{
	codec::{self, CodecCtx},
	crypto::Cipher,
	error::{Error, Result},
	file::DataFile,
	fl_space::{is_gap_marker, FlFileSpace},
	layout::TableLayout,
	reader::{self, RowData},
	refcount::{self, RefDeltas},
	state::{FileSpaceState, STATE_SUFFIX},
	types::{Column, ColumnType},
	unit::Unit,
	util,
	value::Value,
	vl_space::VlFileSpace,
};

/// The largest null-info the bitmap can carry: eight bytes minus the gap
/// bit.
pub const MAX_NULL_INFO: usize = 63;

#[derive(Clone, Debug)]
pub struct ColumnInfo {
	pub name: String,
	pub ty: ColumnType,
	/// Offset of this column's FL data within the block.
	pub offset: u64,
	/// FL byte length of this column.
	pub len: u64,
	/// Bitmap mask of this column's null bit, 0 if it has none.
	pub null_mask: u64,
	/// Index of the referenced table, for reference types.
	pub target: Option<usize>,
	/// Row-reference width of the referenced table.
	pub target_nobs: usize,
}

/// Referenced-table lookup used while computing the block geometry.
pub struct StoreTarget {
	pub index: usize,
	pub nobs_row_ref: usize,
}

pub struct WrStore {
	table_index: usize,
	name: String,
	columns: Vec<ColumnInfo>,
	fl: FlFileSpace,
	vl: Option<VlFileSpace>,
	nobs_row_ref: usize,
	nobs_outrow_ptr: usize,
	nobs_ref_count: usize,
	n_bm: usize,
	n_h: usize,
	n_e: usize,
	n: u64,
}

/// Computes per-column infos and the header geometry for a column set.
/// Returns `(columns, n_bm, n_h, body_len)`.
pub fn geometry(
	defs: &[Column],
	targets: &HashMap<String, StoreTarget>,
	nobs_outrow_ptr: usize,
	nobs_ref_count: usize,
) -> Result<(Vec<ColumnInfo>, usize, usize, u64)> {
	let p = defs.iter().filter(|c| c.ty.in_null_info()).count();
	if p > MAX_NULL_INFO {
		return Err(Error::ImplementationRestriction(format!(
			"{} columns need null info, at most {} are supported", p, MAX_NULL_INFO
		)));
	}
	let n_bm = (1 + p + 7) / 8;
	let n_h = n_bm + nobs_ref_count;
	let mut columns = Vec::with_capacity(defs.len());
	let mut offset = n_h as u64;
	let mut null_at = 0usize;
	for def in defs {
		def.ty.validate()?;
		let (target, target_nobs) = match def.ty.references() {
			Some(name) => {
				let t = targets.get(name).ok_or_else(|| {
					Error::InvalidConfiguration(format!(
						"column {} references the unknown table {}", def.name, name
					))
				})?;
				(Some(t.index), t.nobs_row_ref)
			}
			None => (None, 0),
		};
		let null_mask = if def.ty.in_null_info() {
			null_at += 1;
			1u64 << (p - null_at)
		} else {
			0
		};
		let len = def.ty.fl_len(target_nobs, nobs_outrow_ptr);
		columns.push(ColumnInfo {
			name: def.name.clone(),
			ty: def.ty.clone(),
			offset,
			len,
			null_mask,
			target,
			target_nobs,
		});
		offset += len;
	}
	Ok((columns, n_bm, n_h, offset - n_h as u64))
}

impl WrStore {
	pub fn open(
		dir: &std::path::Path,
		lt: &TableLayout,
		defs: &[Column],
		table_index: usize,
		targets: &HashMap<String, StoreTarget>,
		shutdown: &Arc<AtomicBool>,
		read_only: bool,
	) -> Result<WrStore> {
		let has_outrow = defs.iter().any(|c| c.ty.has_outrow());
		if has_outrow != lt.vl_data_file.is_some() {
			return Err(Error::InvalidConfiguration(format!(
				"table {}: the layout {} a VL data file, the definition {} outrow columns",
				lt.name,
				if lt.vl_data_file.is_some() { "names" } else { "lacks" },
				if has_outrow { "has" } else { "lacks" },
			)));
		}
		let nobs_outrow_ptr = lt.nobs_outrow_ptr.unwrap_or(0);
		let nobs_ref_count = lt.nobs_ref_count.unwrap_or(0);
		let (columns, n_bm, n_h, body) = geometry(defs, targets, nobs_outrow_ptr, nobs_ref_count)?;
		let content = n_h as u64 + body;
		let n = content.max(8);
		let n_e = (n - content) as usize;

		let fl_path = TableLayout::resolve(dir, &lt.fl_data_file);
		let state_path = {
			let mut p = fl_path.clone().into_os_string();
			p.push(STATE_SUFFIX);
			std::path::PathBuf::from(p)
		};
		let fl_file = DataFile::new(fl_path, shutdown.clone(), read_only);
		let state = FileSpaceState::new(DataFile::new(state_path, shutdown.clone(), read_only));
		let fl = FlFileSpace::open(fl_file, state, n)?;
		let vl = match &lt.vl_data_file {
			Some(path) => {
				let file = DataFile::new(TableLayout::resolve(dir, path), shutdown.clone(), read_only);
				Some(VlFileSpace::open(file, nobs_outrow_ptr)?)
			}
			None => None,
		};
		log::debug!(target: "rowdb", "Opened store {}: n = {}, {} columns, {} rows",
			lt.name, n, columns.len(), fl.block_count() - fl.gap_count());
		Ok(WrStore {
			table_index,
			name: lt.name.clone(),
			columns,
			fl,
			vl,
			nobs_row_ref: lt.nobs_row_ref,
			nobs_outrow_ptr,
			nobs_ref_count,
			n_bm,
			n_h,
			n_e,
			n,
		})
	}

	pub fn table_index(&self) -> usize {
		self.table_index
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn columns(&self) -> &[ColumnInfo] {
		&self.columns
	}

	pub fn column_index(&self, name: &str) -> Result<usize> {
		self.columns
			.iter()
			.position(|c| c.name == name)
			.ok_or_else(|| Error::Validation(format!("table {} has no column {}", self.name, name)))
	}

	pub fn fl(&self) -> &FlFileSpace {
		&self.fl
	}

	pub fn vl(&self) -> Option<&VlFileSpace> {
		self.vl.as_ref()
	}

	pub fn nobs_row_ref(&self) -> usize {
		self.nobs_row_ref
	}

	pub fn nobs_outrow_ptr(&self) -> usize {
		self.nobs_outrow_ptr
	}

	pub fn nobs_ref_count(&self) -> usize {
		self.nobs_ref_count
	}

	pub fn n_bm(&self) -> usize {
		self.n_bm
	}

	pub fn n_h(&self) -> usize {
		self.n_h
	}

	pub fn n_e(&self) -> usize {
		self.n_e
	}

	pub fn n(&self) -> u64 {
		self.n
	}

	pub fn codec_ctx<'a>(&'a self, stores: &'a [WrStore], cipher: Option<&'a dyn Cipher>) -> CodecCtx<'a> {
		CodecCtx { stores, vl: self.vl.as_ref(), nobs_outrow_ptr: self.nobs_outrow_ptr, cipher }
	}

	pub fn number_of_rows(&self) -> u64 {
		self.fl.block_count() - self.fl.gap_count()
	}

	/// Closes the backing file handles. The store may be reopened by the
	/// next operation.
	pub fn close(&self) -> Result<()> {
		self.fl.file().close()?;
		self.fl.state().file().close()?;
		if let Some(vl) = &self.vl {
			vl.file().close()?;
		}
		Ok(())
	}

	/// Re-reads the allocator state of both files after a rollback.
	pub fn refresh(&self) -> Result<()> {
		self.fl.refresh()?;
		if let Some(vl) = &self.vl {
			vl.refresh()?;
		}
		Ok(())
	}

	pub fn delete_files(&self) -> Result<()> {
		self.fl.file().delete()?;
		self.fl.state().delete()?;
		if let Some(vl) = &self.vl {
			vl.file().delete()?;
		}
		Ok(())
	}

	fn check_row(&self, row: u64) -> Result<u64> {
		if row < 1 || row > self.fl.block_count() {
			return Err(Error::IllegalReference(format!(
				"row {} does not exist in table {}", row, self.name
			)));
		}
		Ok(row - 1)
	}

	/// Inserts a row. Returns its 1-based index.
	pub fn insert(
		&self,
		stores: &[WrStore],
		values: &[Value],
		cipher: Option<&dyn Cipher>,
		buf: &mut Vec<u8>,
		unit: &mut dyn Unit,
	) -> Result<u64> {
		if values.len() != self.columns.len() {
			return Err(Error::Validation(format!(
				"table {} has {} columns, got {} values", self.name, self.columns.len(), values.len()
			)));
		}
		let ctx = self.codec_ctx(stores, cipher);
		buf.clear();
		buf.resize(self.n as usize, 0);
		let mut deltas = RefDeltas::new();
		let mut bitmap = 0u64;
		for (ci, value) in self.columns.iter().zip(values) {
			bitmap = codec::to_bytes(&ctx, ci, value, bitmap, None, &mut deltas, unit, buf)?;
		}
		util::write_uint(buf, bitmap, self.n_bm);

		let index = self.fl.allocate(unit)?;
		let row = index + 1;
		if row > util::max_value(self.nobs_row_ref) {
			return Err(Error::Maximum(format!(
				"table {} is full: row {} does not fit {} reference bytes",
				self.name, row, self.nobs_row_ref
			)));
		}
		self.fl.file().write_at(buf, self.fl.index_to_pos(index))?;
		refcount::apply(stores, &deltas, unit)?;
		log::trace!(target: "rowdb", "{}: inserted row {}, header {}", self.name, row,
			crate::display::hex(&buf[..self.n_h]));
		Ok(row)
	}

	/// Updates the named columns of a row.
	pub fn update(
		&self,
		stores: &[WrStore],
		row: u64,
		changes: &[(usize, Value)],
		cipher: Option<&dyn Cipher>,
		unit: &mut dyn Unit,
	) -> Result<()> {
		if changes.is_empty() {
			return Ok(());
		}
		for (i, (c, _)) in changes.iter().enumerate() {
			if *c >= self.columns.len() {
				return Err(Error::Validation(format!(
					"table {} has no column {}", self.name, c
				)));
			}
			// A column twice in one update would deallocate its old payload
			// twice.
			if changes[..i].iter().any(|(c0, _)| c0 == c) {
				return Err(Error::Validation(format!(
					"column {} appears twice in one update", self.columns[*c].name
				)));
			}
		}
		let index = self.check_row(row)?;
		let cols: Vec<usize> = changes.iter().map(|(c, _)| *c).collect();
		let mut data = match reader::read(self, index, &cols)? {
			RowData::Gap => {
				return Err(Error::IllegalReference(format!(
					"row {} of table {} is a gap", row, self.name
				)));
			}
			RowData::Data(data) => data,
		};
		let pos = self.fl.index_to_pos(index);
		for (off, bytes) in data.ranges() {
			unit.record_before(self.fl.file(), pos + off as u64, bytes)?;
		}
		let stored = data.buf().to_vec();
		let ctx = self.codec_ctx(stores, cipher);
		let mut deltas = RefDeltas::new();
		let mut bitmap = data.bitmap();
		for (c, value) in changes {
			let ci = &self.columns[*c];
			bitmap = codec::to_bytes(&ctx, ci, value, bitmap, Some(&stored), &mut deltas, unit, data.buf_mut())?;
		}
		data.set_bitmap(bitmap, self.n_bm);
		for (off, bytes) in data.ranges() {
			self.fl.file().write_at(bytes, pos + off as u64)?;
		}
		unit.force(self.fl.file());
		refcount::apply(stores, &deltas, unit)?;
		log::trace!(target: "rowdb", "{}: updated row {}", self.name, row);
		Ok(())
	}

	/// Deletes a row, turning its block into a gap. Fails while other rows
	/// still reference it.
	pub fn delete(
		&self,
		stores: &[WrStore],
		row: u64,
		cipher: Option<&dyn Cipher>,
		unit: &mut dyn Unit,
	) -> Result<()> {
		let index = self.check_row(row)?;
		let mut block = vec![0u8; self.n as usize];
		self.fl.file().read_at(&mut block, self.fl.index_to_pos(index))?;
		if is_gap_marker(block[0]) {
			return Err(Error::IllegalReference(format!(
				"row {} of table {} is a gap", row, self.name
			)));
		}
		if self.nobs_ref_count > 0 {
			let count = util::read_uint(&block[self.n_bm..], self.nobs_ref_count);
			if count != 0 {
				return Err(Error::DeleteConstraint(format!(
					"row {} of table {} is referenced {} times", row, self.name, count
				)));
			}
		}
		let ctx = self.codec_ctx(stores, cipher);
		let bitmap = util::read_uint(&block, self.n_bm);
		let mut deltas = RefDeltas::new();
		for ci in &self.columns {
			for r in codec::stored_refs(&ctx, ci, bitmap, &block)? {
				deltas.add(ci.target.unwrap_or(0), r, -1);
			}
			if ci.ty.has_outrow() {
				let (len, ptr) = codec::outrow_fields(ci, &block, self.nobs_outrow_ptr);
				if ptr >= crate::vl_space::START {
					let vl = self.vl.as_ref().ok_or_else(|| {
						Error::Corruption("outrow column without a VL file".into())
					})?;
					vl.deallocate(len, unit)?;
				}
			}
		}
		refcount::apply(stores, &deltas, unit)?;
		self.fl.free(index, unit)?;
		log::trace!(target: "rowdb", "{}: deleted row {}", self.name, row);
		Ok(())
	}

	/// Removes every row and truncates both backing files.
	pub fn truncate(
		&self,
		stores: &[WrStore],
		cipher: Option<&dyn Cipher>,
		unit: &mut dyn Unit,
	) -> Result<()> {
		let ctx = self.codec_ctx(stores, cipher);
		let mut deltas = RefDeltas::new();
		let mut scanner = reader::FlScanner::new(&self.fl, crate::db::BUNCH_BYTES);
		while let Some((index, block)) = scanner.next()? {
			if is_gap_marker(block[0]) {
				continue;
			}
			if self.nobs_ref_count > 0 {
				let count = util::read_uint(&block[self.n_bm..], self.nobs_ref_count);
				if count != 0 {
					return Err(Error::DeleteConstraint(format!(
						"row {} of table {} is referenced {} times", index + 1, self.name, count
					)));
				}
			}
			let bitmap = util::read_uint(block, self.n_bm);
			for ci in &self.columns {
				for r in codec::stored_refs(&ctx, ci, bitmap, block)? {
					deltas.add(ci.target.unwrap_or(0), r, -1);
				}
			}
		}
		refcount::apply(stores, &deltas, unit)?;
		self.fl.clear_and_truncate(unit)?;
		if let Some(vl) = &self.vl {
			vl.clear_and_truncate(unit)?;
		}
		log::debug!(target: "rowdb", "{}: truncated", self.name);
		Ok(())
	}

	/// Reads the named columns of a row.
	pub fn read(
		&self,
		stores: &[WrStore],
		row: u64,
		cols: &[usize],
		cipher: Option<&dyn Cipher>,
	) -> Result<Vec<Value>> {
		let index = self.check_row(row)?;
		let data = match reader::read(self, index, cols)? {
			RowData::Gap => {
				return Err(Error::IllegalReference(format!(
					"row {} of table {} is a gap", row, self.name
				)));
			}
			RowData::Data(data) => data,
		};
		let ctx = self.codec_ctx(stores, cipher);
		let mut values = Vec::with_capacity(cols.len());
		for &c in cols {
			let ci = self.columns.get(c).ok_or_else(|| {
				Error::Validation(format!("table {} has no column {}", self.name, c))
			})?;
			values.push(codec::from_bytes(&ctx, ci, data.bitmap(), data.buf())?);
		}
		Ok(values)
	}

	/// Reads a whole row.
	pub fn read_row(
		&self,
		stores: &[WrStore],
		row: u64,
		cipher: Option<&dyn Cipher>,
	) -> Result<Vec<Value>> {
		let cols: Vec<usize> = (0..self.columns.len()).collect();
		self.read(stores, row, &cols, cipher)
	}
}
