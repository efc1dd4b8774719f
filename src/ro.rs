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

// WR to RO conversion.
//
// RO file layout:
//
// [LAYOUT POS: 8]
// per table, in declared order:
//   packed row data - the concatenated row stream cut into source blocks of
//   regularBlockSize bytes, each gzipped, then ciphered when an RO cipher
//   is configured;
//   a gzipped stream of (row pointers || packed block sizes), row pointers
//   being each row's offset into the unpacked stream.
// at the end: the gzipped layout document, its file position at offset 0.
//
// One row unpacks to:
//
// [NULL INFO][LEN: lengthLen, per outrow column][COLUMN DATA]
// NULL INFO - one bit per column that participates in the WR null info or
// stores outrow payload, first such column first, highest bit first.
// LEN - the inline payload length of each outrow column, zero when null.
// COLUMN DATA - in-row columns keep their WR form (decrypted); outrow
// payload is inlined; every row reference is adjusted for the gaps of the
// referenced table and truncated to the RO reference width.

use std::io::Write;
use std::sync::Arc;
use crate::{
	compact::adjust_row_index,
	codec,
	crypto::Cipher,
	error::{Error, Result},
	file::DataFile,
	fl_space::is_gap_marker,
	layout,
	reader::FlScanner,
	store::{ColumnInfo, WrStore},
	types::{elem_slot_len, ColumnType, Scheme, SimpleKind, SimpleType},
	util,
	value::Value,
};

pub const DEFAULT_REGULAR_BLOCK_SIZE: usize = 64 * 1024;

pub const KEY_NOF_ROWS: &str = "nofRows";
pub const KEY_DATA_POS: &str = "dataPos";
pub const KEY_DATA_BLOCKS: &str = "dataBlocks";
pub const KEY_UNPACKED_SIZE: &str = "unpackedSize";
pub const KEY_TABLES_POS: &str = "tablesPos";
pub const KEY_TABLES_LEN: &str = "tablesLen";
pub const KEY_NOBS_ROW_PTR: &str = "nobsRowPtr";
pub const KEY_NOBS_BLOCK_SIZE: &str = "nobsBlockSize";
pub const KEY_REGULAR_BLOCK_SIZE: &str = "regularBlockSize";

/// Sequential writer over a `DataFile`, tracking the next file position.
struct PosWriter {
	file: Arc<DataFile>,
	pos: u64,
}

impl PosWriter {
	fn write(&mut self, bytes: &[u8]) -> Result<()> {
		self.file.write_at(bytes, self.pos)?;
		self.pos += bytes.len() as u64;
		Ok(())
	}
}

fn gzip(bytes: &[u8]) -> Result<Vec<u8>> {
	let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
	enc.write_all(bytes)?;
	Ok(enc.finish()?)
}

/// Accepts raw row bytes and routes them through gzip (and the RO cipher)
/// into the output, cut into source blocks of `regular` unpacked bytes.
/// The packed size of every block is recorded so a reader can seek by
/// block.
struct Packer<'a> {
	cipher: Option<&'a dyn Cipher>,
	regular: usize,
	buf: Vec<u8>,
	packed_sizes: Vec<u64>,
	unpacked: u64,
}

impl<'a> Packer<'a> {
	fn new(cipher: Option<&'a dyn Cipher>, regular: usize) -> Packer<'a> {
		Packer {
			cipher,
			regular,
			buf: Vec::with_capacity(regular),
			packed_sizes: Vec::new(),
			unpacked: 0,
		}
	}

	fn write(&mut self, out: &mut PosWriter, mut bytes: &[u8]) -> Result<()> {
		self.unpacked += bytes.len() as u64;
		while !bytes.is_empty() {
			let room = self.regular - self.buf.len();
			let take = room.min(bytes.len());
			self.buf.extend_from_slice(&bytes[..take]);
			bytes = &bytes[take..];
			if self.buf.len() == self.regular {
				self.flush_block(out)?;
			}
		}
		Ok(())
	}

	fn flush_block(&mut self, out: &mut PosWriter) -> Result<()> {
		if self.buf.is_empty() {
			return Ok(());
		}
		let mut packed = gzip(&self.buf)?;
		if let Some(cipher) = self.cipher {
			cipher.encrypt(&mut packed)?;
		}
		out.write(&packed)?;
		self.packed_sizes.push(packed.len() as u64);
		self.buf.clear();
		Ok(())
	}

	fn finish(mut self, out: &mut PosWriter) -> Result<(Vec<u64>, u64)> {
		self.flush_block(out)?;
		Ok((self.packed_sizes, self.unpacked))
	}
}

/// Whether a column occupies a bit of the RO null info: everything in the
/// WR null info, plus outrow columns, whose inline length field cannot
/// distinguish null from empty.
pub fn in_ro_null_info(ci: &ColumnInfo) -> bool {
	ci.ty.in_null_info() || ci.ty.has_outrow()
}

/// Width of the inline length field of an outrow column under RO reference
/// widths.
pub fn ro_len_len(ci: &ColumnInfo, ro_w: usize) -> usize {
	util::len_of(ci.ty.max_payload(ro_w))
}

fn ro_target_width(ci: &ColumnInfo, ro_widths: &[usize]) -> usize {
	ci.target.map_or(0, |t| ro_widths[t])
}

fn put_simple_plain(st: &SimpleType, value: &Value, fixed_slot: bool, out: &mut Vec<u8>) -> Result<()> {
	let mut scratch = [0u8; 8];
	match (st.kind, value) {
		(SimpleKind::Int, Value::Int(v)) => {
			util::write_uint(&mut scratch, *v, st.length as usize);
			out.extend_from_slice(&scratch[..st.length as usize]);
		}
		(SimpleKind::Utf8, Value::Str(s)) => {
			put_blob_plain(st, s.as_bytes(), fixed_slot, out);
		}
		(SimpleKind::Bytes, Value::Bytes(b)) => {
			put_blob_plain(st, b, fixed_slot, out);
		}
		(_, other) => {
			return Err(Error::Corruption(format!(
				"stored value decodes as {}, not as the column type", other.kind_name()
			)));
		}
	}
	Ok(())
}

fn put_blob_plain(st: &SimpleType, bytes: &[u8], fixed_slot: bool, out: &mut Vec<u8>) {
	let mut scratch = [0u8; 8];
	if st.variable {
		util::write_uint(&mut scratch, bytes.len() as u64, st.len_len());
		out.extend_from_slice(&scratch[..st.len_len()]);
	}
	out.extend_from_slice(bytes);
	if fixed_slot {
		out.resize(out.len() + st.length as usize - bytes.len(), 0);
	}
}

/// Encodes an array payload with references adjusted and truncated to the
/// RO width. Pads to the full reservation when `reserve` is set (in-row
/// arrays).
fn put_payload_ro(
	ci: &ColumnInfo,
	elems: &[Value],
	ro_w: usize,
	reserve: bool,
	out: &mut Vec<u8>,
) -> Result<()> {
	let start = out.len();
	let mut scratch = [0u8; 8];
	let size_len = ci.ty.size_len();
	util::write_uint(&mut scratch, elems.len() as u64, size_len);
	out.extend_from_slice(&scratch[..size_len]);
	let bm_len = ci.ty.elem_bitmap_len();
	let bm_start = out.len();
	out.resize(out.len() + bm_len, 0);
	match &ci.ty {
		ColumnType::ArrayOfSimple { elem, .. } => {
			for (i, value) in elems.iter().enumerate() {
				if value.is_null() {
					out[bm_start + i / 8] |= 0x80 >> (i % 8);
					match elem.scheme {
						Scheme::InRow => out.resize(out.len() + elem_slot_len(elem) as usize, 0),
						Scheme::OutRow => {
							util::write_uint(&mut scratch, 0, elem.len_len());
							out.extend_from_slice(&scratch[..elem.len_len()]);
						}
					}
				} else {
					put_simple_plain(elem, value, elem.scheme == Scheme::InRow, out)?;
				}
			}
		}
		ColumnType::ArrayOfRef { .. } => {
			for value in elems {
				let r = match value {
					Value::Null => 0,
					Value::Ref(r) => *r,
					other => {
						return Err(Error::Corruption(format!(
							"stored element decodes as {}, not as a reference", other.kind_name()
						)));
					}
				};
				util::write_uint(&mut scratch, r, ro_w);
				out.extend_from_slice(&scratch[..ro_w]);
			}
		}
		_ => {
			return Err(Error::Corruption("payload encoding for a non-array column".into()));
		}
	}
	if reserve {
		let full = start + ci.ty.max_payload(ro_w) as usize;
		out.resize(full, 0);
	}
	Ok(())
}

/// Maps every reference of a decoded value through the gap adjustment of
/// its target table.
fn adjust_value(value: Value, ci: &ColumnInfo, gaps: &[Vec<u64>]) -> Value {
	let target = match ci.target {
		Some(t) => t,
		None => return value,
	};
	match value {
		Value::Ref(r) => Value::Ref(adjust_row_index(r, &gaps[target])),
		Value::Array(elems) => Value::Array(
			elems
				.into_iter()
				.map(|e| match e {
					Value::Ref(r) => Value::Ref(adjust_row_index(r, &gaps[target])),
					other => other,
				})
				.collect(),
		),
		other => other,
	}
}

/// Encodes one row into `out`: null info, outrow length fields, column
/// data.
pub fn encode_row(
	store: &WrStore,
	values: &[Value],
	gaps: &[Vec<u64>],
	ro_widths: &[usize],
	out: &mut Vec<u8>,
) -> Result<()> {
	out.clear();
	let participants: Vec<usize> = (0..store.columns().len())
		.filter(|&c| in_ro_null_info(&store.columns()[c]))
		.collect();
	let bm_len = (participants.len() + 7) / 8;
	out.resize(bm_len, 0);
	for (i, &c) in participants.iter().enumerate() {
		if values[c].is_null() {
			out[i / 8] |= 0x80 >> (i % 8);
		}
	}

	// Outrow payloads, pre-encoded so their lengths can head the row.
	let mut payloads: Vec<Option<Vec<u8>>> = Vec::with_capacity(store.columns().len());
	for (ci, value) in store.columns().iter().zip(values) {
		if !ci.ty.has_outrow() {
			payloads.push(None);
			continue;
		}
		let mut payload = Vec::new();
		if !value.is_null() {
			let w = ro_target_width(ci, ro_widths);
			match (&ci.ty, adjust_value(value.clone(), ci, gaps)) {
				(ColumnType::Simple(st), v) => put_simple_plain(st, &v, false, &mut payload)?,
				(_, Value::Array(elems)) => put_payload_ro(ci, &elems, w, false, &mut payload)?,
				(_, other) => {
					return Err(Error::Corruption(format!(
						"stored value decodes as {}, not as an array", other.kind_name()
					)));
				}
			}
		}
		payloads.push(Some(payload));
	}
	let mut scratch = [0u8; 8];
	for (ci, payload) in store.columns().iter().zip(&payloads) {
		if let Some(payload) = payload {
			let w = ro_target_width(ci, ro_widths);
			let ll = ro_len_len(ci, w);
			util::write_uint(&mut scratch, payload.len() as u64, ll);
			out.extend_from_slice(&scratch[..ll]);
		}
	}

	// Column data.
	for ((ci, value), payload) in store.columns().iter().zip(values).zip(payloads) {
		if let Some(payload) = payload {
			out.extend_from_slice(&payload);
			continue;
		}
		let w = ro_target_width(ci, ro_widths);
		match &ci.ty {
			ColumnType::Simple(st) => {
				if value.is_null() {
					out.resize(out.len() + st.inrow_len() as usize, 0);
				} else {
					put_simple_plain(st, value, true, out)?;
				}
			}
			ColumnType::Reference { .. } => {
				let r = match adjust_value(value.clone(), ci, gaps) {
					Value::Null => 0,
					Value::Ref(r) => r,
					other => {
						return Err(Error::Corruption(format!(
							"stored value decodes as {}, not as a reference", other.kind_name()
						)));
					}
				};
				util::write_uint(&mut scratch, r, w);
				out.extend_from_slice(&scratch[..w]);
			}
			ColumnType::ArrayOfSimple { .. } | ColumnType::ArrayOfRef { .. } => {
				if value.is_null() {
					out.resize(out.len() + ci.ty.max_payload(w) as usize, 0);
				} else if let Value::Array(elems) = adjust_value(value.clone(), ci, gaps) {
					put_payload_ro(ci, &elems, w, true, out)?;
				} else {
					return Err(Error::Corruption("stored value is not an array".into()));
				}
			}
		}
	}
	Ok(())
}

/// Converts the whole WR table set into a single RO file at `target`. The
/// target must be fresh; publication over an existing database is the
/// caller's rename.
pub fn convert(
	stores: &[WrStore],
	wr_cipher: Option<&dyn Cipher>,
	ro_cipher: Option<&dyn Cipher>,
	target: &std::path::Path,
	regular_block_size: usize,
) -> Result<()> {
	if regular_block_size == 0 {
		return Err(Error::Validation("regular block size must be positive".into()));
	}
	if target.exists() {
		return Err(Error::Validation(format!("target {:?} already exists", target)));
	}
	log::info!(target: "rowdb", "Converting {} tables to {:?}", stores.len(), target);

	let mut gaps = Vec::with_capacity(stores.len());
	let mut ro_widths = Vec::with_capacity(stores.len());
	for store in stores {
		let g = store.fl().gaps()?;
		let live = store.fl().block_count() - g.len() as u64;
		gaps.push(g);
		ro_widths.push(util::len_of(live));
	}

	let file = DataFile::new(target.to_path_buf(), Default::default(), false);
	let mut out = PosWriter { file: file.clone(), pos: 0 };
	out.write(&[0u8; 8])?;

	let mut sections = Vec::with_capacity(stores.len());
	for (t, store) in stores.iter().enumerate() {
		let data_pos = out.pos;
		let mut packer = Packer::new(ro_cipher, regular_block_size);
		let mut row_pointers = Vec::new();
		let mut row = Vec::new();
		let ctx = store.codec_ctx(stores, wr_cipher);
		let mut scanner = FlScanner::new(store.fl(), crate::db::BUNCH_BYTES);
		while let Some((_, block)) = scanner.next()? {
			if is_gap_marker(block[0]) {
				continue;
			}
			let bitmap = util::read_uint(block, store.n_bm());
			let mut values = Vec::with_capacity(store.columns().len());
			for ci in store.columns() {
				values.push(codec::from_bytes(&ctx, ci, bitmap, block)?);
			}
			row_pointers.push(packer.unpacked);
			encode_row(store, &values, &gaps, &ro_widths, &mut row)?;
			packer.write(&mut out, &row)?;
		}
		let (packed_sizes, unpacked) = packer.finish(&mut out)?;

		// Row pointers and block sizes, gzipped together.
		let nobs_row_ptr = util::len_of(unpacked);
		let nobs_block_size = util::len_of(packed_sizes.iter().copied().max().unwrap_or(0));
		let mut tables = Vec::with_capacity(
			row_pointers.len() * nobs_row_ptr + packed_sizes.len() * nobs_block_size,
		);
		let mut scratch = [0u8; 8];
		for &p in &row_pointers {
			util::write_uint(&mut scratch, p, nobs_row_ptr);
			tables.extend_from_slice(&scratch[..nobs_row_ptr]);
		}
		for &s in &packed_sizes {
			util::write_uint(&mut scratch, s, nobs_block_size);
			tables.extend_from_slice(&scratch[..nobs_block_size]);
		}
		let tables_pos = out.pos;
		let packed_tables = gzip(&tables)?;
		out.write(&packed_tables)?;

		sections.push((store.name().to_string(), vec![
			(layout::KEY_NOBS_ROW_REF.to_string(), ro_widths[t].to_string()),
			(KEY_NOF_ROWS.to_string(), row_pointers.len().to_string()),
			(KEY_DATA_POS.to_string(), data_pos.to_string()),
			(KEY_DATA_BLOCKS.to_string(), packed_sizes.len().to_string()),
			(KEY_UNPACKED_SIZE.to_string(), unpacked.to_string()),
			(KEY_TABLES_POS.to_string(), tables_pos.to_string()),
			(KEY_TABLES_LEN.to_string(), packed_tables.len().to_string()),
			(KEY_NOBS_ROW_PTR.to_string(), nobs_row_ptr.to_string()),
			(KEY_NOBS_BLOCK_SIZE.to_string(), nobs_block_size.to_string()),
			(KEY_REGULAR_BLOCK_SIZE.to_string(), regular_block_size.to_string()),
		]));
		log::debug!(target: "rowdb", "{}: {} rows converted, {} packed blocks",
			store.name(), row_pointers.len(), packed_sizes.len());
	}

	let layout_pos = out.pos;
	let doc = layout::format_doc(&sections);
	out.write(&gzip(doc.as_bytes())?)?;
	let mut head = [0u8; 8];
	util::write_uint(&mut head, layout_pos, 8);
	file.write_at(&head, 0)?;
	file.sync()?;
	file.close()?;
	log::info!(target: "rowdb", "Conversion done, {} bytes", layout_pos);
	Ok(())
}
