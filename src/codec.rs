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

// Conversion between runtime values and stored column bytes.
//
// `to_bytes` writes one column's FL bytes into a block-sized buffer at the
// column's offset, allocating and reusing VL space for outrow payload, and
// returns the updated row bitmap. A `stored` buffer of the previous block
// bytes marks an update: VL regions are rewritten in place when the new
// payload is not longer than the stored one, otherwise the old region is
// deallocated and a new one appended. `from_bytes` is the inverse.
//
// The WR cipher covers stored value bytes only: simple values in row blocks,
// array element bytes, whole outrow payloads of simple types. Lengths,
// sizes, VL pointers and row references stay plain, so do reference-array
// payloads.
//
// Reference-count changes are not applied here; they are accumulated into a
// per-target-row delta table and applied once per operation.

use crate::{
	crypto::Cipher,
	error::{Error, Result},
	refcount::{validate_target, RefDeltas},
	store::{ColumnInfo, WrStore},
	types::{elem_slot_len, ColumnType, Scheme, SimpleKind, SimpleType},
	unit::Unit,
	util,
	value::Value,
	vl_space::{VlFileSpace, EMPTY_PTR, NULL_PTR, START},
};

/// Everything a column conversion needs to know about its surroundings:
/// the open stores (to validate reference targets), the VL space and
/// pointer width of the converting table, and the WR cipher. Detached from
/// `WrStore` so schema rewrites can convert columns for a geometry that is
/// not an open store yet.
#[derive(Clone, Copy)]
pub struct CodecCtx<'a> {
	pub stores: &'a [WrStore],
	pub vl: Option<&'a VlFileSpace>,
	pub nobs_outrow_ptr: usize,
	pub cipher: Option<&'a dyn Cipher>,
}

impl<'a> CodecCtx<'a> {
	fn target(&self, ci: &ColumnInfo) -> &WrStore {
		&self.stores[ci.target.expect("reference columns resolve their target at open")]
	}

	fn encrypt(&self, data: &mut [u8]) -> Result<()> {
		match self.cipher {
			Some(cipher) => cipher.encrypt(data),
			None => Ok(()),
		}
	}

	fn decrypt(&self, data: &mut [u8]) -> Result<()> {
		match self.cipher {
			Some(cipher) => cipher.decrypt(data),
			None => Ok(()),
		}
	}
}

/// A byte buffer and a write position into it.
pub struct Bag<'a> {
	pub bytes: &'a mut [u8],
	pub off: usize,
}

impl<'a> Bag<'a> {
	pub fn new(bytes: &'a mut [u8], off: usize) -> Bag<'a> {
		Bag { bytes, off }
	}

	fn put(&mut self, src: &[u8]) {
		self.bytes[self.off..self.off + src.len()].copy_from_slice(src);
		self.off += src.len();
	}

	fn put_uint(&mut self, value: u64, width: usize) {
		util::write_uint(&mut self.bytes[self.off..], value, width);
		self.off += width;
	}

	fn fill(&mut self, len: usize) {
		for b in &mut self.bytes[self.off..self.off + len] {
			*b = 0;
		}
		self.off += len;
	}
}

/// A byte slice and a read position into it.
struct Slice<'a> {
	bytes: &'a [u8],
	at: usize,
}

impl<'a> Slice<'a> {
	fn new(bytes: &'a [u8]) -> Slice<'a> {
		Slice { bytes, at: 0 }
	}

	fn take(&mut self, len: usize) -> &'a [u8] {
		let start = self.at;
		self.at += len;
		&self.bytes[start..self.at]
	}

	fn take_uint(&mut self, width: usize) -> u64 {
		util::read_uint(self.take(width), width)
	}
}

fn expect_int(st: &SimpleType, value: &Value) -> Result<u64> {
	match value {
		Value::Int(v) => {
			if *v > util::max_value(st.length as usize) {
				return Err(Error::Validation(format!(
					"integer {} does not fit {} bytes", v, st.length
				)));
			}
			Ok(*v)
		}
		other => Err(Error::Validation(format!("expected an integer, got {}", other.kind_name()))),
	}
}

/// Returns the value bytes of a simple non-integer value, bound checked.
fn expect_blob<'v>(st: &SimpleType, value: &'v Value) -> Result<&'v [u8]> {
	let bytes: &[u8] = match (st.kind, value) {
		(SimpleKind::Utf8, Value::Str(s)) => s.as_bytes(),
		(SimpleKind::Bytes, Value::Bytes(b)) => b,
		(kind, other) => {
			return Err(Error::Validation(format!(
				"expected {:?}, got {}", kind, other.kind_name()
			)));
		}
	};
	if bytes.len() as u64 > st.length as u64 {
		return Err(Error::Maximum(format!(
			"value of {} bytes exceeds the type bound {}", bytes.len(), st.length
		)));
	}
	if !st.variable && bytes.len() as u64 != st.length as u64 {
		return Err(Error::Validation(format!(
			"fixed-length value must be exactly {} bytes, got {}", st.length, bytes.len()
		)));
	}
	Ok(bytes)
}

/// Encodes one simple value into `bag`: a fixed slot for in-row storage
/// (zero padded), a length-prefixed encoding otherwise.
fn put_simple(ctx: &CodecCtx, st: &SimpleType, value: &Value, fixed_slot: bool, bag: &mut Bag) -> Result<()> {
	match st.kind {
		SimpleKind::Int => {
			let v = expect_int(st, value)?;
			let start = bag.off;
			bag.put_uint(v, st.length as usize);
			ctx.encrypt(&mut bag.bytes[start..bag.off])?;
		}
		SimpleKind::Utf8 | SimpleKind::Bytes => {
			let bytes = expect_blob(st, value)?;
			if st.variable {
				bag.put_uint(bytes.len() as u64, st.len_len());
			}
			let start = bag.off;
			bag.put(bytes);
			ctx.encrypt(&mut bag.bytes[start..bag.off])?;
			if fixed_slot {
				bag.fill(st.length as usize - bytes.len());
			}
		}
	}
	Ok(())
}

fn take_simple(ctx: &CodecCtx, st: &SimpleType, fixed_slot: bool, slice: &mut Slice) -> Result<Value> {
	let len = if st.variable {
		let len = slice.take_uint(st.len_len()) as usize;
		if len as u64 > st.length as u64 {
			return Err(Error::Corruption("stored length exceeds the type bound".into()));
		}
		len
	} else {
		st.length as usize
	};
	let mut bytes = slice.take(len).to_vec();
	if fixed_slot && st.variable {
		slice.take(st.length as usize - len);
	}
	ctx.decrypt(&mut bytes)?;
	Ok(match st.kind {
		SimpleKind::Int => Value::Int(util::read_uint(&bytes, len)),
		SimpleKind::Utf8 => Value::Str(String::from_utf8(bytes).map_err(|_| {
			Error::Corruption("stored text is not valid UTF-8".into())
		})?),
		SimpleKind::Bytes => Value::Bytes(bytes),
	})
}

/// Builds an array payload: size, optional element null bitmap, elements.
/// Reference elements are validated and counted into `deltas`.
fn encode_payload(
	ctx: &CodecCtx,
	ci: &ColumnInfo,
	elems: &[Value],
	deltas: &mut RefDeltas,
) -> Result<Vec<u8>> {
	let ty = &ci.ty;
	let max_size = ty.max_size();
	if elems.len() as u64 > max_size as u64 {
		return Err(Error::Maximum(format!(
			"array of {} elements exceeds the maximum size {}", elems.len(), max_size
		)));
	}
	let mut payload = vec![0u8; ty.max_payload(ci.target_nobs) as usize];
	let bm_len = ty.elem_bitmap_len();
	let end;
	let mut bag = Bag::new(&mut payload, 0);
	bag.put_uint(elems.len() as u64, ty.size_len());
	let bm_start = bag.off;
	bag.fill(bm_len);
	match ty {
		ColumnType::ArrayOfSimple { elem, .. } => {
			for (i, value) in elems.iter().enumerate() {
				if value.is_null() {
					if !elem.nullable {
						return Err(Error::Validation("null element in a non-nullable array".into()));
					}
					bag.bytes[bm_start + i / 8] |= 0x80 >> (i % 8);
					match elem.scheme {
						Scheme::InRow => bag.fill(elem_slot_len(elem) as usize),
						Scheme::OutRow => bag.put_uint(0, elem.len_len()),
					}
				} else {
					put_simple(ctx, elem, value, elem.scheme == Scheme::InRow, &mut bag)?;
				}
			}
		}
		ColumnType::ArrayOfRef { .. } => {
			let w = ci.target_nobs;
			for value in elems {
				match value {
					Value::Null => bag.put_uint(0, w),
					Value::Ref(r) => {
						validate_target(ctx.target(ci), *r)?;
						deltas.add(ci.target.unwrap_or(0), *r, 1);
						bag.put_uint(*r, w);
					}
					other => {
						return Err(Error::Validation(format!(
							"expected a reference element, got {}", other.kind_name()
						)));
					}
				}
			}
		}
		_ => unreachable!("payloads are only built for array columns"),
	}
	end = bag.off;
	payload.truncate(end);
	Ok(payload)
}

fn decode_payload(ctx: &CodecCtx, ci: &ColumnInfo, bytes: &[u8]) -> Result<Vec<Value>> {
	let ty = &ci.ty;
	let mut slice = Slice::new(bytes);
	let size = slice.take_uint(ty.size_len());
	if size > ty.max_size() as u64 {
		return Err(Error::Corruption("stored array size exceeds the maximum".into()));
	}
	let bitmap = slice.take(ty.elem_bitmap_len());
	let mut elems = Vec::with_capacity(size as usize);
	match ty {
		ColumnType::ArrayOfSimple { elem, .. } => {
			for i in 0..size as usize {
				let null = elem.nullable && bitmap[i / 8] & (0x80 >> (i % 8)) != 0;
				if null {
					match elem.scheme {
						Scheme::InRow => {
							slice.take(elem_slot_len(elem) as usize);
						}
						Scheme::OutRow => {
							slice.take(elem.len_len());
						}
					}
					elems.push(Value::Null);
				} else {
					elems.push(take_simple(ctx, elem, elem.scheme == Scheme::InRow, &mut slice)?);
				}
			}
		}
		ColumnType::ArrayOfRef { .. } => {
			for _ in 0..size {
				let r = slice.take_uint(ci.target_nobs);
				elems.push(if r == 0 { Value::Null } else { Value::Ref(r) });
			}
		}
		_ => unreachable!("payloads are only decoded for array columns"),
	}
	Ok(elems)
}

/// Reads an outrow column's `(length, pointer)` pair from a block.
pub fn outrow_fields(ci: &ColumnInfo, block: &[u8], ptr_width: usize) -> (u64, u64) {
	let ll = ci.len as usize - ptr_width;
	let off = ci.offset as usize;
	(
		util::read_uint(&block[off..], ll),
		util::read_uint(&block[off + ll..], ptr_width),
	)
}

fn read_vl(ctx: &CodecCtx, ptr: u64, len: u64) -> Result<Vec<u8>> {
	let vl = ctx.vl.ok_or_else(|| Error::Corruption("outrow column without a VL file".into()))?;
	if ptr < START || ptr + len > vl.end() {
		return Err(Error::Corruption(format!(
			"VL pointer {} with length {} outside the payload region", ptr, len
		)));
	}
	let mut buf = vec![0u8; len as usize];
	vl.file().read_at(&mut buf, ptr)?;
	Ok(buf)
}

/// Persists `payload` for an outrow column and writes the column's length
/// and pointer fields. `stored` carries the previous `(length, pointer)` on
/// update; an in-place rewrite is used whenever the new payload fits the
/// stored region.
fn write_outrow(
	ctx: &CodecCtx,
	ci: &ColumnInfo,
	payload: Option<Vec<u8>>,
	stored: Option<(u64, u64)>,
	unit: &mut dyn Unit,
	block: &mut [u8],
) -> Result<()> {
	let vl = ctx.vl.ok_or_else(|| Error::Corruption("outrow column without a VL file".into()))?;
	let ptr_width = ctx.nobs_outrow_ptr;
	let (old_len, old_ptr) = stored.unwrap_or((0, NULL_PTR));
	let (len, ptr) = match payload {
		None => {
			if old_ptr >= START {
				vl.deallocate(old_len, unit)?;
			}
			(0, NULL_PTR)
		}
		Some(payload) => {
			let len = payload.len() as u64;
			if len > 0 && old_ptr >= START && len <= old_len {
				let mut old = vec![0u8; len as usize];
				vl.file().read_at(&mut old, old_ptr)?;
				unit.record_before(vl.file(), old_ptr, &old)?;
				vl.file().write_at(&payload, old_ptr)?;
				vl.deallocate(old_len - len, unit)?;
				unit.force(vl.file());
				(len, old_ptr)
			} else {
				let ptr = vl.allocate(len, unit)?;
				if len > 0 {
					vl.file().write_at(&payload, ptr)?;
				}
				if old_ptr >= START {
					vl.deallocate(old_len, unit)?;
				}
				(len, ptr)
			}
		}
	};
	let ll = ci.len as usize - ptr_width;
	let mut bag = Bag::new(block, ci.offset as usize);
	bag.put_uint(len, ll);
	bag.put_uint(ptr, ptr_width);
	Ok(())
}

/// Collects the non-null row references stored in a reference column of a
/// live row. Used when rows are deleted or reference arrays are replaced.
pub fn stored_refs(ctx: &CodecCtx, ci: &ColumnInfo, bitmap: u64, block: &[u8]) -> Result<Vec<u64>> {
	match &ci.ty {
		ColumnType::Reference { .. } => {
			let r = util::read_uint(&block[ci.offset as usize..], ci.target_nobs);
			Ok(if r == 0 { Vec::new() } else { vec![r] })
		}
		ColumnType::ArrayOfRef { scheme, .. } => {
			let payload: Vec<u8>;
			let bytes: &[u8] = match scheme {
				Scheme::InRow => {
					if bitmap & ci.null_mask != 0 {
						return Ok(Vec::new());
					}
					&block[ci.offset as usize..(ci.offset + ci.len) as usize]
				}
				Scheme::OutRow => {
					let (len, ptr) = outrow_fields(ci, block, ctx.nobs_outrow_ptr);
					if ptr == NULL_PTR || len == 0 {
						return Ok(Vec::new());
					}
					payload = read_vl(ctx, ptr, len)?;
					&payload
				}
			};
			let elems = decode_payload(ctx, ci, bytes)?;
			Ok(elems
				.into_iter()
				.filter_map(|v| match v {
					Value::Ref(r) => Some(r),
					_ => None,
				})
				.collect())
		}
		_ => Ok(Vec::new()),
	}
}

/// Converts `value` into column bytes inside the block-sized buffer `block`.
/// `stored` holds the previous block bytes on update, `None` on insert (the
/// buffer region is pre-zeroed then). Returns the updated row bitmap.
pub fn to_bytes(
	ctx: &CodecCtx,
	ci: &ColumnInfo,
	value: &Value,
	bitmap: u64,
	stored: Option<&[u8]>,
	deltas: &mut RefDeltas,
	unit: &mut dyn Unit,
	block: &mut [u8],
) -> Result<u64> {
	match &ci.ty {
		ColumnType::Simple(st) if st.scheme == Scheme::InRow => {
			if value.is_null() {
				if !st.nullable {
					return Err(Error::Validation(format!("column {} is not nullable", ci.name)));
				}
				return Ok(bitmap | ci.null_mask);
			}
			let mut bag = Bag::new(block, ci.offset as usize);
			put_simple(ctx, st, value, true, &mut bag)?;
			Ok(bitmap & !ci.null_mask)
		}
		ColumnType::Simple(st) => {
			let stored_fields = stored.map(|b| outrow_fields(ci, b, ctx.nobs_outrow_ptr));
			let payload = if value.is_null() {
				if !st.nullable {
					return Err(Error::Validation(format!("column {} is not nullable", ci.name)));
				}
				None
			} else {
				let mut payload = vec![0u8; st.max_encoded_len() as usize];
				let mut bag = Bag::new(&mut payload, 0);
				match st.kind {
					SimpleKind::Int => {
						let v = expect_int(st, value)?;
						bag.put_uint(v, st.length as usize);
					}
					SimpleKind::Utf8 | SimpleKind::Bytes => {
						let bytes = expect_blob(st, value)?;
						bag.put(bytes);
					}
				}
				let end = bag.off;
				payload.truncate(end);
				ctx.encrypt(&mut payload)?;
				Some(payload)
			};
			write_outrow(ctx, ci, payload, stored_fields, unit, block)?;
			Ok(bitmap)
		}
		ColumnType::Reference { .. } => {
			let old = match stored {
				Some(b) => util::read_uint(&b[ci.offset as usize..], ci.target_nobs),
				None => 0,
			};
			let new = match value {
				Value::Null => 0,
				Value::Ref(r) => {
					validate_target(ctx.target(ci), *r)?;
					*r
				}
				other => {
					return Err(Error::Validation(format!(
						"expected a reference, got {}", other.kind_name()
					)));
				}
			};
			let target = ci.target.unwrap_or(0);
			if old != 0 {
				deltas.add(target, old, -1);
			}
			if new != 0 {
				deltas.add(target, new, 1);
			}
			util::write_uint(&mut block[ci.offset as usize..], new, ci.target_nobs);
			Ok(bitmap)
		}
		ColumnType::ArrayOfSimple { scheme: Scheme::InRow, .. }
		| ColumnType::ArrayOfRef { scheme: Scheme::InRow, .. } => {
			// Decrement whatever the stored array referenced.
			if let Some(b) = stored {
				for r in stored_refs(ctx, ci, bitmap, b)? {
					deltas.add(ci.target.unwrap_or(0), r, -1);
				}
			}
			match value {
				Value::Null => {
					if !ci.ty.in_null_info() {
						return Err(Error::Validation(format!(
							"column {} cannot store a null array", ci.name
						)));
					}
					Ok(bitmap | ci.null_mask)
				}
				Value::Array(elems) => {
					let payload = encode_payload(ctx, ci, elems, deltas)?;
					let region = &mut block[ci.offset as usize..(ci.offset + ci.len) as usize];
					region[..payload.len()].copy_from_slice(&payload);
					for b in &mut region[payload.len()..] {
						*b = 0;
					}
					Ok(bitmap & !ci.null_mask)
				}
				other => Err(Error::Validation(format!(
					"expected an array, got {}", other.kind_name()
				))),
			}
		}
		ColumnType::ArrayOfSimple { .. } | ColumnType::ArrayOfRef { .. } => {
			let stored_fields = stored.map(|b| outrow_fields(ci, b, ctx.nobs_outrow_ptr));
			if let Some(b) = stored {
				for r in stored_refs(ctx, ci, bitmap, b)? {
					deltas.add(ci.target.unwrap_or(0), r, -1);
				}
			}
			let payload = match value {
				Value::Null => None,
				Value::Array(elems) => Some(encode_payload(ctx, ci, elems, deltas)?),
				other => {
					return Err(Error::Validation(format!(
						"expected an array, got {}", other.kind_name()
					)));
				}
			};
			write_outrow(ctx, ci, payload, stored_fields, unit, block)?;
			Ok(bitmap)
		}
	}
}

/// Decodes one column of a live row.
pub fn from_bytes(ctx: &CodecCtx, ci: &ColumnInfo, bitmap: u64, block: &[u8]) -> Result<Value> {
	match &ci.ty {
		ColumnType::Simple(st) if st.scheme == Scheme::InRow => {
			if st.nullable && bitmap & ci.null_mask != 0 {
				return Ok(Value::Null);
			}
			let region = &block[ci.offset as usize..(ci.offset + ci.len) as usize];
			take_simple(ctx, st, true, &mut Slice::new(region))
		}
		ColumnType::Simple(st) => {
			let (len, ptr) = outrow_fields(ci, block, ctx.nobs_outrow_ptr);
			if len == 0 && ptr == NULL_PTR {
				return Ok(Value::Null);
			}
			let mut bytes = if len == 0 && ptr == EMPTY_PTR {
				Vec::new()
			} else {
				read_vl(ctx, ptr, len)?
			};
			ctx.decrypt(&mut bytes)?;
			Ok(match st.kind {
				SimpleKind::Int => Value::Int(util::read_uint(&bytes, bytes.len())),
				SimpleKind::Utf8 => Value::Str(String::from_utf8(bytes).map_err(|_| {
					Error::Corruption("stored text is not valid UTF-8".into())
				})?),
				SimpleKind::Bytes => Value::Bytes(bytes),
			})
		}
		ColumnType::Reference { .. } => {
			let r = util::read_uint(&block[ci.offset as usize..], ci.target_nobs);
			Ok(if r == 0 { Value::Null } else { Value::Ref(r) })
		}
		ColumnType::ArrayOfSimple { scheme: Scheme::InRow, .. }
		| ColumnType::ArrayOfRef { scheme: Scheme::InRow, .. } => {
			if ci.ty.in_null_info() && bitmap & ci.null_mask != 0 {
				return Ok(Value::Null);
			}
			let region = &block[ci.offset as usize..(ci.offset + ci.len) as usize];
			Ok(Value::Array(decode_payload(ctx, ci, region)?))
		}
		ColumnType::ArrayOfSimple { .. } | ColumnType::ArrayOfRef { .. } => {
			let (len, ptr) = outrow_fields(ci, block, ctx.nobs_outrow_ptr);
			if len == 0 && ptr == NULL_PTR {
				return Ok(Value::Null);
			}
			let payload = read_vl(ctx, ptr, len)?;
			Ok(Value::Array(decode_payload(ctx, ci, &payload)?))
		}
	}
}
