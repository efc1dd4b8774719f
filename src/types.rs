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

// Column types and their derived storage properties.
//
// A column stores FL data of a fixed per-store byte length inside the row
// block; columns with outrow payload additionally store bytes in the VL
// file. Per-variant FL layout (lenLen/sizeLen are the widths of the length
// and size fields, derived from the declared bounds):
//
// INROW ST, fixed:     [VALUE: length]
// INROW ST, variable:  [LEN: lenLen][VALUE: length reserved]
// OUTROW ST:           [LEN: lenLen][PTR: nobsOutrowPtr]
// RT:                  [ROW INDEX: nobsRowRef of the referenced table]
// INROW array:         [SIZE: sizeLen][NULL BITS][ELEMENTS: maxSize slots]
// OUTROW array:        [LEN: lenLen][PTR: nobsOutrowPtr], payload in VL
//
// Array elements with the INROW scheme occupy fixed contiguous slots;
// OUTROW-scheme elements are each prefixed by their own length. Reference
// elements are row indices of the referenced table's width. The per-element
// null bitmap is present iff the element type is nullable.

use crate::error::{Error, Result};
use crate::util;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scheme {
	InRow,
	OutRow,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimpleKind {
	/// Unsigned big-endian integer of exactly `length` bytes.
	Int,
	/// UTF-8 text of up to `length` bytes.
	Utf8,
	/// Raw bytes, up to `length` of them.
	Bytes,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SimpleType {
	pub kind: SimpleKind,
	pub scheme: Scheme,
	/// Byte length bound; the exact length when the type is not variable.
	pub length: u32,
	pub variable: bool,
	pub nullable: bool,
}

impl SimpleType {
	pub fn validate(&self) -> Result<()> {
		match self.kind {
			SimpleKind::Int => {
				if self.length < 1 || self.length > 8 {
					return Err(Error::Validation(format!("integer length {} outside 1..=8", self.length)));
				}
				if self.variable {
					return Err(Error::Validation("integer types are not variable".into()));
				}
			}
			SimpleKind::Utf8 | SimpleKind::Bytes => {
				if self.length < 1 {
					return Err(Error::Validation("zero length bound".into()));
				}
			}
		}
		Ok(())
	}

	/// Width of the length prefix for variable values of this type.
	pub fn len_len(&self) -> usize {
		util::len_of(self.length as u64)
	}

	/// Fixed byte slot reserved for one in-row value of this type.
	pub fn inrow_len(&self) -> u64 {
		let prefix = if self.variable { self.len_len() as u64 } else { 0 };
		prefix + self.length as u64
	}

	/// Upper bound of the encoded byte length of one value, any scheme.
	pub fn max_encoded_len(&self) -> u64 {
		self.inrow_len()
	}
}

#[derive(Clone, Debug, PartialEq)]
pub enum ColumnType {
	Simple(SimpleType),
	/// A row index into the named table; 0 is the null reference.
	Reference { table: String },
	ArrayOfSimple { elem: SimpleType, scheme: Scheme, max_size: u32 },
	ArrayOfRef { table: String, scheme: Scheme, max_size: u32 },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Column {
	pub name: String,
	pub ty: ColumnType,
}

impl ColumnType {
	pub fn validate(&self) -> Result<()> {
		match self {
			ColumnType::Simple(st) => st.validate(),
			ColumnType::Reference { table } => {
				if table.is_empty() {
					return Err(Error::Validation("empty referenced table name".into()));
				}
				Ok(())
			}
			ColumnType::ArrayOfSimple { elem, .. } => elem.validate(),
			ColumnType::ArrayOfRef { table, .. } => {
				if table.is_empty() {
					return Err(Error::Validation("empty referenced table name".into()));
				}
				Ok(())
			}
		}
	}

	pub fn scheme(&self) -> Scheme {
		match self {
			ColumnType::Simple(st) => st.scheme,
			ColumnType::Reference { .. } => Scheme::InRow,
			ColumnType::ArrayOfSimple { scheme, .. } => *scheme,
			ColumnType::ArrayOfRef { scheme, .. } => *scheme,
		}
	}

	/// Whether nulls of this column are encoded in the row bitmap. Only
	/// in-row nullable simple types, in-row arrays of in-row simple types
	/// and in-row reference arrays have no other way to encode null.
	pub fn in_null_info(&self) -> bool {
		match self {
			ColumnType::Simple(st) => st.scheme == Scheme::InRow && st.nullable,
			ColumnType::Reference { .. } => false,
			ColumnType::ArrayOfSimple { scheme, elem, .. } => {
				*scheme == Scheme::InRow && elem.scheme == Scheme::InRow
			}
			ColumnType::ArrayOfRef { scheme, .. } => *scheme == Scheme::InRow,
		}
	}

	/// Whether this column stores payload in the VL file.
	pub fn has_outrow(&self) -> bool {
		self.scheme() == Scheme::OutRow
	}

	/// The table this column references, if it is a reference type.
	pub fn references(&self) -> Option<&str> {
		match self {
			ColumnType::Reference { table } => Some(table),
			ColumnType::ArrayOfRef { table, .. } => Some(table),
			_ => None,
		}
	}

	pub fn is_array(&self) -> bool {
		matches!(self, ColumnType::ArrayOfSimple { .. } | ColumnType::ArrayOfRef { .. })
	}

	pub fn max_size(&self) -> u32 {
		match self {
			ColumnType::ArrayOfSimple { max_size, .. } => *max_size,
			ColumnType::ArrayOfRef { max_size, .. } => *max_size,
			_ => 0,
		}
	}

	/// Width of the array size field.
	pub fn size_len(&self) -> usize {
		util::len_of(self.max_size() as u64)
	}

	/// Width of the per-element null bitmap inside an array payload.
	pub fn elem_bitmap_len(&self) -> usize {
		match self {
			ColumnType::ArrayOfSimple { elem, max_size, .. } if elem.nullable => {
				(*max_size as usize + 7) / 8
			}
			_ => 0,
		}
	}

	/// Upper bound of an array payload, or of an outrow value.
	/// `ref_width` is the row-reference width of the referenced table.
	pub fn max_payload(&self, ref_width: usize) -> u64 {
		match self {
			ColumnType::Simple(st) => st.length as u64,
			ColumnType::Reference { .. } => ref_width as u64,
			ColumnType::ArrayOfSimple { elem, max_size, .. } => {
				self.size_len() as u64
					+ self.elem_bitmap_len() as u64
					+ *max_size as u64 * elem_slot_len(elem)
			}
			ColumnType::ArrayOfRef { max_size, .. } => {
				self.size_len() as u64 + *max_size as u64 * ref_width as u64
			}
		}
	}

	/// Width of the length field of an outrow column.
	pub fn outrow_len_len(&self, ref_width: usize) -> usize {
		util::len_of(self.max_payload(ref_width))
	}

	/// FL bytes this column occupies in every row block. `ref_width` is the
	/// row-reference width of the referenced table (unused otherwise),
	/// `outrow_ptr_width` the store's VL pointer width.
	pub fn fl_len(&self, ref_width: usize, outrow_ptr_width: usize) -> u64 {
		match self.scheme() {
			Scheme::OutRow => self.outrow_len_len(ref_width) as u64 + outrow_ptr_width as u64,
			Scheme::InRow => match self {
				ColumnType::Simple(st) => st.inrow_len(),
				ColumnType::Reference { .. } => ref_width as u64,
				ColumnType::ArrayOfSimple { .. } | ColumnType::ArrayOfRef { .. } => {
					self.max_payload(ref_width)
				}
			},
		}
	}
}

/// Fixed slot one array element occupies in an array payload.
pub fn elem_slot_len(elem: &SimpleType) -> u64 {
	match elem.scheme {
		Scheme::InRow => elem.inrow_len(),
		// Length-prefixed in place; the bound is the same as in-row with a
		// prefix.
		Scheme::OutRow => elem.len_len() as u64 + elem.length as u64,
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn int4() -> SimpleType {
		SimpleType { kind: SimpleKind::Int, scheme: Scheme::InRow, length: 4, variable: false, nullable: false }
	}

	fn utf8(length: u32, scheme: Scheme) -> SimpleType {
		SimpleType { kind: SimpleKind::Utf8, scheme, length, variable: true, nullable: true }
	}

	#[test]
	fn inrow_simple_lengths() {
		assert_eq!(ColumnType::Simple(int4()).fl_len(0, 0), 4);
		// 300-byte bound takes a 2-byte length prefix.
		let st = utf8(300, Scheme::InRow);
		assert_eq!(ColumnType::Simple(st).fl_len(0, 0), 2 + 300);
	}

	#[test]
	fn outrow_simple_length() {
		let st = utf8(300, Scheme::OutRow);
		assert_eq!(ColumnType::Simple(st).fl_len(0, 4), 2 + 4);
	}

	#[test]
	fn reference_width_follows_target() {
		let rt = ColumnType::Reference { table: "t".into() };
		assert_eq!(rt.fl_len(3, 0), 3);
	}

	#[test]
	fn inrow_array_reserves_max() {
		let at = ColumnType::ArrayOfSimple {
			elem: SimpleType { kind: SimpleKind::Int, scheme: Scheme::InRow, length: 2, variable: false, nullable: true },
			scheme: Scheme::InRow,
			max_size: 10,
		};
		// size byte + 2 bitmap bytes + 10 * 2.
		assert_eq!(at.fl_len(0, 0), 1 + 2 + 20);
		assert!(at.in_null_info());
	}

	#[test]
	fn ref_array_lengths() {
		let at = ColumnType::ArrayOfRef { table: "t".into(), scheme: Scheme::InRow, max_size: 3 };
		assert_eq!(at.fl_len(2, 0), 1 + 6);
		let at = ColumnType::ArrayOfRef { table: "t".into(), scheme: Scheme::OutRow, max_size: 3 };
		// Payload bound is 7, one length byte plus the pointer.
		assert_eq!(at.fl_len(2, 4), 1 + 4);
	}

	#[test]
	fn null_info_participation() {
		assert!(!ColumnType::Simple(int4()).in_null_info());
		let mut nullable = int4();
		nullable.nullable = true;
		assert!(ColumnType::Simple(nullable).in_null_info());
		assert!(!ColumnType::Simple(utf8(10, Scheme::OutRow)).in_null_info());
		assert!(!ColumnType::Reference { table: "t".into() }.in_null_info());
	}
}
