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

/// A runtime column value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
	Null,
	/// Unsigned integer, stored big-endian at the column's declared width.
	Int(u64),
	Str(String),
	Bytes(Vec<u8>),
	/// 1-based row index into the referenced table. The null reference is
	/// expressed as `Null` and stored as index 0.
	Ref(u64),
	Array(Vec<Value>),
}

impl Value {
	pub fn is_null(&self) -> bool {
		matches!(self, Value::Null)
	}

	pub fn kind_name(&self) -> &'static str {
		match self {
			Value::Null => "null",
			Value::Int(_) => "integer",
			Value::Str(_) => "string",
			Value::Bytes(_) => "bytes",
			Value::Ref(_) => "reference",
			Value::Array(_) => "array",
		}
	}
}

impl From<u64> for Value {
	fn from(v: u64) -> Value {
		Value::Int(v)
	}
}

impl From<&str> for Value {
	fn from(v: &str) -> Value {
		Value::Str(v.into())
	}
}

impl From<Vec<u8>> for Value {
	fn from(v: Vec<u8>) -> Value {
		Value::Bytes(v)
	}
}
