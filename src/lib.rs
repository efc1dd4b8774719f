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

// A single-process, file-backed relational row store. Each table keeps its
// rows in fixed-length blocks of an FL data file, with variable payload in
// an append-only VL data file, and can be converted into a compact,
// compressed, optionally encrypted read-only archive.

mod accommodate;
mod codec;
mod compact;
mod crypto;
mod db;
mod display;
mod error;
mod file;
mod fl_space;
mod layout;
mod reader;
mod refcount;
mod ro;
mod schema;
mod state;
mod store;
mod treap;
mod types;
mod unit;
mod util;
mod value;
mod verify;
mod vl_space;

pub use crypto::Cipher;
pub use db::{Database, DatabaseConfig, TableDef};
pub use error::{Error, Result};
pub use layout::{Layout, TableLayout};
pub use schema::ValueChanger;
pub use types::{Column, ColumnType, Scheme, SimpleKind, SimpleType};
pub use value::Value;
