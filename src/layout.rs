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

// The layout document: one `table <name>` section per store, followed by
// indented `key value` lines. Paths are relative to the layout directory
// unless absolute.
//
//   table person
//   	flDataFile person.fl
//   	vlDataFile person.vl
//   	nobsRowRef 2
//   	nobsOutrowPtr 4
//   	nobsRefCount 1
//
// `vlDataFile`/`nobsOutrowPtr` are present iff some column stores outrow
// payload; `nobsRefCount` iff the table is referenced by some column of some
// table.

use std::io::{Read, Write};
use crate::error::{Error, Result};

pub const KEY_FL_DATA_FILE: &str = "flDataFile";
pub const KEY_VL_DATA_FILE: &str = "vlDataFile";
pub const KEY_NOBS_ROW_REF: &str = "nobsRowRef";
pub const KEY_NOBS_OUTROW_PTR: &str = "nobsOutrowPtr";
pub const KEY_NOBS_REF_COUNT: &str = "nobsRefCount";

/// A parsed section: its name and its key/value pairs in document order.
pub type Section = (String, Vec<(String, String)>);

/// Parses the line-oriented document into sections. Also used for the
/// trailing layout of the RO file.
pub fn parse_doc(text: &str) -> Result<Vec<Section>> {
	let mut sections: Vec<Section> = Vec::new();
	for (lineno, raw) in text.lines().enumerate() {
		let line = raw.trim_end();
		if line.trim().is_empty() || line.trim_start().starts_with('#') {
			continue;
		}
		let indented = line.starts_with('\t') || line.starts_with(' ');
		let mut parts = line.trim_start().splitn(2, char::is_whitespace);
		let key = parts.next().unwrap_or("").to_string();
		let value = parts.next().map(|v| v.trim().to_string());
		if !indented {
			if key != "table" {
				return Err(Error::InvalidConfiguration(format!(
					"line {}: expected a table section, got {:?}", lineno + 1, key
				)));
			}
			let name = value.unwrap_or_default();
			if name.is_empty() {
				return Err(Error::InvalidConfiguration(format!("line {}: empty table name", lineno + 1)));
			}
			sections.push((name, Vec::new()));
		} else {
			let section = sections.last_mut().ok_or_else(|| {
				Error::InvalidConfiguration(format!("line {}: entry outside of a table section", lineno + 1))
			})?;
			section.1.push((key, value.unwrap_or_default()));
		}
	}
	Ok(sections)
}

pub fn format_doc(sections: &[Section]) -> String {
	let mut out = String::new();
	for (name, entries) in sections {
		out.push_str("table ");
		out.push_str(name);
		out.push('\n');
		for (key, value) in entries {
			out.push('\t');
			out.push_str(key);
			out.push(' ');
			out.push_str(value);
			out.push('\n');
		}
	}
	out
}

#[derive(Clone, Debug, PartialEq)]
pub struct TableLayout {
	pub name: String,
	pub fl_data_file: String,
	pub vl_data_file: Option<String>,
	pub nobs_row_ref: usize,
	pub nobs_outrow_ptr: Option<usize>,
	pub nobs_ref_count: Option<usize>,
}

impl TableLayout {
	fn from_section(section: &Section) -> Result<TableLayout> {
		let (name, entries) = section;
		let get = |key: &str| -> Option<&str> {
			entries.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
		};
		let required = |key: &str| -> Result<&str> {
			let v = get(key).ok_or_else(|| Error::MissingEntry(format!("table {}: {}", name, key)))?;
			if v.is_empty() {
				return Err(Error::InvalidConfiguration(format!("table {}: {} is empty", name, key)));
			}
			Ok(v)
		};
		let nobs = |key: &str, v: &str| -> Result<usize> {
			let n: usize = v.parse().map_err(|_| {
				Error::InvalidConfiguration(format!("table {}: {} is not an integer", name, key))
			})?;
			if n < 1 || n > 8 {
				return Err(Error::InvalidConfiguration(format!(
					"table {}: {} must be in 1..=8, got {}", name, key, n
				)));
			}
			Ok(n)
		};

		let fl_data_file = required(KEY_FL_DATA_FILE)?.to_string();
		let nobs_row_ref = nobs(KEY_NOBS_ROW_REF, required(KEY_NOBS_ROW_REF)?)?;
		let vl_data_file = match get(KEY_VL_DATA_FILE) {
			Some("") => {
				return Err(Error::InvalidConfiguration(format!("table {}: {} is empty", name, KEY_VL_DATA_FILE)));
			}
			Some(v) => Some(v.to_string()),
			None => None,
		};
		let nobs_outrow_ptr = match (vl_data_file.is_some(), get(KEY_NOBS_OUTROW_PTR)) {
			(true, Some(v)) => Some(nobs(KEY_NOBS_OUTROW_PTR, v)?),
			(true, None) => {
				return Err(Error::MissingEntry(format!("table {}: {}", name, KEY_NOBS_OUTROW_PTR)));
			}
			(false, Some(_)) => {
				return Err(Error::InvalidConfiguration(format!(
					"table {}: {} without {}", name, KEY_NOBS_OUTROW_PTR, KEY_VL_DATA_FILE
				)));
			}
			(false, None) => None,
		};
		let nobs_ref_count = match get(KEY_NOBS_REF_COUNT) {
			Some(v) => Some(nobs(KEY_NOBS_REF_COUNT, v)?),
			None => None,
		};
		Ok(TableLayout {
			name: name.clone(),
			fl_data_file,
			vl_data_file,
			nobs_row_ref,
			nobs_outrow_ptr,
			nobs_ref_count,
		})
	}

	fn to_section(&self) -> Section {
		let mut entries = vec![
			(KEY_FL_DATA_FILE.to_string(), self.fl_data_file.clone()),
			(KEY_NOBS_ROW_REF.to_string(), self.nobs_row_ref.to_string()),
		];
		if let Some(vl) = &self.vl_data_file {
			entries.push((KEY_VL_DATA_FILE.to_string(), vl.clone()));
			if let Some(nobs) = self.nobs_outrow_ptr {
				entries.push((KEY_NOBS_OUTROW_PTR.to_string(), nobs.to_string()));
			}
		}
		if let Some(nobs) = self.nobs_ref_count {
			entries.push((KEY_NOBS_REF_COUNT.to_string(), nobs.to_string()));
		}
		(self.name.clone(), entries)
	}

	/// Resolves a layout path against the layout directory.
	pub fn resolve(dir: &std::path::Path, path: &str) -> std::path::PathBuf {
		let p = std::path::Path::new(path);
		if p.is_absolute() {
			p.to_path_buf()
		} else {
			dir.join(p)
		}
	}
}

#[derive(Clone, Debug)]
pub struct Layout {
	pub tables: Vec<TableLayout>,
}

impl Layout {
	pub fn parse(text: &str) -> Result<Layout> {
		let sections = parse_doc(text)?;
		let mut tables = Vec::with_capacity(sections.len());
		for section in &sections {
			let table = TableLayout::from_section(section)?;
			if tables.iter().any(|t: &TableLayout| t.name == table.name) {
				return Err(Error::InvalidConfiguration(format!("duplicate table {}", table.name)));
			}
			tables.push(table);
		}
		Ok(Layout { tables })
	}

	pub fn load(path: &std::path::Path) -> Result<Layout> {
		let mut text = String::new();
		std::fs::File::open(path)?.read_to_string(&mut text)?;
		Layout::parse(&text)
	}

	pub fn format(&self) -> String {
		format_doc(&self.tables.iter().map(|t| t.to_section()).collect::<Vec<_>>())
	}

	pub fn save(&self, path: &std::path::Path) -> Result<()> {
		let mut file = std::fs::File::create(path)?;
		file.write_all(self.format().as_bytes())?;
		file.sync_data()?;
		Ok(())
	}

	pub fn table(&self, name: &str) -> Option<&TableLayout> {
		self.tables.iter().find(|t| t.name == name)
	}

	pub fn table_mut(&mut self, name: &str) -> Option<&mut TableLayout> {
		self.tables.iter_mut().find(|t| t.name == name)
	}
}

#[cfg(test)]
mod test {
	use super::*;

	const DOC: &str = "\
table person
	flDataFile person.fl
	nobsRowRef 2
	vlDataFile person.vl
	nobsOutrowPtr 4
table pet
	flDataFile pet.fl
	nobsRowRef 1
	nobsRefCount 2
";

	#[test]
	fn parse_and_format_round_trip() {
		let layout = Layout::parse(DOC).unwrap();
		assert_eq!(layout.tables.len(), 2);
		let person = layout.table("person").unwrap();
		assert_eq!(person.fl_data_file, "person.fl");
		assert_eq!(person.vl_data_file.as_deref(), Some("person.vl"));
		assert_eq!(person.nobs_outrow_ptr, Some(4));
		assert_eq!(person.nobs_ref_count, None);
		let pet = layout.table("pet").unwrap();
		assert_eq!(pet.vl_data_file, None);
		assert_eq!(pet.nobs_ref_count, Some(2));

		let again = Layout::parse(&layout.format()).unwrap();
		assert_eq!(again.tables, layout.tables);
	}

	#[test]
	fn missing_entry_is_reported() {
		let doc = "table t\n\tnobsRowRef 2\n";
		assert!(matches!(Layout::parse(doc), Err(Error::MissingEntry(_))));
	}

	#[test]
	fn out_of_range_nobs_is_rejected() {
		let doc = "table t\n\tflDataFile t.fl\n\tnobsRowRef 9\n";
		assert!(matches!(Layout::parse(doc), Err(Error::InvalidConfiguration(_))));
	}

	#[test]
	fn outrow_ptr_requires_vl_file() {
		let doc = "table t\n\tflDataFile t.fl\n\tnobsRowRef 2\n\tnobsOutrowPtr 4\n";
		assert!(matches!(Layout::parse(doc), Err(Error::InvalidConfiguration(_))));
		let doc = "table t\n\tflDataFile t.fl\n\tnobsRowRef 2\n\tvlDataFile t.vl\n";
		assert!(matches!(Layout::parse(doc), Err(Error::MissingEntry(_))));
	}
}
