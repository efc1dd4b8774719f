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

// The database: the table set behind one layout file, the read/write
// zones, the shared scratch buffers and the public operations.
//
// Readers share the zone lock; every mutating operation takes it
// exclusively and runs inside a journal unit that is committed on success
// and rolled back on error. Schema operations additionally require `&mut
// self`; when one fails mid-rewrite the database is poisoned and must be
// closed and restored from a backup.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use parking_lot::{Mutex, MutexGuard, RwLock};
use crate::{
	compact,
	crypto::Cipher,
	error::{Error, Result},
	layout::{Layout, TableLayout},
	refcount,
	ro,
	schema::{self, SchemaCtx, ValueChanger},
	store::{StoreTarget, WrStore},
	types::Column,
	unit::{self, JournalUnit, NoUnit},
	value::Value,
	verify,
};

/// Bytes read per bunch by the buffered scans.
pub const BUNCH_BYTES: usize = 256 * 1024;

/// Capacity above which a global buffer is trimmed back when borrowed.
const MAX_BUFFER: usize = 8 * 1024 * 1024;

const LAYOUT_FILE: &str = "layout";
const LOCK_FILE: &str = "lock";

/// The three preallocated scratch buffers shared by all stores. A call
/// site borrows one; a sub-operation that needs independent memory must
/// pick a different one.
struct GlobalBuffers {
	bufs: [Mutex<Vec<u8>>; 3],
}

impl GlobalBuffers {
	fn new() -> GlobalBuffers {
		GlobalBuffers { bufs: [Mutex::new(Vec::new()), Mutex::new(Vec::new()), Mutex::new(Vec::new())] }
	}

	fn take(&self, i: usize) -> MutexGuard<Vec<u8>> {
		let mut buf = self.bufs[i].lock();
		if buf.capacity() > MAX_BUFFER {
			buf.clear();
			buf.shrink_to_fit();
		}
		buf
	}
}

/// One table of the database: its name, its column definitions and the
/// storage parameters used when the layout is first created.
#[derive(Clone, Debug)]
pub struct TableDef {
	pub name: String,
	pub columns: Vec<Column>,
	pub nobs_row_ref: usize,
	/// VL pointer width; defaulted when absent and outrow columns exist.
	pub nobs_outrow_ptr: Option<usize>,
	/// Counter width; defaulted when absent and the table is referenced.
	pub nobs_ref_count: Option<usize>,
}

pub struct DatabaseConfig {
	pub dir: std::path::PathBuf,
	pub tables: Vec<TableDef>,
	pub read_only: bool,
	pub wr_cipher: Option<Arc<dyn Cipher>>,
	pub ro_cipher: Option<Arc<dyn Cipher>>,
}

impl DatabaseConfig {
	pub fn new(dir: impl Into<std::path::PathBuf>, tables: Vec<TableDef>) -> DatabaseConfig {
		DatabaseConfig { dir: dir.into(), tables, read_only: false, wr_cipher: None, ro_cipher: None }
	}
}

pub struct Database {
	dir: std::path::PathBuf,
	layout: Layout,
	defs: Vec<Vec<Column>>,
	stores: Vec<WrStore>,
	zone: RwLock<()>,
	buffers: GlobalBuffers,
	wr_cipher: Option<Arc<dyn Cipher>>,
	ro_cipher: Option<Arc<dyn Cipher>>,
	shutdown: Arc<AtomicBool>,
	poisoned: AtomicBool,
	read_only: bool,
	_lock: std::fs::File,
}

fn build_layout(config: &DatabaseConfig) -> Result<Layout> {
	let mut tables = Vec::with_capacity(config.tables.len());
	for def in &config.tables {
		let has_outrow = def.columns.iter().any(|c| c.ty.has_outrow());
		let referenced = config
			.tables
			.iter()
			.flat_map(|t| t.columns.iter())
			.any(|c| c.ty.references() == Some(def.name.as_str()));
		tables.push(TableLayout {
			name: def.name.clone(),
			fl_data_file: format!("{}.fl", def.name),
			vl_data_file: if has_outrow { Some(format!("{}.vl", def.name)) } else { None },
			nobs_row_ref: def.nobs_row_ref,
			nobs_outrow_ptr: if has_outrow {
				Some(def.nobs_outrow_ptr.unwrap_or(schema::DEFAULT_NOBS))
			} else {
				None
			},
			nobs_ref_count: if referenced {
				Some(def.nobs_ref_count.unwrap_or(schema::DEFAULT_NOBS))
			} else {
				None
			},
		});
	}
	Ok(Layout { tables })
}

fn open_stores(
	dir: &std::path::Path,
	layout: &Layout,
	defs: &[Vec<Column>],
	shutdown: &Arc<AtomicBool>,
	read_only: bool,
) -> Result<Vec<WrStore>> {
	let targets: HashMap<String, StoreTarget> = layout
		.tables
		.iter()
		.enumerate()
		.map(|(i, t)| (t.name.clone(), StoreTarget { index: i, nobs_row_ref: t.nobs_row_ref }))
		.collect();
	let mut stores = Vec::with_capacity(layout.tables.len());
	for (i, lt) in layout.tables.iter().enumerate() {
		let referenced = defs
			.iter()
			.flatten()
			.any(|c| c.ty.references() == Some(lt.name.as_str()));
		if referenced != lt.nobs_ref_count.is_some() {
			return Err(Error::InvalidConfiguration(format!(
				"table {}: {} referenced but the layout {} a reference counter",
				lt.name,
				if referenced { "is" } else { "is not" },
				if lt.nobs_ref_count.is_some() { "carries" } else { "lacks" },
			)));
		}
		stores.push(WrStore::open(dir, lt, &defs[i], i, &targets, shutdown, read_only)?);
	}
	Ok(stores)
}

impl Database {
	pub fn open(config: DatabaseConfig) -> Result<Database> {
		if !config.dir.exists() {
			if config.read_only {
				return Err(Error::Io(std::io::ErrorKind::NotFound.into()));
			}
			std::fs::create_dir_all(&config.dir)?;
		}
		let lock = std::fs::OpenOptions::new()
			.create(!config.read_only)
			.read(true)
			.write(!config.read_only)
			.open(config.dir.join(LOCK_FILE))?;
		let locked = if config.read_only { fs2::FileExt::try_lock_shared(&lock) } else { fs2::FileExt::try_lock_exclusive(&lock) };
		locked.map_err(|_| Error::InvalidConfiguration("database is locked by another process".into()))?;

		if !config.read_only && unit::recover(&config.dir)? {
			log::warn!(target: "rowdb", "Recovered an interrupted unit in {:?}", config.dir);
		}

		let layout_path = config.dir.join(LAYOUT_FILE);
		let layout = if layout_path.exists() {
			Layout::load(&layout_path)?
		} else {
			if config.read_only {
				return Err(Error::MissingEntry(format!("{:?}", layout_path)));
			}
			let layout = build_layout(&config)?;
			layout.save(&layout_path)?;
			layout
		};
		if layout.tables.len() != config.tables.len()
			|| layout
				.tables
				.iter()
				.zip(&config.tables)
				.any(|(lt, def)| lt.name != def.name)
		{
			return Err(Error::InvalidConfiguration(
				"the layout does not list the configured tables".into(),
			));
		}

		let defs: Vec<Vec<Column>> = config.tables.iter().map(|t| t.columns.clone()).collect();
		let shutdown = Arc::new(AtomicBool::new(false));
		let stores = open_stores(&config.dir, &layout, &defs, &shutdown, config.read_only)?;
		log::info!(target: "rowdb", "Opened database {:?} with {} tables", config.dir, stores.len());
		Ok(Database {
			dir: config.dir,
			layout,
			defs,
			stores,
			zone: RwLock::new(()),
			buffers: GlobalBuffers::new(),
			wr_cipher: config.wr_cipher,
			ro_cipher: config.ro_cipher,
			shutdown,
			poisoned: AtomicBool::new(false),
			read_only: config.read_only,
			_lock: lock,
		})
	}

	fn layout_path(&self) -> std::path::PathBuf {
		self.dir.join(LAYOUT_FILE)
	}

	fn check_usable(&self) -> Result<()> {
		if self.poisoned.load(Ordering::Relaxed) {
			return Err(Error::Corruption(
				"a schema operation failed mid-rewrite; close the database and restore from backup".into(),
			));
		}
		if self.shutdown.load(Ordering::Relaxed) {
			return Err(Error::Shutdown);
		}
		Ok(())
	}

	fn check_writable(&self) -> Result<()> {
		self.check_usable()?;
		if self.read_only {
			return Err(Error::ReadOnly);
		}
		Ok(())
	}

	pub fn table_index(&self, name: &str) -> Result<usize> {
		self.stores
			.iter()
			.position(|s| s.name() == name)
			.ok_or_else(|| Error::Validation(format!("unknown table {}", name)))
	}

	fn store(&self, name: &str) -> Result<&WrStore> {
		Ok(&self.stores[self.table_index(name)?])
	}

	fn wr_cipher(&self) -> Option<&dyn Cipher> {
		self.wr_cipher.as_deref()
	}

	/// Runs one mutating operation in a fresh unit: committed on success,
	/// rolled back on error.
	fn with_unit<T, F: FnOnce(&mut JournalUnit) -> Result<T>>(&self, f: F) -> Result<T> {
		let mut journal = JournalUnit::begin(&self.dir)?;
		match f(&mut journal) {
			Ok(v) => {
				journal.commit()?;
				Ok(v)
			}
			Err(e) => {
				if let Err(re) = journal.rollback() {
					log::warn!(target: "rowdb", "Rollback failed: {}", re);
					self.poisoned.store(true, Ordering::Relaxed);
					return Err(e);
				}
				// The files are back at their pre-unit contents; realign the
				// in-memory allocator state with them.
				for store in &self.stores {
					if let Err(re) = store.refresh() {
						log::warn!(target: "rowdb", "State refresh failed: {}", re);
						self.poisoned.store(true, Ordering::Relaxed);
						break;
					}
				}
				Err(e)
			}
		}
	}

	/// Inserts a row; returns its 1-based index.
	pub fn insert(&self, table: &str, values: &[Value]) -> Result<u64> {
		let _zone = self.zone.write();
		self.check_writable()?;
		let store = self.store(table)?;
		let mut buf = self.buffers.take(0);
		self.with_unit(|unit| store.insert(&self.stores, values, self.wr_cipher(), &mut buf, unit))
	}

	/// Updates the named columns of a row.
	pub fn update(&self, table: &str, row: u64, changes: &[(&str, Value)]) -> Result<()> {
		let _zone = self.zone.write();
		self.check_writable()?;
		let store = self.store(table)?;
		let mut resolved = Vec::with_capacity(changes.len());
		for (name, value) in changes {
			resolved.push((store.column_index(name)?, value.clone()));
		}
		self.with_unit(|unit| store.update(&self.stores, row, &resolved, self.wr_cipher(), unit))
	}

	/// Deletes a row. Fails with a delete constraint while other rows still
	/// reference it.
	pub fn delete(&self, table: &str, row: u64) -> Result<()> {
		let _zone = self.zone.write();
		self.check_writable()?;
		let store = self.store(table)?;
		self.with_unit(|unit| store.delete(&self.stores, row, self.wr_cipher(), unit))
	}

	/// Removes every row of the table and truncates its backing files.
	pub fn truncate(&self, table: &str) -> Result<()> {
		let _zone = self.zone.write();
		self.check_writable()?;
		let store = self.store(table)?;
		self.with_unit(|unit| store.truncate(&self.stores, self.wr_cipher(), unit))
	}

	/// Reads a whole row.
	pub fn get(&self, table: &str, row: u64) -> Result<Vec<Value>> {
		let _zone = self.zone.read();
		self.check_usable()?;
		self.store(table)?.read_row(&self.stores, row, self.wr_cipher())
	}

	/// Reads the named columns of a row.
	pub fn get_columns(&self, table: &str, row: u64, cols: &[&str]) -> Result<Vec<Value>> {
		let _zone = self.zone.read();
		self.check_usable()?;
		let store = self.store(table)?;
		let mut indices = Vec::with_capacity(cols.len());
		for name in cols {
			indices.push(store.column_index(name)?);
		}
		store.read(&self.stores, row, &indices, self.wr_cipher())
	}

	pub fn number_of_rows(&self, table: &str) -> Result<u64> {
		self.check_usable()?;
		Ok(self.store(table)?.number_of_rows())
	}

	/// The 1-based indices of the live rows, ascending.
	pub fn rows(&self, table: &str) -> Result<Vec<u64>> {
		let _zone = self.zone.read();
		self.check_usable()?;
		let store = self.store(table)?;
		let mut rows = Vec::with_capacity(store.number_of_rows() as usize);
		for index in 0..store.fl().block_count() {
			if !store.fl().is_gap(index)? {
				rows.push(index + 1);
			}
		}
		Ok(rows)
	}

	/// Runs a schema rewrite, poisoning the database when it fails
	/// mid-flight, and reopening the stores when it succeeds.
	fn schema_op<T, F>(&mut self, f: F) -> Result<T>
	where
		F: FnOnce(&mut SchemaCtx) -> Result<T>,
	{
		self.check_writable()?;
		let result = (|| {
			let value = {
				let mut buf1 = self.buffers.take(1);
				let mut buf2 = self.buffers.take(2);
				let mut ctx = SchemaCtx {
					dir: &self.dir,
					layout: &mut self.layout,
					defs: &mut self.defs,
					stores: &self.stores,
					cipher: self.wr_cipher.as_deref(),
					shutdown: &self.shutdown,
					buf1: &mut buf1,
					buf2: &mut buf2,
				};
				f(&mut ctx)?
			};
			self.layout.save(&self.layout_path())?;
			self.reopen_stores()?;
			Ok(value)
		})();
		if result.is_err() {
			self.poisoned.store(true, Ordering::Relaxed);
		}
		result
	}

	fn reopen_stores(&mut self) -> Result<()> {
		for store in &self.stores {
			store.close()?;
		}
		self.stores = open_stores(&self.dir, &self.layout, &self.defs, &self.shutdown, self.read_only)?;
		Ok(())
	}

	/// Inserts a column, writing `init` into every existing row.
	pub fn insert_column(
		&mut self,
		table: &str,
		position: usize,
		column: Column,
		init: Value,
	) -> Result<()> {
		let ti = self.table_index(table)?;
		let deltas = self.schema_op(|ctx| schema::insert_column(ctx, ti, position, column, init))?;
		let applied = refcount::apply(&self.stores, &deltas, &mut NoUnit);
		if applied.is_err() {
			self.poisoned.store(true, Ordering::Relaxed);
		}
		applied
	}

	pub fn remove_column(&mut self, table: &str, column: &str) -> Result<()> {
		let ti = self.table_index(table)?;
		let ci = self.stores[ti].column_index(column)?;
		self.schema_op(|ctx| schema::remove_column(ctx, ti, ci))
	}

	/// Changes a column's type, converting every stored value, through
	/// `changer` when one is given.
	pub fn modify_column(
		&mut self,
		table: &str,
		column: &str,
		new_column: Column,
		changer: Option<&ValueChanger<'_>>,
	) -> Result<()> {
		let ti = self.table_index(table)?;
		let ci = self.stores[ti].column_index(column)?;
		let (deltas, drop_counter_of) =
			self.schema_op(|ctx| schema::modify_column(ctx, ti, ci, new_column, changer))?;
		if let Err(e) = refcount::apply(&self.stores, &deltas, &mut NoUnit) {
			self.poisoned.store(true, Ordering::Relaxed);
			return Err(e);
		}
		if let Some(unreferenced) = drop_counter_of {
			// The old target lost its last referencing column; its counter
			// comes off now that the decrements have landed.
			self.schema_op(|ctx| schema::remove_ref_count(ctx, unreferenced))?;
		}
		Ok(())
	}

	/// Changes the row-reference width of a table, re-encoding every
	/// reference to it.
	pub fn change_row_ref_width(&mut self, table: &str, new_width: usize) -> Result<()> {
		let ti = self.table_index(table)?;
		self.schema_op(|ctx| schema::change_row_ref_width(ctx, ti, new_width))
	}

	/// Packs the live VL payload of a table to the front of its file and
	/// resets the deallocation counter.
	pub fn compact_vl(&mut self, table: &str) -> Result<()> {
		self.check_writable()?;
		let store = self.store(table)?;
		compact::compact_vl(store)
	}

	/// Packs out the gap blocks of a table, rewriting every reference to it.
	pub fn compact_fl(&mut self, table: &str) -> Result<()> {
		self.check_writable()?;
		let ti = self.table_index(table)?;
		compact::compact_fl(&self.stores, ti)
	}

	/// Checks the integrity of one table; `fix` repairs the VL accounting.
	pub fn verify(&self, table: &str, fix: bool) -> Result<()> {
		let _zone = self.zone.write();
		self.check_usable()?;
		let ti = self.table_index(table)?;
		verify::verify_store(&self.stores, ti, fix)
	}

	pub fn verify_all(&self, fix: bool) -> Result<()> {
		let _zone = self.zone.write();
		self.check_usable()?;
		for ti in 0..self.stores.len() {
			verify::verify_store(&self.stores, ti, fix)?;
		}
		Ok(())
	}

	/// Converts the whole database into a single RO file at `target`, which
	/// must be fresh. Runs inside a read zone, so writers cannot
	/// interleave.
	pub fn convert_to_ro(&self, target: &std::path::Path, regular_block_size: Option<usize>) -> Result<()> {
		let _zone = self.zone.read();
		self.check_usable()?;
		ro::convert(
			&self.stores,
			self.wr_cipher(),
			self.ro_cipher.as_deref(),
			target,
			regular_block_size.unwrap_or(ro::DEFAULT_REGULAR_BLOCK_SIZE),
		)
	}

	/// Writes gzipped copies of a table's backing files next to them, for
	/// cold backups.
	pub fn zip_files(&self, table: &str) -> Result<()> {
		let _zone = self.zone.write();
		self.check_usable()?;
		let store = self.store(table)?;
		let mut paths = vec![store.fl().file().path().to_path_buf()];
		if let Some(vl) = store.vl() {
			paths.push(vl.file().path().to_path_buf());
		}
		for path in paths {
			if !path.exists() {
				continue;
			}
			let mut gz_path = path.clone().into_os_string();
			gz_path.push(".gz");
			let source = std::fs::read(&path)?;
			let mut enc = flate2::write::GzEncoder::new(
				std::fs::File::create(std::path::PathBuf::from(gz_path))?,
				flate2::Compression::default(),
			);
			enc.write_all(&source)?;
			enc.finish()?.sync_data()?;
		}
		Ok(())
	}

	/// Removes a table's backing files. Maintenance only: the caller makes
	/// sure nothing references the table and drops it from the layout and
	/// definitions before reopening.
	pub fn delete_files(&mut self, table: &str) -> Result<()> {
		self.check_writable()?;
		let store = self.store(table)?;
		store.delete_files()?;
		log::warn!(target: "rowdb", "{}: backing files deleted", table);
		Ok(())
	}

	/// Closes every backing file and rejects all further operations.
	pub fn close(self) -> Result<()> {
		for store in &self.stores {
			store.close()?;
		}
		self.shutdown.store(true, Ordering::Relaxed);
		log::info!(target: "rowdb", "Closed database {:?}", self.dir);
		Ok(())
	}
}

impl Drop for Database {
	fn drop(&mut self) {
		for store in &self.stores {
			let _ = store.close();
		}
		self.shutdown.store(true, Ordering::Relaxed);
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::types::{ColumnType, Scheme, SimpleKind, SimpleType};
	use crate::util;
	use crate::value::Value;

	struct TempDir(std::path::PathBuf);

	impl TempDir {
		fn new(name: &'static str) -> TempDir {
			env_logger::try_init().ok();
			let mut path = std::env::temp_dir();
			path.push("rowdb-test");
			path.push("db");
			path.push(name);
			if path.exists() {
				std::fs::remove_dir_all(&path).unwrap();
			}
			std::fs::create_dir_all(&path).unwrap();
			TempDir(path)
		}
	}

	impl Drop for TempDir {
		fn drop(&mut self) {
			if self.0.exists() {
				std::fs::remove_dir_all(&self.0).unwrap();
			}
		}
	}

	struct AddOne;

	impl Cipher for AddOne {
		fn encrypt(&self, data: &mut [u8]) -> Result<()> {
			for b in data.iter_mut() {
				*b = b.wrapping_add(1);
			}
			Ok(())
		}

		fn decrypt(&self, data: &mut [u8]) -> Result<()> {
			for b in data.iter_mut() {
				*b = b.wrapping_sub(1);
			}
			Ok(())
		}
	}

	fn int(length: u32, nullable: bool) -> ColumnType {
		ColumnType::Simple(SimpleType {
			kind: SimpleKind::Int,
			scheme: Scheme::InRow,
			length,
			variable: false,
			nullable,
		})
	}

	fn utf8_outrow(length: u32) -> ColumnType {
		ColumnType::Simple(SimpleType {
			kind: SimpleKind::Utf8,
			scheme: Scheme::OutRow,
			length,
			variable: true,
			nullable: true,
		})
	}

	fn col(name: &str, ty: ColumnType) -> Column {
		Column { name: name.into(), ty }
	}

	fn table(name: &str, columns: Vec<Column>, row_ref: usize) -> TableDef {
		TableDef {
			name: name.into(),
			columns,
			nobs_row_ref: row_ref,
			nobs_outrow_ptr: Some(4),
			nobs_ref_count: Some(2),
		}
	}

	fn person_config(dir: &TempDir) -> DatabaseConfig {
		DatabaseConfig::new(
			dir.0.clone(),
			vec![table("person", vec![col("id", int(4, false)), col("name", utf8_outrow(100))], 2)],
		)
	}

	#[test]
	fn s1_insert_update_delete_with_outrow() {
		let dir = TempDir::new("s1");
		let db = Database::open(person_config(&dir)).unwrap();
		let store = &db.stores[0];
		let n = store.n();
		assert_eq!(n, 10);

		assert_eq!(db.insert("person", &[Value::Int(7), "abc".into()]).unwrap(), 1);
		assert_eq!(store.fl().file().size().unwrap(), n);
		assert_eq!(store.vl().unwrap().file().size().unwrap(), 8 + 3);
		assert_eq!(store.vl().unwrap().deallocated(), 0);

		assert_eq!(db.insert("person", &[Value::Int(8), Value::Null]).unwrap(), 2);
		assert_eq!(store.fl().file().size().unwrap(), 2 * n);
		assert_eq!(store.vl().unwrap().file().size().unwrap(), 8 + 3);

		// Longer payload: the old area is abandoned, a new one appended.
		db.update("person", 1, &[("name", "abcdef".into())]).unwrap();
		assert_eq!(store.vl().unwrap().file().size().unwrap(), 8 + 3 + 6);
		assert_eq!(store.vl().unwrap().deallocated(), 3);
		assert_eq!(db.get("person", 1).unwrap(), vec![Value::Int(7), "abcdef".into()]);

		db.delete("person", 2).unwrap();
		assert_eq!(db.number_of_rows("person").unwrap(), 1);
		assert!(matches!(db.get("person", 2), Err(Error::IllegalReference(_))));

		// The next insert reuses the gap.
		assert_eq!(db.insert("person", &[Value::Int(9), "x".into()]).unwrap(), 2);
		assert_eq!(db.number_of_rows("person").unwrap(), 2);
		assert_eq!(store.fl().file().size().unwrap(), 2 * n);
		db.verify_all(false).unwrap();
	}

	#[test]
	fn s2_self_reference_delete_constraint() {
		let dir = TempDir::new("s2");
		let defs = vec![table(
			"t",
			vec![col("id", int(1, false)), col("parent", ColumnType::Reference { table: "t".into() })],
			2,
		)];
		let db = Database::open(DatabaseConfig::new(dir.0.clone(), defs)).unwrap();
		for i in 1..=3 {
			db.insert("t", &[Value::Int(i), Value::Null]).unwrap();
		}
		db.update("t", 2, &[("parent", Value::Ref(1))]).unwrap();
		db.update("t", 3, &[("parent", Value::Ref(1))]).unwrap();
		db.verify_all(false).unwrap();

		assert!(matches!(db.delete("t", 1), Err(Error::DeleteConstraint(_))));

		db.update("t", 2, &[("parent", Value::Null)]).unwrap();
		db.update("t", 3, &[("parent", Value::Null)]).unwrap();
		db.delete("t", 1).unwrap();
		assert_eq!(db.number_of_rows("t").unwrap(), 2);
		assert_eq!(db.rows("t").unwrap(), vec![2, 3]);
		db.verify_all(false).unwrap();
	}

	#[test]
	fn s3_nullability_widening() {
		let dir = TempDir::new("s3");
		let defs = vec![TableDef {
			name: "t".into(),
			columns: vec![col("c", int(1, false))],
			nobs_row_ref: 2,
			nobs_outrow_ptr: None,
			nobs_ref_count: None,
		}];
		let mut db = Database::open(DatabaseConfig::new(dir.0.clone(), defs)).unwrap();
		for v in [10u64, 20, 30, 40, 50] {
			db.insert("t", &[Value::Int(v)]).unwrap();
		}
		assert_eq!(db.stores[0].n(), 8);

		db.modify_column("t", "c", col("c", int(1, true)), None).unwrap();
		assert_eq!(db.stores[0].n(), 8);
		for (row, v) in [10u64, 20, 30, 40, 50].iter().enumerate() {
			assert_eq!(db.get("t", row as u64 + 1).unwrap(), vec![Value::Int(*v)]);
		}
		let row = db.insert("t", &[Value::Null]).unwrap();
		assert_eq!(db.get("t", row).unwrap(), vec![Value::Null]);
		db.verify_all(false).unwrap();
	}

	#[test]
	fn s4_vl_compaction() {
		let dir = TempDir::new("s4");
		let db = Database::open(person_config(&dir)).unwrap();
		db.insert("person", &[Value::Int(1), Value::Str("a".repeat(10))]).unwrap();
		db.insert("person", &[Value::Int(2), Value::Str("b".repeat(20))]).unwrap();
		db.insert("person", &[Value::Int(3), Value::Str("c".repeat(30))]).unwrap();
		let vl_size = db.stores[0].vl().unwrap().file().size().unwrap();
		assert_eq!(vl_size, 8 + 60);

		db.delete("person", 2).unwrap();
		// Shorter payload rewrites the stored area in place.
		db.update("person", 1, &[("name", Value::Str("d".repeat(5)))]).unwrap();
		assert_eq!(db.stores[0].vl().unwrap().deallocated(), 20 + 5);
		assert_eq!(db.stores[0].vl().unwrap().file().size().unwrap(), 8 + 60);

		let mut db = db;
		db.compact_vl("person").unwrap();
		assert_eq!(db.stores[0].vl().unwrap().deallocated(), 0);
		assert_eq!(db.stores[0].vl().unwrap().file().size().unwrap(), 8 + 35);
		assert_eq!(db.get("person", 1).unwrap(), vec![Value::Int(1), Value::Str("d".repeat(5))]);
		assert_eq!(db.get("person", 3).unwrap(), vec![Value::Int(3), Value::Str("c".repeat(30))]);
		db.verify_all(false).unwrap();
	}

	#[test]
	fn s5_fl_compaction_rewrites_references() {
		let dir = TempDir::new("s5");
		let defs = vec![
			TableDef {
				name: "u".into(),
				columns: vec![col("v", int(1, false))],
				nobs_row_ref: 2,
				nobs_outrow_ptr: None,
				nobs_ref_count: Some(2),
			},
			TableDef {
				name: "v".into(),
				columns: vec![col("r", ColumnType::Reference { table: "u".into() })],
				nobs_row_ref: 2,
				nobs_outrow_ptr: None,
				nobs_ref_count: None,
			},
		];
		let mut db = Database::open(DatabaseConfig::new(dir.0.clone(), defs)).unwrap();
		for v in [10u64, 20, 30, 40] {
			db.insert("u", &[Value::Int(v)]).unwrap();
		}
		db.insert("v", &[Value::Ref(1)]).unwrap();
		db.insert("v", &[Value::Ref(3)]).unwrap();
		db.insert("v", &[Value::Ref(4)]).unwrap();
		db.delete("u", 2).unwrap();
		db.verify_all(false).unwrap();

		db.compact_fl("u").unwrap();
		assert_eq!(db.stores[0].fl().block_count(), 3);
		assert_eq!(db.stores[0].fl().gap_count(), 0);
		assert_eq!(db.get("v", 1).unwrap(), vec![Value::Ref(1)]);
		assert_eq!(db.get("v", 2).unwrap(), vec![Value::Ref(2)]);
		assert_eq!(db.get("v", 3).unwrap(), vec![Value::Ref(3)]);
		assert_eq!(db.get("u", 2).unwrap(), vec![Value::Int(30)]);
		assert_eq!(db.get("u", 3).unwrap(), vec![Value::Int(40)]);
		db.verify_all(false).unwrap();
	}

	fn gunzip(bytes: &[u8]) -> Vec<u8> {
		use std::io::Read;
		let mut out = Vec::new();
		flate2::read::GzDecoder::new(bytes).read_to_end(&mut out).unwrap();
		out
	}

	fn doc_value(section: &crate::layout::Section, key: &str) -> u64 {
		section.1.iter().find(|(k, _)| k == key).unwrap().1.parse().unwrap()
	}

	fn decode_ro_row(store: &WrStore, ro_widths: &[usize], bytes: &[u8]) -> Vec<Value> {
		let parts: Vec<usize> = (0..store.columns().len())
			.filter(|&c| crate::ro::in_ro_null_info(&store.columns()[c]))
			.collect();
		let bm_len = (parts.len() + 7) / 8;
		let nulls: Vec<bool> = (0..store.columns().len())
			.map(|c| match parts.iter().position(|&p| p == c) {
				Some(i) => bytes[i / 8] & (0x80 >> (i % 8)) != 0,
				None => false,
			})
			.collect();
		let mut at = bm_len;
		let mut lens = vec![0u64; store.columns().len()];
		for (c, ci) in store.columns().iter().enumerate() {
			if ci.ty.has_outrow() {
				let w = ci.target.map_or(0, |t| ro_widths[t]);
				let ll = crate::ro::ro_len_len(ci, w);
				lens[c] = util::read_uint(&bytes[at..], ll);
				at += ll;
			}
		}
		let mut values = Vec::new();
		for (c, ci) in store.columns().iter().enumerate() {
			let w = ci.target.map_or(0, |t| ro_widths[t]);
			match &ci.ty {
				ColumnType::Simple(st) if st.scheme == Scheme::InRow => {
					let slot = st.inrow_len() as usize;
					if nulls[c] {
						values.push(Value::Null);
					} else {
						match st.kind {
							SimpleKind::Int => {
								values.push(Value::Int(util::read_uint(&bytes[at..], st.length as usize)));
							}
							_ => panic!("not used by this test"),
						}
					}
					at += slot;
				}
				ColumnType::Simple(st) => {
					let len = lens[c] as usize;
					if nulls[c] {
						values.push(Value::Null);
					} else {
						let body = &bytes[at..at + len];
						match st.kind {
							SimpleKind::Utf8 => {
								values.push(Value::Str(String::from_utf8(body.to_vec()).unwrap()));
							}
							_ => panic!("not used by this test"),
						}
					}
					at += len;
				}
				ColumnType::ArrayOfRef { scheme: Scheme::InRow, .. } => {
					let reserved = ci.ty.max_payload(w) as usize;
					if nulls[c] {
						values.push(Value::Null);
					} else {
						let size = util::read_uint(&bytes[at..], ci.ty.size_len());
						let mut elems = Vec::new();
						for i in 0..size as usize {
							let r = util::read_uint(&bytes[at + ci.ty.size_len() + i * w..], w);
							elems.push(if r == 0 { Value::Null } else { Value::Ref(r) });
						}
						values.push(Value::Array(elems));
					}
					at += reserved;
				}
				_ => panic!("not used by this test"),
			}
		}
		values
	}

	fn read_ro_rows(
		path: &std::path::Path,
		db: &Database,
		table: &str,
		ro_cipher: Option<&dyn Cipher>,
	) -> Vec<Vec<Value>> {
		let data = std::fs::read(path).unwrap();
		let layout_pos = util::read_uint(&data, 8) as usize;
		let doc = String::from_utf8(gunzip(&data[layout_pos..])).unwrap();
		let sections = crate::layout::parse_doc(&doc).unwrap();
		let ro_widths: Vec<usize> = sections
			.iter()
			.map(|s| doc_value(s, crate::layout::KEY_NOBS_ROW_REF) as usize)
			.collect();
		let section = sections.iter().find(|s| s.0 == table).unwrap();
		let data_pos = doc_value(section, crate::ro::KEY_DATA_POS) as usize;
		let blocks = doc_value(section, crate::ro::KEY_DATA_BLOCKS) as usize;
		let tables_pos = doc_value(section, crate::ro::KEY_TABLES_POS) as usize;
		let tables_len = doc_value(section, crate::ro::KEY_TABLES_LEN) as usize;
		let n_rows = doc_value(section, crate::ro::KEY_NOF_ROWS) as usize;
		let unpacked_size = doc_value(section, crate::ro::KEY_UNPACKED_SIZE) as usize;
		let nobs_row_ptr = doc_value(section, crate::ro::KEY_NOBS_ROW_PTR) as usize;
		let nobs_block_size = doc_value(section, crate::ro::KEY_NOBS_BLOCK_SIZE) as usize;

		let tables = gunzip(&data[tables_pos..tables_pos + tables_len]);
		let row_ptrs: Vec<usize> = (0..n_rows)
			.map(|i| util::read_uint(&tables[i * nobs_row_ptr..], nobs_row_ptr) as usize)
			.collect();
		let sizes: Vec<usize> = (0..blocks)
			.map(|i| {
				util::read_uint(&tables[n_rows * nobs_row_ptr + i * nobs_block_size..], nobs_block_size)
					as usize
			})
			.collect();

		let mut unpacked = Vec::new();
		let mut at = data_pos;
		for &s in &sizes {
			let mut block = data[at..at + s].to_vec();
			if let Some(cipher) = ro_cipher {
				cipher.decrypt(&mut block).unwrap();
			}
			unpacked.extend_from_slice(&gunzip(&block));
			at += s;
		}
		assert_eq!(unpacked.len(), unpacked_size);

		let store = &db.stores[db.table_index(table).unwrap()];
		(0..n_rows)
			.map(|i| {
				let start = row_ptrs[i];
				let end = if i + 1 < n_rows { row_ptrs[i + 1] } else { unpacked_size };
				decode_ro_row(store, &ro_widths, &unpacked[start..end])
			})
			.collect()
	}

	#[test]
	fn s6_wr_ro_round_trip() {
		let dir = TempDir::new("s6");
		let defs = vec![TableDef {
			name: "person".into(),
			columns: vec![
				col("id", int(4, false)),
				col("text", utf8_outrow(50)),
				col("friends", ColumnType::ArrayOfRef {
					table: "person".into(),
					scheme: Scheme::InRow,
					max_size: 2,
				}),
			],
			nobs_row_ref: 2,
			nobs_outrow_ptr: Some(4),
			nobs_ref_count: Some(2),
		}];
		let mut config = DatabaseConfig::new(dir.0.clone(), defs);
		config.wr_cipher = Some(Arc::new(AddOne));
		config.ro_cipher = Some(Arc::new(AddOne));
		let db = Database::open(config).unwrap();

		db.insert("person", &[Value::Int(1), "one".into(), Value::Array(vec![])]).unwrap();
		db.insert("person", &[Value::Int(2), "two".into(), Value::Array(vec![])]).unwrap();
		db.insert("person", &[Value::Int(3), Value::Null, Value::Array(vec![])]).unwrap();
		db.update("person", 2, &[("friends", Value::Array(vec![Value::Ref(3)]))]).unwrap();
		db.update("person", 3, &[("friends", Value::Array(vec![Value::Ref(2)]))]).unwrap();
		db.delete("person", 1).unwrap();
		db.verify_all(false).unwrap();

		let target = dir.0.join("archive.ro");
		db.convert_to_ro(&target, Some(32)).unwrap();

		let rows = read_ro_rows(&target, &db, "person", Some(&AddOne));
		assert_eq!(rows.len(), 2);
		// References are rewritten for the packed-out gap.
		assert_eq!(rows[0], vec![Value::Int(2), "two".into(), Value::Array(vec![Value::Ref(2)])]);
		assert_eq!(rows[1], vec![Value::Int(3), Value::Null, Value::Array(vec![Value::Ref(1)])]);
	}

	#[test]
	fn round_trip_arrays_and_crypto() {
		let dir = TempDir::new("round-trip");
		let defs = vec![TableDef {
			name: "t".into(),
			columns: vec![
				col("id", int(8, false)),
				col("tags", ColumnType::ArrayOfSimple {
					elem: SimpleType {
						kind: SimpleKind::Utf8,
						scheme: Scheme::InRow,
						length: 6,
						variable: true,
						nullable: true,
					},
					scheme: Scheme::InRow,
					max_size: 3,
				}),
				col("blob", ColumnType::Simple(SimpleType {
					kind: SimpleKind::Bytes,
					scheme: Scheme::OutRow,
					length: 500,
					variable: true,
					nullable: true,
				})),
				col("marks", ColumnType::ArrayOfSimple {
					elem: SimpleType {
						kind: SimpleKind::Int,
						scheme: Scheme::InRow,
						length: 2,
						variable: false,
						nullable: false,
					},
					scheme: Scheme::OutRow,
					max_size: 100,
				}),
			],
			nobs_row_ref: 2,
			nobs_outrow_ptr: Some(4),
			nobs_ref_count: None,
		}];
		let mut config = DatabaseConfig::new(dir.0.clone(), defs);
		config.wr_cipher = Some(Arc::new(AddOne));
		let db = Database::open(config).unwrap();

		let rows: Vec<Vec<Value>> = vec![
			vec![
				Value::Int(u64::MAX),
				Value::Array(vec!["a".into(), Value::Null, "sixsix".into()]),
				Value::Bytes(vec![0, 1, 2, 255]),
				Value::Array(vec![Value::Int(7), Value::Int(65535)]),
			],
			vec![
				Value::Int(0),
				Value::Array(vec![]),
				Value::Null,
				Value::Array(vec![]),
			],
			vec![
				Value::Int(1),
				Value::Null,
				Value::Bytes(vec![]),
				Value::Null,
			],
		];
		for row in &rows {
			db.insert("t", row).unwrap();
		}
		for (i, row) in rows.iter().enumerate() {
			assert_eq!(&db.get("t", i as u64 + 1).unwrap(), row);
		}
		db.verify_all(false).unwrap();
	}

	#[test]
	fn update_without_change_is_byte_identical() {
		let dir = TempDir::new("idempotent");
		let db = Database::open(person_config(&dir)).unwrap();
		db.insert("person", &[Value::Int(5), "hello".into()]).unwrap();
		let fl_before = std::fs::read(db.stores[0].fl().file().path()).unwrap();
		let vl_before = std::fs::read(db.stores[0].vl().unwrap().file().path()).unwrap();

		db.update("person", 1, &[("id", Value::Int(5)), ("name", "hello".into())]).unwrap();

		assert_eq!(std::fs::read(db.stores[0].fl().file().path()).unwrap(), fl_before);
		assert_eq!(std::fs::read(db.stores[0].vl().unwrap().file().path()).unwrap(), vl_before);
	}

	#[test]
	fn failed_insert_rolls_back() {
		let dir = TempDir::new("rollback");
		let defs = vec![table(
			"t",
			vec![
				col("name", utf8_outrow(100)),
				col("next", ColumnType::Reference { table: "t".into() }),
			],
			2,
		)];
		let db = Database::open(DatabaseConfig::new(dir.0.clone(), defs)).unwrap();
		db.insert("t", &[Value::Str("first".into()), Value::Null]).unwrap();
		let fl_size = db.stores[0].fl().file().size().unwrap();
		let vl_size = db.stores[0].vl().unwrap().file().size().unwrap();

		// The reference is checked after the name's payload went to the VL
		// file; rollback must take that allocation back.
		let err = db.insert("t", &[Value::Str("second".into()), Value::Ref(9)]);
		assert!(matches!(err, Err(Error::IllegalReference(_))));
		assert_eq!(db.stores[0].fl().file().size().unwrap(), fl_size);
		assert_eq!(db.stores[0].vl().unwrap().file().size().unwrap(), vl_size);
		assert_eq!(db.number_of_rows("t").unwrap(), 1);

		// The database stays usable.
		db.insert("t", &[Value::Str("third".into()), Value::Ref(1)]).unwrap();
		db.verify_all(false).unwrap();
	}

	#[test]
	fn insert_and_remove_column() {
		let dir = TempDir::new("schema-cols");
		let defs = vec![TableDef {
			name: "t".into(),
			columns: vec![col("a", int(2, false))],
			nobs_row_ref: 2,
			nobs_outrow_ptr: None,
			nobs_ref_count: None,
		}];
		let mut db = Database::open(DatabaseConfig::new(dir.0.clone(), defs)).unwrap();
		for v in [100u64, 200, 300] {
			db.insert("t", &[Value::Int(v)]).unwrap();
		}

		// An outrow column arrives with the VL file.
		db.insert_column("t", 1, col("b", utf8_outrow(40)), Value::Null).unwrap();
		assert!(db.stores[0].vl().is_some());
		assert_eq!(db.get("t", 2).unwrap(), vec![Value::Int(200), Value::Null]);
		db.update("t", 2, &[("b", "hi".into())]).unwrap();

		// A non-null constant init lands in every existing row.
		db.insert_column("t", 0, col("c", int(1, false)), Value::Int(7)).unwrap();
		assert_eq!(db.get("t", 2).unwrap(), vec![Value::Int(7), Value::Int(200), "hi".into()]);
		db.verify_all(false).unwrap();

		db.remove_column("t", "c").unwrap();
		assert_eq!(db.get("t", 2).unwrap(), vec![Value::Int(200), "hi".into()]);

		// Dropping the last outrow column drops the VL file with it.
		let vl_path = db.stores[0].vl().unwrap().file().path().to_path_buf();
		db.remove_column("t", "b").unwrap();
		assert!(db.stores[0].vl().is_none());
		assert!(!vl_path.exists());
		assert_eq!(db.get("t", 2).unwrap(), vec![Value::Int(200)]);
		db.verify_all(false).unwrap();
	}

	#[test]
	fn reference_column_installs_and_removes_counter() {
		let dir = TempDir::new("schema-refs");
		let defs = vec![
			TableDef {
				name: "t".into(),
				columns: vec![col("a", int(1, false))],
				nobs_row_ref: 2,
				nobs_outrow_ptr: None,
				nobs_ref_count: None,
			},
			TableDef {
				name: "u".into(),
				columns: vec![col("b", int(1, false))],
				nobs_row_ref: 2,
				nobs_outrow_ptr: None,
				nobs_ref_count: None,
			},
		];
		let mut db = Database::open(DatabaseConfig::new(dir.0.clone(), defs)).unwrap();
		db.insert("t", &[Value::Int(1)]).unwrap();
		db.insert("u", &[Value::Int(2)]).unwrap();
		assert_eq!(db.stores[1].nobs_ref_count(), 0);

		db.insert_column("t", 1, col("r", ColumnType::Reference { table: "u".into() }), Value::Ref(1))
			.unwrap();
		assert!(db.stores[1].nobs_ref_count() > 0);
		db.verify_all(false).unwrap();
		assert!(matches!(db.delete("u", 1), Err(Error::DeleteConstraint(_))));

		db.remove_column("t", "r").unwrap();
		assert_eq!(db.stores[1].nobs_ref_count(), 0);
		db.delete("u", 1).unwrap();
		db.verify_all(false).unwrap();
	}

	#[test]
	fn modify_column_width_and_changer() {
		let dir = TempDir::new("schema-modify");
		let defs = vec![TableDef {
			name: "t".into(),
			columns: vec![col("a", int(1, false))],
			nobs_row_ref: 2,
			nobs_outrow_ptr: None,
			nobs_ref_count: None,
		}];
		let mut db = Database::open(DatabaseConfig::new(dir.0.clone(), defs)).unwrap();
		for v in [1u64, 2, 3] {
			db.insert("t", &[Value::Int(v)]).unwrap();
		}

		// Widening the integer re-encodes every row.
		db.modify_column("t", "a", col("a", int(4, false)), None).unwrap();
		assert_eq!(db.get("t", 3).unwrap(), vec![Value::Int(3)]);
		db.insert("t", &[Value::Int(1 << 20)]).unwrap();

		// A changer transforms the stored values on the way.
		db.modify_column(
			"t",
			"a",
			col("a", int(4, false)),
			Some(&|v: Value| match v {
				Value::Int(i) => Ok(Value::Int(i * 10)),
				other => Ok(other),
			}),
		)
		.unwrap();
		assert_eq!(db.get("t", 1).unwrap(), vec![Value::Int(10)]);
		assert_eq!(db.get("t", 4).unwrap(), vec![Value::Int(10 << 20)]);
		db.verify_all(false).unwrap();
	}

	#[test]
	fn change_row_ref_width_recodes_references() {
		let dir = TempDir::new("schema-width");
		let defs = vec![
			TableDef {
				name: "u".into(),
				columns: vec![col("v", int(1, false))],
				nobs_row_ref: 2,
				nobs_outrow_ptr: None,
				nobs_ref_count: Some(2),
			},
			TableDef {
				name: "w".into(),
				columns: vec![
					col("r", ColumnType::Reference { table: "u".into() }),
					col("rs", ColumnType::ArrayOfRef {
						table: "u".into(),
						scheme: Scheme::InRow,
						max_size: 2,
					}),
				],
				nobs_row_ref: 2,
				nobs_outrow_ptr: None,
				nobs_ref_count: None,
			},
		];
		let mut db = Database::open(DatabaseConfig::new(dir.0.clone(), defs)).unwrap();
		for v in [5u64, 6] {
			db.insert("u", &[Value::Int(v)]).unwrap();
		}
		db.insert("w", &[Value::Ref(2), Value::Array(vec![Value::Ref(1), Value::Ref(2)])]).unwrap();

		db.change_row_ref_width("u", 1).unwrap();
		assert_eq!(db.stores[1].columns()[0].len, 1);
		assert_eq!(
			db.get("w", 1).unwrap(),
			vec![Value::Ref(2), Value::Array(vec![Value::Ref(1), Value::Ref(2)])]
		);
		db.verify_all(false).unwrap();

		db.change_row_ref_width("u", 3).unwrap();
		assert_eq!(
			db.get("w", 1).unwrap(),
			vec![Value::Ref(2), Value::Array(vec![Value::Ref(1), Value::Ref(2)])]
		);
		db.verify_all(false).unwrap();
	}

	#[test]
	fn truncate_decrements_other_tables() {
		let dir = TempDir::new("truncate");
		let defs = vec![
			TableDef {
				name: "u".into(),
				columns: vec![col("v", int(1, false))],
				nobs_row_ref: 2,
				nobs_outrow_ptr: None,
				nobs_ref_count: Some(2),
			},
			TableDef {
				name: "w".into(),
				columns: vec![col("r", ColumnType::Reference { table: "u".into() })],
				nobs_row_ref: 2,
				nobs_outrow_ptr: None,
				nobs_ref_count: None,
			},
		];
		let db = Database::open(DatabaseConfig::new(dir.0.clone(), defs)).unwrap();
		db.insert("u", &[Value::Int(1)]).unwrap();
		db.insert("w", &[Value::Ref(1)]).unwrap();

		db.truncate("w").unwrap();
		assert_eq!(db.number_of_rows("w").unwrap(), 0);
		// The reference is gone, so the row can be deleted now.
		db.delete("u", 1).unwrap();
		db.verify_all(false).unwrap();
	}

	#[test]
	fn reopen_persists_rows() {
		let dir = TempDir::new("reopen");
		{
			let db = Database::open(person_config(&dir)).unwrap();
			db.insert("person", &[Value::Int(1), "keep".into()]).unwrap();
			db.insert("person", &[Value::Int(2), Value::Null]).unwrap();
			db.delete("person", 2).unwrap();
			db.close().unwrap();
		}
		let db = Database::open(person_config(&dir)).unwrap();
		assert_eq!(db.number_of_rows("person").unwrap(), 1);
		assert_eq!(db.get("person", 1).unwrap(), vec![Value::Int(1), "keep".into()]);
		// The gap survives the reopen and is reused.
		assert_eq!(db.insert("person", &[Value::Int(3), Value::Null]).unwrap(), 2);
		db.verify_all(false).unwrap();
	}

	#[test]
	fn row_reference_width_limits_inserts() {
		let dir = TempDir::new("row-limit");
		let defs = vec![TableDef {
			name: "t".into(),
			columns: vec![col("a", int(1, false))],
			nobs_row_ref: 1,
			nobs_outrow_ptr: None,
			nobs_ref_count: None,
		}];
		let db = Database::open(DatabaseConfig::new(dir.0.clone(), defs)).unwrap();
		for i in 0..255u64 {
			db.insert("t", &[Value::Int(i % 250)]).unwrap();
		}
		assert!(matches!(db.insert("t", &[Value::Int(0)]), Err(Error::Maximum(_))));
		// A gap keeps the table usable at the limit.
		db.delete("t", 17).unwrap();
		assert_eq!(db.insert("t", &[Value::Int(9)]).unwrap(), 17);
	}

	#[test]
	fn empty_array_columns_at_zero_max_size() {
		let dir = TempDir::new("zero-max");
		let defs = vec![TableDef {
			name: "t".into(),
			columns: vec![
				col("a", int(1, false)),
				col("xs", ColumnType::ArrayOfRef { table: "t".into(), scheme: Scheme::InRow, max_size: 0 }),
			],
			nobs_row_ref: 2,
			nobs_outrow_ptr: None,
			nobs_ref_count: Some(1),
		}];
		let db = Database::open(DatabaseConfig::new(dir.0.clone(), defs)).unwrap();
		db.insert("t", &[Value::Int(1), Value::Array(vec![])]).unwrap();
		assert_eq!(db.get("t", 1).unwrap(), vec![Value::Int(1), Value::Array(vec![])]);
		assert!(matches!(
			db.insert("t", &[Value::Int(2), Value::Array(vec![Value::Ref(1)])]),
			Err(Error::Maximum(_))
		));
		db.verify_all(false).unwrap();
	}
}
