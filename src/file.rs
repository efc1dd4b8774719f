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

// Positional byte I/O over a single backing file. Handles are opened lazily
// on first access and stay open until `close` or shutdown. Writing past the
// end grows the file. A shared shutdown flag makes every subsequent call
// fail with `Error::Shutdown` once the database starts closing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use parking_lot::RwLock;
use crate::error::{Error, Result};

#[cfg(target_os = "macos")]
fn disable_read_ahead(file: &std::fs::File) -> Result<()> {
	use std::os::unix::io::AsRawFd;
	if unsafe { libc::fcntl(file.as_raw_fd(), libc::F_RDAHEAD, 0) } != 0 {
		Err(std::io::Error::last_os_error())?
	} else {
		Ok(())
	}
}

#[cfg(not(target_os = "macos"))]
fn disable_read_ahead(_file: &std::fs::File) -> Result<()> {
	Ok(())
}

pub struct DataFile {
	path: std::path::PathBuf,
	file: RwLock<Option<std::fs::File>>,
	shutdown: Arc<AtomicBool>,
	dirty: AtomicBool,
	read_only: bool,
}

impl DataFile {
	pub fn new(path: std::path::PathBuf, shutdown: Arc<AtomicBool>, read_only: bool) -> Arc<DataFile> {
		Arc::new(DataFile {
			path,
			file: RwLock::new(None),
			shutdown,
			dirty: AtomicBool::new(false),
			read_only,
		})
	}

	pub fn path(&self) -> &std::path::Path {
		&self.path
	}

	pub fn read_only(&self) -> bool {
		self.read_only
	}

	fn check_shutdown(&self) -> Result<()> {
		if self.shutdown.load(Ordering::Relaxed) {
			return Err(Error::Shutdown);
		}
		Ok(())
	}

	/// Opens the handle if it is not open yet. Creates the file when opened
	/// for writing.
	pub fn open(&self) -> Result<()> {
		self.check_shutdown()?;
		let mut guard = self.file.write();
		if guard.is_none() {
			let file = std::fs::OpenOptions::new()
				.read(true)
				.write(!self.read_only)
				.create(!self.read_only)
				.open(&self.path)?;
			disable_read_ahead(&file)?;
			log::trace!(target: "rowdb", "Opened {:?}", self.path);
			*guard = Some(file);
		}
		Ok(())
	}

	pub fn close(&self) -> Result<()> {
		self.sync()?;
		let mut guard = self.file.write();
		if guard.take().is_some() {
			log::trace!(target: "rowdb", "Closed {:?}", self.path);
		}
		Ok(())
	}

	fn with_file<T, F: FnOnce(&std::fs::File) -> Result<T>>(&self, f: F) -> Result<T> {
		self.check_shutdown()?;
		{
			let guard = self.file.read();
			if let Some(file) = guard.as_ref() {
				return f(file);
			}
		}
		self.open()?;
		let guard = self.file.read();
		match guard.as_ref() {
			Some(file) => f(file),
			None => Err(Error::Shutdown),
		}
	}

	#[cfg(unix)]
	pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
		use std::os::unix::fs::FileExt;
		self.with_file(|file| Ok(file.read_exact_at(buf, offset)?))
	}

	#[cfg(unix)]
	pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
		use std::os::unix::fs::FileExt;
		if self.read_only {
			return Err(Error::ReadOnly);
		}
		self.dirty.store(true, Ordering::Relaxed);
		self.with_file(|file| Ok(file.write_all_at(buf, offset)?))
	}

	#[cfg(windows)]
	pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
		use std::os::windows::fs::FileExt;
		self.with_file(|file| {
			let mut buf = buf;
			let mut offset = offset;
			while !buf.is_empty() {
				let n = file.seek_read(buf, offset)?;
				if n == 0 {
					return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
				}
				buf = &mut buf[n..];
				offset += n as u64;
			}
			Ok(())
		})
	}

	#[cfg(windows)]
	pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
		use std::os::windows::fs::FileExt;
		if self.read_only {
			return Err(Error::ReadOnly);
		}
		self.dirty.store(true, Ordering::Relaxed);
		self.with_file(|file| {
			let mut buf = buf;
			let mut offset = offset;
			while !buf.is_empty() {
				let n = file.seek_write(buf, offset)?;
				buf = &buf[n..];
				offset += n as u64;
			}
			Ok(())
		})
	}

	pub fn size(&self) -> Result<u64> {
		self.with_file(|file| Ok(file.metadata()?.len()))
	}

	pub fn truncate(&self, len: u64) -> Result<()> {
		if self.read_only {
			return Err(Error::ReadOnly);
		}
		self.dirty.store(true, Ordering::Relaxed);
		self.with_file(|file| Ok(file.set_len(len)?))
	}

	/// Fsyncs pending writes, if any were made through this handle.
	pub fn sync(&self) -> Result<()> {
		if let Ok(true) = self.dirty.compare_exchange(true, false, Ordering::Relaxed, Ordering::Relaxed) {
			return self.with_file(|file| Ok(file.sync_data()?));
		}
		Ok(())
	}

	/// Closes the handle and removes the backing file.
	pub fn delete(&self) -> Result<()> {
		{
			let mut guard = self.file.write();
			*guard = None;
		}
		if self.path.exists() {
			std::fs::remove_file(&self.path)?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn temp_file(name: &'static str) -> std::path::PathBuf {
		let mut path = std::env::temp_dir();
		path.push("rowdb-test");
		path.push("file");
		std::fs::create_dir_all(&path).unwrap();
		path.push(name);
		if path.exists() {
			std::fs::remove_file(&path).unwrap();
		}
		path
	}

	#[test]
	fn grows_on_write_past_end() {
		let path = temp_file("grow");
		let shutdown = Arc::new(AtomicBool::new(false));
		let file = DataFile::new(path, shutdown, false);
		file.write_at(&[1, 2, 3], 100).unwrap();
		assert_eq!(file.size().unwrap(), 103);
		let mut buf = [0u8; 3];
		file.read_at(&mut buf, 100).unwrap();
		assert_eq!(buf, [1, 2, 3]);
		file.delete().unwrap();
	}

	#[test]
	fn shutdown_rejects_io() {
		let path = temp_file("shutdown");
		let shutdown = Arc::new(AtomicBool::new(false));
		let file = DataFile::new(path, shutdown.clone(), false);
		file.write_at(&[0u8; 8], 0).unwrap();
		shutdown.store(true, Ordering::Relaxed);
		assert!(matches!(file.read_at(&mut [0u8; 8], 0), Err(Error::Shutdown)));
	}
}
