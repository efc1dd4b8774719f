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

#[derive(Debug)]
pub enum Error {
	Io(std::io::Error),
	/// Argument shape: null where not allowed, wrong arity, out of range,
	/// incompatible type.
	Validation(String),
	/// Reference to a nonexistent row or a row gap.
	IllegalReference(String),
	/// A configured width or size limit would be exceeded.
	Maximum(String),
	/// Legal per the data model, but beyond what this implementation handles.
	ImplementationRestriction(String),
	/// Row is still referenced and cannot be deleted.
	DeleteConstraint(String),
	/// Cipher failure while encrypting or decrypting.
	Crypto(String),
	/// Recording a before image failed; the unit can no longer guarantee
	/// rollback.
	UnitBroken(String),
	/// On-disk state contradicts an invariant. Raised by the verifier.
	Corruption(String),
	/// Required layout entry is absent.
	MissingEntry(String),
	/// Layout entry present but ill-formed, or entries are inconsistent.
	InvalidConfiguration(String),
	/// Database opened read-only or the operation is illegal in this zone.
	ReadOnly,
	/// The database is shutting down; no further I/O is accepted.
	Shutdown,
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
	fn from(e: std::io::Error) -> Error {
		Error::Io(e)
	}
}

impl std::fmt::Display for Error {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		match self {
			Error::Io(e) => write!(f, "IO Error: {}", e),
			Error::Validation(d) => write!(f, "Validation error: {}", d),
			Error::IllegalReference(d) => write!(f, "Illegal reference: {}", d),
			Error::Maximum(d) => write!(f, "Maximum exceeded: {}", d),
			Error::ImplementationRestriction(d) => write!(f, "Implementation restriction: {}", d),
			Error::DeleteConstraint(d) => write!(f, "Delete constraint: {}", d),
			Error::Crypto(d) => write!(f, "Crypto error: {}", d),
			Error::UnitBroken(d) => write!(f, "Unit broken: {}", d),
			Error::Corruption(d) => write!(f, "Corruption: {}", d),
			Error::MissingEntry(d) => write!(f, "Missing layout entry: {}", d),
			Error::InvalidConfiguration(d) => write!(f, "Invalid configuration: {}", d),
			Error::ReadOnly => write!(f, "Database is read-only"),
			Error::Shutdown => write!(f, "Database is shutting down"),
		}
	}
}

impl std::error::Error for Error {}
