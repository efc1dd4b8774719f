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

use crate::error::Result;

/// Length-preserving in-place cipher. The WR cipher is applied to stored
/// value bytes (never to lengths, sizes, pointers or row references); the RO
/// cipher is applied to each packed block of the RO file. Implementations
/// report failures as `Error::Crypto`.
pub trait Cipher: Send + Sync {
	fn encrypt(&self, data: &mut [u8]) -> Result<()>;
	fn decrypt(&self, data: &mut [u8]) -> Result<()>;
}
