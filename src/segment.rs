// Copyright 2023 Strixpyrr
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Fixed-size, exclusively-owned byte segments.
//!
//! Unlike a general-purpose IO buffer, a join segment is never shared between two
//! owners at once: it moves from the [pool](crate::pool) to a partition or the
//! bucket table and back, never aliased. This makes the memory model a plain boxed
//! array with a write cursor, not a copy-on-write `Rc` as in a general buffering
//! library.

use std::fmt;

/// The default segment size, 32 KiB, large enough that a handful of segments hold
/// a useful amount of build-side data without growing the partition fan-out past
/// what a single byte (0..127) can address.
pub const DEFAULT_SEGMENT_SIZE: usize = 32 * 1024;

/// The fixed size of one hash bucket, in bytes. See the bucket layout in
/// [`crate::bucket`].
pub const HASH_BUCKET_SIZE: usize = 1024;

/// A fixed-size, power-of-two-length byte region with random-access read and
/// write at any offset. Segments are neither copied nor resized; ownership moves
/// between the segment pool, partitions, and the bucket table.
pub struct Segment<const S: usize> {
	data: Box<[u8; S]>,
	/// Write cursor: number of bytes written from the front. Partitions append
	/// length-delimited records here; the bucket table instead treats a segment
	/// as `S / HASH_BUCKET_SIZE` independently-addressed buckets and ignores the
	/// cursor.
	len: usize,
}

impl<const S: usize> Segment<S> {
	/// Creates a fresh, zeroed segment.
	pub fn new() -> Self {
		assert!(S.is_power_of_two() && S >= HASH_BUCKET_SIZE, "segment size must be a power of two >= {HASH_BUCKET_SIZE}");
		Self {
			data: Box::new([0; S]),
			len: 0,
		}
	}

	/// Reconstructs a segment from raw parts -- used by [`crate::io`] readers
	/// replaying a spill file back into segments.
	pub(crate) fn from_parts(data: Box<[u8; S]>, len: usize) -> Self {
		Self { data, len }
	}

	/// The fixed capacity of every segment.
	pub const fn capacity() -> usize { S }

	/// The number of bytes written so far, from the front.
	pub fn len(&self) -> usize { self.len }

	/// The number of bytes that can still be written before the segment is full.
	pub fn remaining(&self) -> usize { S - self.len }

	pub fn is_empty(&self) -> bool { self.len == 0 }

	pub fn is_full(&self) -> bool { self.len == S }

	/// Resets the write cursor and zeroes the backing memory so a recycled
	/// segment never leaks a previous owner's data into a new one.
	pub fn clear(&mut self) {
		self.data.fill(0);
		self.len = 0;
	}

	/// A read-only view of the whole backing array, regardless of cursor.
	pub fn as_slice(&self) -> &[u8] { &self.data[..] }

	/// A mutable view of the whole backing array, regardless of cursor.
	pub fn as_mut_slice(&mut self) -> &mut [u8] { &mut self.data[..] }

	/// Reads `len` bytes at an arbitrary `offset`, irrespective of the write
	/// cursor. Used by the bucket table, which addresses buckets directly rather
	/// than appending.
	pub fn read_at(&self, offset: usize, len: usize) -> &[u8] {
		&self.data[offset..offset + len]
	}

	/// Mutably views `len` bytes at an arbitrary `offset`.
	pub fn read_at_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
		&mut self.data[offset..offset + len]
	}

	/// Writes `bytes` at an arbitrary `offset`, irrespective of the write cursor.
	pub fn write_at(&mut self, offset: usize, bytes: &[u8]) {
		self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
	}

	/// Appends `bytes` at the write cursor if they fit, advancing the cursor and
	/// returning `true`. Returns `false`, leaving the segment untouched, if there
	/// is not enough room -- the `BUFFER_FULL` signal of the partition insert
	/// protocol (see [`crate::partition`]).
	pub fn push(&mut self, bytes: &[u8]) -> bool {
		if bytes.len() > self.remaining() {
			return false;
		}
		let start = self.len;
		self.data[start..start + bytes.len()].copy_from_slice(bytes);
		self.len += bytes.len();
		true
	}

	/// The write cursor, i.e. the byte offset the next [`push`](Self::push) would
	/// start at.
	pub fn cursor(&self) -> usize { self.len }
}

impl<const S: usize> Default for Segment<S> {
	fn default() -> Self { Self::new() }
}

impl<const S: usize> fmt::Debug for Segment<S> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Segment")
			.field("capacity", &S)
			.field("len", &self.len)
			.finish()
	}
}
