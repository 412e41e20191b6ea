// SPDX-License-Identifier: Apache-2.0

//! The bucket table: a fixed array of 1024-byte buckets overlaid on segments,
//! mapping the low bits of a record's bucket hash to a partition and to the
//! (hash, pointer) entries -- or, once that partition has spilled, to a
//! degraded bit vector.

use all_asserts::assert_le;

use crate::error::{JoinError, Result};
use crate::hash;
use crate::partition::Pointer;
use crate::pool::SegmentPool;
use crate::segment::{Segment, HASH_BUCKET_SIZE};

const OFF_PARTITION: usize = 0;
const OFF_STATUS: usize = 1;
const OFF_COUNT: usize = 2;
const OFF_FORWARD: usize = 4;
const OFF_HEADER_END: usize = 12;

/// `⌊(1024 − 12) / 12⌋` -- the number of (hash, pointer) slots a bucket holds
/// before it must chain to an overflow bucket.
const HASH_SLOT_MAX: usize = (HASH_BUCKET_SIZE - OFF_HEADER_END) / 12;
const HASH_ARRAY_BYTES: usize = HASH_SLOT_MAX * 4;
const OFF_POINTERS: usize = OFF_HEADER_END + HASH_ARRAY_BYTES;
const POINTER_ARRAY_BYTES: usize = HASH_SLOT_MAX * 8;

/// Bits available to a degraded bucket's bit vector: every byte past the
/// header, reused once a bucket's partition has spilled.
const BIT_VECTOR_BITS: usize = (HASH_BUCKET_SIZE - OFF_HEADER_END) * 8;

const _: () = assert!(OFF_POINTERS + POINTER_ARRAY_BYTES <= HASH_BUCKET_SIZE);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BucketStatus {
	InMemory = 0,
	Spilled = 1,
}

/// The result of probing one bucket.
pub enum Probe {
	/// The bucket's partition is still in memory. Candidate pointers whose
	/// stored hash matched the probe's; the caller must still dereference
	/// each and check key equality.
	InMemory(Vec<Pointer>),
	/// The bucket's partition has spilled. `true` means the bit vector
	/// reports a possible match -- the probe record should be forwarded to
	/// the partition's spill file for a second pass; `false` means no
	/// in-partition record can match, and the probe record can be dropped.
	Spilled { hit: bool },
}

/// A fixed array of `num_buckets` primary buckets plus a reserve of overflow
/// buckets, materialized over owned segments.
///
/// Global bucket indices `0..num_buckets` are the primary array; indices
/// `num_buckets..` are overflow buckets, handed out on demand and linked from
/// a primary (or another overflow) bucket via the 8-byte forward pointer at
/// offset 4. A forward pointer of `0` means "no overflow bucket" -- safe
/// because index `0` is always a primary bucket and primary buckets are
/// never overflow targets.
pub struct BucketTable<const S: usize> {
	segments: Vec<Segment<S>>,
	buckets_per_segment: usize,
	num_buckets: u32,
	bucket_mask: u32,
	overflow_capacity: u32,
	overflow_next: u32,
	level: u32,
}

impl<const S: usize> BucketTable<S> {
	/// Allocates `ceil(num_buckets / bps) + ceil(overflow_reserve / bps)`
	/// segments from `pool` and initializes every primary bucket's partition
	/// byte deterministically from its index via [`hash::partition`], status
	/// `InMemory`, element count `0`.
	pub fn new(
		pool: &mut SegmentPool<S>,
		num_buckets: u32,
		overflow_reserve: u32,
		fan_out: u8,
		level: u32,
	) -> Result<Self> {
		assert!(num_buckets.is_power_of_two(), "num_buckets must be a power of two");
		let bps = S / HASH_BUCKET_SIZE;
		let primary_segs = (num_buckets as usize).div_ceil(bps);
		let overflow_segs = (overflow_reserve as usize).div_ceil(bps).max(1);
		let total_segs = primary_segs + overflow_segs;

		let mut segments = Vec::with_capacity(total_segs);
		for _ in 0..total_segs {
			let seg = pool.acquire()?.ok_or_else(|| {
				JoinError::argument(
					"segments",
					format!("not enough segments to materialize a {num_buckets}-bucket table"),
				)
			})?;
			segments.push(seg);
		}

		let mut table = Self {
			segments,
			buckets_per_segment: bps,
			num_buckets,
			bucket_mask: num_buckets - 1,
			overflow_capacity: (overflow_segs * bps) as u32,
			overflow_next: 0,
			level,
		};

		for i in 0..num_buckets {
			let partition = (hash::partition(i, level) % fan_out as u32) as u8;
			table.init_bucket(i, partition);
		}

		Ok(table)
	}

	/// Hands every owned segment back to the caller, e.g. for the memory
	/// manager to reclaim during `close()`.
	pub fn into_segments(self) -> Vec<Segment<S>> { self.segments }

	pub fn segment_count(&self) -> usize { self.segments.len() }

	/// The bucket a 32-bit bucket hash resolves to: its low `log2(num_buckets)`
	/// bits.
	pub fn bucket_index(&self, h_bucket: u32) -> u32 { h_bucket & self.bucket_mask }

	pub fn partition_of(&self, bucket_idx: u32) -> u8 { self.read_u8(bucket_idx, OFF_PARTITION) }

	pub fn status(&self, bucket_idx: u32) -> BucketStatus {
		match self.read_u8(bucket_idx, OFF_STATUS) {
			0 => BucketStatus::InMemory,
			_ => BucketStatus::Spilled,
		}
	}

	/// Records a build-side `(h_bucket, pointer)` entry, chaining to a fresh
	/// overflow bucket if the primary (or current tail of the chain) is full.
	///
	/// If this bucket's partition has already spilled -- and so the bucket
	/// was already degraded into a bit vector by [`degrade_partition`] --
	/// `pointer` is ignored and the corresponding bit is set instead.
	/// Callers need not special-case this: the driver calls this uniformly
	/// after every successful `Partition::insert`, in memory or spilled.
	///
	/// [`degrade_partition`]: Self::degrade_partition
	pub fn insert(&mut self, bucket_idx: u32, h_bucket: u32, pointer: Pointer) -> Result {
		if self.status(bucket_idx) == BucketStatus::Spilled {
			self.set_bit(bucket_idx, h_bucket);
			return Ok(());
		}

		let mut cur = bucket_idx;
		loop {
			let count = self.count_of(cur) as usize;
			if count < HASH_SLOT_MAX {
				self.write_hash_entry(cur, count, h_bucket);
				self.write_pointer_entry(cur, count, pointer);
				self.set_count(cur, (count + 1) as u16);
				return Ok(());
			}

			match self.forward_of(cur) {
				Some(next) => cur = next,
				None => {
					let partition = self.partition_of(bucket_idx);
					let new_idx = self.allocate_overflow(partition)?;
					self.set_forward(cur, new_idx);
					cur = new_idx;
				}
			}
		}
	}

	/// Degrades every bucket belonging to `partition` into a bit vector.
	/// Called once, eagerly, the moment a partition spills -- not lazily on
	/// the next insert -- so that records already recorded in the bucket
	/// *before* the spill are still represented in the bit vector.
	/// Buckets not belonging to `partition` are untouched. Overflow buckets
	/// already chained from a degraded bucket are folded into the same bit
	/// vector and then abandoned (their segments are not reclaimed, but they
	/// are never written to or read again).
	pub fn degrade_partition(&mut self, partition: u8) {
		for i in 0..self.num_buckets {
			if self.partition_of(i) != partition || self.status(i) == BucketStatus::Spilled {
				continue;
			}
			self.degrade_bucket(i);
		}
	}

	fn degrade_bucket(&mut self, bucket_idx: u32) {
		// Collect every existing entry (primary bucket plus its whole overflow
		// chain) before touching any payload bytes -- `set_bit` below writes
		// into the same region `read_hash_entry` reads from, so the two must
		// never interleave on one bucket.
		let mut collected = Vec::new();
		let mut cur = Some(bucket_idx);
		while let Some(idx) = cur {
			let count = self.count_of(idx) as usize;
			for slot in 0..count {
				collected.push(self.read_hash_entry(idx, slot));
			}
			cur = self.forward_of(idx);
		}

		self.clear_payload(bucket_idx);
		self.set_forward(bucket_idx, 0);
		for h in collected {
			self.set_bit(bucket_idx, h);
		}
		self.write_u8(bucket_idx, OFF_STATUS, BucketStatus::Spilled as u8);
	}

	/// Probes one bucket for `h_bucket`.
	pub fn probe(&self, bucket_idx: u32, h_bucket: u32) -> Probe {
		match self.status(bucket_idx) {
			BucketStatus::Spilled => Probe::Spilled { hit: self.bit_test(bucket_idx, h_bucket) },
			BucketStatus::InMemory => {
				let mut matches = Vec::new();
				let mut cur = Some(bucket_idx);
				while let Some(idx) = cur {
					let count = self.count_of(idx) as usize;
					for slot in 0..count {
						if self.read_hash_entry(idx, slot) == h_bucket {
							matches.push(self.read_pointer_entry(idx, slot));
						}
					}
					cur = self.forward_of(idx);
				}
				Probe::InMemory(matches)
			}
		}
	}

	fn bit_test(&self, bucket_idx: u32, h_bucket: u32) -> bool {
		let bit = hash::secondary(h_bucket, self.level) as usize % BIT_VECTOR_BITS;
		let (seg, base) = self.locate(bucket_idx);
		let byte = self.segments[seg].read_at(base + OFF_HEADER_END + bit / 8, 1)[0];
		byte & (1 << (bit % 8)) != 0
	}

	fn set_bit(&mut self, bucket_idx: u32, h_bucket: u32) {
		let bit = hash::secondary(h_bucket, self.level) as usize % BIT_VECTOR_BITS;
		let (seg, base) = self.locate(bucket_idx);
		let off = base + OFF_HEADER_END + bit / 8;
		let mut byte = self.segments[seg].read_at(off, 1)[0];
		byte |= 1 << (bit % 8);
		self.segments[seg].write_at(off, &[byte]);
	}

	fn allocate_overflow(&mut self, partition: u8) -> Result<u32> {
		if self.overflow_next >= self.overflow_capacity {
			return Err(JoinError::structural(format!(
				"bucket table overflow capacity ({}) exhausted for partition {partition}",
				self.overflow_capacity
			)));
		}
		let idx = self.num_buckets + self.overflow_next;
		self.overflow_next += 1;
		self.init_bucket(idx, partition);
		Ok(idx)
	}

	fn init_bucket(&mut self, bucket_idx: u32, partition: u8) {
		self.write_u8(bucket_idx, OFF_PARTITION, partition);
		self.write_u8(bucket_idx, OFF_STATUS, BucketStatus::InMemory as u8);
		self.set_count(bucket_idx, 0);
		self.set_forward(bucket_idx, 0);
	}

	fn clear_payload(&mut self, bucket_idx: u32) {
		let (seg, base) = self.locate(bucket_idx);
		let zeros = [0u8; HASH_BUCKET_SIZE - OFF_HEADER_END];
		self.segments[seg].write_at(base + OFF_HEADER_END, &zeros);
	}

	fn count_of(&self, bucket_idx: u32) -> u16 {
		let (seg, base) = self.locate(bucket_idx);
		u16::from_be_bytes(self.segments[seg].read_at(base + OFF_COUNT, 2).try_into().unwrap())
	}

	fn set_count(&mut self, bucket_idx: u32, count: u16) {
		assert_le!(count as usize, HASH_SLOT_MAX);
		let (seg, base) = self.locate(bucket_idx);
		self.segments[seg].write_at(base + OFF_COUNT, &count.to_be_bytes());
	}

	fn forward_of(&self, bucket_idx: u32) -> Option<u32> {
		let (seg, base) = self.locate(bucket_idx);
		let raw = u64::from_be_bytes(self.segments[seg].read_at(base + OFF_FORWARD, 8).try_into().unwrap());
		(raw != 0).then_some(raw as u32)
	}

	fn set_forward(&mut self, bucket_idx: u32, target: u32) {
		let (seg, base) = self.locate(bucket_idx);
		self.segments[seg].write_at(base + OFF_FORWARD, &(target as u64).to_be_bytes());
	}

	fn write_hash_entry(&mut self, bucket_idx: u32, slot: usize, h: u32) {
		let (seg, base) = self.locate(bucket_idx);
		self.segments[seg].write_at(base + OFF_HEADER_END + slot * 4, &h.to_be_bytes());
	}

	fn read_hash_entry(&self, bucket_idx: u32, slot: usize) -> u32 {
		let (seg, base) = self.locate(bucket_idx);
		u32::from_be_bytes(
			self.segments[seg].read_at(base + OFF_HEADER_END + slot * 4, 4).try_into().unwrap(),
		)
	}

	fn write_pointer_entry(&mut self, bucket_idx: u32, slot: usize, ptr: Pointer) {
		let (seg, base) = self.locate(bucket_idx);
		self.segments[seg].write_at(base + OFF_POINTERS + slot * 8, &ptr.raw().to_be_bytes());
	}

	fn read_pointer_entry(&self, bucket_idx: u32, slot: usize) -> Pointer {
		let (seg, base) = self.locate(bucket_idx);
		let raw = u64::from_be_bytes(
			self.segments[seg].read_at(base + OFF_POINTERS + slot * 8, 8).try_into().unwrap(),
		);
		Pointer::from(raw)
	}

	fn read_u8(&self, bucket_idx: u32, off: usize) -> u8 {
		let (seg, base) = self.locate(bucket_idx);
		self.segments[seg].read_at(base + off, 1)[0]
	}

	fn write_u8(&mut self, bucket_idx: u32, off: usize, value: u8) {
		let (seg, base) = self.locate(bucket_idx);
		self.segments[seg].write_at(base + off, &[value]);
	}

	fn locate(&self, bucket_idx: u32) -> (usize, usize) {
		let idx = bucket_idx as usize;
		debug_assert!(idx < self.num_buckets as usize + self.overflow_capacity as usize);
		(idx / self.buckets_per_segment, (idx % self.buckets_per_segment) * HASH_BUCKET_SIZE)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::segment::Segment;

	fn pool(n: usize) -> SegmentPool<1024> {
		SegmentPool::new((0..n).map(|_| Segment::new()).collect())
	}

	#[test]
	fn init_assigns_partition_byte_deterministically() {
		let mut pool = pool(8);
		let table = BucketTable::<1024>::new(&mut pool, 4, 1, 10, 0).unwrap();
		for i in 0..4 {
			assert_eq!(table.partition_of(i), (hash::partition(i, 0) % 10) as u8);
			assert_eq!(table.status(i), BucketStatus::InMemory);
		}
	}

	#[test]
	fn insert_then_probe_finds_the_pointer() {
		let mut pool = pool(8);
		let mut table = BucketTable::<1024>::new(&mut pool, 4, 1, 10, 0).unwrap();
		let ptr = Pointer::new(0, 16);
		table.insert(2, 777, ptr).unwrap();
		match table.probe(2, 777) {
			Probe::InMemory(matches) => assert_eq!(matches, vec![ptr]),
			Probe::Spilled { .. } => panic!("expected in-memory probe"),
		}
	}

	#[test]
	fn probe_miss_returns_empty() {
		let mut pool = pool(8);
		let mut table = BucketTable::<1024>::new(&mut pool, 4, 1, 10, 0).unwrap();
		table.insert(1, 1, Pointer::new(0, 0)).unwrap();
		match table.probe(1, 999) {
			Probe::InMemory(matches) => assert!(matches.is_empty()),
			Probe::Spilled { .. } => panic!("expected in-memory probe"),
		}
	}

	#[test]
	fn overflow_chains_once_a_bucket_is_full() {
		let mut pool = pool(8);
		let mut table = BucketTable::<1024>::new(&mut pool, 4, 2, 10, 0).unwrap();
		for i in 0..HASH_SLOT_MAX as u32 + 3 {
			table.insert(0, i, Pointer::new(0, i as usize)).unwrap();
		}
		match table.probe(0, HASH_SLOT_MAX as u32 + 2) {
			Probe::InMemory(matches) => assert_eq!(matches.len(), 1),
			Probe::Spilled { .. } => panic!(),
		}
	}

	#[test]
	fn degrade_preserves_membership_for_pre_spill_entries() {
		let mut pool = pool(8);
		let mut table = BucketTable::<1024>::new(&mut pool, 4, 1, 10, 0).unwrap();
		let partition = table.partition_of(0);
		table.insert(0, 555, Pointer::new(0, 0)).unwrap();
		table.degrade_partition(partition);
		assert_eq!(table.status(0), BucketStatus::Spilled);
		match table.probe(0, 555) {
			Probe::Spilled { hit } => assert!(hit, "pre-spill entry must survive degrade"),
			Probe::InMemory(_) => panic!("expected spilled probe"),
		}
	}

	#[test]
	fn degrade_only_touches_the_spilled_partitions_buckets() {
		let mut pool = pool(16);
		let mut table = BucketTable::<1024>::new(&mut pool, 16, 1, 10, 0).unwrap();
		let target = table.partition_of(0);
		let other = (0..16u32).find(|&i| table.partition_of(i) != target).expect("fixture needs >1 partition across buckets");
		table.degrade_partition(target);
		assert_eq!(table.status(0), BucketStatus::Spilled);
		assert_eq!(table.status(other), BucketStatus::InMemory);
	}

	#[test]
	fn overflow_exhaustion_is_structural_error() {
		let mut pool = pool(8);
		// bps for 1024-byte segments is 1, so 1 overflow bucket total.
		let mut table = BucketTable::<1024>::new(&mut pool, 2, 1, 10, 0).unwrap();
		for i in 0..HASH_SLOT_MAX as u32 {
			table.insert(0, i, Pointer::new(0, 0)).unwrap();
		}
		// first overflow bucket absorbs one more insert...
		table.insert(0, 9999, Pointer::new(0, 0)).unwrap();
		// ...then the overflow bucket itself fills and a second overflow is needed.
		for i in 0..HASH_SLOT_MAX as u32 {
			table.insert(0, i + 1, Pointer::new(0, 0)).unwrap();
		}
		assert!(table.insert(0, 123456, Pointer::new(0, 0)).is_err());
	}
}
