// SPDX-License-Identifier: Apache-2.0

//! The constructor surface: validates a join's inputs
//! up front -- before a single segment changes hands -- and hands a
//! ready-to-run [`crate::join::HashJoin`] to the caller.

use crate::bucket::BucketTable;
use crate::error::{JoinError, Result};
use crate::io::IoManager;
use crate::join::HashJoin;
use crate::partition::Partition;
use crate::pool::SegmentPool;
use crate::record::{FixedWidth, Record};
use crate::segment::{Segment, HASH_BUCKET_SIZE};
use crate::sizing;

/// Average record length in bytes used to size the bucket table; falls back
/// to 100 if set below 1.
const DEFAULT_AVG_RECORD_LEN: usize = 100;

/// Builds a [`HashJoin`] from its external collaborators: the build and
/// probe record sources, the memory manager's segment list, an I/O manager,
/// and an average record length hint. Validation happens entirely inside
/// [`build`](Self::build); nothing here touches a segment.
pub struct JoinConfig<K: FixedWidth, const S: usize> {
	build: Box<dyn Iterator<Item = Record<K>>>,
	probe: Box<dyn Iterator<Item = Record<K>>>,
	segments: Vec<Segment<S>>,
	io: Box<dyn IoManager<S>>,
	avg_record_len: usize,
	level: u32,
}

impl<K: FixedWidth + 'static, const S: usize> JoinConfig<K, S> {
	pub fn new(
		build: impl Iterator<Item = Record<K>> + 'static,
		probe: impl Iterator<Item = Record<K>> + 'static,
		segments: Vec<Segment<S>>,
		io: impl IoManager<S> + 'static,
	) -> Self {
		Self {
			build: Box::new(build),
			probe: Box::new(probe),
			segments,
			io: Box::new(io),
			avg_record_len: DEFAULT_AVG_RECORD_LEN,
			level: 0,
		}
	}

	/// Overrides the average record length used to size the bucket table.
	/// Values below 1 are ignored in favor of the 100-byte fallback.
	pub fn with_avg_record_len(mut self, avg_record_len: usize) -> Self {
		if avg_record_len >= 1 {
			self.avg_record_len = avg_record_len;
		}
		self
	}

	/// Sets the recursion depth for this join's hash mixers. A caller
	/// building the (out-of-scope) recursive second pass over a spilled
	/// partition constructs its child join with `level + 1`.
	pub fn with_level(mut self, level: u32) -> Self {
		self.level = level;
		self
	}

	/// Validates configuration and allocates partitions and the bucket
	/// table from `segments`. Returns `JoinError::Argument`
	/// on any invariant violation, before any record is consumed.
	pub fn build(self) -> Result<HashJoin<K, S>> {
		if !(S.is_power_of_two() && S >= HASH_BUCKET_SIZE) {
			return Err(JoinError::argument(
				"segment_size",
				format!("{S} must be a power of two >= {HASH_BUCKET_SIZE} (HASH_BUCKET_SIZE)"),
			));
		}
		if self.segments.len() < sizing::MIN_SEGMENTS {
			return Err(JoinError::argument(
				"segments",
				format!("at least {} segments are required, got {}", sizing::MIN_SEGMENTS, self.segments.len()),
			));
		}

		let total_segments = self.segments.len();
		let fan_out = sizing::partition_fan_out(total_segments);
		let write_behind = sizing::write_behind_buffers(total_segments);

		let partition_segments = total_segments
			.saturating_sub(write_behind)
			.saturating_sub(fan_out as usize)
			.max(fan_out as usize);
		let storable = sizing::records_storable(partition_segments, S, self.avg_record_len);
		let num_buckets = sizing::bucket_count(storable);
		let overflow_reserve = sizing::overflow_reserve(num_buckets);
		let bucket_segments = sizing::bucket_table_segments(num_buckets, overflow_reserve, S);

		let required = fan_out as usize + bucket_segments;
		if total_segments < required {
			return Err(JoinError::argument(
				"segments",
				format!(
					"{total_segments} segments cannot cover {fan_out} partitions plus a \
					 {num_buckets}-bucket table ({bucket_segments} segments); need at least {required}"
				),
			));
		}

		let mut segments = self.segments;
		let mut pool = SegmentPool::new(std::mem::take(&mut segments));

		let bucket_table = BucketTable::new(&mut pool, num_buckets, overflow_reserve, fan_out, self.level)?;

		let mut partitions = Vec::with_capacity(fan_out as usize);
		for i in 0..fan_out {
			let seg = pool.acquire()?.ok_or_else(|| {
				JoinError::argument("segments", "not enough segments left over to seed every partition")
			})?;
			partitions.push(Partition::new(i, seg));
		}

		Ok(HashJoin::new(
			self.build,
			self.probe,
			self.io,
			pool,
			partitions,
			bucket_table,
			fan_out,
			self.level,
			total_segments,
		))
	}
}
