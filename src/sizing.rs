// SPDX-License-Identifier: Apache-2.0

//! Sizing math shared by [`crate::config`] and [`crate::join`]: partition
//! fan-out, write-behind buffer count, and initial bucket-table size.

use crate::segment::HASH_BUCKET_SIZE;

pub const MIN_SEGMENTS: usize = 33;
pub const MIN_FAN_OUT: u8 = 10;
pub const MAX_FAN_OUT: u8 = 127;

/// `max(10, min(segments / 10, 127))`.
pub fn partition_fan_out(segment_count: usize) -> u8 {
	(segment_count / 10).clamp(MIN_FAN_OUT as usize, MAX_FAN_OUT as usize) as u8
}

/// `clamp(ceil(log4(segments) - 1.5), 0, 6)`.
pub fn write_behind_buffers(segment_count: usize) -> usize {
	if segment_count == 0 {
		return 0;
	}
	let log4 = (segment_count as f64).log(4.0);
	let raw = (log4 - 1.5).ceil();
	raw.clamp(0.0, 6.0) as usize
}

/// How many records of `avg_record_len` bytes (plus a 4-byte length prefix)
/// fit across `partition_segments` segments of size `S`.
pub fn records_storable(partition_segments: usize, segment_size: usize, avg_record_len: usize) -> usize {
	(partition_segments * segment_size) / (avg_record_len + 4)
}

/// Initial bucket-table size targeting 200% utilization when every
/// partition segment is full: `(recordsStorable * 12) / (2 * 1024) + 1`,
/// rounded up to the next power of two.
pub fn bucket_count(records_storable: usize) -> u32 {
	let raw = (records_storable * 12) / (2 * HASH_BUCKET_SIZE) + 1;
	(raw as u32).next_power_of_two().max(16)
}

/// Number of overflow buckets reserved alongside the primary array. Not
/// specified by name in the source; sized as one eighth of the primary
/// table so a handful of skewed buckets can chain without starving sibling
/// buckets of overflow capacity.
pub fn overflow_reserve(num_buckets: u32) -> u32 {
	(num_buckets / 8).max(1)
}

/// How many segments the bucket table (primary array plus overflow reserve)
/// occupies for a segment size `S`.
pub fn bucket_table_segments(num_buckets: u32, overflow_reserve: u32, segment_size: usize) -> usize {
	let bps = segment_size / HASH_BUCKET_SIZE;
	(num_buckets as usize).div_ceil(bps) + (overflow_reserve as usize).div_ceil(bps).max(1)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn partition_fan_out_respects_bounds() {
		assert_eq!(partition_fan_out(0), MIN_FAN_OUT);
		assert_eq!(partition_fan_out(33), MIN_FAN_OUT);
		assert_eq!(partition_fan_out(100), 10);
		assert_eq!(partition_fan_out(2000), MAX_FAN_OUT);
	}

	#[test]
	fn write_behind_buffers_respects_bounds() {
		assert_eq!(write_behind_buffers(0), 0);
		assert_eq!(write_behind_buffers(33), write_behind_buffers(33).clamp(0, 6));
		assert_eq!(write_behind_buffers(1_000_000), 6);
	}

	#[test]
	fn bucket_count_is_a_power_of_two_and_at_least_16() {
		for n in [0, 1, 10, 1000, 100_000] {
			let bc = bucket_count(n);
			assert!(bc.is_power_of_two());
			assert!(bc >= 16);
		}
	}

	#[test]
	fn bucket_table_segments_covers_overflow_reserve_too() {
		let segs = bucket_table_segments(1024, overflow_reserve(1024), 32 * 1024);
		assert!(segs >= 1);
	}
}
