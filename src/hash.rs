// SPDX-License-Identifier: Apache-2.0

//! Two independent 32-bit integer mixers: one for bucket assignment, one for
//! partition assignment. Both are full-avalanche (every output bit depends on
//! every input bit) so that, in combination, bucket and partition assignment are
//! statistically independent -- if they were correlated, a spill would bias the
//! surviving in-memory buckets toward the same keys the probe side favors.

/// Jenkins' 32-bit integer hash, used to pick a bucket. `level` perturbs the
/// additive constants so a recursive (second-pass) join does not reproduce the
/// skew that caused its parent partition to spill.
pub fn hash(key: u32, level: u32) -> u32 {
	let mut a = key.wrapping_add(0x7ed55d16.wrapping_add(level.wrapping_mul(0x9e3779b9)));
	a = a.wrapping_add(a << 12) ^ 0xc761c23c;
	a ^= a >> 19;
	a = a.wrapping_add(a << 5) ^ (0x165667b1 ^ level.wrapping_mul(0x85ebca6b));
	a = a.wrapping_add(a << 9) ^ 0xd3a2646c;
	a = a.wrapping_add(a << 3) ^ 0xfd7046c5;
	a ^= a >> 16;
	a
}

/// Jenkins' "final" mix, used to pick a partition independently of [`hash`].
/// Structurally unrelated to `hash` (different constants, different mixing
/// order) so the two outputs do not correlate.
pub fn partition(key: u32, level: u32) -> u32 {
	let mut a = key ^ level.wrapping_mul(0xc2b2ae35);
	a = (a ^ 61) ^ (a >> 16);
	a = a.wrapping_add(a << 3);
	a ^= a >> 4;
	a = a.wrapping_mul(0x27d4eb2d);
	a ^= a >> 15;
	a
}

/// A third mixer used only to address bits inside a spilled bucket's bit
/// vector. Deliberately distinct from both [`hash`] and [`partition`] --
/// reusing either here would make the bit a key sets deterministically
/// related to the bucket it already lives in, defeating the point of a
/// second independent signal.
pub fn secondary(key: u32, level: u32) -> u32 {
	let mut a = key.rotate_left(13) ^ level.wrapping_mul(0x27220a95);
	a ^= a >> 17;
	a = a.wrapping_mul(0x85ebca6b);
	a ^= a >> 13;
	a = a.wrapping_mul(0xc2b2ae35);
	a ^= a >> 16;
	a
}

/// Position of the highest set bit of `v`, i.e. `floor(log2(v))`.
///
/// # Panics
///
/// Panics if `v == 0` -- the hybrid hash join never calls this on a zero-sized
/// quantity (segment counts, bucket counts, and fan-outs are all validated
/// positive before reaching here), so a zero input indicates an engine bug
/// rather than bad input.
pub fn log2floor(v: u32) -> u32 {
	assert_ne!(v, 0, "log2floor is undefined for 0");
	31 - v.leading_zeros()
}

#[cfg(test)]
mod tests {
	use super::*;
	use quickcheck_macros::quickcheck;

	#[test]
	fn log2floor_known_values() {
		assert_eq!(log2floor(1), 0);
		assert_eq!(log2floor(2), 1);
		assert_eq!(log2floor(1023), 9);
		assert_eq!(log2floor(1024), 10);
		assert_eq!(log2floor(u32::MAX), 31);
	}

	#[test]
	#[should_panic]
	fn log2floor_zero_panics() {
		log2floor(0);
	}

	#[quickcheck]
	fn hash_is_deterministic(key: u32, level: u32) -> bool {
		hash(key, level) == hash(key, level)
	}

	#[quickcheck]
	fn partition_is_deterministic(key: u32, level: u32) -> bool {
		partition(key, level) == partition(key, level)
	}

	#[quickcheck]
	fn hash_and_partition_rarely_collide_bitwise(key: u32) -> bool {
		// A crude independence smoke test: the two mixers should disagree for
		// most inputs rather than producing identical outputs.
		hash(key, 0) != partition(key, 0)
	}

	#[test]
	fn hash_has_avalanche_behaviour() {
		// Flipping one input bit should flip roughly half the output bits on
		// average; no single flipped bit should leave the output unchanged.
		let base = hash(0x1234_5678, 0);
		for bit in 0..32 {
			let flipped = hash(0x1234_5678 ^ (1 << bit), 0);
			assert_ne!(base, flipped, "bit {bit} had no effect on hash()");
		}
	}

	#[test]
	fn partition_has_avalanche_behaviour() {
		let base = partition(0x1234_5678, 0);
		for bit in 0..32 {
			let flipped = partition(0x1234_5678 ^ (1 << bit), 0);
			assert_ne!(base, flipped, "bit {bit} had no effect on partition()");
		}
	}

	#[test]
	fn level_perturbs_output() {
		assert_ne!(hash(42, 0), hash(42, 1));
		assert_ne!(partition(42, 0), partition(42, 1));
	}

	#[quickcheck]
	fn secondary_is_deterministic(key: u32, level: u32) -> bool {
		secondary(key, level) == secondary(key, level)
	}

	#[test]
	fn secondary_disagrees_with_the_other_two_mixers() {
		let key = 0x1234_5678;
		assert_ne!(secondary(key, 0), hash(key, 0));
		assert_ne!(secondary(key, 0), partition(key, 0));
	}

	#[test]
	fn secondary_has_avalanche_behaviour() {
		let base = secondary(0x1234_5678, 0);
		for bit in 0..32 {
			let flipped = secondary(0x1234_5678 ^ (1 << bit), 0);
			assert_ne!(base, flipped, "bit {bit} had no effect on secondary()");
		}
	}
}
