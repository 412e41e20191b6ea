// SPDX-License-Identifier: Apache-2.0

//! The join driver: builds partitions and the bucket table, dispatches
//! build-side inserts, picks spill victims under memory pressure, and drains
//! the probe side against whatever ended up in memory or on disk.

use std::collections::HashMap;

use crate::bucket::{BucketTable, Probe};
use crate::error::{JoinError, Result};
use crate::hash;
use crate::io::{ChannelId, ChannelWriter, IoManager};
use crate::partition::{decode_record_at, InsertOutcome, Partition};
use crate::pool::SegmentPool;
use crate::record::{FixedWidth, Key, Record};
use crate::segment::Segment;

/// One probe-side record matched (by key equality) against zero or more
/// in-memory build-side values. Yielded by [`HashJoin::next`].
pub struct ProbeResult<K: Key> {
	pub probe: Record<K>,
	pub matches: Vec<Vec<u8>>,
}

/// Tracks a lazily-opened probe-side spill file for one partition: a channel
/// writer, the channel id (so `close()` can delete it), and the segment
/// currently being filled.
struct ProbeSpill<const S: usize> {
	channel_id: ChannelId,
	writer: Box<dyn ChannelWriter<S>>,
	tail: Segment<S>,
}

/// A join instance: owns its segment pool, partitions, bucket table, and I/O
/// manager for its whole lifetime. Constructed only via
/// [`crate::config::JoinConfig::build`].
pub struct HashJoin<K: FixedWidth, const S: usize> {
	build: Option<Box<dyn Iterator<Item = Record<K>>>>,
	probe: Box<dyn Iterator<Item = Record<K>>>,
	io: Box<dyn IoManager<S>>,
	pool: Option<SegmentPool<S>>,
	partitions: Vec<Partition<S>>,
	bucket_table: Option<BucketTable<S>>,
	fan_out: u8,
	level: u32,
	total_segments: usize,
	build_channel_ids: HashMap<u8, ChannelId>,
	probe_spill: HashMap<u8, ProbeSpill<S>>,
	next_channel_id: u64,
	opened: bool,
	closed: bool,
}

impl<K: FixedWidth + 'static, const S: usize> HashJoin<K, S> {
	pub(crate) fn new(
		build: Box<dyn Iterator<Item = Record<K>>>,
		probe: Box<dyn Iterator<Item = Record<K>>>,
		io: Box<dyn IoManager<S>>,
		pool: SegmentPool<S>,
		partitions: Vec<Partition<S>>,
		bucket_table: BucketTable<S>,
		fan_out: u8,
		level: u32,
		total_segments: usize,
	) -> Self {
		Self {
			build: Some(build),
			probe,
			io,
			pool: Some(pool),
			partitions,
			bucket_table: Some(bucket_table),
			fan_out,
			level,
			total_segments,
			build_channel_ids: HashMap::new(),
			probe_spill: HashMap::new(),
			next_channel_id: 0,
			opened: false,
			closed: false,
		}
	}

	pub fn fan_out(&self) -> u8 { self.fan_out }

	pub fn partition_record_count(&self, index: u8) -> usize { self.partitions[index as usize].record_counter() }

	pub fn is_partition_spilled(&self, index: u8) -> bool { self.partitions[index as usize].is_spilled() }

	/// Segments the pool, every partition, and the bucket table are
	/// collectively accounting for right now. Should equal
	/// [`HashJoin::total_segments`] at every observable point before
	/// `close()` -- exposed for tests, not needed by callers.
	pub fn accounted_segments(&self) -> usize {
		self.pool.as_ref().map_or(0, SegmentPool::accounted_for)
			+ self.partitions.iter().map(Partition::block_counter).sum::<usize>()
			+ self.bucket_table.as_ref().map_or(0, BucketTable::segment_count)
	}

	pub fn total_segments(&self) -> usize { self.total_segments }

	fn pool_mut(&mut self) -> &mut SegmentPool<S> {
		self.pool.as_mut().expect("join used after close()")
	}

	fn bucket_table_mut(&mut self) -> &mut BucketTable<S> {
		self.bucket_table.as_mut().expect("join used after close()")
	}

	fn next_channel_id(&mut self) -> ChannelId {
		let id = self.next_channel_id;
		self.next_channel_id += 1;
		id
	}

	/// Runs the build phase to completion. Idempotent: a
	/// second call is a no-op.
	pub fn open(&mut self) -> Result {
		let Some(mut build) = self.build.take() else { return Ok(()) };
		while let Some(record) = build.next() {
			self.insert_build_record(record)?;
		}
		self.opened = true;
		Ok(())
	}

	pub fn is_open(&self) -> bool { self.opened }

	fn insert_build_record(&mut self, record: Record<K>) -> Result {
		let mut payload = Vec::with_capacity(record.encoded_len());
		record.encode_into(&mut payload);

		let h_bucket = hash::hash(record.key.key_hash(), self.level);
		let bucket_idx = self.bucket_table_mut().bucket_index(h_bucket);
		let p = self.bucket_table_mut().partition_of(bucket_idx) as usize;

		loop {
			let mut pool = self.pool.take().expect("join used after close()");
			let outcome = self.partitions[p].insert(&payload, &mut pool);
			self.pool = Some(pool);
			match outcome? {
				InsertOutcome::Inserted(ptr) => {
					self.bucket_table_mut().insert(bucket_idx, h_bucket, ptr)?;
					return Ok(());
				}
				InsertOutcome::BufferFull => {
					if self.partitions[p].tail_is_empty() {
						return Err(JoinError::record_too_large(payload.len() + 4, S));
					}
					match self.pool_mut().acquire()? {
						Some(seg) => self.partitions[p].add_buffer(seg)?,
						None => self.spill()?,
					}
				}
			}
		}
	}

	/// Picks the in-memory partition with the largest `block_counter` and
	/// spills it, then degrades every bucket that belongs
	/// to it. Fatal if no partition is eligible -- the table is structurally
	/// too small to make further progress.
	fn spill(&mut self) -> Result {
		let victim = self
			.partitions
			.iter()
			.enumerate()
			.filter(|(_, p)| !p.is_spilled() && p.block_counter() >= 2)
			.max_by_key(|(_, p)| p.block_counter())
			.map(|(i, _)| i);

		let Some(idx) = victim else {
			return Err(JoinError::structural(
				"no in-memory partition has 2 or more buffers to spill; the table is too small for this workload",
			));
		};

		let channel_id = self.next_channel_id();
		self.build_channel_ids.insert(idx as u8, channel_id);
		let mut pool = self.pool.take().expect("join used after close()");
		let freed = self.partitions[idx].spill(self.io.as_ref(), channel_id, &mut pool);
		self.pool = Some(pool);
		let freed = freed?;
		self.pool_mut().reclaim_from_spill(freed);
		self.bucket_table_mut().degrade_partition(idx as u8);
		Ok(())
	}

	/// Drains one probe-side record. Returns `Ok(None)`
	/// once the probe iterator is exhausted. In-memory matches are returned
	/// directly; a probe record whose bucket has spilled is instead
	/// forwarded to that partition's probe-side spill file (a hook for an
	/// out-of-scope recursive second pass), yielded here with an empty
	/// match list.
	pub fn next(&mut self) -> Result<Option<ProbeResult<K>>> {
		let Some(record) = self.probe.next() else { return Ok(None) };

		let h_bucket = hash::hash(record.key.key_hash(), self.level);
		let bucket_table = self.bucket_table.as_ref().expect("join used after close()");
		let bucket_idx = bucket_table.bucket_index(h_bucket);
		let p = bucket_table.partition_of(bucket_idx);

		match bucket_table.probe(bucket_idx, h_bucket) {
			Probe::InMemory(pointers) => {
				let buffers = self.partitions[p as usize].buffers();
				let mut matches = Vec::new();
				for ptr in pointers {
					let payload = decode_record_at(&buffers[ptr.buffer_index()], ptr.offset());
					let (key, value) = decode_payload::<K>(payload);
					if key == record.key {
						matches.push(value.to_vec());
					}
				}
				Ok(Some(ProbeResult { probe: record, matches }))
			}
			Probe::Spilled { hit } => {
				if hit {
					self.forward_to_probe_spill(p, &record)?;
				}
				Ok(Some(ProbeResult { probe: record, matches: Vec::new() }))
			}
		}
	}

	fn forward_to_probe_spill(&mut self, partition: u8, record: &Record<K>) -> Result {
		let mut encoded = Vec::with_capacity(record.encoded_len());
		record.encode_into(&mut encoded);
		let mut payload = Vec::with_capacity(4 + encoded.len());
		payload.extend_from_slice(&(encoded.len() as u32).to_be_bytes());
		payload.extend_from_slice(&encoded);

		if !self.probe_spill.contains_key(&partition) {
			let channel_id = self.next_channel_id();
			let writer =
				self.io.create_block_channel_writer(channel_id, self.pool_mut().write_behind_sender())?;
			self.probe_spill.insert(partition, ProbeSpill { channel_id, writer, tail: Segment::new() });
		}
		let spill = self.probe_spill.get_mut(&partition).expect("just inserted");

		if !spill.tail.push(&payload) {
			let full = std::mem::replace(&mut spill.tail, Segment::new());
			spill.writer.write_segment(full)?;
			if !spill.tail.push(&payload) {
				return Err(JoinError::record_too_large(payload.len(), S));
			}
		}
		Ok(())
	}

	/// The channel id a caller's recursive second pass should read to
	/// replay partition `p`'s build-side spill file, if it spilled.
	pub fn build_spill_channel(&self, p: u8) -> Option<ChannelId> { self.build_channel_ids.get(&p).copied() }

	/// The channel id a caller's recursive second pass should read to
	/// replay partition `p`'s probe-side spill file, if any probe record
	/// was forwarded to it.
	pub fn probe_spill_channel(&self, p: u8) -> Option<ChannelId> { self.probe_spill.get(&p).map(|s| s.channel_id) }

	/// Releases every resource this join holds: every partition's buffers
	/// and writer, the bucket table's segments, the pool's remaining
	/// segments, and every spill channel this join opened. Idempotent; also
	/// invoked from `Drop`.
	pub fn close(&mut self) -> Result<Vec<Segment<S>>> {
		if self.closed {
			return Ok(Vec::new());
		}
		self.closed = true;

		let mut reclaimed = Vec::new();
		for partition in std::mem::take(&mut self.partitions) {
			reclaimed.extend(partition.close()?);
		}
		if let Some(bucket_table) = self.bucket_table.take() {
			reclaimed.extend(bucket_table.into_segments());
		}
		if let Some(pool) = self.pool.take() {
			reclaimed.extend(pool.into_available());
		}

		for (_, spill) in std::mem::take(&mut self.probe_spill) {
			let ProbeSpill { channel_id, mut writer, tail } = spill;
			if !tail.is_empty() {
				writer.write_segment(tail)?;
			}
			writer.close()?;
			self.io.delete_channel(channel_id)?;
		}
		for channel_id in std::mem::take(&mut self.build_channel_ids).into_values() {
			self.io.delete_channel(channel_id)?;
		}

		Ok(reclaimed)
	}
}

impl<K: FixedWidth, const S: usize> Drop for HashJoin<K, S> {
	fn drop(&mut self) {
		if self.closed {
			return;
		}
		log::warn!("HashJoin dropped without calling close(); releasing resources now");
		self.closed = true;
		for partition in std::mem::take(&mut self.partitions) {
			if let Err(e) = partition.close() {
				log::error!("error releasing partition during drop: {e}");
			}
		}
		self.bucket_table.take();
		self.pool.take();
		for (_, mut spill) in std::mem::take(&mut self.probe_spill) {
			let _ = spill.writer.close();
			let _ = self.io.delete_channel(spill.channel_id);
		}
		for channel_id in std::mem::take(&mut self.build_channel_ids).into_values() {
			let _ = self.io.delete_channel(channel_id);
		}
	}
}

fn decode_payload<K: FixedWidth>(bytes: &[u8]) -> (K, &[u8]) {
	let key = K::decode(&bytes[..K::WIDTH]);
	let value_len = u32::from_be_bytes(bytes[K::WIDTH..K::WIDTH + 4].try_into().unwrap()) as usize;
	let value = &bytes[K::WIDTH + 4..K::WIDTH + 4 + value_len];
	(key, value)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::JoinConfig;
	use crate::io::MemoryIoManager;

	fn segments(n: usize) -> Vec<Segment<4096>> { (0..n).map(|_| Segment::new()).collect() }

	fn record(key: u32, value: &[u8]) -> Record<u32> { Record::new(key, value.to_vec()) }

	#[test]
	fn all_in_memory_build_and_probe_round_trips() {
		let build = (0u32..1000).map(|k| record(k, b"value"));
		let probe = (0u32..2000).map(|k| record(k, b""));
		let io = MemoryIoManager::<4096>::new();
		let mut join =
			JoinConfig::new(build, probe, segments(64), io).with_avg_record_len(16).build().unwrap();
		join.open().unwrap();
		assert_eq!(join.accounted_segments(), join.total_segments());

		let mut hits = 0;
		let mut misses = 0;
		while let Some(result) = join.next().unwrap() {
			if result.probe.key < 1000 {
				assert_eq!(result.matches.len(), 1, "key {} should match once", result.probe.key);
				hits += 1;
			} else {
				assert!(result.matches.is_empty());
				misses += 1;
			}
		}
		assert_eq!(hits, 1000);
		assert_eq!(misses, 1000);
		assert!(join.close().is_ok());
	}

	#[test]
	fn pressure_forces_a_spill_and_probing_still_works() {
		let build = (0u32..5000).map(|k| record(k % 50, &[7u8; 80]));
		let probe = (0u32..50).map(|k| record(k, b""));
		let io = MemoryIoManager::<4096>::new();
		let mut join =
			JoinConfig::new(build, probe, segments(33), io).with_avg_record_len(80).build().unwrap();
		join.open().unwrap();

		assert!((0..join.fan_out()).any(|p| join.is_partition_spilled(p)), "expected at least one spill");
		assert_eq!(join.accounted_segments(), join.total_segments());

		let mut total_matches = 0;
		while let Some(result) = join.next().unwrap() {
			total_matches += result.matches.len();
		}
		assert!(total_matches > 0, "in-memory partitions should still answer probes");
		join.close().unwrap();
	}

	#[test]
	fn close_is_idempotent() {
		let io = MemoryIoManager::<4096>::new();
		let mut join = JoinConfig::new(std::iter::empty(), std::iter::empty(), segments(33), io)
			.build()
			.unwrap();
		join.open().unwrap();
		join.close().unwrap();
		assert!(join.close().unwrap().is_empty());
	}
}
