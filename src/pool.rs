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

//! The segment pool: a synchronous LIFO available list bridged to the
//! asynchronous write-behind queue that the IO manager returns spilled segments
//! through. Claiming and recycling segments is the only place the join
//! driver blocks.

use std::sync::mpsc::{channel, Receiver, RecvError, Sender};
use crate::error::{JoinError, Result};
use crate::segment::Segment;

/// Tracks free segments for one join instance. The `available` list is popped
/// synchronously by [`acquire`](Self::acquire); the `write_behind` channel is
/// where the IO manager deposits segments once their spill write completes.
///
/// `write_behind_available` counts segments the join has already *freed* by
/// spilling but whose writes haven't drained yet -- i.e. segments logically
/// owed to `available`, just not there yet. Tracking this separately from the
/// channel's own length lets [`acquire`](Self::acquire) decide to block only
/// when a write is genuinely still outstanding, rather than whenever the
/// channel happens to be momentarily empty.
pub struct SegmentPool<const S: usize> {
	available: Vec<Segment<S>>,
	write_behind_tx: Sender<Segment<S>>,
	write_behind_rx: Receiver<Segment<S>>,
	write_behind_available: usize,
	initial_count: usize,
}

impl<const S: usize> SegmentPool<S> {
	/// Builds a pool from the memory manager's segment list. The list is
	/// consumed; every segment in it becomes part of `initial_count`, the
	/// quantity the join's segment-conservation check is measured against.
	pub fn new(segments: Vec<Segment<S>>) -> Self {
		let (write_behind_tx, write_behind_rx) = channel();
		let initial_count = segments.len();
		Self {
			available: segments,
			write_behind_tx,
			write_behind_rx,
			write_behind_available: 0,
			initial_count,
		}
	}

	/// A cloneable handle an IO manager's writer uses to return segments to this
	/// pool once their spill write completes.
	pub fn write_behind_sender(&self) -> Sender<Segment<S>> {
		self.write_behind_tx.clone()
	}

	pub fn initial_count(&self) -> usize { self.initial_count }

	/// The number of segments sitting in the available list right now.
	pub fn available_count(&self) -> usize { self.available.len() }

	/// The number of segments freed by a spill but not yet drained from the
	/// write-behind channel.
	pub fn write_behind_available(&self) -> usize { self.write_behind_available }

	/// Claims one segment if any is free:
	///
	/// 1. Pop the available list if nonempty.
	/// 2. Otherwise, if segments are owed from a spill, block on the write-behind
	///    channel for the first one, then opportunistically drain any more that
	///    are immediately ready.
	/// 3. Otherwise, the pool is exhausted: return `None` so the driver can
	///    invoke `spill()`.
	pub fn acquire(&mut self) -> Result<Option<Segment<S>>> {
		if let Some(seg) = self.available.pop() {
			return Ok(Some(seg));
		}
		if self.write_behind_available == 0 {
			return Ok(None);
		}

		log::debug!("segment pool exhausted, blocking on write-behind queue");
		let seg = self.write_behind_rx.recv().map_err(Self::disconnected)?;
		self.write_behind_available -= 1;
		self.drain_nonblocking();
		Ok(Some(seg))
	}

	/// Blocks for exactly one segment from the write-behind channel, independent
	/// of `write_behind_available`. Used only by [`crate::partition::Partition`]
	/// while spilling, to obtain the fresh spill tail from among the very
	/// buffers that spill is in the middle of streaming out -- the driver
	/// registers the rest of the freed count with [`reclaim_from_spill`]
	/// afterward.
	///
	/// [`reclaim_from_spill`]: Self::reclaim_from_spill
	pub fn take_write_behind_blocking(&mut self) -> Result<Segment<S>> {
		self.write_behind_rx.recv().map_err(Self::disconnected)
	}

	/// Registers `n` segments as freed by a spill, then opportunistically drains
	/// any writes that have already completed.
	pub fn reclaim_from_spill(&mut self, n: usize) {
		self.write_behind_available += n;
		self.drain_nonblocking();
	}

	/// Drains segments already sitting in the write-behind channel into
	/// `available`, without blocking. Used after `reclaim_from_spill` and as
	/// part of `acquire`'s opportunistic drain.
	fn drain_nonblocking(&mut self) {
		while self.write_behind_available > 0 {
			match self.write_behind_rx.try_recv() {
				Ok(seg) => {
					self.available.push(seg);
					self.write_behind_available -= 1;
				}
				Err(_) => break,
			}
		}
	}

	fn disconnected(_: RecvError) -> JoinError {
		JoinError::io(
			"waiting for a write-behind segment",
			std::io::Error::new(std::io::ErrorKind::BrokenPipe, "write-behind channel disconnected"),
		)
	}

	/// Consumes the pool, returning every segment it still holds -- used by
	/// `close()` to give segments back to the memory manager.
	pub fn into_available(mut self) -> Vec<Segment<S>> {
		self.drain_nonblocking();
		std::mem::take(&mut self.available)
	}

	/// The sum this pool contributes to the join's total segment count: available plus
	/// in-flight write-behind segments.
	pub fn accounted_for(&self) -> usize {
		self.available.len() + self.write_behind_available
	}
}
