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

//! A hybrid hash join core: a partitioned, in-memory-first hash table that
//! spills the largest partition to disk under memory pressure instead of
//! failing the join outright.
//!
//! ## How it works
//!
//! The build side is hashed into a fixed number of *partitions*. Each
//! partition starts as a chain of in-memory [`Segment`]s; a compact *bucket
//! table*, also backed by segments, indexes every record by a second,
//! independent hash so probes can jump straight to their candidates instead
//! of scanning a partition linearly.
//!
//! Segments are a fixed pool's entire supply of memory: every partition
//! buffer and every bucket-table page is claimed from the same
//! [`pool::SegmentPool`], and a [`join::HashJoin`] never allocates memory
//! beyond what it was handed at construction. When the pool runs dry, the
//! join driver picks the partition with the most buffered data and spills it
//! -- streaming its segments out through an [`io::IoManager`] and reclaiming
//! them for everyone else. That partition's bucket-table entries degrade
//! into a compact bit vector: membership can still be tested (so probes know
//! whether to bother reading the spill file), but individual pointers are
//! gone, because the segments that backed them have been recycled.
//!
//! Recursing on a spilled partition -- replaying its build and probe spill
//! files as a fresh, smaller join -- is left to the caller;
//! [`join::HashJoin::build_spill_channel`] and
//! [`join::HashJoin::probe_spill_channel`] expose the channel ids needed to
//! do that.
//!
//! ## Usage
//!
//! ```no_run
//! use hashjoin_core::config::JoinConfig;
//! use hashjoin_core::io::MemoryIoManager;
//! use hashjoin_core::record::Record;
//! use hashjoin_core::segment::Segment;
//!
//! let build = (0u32..1_000).map(|k| Record::new(k, b"build value".to_vec()));
//! let probe = (0u32..1_000).map(|k| Record::new(k, Vec::new()));
//! let segments: Vec<Segment<{ 32 * 1024 }>> = (0..64).map(|_| Segment::new()).collect();
//!
//! let mut join = JoinConfig::new(build, probe, segments, MemoryIoManager::new())
//!     .build()
//!     .expect("enough segments for this workload");
//! join.open().expect("build phase");
//! while let Some(result) = join.next().expect("probe phase") {
//!     let _ = result.matches;
//! }
//! join.close().expect("releasing segments");
//! ```

pub mod bucket;
pub mod config;
pub mod error;
pub mod hash;
pub mod io;
pub mod join;
pub mod partition;
pub mod pool;
pub mod record;
pub mod segment;
pub mod sizing;

pub use config::JoinConfig;
pub use error::{JoinError, Result};
pub use io::{ChannelEnumerator, ChannelId, ChannelReader, ChannelWriter, IoManager};
pub use join::{HashJoin, ProbeResult};
pub use partition::{InsertOutcome, Partition, Pointer};
pub use pool::SegmentPool;
pub use record::{FixedWidth, Key, Record};
pub use segment::{Segment, DEFAULT_SEGMENT_SIZE, HASH_BUCKET_SIZE};
