// SPDX-License-Identifier: Apache-2.0

//! The IO manager contract and two reference implementations.
//!
//! Callers supply an [`IoManager`]: something that can mint channel ids and hand
//! back a [`ChannelWriter`] that asynchronously streams full segments to a
//! channel, returning each one to a `return_queue` sender once its write
//! completes. [`MemoryIoManager`] backs channels with in-process buffers (fast,
//! used by most of this crate's own tests); [`FileIoManager`] backs them with
//! real files under a caller-chosen directory, one file per channel.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread;

use crate::error::{JoinError, Result};
use crate::segment::Segment;

pub type ChannelId = u64;

/// Mints unique channel ids for the spill files a join opens over its lifetime.
pub trait ChannelEnumerator: Send {
	fn next_channel_id(&mut self) -> ChannelId;
}

/// Asynchronously writes full segments to one channel. `write_segment` is
/// expected to return promptly -- the actual write happens off to the side --
/// and the segment is handed back to the pool's write-behind queue once it
/// lands.
pub trait ChannelWriter<const S: usize>: Send {
	fn write_segment(&mut self, segment: Segment<S>) -> Result;
	/// Blocks until every segment handed to `write_segment` has actually been
	/// written, then closes the channel for writing.
	fn close(&mut self) -> Result;
}

/// Reads back the segments written to a channel, in write order. Used to
/// replay a spilled partition's file, and by a caller's recursive second pass.
pub trait ChannelReader<const S: usize>: Send {
	fn read_segment(&mut self) -> Result<Option<Segment<S>>>;
}

/// Supplies channel enumerators and channel writers/readers for spill files.
pub trait IoManager<const S: usize> {
	fn create_channel_enumerator(&self) -> Box<dyn ChannelEnumerator>;

	fn create_block_channel_writer(
		&self,
		channel_id: ChannelId,
		return_queue: Sender<Segment<S>>,
	) -> Result<Box<dyn ChannelWriter<S>>>;

	fn create_channel_reader(&self, channel_id: ChannelId) -> Result<Box<dyn ChannelReader<S>>>;

	/// Deletes a channel's backing storage. Called during `close()` for every
	/// channel the join opened, including on the abort path.
	fn delete_channel(&self, channel_id: ChannelId) -> Result;
}

// --- In-memory reference implementation -----------------------------------

struct StoredSegment<const S: usize> {
	len: usize,
	data: Box<[u8; S]>,
}

type MemoryChannels<const S: usize> = Arc<Mutex<HashMap<ChannelId, Vec<StoredSegment<S>>>>>;

/// An [`IoManager`] backed by in-process buffers. Spilling still round-trips
/// through a background thread per writer, so the asynchrony the driver
/// depends on is exercised even though no disk is touched.
#[derive(Clone)]
pub struct MemoryIoManager<const S: usize> {
	channels: MemoryChannels<S>,
	next_id: Arc<AtomicU64>,
}

impl<const S: usize> MemoryIoManager<S> {
	pub fn new() -> Self {
		Self {
			channels: Arc::new(Mutex::new(HashMap::new())),
			next_id: Arc::new(AtomicU64::new(0)),
		}
	}

	/// Test/diagnostic hook: the number of segments currently stored for a
	/// channel, regardless of whether it has been deleted yet.
	pub fn segment_count(&self, channel_id: ChannelId) -> usize {
		self.channels.lock().unwrap().get(&channel_id).map_or(0, Vec::len)
	}
}

impl<const S: usize> Default for MemoryIoManager<S> {
	fn default() -> Self { Self::new() }
}

struct CountingEnumerator {
	next: Arc<AtomicU64>,
}

impl ChannelEnumerator for CountingEnumerator {
	fn next_channel_id(&mut self) -> ChannelId {
		self.next.fetch_add(1, Ordering::Relaxed)
	}
}

struct MemoryChannelWriter<const S: usize> {
	tx: std::sync::mpsc::Sender<Segment<S>>,
	handle: Option<thread::JoinHandle<()>>,
}

impl<const S: usize> ChannelWriter<S> for MemoryChannelWriter<S> {
	fn write_segment(&mut self, segment: Segment<S>) -> Result {
		self.tx.send(segment).map_err(|_| {
			JoinError::io(
				"writing a spill segment",
				std::io::Error::new(std::io::ErrorKind::BrokenPipe, "spill writer thread is gone"),
			)
		})
	}

	fn close(&mut self) -> Result {
		// Dropping the sender lets the writer thread drain and exit; joining it
		// blocks until every queued segment has actually been stored.
		drop(std::mem::replace(&mut self.tx, std::sync::mpsc::channel().0));
		if let Some(handle) = self.handle.take() {
			handle.join().map_err(|_| {
				JoinError::io(
					"closing a spill writer",
					std::io::Error::new(std::io::ErrorKind::Other, "spill writer thread panicked"),
				)
			})?;
		}
		Ok(())
	}
}

impl<const S: usize> IoManager<S> for MemoryIoManager<S> {
	fn create_channel_enumerator(&self) -> Box<dyn ChannelEnumerator> {
		Box::new(CountingEnumerator { next: self.next_id.clone() })
	}

	fn create_block_channel_writer(
		&self,
		channel_id: ChannelId,
		return_queue: Sender<Segment<S>>,
	) -> Result<Box<dyn ChannelWriter<S>>> {
		let (tx, rx) = std::sync::mpsc::channel::<Segment<S>>();
		let channels = self.channels.clone();
		channels.lock().unwrap().entry(channel_id).or_default();

		let handle = thread::Builder::new()
			.name(format!("spill-write-{channel_id}"))
			.spawn(move || {
				while let Ok(mut segment) = rx.recv() {
					let len = segment.len();
					let mut data = Box::new([0u8; S]);
					data[..len].copy_from_slice(segment.read_at(0, len));
					channels
						.lock()
						.unwrap()
						.entry(channel_id)
						.or_default()
						.push(StoredSegment { len, data });
					segment.clear();
					// The consumer may have gone away (join shutting down); a
					// failed send just means the segment is dropped instead of
					// recycled, which is safe.
					let _ = return_queue.send(segment);
				}
			})
			.expect("failed to spawn spill writer thread");

		Ok(Box::new(MemoryChannelWriter { tx, handle: Some(handle) }))
	}

	fn create_channel_reader(&self, channel_id: ChannelId) -> Result<Box<dyn ChannelReader<S>>> {
		let stored = self
			.channels
			.lock()
			.unwrap()
			.get(&channel_id)
			.map(|segs| {
				segs.iter()
					.map(|s| (s.len, s.data.clone()))
					.collect::<Vec<_>>()
			})
			.unwrap_or_default();
		Ok(Box::new(MemoryChannelReader { segments: stored.into_iter() }))
	}

	fn delete_channel(&self, channel_id: ChannelId) -> Result {
		self.channels.lock().unwrap().remove(&channel_id);
		Ok(())
	}
}

struct MemoryChannelReader<const S: usize> {
	segments: std::vec::IntoIter<(usize, Box<[u8; S]>)>,
}

impl<const S: usize> ChannelReader<S> for MemoryChannelReader<S> {
	fn read_segment(&mut self) -> Result<Option<Segment<S>>> {
		Ok(self.segments.next().map(|(len, data)| Segment::from_parts(data, len)))
	}
}

// --- File-backed reference implementation ----------------------------------

/// An [`IoManager`] backed by real files under `dir`. Each channel is one file;
/// each segment is framed as a 4-byte big-endian length prefix followed by that
/// many bytes, mirroring the length-delimited encoding used elsewhere.
pub struct FileIoManager<const S: usize> {
	dir: PathBuf,
	next_id: Arc<AtomicU64>,
}

impl<const S: usize> FileIoManager<S> {
	pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
		let dir = dir.into();
		fs::create_dir_all(&dir).map_err(|e| JoinError::io("creating spill directory", e))?;
		Ok(Self { dir, next_id: Arc::new(AtomicU64::new(0)) })
	}

	fn channel_path(&self, channel_id: ChannelId) -> PathBuf {
		self.dir.join(format!("spill-{channel_id}.bin"))
	}
}

struct FileChannelWriter<const S: usize> {
	tx: std::sync::mpsc::Sender<Segment<S>>,
	handle: Option<thread::JoinHandle<std::io::Result<()>>>,
}

impl<const S: usize> ChannelWriter<S> for FileChannelWriter<S> {
	fn write_segment(&mut self, segment: Segment<S>) -> Result {
		self.tx.send(segment).map_err(|_| {
			JoinError::io(
				"writing a spill segment",
				std::io::Error::new(std::io::ErrorKind::BrokenPipe, "spill writer thread is gone"),
			)
		})
	}

	fn close(&mut self) -> Result {
		drop(std::mem::replace(&mut self.tx, std::sync::mpsc::channel().0));
		if let Some(handle) = self.handle.take() {
			match handle.join() {
				Ok(Ok(())) => Ok(()),
				Ok(Err(e)) => Err(JoinError::io("flushing a spill file", e)),
				Err(_) => Err(JoinError::io(
					"closing a spill writer",
					std::io::Error::new(std::io::ErrorKind::Other, "spill writer thread panicked"),
				)),
			}
		} else {
			Ok(())
		}
	}
}

impl<const S: usize> IoManager<S> for FileIoManager<S> {
	fn create_channel_enumerator(&self) -> Box<dyn ChannelEnumerator> {
		Box::new(CountingEnumerator { next: self.next_id.clone() })
	}

	fn create_block_channel_writer(
		&self,
		channel_id: ChannelId,
		return_queue: Sender<Segment<S>>,
	) -> Result<Box<dyn ChannelWriter<S>>> {
		let path = self.channel_path(channel_id);
		let (tx, rx) = std::sync::mpsc::channel::<Segment<S>>();

		let handle = thread::Builder::new()
			.name(format!("spill-write-{channel_id}"))
			.spawn(move || -> std::io::Result<()> {
				let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
				while let Ok(mut segment) = rx.recv() {
					let len = segment.len();
					file.write_all(&(len as u32).to_be_bytes())?;
					file.write_all(segment.read_at(0, len))?;
					segment.clear();
					let _ = return_queue.send(segment);
				}
				file.flush()
			})
			.expect("failed to spawn spill writer thread");

		Ok(Box::new(FileChannelWriter { tx, handle: Some(handle) }))
	}

	fn create_channel_reader(&self, channel_id: ChannelId) -> Result<Box<dyn ChannelReader<S>>> {
		let file = File::open(self.channel_path(channel_id))
			.map_err(|e| JoinError::io("opening a spill file for replay", e))?;
		Ok(Box::new(FileChannelReader { file }))
	}

	fn delete_channel(&self, channel_id: ChannelId) -> Result {
		match fs::remove_file(self.channel_path(channel_id)) {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(JoinError::io("deleting a spill file", e)),
		}
	}
}

struct FileChannelReader {
	file: File,
}

impl<const S: usize> ChannelReader<S> for FileChannelReader {
	fn read_segment(&mut self) -> Result<Option<Segment<S>>> {
		let mut len_buf = [0u8; 4];
		match self.file.read_exact(&mut len_buf) {
			Ok(()) => {}
			Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
			Err(e) => return Err(JoinError::io("reading a spill file", e)),
		}
		let len = u32::from_be_bytes(len_buf) as usize;
		let mut data = Box::new([0u8; S]);
		self.file
			.read_exact(&mut data[..len])
			.map_err(|e| JoinError::io("reading a spill file", e))?;
		Ok(Some(Segment::from_parts(data, len)))
	}
}

/// Wraps another [`IoManager`], failing the `n`th segment write for a given
/// channel with an IO error -- used to exercise the interrupt-during-spill
/// scenario without needing a real flaky disk.
pub struct FaultyIoManager<const S: usize, M: IoManager<S>> {
	inner: M,
	fail_after_writes: usize,
}

impl<const S: usize, M: IoManager<S>> FaultyIoManager<S, M> {
	pub fn new(inner: M, fail_after_writes: usize) -> Self {
		Self { inner, fail_after_writes }
	}
}

struct FaultyChannelWriter<const S: usize> {
	inner: Box<dyn ChannelWriter<S>>,
	remaining: usize,
}

impl<const S: usize> ChannelWriter<S> for FaultyChannelWriter<S> {
	fn write_segment(&mut self, segment: Segment<S>) -> Result {
		if self.remaining == 0 {
			return Err(JoinError::io(
				"writing a spill segment",
				std::io::Error::new(std::io::ErrorKind::Other, "injected spill write failure"),
			));
		}
		self.remaining -= 1;
		self.inner.write_segment(segment)
	}

	fn close(&mut self) -> Result {
		self.inner.close()
	}
}

impl<const S: usize, M: IoManager<S>> IoManager<S> for FaultyIoManager<S, M> {
	fn create_channel_enumerator(&self) -> Box<dyn ChannelEnumerator> {
		self.inner.create_channel_enumerator()
	}

	fn create_block_channel_writer(
		&self,
		channel_id: ChannelId,
		return_queue: Sender<Segment<S>>,
	) -> Result<Box<dyn ChannelWriter<S>>> {
		let inner = self.inner.create_block_channel_writer(channel_id, return_queue)?;
		Ok(Box::new(FaultyChannelWriter { inner, remaining: self.fail_after_writes }))
	}

	fn create_channel_reader(&self, channel_id: ChannelId) -> Result<Box<dyn ChannelReader<S>>> {
		self.inner.create_channel_reader(channel_id)
	}

	fn delete_channel(&self, channel_id: ChannelId) -> Result {
		self.inner.delete_channel(channel_id)
	}
}
