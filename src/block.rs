//! Record-oriented I/O over fixed-capacity shared-memory blocks.
//!
//! A [`SharedBlock`] names a fixed-capacity segment and speaks the
//! length-prefixed record protocol over it (see [`crate::codec`]). All
//! mapping and caching detail is hidden: operations reuse a mapping cached
//! in the [`ResourceRegistry`](crate::registry::ResourceRegistry) when one
//! exists, and otherwise map the segment on the spot and cache the fresh
//! mapping for later calls.
//!
//! Mappings of one path are cached per access mode: the canonical (create)
//! entry, a read-only entry, and a read-write entry are three distinct
//! keys, so a read-only consumer never holds a writable view.
//!
//! # Example
//!
//! ```rust,ignore
//! use shmblock::prelude::*;
//!
//! let registry = ResourceRegistry::new();
//! let block = SharedBlock::new(registry.clone(), "/telemetry", 4096);
//!
//! block.create()?;
//! block.write(&mut SliceWriter::new(b"reading: 42"), 0, 4096)?;
//!
//! let mut out = VecConsumer::new();
//! block.read(&mut out)?;
//! assert_eq!(out.bytes(), b"reading: 42");
//! ```

use crate::codec::{self, LEN_PREFIX};
use crate::error::{Error, Result};
use crate::observability;
use crate::registry::{RegistryHandle, SharedResource};
use crate::segment::{AccessMode, SharedMemorySegment};
use std::sync::Arc;

/// Receives one block payload during [`SharedBlock::read`].
///
/// The payload borrow ends with the call; implementations copy out
/// whatever they need to keep.
pub trait BlockConsumer {
    /// Process the payload bytes of the record that was read.
    fn process(&mut self, payload: &[u8]);
}

/// Produces one block payload during [`SharedBlock::write`].
pub trait BlockWriter {
    /// Fill up to `out.len()` bytes and return how many were produced.
    fn write(&mut self, out: &mut [u8]) -> usize;
}

/// A [`BlockWriter`] that copies from a byte slice, truncating to the
/// window when the slice is longer.
pub struct SliceWriter<'a> {
    input: &'a [u8],
}

impl<'a> SliceWriter<'a> {
    /// Wrap `input` as a block writer.
    pub fn new(input: &'a [u8]) -> Self {
        Self { input }
    }
}

impl BlockWriter for SliceWriter<'_> {
    fn write(&mut self, out: &mut [u8]) -> usize {
        let n = self.input.len().min(out.len());
        out[..n].copy_from_slice(&self.input[..n]);
        n
    }
}

/// A [`BlockConsumer`] that keeps the last payload in an owned buffer.
#[derive(Debug, Default)]
pub struct VecConsumer {
    data: Vec<u8>,
}

impl VecConsumer {
    /// New, empty consumer.
    pub fn new() -> Self {
        Self::default()
    }

    /// The last payload read.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Consume self, returning the last payload read.
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

impl BlockConsumer for VecConsumer {
    fn process(&mut self, payload: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(payload);
    }
}

/// Outcome of a block presence probe.
///
/// `exists()` collapses this to a bool; the three-way form keeps the
/// "indeterminate counts as absent" decision visible at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    /// The canonical entry is cached in this process.
    Cached,
    /// The OS object exists but nothing is cached here yet.
    Present,
    /// No such object, or the probe could not tell.
    Absent,
}

/// Record-oriented view of one named fixed-capacity segment.
///
/// Stateless beyond the path, the declared capacity, and the registry
/// handle: all memory state lives in the cached
/// [`SharedMemorySegment`]s.
pub struct SharedBlock {
    path: String,
    capacity: usize,
    registry: RegistryHandle,
}

impl SharedBlock {
    /// A block view of `path` with the given declared capacity.
    pub fn new(registry: RegistryHandle, path: impl Into<String>, capacity: usize) -> Self {
        Self {
            path: path.into(),
            capacity,
            registry,
        }
    }

    /// OS path of the block's segment.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Declared capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stored payload length at the front of a raw block window.
    pub fn length(window: &[u8]) -> u64 {
        codec::decode_len(window)
    }

    /// Create the block: a fresh read-write owner segment of
    /// [`capacity`](Self::capacity) bytes, zero-filled and cached under the
    /// canonical key.
    ///
    /// Fails with [`Error::AlreadyRegistered`] when a block with this
    /// canonical key is already cached, without touching the existing
    /// entry or the OS object behind it.
    pub fn create(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::MapFailed(
                "block capacity must be greater than 0".into(),
            ));
        }
        let canonical = reg_key(&self.path, None);
        // Refuse before touching the OS object: a cached canonical entry
        // means another owner is alive in this process.
        if self.registry.find(&canonical)?.is_some() {
            return Err(Error::AlreadyRegistered { key: canonical });
        }

        tracing::debug!(path = %self.path, capacity = self.capacity, "creating shared block");
        observability::record_block_create(self.capacity);

        let segment = SharedMemorySegment::create(&self.path, self.capacity)?;
        // SAFETY: fresh read-write mapping, not yet visible through the registry.
        if let Some(mem) = unsafe { segment.as_mut_slice() } {
            mem.fill(0);
        }

        let segment = Arc::new(segment);
        let resource: Arc<dyn SharedResource> = segment.clone();
        match self.registry.add(resource, Some(&canonical)) {
            Ok(()) => {
                observability::record_block_register(self.capacity);
                Ok(())
            }
            Err(Error::DuplicateKey { key }) => {
                // Lost the registration race: the cached entry keeps the OS
                // object; this instance must not unlink it on drop.
                if let Some(mut segment) = Arc::into_inner(segment) {
                    segment.disown();
                }
                Err(Error::AlreadyRegistered { key })
            }
            Err(err) => Err(err),
        }
    }

    /// Three-way presence probe: cached canonical entry, OS-level object,
    /// or absent. Probe failures count as absent; nothing is registered.
    pub fn presence(&self) -> Presence {
        let canonical = reg_key(&self.path, None);
        match self.registry.find(&canonical) {
            Ok(Some(_)) => return Presence::Cached,
            Ok(None) => {}
            // A stopped registry cannot answer; indeterminate is absent.
            Err(_) => return Presence::Absent,
        }
        match SharedMemorySegment::probe(&self.path) {
            Ok(_) => Presence::Present,
            Err(_) => Presence::Absent,
        }
    }

    /// True if the block is cached here or its OS object exists.
    pub fn exists(&self) -> bool {
        self.presence() != Presence::Absent
    }

    /// Read the whole block (offset 0, limit = capacity).
    pub fn read(&self, consumer: &mut dyn BlockConsumer) -> Result<bool> {
        self.read_at(consumer, 0, self.capacity)
    }

    /// Read the record stored at `offset`, clamped to `limit`.
    ///
    /// The consumer sees `min(limit, stored length)` payload bytes,
    /// further clamped to the mapped window.
    pub fn read_at(
        &self,
        consumer: &mut dyn BlockConsumer,
        offset: usize,
        limit: usize,
    ) -> Result<bool> {
        self.check_range(offset, limit)?;
        match Self::lookup(&self.registry, &self.path, AccessMode::ReadOnly)? {
            Some(segment) => {
                self.consume_window(&segment, consumer, offset, limit)?;
            }
            None => {
                let segment = SharedMemorySegment::open_existing(&self.path, AccessMode::ReadOnly)?;
                self.consume_window(&segment, consumer, offset, limit)?;
                Self::cache_segment(
                    &self.registry,
                    &self.path,
                    AccessMode::ReadOnly,
                    Arc::new(segment),
                )?;
            }
        }
        Ok(true)
    }

    /// Write a record at `offset`: the writer fills up to
    /// `window - LEN_PREFIX` payload bytes, then the produced count is
    /// stored as the new length field.
    ///
    /// The payload is written before the length field, so an error or
    /// crash mid-call leaves the prior record intact rather than a torn
    /// length/payload pair.
    pub fn write(&self, writer: &mut dyn BlockWriter, offset: usize, limit: usize) -> Result<()> {
        self.check_range(offset, limit)?;
        match Self::lookup(&self.registry, &self.path, AccessMode::ReadWrite)? {
            Some(segment) => self.fill_window(&segment, writer, offset, limit),
            None => {
                let segment =
                    SharedMemorySegment::open_existing(&self.path, AccessMode::ReadWrite)?;
                self.fill_window(&segment, writer, offset, limit)?;
                Self::cache_segment(
                    &self.registry,
                    &self.path,
                    AccessMode::ReadWrite,
                    Arc::new(segment),
                )
            }
        }
    }

    /// Reset the whole block's stored length to 0.
    pub fn clear(&self) -> Result<()> {
        self.clear_at(0, self.capacity)
    }

    /// Reset the stored length at `offset` to 0 without touching the
    /// payload bytes behind it.
    pub fn clear_at(&self, offset: usize, limit: usize) -> Result<()> {
        // Resetting the length field needs a window at least that wide.
        self.write(&mut SliceWriter::new(&[]), offset, limit.max(LEN_PREFIX))
    }

    /// Copy the encoded record (length field + payload, clamped to the
    /// window) from the block at `src_path` to the block at `dest_path`,
    /// both of declared size `block_size`.
    ///
    /// Cached mappings are reused; missing ones are mapped for the copy
    /// and then cached. `read_only_source` picks the mapping mode used
    /// when the source must be freshly mapped; mapping it read-write
    /// instead keeps the number of distinct cached mappings down when the
    /// source is also written elsewhere.
    pub fn copy(
        registry: &RegistryHandle,
        src_path: &str,
        dest_path: &str,
        block_size: usize,
        offset: usize,
        limit: usize,
        read_only_source: bool,
    ) -> Result<()> {
        // Copying a block onto itself is a no-op.
        if src_path == dest_path {
            return Ok(());
        }
        let src_mode = if read_only_source {
            AccessMode::ReadOnly
        } else {
            AccessMode::ReadWrite
        };

        let (src, src_fresh) = match Self::lookup(registry, src_path, src_mode)? {
            Some(segment) => (segment, false),
            None => (
                Arc::new(SharedMemorySegment::open_existing(src_path, src_mode)?),
                true,
            ),
        };
        let (dest, dest_fresh) = match Self::lookup(registry, dest_path, AccessMode::ReadWrite)? {
            Some(segment) => (segment, false),
            None => (
                Arc::new(SharedMemorySegment::open_existing(
                    dest_path,
                    AccessMode::ReadWrite,
                )?),
                true,
            ),
        };

        copy_record(&src, &dest, block_size, offset, limit)?;

        if src_fresh {
            Self::cache_segment(registry, src_path, src_mode, src)?;
        }
        if dest_fresh {
            Self::cache_segment(registry, dest_path, AccessMode::ReadWrite, dest)?;
        }
        Ok(())
    }

    /// Full-range [`copy`](Self::copy).
    pub fn copy_all(
        registry: &RegistryHandle,
        src_path: &str,
        dest_path: &str,
        block_size: usize,
        read_only_source: bool,
    ) -> Result<()> {
        Self::copy(
            registry,
            src_path,
            dest_path,
            block_size,
            0,
            block_size,
            read_only_source,
        )
    }

    fn check_range(&self, offset: usize, limit: usize) -> Result<()> {
        match offset.checked_add(limit) {
            Some(end) if end <= self.capacity => Ok(()),
            _ => Err(Error::OutOfRange {
                capacity: self.capacity,
                offset,
                limit,
                path: self.path.clone(),
            }),
        }
    }

    fn lookup(
        registry: &RegistryHandle,
        path: &str,
        access: AccessMode,
    ) -> Result<Option<Arc<SharedMemorySegment>>> {
        let key = reg_key(path, Some(access));
        let found = registry.find(&key)?;
        observability::record_block_lookup(found.is_some());
        Ok(found.and_then(|resource| resource.into_any().downcast::<SharedMemorySegment>().ok()))
    }

    fn cache_segment(
        registry: &RegistryHandle,
        path: &str,
        access: AccessMode,
        segment: Arc<SharedMemorySegment>,
    ) -> Result<()> {
        let key = reg_key(path, Some(access));
        let capacity = segment.capacity();
        match registry.add(segment, Some(&key)) {
            Ok(()) => {
                observability::record_block_register(capacity);
                Ok(())
            }
            // Lost a registration race: the cached mapping wins and this
            // transient one only unmaps (borrowers never unlink).
            Err(Error::DuplicateKey { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn consume_window(
        &self,
        segment: &SharedMemorySegment,
        consumer: &mut dyn BlockConsumer,
        offset: usize,
        limit: usize,
    ) -> Result<()> {
        // SAFETY: the mapping outlives this call; concurrent writers in
        // other processes are serialized by the caller's own signaling.
        let mem = unsafe { segment.as_slice() }.ok_or_else(|| {
            Error::MapFailed(format!("segment is not mapped: {}", segment.path()))
        })?;

        let end = self
            .capacity
            .min(offset.saturating_add(limit))
            .min(mem.len());
        let start = offset.min(end);
        let window = &mem[start..end];

        let stored = codec::decode_len(window) as usize;
        let effective = stored
            .min(limit)
            .min(window.len().saturating_sub(LEN_PREFIX));
        let payload_start = LEN_PREFIX.min(window.len());
        consumer.process(&window[payload_start..payload_start + effective]);
        Ok(())
    }

    fn fill_window(
        &self,
        segment: &SharedMemorySegment,
        writer: &mut dyn BlockWriter,
        offset: usize,
        limit: usize,
    ) -> Result<()> {
        // SAFETY: as in consume_window; in-process exclusivity of the
        // write window is the caller's contract.
        let mem = unsafe { segment.as_mut_slice() }.ok_or_else(|| {
            Error::MapFailed(format!("segment is not writable: {}", segment.path()))
        })?;

        let end = self
            .capacity
            .min(offset.saturating_add(limit))
            .min(mem.len());
        let window_len = end.saturating_sub(offset);
        if window_len < LEN_PREFIX {
            // Not even the length field fits in this window.
            return Err(Error::OutOfRange {
                capacity: self.capacity,
                offset,
                limit,
                path: self.path.clone(),
            });
        }

        let window = &mut mem[offset..end];
        let (prefix, payload) = window.split_at_mut(LEN_PREFIX);
        let produced = if payload.is_empty() {
            0
        } else {
            writer.write(payload).min(payload.len())
        };
        // Payload first, length field last.
        codec::encode_len(prefix, produced as u64);
        Ok(())
    }
}

/// Registry key for a block path: the bare path is the canonical (create)
/// key; mapped entries carry the access-mode suffix.
fn reg_key(path: &str, access: Option<AccessMode>) -> String {
    match access {
        None => path.to_string(),
        Some(mode) => format!("{}_{}", path, mode.key_suffix()),
    }
}

fn copy_record(
    src: &SharedMemorySegment,
    dest: &SharedMemorySegment,
    block_size: usize,
    offset: usize,
    limit: usize,
) -> Result<()> {
    // SAFETY: both mappings outlive this call; src and dest are distinct
    // mappings (same-path copies were rejected by the caller).
    let src_mem = unsafe { src.as_slice() }
        .ok_or_else(|| Error::MapFailed(format!("segment is not mapped: {}", src.path())))?;
    let dest_mem = unsafe { dest.as_mut_slice() }
        .ok_or_else(|| Error::MapFailed(format!("segment is not writable: {}", dest.path())))?;

    let end = block_size
        .min(offset.saturating_add(limit))
        .min(src_mem.len())
        .min(dest_mem.len());
    if end <= offset {
        return Ok(());
    }

    let src_window = &src_mem[offset..end];
    // The stored length is decoded exactly once, after both mappings have
    // been resolved, so cache-hit and cache-miss calls copy the same record.
    let record = codec::record_len(src_window);
    dest_mem[offset..offset + record].copy_from_slice(&src_window[..record]);
    Ok(())
}
