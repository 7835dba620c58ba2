//! Integration tests for shared-block behavior across the registry,
//! segment, and block layers.
//!
//! These tests exercise real POSIX shared-memory objects; every test uses
//! a process-unique path so parallel test runs cannot collide.

use shmblock::prelude::*;
use std::sync::Arc;
use std::thread;

fn test_path(name: &str) -> String {
    format!("/shmblock-it-{}-{}", name, std::process::id())
}

const LEN_PREFIX: usize = std::mem::size_of::<u64>();

// ============================================================================
// Create / Read Round Trips
// ============================================================================

/// A freshly created block reads back as an empty record.
#[test]
fn test_created_block_reads_empty() {
    let registry = ResourceRegistry::new();
    for capacity in [LEN_PREFIX + 1, 64, 4096, 1 << 20] {
        let path = test_path(&format!("fresh-{capacity}"));
        let block = SharedBlock::new(registry.clone(), &path, capacity);
        block.create().unwrap();

        let mut out = VecConsumer::new();
        assert!(block.read(&mut out).unwrap());
        assert!(out.bytes().is_empty());
    }
    registry.shutdown();
}

/// write → read is a faithful round trip over the default range.
#[test]
fn test_write_read_round_trip() {
    let registry = ResourceRegistry::new();
    let path = test_path("roundtrip");
    let block = SharedBlock::new(registry.clone(), &path, 4096);
    block.create().unwrap();

    let payload = b"the quick brown fox jumps over the lazy dog";
    block
        .write(&mut SliceWriter::new(payload), 0, 4096)
        .unwrap();

    let mut out = VecConsumer::new();
    assert!(block.read(&mut out).unwrap());
    assert_eq!(out.bytes(), payload);

    // Overwrite with a shorter payload; the stored length follows.
    block.write(&mut SliceWriter::new(b"ok"), 0, 4096).unwrap();
    block.read(&mut out).unwrap();
    assert_eq!(out.bytes(), b"ok");

    registry.shutdown();
}

/// Round trips at a non-zero offset, with writer output clamped to the
/// window.
#[test]
fn test_offset_window_round_trip() {
    let registry = ResourceRegistry::new();
    let path = test_path("window");
    let block = SharedBlock::new(registry.clone(), &path, 256);
    block.create().unwrap();

    // Window of 32 bytes at offset 16 leaves 24 payload bytes.
    let long = [7u8; 100];
    block.write(&mut SliceWriter::new(&long), 16, 32).unwrap();

    let mut out = VecConsumer::new();
    block.read_at(&mut out, 16, 32).unwrap();
    assert_eq!(out.bytes(), &long[..32 - LEN_PREFIX]);

    // A smaller read limit truncates what the consumer sees.
    block.read_at(&mut out, 16, LEN_PREFIX + 4).unwrap();
    assert_eq!(out.bytes(), &long[..4]);

    // A sub-prefix read window carries no record at all.
    block.read_at(&mut out, 16, 4).unwrap();
    assert!(out.bytes().is_empty());

    registry.shutdown();
}

/// Records at different offsets are independent.
#[test]
fn test_disjoint_offsets_are_independent() {
    let registry = ResourceRegistry::new();
    let path = test_path("disjoint");
    let block = SharedBlock::new(registry.clone(), &path, 512);
    block.create().unwrap();

    block
        .write(&mut SliceWriter::new(b"first"), 0, 64)
        .unwrap();
    block
        .write(&mut SliceWriter::new(b"second"), 64, 64)
        .unwrap();

    let mut out = VecConsumer::new();
    block.read_at(&mut out, 0, 64).unwrap();
    assert_eq!(out.bytes(), b"first");
    block.read_at(&mut out, 64, 64).unwrap();
    assert_eq!(out.bytes(), b"second");

    registry.shutdown();
}

// ============================================================================
// Range Validation
// ============================================================================

/// offset + limit past the declared capacity always fails, for any capacity.
#[test]
fn test_out_of_range_always_fails() {
    let registry = ResourceRegistry::new();
    for capacity in [1, LEN_PREFIX, 64, 4096] {
        let path = test_path(&format!("oor-{capacity}"));
        let block = SharedBlock::new(registry.clone(), &path, capacity);

        let mut out = VecConsumer::new();
        assert!(matches!(
            block.read_at(&mut out, 0, capacity + 1),
            Err(Error::OutOfRange { .. })
        ));
        assert!(matches!(
            block.read_at(&mut out, capacity, 1),
            Err(Error::OutOfRange { .. })
        ));
        assert!(matches!(
            block.write(&mut SliceWriter::new(b"x"), 1, capacity),
            Err(Error::OutOfRange { .. })
        ));
    }
    registry.shutdown();
}

// ============================================================================
// Clear
// ============================================================================

/// clear resets the stored length and leaves the payload bytes behind it
/// untouched.
#[test]
fn test_clear_resets_length_only() {
    let registry = ResourceRegistry::new();
    let path = test_path("clear");
    let block = SharedBlock::new(registry.clone(), &path, 128);
    block.create().unwrap();

    block
        .write(&mut SliceWriter::new(b"persistent"), 0, 128)
        .unwrap();
    block.clear().unwrap();

    let mut out = VecConsumer::new();
    block.read(&mut out).unwrap();
    assert!(out.bytes().is_empty());

    // The payload bytes are still physically present; only the length
    // field was reset.
    let cached = registry.get(&format!("{path}_wr")).unwrap();
    let segment = cached
        .into_any()
        .downcast::<SharedMemorySegment>()
        .ok()
        .unwrap();
    let mem = unsafe { segment.as_slice() }.unwrap();
    assert_eq!(&mem[LEN_PREFIX..LEN_PREFIX + 10], b"persistent");
    assert_eq!(SharedBlock::length(mem), 0);

    registry.shutdown();
}

// ============================================================================
// Copy
// ============================================================================

/// "hello" travels from A to B and A is unchanged.
#[test]
fn test_copy_between_blocks() {
    let registry = ResourceRegistry::new();
    let path_a = test_path("copy-a");
    let path_b = test_path("copy-b");

    let block_a = SharedBlock::new(registry.clone(), &path_a, 64);
    let block_b = SharedBlock::new(registry.clone(), &path_b, 64);
    block_a.create().unwrap();
    block_b.create().unwrap();

    block_a
        .write(&mut SliceWriter::new(b"hello"), 0, 64)
        .unwrap();

    SharedBlock::copy(&registry, &path_a, &path_b, 64, 0, 64, true).unwrap();

    let mut out = VecConsumer::new();
    block_b.read(&mut out).unwrap();
    assert_eq!(out.bytes(), b"hello");

    // Source unchanged.
    block_a.read(&mut out).unwrap();
    assert_eq!(out.bytes(), b"hello");

    registry.shutdown();
}

/// The slow path registers the mappings it had to create, so a second copy
/// takes the fast (all-cached) path.
#[test]
fn test_copy_slow_path_caches_mappings() {
    let registry = ResourceRegistry::new();
    let path_a = test_path("copycache-a");
    let path_b = test_path("copycache-b");

    let block_a = SharedBlock::new(registry.clone(), &path_a, 64);
    let block_b = SharedBlock::new(registry.clone(), &path_b, 64);
    block_a.create().unwrap();
    block_b.create().unwrap();
    block_a.write(&mut SliceWriter::new(b"abc"), 0, 64).unwrap();

    // Source read-only and dest read-write mappings are not cached yet.
    assert!(registry.find(&format!("{path_a}_rd")).unwrap().is_none());
    assert!(registry.find(&format!("{path_b}_wr")).unwrap().is_none());

    SharedBlock::copy(&registry, &path_a, &path_b, 64, 0, 64, true).unwrap();

    assert!(registry.find(&format!("{path_a}_rd")).unwrap().is_some());
    assert!(registry.find(&format!("{path_b}_wr")).unwrap().is_some());

    // Fast path: repeat copy after changing the source.
    block_a.write(&mut SliceWriter::new(b"xyz!"), 0, 64).unwrap();
    SharedBlock::copy(&registry, &path_a, &path_b, 64, 0, 64, true).unwrap();

    let mut out = VecConsumer::new();
    block_b.read(&mut out).unwrap();
    assert_eq!(out.bytes(), b"xyz!");

    registry.shutdown();
}

/// A read-write source mapping can stand in for the read-only one.
#[test]
fn test_copy_with_read_write_source() {
    let registry = ResourceRegistry::new();
    let path_a = test_path("copyrw-a");
    let path_b = test_path("copyrw-b");

    let block_a = SharedBlock::new(registry.clone(), &path_a, 64);
    let block_b = SharedBlock::new(registry.clone(), &path_b, 64);
    block_a.create().unwrap();
    block_b.create().unwrap();
    block_a
        .write(&mut SliceWriter::new(b"shared"), 0, 64)
        .unwrap();

    SharedBlock::copy(&registry, &path_a, &path_b, 64, 0, 64, false).unwrap();

    // Only a read-write mapping of the source was cached.
    assert!(registry.find(&format!("{path_a}_rd")).unwrap().is_none());
    assert!(registry.find(&format!("{path_a}_wr")).unwrap().is_some());

    let mut out = VecConsumer::new();
    block_b.read(&mut out).unwrap();
    assert_eq!(out.bytes(), b"shared");

    registry.shutdown();
}

// ============================================================================
// Existence Probing
// ============================================================================

/// exists() sees cached blocks, OS-level blocks, and absence.
#[test]
fn test_exists_three_outcomes() {
    let registry = ResourceRegistry::new();
    let path = test_path("exists");
    let block = SharedBlock::new(registry.clone(), &path, 64);

    assert_eq!(block.presence(), Presence::Absent);
    assert!(!block.exists());

    block.create().unwrap();
    assert_eq!(block.presence(), Presence::Cached);
    assert!(block.exists());

    // A second registry in the same process has nothing cached but still
    // sees the OS object.
    let other_registry = ResourceRegistry::new();
    let probe = SharedBlock::new(other_registry.clone(), &path, 64);
    assert_eq!(probe.presence(), Presence::Present);
    assert!(probe.exists());

    // Probing registers nothing.
    assert!(other_registry.is_empty());

    registry.shutdown();
    other_registry.shutdown();

    // Shutdown released the owner, unlinking the OS object.
    let gone = SharedBlock::new(ResourceRegistry::new(), &path, 64);
    assert!(!gone.exists());
}

// ============================================================================
// Mapping Cache Behavior
// ============================================================================

/// Independent lookups of the same (path, mode) key share one mapping.
#[test]
fn test_lookups_share_one_mapping() {
    let registry = ResourceRegistry::new();
    let path = test_path("share");
    let block = SharedBlock::new(registry.clone(), &path, 256);
    block.create().unwrap();

    // First write maps and caches the read-write view.
    block.write(&mut SliceWriter::new(b"one"), 0, 256).unwrap();

    let key = format!("{path}_wr");
    let first = registry
        .get(&key)
        .unwrap()
        .into_any()
        .downcast::<SharedMemorySegment>()
        .ok()
        .unwrap();
    let second = registry
        .get(&key)
        .unwrap()
        .into_any()
        .downcast::<SharedMemorySegment>()
        .ok()
        .unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.address(), second.address());

    registry.shutdown();
}

/// Read and write cache separate mappings per access mode, and repeated
/// operations do not grow the cache.
#[test]
fn test_cache_is_per_access_mode() {
    let registry = ResourceRegistry::new();
    let path = test_path("permode");
    let block = SharedBlock::new(registry.clone(), &path, 128);
    block.create().unwrap();

    let mut out = VecConsumer::new();
    block.write(&mut SliceWriter::new(b"v1"), 0, 128).unwrap();
    block.read(&mut out).unwrap();

    // canonical + rd + wr
    assert_eq!(registry.len(), 3);

    for round in 0..10 {
        block
            .write(&mut SliceWriter::new(format!("v{round}").as_bytes()), 0, 128)
            .unwrap();
        block.read(&mut out).unwrap();
    }
    assert_eq!(registry.len(), 3);

    registry.shutdown();
}

/// Writes through one thread's block view are visible to another thread
/// reading through the same registry.
#[test]
fn test_cross_thread_visibility() {
    let registry = ResourceRegistry::new();
    let path = test_path("threads");
    let block = SharedBlock::new(registry.clone(), &path, 1024);
    block.create().unwrap();

    let writer_registry = registry.clone();
    let writer_path = path.clone();
    let writer = thread::spawn(move || {
        let block = SharedBlock::new(writer_registry, writer_path, 1024);
        block
            .write(&mut SliceWriter::new(b"from the writer thread"), 0, 1024)
            .unwrap();
    });
    writer.join().unwrap();

    let mut out = VecConsumer::new();
    block.read(&mut out).unwrap();
    assert_eq!(out.bytes(), b"from the writer thread");

    registry.shutdown();
}

// ============================================================================
// Registry Lifecycle
// ============================================================================

/// Shutdown releases every cached mapping and fails later operations.
#[test]
fn test_shutdown_releases_blocks() {
    let registry = ResourceRegistry::new();
    let path = test_path("shutdown");
    let block = SharedBlock::new(registry.clone(), &path, 64);
    block.create().unwrap();
    block.write(&mut SliceWriter::new(b"bye"), 0, 64).unwrap();
    assert_eq!(registry.len(), 2);

    registry.shutdown();
    assert!(!registry.ready());

    let mut out = VecConsumer::new();
    assert!(matches!(block.read(&mut out), Err(Error::NotReady)));
    assert!(matches!(
        block.write(&mut SliceWriter::new(b"x"), 0, 64),
        Err(Error::NotReady)
    ));
    assert!(matches!(block.create(), Err(Error::NotReady)));
    // Probe failures normalize to "does not exist".
    assert!(!block.exists());

    // The owner entry was drained, so the OS name is free again.
    assert!(matches!(
        SharedMemorySegment::open_existing(&path, AccessMode::ReadOnly),
        Err(Error::NotFound { .. })
    ));
}
