//! Metrics collection using metrics-rs.

use metrics::{counter, Unit};
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether metric descriptions have been registered.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Metric names as constants for consistency
const BLOCK_CREATE_TOTAL: &str = "shmblock_block_create_total";
const BLOCK_CREATE_BYTES: &str = "shmblock_block_create_bytes";
const BLOCK_REGISTER_TOTAL: &str = "shmblock_block_register_total";
const BLOCK_REGISTER_BYTES: &str = "shmblock_block_register_bytes";
const BLOCK_LOOKUP_TOTAL: &str = "shmblock_block_lookup_total";
const BLOCK_LOOKUP_HITS: &str = "shmblock_block_lookup_hits";
const BLOCK_LOOKUP_MISSES: &str = "shmblock_block_lookup_misses";

/// Register metric descriptions.
///
/// Call once at application startup, before a recorder starts draining.
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn describe_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(
        BLOCK_CREATE_TOTAL,
        Unit::Count,
        "Total number of shared blocks created"
    );
    metrics::describe_counter!(
        BLOCK_CREATE_BYTES,
        Unit::Bytes,
        "Total capacity of shared blocks created"
    );
    metrics::describe_counter!(
        BLOCK_REGISTER_TOTAL,
        Unit::Count,
        "Total number of segment mappings registered into the cache"
    );
    metrics::describe_counter!(
        BLOCK_REGISTER_BYTES,
        Unit::Bytes,
        "Total capacity of segment mappings registered into the cache"
    );
    metrics::describe_counter!(
        BLOCK_LOOKUP_TOTAL,
        Unit::Count,
        "Total number of mapping-cache lookups"
    );
    metrics::describe_counter!(
        BLOCK_LOOKUP_HITS,
        Unit::Count,
        "Mapping-cache lookups that reused an existing mapping"
    );
    metrics::describe_counter!(
        BLOCK_LOOKUP_MISSES,
        Unit::Count,
        "Mapping-cache lookups that had to map the segment"
    );
}

/// Record a block creation.
#[inline]
pub fn record_block_create(capacity: usize) {
    counter!(BLOCK_CREATE_TOTAL).increment(1);
    counter!(BLOCK_CREATE_BYTES).increment(capacity as u64);
}

/// Record a mapping registered into the cache.
#[inline]
pub fn record_block_register(capacity: usize) {
    counter!(BLOCK_REGISTER_TOTAL).increment(1);
    counter!(BLOCK_REGISTER_BYTES).increment(capacity as u64);
}

/// Record a mapping-cache lookup and its outcome.
#[inline]
pub fn record_block_lookup(hit: bool) {
    counter!(BLOCK_LOOKUP_TOTAL).increment(1);
    if hit {
        counter!(BLOCK_LOOKUP_HITS).increment(1);
    } else {
        counter!(BLOCK_LOOKUP_MISSES).increment(1);
    }
}
