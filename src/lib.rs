//! # shmblock
//!
//! Named shared-memory blocks with a process-wide mapping cache.
//!
//! Independent OS processes exchange variable-length payloads through
//! fixed-capacity named shared-memory segments. Within one process, a
//! reference-counted [`registry::ResourceRegistry`] multiplexes the OS
//! mappings so that repeated block operations on the same segment reuse
//! one `mmap` instead of issuing a new one per call.
//!
//! ## Layers
//!
//! - [`segment::SharedMemorySegment`]: one POSIX shared-memory object plus
//!   its mapped region, with explicit ownership of the OS-level name
//! - [`registry::ResourceRegistry`]: process-wide cache that
//!   reference-counts shareable resources and destroys each exactly once
//! - [`block::SharedBlock`]: length-prefixed record I/O over a
//!   fixed-capacity segment, hiding mapping and caching details
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use shmblock::prelude::*;
//!
//! let registry = ResourceRegistry::new();
//!
//! // Producer: create a 4KB block and publish a payload
//! let block = SharedBlock::new(registry.clone(), "/my-block", 4096);
//! block.create()?;
//! block.write(&mut SliceWriter::new(b"hello"), 0, 4096)?;
//!
//! // Consumer (same or different process): read it back
//! let mut out = VecConsumer::new();
//! block.read(&mut out)?;
//! assert_eq!(out.bytes(), b"hello");
//! ```
//!
//! Shared memory itself is the cross-process primitive: this crate provides
//! no cross-process locking, so writers and readers in different processes
//! must serialize through an out-of-band channel of their own.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod block;
pub mod codec;
pub mod error;
pub mod observability;
pub mod registry;
pub mod segment;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::block::{
        BlockConsumer, BlockWriter, Presence, SharedBlock, SliceWriter, VecConsumer,
    };
    pub use crate::error::{Error, Result};
    pub use crate::registry::{RegistryHandle, ResourceRegistry, SharedResource};
    pub use crate::segment::{AccessMode, Ownership, SegmentFlags, SharedMemorySegment};
}

pub use error::{Error, Result};
