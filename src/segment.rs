//! POSIX named shared-memory segment.
//!
//! A [`SharedMemorySegment`] wraps exactly one OS shared-memory object
//! (`shm_open`) and, optionally, one region mapping it into the process
//! address space. The segment may *own* the OS-level name, in which case
//! releasing it also unlinks the name so it becomes free for reuse;
//! borrowers only unmap and close.
//!
//! Release ordering is unmap, then close, then (owner only) unlink:
//! closing a handle while its region is still mapped is undefined behavior
//! on the host OS.

use crate::error::{Error, Result};
use crate::registry::SharedResource;
use rustix::fd::OwnedFd;
use rustix::fs::Mode;
use rustix::mm::{MapFlags, ProtFlags};
use rustix::shm;
use std::any::Any;
use std::ptr::NonNull;
use std::sync::Arc;

/// How a segment is mapped and which registry key suffix it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    /// Read-only mapping.
    ReadOnly,
    /// Read-write mapping.
    ReadWrite,
}

impl AccessMode {
    /// Registry-key suffix distinguishing mappings of one path by mode.
    pub fn key_suffix(&self) -> &'static str {
        match self {
            AccessMode::ReadOnly => "rd",
            AccessMode::ReadWrite => "wr",
        }
    }

    fn prot_flags(&self) -> ProtFlags {
        match self {
            AccessMode::ReadOnly => ProtFlags::READ,
            AccessMode::ReadWrite => ProtFlags::READ | ProtFlags::WRITE,
        }
    }

    fn open_flags(&self) -> shm::OFlags {
        match self {
            AccessMode::ReadOnly => shm::OFlags::RDONLY,
            AccessMode::ReadWrite => shm::OFlags::RDWR,
        }
    }
}

/// Whether this segment instance is responsible for destroying the
/// underlying OS object (not just unmapping it) when released.
///
/// Only the creator sets [`Ownership::Owner`]; everyone else borrows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Unlinks the OS-level name on release.
    Owner,
    /// Unmaps and closes only.
    Borrower,
}

/// Construction flags for [`SharedMemorySegment::open`].
#[derive(Debug, Clone, Copy)]
pub struct SegmentFlags {
    /// Who destroys the OS object on release.
    pub ownership: Ownership,
    /// Create the object if absent (owners first unlink any leftover, so
    /// creation is idempotent).
    pub create_if_missing: bool,
    /// Open the object without mapping it, for existence checks and
    /// creation without touching memory.
    pub no_access: bool,
}

impl Default for SegmentFlags {
    fn default() -> Self {
        Self {
            ownership: Ownership::Borrower,
            create_if_missing: false,
            no_access: false,
        }
    }
}

impl SegmentFlags {
    /// Flags for the creating side: owner + create, mapped.
    pub fn owner_create() -> Self {
        Self {
            ownership: Ownership::Owner,
            create_if_missing: true,
            no_access: false,
        }
    }

    /// Flags for an existence probe: borrower, open-only, unmapped.
    pub fn probe() -> Self {
        Self {
            ownership: Ownership::Borrower,
            create_if_missing: false,
            no_access: true,
        }
    }
}

/// One named OS shared-memory object plus its optional mapped region.
pub struct SharedMemorySegment {
    /// The shm object handle. Taken (closed) during release.
    fd: Option<OwnedFd>,
    /// Base of the mapped region, absent for `no_access` segments.
    ptr: Option<NonNull<u8>>,
    /// Object size in bytes (probes learn it via fstat even when unmapped).
    capacity: usize,
    /// OS path of the object (e.g. `/my-block`).
    path: String,
    access: AccessMode,
    ownership: Ownership,
}

impl SharedMemorySegment {
    /// Open or create the named object and, unless `flags.no_access`, map
    /// it fully into the address space.
    ///
    /// `capacity` is the object size when creating (`flags.create_if_missing`,
    /// must be > 0); for existing objects the real size is taken from the
    /// OS instead.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when opening a non-existent object without
    /// `create_if_missing`; [`Error::MapFailed`] for creation, truncation,
    /// and mapping failures.
    pub fn open(
        path: &str,
        access: AccessMode,
        flags: SegmentFlags,
        capacity: usize,
    ) -> Result<Self> {
        let created = flags.create_if_missing;

        let fd = if created {
            if capacity == 0 {
                return Err(Error::MapFailed(
                    "capacity must be greater than 0 when creating".into(),
                ));
            }
            // Idempotent create: the owner always gets a fresh object.
            if flags.ownership == Ownership::Owner {
                let _ = shm::unlink(path);
            }
            // The fd is opened read-write regardless of the mapping mode;
            // a fresh object must be truncated to size.
            let fd = shm::open(
                path,
                shm::OFlags::CREATE | shm::OFlags::RDWR,
                Mode::from_raw_mode(0o644),
            )
            .map_err(|errno| Error::MapFailed(format!("shm_open({path}) failed: {errno}")))?;

            if let Err(errno) = rustix::fs::ftruncate(&fd, capacity as u64) {
                drop(fd);
                if flags.ownership == Ownership::Owner {
                    let _ = shm::unlink(path);
                }
                return Err(Error::MapFailed(format!(
                    "ftruncate({path}, {capacity}) failed: {errno}"
                )));
            }
            fd
        } else {
            shm::open(path, access.open_flags(), Mode::empty()).map_err(|errno| {
                if errno == rustix::io::Errno::NOENT {
                    Error::NotFound {
                        key: path.to_string(),
                    }
                } else {
                    Error::System(errno)
                }
            })?
        };

        // Existing objects are mapped at their real size, never at a size
        // the caller merely declared.
        let capacity = if created {
            capacity
        } else {
            let stat = rustix::fs::fstat(&fd)?;
            stat.st_size as usize
        };

        let ptr = if flags.no_access {
            None
        } else {
            if capacity == 0 {
                return Err(Error::MapFailed(format!("segment is empty: {path}")));
            }
            // SAFETY: fresh mapping of the whole object; fd is valid and the
            // object is at least `capacity` bytes (ftruncate above, or fstat).
            let raw = unsafe {
                rustix::mm::mmap(
                    std::ptr::null_mut(),
                    capacity,
                    access.prot_flags(),
                    MapFlags::SHARED,
                    &fd,
                    0,
                )
            };
            let raw = match raw {
                Ok(raw) => raw,
                Err(errno) => {
                    drop(fd);
                    if created && flags.ownership == Ownership::Owner {
                        let _ = shm::unlink(path);
                    }
                    return Err(Error::MapFailed(format!("mmap({path}) failed: {errno}")));
                }
            };
            Some(
                NonNull::new(raw.cast::<u8>())
                    .ok_or_else(|| Error::MapFailed("mmap returned null".into()))?,
            )
        };

        Ok(Self {
            fd: Some(fd),
            ptr,
            capacity,
            path: path.to_string(),
            access,
            ownership: flags.ownership,
        })
    }

    /// Create a fresh read-write owner segment of `capacity` bytes.
    pub fn create(path: &str, capacity: usize) -> Result<Self> {
        Self::open(
            path,
            AccessMode::ReadWrite,
            SegmentFlags::owner_create(),
            capacity,
        )
    }

    /// Map an existing segment as a borrower in the given mode.
    pub fn open_existing(path: &str, access: AccessMode) -> Result<Self> {
        Self::open(path, access, SegmentFlags::default(), 0)
    }

    /// Open an existing segment without mapping it (existence probe).
    pub fn probe(path: &str) -> Result<Self> {
        Self::open(path, AccessMode::ReadOnly, SegmentFlags::probe(), 0)
    }

    /// Base pointer of the mapped region, or `None` for unmapped segments.
    pub fn address(&self) -> Option<NonNull<u8>> {
        self.ptr
    }

    /// Size of the segment in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// OS path of the object.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Mapping mode of this instance.
    pub fn access(&self) -> AccessMode {
        self.access
    }

    /// True if this instance destroys the OS object on release.
    pub fn is_owner(&self) -> bool {
        self.ownership == Ownership::Owner
    }

    /// Downgrade to a borrower, so releasing this instance no longer
    /// unlinks the OS-level name.
    pub fn disown(&mut self) {
        self.ownership = Ownership::Borrower;
    }

    /// View the mapped region as a byte slice.
    ///
    /// Returns `None` for unmapped segments.
    ///
    /// # Safety
    ///
    /// The region is shared with other processes; the caller must ensure
    /// no concurrent writer invalidates the read through out-of-band
    /// synchronization, and must not hold the slice across a release.
    pub unsafe fn as_slice(&self) -> Option<&[u8]> {
        self.ptr
            // SAFETY: ptr is a live mapping of exactly `capacity` bytes.
            .map(|ptr| unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.capacity) })
    }

    /// View the mapped region as a mutable byte slice.
    ///
    /// Returns `None` for unmapped or read-only segments.
    ///
    /// # Safety
    ///
    /// As [`as_slice`](Self::as_slice), plus the caller must ensure
    /// exclusive write access. The mutable reference is produced from
    /// `&self` because the mapping is shared state by design.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> Option<&mut [u8]> {
        if self.access == AccessMode::ReadOnly {
            return None;
        }
        self.ptr
            // SAFETY: ptr is a live read-write mapping of `capacity` bytes.
            .map(|ptr| unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), self.capacity) })
    }
}

impl SharedResource for SharedMemorySegment {
    fn key_name(&self) -> String {
        format!("shm:{}", self.path)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl Drop for SharedMemorySegment {
    fn drop(&mut self) {
        // Unmap, then close, then (owner only) unlink the name. Release
        // failures are unreportable here and ignored.
        if let Some(ptr) = self.ptr.take() {
            // SAFETY: ptr/capacity describe the mapping created in open().
            unsafe {
                let _ = rustix::mm::munmap(ptr.as_ptr().cast(), self.capacity);
            }
        }
        drop(self.fd.take());
        if self.ownership == Ownership::Owner {
            let _ = shm::unlink(&self.path);
        }
    }
}

// SAFETY: the mapping is plain shared memory valid from any thread; the fd
// is kernel-refcounted; no thread-local state is held. Synchronization of
// the contents is the caller's contract, as with any SHARED mapping.
unsafe impl Send for SharedMemorySegment {}
unsafe impl Sync for SharedMemorySegment {}
