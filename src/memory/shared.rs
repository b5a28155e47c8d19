//! Host mapping of a shared memory object.
//!
//! A [`SharedMemorySegment`] owns the file descriptor of a shared memory
//! object (POSIX `shm_open` or memfd) together with a read/write, shared
//! mapping of exactly the requested length. Dropping the segment unmaps it
//! and closes the descriptor; the object itself belongs to whoever created
//! it and is never unlinked here.

use crate::error::{Error, Result};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::mm::{MapFlags, ProtFlags};
use std::ptr::NonNull;

/// Longest object name accepted by `shm_open` (NAME_MAX).
const SHM_NAME_MAX: usize = 255;

/// Turn an object name into a portable `shm_open` path.
///
/// A leading `/` is added when missing. Names may not be empty, contain a
/// further `/` or a NUL byte, or exceed `NAME_MAX`.
pub fn object_path(name: &str) -> Result<String> {
    let bare = name.strip_prefix('/').unwrap_or(name);
    let invalid = |reason| Error::InvalidName {
        name: name.to_string(),
        reason,
    };

    if bare.is_empty() {
        return Err(invalid("name is empty"));
    }
    if bare.contains('/') {
        return Err(invalid("name must not contain '/' after the first character"));
    }
    if bare.contains('\0') {
        return Err(invalid("name must not contain NUL"));
    }
    if bare.len() > SHM_NAME_MAX {
        return Err(invalid("name is longer than 255 bytes"));
    }

    Ok(format!("/{bare}"))
}

/// A shared, read/write mapping of a shared memory object.
pub struct SharedMemorySegment {
    /// The object's file descriptor.
    fd: OwnedFd,
    /// Pointer to the mmap'd region.
    ptr: NonNull<u8>,
    /// Length of the mapping.
    len: usize,
    /// Effective object name (for diagnostics).
    name: String,
}

impl SharedMemorySegment {
    /// Resize the object behind `fd` to exactly `size` bytes and map it.
    ///
    /// # Errors
    ///
    /// Returns an error if `size` is zero, or if `ftruncate` or `mmap` fail.
    pub fn map(fd: OwnedFd, name: &str, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidSize {
                size: 0,
                reason: "size must be greater than 0",
            });
        }

        rustix::fs::ftruncate(&fd, size as u64)
            .map_err(|e| Error::segment("ftruncate", name, e))?;

        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        }
        .map_err(|e| Error::segment("mmap", name, e))?;

        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::segment("mmap", name, rustix::io::Errno::FAULT))?;

        Ok(Self {
            fd,
            ptr,
            len: size,
            name: name.to_string(),
        })
    }

    /// Effective object name this segment was opened under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start of the host mapping.
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Length of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false: zero-length segments cannot be constructed.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// View the mapped bytes.
    ///
    /// # Safety
    ///
    /// The memory is shared with another process. The caller must ensure
    /// the peer does not write the viewed bytes for the lifetime of the
    /// slice, typically through whatever protocol runs over the region.
    pub unsafe fn as_slice(&self) -> &[u8] {
        // SAFETY: Caller guarantees no concurrent writers.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Mutable view of the mapped bytes.
    ///
    /// # Safety
    ///
    /// The caller must ensure exclusive access to the memory, both within
    /// this process and against the peer process.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        // SAFETY: Caller guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl std::fmt::Debug for SharedMemorySegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemorySegment")
            .field("name", &self.name)
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

impl Drop for SharedMemorySegment {
    fn drop(&mut self) {
        unsafe {
            let _ = rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len);
        }
        // fd is closed when OwnedFd is dropped
    }
}

// SAFETY: The mapping is plain shared memory with no thread-local state;
// access to its contents is governed by the unsafe slice accessors.
unsafe impl Send for SharedMemorySegment {}
unsafe impl Sync for SharedMemorySegment {}

impl AsFd for SharedMemorySegment {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
