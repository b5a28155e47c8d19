//! Non-blocking open of a producer's shared memory object.

use crate::error::{Error, Result};
use crate::memory::{SharedMemorySegment, object_path};
use rustix::fd::OwnedFd;
use rustix::fs::{MemfdFlags, Mode};
use rustix::io::Errno;
use rustix::shm;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// One non-blocking attempt to open a named shared memory object.
///
/// Returns `Ok(None)` while the object does not exist yet, so the caller
/// can wait and retry. Any other failure is returned as an error and ends
/// the rendezvous.
pub trait SegmentOpener: Send {
    /// Try to open `name` read/write.
    fn try_open(&mut self, name: &str) -> Result<Option<OwnedFd>>;
}

impl<F> SegmentOpener for F
where
    F: FnMut(&str) -> Result<Option<OwnedFd>> + Send,
{
    fn try_open(&mut self, name: &str) -> Result<Option<OwnedFd>> {
        self(name)
    }
}

/// Opens POSIX shared memory objects with `shm_open(O_RDWR)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PosixShmOpener;

impl SegmentOpener for PosixShmOpener {
    fn try_open(&mut self, name: &str) -> Result<Option<OwnedFd>> {
        let path = object_path(name)?;
        match shm::open(path.as_str(), shm::OFlags::RDWR, Mode::empty()) {
            Ok(fd) => Ok(Some(fd)),
            Err(Errno::NOENT) => Ok(None),
            Err(e) => Err(Error::segment("shm_open", name, e)),
        }
    }
}

/// In-process directory of memfd-backed objects.
///
/// Stands in for an external producer when both sides live in the same
/// process. Cloning yields another handle to the same directory, so one
/// clone can be handed to a [`SegmentAcquirer`](super::SegmentAcquirer)
/// while the producer side keeps publishing through another.
#[derive(Debug, Clone, Default)]
pub struct MemfdDirectory {
    objects: Arc<Mutex<HashMap<String, OwnedFd>>>,
}

impl MemfdDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an object `name` of `size` bytes, replacing any previous one.
    pub fn publish(&self, name: &str, size: usize) -> Result<()> {
        let fd = rustix::fs::memfd_create(name, MemfdFlags::CLOEXEC)
            .map_err(|e| Error::segment("memfd_create", name, e))?;
        rustix::fs::ftruncate(&fd, size as u64)
            .map_err(|e| Error::segment("ftruncate", name, e))?;

        self.lock().insert(name.to_string(), fd);
        Ok(())
    }

    /// Remove `name`. Existing mappings stay valid.
    pub fn withdraw(&self, name: &str) -> bool {
        self.lock().remove(name).is_some()
    }

    /// Whether `name` is currently published.
    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    /// Map a published object from the producer side, at its current size.
    ///
    /// An unpublished name fails with [`Error::Segment`] carrying `ENOENT`.
    pub fn map(&self, name: &str) -> Result<SharedMemorySegment> {
        let fd = self
            .dup(name)?
            .ok_or_else(|| Error::segment("open", name, Errno::NOENT))?;
        let size = rustix::fs::fstat(&fd)?.st_size as usize;
        SharedMemorySegment::map(fd, name, size)
    }

    fn dup(&self, name: &str) -> Result<Option<OwnedFd>> {
        let objects = self.lock();
        match objects.get(name) {
            Some(fd) => Ok(Some(rustix::io::fcntl_dupfd_cloexec(fd, 0)?)),
            None => Ok(None),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, OwnedFd>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SegmentOpener for MemfdDirectory {
    fn try_open(&mut self, name: &str) -> Result<Option<OwnedFd>> {
        self.dup(name)
    }
}
