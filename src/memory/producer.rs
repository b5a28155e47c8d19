//! Producer side of a named shared memory object.
//!
//! In a co-simulation the XTSC process creates the object and the emulator
//! only opens it. [`ShmProducer`] plays that creating role, for tests and
//! for companion tools that stand in for the simulator.

use super::shared::{SharedMemorySegment, object_path};
use crate::error::{Error, Result};
use rustix::fd::OwnedFd;
use rustix::fs::Mode;
use rustix::shm;

/// Owner of a named POSIX shared memory object.
///
/// The object is created exclusively and sized on construction, and
/// unlinked when the producer is dropped. Mappings made from it (by this
/// process or a consumer) stay valid after the unlink.
#[derive(Debug)]
pub struct ShmProducer {
    fd: OwnedFd,
    path: String,
    size: usize,
}

impl ShmProducer {
    /// Create the object `name` with `size` bytes.
    ///
    /// # Errors
    ///
    /// Fails if the name is invalid, the object already exists, or sizing
    /// fails. A partially created object is unlinked before returning.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let path = object_path(name)?;
        let fd = shm::open(
            path.as_str(),
            shm::OFlags::CREATE | shm::OFlags::EXCL | shm::OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|e| Error::segment("shm_open", name, e))?;

        if let Err(e) = rustix::fs::ftruncate(&fd, size as u64) {
            drop(fd);
            let _ = shm::unlink(path.as_str());
            return Err(Error::segment("ftruncate", name, e));
        }

        tracing::debug!(path = %path, size, "created shared memory object");
        Ok(Self { fd, path, size })
    }

    /// The `shm_open` path of the object.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Size the object was created with.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Map the object into this process.
    pub fn map(&self) -> Result<SharedMemorySegment> {
        let fd = rustix::io::fcntl_dupfd_cloexec(&self.fd, 0)?;
        SharedMemorySegment::map(fd, &self.path, self.size)
    }
}

impl Drop for ShmProducer {
    fn drop(&mut self) {
        if let Err(e) = shm::unlink(self.path.as_str()) {
            tracing::warn!(path = %self.path, error = %e, "failed to unlink shared memory object");
        }
    }
}
