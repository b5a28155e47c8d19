//! Error types for the region broker.

use crate::device::InstanceId;
use crate::registry::RegionId;
use thiserror::Error;

/// Result type alias using the broker's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification of broker failures.
///
/// None of these are transient: a caller that gets one back should not
/// retry the same request, it should report the device as unusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Ambiguous or impossible memory layout.
    ConfigurationConflict,
    /// Region pool or instance directory is full.
    CapacityExhausted,
    /// The backing host object could not be opened, sized or mapped.
    RendezvousFailure,
    /// The caller broke the API contract.
    ContractViolation,
}

/// Main error type for broker operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Requested window overlaps a live region with a different tuple.
    #[error(
        "region `{name}` at {address:#x}+{size:#x} overlaps live region `{existing_name}` at {existing_address:#x}+{existing_size:#x}"
    )]
    Overlap {
        /// Name of the rejected request.
        name: String,
        /// Guest address of the rejected request.
        address: u64,
        /// Size of the rejected request.
        size: u64,
        /// Name of the live region in the way.
        existing_name: String,
        /// Guest address of the live region.
        existing_address: u64,
        /// Size of the live region.
        existing_size: u64,
    },

    /// Reserved (communication) length is larger than the region.
    #[error("reserved size {reserved_size:#x} exceeds region size {size:#x}")]
    ReservedExceedsSize {
        /// Requested reserved size.
        reserved_size: u64,
        /// Requested region size.
        size: u64,
    },

    /// `address + size` runs past the end of the guest address space.
    #[error("region at {address:#x} with size {size:#x} wraps the address space")]
    AddressWrap {
        /// Requested guest address.
        address: u64,
        /// Requested size.
        size: u64,
    },

    /// Size is zero or cannot be mapped on this host.
    #[error("invalid region size {size:#x}: {reason}")]
    InvalidSize {
        /// Requested size.
        size: u64,
        /// What is wrong with it.
        reason: &'static str,
    },

    /// A device property could not be parsed.
    #[error("invalid property `{key}`: {reason}")]
    InvalidProperty {
        /// Property key as given by the caller.
        key: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Shared memory object name is not usable with `shm_open`.
    #[error("invalid shared memory name `{name}`: {reason}")]
    InvalidName {
        /// The offending name.
        name: String,
        /// What is wrong with it.
        reason: &'static str,
    },

    /// Every region slot is in use.
    #[error("region pool exhausted: all {capacity} slots in use")]
    RegionPoolExhausted {
        /// Configured pool capacity.
        capacity: usize,
    },

    /// The live-instance directory is full.
    #[error("instance directory full: {capacity} instances live")]
    DirectoryFull {
        /// Configured directory capacity.
        capacity: usize,
    },

    /// The producer never created the object within the retry budget.
    #[error("shared memory `{name}` did not appear after {attempts} attempts")]
    RendezvousTimeout {
        /// Effective object name that was waited for.
        name: String,
        /// Number of open attempts made.
        attempts: u32,
    },

    /// A host call on the shared memory object failed.
    #[error("{op} failed for shared memory `{name}`: {source}")]
    Segment {
        /// The failing call (`shm_open`, `ftruncate`, `mmap`, ...).
        op: &'static str,
        /// Effective object name.
        name: String,
        /// Underlying errno.
        #[source]
        source: rustix::io::Errno,
    },

    /// The guest address space refused the mapping.
    #[error("guest mapping of {address:#x}+{size:#x} failed: {reason}")]
    GuestMapping {
        /// Guest address of the window.
        address: u64,
        /// Size of the window.
        size: u64,
        /// Reason reported by the address space.
        reason: String,
    },

    /// Window index other than 0 (primary) or 1 (reserved).
    #[error("invalid window index {0}")]
    InvalidWindow(u32),

    /// No live instance with this handle.
    #[error("unknown device instance {0}")]
    UnknownInstance(InstanceId),

    /// The instance handle is already attached.
    #[error("device instance {0} is already attached")]
    AlreadyAttached(InstanceId),

    /// No live region in this slot.
    #[error("unknown region {0}")]
    UnknownRegion(RegionId),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Overlap { .. }
            | Error::ReservedExceedsSize { .. }
            | Error::AddressWrap { .. }
            | Error::InvalidSize { .. }
            | Error::InvalidProperty { .. }
            | Error::InvalidName { .. }
            | Error::GuestMapping { .. } => ErrorKind::ConfigurationConflict,
            Error::RegionPoolExhausted { .. } | Error::DirectoryFull { .. } => {
                ErrorKind::CapacityExhausted
            }
            Error::RendezvousTimeout { .. }
            | Error::Segment { .. }
            | Error::System(_) => ErrorKind::RendezvousFailure,
            Error::InvalidWindow(_)
            | Error::UnknownInstance(_)
            | Error::AlreadyAttached(_)
            | Error::UnknownRegion(_) => ErrorKind::ContractViolation,
        }
    }

    pub(crate) fn segment(op: &'static str, name: &str, source: rustix::io::Errno) -> Self {
        Error::Segment {
            op,
            name: name.to_string(),
            source,
        }
    }
}
