//! # xtsc-shm
//!
//! Shared-memory region broker for emulated XTSC devices.
//!
//! Emulated device instances map a named host shared memory object, created
//! by an external co-simulation producer, into the guest's physical address
//! space. The broker waits for the producer's object to appear, maps each
//! distinct window exactly once, shares identical windows between instances
//! by reference counting, rejects overlapping windows, and releases the host
//! mapping when the last instance detaches.
//!
//! ## Layers
//!
//! - [`acquirer`]: rendezvous with the producer, resize and map the object
//! - [`registry`]: deduplicated, reference-counted regions in a fixed pool
//! - [`broker`]: device instances, their two windows and the live directory
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use xtsc_shm::prelude::*;
//!
//! let mut broker = Broker::new(BrokerConfig::default(), RecordingAddressSpace::new());
//!
//! // realize
//! let props = DeviceProperties::parse("address=0xf0000000,size=16M")?;
//! broker.attach(InstanceId::new(1), &props)?;
//!
//! // introspection
//! let first = broker.first_live_instance().unwrap();
//! let base = broker.address_of(first, Window::Primary)?;
//!
//! // unrealize
//! broker.detach(InstanceId::new(1))?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod acquirer;
pub mod address_space;
pub mod broker;
pub mod defaults;
pub mod device;
pub mod error;
pub mod memory;
pub mod observability;
pub mod registry;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::acquirer::{
        MemfdDirectory, PosixShmOpener, RendezvousConfig, SegmentAcquirer, SegmentOpener,
        TokenSource,
    };
    pub use crate::address_space::{GuestAddressSpace, RecordingAddressSpace};
    pub use crate::broker::{Broker, BrokerConfig, SharedBroker};
    pub use crate::device::{DeviceProperties, InstanceId, Window, WindowRange};
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::registry::{RegionId, RegionKey, RegionRegistry, SharedMemoryRegion};
}

pub use error::{Error, ErrorKind, Result};
