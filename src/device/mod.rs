//! Device instance bookkeeping.
//!
//! Each emulated device object the framework realizes becomes a
//! [`DeviceInstance`] bound to one region. An instance exposes two
//! [`Window`]s: the primary window over the whole region and the reserved
//! (communication) window, which sits at its own `comm_address`.

mod directory;
mod properties;

pub use directory::InstanceDirectory;
pub use properties::{
    ADDRESS_PROP, COMM_ADDRESS_PROP, DeviceProperties, NAME_PROP, RESERVED_SIZE_PROP, SIZE_PROP,
    parse_integer, parse_size,
};

use crate::error::Error;
use crate::registry::RegionId;
use std::fmt;

/// Opaque handle of a device object, chosen by the owning framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u64);

impl InstanceId {
    /// Wrap a framework handle.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw handle.
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl From<u64> for InstanceId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One of the two addressable windows of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Window {
    /// Index 0: the whole region at its guest address.
    Primary = 0,
    /// Index 1: the reserved communication area at `comm_address`.
    Reserved = 1,
}

impl Window {
    /// Numeric window index.
    pub const fn index(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for Window {
    type Error = Error;

    fn try_from(index: u32) -> Result<Self, Self::Error> {
        match index {
            0 => Ok(Window::Primary),
            1 => Ok(Window::Reserved),
            other => Err(Error::InvalidWindow(other)),
        }
    }
}

/// Guest address and length of a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowRange {
    /// Guest physical address.
    pub address: u64,
    /// Length in bytes.
    pub size: u64,
}

/// A live device instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInstance {
    id: InstanceId,
    region: RegionId,
    primary: WindowRange,
    reserved: WindowRange,
}

impl DeviceInstance {
    pub(crate) fn new(
        id: InstanceId,
        region: RegionId,
        primary: WindowRange,
        reserved: WindowRange,
    ) -> Self {
        Self {
            id,
            region,
            primary,
            reserved,
        }
    }

    /// The framework handle.
    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// The region this instance holds a reference on.
    pub fn region(&self) -> RegionId {
        self.region
    }

    /// Address and length of `window`.
    pub fn window(&self, window: Window) -> WindowRange {
        match window {
            Window::Primary => self.primary,
            Window::Reserved => self.reserved,
        }
    }
}
