//! The broker: region registry plus live device instances.
//!
//! [`Broker`] is the context object the device lifecycle framework drives.
//! `attach` is called from the device's realize hook and `detach` from its
//! unrealize hook; both take `&mut self`, so callers are serialized by
//! construction. Hosts that need to share one broker across threads wrap
//! it in a single mutex ([`SharedBroker`]) around the whole path.
//!
//! # Example
//!
//! ```rust,ignore
//! use xtsc_shm::prelude::*;
//!
//! let mut broker = Broker::new(BrokerConfig::default(), RecordingAddressSpace::new());
//!
//! let props = DeviceProperties::parse("address=0xf0000000,size=16M,reservedSize=64K")?;
//! broker.attach(InstanceId::new(1), &props)?;
//!
//! assert_eq!(broker.address_of(InstanceId::new(1), Window::Primary)?, 0xf000_0000);
//! broker.detach(InstanceId::new(1))?;
//! ```

use crate::acquirer::{RendezvousConfig, SegmentAcquirer, SegmentOpener};
use crate::address_space::GuestAddressSpace;
use crate::defaults;
use crate::device::{
    DeviceInstance, DeviceProperties, InstanceDirectory, InstanceId, Window, WindowRange,
};
use crate::error::{Error, Result};
use crate::observability::{record_instances_live, span_attach, span_detach};
use crate::registry::{RegionRegistry, SharedMemoryRegion};
use std::collections::HashMap;
use std::fmt;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

/// A broker shared between threads behind one lock.
pub type SharedBroker<A> = Arc<Mutex<Broker<A>>>;

/// Broker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Maximum number of concurrently live regions.
    pub max_regions: usize,
    /// Maximum number of concurrently attached instances.
    pub max_instances: usize,
    /// Object base name for devices that do not set `name`.
    pub default_name: String,
    /// Label given to guest mappings.
    pub region_label: String,
    /// Producer rendezvous settings.
    pub rendezvous: RendezvousConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_regions: defaults::MAX_REGIONS,
            max_instances: defaults::MAX_INSTANCES,
            default_name: defaults::DEFAULT_REGION_NAME.to_string(),
            region_label: defaults::DEVICE_LABEL.to_string(),
            rendezvous: RendezvousConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// Set the region pool capacity.
    pub fn with_max_regions(mut self, max_regions: usize) -> Self {
        self.max_regions = max_regions;
        self
    }

    /// Set the instance directory capacity.
    pub fn with_max_instances(mut self, max_instances: usize) -> Self {
        self.max_instances = max_instances;
        self
    }

    /// Set the default object base name.
    pub fn with_default_name(mut self, name: impl Into<String>) -> Self {
        self.default_name = name.into();
        self
    }

    /// Set the guest mapping label.
    pub fn with_region_label(mut self, label: impl Into<String>) -> Self {
        self.region_label = label.into();
        self
    }

    /// Set the rendezvous settings.
    pub fn with_rendezvous(mut self, rendezvous: RendezvousConfig) -> Self {
        self.rendezvous = rendezvous;
        self
    }
}

/// Region registry plus the live device instances bound to it.
pub struct Broker<A> {
    registry: RegionRegistry<A>,
    instances: HashMap<InstanceId, DeviceInstance>,
    directory: InstanceDirectory,
    default_name: String,
}

impl<A: GuestAddressSpace> Broker<A> {
    /// Broker over POSIX shared memory.
    pub fn new(config: BrokerConfig, address_space: A) -> Self {
        let acquirer = SegmentAcquirer::new(config.rendezvous.clone());
        Self::with_acquirer(config, acquirer, address_space)
    }

    /// Broker opening objects through `opener`.
    pub fn with_opener(
        config: BrokerConfig,
        opener: impl SegmentOpener + 'static,
        address_space: A,
    ) -> Self {
        let acquirer = SegmentAcquirer::with_opener(config.rendezvous.clone(), opener);
        Self::with_acquirer(config, acquirer, address_space)
    }

    /// Broker with a fully configured acquirer.
    ///
    /// `config.rendezvous` is ignored; the acquirer carries its own.
    pub fn with_acquirer(config: BrokerConfig, acquirer: SegmentAcquirer, address_space: A) -> Self {
        Self {
            registry: RegionRegistry::new(
                config.max_regions,
                acquirer,
                address_space,
                config.region_label,
            ),
            instances: HashMap::with_capacity(config.max_instances),
            directory: InstanceDirectory::new(config.max_instances),
            default_name: config.default_name,
        }
    }

    /// Wrap the broker for sharing between threads.
    pub fn into_shared(self) -> SharedBroker<A> {
        Arc::new(Mutex::new(self))
    }

    /// Bind `id` to the region its properties describe.
    ///
    /// On error nothing changes: the instance is not listed and no
    /// reference is held.
    pub fn attach(&mut self, id: InstanceId, props: &DeviceProperties) -> Result<()> {
        let _span = span_attach(id).entered();

        // Checked before the region is acquired; the push below cannot fail.
        self.directory.check_insert(id)?;

        let key = props.region_key(&self.default_name);
        let primary = WindowRange {
            address: key.guest_address,
            size: key.size,
        };
        let reserved = WindowRange {
            address: props.comm_address_or_base(),
            size: key.reserved_size,
        };

        let region = self.registry.acquire(key)?;
        self.directory.push_checked(id);
        self.instances
            .insert(id, DeviceInstance::new(id, region, primary, reserved));

        tracing::info!(
            instance = %id,
            region = %region,
            address = primary.address,
            size = primary.size,
            "instance attached"
        );
        record_instances_live(self.directory.len());
        Ok(())
    }

    /// Unbind `id`, releasing its region reference.
    pub fn detach(&mut self, id: InstanceId) -> Result<()> {
        let _span = span_detach(id).entered();

        let instance = self.instances.remove(&id).ok_or(Error::UnknownInstance(id))?;
        self.directory.remove(id)?;
        let remaining = self.registry.release(instance.region())?;

        tracing::info!(instance = %id, remaining, "instance detached");
        record_instances_live(self.directory.len());
        Ok(())
    }

    /// The live instance `id`.
    pub fn instance(&self, id: InstanceId) -> Result<&DeviceInstance> {
        self.instances.get(&id).ok_or(Error::UnknownInstance(id))
    }

    /// Address and length of one of `id`'s windows.
    pub fn window(&self, id: InstanceId, window: Window) -> Result<WindowRange> {
        Ok(self.instance(id)?.window(window))
    }

    /// Guest address of one of `id`'s windows.
    pub fn address_of(&self, id: InstanceId, window: Window) -> Result<u64> {
        Ok(self.window(id, window)?.address)
    }

    /// Length of one of `id`'s windows.
    pub fn size_of(&self, id: InstanceId, window: Window) -> Result<u64> {
        Ok(self.window(id, window)?.size)
    }

    /// Live instances in attach order.
    pub fn enumerate_live_instances(&self) -> Vec<InstanceId> {
        self.directory.as_slice().to_vec()
    }

    /// The earliest attached live instance, for single-instance callers.
    pub fn first_live_instance(&self) -> Option<InstanceId> {
        self.directory.first()
    }

    /// The region `id` is bound to.
    pub fn region_of(&self, id: InstanceId) -> Result<&SharedMemoryRegion> {
        let region = self.instance(id)?.region();
        self.registry.get(region).ok_or(Error::UnknownRegion(region))
    }

    /// Host address of `id`'s primary window.
    pub fn host_ptr(&self, id: InstanceId) -> Result<NonNull<u8>> {
        Ok(self.region_of(id)?.host_ptr())
    }

    /// Host view of `id`'s primary window.
    ///
    /// # Safety
    ///
    /// The memory is shared with the producer process and with every other
    /// instance on the same region. The caller must ensure nobody writes
    /// the viewed bytes while the slice is alive.
    pub unsafe fn host_slice(&self, id: InstanceId) -> Result<&[u8]> {
        // SAFETY: Forwarded to the caller.
        Ok(unsafe { self.region_of(id)?.segment().as_slice() })
    }

    /// The region registry.
    pub fn registry(&self) -> &RegionRegistry<A> {
        &self.registry
    }

    /// The guest address space collaborator.
    pub fn address_space(&self) -> &A {
        self.registry.address_space()
    }

    /// Number of attached instances.
    pub fn len(&self) -> usize {
        self.directory.len()
    }

    /// Whether no instance is attached.
    pub fn is_empty(&self) -> bool {
        self.directory.is_empty()
    }
}

impl<A> fmt::Debug for Broker<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("registry", &self.registry)
            .field("directory", &self.directory)
            .field("default_name", &self.default_name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquirer::{MemfdDirectory, TokenSource};
    use crate::address_space::RecordingAddressSpace;
    use crate::error::ErrorKind;
    use std::time::Duration;

    const BASE: u64 = 0xf000_0000;

    fn broker(directory: &MemfdDirectory, max_instances: usize) -> Broker<RecordingAddressSpace> {
        let config = BrokerConfig::default()
            .with_max_instances(max_instances)
            .with_rendezvous(
                RendezvousConfig::default()
                    .with_token(TokenSource::None)
                    .with_attempts(1)
                    .with_interval(Duration::ZERO),
            );
        Broker::with_opener(config, directory.clone(), RecordingAddressSpace::new())
    }

    fn id(raw: u64) -> InstanceId {
        InstanceId::new(raw)
    }

    #[test]
    fn test_attach_uses_default_name() {
        let directory = MemfdDirectory::new();
        directory.publish(defaults::DEFAULT_REGION_NAME, 0).unwrap();
        let mut broker = broker(&directory, 4);

        broker.attach(id(1), &DeviceProperties::new(BASE, 0x1000)).unwrap();
        assert_eq!(broker.region_of(id(1)).unwrap().name(), "SharedRAM_L");
        assert_eq!(
            broker.address_space().window_at(BASE).unwrap().label,
            "goldfish_xtsc"
        );
    }

    #[test]
    fn test_windows() {
        let directory = MemfdDirectory::new();
        directory.publish("ram", 0).unwrap();
        let mut broker = broker(&directory, 4);

        let props = DeviceProperties::new(BASE, 0x10000)
            .with_name("ram")
            .with_comm_address(0xe000_0000)
            .with_reserved_size(0x1000);
        broker.attach(id(1), &props).unwrap();

        assert_eq!(broker.address_of(id(1), Window::Primary).unwrap(), BASE);
        assert_eq!(broker.size_of(id(1), Window::Primary).unwrap(), 0x10000);
        assert_eq!(broker.address_of(id(1), Window::Reserved).unwrap(), 0xe000_0000);
        assert_eq!(broker.size_of(id(1), Window::Reserved).unwrap(), 0x1000);

        let raw = Window::try_from(1).unwrap();
        assert_eq!(broker.size_of(id(1), raw).unwrap(), 0x1000);
    }

    #[test]
    fn test_comm_address_defaults_to_base() {
        let directory = MemfdDirectory::new();
        directory.publish("ram", 0).unwrap();
        let mut broker = broker(&directory, 4);

        let props = DeviceProperties::new(BASE, 0x2000)
            .with_name("ram")
            .with_reserved_size(0x100);
        broker.attach(id(1), &props).unwrap();
        assert_eq!(
            broker.window(id(1), Window::Reserved).unwrap(),
            WindowRange {
                address: BASE,
                size: 0x100
            }
        );
    }

    #[test]
    fn test_unknown_instance() {
        let directory = MemfdDirectory::new();
        let mut broker = broker(&directory, 4);

        let err = broker.detach(id(5)).unwrap_err();
        assert!(matches!(err, Error::UnknownInstance(_)));
        assert_eq!(err.kind(), ErrorKind::ContractViolation);
        assert!(broker.address_of(id(5), Window::Primary).is_err());
        assert_eq!(broker.first_live_instance(), None);
    }

    #[test]
    fn test_double_attach_rejected() {
        let directory = MemfdDirectory::new();
        directory.publish("ram", 0).unwrap();
        let mut broker = broker(&directory, 4);
        let props = DeviceProperties::new(BASE, 0x1000).with_name("ram");

        broker.attach(id(1), &props).unwrap();
        assert!(matches!(
            broker.attach(id(1), &props),
            Err(Error::AlreadyAttached(_))
        ));
        assert_eq!(broker.region_of(id(1)).unwrap().ref_count(), 1);
    }

    #[test]
    fn test_directory_full_leaves_no_reference() {
        let directory = MemfdDirectory::new();
        directory.publish("ram", 0).unwrap();
        let mut broker = broker(&directory, 1);
        let props = DeviceProperties::new(BASE, 0x1000).with_name("ram");

        broker.attach(id(1), &props).unwrap();
        let err = broker.attach(id(2), &props).unwrap_err();
        assert!(matches!(err, Error::DirectoryFull { capacity: 1 }));
        assert_eq!(broker.region_of(id(1)).unwrap().ref_count(), 1);
        assert_eq!(broker.enumerate_live_instances(), vec![id(1)]);
    }

    #[test]
    fn test_directory_full_rejected_before_any_mapping() {
        let directory = MemfdDirectory::new();
        directory.publish("ram", 0).unwrap();
        directory.publish("other", 0).unwrap();
        let mut broker = broker(&directory, 1);

        broker
            .attach(id(1), &DeviceProperties::new(BASE, 0x1000).with_name("ram"))
            .unwrap();
        let props = DeviceProperties::new(BASE + 0x10000, 0x1000).with_name("other");
        assert!(matches!(
            broker.attach(id(2), &props),
            Err(Error::DirectoryFull { .. })
        ));

        assert_eq!(broker.registry().len(), 1);
        assert_eq!(broker.address_space().map_calls(), 1);
        assert!(!broker.address_space().is_mapped(BASE + 0x10000));
    }

    #[test]
    fn test_failed_attach_is_not_listed() {
        let directory = MemfdDirectory::new();
        let mut broker = broker(&directory, 4);

        assert!(broker
            .attach(id(1), &DeviceProperties::new(BASE, 0x1000).with_name("absent"))
            .is_err());
        assert!(broker.is_empty());
        assert!(broker.registry().is_empty());
        assert!(broker.instance(id(1)).is_err());
    }

    #[test]
    fn test_host_slice_sees_producer_writes() {
        let directory = MemfdDirectory::new();
        directory.publish("ram", 0x1000).unwrap();
        let producer = directory.map("ram").unwrap();
        let mut broker = broker(&directory, 4);

        broker
            .attach(id(1), &DeviceProperties::new(BASE, 0x1000).with_name("ram"))
            .unwrap();
        unsafe {
            producer.as_mut_slice()[0x10] = 0xab;
            assert_eq!(broker.host_slice(id(1)).unwrap()[0x10], 0xab);
        }
    }
}
