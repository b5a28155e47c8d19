//! Producer/consumer over POSIX shared memory.
//!
//! Plays both sides of a co-simulation in one process: a producer thread
//! creates the named object after a short delay while the broker, on the
//! main thread, waits for it, attaches two devices sharing the region and
//! reads what the producer wrote.
//!
//! Run with: `cargo run --example producer_consumer`
//!
//! Requirements:
//! - A writable /dev/shm

use std::sync::mpsc;
use std::time::Duration;
use xtsc_shm::memory::ShmProducer;
use xtsc_shm::prelude::*;

const SIZE: usize = 0x10000;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("xtsc_shm=debug")
        .init();

    println!("XTSC Shared Memory Example");
    println!("==========================\n");

    let base = format!("xtsc_demo_{}", std::process::id());
    let token = "1".to_string();
    let object = format!("{base}.{token}");

    let (ready_tx, ready_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel::<()>();
    let producer = std::thread::spawn(move || -> Result<()> {
        std::thread::sleep(Duration::from_millis(1500));
        let producer = ShmProducer::create(&object, SIZE)?;
        let view = producer.map()?;
        // SAFETY: Nobody reads until the ready message is sent.
        unsafe { view.as_mut_slice()[..5].copy_from_slice(b"hello") };
        println!("producer: created {}", producer.path());
        let _ = ready_tx.send(());
        // keep the object alive until the consumer is done
        let _ = done_rx.recv();
        Ok(())
    });

    let config = BrokerConfig::default()
        .with_default_name(base)
        .with_rendezvous(
            RendezvousConfig::default()
                .with_token(TokenSource::Fixed(token))
                .with_attempts(5)
                .with_interval(Duration::from_millis(500)),
        );
    let mut broker = Broker::new(config, RecordingAddressSpace::new());

    let props = DeviceProperties::parse("address=0xf0000000,size=64K,reservedSize=4K")?;
    broker.attach(InstanceId::new(1), &props)?;
    broker.attach(InstanceId::new(2), &props)?;

    let _ = ready_rx.recv();
    for id in broker.enumerate_live_instances() {
        let region = broker.region_of(id)?;
        // SAFETY: The producer has finished writing.
        let greeting = unsafe { &broker.host_slice(id)?[..5] };
        println!(
            "consumer {id}: {} refs={} reads {:?}",
            region.object_name(),
            region.ref_count(),
            String::from_utf8_lossy(greeting)
        );
    }

    for window in broker.address_space().windows() {
        println!(
            "guest {:#x}+{:#x} -> host {:#x} ({})",
            window.guest_address, window.size, window.host_address, window.label
        );
    }

    broker.detach(InstanceId::new(1))?;
    broker.detach(InstanceId::new(2))?;
    println!("\nall instances detached, {} regions live", broker.registry().len());

    let _ = done_tx.send(());
    match producer.join() {
        Ok(result) => result,
        Err(_) => {
            eprintln!("producer thread panicked");
            Ok(())
        }
    }
}
