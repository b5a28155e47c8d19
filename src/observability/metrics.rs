//! Metrics collection using metrics-rs.

use metrics::{Unit, counter, gauge, histogram};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

const REGIONS_LIVE: &str = "xtsc_regions_live";
const INSTANCES_LIVE: &str = "xtsc_instances_live";
const SEGMENTS_MAPPED: &str = "xtsc_segments_mapped";
const SEGMENTS_UNMAPPED: &str = "xtsc_segments_unmapped";
const RENDEZVOUS_ATTEMPTS: &str = "xtsc_rendezvous_attempts";
const RENDEZVOUS_WAIT_NS: &str = "xtsc_rendezvous_wait_ns";

/// Initialize metrics descriptions.
///
/// Call once at startup, after installing a recorder. Subsequent calls are
/// no-ops.
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_gauge!(
        REGIONS_LIVE,
        Unit::Count,
        "Regions currently mapped into the guest"
    );
    metrics::describe_gauge!(
        INSTANCES_LIVE,
        Unit::Count,
        "Device instances currently attached"
    );
    metrics::describe_counter!(
        SEGMENTS_MAPPED,
        Unit::Count,
        "Host shared memory segments opened and mapped"
    );
    metrics::describe_counter!(
        SEGMENTS_UNMAPPED,
        Unit::Count,
        "Host shared memory segments unmapped and released"
    );
    metrics::describe_counter!(
        RENDEZVOUS_ATTEMPTS,
        Unit::Count,
        "Open attempts made while waiting for a producer"
    );
    metrics::describe_histogram!(
        RENDEZVOUS_WAIT_NS,
        Unit::Nanoseconds,
        "Time until a producer's object could be opened"
    );
}

/// Record the number of live regions.
#[inline]
pub fn record_regions_live(live: usize) {
    gauge!(REGIONS_LIVE).set(live as f64);
}

/// Record the number of attached instances.
#[inline]
pub fn record_instances_live(live: usize) {
    gauge!(INSTANCES_LIVE).set(live as f64);
}

/// Record a segment being mapped.
#[inline]
pub fn record_segment_mapped(name: &str, bytes: u64) {
    counter!(SEGMENTS_MAPPED, "name" => name.to_string()).increment(1);
    tracing::trace!(name = %name, bytes, "segment mapped");
}

/// Record a segment being torn down.
#[inline]
pub fn record_segment_unmapped(name: &str) {
    counter!(SEGMENTS_UNMAPPED, "name" => name.to_string()).increment(1);
}

/// Record one open attempt against a producer object.
#[inline]
pub fn record_rendezvous_attempt(name: &str) {
    counter!(RENDEZVOUS_ATTEMPTS, "name" => name.to_string()).increment(1);
}

/// Record how long a successful rendezvous took.
#[inline]
pub fn record_rendezvous_wait(name: &str, waited: Duration) {
    histogram!(RENDEZVOUS_WAIT_NS, "name" => name.to_string()).record(waited.as_nanos() as f64);
}
