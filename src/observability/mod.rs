//! Observability: metrics and tracing.
//!
//! - **Metrics**: counters, gauges and histograms via `metrics-rs`
//! - **Tracing**: structured events and spans via `tracing`
//!
//! ## Metrics
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `xtsc_regions_live` | Gauge | Regions currently mapped into the guest |
//! | `xtsc_instances_live` | Gauge | Device instances currently attached |
//! | `xtsc_segments_mapped` | Counter | Host segments opened and mapped |
//! | `xtsc_segments_unmapped` | Counter | Host segments torn down |
//! | `xtsc_rendezvous_attempts` | Counter | Open attempts against producer objects |
//! | `xtsc_rendezvous_wait_ns` | Histogram | Time until the producer's object appeared |
//!
//! ## Tracing
//!
//! Spans are emitted for device attach/detach and for each rendezvous.
//! Nothing is recorded unless the host installs a subscriber or recorder.

mod metrics;
mod tracing_support;

pub use metrics::{
    init_metrics, record_instances_live, record_regions_live, record_rendezvous_attempt,
    record_rendezvous_wait, record_segment_mapped, record_segment_unmapped,
};
pub use tracing_support::{span_attach, span_detach, span_rendezvous};
