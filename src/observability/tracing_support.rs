//! Span helpers for device lifecycle and rendezvous.

use crate::device::InstanceId;
use tracing::{Level, Span, span};

/// Span covering one device attach.
///
/// # Example
///
/// ```rust,ignore
/// let _guard = span_attach(id).entered();
/// // region lookup, rendezvous and guest mapping are traced inside
/// ```
#[inline]
pub fn span_attach(instance: InstanceId) -> Span {
    span!(Level::INFO, "attach", instance = %instance)
}

/// Span covering one device detach.
#[inline]
pub fn span_detach(instance: InstanceId) -> Span {
    span!(Level::INFO, "detach", instance = %instance)
}

/// Span covering the wait for a producer's object.
#[inline]
pub fn span_rendezvous(name: &str) -> Span {
    span!(Level::DEBUG, "rendezvous", name = %name)
}
