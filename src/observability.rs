//! Metric recording helpers.
//!
//! All metrics go through the `metrics` facade; embedders install whatever
//! recorder they run (or none, in which case every call is a no-op). Names
//! are prefixed `ionpool_` and registered by [`describe_metrics`].

use metrics::{counter, describe_counter, describe_gauge, gauge, Unit};

/// Register metric descriptions with the installed recorder. Optional;
/// recording works without it.
pub fn describe_metrics() {
    describe_counter!(
        "ionpool_buffers_allocated_total",
        Unit::Count,
        "Buffers allocated over the process lifetime"
    );
    describe_counter!(
        "ionpool_buffers_freed_total",
        Unit::Count,
        "Buffers torn down over the process lifetime"
    );
    describe_gauge!(
        "ionpool_bytes_live",
        Unit::Bytes,
        "Bytes currently held by live buffers"
    );
    describe_gauge!(
        "ionpool_deferred_pending",
        Unit::Count,
        "Allocations parked on deferred-free queues"
    );
    describe_gauge!(
        "ionpool_windows_available",
        Unit::Count,
        "Sync windows currently free in the pool"
    );
}

pub(crate) fn record_buffer_allocated(len: usize) {
    counter!("ionpool_buffers_allocated_total").increment(1);
    gauge!("ionpool_bytes_live").increment(len as f64);
}

pub(crate) fn record_buffer_freed(len: usize) {
    counter!("ionpool_buffers_freed_total").increment(1);
    gauge!("ionpool_bytes_live").decrement(len as f64);
}

pub(crate) fn record_deferred_pending(pending: usize) {
    gauge!("ionpool_deferred_pending").set(pending as f64);
}

pub(crate) fn record_windows_available(available: usize) {
    gauge!("ionpool_windows_available").set(available as f64);
}
