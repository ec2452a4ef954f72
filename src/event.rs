//! Pool lifecycle logging (§6.1 "Ambient stack"): structured `tracing` events, mirroring the
//! granularity (not the exact event payloads) of the teacher's `event::cmap` module. There is no
//! public event-subscriber API — `tracing`'s own subscriber model is the integration point, the
//! same way the original has none of its own either.

pub(crate) fn group_created(group: &str) {
    tracing::debug!(group, "connection pool group created");
}

pub(crate) fn group_discarded(group: &str) {
    tracing::debug!(group, "connection pool group discarded (active, idle, and pending all empty)");
}

pub(crate) fn connection_created(group: &str, handle_id: u64) {
    tracing::debug!(group, handle_id, "connection created");
}

pub(crate) fn connection_checked_out(group: &str, handle_id: u64, reused: bool) {
    tracing::trace!(group, handle_id, reused, "connection checked out");
}

pub(crate) fn connection_checked_in(group: &str) {
    tracing::trace!(group, "connection checked in");
}

pub(crate) fn connection_closed(group: &str, reason: &str) {
    tracing::debug!(group, reason, "connection closed");
}
