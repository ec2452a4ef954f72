use std::time::Duration;

use typed_builder::TypedBuilder;

/// Pool-wide tuning (§6 "Configuration surface"): the per-group cap, the idle TTL, and the
/// reap-timer period. Builder-style, in the teacher's `#[derive(TypedBuilder)]`/
/// `#[builder(default = ...)]` convention (cf. the teacher's own `ConnectionPoolOptions`).
#[derive(Clone, Debug, TypedBuilder)]
pub struct ConnectionPoolOptions {
    /// Maximum number of streams (handed-out + in-flight-connecting) per group.
    #[builder(default = 10)]
    pub per_group_cap: u32,

    /// How long a stream may sit in a group's idle set before the reaper discards it.
    #[builder(default = Duration::from_secs(300))]
    pub idle_ttl: Duration,

    /// Period of the reap timer, armed only while at least one group has idle entries.
    #[builder(default = Duration::from_secs(10))]
    pub reap_interval: Duration,
}

impl Default for ConnectionPoolOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}
