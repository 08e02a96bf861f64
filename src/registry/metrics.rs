use lazy_static::lazy_static;
use prometheus::{register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec};

lazy_static! {
    pub static ref LOOKUPS: IntCounter = register_int_counter!(
        "connpool_lookups_total",
        "Total successful connection checkouts across all pools"
    )
    .expect("register connpool_lookups_total counter");
    pub static ref LOOKUP_FAILURES: IntCounterVec = register_int_counter_vec!(
        "connpool_lookup_failures_total",
        "Connection checkout failures by reason",
        &["reason"]
    )
    .expect("register connpool_lookup_failures_total counter_vec");
    pub static ref WAITS: IntCounter = register_int_counter!(
        "connpool_waits_total",
        "Total suspensions while waiting for idle pool capacity"
    )
    .expect("register connpool_waits_total counter");
    pub static ref INSERTS: IntCounter = register_int_counter!(
        "connpool_inserts_total",
        "Total connections inserted into the registry"
    )
    .expect("register connpool_inserts_total counter");
    pub static ref REMOVALS: IntCounter = register_int_counter!(
        "connpool_removals_total",
        "Total connections removed from the registry"
    )
    .expect("register connpool_removals_total counter");
}

#[derive(Debug, Clone, Copy)]
pub struct RegistryMetrics;

impl RegistryMetrics {
    #[inline]
    pub fn record_lookup() {
        LOOKUPS.inc();
    }

    #[inline]
    pub fn record_lookup_failure(reason: &str) {
        LOOKUP_FAILURES.with_label_values(&[reason]).inc();
    }

    #[inline]
    pub fn record_wait() {
        WAITS.inc();
    }

    #[inline]
    pub fn record_insert() {
        INSERTS.inc();
    }

    #[inline]
    pub fn record_removal() {
        REMOVALS.inc();
    }
}
