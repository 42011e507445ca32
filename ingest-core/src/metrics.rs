#![allow(missing_docs)] // lazy_static items dont play nicely with docstrings

//! # metrics
//!
//! counters and gauges for the ingest loop, exposed by external-api
use std::time::Instant;

use lazy_static::lazy_static;
use prometheus::{
    IntCounter, IntCounterVec, IntGauge, register_int_counter, register_int_counter_vec,
    register_int_gauge,
};

lazy_static! {
    /// When the process started
    pub static ref START_TIME: Instant = Instant::now();

    /// messages delivered by the broker, by subscription subject
    pub static ref MESSAGES_RECEIVED: IntCounterVec = register_int_counter_vec!(
        "nats_messages_received",
        "count of messages delivered by the broker",
        &["subject"]
    )
    .unwrap();

    /// payload bytes delivered by the broker
    pub static ref BYTES_RECEIVED: IntCounter =
        register_int_counter!("nats_bytes_received", "payload bytes delivered by the broker").unwrap();

    /// events appended to the pipeline
    pub static ref EVENTS_EMITTED: IntCounter =
        register_int_counter!("events_emitted", "count of events handed to the pipeline").unwrap();

    /// payloads the codec rejected
    pub static ref DECODE_FAILURES: IntCounterVec = register_int_counter_vec!(
        "decode_failures",
        "count of payloads that failed to decode",
        &["subject"]
    )
    .unwrap();

    /// every connection attempt, initial or reconnect
    pub static ref CONNECT_ATTEMPTS: IntCounter =
        register_int_counter!("nats_connect_attempts", "count of connection attempts").unwrap();

    /// connections re-established after a drop
    pub static ref RECONNECTS: IntCounter =
        register_int_counter!("nats_reconnects", "count of successful reconnects").unwrap();

    /// asynchronous warnings and errors reported by the transport
    pub static ref TRANSPORT_WARNINGS: IntCounter = register_int_counter!(
        "nats_transport_warnings",
        "count of asynchronous broker warnings and errors"
    )
    .unwrap();

    /// 1 while connected, 0 otherwise
    pub static ref CONNECTION_STATE: IntGauge = register_int_gauge!(
        "nats_connection_state",
        "current connection state (1=connected, 0=not connected)"
    )
    .unwrap();

    /// number of live subscriptions
    pub static ref ACTIVE_SUBSCRIPTIONS: IntGauge =
        register_int_gauge!("nats_active_subscriptions", "count of live subscriptions").unwrap();

    /// process uptime
    pub static ref UPTIME: IntGauge = register_int_gauge!("uptime", "process uptime (seconds)").unwrap();
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use prometheus::gather;

    use super::{DECODE_FAILURES, EVENTS_EMITTED, MESSAGES_RECEIVED};

    #[test]
    fn counters_are_registered_and_exposed() {
        MESSAGES_RECEIVED.with_label_values(&["orders"]).inc();
        DECODE_FAILURES.with_label_values(&["orders"]).inc();
        EVENTS_EMITTED.inc();

        let families = gather();
        let names = families
            .iter()
            .map(|family| family.get_name().to_string())
            .collect::<HashSet<_>>();

        for name in ["nats_messages_received", "decode_failures", "events_emitted"] {
            assert!(names.contains(name), "registered metric families: {names:?}");
        }
    }
}
