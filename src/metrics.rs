//! Process-wide mesh counters.
//!
//! Every recoverable drop in the core (full tables, full transmit queue, bad
//! padding, missing routes) increments a counter here so capacity pressure is
//! observable without scraping logs.
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

static PACKETS_RECEIVED: AtomicU64 = AtomicU64::new(0);
static PACKETS_TRANSMITTED: AtomicU64 = AtomicU64::new(0);
static PACKETS_FORWARDED: AtomicU64 = AtomicU64::new(0);
static TX_QUEUE_DROPS: AtomicU64 = AtomicU64::new(0);
static TX_SEND_FAILURES: AtomicU64 = AtomicU64::new(0);
static NODE_TABLE_FULL: AtomicU64 = AtomicU64::new(0);
static ROUTE_TABLE_FULL: AtomicU64 = AtomicU64::new(0);
static CRYPTO_FAILURES: AtomicU64 = AtomicU64::new(0);
static MALFORMED_FRAMES: AtomicU64 = AtomicU64::new(0);
static NO_ROUTE_DROPS: AtomicU64 = AtomicU64::new(0);
static DISCOVERIES_STARTED: AtomicU64 = AtomicU64::new(0);
static DISCOVERIES_COMPLETED: AtomicU64 = AtomicU64::new(0);
static DUPLICATE_RREQS: AtomicU64 = AtomicU64::new(0);
static PONGS_RECEIVED: AtomicU64 = AtomicU64::new(0);
static RTT_SUM_MS: AtomicU64 = AtomicU64::new(0);

pub fn inc_packets_received() {
    PACKETS_RECEIVED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_packets_transmitted() {
    PACKETS_TRANSMITTED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_packets_forwarded() {
    PACKETS_FORWARDED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_tx_queue_drops() {
    TX_QUEUE_DROPS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_tx_send_failures() {
    TX_SEND_FAILURES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_node_table_full() {
    NODE_TABLE_FULL.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_route_table_full() {
    ROUTE_TABLE_FULL.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_crypto_failures() {
    CRYPTO_FAILURES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_malformed_frames() {
    MALFORMED_FRAMES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_no_route_drops() {
    NO_ROUTE_DROPS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_discoveries_started() {
    DISCOVERIES_STARTED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_discoveries_completed() {
    DISCOVERIES_COMPLETED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_duplicate_rreqs() {
    DUPLICATE_RREQS.fetch_add(1, Ordering::Relaxed);
}
pub fn observe_rtt(rtt_ms: u32) {
    PONGS_RECEIVED.fetch_add(1, Ordering::Relaxed);
    RTT_SUM_MS.fetch_add(rtt_ms as u64, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct Snapshot {
    pub packets_received: u64,
    pub packets_transmitted: u64,
    pub packets_forwarded: u64,
    pub tx_queue_drops: u64,
    pub tx_send_failures: u64,
    pub node_table_full: u64,
    pub route_table_full: u64,
    pub crypto_failures: u64,
    pub malformed_frames: u64,
    pub no_route_drops: u64,
    pub discoveries_started: u64,
    pub discoveries_completed: u64,
    pub duplicate_rreqs: u64,
    pub pongs_received: u64,
    pub rtt_avg_ms: Option<u64>,
}

pub fn snapshot() -> Snapshot {
    let pongs = PONGS_RECEIVED.load(Ordering::Relaxed);
    let rtt_sum = RTT_SUM_MS.load(Ordering::Relaxed);
    Snapshot {
        packets_received: PACKETS_RECEIVED.load(Ordering::Relaxed),
        packets_transmitted: PACKETS_TRANSMITTED.load(Ordering::Relaxed),
        packets_forwarded: PACKETS_FORWARDED.load(Ordering::Relaxed),
        tx_queue_drops: TX_QUEUE_DROPS.load(Ordering::Relaxed),
        tx_send_failures: TX_SEND_FAILURES.load(Ordering::Relaxed),
        node_table_full: NODE_TABLE_FULL.load(Ordering::Relaxed),
        route_table_full: ROUTE_TABLE_FULL.load(Ordering::Relaxed),
        crypto_failures: CRYPTO_FAILURES.load(Ordering::Relaxed),
        malformed_frames: MALFORMED_FRAMES.load(Ordering::Relaxed),
        no_route_drops: NO_ROUTE_DROPS.load(Ordering::Relaxed),
        discoveries_started: DISCOVERIES_STARTED.load(Ordering::Relaxed),
        discoveries_completed: DISCOVERIES_COMPLETED.load(Ordering::Relaxed),
        duplicate_rreqs: DUPLICATE_RREQS.load(Ordering::Relaxed),
        pongs_received: pongs,
        rtt_avg_ms: if pongs > 0 { Some(rtt_sum / pongs) } else { None },
    }
}
