#![allow(dead_code)]

use std::io::Read;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use sluice_engine::StreamSession;
use sluice_engine::testing::{FixedClock, MemoryTransport};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("sluice_engine=debug")
        .with_test_writer()
        .try_init();
}

/// Deterministic payload, distinct per `tag`.
pub fn body(tag: u8, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| tag.wrapping_mul(31).wrapping_add(i as u8))
        .collect()
}

pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

pub fn fixtures() -> (Arc<MemoryTransport>, Arc<FixedClock>) {
    (
        Arc::new(MemoryTransport::new()),
        Arc::new(FixedClock::new(epoch())),
    )
}

pub fn drain(session: &mut StreamSession) -> Vec<u8> {
    let mut out = Vec::new();
    session.read_to_end(&mut out).unwrap();
    out
}
