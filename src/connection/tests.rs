use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::sync::oneshot;

use crate::metrics::Metrics;

use super::manager::{jittered, next_backoff, PacketIds};
use super::*;

#[test]
fn test_packet_ids_sequential() {
    let mut ids = PacketIds::new();
    let pending = HashMap::new();

    assert_eq!(ids.allocate(&pending), 1);
    assert_eq!(ids.allocate(&pending), 2);
    assert_eq!(ids.allocate(&pending), 3);
}

#[test]
fn test_packet_ids_skip_pending() {
    let mut ids = PacketIds::new();
    let mut pending = HashMap::new();
    let (tx, _rx) = oneshot::channel();
    pending.insert(2u16, tx);

    assert_eq!(ids.allocate(&pending), 1);
    assert_eq!(ids.allocate(&pending), 3);
}

#[test]
fn test_packet_ids_never_zero() {
    let mut ids = PacketIds::new();
    let pending = HashMap::new();

    // Walk through the whole identifier space and past the wrap point
    let mut last = 0u16;
    for _ in 0..70_000 {
        last = ids.allocate(&pending);
        assert_ne!(last, 0);
    }
    assert!(last > 0);
}

#[test]
fn test_backoff_doubles_to_cap() {
    let max = Duration::from_secs(60);
    let mut interval = Duration::from_secs(1);

    let mut schedule = Vec::new();
    for _ in 0..8 {
        schedule.push(interval.as_secs());
        interval = next_backoff(interval, max);
    }

    assert_eq!(schedule, vec![1, 2, 4, 8, 16, 32, 60, 60]);
}

#[test]
fn test_jitter_stays_within_bounds() {
    let base = Duration::from_secs(10);
    for _ in 0..100 {
        let d = jittered(base);
        assert!(d >= Duration::from_secs(8), "jitter below bound: {:?}", d);
        assert!(d <= Duration::from_secs(12), "jitter above bound: {:?}", d);
    }
}

#[test]
fn test_state_gauge_encoding() {
    assert_eq!(ConnectionState::Disconnected.as_gauge(), 0);
    assert_eq!(ConnectionState::Connecting.as_gauge(), 1);
    assert_eq!(ConnectionState::Connected.as_gauge(), 2);
    assert_eq!(ConnectionState::Reconnecting.as_gauge(), 3);
}

#[test]
fn test_state_handle_tracks_metric() {
    let metrics = Arc::new(Metrics::new());
    let handle = StateHandle::new(metrics.clone());

    assert_eq!(handle.get(), ConnectionState::Disconnected);
    assert_eq!(metrics.connection_state.get(), 0);

    handle.set(ConnectionState::Connected);
    assert_eq!(handle.get(), ConnectionState::Connected);
    assert_eq!(metrics.connection_state.get(), 2);

    let clone = handle.clone();
    clone.set(ConnectionState::Reconnecting);
    assert_eq!(handle.get(), ConnectionState::Reconnecting);
}
