//! Process-wide connection statistics

use crate::server::connection::EngineState;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

/// Point-in-time view of one live connection.
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub id: u64,
    pub peer: SocketAddr,
    pub state: EngineState,
    pub requests_served: u64,
    pub opened_at: Instant,
}

/// Monotonic counters and the live-connection map.
///
/// Counters are atomics; the live map sits behind its own lock and is only
/// touched at connection boundaries and state transitions.
#[derive(Debug, Default)]
pub struct ServerCounters {
    next_id: AtomicU64,
    open: AtomicUsize,
    total_connections: AtomicU64,
    total_requests: AtomicU64,
    live: Mutex<HashMap<u64, ConnectionSnapshot>>,
}

impl ServerCounters {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_map(&self) -> std::sync::MutexGuard<'_, HashMap<u64, ConnectionSnapshot>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a new connection and returns its process-unique id.
    pub fn begin_connection(&self, peer: SocketAddr) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.open.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.live_map().insert(
            id,
            ConnectionSnapshot {
                id,
                peer,
                state: EngineState::Accepted,
                requests_served: 0,
                opened_at: Instant::now(),
            },
        );
        id
    }

    pub fn end_connection(&self, id: u64) {
        self.open.fetch_sub(1, Ordering::Relaxed);
        self.live_map().remove(&id);
    }

    pub fn record_request(&self, id: u64) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if let Some(snapshot) = self.live_map().get_mut(&id) {
            snapshot.requests_served += 1;
        }
    }

    pub fn set_state(&self, id: u64, state: EngineState) {
        if let Some(snapshot) = self.live_map().get_mut(&id) {
            snapshot.state = state;
        }
    }

    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::Relaxed)
    }

    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    /// High load kicks in at half the connection cap; it disables keep-alive
    /// and shrinks the send buffer of new sockets.
    pub fn high_load(&self, max_connections: usize) -> bool {
        max_connections > 0 && self.open_connections() >= max_connections / 2
    }

    pub fn live_snapshot(&self) -> Vec<ConnectionSnapshot> {
        self.live_map().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:9999".parse().unwrap()
    }

    #[test]
    fn lifecycle() {
        let counters = ServerCounters::new();
        let a = counters.begin_connection(peer());
        let b = counters.begin_connection(peer());

        assert_ne!(a, b);
        assert_eq!(counters.open_connections(), 2);
        assert_eq!(counters.total_connections(), 2);
        assert_eq!(counters.live_snapshot().len(), 2);

        counters.record_request(a);
        counters.record_request(a);
        counters.set_state(a, EngineState::Reading);
        assert_eq!(counters.total_requests(), 2);
        let snapshot = counters
            .live_snapshot()
            .into_iter()
            .find(|s| s.id == a)
            .unwrap();
        assert_eq!(snapshot.requests_served, 2);
        assert_eq!(snapshot.state, EngineState::Reading);

        counters.end_connection(a);
        assert_eq!(counters.open_connections(), 1);
        // totals are monotonic
        assert_eq!(counters.total_connections(), 2);
    }

    #[test]
    fn high_load_threshold() {
        let counters = ServerCounters::new();
        assert!(!counters.high_load(4));
        counters.begin_connection(peer());
        assert!(!counters.high_load(4));
        counters.begin_connection(peer());
        assert!(counters.high_load(4));
        assert!(!counters.high_load(0));
    }
}
