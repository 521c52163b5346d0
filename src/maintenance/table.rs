use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::common::{Id, PeerAddress};

use super::{Maintainable, PeerStatistic};

/// Check intervals indexed by consecutive successful checks, the last one
/// repeats. A peer that keeps answering is checked less and less often.
pub const MAINTENANCE_INTERVALS: [Duration; 6] = [
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(20),
    Duration::from_secs(40),
    Duration::from_secs(80),
    Duration::from_secs(160),
];

/// Consecutive failed checks after which a peer is dropped.
pub const DEFAULT_MAX_FAILURES: usize = 3;

/// A [Maintainable] set of peers with back-off check intervals.
#[derive(Debug)]
pub struct MaintenanceTable {
    peers: RwLock<HashMap<Id, PeerStatistic>>,
    max_failures: usize,
}

impl MaintenanceTable {
    pub fn new() -> Self {
        Self::with_max_failures(DEFAULT_MAX_FAILURES)
    }

    pub fn with_max_failures(max_failures: usize) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            max_failures: max_failures.max(1),
        }
    }

    // === Getters ===

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    pub fn get(&self, id: &Id) -> Option<PeerStatistic> {
        self.peers.read().get(id).cloned()
    }

    // === Public Methods ===

    /// Starts tracking `peer`. Returns false if it was already tracked; its
    /// socket is updated in that case.
    pub fn add(&self, peer: PeerAddress) -> bool {
        let mut peers = self.peers.write();

        match peers.get_mut(&peer.id) {
            Some(statistic) => {
                statistic.peer = peer;
                false
            }
            None => {
                peers.insert(peer.id, PeerStatistic::new(peer));
                true
            }
        }
    }

    pub fn remove(&self, id: &Id) -> Option<PeerStatistic> {
        self.peers.write().remove(id)
    }

    pub fn record_success(&self, peer: &PeerAddress) {
        if let Some(statistic) = self.peers.write().get_mut(&peer.id) {
            let now = Instant::now();
            statistic.last_seen = now;
            statistic.last_checked = now;
            statistic.successful_checks += 1;
            statistic.failed_checks = 0;
        }
    }

    /// Drops the peer after too many consecutive failures.
    pub fn record_failure(&self, peer: &PeerAddress) {
        let mut peers = self.peers.write();

        let Some(statistic) = peers.get_mut(&peer.id) else {
            return;
        };
        statistic.last_checked = Instant::now();
        statistic.successful_checks = 0;
        statistic.failed_checks += 1;

        if statistic.failed_checks >= self.max_failures {
            debug!(?peer, failures = statistic.failed_checks, "Dropping unresponsive peer");
            peers.remove(&peer.id);
        }
    }

    fn interval(statistic: &PeerStatistic) -> Duration {
        let index = statistic
            .successful_checks
            .min(MAINTENANCE_INTERVALS.len() - 1);
        MAINTENANCE_INTERVALS[index]
    }
}

impl Default for MaintenanceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Maintainable for MaintenanceTable {
    /// The most overdue peer, if any is due.
    fn next_for_maintenance(&self, excluded: &[PeerAddress]) -> Option<PeerStatistic> {
        let now = Instant::now();

        self.peers
            .read()
            .values()
            .filter(|statistic| !excluded.iter().any(|peer| peer.id == statistic.peer.id))
            .filter(|statistic| now.saturating_duration_since(statistic.last_checked) >= Self::interval(statistic))
            .min_by_key(|statistic| statistic.last_checked)
            .cloned()
    }

    fn probe_completed(&self, peer: &PeerAddress, alive: bool) {
        if alive {
            self.record_success(peer);
        } else {
            self.record_failure(peer);
        }
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddr;

    use super::*;

    fn peer(port: u16) -> PeerAddress {
        PeerAddress::new(Id::random(), SocketAddr::from(([127, 0, 0, 1], port)))
    }

    #[tokio::test(start_paused = true)]
    async fn back_off_after_success() {
        let table = MaintenanceTable::new();
        let a = peer(1);
        table.add(a);

        assert!(table.next_for_maintenance(&[]).is_none());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(table.next_for_maintenance(&[]).unwrap().peer, a);
        assert!(table.next_for_maintenance(&[a]).is_none());

        table.probe_completed(&a, true);
        assert_eq!(table.get(&a.id).unwrap().successful_checks, 1);

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(table.next_for_maintenance(&[]).is_none());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(table.next_for_maintenance(&[]).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn most_overdue_first() {
        let table = MaintenanceTable::new();
        let old = peer(1);
        table.add(old);

        tokio::time::advance(Duration::from_secs(2)).await;
        let young = peer(2);
        table.add(young);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(table.next_for_maintenance(&[]).unwrap().peer, old);
        assert_eq!(table.next_for_maintenance(&[old]).unwrap().peer, young);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_reset_and_drop() {
        let table = MaintenanceTable::with_max_failures(2);
        let a = peer(1);
        table.add(a);

        table.record_success(&a);
        table.record_success(&a);
        table.record_failure(&a);

        let statistic = table.get(&a.id).unwrap();
        assert_eq!(statistic.successful_checks, 0);
        assert_eq!(statistic.failed_checks, 1);

        table.record_failure(&a);
        assert!(table.get(&a.id).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn add_updates_socket() {
        let table = MaintenanceTable::new();
        let mut a = peer(1);

        assert!(table.add(a));
        a.socket = SocketAddr::from(([127, 0, 0, 1], 2));
        assert!(!table.add(a));

        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&a.id).unwrap().peer.socket.port(), 2);
    }
}
