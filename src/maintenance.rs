//! Periodic liveness probing under a global concurrency cap.

mod table;

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::common::PeerAddress;
use crate::config::Config;
use crate::Result;

pub use table::{MaintenanceTable, MAINTENANCE_INTERVALS};

/// Liveness bookkeeping of one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatistic {
    pub peer: PeerAddress,
    /// Last time the peer answered, or when it was first added.
    pub last_seen: Instant,
    /// Last time a check completed, or when the peer was first added.
    pub last_checked: Instant,
    /// Consecutive successful checks, resets on failure.
    pub successful_checks: usize,
    /// Consecutive failed checks, resets on success.
    pub failed_checks: usize,
}

impl PeerStatistic {
    pub fn new(peer: PeerAddress) -> Self {
        let now = Instant::now();

        Self {
            peer,
            last_seen: now,
            last_checked: now,
            successful_checks: 0,
            failed_checks: 0,
        }
    }
}

/// A source of peers due for a liveness check, usually the routing table.
pub trait Maintainable: Debug + Send + Sync {
    /// The next peer due for a check, skipping `excluded`.
    fn next_for_maintenance(&self, excluded: &[PeerAddress]) -> Option<PeerStatistic>;

    /// Called once the probe issued for `peer` completed.
    fn probe_completed(&self, _peer: &PeerAddress, _alive: bool) {}
}

/// Issues a single liveness probe.
pub trait Pinger: Debug + Send + Sync {
    fn probe(&self, peer: PeerAddress) -> BoxFuture<'static, Result<()>>;
}

#[derive(Debug)]
struct Probe {
    peer: PeerAddress,
    owner: u64,
}

#[derive(Debug, Default)]
struct ProbeState {
    next_probe: u64,
    running: HashMap<u64, Probe>,
    /// Shutdowns waiting for their task's probes to drain.
    drain_waiters: Vec<(u64, flume::Sender<()>)>,
}

impl ProbeState {
    fn running_for(&self, owner: u64) -> usize {
        self.running.values().filter(|probe| probe.owner == owner).count()
    }
}

/// In-flight probes of every [MaintenanceTask] sharing it, and the cap on
/// their number.
///
/// Cloning shares the table.
#[derive(Debug, Clone)]
pub struct ProbeTable {
    max_inflight: usize,
    state: Arc<Mutex<ProbeState>>,
}

impl ProbeTable {
    pub fn new(max_inflight: usize) -> Self {
        Self {
            max_inflight,
            state: Default::default(),
        }
    }

    pub fn max_inflight(&self) -> usize {
        self.max_inflight
    }

    /// Number of probes currently in flight.
    pub fn inflight(&self) -> usize {
        self.state.lock().running.len()
    }

    /// Peers currently being probed.
    pub fn probed_peers(&self) -> Vec<PeerAddress> {
        self.state
            .lock()
            .running
            .values()
            .map(|probe| probe.peer)
            .collect()
    }

    fn complete(&self, probe_id: u64) {
        let mut state = self.state.lock();

        let Some(probe) = state.running.remove(&probe_id) else {
            return;
        };

        if state.running_for(probe.owner) == 0 {
            state.drain_waiters.retain(|(owner, waiter)| {
                if *owner == probe.owner {
                    let _ = waiter.send(());
                    false
                } else {
                    true
                }
            });
        }
    }
}

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(0);

/// Periodically picks stale peers from its [Maintainable] sources and probes
/// them through a [Pinger].
#[derive(Debug)]
pub struct MaintenanceTask {
    id: u64,
    /// Only changed under the [ProbeTable] lock.
    shutdown: Arc<AtomicBool>,
    interval: Duration,
    pinger: Arc<dyn Pinger>,
    table: ProbeTable,
    maintainables: Arc<RwLock<Vec<Arc<dyn Maintainable>>>>,
    timer: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl MaintenanceTask {
    /// Uses [Config::maintenance_interval] and a private [ProbeTable] capped
    /// at [Config::max_inflight_probes].
    pub fn new(pinger: Arc<dyn Pinger>, config: &Config) -> Self {
        Self::with_table(
            pinger,
            config.maintenance_interval,
            ProbeTable::new(config.max_inflight_probes),
        )
    }

    /// Shares `table`, and with it the cap, with other tasks.
    pub fn with_table(pinger: Arc<dyn Pinger>, interval: Duration, table: ProbeTable) -> Self {
        Self {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            shutdown: Default::default(),
            interval,
            pinger,
            table,
            maintainables: Default::default(),
            timer: Mutex::new(None),
        }
    }

    // === Getters ===

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn table(&self) -> &ProbeTable {
        &self.table
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    // === Public Methods ===

    pub fn add_maintainable(&self, maintainable: Arc<dyn Maintainable>) {
        self.maintainables.write().push(maintainable);
    }

    /// Starts ticking every [MaintenanceTask::interval], the first tick after
    /// one interval. Calling it again is a no-op.
    ///
    /// Must be called within a tokio runtime.
    pub fn start(&self) {
        let mut timer = self.timer.lock();
        if timer.is_some() || self.is_shutdown() {
            return;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(
            self.runner(),
            self.interval,
            cancel.clone(),
        ));

        *timer = Some((cancel, handle));
    }

    /// Runs a single maintenance round.
    pub fn tick(&self) {
        self.runner().tick();
    }

    /// Stops the timer, waiting for a running tick, then stops issuing probes
    /// and waits until every probe issued so far completed.
    pub async fn shutdown(&self) {
        let timer = self.timer.lock().take();
        if let Some((cancel, handle)) = timer {
            cancel.cancel();
            let _ = handle.await;
        }

        let drained = {
            let mut state = self.table.state.lock();
            self.shutdown.store(true, Ordering::Release);

            if state.running_for(self.id) == 0 {
                None
            } else {
                let (sender, receiver) = flume::bounded(1);
                state.drain_waiters.push((self.id, sender));
                Some(receiver)
            }
        };

        if let Some(drained) = drained {
            debug!(task = self.id, "Waiting for in-flight probes");
            let _ = drained.recv_async().await;
        }

        debug!(task = self.id, "Maintenance task shut down");
    }

    // === Private Methods ===

    fn runner(&self) -> Runner {
        Runner {
            id: self.id,
            shutdown: self.shutdown.clone(),
            pinger: self.pinger.clone(),
            table: self.table.clone(),
            maintainables: self.maintainables.clone(),
        }
    }
}

/// What a tick needs, detached from the task so the timer can own it.
#[derive(Debug, Clone)]
struct Runner {
    id: u64,
    shutdown: Arc<AtomicBool>,
    pinger: Arc<dyn Pinger>,
    table: ProbeTable,
    maintainables: Arc<RwLock<Vec<Arc<dyn Maintainable>>>>,
}

impl Runner {
    fn tick(&self) {
        let maintainables = self.maintainables.read().clone();
        let mut state = self.table.state.lock();

        if self.shutdown.load(Ordering::Acquire) {
            return;
        }

        'sources: for maintainable in maintainables {
            loop {
                if state.running.len() >= self.table.max_inflight {
                    break 'sources;
                }

                let excluded: Vec<PeerAddress> =
                    state.running.values().map(|probe| probe.peer).collect();

                let Some(statistic) = maintainable.next_for_maintenance(&excluded) else {
                    continue 'sources;
                };
                let peer = statistic.peer;

                let probe_id = state.next_probe;
                state.next_probe += 1;
                state.running.insert(
                    probe_id,
                    Probe {
                        peer,
                        owner: self.id,
                    },
                );

                debug!(task = self.id, ?peer, "Maintenance probe");

                let probe = self.pinger.probe(peer);
                let table = self.table.clone();
                let maintainable = maintainable.clone();

                tokio::spawn(async move {
                    let result = probe.await;
                    if let Err(error) = &result {
                        trace!(context = "maintenance_probe", ?peer, ?error, "Probe failed");
                    }

                    maintainable.probe_completed(&peer, result.is_ok());
                    table.complete(probe_id);
                });
            }
        }
    }
}

async fn run(runner: Runner, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => runner.tick(),
        }
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;

    use crate::common::Id;
    use crate::Error;

    use super::*;

    /// Probes that resolve only when released, tracking the peak concurrency.
    #[derive(Debug, Default)]
    struct GatedPinger {
        release: Mutex<Vec<flume::Sender<bool>>>,
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        issued: AtomicUsize,
    }

    impl GatedPinger {
        fn release_all(&self, alive: bool) {
            for sender in self.release.lock().drain(..) {
                let _ = sender.send(alive);
            }
        }
    }

    impl Pinger for GatedPinger {
        fn probe(&self, _peer: PeerAddress) -> BoxFuture<'static, Result<()>> {
            let (sender, receiver) = flume::bounded(1);
            self.release.lock().push(sender);
            self.issued.fetch_add(1, Ordering::SeqCst);

            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let current = self.current.clone();
            Box::pin(async move {
                let alive = receiver.recv_async().await.unwrap_or(false);
                current.fetch_sub(1, Ordering::SeqCst);
                if alive {
                    Ok(())
                } else {
                    Err(Error::Timeout)
                }
            })
        }
    }

    /// Always has another peer due.
    #[derive(Debug, Default)]
    struct Endless {
        completed: AtomicUsize,
        alive: AtomicUsize,
    }

    impl Maintainable for Endless {
        fn next_for_maintenance(&self, excluded: &[PeerAddress]) -> Option<PeerStatistic> {
            let peer = PeerAddress::new(Id::random(), SocketAddr::from(([127, 0, 0, 1], 1)));
            assert!(!excluded.contains(&peer));
            Some(PeerStatistic::new(peer))
        }

        fn probe_completed(&self, _peer: &PeerAddress, alive: bool) {
            self.completed.fetch_add(1, Ordering::SeqCst);
            if alive {
                self.alive.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[derive(Debug)]
    struct Empty;

    impl Maintainable for Empty {
        fn next_for_maintenance(&self, _excluded: &[PeerAddress]) -> Option<PeerStatistic> {
            None
        }
    }

    fn config() -> Config {
        Config {
            maintenance_interval: Duration::from_millis(100),
            max_inflight_probes: 3,
            ..Default::default()
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_cap() {
        let pinger = Arc::new(GatedPinger::default());
        let task = MaintenanceTask::new(pinger.clone(), &config());
        task.add_maintainable(Arc::new(Empty));
        task.add_maintainable(Arc::new(Endless::default()));
        task.start();

        for round in 0..10 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            settle().await;
            assert!(task.table().inflight() <= 3);

            if round % 3 == 0 {
                pinger.release_all(true);
                settle().await;
            }
        }

        assert_eq!(pinger.peak.load(Ordering::SeqCst), 3);
        assert!(pinger.issued.load(Ordering::SeqCst) > 3);

        pinger.release_all(true);
        task.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shared_table_caps_all_tasks() {
        let table = ProbeTable::new(2);
        let pinger = Arc::new(GatedPinger::default());

        let a = MaintenanceTask::with_table(pinger.clone(), Duration::from_millis(100), table.clone());
        let b = MaintenanceTask::with_table(pinger.clone(), Duration::from_millis(100), table.clone());
        a.add_maintainable(Arc::new(Endless::default()));
        b.add_maintainable(Arc::new(Endless::default()));

        a.tick();
        b.tick();

        assert_eq!(table.inflight(), 2);
        assert_eq!(pinger.issued.load(Ordering::SeqCst), 2);

        pinger.release_all(true);
        a.shutdown().await;
        b.shutdown().await;
        assert_eq!(table.inflight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_inflight_probes() {
        let pinger = Arc::new(GatedPinger::default());
        let source = Arc::new(Endless::default());
        let task = Arc::new(MaintenanceTask::new(pinger.clone(), &config()));
        task.add_maintainable(source.clone());

        task.tick();
        assert_eq!(task.table().inflight(), 3);

        let shutdown = tokio::spawn({
            let task = task.clone();
            async move { task.shutdown().await }
        });

        settle().await;
        assert!(task.is_shutdown());
        assert!(!shutdown.is_finished());

        // no new probes once shut down
        task.tick();
        assert_eq!(pinger.issued.load(Ordering::SeqCst), 3);

        pinger.release_all(false);
        shutdown.await.unwrap();

        assert_eq!(task.table().inflight(), 0);
        assert_eq!(source.completed.load(Ordering::SeqCst), 3);
        assert_eq!(source.alive.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_without_probes_is_immediate() {
        let task = MaintenanceTask::new(Arc::new(GatedPinger::default()), &config());
        task.add_maintainable(Arc::new(Empty));
        task.start();

        tokio::time::sleep(Duration::from_millis(350)).await;
        task.shutdown().await;

        assert!(task.is_shutdown());
        assert_eq!(task.table().inflight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shared_table_forgets_shut_down_tasks() {
        let table = ProbeTable::new(4);
        let pinger = Arc::new(GatedPinger::default());

        for _ in 0..20 {
            let task = MaintenanceTask::with_table(pinger.clone(), Duration::from_millis(100), table.clone());
            task.add_maintainable(Arc::new(Endless::default()));
            task.tick();

            let shutdown = tokio::spawn(async move {
                task.shutdown().await;
                task
            });
            settle().await;
            pinger.release_all(true);

            assert!(shutdown.await.unwrap().is_shutdown());
        }

        let state = table.state.lock();
        assert!(state.running.is_empty());
        assert!(state.drain_waiters.is_empty());
        assert_eq!(state.next_probe, 80);
    }
}
