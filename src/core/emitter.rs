// core/emitter.rs

// Publishes the snapshot buffer on a fixed period, independently of how fast
// the ring is being scanned. A tick publishes only when every slot holds a
// reading; partial snapshots are dropped, not queued, and the next tick gets a
// fresh chance.

use log::{info, trace};
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::buffer::{Snapshot, SnapshotBuffer};
use super::task::BackgroundTask;

/// Default emission period, matching the 500 ms ping cadence of the robot
pub const DEFAULT_EMIT_PERIOD: Duration = Duration::from_millis(500);

/// Callback invoked with every complete snapshot
pub type SnapshotCallback = Arc<dyn Fn(&Snapshot) + Send + Sync>;

/// Handle returned by [`SubscriberRegistry::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Set of snapshot subscribers, safe to modify while a publish is in progress
#[derive(Default)]
pub struct SubscriberRegistry {
    next_id: AtomicU64,
    subscribers: RwLock<Vec<(SubscriptionId, SnapshotCallback)>>,
}

impl SubscriberRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback. It receives only snapshots published after this call.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Snapshot) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push((id, Arc::new(callback)));
        id
    }

    /// Removes a callback. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| *existing != id);
        subscribers.len() != before
    }

    /// Number of registered callbacks
    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Whether no callback is registered
    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }

    /// Delivers `snapshot` to every current subscriber, returning how many were called.
    ///
    /// Callbacks run outside the lock, so they may subscribe or unsubscribe freely.
    pub fn publish(&self, snapshot: &Snapshot) -> usize {
        let current: Vec<SnapshotCallback> = self
            .subscribers
            .read()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        for callback in &current {
            callback(snapshot);
        }
        current.len()
    }
}

#[derive(Debug, Default)]
struct EmitterStats {
    published: AtomicU64,
    suppressed: AtomicU64,
}

// Everything one tick needs; cloned into the background task
#[derive(Clone)]
struct EmitCycle {
    buffer: Arc<SnapshotBuffer>,
    subscribers: Arc<SubscriberRegistry>,
    stale_after: Option<Duration>,
    stats: Arc<EmitterStats>,
}

impl EmitCycle {
    fn tick(&self) -> bool {
        let snapshot = self.buffer.snapshot();
        let covered = match self.stale_after {
            Some(max_age) => snapshot.is_fresh(max_age),
            None => snapshot.is_complete(),
        };

        if !covered {
            self.stats.suppressed.fetch_add(1, Ordering::Relaxed);
            trace!(
                "Snapshot suppressed: {}/{} slots populated",
                snapshot.populated(),
                snapshot.slots().len()
            );
            return false;
        }

        let delivered = self.subscribers.publish(&snapshot);
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        trace!("Snapshot delivered to {} subscriber(s)", delivered);
        true
    }

    async fn run(self, period: Duration, shutdown: CancellationToken) {
        info!("Snapshot emitter started, period {:?}", period);

        // First tick one full period after start
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Snapshot emitter stopped");
                    break;
                }

                _ = interval.tick() => {
                    self.tick();
                }
            }
        }
    }
}

/// Periodic, coverage-gated publisher of the snapshot buffer
pub struct SnapshotEmitter {
    cycle: EmitCycle,
    period: Duration,
    running: Option<BackgroundTask>,
}

impl SnapshotEmitter {
    /// Creates an emitter sampling `buffer` every `period`
    pub fn new(buffer: Arc<SnapshotBuffer>, subscribers: Arc<SubscriberRegistry>, period: Duration) -> Self {
        SnapshotEmitter {
            cycle: EmitCycle {
                buffer,
                subscribers,
                stale_after: None,
                stats: Arc::new(EmitterStats::default()),
            },
            period,
            running: None,
        }
    }

    /// Treats readings older than `max_age` as missing. `None` keeps readings forever.
    pub fn with_stale_after(mut self, max_age: Option<Duration>) -> Self {
        self.cycle.stale_after = max_age;
        self
    }

    /// Time between ticks
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Samples the buffer once and publishes if coverage is complete.
    ///
    /// Returns whether a snapshot was published.
    pub fn tick(&self) -> bool {
        self.cycle.tick()
    }

    /// Starts the periodic timer. Returns `false` if it was already running.
    pub fn start(&mut self, handle: &Handle) -> bool {
        if self.running.is_some() {
            return false;
        }

        let cycle = self.cycle.clone();
        let period = self.period;
        self.running = Some(BackgroundTask::spawn(handle, "snapshot emitter", move |shutdown| {
            cycle.run(period, shutdown)
        }));
        true
    }

    /// Stops the timer. Returns `false` if it was not running.
    pub async fn stop(&mut self) -> bool {
        match self.running.take() {
            Some(mut task) => {
                task.shutdown().await;
                true
            }
            None => false,
        }
    }

    /// Whether the timer is running
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Snapshots published so far
    pub fn published(&self) -> u64 {
        self.cycle.stats.published.load(Ordering::Relaxed)
    }

    /// Ticks that found incomplete coverage
    pub fn suppressed(&self) -> u64 {
        self.cycle.stats.suppressed.load(Ordering::Relaxed)
    }
}
