// core/sequencer.rs

// Walks the ring pair by pair: pulse (p, p + 4), wait for both completions,
// advance the cursor, repeat. There is no inter-step delay; throughput is set
// by how quickly the sensors answer. The one exception is a pair whose two
// channels both fail at the transport: the loop then waits one pulse timeout
// before the next pair. Pair N + 1 is never issued before pair N has resolved,
// and stopping always lets the in-flight pair finish first.

use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use super::join::{ChannelFault, PairJoin, PairResult};
use super::ring::PAIR_COUNT;
use super::task::BackgroundTask;

/// Index of the next pair to pulse. Starts at 0 and wraps 3 -> 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanCursor {
    pair_index: usize,
}

impl ScanCursor {
    /// Cursor at pair 0
    pub fn new() -> Self {
        Self::default()
    }

    /// Pair the next step pulses
    pub fn pair_index(&self) -> usize {
        self.pair_index
    }

    /// Moves to the next pair, wrapping after the last
    pub fn advance(&mut self) {
        self.pair_index = (self.pair_index + 1) % PAIR_COUNT;
    }
}

/// Live counters for one sequencer run
#[derive(Debug, Default)]
pub struct SequencerStats {
    pairs_completed: AtomicU64,
    readings: AtomicU64,
    timeouts: AtomicU64,
    read_errors: AtomicU64,
    cursor: AtomicUsize,
}

/// Point-in-time copy of [`SequencerStats`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SequencerStatsSnapshot {
    /// Pairs that have fully resolved
    pub pairs_completed: u64,
    /// Successful channel reads
    pub readings: u64,
    /// Channels that timed out or heard no echo
    pub timeouts: u64,
    /// Channels that failed or returned implausible values
    pub read_errors: u64,
    /// Pair index the next step will pulse
    pub cursor: usize,
}

impl SequencerStats {
    fn record(&self, result: &PairResult, cursor: ScanCursor) {
        self.readings
            .fetch_add(result.readings().count() as u64, Ordering::Relaxed);
        for fault in result.faults() {
            match fault {
                ChannelFault::Timeout { .. } => self.timeouts.fetch_add(1, Ordering::Relaxed),
                ChannelFault::ReadError { .. } | ChannelFault::Link { .. } => {
                    self.read_errors.fetch_add(1, Ordering::Relaxed)
                }
            };
        }
        self.cursor.store(cursor.pair_index(), Ordering::Release);
        self.pairs_completed.fetch_add(1, Ordering::AcqRel);
    }

    /// Reads all counters
    pub fn snapshot(&self) -> SequencerStatsSnapshot {
        SequencerStatsSnapshot {
            pairs_completed: self.pairs_completed.load(Ordering::Acquire),
            readings: self.readings.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            cursor: self.cursor.load(Ordering::Acquire),
        }
    }
}

/// The scan cycle itself: cursor, join and counters
pub struct ScanLoop {
    join: PairJoin,
    cursor: ScanCursor,
    stats: Arc<SequencerStats>,
}

impl ScanLoop {
    /// New loop positioned at pair 0
    pub fn new(join: PairJoin, stats: Arc<SequencerStats>) -> Self {
        ScanLoop {
            join,
            cursor: ScanCursor::new(),
            stats,
        }
    }

    /// Current cursor position
    pub fn cursor(&self) -> ScanCursor {
        self.cursor
    }

    /// Pulses the pair under the cursor, waits for it to resolve, then advances
    pub async fn step(&mut self) -> PairResult {
        let pair = self.join.ring().pair(self.cursor.pair_index());
        let result = self.join.issue_pair(pair).await;

        self.cursor.advance();
        self.stats.record(&result, self.cursor);
        debug!(
            "pair {} resolved: {} reading(s), {} fault(s)",
            pair.index(),
            result.readings().count(),
            result.faults().count()
        );
        result
    }

    /// Steps until `shutdown` is cancelled. Cancellation is only observed between pairs.
    ///
    /// While the transport is unreachable on both channels of a pair, waits one pulse
    /// timeout before the next step.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Pair sequencer started at pair {}", self.cursor.pair_index());
        let backoff = self.join.timeout();
        let mut link_down = false;

        while !shutdown.is_cancelled() {
            let result = self.step().await;

            if !result.link_down() {
                if link_down {
                    info!("Transport reachable again at pair {}", result.pair().index());
                    link_down = false;
                }
                continue;
            }

            if !link_down {
                warn!(
                    "Transport unreachable on pair {}, retrying every {:?}",
                    result.pair().index(),
                    backoff
                );
                link_down = true;
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
        }
        info!(
            "Pair sequencer stopped after {} pairs",
            self.stats.snapshot().pairs_completed
        );
    }
}

/// Start/stop handle around a [`ScanLoop`] running as a background task
pub struct PairSequencer {
    join: PairJoin,
    stats: Arc<SequencerStats>,
    running: Option<BackgroundTask>,
}

impl PairSequencer {
    /// Creates a stopped sequencer driving `join`
    pub fn new(join: PairJoin) -> Self {
        PairSequencer {
            join,
            stats: Arc::new(SequencerStats::default()),
            running: None,
        }
    }

    /// Starts the cycle at pair 0. Returns `false` if it was already running.
    pub fn start(&mut self, handle: &Handle) -> bool {
        if self.running.is_some() {
            return false;
        }

        self.stats = Arc::new(SequencerStats::default());
        let scan = ScanLoop::new(self.join.clone(), Arc::clone(&self.stats));
        self.running = Some(BackgroundTask::spawn(handle, "pair sequencer", |shutdown| {
            scan.run(shutdown)
        }));
        true
    }

    /// Stops after the in-flight pair resolves. Returns `false` if it was not running.
    pub async fn stop(&mut self) -> bool {
        match self.running.take() {
            Some(mut task) => {
                task.shutdown().await;
                true
            }
            None => false,
        }
    }

    /// Whether the background loop is running
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Counters for the current (or last) run
    pub fn stats(&self) -> SequencerStatsSnapshot {
        self.stats.snapshot()
    }
}
