// core/session.rs

// Composition root for ranging. A session owns the ring, the transport and
// the subscriber list for its whole life; the buffer, cursor, sequencer and
// emitter exist only between start() and stop(), so every start is a full
// reset.

use log::info;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

use super::buffer::{Snapshot, SnapshotBuffer};
use super::emitter::{DEFAULT_EMIT_PERIOD, SnapshotEmitter, SubscriberRegistry, SubscriptionId};
use super::join::{MeasurementRange, PairJoin};
use super::ring::SensorRing;
use super::sequencer::{PairSequencer, SequencerStatsSnapshot};
use crate::hardware::PulseTransport;

/// Session state misuse, surfaced to the caller and never retried
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// `start()` called while ranging is already running
    #[error("ranging session is already running")]
    AlreadyRunning,
    /// Operation needs a running session
    #[error("ranging session has not been started")]
    NotStarted,
    /// `start()` called outside a tokio runtime
    #[error("ranging session must be started from within a tokio runtime")]
    NoRuntime,
}

/// Timing and validation parameters for a session
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionSettings {
    /// Bound on a single channel's pulse
    pub pulse_timeout: Duration,
    /// Emitter period
    pub emit_period: Duration,
    /// Readings older than this stop counting towards coverage. `None` never expires.
    pub stale_after: Option<Duration>,
    /// Plausible measurement window
    pub range: MeasurementRange,
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings {
            pulse_timeout: Duration::from_millis(100),
            emit_period: DEFAULT_EMIT_PERIOD,
            stale_after: None,
            range: MeasurementRange::default(),
        }
    }
}

/// Counters of a running session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    /// Scan loop counters
    pub sequencer: SequencerStatsSnapshot,
    /// Snapshots delivered to subscribers
    pub published: u64,
    /// Emitter ticks dropped for incomplete coverage
    pub suppressed: u64,
}

// State that only exists while ranging runs
struct ActiveRanging {
    buffer: Arc<SnapshotBuffer>,
    sequencer: PairSequencer,
    emitter: SnapshotEmitter,
}

/// Owns the ranging lifecycle: start, stop, subscribe
pub struct RangingSession {
    ring: Arc<SensorRing>,
    transport: Arc<dyn PulseTransport>,
    settings: SessionSettings,
    subscribers: Arc<SubscriberRegistry>,
    active: Option<ActiveRanging>,
}

impl RangingSession {
    /// Creates a stopped session over `ring` and `transport`
    pub fn new(ring: SensorRing, transport: Arc<dyn PulseTransport>, settings: SessionSettings) -> Self {
        RangingSession {
            ring: Arc::new(ring),
            transport,
            settings,
            subscribers: Arc::new(SubscriberRegistry::new()),
            active: None,
        }
    }

    /// Builds a fresh buffer and cursor, then starts the sequencer and the emitter.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self) -> Result<(), SessionError> {
        if self.active.is_some() {
            return Err(SessionError::AlreadyRunning);
        }
        let handle = Handle::try_current().map_err(|_| SessionError::NoRuntime)?;

        let buffer = Arc::new(SnapshotBuffer::new());
        let join = PairJoin::new(
            Arc::clone(&self.transport),
            Arc::clone(&self.ring),
            Arc::clone(&buffer),
            self.settings.pulse_timeout,
        )
        .with_range(self.settings.range);

        let mut sequencer = PairSequencer::new(join);
        let mut emitter = SnapshotEmitter::new(
            Arc::clone(&buffer),
            Arc::clone(&self.subscribers),
            self.settings.emit_period,
        )
        .with_stale_after(self.settings.stale_after);

        sequencer.start(&handle);
        emitter.start(&handle);
        self.active = Some(ActiveRanging {
            buffer,
            sequencer,
            emitter,
        });

        info!(
            "Ranging session started: timeout {:?}, emit period {:?}",
            self.settings.pulse_timeout, self.settings.emit_period
        );
        Ok(())
    }

    /// Stops the sequencer after its in-flight pair resolves, stops the emitter and
    /// releases the buffer. Stopping a stopped session is a no-op.
    pub async fn stop(&mut self) -> Result<(), SessionError> {
        let Some(mut active) = self.active.take() else {
            return Ok(());
        };

        active.sequencer.stop().await;
        active.emitter.stop().await;
        info!(
            "Ranging session stopped after {} pairs, {} snapshots published",
            active.sequencer.stats().pairs_completed,
            active.emitter.published()
        );
        Ok(())
    }

    /// Stop followed by a fresh start
    pub async fn reset(&mut self) -> Result<(), SessionError> {
        self.stop().await?;
        self.start()
    }

    /// Whether ranging is active
    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }

    /// The ring this session scans
    pub fn ring(&self) -> &SensorRing {
        &self.ring
    }

    /// Timing and validation parameters
    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Registers a snapshot callback; survives stop/start
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Snapshot) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(callback)
    }

    /// Removes a snapshot callback. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    /// Current buffer contents, complete or not
    pub fn snapshot(&self) -> Result<Snapshot, SessionError> {
        self.active
            .as_ref()
            .map(|active| active.buffer.snapshot())
            .ok_or(SessionError::NotStarted)
    }

    /// Counters for the current run
    pub fn stats(&self) -> Result<SessionStats, SessionError> {
        self.active
            .as_ref()
            .map(|active| SessionStats {
                sequencer: active.sequencer.stats(),
                published: active.emitter.published(),
                suppressed: active.emitter.suppressed(),
            })
            .ok_or(SessionError::NotStarted)
    }
}
