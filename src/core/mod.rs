// core/mod.rs

// Declares and exposes the ranging core: ring topology, the pair sequencer and
// its completion join, the snapshot buffer, the periodic emitter and the
// session that ties them together.

/// Latest reading per ring position
pub mod buffer;
/// Periodic, coverage-gated snapshot publication
pub mod emitter;
/// Fan-out and join of one paired pulse
pub mod join;
/// Ring topology and opposite pairs
pub mod ring;
/// Pair-by-pair scan loop
pub mod sequencer;
/// Ranging lifecycle
pub mod session;
mod task;

pub use buffer::{ReadingRecord, Snapshot, SnapshotBuffer};
pub use emitter::{DEFAULT_EMIT_PERIOD, SnapshotCallback, SnapshotEmitter, SubscriberRegistry, SubscriptionId};
pub use join::{ChannelFault, ChannelOutcome, CompletionLatch, MeasurementRange, PairJoin, PairResult};
pub use ring::{HardwareId, PAIR_COUNT, RING_SIZE, RingError, SensorChannel, SensorPair, SensorRing};
pub use sequencer::{PairSequencer, ScanCursor, ScanLoop, SequencerStats, SequencerStatsSnapshot};
pub use session::{RangingSession, SessionError, SessionSettings, SessionStats};
