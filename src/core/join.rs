// core/join.rs

// Fan-out/join for one paired pulse. Both channels of the pair are pulsed as
// independent tasks; each completion records its outcome, writes a successful
// reading straight into the snapshot buffer and then arrives at a two-permit
// latch. The pair resolves when the last permit is taken, whatever the order
// in which the completions land or the thread they land on.

use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::buffer::{ReadingRecord, SnapshotBuffer};
use super::ring::{HardwareId, SensorChannel, SensorPair, SensorRing};
use crate::hardware::PulseTransport;

/// Why a channel produced no reading this round. Never fatal; the slot simply keeps its previous value.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChannelFault {
    /// No echo resolved within the pulse timeout
    #[error("{id} at position {position} timed out after {after:?}")]
    Timeout {
        /// Ring position of the channel
        position: usize,
        /// Hardware id of the channel
        id: HardwareId,
        /// Timeout that elapsed
        after: Duration,
    },
    /// The channel answered with an implausible measurement
    #[error("{id} at position {position} returned a bad reading: {reason}")]
    ReadError {
        /// Ring position of the channel
        position: usize,
        /// Hardware id of the channel
        id: HardwareId,
        /// Why the reading was rejected
        reason: String,
    },
    /// The transport itself failed before any measurement came back
    #[error("{id} at position {position} is unreachable: {reason}")]
    Link {
        /// Ring position of the channel
        position: usize,
        /// Hardware id of the channel
        id: HardwareId,
        /// Transport error message
        reason: String,
    },
}

impl ChannelFault {
    /// Ring position the fault belongs to
    pub fn position(&self) -> usize {
        match self {
            ChannelFault::Timeout { position, .. }
            | ChannelFault::ReadError { position, .. }
            | ChannelFault::Link { position, .. } => *position,
        }
    }
}

/// Outcome of one channel's pulse
pub type ChannelOutcome = Result<ReadingRecord, ChannelFault>;

/// Accepted measurement window. Anything outside it, negative or non-finite is a read error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeasurementRange {
    /// Shortest accepted distance
    pub min_cm: f64,
    /// Longest accepted distance
    pub max_cm: f64,
}

impl MeasurementRange {
    /// Whether `distance_cm` is a plausible measurement
    pub fn accepts(&self, distance_cm: f64) -> bool {
        distance_cm.is_finite() && distance_cm >= self.min_cm.max(0.0) && distance_cm <= self.max_cm
    }
}

impl Default for MeasurementRange {
    fn default() -> Self {
        // HC-SR04 datasheet range
        MeasurementRange {
            min_cm: 2.0,
            max_cm: 400.0,
        }
    }
}

/// Both outcomes of one paired pulse, in pair order `(p, p + 4)`
#[derive(Debug, Clone, PartialEq)]
pub struct PairResult {
    pair: SensorPair,
    outcomes: [ChannelOutcome; 2],
}

impl PairResult {
    /// The pair that was pulsed
    pub fn pair(&self) -> SensorPair {
        self.pair
    }

    /// Per-channel outcomes in pair order
    pub fn outcomes(&self) -> &[ChannelOutcome; 2] {
        &self.outcomes
    }

    /// Successful readings (zero, one or two)
    pub fn readings(&self) -> impl Iterator<Item = &ReadingRecord> {
        self.outcomes.iter().filter_map(|outcome| outcome.as_ref().ok())
    }

    /// Faults (zero, one or two)
    pub fn faults(&self) -> impl Iterator<Item = &ChannelFault> {
        self.outcomes.iter().filter_map(|outcome| outcome.as_ref().err())
    }

    /// Whether both channels failed at the transport, with no measurement either way
    pub fn link_down(&self) -> bool {
        self.outcomes
            .iter()
            .all(|outcome| matches!(outcome, Err(ChannelFault::Link { .. })))
    }
}

/// Countdown latch that fires exactly once, on the arrival that takes the last permit
pub struct CompletionLatch {
    remaining: AtomicUsize,
    signal: Mutex<Option<oneshot::Sender<()>>>,
}

impl CompletionLatch {
    /// Creates a latch expecting `permits` arrivals, plus the receiver it fires
    pub fn new(permits: usize) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let latch = CompletionLatch {
            remaining: AtomicUsize::new(permits),
            signal: Mutex::new(Some(tx)),
        };
        if permits == 0 {
            latch.fire();
        }
        (latch, rx)
    }

    /// Takes one permit. Returns `true` only for the arrival that completed the latch.
    ///
    /// Arrivals past the last permit are ignored.
    pub fn arrive(&self) -> bool {
        let taken = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match taken {
            Ok(1) => {
                self.fire();
                true
            }
            _ => false,
        }
    }

    /// Permits still outstanding
    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    fn fire(&self) {
        if let Some(tx) = self.signal.lock().take() {
            // The waiter may already be gone if the pair future was dropped
            let _ = tx.send(());
        }
    }
}

// Arrives on drop, so a panicking channel task still releases its permit
struct Arrival(Arc<CompletionLatch>);

impl Drop for Arrival {
    fn drop(&mut self) {
        self.0.arrive();
    }
}

/// Issues paired pulses and joins their completions
#[derive(Clone)]
pub struct PairJoin {
    transport: Arc<dyn PulseTransport>,
    ring: Arc<SensorRing>,
    buffer: Arc<SnapshotBuffer>,
    timeout: Duration,
    range: MeasurementRange,
}

impl PairJoin {
    /// Creates a join writing into `buffer`, bounding every pulse by `timeout`
    pub fn new(
        transport: Arc<dyn PulseTransport>,
        ring: Arc<SensorRing>,
        buffer: Arc<SnapshotBuffer>,
        timeout: Duration,
    ) -> Self {
        PairJoin {
            transport,
            ring,
            buffer,
            timeout,
            range: MeasurementRange::default(),
        }
    }

    /// Sets the accepted measurement window
    pub fn with_range(mut self, range: MeasurementRange) -> Self {
        self.range = range;
        self
    }

    /// The ring this join pulses
    pub fn ring(&self) -> &Arc<SensorRing> {
        &self.ring
    }

    /// Bound applied to every pulse
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Pulses both channels of `pair` and resolves once both have completed or timed out.
    ///
    /// Successful readings are already in the buffer when this resolves. Dropping the
    /// returned future does not abort the pulses; they still run to completion or timeout.
    pub async fn issue_pair(&self, pair: SensorPair) -> PairResult {
        let (latch, resolved) = CompletionLatch::new(2);
        let latch = Arc::new(latch);
        let slots: Arc<[Mutex<Option<ChannelOutcome>>; 2]> = Arc::new(Default::default());

        let (first, second) = self.ring.pair_channels(pair);
        let channels = [*first, *second];
        for (side, channel) in channels.into_iter().enumerate() {
            let arrival = Arrival(Arc::clone(&latch));
            let slots = Arc::clone(&slots);
            let transport = Arc::clone(&self.transport);
            let buffer = Arc::clone(&self.buffer);
            let (timeout, range) = (self.timeout, self.range);

            tokio::spawn(async move {
                let _arrival = arrival;
                let outcome = read_channel(transport.as_ref(), channel, timeout, range).await;
                if let Ok(record) = &outcome {
                    buffer.update(*record);
                }
                *slots[side].lock() = Some(outcome);
            });
        }

        // The sender is only dropped unfired if both tasks vanished, which still means resolved
        let _ = resolved.await;

        let outcomes = [
            take_outcome(&slots[0], &channels[0]),
            take_outcome(&slots[1], &channels[1]),
        ];
        PairResult { pair, outcomes }
    }
}

fn take_outcome(slot: &Mutex<Option<ChannelOutcome>>, channel: &SensorChannel) -> ChannelOutcome {
    slot.lock().take().unwrap_or_else(|| {
        Err(ChannelFault::ReadError {
            position: channel.position(),
            id: channel.hardware_id(),
            reason: "channel task ended without an outcome".to_string(),
        })
    })
}

async fn read_channel(
    transport: &dyn PulseTransport,
    channel: SensorChannel,
    timeout: Duration,
    range: MeasurementRange,
) -> ChannelOutcome {
    let id = channel.hardware_id();
    let position = channel.position();

    let fault = match tokio::time::timeout(timeout, transport.pulse(id, timeout)).await {
        Ok(Ok(Some(distance_cm))) if range.accepts(distance_cm) => {
            return Ok(ReadingRecord {
                distance_cm,
                hardware_id: id,
                position,
                captured_at: Instant::now(),
            });
        }
        Ok(Ok(Some(distance_cm))) => ChannelFault::ReadError {
            position,
            id,
            reason: format!(
                "{} cm outside {}..{} cm",
                distance_cm, range.min_cm, range.max_cm
            ),
        },
        Ok(Ok(None)) | Err(_) => ChannelFault::Timeout {
            position,
            id,
            after: timeout,
        },
        Ok(Err(e)) => ChannelFault::Link {
            position,
            id,
            reason: e.to_string(),
        },
    };

    // Link failures are reported once per outage by the sequencer
    match &fault {
        ChannelFault::Timeout { .. } | ChannelFault::Link { .. } => debug!("{}", fault),
        ChannelFault::ReadError { .. } => warn!("{}", fault),
    }
    Err(fault)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{MockPulseTransport, TransportError};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    fn ring() -> Arc<SensorRing> {
        let ids: Vec<HardwareId> = (0..8).map(HardwareId).collect();
        Arc::new(SensorRing::new(&ids, 0.0).unwrap())
    }

    // Transport whose pulses resolve only when the test releases them
    #[derive(Default)]
    struct GatedTransport {
        gates: Mutex<HashMap<HardwareId, oneshot::Receiver<Option<f64>>>>,
    }

    impl GatedTransport {
        fn gate(&self, id: u8) -> oneshot::Sender<Option<f64>> {
            let (tx, rx) = oneshot::channel();
            self.gates.lock().insert(HardwareId(id), rx);
            tx
        }
    }

    #[async_trait]
    impl PulseTransport for GatedTransport {
        async fn pulse(&self, id: HardwareId, _timeout: Duration) -> Result<Option<f64>, TransportError> {
            let gate = self.gates.lock().remove(&id).ok_or(TransportError::Disconnected)?;
            gate.await.map_err(|_| TransportError::Disconnected)
        }
    }

    fn join_with(transport: Arc<dyn PulseTransport>) -> (PairJoin, Arc<SnapshotBuffer>) {
        let buffer = Arc::new(SnapshotBuffer::new());
        let join = PairJoin::new(transport, ring(), Arc::clone(&buffer), Duration::from_millis(100));
        (join, buffer)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[test]
    fn test_latch_fires_once() {
        let (latch, _rx) = CompletionLatch::new(2);
        assert!(!latch.arrive());
        assert!(latch.arrive());
        assert!(!latch.arrive());
        assert_eq!(latch.remaining(), 0);
    }

    #[test]
    fn test_latch_concurrent_arrivals() {
        for _ in 0..500 {
            let (latch, mut rx) = CompletionLatch::new(2);
            let latch = Arc::new(latch);
            let fired = Arc::new(AtomicUsize::new(0));
            let threads: Vec<_> = (0..2)
                .map(|_| {
                    let latch = Arc::clone(&latch);
                    let fired = Arc::clone(&fired);
                    std::thread::spawn(move || {
                        if latch.arrive() {
                            fired.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect();
            for thread in threads {
                thread.join().unwrap();
            }
            assert_eq!(fired.load(Ordering::SeqCst), 1);
            assert!(rx.try_recv().is_ok());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_then_second() {
        let transport = Arc::new(GatedTransport::default());
        let (a, b) = (transport.gate(1), transport.gate(5));
        let (join, buffer) = join_with(transport);
        let pending = tokio::spawn(async move { join.issue_pair(SensorPair::new(1).unwrap()).await });

        settle().await;
        a.send(Some(11.0)).unwrap();
        settle().await;
        assert!(!pending.is_finished());
        assert_eq!(buffer.snapshot().get(1).map(|r| r.distance_cm), Some(11.0));

        b.send(Some(55.0)).unwrap();
        let result = pending.await.unwrap();
        let distances: Vec<f64> = result.readings().map(|r| r.distance_cm).collect();
        assert_eq!(distances, vec![11.0, 55.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_then_first() {
        let transport = Arc::new(GatedTransport::default());
        let (a, b) = (transport.gate(2), transport.gate(6));
        let (join, _buffer) = join_with(transport);
        let pending = tokio::spawn(async move { join.issue_pair(SensorPair::new(2).unwrap()).await });

        settle().await;
        b.send(Some(66.0)).unwrap();
        settle().await;
        assert!(!pending.is_finished());

        a.send(Some(22.0)).unwrap();
        let result = pending.await.unwrap();
        let positions: Vec<usize> = result.readings().map(|r| r.position).collect();
        assert_eq!(positions, vec![2, 6]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_simultaneous_completion() {
        let transport = Arc::new(GatedTransport::default());
        let (a, b) = (transport.gate(0), transport.gate(4));
        let (join, buffer) = join_with(transport);
        let pending = tokio::spawn(async move { join.issue_pair(SensorPair::new(0).unwrap()).await });

        settle().await;
        a.send(Some(10.0)).unwrap();
        b.send(Some(50.0)).unwrap();
        let result = pending.await.unwrap();
        assert_eq!(result.readings().count(), 2);
        assert_eq!(buffer.snapshot().populated(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_channel_times_out() {
        let transport = Arc::new(GatedTransport::default());
        let (a, _silent) = (transport.gate(3), transport.gate(7));
        let (join, buffer) = join_with(transport);
        let pending = tokio::spawn(async move { join.issue_pair(SensorPair::new(3).unwrap()).await });

        settle().await;
        a.send(Some(33.0)).unwrap();
        let started = Instant::now();
        let result = pending.await.unwrap();

        assert!(started.elapsed() <= Duration::from_millis(100));
        assert_eq!(result.readings().count(), 1);
        let faults: Vec<&ChannelFault> = result.faults().collect();
        assert!(matches!(faults[0], ChannelFault::Timeout { position: 7, .. }));
        assert!(buffer.snapshot().get(7).is_none());
    }

    #[tokio::test]
    async fn test_error_does_not_fail_sibling() {
        let mut mock = MockPulseTransport::new();
        mock.expect_pulse()
            .withf(|id, _| *id == HardwareId(1))
            .times(1)
            .returning(|_, _| Err(TransportError::Disconnected));
        mock.expect_pulse()
            .withf(|id, _| *id == HardwareId(5))
            .times(1)
            .returning(|_, _| Ok(Some(40.0)));

        let (join, buffer) = join_with(Arc::new(mock));
        let result = join.issue_pair(SensorPair::new(1).unwrap()).await;

        assert!(matches!(result.outcomes()[0], Err(ChannelFault::Link { position: 1, .. })));
        assert_eq!(result.outcomes()[1].as_ref().map(|r| r.distance_cm), Ok(40.0));
        assert_eq!(buffer.snapshot().get(5).map(|r| r.distance_cm), Some(40.0));
        assert!(!result.link_down());
    }

    #[tokio::test]
    async fn test_both_sides_unreachable_is_link_down() {
        let mut mock = MockPulseTransport::new();
        mock.expect_pulse()
            .times(2)
            .returning(|_, _| Err(TransportError::Disconnected));

        let (join, _buffer) = join_with(Arc::new(mock));
        let result = join.issue_pair(SensorPair::new(2).unwrap()).await;

        assert!(result.link_down());
        let positions: Vec<usize> = result.faults().map(ChannelFault::position).collect();
        assert_eq!(positions, vec![2, 6]);
    }

    #[tokio::test]
    async fn test_out_of_range_is_read_error() {
        let mut mock = MockPulseTransport::new();
        mock.expect_pulse().times(2).returning(|id, _| {
            if id == HardwareId(0) {
                Ok(Some(1200.0))
            } else {
                Ok(Some(f64::NAN))
            }
        });

        let (join, buffer) = join_with(Arc::new(mock));
        let result = join.issue_pair(SensorPair::new(0).unwrap()).await;

        assert_eq!(result.faults().count(), 2);
        assert!(result.faults().all(|f| matches!(f, ChannelFault::ReadError { .. })));
        assert_eq!(buffer.snapshot().populated(), 0);
        assert!(!result.link_down());
    }

    #[test]
    fn test_measurement_range() {
        let range = MeasurementRange::default();
        assert!(range.accepts(2.0));
        assert!(range.accepts(400.0));
        assert!(!range.accepts(1.9));
        assert!(!range.accepts(-5.0));
        assert!(!range.accepts(f64::INFINITY));
    }
}
