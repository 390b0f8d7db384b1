// core/buffer.rs

// Last-writer-wins store of the most recent reading per ring position. The
// sequencer writes single slots as reads complete; the emitter copies all
// eight slots under the same lock, so no consumer ever sees a torn snapshot.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use super::ring::{HardwareId, RING_SIZE};

/// One successful measurement. Created once per completed pulse, never mutated.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReadingRecord {
    /// Measured distance in centimetres (non-negative)
    pub distance_cm: f64,
    /// Channel that produced the reading
    pub hardware_id: HardwareId,
    /// Ring position of that channel
    pub position: usize,
    /// When the echo resolved
    pub captured_at: Instant,
}

impl ReadingRecord {
    /// Time elapsed between capture and `now`
    pub fn age_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.captured_at)
    }
}

/// Point-in-time copy of all eight slots
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    slots: [Option<ReadingRecord>; RING_SIZE],
    taken_at: Instant,
}

impl Snapshot {
    /// Slot contents in ring order
    pub fn slots(&self) -> &[Option<ReadingRecord>; RING_SIZE] {
        &self.slots
    }

    /// Reading at a ring position, if populated
    pub fn get(&self, position: usize) -> Option<&ReadingRecord> {
        self.slots.get(position).and_then(Option::as_ref)
    }

    /// When the copy was taken
    pub fn taken_at(&self) -> Instant {
        self.taken_at
    }

    /// Number of populated slots
    pub fn populated(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Whether every channel holds a reading
    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    /// Whether every channel holds a reading no older than `max_age`
    pub fn is_fresh(&self, max_age: Duration) -> bool {
        self.slots.iter().all(|slot| {
            slot.as_ref()
                .is_some_and(|record| record.age_at(self.taken_at) <= max_age)
        })
    }

    /// All eight distances in ring order, or `None` while coverage is incomplete
    pub fn distances(&self) -> Option<[f64; RING_SIZE]> {
        let mut distances = [0.0; RING_SIZE];
        for (out, slot) in distances.iter_mut().zip(self.slots.iter()) {
            *out = slot.as_ref()?.distance_cm;
        }
        Some(distances)
    }

    /// Closest populated reading
    pub fn nearest(&self) -> Option<&ReadingRecord> {
        self.slots
            .iter()
            .flatten()
            .min_by(|a, b| a.distance_cm.total_cmp(&b.distance_cm))
    }
}

/// Shared slot store, written by the sequencer and read by the emitter
#[derive(Debug, Default)]
pub struct SnapshotBuffer {
    slots: Mutex<[Option<ReadingRecord>; RING_SIZE]>,
}

impl SnapshotBuffer {
    /// Creates an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the slot for the record's own ring position
    pub fn update(&self, record: ReadingRecord) {
        if let Some(slot) = self.slots.lock().get_mut(record.position) {
            *slot = Some(record);
        }
    }

    /// Atomic copy of all eight slots
    pub fn snapshot(&self) -> Snapshot {
        let slots = *self.slots.lock();
        Snapshot {
            slots,
            taken_at: Instant::now(),
        }
    }

    /// Empties every slot
    pub fn clear(&self) {
        *self.slots.lock() = [None; RING_SIZE];
    }
}
