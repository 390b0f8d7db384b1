// core/ring.rs

// Static topology of the ultrasonic ring: eight channels mounted clockwise at
// 45 degree spacing. Only physically opposite channels (p, p + 4) may pulse at
// the same time; every other combination shares enough of the acoustic field
// to corrupt both echoes.

use nalgebra::{Unit, Vector2};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Number of channels on the ring
pub const RING_SIZE: usize = 8;

/// Number of opposite pairs the ring is walked in
pub const PAIR_COUNT: usize = RING_SIZE / 2;

/// Angular spacing between neighbouring channels, in degrees
const CHANNEL_SPACING_DEG: f64 = 360.0 / RING_SIZE as f64;

/// Hardware identifier of a sensor channel (the trigger/echo pin on the microcontroller)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HardwareId(pub u8);

impl fmt::Display for HardwareId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "pin {}", self.0)
    }
}

/// Ring construction errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RingError {
    /// The ring needs exactly one identifier per position
    #[error("expected {expected} hardware ids, found {found}")]
    WrongChannelCount {
        /// Channels on the ring
        expected: usize,
        /// Ids supplied
        found: usize,
    },
    /// Two positions were given the same hardware identifier
    #[error("hardware id {0} is assigned to more than one ring position")]
    DuplicateId(HardwareId),
}

/// One sensor channel: its fixed ring position, hardware id and mounting bearing
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SensorChannel {
    position: usize,
    hardware_id: HardwareId,
    bearing: Unit<Vector2<f64>>,
}

impl SensorChannel {
    /// Clockwise ring position (0..7)
    pub fn position(&self) -> usize {
        self.position
    }

    /// Hardware identifier used to address the transport
    pub fn hardware_id(&self) -> HardwareId {
        self.hardware_id
    }

    /// Direction the transducer faces in the robot frame (+x forward, +y left)
    pub fn bearing(&self) -> Unit<Vector2<f64>> {
        self.bearing
    }

    /// Bearing in degrees, clockwise from robot forward, in [0, 360)
    pub fn bearing_deg(&self) -> f64 {
        (-self.bearing.y.atan2(self.bearing.x).to_degrees()).rem_euclid(360.0)
    }
}

/// Two opposite ring positions `(p, p + 4)`. Derived from the pair index, never stored on the ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SensorPair {
    index: usize,
}

impl SensorPair {
    /// Pair for the given index, `None` when the index is outside 0..PAIR_COUNT
    pub fn new(index: usize) -> Option<Self> {
        (index < PAIR_COUNT).then_some(SensorPair { index })
    }

    /// Pair index (0..3)
    pub fn index(&self) -> usize {
        self.index
    }

    /// The two ring positions pulsed together
    pub fn positions(&self) -> (usize, usize) {
        (self.index, self.index + PAIR_COUNT)
    }

    /// Whether the given ring position belongs to this pair
    pub fn contains(&self, position: usize) -> bool {
        let (a, b) = self.positions();
        position == a || position == b
    }
}

/// The immutable ring of eight channels
#[derive(Clone, Debug)]
pub struct SensorRing {
    channels: [SensorChannel; RING_SIZE],
}

impl SensorRing {
    /// Builds the ring from hardware ids listed in ring order.
    ///
    /// `heading_offset_deg` is the bearing of position 0, clockwise from robot forward.
    pub fn new(hardware_ids: &[HardwareId], heading_offset_deg: f64) -> Result<Self, RingError> {
        if hardware_ids.len() != RING_SIZE {
            return Err(RingError::WrongChannelCount {
                expected: RING_SIZE,
                found: hardware_ids.len(),
            });
        }

        let mut seen = HashSet::with_capacity(RING_SIZE);
        for id in hardware_ids {
            if !seen.insert(*id) {
                return Err(RingError::DuplicateId(*id));
            }
        }

        let channels = std::array::from_fn(|position| {
            // Clockwise bearings map to negative angles in the robot frame
            let theta = -(heading_offset_deg + position as f64 * CHANNEL_SPACING_DEG).to_radians();
            SensorChannel {
                position,
                hardware_id: hardware_ids[position],
                bearing: Unit::new_normalize(Vector2::new(theta.cos(), theta.sin())),
            }
        });

        Ok(SensorRing { channels })
    }

    /// All channels in ring order
    pub fn channels(&self) -> &[SensorChannel; RING_SIZE] {
        &self.channels
    }

    /// Channel at a ring position, if the position exists
    pub fn channel(&self, position: usize) -> Option<&SensorChannel> {
        self.channels.get(position)
    }

    /// Pair at the given index, wrapping past the last pair
    pub fn pair(&self, index: usize) -> SensorPair {
        SensorPair {
            index: index % PAIR_COUNT,
        }
    }

    /// All pairs in scan order
    pub fn pairs(&self) -> impl Iterator<Item = SensorPair> {
        (0..PAIR_COUNT).map(|index| SensorPair { index })
    }

    /// Both channels of a pair
    pub fn pair_channels(&self, pair: SensorPair) -> (&SensorChannel, &SensorChannel) {
        let (a, b) = pair.positions();
        (&self.channels[a], &self.channels[b])
    }

    /// Ring position facing directly away from `position`
    pub fn opposite(position: usize) -> usize {
        (position + PAIR_COUNT) % RING_SIZE
    }

    /// Whether two positions may pulse simultaneously
    pub fn may_pulse_together(a: usize, b: usize) -> bool {
        a < RING_SIZE && b < RING_SIZE && Self::opposite(a) == b
    }

    /// Geometric check that a pair's transducers face in opposite directions
    pub fn is_opposed(&self, pair: SensorPair) -> bool {
        let (a, b) = self.pair_channels(pair);
        let cos = a.bearing().into_inner().dot(&b.bearing().into_inner());
        (cos + 1.0).abs() < 1e-9
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn default_ids() -> Vec<HardwareId> {
        (22..30).map(HardwareId).collect()
    }

    #[rstest]
    #[case(0, (0, 4))]
    #[case(1, (1, 5))]
    #[case(2, (2, 6))]
    #[case(3, (3, 7))]
    fn test_pair_positions_are_opposite(#[case] index: usize, #[case] expected: (usize, usize)) {
        let ring = SensorRing::new(&default_ids(), 0.0).unwrap();
        let pair = ring.pair(index);
        assert_eq!(pair.positions(), expected);
        assert!(SensorRing::may_pulse_together(expected.0, expected.1));
        assert!(ring.is_opposed(pair));
    }

    #[test]
    fn test_every_channel_in_exactly_one_pair() {
        let ring = SensorRing::new(&default_ids(), 0.0).unwrap();
        for position in 0..RING_SIZE {
            let owners = ring.pairs().filter(|p| p.contains(position)).count();
            assert_eq!(owners, 1, "position {} owned by {} pairs", position, owners);
        }
    }

    #[test]
    fn test_neighbours_may_not_pulse_together() {
        for a in 0..RING_SIZE {
            for b in 0..RING_SIZE {
                let allowed = SensorRing::may_pulse_together(a, b);
                assert_eq!(allowed, (a + 4) % 8 == b, "positions {} and {}", a, b);
            }
        }
    }

    #[test]
    fn test_pair_index_wraps() {
        let ring = SensorRing::new(&default_ids(), 0.0).unwrap();
        assert_eq!(ring.pair(4).index(), 0);
        assert_eq!(ring.pair(7).index(), 3);
        assert!(SensorPair::new(4).is_none());
    }

    #[test]
    fn test_bearings_follow_heading_offset() {
        let ring = SensorRing::new(&default_ids(), 22.5).unwrap();
        let bearings: Vec<f64> = ring.channels().iter().map(|c| c.bearing_deg()).collect();
        for (position, bearing) in bearings.iter().enumerate() {
            let expected = 22.5 + position as f64 * 45.0;
            assert!((bearing - expected).abs() < 1e-9, "{} vs {}", bearing, expected);
        }
    }

    #[test]
    fn test_rejects_wrong_count() {
        let ids: Vec<HardwareId> = (0..7).map(HardwareId).collect();
        assert_eq!(
            SensorRing::new(&ids, 0.0).unwrap_err(),
            RingError::WrongChannelCount { expected: 8, found: 7 }
        );
    }

    #[test]
    fn test_rejects_duplicate_ids() {
        let mut ids = default_ids();
        ids[5] = ids[1];
        assert_eq!(
            SensorRing::new(&ids, 0.0).unwrap_err(),
            RingError::DuplicateId(HardwareId(23))
        );
    }
}
