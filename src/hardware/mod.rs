//! Hardware boundary for the sonar ring
//!
//! The ranging core never talks to a serial link directly. It drives any
//! [`PulseTransport`]: one call triggers one transducer and resolves with the
//! measured distance, or `None` when no echo came back in time.
//!
//! The scheduler guarantees at most two outstanding calls at once, one per
//! channel of the active pair, and none for any other channel.

/// Hardware-free ring used by the binary and the tests
pub mod simulated;

use async_trait::async_trait;
use std::time::Duration;

use crate::core::HardwareId;

pub use simulated::SimulatedTransport;

/// Round-trip microseconds per centimetre of distance (sound at ~343 m/s, out and back)
const ECHO_US_PER_CM: f64 = 29.0 * 2.0;

/// Errors raised by a transport while pulsing a channel
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The link to the microcontroller is gone
    #[error("transport disconnected")]
    Disconnected,
    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The device answered with something that is not a measurement
    #[error("invalid response from {id}: {reason}")]
    InvalidResponse {
        /// Channel that answered
        id: HardwareId,
        /// What was wrong with the answer
        reason: String,
    },
}

/// Asynchronous pulse-and-listen access to one sensor channel at a time
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PulseTransport: Send + Sync {
    /// Pulses the channel at `id` and waits up to `timeout` for the echo.
    ///
    /// Resolves to `Ok(Some(distance_cm))` on an echo, `Ok(None)` when the
    /// transducer heard nothing.
    async fn pulse(&self, id: HardwareId, timeout: Duration) -> Result<Option<f64>, TransportError>;
}

/// Converts a round-trip echo time into centimetres, rounded to the nearest whole centimetre
pub fn distance_cm_from_echo(echo: Duration) -> f64 {
    let micros = echo.as_secs_f64() * 1_000_000.0;
    (micros / ECHO_US_PER_CM).round()
}

/// Round-trip echo time for an obstacle at `distance_cm`
///
/// `None` when no echo could come back: the distance is NaN or too far to
/// express as a duration.
pub fn echo_from_distance_cm(distance_cm: f64) -> Option<Duration> {
    if distance_cm.is_nan() {
        return None;
    }
    Duration::try_from_secs_f64(distance_cm.max(0.0) * ECHO_US_PER_CM / 1_000_000.0).ok()
}
