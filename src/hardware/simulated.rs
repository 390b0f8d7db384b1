//! Hardware-free sonar ring
//!
//! Answers pulses from a fixed table of distances after a random latency, the
//! way a real HC-SR04 answers after its echo time plus serial overhead. Echoes
//! can be dropped with a configured probability to exercise the timeout path.

use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::Mutex;
use rand::prelude::*;
use rand::rngs::SmallRng;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use super::{PulseTransport, TransportError, distance_cm_from_echo, echo_from_distance_cm};
use crate::SimulationConfig;
use crate::core::{HardwareId, SensorRing};

/// Pulse transport backed by a distance table instead of a serial link
pub struct SimulatedTransport {
    distances: HashMap<HardwareId, f64>,
    latency_ms: (u64, u64),
    drop_rate: f64,
    rng: Mutex<SmallRng>,
    in_flight: Mutex<HashSet<HardwareId>>,
    peak_in_flight: Mutex<usize>,
}

impl SimulatedTransport {
    /// Creates a transport answering from `distances`, keyed by hardware id
    ///
    /// A seed of 0 draws from OS entropy; anything else gives a reproducible run.
    pub fn new(distances: HashMap<HardwareId, f64>, seed: u64) -> Self {
        let rng = if seed == 0 {
            SmallRng::from_entropy()
        } else {
            SmallRng::seed_from_u64(seed)
        };

        SimulatedTransport {
            distances,
            latency_ms: (1, 1),
            drop_rate: 0.0,
            rng: Mutex::new(rng),
            in_flight: Mutex::new(HashSet::new()),
            peak_in_flight: Mutex::new(0),
        }
    }

    /// Builds a transport for `ring` from the simulation section of the config
    pub fn from_config(ring: &SensorRing, config: &SimulationConfig) -> Self {
        let distances = ring
            .channels()
            .iter()
            .zip(config.distances_cm.iter())
            .map(|(channel, cm)| (channel.hardware_id(), *cm))
            .collect();

        SimulatedTransport::new(distances, config.seed)
            .with_latency_ms(config.min_latency_ms, config.max_latency_ms)
            .with_drop_rate(config.drop_rate)
    }

    /// Sets the inclusive latency window in milliseconds
    pub fn with_latency_ms(mut self, min: u64, max: u64) -> Self {
        self.latency_ms = (min.min(max), max.max(min));
        self
    }

    /// Sets the probability (0.0-1.0) that an echo is never heard
    pub fn with_drop_rate(mut self, rate: f64) -> Self {
        self.drop_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Replaces the distance reported for one channel
    pub fn set_distance(&mut self, id: HardwareId, distance_cm: f64) {
        self.distances.insert(id, distance_cm);
    }

    /// Highest number of pulses that were ever outstanding at once
    pub fn peak_in_flight(&self) -> usize {
        *self.peak_in_flight.lock()
    }

    fn begin(&self, id: HardwareId) -> Result<InFlight<'_>, TransportError> {
        let mut in_flight = self.in_flight.lock();
        if !in_flight.insert(id) {
            return Err(TransportError::InvalidResponse {
                id,
                reason: "channel pulsed while its previous pulse is outstanding".to_string(),
            });
        }
        if in_flight.len() > 2 {
            warn!("{} pulses outstanding on the simulated ring", in_flight.len());
        }
        let mut peak = self.peak_in_flight.lock();
        *peak = (*peak).max(in_flight.len());
        Ok(InFlight { transport: self, id })
    }
}

// Clears the in-flight mark even when the caller drops the pulse future early
struct InFlight<'a> {
    transport: &'a SimulatedTransport,
    id: HardwareId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.transport.in_flight.lock().remove(&self.id);
    }
}

#[async_trait]
impl PulseTransport for SimulatedTransport {
    async fn pulse(&self, id: HardwareId, timeout: Duration) -> Result<Option<f64>, TransportError> {
        let distance = *self
            .distances
            .get(&id)
            .ok_or_else(|| TransportError::InvalidResponse {
                id,
                reason: "no such channel".to_string(),
            })?;

        let (latency, dropped) = {
            let mut rng = self.rng.lock();
            let latency = rng.gen_range(self.latency_ms.0..=self.latency_ms.1);
            (Duration::from_millis(latency), rng.gen_bool(self.drop_rate))
        };

        let _guard = self.begin(id)?;
        // Echoes that cannot arrive within the timeout are never heard
        let heard = echo_from_distance_cm(distance)
            .filter(|echo| latency.checked_add(*echo).is_some_and(|arrival| arrival <= timeout));
        tokio::time::sleep(heard.map_or(timeout, |echo| latency + echo)).await;

        match heard {
            Some(echo) if !dropped => Ok(Some(distance_cm_from_echo(echo))),
            _ => {
                debug!("simulated {} heard no echo", id);
                Ok(None)
            }
        }
    }
}
