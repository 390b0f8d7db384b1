//! Eos Sonar - cross-talk-safe ranging for an ultrasonic sensor ring
//!
//! Eight ultrasonic sensors share the robot's acoustic field. This library
//! pulses them in opposite pairs so no two neighbours ever listen at once,
//! joins the two asynchronous completions of each pair, keeps the latest
//! reading per channel and publishes a snapshot on a fixed cadence whenever
//! every channel is covered.

#![warn(missing_docs)]
#![warn(unused_extern_crates)]

/// Ranging core: ring topology, pair scheduling, snapshot buffer and emitter
pub mod core;
/// Text commands for session control
pub mod gateway;
/// Hardware boundary and the simulated ring
pub mod hardware;

// Re-export commonly used items for easier access
pub use crate::core::{
    HardwareId, RangingSession, ReadingRecord, SensorRing, SessionError, SessionSettings, Snapshot,
};
pub use gateway::Command;
pub use hardware::{PulseTransport, SimulatedTransport, TransportError};

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::core::{MeasurementRange, RING_SIZE, RingError};

/// Main configuration structure for Eos Sonar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SonarConfig {
    /// Ring topology
    pub ring: RingConfig,
    /// Pulse and emission timing
    pub timing: TimingConfig,
    /// Accepted measurement window
    pub range: RangeConfig,
    /// Hardware-free transport parameters
    pub simulation: SimulationConfig,
}

/// Sensor ring layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    /// Hardware ids in clockwise ring order, one per position
    pub hardware_ids: Vec<HardwareId>,
    /// Bearing of ring position 0, clockwise from robot forward
    pub heading_offset_deg: f64,
}

/// Timing parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Per-channel pulse timeout
    pub pulse_timeout_ms: u64,
    /// Snapshot emission period
    pub emit_period_ms: u64,
    /// Readings older than this no longer count towards coverage (absent = never expire)
    pub stale_after_ms: Option<u64>,
}

/// Plausible measurement window in centimetres
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RangeConfig {
    /// Shortest accepted distance
    pub min_cm: f64,
    /// Longest accepted distance
    pub max_cm: f64,
}

/// Simulated ring parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Distance reported by each ring position
    pub distances_cm: Vec<f64>,
    /// Shortest response latency
    pub min_latency_ms: u64,
    /// Longest response latency
    pub max_latency_ms: u64,
    /// Probability (0.0-1.0) that an echo is lost
    pub drop_rate: f64,
    /// RNG seed, 0 for a non-deterministic run
    pub seed: u64,
}

impl Default for RingConfig {
    fn default() -> Self {
        RingConfig {
            hardware_ids: (22..30).map(HardwareId).collect(),
            heading_offset_deg: 0.0,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            pulse_timeout_ms: 100,
            emit_period_ms: 500,
            stale_after_ms: None,
        }
    }
}

impl Default for RangeConfig {
    fn default() -> Self {
        let range = MeasurementRange::default();
        RangeConfig {
            min_cm: range.min_cm,
            max_cm: range.max_cm,
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            distances_cm: vec![10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0],
            min_latency_ms: 5,
            max_latency_ms: 30,
            drop_rate: 0.0,
            seed: 0,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    /// Config file is not valid YAML for this schema
    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    /// Ring layout is invalid
    #[error("invalid ring: {0}")]
    Ring(#[from] RingError),
    /// A value is out of its allowed range
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Dotted path of the offending key
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },
}

impl SonarConfig {
    /// Loads and validates a YAML config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let file = std::fs::File::open(path.as_ref())?;
        let config: SonarConfig = serde_yaml::from_reader(file)?;
        config.validate()?;
        log::info!("Loaded config from {}", path.as_ref().display());
        Ok(config)
    }

    /// Parses and validates YAML text
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let config: SonarConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every section for values the ranging core cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.sensor_ring()?;

        if self.timing.pulse_timeout_ms == 0 {
            return Err(invalid("timing.pulse_timeout_ms", "must be greater than zero"));
        }
        if self.timing.emit_period_ms == 0 {
            return Err(invalid("timing.emit_period_ms", "must be greater than zero"));
        }
        if self.timing.stale_after_ms == Some(0) {
            return Err(invalid("timing.stale_after_ms", "must be greater than zero when set"));
        }
        if !(self.range.min_cm >= 0.0 && self.range.min_cm < self.range.max_cm) {
            return Err(invalid(
                "range",
                format!("need 0 <= min_cm < max_cm, got {}..{}", self.range.min_cm, self.range.max_cm),
            ));
        }

        let sim = &self.simulation;
        if sim.distances_cm.len() != RING_SIZE {
            return Err(invalid(
                "simulation.distances_cm",
                format!("expected {} values, found {}", RING_SIZE, sim.distances_cm.len()),
            ));
        }
        if let Some(bad) = sim.distances_cm.iter().find(|d| !d.is_finite() || **d < 0.0) {
            return Err(invalid(
                "simulation.distances_cm",
                format!("{} is not a finite, non-negative distance", bad),
            ));
        }
        if sim.min_latency_ms > sim.max_latency_ms {
            return Err(invalid("simulation", "min_latency_ms exceeds max_latency_ms"));
        }
        if !(0.0..=1.0).contains(&sim.drop_rate) {
            return Err(invalid("simulation.drop_rate", "must be within 0.0..=1.0"));
        }

        Ok(())
    }

    /// Builds the sensor ring described by the config
    pub fn sensor_ring(&self) -> Result<SensorRing, RingError> {
        SensorRing::new(&self.ring.hardware_ids, self.ring.heading_offset_deg)
    }

    /// Session parameters described by the config
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            pulse_timeout: Duration::from_millis(self.timing.pulse_timeout_ms),
            emit_period: Duration::from_millis(self.timing.emit_period_ms),
            stale_after: self.timing.stale_after_ms.map(Duration::from_millis),
            range: MeasurementRange {
                min_cm: self.range.min_cm,
                max_cm: self.range.max_cm,
            },
        }
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}
