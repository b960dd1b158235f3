//! sensor_bus.rs — Local sensor bus between the session loop and the sensors
//!
//! The session only talks to `SensorBus`. `SimulatedBus` owns both
//! simulators, a pending-measurement slot filled by `trigger` and a transient
//! read-failure probability.

use grading_types::{RawDepthFrame, RawSpectralFrame, SensorAddresses};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::depth_sim::DepthSimulator;
use crate::error::{require_unit, BusError, ConfigError};
use crate::scenarios::ScenarioDraw;
use crate::spectral_sim::SpectralSimulator;

pub trait SensorBus: Send {
    fn addresses(&self) -> SensorAddresses;

    /// Probe both sensors once.
    fn self_test(&mut self) -> Result<(), BusError>;

    /// Start one measurement of the product described by `scene`.
    fn trigger(&mut self, scene: &ScenarioDraw) -> Result<(), BusError>;

    fn read_depth(&mut self) -> Result<RawDepthFrame, BusError>;

    /// `Ok(None)` when no spectral sensor is fitted.
    fn read_spectral(&mut self) -> Result<Option<RawSpectralFrame>, BusError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub depth_address: u8,
    pub spectral_address: u8,
    pub spectral_enabled: bool,
    /// Chance that any single read times out
    pub read_failure_probability: f64,
    pub read_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            depth_address: 0x29,
            spectral_address: 0x39,
            spectral_enabled: true,
            read_failure_probability: 0.0,
            read_timeout_ms: 50,
        }
    }
}

impl BusConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_unit("read_failure_probability", self.read_failure_probability)?;
        if self.depth_address == self.spectral_address {
            return Err(ConfigError::threshold("bus addresses", "depth and spectral sensors share an address"));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Pending {
    depth: Option<RawDepthFrame>,
    spectral: Option<RawSpectralFrame>,
}

pub struct SimulatedBus {
    cfg: BusConfig,
    depth: DepthSimulator,
    spectral: SpectralSimulator,
    pending: Pending,
    rng: StdRng,
}

impl SimulatedBus {
    pub fn new(
        cfg: BusConfig,
        depth: DepthSimulator,
        spectral: SpectralSimulator,
        seed: Option<u64>,
    ) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            cfg,
            depth,
            spectral,
            pending: Pending::default(),
            rng,
        })
    }

    fn flaky(&mut self, address: u8) -> Result<(), BusError> {
        if self.rng.gen_bool(self.cfg.read_failure_probability) {
            debug!("bus read at 0x{address:02x} timed out");
            Err(BusError::Timeout { address, timeout_ms: self.cfg.read_timeout_ms })
        } else {
            Ok(())
        }
    }
}

impl SensorBus for SimulatedBus {
    fn addresses(&self) -> SensorAddresses {
        SensorAddresses { depth: self.cfg.depth_address, spectral: self.cfg.spectral_address }
    }

    fn self_test(&mut self) -> Result<(), BusError> {
        let probe = self.depth.generate(Default::default(), &[]);
        let in_range = probe
            .distance_mm
            .iter()
            .all(|d| (0.0..=probe.height_sensor_mm).contains(d));
        if !in_range || probe.distance_mm.len() != probe.zone_count() {
            return Err(BusError::SelfTest(format!("depth sensor 0x{:02x} returned an invalid frame", self.cfg.depth_address)));
        }
        if self.cfg.spectral_enabled {
            let probe = self.spectral.generate(Default::default());
            if !probe.channels.all_non_negative() {
                return Err(BusError::SelfTest(format!(
                    "spectral sensor 0x{:02x} returned negative counts",
                    self.cfg.spectral_address
                )));
            }
        }
        Ok(())
    }

    fn trigger(&mut self, scene: &ScenarioDraw) -> Result<(), BusError> {
        self.pending.depth = Some(self.depth.generate(scene.variant, &scene.defects));
        self.pending.spectral = if self.cfg.spectral_enabled {
            Some(self.spectral.generate(scene.spectral))
        } else {
            None
        };
        Ok(())
    }

    fn read_depth(&mut self) -> Result<RawDepthFrame, BusError> {
        let address = self.cfg.depth_address;
        let frame = self.pending.depth.take().ok_or(BusError::NothingPending(address))?;
        self.flaky(address)?;
        Ok(frame)
    }

    fn read_spectral(&mut self) -> Result<Option<RawSpectralFrame>, BusError> {
        if !self.cfg.spectral_enabled {
            return Ok(None);
        }
        let address = self.cfg.spectral_address;
        let frame = self.pending.spectral.take().ok_or(BusError::NothingPending(address))?;
        self.flaky(address)?;
        Ok(Some(frame))
    }
}
