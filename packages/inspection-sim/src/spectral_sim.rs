//! spectral_sim.rs — Multi-channel spectral sensor simulation
//!
//! Starts from a reference reflectance spectrum, scales it to the configured
//! clear-channel level, then solves each quality index map for the channel
//! ratio that produces the requested target index. Multiplicative read noise
//! is applied last.

use grading_types::{RawSpectralFrame, SpectralChannels};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::depth_sim::gaussian;
use crate::error::{require_positive, ConfigError};
use crate::spectral_analysis::IndexMap;

/// Target quality indices for one frame, each in `0..=1`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpectralTargets {
    pub freshness: f64,
    pub fat_quality: f64,
    pub oxidation: f64,
}

impl Default for SpectralTargets {
    fn default() -> Self {
        Self { freshness: 0.85, fat_quality: 0.8, oxidation: 0.15 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpectralSimConfig {
    /// Broadband counts at the configured integration time and gain
    pub clear_level: f64,
    /// Reference spectrum relative to `clear_level`, violet → NIR
    pub reference_spectrum: [f64; 9],
    pub integration_ms: f64,
    pub gain: f64,
    /// Relative σ of the multiplicative read noise
    pub noise_rel: f64,
}

impl Default for SpectralSimConfig {
    fn default() -> Self {
        Self {
            clear_level: 2_000.0,
            // violet, indigo, blue, cyan, green, yellow, orange, red, nir
            reference_spectrum: [0.05, 0.06, 0.08, 0.10, 0.15, 0.12, 0.20, 0.25, 0.40],
            integration_ms: 100.0,
            gain: 16.0,
            noise_rel: 0.01,
        }
    }
}

impl SpectralSimConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("clear_level", self.clear_level)?;
        require_positive("integration_ms", self.integration_ms)?;
        require_positive("gain", self.gain)?;
        if self.reference_spectrum.iter().any(|v| !(*v > 0.0)) {
            return Err(ConfigError::threshold("reference_spectrum", "all entries must be > 0"));
        }
        if !(0.0..0.5).contains(&self.noise_rel) {
            return Err(ConfigError::threshold("noise_rel", "must be in [0, 0.5)"));
        }
        Ok(())
    }
}

pub struct SpectralSimulator {
    cfg: SpectralSimConfig,
    /// Applied in order; later maps see channels written by earlier ones
    maps: [IndexMap; 3],
    rng: StdRng,
}

impl SpectralSimulator {
    /// `maps` are the analyzer's freshness, fat-quality and oxidation maps.
    pub fn new(cfg: SpectralSimConfig, maps: [IndexMap; 3], seed: Option<u64>) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Ok(Self { cfg, maps, rng })
    }

    pub fn generate(&mut self, targets: SpectralTargets) -> RawSpectralFrame {
        let c = self.cfg.clear_level;
        let s = &self.cfg.reference_spectrum;
        let mut ch = SpectralChannels {
            violet_415: c * s[0],
            indigo_445: c * s[1],
            blue_480: c * s[2],
            cyan_515: c * s[3],
            green_555: c * s[4],
            yellow_590: c * s[5],
            orange_630: c * s[6],
            red_680: c * s[7],
            clear: c,
            nir_910: c * s[8],
        };

        let wanted = [targets.freshness, targets.fat_quality, targets.oxidation];
        for (map, index) in self.maps.iter().zip(wanted) {
            let denominator = map.denominator.read(&ch);
            map.numerator.write(&mut ch, denominator * map.ratio_for(index));
        }

        let noise = self.cfg.noise_rel;
        let mut values = ch.values();
        for v in values.iter_mut() {
            *v = (*v * (1.0 + gaussian(&mut self.rng, 0.0, noise))).max(0.0);
        }
        let channels = SpectralChannels {
            violet_415: values[0],
            indigo_445: values[1],
            blue_480: values[2],
            cyan_515: values[3],
            green_555: values[4],
            yellow_590: values[5],
            orange_630: values[6],
            red_680: values[7],
            clear: values[8],
            nir_910: values[9],
        };

        RawSpectralFrame { channels, integration_ms: self.cfg.integration_ms, gain: self.cfg.gain }
    }
}
