//! scenarios.rs — Quality profiles for controlled simulation runs
//!
//! A profile describes the product population coming down the line: a
//! mean/min/max distribution per quality index plus how often products are
//! irregular, defective, or carry a raised foreign object. Each tick draws
//! one `ScenarioDraw` from the active profile.
//!
//! Presets: premium, standard, degraded, defective. The `[profiles.*]`
//! config sections may override or add profiles by name.

use std::collections::HashMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::depth_sim::{gaussian, DefectSpec, ProductVariant};
use crate::error::{require_unit, ConfigError};
use crate::spectral_sim::SpectralTargets;

/// Truncated normal on `[min, max]` centred on `mean`, σ = (max − min) / 4.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndexDistribution {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

impl IndexDistribution {
    pub const fn new(mean: f64, min: f64, max: f64) -> Self {
        Self { mean, min, max }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        let sigma = (self.max - self.min) / 4.0;
        for _ in 0..8 {
            let v = gaussian(rng, self.mean, sigma);
            if (self.min..=self.max).contains(&v) {
                return v;
            }
        }
        self.mean.clamp(self.min, self.max)
    }

    fn validate(&self, name: &'static str) -> Result<(), ConfigError> {
        if !(0.0 <= self.min && self.min <= self.mean && self.mean <= self.max && self.max <= 1.0) {
            return Err(ConfigError::threshold(name, "need 0 ≤ min ≤ mean ≤ max ≤ 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityProfile {
    /// Target for the fused depth score (profile bias)
    pub depth_score: IndexDistribution,
    pub freshness: IndexDistribution,
    pub fat_quality: IndexDistribution,
    pub oxidation: IndexDistribution,
    #[serde(default)]
    pub irregular_probability: f64,
    #[serde(default)]
    pub defective_probability: f64,
    /// Chance of a raised object sitting on the product surface
    #[serde(default)]
    pub raised_object_probability: f64,
    #[serde(default = "default_raised_object_mm")]
    pub raised_object_mm: f64,
}

fn default_raised_object_mm() -> f64 {
    20.0
}

impl QualityProfile {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.depth_score.validate("profile.depth_score")?;
        self.freshness.validate("profile.freshness")?;
        self.fat_quality.validate("profile.fat_quality")?;
        self.oxidation.validate("profile.oxidation")?;
        require_unit("profile.irregular_probability", self.irregular_probability)?;
        require_unit("profile.defective_probability", self.defective_probability)?;
        require_unit("profile.raised_object_probability", self.raised_object_probability)?;
        if self.irregular_probability + self.defective_probability > 1.0 {
            return Err(ConfigError::threshold("profile", "irregular + defective probability exceeds 1"));
        }
        Ok(())
    }

    pub fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> ScenarioDraw {
        let roll: f64 = rng.gen();
        let variant = if roll < self.defective_probability {
            ProductVariant::Defective
        } else if roll < self.defective_probability + self.irregular_probability {
            ProductVariant::Irregular
        } else {
            ProductVariant::Normal
        };

        let mut defects = Vec::new();
        if rng.gen_bool(self.raised_object_probability) {
            defects.push(DefectSpec::Deformation {
                center: [rng.gen_range(0.4..0.6), rng.gen_range(0.4..0.6)],
                radius_mm: rng.gen_range(15.0..30.0),
                amplitude_mm: self.raised_object_mm,
            });
        }

        ScenarioDraw {
            variant,
            defects,
            depth_target: self.depth_score.sample(rng),
            spectral: SpectralTargets {
                freshness: self.freshness.sample(rng),
                fat_quality: self.fat_quality.sample(rng),
                oxidation: self.oxidation.sample(rng),
            },
        }
    }
}

/// Everything the pipeline needs to synthesise one sample.
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioDraw {
    pub variant: ProductVariant,
    pub defects: Vec<DefectSpec>,
    pub depth_target: f64,
    pub spectral: SpectralTargets,
}

// ── Presets ───────────────────────────────────────────────────────────────────

pub fn preset_premium() -> QualityProfile {
    QualityProfile {
        depth_score: IndexDistribution::new(0.92, 0.85, 1.0),
        freshness: IndexDistribution::new(0.92, 0.8, 1.0),
        fat_quality: IndexDistribution::new(0.9, 0.8, 1.0),
        oxidation: IndexDistribution::new(0.05, 0.0, 0.15),
        irregular_probability: 0.0,
        defective_probability: 0.0,
        raised_object_probability: 0.0,
        raised_object_mm: default_raised_object_mm(),
    }
}

pub fn preset_standard() -> QualityProfile {
    QualityProfile {
        depth_score: IndexDistribution::new(0.8, 0.6, 0.95),
        freshness: IndexDistribution::new(0.8, 0.6, 0.95),
        fat_quality: IndexDistribution::new(0.75, 0.55, 0.95),
        oxidation: IndexDistribution::new(0.15, 0.0, 0.35),
        irregular_probability: 0.1,
        defective_probability: 0.02,
        raised_object_probability: 0.0,
        raised_object_mm: default_raised_object_mm(),
    }
}

pub fn preset_degraded() -> QualityProfile {
    QualityProfile {
        depth_score: IndexDistribution::new(0.6, 0.4, 0.8),
        freshness: IndexDistribution::new(0.55, 0.3, 0.8),
        fat_quality: IndexDistribution::new(0.55, 0.3, 0.8),
        oxidation: IndexDistribution::new(0.4, 0.2, 0.65),
        irregular_probability: 0.35,
        defective_probability: 0.1,
        raised_object_probability: 0.02,
        raised_object_mm: default_raised_object_mm(),
    }
}

pub fn preset_defective() -> QualityProfile {
    QualityProfile {
        depth_score: IndexDistribution::new(0.35, 0.1, 0.6),
        freshness: IndexDistribution::new(0.3, 0.05, 0.55),
        fat_quality: IndexDistribution::new(0.4, 0.1, 0.7),
        oxidation: IndexDistribution::new(0.7, 0.45, 1.0),
        irregular_probability: 0.3,
        defective_probability: 0.6,
        raised_object_probability: 0.3,
        raised_object_mm: default_raised_object_mm(),
    }
}

/// Config-defined profiles win over presets of the same name.
pub fn resolve_profile(name: &str, overrides: &HashMap<String, QualityProfile>) -> Result<QualityProfile, ConfigError> {
    let profile = match overrides.get(name) {
        Some(p) => p.clone(),
        None => match name {
            "premium" => preset_premium(),
            "standard" => preset_standard(),
            "degraded" => preset_degraded(),
            "defective" => preset_defective(),
            other => return Err(ConfigError::UnknownProfile(other.to_string())),
        },
    };
    profile.validate()?;
    Ok(profile)
}
