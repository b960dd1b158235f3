//! spectral_analysis.rs — Spectral frame analysis and grading
//!
//! Quality indices are linear maps of one channel ratio each:
//!   index = clamp((ratio − ratio_min) / (ratio_max − ratio_min), 0, 1)
//! optionally inverted. The same maps are inverted by `SpectralSimulator`
//! to synthesise frames for a target set of indices.

use grading_types::{Defect, DefectKind, Grade, RawSpectralFrame, SpectralAnalysis, SpectralChannels};
use serde::{Deserialize, Serialize};

use crate::depth_analysis::GradeThresholds;
use crate::error::{require_positive, require_unit, ConfigError};

pub const SPECTRAL_CONFIG_VERSION: u32 = 1;

/// Smallest denominator used when forming ratios.
const RATIO_EPS: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Violet415,
    Indigo445,
    Blue480,
    Cyan515,
    Green555,
    Yellow590,
    Orange630,
    Red680,
    Clear,
    Nir910,
}

impl Channel {
    pub fn read(self, ch: &SpectralChannels) -> f64 {
        match self {
            Self::Violet415 => ch.violet_415,
            Self::Indigo445 => ch.indigo_445,
            Self::Blue480 => ch.blue_480,
            Self::Cyan515 => ch.cyan_515,
            Self::Green555 => ch.green_555,
            Self::Yellow590 => ch.yellow_590,
            Self::Orange630 => ch.orange_630,
            Self::Red680 => ch.red_680,
            Self::Clear => ch.clear,
            Self::Nir910 => ch.nir_910,
        }
    }

    pub fn write(self, ch: &mut SpectralChannels, value: f64) {
        let slot = match self {
            Self::Violet415 => &mut ch.violet_415,
            Self::Indigo445 => &mut ch.indigo_445,
            Self::Blue480 => &mut ch.blue_480,
            Self::Cyan515 => &mut ch.cyan_515,
            Self::Green555 => &mut ch.green_555,
            Self::Yellow590 => &mut ch.yellow_590,
            Self::Orange630 => &mut ch.orange_630,
            Self::Red680 => &mut ch.red_680,
            Self::Clear => &mut ch.clear,
            Self::Nir910 => &mut ch.nir_910,
        };
        *slot = value;
    }
}

/// `numerator / denominator` mapped linearly onto `0..=1`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndexMap {
    pub numerator: Channel,
    pub denominator: Channel,
    pub ratio_min: f64,
    pub ratio_max: f64,
    /// Higher ratio means a lower index
    #[serde(default)]
    pub invert: bool,
}

impl IndexMap {
    pub fn ratio(&self, ch: &SpectralChannels) -> f64 {
        self.numerator.read(ch) / self.denominator.read(ch).max(RATIO_EPS)
    }

    pub fn index(&self, ch: &SpectralChannels) -> f64 {
        let t = ((self.ratio(ch) - self.ratio_min) / (self.ratio_max - self.ratio_min)).clamp(0.0, 1.0);
        if self.invert { 1.0 - t } else { t }
    }

    /// Ratio that maps back onto `index`.
    pub fn ratio_for(&self, index: f64) -> f64 {
        let t = index.clamp(0.0, 1.0);
        let t = if self.invert { 1.0 - t } else { t };
        self.ratio_min + t * (self.ratio_max - self.ratio_min)
    }

    fn validate(&self, name: &'static str) -> Result<(), ConfigError> {
        if self.numerator == self.denominator {
            return Err(ConfigError::threshold(name, "numerator and denominator must differ"));
        }
        if !(self.ratio_min >= 0.0 && self.ratio_max > self.ratio_min) {
            return Err(ConfigError::threshold(name, "need 0 ≤ ratio_min < ratio_max"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndexWeights {
    pub freshness: f64,
    pub fat_quality: f64,
    /// Applied to `1 − oxidation`
    pub oxidation: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpectralAnalysisConfig {
    pub version: u32,
    pub freshness: IndexMap,
    pub fat_quality: IndexMap,
    pub oxidation: IndexMap,
    pub weights: IndexWeights,
    /// Oxidation index above which an oxidation defect is reported
    pub oxidation_defect_index: f64,
    /// Freshness index below which a discoloration defect is reported
    pub discoloration_freshness_index: f64,
    pub grades: GradeThresholds,
}

impl Default for SpectralAnalysisConfig {
    fn default() -> Self {
        Self {
            version: SPECTRAL_CONFIG_VERSION,
            freshness: IndexMap {
                numerator: Channel::Red680,
                denominator: Channel::Green555,
                ratio_min: 0.8,
                ratio_max: 2.0,
                invert: false,
            },
            fat_quality: IndexMap {
                numerator: Channel::Nir910,
                denominator: Channel::Clear,
                ratio_min: 0.2,
                ratio_max: 0.6,
                invert: false,
            },
            oxidation: IndexMap {
                numerator: Channel::Yellow590,
                denominator: Channel::Red680,
                ratio_min: 0.4,
                ratio_max: 1.2,
                invert: false,
            },
            weights: IndexWeights { freshness: 0.4, fat_quality: 0.3, oxidation: 0.3 },
            oxidation_defect_index: 0.6,
            discoloration_freshness_index: 0.3,
            grades: GradeThresholds { a_plus: 0.85, a: 0.80, b: 0.65, c: 0.50 },
        }
    }
}

impl SpectralAnalysisConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != SPECTRAL_CONFIG_VERSION {
            return Err(ConfigError::threshold("spectral_analysis.version", format!("unsupported version {}", self.version)));
        }
        self.freshness.validate("freshness")?;
        self.fat_quality.validate("fat_quality")?;
        self.oxidation.validate("oxidation")?;
        let w = &self.weights;
        if w.freshness < 0.0 || w.fat_quality < 0.0 || w.oxidation < 0.0 {
            return Err(ConfigError::threshold("spectral weights", "must be non-negative"));
        }
        require_positive("spectral weight sum", w.freshness + w.fat_quality + w.oxidation)?;
        require_unit("oxidation_defect_index", self.oxidation_defect_index)?;
        require_unit("discoloration_freshness_index", self.discoloration_freshness_index)?;
        self.grades.validate("spectral_analysis.grades")
    }
}

pub struct SpectralAnalyzer {
    cfg: SpectralAnalysisConfig,
}

impl SpectralAnalyzer {
    pub fn new(cfg: SpectralAnalysisConfig) -> Result<Self, ConfigError> {
        cfg.validate()?;
        Ok(Self { cfg })
    }

    pub fn analyze(&self, frame: &RawSpectralFrame) -> SpectralAnalysis {
        let ch = &frame.channels;
        let freshness_index = self.cfg.freshness.index(ch);
        let fat_quality_index = self.cfg.fat_quality.index(ch);
        let oxidation_index = self.cfg.oxidation.index(ch);

        let w = &self.cfg.weights;
        let quality_score = ((w.freshness * freshness_index
            + w.fat_quality * fat_quality_index
            + w.oxidation * (1.0 - oxidation_index))
            / (w.freshness + w.fat_quality + w.oxidation))
            .clamp(0.0, 1.0);

        let mut defects = Vec::new();
        if oxidation_index > self.cfg.oxidation_defect_index {
            defects.push(Defect { position: None, kind: DefectKind::Oxidation, severity: oxidation_index });
        }
        if freshness_index < self.cfg.discoloration_freshness_index {
            defects.push(Defect {
                position: None,
                kind: DefectKind::Discoloration,
                severity: 1.0 - freshness_index,
            });
        }

        let grade: Grade = self.cfg.grades.grade(quality_score);
        SpectralAnalysis { freshness_index, fat_quality_index, oxidation_index, quality_score, grade, defects }
    }
}
