//! fusion.rs — Depth + spectral fusion and business metrics
//!
//! 1. Optional quality-profile bias on the depth score (controlled scenarios)
//! 2. Weighted score, REJECT overrides, threshold grade
//! 3. Thickness band, irregularity, fill level, dimensional conformity
//! 4. Rolling per-device thickness history → Cp / Cpk
//! 5. L*a*b* colour estimate, ΔE vs reference, ratio-based defect flags
//!
//! The history arena is the only shared mutable state. It sits behind a
//! `Mutex` that is taken once per tick for the append + capability step.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use grading_types::{
    BusinessMetrics, CapabilityClass, ColorMetrics, ComplianceFlags, DefectFlags, DepthAnalysis,
    FillMetrics, FusionResult, Grade, ProcessCapability, RawDepthFrame, RawSpectralFrame,
    SpectralAnalysis, SpectralChannels, ThicknessClass, ThicknessMetrics,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::depth_analysis::GradeThresholds;
use crate::error::{require_positive, require_unit, ConfigError};
use crate::numeric;
use crate::spectral_analysis::Channel;

pub const FUSION_CONFIG_VERSION: u32 = 1;

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThicknessSpec {
    pub target_mm: f64,
    /// |mean − target| bounds for extra / premier / deuxième
    pub extra_tol_mm: f64,
    pub premier_tol_mm: f64,
    pub deuxieme_tol_mm: f64,
    /// Thickness std above which the product is flagged irregular
    pub irregular_std_mm: f64,
    pub lsl_mm: f64,
    pub usl_mm: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySpec {
    /// Rolling history length per device
    pub history_len: usize,
    pub min_samples: usize,
    pub min_sigma_mm: f64,
    pub capable_cpk: f64,
    pub acceptable_cpk: f64,
}

/// Raised when `numerator / denominator` exceeds `above`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RatioFlag {
    pub numerator: Channel,
    pub denominator: Channel,
    pub above: f64,
}

impl RatioFlag {
    fn raised(&self, ch: &SpectralChannels) -> bool {
        let den = self.denominator.read(ch);
        den > 0.0 && self.numerator.read(ch) / den > self.above
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColorSpec {
    pub reference_lab: [f64; 3],
    /// ΔE at which the colour premium reaches zero
    pub max_delta_e: f64,
    pub hematoma: RatioFlag,
    pub bile_trace: RatioFlag,
    pub oxidation: RatioFlag,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub version: u32,
    pub depth_weight: f64,
    pub spectral_weight: f64,
    /// Share of the profile target when a quality profile biases the depth score
    pub profile_blend: f64,
    /// Combined defect count at which the sample is rejected
    pub max_defects: usize,
    pub grades: GradeThresholds,
    /// Zones this far above the frame floor are product
    pub product_min_height_mm: f64,
    pub fill_target_pct: f64,
    pub fill_tolerance_pct: f64,
    pub thickness: ThicknessSpec,
    pub capability: CapabilitySpec,
    pub color: ColorSpec,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            version: FUSION_CONFIG_VERSION,
            depth_weight: 0.6,
            spectral_weight: 0.4,
            profile_blend: 0.7,
            max_defects: 5,
            grades: GradeThresholds { a_plus: 0.85, a: 0.75, b: 0.60, c: 0.45 },
            product_min_height_mm: 2.0,
            fill_target_pct: 38.0,
            fill_tolerance_pct: 10.0,
            thickness: ThicknessSpec {
                target_mm: 17.0,
                extra_tol_mm: 2.0,
                premier_tol_mm: 4.0,
                deuxieme_tol_mm: 7.0,
                irregular_std_mm: 8.0,
                lsl_mm: 8.0,
                usl_mm: 26.0,
            },
            capability: CapabilitySpec {
                history_len: 50,
                min_samples: 10,
                min_sigma_mm: 1e-3,
                capable_cpk: 1.33,
                acceptable_cpk: 1.0,
            },
            color: ColorSpec {
                reference_lab: [48.0, 10.0, 20.0],
                max_delta_e: 30.0,
                hematoma: RatioFlag { numerator: Channel::Indigo445, denominator: Channel::Red680, above: 0.35 },
                bile_trace: RatioFlag { numerator: Channel::Green555, denominator: Channel::Red680, above: 0.9 },
                oxidation: RatioFlag { numerator: Channel::Yellow590, denominator: Channel::Red680, above: 0.9 },
            },
        }
    }
}

impl FusionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != FUSION_CONFIG_VERSION {
            return Err(ConfigError::threshold("fusion.version", format!("unsupported version {}", self.version)));
        }
        if self.depth_weight < 0.0 || self.spectral_weight < 0.0 {
            return Err(ConfigError::threshold("fusion weights", "must be non-negative"));
        }
        require_positive("fusion weight sum", self.depth_weight + self.spectral_weight)?;
        require_unit("profile_blend", self.profile_blend)?;
        if self.max_defects == 0 {
            return Err(ConfigError::threshold("max_defects", "must be ≥ 1"));
        }
        self.grades.validate("fusion.grades")?;
        let t = &self.thickness;
        require_positive("thickness.target_mm", t.target_mm)?;
        if !(t.extra_tol_mm > 0.0 && t.premier_tol_mm >= t.extra_tol_mm && t.deuxieme_tol_mm >= t.premier_tol_mm) {
            return Err(ConfigError::threshold("thickness tolerances", "need 0 < extra ≤ premier ≤ deuxième"));
        }
        if !(t.usl_mm > t.lsl_mm) {
            return Err(ConfigError::threshold("thickness.usl_mm", "must exceed lsl_mm"));
        }
        let c = &self.capability;
        if c.history_len < c.min_samples || c.min_samples < 2 {
            return Err(ConfigError::threshold("capability", "need 2 ≤ min_samples ≤ history_len"));
        }
        require_positive("capability.min_sigma_mm", c.min_sigma_mm)?;
        require_positive("color.max_delta_e", self.color.max_delta_e)?;
        require_positive("fill_tolerance_pct", self.fill_tolerance_pct)
    }
}

// ── Per-device history arena ──────────────────────────────────────────────────

/// Bounded thickness histories keyed by device id. Slots are allocated
/// once per device and never shared.
#[derive(Debug, Default)]
struct HistoryArena {
    index: HashMap<String, usize>,
    slots: Vec<VecDeque<f64>>,
}

impl HistoryArena {
    fn push(&mut self, device_id: &str, value: f64, capacity: usize) -> &VecDeque<f64> {
        let slot = match self.index.get(device_id) {
            Some(i) => *i,
            None => {
                self.slots.push(VecDeque::with_capacity(capacity));
                let i = self.slots.len() - 1;
                self.index.insert(device_id.to_string(), i);
                i
            }
        };
        let history = &mut self.slots[slot];
        if history.len() == capacity {
            history.pop_front();
        }
        history.push_back(value);
        history
    }

    fn len_of(&self, device_id: &str) -> usize {
        self.index.get(device_id).map(|i| self.slots[*i].len()).unwrap_or(0)
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

pub struct FusionInput<'a> {
    pub device_id: &'a str,
    pub depth: &'a DepthAnalysis,
    pub depth_raw: &'a RawDepthFrame,
    pub spectral: Option<(&'a SpectralAnalysis, &'a RawSpectralFrame)>,
    /// Quality-profile target for the depth score
    pub profile_target: Option<f64>,
}

pub struct FusionEngine {
    cfg: FusionConfig,
    history: Mutex<HistoryArena>,
}

impl FusionEngine {
    pub fn new(cfg: FusionConfig) -> Result<Self, ConfigError> {
        cfg.validate()?;
        Ok(Self { cfg, history: Mutex::new(HistoryArena::default()) })
    }

    pub fn history_len(&self, device_id: &str) -> usize {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).len_of(device_id)
    }

    pub fn fuse(&self, input: FusionInput<'_>) -> FusionResult {
        let tof_score = match input.profile_target {
            Some(target) => {
                let b = self.cfg.profile_blend;
                (b * target.clamp(0.0, 1.0) + (1.0 - b) * input.depth.quality_score).clamp(0.0, 1.0)
            }
            None => input.depth.quality_score,
        };

        let mut combined_defects = input.depth.defects.clone();
        let (final_score, spectral_score, spectral_contribution, input_reject) = match input.spectral {
            Some((spec, _)) => {
                let total = self.cfg.depth_weight + self.cfg.spectral_weight;
                let ws = self.cfg.spectral_weight / total;
                combined_defects.extend(spec.defects.iter().cloned());
                (
                    (1.0 - ws) * tof_score + ws * spec.quality_score,
                    spec.quality_score,
                    ws,
                    input.depth.grade.is_reject() || spec.grade.is_reject(),
                )
            }
            None => (tof_score, 0.0, 0.0, input.depth.grade.is_reject()),
        };
        let defect_count = combined_defects.len();

        let final_grade = if input_reject || defect_count >= self.cfg.max_defects {
            Grade::Reject
        } else if input.spectral.is_none() && input.profile_target.is_none() {
            input.depth.grade
        } else {
            self.cfg.grades.grade(final_score)
        };

        let thickness_samples = self.product_heights(input.depth_raw);
        let thickness = self.thickness_metrics(&thickness_samples);
        let fill = self.fill_metrics(input.depth_raw, thickness_samples.len());
        let dimensional_conformity = self.conformity(&thickness, &fill);
        let capability = if thickness_samples.is_empty() {
            None
        } else {
            self.record_thickness(input.device_id, thickness.mean_mm)
        };

        let (color, defect_flags) = match input.spectral {
            Some((_, raw)) => (Some(self.color_metrics(&raw.channels)), self.defect_flags(&raw.channels)),
            None => (None, DefectFlags::default()),
        };

        let compliance = ComplianceFlags::from_grade(final_grade);
        FusionResult {
            final_score: final_score.clamp(0.0, 1.0),
            final_grade,
            is_compliant: compliance.is_compliant,
            tof_score,
            spectral_score,
            spectral_contribution,
            combined_defects,
            defect_count,
            business_metrics: BusinessMetrics {
                thickness,
                fill,
                dimensional_conformity,
                capability,
                color,
                defect_flags,
                compliance,
            },
        }
    }

    // ── Thickness & fill ──

    fn product_heights(&self, raw: &RawDepthFrame) -> Vec<f64> {
        let heights = raw.height_field();
        let floor = heights.iter().copied().fold(f64::INFINITY, f64::min);
        if !floor.is_finite() {
            return Vec::new();
        }
        heights
            .into_iter()
            .map(|h| h - floor)
            .filter(|h| *h > self.cfg.product_min_height_mm)
            .collect()
    }

    fn thickness_metrics(&self, samples: &[f64]) -> ThicknessMetrics {
        let t = &self.cfg.thickness;
        if samples.is_empty() {
            return ThicknessMetrics { mean_mm: 0.0, std_mm: 0.0, class: ThicknessClass::OutOfSpec, irregular: false };
        }
        let mean_mm = numeric::mean(samples);
        let std_mm = numeric::std_dev(samples);
        let off = (mean_mm - t.target_mm).abs();
        let class = if off <= t.extra_tol_mm {
            ThicknessClass::Extra
        } else if off <= t.premier_tol_mm {
            ThicknessClass::Premier
        } else if off <= t.deuxieme_tol_mm {
            ThicknessClass::Deuxieme
        } else {
            ThicknessClass::OutOfSpec
        };
        ThicknessMetrics { mean_mm, std_mm, class, irregular: std_mm > t.irregular_std_mm }
    }

    fn fill_metrics(&self, raw: &RawDepthFrame, product_zones: usize) -> FillMetrics {
        let level_pct = 100.0 * product_zones as f64 / raw.zone_count().max(1) as f64;
        FillMetrics {
            level_pct,
            target_pct: self.cfg.fill_target_pct,
            within_tolerance: (level_pct - self.cfg.fill_target_pct).abs() <= self.cfg.fill_tolerance_pct,
        }
    }

    /// 0–100, equal parts thickness closeness and fill closeness.
    fn conformity(&self, thickness: &ThicknessMetrics, fill: &FillMetrics) -> f64 {
        let t = &self.cfg.thickness;
        let thick = if thickness.mean_mm > 0.0 {
            (1.0 - (thickness.mean_mm - t.target_mm).abs() / t.deuxieme_tol_mm).max(0.0)
        } else {
            0.0
        };
        let fill_part = (1.0 - (fill.level_pct - fill.target_pct).abs() / (2.0 * self.cfg.fill_tolerance_pct)).max(0.0);
        100.0 * (thick + fill_part) / 2.0
    }

    // ── Capability ──

    fn record_thickness(&self, device_id: &str, mean_mm: f64) -> Option<ProcessCapability> {
        let c = &self.cfg.capability;
        let t = &self.cfg.thickness;
        let mut arena = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let history = arena.push(device_id, mean_mm, c.history_len);
        if history.len() < c.min_samples {
            debug!("capability for {device_id}: {}/{} samples", history.len(), c.min_samples);
            return None;
        }
        let values: Vec<f64> = history.iter().copied().collect();
        drop(arena);

        let mean = numeric::mean(&values);
        let sigma = numeric::sample_std_dev(&values).max(c.min_sigma_mm);
        let cp = (t.usl_mm - t.lsl_mm) / (6.0 * sigma);
        let cpk = ((t.usl_mm - mean) / (3.0 * sigma)).min((mean - t.lsl_mm) / (3.0 * sigma));
        let class = if cpk >= c.capable_cpk {
            CapabilityClass::Capable
        } else if cpk >= c.acceptable_cpk {
            CapabilityClass::Acceptable
        } else {
            CapabilityClass::Incapable
        };
        Some(ProcessCapability { cp, cpk, class, samples: values.len() })
    }

    // ── Colour ──

    fn color_metrics(&self, ch: &SpectralChannels) -> ColorMetrics {
        let [l_star, a_star, b_star] = lab_from_channels(ch);
        let [rl, ra, rb] = self.cfg.color.reference_lab;
        let delta_e = ((l_star - rl).powi(2) + (a_star - ra).powi(2) + (b_star - rb).powi(2)).sqrt();
        let premium_score = (1.0 - delta_e / self.cfg.color.max_delta_e).clamp(0.0, 1.0);
        ColorMetrics { l_star, a_star, b_star, delta_e, premium_score }
    }

    fn defect_flags(&self, ch: &SpectralChannels) -> DefectFlags {
        let c = &self.cfg.color;
        DefectFlags {
            hematoma: c.hematoma.raised(ch),
            bile_trace: c.bile_trace.raised(ch),
            oxidation: c.oxidation.raised(ch),
        }
    }
}

/// Clear-normalised red/green/blue treated as linear sRGB, then CIE L*a*b* (D65).
pub fn lab_from_channels(ch: &SpectralChannels) -> [f64; 3] {
    let clear = ch.clear.max(1e-6);
    let r = (ch.red_680 / clear).clamp(0.0, 1.0);
    let g = (ch.green_555 / clear).clamp(0.0, 1.0);
    let b = (ch.blue_480 / clear).clamp(0.0, 1.0);

    let x = 0.4124 * r + 0.3576 * g + 0.1805 * b;
    let y = 0.2126 * r + 0.7152 * g + 0.0722 * b;
    let z = 0.0193 * r + 0.1192 * g + 0.9505 * b;

    let f = |t: f64| {
        const DELTA: f64 = 6.0 / 29.0;
        if t > DELTA.powi(3) { t.cbrt() } else { t / (3.0 * DELTA * DELTA) + 4.0 / 29.0 }
    };
    let (fx, fy, fz) = (f(x / 0.950_47), f(y), f(z / 1.088_83));
    [116.0 * fy - 16.0, 500.0 * (fx - fy), 200.0 * (fy - fz)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use grading_types::{AmplitudeStats, Defect, DefectKind, ReflectanceStats, VolumeEstimates};
    use proptest::prelude::*;

    fn depth(score: f64, grade: Grade, defects: usize) -> DepthAnalysis {
        DepthAnalysis {
            volume_mm3: 1.0,
            volumes: VolumeEstimates { trapezoid_mm3: 1.0, simpson_mm3: None, spline_mm3: None, max_relative_spread: None },
            avg_height_mm: 10.0,
            max_height_mm: 20.0,
            min_height_mm: 0.0,
            surface_uniformity: 0.9,
            histogram: None,
            zone_maps: None,
            reflectance: ReflectanceStats { mean_pct: 40.0, std_pct: 1.0, low_fraction: 0.0, high_fraction: 0.0, anomalies: vec![] },
            amplitude: AmplitudeStats { mean: 1000.0, outlier_fraction: 0.0, consistent: true },
            defects: (0..defects)
                .map(|_| Defect { position: None, kind: DefectKind::SurfaceDeformation, severity: 0.1 })
                .collect(),
            quality_score: score,
            grade,
        }
    }

    fn spectral(score: f64, grade: Grade) -> SpectralAnalysis {
        SpectralAnalysis {
            freshness_index: 0.8,
            fat_quality_index: 0.8,
            oxidation_index: 0.1,
            quality_score: score,
            grade,
            defects: vec![],
        }
    }

    /// 8×8 frame, flat product of `thickness` over the central 4×4 block.
    fn raw_depth(thickness: f64) -> RawDepthFrame {
        let mut distance = vec![300.0; 64];
        for r in 2..6 {
            for c in 2..6 {
                distance[r * 8 + c] = 300.0 - thickness;
            }
        }
        RawDepthFrame {
            resolution: 8,
            height_sensor_mm: 300.0,
            pitch_x_mm: 20.0,
            pitch_y_mm: 20.0,
            distance_mm: distance,
            reflectance_pct: vec![40.0; 64],
            amplitude: vec![1000.0; 64],
            ambient: vec![5.0; 64],
            histograms: None,
            bin_width_mm: 6.0,
        }
    }

    fn raw_spectral() -> RawSpectralFrame {
        RawSpectralFrame {
            channels: SpectralChannels {
                violet_415: 100.0,
                indigo_445: 120.0,
                blue_480: 160.0,
                cyan_515: 200.0,
                green_555: 300.0,
                yellow_590: 280.0,
                orange_630: 400.0,
                red_680: 546.0,
                clear: 2000.0,
                nir_910: 1000.0,
            },
            integration_ms: 100.0,
            gain: 16.0,
        }
    }

    fn engine() -> FusionEngine {
        FusionEngine::new(FusionConfig::default()).unwrap()
    }

    #[test]
    fn weighted_fusion_and_grade() {
        let e = engine();
        let (d, raw) = (depth(0.9, Grade::APlus, 0), raw_depth(17.0));
        let (s, sraw) = (spectral(0.7, Grade::B), raw_spectral());
        let r = e.fuse(FusionInput { device_id: "d1", depth: &d, depth_raw: &raw, spectral: Some((&s, &sraw)), profile_target: None });
        assert!((r.final_score - (0.6 * 0.9 + 0.4 * 0.7)).abs() < 1e-12);
        assert_eq!(r.final_grade, Grade::A);
        assert!((r.spectral_contribution - 0.4).abs() < 1e-12);
        assert!(r.is_compliant);
    }

    #[test]
    fn missing_spectral_passes_depth_through() {
        let e = engine();
        let (d, raw) = (depth(0.82, Grade::A, 1), raw_depth(17.0));
        let r = e.fuse(FusionInput { device_id: "d1", depth: &d, depth_raw: &raw, spectral: None, profile_target: None });
        assert_eq!(r.final_score, 0.82);
        assert_eq!(r.final_grade, Grade::A);
        assert_eq!(r.spectral_contribution, 0.0);
        assert!(r.business_metrics.color.is_none());
        assert_eq!(r.defect_count, 1);
    }

    #[test]
    fn five_defects_reject() {
        let e = engine();
        let (d, raw) = (depth(0.95, Grade::APlus, 5), raw_depth(17.0));
        let (s, sraw) = (spectral(0.95, Grade::APlus), raw_spectral());
        let r = e.fuse(FusionInput { device_id: "d1", depth: &d, depth_raw: &raw, spectral: Some((&s, &sraw)), profile_target: None });
        assert_eq!(r.final_grade, Grade::Reject);
        assert!(r.business_metrics.compliance.is_rejected);
    }

    #[test]
    fn profile_bias_blends_toward_target() {
        let e = engine();
        let (d, raw) = (depth(0.5, Grade::C, 0), raw_depth(17.0));
        let r = e.fuse(FusionInput { device_id: "d1", depth: &d, depth_raw: &raw, spectral: None, profile_target: Some(0.9) });
        assert!((r.tof_score - (0.7 * 0.9 + 0.3 * 0.5)).abs() < 1e-12);
        assert_eq!(r.final_score, r.tof_score);
        // 0.78 grades A even though the raw depth grade was C
        assert_eq!(r.final_grade, Grade::A);
    }

    #[test]
    fn blended_score_keeps_reject_overrides() {
        let e = engine();
        let raw = raw_depth(17.0);
        let rejected = depth(0.5, Grade::Reject, 0);
        let r = e.fuse(FusionInput { device_id: "d1", depth: &rejected, depth_raw: &raw, spectral: None, profile_target: Some(1.0) });
        assert_eq!(r.final_grade, Grade::Reject);

        let defective = depth(0.9, Grade::APlus, 5);
        let r = e.fuse(FusionInput { device_id: "d1", depth: &defective, depth_raw: &raw, spectral: None, profile_target: Some(1.0) });
        assert_eq!(r.final_grade, Grade::Reject);
    }

    #[test]
    fn thickness_band_and_fill() {
        let e = engine();
        let (d, raw) = (depth(0.9, Grade::APlus, 0), raw_depth(17.0));
        let r = e.fuse(FusionInput { device_id: "d1", depth: &d, depth_raw: &raw, spectral: None, profile_target: None });
        let m = &r.business_metrics;
        assert!((m.thickness.mean_mm - 17.0).abs() < 1e-9);
        assert_eq!(m.thickness.class, ThicknessClass::Extra);
        assert!(!m.thickness.irregular);
        assert!((m.fill.level_pct - 25.0).abs() < 1e-9);
        assert!(!m.fill.within_tolerance);

        let thin = raw_depth(5.0);
        let r = e.fuse(FusionInput { device_id: "d2", depth: &d, depth_raw: &thin, spectral: None, profile_target: None });
        assert_eq!(r.business_metrics.thickness.class, ThicknessClass::OutOfSpec);
    }

    #[test]
    fn capability_appears_at_ten_samples() {
        let e = engine();
        let d = depth(0.9, Grade::APlus, 0);
        for i in 0..11 {
            let raw = raw_depth(16.0 + (i % 3) as f64);
            let r = e.fuse(FusionInput { device_id: "cap", depth: &d, depth_raw: &raw, spectral: None, profile_target: None });
            let cap = r.business_metrics.capability;
            if i < 9 {
                assert!(cap.is_none(), "sample {} already has capability", i + 1);
            } else {
                let cap = cap.unwrap();
                assert_eq!(cap.samples, i + 1);
                assert!(cap.cp > 0.0 && cap.cpk <= cap.cp);
            }
        }
    }

    #[test]
    fn histories_are_partitioned_per_device() {
        let e = engine();
        let d = depth(0.9, Grade::APlus, 0);
        for _ in 0..12 {
            let raw = raw_depth(17.0);
            e.fuse(FusionInput { device_id: "a", depth: &d, depth_raw: &raw, spectral: None, profile_target: None });
        }
        let raw = raw_depth(17.0);
        let r = e.fuse(FusionInput { device_id: "b", depth: &d, depth_raw: &raw, spectral: None, profile_target: None });
        assert!(r.business_metrics.capability.is_none());
        assert_eq!(e.history_len("a"), 12);
        assert_eq!(e.history_len("b"), 1);
    }

    #[test]
    fn history_is_bounded() {
        let mut cfg = FusionConfig::default();
        cfg.capability.history_len = 12;
        let e = FusionEngine::new(cfg).unwrap();
        let d = depth(0.9, Grade::APlus, 0);
        for _ in 0..30 {
            let raw = raw_depth(17.0);
            e.fuse(FusionInput { device_id: "a", depth: &d, depth_raw: &raw, spectral: None, profile_target: None });
        }
        assert_eq!(e.history_len("a"), 12);
    }

    #[test]
    fn color_near_reference_is_premium() {
        let e = engine();
        let (d, raw) = (depth(0.9, Grade::APlus, 0), raw_depth(17.0));
        let (s, sraw) = (spectral(0.9, Grade::APlus), raw_spectral());
        let r = e.fuse(FusionInput { device_id: "c", depth: &d, depth_raw: &raw, spectral: Some((&s, &sraw)), profile_target: None });
        let color = r.business_metrics.color.unwrap();
        assert!(color.delta_e < 5.0, "ΔE {}", color.delta_e);
        assert!(color.premium_score > 0.8 && color.premium_score <= 1.0, "premium {}", color.premium_score);
        assert_eq!(r.business_metrics.defect_flags, DefectFlags::default());
    }

    #[test]
    fn greenish_sample_raises_bile_flag() {
        let e = engine();
        let (d, raw) = (depth(0.9, Grade::APlus, 0), raw_depth(17.0));
        let s = spectral(0.9, Grade::APlus);
        let mut sraw = raw_spectral();
        sraw.channels.green_555 = 600.0;
        let r = e.fuse(FusionInput { device_id: "c", depth: &d, depth_raw: &raw, spectral: Some((&s, &sraw)), profile_target: None });
        assert!(r.business_metrics.defect_flags.bile_trace);
        assert!(!r.business_metrics.defect_flags.hematoma);
    }

    fn grade_strategy() -> impl Strategy<Value = Grade> {
        prop::sample::select(Grade::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn reject_input_is_never_upgraded(
            dscore in 0.0f64..=1.0,
            sscore in 0.0f64..=1.0,
            dgrade in grade_strategy(),
            sgrade in grade_strategy(),
            target in proptest::option::of(0.0f64..=1.0),
            with_spectral in any::<bool>(),
        ) {
            let e = engine();
            let d = depth(dscore, dgrade, 0);
            let raw = raw_depth(17.0);
            let s = spectral(sscore, sgrade);
            let sraw = raw_spectral();
            let spec = if with_spectral { Some((&s, &sraw)) } else { None };
            let r = e.fuse(FusionInput { device_id: "p", depth: &d, depth_raw: &raw, spectral: spec, profile_target: target });
            let any_reject = dgrade.is_reject() || (with_spectral && sgrade.is_reject());
            if any_reject {
                prop_assert_eq!(r.final_grade, Grade::Reject);
            }
            prop_assert!((0.0..=1.0).contains(&r.final_score));
        }
    }
}
