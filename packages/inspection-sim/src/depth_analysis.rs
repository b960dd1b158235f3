//! depth_analysis.rs — Depth frame analysis and grading
//!
//! Turns one `RawDepthFrame` into a `DepthAnalysis`:
//! 1. Volume of the height field above the frame floor (trapezoid canonical,
//!    Simpson-on-spline and spline+adaptive quadrature as cross-checks)
//! 2. Surface uniformity from the mean gradient magnitude
//! 3. Echo-histogram metrics per zone (baseline, smoothing, peaks, entropy)
//! 4. Reflectance bands + 3×3 neighbourhood anomalies
//! 5. Amplitude z-score consistency
//! 6. Height defects against the median of product zones
//! 7. Weighted score × (1 − mean defect severity) → grade
//!
//! Every constant lives in `AnalysisConfig` so scoring policy can be swapped
//! without touching the pipeline.

use grading_types::{
    AmplitudeStats, Defect, DefectKind, DepthAnalysis, Grade, HistogramSummary, RawDepthFrame,
    ReflectanceStats, VolumeEstimates, ZoneMaps, ZonePos,
};
use serde::{Deserialize, Serialize};

use crate::error::{require_positive, require_unit, ConfigError};
use crate::numeric;

pub const ANALYSIS_CONFIG_VERSION: u32 = 1;

// ── Thresholds ────────────────────────────────────────────────────────────────

/// Lower score bounds for each grade; anything below `c` is REJECT.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GradeThresholds {
    pub a_plus: f64,
    pub a: f64,
    pub b: f64,
    pub c: f64,
}

impl GradeThresholds {
    pub fn grade(&self, score: f64) -> Grade {
        if score >= self.a_plus {
            Grade::APlus
        } else if score >= self.a {
            Grade::A
        } else if score >= self.b {
            Grade::B
        } else if score >= self.c {
            Grade::C
        } else {
            Grade::Reject
        }
    }

    pub fn validate(&self, name: &'static str) -> Result<(), ConfigError> {
        let ordered = self.a_plus <= 1.0
            && self.a_plus >= self.a
            && self.a >= self.b
            && self.b >= self.c
            && self.c >= 0.0;
        if ordered {
            Ok(())
        } else {
            Err(ConfigError::threshold(name, "grade bounds must satisfy 1 ≥ A+ ≥ A ≥ B ≥ C ≥ 0"))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub volume: f64,
    pub texture: f64,
    pub density: f64,
    pub signal_quality: f64,
    pub reflectance: f64,
    pub consistency: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub version: u32,

    /// Zones higher than the frame floor by this much count as product
    pub product_min_height_mm: f64,
    /// Volume range considered on-target
    pub expected_volume_mm3: [f64; 2],
    pub cross_validate_volume: bool,
    pub spline_rel_tol: f64,

    /// Baseline = median of the first `n_bins / baseline_divisor` bins
    pub baseline_divisor: usize,
    pub smoothing_window: usize,
    /// Peak height / prominence floors as fractions of the zone maximum
    pub peak_height_ratio: f64,
    pub peak_prominence_ratio: f64,
    /// Normalised entropy at or below which texture scores 1.0
    pub texture_good: f64,
    /// Normalised entropy at or above which texture scores 0.0
    pub texture_poor: f64,
    pub reference_density: f64,
    pub reference_signal_quality: f64,

    pub reflectance_low_pct: f64,
    pub reflectance_high_pct: f64,
    /// 3×3 neighbourhood std above which a zone is anomalous
    pub reflectance_anomaly_std_pct: f64,

    pub amplitude_z_threshold: f64,
    pub amplitude_max_outlier_fraction: f64,

    pub defect_threshold_mm: f64,
    /// severity = (|deviation| / median height) / severity_scale
    pub defect_severity_scale: f64,
    pub foreign_body_reject_severity: f64,

    pub weights: ScoreWeights,
    pub grades: GradeThresholds,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            version: ANALYSIS_CONFIG_VERSION,
            product_min_height_mm: 12.0,
            expected_volume_mm3: [150_000.0, 450_000.0],
            cross_validate_volume: true,
            spline_rel_tol: 1e-3,
            baseline_divisor: 16,
            smoothing_window: 3,
            peak_height_ratio: 0.2,
            peak_prominence_ratio: 0.05,
            texture_good: 0.75,
            texture_poor: 0.95,
            reference_density: 2_000.0,
            reference_signal_quality: 0.08,
            reflectance_low_pct: 15.0,
            reflectance_high_pct: 85.0,
            reflectance_anomaly_std_pct: 8.0,
            amplitude_z_threshold: 3.0,
            amplitude_max_outlier_fraction: 0.1,
            defect_threshold_mm: 10.0,
            defect_severity_scale: 1.0,
            foreign_body_reject_severity: 0.7,
            weights: ScoreWeights {
                volume: 0.25,
                texture: 0.15,
                density: 0.15,
                signal_quality: 0.15,
                reflectance: 0.15,
                consistency: 0.15,
            },
            grades: GradeThresholds { a_plus: 0.85, a: 0.80, b: 0.65, c: 0.50 },
        }
    }
}

impl AnalysisConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != ANALYSIS_CONFIG_VERSION {
            return Err(ConfigError::threshold("analysis.version", format!("unsupported version {}", self.version)));
        }
        if !(self.expected_volume_mm3[0] >= 0.0 && self.expected_volume_mm3[1] > self.expected_volume_mm3[0]) {
            return Err(ConfigError::threshold("expected_volume_mm3", "need 0 ≤ min < max"));
        }
        require_positive("spline_rel_tol", self.spline_rel_tol)?;
        if self.baseline_divisor == 0 || self.smoothing_window == 0 {
            return Err(ConfigError::threshold("baseline_divisor", "divisor and smoothing window must be ≥ 1"));
        }
        require_unit("peak_height_ratio", self.peak_height_ratio)?;
        require_unit("peak_prominence_ratio", self.peak_prominence_ratio)?;
        if !(self.texture_poor > self.texture_good) {
            return Err(ConfigError::threshold("texture_poor", "must exceed texture_good"));
        }
        require_positive("reference_density", self.reference_density)?;
        require_positive("reference_signal_quality", self.reference_signal_quality)?;
        if !(self.reflectance_high_pct > self.reflectance_low_pct) {
            return Err(ConfigError::threshold("reflectance_high_pct", "must exceed reflectance_low_pct"));
        }
        require_positive("amplitude_z_threshold", self.amplitude_z_threshold)?;
        require_unit("amplitude_max_outlier_fraction", self.amplitude_max_outlier_fraction)?;
        require_positive("defect_threshold_mm", self.defect_threshold_mm)?;
        require_positive("defect_severity_scale", self.defect_severity_scale)?;
        require_unit("foreign_body_reject_severity", self.foreign_body_reject_severity)?;
        let w = &self.weights;
        let all = [w.volume, w.texture, w.density, w.signal_quality, w.reflectance, w.consistency];
        if all.iter().any(|v| *v < 0.0) || w.volume + w.reflectance + w.consistency <= 0.0 {
            return Err(ConfigError::threshold("weights", "non-negative, with at least one histogram-free weight > 0"));
        }
        self.grades.validate("analysis.grades")
    }
}

// ── Analyzer ──────────────────────────────────────────────────────────────────

pub struct DepthAnalyzer {
    cfg: AnalysisConfig,
}

impl DepthAnalyzer {
    pub fn new(cfg: AnalysisConfig) -> Result<Self, ConfigError> {
        cfg.validate()?;
        Ok(Self { cfg })
    }

    pub fn analyze(&self, frame: &RawDepthFrame) -> DepthAnalysis {
        let n = frame.resolution;
        let (dx, dy) = (frame.pitch_x_mm, frame.pitch_y_mm);
        let height = frame.height_field();

        let floor = height.iter().copied().fold(f64::INFINITY, f64::min);
        let floor = if floor.is_finite() { floor } else { 0.0 };
        let above: Vec<f64> = height.iter().map(|h| (h - floor).max(0.0)).collect();
        let volumes = self.volumes(&above, n, dx, dy);

        let gradient = numeric::gradient_magnitude(&height, n, dx, dy);
        let surface_uniformity = 1.0 / (1.0 + numeric::mean(&gradient));

        let (histogram, zone_maps) = match &frame.histograms {
            Some(h) if !h.is_empty() => {
                let maps = self.histogram_maps(h);
                (Some(summarize(&maps)), Some(maps))
            }
            _ => (None, None),
        };

        let reflectance = self.reflectance_stats(&frame.reflectance_pct, n);
        let amplitude = self.amplitude_stats(&frame.amplitude);
        let defects = self.detect_defects(&above, n);

        let base = self.base_score(volumes.trapezoid_mm3, histogram.as_ref(), &reflectance, &amplitude, n);
        let penalty = if defects.is_empty() {
            0.0
        } else {
            defects.iter().map(|d| d.severity).sum::<f64>() / defects.len() as f64
        };
        let quality_score = (base * (1.0 - penalty)).clamp(0.0, 1.0);
        let grade = self.grade_for(quality_score, &defects);

        DepthAnalysis {
            volume_mm3: volumes.trapezoid_mm3,
            volumes,
            avg_height_mm: numeric::mean(&height),
            max_height_mm: height.iter().copied().fold(0.0, f64::max),
            min_height_mm: floor,
            surface_uniformity,
            histogram,
            zone_maps,
            reflectance,
            amplitude,
            defects,
            quality_score,
            grade,
        }
    }

    /// Threshold grade, overridden to REJECT by any severe foreign body.
    pub fn grade_for(&self, score: f64, defects: &[Defect]) -> Grade {
        let blocking = defects.iter().any(|d| {
            d.kind == DefectKind::ForeignBody && d.severity > self.cfg.foreign_body_reject_severity
        });
        if blocking {
            Grade::Reject
        } else {
            self.cfg.grades.grade(score)
        }
    }

    // ── Volume ──

    fn volumes(&self, above: &[f64], n: usize, dx: f64, dy: f64) -> VolumeEstimates {
        let trapezoid_mm3 = numeric::trapezoid_2d(above, n, dx, dy);
        if !self.cfg.cross_validate_volume {
            return VolumeEstimates { trapezoid_mm3, simpson_mm3: None, spline_mm3: None, max_relative_spread: None };
        }
        let simpson_mm3 = numeric::simpson_volume_via_spline(above, n, dx, dy);
        let spline_mm3 = numeric::spline_volume_adaptive(above, n, dx, dy, self.cfg.spline_rel_tol);

        let all: Vec<f64> = std::iter::once(trapezoid_mm3).chain(simpson_mm3).chain(spline_mm3).collect();
        let max_relative_spread = if all.len() > 1 && trapezoid_mm3.abs() > f64::EPSILON {
            let hi = all.iter().copied().fold(f64::MIN, f64::max);
            let lo = all.iter().copied().fold(f64::MAX, f64::min);
            Some((hi - lo) / trapezoid_mm3.abs())
        } else {
            None
        };
        VolumeEstimates { trapezoid_mm3, simpson_mm3, spline_mm3, max_relative_spread }
    }

    // ── Histograms ──

    fn histogram_maps(&self, histograms: &[Vec<f64>]) -> ZoneMaps {
        let mut maps = ZoneMaps {
            texture: Vec::with_capacity(histograms.len()),
            density: Vec::with_capacity(histograms.len()),
            roughness: Vec::with_capacity(histograms.len()),
            signal_quality: Vec::with_capacity(histograms.len()),
            multi_peak_count: Vec::with_capacity(histograms.len()),
        };
        for hist in histograms {
            let m = self.zone_histogram(hist);
            maps.texture.push(m.texture);
            maps.density.push(m.density);
            maps.roughness.push(m.roughness);
            maps.signal_quality.push(m.signal_quality);
            maps.multi_peak_count.push(m.peaks);
        }
        maps
    }

    fn zone_histogram(&self, hist: &[f64]) -> ZoneHistogram {
        let n_bins = hist.len();
        if n_bins == 0 {
            return ZoneHistogram::default();
        }
        let head = (n_bins / self.cfg.baseline_divisor).max(1);
        let baseline = numeric::median(&hist[..head]);
        let corrected: Vec<f64> = hist.iter().map(|v| (v - baseline).max(0.0)).collect();

        let sum: f64 = corrected.iter().sum();
        let max = corrected.iter().copied().fold(0.0, f64::max);
        if max <= 0.0 {
            return ZoneHistogram::default();
        }

        let smoothed = numeric::moving_average(&corrected, self.cfg.smoothing_window);
        let smax = smoothed.iter().copied().fold(0.0, f64::max);
        let peaks = numeric::find_peaks(
            &smoothed,
            self.cfg.peak_height_ratio * smax,
            self.cfg.peak_prominence_ratio * smax,
        )
        .len() as u32;

        let texture = if n_bins > 1 { numeric::entropy(&corrected) / (n_bins as f64).ln() } else { 0.0 };
        ZoneHistogram {
            texture,
            density: sum,
            roughness: numeric::std_dev(&corrected) / max,
            signal_quality: max / sum,
            peaks,
        }
    }

    // ── Reflectance & amplitude ──

    fn reflectance_stats(&self, refl: &[f64], n: usize) -> ReflectanceStats {
        let count = refl.len().max(1) as f64;
        let low = refl.iter().filter(|r| **r < self.cfg.reflectance_low_pct).count() as f64;
        let high = refl.iter().filter(|r| **r > self.cfg.reflectance_high_pct).count() as f64;

        let mut anomalies = Vec::new();
        let mut window = Vec::with_capacity(9);
        for row in 0..n {
            for col in 0..n {
                window.clear();
                for r in row.saturating_sub(1)..=(row + 1).min(n - 1) {
                    for c in col.saturating_sub(1)..=(col + 1).min(n - 1) {
                        window.push(refl[r * n + c]);
                    }
                }
                if numeric::std_dev(&window) > self.cfg.reflectance_anomaly_std_pct {
                    anomalies.push(ZonePos { row, col });
                }
            }
        }

        ReflectanceStats {
            mean_pct: numeric::mean(refl),
            std_pct: numeric::std_dev(refl),
            low_fraction: low / count,
            high_fraction: high / count,
            anomalies,
        }
    }

    fn amplitude_stats(&self, amp: &[f64]) -> AmplitudeStats {
        let mean = numeric::mean(amp);
        let std = numeric::std_dev(amp);
        let outliers = if std > 0.0 {
            amp.iter().filter(|a| ((*a - mean) / std).abs() > self.cfg.amplitude_z_threshold).count()
        } else {
            0
        };
        let outlier_fraction = outliers as f64 / amp.len().max(1) as f64;
        AmplitudeStats {
            mean,
            outlier_fraction,
            consistent: outlier_fraction < self.cfg.amplitude_max_outlier_fraction,
        }
    }

    // ── Defects ──

    /// Zones deviating from the product median by more than the threshold.
    /// Closer than the median (raised) is a foreign body, farther is a
    /// surface deformation.
    fn detect_defects(&self, above: &[f64], n: usize) -> Vec<Defect> {
        let product: Vec<(usize, f64)> = above
            .iter()
            .enumerate()
            .filter(|(_, h)| **h > self.cfg.product_min_height_mm)
            .map(|(i, h)| (i, *h))
            .collect();
        if product.is_empty() {
            return Vec::new();
        }
        let heights: Vec<f64> = product.iter().map(|(_, h)| *h).collect();
        let median = numeric::median(&heights);
        if median <= 0.0 {
            return Vec::new();
        }

        product
            .into_iter()
            .filter_map(|(i, h)| {
                let deviation = h - median;
                if deviation.abs() <= self.cfg.defect_threshold_mm {
                    return None;
                }
                let kind = if deviation > 0.0 { DefectKind::ForeignBody } else { DefectKind::SurfaceDeformation };
                let severity = (deviation.abs() / median / self.cfg.defect_severity_scale).clamp(0.0, 1.0);
                Some(Defect { position: Some(ZonePos { row: i / n, col: i % n }), kind, severity })
            })
            .collect()
    }

    // ── Scoring ──

    fn base_score(
        &self,
        volume: f64,
        histogram: Option<&HistogramSummary>,
        refl: &ReflectanceStats,
        amp: &AmplitudeStats,
        n: usize,
    ) -> f64 {
        let w = &self.cfg.weights;
        let [lo, hi] = self.cfg.expected_volume_mm3;
        let volume_score = if volume < lo {
            (1.0 - (lo - volume) / (hi - lo)).max(0.0)
        } else if volume > hi {
            (1.0 - (volume - hi) / (hi - lo)).max(0.0)
        } else {
            1.0
        };
        let anomaly_fraction = refl.anomalies.len() as f64 / (n * n).max(1) as f64;
        let reflectance_penalty = (refl.low_fraction + refl.high_fraction + anomaly_fraction).clamp(0.0, 1.0);
        let consistency = if amp.consistent { 1.0 } else { 0.0 };

        let mut parts = vec![
            (w.volume, volume_score),
            (w.reflectance, 1.0 - reflectance_penalty),
            (w.consistency, consistency),
        ];
        if let Some(h) = histogram {
            let span = self.cfg.texture_poor - self.cfg.texture_good;
            let texture = (1.0 - (h.mean_texture - self.cfg.texture_good) / span).clamp(0.0, 1.0);
            parts.push((w.texture, texture));
            parts.push((w.density, (h.mean_density / self.cfg.reference_density).clamp(0.0, 1.0)));
            parts.push((w.signal_quality, (h.mean_signal_quality / self.cfg.reference_signal_quality).clamp(0.0, 1.0)));
        }
        let total: f64 = parts.iter().map(|(w, _)| w).sum();
        if total <= 0.0 {
            return 0.0;
        }
        parts.iter().map(|(w, s)| w * s).sum::<f64>() / total
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct ZoneHistogram {
    texture: f64,
    density: f64,
    roughness: f64,
    signal_quality: f64,
    peaks: u32,
}

fn summarize(maps: &ZoneMaps) -> HistogramSummary {
    HistogramSummary {
        mean_texture: numeric::mean(&maps.texture),
        mean_density: numeric::mean(&maps.density),
        mean_roughness: numeric::mean(&maps.roughness),
        mean_signal_quality: numeric::mean(&maps.signal_quality),
        multi_peak_zones: maps.multi_peak_count.iter().filter(|c| **c > 1).count(),
    }
}
