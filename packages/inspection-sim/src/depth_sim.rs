//! depth_sim.rs — Time-of-flight depth sensor simulation
//!
//! Synthesises one `RawDepthFrame` per sampling tick for a product lying on
//! the belt under a multi-zone ToF sensor:
//! 1. Rotated half-ellipsoid height field (semi-axes from product size + margin)
//! 2. Correlated surface texture (smoothed Gaussian noise) + periodic ripple
//! 3. Optional container mode: everything outside the product sits at tray height
//! 4. Explicit or random defects with a linear circular falloff
//! 5. Distance = sensor height − surface height, clamped to the valid range
//! 6. Reflectance / amplitude / ambient grids coherent with the surface
//! 7. Optional per-zone echo histograms (main peak + occasional multi-echo)

use std::f64::consts::TAU;

use grading_types::RawDepthFrame;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::error::{require_positive, require_unit, ConfigError};
use crate::numeric;

pub const SUPPORTED_RESOLUTIONS: &[usize] = &[8, 16, 32, 64];
pub const AMPLITUDE_MAX: f64 = 4095.0;

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub length_mm: f64,
    pub width_mm: f64,
    /// Flat tray surface height above the belt
    pub height_mm: f64,
    pub reflectance_mean_pct: f64,
    pub reflectance_std_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DepthSimConfig {
    pub resolution: usize,
    pub height_sensor_mm: f64,
    /// Zone pitch; derived from the footprint and margin when absent
    pub pitch_x_mm: Option<f64>,
    pub pitch_y_mm: Option<f64>,
    pub product_length_mm: f64,
    pub product_width_mm: f64,
    pub product_thickness_mm: f64,
    /// Fraction of the grid kept empty on each side of the footprint
    pub margin_pct: f64,
    pub rotation_deg: f64,
    pub container: Option<ContainerConfig>,

    pub texture_amplitude_mm: f64,
    pub texture_sigma_zones: f64,
    pub ripple_amplitude_mm: f64,
    pub ripple_period_mm: f64,

    pub product_reflectance_mean_pct: f64,
    pub product_reflectance_std_pct: f64,
    pub background_reflectance_mean_pct: f64,
    pub background_reflectance_std_pct: f64,
    /// Reflectance loss on steep surfaces (per unit slope)
    pub slope_reflectance_loss: f64,
    /// amplitude = gain · reflectance / distance_m²
    pub amplitude_gain: f64,
    pub amplitude_noise: f64,
    pub ambient_mean: f64,
    pub ambient_std: f64,

    pub histograms: bool,
    pub n_bins: usize,
    pub bin_width_mm: f64,
    /// Peak σ in bins at 100 % reflectance
    pub base_peak_sigma_bins: f64,
    pub multi_echo_probability: f64,
    pub histogram_noise: f64,

    /// Chance of one or more random defects on a `Normal` product
    pub defect_probability: f64,
    pub irregular_asymmetry: f64,
}

impl Default for DepthSimConfig {
    fn default() -> Self {
        Self {
            resolution: 8,
            height_sensor_mm: 300.0,
            pitch_x_mm: None,
            pitch_y_mm: None,
            product_length_mm: 180.0,
            product_width_mm: 120.0,
            product_thickness_mm: 25.0,
            margin_pct: 0.15,
            rotation_deg: 0.0,
            container: None,
            texture_amplitude_mm: 0.6,
            texture_sigma_zones: 1.0,
            ripple_amplitude_mm: 0.3,
            ripple_period_mm: 40.0,
            product_reflectance_mean_pct: 42.0,
            product_reflectance_std_pct: 3.0,
            background_reflectance_mean_pct: 35.0,
            background_reflectance_std_pct: 2.0,
            slope_reflectance_loss: 8.0,
            amplitude_gain: 3.0,
            amplitude_noise: 15.0,
            ambient_mean: 12.0,
            ambient_std: 2.0,
            histograms: true,
            n_bins: 64,
            bin_width_mm: 6.0,
            base_peak_sigma_bins: 1.2,
            multi_echo_probability: 0.05,
            histogram_noise: 0.02,
            defect_probability: 0.0,
            irregular_asymmetry: 0.25,
        }
    }
}

impl DepthSimConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !SUPPORTED_RESOLUTIONS.contains(&self.resolution) {
            return Err(ConfigError::UnsupportedResolution(self.resolution, SUPPORTED_RESOLUTIONS));
        }
        require_positive("height_sensor_mm", self.height_sensor_mm)?;
        require_positive("product_length_mm", self.product_length_mm)?;
        require_positive("product_width_mm", self.product_width_mm)?;
        require_positive("product_thickness_mm", self.product_thickness_mm)?;
        if let Some(p) = self.pitch_x_mm { require_positive("pitch_x_mm", p)?; }
        if let Some(p) = self.pitch_y_mm { require_positive("pitch_y_mm", p)?; }
        if !(0.0..0.5).contains(&self.margin_pct) {
            return Err(ConfigError::threshold("margin_pct", "must be in [0, 0.5)"));
        }
        require_unit("multi_echo_probability", self.multi_echo_probability)?;
        require_unit("defect_probability", self.defect_probability)?;
        if let Some(c) = &self.container {
            require_positive("container.length_mm", c.length_mm)?;
            require_positive("container.width_mm", c.width_mm)?;
            if c.height_mm < 0.0 {
                return Err(ConfigError::dimension("container.height_mm", c.height_mm));
            }
            if self.product_length_mm > c.length_mm || self.product_width_mm > c.width_mm {
                return Err(ConfigError::ProductExceedsContainer {
                    product_mm: [self.product_length_mm, self.product_width_mm],
                    container_mm: [c.length_mm, c.width_mm],
                });
            }
        }
        let top = self.product_thickness_mm
            + self.container.as_ref().map(|c| c.height_mm).unwrap_or(0.0);
        if top >= self.height_sensor_mm {
            return Err(ConfigError::dimension("product_thickness_mm", self.product_thickness_mm));
        }
        if self.histograms {
            if self.n_bins < 16 {
                return Err(ConfigError::threshold("n_bins", "histograms need at least 16 bins"));
            }
            require_positive("bin_width_mm", self.bin_width_mm)?;
        }
        Ok(())
    }

    /// Pitch so that the outer footprint fills the grid minus the margins.
    fn derived_pitch(&self) -> (f64, f64) {
        let (len, wid) = match &self.container {
            Some(c) => (c.length_mm, c.width_mm),
            None => (self.product_length_mm, self.product_width_mm),
        };
        let usable = self.resolution as f64 * (1.0 - 2.0 * self.margin_pct);
        (
            self.pitch_x_mm.unwrap_or(len / usable),
            self.pitch_y_mm.unwrap_or(wid / usable),
        )
    }
}

// ── Product variants & defects ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductVariant {
    #[default]
    Normal,
    /// Asymmetric footprint, rougher surface
    Irregular,
    /// Always carries at least one random defect
    Defective,
}

/// Injected physical defect. Centres are grid fractions (`0.0..=1.0`, x then y).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DefectSpec {
    /// Local depression left by an embedded body
    ForeignBody { center: [f64; 2], radius_mm: f64, depth_mm: f64 },
    /// Signed height change: negative = dent, positive = bump
    Deformation { center: [f64; 2], radius_mm: f64, amplitude_mm: f64 },
    /// Random upward jitter on the product boundary (severity 0–1)
    EdgeDamage { severity: f64 },
    /// Reflectance change only, height untouched
    OpticalInconsistency { center: [f64; 2], radius_mm: f64, reflectance_delta_pct: f64 },
}

/// Linear falloff weight: 1 at the centre, 0 at `radius`.
fn falloff(dist: f64, radius: f64) -> f64 {
    if radius <= 0.0 || dist >= radius { 0.0 } else { 1.0 - dist / radius }
}

// ── Zone geometry ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    Product,
    Container,
    Background,
}

/// Physical centre of a zone relative to the grid centre, mm.
fn zone_center(row: usize, col: usize, n: usize, px: f64, py: f64) -> (f64, f64) {
    let half = (n as f64 - 1.0) / 2.0;
    ((col as f64 - half) * px, (row as f64 - half) * py)
}

// ── Simulator ─────────────────────────────────────────────────────────────────

pub struct DepthSimulator {
    cfg: DepthSimConfig,
    pitch_x: f64,
    pitch_y: f64,
    rng: StdRng,
}

impl DepthSimulator {
    pub fn new(cfg: DepthSimConfig, seed: Option<u64>) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let (pitch_x, pitch_y) = cfg.derived_pitch();
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Ok(Self { cfg, pitch_x, pitch_y, rng })
    }

    /// Produce one frame. `defects` are applied on top of any random ones
    /// the variant calls for.
    pub fn generate(&mut self, variant: ProductVariant, defects: &[DefectSpec]) -> RawDepthFrame {
        let n = self.cfg.resolution;
        let (mut height, regions) = self.base_surface(variant);

        let mut all_defects: Vec<DefectSpec> = defects.to_vec();
        let random_defects = match variant {
            ProductVariant::Defective => true,
            _ => self.rng.gen_bool(self.cfg.defect_probability),
        };
        if random_defects {
            all_defects.extend(self.random_defects());
        }

        let mut reflectance_delta = vec![0.0; n * n];
        for d in &all_defects {
            self.apply_defect(d, &mut height, &regions, &mut reflectance_delta);
        }

        let sensor_h = self.cfg.height_sensor_mm;
        let distance: Vec<f64> = height.iter().map(|h| (sensor_h - h).clamp(0.0, sensor_h)).collect();
        let reflectance = self.reflectance_grid(&height, &regions, &reflectance_delta);
        let amplitude = self.amplitude_grid(&distance, &reflectance);
        let ambient = self.ambient_grid(n * n);
        let histograms = if self.cfg.histograms {
            Some(self.histogram_grid(&distance, &reflectance, &amplitude))
        } else {
            None
        };

        RawDepthFrame {
            resolution: n,
            height_sensor_mm: sensor_h,
            pitch_x_mm: self.pitch_x,
            pitch_y_mm: self.pitch_y,
            distance_mm: distance,
            reflectance_pct: reflectance,
            amplitude,
            ambient,
            histograms,
            bin_width_mm: self.cfg.bin_width_mm,
        }
    }

    /// Half-ellipsoid + texture + ripple, and the region label of each zone.
    fn base_surface(&mut self, variant: ProductVariant) -> (Vec<f64>, Vec<Region>) {
        let n = self.cfg.resolution;
        let a = self.cfg.product_length_mm / 2.0;
        let b = self.cfg.product_width_mm / 2.0;
        let c = self.cfg.product_thickness_mm;
        let theta = self.cfg.rotation_deg.to_radians();
        let (sin_t, cos_t) = theta.sin_cos();
        let asym = if variant == ProductVariant::Irregular { self.cfg.irregular_asymmetry } else { 0.0 };
        let floor = self.cfg.container.as_ref().map(|k| k.height_mm).unwrap_or(0.0);
        let outside = if self.cfg.container.is_some() { Region::Container } else { Region::Background };

        let mut height = vec![floor; n * n];
        let mut regions = vec![outside; n * n];
        for row in 0..n {
            for col in 0..n {
                let (x, y) = zone_center(row, col, n, self.pitch_x, self.pitch_y);
                let u = x * cos_t + y * sin_t;
                let v = -x * sin_t + y * cos_t;
                // Irregular products bulge on one side of the long axis
                let a_eff = if u >= 0.0 { a * (1.0 + asym) } else { a * (1.0 - asym) };
                let r2 = (u / a_eff).powi(2) + (v / b).powi(2);
                if r2 < 1.0 {
                    let i = row * n + col;
                    height[i] = floor + c * (1.0 - r2).sqrt();
                    regions[i] = Region::Product;
                }
            }
        }

        let tex_amp = match variant {
            ProductVariant::Irregular => self.cfg.texture_amplitude_mm * 2.5,
            _ => self.cfg.texture_amplitude_mm,
        };
        if tex_amp > 0.0 {
            let raw: Vec<f64> = (0..n * n).map(|_| gaussian(&mut self.rng, 0.0, tex_amp)).collect();
            let texture = numeric::gaussian_smooth(&raw, n, self.cfg.texture_sigma_zones);
            for (i, t) in texture.iter().enumerate() {
                if regions[i] == Region::Product {
                    height[i] += t;
                }
            }
        }

        if self.cfg.ripple_amplitude_mm > 0.0 && self.cfg.ripple_period_mm > 0.0 {
            let k = TAU / self.cfg.ripple_period_mm;
            for row in 0..n {
                for col in 0..n {
                    let i = row * n + col;
                    if regions[i] != Region::Product { continue; }
                    let (x, y) = zone_center(row, col, n, self.pitch_x, self.pitch_y);
                    height[i] += self.cfg.ripple_amplitude_mm * (k * x).sin() * (k * y).cos();
                }
            }
        }

        for (h, r) in height.iter_mut().zip(&regions) {
            if *r == Region::Product {
                *h = h.max(floor);
            }
        }
        (height, regions)
    }

    /// One to three defects placed inside the product footprint.
    fn random_defects(&mut self) -> Vec<DefectSpec> {
        let count = self.rng.gen_range(1..=3);
        let min_pitch = self.pitch_x.min(self.pitch_y);
        let c = self.cfg.product_thickness_mm;
        (0..count)
            .map(|_| {
                let center = [self.rng.gen_range(0.35..0.65), self.rng.gen_range(0.35..0.65)];
                let radius_mm = min_pitch * self.rng.gen_range(1.0..2.0);
                match self.rng.gen_range(0..4) {
                    0 => DefectSpec::ForeignBody { center, radius_mm, depth_mm: c * self.rng.gen_range(0.3..0.7) },
                    1 => DefectSpec::Deformation {
                        center,
                        radius_mm,
                        amplitude_mm: c * self.rng.gen_range(-0.6..0.6),
                    },
                    2 => DefectSpec::EdgeDamage { severity: self.rng.gen_range(0.3..1.0) },
                    _ => DefectSpec::OpticalInconsistency {
                        center,
                        radius_mm,
                        reflectance_delta_pct: self.rng.gen_range(-25.0..25.0),
                    },
                }
            })
            .collect()
    }

    fn apply_defect(
        &mut self,
        defect: &DefectSpec,
        height: &mut [f64],
        regions: &[Region],
        reflectance_delta: &mut [f64],
    ) {
        let n = self.cfg.resolution;
        let floor = self.cfg.container.as_ref().map(|k| k.height_mm).unwrap_or(0.0);
        let extent_x = n as f64 * self.pitch_x;
        let extent_y = n as f64 * self.pitch_y;
        let to_mm = |center: [f64; 2]| ((center[0] - 0.5) * extent_x, (center[1] - 0.5) * extent_y);

        match *defect {
            DefectSpec::ForeignBody { center, radius_mm, depth_mm } => {
                let (cx, cy) = to_mm(center);
                self.for_each_in_radius(cx, cy, radius_mm, |i, w| {
                    height[i] = (height[i] - depth_mm * w).max(0.0);
                });
            }
            DefectSpec::Deformation { center, radius_mm, amplitude_mm } => {
                let (cx, cy) = to_mm(center);
                self.for_each_in_radius(cx, cy, radius_mm, |i, w| {
                    height[i] = (height[i] + amplitude_mm * w).max(0.0);
                });
            }
            DefectSpec::EdgeDamage { severity } => {
                let jitter_max = severity.clamp(0.0, 1.0) * self.cfg.product_thickness_mm * 0.3;
                if jitter_max <= 0.0 { return; }
                for row in 0..n {
                    for col in 0..n {
                        let i = row * n + col;
                        if regions[i] != Region::Product { continue; }
                        let on_edge = neighbours(row, col, n).any(|j| regions[j] != Region::Product);
                        if on_edge {
                            height[i] = height[i].max(floor) + self.rng.gen_range(0.0..jitter_max);
                        }
                    }
                }
            }
            DefectSpec::OpticalInconsistency { center, radius_mm, reflectance_delta_pct } => {
                let (cx, cy) = to_mm(center);
                self.for_each_in_radius(cx, cy, radius_mm, |i, w| {
                    reflectance_delta[i] += reflectance_delta_pct * w;
                });
            }
        }
    }

    fn for_each_in_radius<F: FnMut(usize, f64)>(&self, cx: f64, cy: f64, radius: f64, mut f: F) {
        let n = self.cfg.resolution;
        for row in 0..n {
            for col in 0..n {
                let (x, y) = zone_center(row, col, n, self.pitch_x, self.pitch_y);
                let w = falloff(((x - cx).powi(2) + (y - cy).powi(2)).sqrt(), radius);
                if w > 0.0 {
                    f(row * n + col, w);
                }
            }
        }
    }

    fn reflectance_grid(&mut self, height: &[f64], regions: &[Region], delta: &[f64]) -> Vec<f64> {
        let n = self.cfg.resolution;
        let slope = numeric::gradient_magnitude(height, n, self.pitch_x, self.pitch_y);
        let product = (self.cfg.product_reflectance_mean_pct, self.cfg.product_reflectance_std_pct);
        let background = (self.cfg.background_reflectance_mean_pct, self.cfg.background_reflectance_std_pct);
        let container = self
            .cfg
            .container
            .as_ref()
            .map(|c| (c.reflectance_mean_pct, c.reflectance_std_pct))
            .unwrap_or(background);

        (0..n * n)
            .map(|i| {
                let base = match regions[i] {
                    Region::Product => {
                        gaussian(&mut self.rng, product.0, product.1)
                            - self.cfg.slope_reflectance_loss * slope[i]
                    }
                    Region::Container => gaussian(&mut self.rng, container.0, container.1),
                    Region::Background => gaussian(&mut self.rng, background.0, background.1),
                };
                (base + delta[i]).clamp(0.0, 100.0)
            })
            .collect()
    }

    fn amplitude_grid(&mut self, distance: &[f64], reflectance: &[f64]) -> Vec<f64> {
        let noise = self.cfg.amplitude_noise;
        distance
            .iter()
            .zip(reflectance)
            .map(|(d, r)| {
                let d_m = d.max(1.0) / 1000.0;
                let a = self.cfg.amplitude_gain * r / (d_m * d_m) + gaussian(&mut self.rng, 0.0, noise);
                a.clamp(0.0, AMPLITUDE_MAX)
            })
            .collect()
    }

    fn ambient_grid(&mut self, len: usize) -> Vec<f64> {
        let (mean, std) = (self.cfg.ambient_mean, self.cfg.ambient_std);
        (0..len).map(|_| gaussian(&mut self.rng, mean, std).max(0.0)).collect()
    }

    fn histogram_grid(&mut self, distance: &[f64], reflectance: &[f64], amplitude: &[f64]) -> Vec<Vec<f64>> {
        let n_bins = self.cfg.n_bins;
        distance
            .iter()
            .zip(reflectance)
            .zip(amplitude)
            .map(|((d, r), amp)| {
                let refl = r.max(1.0);
                // Darker surfaces: wider, noisier echo
                let sigma = self.cfg.base_peak_sigma_bins * (1.0 + (100.0 - refl) / 50.0);
                let center = d / self.cfg.bin_width_mm;
                let peak = amp.max(50.0);
                let noise_level = self.cfg.histogram_noise * peak * (1.0 + (100.0 - refl) / 100.0);

                let secondary = if self.rng.gen_bool(self.cfg.multi_echo_probability) {
                    let offset = self.rng.gen_range(3.0..8.0);
                    let rel = self.rng.gen_range(0.25..0.55);
                    Some((center + offset, peak * rel))
                } else {
                    None
                };

                (0..n_bins)
                    .map(|bin| {
                        let x = bin as f64 + 0.5;
                        let mut v = peak * (-(x - center).powi(2) / (2.0 * sigma * sigma)).exp();
                        if let Some((c2, h2)) = secondary {
                            v += h2 * (-(x - c2).powi(2) / (2.0 * sigma * sigma)).exp();
                        }
                        v += noise_level * gaussian(&mut self.rng, 0.0, 1.0).abs();
                        v.max(0.0)
                    })
                    .collect()
            })
            .collect()
    }
}

/// One draw from N(mean, std²).
pub(crate) fn gaussian<R: Rng + ?Sized>(rng: &mut R, mean: f64, std: f64) -> f64 {
    let z: f64 = rng.sample(StandardNormal);
    mean + std.abs() * z
}

fn neighbours(row: usize, col: usize, n: usize) -> impl Iterator<Item = usize> {
    let r = row as i64;
    let c = col as i64;
    [(r - 1, c), (r + 1, c), (r, c - 1), (r, c + 1)]
        .into_iter()
        .filter(move |(rr, cc)| *rr >= 0 && *cc >= 0 && *rr < n as i64 && *cc < n as i64)
        .map(move |(rr, cc)| rr as usize * n + cc as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sim(cfg: DepthSimConfig) -> DepthSimulator {
        DepthSimulator::new(cfg, Some(7)).unwrap()
    }

    #[test]
    fn rejects_unsupported_resolution() {
        let cfg = DepthSimConfig { resolution: 12, ..Default::default() };
        assert!(matches!(
            DepthSimulator::new(cfg, Some(1)),
            Err(ConfigError::UnsupportedResolution(12, _))
        ));
    }

    #[test]
    fn rejects_degenerate_product() {
        let cfg = DepthSimConfig { product_width_mm: 0.0, ..Default::default() };
        assert!(matches!(DepthSimulator::new(cfg, Some(1)), Err(ConfigError::InvalidDimension { .. })));
    }

    #[test]
    fn rejects_product_larger_than_container() {
        let cfg = DepthSimConfig {
            container: Some(ContainerConfig {
                length_mm: 150.0,
                width_mm: 150.0,
                height_mm: 4.0,
                reflectance_mean_pct: 70.0,
                reflectance_std_pct: 2.0,
            }),
            ..Default::default()
        };
        assert!(matches!(
            DepthSimulator::new(cfg, Some(1)),
            Err(ConfigError::ProductExceedsContainer { .. })
        ));
    }

    #[test]
    fn product_is_closer_than_background() {
        let mut s = sim(DepthSimConfig { histograms: false, ..Default::default() });
        let f = s.generate(ProductVariant::Normal, &[]);
        let n = f.resolution;
        let centre = f.distance_mm[f.index(n / 2, n / 2)];
        let corner = f.distance_mm[f.index(0, 0)];
        assert!(centre < corner - 15.0, "centre {centre} corner {corner}");
        assert!((corner - f.height_sensor_mm).abs() < 1e-9);
        assert!(f.histograms.is_none());
    }

    #[test]
    fn container_mode_fills_outside_with_tray_height() {
        let mut s = sim(DepthSimConfig {
            container: Some(ContainerConfig {
                length_mm: 240.0,
                width_mm: 180.0,
                height_mm: 6.0,
                reflectance_mean_pct: 80.0,
                reflectance_std_pct: 1.0,
            }),
            histograms: false,
            ..Default::default()
        });
        let f = s.generate(ProductVariant::Normal, &[]);
        let corner = f.index(0, 0);
        assert!((f.distance_mm[corner] - (f.height_sensor_mm - 6.0)).abs() < 1e-9);
        assert!(f.reflectance_pct[corner] > 70.0);
    }

    #[test]
    fn foreign_body_depresses_surface() {
        let cfg = DepthSimConfig { histograms: false, texture_amplitude_mm: 0.0, ripple_amplitude_mm: 0.0, ..Default::default() };
        let mut clean = sim(cfg.clone());
        let mut dirty = sim(cfg);
        let a = clean.generate(ProductVariant::Normal, &[]);
        let b = dirty.generate(
            ProductVariant::Normal,
            &[DefectSpec::ForeignBody { center: [0.5, 0.5], radius_mm: 40.0, depth_mm: 10.0 }],
        );
        let mid = a.index(4, 4);
        assert!(b.distance_mm[mid] > a.distance_mm[mid] + 2.0);
    }

    #[test]
    fn histogram_peak_tracks_distance() {
        let mut s = sim(DepthSimConfig { multi_echo_probability: 0.0, ..Default::default() });
        let f = s.generate(ProductVariant::Normal, &[]);
        let hists = f.histograms.as_ref().unwrap();
        let i = f.index(4, 4);
        let argmax = hists[i]
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(k, _)| k)
            .unwrap();
        let expected = (f.distance_mm[i] / f.bin_width_mm) as usize;
        assert!((argmax as i64 - expected as i64).abs() <= 1);
        assert!(hists.iter().flatten().all(|v| *v >= 0.0));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]
        #[test]
        fn frames_stay_in_physical_range(
            seed in any::<u64>(),
            res_idx in 0usize..3,
            thickness in 5.0f64..80.0,
            rotation in 0.0f64..180.0,
            variant_idx in 0usize..3,
            margin in 0.0f64..0.3,
        ) {
            let cfg = DepthSimConfig {
                resolution: SUPPORTED_RESOLUTIONS[res_idx],
                product_thickness_mm: thickness,
                rotation_deg: rotation,
                margin_pct: margin,
                n_bins: 32,
                ..Default::default()
            };
            let variant = [ProductVariant::Normal, ProductVariant::Irregular, ProductVariant::Defective][variant_idx];
            let mut s = DepthSimulator::new(cfg, Some(seed)).unwrap();
            let f = s.generate(variant, &[DefectSpec::Deformation { center: [0.5, 0.5], radius_mm: 30.0, amplitude_mm: 200.0 }]);
            prop_assert!(f.distance_mm.iter().all(|d| *d >= 0.0 && *d <= f.height_sensor_mm));
            prop_assert!(f.reflectance_pct.iter().all(|r| (0.0..=100.0).contains(r)));
            prop_assert!(f.amplitude.iter().all(|a| (0.0..=AMPLITUDE_MAX).contains(a)));
            prop_assert!(f.ambient.iter().all(|a| *a >= 0.0));
        }
    }
}
