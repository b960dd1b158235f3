//! # grading-types
//!
//! Shared structures for the optical inspection line.
//!
//! These types are used by:
//! - `inspection-sim`: producing raw frames, analyses and fused samples on the device
//! - `backend-rust`: validating ingested samples and fanning them out to dashboards
//!
//! ## Conventions
//!
//! - Depth grids are row-major, `resolution × resolution`, index = `row * resolution + col`
//! - Distances and heights are millimetres; volumes are mm³
//! - Scores and indices are unit-interval floats (`0.0..=1.0`)
//! - Grades order best-to-worst: `A+`, `A`, `B`, `C`, `REJECT`

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Grade ─────────────────────────────────────────────────────────────────────

/// Ordinal quality classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Grade {
    #[serde(rename = "A+")]
    APlus,
    #[serde(rename = "A")]
    A,
    #[serde(rename = "B")]
    B,
    #[serde(rename = "C")]
    C,
    #[serde(rename = "REJECT")]
    Reject,
}

impl Grade {
    pub const ALL: [Grade; 5] = [Grade::APlus, Grade::A, Grade::B, Grade::C, Grade::Reject];

    /// 0 = best (A+), 4 = worst (REJECT)
    pub fn rank(self) -> u8 {
        match self {
            Self::APlus => 0,
            Self::A => 1,
            Self::B => 2,
            Self::C => 3,
            Self::Reject => 4,
        }
    }

    /// True when `self` is as good as or better than `min`.
    pub fn is_at_least(self, min: Grade) -> bool {
        self.rank() <= min.rank()
    }

    /// The worse of two grades.
    pub fn worst(a: Grade, b: Grade) -> Grade {
        if a.rank() >= b.rank() { a } else { b }
    }

    pub fn is_reject(self) -> bool {
        self == Self::Reject
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::APlus => "A+",
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
            Self::Reject => "REJECT",
        }
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Grade {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A+" | "APLUS" => Ok(Self::APlus),
            "A" => Ok(Self::A),
            "B" => Ok(Self::B),
            "C" => Ok(Self::C),
            "REJECT" => Ok(Self::Reject),
            other => Err(format!("unknown grade: {other}")),
        }
    }
}

// ── Raw Frames ────────────────────────────────────────────────────────────────

/// Zone coordinate in the depth grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZonePos {
    pub row: usize,
    pub col: usize,
}

/// One depth (time-of-flight) acquisition.
///
/// Invariant: every `distance_mm` lies in `[0, height_sensor_mm]`,
/// histograms (when present) are non-negative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDepthFrame {
    /// Grid side length (zones per row)
    pub resolution: usize,
    /// Sensor stand-off above the belt, mm
    pub height_sensor_mm: f64,
    /// Physical zone pitch along X (columns), mm
    pub pitch_x_mm: f64,
    /// Physical zone pitch along Y (rows), mm
    pub pitch_y_mm: f64,
    pub distance_mm: Vec<f64>,
    pub reflectance_pct: Vec<f64>,
    /// Return signal amplitude, sensor range 0–4095
    pub amplitude: Vec<f64>,
    pub ambient: Vec<f64>,
    /// Per-zone echo histograms (`n_bins` each), if requested
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub histograms: Option<Vec<Vec<f64>>>,
    /// Distance covered by one histogram bin, mm
    #[serde(default)]
    pub bin_width_mm: f64,
}

impl RawDepthFrame {
    pub fn zone_count(&self) -> usize {
        self.resolution * self.resolution
    }

    pub fn index(&self, row: usize, col: usize) -> usize {
        row * self.resolution + col
    }

    /// Height above the belt for every zone (`sensor_height − distance`).
    pub fn height_field(&self) -> Vec<f64> {
        self.distance_mm
            .iter()
            .map(|d| (self.height_sensor_mm - d).max(0.0))
            .collect()
    }
}

/// Multi-channel spectral reading (violet → near-infrared plus broadband).
/// Channel names follow their nominal centre wavelength in nm.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SpectralChannels {
    pub violet_415: f64,
    pub indigo_445: f64,
    pub blue_480: f64,
    pub cyan_515: f64,
    pub green_555: f64,
    pub yellow_590: f64,
    pub orange_630: f64,
    pub red_680: f64,
    pub clear: f64,
    pub nir_910: f64,
}

impl SpectralChannels {
    pub fn values(&self) -> [f64; 10] {
        [
            self.violet_415, self.indigo_445, self.blue_480, self.cyan_515, self.green_555,
            self.yellow_590, self.orange_630, self.red_680, self.clear, self.nir_910,
        ]
    }

    pub fn all_non_negative(&self) -> bool {
        self.values().iter().all(|v| v.is_finite() && *v >= 0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSpectralFrame {
    pub channels: SpectralChannels,
    /// Integration time used by the sensor, ms
    pub integration_ms: f64,
    /// Analog gain multiplier
    pub gain: f64,
}

// ── Defects ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefectKind {
    /// Something closer to the sensor than the product surface
    ForeignBody,
    /// Surface farther than expected (dent, tear, missing material)
    SurfaceDeformation,
    /// Spectral signature of oxidised pigment
    Oxidation,
    /// Low freshness colouring
    Discoloration,
}

impl DefectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ForeignBody => "foreign_body",
            Self::SurfaceDeformation => "surface_deformation",
            Self::Oxidation => "oxidation",
            Self::Discoloration => "discoloration",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Defect {
    /// Zone where it was detected; `None` for whole-sample spectral defects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<ZonePos>,
    pub kind: DefectKind,
    /// 0.0 (cosmetic) – 1.0 (critical)
    pub severity: f64,
}

// ── Analyses ──────────────────────────────────────────────────────────────────

/// Per-zone maps derived from the echo histograms (row-major).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneMaps {
    pub texture: Vec<f64>,
    pub density: Vec<f64>,
    pub roughness: Vec<f64>,
    pub signal_quality: Vec<f64>,
    pub multi_peak_count: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub mean_texture: f64,
    pub mean_density: f64,
    pub mean_roughness: f64,
    pub mean_signal_quality: f64,
    /// Zones showing more than one echo peak
    pub multi_peak_zones: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectanceStats {
    pub mean_pct: f64,
    pub std_pct: f64,
    pub low_fraction: f64,
    pub high_fraction: f64,
    /// Zones whose 3×3 neighbourhood deviation stands out
    pub anomalies: Vec<ZonePos>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmplitudeStats {
    pub mean: f64,
    pub outlier_fraction: f64,
    pub consistent: bool,
}

/// Cross-validated volume estimates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeEstimates {
    pub trapezoid_mm3: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simpson_mm3: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spline_mm3: Option<f64>,
    /// Largest relative disagreement with the trapezoid value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_relative_spread: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthAnalysis {
    /// Canonical (trapezoidal) volume, mm³
    pub volume_mm3: f64,
    pub volumes: VolumeEstimates,
    pub avg_height_mm: f64,
    pub max_height_mm: f64,
    pub min_height_mm: f64,
    /// 1 / (1 + mean gradient magnitude); 1.0 = perfectly flat
    pub surface_uniformity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub histogram: Option<HistogramSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone_maps: Option<ZoneMaps>,
    pub reflectance: ReflectanceStats,
    pub amplitude: AmplitudeStats,
    pub defects: Vec<Defect>,
    pub quality_score: f64,
    pub grade: Grade,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpectralAnalysis {
    pub freshness_index: f64,
    pub fat_quality_index: f64,
    pub oxidation_index: f64,
    pub quality_score: f64,
    pub grade: Grade,
    pub defects: Vec<Defect>,
}

// ── Business Metrics ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThicknessClass {
    Extra,
    Premier,
    Deuxieme,
    OutOfSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThicknessMetrics {
    pub mean_mm: f64,
    pub std_mm: f64,
    pub class: ThicknessClass,
    pub irregular: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillMetrics {
    pub level_pct: f64,
    pub target_pct: f64,
    pub within_tolerance: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityClass {
    Capable,
    Acceptable,
    Incapable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessCapability {
    pub cp: f64,
    pub cpk: f64,
    pub class: CapabilityClass,
    /// Rolling history length the indices were computed from
    pub samples: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColorMetrics {
    pub l_star: f64,
    pub a_star: f64,
    pub b_star: f64,
    pub delta_e: f64,
    /// 0–1, 1 = on reference colour
    pub premium_score: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefectFlags {
    pub hematoma: bool,
    pub bile_trace: bool,
    pub oxidation: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceFlags {
    pub is_compliant: bool,
    pub is_downgraded: bool,
    pub is_rejected: bool,
}

impl ComplianceFlags {
    pub fn from_grade(grade: Grade) -> Self {
        Self {
            is_compliant: matches!(grade, Grade::APlus | Grade::A | Grade::B),
            is_downgraded: grade == Grade::C,
            is_rejected: grade == Grade::Reject,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessMetrics {
    pub thickness: ThicknessMetrics,
    pub fill: FillMetrics,
    /// 0–100
    pub dimensional_conformity: f64,
    /// `None` until the rolling thickness history is long enough
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<ProcessCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<ColorMetrics>,
    pub defect_flags: DefectFlags,
    pub compliance: ComplianceFlags,
}

/// Output of the fusion step. Never mutated after transmission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionResult {
    pub final_score: f64,
    pub final_grade: Grade,
    pub is_compliant: bool,
    pub tof_score: f64,
    pub spectral_score: f64,
    /// Weight actually applied to the spectral score (0 when absent)
    pub spectral_contribution: f64,
    pub combined_defects: Vec<Defect>,
    pub defect_count: usize,
    pub business_metrics: BusinessMetrics,
}

// ── Device ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceState {
    Booting,
    WifiConnecting,
    WifiConnected,
    BackendConnecting,
    Online,
    Offline,
    Error,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Booting => "BOOTING",
            Self::WifiConnecting => "WIFI_CONNECTING",
            Self::WifiConnected => "WIFI_CONNECTED",
            Self::BackendConnecting => "BACKEND_CONNECTING",
            Self::Online => "ONLINE",
            Self::Offline => "OFFLINE",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Bus addresses of the two sensors.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SensorAddresses {
    pub depth: u8,
    pub spectral: u8,
}

/// One-time identification sent on connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub mac_address: String,
    pub location: String,
    pub site_code: String,
    pub firmware_version: String,
    pub sensor_addresses: SensorAddresses,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthBlock {
    pub raw: RawDepthFrame,
    pub analysis: DepthAnalysis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpectralBlock {
    pub raw: RawSpectralFrame,
    pub analysis: SpectralAnalysis,
}

/// The fused sample streamed device → ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleMessage {
    pub sample_id: String,
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub depth: DepthBlock,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spectral: Option<SpectralBlock>,
    pub fusion: FusionResult,
}

/// Periodic liveness report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub device_id: String,
    pub state: DeviceState,
    pub uptime_s: u64,
    pub samples_sent: u64,
    pub samples_buffered: u64,
    pub samples_dropped: u64,
    pub samples_rejected: u64,
    pub bus_errors: u64,
    pub buffer_depth: usize,
}

// ── Device ↔ Ingestion Messages ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceMessage {
    Identify { identity: DeviceIdentity },
    Sample(Box<SampleMessage>),
    Heartbeat(Heartbeat),
    /// Terminal device error, sent best-effort before the session stops
    Fault { device_id: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IngestReply {
    Welcome { device_id: String },
    Ack { sample_id: String },
    Nack { sample_id: String, reason: String },
}

// ── Ingestion ↔ Dashboard Messages ────────────────────────────────────────────

/// A sample as seen by dashboards, enriched with the device's site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_code: Option<String>,
    pub received_at: DateTime<Utc>,
    pub sample: SampleMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    RejectedProduct,
    GradeBelowThreshold,
    ValidationFailure,
    DeviceFault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_id: Option<String>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Per-client subscription filter. Every present field must match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_grade: Option<Grade>,
}

impl ClientFilter {
    fn matches_origin(&self, device_id: &str, site_code: Option<&str>) -> bool {
        if let Some(want) = &self.device_id {
            if want != device_id {
                return false;
            }
        }
        if let Some(want) = &self.site_code {
            if site_code != Some(want.as_str()) {
                return false;
            }
        }
        true
    }

    pub fn matches_record(&self, record: &SensorRecord) -> bool {
        if !self.matches_origin(&record.sample.device_id, record.site_code.as_deref()) {
            return false;
        }
        match self.min_grade {
            Some(min) => record.sample.fusion.final_grade.is_at_least(min),
            None => true,
        }
    }

    /// Alerts ignore `min_grade`; they are routed by origin only.
    pub fn matches_alert(&self, alert: &Alert) -> bool {
        self.matches_origin(&alert.device_id, alert.site_code.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DashboardMessage {
    SensorUpdate { record: Box<SensorRecord> },
    Alert { alert: Alert },
    LatestSample { record: Option<Box<SensorRecord>> },
    Ping,
    Pong,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DashboardCommand {
    Heartbeat,
    Ping,
    Pong,
    Subscribe {
        #[serde(default)]
        filters: ClientFilter,
    },
    Unsubscribe,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn grade_strategy() -> impl Strategy<Value = Grade> {
        prop::sample::select(Grade::ALL.to_vec())
    }

    #[test]
    fn grade_serializes_with_wire_names() {
        assert_eq!(serde_json::to_string(&Grade::APlus).unwrap(), "\"A+\"");
        assert_eq!(serde_json::to_string(&Grade::Reject).unwrap(), "\"REJECT\"");
        let g: Grade = serde_json::from_str("\"B\"").unwrap();
        assert_eq!(g, Grade::B);
    }

    #[test]
    fn grade_ordering_best_to_worst() {
        assert!(Grade::APlus.is_at_least(Grade::A));
        assert!(Grade::B.is_at_least(Grade::B));
        assert!(!Grade::C.is_at_least(Grade::B));
        assert_eq!(Grade::worst(Grade::A, Grade::Reject), Grade::Reject);
        assert_eq!("a+".parse::<Grade>().unwrap(), Grade::APlus);
    }

    #[test]
    fn compliance_follows_grade() {
        assert!(ComplianceFlags::from_grade(Grade::B).is_compliant);
        let c = ComplianceFlags::from_grade(Grade::C);
        assert!(c.is_downgraded && !c.is_compliant && !c.is_rejected);
        assert!(ComplianceFlags::from_grade(Grade::Reject).is_rejected);
    }

    #[test]
    fn dashboard_command_parses_subscribe() {
        let raw = r#"{"type":"subscribe","filters":{"site_code":"LYON-2","min_grade":"A"}}"#;
        let cmd: DashboardCommand = serde_json::from_str(raw).unwrap();
        match cmd {
            DashboardCommand::Subscribe { filters } => {
                assert_eq!(filters.site_code.as_deref(), Some("LYON-2"));
                assert_eq!(filters.min_grade, Some(Grade::A));
                assert!(filters.device_id.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
        let hb: DashboardCommand = serde_json::from_str(r#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(hb, DashboardCommand::Heartbeat);
    }

    #[test]
    fn alert_filter_ignores_min_grade() {
        let filter = ClientFilter {
            device_id: Some("dev-1".into()),
            site_code: None,
            min_grade: Some(Grade::APlus),
        };
        let alert = Alert {
            id: "a1".into(),
            kind: AlertKind::RejectedProduct,
            severity: AlertSeverity::Critical,
            device_id: "dev-1".into(),
            site_code: None,
            sample_id: None,
            message: "rejected".into(),
            timestamp: Utc::now(),
        };
        assert!(filter.matches_alert(&alert));
        let other = Alert { device_id: "dev-2".into(), ..alert };
        assert!(!filter.matches_alert(&other));
    }

    proptest! {
        #[test]
        fn min_grade_comparison_is_ordinal(result in grade_strategy(), min in grade_strategy()) {
            let passes = result.is_at_least(min);
            prop_assert_eq!(passes, result.rank() <= min.rank());
            // a strictly better minimum never admits a worse result
            if min.rank() < result.rank() {
                prop_assert!(!passes);
            }
        }
    }
}
