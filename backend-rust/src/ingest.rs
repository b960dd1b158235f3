//! # ingest
//!
//! Device ingestion: consumes the `/device` WebSocket stream of each
//! inspection device, validates every sample and fans accepted samples out
//! to dashboards.
//!
//! ## Protocol
//!   1. Device connects and must send `identify` first (else the socket closes)
//!   2. Backend replies `welcome{device_id}`
//!   3. Each `sample` is validated and answered with `ack` or `nack{reason}`
//!   4. `heartbeat` updates the device registry, `fault` raises a critical alert
//!
//! ## Alerts
//! - `REJECTED_PRODUCT`      final grade REJECT
//! - `GRADE_BELOW_THRESHOLD` final grade worse than `ALERT_MIN_GRADE`
//! - `VALIDATION_FAILURE`    sample nacked
//! - `DEVICE_FAULT`          device entered its terminal error state
//!
//! A bad sample never affects other in-flight samples or the connection.

use chrono::{DateTime, Utc};
use grading_types::{
    Alert, AlertKind, AlertSeverity, ComplianceFlags, DeviceIdentity, DeviceMessage, DeviceState, IngestReply,
    SampleMessage, SensorRecord,
};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::state::{DeviceRecord, SharedState};

// ── Validation ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("{0} is empty")]
    EmptyId(&'static str),

    #[error("sample belongs to `{got}`, connection identified as `{expected}`")]
    DeviceMismatch { expected: String, got: String },

    #[error("{field} = {value} is not finite")]
    NonFinite { field: &'static str, value: f64 },

    #[error("{field} = {value} outside [0, 1]")]
    OutOfUnitRange { field: &'static str, value: f64 },

    #[error("defect #{index} severity {value} outside [0, 1]")]
    Severity { index: usize, value: f64 },

    #[error("depth grid has {got} zones, resolution {resolution} needs {expected}")]
    GridShape { resolution: usize, expected: usize, got: usize },

    #[error("incoherent fusion result: {0}")]
    Incoherent(String),

    #[error("timestamp {got} is not after previous sample at {previous}")]
    TimestampRegression { previous: DateTime<Utc>, got: DateTime<Utc> },
}

fn unit(field: &'static str, value: f64) -> Result<(), ValidationError> {
    if !value.is_finite() {
        return Err(ValidationError::NonFinite { field, value });
    }
    if !(0.0..=1.0).contains(&value) {
        return Err(ValidationError::OutOfUnitRange { field, value });
    }
    Ok(())
}

fn finite(field: &'static str, value: f64) -> Result<(), ValidationError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ValidationError::NonFinite { field, value })
    }
}

/// Structural and semantic checks on one sample. `previous` is the
/// timestamp of the last accepted sample from the same device.
pub fn validate_sample(
    sample: &SampleMessage,
    expected_device: &str,
    previous: Option<DateTime<Utc>>,
) -> Result<(), ValidationError> {
    if sample.sample_id.trim().is_empty() {
        return Err(ValidationError::EmptyId("sample_id"));
    }
    if sample.device_id.trim().is_empty() {
        return Err(ValidationError::EmptyId("device_id"));
    }
    if sample.device_id != expected_device {
        return Err(ValidationError::DeviceMismatch {
            expected: expected_device.to_string(),
            got: sample.device_id.clone(),
        });
    }

    let raw = &sample.depth.raw;
    let zones = raw.resolution * raw.resolution;
    for grid in [&raw.distance_mm, &raw.reflectance_pct, &raw.amplitude] {
        if grid.len() != zones {
            return Err(ValidationError::GridShape { resolution: raw.resolution, expected: zones, got: grid.len() });
        }
    }
    if let Some(d) = raw.distance_mm.iter().find(|d| !d.is_finite()) {
        return Err(ValidationError::NonFinite { field: "depth.raw.distance_mm", value: *d });
    }

    let depth = &sample.depth.analysis;
    unit("depth.quality_score", depth.quality_score)?;
    unit("depth.surface_uniformity", depth.surface_uniformity)?;
    finite("depth.volume_mm3", depth.volume_mm3)?;

    if let Some(spectral) = &sample.spectral {
        let a = &spectral.analysis;
        unit("spectral.freshness_index", a.freshness_index)?;
        unit("spectral.fat_quality_index", a.fat_quality_index)?;
        unit("spectral.oxidation_index", a.oxidation_index)?;
        unit("spectral.quality_score", a.quality_score)?;
    }

    let fusion = &sample.fusion;
    unit("fusion.final_score", fusion.final_score)?;
    unit("fusion.tof_score", fusion.tof_score)?;
    unit("fusion.spectral_score", fusion.spectral_score)?;

    let all_defects = depth
        .defects
        .iter()
        .chain(sample.spectral.iter().flat_map(|s| s.analysis.defects.iter()))
        .chain(fusion.combined_defects.iter());
    for (index, d) in all_defects.enumerate() {
        if !(d.severity.is_finite() && (0.0..=1.0).contains(&d.severity)) {
            return Err(ValidationError::Severity { index, value: d.severity });
        }
    }

    if fusion.defect_count != fusion.combined_defects.len() {
        return Err(ValidationError::Incoherent(format!(
            "defect_count {} but {} combined defects",
            fusion.defect_count,
            fusion.combined_defects.len()
        )));
    }
    let compliance = ComplianceFlags::from_grade(fusion.final_grade);
    if fusion.is_compliant != compliance.is_compliant || fusion.business_metrics.compliance != compliance {
        return Err(ValidationError::Incoherent(format!(
            "compliance flags disagree with grade {}",
            fusion.final_grade
        )));
    }
    if sample.spectral.is_none() && fusion.spectral_contribution != 0.0 {
        return Err(ValidationError::Incoherent("spectral contribution without a spectral reading".into()));
    }
    let worst_input = match &sample.spectral {
        Some(s) => grading_types::Grade::worst(depth.grade, s.analysis.grade),
        None => depth.grade,
    };
    if worst_input.is_reject() && !fusion.final_grade.is_reject() {
        return Err(ValidationError::Incoherent(format!(
            "input grade REJECT fused to {}",
            fusion.final_grade
        )));
    }

    if let Some(previous) = previous {
        if sample.timestamp <= previous {
            return Err(ValidationError::TimestampRegression { previous, got: sample.timestamp });
        }
    }
    Ok(())
}

// ── Alerts ────────────────────────────────────────────────────────────────────

fn alert(
    kind: AlertKind,
    severity: AlertSeverity,
    device_id: &str,
    site_code: Option<String>,
    sample_id: Option<String>,
    message: String,
) -> Alert {
    Alert {
        id: Uuid::new_v4().to_string(),
        kind,
        severity,
        device_id: device_id.to_string(),
        site_code,
        sample_id,
        message,
        timestamp: Utc::now(),
    }
}

/// Alerts derived from an accepted sample.
pub fn derive_alerts(record: &SensorRecord, min_grade: grading_types::Grade) -> Vec<Alert> {
    let s = &record.sample;
    let grade = s.fusion.final_grade;
    if grade.is_reject() {
        let kinds: Vec<&str> = s.fusion.combined_defects.iter().map(|d| d.kind.as_str()).collect();
        vec![alert(
            AlertKind::RejectedProduct,
            AlertSeverity::Critical,
            &s.device_id,
            record.site_code.clone(),
            Some(s.sample_id.clone()),
            format!("product rejected (score {:.2}, defects: [{}])", s.fusion.final_score, kinds.join(", ")),
        )]
    } else if !grade.is_at_least(min_grade) {
        vec![alert(
            AlertKind::GradeBelowThreshold,
            AlertSeverity::Warning,
            &s.device_id,
            record.site_code.clone(),
            Some(s.sample_id.clone()),
            format!("grade {grade} below {min_grade}"),
        )]
    } else {
        Vec::new()
    }
}

// ── Session handling ──────────────────────────────────────────────────────────

/// Register an identified device (reconnects replace the previous record).
pub async fn register_device(state: &SharedState, identity: DeviceIdentity) -> IngestReply {
    let device_id = identity.device_id.clone();
    info!(
        "📟 Device {device_id} identified ({} @ {}, fw {})",
        identity.mac_address, identity.site_code, identity.firmware_version
    );
    let mut devices = state.devices.write().await;
    let mut record = DeviceRecord::new(identity);
    if let Some(previous) = devices.get(&device_id) {
        record.samples_accepted = previous.samples_accepted;
        record.samples_rejected = previous.samples_rejected;
    }
    devices.insert(device_id.clone(), record);
    IngestReply::Welcome { device_id }
}

pub async fn mark_disconnected(state: &SharedState, device_id: &str) {
    if let Some(d) = state.devices.write().await.get_mut(device_id) {
        d.connected = false;
        if d.state != DeviceState::Error {
            d.state = DeviceState::Offline;
        }
    }
    info!("Device {device_id} disconnected");
}

/// Validate, store, broadcast. The reply goes back to the device.
pub async fn process_sample(state: &SharedState, device_id: &str, sample: SampleMessage) -> IngestReply {
    let site_code = state.site_of(device_id).await;
    let sample_id = sample.sample_id.clone();

    // Held across validate + insert so two samples from one device cannot interleave.
    let mut latest = state.latest.write().await;
    if let Err(e) = validate_sample(&sample, device_id, latest.last_timestamp(device_id)) {
        drop(latest);
        warn!("Device {device_id}: sample {sample_id} rejected: {e}");
        if let Some(d) = state.devices.write().await.get_mut(device_id) {
            d.samples_rejected += 1;
        }
        let a = alert(
            AlertKind::ValidationFailure,
            AlertSeverity::Warning,
            device_id,
            site_code,
            Some(sample_id.clone()),
            e.to_string(),
        );
        state.broadcaster.broadcast_alert(&a).await;
        return IngestReply::Nack { sample_id, reason: e.to_string() };
    }

    let record = SensorRecord { site_code, received_at: Utc::now(), sample };
    latest.insert(record.clone());
    drop(latest);

    if let Some(d) = state.devices.write().await.get_mut(device_id) {
        d.samples_accepted += 1;
    }
    debug!(
        "Device {device_id}: {sample_id} → {} ({:.3})",
        record.sample.fusion.final_grade, record.sample.fusion.final_score
    );

    state.broadcaster.broadcast(&record).await;
    for a in derive_alerts(&record, state.config.alert_min_grade) {
        state.broadcaster.broadcast_alert(&a).await;
    }
    IngestReply::Ack { sample_id }
}

/// Handle one post-identify message. Returns the reply to send, if any.
pub async fn handle_device_message(state: &SharedState, device_id: &str, msg: DeviceMessage) -> Option<IngestReply> {
    match msg {
        DeviceMessage::Sample(sample) => Some(process_sample(state, device_id, *sample).await),
        DeviceMessage::Heartbeat(hb) => {
            debug!(
                "Device {device_id} heartbeat: state={} sent={} buffered={} dropped={}",
                hb.state, hb.samples_sent, hb.samples_buffered, hb.samples_dropped
            );
            if let Some(d) = state.devices.write().await.get_mut(device_id) {
                d.state = hb.state;
                d.last_heartbeat = Some(hb);
            }
            None
        }
        DeviceMessage::Fault { reason, .. } => {
            warn!("⛔ Device {device_id} fault: {reason}");
            if let Some(d) = state.devices.write().await.get_mut(device_id) {
                d.state = DeviceState::Error;
            }
            let site_code = state.site_of(device_id).await;
            let a = alert(AlertKind::DeviceFault, AlertSeverity::Critical, device_id, site_code, None, reason);
            state.broadcaster.broadcast_alert(&a).await;
            None
        }
        DeviceMessage::Identify { identity } => {
            warn!("Device {device_id}: ignoring repeated identify as {}", identity.device_id);
            None
        }
    }
}

/// Best-effort nack for a frame that failed to parse: if it carries a
/// `sample_id`, the device learns which record was refused.
pub fn nack_unparseable(raw: &str, error: &serde_json::Error) -> Option<IngestReply> {
    let v: serde_json::Value = serde_json::from_str(raw).ok()?;
    let sample_id = v.get("sample_id")?.as_str()?.to_string();
    Some(IngestReply::Nack { sample_id, reason: format!("malformed sample: {error}") })
}

#[cfg(test)]
pub(crate) mod fixtures {
    use chrono::Utc;
    use grading_types::*;

    pub fn sample(device_id: &str, grade: Grade, score: f64) -> SampleMessage {
        let n = 2;
        let raw = RawDepthFrame {
            resolution: n,
            height_sensor_mm: 300.0,
            pitch_x_mm: 40.0,
            pitch_y_mm: 40.0,
            distance_mm: vec![280.0; n * n],
            reflectance_pct: vec![40.0; n * n],
            amplitude: vec![1200.0; n * n],
            ambient: vec![10.0; n * n],
            histograms: None,
            bin_width_mm: 6.0,
        };
        let analysis = DepthAnalysis {
            volume_mm3: 32_000.0,
            volumes: VolumeEstimates { trapezoid_mm3: 32_000.0, simpson_mm3: None, spline_mm3: None, max_relative_spread: None },
            avg_height_mm: 20.0,
            max_height_mm: 20.0,
            min_height_mm: 20.0,
            surface_uniformity: 1.0,
            histogram: None,
            zone_maps: None,
            reflectance: ReflectanceStats { mean_pct: 40.0, std_pct: 0.0, low_fraction: 0.0, high_fraction: 0.0, anomalies: vec![] },
            amplitude: AmplitudeStats { mean: 1200.0, outlier_fraction: 0.0, consistent: true },
            defects: vec![],
            quality_score: score,
            grade,
        };
        let compliance = ComplianceFlags::from_grade(grade);
        let fusion = FusionResult {
            final_score: score,
            final_grade: grade,
            is_compliant: compliance.is_compliant,
            tof_score: score,
            spectral_score: 0.0,
            spectral_contribution: 0.0,
            combined_defects: vec![],
            defect_count: 0,
            business_metrics: BusinessMetrics {
                thickness: ThicknessMetrics { mean_mm: 20.0, std_mm: 0.0, class: ThicknessClass::Premier, irregular: false },
                fill: FillMetrics { level_pct: 100.0, target_pct: 38.0, within_tolerance: false },
                dimensional_conformity: 80.0,
                capability: None,
                color: None,
                defect_flags: DefectFlags::default(),
                compliance,
            },
        };
        SampleMessage {
            sample_id: uuid::Uuid::new_v4().to_string(),
            device_id: device_id.to_string(),
            timestamp: Utc::now(),
            depth: DepthBlock { raw, analysis },
            spectral: None,
            fusion,
        }
    }

    pub fn record(sample: SampleMessage, site: Option<&str>) -> SensorRecord {
        SensorRecord { site_code: site.map(str::to_string), received_at: Utc::now(), sample }
    }

    pub fn identity(device_id: &str, site: &str) -> DeviceIdentity {
        DeviceIdentity {
            device_id: device_id.to_string(),
            mac_address: "02:00:00:00:00:01".into(),
            location: "line-1".into(),
            site_code: site.to_string(),
            firmware_version: "0.1.0".into(),
            sensor_addresses: SensorAddresses { depth: 0x29, spectral: 0x39 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::{identity, record, sample};
    use super::*;
    use crate::state::{AppState, BackendConfig};
    use chrono::Duration;
    use grading_types::{DashboardMessage, Defect, DefectKind, Grade};

    fn config() -> BackendConfig {
        BackendConfig {
            port: 0,
            alert_min_grade: Grade::B,
            client_idle_timeout_s: 30,
            client_queue_depth: 16,
            identify_timeout_s: 10,
        }
    }

    #[test]
    fn clean_sample_validates() {
        assert_eq!(validate_sample(&sample("d", Grade::A, 0.8), "d", None), Ok(()));
    }

    #[test]
    fn out_of_range_score_is_rejected() {
        let mut s = sample("d", Grade::A, 0.8);
        s.fusion.final_score = 1.3;
        assert!(matches!(
            validate_sample(&s, "d", None),
            Err(ValidationError::OutOfUnitRange { field: "fusion.final_score", .. })
        ));
        s.fusion.final_score = f64::NAN;
        assert!(matches!(validate_sample(&s, "d", None), Err(ValidationError::NonFinite { .. })));
    }

    #[test]
    fn defect_severity_and_count_are_checked() {
        let mut s = sample("d", Grade::A, 0.8);
        s.fusion.combined_defects.push(Defect { position: None, kind: DefectKind::Oxidation, severity: 1.5 });
        s.fusion.defect_count = 1;
        assert!(matches!(validate_sample(&s, "d", None), Err(ValidationError::Severity { index: 0, .. })));

        s.fusion.combined_defects[0].severity = 0.5;
        s.fusion.defect_count = 2;
        assert!(matches!(validate_sample(&s, "d", None), Err(ValidationError::Incoherent(_))));
    }

    #[test]
    fn grade_and_compliance_must_agree() {
        let mut s = sample("d", Grade::A, 0.8);
        s.fusion.is_compliant = false;
        assert!(matches!(validate_sample(&s, "d", None), Err(ValidationError::Incoherent(_))));

        let mut s = sample("d", Grade::A, 0.8);
        s.depth.analysis.grade = Grade::Reject;
        assert!(matches!(validate_sample(&s, "d", None), Err(ValidationError::Incoherent(_))));
    }

    #[test]
    fn timestamps_must_advance_and_device_must_match() {
        let s = sample("d", Grade::A, 0.8);
        let later = s.timestamp + Duration::seconds(1);
        assert!(matches!(
            validate_sample(&s, "d", Some(later)),
            Err(ValidationError::TimestampRegression { .. })
        ));
        assert!(matches!(validate_sample(&s, "other", None), Err(ValidationError::DeviceMismatch { .. })));
    }

    #[test]
    fn grid_shape_is_checked() {
        let mut s = sample("d", Grade::A, 0.8);
        s.depth.raw.amplitude.pop();
        assert_eq!(
            validate_sample(&s, "d", None),
            Err(ValidationError::GridShape { resolution: 2, expected: 4, got: 3 })
        );
    }

    #[test]
    fn alerts_follow_grade() {
        assert!(derive_alerts(&record(sample("d", Grade::A, 0.8), None), Grade::B).is_empty());
        let below = derive_alerts(&record(sample("d", Grade::C, 0.5), None), Grade::B);
        assert_eq!(below[0].kind, AlertKind::GradeBelowThreshold);
        let rejected = derive_alerts(&record(sample("d", Grade::Reject, 0.2), Some("S1")), Grade::B);
        assert_eq!(rejected[0].kind, AlertKind::RejectedProduct);
        assert_eq!(rejected[0].severity, AlertSeverity::Critical);
        assert_eq!(rejected[0].site_code.as_deref(), Some("S1"));
    }

    #[tokio::test]
    async fn accepted_sample_is_stored_and_broadcast() {
        let state = AppState::new(config());
        register_device(&state, identity("dev-1", "S1")).await;
        let (_id, mut rx) = state.broadcaster.register().await;

        let s = sample("dev-1", Grade::A, 0.8);
        let sid = s.sample_id.clone();
        assert_eq!(process_sample(&state, "dev-1", s).await, IngestReply::Ack { sample_id: sid.clone() });

        let latest = state.latest.read().await;
        assert_eq!(latest.overall.as_ref().map(|r| r.sample.sample_id.clone()), Some(sid));
        assert_eq!(latest.by_device["dev-1"].site_code.as_deref(), Some("S1"));
        drop(latest);

        let msg: DashboardMessage = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert!(matches!(msg, DashboardMessage::SensorUpdate { .. }));
        assert!(rx.try_recv().is_err());
        assert_eq!(state.devices.read().await["dev-1"].samples_accepted, 1);
    }

    #[tokio::test]
    async fn invalid_sample_is_nacked_with_alert() {
        let state = AppState::new(config());
        register_device(&state, identity("dev-1", "S1")).await;
        let (_id, mut rx) = state.broadcaster.register().await;

        let mut s = sample("dev-1", Grade::A, 0.8);
        s.fusion.tof_score = -0.1;
        let sid = s.sample_id.clone();
        match process_sample(&state, "dev-1", s).await {
            IngestReply::Nack { sample_id, reason } => {
                assert_eq!(sample_id, sid);
                assert!(reason.contains("fusion.tof_score"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(state.latest.read().await.overall.is_none());
        let msg: DashboardMessage = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        match msg {
            DashboardMessage::Alert { alert } => assert_eq!(alert.kind, AlertKind::ValidationFailure),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn stale_sample_after_newer_one_is_nacked() {
        let state = AppState::new(config());
        register_device(&state, identity("dev-1", "S1")).await;
        let older = sample("dev-1", Grade::A, 0.8);
        let mut newer = sample("dev-1", Grade::A, 0.8);
        newer.timestamp = older.timestamp + Duration::seconds(5);
        assert!(matches!(process_sample(&state, "dev-1", newer).await, IngestReply::Ack { .. }));
        assert!(matches!(process_sample(&state, "dev-1", older).await, IngestReply::Nack { .. }));
    }

    #[tokio::test]
    async fn fault_marks_device_and_alerts() {
        let state = AppState::new(config());
        register_device(&state, identity("dev-1", "S1")).await;
        let (_id, mut rx) = state.broadcaster.register().await;
        let fault = DeviceMessage::Fault { device_id: "dev-1".into(), reason: "5 consecutive bus errors".into() };
        assert!(handle_device_message(&state, "dev-1", fault).await.is_none());
        assert_eq!(state.devices.read().await["dev-1"].state, DeviceState::Error);
        let msg: DashboardMessage = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        match msg {
            DashboardMessage::Alert { alert } => {
                assert_eq!(alert.kind, AlertKind::DeviceFault);
                assert_eq!(alert.site_code.as_deref(), Some("S1"));
            }
            other => panic!("unexpected {other:?}"),
        }
        mark_disconnected(&state, "dev-1").await;
        assert_eq!(state.connected_devices().await, 0);
        assert_eq!(state.devices.read().await["dev-1"].state, DeviceState::Error);
    }

    #[test]
    fn unparseable_frame_with_sample_id_gets_nack() {
        let raw = r#"{"type":"sample","sample_id":"s-9","device_id":42}"#;
        let err = serde_json::from_str::<DeviceMessage>(raw).unwrap_err();
        assert!(matches!(nack_unparseable(raw, &err), Some(IngestReply::Nack { sample_id, .. }) if sample_id == "s-9"));
        let err = serde_json::from_str::<DeviceMessage>("nope").unwrap_err();
        assert!(nack_unparseable("nope", &err).is_none());
    }
}
