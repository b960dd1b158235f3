use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use grading_types::{DeviceIdentity, DeviceState, Grade, Heartbeat, SensorRecord};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::broadcaster::RealtimeBroadcaster;

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// HTTP / WebSocket port (default 3001)
    pub port: u16,
    /// Samples graded worse than this raise an alert (default B)
    pub alert_min_grade: Grade,
    /// Dashboard silence before a keep-alive ping, and ping → pong deadline
    pub client_idle_timeout_s: u64,
    /// Per-client outbound queue; a full queue counts as a failed send
    pub client_queue_depth: usize,
    /// Time a device has to send `identify` after connecting
    pub identify_timeout_s: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            port: std::env::var("PORT")
                .ok().and_then(|v| v.parse().ok()).unwrap_or(3001),
            alert_min_grade: std::env::var("ALERT_MIN_GRADE")
                .ok().and_then(|v| v.parse().ok()).unwrap_or(Grade::B),
            client_idle_timeout_s: std::env::var("CLIENT_IDLE_TIMEOUT_S")
                .ok().and_then(|v| v.parse().ok()).filter(|s| *s > 0).unwrap_or(30),
            client_queue_depth: std::env::var("CLIENT_QUEUE_DEPTH")
                .ok().and_then(|v| v.parse().ok()).filter(|d| *d > 0).unwrap_or(64),
            identify_timeout_s: std::env::var("IDENTIFY_TIMEOUT_S")
                .ok().and_then(|v| v.parse().ok()).unwrap_or(10),
        }
    }
}

// ─── Devices ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct DeviceRecord {
    pub identity: DeviceIdentity,
    pub connected: bool,
    pub connected_at: DateTime<Utc>,
    pub state: DeviceState,
    pub last_heartbeat: Option<Heartbeat>,
    pub samples_accepted: u64,
    pub samples_rejected: u64,
}

impl DeviceRecord {
    pub fn new(identity: DeviceIdentity) -> Self {
        Self {
            identity,
            connected: true,
            connected_at: Utc::now(),
            state: DeviceState::Online,
            last_heartbeat: None,
            samples_accepted: 0,
            samples_rejected: 0,
        }
    }
}

// ─── Latest-state store ──────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct LatestStore {
    pub overall: Option<SensorRecord>,
    pub by_device: HashMap<String, SensorRecord>,
}

impl LatestStore {
    pub fn last_timestamp(&self, device_id: &str) -> Option<DateTime<Utc>> {
        self.by_device.get(device_id).map(|r| r.sample.timestamp)
    }

    pub fn insert(&mut self, record: SensorRecord) {
        self.overall = Some(record.clone());
        self.by_device.insert(record.sample.device_id.clone(), record);
    }
}

// ─── App state ───────────────────────────────────────────────────────────────

pub struct AppState {
    pub config: BackendConfig,
    pub broadcaster: RealtimeBroadcaster,
    pub latest: RwLock<LatestStore>,
    pub devices: RwLock<HashMap<String, DeviceRecord>>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(config: BackendConfig) -> SharedState {
        Arc::new(Self {
            broadcaster: RealtimeBroadcaster::new(config.client_queue_depth),
            config,
            latest: RwLock::new(LatestStore::default()),
            devices: RwLock::new(HashMap::new()),
        })
    }

    pub async fn connected_devices(&self) -> usize {
        self.devices.read().await.values().filter(|d| d.connected).count()
    }

    pub async fn site_of(&self, device_id: &str) -> Option<String> {
        self.devices
            .read()
            .await
            .get(device_id)
            .map(|d| d.identity.site_code.clone())
    }
}
