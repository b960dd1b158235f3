//! device.rs — Device session: connectivity state machine + sampling loop
//!
//! Boot sequence:
//!   Booting ─self-test─▶ WifiConnecting ─join─▶ WifiConnected
//!           ─connect─▶ BackendConnecting ─welcome─▶ Online
//! Any boot step failing ends in Error.
//!
//! Steady state (one task per device):
//!   - every sample tick: scenario draw → bus → analyze → fuse
//!   - Online: send, then drain the LocalBuffer oldest-first
//!   - send failure: Online → Offline, sample goes to the LocalBuffer
//!   - Offline: buffer, and try a rate-limited reconnect
//!   - consecutive bus or link failures reaching their limit: Error (terminal)
//!   - heartbeat only while Online
//!   - shutdown via the watch channel, raced against boot and every tick;
//!     in-flight sends, flushes and reconnects are dropped

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use grading_types::{
    DepthBlock, DeviceIdentity, DeviceMessage, DeviceState, Heartbeat, SampleMessage, SensorAddresses,
    SpectralBlock,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::depth_analysis::DepthAnalyzer;
use crate::depth_sim::ProductVariant;
use crate::error::{require_positive, BusError, ConfigError};
use crate::fusion::{FusionEngine, FusionInput};
use crate::local_buffer::LocalBuffer;
use crate::scenarios::{QualityProfile, ScenarioDraw};
use crate::sensor_bus::SensorBus;
use crate::spectral_analysis::SpectralAnalyzer;
use crate::spectral_sim::SpectralTargets;
use crate::uplink::{Delivery, Uplink};

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub device_id: String,
    pub mac_address: String,
    pub location: String,
    pub site_code: String,
    pub firmware_version: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: "inspect-001".into(),
            mac_address: "02:00:00:00:00:01".into(),
            location: "line-1/station-a".into(),
            site_code: "SITE-01".into(),
            firmware_version: env!("CARGO_PKG_VERSION").into(),
        }
    }
}

impl DeviceConfig {
    pub fn identity(&self, addresses: SensorAddresses) -> DeviceIdentity {
        DeviceIdentity {
            device_id: self.device_id.clone(),
            mac_address: self.mac_address.clone(),
            location: self.location.clone(),
            site_code: self.site_code.clone(),
            firmware_version: self.firmware_version.clone(),
            sensor_addresses: addresses,
        }
    }

    /// Copy for the `index`-th device of a multi-device run.
    pub fn nth(&self, index: usize) -> Self {
        let mut mac = self.mac_address.clone();
        if mac.len() >= 2 {
            mac.truncate(mac.len() - 2);
            mac.push_str(&format!("{:02x}", (index + 1) % 256));
        }
        Self {
            device_id: format!("{}-{:02}", self.device_id, index + 1),
            mac_address: mac,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub sample_rate_hz: f64,
    pub heartbeat_interval_s: u64,
    pub buffer_capacity: usize,
    /// Minimum spacing between reconnect attempts while Offline
    pub reconnect_min_interval_ms: u64,
    pub max_consecutive_bus_errors: u32,
    pub max_consecutive_link_failures: u32,
    /// Info-level progress line every N ticks
    pub progress_every: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: 1.0,
            heartbeat_interval_s: 10,
            buffer_capacity: 100,
            reconnect_min_interval_ms: 5_000,
            max_consecutive_bus_errors: 5,
            max_consecutive_link_failures: 5,
            progress_every: 20,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("sample_rate_hz", self.sample_rate_hz)?;
        if self.heartbeat_interval_s == 0 {
            return Err(ConfigError::threshold("heartbeat_interval_s", "must be ≥ 1"));
        }
        if self.buffer_capacity == 0 {
            return Err(ConfigError::threshold("buffer_capacity", "must be ≥ 1"));
        }
        if self.max_consecutive_bus_errors == 0 || self.max_consecutive_link_failures == 0 {
            return Err(ConfigError::threshold("failure limits", "must be ≥ 1"));
        }
        Ok(())
    }

    fn sample_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.sample_rate_hz)
    }
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

/// Analyzers plus the shared fusion engine. Runs synchronously, no locks
/// held except the fusion history step.
pub struct Pipeline {
    pub depth: DepthAnalyzer,
    pub spectral: SpectralAnalyzer,
    pub fusion: Arc<FusionEngine>,
    pub profile: Option<QualityProfile>,
    rng: StdRng,
}

impl Pipeline {
    pub fn new(
        depth: DepthAnalyzer,
        spectral: SpectralAnalyzer,
        fusion: Arc<FusionEngine>,
        profile: Option<QualityProfile>,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self { depth, spectral, fusion, profile, rng }
    }

    fn draw(&mut self) -> ScenarioDraw {
        match &self.profile {
            Some(p) => p.draw(&mut self.rng),
            None => ScenarioDraw {
                variant: ProductVariant::Normal,
                defects: Vec::new(),
                depth_target: 1.0,
                spectral: SpectralTargets::default(),
            },
        }
    }

    /// One simulate → analyze → fuse tick.
    pub fn sample<B: SensorBus + ?Sized>(&mut self, device_id: &str, bus: &mut B) -> Result<SampleMessage, BusError> {
        let scene = self.draw();
        bus.trigger(&scene)?;
        let depth_raw = bus.read_depth()?;
        let spectral_raw = bus.read_spectral()?;

        let depth = self.depth.analyze(&depth_raw);
        let spectral = spectral_raw.as_ref().map(|raw| (self.spectral.analyze(raw), raw));
        let fusion = self.fusion.fuse(FusionInput {
            device_id,
            depth: &depth,
            depth_raw: &depth_raw,
            spectral: spectral.as_ref().map(|(a, raw)| (a, *raw)),
            profile_target: self.profile.as_ref().map(|_| scene.depth_target),
        });
        let spectral = spectral.map(|(analysis, raw)| SpectralBlock { raw: raw.clone(), analysis });

        Ok(SampleMessage {
            sample_id: Uuid::new_v4().to_string(),
            device_id: device_id.to_string(),
            timestamp: Utc::now(),
            depth: DepthBlock { raw: depth_raw, analysis: depth },
            spectral,
            fusion,
        })
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionCounters {
    pub ticks: u64,
    pub samples_sent: u64,
    pub samples_buffered: u64,
    pub samples_rejected: u64,
    pub bus_errors: u64,
    pub link_failures: u64,
}

/// Final state and counters, returned when the session ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub device_id: String,
    pub final_state: DeviceState,
    pub counters: SessionCounters,
    pub samples_dropped: u64,
    pub buffer_depth: usize,
}

pub struct DeviceSession<U: Uplink, B: SensorBus> {
    cfg: SessionConfig,
    identity: DeviceIdentity,
    uplink: U,
    bus: B,
    pipeline: Pipeline,
    buffer: LocalBuffer<SampleMessage>,
    state: DeviceState,
    state_tx: watch::Sender<DeviceState>,
    counters: SessionCounters,
    consecutive_bus_errors: u32,
    consecutive_link_failures: u32,
    last_reconnect: Option<Instant>,
    started: Instant,
}

impl<U: Uplink, B: SensorBus> DeviceSession<U, B> {
    pub fn new(
        cfg: SessionConfig,
        device: &DeviceConfig,
        uplink: U,
        bus: B,
        pipeline: Pipeline,
    ) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let identity = device.identity(bus.addresses());
        let (state_tx, _) = watch::channel(DeviceState::Booting);
        Ok(Self {
            buffer: LocalBuffer::new(cfg.buffer_capacity),
            cfg,
            identity,
            uplink,
            bus,
            pipeline,
            state: DeviceState::Booting,
            state_tx,
            counters: SessionCounters::default(),
            consecutive_bus_errors: 0,
            consecutive_link_failures: 0,
            last_reconnect: None,
            started: Instant::now(),
        })
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Observe state transitions from outside the session task.
    pub fn subscribe_state(&self) -> watch::Receiver<DeviceState> {
        self.state_tx.subscribe()
    }

    pub fn counters(&self) -> &SessionCounters {
        &self.counters
    }

    pub fn buffer(&self) -> &LocalBuffer<SampleMessage> {
        &self.buffer
    }

    fn set_state(&mut self, next: DeviceState) {
        if self.state != next {
            info!("📟 {} {} → {}", self.identity.device_id, self.state, next);
            self.state = next;
            self.state_tx.send_replace(next);
        }
    }

    async fn enter_error(&mut self, reason: String) {
        error!("⛔ {} entering ERROR: {reason}", self.identity.device_id);
        if self.uplink.is_connected() {
            let fault = DeviceMessage::Fault { device_id: self.identity.device_id.clone(), reason };
            if let Err(e) = self.uplink.notify(&fault).await {
                debug!("fault notification not delivered: {e}");
            }
        }
        self.uplink.close().await;
        self.set_state(DeviceState::Error);
    }

    // ── Boot ──

    pub async fn boot(&mut self) -> DeviceState {
        self.set_state(DeviceState::Booting);
        if let Err(e) = self.bus.self_test() {
            self.enter_error(format!("sensor self-test failed: {e}")).await;
            return self.state;
        }

        self.set_state(DeviceState::WifiConnecting);
        if let Err(e) = self.uplink.join_network().await {
            self.enter_error(e.to_string()).await;
            return self.state;
        }
        self.set_state(DeviceState::WifiConnected);

        self.set_state(DeviceState::BackendConnecting);
        if let Err(e) = self.open_backend().await {
            self.enter_error(e.to_string()).await;
            return self.state;
        }
        self.set_state(DeviceState::Online);
        self.state
    }

    async fn open_backend(&mut self) -> Result<(), crate::error::LinkError> {
        self.uplink.connect().await?;
        self.uplink.handshake(&self.identity).await
    }

    // ── Steady state ──

    /// One sampling tick. Returns the state after the tick.
    pub async fn tick(&mut self) -> DeviceState {
        if self.state == DeviceState::Error {
            return self.state;
        }
        self.counters.ticks += 1;

        let sample = match self.pipeline.sample(&self.identity.device_id, &mut self.bus) {
            Ok(s) => {
                self.consecutive_bus_errors = 0;
                s
            }
            Err(e) => {
                self.counters.bus_errors += 1;
                self.consecutive_bus_errors += 1;
                warn!(
                    "{} bus error ({}/{}): {e}",
                    self.identity.device_id, self.consecutive_bus_errors, self.cfg.max_consecutive_bus_errors
                );
                if self.consecutive_bus_errors >= self.cfg.max_consecutive_bus_errors {
                    self.enter_error(format!("{} consecutive bus errors", self.consecutive_bus_errors)).await;
                }
                return self.state;
            }
        };

        if self.counters.ticks % self.cfg.progress_every.max(1) == 0 {
            info!(
                "⏱ {} tick={} grade={} score={:.3} state={} buffered={}",
                self.identity.device_id,
                self.counters.ticks,
                sample.fusion.final_grade,
                sample.fusion.final_score,
                self.state,
                self.buffer.len()
            );
        }

        if self.state == DeviceState::Online {
            if self.transmit(&sample).await {
                self.flush().await;
            } else {
                self.store(sample);
            }
        } else {
            self.store(sample);
            self.try_reconnect().await;
        }
        self.state
    }

    fn store(&mut self, sample: SampleMessage) {
        self.counters.samples_buffered += 1;
        if let Some(evicted) = self.buffer.push(sample) {
            debug!(
                "{} buffer full at {}, dropped {}",
                self.identity.device_id,
                self.buffer.capacity(),
                evicted.sample_id
            );
        }
    }

    /// Send one sample while Online. `false` means the link failed and the
    /// session is no longer Online.
    async fn transmit(&mut self, sample: &SampleMessage) -> bool {
        if self.state != DeviceState::Online {
            return false;
        }
        match self.uplink.send_sample(sample).await {
            Ok(Delivery::Acked) => {
                self.counters.samples_sent += 1;
                self.consecutive_link_failures = 0;
                true
            }
            Ok(Delivery::Rejected(reason)) => {
                self.counters.samples_rejected += 1;
                self.consecutive_link_failures = 0;
                warn!("{} sample {} rejected: {reason}", self.identity.device_id, sample.sample_id);
                true
            }
            Err(e) => {
                warn!("{} send failed: {e}", self.identity.device_id);
                self.link_failed(e.to_string()).await;
                false
            }
        }
    }

    async fn link_failed(&mut self, reason: String) {
        self.counters.link_failures += 1;
        self.consecutive_link_failures += 1;
        if self.consecutive_link_failures >= self.cfg.max_consecutive_link_failures {
            self.enter_error(format!(
                "{} consecutive link failures, last: {reason}",
                self.consecutive_link_failures
            ))
            .await;
        } else {
            self.uplink.close().await;
            self.set_state(DeviceState::Offline);
        }
    }

    /// Drain buffered samples oldest-first while the link holds.
    async fn flush(&mut self) {
        let mut flushed = 0usize;
        while self.state == DeviceState::Online {
            let Some(next) = self.buffer.front().cloned() else { break };
            if !self.transmit(&next).await {
                break;
            }
            self.buffer.pop_front();
            flushed += 1;
        }
        if flushed > 0 {
            info!("📤 {} flushed {flushed} buffered samples", self.identity.device_id);
        }
    }

    async fn try_reconnect(&mut self) {
        if self.state != DeviceState::Offline {
            return;
        }
        let min_gap = Duration::from_millis(self.cfg.reconnect_min_interval_ms);
        if let Some(last) = self.last_reconnect {
            if last.elapsed() < min_gap {
                return;
            }
        }
        self.last_reconnect = Some(Instant::now());

        match self.open_backend().await {
            Ok(()) => {
                self.consecutive_link_failures = 0;
                self.set_state(DeviceState::Online);
                self.flush().await;
            }
            Err(e) => {
                warn!("{} reconnect failed: {e}", self.identity.device_id);
                self.link_failed(e.to_string()).await;
            }
        }
    }

    pub fn heartbeat(&self) -> Heartbeat {
        Heartbeat {
            device_id: self.identity.device_id.clone(),
            state: self.state,
            uptime_s: self.started.elapsed().as_secs(),
            samples_sent: self.counters.samples_sent,
            samples_buffered: self.counters.samples_buffered,
            samples_dropped: self.buffer.dropped(),
            samples_rejected: self.counters.samples_rejected,
            bus_errors: self.counters.bus_errors,
            buffer_depth: self.buffer.len(),
        }
    }

    async fn send_heartbeat(&mut self) {
        if self.state != DeviceState::Online {
            return;
        }
        let hb = DeviceMessage::Heartbeat(self.heartbeat());
        if let Err(e) = self.uplink.notify(&hb).await {
            warn!("{} heartbeat failed: {e}", self.identity.device_id);
            self.link_failed(e.to_string()).await;
        }
    }

    fn report(&self) -> SessionReport {
        SessionReport {
            device_id: self.identity.device_id.clone(),
            final_state: self.state,
            counters: self.counters.clone(),
            samples_dropped: self.buffer.dropped(),
            buffer_depth: self.buffer.len(),
        }
    }

    /// Boot, then sample until shutdown or Error.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> SessionReport {
        info!("🔬 {} session starting at {} Hz", self.identity.device_id, self.cfg.sample_rate_hz);
        let booted = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => None,
            state = self.boot() => Some(state),
        };
        match booted {
            None => {
                info!("🛑 {} shutting down", self.identity.device_id);
                self.uplink.close().await;
                return self.report();
            }
            Some(DeviceState::Error) => return self.report(),
            Some(_) => {}
        }

        let mut sampler = interval(self.cfg.sample_period());
        sampler.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat = interval(Duration::from_secs(self.cfg.heartbeat_interval_s));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // None: shutdown, possibly with a send or reconnect still in flight
            let outcome = tokio::select! {
                _ = shutdown_requested(&mut shutdown) => None,
                _ = sampler.tick() => {
                    tokio::select! {
                        state = self.tick() => Some(state),
                        _ = shutdown_requested(&mut shutdown) => None,
                    }
                }
                _ = heartbeat.tick() => {
                    tokio::select! {
                        _ = self.send_heartbeat() => Some(self.state),
                        _ = shutdown_requested(&mut shutdown) => None,
                    }
                }
            };
            match outcome {
                None => {
                    info!("🛑 {} shutting down", self.identity.device_id);
                    self.uplink.close().await;
                    break;
                }
                Some(DeviceState::Error) => break,
                Some(_) => {}
            }
        }
        self.report()
    }
}

/// Resolves once `true` is published or the sender is gone.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
