//! main.rs — Optical inspection device simulator entry point
//!
//! Runs N independent device sessions (one tokio task each):
//!   1. Sensor bus: depth (time-of-flight grid) + spectral simulators
//!   2. Pipeline: depth analysis, spectral analysis, fusion with business metrics
//!   3. Uplink: WebSocket to the grading backend's `/device` endpoint,
//!      store-and-forward buffer while offline
//!
//! All sessions share one FusionEngine; its thickness history is partitioned
//! per device id. Ctrl-C stops every session cooperatively.

mod depth_analysis;
mod depth_sim;
mod device;
mod error;
mod fusion;
mod local_buffer;
mod numeric;
mod scenarios;
mod sensor_bus;
mod spectral_analysis;
mod spectral_sim;
mod uplink;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{info, warn};

use depth_analysis::{AnalysisConfig, DepthAnalyzer};
use depth_sim::{DepthSimConfig, DepthSimulator};
use device::{DeviceConfig, DeviceSession, Pipeline, SessionConfig};
use fusion::{FusionConfig, FusionEngine};
use scenarios::QualityProfile;
use sensor_bus::{BusConfig, SimulatedBus};
use spectral_analysis::{SpectralAnalysisConfig, SpectralAnalyzer};
use spectral_sim::{SpectralSimConfig, SpectralSimulator};
use uplink::{UplinkConfig, WsUplink};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "inspect-sim", about = "Optical inspection device simulator")]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,
    /// Backend device endpoint (overrides [uplink].url)
    #[arg(long)]
    backend_url: Option<String>,
    /// Device id (overrides [device].device_id)
    #[arg(long)]
    device_id: Option<String>,
    /// Sampling rate in Hz (overrides [session].sample_rate_hz)
    #[arg(long)]
    rate: Option<f64>,
    /// Quality profile: premium, standard, degraded, defective or a [profiles.*] name
    #[arg(long)]
    profile: Option<String>,
    /// Number of independent devices to simulate
    #[arg(long)]
    devices: Option<usize>,
    /// Deterministic seed for every random source
    #[arg(long)]
    seed: Option<u64>,
}

// ── Config ────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FullConfig {
    simulation: SimulationConfig,
    device: DeviceConfig,
    session: SessionConfig,
    depth: DepthSimConfig,
    spectral: SpectralSimConfig,
    analysis: AnalysisConfig,
    spectral_analysis: SpectralAnalysisConfig,
    fusion: FusionConfig,
    bus: BusConfig,
    uplink: UplinkConfig,
    profiles: HashMap<String, QualityProfile>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct SimulationConfig {
    /// Active quality profile; none = nominal product every tick
    profile: Option<String>,
    devices: usize,
    seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self { profile: None, devices: 1, seed: None }
    }
}

impl FullConfig {
    fn apply(&mut self, args: &Args) {
        if let Some(url) = &args.backend_url {
            self.uplink.url = url.clone();
        }
        if let Some(id) = &args.device_id {
            self.device.device_id = id.clone();
        }
        if let Some(rate) = args.rate {
            self.session.sample_rate_hz = rate;
        }
        if let Some(profile) = &args.profile {
            self.simulation.profile = Some(profile.clone());
        }
        if let Some(n) = args.devices {
            self.simulation.devices = n;
        }
        if args.seed.is_some() {
            self.simulation.seed = args.seed;
        }
    }
}

/// Distinct, reproducible seed for one random source of one device.
fn seed_for(base: Option<u64>, device: usize, stream: u64) -> Option<u64> {
    base.map(|s| s.wrapping_add(device as u64 * 1_000).wrapping_add(stream))
}

fn build_session(
    cfg: &FullConfig,
    index: usize,
    fusion: Arc<FusionEngine>,
    profile: Option<QualityProfile>,
) -> anyhow::Result<DeviceSession<WsUplink, SimulatedBus>> {
    let base = cfg.simulation.seed;
    let device = if cfg.simulation.devices > 1 { cfg.device.nth(index) } else { cfg.device.clone() };

    let depth = DepthSimulator::new(cfg.depth.clone(), seed_for(base, index, 1))?;
    let maps = [
        cfg.spectral_analysis.freshness,
        cfg.spectral_analysis.fat_quality,
        cfg.spectral_analysis.oxidation,
    ];
    let spectral = SpectralSimulator::new(cfg.spectral.clone(), maps, seed_for(base, index, 2))?;
    let bus = SimulatedBus::new(cfg.bus.clone(), depth, spectral, seed_for(base, index, 3))?;

    let pipeline = Pipeline::new(
        DepthAnalyzer::new(cfg.analysis.clone())?,
        SpectralAnalyzer::new(cfg.spectral_analysis.clone())?,
        fusion,
        profile,
        seed_for(base, index, 4),
    );
    let uplink = WsUplink::new(cfg.uplink.clone(), seed_for(base, index, 5));

    Ok(DeviceSession::new(cfg.session.clone(), &device, uplink, bus, pipeline)?)
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "inspection_sim=info".into()),
        )
        .init();

    let args = Args::parse();

    let config_str = match std::fs::read_to_string(&args.config) {
        Ok(s) => s,
        Err(_) => {
            info!("📄 {} not found, using built-in defaults", args.config);
            include_str!("../config.toml").to_string()
        }
    };
    let mut cfg: FullConfig = toml::from_str(&config_str).context("invalid simulator config")?;
    cfg.apply(&args);

    let profile = match &cfg.simulation.profile {
        Some(name) => Some(scenarios::resolve_profile(name, &cfg.profiles)?),
        None => None,
    };
    let fusion = Arc::new(FusionEngine::new(cfg.fusion.clone())?);
    let n_devices = cfg.simulation.devices.max(1);

    info!(
        "🔬 Inspection simulator starting — {} device(s), {}×{} depth grid, {} Hz, profile={}, backend={}",
        n_devices,
        cfg.depth.resolution,
        cfg.depth.resolution,
        cfg.session.sample_rate_hz,
        cfg.simulation.profile.as_deref().unwrap_or("nominal"),
        cfg.uplink.url
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::with_capacity(n_devices);
    for index in 0..n_devices {
        let session = build_session(&cfg, index, fusion.clone(), profile.clone())?;
        handles.push(tokio::spawn(session.run(shutdown_rx.clone())));
    }

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("🛑 Ctrl-C received, stopping sessions");
            let _ = shutdown_tx.send(true);
        }
    });

    for handle in handles {
        match handle.await {
            Ok(report) => info!(
                "📊 {} finished in {} — sent={} buffered={} rejected={} dropped={} bus_errors={} link_failures={}",
                report.device_id,
                report.final_state,
                report.counters.samples_sent,
                report.counters.samples_buffered,
                report.counters.samples_rejected,
                report.samples_dropped,
                report.counters.bus_errors,
                report.counters.link_failures
            ),
            Err(e) => warn!("session task failed: {e}"),
        }
    }
    Ok(())
}
