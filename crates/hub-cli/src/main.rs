use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::signal;
use tracing::{info, warn};

use hub_fleet::{CommandRouter, Registry, VehicleConfig};
use hub_link::LinkConfig;
use hub_mission::{MissionOrchestrator, MissionUploader};
use hub_ops::OpsState;
use hub_spray::{SprayConfig, SprayOrchestrator};

#[derive(Debug, Parser)]
#[command(name = "hub", version, about = "AGRIhub - ground-control broker for crop-spray drone fleets")]
struct Cli {
    #[arg(long)]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the configuration and exit.
    Doctor,
    /// Run the broker.
    Run,
}

#[derive(Debug, Deserialize)]
struct Config {
    #[serde(default = "default_bind")]
    bind: String,
    #[serde(default)]
    vehicles: Vec<VehicleConfig>,
    #[serde(default)]
    link: LinkSection,
    #[serde(default)]
    spray: SprayConfig,
    #[serde(default)]
    missions: MissionsSection,
}

fn default_bind() -> String {
    "0.0.0.0:8080".into()
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct LinkSection {
    system_id: u8,
    component_id: u8,
    heartbeat_interval_ms: u64,
    heartbeat_timeout_ms: u64,
    command_ack_timeout_ms: u64,
    mission_item_timeout_ms: u64,
    mission_item_retries: u32,
    status_ring_size: usize,
    detection_dedup_size: usize,
    telemetry_poll_interval_ms: u64,
}

impl Default for LinkSection {
    fn default() -> Self {
        Self {
            system_id: 255,
            component_id: 190,
            heartbeat_interval_ms: 1000,
            heartbeat_timeout_ms: 3000,
            command_ack_timeout_ms: 3000,
            mission_item_timeout_ms: 3000,
            mission_item_retries: 3,
            status_ring_size: 20,
            detection_dedup_size: 1000,
            telemetry_poll_interval_ms: 250,
        }
    }
}

impl LinkSection {
    fn link_config(&self) -> LinkConfig {
        LinkConfig {
            system_id: self.system_id,
            component_id: self.component_id,
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms),
            status_ring_size: self.status_ring_size,
            detection_dedup_size: self.detection_dedup_size,
            ..LinkConfig::default()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct MissionsSection {
    data_dir: String,
}

impl Default for MissionsSection {
    fn default() -> Self {
        Self {
            data_dir: "missions".into(),
        }
    }
}

fn load_config(path: &str) -> Result<Config> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("read config {path}"))?;
    toml::from_str(&raw).context("parse config toml")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.cmd {
        Command::Doctor => doctor(&cfg),
        Command::Run => run(cfg).await,
    }
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");

    cfg.bind
        .parse::<std::net::SocketAddr>()
        .with_context(|| format!("bind address invalid: {}", cfg.bind))?;

    let mut seen = std::collections::HashSet::new();
    for v in &cfg.vehicles {
        anyhow::ensure!(seen.insert(v.id), "duplicate vehicle id {}", v.id);
        anyhow::ensure!(!v.endpoint.is_empty(), "vehicle {} endpoint empty", v.id);
        anyhow::ensure!(v.baud > 0, "vehicle {} baud invalid", v.id);
    }

    anyhow::ensure!(cfg.link.heartbeat_timeout_ms >= cfg.link.heartbeat_interval_ms,
        "link.heartbeat_timeout_ms must be >= heartbeat_interval_ms");
    anyhow::ensure!(cfg.link.status_ring_size > 0, "link.status_ring_size must be > 0");
    anyhow::ensure!(cfg.link.detection_dedup_size > 0, "link.detection_dedup_size must be > 0");
    anyhow::ensure!(cfg.link.mission_item_retries >= 1, "link.mission_item_retries must be >= 1");

    anyhow::ensure!(cfg.spray.tank_capacity > 0.0, "spray.tank_capacity must be > 0");
    anyhow::ensure!(cfg.spray.spray_volume_per_target > 0.0, "spray.spray_volume_per_target must be > 0");
    anyhow::ensure!(
        cfg.spray.refill_threshold < cfg.spray.tank_capacity,
        "spray.refill_threshold must be below tank_capacity"
    );

    info!("doctor: OK ({} vehicles configured)", cfg.vehicles.len());
    Ok(())
}

async fn run(cfg: Config) -> Result<()> {
    info!("run: starting");

    let (events, _) = tokio::sync::broadcast::channel(1024);

    let registry = Registry::new(cfg.vehicles.clone(), cfg.link.link_config(), events.clone());
    registry.startup_connect();

    let router = CommandRouter::new(
        Arc::clone(&registry),
        Duration::from_millis(cfg.link.command_ack_timeout_ms),
    );
    let uploader = MissionUploader::new(
        Duration::from_millis(cfg.link.mission_item_timeout_ms),
        cfg.link.mission_item_retries,
    );
    let missions = MissionOrchestrator::new(
        Arc::clone(&registry),
        Arc::clone(&router),
        uploader,
        events.clone(),
        PathBuf::from(&cfg.missions.data_dir),
    );
    let spray = SprayOrchestrator::new(cfg.spray.clone(), events.clone());

    let state = Arc::new(OpsState {
        registry,
        router,
        missions,
        spray,
        events,
    });

    hub_ops::spawn_telemetry_fanout(
        Arc::clone(&state),
        Duration::from_millis(cfg.link.telemetry_poll_interval_ms),
    );

    let app = hub_ops::router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&cfg.bind)
        .await
        .with_context(|| format!("bind {}", cfg.bind))?;
    info!("operator channel listening on http://{}", cfg.bind);

    tokio::select! {
        r = axum::serve(listener, app) => { r.context("serve")?; }
        _ = signal::ctrl_c() => { info!("shutdown signal received"); }
    }

    for row in state.registry.list() {
        if let Ok(entry) = state.registry.get(row.id) {
            entry.handle.close();
        }
    }
    warn!("broker stopped");
    Ok(())
}
