//! Automated-mission sequencing: upload → pre-arm checks → arm → guided →
//! auto, then a progress monitor until the vehicle reaches the
//! return-to-launch item. Every step streams to the operator channel and
//! every failure carries the diagnostic of the step that broke.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{error, info, warn};

use hub_fleet::command::{
    CommandRouter, VehicleCommand, MIN_BATTERY_V, MIN_FIX_TYPE, MIN_SATELLITES,
};
use hub_fleet::registry::{Registry, RegistryError, VehicleEntry};
use hub_fleet::CommandError;
use hub_proto::channel::BrokerEvent;
use hub_proto::mission::{MissionParams, MissionPhase, MissionProgress, Waypoint};
use hub_proto::now_ms;
use hub_proto::telemetry::Snapshot;

use crate::geo;
use crate::persist::{self, MissionRecord, TelemetryRow};
use crate::upload::{MissionUploader, UploadError};

/// Beyond this distance between the vehicle and the first survey point the
/// progress stream carries a position-mismatch flag.
pub const POSITION_MISMATCH_M: f64 = 10.0;

const PROGRESS_POLL: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum MissionError {
    #[error("vehicle {0} already has a mission running")]
    AlreadyRunning(u8),
    #[error("vehicle {0} has no active mission")]
    NoActiveMission(u8),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

struct MissionRun {
    mission_id: String,
    vehicle_id: u8,
    phase: Mutex<MissionPhase>,
    total_items: AtomicU16,
    position_mismatch: AtomicBool,
    started_at_ms: i64,
    params: MissionParams,
}

impl MissionRun {
    fn phase(&self) -> MissionPhase {
        *self.phase.lock().unwrap()
    }

    fn set_phase(&self, phase: MissionPhase) {
        *self.phase.lock().unwrap() = phase;
    }

    fn is_active(&self) -> bool {
        !matches!(
            self.phase(),
            MissionPhase::Completed | MissionPhase::Stopped | MissionPhase::Failed
        )
    }

    fn progress(&self, current_item: u16, message: impl Into<String>) -> MissionProgress {
        let total = self.total_items.load(Ordering::Relaxed);
        let pct = if total > 0 {
            current_item as f32 / total as f32 * 100.0
        } else {
            0.0
        };
        MissionProgress {
            mission_id: self.mission_id.clone(),
            vehicle_id: self.vehicle_id,
            phase: self.phase(),
            total_items: total,
            current_item,
            progress_pct: pct,
            position_mismatch: self.position_mismatch.load(Ordering::Relaxed),
            message: message.into(),
        }
    }
}

pub struct MissionOrchestrator {
    registry: Arc<Registry>,
    router: Arc<CommandRouter>,
    uploader: MissionUploader,
    broker: broadcast::Sender<BrokerEvent>,
    runs: Mutex<HashMap<u8, Arc<MissionRun>>>,
    data_dir: PathBuf,
}

impl MissionOrchestrator {
    pub fn new(
        registry: Arc<Registry>,
        router: Arc<CommandRouter>,
        uploader: MissionUploader,
        broker: broadcast::Sender<BrokerEvent>,
        data_dir: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            router,
            uploader,
            broker,
            runs: Mutex::new(HashMap::new()),
            data_dir,
        })
    }

    /// Runs the start workflow to the point where the vehicle is flying in
    /// AUTO; the monitor task then follows it to completion.
    pub async fn start(
        self: &Arc<Self>,
        vehicle_id: u8,
        waypoints: Vec<Waypoint>,
        params: MissionParams,
    ) -> Result<String, MissionError> {
        {
            let runs = self.runs.lock().unwrap();
            if let Some(run) = runs.get(&vehicle_id) {
                if run.is_active() {
                    return Err(MissionError::AlreadyRunning(vehicle_id));
                }
            }
        }
        let entry = self.registry.get(vehicle_id)?;
        let run = Arc::new(MissionRun {
            mission_id: format!("mission_{}", now_ms()),
            vehicle_id,
            phase: Mutex::new(MissionPhase::Idle),
            total_items: AtomicU16::new(0),
            position_mismatch: AtomicBool::new(false),
            started_at_ms: now_ms(),
            params: params.clone(),
        });
        self.runs.lock().unwrap().insert(vehicle_id, Arc::clone(&run));

        match self.run_start(&entry, &run, &waypoints, &params).await {
            Ok(()) => Ok(run.mission_id.clone()),
            Err(e) => {
                run.set_phase(MissionPhase::Failed);
                self.emit_progress(&run, 0, format!("mission start failed: {e}"));
                error!("vehicle {}: mission start failed: {}", vehicle_id, e);
                Err(e)
            }
        }
    }

    async fn run_start(
        self: &Arc<Self>,
        entry: &Arc<VehicleEntry>,
        run: &Arc<MissionRun>,
        waypoints: &[Waypoint],
        params: &MissionParams,
    ) -> Result<(), MissionError> {
        let vehicle_id = run.vehicle_id;
        run.set_phase(MissionPhase::Uploading);
        self.emit_progress(run, 0, "uploading waypoints");

        let total = self
            .uploader
            .upload(&entry.handle, waypoints, params.altitude)
            .await?;
        run.total_items.store(total, Ordering::Relaxed);
        self.emit_progress(run, 0, format!("{} waypoints uploaded", waypoints.len()));

        let snap = entry.handle.snapshot();
        for warning in prearm_warnings(&snap) {
            warn!("vehicle {}: {}", vehicle_id, warning);
            self.emit_progress(run, 0, warning);
        }
        if let Some(first) = waypoints.first() {
            let distance = geo::haversine_m(snap.latitude, snap.longitude, first.lat, first.lon);
            if distance > POSITION_MISMATCH_M {
                run.position_mismatch.store(true, Ordering::Relaxed);
                self.emit_progress(
                    run,
                    0,
                    format!("vehicle is {:.0} m from the first survey point", distance),
                );
            }
        }

        run.set_phase(MissionPhase::Arming);
        self.emit_progress(run, 0, "arming");
        self.router.execute(vehicle_id, VehicleCommand::Arm).await?;

        run.set_phase(MissionPhase::Guided);
        self.router
            .execute(vehicle_id, VehicleCommand::SetMode("GUIDED".into()))
            .await?;

        run.set_phase(MissionPhase::Auto);
        self.router
            .execute(vehicle_id, VehicleCommand::SetMode("AUTO".into()))
            .await?;

        run.set_phase(MissionPhase::Running);
        let _ = self.broker.send(BrokerEvent::MissionStarted {
            mission_id: run.mission_id.clone(),
            vehicle_id,
            total_items: total,
        });
        info!("vehicle {}: mission {} running ({} items)", vehicle_id, run.mission_id, total);

        let this = Arc::clone(self);
        let entry = Arc::clone(entry);
        let run = Arc::clone(run);
        tokio::spawn(async move { this.monitor(entry, run).await });
        Ok(())
    }

    /// Polls the snapshot every two seconds, streams progress, samples the
    /// telemetry log, and spills the mission directory on completion.
    async fn monitor(self: Arc<Self>, entry: Arc<VehicleEntry>, run: Arc<MissionRun>) {
        let mut tick = tokio::time::interval(PROGRESS_POLL);
        let mut rows: Vec<TelemetryRow> = Vec::new();
        let mut detections = 0u32;
        let mut events = self.broker.subscribe();
        loop {
            tick.tick().await;
            // Count this vehicle's detections for the mission record without
            // blocking the poll cadence.
            while let Ok(ev) = events.try_recv() {
                if let BrokerEvent::CropDetection(d) = ev {
                    if d.vehicle_id == run.vehicle_id {
                        detections += 1;
                    }
                }
            }

            match run.phase() {
                MissionPhase::Running => {}
                MissionPhase::Paused => continue,
                _ => break,
            }

            let snap = entry.handle.snapshot();
            rows.push(TelemetryRow::sample(&snap));
            let current = snap.mission_current;
            let total = run.total_items.load(Ordering::Relaxed);
            if total > 0 && current >= total - 1 {
                run.set_phase(MissionPhase::Completed);
                self.emit_progress(&run, current, "mission complete, returning to launch");
                self.persist(&run, detections, &rows).await;
                break;
            }
            self.emit_progress(&run, current, "mission running");
        }
    }

    async fn persist(&self, run: &MissionRun, detections: u32, rows: &[TelemetryRow]) {
        let record = MissionRecord {
            mission_id: run.mission_id.clone(),
            vehicle_id: run.vehicle_id,
            started_at_ms: run.started_at_ms,
            ended_at_ms: now_ms(),
            params: run.params.clone(),
            total_items: run.total_items.load(Ordering::Relaxed),
            detections,
        };
        match persist::write_mission(&self.data_dir, &record, rows).await {
            Ok(dir) => info!("mission {} spilled to {}", record.mission_id, dir.display()),
            Err(e) => error!("mission {} spill failed: {:#}", record.mission_id, e),
        }
    }

    /// Transfer-only entry point: upload a mission without the arm/start
    /// workflow. Returns the on-wire item count.
    pub async fn upload(
        &self,
        vehicle_id: u8,
        waypoints: &[Waypoint],
        params: &MissionParams,
    ) -> Result<u16, MissionError> {
        let entry = self.registry.get(vehicle_id)?;
        Ok(self
            .uploader
            .upload(&entry.handle, waypoints, params.altitude)
            .await?)
    }

    /// Stop: loiter and mark stopped regardless of what the vehicle says.
    pub async fn stop(&self, vehicle_id: u8) -> Result<(), MissionError> {
        let run = self.active_run(vehicle_id)?;
        if let Err(e) = self
            .router
            .execute(vehicle_id, VehicleCommand::SetMode("LOITER".into()))
            .await
        {
            warn!("vehicle {}: loiter on stop failed: {}", vehicle_id, e);
        }
        run.set_phase(MissionPhase::Stopped);
        let _ = self.broker.send(BrokerEvent::MissionStopped {
            mission_id: run.mission_id.clone(),
            vehicle_id,
        });
        Ok(())
    }

    pub async fn pause(&self, vehicle_id: u8) -> Result<(), MissionError> {
        let run = self.active_run(vehicle_id)?;
        self.router
            .execute(vehicle_id, VehicleCommand::SetMode("LOITER".into()))
            .await?;
        run.set_phase(MissionPhase::Paused);
        let _ = self.broker.send(BrokerEvent::MissionPaused {
            mission_id: run.mission_id.clone(),
            vehicle_id,
        });
        Ok(())
    }

    pub async fn resume(&self, vehicle_id: u8) -> Result<(), MissionError> {
        let run = self.active_run(vehicle_id)?;
        self.router
            .execute(vehicle_id, VehicleCommand::SetMode("AUTO".into()))
            .await?;
        run.set_phase(MissionPhase::Running);
        self.emit_progress(&run, 0, "mission resumed");
        Ok(())
    }

    /// Current progress for the diagnostic HTTP surface.
    pub fn status(&self, vehicle_id: u8) -> Option<MissionProgress> {
        let run = self.runs.lock().unwrap().get(&vehicle_id).cloned()?;
        let current = self
            .registry
            .get(vehicle_id)
            .map(|e| e.handle.snapshot().mission_current)
            .unwrap_or(0);
        Some(run.progress(current, "status poll"))
    }

    fn active_run(&self, vehicle_id: u8) -> Result<Arc<MissionRun>, MissionError> {
        let runs = self.runs.lock().unwrap();
        match runs.get(&vehicle_id) {
            Some(run) if run.is_active() => Ok(Arc::clone(run)),
            _ => Err(MissionError::NoActiveMission(vehicle_id)),
        }
    }

    fn emit_progress(&self, run: &MissionRun, current_item: u16, message: impl Into<String>) {
        let _ = self
            .broker
            .send(BrokerEvent::MissionStatus(run.progress(current_item, message)));
    }
}

/// Pre-arm readiness heuristic: warnings only, never a gate.
fn prearm_warnings(snap: &Snapshot) -> Vec<String> {
    let mut out = Vec::new();
    if snap.gps.fix_type < MIN_FIX_TYPE {
        out.push(format!(
            "GPS fix type {} below 3D fix; arming may be rejected",
            snap.gps.fix_type
        ));
    }
    if snap.gps.satellites_visible < MIN_SATELLITES {
        out.push(format!(
            "only {} satellites visible (recommended 8+)",
            snap.gps.satellites_visible
        ));
    }
    if snap.battery_voltage_v < MIN_BATTERY_V {
        out.push(format!("battery at {:.1} V is low", snap.battery_voltage_v));
    }
    if snap.flight_mode == "UNKNOWN" {
        out.push("flight mode unknown".to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_fleet::registry::{VehicleConfig, SIMULATED_ENDPOINT};
    use hub_link::LinkConfig;

    fn orchestrator() -> (Arc<Registry>, Arc<MissionOrchestrator>, broadcast::Receiver<BrokerEvent>) {
        let (broker, rx) = broadcast::channel(4096);
        let registry = Registry::new(
            vec![VehicleConfig {
                id: 1,
                endpoint: SIMULATED_ENDPOINT.into(),
                baud: 57600,
            }],
            LinkConfig::default(),
            broker.clone(),
        );
        let router = CommandRouter::new(Arc::clone(&registry), Duration::from_secs(3));
        let data_dir = std::env::temp_dir().join(format!("hub-missions-{}", now_ms()));
        let orch = MissionOrchestrator::new(
            Arc::clone(&registry),
            router,
            MissionUploader::default(),
            broker,
            data_dir,
        );
        (registry, orch, rx)
    }

    fn survey() -> Vec<Waypoint> {
        (0..4)
            .map(|i| Waypoint {
                lat: 12.9716 + i as f64 * 0.0001,
                lon: 77.5946,
                alt: 15.0,
                seq: None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn start_uploads_arms_and_reaches_running() {
        let (registry, orch, mut rx) = orchestrator();
        registry.simulate(1).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        let mission_id = orch
            .start(1, survey(), MissionParams::default())
            .await
            .unwrap();
        assert!(mission_id.starts_with("mission_"));

        // Let a couple of simulator heartbeats land so the snapshot
        // reflects the new armed state and mode.
        tokio::time::sleep(Duration::from_secs(3)).await;

        let mut saw_started = false;
        while let Ok(ev) = rx.try_recv() {
            if let BrokerEvent::MissionStarted { total_items, vehicle_id, .. } = ev {
                assert_eq!(vehicle_id, 1);
                assert_eq!(total_items, 7);
                saw_started = true;
            }
        }
        assert!(saw_started);

        // The simulator flies it; the vehicle must end up armed in AUTO.
        let snap = registry.get(1).unwrap().handle.snapshot();
        assert!(snap.armed);
        assert_eq!(snap.flight_mode, "AUTO");

        // A second start while this one is active is refused.
        let err = orch
            .start(1, survey(), MissionParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MissionError::AlreadyRunning(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_without_a_mission_is_an_error() {
        let (registry, orch, _rx) = orchestrator();
        registry.simulate(1).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(matches!(
            orch.stop(1).await.unwrap_err(),
            MissionError::NoActiveMission(1)
        ));
    }

    #[test]
    fn prearm_warnings_cover_the_heuristic() {
        let mut snap = Snapshot::default();
        snap.gps.fix_type = 1;
        snap.gps.satellites_visible = 5;
        snap.battery_voltage_v = 9.8;
        let warnings = prearm_warnings(&snap);
        assert_eq!(warnings.len(), 4);

        snap.gps.fix_type = 3;
        snap.gps.satellites_visible = 12;
        snap.battery_voltage_v = 16.4;
        snap.flight_mode = "STABILIZE".into();
        assert!(prearm_warnings(&snap).is_empty());
    }
}
