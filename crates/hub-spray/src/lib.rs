//! Refill-aware spray mission control. One owner task per vehicle holds the
//! target queue, tank accounting, and the active mission state machine;
//! everything else enqueues into its mailbox.

pub mod tank;
mod worker;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};

use hub_proto::channel::BrokerEvent;
use hub_proto::events::DetectionEvent;
use hub_proto::spray::{SprayMissionInfo, SprayTarget, TankStatus};

use worker::{spawn_worker, SprayMsg};

/// Units kept in reserve beyond one spray volume before a mission may start.
pub const START_SAFETY_MARGIN: f64 = 10.0;

/// Slack added to the loiter + spray window before a missing completion
/// signal fails the target.
const COMPLETION_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SprayConfig {
    pub tank_capacity: f64,
    pub spray_volume_per_target: f64,
    pub refill_threshold: f64,
    pub spray_duration_sec: u64,
    pub loiter_time_sec: u64,
    pub spray_altitude: f64,
    pub auto_resume_after_refill: bool,
    /// When true, `spray_refill_complete` must come from an operator; when
    /// false an automated refill-dock sender may emit it. Same code path
    /// either way.
    pub require_manual_confirmation: bool,
}

impl Default for SprayConfig {
    fn default() -> Self {
        Self {
            tank_capacity: 1000.0,
            spray_volume_per_target: 50.0,
            refill_threshold: 100.0,
            spray_duration_sec: 3,
            loiter_time_sec: 5,
            spray_altitude: 5.0,
            auto_resume_after_refill: true,
            require_manual_confirmation: true,
        }
    }
}

impl SprayConfig {
    pub fn completion_timeout(&self) -> Duration {
        Duration::from_secs(self.loiter_time_sec + self.spray_duration_sec) + COMPLETION_GRACE
    }

    pub fn start_volume_required(&self) -> f64 {
        self.spray_volume_per_target + START_SAFETY_MARGIN
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SprayError {
    #[error("no targets queued for vehicle {0}")]
    NoTargets(u8),
    #[error("vehicle {0} already has an active spray mission")]
    AlreadyActive(u8),
    #[error("vehicle {0} has no active spray mission")]
    NoActiveMission(u8),
    #[error("tank on vehicle {vehicle_id} too low to start ({current:.0} of {required:.0} required)")]
    TankTooLow {
        vehicle_id: u8,
        current: f64,
        required: f64,
    },
    #[error("spray controller for vehicle {0} is not running")]
    WorkerGone(u8),
}

/// Point-in-time view for the diagnostic HTTP surface.
#[derive(Debug, Clone, Serialize)]
pub struct SprayStatusReport {
    pub mission: Option<SprayMissionInfo>,
    pub tank: TankStatus,
    pub queued: usize,
    pub targets: Vec<SprayTarget>,
}

pub struct SprayOrchestrator {
    config: SprayConfig,
    broker: broadcast::Sender<BrokerEvent>,
    workers: Mutex<HashMap<u8, mpsc::Sender<SprayMsg>>>,
}

impl SprayOrchestrator {
    pub fn new(config: SprayConfig, broker: broadcast::Sender<BrokerEvent>) -> Arc<Self> {
        Arc::new(Self {
            config,
            broker,
            workers: Mutex::new(HashMap::new()),
        })
    }

    fn worker(&self, vehicle_id: u8) -> mpsc::Sender<SprayMsg> {
        let mut workers = self.workers.lock().unwrap();
        workers
            .entry(vehicle_id)
            .or_insert_with(|| spawn_worker(vehicle_id, self.config.clone(), self.broker.clone()))
            .clone()
    }

    async fn request<T>(
        &self,
        vehicle_id: u8,
        build: impl FnOnce(oneshot::Sender<T>) -> SprayMsg,
    ) -> Result<T, SprayError> {
        let worker = self.worker(vehicle_id);
        let (reply_tx, reply_rx) = oneshot::channel();
        worker
            .send(build(reply_tx))
            .await
            .map_err(|_| SprayError::WorkerGone(vehicle_id))?;
        reply_rx.await.map_err(|_| SprayError::WorkerGone(vehicle_id))
    }

    pub async fn queue_targets(
        &self,
        vehicle_id: u8,
        detections: Vec<DetectionEvent>,
    ) -> Result<usize, SprayError> {
        self.request(vehicle_id, |reply| SprayMsg::QueueTargets { detections, reply })
            .await
    }

    pub async fn start(&self, vehicle_id: u8) -> Result<SprayMissionInfo, SprayError> {
        self.request(vehicle_id, |reply| SprayMsg::Start { reply })
            .await?
    }

    pub async fn stop(&self, vehicle_id: u8) -> Result<SprayMissionInfo, SprayError> {
        self.request(vehicle_id, |reply| SprayMsg::Stop { reply })
            .await?
    }

    pub async fn clear_queue(&self, vehicle_id: u8) -> Result<usize, SprayError> {
        self.request(vehicle_id, |reply| SprayMsg::ClearQueue { reply })
            .await
    }

    pub async fn refill_complete(&self, vehicle_id: u8) -> Result<TankStatus, SprayError> {
        self.request(vehicle_id, |reply| SprayMsg::RefillComplete { reply })
            .await
    }

    pub async fn target_completed(
        &self,
        vehicle_id: u8,
        target_id: String,
        success: bool,
    ) -> Result<(), SprayError> {
        self.worker(vehicle_id)
            .send(SprayMsg::TargetCompleted { target_id, success })
            .await
            .map_err(|_| SprayError::WorkerGone(vehicle_id))
    }

    pub async fn status(&self, vehicle_id: u8) -> Result<SprayStatusReport, SprayError> {
        self.request(vehicle_id, |reply| SprayMsg::Status { reply })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(n: u32) -> DetectionEvent {
        DetectionEvent {
            detection_id: format!("d{n}"),
            latitude: 23.29,
            longitude: 85.31,
            confidence: 0.8,
            area: 500,
            source: "serial-link".into(),
            vehicle_id: 2,
            timestamp_ms: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn mailbox_round_trip_with_timeout_failure() {
        let (broker, mut rx) = broadcast::channel(256);
        let spray = SprayOrchestrator::new(SprayConfig::default(), broker);

        assert!(matches!(
            spray.start(2).await,
            Err(SprayError::NoTargets(2))
        ));

        let queued = spray.queue_targets(2, vec![detection(1)]).await.unwrap();
        assert_eq!(queued, 1);
        spray.start(2).await.unwrap();

        // Nobody reports completion; the bounded wait fails the target and
        // the single-target mission finishes with one failure.
        tokio::time::sleep(SprayConfig::default().completion_timeout() + Duration::from_secs(1))
            .await;
        let report = spray.status(2).await.unwrap();
        let mission = report.mission.unwrap();
        assert_eq!(mission.failed, 1);
        assert_eq!(mission.completed, 0);

        let mut saw_failed_complete = false;
        while let Ok(ev) = rx.try_recv() {
            if matches!(ev, BrokerEvent::SprayTargetComplete { success: false, .. }) {
                saw_failed_complete = true;
            }
        }
        assert!(saw_failed_complete);
    }

    #[tokio::test(start_paused = true)]
    async fn external_completion_drives_the_mission() {
        let (broker, mut rx) = broadcast::channel(256);
        let spray = SprayOrchestrator::new(SprayConfig::default(), broker);
        spray
            .queue_targets(2, vec![detection(1), detection(2)])
            .await
            .unwrap();
        spray.start(2).await.unwrap();

        for _ in 0..2 {
            // Find the in-flight target and confirm it.
            let report = spray.status(2).await.unwrap();
            let dispensing = report
                .targets
                .iter()
                .find(|t| t.state == hub_proto::spray::TargetState::Dispensing)
                .unwrap()
                .target_id
                .clone();
            spray.target_completed(2, dispensing, true).await.unwrap();
        }

        let report = spray.status(2).await.unwrap();
        let mission = report.mission.unwrap();
        assert_eq!(mission.completed, 2);
        assert_eq!(
            mission.status,
            hub_proto::spray::SprayMissionStatus::Completed
        );
        assert!((report.tank.current - 900.0).abs() < 1e-9);

        let mut saw_complete = false;
        while let Ok(ev) = rx.try_recv() {
            if matches!(ev, BrokerEvent::SprayMissionComplete { .. }) {
                saw_complete = true;
            }
        }
        assert!(saw_complete);
    }
}
