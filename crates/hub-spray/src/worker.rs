//! Per-vehicle spray mission owner. All state lives in this task; the rest
//! of the broker talks to it through its mailbox and never mutates spray
//! state directly.

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{timeout_at, Instant};
use tracing::{info, warn};

use hub_proto::channel::BrokerEvent;
use hub_proto::events::DetectionEvent;
use hub_proto::now_ms;
use hub_proto::spray::{
    SprayMissionInfo, SprayMissionStatus, SprayTarget, TankStatus, TargetState,
};

use crate::tank::Tank;
use crate::{SprayConfig, SprayError, SprayStatusReport};

pub(crate) enum SprayMsg {
    QueueTargets {
        detections: Vec<DetectionEvent>,
        reply: oneshot::Sender<usize>,
    },
    Start {
        reply: oneshot::Sender<Result<SprayMissionInfo, SprayError>>,
    },
    Stop {
        reply: oneshot::Sender<Result<SprayMissionInfo, SprayError>>,
    },
    ClearQueue {
        reply: oneshot::Sender<usize>,
    },
    RefillComplete {
        reply: oneshot::Sender<TankStatus>,
    },
    TargetCompleted {
        target_id: String,
        success: bool,
    },
    Status {
        reply: oneshot::Sender<SprayStatusReport>,
    },
}

pub(crate) fn spawn_worker(
    vehicle_id: u8,
    config: SprayConfig,
    broker: broadcast::Sender<BrokerEvent>,
) -> mpsc::Sender<SprayMsg> {
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(worker_loop(vehicle_id, config, broker, rx));
    tx
}

async fn worker_loop(
    vehicle_id: u8,
    config: SprayConfig,
    broker: broadcast::Sender<BrokerEvent>,
    mut rx: mpsc::Receiver<SprayMsg>,
) {
    let mut state = WorkerState::new(vehicle_id, config.clone());
    // Deadline for the externally signalled completion of the target we
    // are currently dispensing on.
    let mut awaiting: Option<String> = None;
    let mut deadline: Option<Instant> = None;

    loop {
        let msg = match deadline {
            Some(d) => match timeout_at(d, rx.recv()).await {
                Err(_) => {
                    warn!(
                        "vehicle {}: no completion signal for target {:?}, marking failed",
                        vehicle_id, awaiting
                    );
                    for ev in state.on_completion_timeout() {
                        let _ = broker.send(ev);
                    }
                    sync_deadline(&state, &config, &mut awaiting, &mut deadline, true);
                    continue;
                }
                Ok(None) => break,
                Ok(Some(m)) => m,
            },
            None => match rx.recv().await {
                None => break,
                Some(m) => m,
            },
        };

        let events = match msg {
            SprayMsg::QueueTargets { detections, reply } => {
                let (queued, events) = state.queue_targets(detections);
                let _ = reply.send(queued);
                events
            }
            SprayMsg::Start { reply } => {
                let (result, events) = state.start();
                let _ = reply.send(result);
                events
            }
            SprayMsg::Stop { reply } => {
                let (result, events) = state.stop();
                let _ = reply.send(result);
                events
            }
            SprayMsg::ClearQueue { reply } => {
                let (remaining, events) = state.clear_queue();
                let _ = reply.send(remaining);
                events
            }
            SprayMsg::RefillComplete { reply } => {
                let (status, events) = state.refill_complete();
                let _ = reply.send(status);
                events
            }
            SprayMsg::TargetCompleted { target_id, success } => {
                state.target_completed(&target_id, success)
            }
            SprayMsg::Status { reply } => {
                let _ = reply.send(state.report());
                Vec::new()
            }
        };
        for ev in events {
            let _ = broker.send(ev);
        }
        sync_deadline(&state, &config, &mut awaiting, &mut deadline, false);
    }
}

/// Keeps the completion deadline in step with which target (if any) the
/// state machine is waiting on. `force` restarts the timer even when the
/// awaited id did not change.
fn sync_deadline(
    state: &WorkerState,
    config: &SprayConfig,
    awaiting: &mut Option<String>,
    deadline: &mut Option<Instant>,
    force: bool,
) {
    let now_awaiting = state.awaiting().map(|s| s.to_string());
    if force || now_awaiting != *awaiting {
        *deadline = now_awaiting
            .as_ref()
            .map(|_| Instant::now() + config.completion_timeout());
        *awaiting = now_awaiting;
    }
}

/// The actual state machine, synchronous so the interesting transitions
/// can be tested without a runtime.
pub(crate) struct WorkerState {
    vehicle_id: u8,
    config: SprayConfig,
    tank: Tank,
    queue: Vec<SprayTarget>,
    mission: Option<SprayMissionInfo>,
    target_seq: u64,
}

impl WorkerState {
    pub(crate) fn new(vehicle_id: u8, config: SprayConfig) -> Self {
        let tank = Tank::new(config.tank_capacity);
        Self {
            vehicle_id,
            config,
            tank,
            queue: Vec::new(),
            mission: None,
            target_seq: 0,
        }
    }

    fn mission_active(&self) -> bool {
        matches!(
            self.mission.as_ref().map(|m| m.status),
            Some(SprayMissionStatus::Active) | Some(SprayMissionStatus::Refilling)
        )
    }

    /// The id of the target currently out for dispensing, if any.
    pub(crate) fn awaiting(&self) -> Option<&str> {
        self.queue
            .iter()
            .find(|t| t.state == TargetState::Dispensing)
            .map(|t| t.target_id.as_str())
    }

    pub(crate) fn queue_targets(
        &mut self,
        detections: Vec<DetectionEvent>,
    ) -> (usize, Vec<BrokerEvent>) {
        for det in detections {
            self.target_seq += 1;
            self.queue.push(SprayTarget {
                target_id: format!("t{}-{}", self.vehicle_id, self.target_seq),
                detection_id: det.detection_id,
                latitude: det.latitude,
                longitude: det.longitude,
                altitude_m: self.config.spray_altitude,
                required_volume: self.config.spray_volume_per_target,
                state: TargetState::Queued,
                queued_at_ms: now_ms(),
                sprayed_at_ms: None,
                confidence: det.confidence,
                priority: (det.confidence * 100.0) as u32,
            });
        }
        if let Some(m) = self.mission.as_mut() {
            m.total_targets = self.queue.len();
        }
        let queued = self.queue.len();
        (
            queued,
            vec![BrokerEvent::SprayQueueUpdated {
                vehicle_id: self.vehicle_id,
                queued,
            }],
        )
    }

    pub(crate) fn start(
        &mut self,
    ) -> (Result<SprayMissionInfo, SprayError>, Vec<BrokerEvent>) {
        if self.mission_active() {
            return (Err(SprayError::AlreadyActive(self.vehicle_id)), Vec::new());
        }
        if !self.queue.iter().any(|t| t.state == TargetState::Queued) {
            return (Err(SprayError::NoTargets(self.vehicle_id)), Vec::new());
        }
        if self.tank.current() < self.config.start_volume_required() {
            return (
                Err(SprayError::TankTooLow {
                    vehicle_id: self.vehicle_id,
                    current: self.tank.current(),
                    required: self.config.start_volume_required(),
                }),
                Vec::new(),
            );
        }
        let mission = SprayMissionInfo {
            id: format!("spray_{}", now_ms()),
            vehicle_id: self.vehicle_id,
            status: SprayMissionStatus::Active,
            started_at_ms: now_ms(),
            ended_at_ms: None,
            current_target_index: self
                .queue
                .iter()
                .position(|t| t.state == TargetState::Queued)
                .unwrap_or(0),
            total_targets: self.queue.len(),
            completed: 0,
            failed: 0,
            refills: 0,
        };
        info!(
            "vehicle {}: spray mission {} started over {} targets",
            self.vehicle_id, mission.id, mission.total_targets
        );
        self.mission = Some(mission.clone());
        let mut events = vec![BrokerEvent::SprayMissionStarted {
            vehicle_id: self.vehicle_id,
            mission: mission.clone(),
        }];
        events.extend(self.advance());
        (Ok(mission), events)
    }

    /// Either hands the next target to whoever flies the vehicle, pauses
    /// for a refill, or closes the mission out.
    fn advance(&mut self) -> Vec<BrokerEvent> {
        let Some(mission) = self.mission.as_mut() else {
            return Vec::new();
        };
        if mission.status != SprayMissionStatus::Active {
            return Vec::new();
        }
        if mission.current_target_index >= self.queue.len() {
            mission.status = SprayMissionStatus::Completed;
            mission.ended_at_ms = Some(now_ms());
            info!(
                "vehicle {}: spray mission {} complete ({} ok, {} failed, {} refills)",
                self.vehicle_id, mission.id, mission.completed, mission.failed, mission.refills
            );
            return vec![BrokerEvent::SprayMissionComplete {
                vehicle_id: self.vehicle_id,
                mission: mission.clone(),
            }];
        }
        let target = &mut self.queue[mission.current_target_index];
        if !self
            .tank
            .can_dispense(target.required_volume, self.config.refill_threshold)
        {
            mission.status = SprayMissionStatus::Refilling;
            let remaining = mission.total_targets - mission.completed - mission.failed;
            warn!(
                "vehicle {}: tank at {:.0}, pausing for refill ({} targets remaining)",
                self.vehicle_id,
                self.tank.current(),
                remaining
            );
            return vec![BrokerEvent::SprayRefillRequired {
                vehicle_id: self.vehicle_id,
                targets_remaining: remaining,
                tank: self.tank.status(),
            }];
        }
        target.state = TargetState::Dispensing;
        vec![BrokerEvent::SprayNextTarget {
            vehicle_id: self.vehicle_id,
            target: target.clone(),
        }]
    }

    pub(crate) fn target_completed(&mut self, target_id: &str, success: bool) -> Vec<BrokerEvent> {
        let Some(mission) = self.mission.as_mut() else {
            return Vec::new();
        };
        let index = mission.current_target_index;
        let Some(target) = self.queue.get_mut(index) else {
            return Vec::new();
        };
        if target.target_id != target_id || target.state != TargetState::Dispensing {
            warn!(
                "vehicle {}: completion for {} does not match in-flight target",
                self.vehicle_id, target_id
            );
            return Vec::new();
        }
        if success {
            target.state = TargetState::Completed;
            target.sprayed_at_ms = Some(now_ms());
            self.tank.dispense(target.required_volume);
            mission.completed += 1;
        } else {
            target.state = TargetState::Failed;
            mission.failed += 1;
        }
        mission.current_target_index += 1;
        let mut events = vec![BrokerEvent::SprayTargetComplete {
            vehicle_id: self.vehicle_id,
            target: target.clone(),
            success,
        }];
        events.extend(self.advance());
        events
    }

    pub(crate) fn on_completion_timeout(&mut self) -> Vec<BrokerEvent> {
        let Some(id) = self.awaiting().map(|s| s.to_string()) else {
            return Vec::new();
        };
        self.target_completed(&id, false)
    }

    pub(crate) fn refill_complete(&mut self) -> (TankStatus, Vec<BrokerEvent>) {
        self.tank.refill();
        let mut events = Vec::new();
        let mut resume = false;
        if let Some(mission) = self.mission.as_mut() {
            if mission.status == SprayMissionStatus::Refilling {
                mission.status = SprayMissionStatus::Active;
                mission.refills += 1;
                resume = self.config.auto_resume_after_refill;
            }
        }
        info!("vehicle {}: tank refilled", self.vehicle_id);
        events.push(BrokerEvent::SprayRefillComplete {
            vehicle_id: self.vehicle_id,
            tank: self.tank.status(),
        });
        if resume {
            events.extend(self.advance());
        }
        (self.tank.status(), events)
    }

    pub(crate) fn stop(&mut self) -> (Result<SprayMissionInfo, SprayError>, Vec<BrokerEvent>) {
        let Some(mission) = self.mission.as_mut() else {
            return (Err(SprayError::NoActiveMission(self.vehicle_id)), Vec::new());
        };
        if matches!(
            mission.status,
            SprayMissionStatus::Completed | SprayMissionStatus::Stopped
        ) {
            return (Err(SprayError::NoActiveMission(self.vehicle_id)), Vec::new());
        }
        mission.status = SprayMissionStatus::Stopped;
        mission.ended_at_ms = Some(now_ms());
        let info = mission.clone();
        self.queue.clear();
        info!("vehicle {}: spray mission {} stopped", self.vehicle_id, info.id);
        (
            Ok(info.clone()),
            vec![BrokerEvent::SprayMissionStopped {
                vehicle_id: self.vehicle_id,
                mission: info,
            }],
        )
    }

    pub(crate) fn clear_queue(&mut self) -> (usize, Vec<BrokerEvent>) {
        self.queue.retain(|t| t.state != TargetState::Queued);
        if let Some(m) = self.mission.as_mut() {
            m.total_targets = self.queue.len();
        }
        let queued = self.queue.len();
        (
            queued,
            vec![BrokerEvent::SprayQueueUpdated {
                vehicle_id: self.vehicle_id,
                queued,
            }],
        )
    }

    pub(crate) fn report(&self) -> SprayStatusReport {
        SprayStatusReport {
            mission: self.mission.clone(),
            tank: self.tank.status(),
            queued: self
                .queue
                .iter()
                .filter(|t| t.state == TargetState::Queued)
                .count(),
            targets: self.queue.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(n: u32) -> DetectionEvent {
        DetectionEvent {
            detection_id: format!("d{n}"),
            latitude: 23.29 + n as f64 * 1e-4,
            longitude: 85.31,
            confidence: 0.9,
            area: 1000,
            source: "serial-link".into(),
            vehicle_id: 1,
            timestamp_ms: 0,
        }
    }

    fn state_with(n: u32) -> WorkerState {
        let mut state = WorkerState::new(1, SprayConfig::default());
        let (queued, _) = state.queue_targets((0..n).map(detection).collect());
        assert_eq!(queued, n as usize);
        state
    }

    fn next_target_id(events: &[BrokerEvent]) -> Option<String> {
        events.iter().find_map(|e| match e {
            BrokerEvent::SprayNextTarget { target, .. } => Some(target.target_id.clone()),
            _ => None,
        })
    }

    #[test]
    fn start_with_empty_queue_reports_no_targets() {
        let mut state = WorkerState::new(1, SprayConfig::default());
        let (result, _) = state.start();
        assert!(matches!(result, Err(SprayError::NoTargets(1))));
    }

    #[test]
    fn twenty_targets_pause_for_refill_at_the_nineteenth() {
        let mut state = state_with(20);
        let (result, mut events) = state.start();
        result.unwrap();

        // 18 completions at 50 units each leave 100 in a 1000-unit tank.
        for i in 0..18 {
            let id = next_target_id(&events).unwrap_or_else(|| panic!("no target after {i}"));
            events = state.target_completed(&id, true);
        }
        assert_eq!(state.tank.current(), 100.0);

        // The 19th target trips the refill pause instead of a next-target.
        assert!(next_target_id(&events).is_none());
        let refill = events.iter().find_map(|e| match e {
            BrokerEvent::SprayRefillRequired {
                targets_remaining, ..
            } => Some(*targets_remaining),
            _ => None,
        });
        assert_eq!(refill, Some(2));
        assert!(state.awaiting().is_none());

        // Refill resumes from target 19 with a full tank.
        let (tank, events) = state.refill_complete();
        assert_eq!(tank.current, 1000.0);
        assert_eq!(tank.refill_count, 1);
        let id = next_target_id(&events).unwrap();
        let events = state.target_completed(&id, true);
        let id = next_target_id(&events).unwrap();
        let events = state.target_completed(&id, true);

        let done = events.iter().any(|e| matches!(
            e,
            BrokerEvent::SprayMissionComplete { mission, .. }
                if mission.completed == 20 && mission.failed == 0 && mission.refills == 1
        ));
        assert!(done);
    }

    #[test]
    fn failures_advance_without_touching_the_tank() {
        let mut state = state_with(2);
        let (_, events) = state.start();
        let id = next_target_id(&events).unwrap();
        let before = state.tank.current();
        let events = state.target_completed(&id, false);
        assert_eq!(state.tank.current(), before);
        // The mission moved on to the second target.
        let id2 = next_target_id(&events).unwrap();
        assert_ne!(id, id2);
        let events = state.target_completed(&id2, true);
        assert!(events.iter().any(|e| matches!(
            e,
            BrokerEvent::SprayMissionComplete { mission, .. }
                if mission.completed == 1 && mission.failed == 1
        )));
    }

    #[test]
    fn double_start_is_rejected() {
        let mut state = state_with(3);
        state.start().0.unwrap();
        assert!(matches!(state.start().0, Err(SprayError::AlreadyActive(1))));
    }

    #[test]
    fn completion_timeout_marks_the_target_failed() {
        let mut state = state_with(1);
        let (_, events) = state.start();
        assert!(next_target_id(&events).is_some());
        let events = state.on_completion_timeout();
        assert!(events.iter().any(|e| matches!(
            e,
            BrokerEvent::SprayTargetComplete { success: false, .. }
        )));
    }

    #[test]
    fn stale_completion_ids_are_ignored() {
        let mut state = state_with(2);
        let (_, events) = state.start();
        let _real = next_target_id(&events).unwrap();
        let events = state.target_completed("t9-99", true);
        assert!(events.is_empty());
        assert_eq!(state.mission.as_ref().unwrap().completed, 0);
    }
}
