//! Operator-channel wire format: inbound commands and outbound events, both
//! closed sets, framed as `{"event": "...", "data": {...}}` JSON.

use serde::{Deserialize, Serialize};

use crate::events::{DetectionEvent, DetectionStats, ImageCaptured, PiStats};
use crate::mission::{MissionParams, MissionProgress, Waypoint};
use crate::spray::{SprayMissionInfo, SprayTarget, TankStatus};
use crate::telemetry::{DroneSummary, Snapshot};

/// Everything a browser client may ask of the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientCommand {
    Arm { vehicle_id: u8 },
    Disarm { vehicle_id: u8 },
    SetMode { vehicle_id: u8, mode: String },
    Takeoff { vehicle_id: u8, altitude: f32 },
    Land { vehicle_id: u8 },
    Rtl { vehicle_id: u8 },
    Goto { vehicle_id: u8, latitude: f64, longitude: f64, altitude: f32 },

    Reconnect { vehicle_id: u8 },
    Sync,
    Simulate { vehicle_id: u8 },

    StartMission {
        vehicle_id: u8,
        waypoints: Vec<Waypoint>,
        #[serde(default)]
        params: MissionParams,
    },
    PauseMission { vehicle_id: u8 },
    ResumeMission { vehicle_id: u8 },
    StopMission { vehicle_id: u8 },

    SprayQueueTargets { vehicle_id: u8, detections: Vec<DetectionEvent> },
    SprayStart { vehicle_id: u8 },
    SprayStop { vehicle_id: u8 },
    SprayRefillComplete { vehicle_id: u8 },
    SprayClearQueue { vehicle_id: u8 },
    /// The spray orchestrator never assumes a target done; whoever flies
    /// the vehicle to the target reports the outcome with this.
    SprayTargetComplete { vehicle_id: u8, target_id: String, success: bool },

    StartDetection { vehicle_id: u8 },
    StopDetection { vehicle_id: u8 },
    RequestPiStats { vehicle_id: u8 },

    RequestDroneList,
}

impl ClientCommand {
    /// Short name echoed back in `command_result` frames.
    pub fn name(&self) -> &'static str {
        match self {
            ClientCommand::Arm { .. } => "arm",
            ClientCommand::Disarm { .. } => "disarm",
            ClientCommand::SetMode { .. } => "set_mode",
            ClientCommand::Takeoff { .. } => "takeoff",
            ClientCommand::Land { .. } => "land",
            ClientCommand::Rtl { .. } => "rtl",
            ClientCommand::Goto { .. } => "goto",
            ClientCommand::Reconnect { .. } => "reconnect",
            ClientCommand::Sync => "sync",
            ClientCommand::Simulate { .. } => "simulate",
            ClientCommand::StartMission { .. } => "start_mission",
            ClientCommand::PauseMission { .. } => "pause_mission",
            ClientCommand::ResumeMission { .. } => "resume_mission",
            ClientCommand::StopMission { .. } => "stop_mission",
            ClientCommand::SprayQueueTargets { .. } => "spray_queue_targets",
            ClientCommand::SprayStart { .. } => "spray_start",
            ClientCommand::SprayStop { .. } => "spray_stop",
            ClientCommand::SprayRefillComplete { .. } => "spray_refill_complete",
            ClientCommand::SprayClearQueue { .. } => "spray_clear_queue",
            ClientCommand::SprayTargetComplete { .. } => "spray_target_complete",
            ClientCommand::StartDetection { .. } => "start_detection",
            ClientCommand::StopDetection { .. } => "stop_detection",
            ClientCommand::RequestPiStats { .. } => "request_pi_stats",
            ClientCommand::RequestDroneList => "request_drone_list",
        }
    }

    pub fn vehicle_id(&self) -> Option<u8> {
        match self {
            ClientCommand::Arm { vehicle_id }
            | ClientCommand::Disarm { vehicle_id }
            | ClientCommand::SetMode { vehicle_id, .. }
            | ClientCommand::Takeoff { vehicle_id, .. }
            | ClientCommand::Land { vehicle_id }
            | ClientCommand::Rtl { vehicle_id }
            | ClientCommand::Goto { vehicle_id, .. }
            | ClientCommand::Reconnect { vehicle_id }
            | ClientCommand::Simulate { vehicle_id }
            | ClientCommand::StartMission { vehicle_id, .. }
            | ClientCommand::PauseMission { vehicle_id }
            | ClientCommand::ResumeMission { vehicle_id }
            | ClientCommand::StopMission { vehicle_id }
            | ClientCommand::SprayQueueTargets { vehicle_id, .. }
            | ClientCommand::SprayStart { vehicle_id }
            | ClientCommand::SprayStop { vehicle_id }
            | ClientCommand::SprayRefillComplete { vehicle_id }
            | ClientCommand::SprayClearQueue { vehicle_id }
            | ClientCommand::SprayTargetComplete { vehicle_id, .. }
            | ClientCommand::StartDetection { vehicle_id }
            | ClientCommand::StopDetection { vehicle_id }
            | ClientCommand::RequestPiStats { vehicle_id } => Some(*vehicle_id),
            ClientCommand::Sync | ClientCommand::RequestDroneList => None,
        }
    }
}

/// Everything the broker pushes to connected clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum BrokerEvent {
    DroneConnected { vehicle_id: u8 },
    DroneDisconnected { vehicle_id: u8 },
    DroneTelemetryUpdate { vehicle_id: u8, snapshot: Snapshot },
    DronesStatus { drones: Vec<DroneSummary> },

    CropDetection(DetectionEvent),
    DetectionStats(DetectionStats),
    ImageCaptured(ImageCaptured),
    PiStats(PiStats),

    MissionStarted { mission_id: String, vehicle_id: u8, total_items: u16 },
    MissionPaused { mission_id: String, vehicle_id: u8 },
    MissionStopped { mission_id: String, vehicle_id: u8 },
    MissionStatus(MissionProgress),

    SprayMissionStarted { vehicle_id: u8, mission: SprayMissionInfo },
    SprayMissionStopped { vehicle_id: u8, mission: SprayMissionInfo },
    SprayMissionComplete { vehicle_id: u8, mission: SprayMissionInfo },
    SprayRefillRequired { vehicle_id: u8, targets_remaining: usize, tank: TankStatus },
    SprayRefillComplete { vehicle_id: u8, tank: TankStatus },
    SprayNextTarget { vehicle_id: u8, target: SprayTarget },
    SprayTargetComplete { vehicle_id: u8, target: SprayTarget, success: bool },
    SprayQueueUpdated { vehicle_id: u8, queued: usize },

    CommandResult {
        success: bool,
        vehicle_id: Option<u8>,
        command: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_command_round_trips_through_json() {
        let raw = r#"{"event":"takeoff","data":{"vehicle_id":1,"altitude":10.0}}"#;
        let cmd: ClientCommand = serde_json::from_str(raw).unwrap();
        assert!(matches!(cmd, ClientCommand::Takeoff { vehicle_id: 1, .. }));
        assert_eq!(cmd.name(), "takeoff");
        assert_eq!(cmd.vehicle_id(), Some(1));
    }

    #[test]
    fn broker_event_uses_snake_case_tags() {
        let ev = BrokerEvent::DroneDisconnected { vehicle_id: 3 };
        let s = serde_json::to_string(&ev).unwrap();
        assert!(s.contains(r#""event":"drone_disconnected""#), "{s}");
        assert!(s.contains(r#""vehicle_id":3"#), "{s}");
    }

    #[test]
    fn command_result_omits_error_when_absent() {
        let ev = BrokerEvent::CommandResult {
            success: true,
            vehicle_id: Some(1),
            command: "arm".into(),
            error: None,
        };
        let s = serde_json::to_string(&ev).unwrap();
        assert!(!s.contains("error"), "{s}");
    }
}
