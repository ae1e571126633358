use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetState {
    Queued,
    Dispensing,
    Completed,
    Failed,
}

/// One detection-derived dispense target in a spray queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SprayTarget {
    pub target_id: String,
    pub detection_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_m: f64,
    pub required_volume: f64,
    pub state: TargetState,
    pub queued_at_ms: i64,
    pub sprayed_at_ms: Option<i64>,
    pub confidence: f64,
    pub priority: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SprayMissionStatus {
    Active,
    Refilling,
    Completed,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SprayMissionInfo {
    pub id: String,
    pub vehicle_id: u8,
    pub status: SprayMissionStatus,
    pub started_at_ms: i64,
    pub ended_at_ms: Option<i64>,
    pub current_target_index: usize,
    pub total_targets: usize,
    pub completed: usize,
    pub failed: usize,
    pub refills: u32,
}

/// Tank readout. `current` never exceeds `capacity` and never goes negative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TankStatus {
    pub capacity: f64,
    pub current: f64,
    pub refill_count: u32,
    pub last_refill_ms: Option<i64>,
    pub total_dispensed: f64,
}
