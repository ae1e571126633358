use serde::{Deserialize, Serialize};

/// Operator-supplied survey point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Waypoint {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    #[serde(default)]
    pub seq: Option<u32>,
}

/// Mission-level parameters supplied alongside the waypoint list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MissionParams {
    /// Survey altitude, metres. Falls back to the first waypoint's altitude.
    #[serde(default)]
    pub altitude: Option<f64>,
    /// Survey groundspeed, m/s.
    #[serde(default)]
    pub speed: Option<f64>,
    /// Covered area, square metres (display only).
    #[serde(default)]
    pub area: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionPhase {
    Idle,
    Uploading,
    Arming,
    Guided,
    Auto,
    Running,
    Paused,
    Completed,
    Stopped,
    Failed,
}

/// One frame of the streamed mission progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionProgress {
    pub mission_id: String,
    pub vehicle_id: u8,
    pub phase: MissionPhase,
    pub total_items: u16,
    pub current_item: u16,
    pub progress_pct: f32,
    /// Set when the vehicle was more than 10 m from the first survey point
    /// at start; the operator UI decides whether that matters.
    pub position_mismatch: bool,
    pub message: String,
}
