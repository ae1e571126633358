use serde::{Deserialize, Serialize};

/// Origin tag for detections that arrived over the vehicle serial link (as
/// opposed to a future direct payload feed).
pub const DETECTION_SOURCE_SERIAL: &str = "serial-link";

/// A payload-side crop detection, decoded from a `DET|...` status string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub detection_id: String,
    pub latitude: f64,
    pub longitude: f64,
    /// 0..=1
    pub confidence: f64,
    pub area: u32,
    pub source: String,
    pub vehicle_id: u8,
    pub timestamp_ms: i64,
}

/// Rolling detection counters reported by the payload (`DSTAT|...`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionStats {
    pub total: u32,
    pub active: u32,
    pub mission: String,
    pub vehicle_id: u8,
    pub timestamp_ms: i64,
}

/// Image-captured metadata (`IMG|...`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageCaptured {
    pub image_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub kind: String,
    pub mission: String,
    pub vehicle_id: u8,
    pub timestamp_ms: i64,
}

/// Payload-host health (`STAT|...`): CPU / memory / disk in percent,
/// temperature in Celsius.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PiStats {
    pub cpu_pct: f32,
    pub mem_pct: f32,
    pub disk_pct: f32,
    pub temp_c: f32,
    pub vehicle_id: u8,
    pub timestamp_ms: i64,
}
