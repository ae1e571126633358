use serde::{Deserialize, Serialize};

/// GPS-specific readout. Absolute (AMSL) altitude lives here and only here;
/// everything operator-facing uses the relative altitude on [`Snapshot`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GpsInfo {
    pub fix_type: u8,
    pub satellites_visible: u8,
    pub hdop: f32,
    pub alt_amsl_m: f64,
}

/// Live merged state of one vehicle. Single-writer (the telemetry
/// aggregator); readers always get a copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub latitude: f64,
    pub longitude: f64,
    /// Altitude above the launch point, metres.
    pub altitude_m: f64,
    pub gps: GpsInfo,

    pub roll_deg: f32,
    pub pitch_deg: f32,
    pub yaw_deg: f32,
    pub heading_deg: f32,
    pub groundspeed_mps: f32,
    pub climb_rate_mps: f32,
    pub throttle_pct: u16,

    pub battery_voltage_v: f32,
    pub battery_current_a: f32,
    pub battery_remaining_pct: u8,

    pub flight_mode: String,
    pub armed: bool,
    pub system_status: String,

    /// Sequence number of the mission item the vehicle is flying to.
    pub mission_current: u16,
    /// Raw PWM on the spray servo output, when the vehicle reports one.
    pub spray_pwm: Option<u16>,

    pub last_update_ms: i64,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            latitude: 0.0,
            longitude: 0.0,
            altitude_m: 0.0,
            gps: GpsInfo {
                hdop: 99.99,
                ..GpsInfo::default()
            },
            roll_deg: 0.0,
            pitch_deg: 0.0,
            yaw_deg: 0.0,
            heading_deg: 0.0,
            groundspeed_mps: 0.0,
            climb_rate_mps: 0.0,
            throttle_pct: 0,
            battery_voltage_v: 0.0,
            battery_current_a: 0.0,
            battery_remaining_pct: 0,
            flight_mode: "UNKNOWN".into(),
            armed: false,
            system_status: "UNKNOWN".into(),
            mission_current: 0,
            spray_pwm: None,
            last_update_ms: 0,
        }
    }
}

/// One entry of the per-vehicle status-string ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRecord {
    pub severity: u8,
    pub text: String,
    pub timestamp_ms: i64,
}

/// Registry summary row, one per known vehicle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DroneSummary {
    pub id: u8,
    pub connected: bool,
    pub simulated: bool,
    pub last_seen_ms: Option<i64>,
}
