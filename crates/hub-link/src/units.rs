//! Wire-unit normalization. Every conversion between MAVLink payload units
//! and the units the rest of the broker speaks lives here, including the
//! ArduPilot sentinel values for "field not populated".

/// 1e7-scaled integer degrees to decimal degrees.
pub fn scaled_deg(v: i32) -> f64 {
    v as f64 / 1e7
}

pub fn deg_to_scaled(v: f64) -> i32 {
    (v * 1e7) as i32
}

/// Millimetres to metres.
pub fn mm_to_m(v: i32) -> f64 {
    v as f64 / 1000.0
}

/// cm/s to m/s.
pub fn cm_s_to_m_s(v: i16) -> f32 {
    v as f32 / 100.0
}

pub fn rad_to_deg(v: f32) -> f32 {
    v.to_degrees()
}

/// Battery voltage, millivolts to volts. `u16::MAX` means not reported.
pub fn mv_to_v(v: u16) -> Option<f32> {
    (v != u16::MAX).then(|| v as f32 / 1000.0)
}

/// Battery current, centiamps to amps. `-1` means not reported.
pub fn ca_to_a(v: i16) -> Option<f32> {
    (v != -1).then(|| v as f32 / 100.0)
}

/// Heading, centidegrees to degrees. `u16::MAX` means unknown.
pub fn cdeg_to_deg(v: u16) -> Option<f32> {
    (v != u16::MAX).then(|| v as f32 / 100.0)
}

/// GPS horizontal dilution from the scaled `eph` field. `u16::MAX` means
/// unknown and maps to the conventional 99.99 placeholder.
pub fn eph_to_hdop(v: u16) -> f32 {
    if v == u16::MAX {
        99.99
    } else {
        v as f32 / 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degrees_round_trip_within_wire_resolution() {
        for lat in [-89.9999999, -23.295, 0.0, 12.9716, 85.31, 90.0] {
            let back = scaled_deg(deg_to_scaled(lat));
            assert!((back - lat).abs() < 1e-6, "{lat} -> {back}");
            assert!((-90.0..=90.0).contains(&back));
        }
    }

    #[test]
    fn sentinels_map_to_none() {
        assert_eq!(mv_to_v(u16::MAX), None);
        assert_eq!(ca_to_a(-1), None);
        assert_eq!(cdeg_to_deg(u16::MAX), None);
        assert_eq!(eph_to_hdop(u16::MAX), 99.99);
    }

    #[test]
    fn scalar_conversions() {
        assert_eq!(mv_to_v(12_600), Some(12.6));
        assert_eq!(ca_to_a(250), Some(2.5));
        assert_eq!(cm_s_to_m_s(150), 1.5);
        assert_eq!(mm_to_m(5_000), 5.0);
        assert_eq!(cdeg_to_deg(18_000), Some(180.0));
        assert!((rad_to_deg(std::f32::consts::PI) - 180.0).abs() < 1e-3);
    }
}
