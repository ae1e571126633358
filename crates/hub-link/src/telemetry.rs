//! Per-vehicle telemetry aggregation: merges decoded messages into the live
//! [`Snapshot`] and keeps the bounded ring of recent status strings. Single
//! writer (the vehicle task); readers take copies.

use std::collections::VecDeque;

use mavlink::common::{MavMessage, MavModeFlag};

use hub_proto::now_ms;
use hub_proto::telemetry::{Snapshot, StatusRecord};

use crate::modes;
use crate::units;

#[derive(Debug)]
pub struct Aggregator {
    snap: Snapshot,
    ring: VecDeque<StatusRecord>,
    ring_capacity: usize,
}

impl Aggregator {
    pub fn new(ring_capacity: usize) -> Self {
        Self {
            snap: Snapshot::default(),
            ring: VecDeque::with_capacity(ring_capacity),
            ring_capacity: ring_capacity.max(1),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snap.clone()
    }

    pub fn status_ring(&self) -> Vec<StatusRecord> {
        self.ring.iter().cloned().collect()
    }

    /// Merges one decoded message. Returns the status record when the
    /// message appended to the ring, so the caller can run the payload
    /// parser over exactly the new entries.
    pub fn apply(&mut self, msg: &MavMessage) -> Option<StatusRecord> {
        let mut appended = None;
        match msg {
            MavMessage::HEARTBEAT(hb) => {
                self.snap.armed = hb.base_mode.contains(MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED);
                if hb.base_mode.contains(MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED) {
                    self.snap.flight_mode = modes::mode_name(hb.custom_mode);
                }
                self.snap.system_status = modes::system_status_name(hb.system_status).to_string();
            }
            MavMessage::GLOBAL_POSITION_INT(p) => {
                self.snap.latitude = units::scaled_deg(p.lat);
                self.snap.longitude = units::scaled_deg(p.lon);
                self.snap.gps.alt_amsl_m = units::mm_to_m(p.alt);
                self.snap.altitude_m = units::mm_to_m(p.relative_alt);
                if let Some(h) = units::cdeg_to_deg(p.hdg) {
                    self.snap.heading_deg = h;
                }
                let vx = units::cm_s_to_m_s(p.vx);
                let vy = units::cm_s_to_m_s(p.vy);
                self.snap.groundspeed_mps = (vx * vx + vy * vy).sqrt();
            }
            MavMessage::GPS_RAW_INT(g) => {
                self.snap.gps.fix_type = g.fix_type as u8;
                self.snap.gps.satellites_visible = g.satellites_visible;
                self.snap.gps.hdop = units::eph_to_hdop(g.eph);
            }
            MavMessage::ATTITUDE(a) => {
                self.snap.roll_deg = units::rad_to_deg(a.roll);
                self.snap.pitch_deg = units::rad_to_deg(a.pitch);
                self.snap.yaw_deg = units::rad_to_deg(a.yaw);
            }
            MavMessage::VFR_HUD(v) => {
                self.snap.climb_rate_mps = v.climb;
                self.snap.throttle_pct = v.throttle;
                // Fallbacks for vehicles that stream VFR_HUD but not
                // GLOBAL_POSITION_INT.
                if self.snap.groundspeed_mps == 0.0 {
                    self.snap.groundspeed_mps = v.groundspeed;
                }
                if self.snap.altitude_m == 0.0 {
                    self.snap.altitude_m = v.alt as f64;
                }
            }
            MavMessage::SYS_STATUS(s) => {
                if let Some(v) = units::mv_to_v(s.voltage_battery) {
                    self.snap.battery_voltage_v = v;
                }
                if let Some(a) = units::ca_to_a(s.current_battery) {
                    self.snap.battery_current_a = a;
                }
                if (0..=100).contains(&s.battery_remaining) {
                    self.snap.battery_remaining_pct = s.battery_remaining as u8;
                }
            }
            MavMessage::BATTERY_STATUS(b) => {
                if let Some(v) = units::mv_to_v(b.voltages[0]) {
                    self.snap.battery_voltage_v = v;
                }
                if b.current_battery != -1 {
                    self.snap.battery_current_a = b.current_battery as f32 / 100.0;
                }
                if (0..=100).contains(&b.battery_remaining) {
                    self.snap.battery_remaining_pct = b.battery_remaining as u8;
                }
            }
            MavMessage::SERVO_OUTPUT_RAW(s) => {
                self.snap.spray_pwm = Some(s.servo8_raw);
            }
            MavMessage::MISSION_CURRENT(m) => {
                self.snap.mission_current = m.seq;
            }
            MavMessage::STATUSTEXT(st) => {
                let record = StatusRecord {
                    severity: st.severity as u8,
                    text: decode_statustext(&st.text),
                    timestamp_ms: now_ms(),
                };
                if self.ring.len() >= self.ring_capacity {
                    self.ring.pop_front();
                }
                self.ring.push_back(record.clone());
                appended = Some(record);
            }
            _ => return appended,
        }
        self.snap.last_update_ms = now_ms();
        appended
    }
}

fn decode_statustext(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mavlink::common::{
        GpsFixType, MavAutopilot, MavSeverity, MavState, MavType, ATTITUDE_DATA,
        GLOBAL_POSITION_INT_DATA, GPS_RAW_INT_DATA, HEARTBEAT_DATA, STATUSTEXT_DATA,
        SYS_STATUS_DATA,
    };

    fn heartbeat(armed: bool, custom_mode: u32) -> MavMessage {
        let mut base = MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED;
        if armed {
            base |= MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED;
        }
        MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            custom_mode,
            mavtype: MavType::MAV_TYPE_QUADROTOR,
            autopilot: MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA,
            base_mode: base,
            system_status: MavState::MAV_STATE_ACTIVE,
            mavlink_version: 3,
        })
    }

    fn statustext(text: &str) -> MavMessage {
        let mut buf = [0u8; 50];
        for (i, b) in text.bytes().take(50).enumerate() {
            buf[i] = b;
        }
        MavMessage::STATUSTEXT(STATUSTEXT_DATA {
            severity: MavSeverity::MAV_SEVERITY_INFO,
            text: buf,
            ..Default::default()
        })
    }

    #[test]
    fn position_converts_wire_units() {
        let mut agg = Aggregator::new(20);
        agg.apply(&MavMessage::GLOBAL_POSITION_INT(GLOBAL_POSITION_INT_DATA {
            time_boot_ms: 0,
            lat: 232_950_000,
            lon: 853_100_000,
            alt: 912_000,
            relative_alt: 15_000,
            vx: 300,
            vy: 400,
            vz: 0,
            hdg: 9_000,
        }));
        let s = agg.snapshot();
        assert!((s.latitude - 23.295).abs() < 1e-9);
        assert!((s.longitude - 85.31).abs() < 1e-9);
        assert!((s.altitude_m - 15.0).abs() < 1e-9);
        assert!((s.gps.alt_amsl_m - 912.0).abs() < 1e-9);
        assert!((s.heading_deg - 90.0).abs() < 1e-6);
        assert!((s.groundspeed_mps - 5.0).abs() < 1e-6);
        assert!((-90.0..=90.0).contains(&s.latitude));
        assert!((-180.0..=180.0).contains(&s.longitude));
    }

    #[test]
    fn heartbeat_decodes_arming_and_mode() {
        let mut agg = Aggregator::new(20);
        agg.apply(&heartbeat(true, 4));
        let s = agg.snapshot();
        assert!(s.armed);
        assert_eq!(s.flight_mode, "GUIDED");
        assert_eq!(s.system_status, "ACTIVE");

        agg.apply(&heartbeat(false, 99));
        let s = agg.snapshot();
        assert!(!s.armed);
        assert_eq!(s.flight_mode, "MODE_99");
    }

    #[test]
    fn updates_merge_rather_than_replace() {
        let mut agg = Aggregator::new(20);
        agg.apply(&MavMessage::GPS_RAW_INT(GPS_RAW_INT_DATA {
            eph: 120,
            fix_type: GpsFixType::GPS_FIX_TYPE_3D_FIX,
            satellites_visible: 11,
            ..Default::default()
        }));
        agg.apply(&MavMessage::ATTITUDE(ATTITUDE_DATA {
            time_boot_ms: 0,
            roll: 0.1,
            pitch: -0.05,
            yaw: 1.0,
            rollspeed: 0.0,
            pitchspeed: 0.0,
            yawspeed: 0.0,
        }));
        let s = agg.snapshot();
        // The attitude update must not have reset the GPS fields.
        assert_eq!(s.gps.fix_type, 3);
        assert_eq!(s.gps.satellites_visible, 11);
        assert!((s.gps.hdop - 1.2).abs() < 1e-6);
        assert!(s.roll_deg > 5.7 && s.roll_deg < 5.8);
    }

    #[test]
    fn sys_status_honors_sentinels() {
        let mut agg = Aggregator::new(20);
        agg.apply(&MavMessage::SYS_STATUS(SYS_STATUS_DATA {
            voltage_battery: 12_600,
            current_battery: -1,
            battery_remaining: 87,
            ..Default::default()
        }));
        let before = agg.snapshot();
        assert_eq!(before.battery_voltage_v, 12.6);
        assert_eq!(before.battery_current_a, 0.0);
        assert_eq!(before.battery_remaining_pct, 87);

        agg.apply(&MavMessage::SYS_STATUS(SYS_STATUS_DATA {
            voltage_battery: u16::MAX,
            current_battery: 250,
            battery_remaining: -1,
            ..Default::default()
        }));
        let after = agg.snapshot();
        // Unreported voltage/percent keep their last good values.
        assert_eq!(after.battery_voltage_v, 12.6);
        assert_eq!(after.battery_remaining_pct, 87);
        assert_eq!(after.battery_current_a, 2.5);
        assert!(after.battery_remaining_pct <= 100);
    }

    #[test]
    fn status_ring_evicts_oldest_and_preserves_order() {
        let mut agg = Aggregator::new(3);
        for i in 0..5 {
            let rec = agg.apply(&statustext(&format!("msg {i}")));
            assert!(rec.is_some());
        }
        let ring = agg.status_ring();
        let texts: Vec<&str> = ring.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, vec!["msg 2", "msg 3", "msg 4"]);
    }
}
