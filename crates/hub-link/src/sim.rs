//! Simulated vehicle: a virtual flight controller behind the normal link
//! plumbing. Speaks just enough of the protocol for operator workflows —
//! heartbeat/position/battery telemetry at 1 Hz, arm/disarm/mode/takeoff
//! acks, the vehicle side of the mission-upload handshake, and constant
//! speed motion along an installed mission.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use mavlink::common::{
    GpsFixType, MavAutopilot, MavCmd, MavMessage, MavMissionResult, MavModeFlag, MavResult,
    MavState, MavType, ATTITUDE_DATA, COMMAND_ACK_DATA, GLOBAL_POSITION_INT_DATA,
    GPS_RAW_INT_DATA, HEARTBEAT_DATA, MISSION_ACK_DATA, MISSION_CURRENT_DATA,
    MISSION_ITEM_INT_DATA, MISSION_REQUEST_INT_DATA, SYS_STATUS_DATA, VFR_HUD_DATA,
};
use mavlink::MavHeader;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::link::{LinkShared, OUTBOUND_DEPTH};
use crate::modes;
use crate::units;

/// Ground speed of the simulated airframe, expressed in degrees of
/// latitude/longitude per second (~2.5 m/s near the equator).
const SPEED_DEG_PER_SEC: f64 = 0.000025;

#[derive(Debug, Clone)]
struct SimItem {
    lat: f64,
    lon: f64,
    alt: f64,
    cmd: MavCmd,
}

struct UploadState {
    expected: u16,
    items: Vec<MISSION_ITEM_INT_DATA>,
}

struct SimVehicle {
    vehicle_id: u8,
    lat: f64,
    lon: f64,
    rel_alt: f64,
    armed: bool,
    mode: String,
    battery_pct: f32,
    heading_deg: f32,
    groundspeed: f32,

    takeoff_target: Option<f64>,
    goto_target: Option<(f64, f64, f64)>,

    mission: Vec<SimItem>,
    mission_active: bool,
    current_item: usize,
    upload: Option<UploadState>,

    seq: u8,
}

impl SimVehicle {
    fn new(vehicle_id: u8) -> Self {
        Self {
            vehicle_id,
            // Staggered spawn points so simulated fleets do not overlap.
            lat: 12.9716 + vehicle_id as f64 * 0.001,
            lon: 77.5946 + vehicle_id as f64 * 0.001,
            rel_alt: 0.0,
            armed: false,
            mode: "STABILIZE".into(),
            battery_pct: 100.0,
            heading_deg: 0.0,
            groundspeed: 0.0,
            takeoff_target: None,
            goto_target: None,
            mission: Vec::new(),
            mission_active: false,
            current_item: 0,
            upload: None,
            seq: 0,
        }
    }

    fn header(&mut self) -> MavHeader {
        self.seq = self.seq.wrapping_add(1);
        MavHeader {
            system_id: 1,
            component_id: 1,
            sequence: self.seq,
        }
    }

    fn battery_voltage(&self) -> f32 {
        14.4 + (self.battery_pct / 100.0) * 2.4
    }

    fn ack(&self, command: MavCmd, result: MavResult) -> MavMessage {
        MavMessage::COMMAND_ACK(COMMAND_ACK_DATA {
            command,
            result,
            ..Default::default()
        })
    }

    fn handle(&mut self, msg: MavMessage) -> Vec<MavMessage> {
        match msg {
            MavMessage::COMMAND_LONG(cmd) => self.handle_command(cmd),
            MavMessage::MISSION_CLEAR_ALL(_) => {
                self.mission.clear();
                self.mission_active = false;
                self.current_item = 0;
                vec![MavMessage::MISSION_ACK(MISSION_ACK_DATA {
                    target_system: 255,
                    target_component: 190,
                    mavtype: MavMissionResult::MAV_MISSION_ACCEPTED,
                    ..Default::default()
                })]
            }
            MavMessage::MISSION_COUNT(c) => {
                debug!("sim {}: upload of {} items starting", self.vehicle_id, c.count);
                self.upload = Some(UploadState {
                    expected: c.count,
                    items: Vec::with_capacity(c.count as usize),
                });
                vec![self.request_item(0)]
            }
            MavMessage::MISSION_ITEM_INT(item) => self.handle_mission_item(item),
            _ => Vec::new(),
        }
    }

    fn handle_command(&mut self, cmd: mavlink::common::COMMAND_LONG_DATA) -> Vec<MavMessage> {
        match cmd.command {
            MavCmd::MAV_CMD_COMPONENT_ARM_DISARM => {
                self.armed = cmd.param1 > 0.5;
                if !self.armed {
                    self.takeoff_target = None;
                    self.goto_target = None;
                    self.mission_active = false;
                }
                info!("sim {}: {}", self.vehicle_id, if self.armed { "armed" } else { "disarmed" });
                vec![self.ack(cmd.command, MavResult::MAV_RESULT_ACCEPTED)]
            }
            MavCmd::MAV_CMD_DO_SET_MODE => {
                self.set_mode(modes::mode_name(cmd.param2 as u32));
                vec![self.ack(cmd.command, MavResult::MAV_RESULT_ACCEPTED)]
            }
            MavCmd::MAV_CMD_NAV_TAKEOFF => {
                if !self.armed {
                    return vec![self.ack(cmd.command, MavResult::MAV_RESULT_DENIED)];
                }
                self.mode = "GUIDED".into();
                self.takeoff_target = Some(cmd.param7 as f64);
                vec![self.ack(cmd.command, MavResult::MAV_RESULT_ACCEPTED)]
            }
            MavCmd::MAV_CMD_NAV_WAYPOINT => {
                // Guided reposition: coordinates ride in params 5..7.
                if !self.armed {
                    return vec![self.ack(cmd.command, MavResult::MAV_RESULT_DENIED)];
                }
                self.goto_target =
                    Some((cmd.param5 as f64, cmd.param6 as f64, cmd.param7 as f64));
                self.mode = "GUIDED".into();
                vec![self.ack(cmd.command, MavResult::MAV_RESULT_ACCEPTED)]
            }
            MavCmd::MAV_CMD_NAV_LAND => {
                self.takeoff_target = Some(0.0);
                self.mode = "LAND".into();
                vec![self.ack(cmd.command, MavResult::MAV_RESULT_ACCEPTED)]
            }
            MavCmd::MAV_CMD_NAV_RETURN_TO_LAUNCH => {
                self.set_mode("RTL".into());
                vec![self.ack(cmd.command, MavResult::MAV_RESULT_ACCEPTED)]
            }
            // Payload-control passthrough: the virtual payload just accepts.
            MavCmd::MAV_CMD_USER_1 | MavCmd::MAV_CMD_USER_2 | MavCmd::MAV_CMD_USER_3 => {
                vec![self.ack(cmd.command, MavResult::MAV_RESULT_ACCEPTED)]
            }
            other => vec![self.ack(other, MavResult::MAV_RESULT_ACCEPTED)],
        }
    }

    fn set_mode(&mut self, mode: String) {
        if mode == "AUTO" && !self.mission.is_empty() {
            self.mission_active = true;
            self.current_item = 0;
            info!(
                "sim {}: AUTO mission started ({} items)",
                self.vehicle_id,
                self.mission.len()
            );
        }
        if mode != "AUTO" {
            self.mission_active = false;
        }
        self.mode = mode;
    }

    fn request_item(&self, seq: u16) -> MavMessage {
        MavMessage::MISSION_REQUEST_INT(MISSION_REQUEST_INT_DATA {
            target_system: 255,
            target_component: 190,
            seq,
            ..Default::default()
        })
    }

    fn handle_mission_item(&mut self, item: MISSION_ITEM_INT_DATA) -> Vec<MavMessage> {
        let Some(upload) = self.upload.as_mut() else {
            return Vec::new();
        };
        if item.seq as usize == upload.items.len() {
            upload.items.push(item);
        }
        if (upload.items.len() as u16) < upload.expected {
            let next = upload.items.len() as u16;
            return vec![self.request_item(next)];
        }
        let upload = self.upload.take().unwrap();
        self.mission = upload
            .items
            .iter()
            .map(|i| SimItem {
                lat: units::scaled_deg(i.x),
                lon: units::scaled_deg(i.y),
                alt: i.z as f64,
                cmd: i.command,
            })
            .collect();
        self.current_item = 0;
        info!("sim {}: mission of {} items installed", self.vehicle_id, self.mission.len());
        vec![MavMessage::MISSION_ACK(MISSION_ACK_DATA {
            target_system: 255,
            target_component: 190,
            mavtype: MavMissionResult::MAV_MISSION_ACCEPTED,
            ..Default::default()
        })]
    }

    /// One second of simulated flight.
    fn step(&mut self) {
        if self.armed {
            self.battery_pct = (self.battery_pct - 0.01).max(0.0);
        }
        if let Some(target) = self.takeoff_target {
            let diff = target - self.rel_alt;
            if diff.abs() < 0.2 {
                self.rel_alt = target;
                self.takeoff_target = None;
            } else {
                self.rel_alt += diff * 0.5;
            }
        }
        if self.mission_active {
            self.step_mission();
        } else if let Some((lat, lon, alt)) = self.goto_target {
            if self.move_toward(lat, lon, alt) {
                self.goto_target = None;
                self.groundspeed = 0.0;
            }
        } else if self.takeoff_target.is_none() {
            self.groundspeed = 0.0;
        }
    }

    fn step_mission(&mut self) {
        let Some(item) = self.mission.get(self.current_item).cloned() else {
            self.mission_active = false;
            return;
        };
        match item.cmd {
            MavCmd::MAV_CMD_NAV_RETURN_TO_LAUNCH => {
                // Terminal item: the airframe heads home on its own.
                self.mode = "RTL".into();
                self.mission_active = false;
                self.groundspeed = 0.0;
            }
            MavCmd::MAV_CMD_NAV_TAKEOFF => {
                let diff = item.alt - self.rel_alt;
                if diff.abs() < 0.5 {
                    self.rel_alt = item.alt;
                    self.advance_item();
                } else {
                    self.rel_alt += diff * 0.2;
                }
            }
            _ => {
                if self.move_toward(item.lat, item.lon, item.alt) {
                    self.advance_item();
                }
            }
        }
    }

    fn advance_item(&mut self) {
        self.current_item += 1;
        debug!(
            "sim {}: reached item {}/{}",
            self.vehicle_id,
            self.current_item,
            self.mission.len()
        );
    }

    /// Returns true on arrival. Snaps to the target when the remaining
    /// distance is under 1.5 s of travel so waypoints are hit exactly.
    fn move_toward(&mut self, lat: f64, lon: f64, alt: f64) -> bool {
        let dlat = lat - self.lat;
        let dlon = lon - self.lon;
        let dist = (dlat * dlat + dlon * dlon).sqrt();
        let alt_diff = alt - self.rel_alt;
        if alt_diff.abs() < 0.5 {
            self.rel_alt = alt;
        } else {
            self.rel_alt += alt_diff * 0.2;
        }
        if dist <= SPEED_DEG_PER_SEC * 1.5 {
            self.lat = lat;
            self.lon = lon;
            self.groundspeed = 0.0;
            return (alt - self.rel_alt).abs() < 0.5;
        }
        self.lat += dlat / dist * SPEED_DEG_PER_SEC;
        self.lon += dlon / dist * SPEED_DEG_PER_SEC;
        self.heading_deg = dlon.atan2(dlat).to_degrees() as f32;
        self.groundspeed = 2.5;
        false
    }

    fn telemetry(&mut self) -> Vec<(MavHeader, MavMessage)> {
        let mut base_mode = MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED;
        if self.armed {
            base_mode |= MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED;
        }
        let mut out = vec![
            MavMessage::HEARTBEAT(HEARTBEAT_DATA {
                custom_mode: modes::mode_number(&self.mode).unwrap_or(0),
                mavtype: MavType::MAV_TYPE_QUADROTOR,
                autopilot: MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA,
                base_mode,
                system_status: if self.armed {
                    MavState::MAV_STATE_ACTIVE
                } else {
                    MavState::MAV_STATE_STANDBY
                },
                mavlink_version: 3,
            }),
            MavMessage::SYS_STATUS(SYS_STATUS_DATA {
                voltage_battery: (self.battery_voltage() * 1000.0) as u16,
                current_battery: if self.armed { 1200 } else { 80 },
                battery_remaining: self.battery_pct as i8,
                ..Default::default()
            }),
            MavMessage::GPS_RAW_INT(GPS_RAW_INT_DATA {
                fix_type: GpsFixType::GPS_FIX_TYPE_3D_FIX,
                lat: units::deg_to_scaled(self.lat),
                lon: units::deg_to_scaled(self.lon),
                alt: ((900.0 + self.rel_alt) * 1000.0) as i32,
                eph: 120,
                satellites_visible: 12,
                ..Default::default()
            }),
            MavMessage::GLOBAL_POSITION_INT(GLOBAL_POSITION_INT_DATA {
                time_boot_ms: 0,
                lat: units::deg_to_scaled(self.lat),
                lon: units::deg_to_scaled(self.lon),
                alt: ((900.0 + self.rel_alt) * 1000.0) as i32,
                relative_alt: (self.rel_alt * 1000.0) as i32,
                vx: (self.groundspeed * 100.0) as i16,
                vy: 0,
                vz: 0,
                hdg: (self.heading_deg.rem_euclid(360.0) * 100.0) as u16,
            }),
            MavMessage::ATTITUDE(ATTITUDE_DATA {
                time_boot_ms: 0,
                roll: 0.0,
                pitch: 0.0,
                yaw: self.heading_deg.to_radians(),
                rollspeed: 0.0,
                pitchspeed: 0.0,
                yawspeed: 0.0,
            }),
            MavMessage::VFR_HUD(VFR_HUD_DATA {
                airspeed: self.groundspeed,
                groundspeed: self.groundspeed,
                alt: self.rel_alt as f32,
                climb: 0.0,
                heading: self.heading_deg as i16,
                throttle: if self.armed { 45 } else { 0 },
            }),
        ];
        if self.mission_active || !self.mission.is_empty() {
            out.push(MavMessage::MISSION_CURRENT(MISSION_CURRENT_DATA {
                seq: self.current_item.min(u16::MAX as usize) as u16,
                ..Default::default()
            }));
        }
        out.into_iter().map(|m| (self.header(), m)).collect()
    }
}

/// Starts the simulated transport: commands in on the returned sender,
/// synthesized telemetry and protocol replies out through `inbound_tx`.
pub(crate) fn start_sim(
    vehicle_id: u8,
    inbound_tx: mpsc::Sender<(MavHeader, MavMessage)>,
    shared: Arc<LinkShared>,
) -> mpsc::Sender<MavMessage> {
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<MavMessage>(OUTBOUND_DEPTH);

    tokio::spawn(async move {
        let mut vehicle = SimVehicle::new(vehicle_id);
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        info!("sim {}: virtual flight controller started", vehicle_id);
        loop {
            if !shared.running.load(Ordering::Relaxed) {
                break;
            }
            tokio::select! {
                maybe = outbound_rx.recv() => {
                    let Some(msg) = maybe else { break };
                    for reply in vehicle.handle(msg) {
                        let frame = (vehicle.header(), reply);
                        if inbound_tx.send(frame).await.is_err() {
                            return;
                        }
                    }
                }
                _ = tick.tick() => {
                    vehicle.step();
                    for frame in vehicle.telemetry() {
                        if inbound_tx.send(frame).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
        debug!("sim {}: loop ended", vehicle_id);
    });

    outbound_tx
}
