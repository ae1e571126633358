//! Symbolic operator commands → COMMAND_LONG packets, with ack await and
//! the arm-rejection diagnostics operators actually read.

use std::sync::Arc;
use std::time::Duration;

use mavlink::common::{MavCmd, MavMessage, MavResult, COMMAND_LONG_DATA};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{info, warn};

use hub_link::modes;
use hub_link::vehicle::VehicleHandle;
use hub_link::LinkEvent;
use hub_proto::telemetry::Snapshot;

use crate::registry::{Registry, RegistryError};

// Arm readiness thresholds. Policy, not protocol: they shape warnings and
// diagnostics but never gate a command on their own.
pub const MIN_FIX_TYPE: u8 = 3;
pub const MIN_SATELLITES: u8 = 8;
pub const MIN_BATTERY_V: f32 = 10.5;

#[derive(Debug, Clone)]
pub enum VehicleCommand {
    Arm,
    Disarm,
    SetMode(String),
    Takeoff(f32),
    Land,
    Rtl,
    Goto { lat: f64, lon: f64, alt: f32 },
}

impl VehicleCommand {
    pub fn name(&self) -> &'static str {
        match self {
            VehicleCommand::Arm => "arm",
            VehicleCommand::Disarm => "disarm",
            VehicleCommand::SetMode(_) => "set_mode",
            VehicleCommand::Takeoff(_) => "takeoff",
            VehicleCommand::Land => "land",
            VehicleCommand::Rtl => "rtl",
            VehicleCommand::Goto { .. } => "goto",
        }
    }
}

/// Payload-computer control rides the user command slots.
#[derive(Debug, Clone, Copy)]
pub enum PayloadCommand {
    StartDetection,
    StopDetection,
    RequestStats,
}

impl PayloadCommand {
    fn mav_cmd(self) -> MavCmd {
        match self {
            PayloadCommand::StartDetection => MavCmd::MAV_CMD_USER_1,
            PayloadCommand::StopDetection => MavCmd::MAV_CMD_USER_2,
            PayloadCommand::RequestStats => MavCmd::MAV_CMD_USER_3,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("vehicle {0} not connected")]
    NotConnected(u8),
    #[error("unknown flight mode {0:?}")]
    UnknownMode(String),
    #[error("{0}")]
    Rejected(String),
    #[error("no acknowledgment from vehicle within {}ms", .0.as_millis())]
    AckTimeout(Duration),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Link(#[from] hub_link::LinkError),
}

pub struct CommandRouter {
    registry: Arc<Registry>,
    ack_timeout: Duration,
}

impl CommandRouter {
    pub fn new(registry: Arc<Registry>, ack_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            registry,
            ack_timeout,
        })
    }

    pub async fn execute(&self, vehicle_id: u8, cmd: VehicleCommand) -> Result<(), CommandError> {
        let entry = self.registry.get(vehicle_id)?;
        let handle = &entry.handle;
        if !handle.connected() {
            return Err(CommandError::NotConnected(vehicle_id));
        }
        info!("vehicle {}: executing {}", vehicle_id, cmd.name());

        match &cmd {
            VehicleCommand::Arm => {
                let result = self.command_long(handle, MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]).await?;
                if result != MavResult::MAV_RESULT_ACCEPTED {
                    let diag = compose_arm_diagnostic(&handle.snapshot());
                    warn!("vehicle {}: {}", vehicle_id, diag);
                    return Err(CommandError::Rejected(diag));
                }
            }
            VehicleCommand::Disarm => {
                let result = self.command_long(handle, MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, [0.0; 7]).await?;
                self.check_accepted("DISARM", result, handle)?;
            }
            VehicleCommand::SetMode(mode) => {
                self.set_mode(handle, mode).await?;
            }
            VehicleCommand::Takeoff(alt) => {
                // ArduCopter wants GUIDED before a takeoff command.
                if handle.snapshot().flight_mode != "GUIDED" {
                    self.set_mode(handle, "GUIDED").await?;
                }
                let result = self.command_long(handle, MavCmd::MAV_CMD_NAV_TAKEOFF, [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, *alt]).await?;
                self.check_accepted("TAKEOFF", result, handle)?;
            }
            VehicleCommand::Land => {
                let result = self.command_long(handle, MavCmd::MAV_CMD_NAV_LAND, [0.0; 7]).await?;
                self.check_accepted("LAND", result, handle)?;
            }
            VehicleCommand::Rtl => {
                self.set_mode(handle, "RTL").await?;
            }
            VehicleCommand::Goto { lat, lon, alt } => {
                // Guided-mode reposition rides NAV_WAYPOINT with the
                // coordinates in params 5..7.
                if handle.snapshot().flight_mode != "GUIDED" {
                    self.set_mode(handle, "GUIDED").await?;
                }
                let result = self
                    .command_long(
                        handle,
                        MavCmd::MAV_CMD_NAV_WAYPOINT,
                        [0.0, 0.0, 0.0, 0.0, *lat as f32, *lon as f32, *alt],
                    )
                    .await?;
                self.check_accepted("GOTO", result, handle)?;
            }
        }
        Ok(())
    }

    pub async fn payload_command(
        &self,
        vehicle_id: u8,
        which: PayloadCommand,
    ) -> Result<(), CommandError> {
        let entry = self.registry.get(vehicle_id)?;
        if !entry.handle.connected() {
            return Err(CommandError::NotConnected(vehicle_id));
        }
        let result = self.command_long(&entry.handle, which.mav_cmd(), [0.0; 7]).await?;
        if result != MavResult::MAV_RESULT_ACCEPTED {
            return Err(CommandError::Rejected(format!(
                "payload command rejected by vehicle: {:?}",
                result
            )));
        }
        Ok(())
    }

    async fn set_mode(&self, handle: &VehicleHandle, mode: &str) -> Result<(), CommandError> {
        let number = modes::mode_number(mode)
            .ok_or_else(|| CommandError::UnknownMode(mode.to_string()))?;
        let result = self
            .command_long(handle, MavCmd::MAV_CMD_DO_SET_MODE, [1.0, number as f32, 0.0, 0.0, 0.0, 0.0, 0.0])
            .await?;
        if result != MavResult::MAV_RESULT_ACCEPTED {
            let current = handle.snapshot().flight_mode;
            return Err(CommandError::Rejected(format!(
                "SET_MODE {} rejected by vehicle (current mode {})",
                mode.to_ascii_uppercase(),
                current
            )));
        }
        Ok(())
    }

    /// Sends one COMMAND_LONG and waits for its COMMAND_ACK.
    async fn command_long(
        &self,
        handle: &VehicleHandle,
        command: MavCmd,
        params: [f32; 7],
    ) -> Result<MavResult, CommandError> {
        let (target_system, target_component) = handle.target();
        // Subscribe before sending so a fast ack cannot slip past us.
        let mut rx = handle.subscribe();
        handle
            .send(MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
                target_system,
                target_component,
                command,
                confirmation: 0,
                param1: params[0],
                param2: params[1],
                param3: params[2],
                param4: params[3],
                param5: params[4],
                param6: params[5],
                param7: params[6],
            }))
            .await?;
        self.await_ack(&mut rx, command).await
    }

    async fn await_ack(
        &self,
        rx: &mut broadcast::Receiver<LinkEvent>,
        command: MavCmd,
    ) -> Result<MavResult, CommandError> {
        let deadline = Instant::now() + self.ack_timeout;
        loop {
            let event = match tokio::time::timeout_at(deadline, rx.recv()).await {
                Err(_) => return Err(CommandError::AckTimeout(self.ack_timeout)),
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(CommandError::AckTimeout(self.ack_timeout))
                }
                Ok(Ok(ev)) => ev,
            };
            if let LinkEvent::Message(_, MavMessage::COMMAND_ACK(ack)) = event {
                if ack.command == command {
                    return Ok(ack.result);
                }
            }
        }
    }

    fn check_accepted(
        &self,
        name: &str,
        result: MavResult,
        handle: &VehicleHandle,
    ) -> Result<(), CommandError> {
        if result == MavResult::MAV_RESULT_ACCEPTED {
            return Ok(());
        }
        let snap = handle.snapshot();
        Err(CommandError::Rejected(format!(
            "{} rejected by vehicle: {:?} (mode {}, armed {})",
            name, result, snap.flight_mode, snap.armed
        )))
    }
}

/// Text shown to the operator when an arm request bounces. Names the root
/// cause in domain terms instead of protocol numerics.
pub fn compose_arm_diagnostic(snap: &Snapshot) -> String {
    let mut issues: Vec<&str> = Vec::new();
    if snap.gps.fix_type < MIN_FIX_TYPE {
        issues.push("GPS fix quality low (need 3D)");
    }
    if snap.gps.satellites_visible < MIN_SATELLITES {
        issues.push("Low satellite count (recommended 8+)");
    }
    if snap.battery_voltage_v < MIN_BATTERY_V {
        issues.push("Low battery voltage");
    }
    if !modes::is_armable_mode(&snap.flight_mode) {
        issues.push("Mode not armable");
    }
    let mut msg = format!(
        "ARM rejected by vehicle. GPS: {} fix, {} satellites; Battery: {:.1}V; Mode: {}",
        snap.gps.fix_type, snap.gps.satellites_visible, snap.battery_voltage_v, snap.flight_mode
    );
    if !issues.is_empty() {
        msg.push_str(". Issues: ");
        msg.push_str(&issues.join("; "));
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{VehicleConfig, SIMULATED_ENDPOINT};
    use hub_link::LinkConfig;
    use std::time::Duration as StdDuration;

    fn arm_reject_snapshot() -> Snapshot {
        let mut snap = Snapshot::default();
        snap.gps.fix_type = 0;
        snap.gps.satellites_visible = 5;
        snap.battery_voltage_v = 10.2;
        snap.flight_mode = "STABILIZE".into();
        snap
    }

    #[test]
    fn arm_diagnostic_names_every_failing_check() {
        let msg = compose_arm_diagnostic(&arm_reject_snapshot());
        assert_eq!(
            msg,
            "ARM rejected by vehicle. GPS: 0 fix, 5 satellites; Battery: 10.2V; Mode: STABILIZE. \
             Issues: GPS fix quality low (need 3D); Low satellite count (recommended 8+); \
             Low battery voltage"
        );
    }

    #[test]
    fn arm_diagnostic_is_clean_when_ready() {
        let mut snap = Snapshot::default();
        snap.gps.fix_type = 3;
        snap.gps.satellites_visible = 12;
        snap.battery_voltage_v = 16.4;
        snap.flight_mode = "GUIDED".into();
        let msg = compose_arm_diagnostic(&snap);
        assert!(!msg.contains("Issues"), "{msg}");
    }

    fn fleet() -> (Arc<Registry>, Arc<CommandRouter>) {
        let (broker, _rx) = tokio::sync::broadcast::channel(256);
        let registry = Registry::new(
            vec![VehicleConfig {
                id: 1,
                endpoint: SIMULATED_ENDPOINT.into(),
                baud: 57600,
            }],
            LinkConfig::default(),
            broker,
        );
        let router = CommandRouter::new(Arc::clone(&registry), StdDuration::from_secs(3));
        (registry, router)
    }

    #[tokio::test(start_paused = true)]
    async fn arm_and_takeoff_against_the_simulator() {
        let (registry, router) = fleet();
        registry.simulate(1).unwrap();
        tokio::time::sleep(StdDuration::from_secs(2)).await;
        assert!(registry.get(1).unwrap().handle.connected());

        router.execute(1, VehicleCommand::Arm).await.unwrap();
        tokio::time::sleep(StdDuration::from_secs(2)).await;
        assert!(registry.get(1).unwrap().handle.snapshot().armed);

        router.execute(1, VehicleCommand::Takeoff(10.0)).await.unwrap();
        tokio::time::sleep(StdDuration::from_secs(20)).await;
        let snap = registry.get(1).unwrap().handle.snapshot();
        assert!(snap.altitude_m >= 9.0, "altitude {}", snap.altitude_m);
    }

    #[tokio::test(start_paused = true)]
    async fn commands_against_missing_vehicles_fail_fast() {
        let (_registry, router) = fleet();
        let err = router.execute(4, VehicleCommand::Arm).await.unwrap_err();
        assert!(matches!(err, CommandError::Registry(RegistryError::Unknown(4))));
    }
}
