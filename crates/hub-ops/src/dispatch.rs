//! Single dispatch point for operator commands, shared by the WebSocket
//! channel. Every command ends in a `command_result` frame on the bus.

use tracing::info;

use hub_fleet::command::{PayloadCommand, VehicleCommand};
use hub_proto::channel::{BrokerEvent, ClientCommand};

use crate::OpsState;

pub async fn dispatch_command(state: &OpsState, cmd: ClientCommand) {
    let name = cmd.name().to_string();
    let vehicle_id = cmd.vehicle_id();
    info!("operator command {}{}", name, match vehicle_id {
        Some(id) => format!(" for vehicle {id}"),
        None => String::new(),
    });

    let result = run(state, cmd).await;
    let _ = state.events.send(BrokerEvent::CommandResult {
        success: result.is_ok(),
        vehicle_id,
        command: name,
        error: result.err(),
    });
}

async fn run(state: &OpsState, cmd: ClientCommand) -> Result<(), String> {
    match cmd {
        ClientCommand::Arm { vehicle_id } => state
            .router
            .execute(vehicle_id, VehicleCommand::Arm)
            .await
            .map_err(stringify),
        ClientCommand::Disarm { vehicle_id } => state
            .router
            .execute(vehicle_id, VehicleCommand::Disarm)
            .await
            .map_err(stringify),
        ClientCommand::SetMode { vehicle_id, mode } => state
            .router
            .execute(vehicle_id, VehicleCommand::SetMode(mode))
            .await
            .map_err(stringify),
        ClientCommand::Takeoff { vehicle_id, altitude } => state
            .router
            .execute(vehicle_id, VehicleCommand::Takeoff(altitude))
            .await
            .map_err(stringify),
        ClientCommand::Land { vehicle_id } => state
            .router
            .execute(vehicle_id, VehicleCommand::Land)
            .await
            .map_err(stringify),
        ClientCommand::Rtl { vehicle_id } => state
            .router
            .execute(vehicle_id, VehicleCommand::Rtl)
            .await
            .map_err(stringify),
        ClientCommand::Goto { vehicle_id, latitude, longitude, altitude } => state
            .router
            .execute(
                vehicle_id,
                VehicleCommand::Goto {
                    lat: latitude,
                    lon: longitude,
                    alt: altitude,
                },
            )
            .await
            .map_err(stringify),

        ClientCommand::Reconnect { vehicle_id } => {
            state.registry.reconnect(vehicle_id).map_err(stringify)
        }
        ClientCommand::Simulate { vehicle_id } => {
            state.registry.simulate(vehicle_id).map_err(stringify)
        }
        ClientCommand::Sync => {
            let outcomes = state.registry.sync();
            let failed: Vec<String> = outcomes
                .iter()
                .filter_map(|o| o.error.as_ref().map(|e| format!("vehicle {}: {}", o.id, e)))
                .collect();
            let _ = state.events.send(BrokerEvent::DronesStatus {
                drones: state.registry.list(),
            });
            if failed.is_empty() {
                Ok(())
            } else {
                Err(failed.join("; "))
            }
        }

        ClientCommand::StartMission { vehicle_id, waypoints, params } => state
            .missions
            .start(vehicle_id, waypoints, params)
            .await
            .map(|_| ())
            .map_err(stringify),
        ClientCommand::PauseMission { vehicle_id } => {
            state.missions.pause(vehicle_id).await.map_err(stringify)
        }
        ClientCommand::ResumeMission { vehicle_id } => {
            state.missions.resume(vehicle_id).await.map_err(stringify)
        }
        ClientCommand::StopMission { vehicle_id } => {
            state.missions.stop(vehicle_id).await.map_err(stringify)
        }

        ClientCommand::SprayQueueTargets { vehicle_id, detections } => state
            .spray
            .queue_targets(vehicle_id, detections)
            .await
            .map(|_| ())
            .map_err(stringify),
        ClientCommand::SprayStart { vehicle_id } => state
            .spray
            .start(vehicle_id)
            .await
            .map(|_| ())
            .map_err(stringify),
        ClientCommand::SprayStop { vehicle_id } => state
            .spray
            .stop(vehicle_id)
            .await
            .map(|_| ())
            .map_err(stringify),
        ClientCommand::SprayRefillComplete { vehicle_id } => state
            .spray
            .refill_complete(vehicle_id)
            .await
            .map(|_| ())
            .map_err(stringify),
        ClientCommand::SprayClearQueue { vehicle_id } => state
            .spray
            .clear_queue(vehicle_id)
            .await
            .map(|_| ())
            .map_err(stringify),
        ClientCommand::SprayTargetComplete { vehicle_id, target_id, success } => state
            .spray
            .target_completed(vehicle_id, target_id, success)
            .await
            .map_err(stringify),

        ClientCommand::StartDetection { vehicle_id } => state
            .router
            .payload_command(vehicle_id, PayloadCommand::StartDetection)
            .await
            .map_err(stringify),
        ClientCommand::StopDetection { vehicle_id } => state
            .router
            .payload_command(vehicle_id, PayloadCommand::StopDetection)
            .await
            .map_err(stringify),
        ClientCommand::RequestPiStats { vehicle_id } => state
            .router
            .payload_command(vehicle_id, PayloadCommand::RequestStats)
            .await
            .map_err(stringify),

        ClientCommand::RequestDroneList => {
            let _ = state.events.send(BrokerEvent::DronesStatus {
                drones: state.registry.list(),
            });
            Ok(())
        }
    }
}

fn stringify(e: impl std::fmt::Display) -> String {
    e.to_string()
}
