//! Diagnostic REST surface. Same services as the WebSocket channel, same
//! response envelope as the original operators' tooling expects:
//! `{success, command, ...}` on 2xx, `{success:false, command, error}` with
//! 400 for domain errors, 404 for unknown vehicles, 500 for the rest.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use hub_fleet::command::{CommandError, VehicleCommand};
use hub_fleet::registry::RegistryError;
use hub_mission::orchestrator::MissionError;
use hub_mission::UploadError;
use hub_proto::events::DetectionEvent;
use hub_proto::mission::{MissionParams, Waypoint};
use hub_spray::SprayError;

use crate::OpsState;

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

fn ok(command: &str, extra: Value) -> Json<Value> {
    let mut body = json!({"success": true, "command": command});
    if let (Some(obj), Some(add)) = (body.as_object_mut(), extra.as_object()) {
        for (k, v) in add {
            obj.insert(k.clone(), v.clone());
        }
    }
    Json(body)
}

fn fail(command: &str, status: StatusCode, error: impl ToString) -> (StatusCode, Json<Value>) {
    (
        status,
        Json(json!({"success": false, "command": command, "error": error.to_string()})),
    )
}

fn command_status(e: &CommandError) -> StatusCode {
    match e {
        CommandError::Registry(RegistryError::Unknown(_)) => StatusCode::NOT_FOUND,
        CommandError::Registry(_) | CommandError::Link(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    }
}

fn mission_status_code(e: &MissionError) -> StatusCode {
    match e {
        MissionError::Registry(RegistryError::Unknown(_)) => StatusCode::NOT_FOUND,
        MissionError::Registry(_) => StatusCode::INTERNAL_SERVER_ERROR,
        MissionError::Upload(UploadError::Link(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        MissionError::Command(e) => command_status(e),
        _ => StatusCode::BAD_REQUEST,
    }
}

pub async fn health() -> Json<Value> {
    Json(json!({"status": "ok", "service": "agrihub"}))
}

pub async fn drones(State(state): State<Arc<OpsState>>) -> Json<Value> {
    let rows: Vec<Value> = state
        .registry
        .list()
        .into_iter()
        .map(|row| {
            let telemetry = state
                .registry
                .get(row.id)
                .ok()
                .filter(|e| e.handle.connected())
                .map(|e| serde_json::to_value(e.handle.snapshot()).unwrap_or(Value::Null));
            json!({
                "id": row.id,
                "connected": row.connected,
                "simulated": row.simulated,
                "last_seen": row.last_seen_ms,
                "telemetry": telemetry,
            })
        })
        .collect();
    Json(json!({"drones": rows}))
}

async fn simple_command(
    state: &OpsState,
    id: u8,
    name: &str,
    cmd: VehicleCommand,
) -> ApiResult {
    match state.router.execute(id, cmd).await {
        Ok(()) => Ok(ok(name, json!({}))),
        Err(e) => Err(fail(name, command_status(&e), e)),
    }
}

pub async fn arm(State(state): State<Arc<OpsState>>, Path(id): Path<u8>) -> ApiResult {
    simple_command(&state, id, "arm", VehicleCommand::Arm).await
}

pub async fn disarm(State(state): State<Arc<OpsState>>, Path(id): Path<u8>) -> ApiResult {
    simple_command(&state, id, "disarm", VehicleCommand::Disarm).await
}

pub async fn land(State(state): State<Arc<OpsState>>, Path(id): Path<u8>) -> ApiResult {
    simple_command(&state, id, "land", VehicleCommand::Land).await
}

pub async fn rtl(State(state): State<Arc<OpsState>>, Path(id): Path<u8>) -> ApiResult {
    simple_command(&state, id, "rtl", VehicleCommand::Rtl).await
}

#[derive(Deserialize)]
pub struct ModeBody {
    mode: String,
}

pub async fn mode(
    State(state): State<Arc<OpsState>>,
    Path(id): Path<u8>,
    Json(body): Json<ModeBody>,
) -> ApiResult {
    simple_command(&state, id, "set_mode", VehicleCommand::SetMode(body.mode)).await
}

#[derive(Deserialize)]
pub struct TakeoffBody {
    #[serde(default = "default_takeoff_alt")]
    altitude: f32,
}

fn default_takeoff_alt() -> f32 {
    10.0
}

pub async fn takeoff(
    State(state): State<Arc<OpsState>>,
    Path(id): Path<u8>,
    Json(body): Json<TakeoffBody>,
) -> ApiResult {
    match state
        .router
        .execute(id, VehicleCommand::Takeoff(body.altitude))
        .await
    {
        Ok(()) => Ok(ok("takeoff", json!({"altitude": body.altitude}))),
        Err(e) => Err(fail("takeoff", command_status(&e), e)),
    }
}

#[derive(Deserialize)]
pub struct GotoBody {
    latitude: f64,
    longitude: f64,
    #[serde(default = "default_takeoff_alt")]
    altitude: f32,
}

pub async fn goto(
    State(state): State<Arc<OpsState>>,
    Path(id): Path<u8>,
    Json(body): Json<GotoBody>,
) -> ApiResult {
    simple_command(
        &state,
        id,
        "goto",
        VehicleCommand::Goto {
            lat: body.latitude,
            lon: body.longitude,
            alt: body.altitude,
        },
    )
    .await
}

#[derive(Deserialize)]
pub struct MissionBody {
    waypoints: Vec<Waypoint>,
    #[serde(default)]
    params: MissionParams,
}

pub async fn mission_upload(
    State(state): State<Arc<OpsState>>,
    Path(id): Path<u8>,
    Json(body): Json<MissionBody>,
) -> ApiResult {
    match state.missions.upload(id, &body.waypoints, &body.params).await {
        Ok(total) => Ok(ok(
            "mission_upload",
            json!({"waypoint_count": body.waypoints.len(), "wire_items": total}),
        )),
        Err(e) => Err(fail("mission_upload", mission_status_code(&e), e)),
    }
}

pub async fn mission_start(
    State(state): State<Arc<OpsState>>,
    Path(id): Path<u8>,
    Json(body): Json<MissionBody>,
) -> ApiResult {
    match state.missions.start(id, body.waypoints, body.params).await {
        Ok(mission_id) => Ok(ok("mission_start", json!({"mission_id": mission_id}))),
        Err(e) => Err(fail("mission_start", mission_status_code(&e), e)),
    }
}

pub async fn mission_pause(State(state): State<Arc<OpsState>>, Path(id): Path<u8>) -> ApiResult {
    match state.missions.pause(id).await {
        Ok(()) => Ok(ok("mission_pause", json!({}))),
        Err(e) => Err(fail("mission_pause", mission_status_code(&e), e)),
    }
}

pub async fn mission_resume(State(state): State<Arc<OpsState>>, Path(id): Path<u8>) -> ApiResult {
    match state.missions.resume(id).await {
        Ok(()) => Ok(ok("mission_resume", json!({}))),
        Err(e) => Err(fail("mission_resume", mission_status_code(&e), e)),
    }
}

pub async fn mission_stop(State(state): State<Arc<OpsState>>, Path(id): Path<u8>) -> ApiResult {
    match state.missions.stop(id).await {
        Ok(()) => Ok(ok("mission_stop", json!({}))),
        Err(e) => Err(fail("mission_stop", mission_status_code(&e), e)),
    }
}

pub async fn mission_status(State(state): State<Arc<OpsState>>, Path(id): Path<u8>) -> ApiResult {
    if !state.registry.contains(id) {
        return Err(fail("mission_status", StatusCode::NOT_FOUND, format!("vehicle {id} is not known")));
    }
    let progress = state
        .missions
        .status(id)
        .map(|p| serde_json::to_value(p).unwrap_or(Value::Null));
    Ok(ok("mission_status", json!({"mission": progress})))
}

fn spray_status_code(e: &SprayError) -> StatusCode {
    match e {
        SprayError::WorkerGone(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    }
}

#[derive(Deserialize)]
pub struct SprayQueueBody {
    detections: Vec<DetectionEvent>,
}

pub async fn spray_queue(
    State(state): State<Arc<OpsState>>,
    Path(id): Path<u8>,
    Json(body): Json<SprayQueueBody>,
) -> ApiResult {
    match state.spray.queue_targets(id, body.detections).await {
        Ok(queued) => Ok(ok("spray_queue_targets", json!({"queued": queued}))),
        Err(e) => Err(fail("spray_queue_targets", spray_status_code(&e), e)),
    }
}

pub async fn spray_start(State(state): State<Arc<OpsState>>, Path(id): Path<u8>) -> ApiResult {
    match state.spray.start(id).await {
        Ok(mission) => Ok(ok(
            "spray_start",
            json!({"mission": serde_json::to_value(mission).unwrap_or(Value::Null)}),
        )),
        Err(e) => Err(fail("spray_start", spray_status_code(&e), e)),
    }
}

pub async fn spray_stop(State(state): State<Arc<OpsState>>, Path(id): Path<u8>) -> ApiResult {
    match state.spray.stop(id).await {
        Ok(_) => Ok(ok("spray_stop", json!({}))),
        Err(e) => Err(fail("spray_stop", spray_status_code(&e), e)),
    }
}

pub async fn spray_refill_complete(
    State(state): State<Arc<OpsState>>,
    Path(id): Path<u8>,
) -> ApiResult {
    match state.spray.refill_complete(id).await {
        Ok(tank) => Ok(ok(
            "spray_refill_complete",
            json!({"tank": serde_json::to_value(tank).unwrap_or(Value::Null)}),
        )),
        Err(e) => Err(fail("spray_refill_complete", spray_status_code(&e), e)),
    }
}

pub async fn spray_clear_queue(
    State(state): State<Arc<OpsState>>,
    Path(id): Path<u8>,
) -> ApiResult {
    match state.spray.clear_queue(id).await {
        Ok(remaining) => Ok(ok("spray_clear_queue", json!({"remaining": remaining}))),
        Err(e) => Err(fail("spray_clear_queue", spray_status_code(&e), e)),
    }
}

pub async fn spray_status(State(state): State<Arc<OpsState>>, Path(id): Path<u8>) -> ApiResult {
    match state.spray.status(id).await {
        Ok(report) => Ok(ok(
            "spray_status",
            json!({"spray": serde_json::to_value(report).unwrap_or(Value::Null)}),
        )),
        Err(e) => Err(fail("spray_status", spray_status_code(&e), e)),
    }
}
