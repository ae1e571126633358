//! Operator surfaces: the WebSocket event channel and the diagnostic REST
//! routes. Both are thin adapters — the registry, command router, and
//! orchestrators stay the single source of truth.

pub mod dispatch;
pub mod http;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tokio::sync::broadcast;

use hub_fleet::{CommandRouter, Registry};
use hub_mission::MissionOrchestrator;
use hub_proto::channel::BrokerEvent;
use hub_spray::SprayOrchestrator;

pub struct OpsState {
    pub registry: Arc<Registry>,
    pub router: Arc<CommandRouter>,
    pub missions: Arc<MissionOrchestrator>,
    pub spray: Arc<SprayOrchestrator>,
    pub events: broadcast::Sender<BrokerEvent>,
}

pub fn router(state: Arc<OpsState>) -> Router {
    Router::new()
        .route("/health", get(http::health))
        .route("/ws", get(ws::ws_handler))
        .route("/drones", get(http::drones))
        .route("/drone/:id/arm", post(http::arm))
        .route("/drone/:id/disarm", post(http::disarm))
        .route("/drone/:id/mode", post(http::mode))
        .route("/drone/:id/takeoff", post(http::takeoff))
        .route("/drone/:id/land", post(http::land))
        .route("/drone/:id/rtl", post(http::rtl))
        .route("/drone/:id/goto", post(http::goto))
        .route("/drone/:id/mission/upload", post(http::mission_upload))
        .route("/drone/:id/mission/start", post(http::mission_start))
        .route("/drone/:id/mission/pause", post(http::mission_pause))
        .route("/drone/:id/mission/resume", post(http::mission_resume))
        .route("/drone/:id/mission/stop", post(http::mission_stop))
        .route("/drone/:id/mission/status", get(http::mission_status))
        .route("/drone/:id/spray/queue", post(http::spray_queue))
        .route("/drone/:id/spray/start", post(http::spray_start))
        .route("/drone/:id/spray/stop", post(http::spray_stop))
        .route("/drone/:id/spray/refill-complete", post(http::spray_refill_complete))
        .route("/drone/:id/spray/clear-queue", post(http::spray_clear_queue))
        .route("/drone/:id/spray/status", get(http::spray_status))
        .with_state(state)
}

/// Pushes every connected vehicle's snapshot onto the event bus at the
/// operator-facing cadence (default 250 ms).
pub fn spawn_telemetry_fanout(state: Arc<OpsState>, period: Duration) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(period);
        loop {
            tick.tick().await;
            for row in state.registry.list() {
                if !row.connected {
                    continue;
                }
                if let Ok(entry) = state.registry.get(row.id) {
                    let _ = state.events.send(BrokerEvent::DroneTelemetryUpdate {
                        vehicle_id: row.id,
                        snapshot: entry.handle.snapshot(),
                    });
                }
            }
        }
    });
}
