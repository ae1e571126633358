//! The operator WebSocket channel. Each client gets its own cursor into
//! the broadcast bus; a slow client lags and loses its oldest events
//! without ever back-pressuring producers or other clients.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use hub_proto::channel::{BrokerEvent, ClientCommand};

use crate::dispatch::dispatch_command;
use crate::OpsState;

pub async fn ws_handler(
    State(state): State<Arc<OpsState>>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| client_session(state, socket))
}

async fn client_session(state: Arc<OpsState>, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let mut events = state.events.subscribe();
    info!("operator client connected");

    // Backfill: the fleet picture first, then per-vehicle link state, so a
    // fresh dashboard renders without waiting for the next change.
    let drones = state.registry.list();
    let mut backlog = vec![BrokerEvent::DronesStatus {
        drones: drones.clone(),
    }];
    for d in &drones {
        backlog.push(if d.connected {
            BrokerEvent::DroneConnected { vehicle_id: d.id }
        } else {
            BrokerEvent::DroneDisconnected { vehicle_id: d.id }
        });
    }
    for ev in backlog {
        if send_event(&mut sink, &ev).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            received = events.recv() => {
                match received {
                    Ok(ev) => {
                        if send_event(&mut sink, &ev).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // This client fell behind; it loses its n oldest
                        // events and carries on.
                        warn!("operator client lagged, {} events dropped", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientCommand>(&text) {
                            Ok(cmd) => dispatch_command(&state, cmd).await,
                            Err(e) => {
                                debug!("unparseable operator frame: {}", e);
                                let _ = state.events.send(BrokerEvent::CommandResult {
                                    success: false,
                                    vehicle_id: None,
                                    command: "parse".into(),
                                    error: Some(format!("malformed command frame: {e}")),
                                });
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("operator socket error: {}", e);
                        break;
                    }
                }
            }
        }
    }
    info!("operator client disconnected");
}

async fn send_event(
    sink: &mut (impl SinkExt<Message> + Unpin),
    event: &BrokerEvent,
) -> Result<(), ()> {
    let payload = match serde_json::to_string(event) {
        Ok(p) => p,
        Err(e) => {
            warn!("event serialization failed: {}", e);
            return Ok(());
        }
    };
    sink.send(Message::Text(payload)).await.map_err(|_| ())
}
