//! Per-vehicle wiring: the handle other components hold, and the vehicle
//! task — single writer of the snapshot, watchdog for the heartbeat
//! timeout, and the point where payload status strings become typed events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mavlink::common::{
    MavAutopilot, MavMessage, MavModeFlag, MavState, MavType, HEARTBEAT_DATA,
};
use mavlink::MavHeader;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use hub_proto::channel::BrokerEvent;
use hub_proto::events::{
    DetectionEvent, DetectionStats, ImageCaptured, PiStats, DETECTION_SOURCE_SERIAL,
};
use hub_proto::now_ms;
use hub_proto::telemetry::{Snapshot, StatusRecord};

use crate::link::{self, LinkEvent, LinkShared, EVENT_DEPTH};
use crate::sim;
use crate::statusmsg::{parse_status_text, DedupSet, Parsed, PayloadRecord};
use crate::telemetry::Aggregator;
use crate::{LinkConfig, LinkError};

/// Handle to one vehicle's link, shared by the registry, command router,
/// uploader, and orchestrators.
pub struct VehicleHandle {
    pub id: u8,
    pub simulated: bool,
    cfg: LinkConfig,
    outbound: mpsc::Sender<MavMessage>,
    events: broadcast::Sender<LinkEvent>,
    shared: Arc<LinkShared>,
    aggregator: Arc<Mutex<Aggregator>>,
    /// Guard against overlapping mission uploads (one in flight per vehicle).
    pub uploading: Arc<AtomicBool>,
}

impl VehicleHandle {
    pub fn config(&self) -> &LinkConfig {
        &self.cfg
    }

    pub fn connected(&self) -> bool {
        self.shared.connected.load(Ordering::Relaxed)
    }

    /// True while the link's tasks are alive. A link can be open but not
    /// yet `connected` (no heartbeat seen).
    pub fn is_open(&self) -> bool {
        self.shared.running.load(Ordering::Relaxed)
    }

    pub fn last_seen_ms(&self) -> Option<i64> {
        match self.shared.last_heartbeat_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(ms),
        }
    }

    /// Peer (system, component) ids used to address the vehicle.
    pub fn target(&self) -> (u8, u8) {
        self.shared.peer_ids()
    }

    pub fn frames_dropped(&self) -> u64 {
        self.shared.frames_dropped.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.aggregator.lock().unwrap().snapshot()
    }

    pub fn status_ring(&self) -> Vec<StatusRecord> {
        self.aggregator.lock().unwrap().status_ring()
    }

    /// Subscribe to decoded inbound traffic and link state changes.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    /// Queue one packet for transmission. Packets from all callers funnel
    /// through the writer task, so they never interleave on the wire.
    pub async fn send(&self, msg: MavMessage) -> Result<(), LinkError> {
        self.outbound
            .send(msg)
            .await
            .map_err(|_| LinkError::NotOpen(self.id))
    }

    /// Stops the link tasks. Idempotent; the serial reader may linger on a
    /// blocking read until the next byte or I/O error.
    pub fn close(&self) {
        self.shared.running.store(false, Ordering::Relaxed);
    }
}

impl Drop for VehicleHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens a serial link and spawns the full task set for one vehicle.
pub fn connect_serial(
    id: u8,
    port: &str,
    baud: u32,
    cfg: LinkConfig,
    broker: broadcast::Sender<BrokerEvent>,
) -> Result<VehicleHandle, LinkError> {
    let shared = LinkShared::new(&cfg);
    let (inbound_tx, inbound_rx) = mpsc::channel(EVENT_DEPTH);
    let outbound = link::start_serial(id, port, baud, &cfg, inbound_tx, Arc::clone(&shared))?;
    let handle = assemble(id, false, cfg, outbound, shared, inbound_rx, broker);

    // Periodic GCS heartbeat so the autopilot knows a ground station is
    // listening (and keeps failsafe logic honest).
    let hb_out = handle.outbound.clone();
    let hb_shared = Arc::clone(&handle.shared);
    let interval = handle.cfg.heartbeat_interval;
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            if !hb_shared.running.load(Ordering::Relaxed) {
                break;
            }
            if hb_out.send(gcs_heartbeat()).await.is_err() {
                break;
            }
        }
    });

    Ok(handle)
}

/// Spawns a simulated vehicle behind the same handle shape as a serial one.
pub fn connect_simulated(
    id: u8,
    cfg: LinkConfig,
    broker: broadcast::Sender<BrokerEvent>,
) -> VehicleHandle {
    let shared = LinkShared::new(&cfg);
    let (inbound_tx, inbound_rx) = mpsc::channel(EVENT_DEPTH);
    let outbound = sim::start_sim(id, inbound_tx, Arc::clone(&shared));
    assemble(id, true, cfg, outbound, shared, inbound_rx, broker)
}

fn assemble(
    id: u8,
    simulated: bool,
    cfg: LinkConfig,
    outbound: mpsc::Sender<MavMessage>,
    shared: Arc<LinkShared>,
    inbound_rx: mpsc::Receiver<(MavHeader, MavMessage)>,
    broker: broadcast::Sender<BrokerEvent>,
) -> VehicleHandle {
    let (events, _) = broadcast::channel(EVENT_DEPTH);
    let aggregator = Arc::new(Mutex::new(Aggregator::new(cfg.status_ring_size)));

    tokio::spawn(vehicle_task(VehicleTask {
        id,
        inbound: inbound_rx,
        events: events.clone(),
        broker,
        shared: Arc::clone(&shared),
        aggregator: Arc::clone(&aggregator),
        dedup: DedupSet::new(cfg.detection_dedup_size),
        heartbeat_timeout: cfg.heartbeat_timeout,
    }));

    VehicleHandle {
        id,
        simulated,
        cfg,
        outbound,
        events,
        shared,
        aggregator,
        uploading: Arc::new(AtomicBool::new(false)),
    }
}

fn gcs_heartbeat() -> MavMessage {
    MavMessage::HEARTBEAT(HEARTBEAT_DATA {
        custom_mode: 0,
        mavtype: MavType::MAV_TYPE_GCS,
        autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
        base_mode: MavModeFlag::empty(),
        system_status: MavState::MAV_STATE_ACTIVE,
        mavlink_version: 3,
    })
}

struct VehicleTask {
    id: u8,
    inbound: mpsc::Receiver<(MavHeader, MavMessage)>,
    events: broadcast::Sender<LinkEvent>,
    broker: broadcast::Sender<BrokerEvent>,
    shared: Arc<LinkShared>,
    aggregator: Arc<Mutex<Aggregator>>,
    dedup: DedupSet,
    heartbeat_timeout: Duration,
}

async fn vehicle_task(mut task: VehicleTask) {
    let mut watchdog = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            maybe = task.inbound.recv() => {
                let Some((header, msg)) = maybe else { break };
                task.on_message(header, msg);
            }
            _ = watchdog.tick() => {
                if !task.shared.running.load(Ordering::Relaxed) {
                    break;
                }
                task.check_heartbeat_age();
            }
        }
    }
    // Transport gone (I/O error or close). Mark the link dead so the
    // registry's sync pass knows to reopen it, and flag the disconnect once.
    task.shared.running.store(false, Ordering::Relaxed);
    if task.shared.connected.swap(false, Ordering::Relaxed) {
        warn!("vehicle {}: link closed", task.id);
        let _ = task.events.send(LinkEvent::Disconnected);
        let _ = task.broker.send(BrokerEvent::DroneDisconnected { vehicle_id: task.id });
    }
}

impl VehicleTask {
    fn on_message(&mut self, header: MavHeader, msg: MavMessage) {
        if matches!(msg, MavMessage::HEARTBEAT(_)) {
            self.shared.last_heartbeat_ms.store(now_ms(), Ordering::Relaxed);
            *self.shared.peer.lock().unwrap() = (header.system_id, header.component_id);
            if !self.shared.connected.swap(true, Ordering::Relaxed) {
                info!(
                    "vehicle {}: heartbeat from system {} component {}",
                    self.id, header.system_id, header.component_id
                );
                let _ = self.events.send(LinkEvent::Connected {
                    system_id: header.system_id,
                    component_id: header.component_id,
                });
                let _ = self.broker.send(BrokerEvent::DroneConnected { vehicle_id: self.id });
            }
        }

        let appended = self.aggregator.lock().unwrap().apply(&msg);
        if let Some(record) = appended {
            self.on_status_record(&record);
        }

        // Re-broadcast for protocol waiters (command acks, mission
        // handshakes). Losing a frame to a lagging subscriber is fine; the
        // protocols all retry or time out.
        let _ = self.events.send(LinkEvent::Message(header, msg));
    }

    fn check_heartbeat_age(&mut self) {
        if !self.shared.connected.load(Ordering::Relaxed) {
            return;
        }
        let last = self.shared.last_heartbeat_ms.load(Ordering::Relaxed);
        if last == 0 {
            return;
        }
        let age = now_ms() - last;
        if age > self.heartbeat_timeout.as_millis() as i64 {
            self.shared.connected.store(false, Ordering::Relaxed);
            warn!("vehicle {}: no heartbeat for {} ms, marking disconnected", self.id, age);
            let _ = self.events.send(LinkEvent::Disconnected);
            let _ = self.broker.send(BrokerEvent::DroneDisconnected { vehicle_id: self.id });
        }
    }

    fn on_status_record(&mut self, record: &StatusRecord) {
        match parse_status_text(&record.text) {
            Parsed::Record(PayloadRecord::Detection {
                detection_id,
                latitude,
                longitude,
                confidence,
                area,
            }) => {
                if !self.dedup.insert(&detection_id) {
                    debug!("vehicle {}: duplicate detection {} dropped", self.id, detection_id);
                    return;
                }
                let _ = self.broker.send(BrokerEvent::CropDetection(DetectionEvent {
                    detection_id,
                    latitude,
                    longitude,
                    confidence,
                    area,
                    source: DETECTION_SOURCE_SERIAL.to_string(),
                    vehicle_id: self.id,
                    timestamp_ms: record.timestamp_ms,
                }));
            }
            Parsed::Record(PayloadRecord::Stats { total, active, mission }) => {
                let _ = self.broker.send(BrokerEvent::DetectionStats(DetectionStats {
                    total,
                    active,
                    mission,
                    vehicle_id: self.id,
                    timestamp_ms: record.timestamp_ms,
                }));
            }
            Parsed::Record(PayloadRecord::Image {
                image_id,
                latitude,
                longitude,
                kind,
                mission,
            }) => {
                let _ = self.broker.send(BrokerEvent::ImageCaptured(ImageCaptured {
                    image_id,
                    latitude,
                    longitude,
                    kind,
                    mission,
                    vehicle_id: self.id,
                    timestamp_ms: record.timestamp_ms,
                }));
            }
            Parsed::Record(PayloadRecord::HostStats { cpu_pct, mem_pct, disk_pct, temp_c }) => {
                let _ = self.broker.send(BrokerEvent::PiStats(PiStats {
                    cpu_pct,
                    mem_pct,
                    disk_pct,
                    temp_c,
                    vehicle_id: self.id,
                    timestamp_ms: record.timestamp_ms,
                }));
            }
            Parsed::Malformed(tag) => {
                debug!("vehicle {}: malformed {} record dropped: {:?}", self.id, tag, record.text);
            }
            Parsed::Plain => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    async fn next_broker_event(
        rx: &mut broadcast::Receiver<BrokerEvent>,
    ) -> Option<BrokerEvent> {
        timeout(Duration::from_secs(10), rx.recv()).await.ok()?.ok()
    }

    #[tokio::test(start_paused = true)]
    async fn simulated_vehicle_connects_and_streams_telemetry() {
        let (broker, mut rx) = broadcast::channel(256);
        let handle = connect_simulated(1, LinkConfig::default(), broker);

        let mut saw_connected = false;
        for _ in 0..8 {
            match next_broker_event(&mut rx).await {
                Some(BrokerEvent::DroneConnected { vehicle_id: 1 }) => {
                    saw_connected = true;
                    break;
                }
                Some(_) => continue,
                None => break,
            }
        }
        assert!(saw_connected);
        assert!(handle.connected());

        // Give the 1 Hz simulator a couple of ticks to populate everything.
        tokio::time::sleep(Duration::from_secs(3)).await;
        let snap = handle.snapshot();
        assert!(!snap.armed);
        assert_eq!(snap.flight_mode, "STABILIZE");
        assert_eq!(snap.battery_remaining_pct, 100);
        assert_eq!(snap.gps.fix_type, 3);
        assert!((snap.latitude - 12.9726).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn detection_status_strings_emit_exactly_once() {
        let (broker, mut rx) = broadcast::channel(1024);

        // Inject the same detection record twice through the aggregator path.
        let mut text = [0u8; 50];
        let raw = b"DET|ab12|23.295000|85.310000|0.91|1732";
        text[..raw.len()].copy_from_slice(raw);
        let msg = MavMessage::STATUSTEXT(mavlink::common::STATUSTEXT_DATA {
            severity: mavlink::common::MavSeverity::MAV_SEVERITY_INFO,
            text,
            ..Default::default()
        });

        let mut task = VehicleTask {
            id: 7,
            inbound: mpsc::channel(8).1,
            events: broadcast::channel(8).0,
            broker,
            shared: LinkShared::new(&LinkConfig::default()),
            aggregator: Arc::new(Mutex::new(Aggregator::new(20))),
            dedup: DedupSet::new(100),
            heartbeat_timeout: Duration::from_secs(3),
        };
        let header = MavHeader { system_id: 1, component_id: 1, sequence: 0 };
        task.on_message(header, msg.clone());
        task.on_message(header, msg);

        let mut detections = 0;
        while let Ok(ev) = rx.try_recv() {
            if let BrokerEvent::CropDetection(d) = ev {
                assert_eq!(d.detection_id, "ab12");
                assert_eq!(d.vehicle_id, 7);
                assert_eq!(d.source, "serial-link");
                assert_eq!(d.area, 1732);
                detections += 1;
            }
        }
        assert_eq!(detections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_flags_heartbeat_silence() {
        let (broker, _keep) = broadcast::channel(64);
        let events = broadcast::channel(64).0;
        let shared = LinkShared::new(&LinkConfig::default());
        shared.connected.store(true, Ordering::Relaxed);
        shared.last_heartbeat_ms.store(now_ms() - 10_000, Ordering::Relaxed);
        let mut task = VehicleTask {
            id: 3,
            inbound: mpsc::channel(8).1,
            events: events.clone(),
            broker,
            shared: Arc::clone(&shared),
            aggregator: Arc::new(Mutex::new(Aggregator::new(20))),
            dedup: DedupSet::new(10),
            heartbeat_timeout: Duration::from_secs(3),
        };
        let mut link_rx = events.subscribe();
        task.check_heartbeat_age();
        assert!(!shared.connected.load(Ordering::Relaxed));
        assert!(matches!(link_rx.try_recv(), Ok(LinkEvent::Disconnected)));
    }
}
