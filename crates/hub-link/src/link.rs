//! Serial transport for one vehicle: a blocking reader loop that feeds
//! decoded frames into the vehicle task, and a writer task that serializes
//! every outgoing packet and owns the mod-256 sequence counter.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use mavlink::common::MavMessage;
use mavlink::error::MessageReadError;
use mavlink::MavHeader;
use tokio::sync::mpsc;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

use crate::{LinkConfig, LinkError};

pub(crate) const OUTBOUND_DEPTH: usize = 64;
pub(crate) const EVENT_DEPTH: usize = 256;

/// What a link surfaces to its consumers.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    Connected { system_id: u8, component_id: u8 },
    Disconnected,
    Message(MavHeader, MavMessage),
    Error(String),
}

/// State shared between the transport tasks, the vehicle task, and handle
/// readers. Everything here is safe to poke from any task.
#[derive(Debug)]
pub struct LinkShared {
    pub running: AtomicBool,
    pub connected: AtomicBool,
    /// Unix ms of the last inbound heartbeat; 0 = never seen.
    pub last_heartbeat_ms: AtomicI64,
    /// Peer (system, component), refined from the first heartbeat.
    pub peer: Mutex<(u8, u8)>,
    /// Frames dropped to CRC/parse failures or backpressure.
    pub frames_dropped: AtomicU64,
}

impl LinkShared {
    pub fn new(cfg: &LinkConfig) -> Arc<Self> {
        Arc::new(Self {
            running: AtomicBool::new(true),
            connected: AtomicBool::new(false),
            last_heartbeat_ms: AtomicI64::new(0),
            peer: Mutex::new((cfg.target_system, cfg.target_component)),
            frames_dropped: AtomicU64::new(0),
        })
    }

    pub fn peer_ids(&self) -> (u8, u8) {
        *self.peer.lock().unwrap()
    }
}

/// Opens the serial port and starts the reader/writer pair. The returned
/// sender is the only way packets leave for this vehicle, which is what
/// keeps per-vehicle output serialized on the wire.
pub(crate) fn start_serial(
    vehicle_id: u8,
    port: &str,
    baud: u32,
    cfg: &LinkConfig,
    inbound_tx: mpsc::Sender<(MavHeader, MavMessage)>,
    shared: Arc<LinkShared>,
) -> Result<mpsc::Sender<MavMessage>, LinkError> {
    // Probe the device first so a bad path fails with a useful error
    // instead of a connect-string parse failure.
    tokio_serial::new(port, baud)
        .open_native_async()
        .map_err(|e| LinkError::Open {
            port: port.to_string(),
            source: std::io::Error::from(e),
        })?;

    let url = format!("serial:{}:{}", port, baud);
    let conn = mavlink::connect::<MavMessage>(&url).map_err(|e| LinkError::Open {
        port: port.to_string(),
        source: e,
    })?;
    let conn: Arc<Box<dyn mavlink::MavConnection<MavMessage> + Sync + Send>> = Arc::new(conn);

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<MavMessage>(OUTBOUND_DEPTH);

    // Writer: sole owner of the outgoing header sequence.
    {
        let conn = Arc::clone(&conn);
        let shared = Arc::clone(&shared);
        let (system_id, component_id) = (cfg.system_id, cfg.component_id);
        tokio::task::spawn_blocking(move || {
            let mut sequence: u8 = 0;
            while let Some(msg) = outbound_rx.blocking_recv() {
                if !shared.running.load(Ordering::Relaxed) {
                    break;
                }
                sequence = sequence.wrapping_add(1);
                let header = MavHeader {
                    system_id,
                    component_id,
                    sequence,
                };
                if let Err(e) = conn.send(&header, &msg) {
                    warn!("vehicle {}: serial send failed: {:?}", vehicle_id, e);
                }
            }
            debug!("vehicle {}: writer loop ended", vehicle_id);
        });
    }

    // Reader: blocking recv, decoded frames into the vehicle task. Parse
    // failures are dropped (the radio link is lossy anyway); I/O errors end
    // the loop and the closed channel tells the vehicle task we are gone.
    {
        let conn = Arc::clone(&conn);
        let shared = Arc::clone(&shared);
        tokio::task::spawn_blocking(move || {
            loop {
                if !shared.running.load(Ordering::Relaxed) {
                    break;
                }
                match conn.recv() {
                    Ok((header, msg)) => {
                        if inbound_tx.blocking_send((header, msg)).is_err() {
                            break;
                        }
                    }
                    Err(MessageReadError::Io(e)) => {
                        warn!("vehicle {}: serial read error: {}", vehicle_id, e);
                        break;
                    }
                    Err(_) => {
                        shared.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            debug!("vehicle {}: reader loop ended", vehicle_id);
        });
    }

    info!("vehicle {}: serial link open on {} @ {}", vehicle_id, port, baud);
    Ok(outbound_tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mavlink::common::{MavAutopilot, MavModeFlag, MavState, MavType, HEARTBEAT_DATA};

    fn heartbeat() -> MavMessage {
        MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            custom_mode: 4,
            mavtype: MavType::MAV_TYPE_QUADROTOR,
            autopilot: MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA,
            base_mode: MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED,
            system_status: MavState::MAV_STATE_ACTIVE,
            mavlink_version: 3,
        })
    }

    #[test]
    fn v2_frames_survive_an_encode_decode_round_trip() {
        let header = MavHeader {
            system_id: 255,
            component_id: 190,
            sequence: 7,
        };
        let msg = heartbeat();

        let mut wire = Vec::new();
        mavlink::write_v2_msg(&mut wire, header, &msg).unwrap();

        let mut reader = mavlink::peek_reader::PeekReader::new(&wire[..]);
        let (decoded_header, decoded): (MavHeader, MavMessage) =
            mavlink::read_v2_msg(&mut reader).unwrap();
        assert_eq!(decoded_header.sequence, 7);
        assert_eq!(decoded, msg);

        // Re-encoding the decoded frame reproduces the original bytes.
        let mut wire_again = Vec::new();
        mavlink::write_v2_msg(&mut wire_again, decoded_header, &decoded).unwrap();
        assert_eq!(wire, wire_again);
    }

    #[test]
    fn corrupted_frames_are_not_decoded() {
        let header = MavHeader {
            system_id: 1,
            component_id: 1,
            sequence: 1,
        };
        let mut wire = Vec::new();
        mavlink::write_v2_msg(&mut wire, header, &heartbeat()).unwrap();
        // Flip a payload byte; the CRC check must reject the frame and the
        // reader runs out of bytes looking for another start marker.
        let mid = wire.len() - 4;
        wire[mid] ^= 0xff;
        let mut reader = mavlink::peek_reader::PeekReader::new(&wire[..]);
        let result: Result<(MavHeader, MavMessage), _> = mavlink::read_v2_msg(&mut reader);
        assert!(result.is_err());
    }
}
