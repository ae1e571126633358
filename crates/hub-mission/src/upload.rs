//! Mission upload: expands the operator's survey points into the sequence
//! the vehicle actually flies and runs the request-driven item handshake.

use std::sync::atomic::Ordering;
use std::time::Duration;

use mavlink::common::{
    MavCmd, MavFrame, MavMessage, MavMissionResult, MISSION_CLEAR_ALL_DATA, MISSION_COUNT_DATA,
    MISSION_ITEM_INT_DATA,
};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use hub_link::units;
use hub_link::vehicle::VehicleHandle;
use hub_link::{LinkError, LinkEvent};
use hub_proto::mission::Waypoint;

/// Altitude for the horizontal transit to the first survey point, before
/// the climb to survey altitude.
pub const TRANSIT_ALT_M: f64 = 5.0;

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("empty mission: no waypoints supplied")]
    Empty,
    #[error("mission upload already in progress")]
    InProgress,
    #[error("vehicle {0} not connected")]
    NotConnected(u8),
    #[error("mission rejected by vehicle (ack code {0})")]
    Rejected(u8),
    #[error("mission upload timed out waiting on item {0}")]
    Timeout(u16),
    #[error(transparent)]
    Link(#[from] LinkError),
}

/// One item of the expanded sequence, pre-unit-conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct MissionItem {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    pub command: MavCmd,
}

/// N operator waypoints become N+3 items: transit to the first survey
/// point low, take off there to survey altitude (real coordinates, never
/// zeros), fly the survey, return to launch.
pub fn expand_waypoints(
    waypoints: &[Waypoint],
    survey_alt: Option<f64>,
) -> Result<Vec<MissionItem>, UploadError> {
    let first = waypoints.first().ok_or(UploadError::Empty)?;
    let survey_alt = survey_alt.unwrap_or(first.alt);
    let mut items = Vec::with_capacity(waypoints.len() + 3);
    items.push(MissionItem {
        lat: first.lat,
        lon: first.lon,
        alt: TRANSIT_ALT_M,
        command: MavCmd::MAV_CMD_NAV_WAYPOINT,
    });
    items.push(MissionItem {
        lat: first.lat,
        lon: first.lon,
        alt: survey_alt,
        command: MavCmd::MAV_CMD_NAV_TAKEOFF,
    });
    items.extend(waypoints.iter().map(|w| MissionItem {
        lat: w.lat,
        lon: w.lon,
        alt: w.alt,
        command: MavCmd::MAV_CMD_NAV_WAYPOINT,
    }));
    items.push(MissionItem {
        lat: 0.0,
        lon: 0.0,
        alt: 0.0,
        command: MavCmd::MAV_CMD_NAV_RETURN_TO_LAUNCH,
    });
    Ok(items)
}

pub struct MissionUploader {
    item_timeout: Duration,
    item_retries: u32,
}

impl MissionUploader {
    pub fn new(item_timeout: Duration, item_retries: u32) -> Self {
        Self {
            item_timeout,
            item_retries,
        }
    }
}

impl Default for MissionUploader {
    fn default() -> Self {
        Self::new(Duration::from_secs(3), 3)
    }
}

/// Clears the upload guard on every exit path, including cancellation.
struct UploadGuard<'a>(&'a VehicleHandle);

impl Drop for UploadGuard<'_> {
    fn drop(&mut self) {
        self.0.uploading.store(false, Ordering::Relaxed);
    }
}

impl MissionUploader {
    /// Runs the full transfer. Returns the on-wire item count (N+3).
    pub async fn upload(
        &self,
        handle: &VehicleHandle,
        waypoints: &[Waypoint],
        survey_alt: Option<f64>,
    ) -> Result<u16, UploadError> {
        let items = expand_waypoints(waypoints, survey_alt)?;
        if !handle.connected() {
            return Err(UploadError::NotConnected(handle.id));
        }
        if handle
            .uploading
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(UploadError::InProgress);
        }
        let _guard = UploadGuard(handle);

        let total = items.len() as u16;
        let (target_system, target_component) = handle.target();
        let mut rx = handle.subscribe();

        info!("vehicle {}: uploading mission of {} items", handle.id, total);
        handle
            .send(MavMessage::MISSION_CLEAR_ALL(MISSION_CLEAR_ALL_DATA {
                target_system,
                target_component,
                ..Default::default()
            }))
            .await?;
        handle
            .send(MavMessage::MISSION_COUNT(MISSION_COUNT_DATA {
                target_system,
                target_component,
                count: total,
                ..Default::default()
            }))
            .await?;

        self.item_loop(handle, &mut rx, &items, target_system, target_component)
            .await
    }

    #[allow(deprecated)] // MISSION_REQUEST is deprecated upstream but still what ArduPilot sends
    async fn item_loop(
        &self,
        handle: &VehicleHandle,
        rx: &mut broadcast::Receiver<LinkEvent>,
        items: &[MissionItem],
        target_system: u8,
        target_component: u8,
    ) -> Result<u16, UploadError> {
        let total = items.len() as u16;
        let mut last_sent: Option<u16> = None;
        let mut retries = 0u32;

        loop {
            let deadline = Instant::now() + self.item_timeout;
            let event = match tokio::time::timeout_at(deadline, rx.recv()).await {
                Err(_) => {
                    // No request within the window: retransmit the last item
                    // (or the count when nothing was requested yet).
                    retries += 1;
                    let expected = last_sent.map(|s| s + 1).unwrap_or(0).min(total - 1);
                    if retries > self.item_retries {
                        warn!("vehicle {}: mission upload timed out", handle.id);
                        return Err(UploadError::Timeout(expected));
                    }
                    match last_sent {
                        Some(seq) => {
                            debug!("vehicle {}: retransmitting item {}", handle.id, seq);
                            self.send_item(handle, items, seq, target_system, target_component)
                                .await?;
                        }
                        None => {
                            debug!("vehicle {}: retransmitting mission count", handle.id);
                            handle
                                .send(MavMessage::MISSION_COUNT(MISSION_COUNT_DATA {
                                    target_system,
                                    target_component,
                                    count: total,
                                    ..Default::default()
                                }))
                                .await?;
                        }
                    }
                    continue;
                }
                Ok(Err(broadcast::error::RecvError::Lagged(n))) => {
                    warn!("vehicle {}: upload listener lagged {} events", handle.id, n);
                    continue;
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(UploadError::NotConnected(handle.id));
                }
                Ok(Ok(ev)) => ev,
            };

            let seq = match event {
                LinkEvent::Message(_, MavMessage::MISSION_REQUEST(req)) => Some(req.seq),
                LinkEvent::Message(_, MavMessage::MISSION_REQUEST_INT(req)) => Some(req.seq),
                LinkEvent::Message(_, MavMessage::MISSION_ACK(ack)) => {
                    if last_sent.is_none()
                        && ack.mavtype == MavMissionResult::MAV_MISSION_ACCEPTED
                    {
                        // Ack for the preceding clear-all, not for us.
                        debug!("vehicle {}: ignoring stale mission ack", handle.id);
                        continue;
                    }
                    if ack.mavtype == MavMissionResult::MAV_MISSION_ACCEPTED {
                        info!("vehicle {}: mission of {} items accepted", handle.id, total);
                        return Ok(total);
                    }
                    return Err(UploadError::Rejected(ack.mavtype as u8));
                }
                LinkEvent::Disconnected => return Err(UploadError::NotConnected(handle.id)),
                _ => None,
            };

            if let Some(seq) = seq {
                if seq >= total {
                    warn!("vehicle {}: ignoring out-of-range item request {}", handle.id, seq);
                    continue;
                }
                self.send_item(handle, items, seq, target_system, target_component)
                    .await?;
                last_sent = Some(seq);
                retries = 0;
            }
        }
    }

    async fn send_item(
        &self,
        handle: &VehicleHandle,
        items: &[MissionItem],
        seq: u16,
        target_system: u8,
        target_component: u8,
    ) -> Result<(), LinkError> {
        let item = &items[seq as usize];
        handle
            .send(MavMessage::MISSION_ITEM_INT(MISSION_ITEM_INT_DATA {
                target_system,
                target_component,
                seq,
                frame: MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT_INT,
                command: item.command,
                current: 0,
                autocontinue: 1,
                param1: 0.0,
                param2: 0.0,
                param3: 0.0,
                param4: 0.0,
                x: units::deg_to_scaled(item.lat),
                y: units::deg_to_scaled(item.lon),
                z: item.alt as f32,
                ..Default::default()
            }))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wp(lat: f64, lon: f64, alt: f64) -> Waypoint {
        Waypoint {
            lat,
            lon,
            alt,
            seq: None,
        }
    }

    #[test]
    fn expansion_is_n_plus_three_with_the_right_shape() {
        let wps = vec![
            wp(23.2950, 85.3100, 15.0),
            wp(23.2951, 85.3101, 15.0),
            wp(23.2952, 85.3102, 15.0),
            wp(23.2953, 85.3103, 15.0),
        ];
        let items = expand_waypoints(&wps, Some(15.0)).unwrap();
        assert_eq!(items.len(), 7);

        // Transit to the first survey point, low.
        assert_eq!(items[0].command, MavCmd::MAV_CMD_NAV_WAYPOINT);
        assert_eq!(items[0].lat, 23.2950);
        assert_eq!(items[0].alt, TRANSIT_ALT_M);

        // Takeoff at the first survey point, at survey altitude, with real
        // coordinates.
        assert_eq!(items[1].command, MavCmd::MAV_CMD_NAV_TAKEOFF);
        assert_eq!(items[1].lat, 23.2950);
        assert_eq!(items[1].lon, 85.3100);
        assert_eq!(items[1].alt, 15.0);
        assert_ne!(items[1].lat, 0.0);

        // Operator waypoints in order, then RTL.
        assert_eq!(items[2].lat, 23.2950);
        assert_eq!(items[5].lat, 23.2953);
        assert_eq!(items[6].command, MavCmd::MAV_CMD_NAV_RETURN_TO_LAUNCH);
    }

    #[test]
    fn survey_altitude_defaults_to_first_waypoint() {
        let items = expand_waypoints(&[wp(1.0, 2.0, 22.0)], None).unwrap();
        assert_eq!(items[1].alt, 22.0);
    }

    #[test]
    fn empty_mission_is_a_domain_error() {
        assert!(matches!(expand_waypoints(&[], None), Err(UploadError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_against_the_simulator_transfers_n_plus_three() {
        let (broker, _rx) = tokio::sync::broadcast::channel(256);
        let handle =
            hub_link::vehicle::connect_simulated(1, hub_link::LinkConfig::default(), broker);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(handle.connected());

        let total = MissionUploader::default()
            .upload(&handle, &[wp(12.9716, 77.5946, 15.0)], None)
            .await
            .unwrap();
        assert_eq!(total, 4);
        assert!(!handle.uploading.load(Ordering::Relaxed));
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_uploads_are_rejected() {
        let (broker, _rx) = tokio::sync::broadcast::channel(256);
        let handle =
            hub_link::vehicle::connect_simulated(1, hub_link::LinkConfig::default(), broker);
        tokio::time::sleep(Duration::from_secs(2)).await;

        handle.uploading.store(true, Ordering::Relaxed);
        let err = MissionUploader::default()
            .upload(&handle, &[wp(12.9716, 77.5946, 15.0)], None)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::InProgress));
        // The failed attempt must not have cleared the holder's guard.
        assert!(handle.uploading.load(Ordering::Relaxed));
    }
}
