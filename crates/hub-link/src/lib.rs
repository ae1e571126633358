pub mod link;
pub mod modes;
pub mod sim;
pub mod statusmsg;
pub mod telemetry;
pub mod units;
pub mod vehicle;

use std::time::Duration;

pub use link::LinkEvent;
pub use vehicle::VehicleHandle;

/// Per-link tunables. Our-side identity defaults to the conventional GCS
/// ids (255/190); the peer defaults to 1/1 and is refined from the first
/// heartbeat received.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub system_id: u8,
    pub component_id: u8,
    pub target_system: u8,
    pub target_component: u8,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub status_ring_size: usize,
    pub detection_dedup_size: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            system_id: 255,
            component_id: 190,
            target_system: 1,
            target_component: 1,
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(3),
            status_ring_size: 20,
            detection_dedup_size: 1000,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("open serial port {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: std::io::Error,
    },
    #[error("link to vehicle {0} is not open")]
    NotOpen(u8),
}
