//! The registry owns every vehicle link. All connect/disconnect/simulate
//! policy lives here; links themselves never reconnect. The map lock is
//! only ever held to look up or swap entries — never across link I/O.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use hub_link::vehicle::{connect_serial, connect_simulated, VehicleHandle};
use hub_link::{LinkConfig, LinkError};
use hub_proto::channel::BrokerEvent;
use hub_proto::telemetry::DroneSummary;

pub const SIMULATED_ENDPOINT: &str = "simulated";
pub const DEFAULT_BAUD: u32 = 57600;

/// One `[[vehicles]]` block from the configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct VehicleConfig {
    pub id: u8,
    pub endpoint: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
}

fn default_baud() -> u32 {
    DEFAULT_BAUD
}

impl VehicleConfig {
    pub fn is_simulated(&self) -> bool {
        self.endpoint == SIMULATED_ENDPOINT
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("vehicle {0} is not known")]
    Unknown(u8),
    #[error(transparent)]
    Link(#[from] LinkError),
}

pub struct VehicleEntry {
    pub config: VehicleConfig,
    pub handle: VehicleHandle,
}

/// Per-vehicle outcome of a `sync` pass.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub id: u8,
    pub open: bool,
    pub error: Option<String>,
}

pub struct Registry {
    vehicles: Mutex<HashMap<u8, Arc<VehicleEntry>>>,
    configured: Vec<VehicleConfig>,
    link_cfg: LinkConfig,
    broker: broadcast::Sender<BrokerEvent>,
}

impl Registry {
    pub fn new(
        configured: Vec<VehicleConfig>,
        link_cfg: LinkConfig,
        broker: broadcast::Sender<BrokerEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            vehicles: Mutex::new(HashMap::new()),
            configured,
            link_cfg,
            broker,
        })
    }

    /// Startup policy: try every configured vehicle once. Failures keep the
    /// process up — the vehicle just stays disconnected until an operator
    /// reconnect or sync.
    pub fn startup_connect(&self) {
        for cfg in self.configured.clone() {
            match self.connect(cfg.id, &cfg.endpoint, cfg.baud) {
                Ok(()) => info!("vehicle {}: link opened at startup", cfg.id),
                Err(e) => warn!("vehicle {}: startup connect failed: {}", cfg.id, e),
            }
        }
    }

    /// Create (or replace) a link for this vehicle and open it.
    pub fn connect(&self, id: u8, endpoint: &str, baud: u32) -> Result<(), RegistryError> {
        let config = VehicleConfig {
            id,
            endpoint: endpoint.to_string(),
            baud,
        };
        let handle = if config.is_simulated() {
            connect_simulated(id, self.link_cfg.clone(), self.broker.clone())
        } else {
            connect_serial(id, endpoint, baud, self.link_cfg.clone(), self.broker.clone())?
        };
        let entry = Arc::new(VehicleEntry { config, handle });
        let previous = self.vehicles.lock().unwrap().insert(id, entry);
        if let Some(old) = previous {
            old.handle.close();
        }
        Ok(())
    }

    /// Enter simulated mode for a vehicle, replacing any existing link.
    pub fn simulate(&self, id: u8) -> Result<(), RegistryError> {
        self.connect(id, SIMULATED_ENDPOINT, DEFAULT_BAUD)
    }

    /// Close the link but keep the vehicle entry (and its retained
    /// endpoint configuration) for later reconnects.
    pub fn disconnect(&self, id: u8) -> Result<(), RegistryError> {
        let entry = self.get(id)?;
        entry.handle.close();
        info!("vehicle {}: link closed by request", id);
        Ok(())
    }

    /// Close and reopen with the retained configuration.
    pub fn reconnect(&self, id: u8) -> Result<(), RegistryError> {
        let config = {
            let vehicles = self.vehicles.lock().unwrap();
            let entry = vehicles.get(&id).ok_or(RegistryError::Unknown(id))?;
            entry.config.clone()
        };
        self.connect(id, &config.endpoint, config.baud)
    }

    /// Ensure every configured vehicle has an open link; report per vehicle.
    pub fn sync(&self) -> Vec<SyncOutcome> {
        let mut out = Vec::with_capacity(self.configured.len());
        for cfg in self.configured.clone() {
            let open = self
                .vehicles
                .lock()
                .unwrap()
                .get(&cfg.id)
                .map(|e| e.handle.is_open())
                .unwrap_or(false);
            if open {
                out.push(SyncOutcome {
                    id: cfg.id,
                    open: true,
                    error: None,
                });
                continue;
            }
            match self.connect(cfg.id, &cfg.endpoint, cfg.baud) {
                Ok(()) => out.push(SyncOutcome {
                    id: cfg.id,
                    open: true,
                    error: None,
                }),
                Err(e) => out.push(SyncOutcome {
                    id: cfg.id,
                    open: false,
                    error: Some(e.to_string()),
                }),
            }
        }
        out
    }

    pub fn list(&self) -> Vec<DroneSummary> {
        let mut rows: Vec<DroneSummary> = self
            .vehicles
            .lock()
            .unwrap()
            .values()
            .map(|e| DroneSummary {
                id: e.handle.id,
                connected: e.handle.connected(),
                simulated: e.handle.simulated,
                last_seen_ms: e.handle.last_seen_ms(),
            })
            .collect();
        rows.sort_by_key(|r| r.id);
        rows
    }

    pub fn get(&self, id: u8) -> Result<Arc<VehicleEntry>, RegistryError> {
        self.vehicles
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(RegistryError::Unknown(id))
    }

    pub fn contains(&self, id: u8) -> bool {
        self.vehicles.lock().unwrap().contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_registry() -> Arc<Registry> {
        let (broker, _rx) = broadcast::channel(256);
        Registry::new(
            vec![VehicleConfig {
                id: 1,
                endpoint: SIMULATED_ENDPOINT.into(),
                baud: DEFAULT_BAUD,
            }],
            LinkConfig::default(),
            broker,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn simulate_registers_and_connects() {
        let reg = test_registry();
        reg.simulate(1).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        let rows = reg.list();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].connected);
        assert!(rows[0].simulated);
        assert!(rows[0].last_seen_ms.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_keeps_the_entry() {
        let reg = test_registry();
        reg.simulate(1).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        reg.disconnect(1).unwrap();
        assert!(reg.contains(1));
        // A later sync reopens it from the retained configuration.
        let outcomes = reg.sync();
        assert!(outcomes[0].open);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_vehicle_is_an_error() {
        let reg = test_registry();
        assert!(matches!(reg.disconnect(9), Err(RegistryError::Unknown(9))));
        assert!(matches!(reg.get(9), Err(RegistryError::Unknown(9))));
    }
}
