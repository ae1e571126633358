pub mod command;
pub mod registry;

pub use command::{CommandError, CommandRouter, PayloadCommand, VehicleCommand};
pub use registry::{Registry, RegistryError, SyncOutcome, VehicleConfig};
