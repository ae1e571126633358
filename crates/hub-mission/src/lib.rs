pub mod geo;
pub mod orchestrator;
pub mod persist;
pub mod upload;

pub use orchestrator::{MissionError, MissionOrchestrator};
pub use upload::{MissionUploader, UploadError};
