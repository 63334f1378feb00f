pub mod bench;
pub mod config;
pub mod identity;
pub mod orchestrator;
pub mod progress;
pub mod registry;
pub mod signaling;
pub mod stats;
pub mod telemetry;
pub mod transmission;
pub mod transport;
