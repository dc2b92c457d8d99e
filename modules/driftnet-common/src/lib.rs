pub mod config;
pub mod error;
pub mod telemetry;
pub mod types;

pub use config::IngestConfig;
pub use error::DriftnetError;
pub use types::*;
