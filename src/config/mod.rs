//! Relay configuration
//!
//! `RelayConfig` carries the tunables of the data path; `ConfigStore`
//! keeps the live copy and lets thresholds change while ports are active.

pub mod schema;
pub mod store;

pub use schema::{RelayConfig, BAM_MUX_HDR, DEFAULT_RX_REQUEST_SIZE};
pub use store::{ConfigChange, ConfigStore};
