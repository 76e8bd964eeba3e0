//! rmnet-bam - USB RMNET data relay over a BAM-DMUX modem bus
//!
//! This crate moves network packets between a USB gadget function's bulk
//! endpoint pair and a multiplexed modem channel, one relay port per
//! pair. The USB controller and the modem bus are external; they plug in
//! through the [`gadget::UsbEndpoint`] and [`modem::ModemChannel`] traits.

pub mod config;
pub mod error;
pub mod events;
pub mod gadget;
pub mod modem;
pub mod relay;
pub mod sim;
pub mod utils;

pub use error::{RelayError, Result};
pub use relay::{PortState, PortStats, RelayService, MAX_PORTS};
