//! In-process stand-ins for the peripheral controller and the modem bus
//!
//! Both implement the same traits as the hardware drivers, so the relay
//! runs unchanged against them. They record what crossed them and let the
//! caller decide when transfers complete, which is what the scenario tests
//! and the demo binary need.

mod endpoint;
mod modem;

pub use endpoint::SimEndpoint;
pub use modem::SimModem;
