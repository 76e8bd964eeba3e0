//! USB gadget side of the relay
//!
//! Architecture:
//! ```text
//! UsbTransport (one connected session)
//!     ├── in_ep  ── RequestPool (tx_queue_size requests) ── host-bound data
//!     └── out_ep ── RequestPool (rx_queue_size requests) ── modem-bound data
//! ```
//!
//! The controller driver implements [`UsbEndpoint`]; the relay owns the
//! request pools and moves [`UsbRequest`] values in and out of them.

pub mod endpoint;
pub mod pool;
pub mod transport;

pub use endpoint::{
    CompleteFn, Direction, EndpointDescriptor, Rejected, RequestHandle, TransferStatus,
    UsbEndpoint, UsbRequest,
};
pub use pool::RequestPool;
pub use transport::UsbTransport;
