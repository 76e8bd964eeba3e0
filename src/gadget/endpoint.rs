//! USB endpoint interface consumed by the relay
//!
//! The peripheral controller driver is external. The relay only needs to
//! enable and disable an endpoint, allocate and free transfer requests bound
//! to it, and queue requests. Completions come back asynchronously through
//! the [`CompleteFn`] installed at enable time.

use bytes::BytesMut;
use std::fmt;
use std::sync::Arc;

use crate::error::{RelayError, Result};

/// Completion callback installed on an endpoint
///
/// The controller invokes it once per queued request, including requests
/// flushed by [`UsbEndpoint::disable`]. It may run on any thread and must
/// never be called while the controller holds its own locks.
pub type CompleteFn = Arc<dyn Fn(&dyn UsbEndpoint, UsbRequest) + Send + Sync>;

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

/// Endpoint descriptor handed to the controller on enable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    /// Endpoint address including the direction bit
    pub address: u8,
    /// Maximum packet size
    pub max_packet_size: u16,
}

impl EndpointDescriptor {
    /// High-speed bulk IN descriptor
    pub const fn bulk_in(number: u8) -> Self {
        Self {
            address: 0x80 | (number & 0x0f),
            max_packet_size: 512,
        }
    }

    /// High-speed bulk OUT descriptor
    pub const fn bulk_out(number: u8) -> Self {
        Self {
            address: number & 0x0f,
            max_packet_size: 512,
        }
    }

    /// Direction encoded in the address
    pub fn direction(&self) -> Direction {
        if self.address & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

/// Completion status of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferStatus {
    /// Not completed yet
    #[default]
    Pending,
    /// Transfer finished successfully
    Complete,
    /// Request dequeued by the host (ECONNRESET)
    ConnectionReset,
    /// Endpoint disabled or cable pulled (ESHUTDOWN)
    Shutdown,
    /// Any other controller error, as a negative errno
    Error(i32),
}

impl TransferStatus {
    /// Disconnect-class status: the endpoint is gone
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::ConnectionReset | Self::Shutdown)
    }
}

/// Opaque controller token for an allocated request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestHandle(u64);

impl RequestHandle {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> u64 {
        self.0
    }
}

/// A transfer request travelling between the relay and the controller
///
/// Ownership of the request and its buffer moves with the value: queued to
/// the controller, handed back through the completion, or parked in a
/// [`RequestPool`](super::RequestPool). It is never reachable from two
/// places at once.
pub struct UsbRequest {
    handle: RequestHandle,
    pub(crate) slot: usize,
    pub(crate) session: u64,
    /// Data buffer. IN: bytes to send. OUT: filled by the controller.
    pub buf: BytesMut,
    /// Bytes to transfer (IN) or the most the controller may write (OUT)
    pub length: usize,
    /// Bytes actually transferred, set by the controller
    pub actual: usize,
    /// Completion status, set by the controller
    pub status: TransferStatus,
}

impl UsbRequest {
    pub(crate) fn new(handle: RequestHandle, slot: usize, session: u64) -> Self {
        Self {
            handle,
            slot,
            session,
            buf: BytesMut::new(),
            length: 0,
            actual: 0,
            status: TransferStatus::Pending,
        }
    }

    /// Controller token of this request
    pub fn handle(&self) -> RequestHandle {
        self.handle
    }

    /// Attach a buffer and reset completion state before queueing
    pub(crate) fn prepare(&mut self, buf: BytesMut, length: usize) {
        self.buf = buf;
        self.length = length;
        self.actual = 0;
        self.status = TransferStatus::Pending;
    }

    /// Detach the buffer, leaving the request empty
    pub(crate) fn take_buf(&mut self) -> BytesMut {
        std::mem::take(&mut self.buf)
    }
}

impl fmt::Debug for UsbRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsbRequest")
            .field("handle", &self.handle)
            .field("slot", &self.slot)
            .field("session", &self.session)
            .field("length", &self.length)
            .field("actual", &self.actual)
            .field("status", &self.status)
            .finish()
    }
}

/// A request the controller refused to queue, handed back with the reason
#[derive(Debug)]
pub struct Rejected {
    pub request: UsbRequest,
    pub error: RelayError,
}

/// USB endpoint provided by the peripheral controller driver
pub trait UsbEndpoint: Send + Sync {
    /// Endpoint name (e.g., "ep1in")
    fn name(&self) -> &str;

    /// Configure the endpoint and install the completion callback
    fn enable(&self, desc: &EndpointDescriptor, complete: CompleteFn) -> Result<()>;

    /// Disable the endpoint
    ///
    /// Every request still queued completes with [`TransferStatus::Shutdown`].
    fn disable(&self);

    /// Allocate a request bound to this endpoint
    fn alloc_request(&self) -> Result<RequestHandle>;

    /// Return a request to the controller
    fn free_request(&self, handle: RequestHandle);

    /// Queue a request; completion is reported through the callback
    fn queue(&self, request: UsbRequest) -> std::result::Result<(), Rejected>;
}
