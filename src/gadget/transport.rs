//! Transport handle: the USB endpoint pair of one connected session

use std::fmt;
use std::sync::Arc;

use super::endpoint::{EndpointDescriptor, UsbEndpoint};

/// Bound USB endpoint pair handed over by the function composition layer
///
/// `in_ep` carries host-bound traffic, `out_ep` modem-bound traffic.
#[derive(Clone)]
pub struct UsbTransport {
    pub in_ep: Arc<dyn UsbEndpoint>,
    pub out_ep: Arc<dyn UsbEndpoint>,
    pub in_desc: EndpointDescriptor,
    pub out_desc: EndpointDescriptor,
}

impl UsbTransport {
    /// Bind an endpoint pair with high-speed bulk descriptors
    pub fn new(in_ep: Arc<dyn UsbEndpoint>, out_ep: Arc<dyn UsbEndpoint>) -> Self {
        Self {
            in_ep,
            out_ep,
            in_desc: EndpointDescriptor::bulk_in(1),
            out_desc: EndpointDescriptor::bulk_out(1),
        }
    }
}

impl fmt::Debug for UsbTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsbTransport")
            .field("in_ep", &self.in_ep.name())
            .field("out_ep", &self.out_ep.name())
            .field("in_desc", &self.in_desc)
            .field("out_desc", &self.out_desc)
            .finish()
    }
}
