use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::trace;

use crate::error::{RelayError, Result};
use crate::gadget::{
    CompleteFn, Direction, EndpointDescriptor, Rejected, RequestHandle, TransferStatus,
    UsbEndpoint, UsbRequest,
};

#[derive(Default)]
struct EpState {
    enabled: bool,
    complete: Option<CompleteFn>,
    queued: VecDeque<UsbRequest>,
    next_handle: u64,
    live: HashSet<RequestHandle>,
    alloc_limit: Option<usize>,
    fail_enable: bool,
    fail_queue: bool,
    delivered: Vec<Bytes>,
    bad_frees: usize,
}

/// Simulated bulk endpoint
///
/// Queued requests sit in FIFO order until the caller completes them with
/// [`complete_next`](Self::complete_next) (IN) or
/// [`receive`](Self::receive) (OUT). Completion callbacks always run
/// without the endpoint lock held.
pub struct SimEndpoint {
    name: String,
    direction: Direction,
    state: Mutex<EpState>,
}

impl SimEndpoint {
    pub fn new(name: &str, direction: Direction) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            direction,
            state: Mutex::new(EpState::default()),
        })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Cap the number of requests that may be allocated at once
    pub fn set_alloc_limit(&self, limit: Option<usize>) {
        self.state.lock().alloc_limit = limit;
    }

    /// Make the next enable calls fail
    pub fn set_fail_enable(&self, fail: bool) {
        self.state.lock().fail_enable = fail;
    }

    /// Make queue calls fail
    pub fn set_fail_queue(&self, fail: bool) {
        self.state.lock().fail_queue = fail;
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    /// Requests queued and not yet completed
    pub fn queued_len(&self) -> usize {
        self.state.lock().queued.len()
    }

    /// Requests allocated and not yet freed
    pub fn live_requests(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Frees of handles that were never allocated or already freed
    pub fn bad_frees(&self) -> usize {
        self.state.lock().bad_frees
    }

    /// Payloads of IN requests completed so far, in completion order
    pub fn take_delivered(&self) -> Vec<Bytes> {
        std::mem::take(&mut self.state.lock().delivered)
    }

    /// Complete the oldest queued request with `status`
    ///
    /// A successful IN completion records the payload as delivered to the
    /// host. Returns `false` if nothing was queued.
    pub fn complete_next(&self, status: TransferStatus) -> bool {
        let (complete, mut req) = {
            let mut state = self.state.lock();
            let Some(complete) = state.complete.clone() else {
                return false;
            };
            let Some(mut req) = state.queued.pop_front() else {
                return false;
            };
            if status == TransferStatus::Complete && self.direction == Direction::In {
                req.actual = req.length;
                state
                    .delivered
                    .push(Bytes::copy_from_slice(&req.buf[..req.length.min(req.buf.len())]));
            }
            (complete, req)
        };
        req.status = status;
        complete(self, req);
        true
    }

    /// Host sends `data` on an OUT endpoint
    ///
    /// Fills the oldest queued request, truncating to its length. Returns
    /// `false` if no request was queued.
    pub fn receive(&self, data: &[u8]) -> bool {
        let (complete, mut req) = {
            let mut state = self.state.lock();
            let Some(complete) = state.complete.clone() else {
                return false;
            };
            let Some(req) = state.queued.pop_front() else {
                return false;
            };
            (complete, req)
        };
        let n = data.len().min(req.length);
        req.buf.clear();
        req.buf.extend_from_slice(&data[..n]);
        req.actual = n;
        req.status = TransferStatus::Complete;
        complete(self, req);
        true
    }
}

impl UsbEndpoint for SimEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn enable(&self, desc: &EndpointDescriptor, complete: CompleteFn) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_enable {
            return Err(RelayError::TransientIo(format!("{}: enable failed", self.name)));
        }
        if desc.direction() != self.direction {
            return Err(RelayError::InvalidArgument(format!(
                "{}: descriptor direction mismatch",
                self.name
            )));
        }
        state.enabled = true;
        state.complete = Some(complete);
        trace!("{}: enabled, addr:{:#04x}", self.name, desc.address);
        Ok(())
    }

    fn disable(&self) {
        let (complete, flushed) = {
            let mut state = self.state.lock();
            state.enabled = false;
            let flushed: Vec<_> = state.queued.drain(..).collect();
            (state.complete.take(), flushed)
        };
        trace!("{}: disabled, flushing {} requests", self.name, flushed.len());
        let Some(complete) = complete else {
            return;
        };
        for mut req in flushed {
            req.status = TransferStatus::Shutdown;
            complete(self, req);
        }
    }

    fn alloc_request(&self) -> Result<RequestHandle> {
        let mut state = self.state.lock();
        if state.alloc_limit.is_some_and(|limit| state.live.len() >= limit) {
            return Err(RelayError::ResourceExhausted(format!(
                "{}: out of requests",
                self.name
            )));
        }
        state.next_handle += 1;
        let handle = RequestHandle::new(state.next_handle);
        state.live.insert(handle);
        Ok(handle)
    }

    fn free_request(&self, handle: RequestHandle) {
        let mut state = self.state.lock();
        if !state.live.remove(&handle) {
            state.bad_frees += 1;
        }
    }

    fn queue(&self, request: UsbRequest) -> std::result::Result<(), Rejected> {
        let mut state = self.state.lock();
        let error = if !state.enabled {
            Some(RelayError::TransportGone)
        } else if state.fail_queue {
            Some(RelayError::TransientIo(format!("{}: queue failed", self.name)))
        } else if !state.live.contains(&request.handle()) {
            Some(RelayError::InvalidArgument(format!(
                "{}: unknown request {:?}",
                self.name,
                request.handle()
            )))
        } else {
            None
        };
        if let Some(error) = error {
            return Err(Rejected { request, error });
        }
        state.queued.push_back(request);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_requires_enable() {
        let ep = SimEndpoint::new("ep1in", Direction::In);
        let handle = ep.alloc_request().unwrap();
        let req = UsbRequest::new(handle, 0, 1);
        let rejected = ep.queue(req).unwrap_err();
        assert!(matches!(rejected.error, RelayError::TransportGone));
    }

    #[test]
    fn test_disable_flushes_with_shutdown() {
        let ep = SimEndpoint::new("ep1out", Direction::Out);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let complete: CompleteFn = Arc::new(move |ep: &dyn UsbEndpoint, req: UsbRequest| {
            s.lock().push(req.status);
            ep.free_request(req.handle());
        });
        ep.enable(&EndpointDescriptor::bulk_out(1), complete).unwrap();

        for slot in 0..3 {
            let handle = ep.alloc_request().unwrap();
            ep.queue(UsbRequest::new(handle, slot, 1)).unwrap();
        }
        ep.disable();

        assert_eq!(*seen.lock(), vec![TransferStatus::Shutdown; 3]);
        assert_eq!(ep.live_requests(), 0);
        assert_eq!(ep.bad_frees(), 0);
    }

    #[test]
    fn test_alloc_limit() {
        let ep = SimEndpoint::new("ep1in", Direction::In);
        ep.set_alloc_limit(Some(1));
        let first = ep.alloc_request().unwrap();
        assert!(ep.alloc_request().is_err());
        ep.free_request(first);
        assert!(ep.alloc_request().is_ok());
    }
}
