//! Request pool
//!
//! An arena of transfer requests allocated from one endpoint for one
//! connected session. Slots are addressed by index and idle slots sit on a
//! free list, so take and give back are O(1). Every slot is either idle,
//! in flight (owned by a [`UsbRequest`] value somewhere else), or retired.

use std::collections::VecDeque;
use tracing::debug;

use super::endpoint::{RequestHandle, UsbEndpoint, UsbRequest};
use crate::error::{RelayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Idle,
    InFlight,
    /// Freed back to the controller while in flight
    Retired,
}

#[derive(Debug)]
struct Slot {
    handle: RequestHandle,
    state: SlotState,
}

/// Fixed-size pool of requests bound to a single endpoint
#[derive(Debug)]
pub struct RequestPool {
    session: u64,
    slots: Vec<Slot>,
    idle: VecDeque<usize>,
}

impl RequestPool {
    /// Allocate up to `depth` requests from `ep`
    ///
    /// A partial allocation succeeds as long as at least one request was
    /// obtained; getting none fails with `ResourceExhausted`.
    pub fn alloc(ep: &dyn UsbEndpoint, depth: usize, session: u64) -> Result<Self> {
        let mut slots = Vec::with_capacity(depth);
        for i in 0..depth {
            match ep.alloc_request() {
                Ok(handle) => slots.push(Slot {
                    handle,
                    state: SlotState::Idle,
                }),
                Err(e) => {
                    debug!("{}: request allocated:{} of {} ({})", ep.name(), i, depth, e);
                    break;
                }
            }
        }

        if slots.is_empty() {
            return Err(RelayError::ResourceExhausted(format!(
                "no requests available on {}",
                ep.name()
            )));
        }

        let idle = (0..slots.len()).collect();
        Ok(Self {
            session,
            slots,
            idle,
        })
    }

    /// Number of live requests (idle plus in flight)
    pub fn capacity(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state != SlotState::Retired)
            .count()
    }

    /// Requests waiting on the free list
    pub fn idle_len(&self) -> usize {
        self.idle.len()
    }

    /// Requests currently owned by the controller or a completion
    pub fn in_flight(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state == SlotState::InFlight)
            .count()
    }

    /// Take an idle request off the free list
    pub fn take(&mut self) -> Option<UsbRequest> {
        let slot = self.idle.pop_front()?;
        let entry = &mut self.slots[slot];
        entry.state = SlotState::InFlight;
        Some(UsbRequest::new(entry.handle, slot, self.session))
    }

    /// Whether `req` is an in-flight request of this pool
    pub fn owns(&self, req: &UsbRequest) -> bool {
        req.session == self.session
            && self
                .slots
                .get(req.slot)
                .is_some_and(|s| s.state == SlotState::InFlight && s.handle == req.handle())
    }

    /// Put a request back on the free list
    ///
    /// The buffer is dropped. A request that does not belong to this pool
    /// (stale session, unknown slot) is handed back so the caller can free
    /// it to its endpoint.
    pub fn give_back(&mut self, mut req: UsbRequest) -> std::result::Result<(), UsbRequest> {
        if !self.owns(&req) {
            return Err(req);
        }
        drop(req.take_buf());
        self.slots[req.slot].state = SlotState::Idle;
        self.idle.push_back(req.slot);
        Ok(())
    }

    /// Remove an in-flight request from the pool for good
    ///
    /// Used when the endpoint reports the transfer as gone: the caller frees
    /// the request to the controller instead of recycling it.
    pub fn retire(&mut self, req: &UsbRequest) -> bool {
        if !self.owns(req) {
            return false;
        }
        self.slots[req.slot].state = SlotState::Retired;
        true
    }

    /// Free every idle request to `ep`
    ///
    /// In-flight requests are freed by their completion once the endpoint
    /// is disabled. Returns the number of requests freed here.
    pub fn release(mut self, ep: &dyn UsbEndpoint) -> usize {
        let mut freed = 0;
        while let Some(slot) = self.idle.pop_front() {
            let entry = &mut self.slots[slot];
            entry.state = SlotState::Retired;
            ep.free_request(entry.handle);
            freed += 1;
        }
        debug!("{}: released {} idle requests", ep.name(), freed);
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gadget::endpoint::Direction;
    use crate::sim::SimEndpoint;

    #[test]
    fn test_alloc_full_depth() {
        let ep = SimEndpoint::new("ep1in", Direction::In);
        let pool = RequestPool::alloc(&*ep, 8, 1).unwrap();
        assert_eq!(pool.capacity(), 8);
        assert_eq!(pool.idle_len(), 8);
        assert_eq!(ep.live_requests(), 8);
    }

    #[test]
    fn test_partial_alloc_succeeds() {
        let ep = SimEndpoint::new("ep1in", Direction::In);
        ep.set_alloc_limit(Some(3));
        let pool = RequestPool::alloc(&*ep, 8, 1).unwrap();
        assert_eq!(pool.capacity(), 3);
    }

    #[test]
    fn test_alloc_nothing_fails() {
        let ep = SimEndpoint::new("ep1in", Direction::In);
        ep.set_alloc_limit(Some(0));
        let err = RequestPool::alloc(&*ep, 8, 1).unwrap_err();
        assert!(matches!(err, RelayError::ResourceExhausted(_)));
    }

    #[test]
    fn test_take_and_give_back() {
        let ep = SimEndpoint::new("ep1out", Direction::Out);
        let mut pool = RequestPool::alloc(&*ep, 2, 7).unwrap();

        let a = pool.take().unwrap();
        let b = pool.take().unwrap();
        assert!(pool.take().is_none());
        assert_eq!(pool.in_flight(), 2);
        assert_eq!(pool.idle_len() + pool.in_flight(), pool.capacity());

        pool.give_back(a).unwrap();
        assert_eq!(pool.idle_len(), 1);
        pool.give_back(b).unwrap();
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn test_foreign_request_is_refused() {
        let ep = SimEndpoint::new("ep1out", Direction::Out);
        let mut old = RequestPool::alloc(&*ep, 1, 1).unwrap();
        let mut new = RequestPool::alloc(&*ep, 1, 2).unwrap();

        let stale = old.take().unwrap();
        let stale = new.give_back(stale).unwrap_err();
        assert_eq!(new.idle_len(), 1);

        // Giving the same slot back twice is impossible: the value moved.
        old.give_back(stale).unwrap();
        assert_eq!(old.idle_len(), 1);
    }

    #[test]
    fn test_retire_and_release() {
        let ep = SimEndpoint::new("ep1out", Direction::Out);
        let mut pool = RequestPool::alloc(&*ep, 4, 1).unwrap();

        let gone = pool.take().unwrap();
        assert!(pool.retire(&gone));
        ep.free_request(gone.handle());
        assert_eq!(pool.capacity(), 3);

        let _in_flight = pool.take().unwrap();
        assert_eq!(pool.release(&*ep), 2);
        // One request is still owned by `_in_flight`
        assert_eq!(ep.live_requests(), 1);
    }
}
