//! Relay port: one bidirectional data path
//!
//! Data flow:
//! ```text
//!            host-bound                          modem-bound
//! modem ── on_receive ──> tohost.queue     out_ep ── epout_complete ──> tomodem.queue
//!                             │                                            │
//!               write_data_tohost (inline)              write_data_tomodem (work item)
//!                             │                                            │
//!                   in_ep.queue(request)                         modem.write(packet)
//!                             │                                            │
//!               epin_complete ─┘ (request back to pool)   on_write_done ──┘ (pending--)
//! ```
//!
//! Every piece of shared state sits in [`PortInner`] behind one lock. The
//! lock is dropped around each call into a transport so that transports may
//! complete synchronously. After reacquiring it, code re-checks the session
//! number: a disconnect in between bumps it and takes the pools away, and
//! the stale caller then frees what it holds instead of touching the queues.

use bytes::BytesMut;
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

use super::stats::{PoolStats, PortCounters, PortStats};
use super::workqueue::{Work, WorkQueue};
use crate::config::ConfigStore;
use crate::error::{RelayError, Result};
use crate::events::{EventBus, RelayEvent};
use crate::gadget::{CompleteFn, RequestPool, TransferStatus, UsbEndpoint, UsbRequest, UsbTransport};
use crate::modem::{ChannelClient, ModemChannel};
use crate::utils::LogThrottler;
use crate::{error_throttled, warn_throttled};

/// Lifecycle state of a port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PortState {
    /// No transport bound
    Idle,
    /// Transport bound, connect work pending or running
    Connecting,
    /// Modem channel open and request pools allocated
    Active,
    /// Connect work gave up; waiting for disconnect
    Failed,
    /// Teardown in progress
    Disconnecting,
}

#[derive(Debug, Default)]
struct HostBound {
    pool: Option<RequestPool>,
    queue: VecDeque<BytesMut>,
    /// Someone is inside `write_data_tohost`; keeps submissions in FIFO order
    draining: bool,
}

#[derive(Debug, Default)]
struct ModemBound {
    pool: Option<RequestPool>,
    queue: VecDeque<BytesMut>,
}

struct PortInner {
    state: PortState,
    /// Bumped on every connect and disconnect
    session: u64,
    usb: Option<Arc<UsbTransport>>,
    opened: bool,
    last_error: Option<String>,
    tohost: HostBound,
    tomodem: ModemBound,
    counters: PortCounters,
}

impl PortInner {
    fn is_live(&self, session: u64) -> bool {
        self.usb.is_some() && self.session == session
    }
}

fn pool_stats(pool: Option<&RequestPool>) -> PoolStats {
    pool.map(|p| PoolStats {
        capacity: p.capacity(),
        idle: p.idle_len(),
        in_flight: p.in_flight(),
    })
    .unwrap_or_default()
}

pub(crate) struct Port {
    num: usize,
    channel_id: u32,
    inner: Mutex<PortInner>,
    modem: Arc<dyn ModemChannel>,
    config: ConfigStore,
    wq: Arc<WorkQueue>,
    events: Arc<EventBus>,
    throttler: LogThrottler,
    connect_work: Arc<Work>,
    tomodem_work: Arc<Work>,
    this: Weak<Port>,
}

impl Port {
    pub fn new(
        num: usize,
        channel_id: u32,
        modem: Arc<dyn ModemChannel>,
        config: ConfigStore,
        wq: Arc<WorkQueue>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        let throttle_secs = config.get().log_throttle_secs;
        Arc::new_cyclic(|this: &Weak<Port>| {
            let port = this.clone();
            let connect_work = Work::new("connect", move || {
                if let Some(port) = port.upgrade() {
                    port.open_channel();
                }
            });
            let port = this.clone();
            let tomodem_work = Work::new("write_tomodem", move || {
                if let Some(port) = port.upgrade() {
                    port.write_data_tomodem();
                }
            });

            debug!("port:{} channel:{} allocated", num, channel_id);
            Self {
                num,
                channel_id,
                inner: Mutex::new(PortInner {
                    state: PortState::Idle,
                    session: 0,
                    usb: None,
                    opened: false,
                    last_error: None,
                    tohost: HostBound::default(),
                    tomodem: ModemBound::default(),
                    counters: PortCounters::default(),
                }),
                modem,
                config,
                wq,
                events,
                throttler: LogThrottler::with_secs(throttle_secs),
                connect_work,
                tomodem_work,
                this: this.clone(),
            }
        })
    }

    pub fn num(&self) -> usize {
        self.num
    }

    pub fn state(&self) -> PortState {
        self.inner.lock().state
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Bind a transport, enable its endpoints and schedule the connect work
    pub fn connect(&self, usb: Arc<UsbTransport>) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if inner.state != PortState::Idle {
                return Err(RelayError::NotReady(format!(
                    "port {} is {:?}",
                    self.num, inner.state
                )));
            }
            // Reserve the port while the endpoints are enabled unlocked
            inner.state = PortState::Connecting;
        }

        if let Err(e) = usb.in_ep.enable(&usb.in_desc, self.epin_complete_fn()) {
            error!("port {}: usb ep enable failed eptype:IN ep:{}: {}", self.num, usb.in_ep.name(), e);
            self.inner.lock().state = PortState::Idle;
            return Err(e);
        }
        if let Err(e) = usb.out_ep.enable(&usb.out_desc, self.epout_complete_fn()) {
            error!("port {}: usb ep enable failed eptype:OUT ep:{}: {}", self.num, usb.out_ep.name(), e);
            usb.in_ep.disable();
            self.inner.lock().state = PortState::Idle;
            return Err(e);
        }

        {
            let mut inner = self.inner.lock();
            inner.session += 1;
            inner.usb = Some(usb);
            inner.opened = false;
            inner.last_error = None;
            inner.tohost = HostBound::default();
            inner.tomodem = ModemBound::default();
            inner.counters = PortCounters::default();
        }

        info!("port {}: connected, opening channel {}", self.num, self.channel_id);
        self.events.publish(RelayEvent::PortConnected { port: self.num });
        self.wq.queue(&self.connect_work);
        Ok(())
    }

    /// Tear the port down; safe to call in any state, any number of times
    pub fn disconnect(&self) {
        let (usb, tohost, tomodem, opened) = {
            let mut inner = self.inner.lock();
            let Some(usb) = inner.usb.take() else {
                debug!("port {}: already disconnected", self.num);
                return;
            };
            inner.state = PortState::Disconnecting;
            inner.session += 1;
            let tohost = std::mem::take(&mut inner.tohost);
            let tomodem = std::mem::take(&mut inner.tomodem);
            let opened = std::mem::replace(&mut inner.opened, false);
            (usb, tohost, tomodem, opened)
        };

        debug!(
            "port {}: freeing {} host-bound and {} modem-bound buffers",
            self.num,
            tohost.queue.len(),
            tomodem.queue.len()
        );
        drop(tohost.queue);
        drop(tomodem.queue);
        if let Some(pool) = tohost.pool {
            pool.release(&*usb.in_ep);
        }
        if let Some(pool) = tomodem.pool {
            pool.release(&*usb.out_ep);
        }

        // Flushes in-flight requests back through the completions, which
        // now see a dead session and free them
        usb.out_ep.disable();
        usb.in_ep.disable();

        if opened {
            self.modem.close(self.channel_id);
        }

        {
            let mut inner = self.inner.lock();
            if inner.state == PortState::Disconnecting {
                inner.state = PortState::Idle;
            }
        }
        info!("port {}: disconnected", self.num);
        self.events.publish(RelayEvent::PortDisconnected { port: self.num });
    }

    fn open_channel(self: &Arc<Self>) {
        let session = {
            let inner = self.inner.lock();
            if inner.state != PortState::Connecting || inner.usb.is_none() {
                debug!("port {}: connect work without pending connect", self.num);
                return;
            }
            inner.session
        };

        let config = self.config.get();
        let mut attempt: u32 = 0;
        loop {
            let client: Arc<dyn ChannelClient> = self.clone();
            match self.modem.open(self.channel_id, client) {
                Ok(()) => break,
                Err(e) if attempt >= config.channel_open_retries => {
                    error!("port {}: unable to open bam ch:{} err:{}", self.num, self.channel_id, e);
                    self.fail(session, &e);
                    self.events.publish(RelayEvent::ChannelOpenFailed {
                        port: self.num,
                        channel_id: self.channel_id,
                        reason: e.to_string(),
                    });
                    return;
                }
                Err(e) => {
                    attempt += 1;
                    warn!(
                        "port {}: open bam ch:{} failed ({}), retry {}/{}",
                        self.num, self.channel_id, e, attempt, config.channel_open_retries
                    );
                    std::thread::sleep(Duration::from_millis(
                        config.channel_open_backoff_ms * u64::from(attempt),
                    ));
                    if !self.inner.lock().is_live(session) {
                        debug!("port {}: disconnected while opening channel", self.num);
                        return;
                    }
                }
            }
        }

        {
            let mut inner = self.inner.lock();
            if !inner.is_live(session) {
                drop(inner);
                info!("port {}: disconnected during open, closing ch:{}", self.num, self.channel_id);
                self.modem.close(self.channel_id);
                return;
            }
            inner.opened = true;
        }
        self.events.publish(RelayEvent::ChannelOpened {
            port: self.num,
            channel_id: self.channel_id,
        });

        self.start_io(session);
        debug!("port {}: connect work done", self.num);
    }

    fn start_io(&self, session: u64) {
        let usb = {
            let inner = self.inner.lock();
            match inner.usb.clone() {
                Some(usb) if inner.session == session => usb,
                _ => return,
            }
        };

        let config = self.config.get();
        let rx_pool = match RequestPool::alloc(&*usb.out_ep, config.rx_queue_size, session) {
            Ok(pool) => pool,
            Err(e) => {
                error!("port {}: rx req allocation failed: {}", self.num, e);
                self.fail(session, &e);
                self.events.publish(RelayEvent::PortFailed {
                    port: self.num,
                    reason: e.to_string(),
                });
                return;
            }
        };
        let tx_pool = match RequestPool::alloc(&*usb.in_ep, config.tx_queue_size, session) {
            Ok(pool) => pool,
            Err(e) => {
                error!("port {}: tx req allocation failed: {}", self.num, e);
                rx_pool.release(&*usb.out_ep);
                self.fail(session, &e);
                self.events.publish(RelayEvent::PortFailed {
                    port: self.num,
                    reason: e.to_string(),
                });
                return;
            }
        };

        {
            let mut inner = self.inner.lock();
            if !inner.is_live(session) {
                drop(inner);
                rx_pool.release(&*usb.out_ep);
                tx_pool.release(&*usb.in_ep);
                return;
            }
            inner.tomodem.pool = Some(rx_pool);
            inner.tohost.pool = Some(tx_pool);
            inner.state = PortState::Active;
        }
        info!("port {}: active", self.num);
        self.events.publish(RelayEvent::PortActive { port: self.num });

        // Queue OUT requests and flush anything the modem sent early
        self.start_rx();
        self.write_data_tohost();
    }

    fn fail(&self, session: u64, err: &RelayError) {
        let mut inner = self.inner.lock();
        if inner.is_live(session) {
            inner.state = PortState::Failed;
            inner.last_error = Some(err.to_string());
        }
    }

    // ------------------------------------------------------------------
    // Host-bound path: modem -> USB IN
    // ------------------------------------------------------------------

    fn data_recv(&self, packet: BytesMut) {
        trace!("port {}: recv len:{}", self.num, packet.len());
        let threshold = self.config.get().tx_pkt_drop_threshold;
        {
            let mut inner = self.inner.lock();
            if inner.usb.is_none() {
                return;
            }
            if inner.tohost.queue.len() > threshold {
                inner.counters.tohost_drop += 1;
                let dropped = inner.counters.tohost_drop;
                drop(inner);
                error_throttled!(
                    self.throttler,
                    "tohost_drop",
                    "port {}: tx pkt dropped: tx_drop_cnt:{}",
                    self.num,
                    dropped
                );
                return;
            }
            inner.tohost.queue.push_back(packet);
        }
        self.write_data_tohost();
    }

    fn write_data_tohost(&self) {
        let mut inner = self.inner.lock();
        let Some(usb) = inner.usb.clone() else {
            return;
        };
        if inner.tohost.draining {
            // The active drainer re-checks the queue before it lets go
            return;
        }
        let session = inner.session;
        inner.tohost.draining = true;

        loop {
            let next = {
                let tohost = &mut inner.tohost;
                match tohost.pool.as_mut() {
                    Some(pool) if pool.idle_len() > 0 && !tohost.queue.is_empty() => {
                        pool.take().zip(tohost.queue.pop_front())
                    }
                    _ => None,
                }
            };
            let Some((mut req, packet)) = next else {
                break;
            };

            let len = packet.len();
            req.prepare(packet, len);
            let result = MutexGuard::unlocked(&mut inner, || usb.in_ep.queue(req));

            if !inner.is_live(session) {
                drop(inner);
                if let Err(rejected) = result {
                    usb.in_ep.free_request(rejected.request.handle());
                }
                return;
            }

            match result {
                Ok(()) => inner.counters.to_host += 1,
                Err(rejected) => {
                    inner.counters.tohost_drop += 1;
                    let leftover = match inner.tohost.pool.as_mut() {
                        Some(pool) => pool.give_back(rejected.request).err(),
                        None => Some(rejected.request),
                    };
                    if let Some(req) = leftover {
                        usb.in_ep.free_request(req.handle());
                    }
                    error_throttled!(
                        self.throttler,
                        "epin_queue",
                        "port {}: usb epIn failed: {}",
                        self.num,
                        rejected.error
                    );
                    break;
                }
            }
        }

        inner.tohost.draining = false;
    }

    fn epin_complete(&self, ep: &dyn UsbEndpoint, mut req: UsbRequest) {
        match req.status {
            TransferStatus::Complete | TransferStatus::ConnectionReset | TransferStatus::Shutdown => {}
            status => warn_throttled!(
                self.throttler,
                "epin_status",
                "port {}: data tx ep error {:?}",
                self.num,
                status
            ),
        }

        drop(req.take_buf());

        let leftover = {
            let mut inner = self.inner.lock();
            match inner.tohost.pool.as_mut() {
                Some(pool) => pool.give_back(req).err(),
                None => Some(req),
            }
        };
        if let Some(req) = leftover {
            ep.free_request(req.handle());
            return;
        }

        self.write_data_tohost();
    }

    // ------------------------------------------------------------------
    // Modem-bound path: USB OUT -> modem
    // ------------------------------------------------------------------

    fn epout_complete(&self, ep: &dyn UsbEndpoint, mut req: UsbRequest) {
        let packet = match req.status {
            TransferStatus::Complete => {
                let mut buf = req.take_buf();
                buf.truncate(req.actual);
                Some(buf)
            }
            status if status.is_disconnect() => {
                // Cable disconnection: the request goes back to the controller
                drop(req.take_buf());
                if let Some(pool) = self.inner.lock().tomodem.pool.as_mut() {
                    pool.retire(&req);
                }
                ep.free_request(req.handle());
                return;
            }
            status => {
                error_throttled!(
                    self.throttler,
                    "epout_status",
                    "port {}: {} response error {:?}, {}/{}",
                    self.num,
                    ep.name(),
                    status,
                    req.actual,
                    req.length
                );
                drop(req.take_buf());
                None
            }
        };

        let mut inner = self.inner.lock();
        let owned = inner.tomodem.pool.as_ref().is_some_and(|p| p.owns(&req));
        let usb = match inner.usb.clone() {
            Some(usb) if owned => usb,
            _ => {
                drop(inner);
                ep.free_request(req.handle());
                return;
            }
        };
        let session = inner.session;

        if let Some(packet) = packet {
            inner.tomodem.queue.push_back(packet);
            self.wq.queue(&self.tomodem_work);
        }

        let config = self.config.get();
        if config.rx_should_hold(inner.counters.pending_with_modem) {
            trace!(
                "port {}: holding rx request, pending:{}",
                self.num,
                inner.counters.pending_with_modem
            );
            self.park_rx(&mut inner, &*usb.out_ep, req);
            return;
        }

        self.queue_rx(&mut inner, &usb, session, req, config.rx_request_size);
    }

    /// Put an OUT request back on the idle list, or free it if its pool is gone
    fn park_rx(&self, inner: &mut PortInner, ep: &dyn UsbEndpoint, req: UsbRequest) {
        let leftover = match inner.tomodem.pool.as_mut() {
            Some(pool) => pool.give_back(req).err(),
            None => Some(req),
        };
        if let Some(req) = leftover {
            ep.free_request(req.handle());
        }
    }

    /// Attach a fresh buffer to `req` and queue it on the OUT endpoint
    ///
    /// Called with the lock held; drops it around the submit. Returns
    /// `false` if the endpoint refused the request.
    fn queue_rx(
        &self,
        inner: &mut MutexGuard<'_, PortInner>,
        usb: &UsbTransport,
        session: u64,
        mut req: UsbRequest,
        size: usize,
    ) -> bool {
        req.prepare(BytesMut::with_capacity(size), size);
        let result = MutexGuard::unlocked(inner, || usb.out_ep.queue(req));
        let Err(rejected) = result else {
            return true;
        };

        error_throttled!(
            self.throttler,
            "epout_queue",
            "port {}: data rx enqueue err {}",
            self.num,
            rejected.error
        );
        if inner.is_live(session) {
            self.park_rx(inner, &*usb.out_ep, rejected.request);
        } else {
            usb.out_ep.free_request(rejected.request.handle());
        }
        false
    }

    /// Queue idle OUT requests until flow control or the pool says stop
    fn start_rx(&self) {
        let mut inner = self.inner.lock();
        let Some(usb) = inner.usb.clone() else {
            return;
        };
        let session = inner.session;

        loop {
            let config = self.config.get();
            if !inner.is_live(session) || config.rx_should_hold(inner.counters.pending_with_modem) {
                break;
            }
            let Some(req) = inner.tomodem.pool.as_mut().and_then(|p| p.take()) else {
                break;
            };
            if !self.queue_rx(&mut inner, &usb, session, req, config.rx_request_size) {
                break;
            }
        }
    }

    fn write_data_tomodem(&self) {
        let mut inner = self.inner.lock();
        if inner.usb.is_none() {
            return;
        }
        let session = inner.session;
        let max_failures = self.config.get().max_consecutive_write_failures;
        let mut failures: u32 = 0;

        while let Some(packet) = inner.tomodem.queue.pop_front() {
            inner.counters.pending_with_modem += 1;
            inner.counters.to_modem += 1;
            trace!(
                "port {}: tom:{} pbam:{}",
                self.num,
                inner.counters.to_modem,
                inner.counters.pending_with_modem
            );

            let result = MutexGuard::unlocked(&mut inner, || self.modem.write(self.channel_id, packet));
            if !inner.is_live(session) {
                return;
            }

            let Err(e) = result else {
                failures = 0;
                continue;
            };

            debug!("port {}: write error: {}", self.num, e);
            let counters = &mut inner.counters;
            counters.pending_with_modem = counters.pending_with_modem.saturating_sub(1);
            counters.to_modem = counters.to_modem.saturating_sub(1);
            counters.tomodem_drop += 1;
            failures += 1;

            if matches!(e, RelayError::ChannelUnavailable(_)) || failures >= max_failures {
                warn!(
                    "port {}: stopping modem writes after {} failures, {} packets left queued",
                    self.num,
                    failures,
                    inner.tomodem.queue.len()
                );
                break;
            }
        }
    }

    fn data_write_done(&self, packet: BytesMut) {
        drop(packet);

        let mut inner = self.inner.lock();
        if inner.usb.is_none() {
            return;
        }
        let counters = &mut inner.counters;
        counters.pending_with_modem = counters.pending_with_modem.saturating_sub(1);
        let pending = counters.pending_with_modem;
        trace!("port {}: write done, pbam:{}", self.num, pending);

        // Packets left behind by a pass that gave up
        if !inner.tomodem.queue.is_empty() {
            self.wq.queue(&self.tomodem_work);
        }

        if !self.config.get().rx_may_resume(pending) {
            return;
        }
        drop(inner);

        self.start_rx();
    }

    // ------------------------------------------------------------------
    // Callbacks and diagnostics
    // ------------------------------------------------------------------

    fn epin_complete_fn(&self) -> CompleteFn {
        let port = self.this.clone();
        Arc::new(move |ep: &dyn UsbEndpoint, req: UsbRequest| match port.upgrade() {
            Some(port) => port.epin_complete(ep, req),
            None => ep.free_request(req.handle()),
        })
    }

    fn epout_complete_fn(&self) -> CompleteFn {
        let port = self.this.clone();
        Arc::new(move |ep: &dyn UsbEndpoint, req: UsbRequest| match port.upgrade() {
            Some(port) => port.epout_complete(ep, req),
            None => ep.free_request(req.handle()),
        })
    }

    pub fn stats(&self) -> PortStats {
        let inner = self.inner.lock();
        PortStats {
            port: self.num,
            channel_id: self.channel_id,
            state: inner.state,
            channel_opened: inner.opened,
            to_host: inner.counters.to_host,
            to_modem: inner.counters.to_modem,
            pending_with_modem: inner.counters.pending_with_modem,
            tohost_drop: inner.counters.tohost_drop,
            tomodem_drop: inner.counters.tomodem_drop,
            tx_queue_len: inner.tohost.queue.len(),
            rx_queue_len: inner.tomodem.queue.len(),
            tx_requests: pool_stats(inner.tohost.pool.as_ref()),
            rx_requests: pool_stats(inner.tomodem.pool.as_ref()),
            last_error: inner.last_error.clone(),
        }
    }

    pub fn reset_stats(&self) {
        self.inner.lock().counters.reset();
    }
}

impl ChannelClient for Port {
    fn on_receive(&self, packet: BytesMut) {
        self.data_recv(packet);
    }

    fn on_write_done(&self, packet: BytesMut) {
        self.data_write_done(packet);
    }
}
