//! RMNET data relay service
//!
//! Owns up to [`MAX_PORTS`] relay ports and the executor their deferred
//! work runs on. The function composition layer drives it:
//!
//! ```text
//! setup(n) ──> connect(usb, port) ──> [connect work: open channel, alloc pools]
//!                     │                                │
//!                     │                           port Active
//!                     ▼                                │
//!              disconnect(port) <──────────────────────┘
//!                     │
//!              teardown() (all ports, then the executor)
//! ```
//!
//! `connect` returns once the endpoints are enabled. Whether the channel
//! came up is reported through the event bus (`port.active`,
//! `port.channel_open_failed`, `port.failed`) and visible in [`PortStats`].

mod port;
pub mod stats;
pub mod workqueue;

pub use port::PortState;
pub use stats::{render, PoolStats, PortStats, DEBUG_BUF_SIZE};
pub use workqueue::{Work, WorkQueue};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::{ConfigStore, RelayConfig};
use crate::error::{RelayError, Result};
use crate::events::{EventBus, RelayEvent};
use crate::gadget::UsbTransport;
use crate::modem::ModemChannel;
use port::Port;

/// Upper bound on relay ports per service
pub const MAX_PORTS: usize = 4;

/// Name of the shared work executor
const WORKQUEUE_NAME: &str = "k_gbam";

/// Relay service - port table plus shared executor
pub struct RelayService {
    ports: Vec<Arc<Port>>,
    wq: Arc<WorkQueue>,
    config: ConfigStore,
    events: Arc<EventBus>,
    torn_down: AtomicBool,
}

impl RelayService {
    /// Create `count` idle ports bound to consecutive modem channels
    pub fn setup(count: usize, modem: Arc<dyn ModemChannel>, config: ConfigStore) -> Result<Self> {
        Self::setup_with_events(count, modem, config, Arc::new(EventBus::new()))
    }

    /// Like [`setup`](Self::setup), publishing on an existing event bus
    pub fn setup_with_events(
        count: usize,
        modem: Arc<dyn ModemChannel>,
        config: ConfigStore,
        events: Arc<EventBus>,
    ) -> Result<Self> {
        let cfg = config.get();
        debug!("Setting up {} relay ports", count);

        if count == 0 || count > MAX_PORTS {
            return Err(RelayError::InvalidArgument(format!(
                "invalid port count {}, expected 1..={}",
                count, MAX_PORTS
            )));
        }
        if count > cfg.channel_ids.len() {
            return Err(RelayError::InvalidArgument(format!(
                "{} ports requested but only {} channel ids configured",
                count,
                cfg.channel_ids.len()
            )));
        }

        let wq = Arc::new(WorkQueue::new(WORKQUEUE_NAME, cfg.workers).map_err(|e| {
            RelayError::ResourceExhausted(format!("unable to create workqueue: {}", e))
        })?);

        let ports = cfg
            .channel_ids
            .iter()
            .take(count)
            .enumerate()
            .map(|(num, &channel_id)| {
                Port::new(
                    num,
                    channel_id,
                    modem.clone(),
                    config.clone(),
                    wq.clone(),
                    events.clone(),
                )
            })
            .collect();

        info!("Relay service ready with {} ports", count);
        Ok(Self {
            ports,
            wq,
            config,
            events,
            torn_down: AtomicBool::new(false),
        })
    }

    fn port(&self, num: usize) -> Result<&Arc<Port>> {
        self.ports.get(num).ok_or(RelayError::InvalidPort(num))
    }

    /// Bind a transport to a port and start bringing it up
    pub fn connect(&self, usb: Arc<UsbTransport>, port: usize) -> Result<()> {
        let p = self.port(port)?;
        if self.torn_down.load(Ordering::Acquire) || self.wq.is_destroyed() {
            return Err(RelayError::NotReady("relay service torn down".to_string()));
        }
        debug!("port {}: connect on {:?}", port, usb);
        p.connect(usb)
    }

    /// Tear a port down; a port that is not connected is left alone
    pub fn disconnect(&self, port: usize) -> Result<()> {
        self.port(port)?.disconnect();
        Ok(())
    }

    pub fn port_state(&self, port: usize) -> Result<PortState> {
        Ok(self.port(port)?.state())
    }

    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    /// Snapshot every port
    pub fn stats(&self) -> Vec<PortStats> {
        self.ports.iter().map(|p| p.stats()).collect()
    }

    pub fn port_stats(&self, port: usize) -> Result<PortStats> {
        Ok(self.port(port)?.stats())
    }

    /// Diagnostics text for every port
    pub fn read_stats(&self) -> String {
        render(&self.stats())
    }

    /// Zero every port's counters; any input triggers it
    ///
    /// Returns the number of input bytes consumed. The pending-with-modem
    /// gauge (`dpkts_pwith_bam`) is left as is, flow control depends on it.
    pub fn reset_stats(&self, input: &[u8]) -> usize {
        for port in &self.ports {
            port.reset_stats();
        }
        self.events.publish(RelayEvent::StatsReset);
        input.len()
    }

    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    /// Update tunables; thresholds apply immediately, pool sizes at next connect
    pub fn update_config<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut RelayConfig),
    {
        self.config.update(f)
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    /// Wait for all deferred work scheduled so far
    ///
    /// Must not be called from inside a tokio runtime.
    pub fn flush(&self) {
        self.wq.flush();
    }

    /// Disconnect every port and destroy the executor
    ///
    /// Idempotent; later `connect` calls fail with `NotReady`.
    pub fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        for port in &self.ports {
            if port.state() != PortState::Idle {
                warn!("port {}: still connected at teardown", port.num());
            }
            port.disconnect();
        }
        self.wq.destroy();
        info!("Relay service torn down");
    }
}

impl Drop for RelayService {
    fn drop(&mut self) {
        self.teardown();
    }
}
