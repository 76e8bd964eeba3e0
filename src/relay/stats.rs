//! Per-port diagnostics
//!
//! Counters live inside the port state and are only touched under the port
//! lock. Readers get a [`PortStats`] snapshot taken under that same lock,
//! one port at a time, so a snapshot never tears.

use serde::Serialize;
use std::fmt::Write;

use super::port::PortState;

/// Size bound of the rendered diagnostics text
pub const DEBUG_BUF_SIZE: usize = 1024;

/// Live counters of one port
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PortCounters {
    /// Packets submitted to the USB IN endpoint
    pub to_host: u64,
    /// Packets written to the modem channel
    pub to_modem: u64,
    /// Modem writes not yet acknowledged by `write_done`
    pub pending_with_modem: usize,
    /// Host-bound packets dropped (threshold or submit failure)
    pub tohost_drop: u64,
    /// Modem-bound packets dropped on write failure
    pub tomodem_drop: u64,
}

impl PortCounters {
    /// Zero the cumulative counters
    ///
    /// `pending_with_modem` is a gauge of writes the modem still owns and
    /// drives receive flow control, so it survives a diagnostics reset.
    pub fn reset(&mut self) {
        self.to_host = 0;
        self.to_modem = 0;
        self.tohost_drop = 0;
        self.tomodem_drop = 0;
    }
}

/// Request pool occupancy of one direction
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Live requests in the pool
    pub capacity: usize,
    /// Requests on the free list
    pub idle: usize,
    /// Requests owned by the controller or a running completion
    pub in_flight: usize,
}

/// Snapshot of one port
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortStats {
    pub port: usize,
    pub channel_id: u32,
    pub state: PortState,
    pub channel_opened: bool,
    pub to_host: u64,
    pub to_modem: u64,
    pub pending_with_modem: usize,
    pub tohost_drop: u64,
    pub tomodem_drop: u64,
    /// Host-bound packets waiting for an IN request
    pub tx_queue_len: usize,
    /// Modem-bound packets waiting for the relay work
    pub rx_queue_len: usize,
    pub tx_requests: PoolStats,
    pub rx_requests: PoolStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Render snapshots in the debugfs text layout, bounded to [`DEBUG_BUF_SIZE`]
pub fn render(stats: &[PortStats]) -> String {
    let mut buf = String::with_capacity(DEBUG_BUF_SIZE);
    for s in stats {
        let _ = write!(
            buf,
            "#PORT:{} channel:{} state:{:?}#\n\
             dpkts_to_usbhost: {}\n\
             dpkts_to_modem:  {}\n\
             dpkts_pwith_bam: {}\n\
             to_usbhost_dcnt:  {}\n\
             tomodem__dcnt:  {}\n\
             tx_buf_len:\t {}\n\
             rx_buf_len:\t {}\n\
             data_ch_opened: {}\n",
            s.port,
            s.channel_id,
            s.state,
            s.to_host,
            s.to_modem,
            s.pending_with_modem,
            s.tohost_drop,
            s.tomodem_drop,
            s.tx_queue_len,
            s.rx_queue_len,
            u8::from(s.channel_opened),
        );
        if buf.len() >= DEBUG_BUF_SIZE {
            break;
        }
    }
    // Output is ASCII, any byte offset is a char boundary
    buf.truncate(DEBUG_BUF_SIZE);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(port: usize) -> PortStats {
        PortStats {
            port,
            channel_id: 8 + port as u32,
            state: PortState::Active,
            channel_opened: true,
            to_host: 10,
            to_modem: 20,
            pending_with_modem: 3,
            tohost_drop: 1,
            tomodem_drop: 2,
            tx_queue_len: 4,
            rx_queue_len: 0,
            tx_requests: PoolStats::default(),
            rx_requests: PoolStats::default(),
            last_error: None,
        }
    }

    #[test]
    fn test_render_fields() {
        let text = render(&[sample(0)]);
        assert!(text.starts_with("#PORT:0 channel:8 state:Active#\n"));
        assert!(text.contains("dpkts_to_usbhost: 10\n"));
        assert!(text.contains("dpkts_to_modem:  20\n"));
        assert!(text.contains("dpkts_pwith_bam: 3\n"));
        assert!(text.contains("to_usbhost_dcnt:  1\n"));
        assert!(text.contains("tomodem__dcnt:  2\n"));
        assert!(text.contains("tx_buf_len:\t 4\n"));
        assert!(text.contains("data_ch_opened: 1\n"));
    }

    #[test]
    fn test_render_is_bounded() {
        let many: Vec<_> = (0..64).map(sample).collect();
        assert_eq!(render(&many).len(), DEBUG_BUF_SIZE);
    }

    #[test]
    fn test_reset_keeps_pending_gauge() {
        let mut counters = PortCounters {
            to_host: 5,
            to_modem: 6,
            pending_with_modem: 7,
            tohost_drop: 8,
            tomodem_drop: 9,
        };
        counters.reset();
        assert_eq!(counters.to_host, 0);
        assert_eq!(counters.tomodem_drop, 0);
        assert_eq!(counters.pending_with_modem, 7);
    }
}
