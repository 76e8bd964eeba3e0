use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};

/// BAM-DMUX header prepended by the modem bus to every packet
pub const BAM_MUX_HDR: usize = 8;

/// Default receive request size (one 2K buffer minus the mux header)
pub const DEFAULT_RX_REQUEST_SIZE: usize = 2048 - BAM_MUX_HDR;

/// Main relay configuration
///
/// Thresholds are read on every packet and may be changed at runtime
/// through [`ConfigStore`](super::ConfigStore). Queue depths and the
/// request size take effect at the next connect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// Host-bound queue length above which received modem packets are dropped
    pub tx_pkt_drop_threshold: usize,
    /// Hold receive requests while the modem has too many writes outstanding
    pub rx_flow_control: bool,
    /// Pending-with-modem count at which receive requests are held
    pub rx_flow_control_enable_threshold: usize,
    /// Pending-with-modem count under which held requests are resubmitted
    pub rx_flow_control_disable_threshold: usize,
    /// IN (host-bound) request pool depth
    pub tx_queue_size: usize,
    /// OUT (modem-bound) request pool depth
    pub rx_queue_size: usize,
    /// Buffer size of each OUT request
    pub rx_request_size: usize,
    /// Modem channel id for each port, indexed by port number
    pub channel_ids: Vec<u32>,
    /// Worker threads in the shared work executor
    pub workers: usize,
    /// Extra attempts to open the modem channel before giving up
    pub channel_open_retries: u32,
    /// Base backoff between channel open attempts (grows linearly)
    pub channel_open_backoff_ms: u64,
    /// Consecutive modem write failures that end a relay pass
    pub max_consecutive_write_failures: u32,
    /// Minimum seconds between repeated data path error logs
    pub log_throttle_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            tx_pkt_drop_threshold: 1000,
            rx_flow_control: true,
            rx_flow_control_enable_threshold: 1000,
            rx_flow_control_disable_threshold: 500,
            tx_queue_size: 200,
            rx_queue_size: 16,
            rx_request_size: DEFAULT_RX_REQUEST_SIZE,
            channel_ids: vec![8, 9, 10, 11],
            workers: 2,
            channel_open_retries: 2,
            channel_open_backoff_ms: 50,
            max_consecutive_write_failures: 3,
            log_throttle_secs: 5,
        }
    }
}

impl RelayConfig {
    /// Check the configuration for values the data path cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.tx_queue_size == 0 || self.rx_queue_size == 0 {
            return Err(RelayError::Config(
                "queue sizes must be non-zero".to_string(),
            ));
        }
        if self.rx_request_size == 0 {
            return Err(RelayError::Config(
                "rx_request_size must be non-zero".to_string(),
            ));
        }
        if self.workers == 0 {
            return Err(RelayError::Config("workers must be non-zero".to_string()));
        }
        if self.rx_flow_control_disable_threshold > self.rx_flow_control_enable_threshold {
            return Err(RelayError::Config(format!(
                "rx flow control disable threshold {} is above enable threshold {}",
                self.rx_flow_control_disable_threshold, self.rx_flow_control_enable_threshold
            )));
        }
        Ok(())
    }

    /// Modem channel id bound to a port
    pub fn channel_id(&self, port: usize) -> Option<u32> {
        self.channel_ids.get(port).copied()
    }

    /// Whether receive requests must be held back at this pending count
    #[inline]
    pub fn rx_should_hold(&self, pending_with_modem: usize) -> bool {
        self.rx_flow_control && pending_with_modem >= self.rx_flow_control_enable_threshold
    }

    /// Whether a write completion at this pending count should restart reception
    #[inline]
    pub fn rx_may_resume(&self, pending_with_modem: usize) -> bool {
        !self.rx_flow_control || pending_with_modem < self.rx_flow_control_disable_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_driver_parameters() {
        let config = RelayConfig::default();
        assert_eq!(config.tx_pkt_drop_threshold, 1000);
        assert_eq!(config.rx_queue_size, 16);
        assert_eq!(config.tx_queue_size, 200);
        assert_eq!(config.rx_request_size, 2040);
        assert_eq!(config.channel_id(0), Some(8));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = RelayConfig::default();
        config.rx_queue_size = 0;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.rx_flow_control_disable_threshold = 2000;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_flow_control_thresholds() {
        let config = RelayConfig {
            rx_flow_control_enable_threshold: 4,
            rx_flow_control_disable_threshold: 2,
            ..Default::default()
        };
        assert!(!config.rx_should_hold(3));
        assert!(config.rx_should_hold(4));
        assert!(!config.rx_may_resume(2));
        assert!(config.rx_may_resume(1));

        let disabled = RelayConfig {
            rx_flow_control: false,
            ..config
        };
        assert!(!disabled.rx_should_hold(100));
        assert!(disabled.rx_may_resume(100));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: RelayConfig = serde_json::from_str(r#"{"tx_queue_size": 32}"#).unwrap();
        assert_eq!(config.tx_queue_size, 32);
        assert_eq!(config.rx_queue_size, 16);
    }
}
