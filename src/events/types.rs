//! Relay event types
//!
//! Defines all event types that can be broadcast through the event bus.

use serde::{Deserialize, Serialize};

/// Relay lifecycle event
///
/// JSON structure like:
/// ```json
/// {
///   "event": "port.channel_open_failed",
///   "data": { "port": 0, "channel_id": 8, "reason": "..." }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data")]
pub enum RelayEvent {
    /// USB endpoints enabled, connect work scheduled
    #[serde(rename = "port.connected")]
    PortConnected { port: usize },

    /// Modem channel opened by the connect work
    #[serde(rename = "port.channel_opened")]
    ChannelOpened { port: usize, channel_id: u32 },

    /// Connect work gave up opening the modem channel
    ///
    /// The port stays bound to its transport in the `Failed` state
    /// until the composition layer disconnects it.
    #[serde(rename = "port.channel_open_failed")]
    ChannelOpenFailed {
        port: usize,
        channel_id: u32,
        reason: String,
    },

    /// Request pools allocated, both directions are flowing
    #[serde(rename = "port.active")]
    PortActive { port: usize },

    /// Request pool allocation failed after the channel opened
    #[serde(rename = "port.failed")]
    PortFailed { port: usize, reason: String },

    /// Port torn down and back to idle
    #[serde(rename = "port.disconnected")]
    PortDisconnected { port: usize },

    /// Diagnostics counters were reset
    #[serde(rename = "stats.reset")]
    StatsReset,
}

impl RelayEvent {
    /// Get the event name (for filtering/routing)
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::PortConnected { .. } => "port.connected",
            Self::ChannelOpened { .. } => "port.channel_opened",
            Self::ChannelOpenFailed { .. } => "port.channel_open_failed",
            Self::PortActive { .. } => "port.active",
            Self::PortFailed { .. } => "port.failed",
            Self::PortDisconnected { .. } => "port.disconnected",
            Self::StatsReset => "stats.reset",
        }
    }

    /// Port the event refers to, if any
    pub fn port(&self) -> Option<usize> {
        match self {
            Self::PortConnected { port }
            | Self::ChannelOpened { port, .. }
            | Self::ChannelOpenFailed { port, .. }
            | Self::PortActive { port }
            | Self::PortFailed { port, .. }
            | Self::PortDisconnected { port } => Some(*port),
            Self::StatsReset => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let event = RelayEvent::ChannelOpenFailed {
            port: 0,
            channel_id: 8,
            reason: "busy".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], event.event_name());
        assert_eq!(json["data"]["channel_id"], 8);
        assert_eq!(event.port(), Some(0));
    }
}
