//! Modem multiplexing bus interface
//!
//! The BAM-DMUX driver is external. Each relay port talks to one logical
//! channel: it opens the channel with a [`ChannelClient`] that receives
//! inbound packets and write completions, writes outbound packets, and
//! closes the channel on disconnect.

use bytes::BytesMut;
use std::sync::Arc;

use crate::error::Result;

/// Receiver of channel callbacks
///
/// Both callbacks may run on any thread, concurrently with each other and
/// with USB completions. Implementations must not block.
pub trait ChannelClient: Send + Sync {
    /// A packet arrived from the modem
    fn on_receive(&self, packet: BytesMut);

    /// A packet previously passed to [`ModemChannel::write`] was consumed
    fn on_write_done(&self, packet: BytesMut);
}

/// Multiplexed modem bus
pub trait ModemChannel: Send + Sync {
    /// Open a logical channel and register its client
    fn open(&self, channel_id: u32, client: Arc<dyn ChannelClient>) -> Result<()>;

    /// Close a logical channel; no callbacks are delivered afterwards
    fn close(&self, channel_id: u32);

    /// Queue a packet for the modem
    ///
    /// The packet is consumed either way. On success it comes back through
    /// [`ChannelClient::on_write_done`]; on failure it has been dropped.
    fn write(&self, channel_id: u32, packet: BytesMut) -> Result<()>;
}
