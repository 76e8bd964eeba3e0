use bytes::{Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

use crate::error::{RelayError, Result};
use crate::modem::{ChannelClient, ModemChannel};

struct Channel {
    client: Arc<dyn ChannelClient>,
    /// Writes the modem has not acknowledged yet
    in_flight: VecDeque<BytesMut>,
}

#[derive(Default)]
struct ModemState {
    channels: HashMap<u32, Channel>,
    opens: HashMap<u32, usize>,
    closes: HashMap<u32, usize>,
    opens_started: usize,
    hold_opens: bool,
    open_failures: usize,
    write_fail_every: Option<usize>,
    writes: usize,
    written: Vec<(u32, Bytes)>,
    loopback: bool,
}

/// Simulated BAM-DMUX bus
///
/// Writes are kept in flight until [`complete_writes`](Self::complete_writes)
/// acknowledges them, unless loopback is on, in which case every write is
/// acknowledged at once and echoed back as a received packet.
pub struct SimModem {
    state: Mutex<ModemState>,
    gate: Condvar,
}

impl SimModem {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ModemState::default()),
            gate: Condvar::new(),
        })
    }

    /// Fail the next `count` open attempts
    pub fn fail_opens(&self, count: usize) {
        self.state.lock().open_failures = count;
    }

    /// Fail every `n`th write (counting from one); `None` disables
    pub fn fail_every_nth_write(&self, n: Option<usize>) {
        let mut state = self.state.lock();
        state.write_fail_every = n.filter(|&n| n > 0);
        state.writes = 0;
    }

    /// Echo writes back as received packets
    pub fn set_loopback(&self, on: bool) {
        self.state.lock().loopback = on;
    }

    /// Block open calls until [`release_opens`](Self::release_opens)
    pub fn hold_opens(&self) {
        self.state.lock().hold_opens = true;
    }

    pub fn release_opens(&self) {
        self.state.lock().hold_opens = false;
        self.gate.notify_all();
    }

    /// Wait until `count` open calls have started
    pub fn wait_opens_started(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.opens_started < count {
            if self.gate.wait_until(&mut state, deadline).timed_out() {
                return state.opens_started >= count;
            }
        }
        true
    }

    pub fn opens(&self, channel_id: u32) -> usize {
        self.state.lock().opens.get(&channel_id).copied().unwrap_or(0)
    }

    pub fn closes(&self, channel_id: u32) -> usize {
        self.state.lock().closes.get(&channel_id).copied().unwrap_or(0)
    }

    pub fn is_open(&self, channel_id: u32) -> bool {
        self.state.lock().channels.contains_key(&channel_id)
    }

    /// Writes accepted and not yet acknowledged on a channel
    pub fn pending_writes(&self, channel_id: u32) -> usize {
        self.state
            .lock()
            .channels
            .get(&channel_id)
            .map_or(0, |ch| ch.in_flight.len())
    }

    /// Payloads accepted on a channel so far, in write order
    pub fn take_written(&self, channel_id: u32) -> Vec<Bytes> {
        let mut state = self.state.lock();
        let (mine, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut state.written)
            .into_iter()
            .partition(|(ch, _)| *ch == channel_id);
        state.written = rest;
        mine.into_iter().map(|(_, data)| data).collect()
    }

    /// Modem sends a packet on a channel; `false` if the channel is closed
    pub fn deliver(&self, channel_id: u32, data: &[u8]) -> bool {
        let client = match self.state.lock().channels.get(&channel_id) {
            Some(ch) => ch.client.clone(),
            None => return false,
        };
        client.on_receive(BytesMut::from(data));
        true
    }

    /// Acknowledge up to `count` outstanding writes, oldest first
    pub fn complete_writes(&self, channel_id: u32, count: usize) -> usize {
        let (client, done) = {
            let mut state = self.state.lock();
            let Some(ch) = state.channels.get_mut(&channel_id) else {
                return 0;
            };
            let n = count.min(ch.in_flight.len());
            let done: Vec<_> = ch.in_flight.drain(..n).collect();
            (ch.client.clone(), done)
        };
        let n = done.len();
        for packet in done {
            client.on_write_done(packet);
        }
        n
    }
}

impl ModemChannel for SimModem {
    fn open(&self, channel_id: u32, client: Arc<dyn ChannelClient>) -> Result<()> {
        let mut state = self.state.lock();
        state.opens_started += 1;
        self.gate.notify_all();
        while state.hold_opens {
            self.gate.wait(&mut state);
        }

        if state.open_failures > 0 {
            state.open_failures -= 1;
            return Err(RelayError::ChannelUnavailable(format!(
                "channel {} not ready",
                channel_id
            )));
        }
        if state.channels.contains_key(&channel_id) {
            return Err(RelayError::NotReady(format!(
                "channel {} already open",
                channel_id
            )));
        }

        state.channels.insert(
            channel_id,
            Channel {
                client,
                in_flight: VecDeque::new(),
            },
        );
        *state.opens.entry(channel_id).or_default() += 1;
        trace!("sim modem: channel {} opened", channel_id);
        Ok(())
    }

    fn close(&self, channel_id: u32) {
        let mut state = self.state.lock();
        if state.channels.remove(&channel_id).is_some() {
            *state.closes.entry(channel_id).or_default() += 1;
            trace!("sim modem: channel {} closed", channel_id);
        }
    }

    fn write(&self, channel_id: u32, packet: BytesMut) -> Result<()> {
        let mut state = self.state.lock();
        if !state.channels.contains_key(&channel_id) {
            return Err(RelayError::ChannelUnavailable(format!(
                "channel {} closed",
                channel_id
            )));
        }

        state.writes += 1;
        if let Some(n) = state.write_fail_every {
            if state.writes % n == 0 {
                return Err(RelayError::TransientIo(format!(
                    "channel {}: write {} refused",
                    channel_id, state.writes
                )));
            }
        }

        state
            .written
            .push((channel_id, Bytes::copy_from_slice(&packet)));

        if !state.loopback {
            if let Some(ch) = state.channels.get_mut(&channel_id) {
                ch.in_flight.push_back(packet);
            }
            return Ok(());
        }

        let Some(client) = state.channels.get(&channel_id).map(|ch| ch.client.clone()) else {
            return Ok(());
        };
        drop(state);
        client.on_receive(BytesMut::from(&packet[..]));
        client.on_write_done(packet);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter {
        received: AtomicUsize,
        done: AtomicUsize,
    }

    impl ChannelClient for Counter {
        fn on_receive(&self, _packet: BytesMut) {
            self.received.fetch_add(1, Ordering::SeqCst);
        }

        fn on_write_done(&self, _packet: BytesMut) {
            self.done.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_write_and_complete() {
        let modem = SimModem::new();
        let client = Arc::new(Counter::default());
        modem.open(8, client.clone()).unwrap();

        modem.write(8, BytesMut::from(&b"abc"[..])).unwrap();
        modem.write(8, BytesMut::from(&b"def"[..])).unwrap();
        assert_eq!(modem.pending_writes(8), 2);
        assert_eq!(modem.complete_writes(8, 5), 2);
        assert_eq!(client.done.load(Ordering::SeqCst), 2);
        assert_eq!(modem.take_written(8), vec![Bytes::from("abc"), Bytes::from("def")]);
    }

    #[test]
    fn test_write_on_closed_channel() {
        let modem = SimModem::new();
        let err = modem.write(9, BytesMut::from(&b"x"[..])).unwrap_err();
        assert!(matches!(err, RelayError::ChannelUnavailable(_)));
    }

    #[test]
    fn test_open_failures_and_double_open() {
        let modem = SimModem::new();
        modem.fail_opens(1);
        assert!(modem.open(8, Arc::new(Counter::default())).is_err());
        modem.open(8, Arc::new(Counter::default())).unwrap();
        assert!(modem.open(8, Arc::new(Counter::default())).is_err());
        assert_eq!(modem.opens(8), 1);

        modem.close(8);
        modem.close(8);
        assert_eq!(modem.closes(8), 1);
    }

    #[test]
    fn test_loopback_echoes() {
        let modem = SimModem::new();
        let client = Arc::new(Counter::default());
        modem.open(10, client.clone()).unwrap();
        modem.set_loopback(true);

        modem.write(10, BytesMut::from(&b"ping"[..])).unwrap();
        assert_eq!(client.received.load(Ordering::SeqCst), 1);
        assert_eq!(client.done.load(Ordering::SeqCst), 1);
        assert_eq!(modem.pending_writes(10), 0);
    }
}
