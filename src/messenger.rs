use std::cmp;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::fragment::{Fragmenter, Reassembler, FRAGMENT_HEADER_LEN};
use crate::frame::{Endpoint, Frame, ENDPOINT_LEN, HEADER_LEN};
use crate::loradev::{LinkError, RadioConfig, RadioLink, RxPacket};

/// Pause between two polls of the link.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Poll pause while collecting fragments.
pub const FRAGMENT_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Airtime of one full packet at 2400 bps plus margin.
pub const DEFAULT_FRAGMENT_INTERVAL: Duration = Duration::from_millis(400 + 50);
/// Reasonable wait for a message of up to ten fragments.
pub const DEFAULT_REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessengerOptions {
    pub poll_interval: Duration,
    pub fragment_poll_interval: Duration,
    /// Pause after each fragment so the module can finish transmitting
    pub fragment_interval: Duration,
}

impl Default for MessengerOptions {
    fn default() -> Self {
        MessengerOptions {
            poll_interval: DEFAULT_POLL_INTERVAL,
            fragment_poll_interval: FRAGMENT_POLL_INTERVAL,
            fragment_interval: DEFAULT_FRAGMENT_INTERVAL,
        }
    }
}

/// What happened on the link, handed to the observer set with
/// [`Messenger::with_observer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Configured { frequency: u32, address: u16 },
    Retuned { peer: Endpoint },
    Restored,
    Sent { dest: Endpoint, bytes: usize },
    SendFailed { dest: Endpoint },
    Received { source: Option<Endpoint>, bytes: usize },
    /// Bytes that were not valid UTF-8
    Malformed { bytes: usize },
    TimedOut,
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("frame of {len} bytes exceeds the {max} byte packet limit")]
    TooLong { len: usize, max: usize },
    #[error("retuning to peer failed: {0}")]
    Retune(#[source] LinkError),
    #[error("transmit failed: {0}")]
    Transmit(#[source] LinkError),
    /// Previous settings could not be put back, the link is left retuned.
    #[error("restoring configuration failed: {restore}")]
    Restore {
        failure: Option<Box<SendError>>,
        #[source]
        restore: LinkError,
    },
}

/// A decoded text message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub text: String,
    pub source: Option<Endpoint>,
    pub rssi: Option<i16>,
}

type Observer = Box<dyn FnMut(&Event) + Send>;

/// Sends and receives text over an exclusively owned [`RadioLink`].
pub struct Messenger<L> {
    link: L,
    config: RadioConfig,
    own: Endpoint,
    options: MessengerOptions,
    fragmenter: Fragmenter,
    observer: Option<Observer>,
}

/// Fragment payload that still fits one packet once both headers are added.
fn fragment_capacity(config: &RadioConfig) -> usize {
    (config.packet_size.bytes() + ENDPOINT_LEN).saturating_sub(HEADER_LEN + FRAGMENT_HEADER_LEN)
}

impl<L: RadioLink> Messenger<L> {
    /// Take ownership of `link` and apply `config` to it.
    pub fn new(mut link: L, config: RadioConfig) -> Result<Self, LinkError> {
        let own = config.endpoint()?;
        link.configure(&config)?;
        info!(
            "messenger up on {} at {} MHz, address {:#06x}",
            config.serial_path, config.frequency, config.address
        );
        Ok(Messenger {
            link,
            fragmenter: Fragmenter::new().with_max_payload(fragment_capacity(&config)),
            config,
            own,
            options: MessengerOptions::default(),
            observer: None,
        })
    }

    pub fn with_options(mut self, options: MessengerOptions) -> Self {
        self.options = options;
        self
    }

    /// Report every [`Event`] to `observer`.
    ///
    /// The observer first gets an [`Event::Configured`] for the settings in use.
    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: FnMut(&Event) + Send + 'static,
    {
        self.observer = Some(Box::new(observer));
        self.emit(Event::Configured {
            frequency: self.config.frequency,
            address: self.config.address,
        });
        self
    }

    pub fn config(&self) -> &RadioConfig {
        &self.config
    }

    /// This node's address and channel.
    pub fn endpoint(&self) -> Endpoint {
        self.own
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn into_link(self) -> L {
        self.link
    }

    /// Permanently switch to new settings.
    pub fn reconfigure(&mut self, config: RadioConfig) -> Result<(), LinkError> {
        let own = config.endpoint()?;
        self.link.configure(&config)?;
        self.fragmenter = Fragmenter::new().with_max_payload(fragment_capacity(&config));
        self.emit(Event::Configured {
            frequency: config.frequency,
            address: config.address,
        });
        self.config = config;
        self.own = own;
        Ok(())
    }

    fn emit(&mut self, event: Event) {
        if let Some(observer) = self.observer.as_mut() {
            observer(&event);
        }
    }

    fn frame(&self, peer: Endpoint, payload: &[u8]) -> Result<Vec<u8>, SendError> {
        let bytes = Frame::new(peer, self.own, payload).encode();
        // the module consumes the destination triple before the packet goes on air
        let max = self.config.packet_size.bytes() + ENDPOINT_LEN;
        if bytes.len() > max {
            return Err(SendError::TooLong {
                len: bytes.len(),
                max,
            });
        }
        Ok(bytes)
    }

    fn transmit_frame(&mut self, peer: Endpoint, frame: &[u8]) -> Result<(), SendError> {
        match self.link.transmit(frame) {
            Ok(()) => {
                debug!("sent {} bytes to {:?}", frame.len(), peer);
                self.emit(Event::Sent {
                    dest: peer,
                    bytes: frame.len(),
                });
                Ok(())
            }
            Err(e) => {
                warn!("sending to {:?} failed: {}", peer, e);
                self.emit(Event::SendFailed { dest: peer });
                Err(SendError::Transmit(e))
            }
        }
    }

    /// Run `f` with the link tuned to `peer`, then restore the own settings.
    ///
    /// Restoring is attempted whatever `f` returned.
    fn retuned<T, F>(&mut self, peer: Endpoint, f: F) -> Result<T, SendError>
    where
        F: FnOnce(&mut Self) -> Result<T, SendError>,
    {
        let tuned = self
            .config
            .retuned(peer)
            .map_err(|e| SendError::Retune(e.into()))?;

        let result = match self.link.configure(&tuned) {
            Ok(()) => {
                self.emit(Event::Retuned { peer });
                f(self)
            }
            Err(e) => Err(SendError::Retune(e)),
        };

        match self.link.configure(&self.config) {
            Ok(()) => {
                self.emit(Event::Restored);
                result
            }
            Err(restore) => {
                warn!("could not restore configuration: {}", restore);
                Err(SendError::Restore {
                    failure: result.err().map(Box::new),
                    restore,
                })
            }
        }
    }

    /// Send `message` to `peer` on the current channel.
    pub fn send(&mut self, peer: Endpoint, message: &str) -> Result<(), SendError> {
        let frame = self.frame(peer, message.as_bytes())?;
        self.transmit_frame(peer, &frame)
    }

    /// Like [`Messenger::send`], with the link tuned to the peer's channel and
    /// address for the duration of the call.
    pub fn send_retuned(&mut self, peer: Endpoint, message: &str) -> Result<(), SendError> {
        let frame = self.frame(peer, message.as_bytes())?;
        self.retuned(peer, |m| m.transmit_frame(peer, &frame))
    }

    /// Send a message of any length as a series of paced fragments.
    pub fn send_long(&mut self, peer: Endpoint, message: &str) -> Result<(), SendError> {
        let fragments = self.fragmenter.split(message.as_bytes()).map_err(|e| {
            SendError::TooLong {
                len: message.len(),
                max: e.max_len,
            }
        })?;
        let count = fragments.len();
        for (i, fragment) in fragments.iter().enumerate() {
            let frame = self.frame(peer, fragment)?;
            self.transmit_frame(peer, &frame)?;
            if i + 1 < count {
                thread::sleep(self.options.fragment_interval);
            }
        }
        debug!("sent {} byte message in {} fragments", message.len(), count);
        Ok(())
    }

    fn decode(&mut self, packet: RxPacket) -> Option<Message> {
        let bytes = packet.data.len();
        match String::from_utf8(packet.data) {
            Ok(text) => {
                debug!("received {:?} from {:?}", text, packet.source);
                self.emit(Event::Received {
                    source: packet.source,
                    bytes,
                });
                Some(Message {
                    text,
                    source: packet.source,
                    rssi: packet.rssi,
                })
            }
            Err(_) => {
                warn!("received {} bytes of non UTF-8 data", bytes);
                self.emit(Event::Malformed { bytes });
                None
            }
        }
    }

    /// Poll the link until `accept` produces a value or `timeout` runs out.
    fn poll<T, F>(
        &mut self,
        timeout: Duration,
        interval: Duration,
        mut accept: F,
    ) -> Result<Option<T>, LinkError>
    where
        F: FnMut(&mut Self, RxPacket) -> Option<Option<T>>,
    {
        let start = Instant::now();
        loop {
            if let Some(packet) = self.link.receive()? {
                // a reported sender means a frame arrived, even with empty text
                if !packet.data.is_empty() || packet.source.is_some() {
                    if let Some(done) = accept(self, packet) {
                        return Ok(done);
                    }
                }
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                self.emit(Event::TimedOut);
                return Ok(None);
            }
            thread::sleep(cmp::min(interval, timeout - elapsed));
        }
    }

    /// Wait up to `timeout` for a message and return it with its metadata.
    ///
    /// Gives up on the first packet that is not valid UTF-8.
    pub fn receive_message(&mut self, timeout: Duration) -> Result<Option<Message>, LinkError> {
        let interval = self.options.poll_interval;
        self.poll(timeout, interval, |m, packet| Some(m.decode(packet)))
    }

    /// Wait up to `timeout` for a text message.
    pub fn receive(&mut self, timeout: Duration) -> Result<Option<String>, LinkError> {
        Ok(self.receive_message(timeout)?.map(|m| m.text))
    }

    /// Wait up to `timeout` for a fragmented message sent with
    /// [`Messenger::send_long`]. Partial messages are dropped on timeout.
    pub fn receive_long(&mut self, timeout: Duration) -> Result<Option<Message>, LinkError> {
        let interval = self.options.fragment_poll_interval;
        let mut reassembler = Reassembler::new();
        let result = self.poll(timeout, interval, |m, packet| {
            let data = reassembler.accept(&packet.data)?;
            Some(m.decode(RxPacket { data, ..packet }))
        });
        if reassembler.pending() > 0 {
            debug!("dropping {} incomplete messages", reassembler.pending());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackLink;
    use crate::loradev::PacketSize;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct ScriptedLink {
        inbox: VecDeque<Vec<u8>>,
        polls: usize,
        sent: Vec<Vec<u8>>,
        configs: Vec<RadioConfig>,
        fail_transmit: bool,
        fail_configure_at: Option<usize>,
    }

    impl RadioLink for ScriptedLink {
        fn configure(&mut self, config: &RadioConfig) -> Result<(), LinkError> {
            if self.fail_configure_at == Some(self.configs.len()) {
                self.fail_configure_at = None;
                return Err(LinkError::NoResponse);
            }
            self.configs.push(config.clone());
            Ok(())
        }

        fn transmit(&mut self, data: &[u8]) -> Result<(), LinkError> {
            if self.fail_transmit {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "uart gone").into());
            }
            self.sent.push(data.to_vec());
            Ok(())
        }

        fn receive(&mut self) -> Result<Option<RxPacket>, LinkError> {
            self.polls += 1;
            Ok(self.inbox.pop_front().map(RxPacket::new))
        }
    }

    fn messenger(link: ScriptedLink) -> Messenger<ScriptedLink> {
        Messenger::new(link, RadioConfig::default()).unwrap()
    }

    const PEER: Endpoint = Endpoint {
        address: 0x0042,
        freq_offset: 5,
    };

    #[test]
    fn receive_returns_first_message_without_waiting() {
        let mut link = ScriptedLink::default();
        link.inbox.push_back(b"hello".to_vec());
        let mut m = messenger(link);

        let start = Instant::now();
        assert_eq!(m.receive(Duration::from_secs(5)).unwrap(), Some("hello".to_string()));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(m.link().polls, 1);
    }

    #[test]
    fn receive_gives_up_on_invalid_utf8() {
        let mut link = ScriptedLink::default();
        link.inbox.push_back(vec![0xFF, 0xFE, 0xFD]);
        link.inbox.push_back(b"later".to_vec());
        let mut m = messenger(link);

        let start = Instant::now();
        assert_eq!(m.receive(Duration::from_secs(5)).unwrap(), None);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(m.link().polls, 1);
        assert_eq!(m.link().inbox.len(), 1);
    }

    #[test]
    fn receive_times_out_on_silent_link() {
        let mut m = messenger(ScriptedLink::default());
        let timeout = Duration::from_millis(200);

        let start = Instant::now();
        assert_eq!(m.receive(timeout).unwrap(), None);
        let elapsed = start.elapsed();
        assert!(elapsed >= timeout);
        // one poll interval plus scheduling slack
        assert!(elapsed < timeout + DEFAULT_POLL_INTERVAL + Duration::from_millis(150));
        assert!(m.link().polls >= 2);
    }

    #[test]
    fn receive_skips_empty_reads() {
        let mut link = ScriptedLink::default();
        link.inbox.push_back(Vec::new());
        link.inbox.push_back(b"x".to_vec());
        let mut m = messenger(link);
        assert_eq!(m.receive(Duration::from_secs(1)).unwrap(), Some("x".to_string()));
        assert_eq!(m.link().polls, 2);
    }

    #[test]
    fn send_prepends_addressed_header() {
        let mut m = messenger(ScriptedLink::default());
        m.send(PEER, "hi").unwrap();
        assert_eq!(
            m.link().sent,
            vec![vec![0x00, 0x42, 5, 0x12, 0x34, 18, b'h', b'i']]
        );
        // no retuning on a plain send
        assert_eq!(m.link().configs.len(), 1);
    }

    #[test]
    fn send_reports_transmit_failure() {
        let link = ScriptedLink {
            fail_transmit: true,
            ..Default::default()
        };
        let mut m = messenger(link);
        match m.send(PEER, "hi") {
            Err(SendError::Transmit(LinkError::Io(e))) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn retuned_send_restores_configuration() {
        let mut m = messenger(ScriptedLink::default());
        m.send_retuned(PEER, "hi").unwrap();

        let configs = &m.link().configs;
        assert_eq!(configs.len(), 3);
        assert_eq!(configs[1].frequency, 855);
        assert_eq!(configs[1].address, 0x0042);
        assert_eq!(configs[2], RadioConfig::default());
        assert_eq!(m.link().sent.len(), 1);
    }

    #[test]
    fn retuned_send_restores_after_failed_transmit() {
        let link = ScriptedLink {
            fail_transmit: true,
            ..Default::default()
        };
        let mut m = messenger(link);
        assert!(matches!(m.send_retuned(PEER, "hi"), Err(SendError::Transmit(_))));
        assert_eq!(m.link().configs.last(), Some(&RadioConfig::default()));
    }

    #[test]
    fn failed_retune_still_restores() {
        let link = ScriptedLink {
            fail_configure_at: Some(1),
            ..Default::default()
        };
        let mut m = messenger(link);
        assert!(matches!(m.send_retuned(PEER, "hi"), Err(SendError::Retune(_))));
        assert!(m.link().sent.is_empty());
        assert_eq!(m.link().configs.last(), Some(&RadioConfig::default()));
    }

    #[test]
    fn failed_restore_is_reported() {
        let link = ScriptedLink {
            fail_transmit: true,
            fail_configure_at: Some(2),
            ..Default::default()
        };
        let mut m = messenger(link);
        match m.send_retuned(PEER, "hi") {
            Err(SendError::Restore { failure, .. }) => {
                assert!(matches!(failure.as_deref(), Some(SendError::Transmit(_))))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn oversized_message_is_rejected() {
        let config = RadioConfig::default().with_packet_size(PacketSize::Bytes32);
        let mut m = Messenger::new(ScriptedLink::default(), config).unwrap();
        let text = "x".repeat(40);
        assert!(matches!(
            m.send(PEER, &text),
            Err(SendError::TooLong { len: 46, max: 35 })
        ));
        assert!(m.link().sent.is_empty());
    }

    #[test]
    fn observer_sees_events() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let seen = events.clone();
        let mut link = ScriptedLink::default();
        link.inbox.push_back(vec![0xC3, 0x28]);
        let mut m = messenger(link).with_observer(move |e| seen.lock().unwrap().push(e.clone()));

        m.send_retuned(PEER, "hi").unwrap();
        m.receive(Duration::from_millis(10)).unwrap();

        assert_eq!(
            *events.lock().unwrap(),
            vec![
                Event::Configured {
                    frequency: 868,
                    address: 0x1234
                },
                Event::Retuned { peer: PEER },
                Event::Sent { dest: PEER, bytes: 8 },
                Event::Restored,
                Event::Malformed { bytes: 2 },
            ]
        );
    }

    #[test]
    fn loopback_round_trip() {
        let mut m = Messenger::new(LoopbackLink::new(), RadioConfig::default().with_rssi(true)).unwrap();
        let me = m.endpoint();
        m.send(me, "grüße über funk").unwrap();

        let msg = m.receive_message(Duration::from_millis(100)).unwrap().unwrap();
        assert_eq!(msg.text, "grüße über funk");
        assert_eq!(msg.source, Some(me));
        assert_eq!(msg.rssi, Some(-30));
    }

    #[test]
    fn empty_message_round_trip() {
        let mut m = Messenger::new(LoopbackLink::new(), RadioConfig::default()).unwrap();
        let me = m.endpoint();
        m.send(me, "").unwrap();

        let start = Instant::now();
        let msg = m.receive_message(Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!(msg.text, "");
        assert_eq!(msg.source, Some(me));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn too_many_fragments_is_an_error() {
        let config = RadioConfig::default().with_packet_size(PacketSize::Bytes32);
        let mut m = Messenger::new(LoopbackLink::new(), config).unwrap();
        let me = m.endpoint();
        // 22 payload bytes per fragment at this packet size
        let text = "x".repeat(22 * usize::from(u16::MAX) + 1);

        match m.send_long(me, &text) {
            Err(SendError::TooLong { len, max }) => {
                assert_eq!(len, text.len());
                assert_eq!(max, 22 * usize::from(u16::MAX));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(m.link().transmitted(), 0);
    }

    #[test]
    fn long_messages_are_fragmented() {
        let options = MessengerOptions {
            fragment_interval: Duration::from_millis(0),
            ..Default::default()
        };
        let mut m = Messenger::new(LoopbackLink::new(), RadioConfig::default())
            .unwrap()
            .with_options(options);
        let me = m.endpoint();
        let text: String = "the quick brown fox jumps over the lazy dog. ".repeat(12);

        m.send_long(me, &text).unwrap();
        assert_eq!(m.link().transmitted(), 3);
        let msg = m.receive_long(DEFAULT_REASSEMBLY_TIMEOUT).unwrap().unwrap();
        assert_eq!(msg.text, text);
        assert_eq!(msg.source, Some(me));
    }

    #[test]
    fn incomplete_fragments_time_out() {
        let mut m = Messenger::new(LoopbackLink::new(), RadioConfig::default()).unwrap();
        let mut fragmenter = Fragmenter::new();
        let parts = fragmenter.split(&[b'a'; 450]).unwrap();
        m.link_mut().inject(RxPacket::new(parts[0].clone()));

        assert_eq!(m.receive_long(Duration::from_millis(50)).unwrap(), None);
    }

    #[test]
    fn reconfigure_moves_endpoint() {
        let mut m = messenger(ScriptedLink::default());
        m.reconfigure(RadioConfig::new("/dev/ttyS0", 433, 7)).unwrap();
        assert_eq!(m.endpoint(), Endpoint::new(7, 23));
        assert!(m.reconfigure(RadioConfig::new("/dev/ttyS0", 5, 7)).is_err());
        assert_eq!(m.config().frequency, 433);
    }
}
