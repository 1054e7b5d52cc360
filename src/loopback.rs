//! In-memory link that hears its own transmissions.
//!
//! Transmitted frames go through the same addressing a module in fixed
//! transmission mode applies: the destination triple is consumed and the frame
//! is only delivered when it names this node (or the broadcast address) on the
//! current channel. Useful for tests and for running the demos without
//! hardware.

use std::collections::VecDeque;
use std::convert::TryFrom;

use log::debug;

use crate::frame::Frame;
use crate::loradev::{LinkError, RadioConfig, RadioLink, RxPacket, BROADCAST_ADDRESS};

#[derive(Debug, Default)]
pub struct LoopbackLink {
    config: Option<RadioConfig>,
    queue: VecDeque<RxPacket>,
    /// RSSI reported on every delivered packet when enabled
    rssi: i16,
    transmitted: usize,
}

impl LoopbackLink {
    pub fn new() -> Self {
        LoopbackLink {
            rssi: -30,
            ..Default::default()
        }
    }

    /// Queue a packet as if it arrived over the air.
    pub fn inject(&mut self, packet: RxPacket) {
        self.queue.push_back(packet);
    }

    pub fn config(&self) -> Option<&RadioConfig> {
        self.config.as_ref()
    }

    /// Number of frames handed to [`RadioLink::transmit`].
    pub fn transmitted(&self) -> usize {
        self.transmitted
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

impl RadioLink for LoopbackLink {
    fn configure(&mut self, config: &RadioConfig) -> Result<(), LinkError> {
        config.band()?;
        self.config = Some(config.clone());
        Ok(())
    }

    fn transmit(&mut self, data: &[u8]) -> Result<(), LinkError> {
        self.transmitted += 1;
        let frame = match Frame::try_from(data) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("loopback dropped frame: {}", e);
                return Ok(());
            }
        };
        let config = match &self.config {
            Some(config) => config,
            None => return Ok(()),
        };
        let own = config.endpoint()?;
        let addressed = frame.dest.address == own.address || frame.dest.address == BROADCAST_ADDRESS;
        if addressed && frame.dest.freq_offset == own.freq_offset {
            self.queue.push_back(RxPacket {
                source: Some(frame.source),
                rssi: if config.rssi { Some(self.rssi) } else { None },
                data: frame.payload,
            });
        } else {
            debug!("loopback: frame for {:?} not heard by {:?}", frame.dest, own);
        }
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<RxPacket>, LinkError> {
        Ok(self.queue.pop_front())
    }
}
