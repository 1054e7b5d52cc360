//! Addressed radio frame.
//!
//! A frame is a 6 byte header followed by the raw payload:
//!
//! ```text
//! | dest addr (BE) | dest freq | src addr (BE) | src freq | payload ... |
//! |    2 bytes     |  1 byte   |    2 bytes    |  1 byte  |             |
//! ```
//!
//! In fixed transmission mode the module consumes the destination triple and
//! puts the rest on air, so a receiver sees `src addr | src freq | payload`.
//! There is no length prefix and no checksum, one frame is one transport read.

use core::convert::TryFrom;

/// Destination plus source header length.
pub const HEADER_LEN: usize = 6;
/// Length of one address/frequency triple.
pub const ENDPOINT_LEN: usize = 3;

/// Address and channel of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub address: u16,
    /// offset in MHz from the band base (410 or 850 MHz)
    pub freq_offset: u8,
}

impl Endpoint {
    pub fn new(address: u16, freq_offset: u8) -> Self {
        Endpoint {
            address,
            freq_offset,
        }
    }

    pub fn to_bytes(self) -> [u8; ENDPOINT_LEN] {
        let [hi, lo] = self.address.to_be_bytes();
        [hi, lo, self.freq_offset]
    }

    /// Decode a triple from the start of `buf`.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        match buf {
            [hi, lo, freq, ..] => Some(Endpoint::new(u16::from_be_bytes([*hi, *lo]), *freq)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {0} bytes is shorter than the {} byte header", HEADER_LEN)]
    Truncated(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub dest: Endpoint,
    pub source: Endpoint,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(dest: Endpoint, source: Endpoint, payload: &[u8]) -> Self {
        Frame {
            dest,
            source,
            payload: payload.to_vec(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&self.dest.to_bytes());
        buf.extend_from_slice(&self.source.to_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }
}

impl TryFrom<&[u8]> for Frame {
    type Error = FrameError;

    fn try_from(buf: &[u8]) -> Result<Self, Self::Error> {
        if buf.len() < HEADER_LEN {
            return Err(FrameError::Truncated(buf.len()));
        }
        Ok(Frame {
            dest: Endpoint::new(u16::from_be_bytes([buf[0], buf[1]]), buf[2]),
            source: Endpoint::new(u16::from_be_bytes([buf[3], buf[4]]), buf[5]),
            payload: buf[HEADER_LEN..].to_vec(),
        })
    }
}
