//! Splitting of messages that do not fit a single radio packet.
//!
//! Every fragment carries a 7 byte little endian header:
//!
//! ```text
//! | kind | message id | packet id | total packets |
//! |  u8  |    u16     |    u16    |      u16      |
//! ```
//!
//! `total` is only set on the start fragment and is 0 everywhere else.

use std::collections::BTreeMap;
use std::convert::TryFrom;

/// Payload bytes per fragment.
pub const MAX_FRAGMENT_PAYLOAD: usize = 200;
pub const FRAGMENT_HEADER_LEN: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentKind {
    Start = 0x01,
    Middle = 0x02,
    End = 0x03,
}

impl TryFrom<u8> for FragmentKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FragmentKind::Start),
            0x02 => Ok(FragmentKind::Middle),
            0x03 => Ok(FragmentKind::End),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub kind: FragmentKind,
    pub message_id: u16,
    pub packet_id: u16,
    pub total: u16,
}

impl FragmentHeader {
    pub fn to_bytes(self) -> [u8; FRAGMENT_HEADER_LEN] {
        let mut buf = [0u8; FRAGMENT_HEADER_LEN];
        buf[0] = self.kind as u8;
        buf[1..3].copy_from_slice(&self.message_id.to_le_bytes());
        buf[3..5].copy_from_slice(&self.packet_id.to_le_bytes());
        buf[5..7].copy_from_slice(&self.total.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < FRAGMENT_HEADER_LEN {
            return None;
        }
        Some(FragmentHeader {
            kind: FragmentKind::try_from(buf[0]).ok()?,
            message_id: u16::from_le_bytes([buf[1], buf[2]]),
            packet_id: u16::from_le_bytes([buf[3], buf[4]]),
            total: u16::from_le_bytes([buf[5], buf[6]]),
        })
    }
}

/// A message too long to number its fragments in 16 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{len} byte message exceeds the {max_len} bytes that fit in 16 bit numbered fragments")]
pub struct TooManyFragments {
    pub len: usize,
    pub max_len: usize,
}

/// Cuts messages into fragments, numbering messages sequentially.
#[derive(Debug)]
pub struct Fragmenter {
    next_message_id: u16,
    max_payload: usize,
}

impl Default for Fragmenter {
    fn default() -> Self {
        Fragmenter {
            next_message_id: 0,
            max_payload: MAX_FRAGMENT_PAYLOAD,
        }
    }
}

impl Fragmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit fragment payloads further, e.g. for small module packet sizes.
    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload.max(1).min(MAX_FRAGMENT_PAYLOAD);
        self
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Split `data` into header-prefixed fragments.
    ///
    /// An empty message still yields one start fragment so it can be delivered.
    pub fn split(&mut self, data: &[u8]) -> Result<Vec<Vec<u8>>, TooManyFragments> {
        let max_len = self.max_payload * usize::from(u16::MAX);
        if data.len() > max_len {
            return Err(TooManyFragments {
                len: data.len(),
                max_len,
            });
        }
        let message_id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);

        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![data]
        } else {
            data.chunks(self.max_payload).collect()
        };
        let total = chunks.len() as u16;

        let fragments = chunks
            .into_iter()
            .enumerate()
            .map(|(pid, chunk)| {
                let packet_id = pid as u16;
                let kind = if packet_id == 0 {
                    FragmentKind::Start
                } else if packet_id + 1 == total {
                    FragmentKind::End
                } else {
                    FragmentKind::Middle
                };
                let header = FragmentHeader {
                    kind,
                    message_id,
                    packet_id,
                    total: if packet_id == 0 { total } else { 0 },
                };
                let mut pkt = Vec::with_capacity(FRAGMENT_HEADER_LEN + chunk.len());
                pkt.extend_from_slice(&header.to_bytes());
                pkt.extend_from_slice(chunk);
                pkt
            })
            .collect();
        Ok(fragments)
    }
}

#[derive(Debug, Default)]
struct Assembly {
    total: u16,
    parts: BTreeMap<u16, Vec<u8>>,
}

/// Collects fragments until a message is complete.
#[derive(Debug, Default)]
pub struct Reassembler {
    buffers: BTreeMap<u16, Assembly>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one received fragment, returns the message once all parts are in.
    ///
    /// Buffers shorter than a header or with an unknown kind are ignored.
    pub fn accept(&mut self, raw: &[u8]) -> Option<Vec<u8>> {
        let header = FragmentHeader::from_bytes(raw)?;
        let payload = &raw[FRAGMENT_HEADER_LEN..];

        let assembly = self.buffers.entry(header.message_id).or_default();
        if header.kind == FragmentKind::Start {
            assembly.total = header.total;
        }
        assembly.parts.insert(header.packet_id, payload.to_vec());

        if assembly.total == 0 || assembly.parts.len() < usize::from(assembly.total) {
            return None;
        }
        // parts may hold stray ids beyond total from an earlier message with the same id
        if !(0..assembly.total).all(|pid| assembly.parts.contains_key(&pid)) {
            return None;
        }
        let total = assembly.total;
        let assembly = self.buffers.remove(&header.message_id)?;
        let message = assembly
            .parts
            .into_iter()
            .take_while(|(pid, _)| *pid < total)
            .flat_map(|(_, chunk)| chunk)
            .collect();
        Some(message)
    }

    /// Drop all partially received messages.
    pub fn clear(&mut self) {
        self.buffers.clear();
    }

    /// Number of messages with missing parts.
    pub fn pending(&self) -> usize {
        self.buffers.len()
    }
}
