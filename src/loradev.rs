use std::convert::TryFrom;
use std::io;

use crate::frame::Endpoint;

/// Broadcast address, every module listening on the channel accepts it.
pub const BROADCAST_ADDRESS: u16 = 0xFFFF;

/// Lower edge of the 410-493 MHz band (SX1268).
pub const BAND_410: u32 = 410;
/// Lower edge of the 850-930 MHz band (SX1262).
pub const BAND_850: u32 = 850;

/// Errors for settings the module cannot express.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("frequency {0} MHz is outside the 410 and 850 MHz bands")]
    Frequency(u32),
    #[error("unsupported transmit power {0} dBm (22, 17, 13 or 10)")]
    Power(i32),
    #[error("unsupported air speed {0} bps")]
    AirSpeed(u32),
    #[error("unsupported packet size {0} bytes (240, 128, 64 or 32)")]
    PacketSize(usize),
}

/// Errors reported by a [`RadioLink`].
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("serial port: {0}")]
    Serial(#[from] serialport::Error),
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("module did not answer the configuration request")]
    NoResponse,
    #[error("module rejected the request, answered {0:?}")]
    Rejected(Vec<u8>),
}

/// LoRa air data rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AirSpeed {
    Bps1200 = 0x01,
    Bps2400 = 0x02,
    Bps4800 = 0x03,
    Bps9600 = 0x04,
    Bps19200 = 0x05,
    Bps38400 = 0x06,
    Bps62500 = 0x07,
}

impl AirSpeed {
    pub fn bps(self) -> u32 {
        match self {
            AirSpeed::Bps1200 => 1200,
            AirSpeed::Bps2400 => 2400,
            AirSpeed::Bps4800 => 4800,
            AirSpeed::Bps9600 => 9600,
            AirSpeed::Bps19200 => 19200,
            AirSpeed::Bps38400 => 38400,
            AirSpeed::Bps62500 => 62500,
        }
    }

    /// Reverse lookup from the register code.
    pub fn from_code(code: u8) -> Option<Self> {
        [
            AirSpeed::Bps1200,
            AirSpeed::Bps2400,
            AirSpeed::Bps4800,
            AirSpeed::Bps9600,
            AirSpeed::Bps19200,
            AirSpeed::Bps38400,
            AirSpeed::Bps62500,
        ]
        .iter()
        .copied()
        .find(|s| *s as u8 == code)
    }
}

impl TryFrom<u32> for AirSpeed {
    type Error = ConfigError;

    fn try_from(bps: u32) -> Result<Self, Self::Error> {
        match bps {
            1200 => Ok(AirSpeed::Bps1200),
            2400 => Ok(AirSpeed::Bps2400),
            4800 => Ok(AirSpeed::Bps4800),
            9600 => Ok(AirSpeed::Bps9600),
            19200 => Ok(AirSpeed::Bps19200),
            38400 => Ok(AirSpeed::Bps38400),
            62500 => Ok(AirSpeed::Bps62500),
            other => Err(ConfigError::AirSpeed(other)),
        }
    }
}

/// Transmit power levels supported by the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxPower {
    Dbm22 = 0x00,
    Dbm17 = 0x01,
    Dbm13 = 0x02,
    Dbm10 = 0x03,
}

impl TxPower {
    pub fn dbm(self) -> i32 {
        match self {
            TxPower::Dbm22 => 22,
            TxPower::Dbm17 => 17,
            TxPower::Dbm13 => 13,
            TxPower::Dbm10 => 10,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code & 0x03 {
            0x00 => TxPower::Dbm22,
            0x01 => TxPower::Dbm17,
            0x02 => TxPower::Dbm13,
            _ => TxPower::Dbm10,
        }
    }
}

impl TryFrom<i32> for TxPower {
    type Error = ConfigError;

    fn try_from(dbm: i32) -> Result<Self, Self::Error> {
        match dbm {
            22 => Ok(TxPower::Dbm22),
            17 => Ok(TxPower::Dbm17),
            13 => Ok(TxPower::Dbm13),
            10 => Ok(TxPower::Dbm10),
            other => Err(ConfigError::Power(other)),
        }
    }
}

/// Maximum packet the module transmits in one go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketSize {
    Bytes240 = 0x00,
    Bytes128 = 0x40,
    Bytes64 = 0x80,
    Bytes32 = 0xC0,
}

impl PacketSize {
    pub fn bytes(self) -> usize {
        match self {
            PacketSize::Bytes240 => 240,
            PacketSize::Bytes128 => 128,
            PacketSize::Bytes64 => 64,
            PacketSize::Bytes32 => 32,
        }
    }
}

impl TryFrom<usize> for PacketSize {
    type Error = ConfigError;

    fn try_from(bytes: usize) -> Result<Self, Self::Error> {
        match bytes {
            240 => Ok(PacketSize::Bytes240),
            128 => Ok(PacketSize::Bytes128),
            64 => Ok(PacketSize::Bytes64),
            32 => Ok(PacketSize::Bytes32),
            other => Err(ConfigError::PacketSize(other)),
        }
    }
}

/// Radio settings applied through [`RadioLink::configure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadioConfig {
    /// serial device the module is attached to
    pub serial_path: String,
    /// carrier frequency in MHz
    pub frequency: u32,
    /// this node's address
    pub address: u16,
    pub power: TxPower,
    /// append packet RSSI to every received packet
    pub rssi: bool,
    pub air_speed: AirSpeed,
    pub net_id: u8,
    pub packet_size: PacketSize,
    /// 16 bit key, 0 disables encryption
    pub crypt: u16,
    pub relay: bool,
    /// listen before talk
    pub lbt: bool,
    /// wake on radio
    pub wor: bool,
}

impl Default for RadioConfig {
    fn default() -> Self {
        RadioConfig {
            serial_path: "/dev/ttyS0".to_string(),
            frequency: 868,
            address: 0x1234,
            power: TxPower::Dbm22,
            rssi: false,
            air_speed: AirSpeed::Bps2400,
            net_id: 0,
            packet_size: PacketSize::Bytes240,
            crypt: 0,
            relay: false,
            lbt: false,
            wor: false,
        }
    }
}

impl RadioConfig {
    pub fn new(serial_path: &str, frequency: u32, address: u16) -> Self {
        RadioConfig {
            serial_path: serial_path.to_string(),
            frequency,
            address,
            ..Default::default()
        }
    }

    pub fn with_power(mut self, power: TxPower) -> Self {
        self.power = power;
        self
    }

    pub fn with_rssi(mut self, rssi: bool) -> Self {
        self.rssi = rssi;
        self
    }

    pub fn with_air_speed(mut self, air_speed: AirSpeed) -> Self {
        self.air_speed = air_speed;
        self
    }

    pub fn with_packet_size(mut self, packet_size: PacketSize) -> Self {
        self.packet_size = packet_size;
        self
    }

    pub fn with_net_id(mut self, net_id: u8) -> Self {
        self.net_id = net_id;
        self
    }

    pub fn with_crypt(mut self, crypt: u16) -> Self {
        self.crypt = crypt;
        self
    }

    pub fn with_relay(mut self, relay: bool) -> Self {
        self.relay = relay;
        self
    }

    /// Split the carrier frequency into band base and byte offset.
    pub fn band(&self) -> Result<(u32, u8), ConfigError> {
        let base = if self.frequency >= BAND_850 {
            BAND_850
        } else if self.frequency >= BAND_410 {
            BAND_410
        } else {
            return Err(ConfigError::Frequency(self.frequency));
        };
        let offset =
            u8::try_from(self.frequency - base).map_err(|_| ConfigError::Frequency(self.frequency))?;
        Ok((base, offset))
    }

    /// This node as seen by peers.
    pub fn endpoint(&self) -> Result<Endpoint, ConfigError> {
        let (_, offset) = self.band()?;
        Ok(Endpoint::new(self.address, offset))
    }

    /// Same settings, tuned to the channel and address of `peer`.
    pub fn retuned(&self, peer: Endpoint) -> Result<Self, ConfigError> {
        let (base, _) = self.band()?;
        Ok(RadioConfig {
            frequency: base + u32::from(peer.freq_offset),
            address: peer.address,
            ..self.clone()
        })
    }
}

/// A packet handed up by a [`RadioLink`], transport framing removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxPacket {
    /// Sender, when the transport reports it
    pub source: Option<Endpoint>,
    /// Packet RSSI in dBm, when enabled
    pub rssi: Option<i16>,
    /// Received payload
    pub data: Vec<u8>,
}

impl RxPacket {
    pub fn new(data: Vec<u8>) -> Self {
        RxPacket {
            source: None,
            rssi: None,
            data,
        }
    }
}

pub trait RadioLink {
    /// Apply the given settings to the module.
    fn configure(&mut self, config: &RadioConfig) -> Result<(), LinkError>;
    /// Transmit one raw buffer.
    fn transmit(&mut self, data: &[u8]) -> Result<(), LinkError>;
    /// Non-blocking or short-blocking read of one packet.
    fn receive(&mut self) -> Result<Option<RxPacket>, LinkError>;
}

impl<L: RadioLink + ?Sized> RadioLink for Box<L> {
    fn configure(&mut self, config: &RadioConfig) -> Result<(), LinkError> {
        (**self).configure(config)
    }
    fn transmit(&mut self, data: &[u8]) -> Result<(), LinkError> {
        (**self).transmit(data)
    }
    fn receive(&mut self) -> Result<Option<RxPacket>, LinkError> {
        (**self).receive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn band_split() {
        let cfg = RadioConfig::default();
        assert_eq!(cfg.band(), Ok((850, 18)));
        assert_eq!(RadioConfig::new("x", 433, 1).band(), Ok((410, 23)));
        assert_eq!(RadioConfig::new("x", 850, 1).band(), Ok((850, 0)));
        assert_eq!(
            RadioConfig::new("x", 400, 1).band(),
            Err(ConfigError::Frequency(400))
        );
        assert_eq!(
            RadioConfig::new("x", 1200, 1).band(),
            Err(ConfigError::Frequency(1200))
        );
    }

    #[test]
    fn retune_keeps_band_and_other_settings() {
        let cfg = RadioConfig::default().with_rssi(true);
        let tuned = cfg.retuned(Endpoint::new(0x0042, 30)).unwrap();
        assert_eq!(tuned.frequency, 880);
        assert_eq!(tuned.address, 0x0042);
        assert!(tuned.rssi);
        assert_eq!(tuned.serial_path, cfg.serial_path);
    }

    #[test]
    fn lookup_tables() {
        assert_eq!(TxPower::try_from(17), Ok(TxPower::Dbm17));
        assert_eq!(TxPower::try_from(20), Err(ConfigError::Power(20)));
        assert_eq!(AirSpeed::try_from(62500), Ok(AirSpeed::Bps62500));
        assert_eq!(AirSpeed::from_code(0x02), Some(AirSpeed::Bps2400));
        assert_eq!(AirSpeed::from_code(0x00), None);
        assert_eq!(PacketSize::try_from(64).map(PacketSize::bytes), Ok(64));
        assert_eq!(TxPower::from_code(0x23), TxPower::Dbm10);
    }
}
