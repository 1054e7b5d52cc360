//! Serial link to a Waveshare style SX126x LoRa HAT (SX1262 / SX1268).
//!
//! The module talks UART at 9600 baud. Two GPIO lines (M0, M1) select between
//! transmission and configuration mode; how those are driven is board specific
//! and plugged in through [`ModeSwitch`].

use std::io::{Read, Write};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use serialport::prelude::*;
use serialport::ClearBuffer;

use crate::frame::{Endpoint, ENDPOINT_LEN};
use crate::loradev::{
    AirSpeed, ConfigError, LinkError, RadioConfig, RadioLink, RxPacket, TxPower,
};

pub const BAUD_RATE: u32 = 9600;

const UART_BAUDRATE_9600: u8 = 0x60;
/// Enables ambient noise RSSI readout.
const NOISE_RSSI_ENABLE: u8 = 0x20;
const PACKET_RSSI_ENABLE: u8 = 0x80;
const FIXED_TRANSMISSION: u8 = 0x43;
const RELAY_TRANSMISSION: u8 = 0x03;
const LBT_ENABLE: u8 = 0x10;
const WOR_TRANSMITTER: u8 = 0x08;

const CMD_WRITE_REGISTERS: [u8; 3] = [0xC2, 0x00, 0x09];
const CMD_READ_REGISTERS: [u8; 3] = [0xC1, 0x00, 0x09];
const CMD_CHANNEL_RSSI: [u8; 6] = [0xC0, 0xC1, 0xC2, 0xC3, 0x00, 0x02];
const RESPONSE_OK: u8 = 0xC1;

const CONFIG_ATTEMPTS: usize = 2;
const MODE_SWITCH_DELAY: Duration = Duration::from_millis(100);
const CONFIG_REPLY_DELAY: Duration = Duration::from_millis(200);
const TX_DELAY: Duration = Duration::from_millis(100);
const RSSI_REPLY_DELAY: Duration = Duration::from_millis(500);
/// Time the module needs to push a whole packet over the UART.
pub const DEFAULT_SETTLE: Duration = Duration::from_millis(500);

/// Operating mode selected by the M0/M1 lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// M0 low, M1 low
    Transmission,
    /// M0 low, M1 high
    Configuration,
}

/// Drives the M0/M1 mode lines.
pub trait ModeSwitch {
    fn set_mode(&mut self, mode: Mode) -> Result<(), LinkError>;
}

/// Mode lines hardwired or set by jumpers.
impl ModeSwitch for () {
    fn set_mode(&mut self, _mode: Mode) -> Result<(), LinkError> {
        Ok(())
    }
}

/// Settings as reported back by the module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSettings {
    /// channel in MHz, the module adds .125
    pub frequency: u32,
    pub address: u16,
    pub net_id: u8,
    pub air_speed: Option<AirSpeed>,
    pub power: TxPower,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelRssi {
    /// ambient noise in dBm
    pub noise: i16,
    /// RSSI of the last received packet in dBm
    pub last_packet: Option<i16>,
}

/// Build the 12 byte register block written in configuration mode.
pub fn register_block(config: &RadioConfig) -> Result<[u8; 12], ConfigError> {
    let (_, freq_offset) = config.band()?;
    let [crypt_hi, crypt_lo] = config.crypt.to_be_bytes();
    let rssi = if config.rssi { PACKET_RSSI_ENABLE } else { 0 };
    let mut options = if config.lbt { LBT_ENABLE } else { 0 };
    if config.wor {
        options |= WOR_TRANSMITTER;
    }

    let (addr_hi, addr_lo, net_id, transmission) = if config.relay {
        (0x01, 0x02, 0x03, RELAY_TRANSMISSION)
    } else {
        let [hi, lo] = config.address.to_be_bytes();
        (hi, lo, config.net_id, FIXED_TRANSMISSION)
    };

    Ok([
        CMD_WRITE_REGISTERS[0],
        CMD_WRITE_REGISTERS[1],
        CMD_WRITE_REGISTERS[2],
        addr_hi,
        addr_lo,
        net_id,
        UART_BAUDRATE_9600 + config.air_speed as u8,
        config.packet_size as u8 + config.power as u8 + NOISE_RSSI_ENABLE,
        freq_offset,
        transmission + rssi + options,
        crypt_hi,
        crypt_lo,
    ])
}

/// Convert a raw RSSI byte to dBm.
pub fn rssi_dbm(raw: u8) -> i16 {
    -(256 - i16::from(raw))
}

/// Split a buffer read from the module into sender, payload and RSSI.
///
/// On air a packet is `src addr (BE) | src freq | payload | [rssi]`.
pub fn parse_packet(buf: &[u8], with_rssi: bool) -> Option<RxPacket> {
    let source = Endpoint::from_bytes(buf)?;
    let body = &buf[ENDPOINT_LEN..];
    let (data, rssi) = if with_rssi {
        let (last, rest) = body.split_last()?;
        (rest, Some(rssi_dbm(*last)))
    } else {
        (body, None)
    };
    Some(RxPacket {
        source: Some(source),
        rssi,
        data: data.to_vec(),
    })
}

/// Decode the reply to a register read.
pub fn parse_settings(reply: &[u8], band_base: u32) -> Option<ModuleSettings> {
    if reply.len() < 9 || reply[0] != RESPONSE_OK || reply[2] != 0x09 {
        return None;
    }
    Some(ModuleSettings {
        frequency: band_base + u32::from(reply[8]),
        address: u16::from_be_bytes([reply[3], reply[4]]),
        net_id: reply[5],
        air_speed: AirSpeed::from_code(reply[6] & 0x07),
        power: TxPower::from_code(reply[7]),
    })
}

/// Decode the reply to a channel RSSI request.
pub fn parse_channel_rssi(reply: &[u8]) -> Option<ChannelRssi> {
    match reply {
        [RESPONSE_OK, 0x00, 0x02, noise, rest @ ..] => Some(ChannelRssi {
            noise: rssi_dbm(*noise),
            last_packet: rest.first().map(|b| rssi_dbm(*b)),
        }),
        _ => None,
    }
}

/// Byte level access to the module UART.
pub trait Uart {
    /// Bytes waiting in the receive buffer.
    fn available(&mut self) -> Result<usize, LinkError>;
    fn discard_input(&mut self) -> Result<(), LinkError>;
    fn send(&mut self, data: &[u8]) -> Result<(), LinkError>;
    fn read_into(&mut self, buf: &mut [u8]) -> Result<usize, LinkError>;
}

impl Uart for Box<dyn SerialPort> {
    fn available(&mut self) -> Result<usize, LinkError> {
        Ok((**self).bytes_to_read()? as usize)
    }

    fn discard_input(&mut self) -> Result<(), LinkError> {
        (**self).clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> Result<(), LinkError> {
        (**self).write_all(data)?;
        (**self).flush()?;
        Ok(())
    }

    fn read_into(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
        Ok((**self).read(buf)?)
    }
}

/// Drain whatever the module has buffered.
pub fn read_available<P: Uart + ?Sized>(port: &mut P) -> Result<Vec<u8>, LinkError> {
    let available = port.available()?;
    let mut buf = vec![0u8; available];
    if available > 0 {
        let read = port.read_into(&mut buf)?;
        buf.truncate(read);
    }
    Ok(buf)
}

/// Write a register block and check the module acknowledges it.
///
/// The module sometimes misses the first write after a mode change, so the
/// block is sent up to twice, waiting `reply_delay` for an answer each time.
pub fn write_registers<P: Uart + ?Sized>(
    port: &mut P,
    register: &[u8],
    reply_delay: Duration,
) -> Result<(), LinkError> {
    port.discard_input()?;
    for attempt in 0..CONFIG_ATTEMPTS {
        port.send(register)?;
        thread::sleep(reply_delay);

        if port.available()? > 0 {
            // let the rest of the reply arrive
            thread::sleep(MODE_SWITCH_DELAY.min(reply_delay));
            let reply = read_available(port)?;
            debug!("register write {:02x?}, reply {:02x?}", register, reply);
            return if reply.first() == Some(&RESPONSE_OK) {
                Ok(())
            } else {
                Err(LinkError::Rejected(reply))
            };
        }
        warn!("no reply to register write (attempt {})", attempt + 1);
        port.discard_input()?;
        thread::sleep(reply_delay);
    }
    Err(LinkError::NoResponse)
}

/// Read one packet, giving it `settle` to arrive completely once the first
/// bytes show up.
pub fn read_packet<P: Uart + ?Sized>(
    port: &mut P,
    settle: Duration,
    with_rssi: bool,
) -> Result<Option<RxPacket>, LinkError> {
    if port.available()? == 0 {
        return Ok(None);
    }
    thread::sleep(settle);
    let buf = read_available(port)?;
    if buf.is_empty() {
        return Ok(None);
    }
    let packet = parse_packet(&buf, with_rssi);
    if packet.is_none() {
        warn!("dropping {} byte read without sender header", buf.len());
    }
    Ok(packet)
}

fn query<P: Uart + ?Sized>(port: &mut P, cmd: &[u8], wait: Duration) -> Result<Vec<u8>, LinkError> {
    port.discard_input()?;
    port.send(cmd)?;
    thread::sleep(wait);
    read_available(port)
}

pub struct Sx126xLink<M = ()> {
    settings: SerialPortSettings,
    config: RadioConfig,
    serial_fd: Option<Box<dyn SerialPort>>,
    mode: M,
    settle: Duration,
}

impl Sx126xLink<()> {
    /// Create a link for the serial device named in `config`.
    ///
    /// The device is opened on first use, [`RadioLink::configure`] has to be
    /// called before the settings reach the module.
    pub fn new(config: RadioConfig) -> Self {
        let mut settings: SerialPortSettings = Default::default();
        settings.timeout = Duration::from_millis(200);
        settings.baud_rate = BAUD_RATE;
        Sx126xLink {
            settings,
            config,
            serial_fd: None,
            mode: (),
            settle: DEFAULT_SETTLE,
        }
    }
}

impl<M: ModeSwitch> Sx126xLink<M> {
    /// Use `mode` to drive the M0/M1 lines.
    pub fn with_mode_switch<N: ModeSwitch>(self, mode: N) -> Sx126xLink<N> {
        Sx126xLink {
            settings: self.settings,
            config: self.config,
            serial_fd: self.serial_fd,
            mode,
            settle: self.settle,
        }
    }

    /// Time to wait after the first byte of a packet shows up.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Settings last applied.
    pub fn config(&self) -> &RadioConfig {
        &self.config
    }

    /// Explicitly open the serial device.
    pub fn open(&mut self) -> Result<(), LinkError> {
        let port = serialport::open_with_settings(&self.config.serial_path, &self.settings)?;
        port.clear(ClearBuffer::All)?;
        info!("opened {} at {} baud", self.config.serial_path, self.settings.baud_rate);
        self.serial_fd = Some(port);
        Ok(())
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>, LinkError> {
        if self.serial_fd.is_none() {
            self.open()?;
        }
        match self.serial_fd.as_mut() {
            Some(port) => Ok(port),
            None => Err(LinkError::NoResponse),
        }
    }

    fn switch_mode(&mut self, mode: Mode) -> Result<(), LinkError> {
        self.mode.set_mode(mode)?;
        thread::sleep(MODE_SWITCH_DELAY);
        Ok(())
    }

    fn apply_registers(&mut self, register: &[u8]) -> Result<(), LinkError> {
        self.switch_mode(Mode::Configuration)?;
        let written = self
            .port()
            .and_then(|port| write_registers(port, register, CONFIG_REPLY_DELAY));
        let restored = self.switch_mode(Mode::Transmission);
        written.and(restored)
    }

    /// Read back the settings stored in the module.
    pub fn settings(&mut self) -> Result<ModuleSettings, LinkError> {
        let (base, _) = self.config.band()?;
        self.switch_mode(Mode::Configuration)?;
        let reply = self
            .port()
            .and_then(|port| query(port, &CMD_READ_REGISTERS, MODE_SWITCH_DELAY));
        self.switch_mode(Mode::Transmission)?;
        let reply = reply?;
        parse_settings(&reply, base).ok_or(LinkError::Rejected(reply))
    }

    /// Measure ambient noise on the current channel.
    pub fn channel_rssi(&mut self) -> Result<ChannelRssi, LinkError> {
        self.switch_mode(Mode::Transmission)?;
        let reply = query(self.port()?, &CMD_CHANNEL_RSSI, RSSI_REPLY_DELAY)?;
        if reply.is_empty() {
            return Err(LinkError::NoResponse);
        }
        parse_channel_rssi(&reply).ok_or(LinkError::Rejected(reply))
    }
}

impl<M: ModeSwitch> RadioLink for Sx126xLink<M> {
    fn configure(&mut self, config: &RadioConfig) -> Result<(), LinkError> {
        let register = register_block(config)?;
        let previous = std::mem::replace(&mut self.config, config.clone());
        let previous_fd = if config.serial_path != previous.serial_path {
            self.serial_fd.take()
        } else {
            None
        };

        match self.apply_registers(&register) {
            Ok(()) => {
                info!(
                    "configured {} MHz, address {:#06x}, {} dBm",
                    config.frequency,
                    config.address,
                    config.power.dbm()
                );
                Ok(())
            }
            Err(e) => {
                self.config = previous;
                if previous_fd.is_some() {
                    self.serial_fd = previous_fd;
                }
                Err(e)
            }
        }
    }

    fn transmit(&mut self, data: &[u8]) -> Result<(), LinkError> {
        if data.is_empty() {
            return Ok(());
        }
        self.mode.set_mode(Mode::Transmission)?;
        self.port()?.send(data)?;
        thread::sleep(TX_DELAY);
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<RxPacket>, LinkError> {
        let settle = self.settle;
        let with_rssi = self.config.rssi;
        read_packet(self.port()?, settle, with_rssi)
    }
}
