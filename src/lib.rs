//! Short text messages over SX126x LoRa UART modules.
//!
//! A [`Messenger`] owns one [`RadioLink`] and turns strings into addressed
//! frames and back. [`Sx126xLink`] drives real hardware over a serial port,
//! [`LoopbackLink`] stands in for it in tests.
//!
//! ```no_run
//! use std::time::Duration;
//! use sx126x_messenger::{Endpoint, Messenger, RadioConfig, Sx126xLink};
//!
//! let config = RadioConfig::new("/dev/ttyS0", 868, 0x0001);
//! let link = Sx126xLink::new(config.clone());
//! let mut messenger = Messenger::new(link, config).unwrap();
//! messenger.send(Endpoint::new(0x0002, 18), "hello").unwrap();
//! if let Some(reply) = messenger.receive(Duration::from_secs(2)).unwrap() {
//!     println!("{}", reply);
//! }
//! ```

use anyhow::Context;
use log::info;
use serialport::SerialPortType;

pub mod fragment;
pub mod frame;
pub mod loopback;
pub mod loradev;
pub mod messenger;
pub mod sx126x;

pub use frame::{Endpoint, Frame, FrameError};
pub use loopback::LoopbackLink;
pub use loradev::{
    AirSpeed, ConfigError, LinkError, PacketSize, RadioConfig, RadioLink, RxPacket, TxPower,
};
pub use messenger::{Event, Message, Messenger, MessengerOptions, SendError};
pub use sx126x::{Mode, ModeSwitch, Sx126xLink, Uart};

/// Returns the serial device the HAT usually shows up as.
/// It might not be present or called otherwise depending on
/// the system configuration.
pub fn get_default_serial() -> String {
    if cfg!(target_os = "macos") {
        String::from("/dev/tty.usbserial-0001")
    } else {
        String::from("/dev/ttyS0")
    }
}

/// A little helper function that logs information about
/// all available serial ports on the system.
pub fn dump_all_serial_ports() -> anyhow::Result<()> {
    let ports = serialport::available_ports().context("listing serial ports")?;
    match ports.len() {
        0 => info!("No ports found."),
        1 => info!("Found 1 port:"),
        n => info!("Found {} ports:", n),
    };
    for p in ports {
        match p.port_type {
            SerialPortType::UsbPort(usb) => info!(
                "  {} (USB {:04x}:{:04x} {} {})",
                p.port_name,
                usb.vid,
                usb.pid,
                usb.manufacturer.as_ref().map_or("", String::as_str),
                usb.product.as_ref().map_or("", String::as_str)
            ),
            SerialPortType::BluetoothPort => info!("  {} (Bluetooth)", p.port_name),
            SerialPortType::PciPort => info!("  {} (PCI)", p.port_name),
            SerialPortType::Unknown => info!("  {} (unknown type)", p.port_name),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn two_nodes_share_a_channel() {
        let a = RadioConfig::new("/dev/ttyS0", 868, 0x0001);
        let mut node = Messenger::new(LoopbackLink::new(), a).unwrap();

        // a frame addressed to another node is not heard locally
        node.send(Endpoint::new(0x0002, 18), "for b").unwrap();
        assert_eq!(node.receive(Duration::from_millis(20)).unwrap(), None);

        node.send(Endpoint::new(loradev::BROADCAST_ADDRESS, 18), "to all").unwrap();
        assert_eq!(
            node.receive(Duration::from_millis(20)).unwrap(),
            Some("to all".to_string())
        );
    }

    #[test]
    fn default_serial_is_a_device_path() {
        assert!(get_default_serial().starts_with("/dev/"));
    }
}
