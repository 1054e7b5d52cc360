use std::env;

use sx126x_messenger::{dump_all_serial_ports, get_default_serial};
use sx126x_messenger::{Endpoint, Messenger, RadioConfig, Sx126xLink};

// usage: sender [device] [peer address] [peer freq offset] [message]
fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args: Vec<String> = env::args().collect();
    let device = args.get(1).cloned().unwrap_or_else(get_default_serial);
    let address = u16::from_str_radix(args.get(2).map_or("0002", String::as_str), 16)?;
    let offset: u8 = args.get(3).map_or("18", String::as_str).parse()?;
    let message = args.get(4).map_or("hello from sx126x-messenger", String::as_str);

    println!("sx126x sender example");
    dump_all_serial_ports()?;

    let config = RadioConfig::new(&device, 868, 0x0001);
    let mut messenger = Messenger::new(Sx126xLink::new(config.clone()), config)?;
    messenger.send(Endpoint::new(address, offset), message)?;
    println!("sent {:?} to {:#06x}", message, address);
    Ok(())
}
