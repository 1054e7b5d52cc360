use std::env;

use sx126x_messenger::{dump_all_serial_ports, get_default_serial};
use sx126x_messenger::{RadioConfig, RadioLink, Sx126xLink};

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let device = env::args().nth(1).unwrap_or_else(get_default_serial);

    println!("sx126x config example");
    dump_all_serial_ports()?;

    let config = RadioConfig::new(&device, 868, 0x0001);
    let mut link = Sx126xLink::new(config.clone());
    link.configure(&config)?;
    println!("{:#?}", link.settings()?);
    println!("{:#?}", link.channel_rssi()?);
    Ok(())
}
