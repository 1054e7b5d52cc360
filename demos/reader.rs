use std::env;
use std::time::Duration;

use sx126x_messenger::{dump_all_serial_ports, get_default_serial};
use sx126x_messenger::{Messenger, RadioConfig, Sx126xLink};

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let device = env::args().nth(1).unwrap_or_else(get_default_serial);

    println!("sx126x reader example");
    dump_all_serial_ports()?;

    let config = RadioConfig::new(&device, 868, 0x0002).with_rssi(true);
    let mut messenger = Messenger::new(Sx126xLink::new(config.clone()), config)?;
    loop {
        if let Some(msg) = messenger.receive_message(Duration::from_secs(2))? {
            println!("{:?} from {:?} ({:?} dBm)", msg.text, msg.source, msg.rssi);
        }
    }
}
