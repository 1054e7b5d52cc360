use std::time::Duration;

use log::info;
use sx126x_messenger::messenger::DEFAULT_REASSEMBLY_TIMEOUT;
use sx126x_messenger::{LoopbackLink, Messenger, MessengerOptions, RadioConfig};

// Runs the whole send/receive path without hardware.
fn main() -> anyhow::Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .init();

    let options = MessengerOptions {
        fragment_interval: Duration::from_millis(10),
        ..Default::default()
    };
    let mut messenger = Messenger::new(LoopbackLink::new(), RadioConfig::default().with_rssi(true))?
        .with_options(options)
        .with_observer(|event| info!("event: {:?}", event));
    let me = messenger.endpoint();

    messenger.send(me, "ping")?;
    println!("{:?}", messenger.receive(Duration::from_secs(1))?);

    let long = "0123456789".repeat(50);
    messenger.send_long(me, &long)?;
    let msg = messenger.receive_long(DEFAULT_REASSEMBLY_TIMEOUT)?;
    println!("reassembled {} bytes", msg.map_or(0, |m| m.text.len()));
    Ok(())
}
