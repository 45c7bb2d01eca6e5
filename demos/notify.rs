//! Connects to a device by address and prints value updates from a
//! characteristic.
//!
//! Usage: notify <address> <characteristic-uuid>

use blecentral::{Client, Error, NotifyOptions, Scanner};
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();

    let mut args = std::env::args().skip(1);
    let address = args.next().expect("usage: notify <address> <char-uuid>");
    let characteristic = args.next().expect("usage: notify <address> <char-uuid>");

    let device = Scanner::find_device_by_address(&address, Duration::from_secs(10))
        .await?
        .ok_or(Error::DeviceNotFound)?;
    println!("found {device}, connecting...");

    let client = Client::new(device);
    client.connect().await?;
    println!("connected, MTU {}", client.mtu_size()?);

    client
        .start_notify(
            characteristic.as_str(),
            Box::new(|value| println!("notification: {value:02x?}")),
            NotifyOptions::default(),
        )
        .await?;

    tokio::time::sleep(Duration::from_secs(30)).await;
    client.disconnect().await?;
    Ok(())
}
