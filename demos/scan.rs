//! Scans for ten seconds and prints everything seen.

use blecentral::Scanner;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();

    let devices = Scanner::discover(Duration::from_secs(10)).await?;
    if devices.is_empty() {
        eprintln!("no BLE devices found");
        return Ok(());
    }

    for (device, advertisement) in devices {
        println!(
            "{}  rssi {:?}  services {:?}",
            device, advertisement.rssi, advertisement.service_uuids
        );
    }
    Ok(())
}
