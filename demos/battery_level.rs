//! This example finds the first device advertising the battery service,
//! connects to it and prints its battery level whenever it changes.

use std::time::Duration;

use blesense::common::{BatteryLevel, BatteryMonitor};
use blesense::{CentralManager, ConnectConfig, Error, ScanConfig};
use futures::StreamExt;

#[tokio::main]
async fn main() -> Result<(), Error> {
    pretty_env_logger::init();

    let central = CentralManager::<BatteryMonitor>::open(0).await?;
    if !central.is_ready().await? {
        println!("Bluetooth is not available: {:?}", central.radio_state());
        return Err(Error::NotReady);
    }

    let config = ScanConfig::default().stop_after_idle(Duration::from_secs(10));
    let mut devices = central.discover(config)?;

    let device = match devices.next().await {
        Some(device) => device,
        None => {
            println!("No battery powered device nearby");
            return Ok(());
        }
    };
    central.stop_scan();

    println!("Connecting to {:?}", device);
    let monitor = central
        .connect_with(&device, ConnectConfig::default().timeout(Duration::from_secs(15)))
        .await?;

    for characteristic in monitor.characteristics().characteristics() {
        println!("Characteristic: {:?}", characteristic);
    }

    let mut levels = monitor.subscribe::<BatteryLevel>()?;
    while let Some(level) = levels.next().await {
        println!("Battery level: {}%", level);
    }

    println!("Stream ended, device is {:?}", monitor.state());
    if central.has_connection_error() {
        println!("The connection was lost");
    }

    Ok(())
}
