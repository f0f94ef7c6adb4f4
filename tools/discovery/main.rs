/*
 * Silverpak Discovery Tool
 *
 * Scans every serial port for Silverpak 23CE drivers by sending the
 * DT protocol safe query ("Q") to each (baud, address) combination.
 *
 * WARNING:
 * Do not run this while a controller is driving a motor on the same port.
 * Probes are paced by the transport delay unit, so a full scan of one
 * empty port takes 3 baud rates x 16 addresses worth of probes.
 * Run this ONCE during setup.
 *
 * Once a port answers, the bus is mapped: Silverpaks are daisy-chainable,
 * so every other individual address on that port is probed as well.
 */

use anyhow::Result;
use silverpak::config::SilverpakConfig;
use silverpak::hardware::{DeviceScanner, PortStatus, TokioSerialOpener};
use silverpak::protocol::DriverAddress;
use silverpak::tracing_init::{self, OutputFormat, TracingConfig};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let config = SilverpakConfig::load().unwrap_or_default();
    let tracing_config = TracingConfig::from_config(&config)
        .unwrap_or_default()
        .with_format(OutputFormat::Compact);
    tracing_init::init(tracing_config)?;

    println!("🔍 Starting Silverpak Discovery Scan...");
    println!("⚠️  WARNING: Motors on scanned ports may receive status queries.");

    let mut scanner = DeviceScanner::new(Arc::new(TokioSerialOpener), config.transport.clone());
    let ports = scanner.search_ports(None, None, None).await;

    if ports.is_empty() {
        println!("❌ No serial ports detected on this system.");
        return Ok(());
    }

    for info in ports {
        match (info.status, info.baud_rate, info.driver_address) {
            (PortStatus::AvailableSilverpak, Some(baud), Some(address)) => {
                println!(
                    "✅ FOUND: Silverpak 23CE on {} (Baud: {}, {})",
                    info.port_name, baud, address
                );
                scan_driver_bus(&mut scanner, &info.port_name, baud, address).await;
            }
            (PortStatus::Busy, _, _) => {
                println!("🔒 {}: busy (opened by another program)", info.port_name);
            }
            (PortStatus::Invalid, _, _) => println!("🚫 {}: rejected the probe", info.port_name),
            _ => println!("   {}: (No Silverpak or No Response)", info.port_name),
        }
    }

    Ok(())
}

/// Probe the remaining individual addresses on a port known to hold a Silverpak.
async fn scan_driver_bus(
    scanner: &mut DeviceScanner,
    port_name: &str,
    baud_rate: u32,
    found: DriverAddress,
) {
    println!("   Driver bus map for {}:", port_name);
    println!("   -> {}: Active", found);

    for address in DriverAddress::INDIVIDUAL.into_iter().filter(|a| *a != found) {
        if let Some(info) = scanner.probe(port_name, baud_rate, address).await {
            if info.is_available() {
                println!("   -> {}: Active", address);
            }
        }
    }
}
