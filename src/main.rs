//! CLI entry point for the Silverpak control core.
//!
//! # Usage
//!
//! Find every Silverpak on the system:
//! ```bash
//! silverpak scan
//! ```
//!
//! Connect, run the full initialization and wait until the motor is ready:
//! ```bash
//! silverpak --port /dev/ttyUSB0 --baud 9600 --address 1 init
//! ```
//!
//! Initialize, then move to an absolute position:
//! ```bash
//! silverpak move 250000
//! ```
//!
//! Connection settings left unset on the command line and in the
//! configuration file are discovered by scanning.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use silverpak::config::{SilverpakConfig, DEFAULT_CONFIG_PATH};
use silverpak::hardware::{
    search_com_ports, MotorController, MotorEvent, PortStatus, StoppedMovingReason,
    TokioSerialOpener,
};
use silverpak::protocol::DriverAddress;
use silverpak::tracing_init::{self, OutputFormat, TracingConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Parser)]
#[command(name = "silverpak")]
#[command(about = "Control a Silverpak 23CE stepper motor", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Serial port (overrides configuration)
    #[arg(long)]
    port: Option<String>,

    /// Baud rate (overrides configuration)
    #[arg(long)]
    baud: Option<u32>,

    /// Driver address switch digit, 1-9, A-F or 0 (overrides configuration)
    #[arg(long, value_parser = parse_address)]
    address: Option<DriverAddress>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Compact)]
    log_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan serial ports for Silverpaks
    Scan,

    /// Connect and print the firmware version
    Firmware,

    /// Connect and run the full initialization sequence
    Init {
        /// Give up if coordinates are not initialized within this many seconds
        #[arg(long, default_value = "120")]
        timeout_secs: u64,
    },

    /// Initialize, then move to an absolute position
    Move {
        /// Target position in motor units
        position: i64,

        /// Give up if the motor does not stop within this many seconds
        #[arg(long, default_value = "120")]
        timeout_secs: u64,
    },
}

fn parse_address(value: &str) -> std::result::Result<DriverAddress, String> {
    let mut chars = value.chars();
    match (chars.next(), chars.next()) {
        (Some(digit), None) => DriverAddress::from_hex_digit(digit)
            .ok_or_else(|| format!("'{digit}' is not a driver switch digit (1-9, A-F, 0)")),
        _ => Err(format!("'{value}' is not a single switch digit")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = SilverpakConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if cli.port.is_some() {
        config.connection.port_name = cli.port.clone();
    }
    if cli.baud.is_some() {
        config.connection.baud_rate = cli.baud;
    }
    if cli.address.is_some() {
        config.connection.driver_address = cli.address;
    }
    config.validate().context("invalid configuration")?;

    let tracing_config = TracingConfig::from_config(&config)?.with_format(cli.log_format);
    tracing_init::init(tracing_config)?;

    match cli.command {
        Commands::Scan => scan(&config).await,
        Commands::Firmware => firmware(&config).await,
        Commands::Init { timeout_secs } => {
            let motor = connect(&config).await?;
            let result = initialize(&motor, Duration::from_secs(timeout_secs)).await;
            motor.shutdown().await;
            result
        }
        Commands::Move {
            position,
            timeout_secs,
        } => {
            let motor = connect(&config).await?;
            let timeout = Duration::from_secs(timeout_secs);
            let result: Result<()> = async {
                initialize(&motor, timeout).await?;
                let mut events = motor.subscribe();
                motor.go_to_position(position).await?;
                wait_for_stop(&motor, &mut events, StoppedMovingReason::Normal, timeout).await?;
                println!("Stopped at {}", motor.position().await);
                Ok(())
            }
            .await;
            motor.shutdown().await;
            result
        }
    }
}

async fn scan(config: &SilverpakConfig) -> Result<()> {
    println!("Scanning for Silverpak 23CE drivers...");
    let ports = search_com_ports(
        Arc::new(TokioSerialOpener),
        config.transport.clone(),
        config.connection.port_name.as_deref(),
        config.connection.baud_rate,
        config.connection.driver_address,
    )
    .await;

    if ports.is_empty() {
        println!("No serial ports detected on this system.");
        return Ok(());
    }
    for info in &ports {
        match (info.status, info.baud_rate, info.driver_address) {
            (PortStatus::AvailableSilverpak, Some(baud), Some(address)) => {
                println!("{}: Silverpak (baud {baud}, {address})", info.port_name);
            }
            (status, _, _) => println!("{}: {status}", info.port_name),
        }
    }
    Ok(())
}

async fn connect(config: &SilverpakConfig) -> Result<MotorController> {
    let motor = MotorController::from_config(config);
    let target = &config.connection;
    let connected = if target.port_name.is_some()
        && target.baud_rate.is_some()
        && target.driver_address.is_some()
    {
        motor.connect().await?
    } else {
        motor.find_and_connect().await?
    };
    if !connected {
        bail!("no Silverpak found (connection target: {target:?})");
    }
    let found = motor.connection().await;
    println!(
        "Connected to {} (baud {}, {})",
        found.port_name.unwrap_or_default(),
        found.baud_rate.unwrap_or_default(),
        found.driver_address.map(|a| a.to_string()).unwrap_or_default(),
    );
    Ok(motor)
}

async fn firmware(config: &SilverpakConfig) -> Result<()> {
    let motor = connect(config).await?;
    let version = motor.firmware_version().await;
    motor.disconnect().await?;
    match version? {
        Some(version) => println!("Firmware: {version}"),
        None => println!("Firmware version query went unanswered"),
    }
    Ok(())
}

async fn initialize(motor: &MotorController, timeout: Duration) -> Result<()> {
    let mut events = motor.subscribe();
    motor.initialize_motor_settings().await?;
    motor.initialize_smooth_motion().await?;
    motor.initialize_coordinates().await?;
    println!("Initializing coordinates...");
    wait_for_stop(motor, &mut events, StoppedMovingReason::Initialized, timeout).await?;
    println!("Motor ready at {}", motor.position().await);
    Ok(())
}

/// Follow events until the motor stops for `expected`. Ctrl-C stops the motor.
async fn wait_for_stop(
    motor: &MotorController,
    events: &mut broadcast::Receiver<MotorEvent>,
    expected: StoppedMovingReason,
    timeout: Duration,
) -> Result<()> {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => {
                motor.stop_motor().await?;
                bail!("motor did not stop within {}s", timeout.as_secs());
            }
            _ = tokio::signal::ctrl_c() => {
                motor.stop_motor().await?;
                bail!("interrupted");
            }
            event = events.recv() => match event {
                Ok(MotorEvent::PositionChanged(position)) => println!("  position {position}"),
                Ok(MotorEvent::StoppedMoving(reason)) if reason == expected => return Ok(()),
                Ok(MotorEvent::StoppedMoving(reason)) => bail!("motor stopped early: {reason:?}"),
                Ok(MotorEvent::ConnectionLost) => bail!("connection to the Silverpak was lost"),
                Ok(MotorEvent::DeviceMisbehavior(reason)) => bail!("device misbehavior: {reason}"),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Event receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => bail!("event channel closed"),
            }
        }
    }
}
