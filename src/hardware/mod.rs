//! Device-facing control core.
//!
//! Layers, leaves first:
//! - [`serial`]: port opening behind the [`PortOpener`](serial::PortOpener) seam
//! - [`transport`]: one paced serial session ([`TransportSession`])
//! - [`discovery`]: probing (port, baud, address) tuples ([`DeviceScanner`])
//! - [`controller`]: the motor state machine ([`MotorController`])
//! - `poller`: the background position loop driven by the controller
//! - [`mock_serial`]: in-process serial port and simulated devices for tests

pub mod controller;
pub mod discovery;
pub mod mock_serial;
mod poller;
pub mod serial;
pub mod transport;

pub use controller::{MotorController, MotorEvent, MotorState, StoppedMovingReason};
pub use discovery::{search_com_ports, DeviceScanner, PortInformation, PortStatus};
pub use serial::{DynSerial, PortOpener, SerialPortIO};
pub use transport::{ProbeOutcome, TransportSession, TransportTarget};

#[cfg(feature = "serial")]
pub use serial::TokioSerialOpener;
