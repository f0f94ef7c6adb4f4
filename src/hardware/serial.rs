//! Serial port plumbing shared by the transport and discovery.
//!
//! Ports are opened through the [`PortOpener`] trait so the control core can
//! run against real hardware ([`TokioSerialOpener`]) or against the
//! in-process [`mock_serial`](super::mock_serial) port in tests.

#[cfg(feature = "serial")]
use crate::protocol;
use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

/// Trait for types that can be used as async serial ports.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Dynamic serial port type.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Opens serial ports with DT protocol framing (8N1, no handshake).
#[async_trait]
pub trait PortOpener: Send + Sync {
    /// Open `port_name` at `baud_rate`.
    async fn open(&self, port_name: &str, baud_rate: u32) -> io::Result<DynSerial>;

    /// Names of every serial port present on the system.
    async fn available_ports(&self) -> io::Result<Vec<String>>;
}

/// True if an open failure means another process already owns the port.
pub fn is_access_conflict(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::PermissionDenied | io::ErrorKind::ResourceBusy
    )
}

/// [`PortOpener`] backed by `tokio-serial`.
#[cfg(feature = "serial")]
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSerialOpener;

#[cfg(feature = "serial")]
#[async_trait]
impl PortOpener for TokioSerialOpener {
    async fn open(&self, port_name: &str, baud_rate: u32) -> io::Result<DynSerial> {
        let port_path = port_name.to_string();
        // Opening can block on some platforms; keep it off the runtime threads.
        let port = tokio::task::spawn_blocking(move || open_serial_port(&port_path, baud_rate))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;
        Ok(Box::new(port))
    }

    async fn available_ports(&self) -> io::Result<Vec<String>> {
        let ports = tokio_serial::available_ports().map_err(io::Error::from)?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }
}

/// Open a serial port with Silverpak settings.
#[cfg(feature = "serial")]
fn open_serial_port(port_path: &str, baud_rate: u32) -> io::Result<tokio_serial::SerialStream> {
    use tokio_serial::SerialPortBuilderExt;

    let port = tokio_serial::new(port_path, baud_rate)
        .data_bits(data_bits(protocol::DATA_BITS)?)
        .parity(tokio_serial::Parity::None)
        .stop_bits(stop_bits(protocol::STOP_BITS)?)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(io::Error::from)?;

    tracing::debug!(port = port_path, baud_rate, "Opened Silverpak serial port");
    Ok(port)
}

#[cfg(feature = "serial")]
fn data_bits(bits: u8) -> io::Result<tokio_serial::DataBits> {
    match bits {
        5 => Ok(tokio_serial::DataBits::Five),
        6 => Ok(tokio_serial::DataBits::Six),
        7 => Ok(tokio_serial::DataBits::Seven),
        8 => Ok(tokio_serial::DataBits::Eight),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported data bits: {other}"),
        )),
    }
}

#[cfg(feature = "serial")]
fn stop_bits(bits: u8) -> io::Result<tokio_serial::StopBits> {
    match bits {
        1 => Ok(tokio_serial::StopBits::One),
        2 => Ok(tokio_serial::StopBits::Two),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported stop bits: {other}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_conflicts_are_recognised() {
        assert!(is_access_conflict(&io::Error::from(
            io::ErrorKind::PermissionDenied
        )));
        assert!(is_access_conflict(&io::Error::from(io::ErrorKind::ResourceBusy)));
        assert!(!is_access_conflict(&io::Error::from(io::ErrorKind::NotFound)));
    }

    #[cfg(feature = "serial")]
    #[test]
    fn frame_settings_are_eight_n_one() {
        assert_eq!(
            data_bits(protocol::DATA_BITS).unwrap(),
            tokio_serial::DataBits::Eight
        );
        assert_eq!(
            stop_bits(protocol::STOP_BITS).unwrap(),
            tokio_serial::StopBits::One
        );
        assert!(data_bits(9).is_err());
        assert!(stop_bits(0).is_err());
    }
}
