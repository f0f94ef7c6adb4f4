//! Silverpak discovery over (port, baud, address) tuples.
//!
//! Scanning walks three nested axes. `None` on an axis means "try every
//! value": all system ports, the candidate baud rates
//! ([`CANDIDATE_BAUD_RATES`]) and the sixteen individually addressed
//! drivers. Group and broadcast addresses are never probed.
//!
//! Each probe opens a throwaway [`TransportSession`], sends the safe query
//! and closes it again. The first answering tuple wins its port; a busy or
//! invalid port is reported as such and not probed further.
//!
//! Do not scan while a controller is talking to the same port.

use super::serial::PortOpener;
use super::transport::{ProbeOutcome, TransportSession, TransportTarget};
use crate::config::TransportConfig;
use crate::protocol::{DriverAddress, CANDIDATE_BAUD_RATES};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;

/// Availability of one scanned port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortStatus {
    /// A Silverpak answered on the recorded baud rate and address
    AvailableSilverpak,
    /// Nothing answered
    Empty,
    /// The port rejected the probe (e.g. a Bluetooth virtual port)
    Invalid,
    /// Another process holds the port
    Busy,
}

impl fmt::Display for PortStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            PortStatus::AvailableSilverpak => "Silverpak",
            PortStatus::Empty => "empty",
            PortStatus::Invalid => "invalid",
            PortStatus::Busy => "busy",
        };
        f.write_str(text)
    }
}

/// Scan result for one port.
///
/// `baud_rate` and `driver_address` are only set for
/// [`PortStatus::AvailableSilverpak`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInformation {
    /// Serial port name
    pub port_name: String,
    /// Baud rate the Silverpak answered on
    pub baud_rate: Option<u32>,
    /// Address the Silverpak answered on
    pub driver_address: Option<DriverAddress>,
    /// Port classification
    pub status: PortStatus,
}

impl PortInformation {
    fn with_status(port_name: &str, status: PortStatus) -> Self {
        Self {
            port_name: port_name.to_string(),
            baud_rate: None,
            driver_address: None,
            status,
        }
    }

    /// True if a Silverpak was found on this port.
    pub fn is_available(&self) -> bool {
        self.status == PortStatus::AvailableSilverpak
    }

    /// Connection target for an available Silverpak.
    pub fn target(&self) -> Option<TransportTarget> {
        match (self.status, self.baud_rate, self.driver_address) {
            (PortStatus::AvailableSilverpak, Some(baud_rate), Some(driver_address)) => {
                Some(TransportTarget {
                    port_name: self.port_name.clone(),
                    baud_rate,
                    driver_address,
                })
            }
            _ => None,
        }
    }
}

/// Probes ports for Silverpaks, pacing probes by the transport delay unit.
pub struct DeviceScanner {
    opener: Arc<dyn PortOpener>,
    transport: TransportConfig,
    next_probe: Instant,
}

impl fmt::Debug for DeviceScanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceScanner")
            .field("transport", &self.transport)
            .finish()
    }
}

impl DeviceScanner {
    /// Scanner opening ports through `opener`.
    pub fn new(opener: Arc<dyn PortOpener>, transport: TransportConfig) -> Self {
        Self {
            opener,
            transport,
            next_probe: Instant::now(),
        }
    }

    /// One [`PortInformation`] per searched port.
    ///
    /// With `port_name` unset every system port is searched; a failure to
    /// enumerate ports yields an empty list.
    pub async fn search_ports(
        &mut self,
        port_name: Option<&str>,
        baud_rate: Option<u32>,
        driver_address: Option<DriverAddress>,
    ) -> Vec<PortInformation> {
        let ports = match port_name {
            Some(name) => vec![name.to_string()],
            None => match self.opener.available_ports().await {
                Ok(ports) => ports,
                Err(e) => {
                    tracing::warn!(target: "silverpak::discovery", error = %e, "Cannot enumerate serial ports");
                    Vec::new()
                }
            },
        };

        tracing::info!(target: "silverpak::discovery", ports = ports.len(), "Starting Silverpak scan");
        let mut results = Vec::with_capacity(ports.len());
        for port in ports {
            let info = self.search_bauds(&port, baud_rate, driver_address).await;
            tracing::info!(
                target: "silverpak::discovery",
                port = %info.port_name,
                status = %info.status,
                baud_rate = ?info.baud_rate,
                address = ?info.driver_address,
                "Port scanned"
            );
            results.push(info);
        }
        results
    }

    /// Search one port over baud rates (all candidates if unset).
    pub async fn search_bauds(
        &mut self,
        port_name: &str,
        baud_rate: Option<u32>,
        driver_address: Option<DriverAddress>,
    ) -> PortInformation {
        let bauds: Vec<u32> = match baud_rate {
            Some(baud) => vec![baud],
            None => CANDIDATE_BAUD_RATES.to_vec(),
        };
        for baud in bauds {
            if let Some(info) = self.search_addresses(port_name, baud, driver_address).await {
                return info;
            }
        }
        PortInformation::with_status(port_name, PortStatus::Empty)
    }

    /// Search one port and baud rate over driver addresses (1 to 16 if unset).
    ///
    /// `None` stands for "nothing answered" so the caller keeps searching.
    pub async fn search_addresses(
        &mut self,
        port_name: &str,
        baud_rate: u32,
        driver_address: Option<DriverAddress>,
    ) -> Option<PortInformation> {
        let addresses: Vec<DriverAddress> = match driver_address {
            Some(address) => vec![address],
            None => DriverAddress::INDIVIDUAL.to_vec(),
        };
        for address in addresses {
            if let Some(info) = self.probe(port_name, baud_rate, address).await {
                return Some(info);
            }
        }
        None
    }

    /// Probe a single tuple.
    ///
    /// Returns `None` when the line stayed silent.
    pub async fn probe(
        &mut self,
        port_name: &str,
        baud_rate: u32,
        driver_address: DriverAddress,
    ) -> Option<PortInformation> {
        tokio::time::sleep_until(self.next_probe).await;
        self.next_probe = Instant::now() + self.transport.delay_unit();

        let target = TransportTarget {
            port_name: port_name.to_string(),
            baud_rate,
            driver_address,
        };
        let mut session =
            TransportSession::with_target(self.opener.clone(), &self.transport, target);
        let outcome = match session.probe().await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(target: "silverpak::discovery", port = port_name, error = %e, "Probe skipped");
                return None;
            }
        };
        session.disconnect().await;

        tracing::debug!(
            target: "silverpak::discovery",
            port = port_name,
            baud_rate,
            address = %driver_address,
            ?outcome,
            "Probe finished"
        );

        match outcome {
            ProbeOutcome::Responded => Some(PortInformation {
                port_name: port_name.to_string(),
                baud_rate: Some(baud_rate),
                driver_address: Some(driver_address),
                status: PortStatus::AvailableSilverpak,
            }),
            ProbeOutcome::Busy => Some(PortInformation::with_status(port_name, PortStatus::Busy)),
            ProbeOutcome::Invalid => {
                Some(PortInformation::with_status(port_name, PortStatus::Invalid))
            }
            ProbeOutcome::Silent => None,
        }
    }
}

/// Scan with a fresh [`DeviceScanner`].
pub async fn search_com_ports(
    opener: Arc<dyn PortOpener>,
    transport: TransportConfig,
    port_name: Option<&str>,
    baud_rate: Option<u32>,
    driver_address: Option<DriverAddress>,
) -> Vec<PortInformation> {
    DeviceScanner::new(opener, transport)
        .search_ports(port_name, baud_rate, driver_address)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_available_ports_yield_a_target() {
        let found = PortInformation {
            port_name: "COM3".to_string(),
            baud_rate: Some(19200),
            driver_address: Some(DriverAddress::Driver2),
            status: PortStatus::AvailableSilverpak,
        };
        let target = found.target().unwrap();
        assert_eq!(target.port_name, "COM3");
        assert_eq!(target.baud_rate, 19200);
        assert_eq!(target.driver_address, DriverAddress::Driver2);

        let busy = PortInformation::with_status("COM4", PortStatus::Busy);
        assert!(!busy.is_available());
        assert!(busy.target().is_none());
    }

    #[test]
    fn status_display_is_human_readable() {
        assert_eq!(PortStatus::AvailableSilverpak.to_string(), "Silverpak");
        assert_eq!(PortStatus::Empty.to_string(), "empty");
    }
}
