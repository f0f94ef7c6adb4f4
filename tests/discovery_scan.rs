//! Port discovery against scripted mock ports.

mod common;

use common::SimulatedSilverpak;
use silverpak::config::TransportConfig;
use silverpak::hardware::mock_serial::MockPortOpener;
use silverpak::hardware::{search_com_ports, DeviceScanner, PortInformation, PortStatus};
use silverpak::protocol::DriverAddress;
use std::sync::Arc;

fn fast_transport() -> TransportConfig {
    TransportConfig {
        delay_unit_ms: 1,
        read_window_ms: 20,
    }
}

fn status_of<'a>(ports: &'a [PortInformation], name: &str) -> &'a PortInformation {
    ports
        .iter()
        .find(|p| p.port_name == name)
        .unwrap_or_else(|| panic!("{name} missing from scan"))
}

#[tokio::test]
async fn full_scan_classifies_every_port() {
    let sim = SimulatedSilverpak::new(DriverAddress::Driver2);
    let opener = MockPortOpener::new();
    opener.add_busy("COM1");
    opener.add_missing("COM2");
    opener.add_write_rejecting("COM3");
    opener.add_empty("COM4");
    opener.add_device("COM5", Some(19200), sim.responder());

    let mut scanner = DeviceScanner::new(Arc::new(opener.clone()), fast_transport());
    let ports = scanner.search_ports(None, None, None).await;

    let names: Vec<&str> = ports.iter().map(|p| p.port_name.as_str()).collect();
    assert_eq!(names, ["COM1", "COM2", "COM3", "COM4", "COM5"]);

    assert_eq!(status_of(&ports, "COM1").status, PortStatus::Busy);
    assert_eq!(status_of(&ports, "COM2").status, PortStatus::Invalid);
    assert_eq!(status_of(&ports, "COM3").status, PortStatus::Invalid);

    let empty = status_of(&ports, "COM4");
    assert_eq!(empty.status, PortStatus::Empty);
    assert_eq!(empty.baud_rate, None);
    assert_eq!(empty.driver_address, None);

    let found = status_of(&ports, "COM5");
    assert_eq!(found.status, PortStatus::AvailableSilverpak);
    assert_eq!(found.baud_rate, Some(19200));
    assert_eq!(found.driver_address, Some(DriverAddress::Driver2));

    // Every address at 9600 first, then 19200 until driver 2 answers
    let com5: Vec<u32> = opener
        .opened()
        .into_iter()
        .filter(|(port, _)| port == "COM5")
        .map(|(_, baud)| baud)
        .collect();
    assert_eq!(com5.len(), 18);
    assert!(com5[..16].iter().all(|b| *b == 9600));
    assert_eq!(&com5[16..], &[19200, 19200]);

    // Empty ports are tried on every candidate baud rate and address
    let com4 = opener.opened().iter().filter(|(p, _)| p == "COM4").count();
    assert_eq!(com4, 48);
}

#[tokio::test]
async fn busy_and_invalid_ports_are_probed_once() {
    let opener = MockPortOpener::new();
    opener.add_busy("COM1");
    opener.add_write_rejecting("COM2");

    let mut scanner = DeviceScanner::new(Arc::new(opener.clone()), fast_transport());
    let ports = scanner.search_ports(None, None, None).await;

    assert_eq!(ports[0].status, PortStatus::Busy);
    assert_eq!(ports[1].status, PortStatus::Invalid);
    // Busy never opens; the rejecting port opened exactly once
    assert_eq!(opener.opened(), vec![("COM2".to_string(), 9600)]);
}

#[tokio::test]
async fn fixed_tuple_is_a_single_probe() {
    let sim = SimulatedSilverpak::new(DriverAddress::Driver2);
    let opener = MockPortOpener::new();
    opener.add_device("COM5", Some(19200), sim.responder());

    let mut scanner = DeviceScanner::new(Arc::new(opener.clone()), fast_transport());
    let ports = scanner
        .search_ports(Some("COM5"), Some(19200), Some(DriverAddress::Driver2))
        .await;

    assert_eq!(ports.len(), 1);
    assert!(ports[0].is_available());
    assert_eq!(opener.opened(), vec![("COM5".to_string(), 19200)]);
    assert_eq!(sim.commands(), vec!["Q".to_string()]);
}

#[tokio::test]
async fn fixed_baud_searches_addresses_only() {
    let sim = SimulatedSilverpak::new(DriverAddress::Driver4);
    let opener = MockPortOpener::new();
    opener.add_device("COM5", Some(38400), sim.responder());

    let mut scanner = DeviceScanner::new(Arc::new(opener.clone()), fast_transport());

    let info = scanner
        .search_bauds("COM5", Some(38400), None)
        .await;
    assert_eq!(info.driver_address, Some(DriverAddress::Driver4));
    assert_eq!(opener.opened().len(), 4);

    // Wrong fixed baud: nothing answers
    let info = scanner.search_bauds("COM5", Some(9600), Some(DriverAddress::Driver4)).await;
    assert_eq!(info.status, PortStatus::Empty);
}

#[tokio::test]
async fn silent_tuple_probe_returns_none() {
    let opener = MockPortOpener::new();
    opener.add_empty("COM4");

    let mut scanner = DeviceScanner::new(Arc::new(opener), fast_transport());
    assert!(scanner
        .probe("COM4", 9600, DriverAddress::Driver1)
        .await
        .is_none());
    assert!(scanner
        .search_addresses("COM4", 9600, Some(DriverAddress::Driver1))
        .await
        .is_none());
}

#[tokio::test]
async fn search_com_ports_scans_named_port() {
    let opener = MockPortOpener::new();
    opener.add_busy("COM1");
    opener.add_empty("COM2");

    let ports = search_com_ports(
        Arc::new(opener.clone()),
        fast_transport(),
        Some("COM1"),
        None,
        None,
    )
    .await;

    assert_eq!(ports.len(), 1);
    assert_eq!(ports[0].port_name, "COM1");
    assert_eq!(ports[0].status, PortStatus::Busy);
    assert!(opener.opened().is_empty());
}

#[tokio::test]
async fn no_ports_means_empty_result() {
    let opener = MockPortOpener::new();
    let ports = search_com_ports(Arc::new(opener), fast_transport(), None, None, None).await;
    assert!(ports.is_empty());
}
