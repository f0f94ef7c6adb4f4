//! Silverpak 23CE motor controller.
//!
//! [`MotorController`] is a cloneable handle around one motor's state
//! machine:
//!
//! ```text
//! Disconnected ──connect──▶ Connected ──initialize_motor_settings──▶ InitializedSettings
//!     ──initialize_smooth_motion──▶ InitializedSmoothMotion
//!     ──initialize_coordinates──▶ MoveToZero ──(poller)──▶ CalibrateHome ──(poller)──▶ Ready
//! Ready ──go_to_position──▶ Moving ──(poller)──▶ Ready
//! ```
//!
//! Every operation validates the current state first; a call from the wrong
//! state fails with [`SilverpakError::InvalidOperationState`] and sends
//! nothing. State, cached position and the open [`TransportSession`] sit
//! behind one async mutex (the controller lock). The background
//! [`PositionPoller`] takes the same lock for one query at a time and has a
//! second, independent lock for its own task bookkeeping.
//!
//! Notifications go out on a broadcast channel ([`MotorController::subscribe`])
//! and are always sent after the controller lock is released.
//!
//! # Example
//! ```no_run
//! use silverpak::config::SilverpakConfig;
//! use silverpak::hardware::controller::{MotorController, MotorEvent, StoppedMovingReason};
//!
//! # async fn run() -> silverpak::Result<()> {
//! let config = SilverpakConfig::load()?;
//! let motor = MotorController::from_config(&config);
//! let mut events = motor.subscribe();
//!
//! if motor.find_and_connect().await? {
//!     motor.initialize_motor_settings().await?;
//!     motor.initialize_smooth_motion().await?;
//!     motor.initialize_coordinates().await?;
//!     while let Ok(event) = events.recv().await {
//!         if event == MotorEvent::StoppedMoving(StoppedMovingReason::Initialized) {
//!             break;
//!         }
//!     }
//!     motor.go_to_position(10_000).await?;
//! }
//! # Ok(())
//! # }
//! ```

use super::discovery::DeviceScanner;
use super::poller::{self, PositionPoller};
use super::serial::PortOpener;
use super::transport::{TransportSession, TransportTarget};
use crate::config::{ConnectionConfig, MotorSettings, PollerConfig, SilverpakConfig, TransportConfig};
use crate::error::{Result, SilverpakError};
use crate::protocol::{generate_command, generate_message, Command, DriverAddress};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

/// Delay factor for settings lists.
pub const SETTINGS_DELAY_FACTOR: f32 = 4.0;
/// Delay factor for each smooth-motion step.
pub const SMOOTH_MOTION_DELAY_FACTOR: f32 = 3.0;
/// Delay factor for the move-to-zero sequence.
pub const MOVE_TO_ZERO_DELAY_FACTOR: f32 = 2.0;
/// Delay factor for single motion commands, stops and queries.
pub const COMMAND_DELAY_FACTOR: f32 = 1.0;

const SMOOTH_MOTION_REPEATS: usize = 5;
const EVENT_CAPACITY: usize = 256;

/// Motor lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MotorState {
    /// No port open
    Disconnected,
    /// Port open, nothing sent yet
    Connected,
    /// Motor settings written
    InitializedSettings,
    /// Smooth-motion workaround done
    InitializedSmoothMotion,
    /// Driving to the upper limit to zero the coordinates
    InitializingCoordinatesMoveToZero,
    /// Seeking the home switch
    InitializingCoordinatesCalibrateHome,
    /// Coordinate initialization stopped; waiting for the motor to halt
    AbortingCoordinateInit,
    /// Initialized and idle
    Ready,
    /// Executing a move
    Moving,
}

impl MotorState {
    /// True in the two states where the motor is homing.
    pub fn is_initializing_coordinates(self) -> bool {
        matches!(
            self,
            MotorState::InitializingCoordinatesMoveToZero
                | MotorState::InitializingCoordinatesCalibrateHome
        )
    }

    /// True while the motor may be in motion under our command.
    pub fn is_moving(self) -> bool {
        self.is_initializing_coordinates() || self == MotorState::Moving
    }
}

impl fmt::Display for MotorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            MotorState::Disconnected => "disconnected",
            MotorState::Connected => "connected",
            MotorState::InitializedSettings => "settings initialized",
            MotorState::InitializedSmoothMotion => "smooth motion initialized",
            MotorState::InitializingCoordinatesMoveToZero => "moving to zero",
            MotorState::InitializingCoordinatesCalibrateHome => "calibrating home",
            MotorState::AbortingCoordinateInit => "aborting coordinate initialization",
            MotorState::Ready => "ready",
            MotorState::Moving => "moving",
        };
        f.write_str(text)
    }
}

/// Why the motor stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoppedMovingReason {
    /// A move finished
    Normal,
    /// Coordinate initialization finished; the motor is ready
    Initialized,
    /// Coordinate initialization was stopped
    InitializationAborted,
}

/// Notifications published by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MotorEvent {
    /// The device stopped answering position queries and was disconnected
    ConnectionLost,
    /// The motor came to rest
    StoppedMoving(StoppedMovingReason),
    /// A new position was read
    PositionChanged(i64),
    /// The firmware ran away during home calibration; restart required
    DeviceMisbehavior(String),
}

/// Everything guarded by the controller lock.
pub(crate) struct ControllerCore {
    pub(crate) state: MotorState,
    pub(crate) position: i64,
    pub(crate) settings: MotorSettings,
    pub(crate) connection: ConnectionConfig,
    pub(crate) transport: TransportSession,
    pub(crate) fault: Option<String>,
}

impl ControllerCore {
    pub(crate) fn set_state(&mut self, state: MotorState) {
        if self.state != state {
            tracing::info!(target: "silverpak::controller", from = %self.state, to = %state, "Motor state changed");
            self.state = state;
        }
    }

    fn ensure_healthy(&self) -> Result<()> {
        match &self.fault {
            Some(reason) => Err(SilverpakError::DeviceMisbehavior(reason.clone())),
            None => Ok(()),
        }
    }

    fn address(&self) -> Result<DriverAddress> {
        self.transport
            .target()
            .map(|t| t.driver_address)
            .ok_or_else(|| SilverpakError::invalid_state("Connection is not active."))
    }

    /// Frame `commands` for the connected driver and write them.
    pub(crate) async fn send(&mut self, commands: &str, delay_factor: f32) -> Result<()> {
        let message = generate_message(self.address()?, commands);
        self.transport.write(&message, delay_factor).await
    }

    /// Frame `commands`, write them and wait for the reply payload.
    pub(crate) async fn request(
        &mut self,
        commands: &str,
        delay_factor: f32,
    ) -> Result<Option<String>> {
        let message = generate_message(self.address()?, commands);
        self.transport
            .write_and_get_response(&message, delay_factor)
            .await
    }

    /// Pretend to be at the top, then drive to zero so the motor runs into
    /// its limit switch.
    pub(crate) async fn move_to_zero(&mut self) -> Result<()> {
        let commands = format!(
            "{}{}{}",
            generate_command(Command::SetPosition, self.settings.assumed_top_position()),
            generate_command(Command::SetEncoderRatio, self.settings.encoder_ratio),
            generate_command(Command::GoAbsolute, 0),
        );
        self.send(&commands, MOVE_TO_ZERO_DELAY_FACTOR).await?;
        self.set_state(MotorState::InitializingCoordinatesMoveToZero);
        Ok(())
    }

    /// Start the home-switch seek.
    pub(crate) async fn go_home(&mut self) -> Result<()> {
        let command = generate_command(Command::GoHome, self.settings.assumed_top_position());
        self.send(&command, COMMAND_DELAY_FACTOR).await
    }

    /// Send the terminate command.
    pub(crate) async fn terminate(&mut self) -> Result<()> {
        self.send(&generate_command(Command::TerminateCommand, ""), COMMAND_DELAY_FACTOR)
            .await
    }

    async fn go_to_position(&mut self, position: i64) -> Result<()> {
        self.ensure_healthy()?;
        if !matches!(self.state, MotorState::Ready | MotorState::Moving) {
            return Err(SilverpakError::invalid_state("Motor is not fully initialized."));
        }
        self.send(&generate_command(Command::GoAbsolute, position), COMMAND_DELAY_FACTOR)
            .await?;
        tracing::debug!(target: "silverpak::controller", position, "Move commanded");
        self.set_state(MotorState::Moving);
        Ok(())
    }
}

/// Adjustable settings list shared by full initialization and resend.
fn resend_command_list(settings: &MotorSettings) -> String {
    [
        generate_command(Command::SetHoldCurrent, settings.holding_current),
        generate_command(Command::SetRunningCurrent, settings.running_current),
        generate_command(Command::SetMotorPolarity, settings.motor_polarity),
        generate_command(Command::SetHomePolarity, settings.home_polarity),
        generate_command(
            Command::SetPositionCorrectionTolerance,
            settings.position_correction_tolerance,
        ),
        generate_command(
            Command::SetPositionCorrectionRetries,
            settings.position_correction_retries,
        ),
        generate_command(Command::SetEncoderRatio, 1000),
        generate_command(Command::SetVelocity, settings.velocity),
        generate_command(Command::SetAcceleration, settings.acceleration),
        generate_command(Command::SetEncoderRatio, settings.encoder_ratio),
    ]
    .concat()
}

/// Zero position, the adjustable settings, then position correction with
/// optical limit switches (mode 10).
fn full_init_command_list(settings: &MotorSettings) -> String {
    format!(
        "{}{}{}",
        generate_command(Command::SetPosition, 0),
        resend_command_list(settings),
        generate_command(Command::SetMode, 10),
    )
}

pub(crate) struct ControllerShared {
    pub(crate) core: Mutex<ControllerCore>,
    pub(crate) poller: Arc<PositionPoller>,
    pub(crate) events: broadcast::Sender<MotorEvent>,
    opener: Arc<dyn PortOpener>,
    transport_config: TransportConfig,
    poller_config: PollerConfig,
}

impl ControllerShared {
    pub(crate) fn publish(&self, event: MotorEvent) {
        tracing::debug!(target: "silverpak::controller", ?event, "Publishing event");
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Handle to one Silverpak 23CE. Clones share the same motor.
#[derive(Clone)]
pub struct MotorController {
    shared: Arc<ControllerShared>,
}

impl fmt::Debug for MotorController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MotorController")
            .field("transport", &self.shared.transport_config)
            .field("poller", &self.shared.poller_config)
            .finish_non_exhaustive()
    }
}

impl MotorController {
    /// Controller opening ports through `opener`, seeded from `config`.
    pub fn new(opener: Arc<dyn PortOpener>, config: &SilverpakConfig) -> Self {
        let (events, _rx) = broadcast::channel(EVENT_CAPACITY);
        let core = ControllerCore {
            state: MotorState::Disconnected,
            position: 0,
            settings: config.motor.clone(),
            connection: config.connection.clone(),
            transport: TransportSession::new(opener.clone(), &config.transport),
            fault: None,
        };
        Self {
            shared: Arc::new(ControllerShared {
                core: Mutex::new(core),
                poller: Arc::new(PositionPoller::new(config.poller.clone())),
                events,
                opener,
                transport_config: config.transport.clone(),
                poller_config: config.poller.clone(),
            }),
        }
    }

    /// Controller on real serial ports.
    #[cfg(feature = "serial")]
    pub fn from_config(config: &SilverpakConfig) -> Self {
        Self::new(Arc::new(super::serial::TokioSerialOpener), config)
    }

    /// Receive motor notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<MotorEvent> {
        self.shared.events.subscribe()
    }

    /// Connect to the configured port, baud rate and driver address.
    ///
    /// Returns `Ok(false)` if nothing answered.
    ///
    /// # Errors
    /// `InvalidOperationState` unless disconnected; `ArgumentInvalid` if any
    /// part of the connection target is unset.
    pub async fn connect(&self) -> Result<bool> {
        let mut core = self.shared.core.lock().await;
        core.ensure_healthy()?;
        if core.state != MotorState::Disconnected {
            return Err(SilverpakError::invalid_state(
                "Connection is already active. Make sure is_active() returns false before connecting.",
            ));
        }

        let target = match (
            core.connection.port_name.clone(),
            core.connection.baud_rate,
            core.connection.driver_address,
        ) {
            (Some(port_name), Some(baud_rate), Some(driver_address)) => TransportTarget {
                port_name,
                baud_rate,
                driver_address,
            },
            (None, _, _) => {
                return Err(SilverpakError::ArgumentInvalid(
                    "Port name must be set before connecting.".to_string(),
                ))
            }
            (_, None, _) => {
                return Err(SilverpakError::ArgumentInvalid(
                    "Baud rate must be set before connecting.".to_string(),
                ))
            }
            (_, _, None) => {
                return Err(SilverpakError::ArgumentInvalid(
                    "Driver address must be set before connecting.".to_string(),
                ))
            }
        };

        core.transport.set_target(target)?;
        let connected = core.transport.connect().await?;
        if connected {
            core.set_state(MotorState::Connected);
        } else {
            tracing::warn!(target: "silverpak::controller", connection = ?core.connection, "No Silverpak answered");
        }
        Ok(connected)
    }

    /// Search for a Silverpak and connect to the first one found.
    ///
    /// Unset parts of the connection target are searched over all values;
    /// on success they are replaced by the discovered ones.
    pub async fn find_and_connect(&self) -> Result<bool> {
        let mut core = self.shared.core.lock().await;
        core.ensure_healthy()?;
        if core.state != MotorState::Disconnected {
            return Err(SilverpakError::invalid_state(
                "Connection is already active. Make sure is_active() returns false before connecting.",
            ));
        }

        let mut scanner =
            DeviceScanner::new(self.shared.opener.clone(), self.shared.transport_config.clone());
        let ports = scanner
            .search_ports(
                core.connection.port_name.as_deref(),
                core.connection.baud_rate,
                core.connection.driver_address,
            )
            .await;

        for target in ports.iter().filter_map(|info| info.target()) {
            core.transport.set_target(target.clone())?;
            // Only fails if the device vanished since the scan
            if core.transport.connect().await? {
                core.connection = ConnectionConfig {
                    port_name: Some(target.port_name),
                    baud_rate: Some(target.baud_rate),
                    driver_address: Some(target.driver_address),
                };
                core.set_state(MotorState::Connected);
                return Ok(true);
            }
        }
        tracing::warn!(target: "silverpak::controller", searched = ports.len(), "No available Silverpak found");
        Ok(false)
    }

    /// Initialization step 1: write the motor settings. Does not move the motor.
    pub async fn initialize_motor_settings(&self) -> Result<()> {
        let mut core = self.shared.core.lock().await;
        core.ensure_healthy()?;
        if core.state != MotorState::Connected {
            return Err(SilverpakError::invalid_state(
                "Initialization methods must be called in the proper order.",
            ));
        }
        let commands = full_init_command_list(&core.settings);
        core.send(&commands, SETTINGS_DELAY_FACTOR).await?;
        core.set_state(MotorState::InitializedSettings);
        Ok(())
    }

    /// Apply changed motor settings. Does not move the motor.
    pub async fn resend_motor_settings(&self) -> Result<()> {
        let mut core = self.shared.core.lock().await;
        core.ensure_healthy()?;
        if core.state == MotorState::Disconnected {
            return Err(SilverpakError::invalid_state("Connection is not active."));
        }
        if core.state.is_moving() {
            return Err(SilverpakError::invalid_state(
                "Cannot resend motor settings while the motor is moving.",
            ));
        }
        let commands = resend_command_list(&core.settings);
        core.send(&commands, SETTINGS_DELAY_FACTOR).await
    }

    /// Initialization step 2: five single-microstep moves to get past a
    /// firmware quirk. Moves the motor up to five microsteps.
    pub async fn initialize_smooth_motion(&self) -> Result<()> {
        let mut core = self.shared.core.lock().await;
        core.ensure_healthy()?;
        if core.state != MotorState::InitializedSettings {
            return Err(SilverpakError::invalid_state(
                "Initialization methods must be called in the proper order.",
            ));
        }
        let step = generate_command(Command::GoPositive, 1);
        for _ in 0..SMOOTH_MOTION_REPEATS {
            core.send(&step, SMOOTH_MOTION_DELAY_FACTOR).await?;
        }
        core.set_state(MotorState::InitializedSmoothMotion);
        Ok(())
    }

    /// Initialization step 3: zero the coordinate system against the limit
    /// switch. Completion is reported as
    /// `StoppedMoving(Initialized)`; [`is_ready`](Self::is_ready) turns true.
    pub async fn initialize_coordinates(&self) -> Result<()> {
        {
            let mut core = self.shared.core.lock().await;
            core.ensure_healthy()?;
            if core.state != MotorState::InitializedSmoothMotion {
                return Err(SilverpakError::invalid_state(
                    "Initialization methods must be called in the proper order.",
                ));
            }
            core.move_to_zero().await?;
        }
        // The motor is moving now; start watching it
        poller::start(&self.shared).await;
        Ok(())
    }

    /// Stop the motor. Stopping during coordinate initialization aborts it.
    ///
    /// Allowed after a device-misbehavior fault; the fault stays latched.
    pub async fn stop_motor(&self) -> Result<()> {
        let mut core = self.shared.core.lock().await;
        if core.state == MotorState::Disconnected {
            return Err(SilverpakError::invalid_state("Connection is not active."));
        }
        core.terminate().await?;
        if core.state.is_initializing_coordinates() {
            core.set_state(MotorState::AbortingCoordinateInit);
        }
        Ok(())
    }

    /// Move to an absolute position. Requires a fully initialized motor.
    pub async fn go_to_position(&self, position: i64) -> Result<()> {
        self.shared.core.lock().await.go_to_position(position).await
    }

    /// Move to the upper limit (`positive`) or to zero.
    pub async fn go_infinite(&self, positive: bool) -> Result<()> {
        let mut core = self.shared.core.lock().await;
        let position = if positive {
            core.settings.max_position
        } else {
            0
        };
        core.go_to_position(position).await
    }

    /// Close the connection.
    ///
    /// Not allowed while the motor is moving. After a device-misbehavior
    /// fault this still closes the port, but the fault stays latched.
    pub async fn disconnect(&self) -> Result<()> {
        {
            let mut core = self.shared.core.lock().await;
            if core.fault.is_none() {
                if core.state == MotorState::Disconnected {
                    return Err(SilverpakError::invalid_state("Connection is not active."));
                }
                if core.state.is_moving() {
                    return Err(SilverpakError::invalid_state(
                        "Disconnecting while the motor is moving is not allowed.",
                    ));
                }
            }
            core.transport.disconnect().await;
            core.set_state(MotorState::Disconnected);
        }
        self.shared.poller.stop().await;
        Ok(())
    }

    /// Stop the poller and close the port regardless of state.
    ///
    /// Meant for shutdown paths; the motor is not stopped.
    pub async fn shutdown(&self) {
        self.shared.poller.stop().await;
        let mut core = self.shared.core.lock().await;
        core.transport.disconnect().await;
        core.set_state(MotorState::Disconnected);
    }

    /// Send a query and return its reply payload.
    ///
    /// Intended for read-only commands such as
    /// [`Command::QueryFirmwareVersion`].
    pub async fn query(&self, command: Command) -> Result<Option<String>> {
        let mut core = self.shared.core.lock().await;
        core.ensure_healthy()?;
        if core.state == MotorState::Disconnected {
            return Err(SilverpakError::invalid_state("Connection is not active."));
        }
        core.request(&generate_command(command, ""), COMMAND_DELAY_FACTOR)
            .await
    }

    /// Firmware version string reported by the driver.
    pub async fn firmware_version(&self) -> Result<Option<String>> {
        self.query(Command::QueryFirmwareVersion).await
    }

    /// True unless disconnected.
    pub async fn is_active(&self) -> bool {
        self.state().await != MotorState::Disconnected
    }

    /// True when initialized and idle.
    pub async fn is_ready(&self) -> bool {
        self.state().await == MotorState::Ready
    }

    /// Current state.
    pub async fn state(&self) -> MotorState {
        self.shared.core.lock().await.state
    }

    /// Last position read by the poller.
    pub async fn position(&self) -> i64 {
        self.shared.core.lock().await.position
    }

    /// Reason for a latched device-misbehavior fault.
    pub async fn fault(&self) -> Option<String> {
        self.shared.core.lock().await.fault.clone()
    }

    /// Current connection target; after `find_and_connect` the discovered one.
    pub async fn connection(&self) -> ConnectionConfig {
        self.shared.core.lock().await.connection.clone()
    }

    /// Set the port name (`None` searches all ports). Only while disconnected.
    pub async fn set_port_name(&self, port_name: Option<String>) -> Result<()> {
        let mut core = self.shared.core.lock().await;
        ensure_disconnected(&core)?;
        core.connection.port_name = port_name;
        Ok(())
    }

    /// Set the baud rate (`None` searches the candidates). Only while disconnected.
    pub async fn set_baud_rate(&self, baud_rate: Option<u32>) -> Result<()> {
        if baud_rate == Some(0) {
            return Err(SilverpakError::ArgumentInvalid(
                "Baud rate must be positive.".to_string(),
            ));
        }
        let mut core = self.shared.core.lock().await;
        ensure_disconnected(&core)?;
        core.connection.baud_rate = baud_rate;
        Ok(())
    }

    /// Set the driver address (`None` searches 1 to 16). Only while disconnected.
    pub async fn set_driver_address(&self, driver_address: Option<DriverAddress>) -> Result<()> {
        if let Some(address) = driver_address.filter(|a| !a.is_individual()) {
            return Err(SilverpakError::ArgumentInvalid(format!(
                "Driver address must name a single driver, got {address}."
            )));
        }
        let mut core = self.shared.core.lock().await;
        ensure_disconnected(&core)?;
        core.connection.driver_address = driver_address;
        Ok(())
    }

    /// Current motor settings.
    pub async fn settings(&self) -> MotorSettings {
        self.shared.core.lock().await.settings.clone()
    }

    /// Replace the motor settings. Takes effect on the next
    /// `initialize_motor_settings` or `resend_motor_settings`.
    pub async fn set_settings(&self, settings: MotorSettings) {
        self.shared.core.lock().await.settings = settings;
    }
}

fn ensure_disconnected(core: &ControllerCore) -> Result<()> {
    if core.state == MotorState::Disconnected {
        Ok(())
    } else {
        Err(SilverpakError::invalid_state(
            "Connection settings cannot change while connected.",
        ))
    }
}
