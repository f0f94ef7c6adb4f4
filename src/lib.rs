//! # Silverpak 23CE Control Core
//!
//! Drives Lin Engineering Silverpak 23CE stepper motors over the DT serial
//! protocol: connection lifecycle, device discovery, the three-step
//! initialization sequence, motion commands and continuous position
//! tracking. Presentation layers (unit conversion, calibration files, GUIs)
//! sit on top of [`hardware::MotorController`] and its event channel.
//!
//! ## Crate Structure
//!
//! - **`protocol`**: DT protocol framing. Driver addresses, the command
//!   table, message generation and reply parsing. Pure functions, no I/O.
//! - **`hardware`**: the paced transport session, discovery scanner, motor
//!   state machine and background position poller, plus the mock serial
//!   port used by the tests.
//! - **`config`**: Figment-based configuration (TOML file plus
//!   `SILVERPAK_` environment overrides).
//! - **`error`**: the `SilverpakError` enum shared across the crate.
//! - **`tracing_init`**: `tracing-subscriber` setup for the binaries.

pub mod config;
pub mod error;
pub mod hardware;
pub mod protocol;
pub mod tracing_init;

pub use error::{Result, SilverpakError};
