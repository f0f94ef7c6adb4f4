//! DT protocol framing for the Silverpak 23CE.
//!
//! Protocol Overview:
//! - Request: `/` + [Address] + [Command list] + `R` + CR (ASCII encoded)
//! - Address: one byte selecting a driver, a group of drivers, or all drivers
//! - Response: `/0` + [Status byte] + [Data (optional)] + ETX
//! - Timing: half-duplex request-response, paced by the transport
//!
//! Everything in this module is pure: it builds outbound frames and inspects
//! inbound byte buffers without touching a port.
//!
//! ```
//! use silverpak::protocol::{generate_command, generate_message, Command, DriverAddress};
//!
//! let msg = generate_message(DriverAddress::Driver1, &generate_command(Command::GoAbsolute, "0"));
//! assert_eq!(msg, "/1A0R\r");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Start of every outbound frame.
pub const TX_START: &str = "/";
/// End of every outbound frame ("run" followed by carriage return).
pub const TX_END: &str = "R\r";
/// Marks the start of a reply addressed to the host.
pub const RX_START: &[u8] = b"/0";
/// Marks the end of a reply.
pub const RX_END: u8 = 0x03;

/// Data bits used on the wire.
pub const DATA_BITS: u8 = 8;
/// Stop bits used on the wire.
pub const STOP_BITS: u8 = 1;

/// Baud rates probed during discovery, in search order.
pub const CANDIDATE_BAUD_RATES: [u32; 3] = [9600, 19200, 38400];

/// Protocol byte selecting which daisy-chained driver(s) receive a frame.
///
/// Individual drivers are numbered 1..=16 and correspond to the hexadecimal
/// address switch on the unit (`1`..`F`, then `0` for the sixteenth).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum DriverAddress {
    /// Switch position 1.
    Driver1 = b'1',
    /// Switch position 2.
    Driver2 = b'2',
    /// Switch position 3.
    Driver3 = b'3',
    /// Switch position 4.
    Driver4 = b'4',
    /// Switch position 5.
    Driver5 = b'5',
    /// Switch position 6.
    Driver6 = b'6',
    /// Switch position 7.
    Driver7 = b'7',
    /// Switch position 8.
    Driver8 = b'8',
    /// Switch position 9.
    Driver9 = b'9',
    /// Switch position A.
    DriverA = b':',
    /// Switch position B.
    DriverB = b';',
    /// Switch position C.
    DriverC = b'<',
    /// Switch position D.
    DriverD = b'=',
    /// Switch position E.
    DriverE = b'>',
    /// Switch position F.
    DriverF = b'?',
    /// Switch position 0 (the sixteenth driver).
    Driver0 = b'@',
    /// Drivers 1 and 2.
    Drivers1And2 = b'A',
    /// Drivers 3 and 4.
    Drivers3And4 = b'C',
    /// Drivers 5 and 6.
    Drivers5And6 = b'E',
    /// Drivers 7 and 8.
    Drivers7And8 = b'G',
    /// Drivers 9 and 10.
    Drivers9And10 = b'I',
    /// Drivers 11 and 12.
    Drivers11And12 = b'K',
    /// Drivers 13 and 14.
    Drivers13And14 = b'M',
    /// Drivers 15 and 16.
    Drivers15And16 = b'O',
    /// Drivers 1 through 4.
    Drivers1To4 = b'Q',
    /// Drivers 5 through 8.
    Drivers5To8 = b'U',
    /// Drivers 9 through 12.
    Drivers9To12 = b'Y',
    /// Drivers 13 through 16.
    Drivers13To16 = b']',
    /// Broadcast to every driver on the bus.
    AllDrivers = b'_',
}

impl DriverAddress {
    /// Individually addressable drivers in discovery order (1..=16).
    pub const INDIVIDUAL: [DriverAddress; 16] = [
        DriverAddress::Driver1,
        DriverAddress::Driver2,
        DriverAddress::Driver3,
        DriverAddress::Driver4,
        DriverAddress::Driver5,
        DriverAddress::Driver6,
        DriverAddress::Driver7,
        DriverAddress::Driver8,
        DriverAddress::Driver9,
        DriverAddress::DriverA,
        DriverAddress::DriverB,
        DriverAddress::DriverC,
        DriverAddress::DriverD,
        DriverAddress::DriverE,
        DriverAddress::DriverF,
        DriverAddress::Driver0,
    ];

    const GROUPS: [DriverAddress; 13] = [
        DriverAddress::Drivers1And2,
        DriverAddress::Drivers3And4,
        DriverAddress::Drivers5And6,
        DriverAddress::Drivers7And8,
        DriverAddress::Drivers9And10,
        DriverAddress::Drivers11And12,
        DriverAddress::Drivers13And14,
        DriverAddress::Drivers15And16,
        DriverAddress::Drivers1To4,
        DriverAddress::Drivers5To8,
        DriverAddress::Drivers9To12,
        DriverAddress::Drivers13To16,
        DriverAddress::AllDrivers,
    ];

    /// The byte written after `/` in a frame.
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// The address as a one-character string.
    pub fn as_char(self) -> char {
        char::from(self.as_byte())
    }

    /// Parse the wire byte back into an address.
    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::INDIVIDUAL
            .iter()
            .chain(Self::GROUPS.iter())
            .copied()
            .find(|addr| addr.as_byte() == byte)
    }

    /// Address for driver `index` (1..=16), matching discovery order.
    pub fn from_index(index: usize) -> Option<Self> {
        index
            .checked_sub(1)
            .and_then(|i| Self::INDIVIDUAL.get(i))
            .copied()
    }

    /// Address for a hexadecimal switch digit (`0`-`9`, `A`-`F`, case-insensitive).
    pub fn from_hex_digit(digit: char) -> Option<Self> {
        match digit.to_digit(16)? {
            0 => Some(DriverAddress::Driver0),
            n => Self::from_index(n as usize),
        }
    }

    /// Hexadecimal switch digit for an individual driver, `None` for groups.
    pub fn hex_digit(self) -> Option<char> {
        let index = Self::INDIVIDUAL.iter().position(|a| *a == self)?;
        // Driver0 sits at the end of the discovery order
        let value = (index as u32 + 1) % 16;
        char::from_digit(value, 16).map(|c| c.to_ascii_uppercase())
    }

    /// True for a single driver, false for group and broadcast addresses.
    pub fn is_individual(self) -> bool {
        Self::INDIVIDUAL.contains(&self)
    }
}

impl fmt::Display for DriverAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.hex_digit() {
            Some(digit) => write!(f, "driver {digit}"),
            None => write!(f, "group '{}'", self.as_char()),
        }
    }
}

// Addresses are configured by their switch digit ("1".."F", "0") or, for
// groups, by the raw wire character.
impl Serialize for DriverAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let text = match self.hex_digit() {
            Some(digit) => digit.to_string(),
            None => self.as_char().to_string(),
        };
        serializer.serialize_str(&text)
    }
}

impl<'de> Deserialize<'de> for DriverAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Environment overrides arrive as integers for digits 0-9
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Digit(u8),
        }
        let text = match Raw::deserialize(deserializer)? {
            Raw::Text(text) => text,
            Raw::Digit(digit) => digit.to_string(),
        };
        let mut chars = text.chars();
        let (Some(c), None) = (chars.next(), chars.next()) else {
            return Err(serde::de::Error::custom(format!(
                "driver address must be a single character, got '{text}'"
            )));
        };
        DriverAddress::from_hex_digit(c)
            .or_else(|| u8::try_from(c).ok().and_then(DriverAddress::from_byte))
            .ok_or_else(|| serde::de::Error::custom(format!("unknown driver address '{c}'")))
    }
}

/// Every opcode understood by the Silverpak 23CE command set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    // Homing and positioning
    /// Home to the opto switch (`Z`).
    GoHome,
    /// Redefine the current position (`z`).
    SetPosition,
    /// Move to an absolute position (`A`).
    GoAbsolute,
    /// Set home switch polarity (`f`).
    SetHomePolarity,
    /// Move relative in the positive direction (`P`).
    GoPositive,
    /// Move relative in the negative direction (`D`).
    GoNegative,
    /// Set pulse jog distance (`B`).
    SetPulseJogDistance,
    /// Terminate the running command (`T`).
    TerminateCommand,
    /// Set motor direction polarity (`F`).
    SetMotorPolarity,

    // Velocity and acceleration
    /// Set slew velocity (`V`).
    SetVelocity,
    /// Set acceleration (`L`).
    SetAcceleration,

    // Current
    /// Set running current in percent (`m`).
    SetRunningCurrent,
    /// Set holding current in percent (`h`).
    SetHoldCurrent,

    // Looping and branching
    /// Begin a loop (`g`).
    BeginLoop,
    /// End a loop (`G`).
    EndLoop,
    /// Wait a number of milliseconds (`M`).
    Delay,
    /// Halt until an input condition (`H`).
    HaltUntil,
    /// Skip the next command if an input condition holds (`S`).
    SkipIf,
    /// Select a mode of operation (`n`).
    SetMode,

    // Position correction (encoder option only)
    /// Set encoder mode (`N`).
    SetEncoderMode,
    /// Set position correction tolerance (`aC`).
    SetPositionCorrectionTolerance,
    /// Set encoder ratio (`aE`).
    SetEncoderRatio,
    /// Set position correction retries (`au`).
    SetPositionCorrectionRetries,
    /// Recover from an encoder timeout (`r`).
    RecoverEncoderTimeout,

    // Program storage and recall
    /// Store the program that follows (`s`).
    StoreProgram,
    /// Execute a stored program (`e`).
    ExecuteStoredProgram,

    // Program execution
    /// Run the current command string (`R`).
    RunCurrentCommand,
    /// Repeat the current command string (`X`).
    RepeatCurrentCommand,

    // Microstepping
    /// Set microstep resolution (`j`).
    SetMicrostepResolution,
    /// Set microstep adjust (`o`).
    SetMicrostepAdjust,

    // Outputs
    /// Switch the driver outputs (`J`).
    SetOutputOnOff,

    // Queries
    /// Query motor position (`?0`).
    QueryMotorPosition,
    /// Query start velocity (`?1`).
    QueryStartVelocity,
    /// Query slew speed (`?2`).
    QuerySlewSpeed,
    /// Query stop speed (`?3`).
    QueryStopSpeed,
    /// Query input states (`?4`).
    QueryInputs,
    /// Query velocity-mode speed (`?5`).
    QueryCurrentVelocityModeSpeed,
    /// Query microstep size (`?6`).
    QueryMicrostepSize,
    /// Query microstep adjust (`?7`).
    QueryMicrostepAdjust,
    /// Query encoder position (`?8`).
    QueryEncoderPosition,
    /// Clear stored program memory (`?9`).
    ClearMemory,
    /// Query the current command string (`$`).
    QueryCurrentCommand,
    /// Query firmware version (`&`).
    QueryFirmwareVersion,
    /// Query controller status (`Q`). Side-effect free.
    QueryControllerStatus,
    /// Echo a number back (`p`).
    EchoNumber,

    // Baud control
    /// Change the baud rate (`b`).
    SetBaudRate,
}

impl Command {
    /// The opcode string written on the wire.
    pub fn opcode(self) -> &'static str {
        match self {
            Command::GoHome => "Z",
            Command::SetPosition => "z",
            Command::GoAbsolute => "A",
            Command::SetHomePolarity => "f",
            Command::GoPositive => "P",
            Command::GoNegative => "D",
            Command::SetPulseJogDistance => "B",
            Command::TerminateCommand => "T",
            Command::SetMotorPolarity => "F",

            Command::SetVelocity => "V",
            Command::SetAcceleration => "L",

            Command::SetRunningCurrent => "m",
            Command::SetHoldCurrent => "h",

            Command::BeginLoop => "g",
            Command::EndLoop => "G",
            Command::Delay => "M",
            Command::HaltUntil => "H",
            Command::SkipIf => "S",
            Command::SetMode => "n",

            Command::SetEncoderMode => "N",
            Command::SetPositionCorrectionTolerance => "aC",
            Command::SetEncoderRatio => "aE",
            Command::SetPositionCorrectionRetries => "au",
            Command::RecoverEncoderTimeout => "r",

            Command::StoreProgram => "s",
            Command::ExecuteStoredProgram => "e",

            Command::RunCurrentCommand => "R",
            Command::RepeatCurrentCommand => "X",

            Command::SetMicrostepResolution => "j",
            Command::SetMicrostepAdjust => "o",

            Command::SetOutputOnOff => "J",

            Command::QueryMotorPosition => "?0",
            Command::QueryStartVelocity => "?1",
            Command::QuerySlewSpeed => "?2",
            Command::QueryStopSpeed => "?3",
            Command::QueryInputs => "?4",
            Command::QueryCurrentVelocityModeSpeed => "?5",
            Command::QueryMicrostepSize => "?6",
            Command::QueryMicrostepAdjust => "?7",
            Command::QueryEncoderPosition => "?8",
            Command::ClearMemory => "?9",

            Command::QueryCurrentCommand => "$",
            Command::QueryFirmwareVersion => "&",
            Command::QueryControllerStatus => "Q",
            Command::EchoNumber => "p",

            Command::SetBaudRate => "b",
        }
    }
}

/// Command used to check that a driver is alive without side effects.
pub const SAFE_QUERY: Command = Command::QueryControllerStatus;

/// Opcode followed by its operand, ready to concatenate into a command list.
pub fn generate_command(command: Command, operand: impl fmt::Display) -> String {
    format!("{}{}", command.opcode(), operand)
}

/// Complete outbound frame for `recipient`.
pub fn generate_message(recipient: DriverAddress, command_list: &str) -> String {
    let mut message = String::with_capacity(command_list.len() + 4);
    message.push_str(TX_START);
    message.push(recipient.as_char());
    message.push_str(command_list);
    message.push_str(TX_END);
    message
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Span of the status byte plus data, i.e. what lies between `/0` and ETX.
fn reply_span(buffer: &[u8]) -> Option<&[u8]> {
    let start = find(buffer, RX_START)? + RX_START.len();
    let rest = &buffer[start..];
    let len = rest.iter().position(|b| *b == RX_END)?;
    Some(&rest[..len])
}

/// True once `buffer` holds `/0` followed (later) by ETX.
pub fn is_complete(buffer: &[u8]) -> bool {
    reply_span(buffer).is_some()
}

/// Payload of a complete reply with the status byte removed.
///
/// Returns `None` when the buffer is not complete.
pub fn trim(buffer: &[u8]) -> Option<String> {
    let span = reply_span(buffer)?;
    let data = span.get(1..).unwrap_or_default();
    Some(String::from_utf8_lossy(data).into_owned())
}
