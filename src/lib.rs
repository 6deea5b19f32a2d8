#![warn(
    missing_docs,
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_numeric_casts,
    unused_import_braces,
    unused_qualifications,
    clippy::uninlined_format_args
)]

//! A crate which provides the core of an ECU bootloader that reflashes application firmware over CAN.
//!
//! ## Protocol stack
//!
//! ### ISO-TP (ISO15765-2)
//! Requests from the tester arrive as single CAN frames, or as a First frame followed by
//! Consecutive frames. The [isotp] codec reassembles them, answers with flow control, and segments
//! the bootloader's own responses back onto the bus.
//!
//! ### Unified diagnostic services (UDS)
//! ISO14229 - Only the subset of services needed for a programming session is implemented:
//! * DiagnosticSessionControl (programming session only)
//! * ECUReset (hard reset, which hands control to the application)
//! * RoutineControl (erase application / check new application)
//! * RequestDownload, TransferData and RequestTransferExit
//! * TesterPresent and ReadDataByIdentifier (boot software identification)
//!
//! Services are gated by an in-memory [uds::SessionState].
//!
//! ## Persistent state
//!
//! The state of an upgrade ([status_log::IapStatus]) survives power cycles in a wear-leveled circular
//! log kept in a dedicated flash region. See [status_log] for the on-flash layout.
//!
//! ## Hardware
//!
//! Everything platform specific (sending a CAN frame, programming and erasing flash, jumping to the
//! application) sits behind the [hardware::Hardware] trait. [hardware::simulation::SimulationHardware]
//! implements it in memory for bench testing, and the `socketcan` feature runs the bootloader
//! against a real CAN interface on Linux hosts.

use channel::ChannelError;
use hardware::HardwareError;
use status_log::LogError;

pub mod bootloader;
pub mod channel;
pub mod hardware;
pub mod isotp;
pub mod status_log;
pub mod uds;

pub use bootloader::{BootDecision, Bootloader, BootloaderOptions};

/// Bootloader result
pub type BootloaderResult<T> = Result<T, BootloaderError>;

#[derive(Debug, thiserror::Error)]
/// Bootloader error
pub enum BootloaderError {
    /// Error with the underlying CAN channel
    #[error("Bootloader CAN channel error")]
    ChannelError(
        #[from]
        #[source]
        ChannelError,
    ),
    /// Flash or platform hardware error
    #[error("Bootloader hardware error")]
    HardwareError(
        #[from]
        #[source]
        HardwareError,
    ),
    /// The IAP status log could not be read or written
    #[error("Bootloader status log error")]
    StatusLogError(
        #[from]
        #[source]
        LogError,
    ),
    /// A configuration value is invalid
    #[error("Bootloader configuration invalid: {0}")]
    InvalidConfig(&'static str),
}
