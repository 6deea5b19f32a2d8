//! Module for the UDS (Unified diagnostic services - ISO14229) server side of the bootloader
//!
//! Only the services needed to run a programming session are handled. Which of them may run is
//! gated by the [SessionState]:
//!
//! ```text
//!   NoSession --DiagnosticSessionControl(0x02)--> ActiveSession
//!   ActiveSession --RequestDownload--> DownloadRequested
//!   DownloadRequested --RequestTransferExit--> NoSession
//! ```
//!
//! Negative responses are `[0x7F, SID, NRC]`, positive responses echo the SID + 0x40.

use std::fmt::Display;

use log::{debug, error, info, warn};

pub use automotive_diag::uds::{UdsCommand, UdsError};

use crate::{
    hardware::Hardware,
    status_log::{TransmitMethod, WearLevelLog},
};

mod diagnostic_session_control;
mod ecu_reset;
mod read_data_by_identifier;
mod request_download;
mod routine_control;
mod tester_present;
mod transfer_data;
mod transfer_exit;

pub use diagnostic_session_control::*;
pub use ecu_reset::*;
pub use read_data_by_identifier::*;
pub use request_download::*;
pub use routine_control::*;
pub use tester_present::*;


/// Negative response service ID
pub const NEGATIVE_RESPONSE: u8 = 0x7F;

/// Programming session state. Not persisted, every boot starts in [SessionState::NoSession]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, strum_macros::Display)]
pub enum SessionState {
    /// Default state, only session independent services are accepted
    #[default]
    NoSession,
    /// Programming session entered
    ActiveSession,
    /// A download was accepted and TransferData is expected
    DownloadRequested,
}

/// Work the server defers until its response is on the bus
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum PendingOperation {
    /// Nothing to do
    #[default]
    None,
    /// Hand control to the application
    JumpToApplication,
}

/// Programmable part of the application flash. `end` is exclusive
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProgramRegion {
    /// First programmable address
    pub start: u32,
    /// One past the last programmable address
    pub end: u32,
}

impl ProgramRegion {
    /// Size of the region in bytes
    pub fn len(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    /// True if the region holds no bytes
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if `size` bytes starting at `address` lie inside the region
    pub fn contains(&self, address: u32, size: u32) -> bool {
        size > 0
            && address >= self.start
            && address
                .checked_add(size)
                .is_some_and(|end| end <= self.end)
    }
}

/// UDS server configuration
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UdsServerOptions {
    /// Region RequestDownload may target
    pub program_region: ProgramRegion,
    /// Largest TransferData message accepted (SID and counter included). Announced in the
    /// RequestDownload response
    pub transfer_block_size: u16,
    /// P2 server max reported in the session response (In milliseconds)
    pub p2_server_max_ms: u16,
    /// P2* server max reported in the session response (In milliseconds, sent in 10ms units)
    pub p2_star_server_max_ms: u32,
    /// Returned for [BOOT_SOFTWARE_IDENTIFICATION]
    pub boot_software_id: String,
    /// Transport recorded in status log entries written by the server
    pub transmit_method: TransmitMethod,
}

impl Default for UdsServerOptions {
    fn default() -> Self {
        Self {
            program_region: ProgramRegion {
                start: 0x0801_0000,
                end: 0x0804_0000,
            },
            transfer_block_size: 0x0402,
            p2_server_max_ms: 50,
            p2_star_server_max_ms: 5000,
            boot_software_id: "B1-0".into(),
            transmit_method: TransmitMethod::Can,
        }
    }
}

impl UdsServerOptions {
    /// Data bytes carried by a full TransferData block
    pub fn block_data_len(&self) -> usize {
        self.transfer_block_size.saturating_sub(2) as usize
    }
}

#[derive(Debug, Copy, Clone)]
struct DownloadWindow {
    base: u32,
    len: u32,
    expected_counter: u8,
    last_counter: Option<u8>,
    blocks_written: u32,
}

impl DownloadWindow {
    fn new(base: u32, len: u32) -> Self {
        Self {
            base,
            len,
            expected_counter: 1,
            last_counter: None,
            blocks_written: 0,
        }
    }
}

/// Result of a single service. An empty positive reply means the response is suppressed
pub(crate) type ServiceResult = Result<Vec<u8>, UdsError>;

/// Builds a positive response
pub fn make_positive_reply(sid: u8, data: &[u8]) -> Vec<u8> {
    let mut reply = Vec::with_capacity(1 + data.len());
    reply.push(sid.wrapping_add(0x40));
    reply.extend_from_slice(data);
    reply
}

/// Builds a negative response
pub fn make_nrc(sid: u8, nrc: UdsError) -> Vec<u8> {
    vec![NEGATIVE_RESPONSE, sid, nrc.into()]
}

// Flash and status log failures all surface as generalProgrammingFailure
fn programming_failure<E: Display>(err: E) -> UdsError {
    error!("Programming failure: {err}");
    UdsError::GeneralProgrammingFailure
}

/// UDS server handling a programming session
#[derive(Debug)]
pub struct UdsServer {
    options: UdsServerOptions,
    session: SessionState,
    download: Option<DownloadWindow>,
    pending: PendingOperation,
}

impl UdsServer {
    /// Creates a server in [SessionState::NoSession]
    pub fn new(options: UdsServerOptions) -> Self {
        Self {
            options,
            session: SessionState::NoSession,
            download: None,
            pending: PendingOperation::None,
        }
    }

    /// Current session
    pub fn session(&self) -> SessionState {
        self.session
    }

    /// Server configuration
    pub fn options(&self) -> &UdsServerOptions {
        &self.options
    }

    /// Takes the operation deferred by the last request
    pub fn take_pending(&mut self) -> PendingOperation {
        std::mem::take(&mut self.pending)
    }

    fn set_session(&mut self, session: SessionState) {
        if self.session != session {
            info!("Session {} -> {session}", self.session);
        }
        self.session = session;
        if session != SessionState::DownloadRequested {
            self.download = None;
        }
    }

    fn require_session(&self, session: SessionState) -> Result<(), UdsError> {
        if self.session == session {
            Ok(())
        } else {
            debug!("Service needs {session}, currently in {}", self.session);
            Err(UdsError::ConditionsNotCorrect)
        }
    }

    /// Processes a complete request and returns the response to send, if any
    pub fn process<H: Hardware + ?Sized>(
        &mut self,
        req: &[u8],
        hw: &mut H,
        log: &WearLevelLog,
    ) -> Option<Vec<u8>> {
        let &sid = req.first()?;
        debug!("UDS request {req:02X?}");
        let res = match UdsCommand::try_from(sid).ok() {
            Some(UdsCommand::DiagnosticSessionControl) => self.diagnostic_session_control(req),
            Some(UdsCommand::ECUReset) => self.ecu_reset(req),
            Some(UdsCommand::RoutineControl) => self.routine_control(req, hw, log),
            Some(UdsCommand::RequestDownload) => self.request_download(req, hw, log),
            Some(UdsCommand::TransferData) => self.transfer_data(req, hw),
            Some(UdsCommand::RequestTransferExit) => self.transfer_exit(req),
            Some(UdsCommand::TesterPresent) => self.tester_present(req),
            Some(UdsCommand::ReadDataByIdentifier) => self.read_data_by_identifier(req),
            _ => Err(UdsError::ServiceNotSupported),
        };
        let resp = res.unwrap_or_else(|nrc| {
            warn!("Negative response to service {sid:02X}: {nrc:?}");
            make_nrc(sid, nrc)
        });
        if resp.is_empty() {
            debug!("Response to {sid:02X} suppressed");
            None
        } else {
            debug!("UDS response {resp:02X?}");
            Some(resp)
        }
    }
}
