//! Routine control for the bootloader's two routines: erasing the application and
//! confirming a freshly downloaded one

use automotive_diag::uds::UdsError;
use log::{info, warn};

use super::{ServiceResult, SessionState, UdsServer, make_positive_reply, programming_failure};
use crate::{
    hardware::{Flash, FlashRegion, Hardware},
    status_log::{IapStatus, WearLevelLog},
};

/// startRoutine control type
pub const START_ROUTINE: u8 = 0x01;
/// High byte shared by the bootloader routine identifiers
pub const ROUTINE_ID_HIGH: u8 = 0xFF;

/// Routine selected by the low byte of the routine identifier
#[derive(Debug, Copy, Clone, PartialEq, Eq, strum_macros::FromRepr, strum_macros::Display)]
#[repr(u8)]
pub enum BootRoutine {
    /// Erase the application region and record [IapStatus::NoApp]
    EraseApplication = 0x00,
    /// Confirm the downloaded application and record [IapStatus::AppDone]
    CheckApplication = 0x01,
}

impl UdsServer {
    /// Runs a routine. Request layout is `[0x31, 0x01, 0xFF, routine]`
    pub(crate) fn routine_control<H: Hardware + ?Sized>(
        &mut self,
        req: &[u8],
        hw: &mut H,
        log: &WearLevelLog,
    ) -> ServiceResult {
        self.require_session(SessionState::ActiveSession)?;
        let routine = match req {
            [_, START_ROUTINE, ROUTINE_ID_HIGH, routine] => BootRoutine::from_repr(*routine),
            _ => None,
        }
        .ok_or(UdsError::RequestOutOfRange)?;
        let method = self.options.transmit_method;
        info!("Starting routine {routine}");
        match routine {
            BootRoutine::EraseApplication => {
                hw.erase_region(FlashRegion::Application)
                    .map_err(programming_failure)?;
                log.append_status(hw, IapStatus::NoApp, method)
                    .map_err(programming_failure)?;
            }
            BootRoutine::CheckApplication => {
                if hw.check_new_app_visible() {
                    let rec = log
                        .append_status(hw, IapStatus::AppDone, method)
                        .map_err(programming_failure)?;
                    info!("Application confirmed, version {}", rec.version);
                } else {
                    warn!("No valid application found");
                    log.append_status(hw, IapStatus::NoApp, method)
                        .map_err(programming_failure)?;
                    return Err(UdsError::IncorrectMessageLengthOrInvalidFormat);
                }
            }
        }
        Ok(make_positive_reply(req[0], &req[1..]))
    }
}
