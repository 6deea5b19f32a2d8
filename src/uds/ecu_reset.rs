//! Provides the ECU reset service, which hands control to the application

use automotive_diag::uds::UdsError;
use log::info;

use super::{PendingOperation, ServiceResult, UdsServer, make_positive_reply};

/// Hard reset sub-function
pub const HARD_RESET: u8 = 0x01;

impl UdsServer {
    pub(crate) fn ecu_reset(&mut self, req: &[u8]) -> ServiceResult {
        if req.len() != 2 {
            return Err(UdsError::IncorrectMessageLengthOrInvalidFormat);
        }
        if req[1] != HARD_RESET {
            return Err(UdsError::RequestOutOfRange);
        }
        // The jump has to wait until the tester got its answer
        info!("ECU reset requested");
        self.pending = PendingOperation::JumpToApplication;
        Ok(make_positive_reply(req[0], &[req[1]]))
    }
}
