//! Tester present, keeps the tester's view of the session alive

use automotive_diag::uds::UdsError;

use super::{ServiceResult, UdsServer, make_positive_reply};

/// Sub-function bit asking the server not to answer
pub const SUPPRESS_POS_RESPONSE: u8 = 0x80;

impl UdsServer {
    pub(crate) fn tester_present(&mut self, req: &[u8]) -> ServiceResult {
        if req.len() != 2 {
            return Err(UdsError::IncorrectMessageLengthOrInvalidFormat);
        }
        match req[1] {
            0x00 => Ok(make_positive_reply(req[0], &[0x00])),
            SUPPRESS_POS_RESPONSE => Ok(Vec::new()),
            _ => Err(UdsError::SubFunctionNotSupported),
        }
    }
}
