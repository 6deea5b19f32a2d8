//! Diagnostic session control. Only the programming session is offered

use automotive_diag::uds::UdsError;

use super::{ServiceResult, SessionState, UdsServer, make_positive_reply};

/// Programming session sub-function
pub const PROGRAMMING_SESSION: u8 = 0x02;

impl UdsServer {
    /// Enters the programming session.
    ///
    /// The response carries the session parameter record: P2 server max in milliseconds
    /// and P2* server max in 10 millisecond units, both big endian
    pub(crate) fn diagnostic_session_control(&mut self, req: &[u8]) -> ServiceResult {
        if req.len() != 2 {
            return Err(UdsError::IncorrectMessageLengthOrInvalidFormat);
        }
        if req[1] != PROGRAMMING_SESSION {
            return Err(UdsError::RequestOutOfRange);
        }
        self.set_session(SessionState::ActiveSession);
        let p2 = self.options.p2_server_max_ms;
        let p2_star = u16::try_from(self.options.p2_star_server_max_ms / 10).unwrap_or(u16::MAX);
        let mut params = vec![req[1]];
        params.extend_from_slice(&p2.to_be_bytes());
        params.extend_from_slice(&p2_star.to_be_bytes());
        Ok(make_positive_reply(req[0], &params))
    }
}
