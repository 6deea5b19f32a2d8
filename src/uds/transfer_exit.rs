use automotive_diag::uds::UdsError;
use log::info;

use super::{ServiceResult, SessionState, UdsServer, make_positive_reply};

impl UdsServer {
    pub(crate) fn transfer_exit(&mut self, req: &[u8]) -> ServiceResult {
        self.require_session(SessionState::DownloadRequested)?;
        if req.len() != 1 {
            return Err(UdsError::RequestOutOfRange);
        }
        if let Some(window) = self.download {
            info!(
                "Download to {:08X} finished after {} blocks",
                window.base, window.blocks_written
            );
        }
        self.set_session(SessionState::NoSession);
        Ok(make_positive_reply(req[0], &[]))
    }
}
