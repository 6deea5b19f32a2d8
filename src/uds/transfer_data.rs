use automotive_diag::uds::UdsError;
use log::debug;

use super::{ServiceResult, SessionState, UdsServer, make_positive_reply, programming_failure};
use crate::hardware::{Flash, Hardware, pack_words};

impl UdsServer {
    /// Writes one block of the download.
    ///
    /// Block `n` (counted from 0, so past counter wraparound) lands at
    /// `base + n * block_data_len`. A repeat of the previous counter is acknowledged
    /// without writing again
    pub(crate) fn transfer_data<H: Hardware + ?Sized>(
        &mut self,
        req: &[u8],
        hw: &mut H,
    ) -> ServiceResult {
        self.require_session(SessionState::DownloadRequested)?;
        let block_len = self.options.block_data_len();
        let window = self.download.as_mut().ok_or(UdsError::RequestSequenceError)?;
        if req.len() < 3 {
            return Err(UdsError::IncorrectMessageLengthOrInvalidFormat);
        }
        let counter = req[1];
        let data = &req[2..];
        if window.last_counter == Some(counter) {
            debug!("Block {counter:02X} repeated, already written");
            return Ok(make_positive_reply(req[0], &[counter]));
        }
        if counter != window.expected_counter {
            return Err(UdsError::WrongBlockSequenceCounter);
        }
        if data.len() > block_len {
            return Err(UdsError::RequestOutOfRange);
        }
        let offset = window.blocks_written as u64 * block_len as u64;
        if offset + data.len() as u64 > window.len as u64 {
            return Err(UdsError::RequestOutOfRange);
        }
        let address = window.base + offset as u32;
        debug!("Block {counter:02X}: {} bytes to {address:08X}", data.len());
        hw.write_words(address, &pack_words(data))
            .map_err(programming_failure)?;
        window.blocks_written += 1;
        window.last_counter = Some(counter);
        window.expected_counter = counter.wrapping_add(1);
        Ok(make_positive_reply(req[0], &[counter]))
    }
}
