//! Request download. Opens the download window TransferData writes into

use automotive_diag::uds::UdsError;
use log::{info, warn};

use super::{
    DownloadWindow, ServiceResult, SessionState, UdsServer, make_positive_reply,
    programming_failure,
};
use crate::{
    hardware::{Flash, FlashRegion, Hardware},
    status_log::{IapStatus, WearLevelLog},
};

/// Address and length format identifier: 4 byte address, 4 byte size
pub const ADDRESS_AND_LENGTH_FORMAT: u8 = 0x44;
/// Length format identifier of the response: 2 byte max block length
pub const LENGTH_FORMAT_IDENTIFIER: u8 = 0x20;

impl UdsServer {
    /// Request layout is `[0x34, dataFormat, 0x44, address (BE32), size (BE32)]`.
    /// Data format 0x00 (plain) and 0x01 are accepted, neither is compressed or encrypted
    pub(crate) fn request_download<H: Hardware + ?Sized>(
        &mut self,
        req: &[u8],
        hw: &mut H,
        log: &WearLevelLog,
    ) -> ServiceResult {
        self.require_session(SessionState::ActiveSession)?;
        if req.len() != 11 {
            return Err(UdsError::IncorrectMessageLengthOrInvalidFormat);
        }
        if !matches!(req[1], 0x00 | 0x01) || req[2] != ADDRESS_AND_LENGTH_FORMAT {
            return Err(UdsError::RequestOutOfRange);
        }
        let address = u32::from_be_bytes([req[3], req[4], req[5], req[6]]);
        let size = u32::from_be_bytes([req[7], req[8], req[9], req[10]]);
        if address % 4 != 0 || !self.options.program_region.contains(address, size) {
            warn!(
                "Download of {size} bytes to {address:08X} outside of {:08X?}",
                self.options.program_region
            );
            return Err(UdsError::RequestOutOfRange);
        }
        info!("Download of {size} bytes to {address:08X} requested");
        hw.erase_region(FlashRegion::Application)
            .map_err(programming_failure)?;
        log.append_status(hw, IapStatus::Downloading, self.options.transmit_method)
            .map_err(programming_failure)?;
        self.set_session(SessionState::DownloadRequested);
        self.download = Some(DownloadWindow::new(address, size));
        let [hi, lo] = self.options.transfer_block_size.to_be_bytes();
        Ok(make_positive_reply(
            req[0],
            &[LENGTH_FORMAT_IDENTIFIER, hi, lo],
        ))
    }
}
