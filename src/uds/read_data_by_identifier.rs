//! Read data by identifier. Only the boot software identification is readable

use automotive_diag::uds::UdsError;

use super::{ServiceResult, UdsServer, make_positive_reply};

/// Boot software identification data identifier
pub const BOOT_SOFTWARE_IDENTIFICATION: u16 = 0xF180;

impl UdsServer {
    pub(crate) fn read_data_by_identifier(&mut self, req: &[u8]) -> ServiceResult {
        if req.len() != 3 {
            return Err(UdsError::IncorrectMessageLengthOrInvalidFormat);
        }
        match u16::from_be_bytes([req[1], req[2]]) {
            BOOT_SOFTWARE_IDENTIFICATION => {
                let mut data = req[1..3].to_vec();
                data.extend_from_slice(self.options.boot_software_id.as_bytes());
                Ok(make_positive_reply(req[0], &data))
            }
            _ => Err(UdsError::RequestOutOfRange),
        }
    }
}
