//! IAP status record as stored in flash

/// Marks the start of a valid record
pub const RECORD_HEADER: u32 = 0xA5A5_5A5A;
/// Marks the end of a valid record
pub const RECORD_ENDER: u32 = 0x5A5A_A5A5;
/// Words per record
pub const RECORD_WORDS: usize = 5;
/// Bytes per record
pub const RECORD_SIZE: usize = RECORD_WORDS * 4;

/// Upgrade state of the application
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    strum_macros::FromRepr,
    strum_macros::Display,
    strum_macros::EnumIter,
)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u32)]
pub enum IapStatus {
    /// No usable application. The application region may be erased or half written
    NoApp = 0,
    /// A download was started and has not been confirmed yet
    Downloading = 1,
    /// The application was downloaded and checked
    AppDone = 2,
}

/// Transport the last upgrade came in over
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    strum_macros::FromRepr,
    strum_macros::Display,
    strum_macros::EnumIter,
)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u32)]
pub enum TransmitMethod {
    /// USB CDC serial menu
    Usb = 0,
    /// UDS over CAN
    Can = 1,
}

/// A single entry of the status log
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IapStatusRecord {
    /// Upgrade state
    pub status: IapStatus,
    /// Firmware version counter, bumped every time an application is confirmed
    pub version: u32,
    /// Transport of the upgrade
    pub method: TransmitMethod,
}

impl IapStatusRecord {
    /// Creates a new record
    pub fn new(status: IapStatus, version: u32, method: TransmitMethod) -> Self {
        Self {
            status,
            version,
            method,
        }
    }

    /// Flash image of the record, header first
    pub fn to_words(&self) -> [u32; RECORD_WORDS] {
        [
            RECORD_HEADER,
            self.status as u32,
            self.version,
            self.method as u32,
            RECORD_ENDER,
        ]
    }

    /// Decodes a flash image. Returns [None] unless both tags match and every field is known
    pub fn from_words(words: &[u32; RECORD_WORDS]) -> Option<Self> {
        if words[0] != RECORD_HEADER || words[4] != RECORD_ENDER {
            return None;
        }
        Some(Self {
            status: IapStatus::from_repr(words[1])?,
            version: words[2],
            method: TransmitMethod::from_repr(words[3])?,
        })
    }

    /// Decodes a record from its raw little endian bytes
    pub fn from_bytes(bytes: &[u8; RECORD_SIZE]) -> Option<Self> {
        let mut words = [0u32; RECORD_WORDS];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Self::from_words(&words)
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn every_status_survives_flash_image() {
        for status in IapStatus::iter() {
            for method in TransmitMethod::iter() {
                let rec = IapStatusRecord::new(status, 7, method);
                assert_eq!(IapStatusRecord::from_words(&rec.to_words()), Some(rec));
            }
        }
    }

    #[test]
    fn torn_records_are_rejected() {
        let mut words = IapStatusRecord::new(IapStatus::AppDone, 3, TransmitMethod::Can).to_words();
        words[4] = 0xFFFF_FFFF;
        assert_eq!(IapStatusRecord::from_words(&words), None);
        words[4] = RECORD_ENDER;
        words[0] = 0xA5A5_0000;
        assert_eq!(IapStatusRecord::from_words(&words), None);
    }

    #[test]
    fn unknown_status_is_rejected() {
        let words = [RECORD_HEADER, 9, 0, 1, RECORD_ENDER];
        assert_eq!(IapStatusRecord::from_words(&words), None);
    }
}
