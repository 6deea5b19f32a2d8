//! The hardware module contains the platform adapter contract the bootloader core calls into,
//! as well as a simulated platform for bench testing

pub mod simulation;

#[cfg(all(feature = "socketcan", target_os = "linux"))]
pub mod socketcan;

use crate::channel::CanChannel;

/// Value of a flash word after erasing
pub const ERASED_WORD: u32 = 0xFFFF_FFFF;

/// Hardware API result
pub type HardwareResult<T> = Result<T, HardwareError>;

/// Erasable flash regions known to the bootloader
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, strum_macros::Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FlashRegion {
    /// Region holding the application firmware
    Application,
    /// Region holding the wear-leveled IAP status log
    StatusLog,
}

/// Word addressable NOR flash.
///
/// Programming can only clear bits. Erasing sets every byte of a region back to 0xFF.
pub trait Flash {
    /// Reads `buf.len()` bytes starting at `address`
    fn read(&self, address: u32, buf: &mut [u8]) -> HardwareResult<()>;

    /// Programs consecutive little endian words starting at `address`, which must be word aligned.
    /// Implementations verify what was programmed and report [HardwareError::VerifyMismatch]
    fn write_words(&mut self, address: u32, words: &[u32]) -> HardwareResult<()>;

    /// Erases an entire region. Reports [HardwareError::Timeout] if the erase did not finish
    fn erase_region(&mut self, region: FlashRegion) -> HardwareResult<()>;

    /// Reads a single little endian word
    fn read_word(&self, address: u32) -> HardwareResult<u32> {
        let mut buf = [0u8; 4];
        self.read(address, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }
}

/// The full set of platform capabilities the bootloader needs
pub trait Hardware: CanChannel + Flash {
    /// Hands control over to the application.
    ///
    /// On target this never returns if an application was started. An error means there
    /// was nothing valid to jump to and the bootloader keeps running
    fn jump_to_application(&mut self) -> HardwareResult<()>;

    /// Checks whether a complete, valid application image is present in the application region
    fn check_new_app_visible(&mut self) -> bool;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
/// Represents error that can be returned by the platform hardware
pub enum HardwareError {
    /// A flash program or erase operation did not complete in time
    #[error("flash operation timed out")]
    Timeout,
    /// Flash controller reported a program failure
    #[error("flash program failed at 0x{address:08X}")]
    WriteError {
        /// Address of the failing word
        address: u32,
    },
    /// Read back after programming does not match what was written
    #[error("flash verify mismatch at 0x{address:08X}")]
    VerifyMismatch {
        /// Address of the failing word
        address: u32,
    },
    /// Access outside of any flash region
    #[error("access of {len} bytes at 0x{address:08X} is outside of flash")]
    OutOfBounds {
        /// Start address of the access
        address: u32,
        /// Length of the access in bytes
        len: usize,
    },
    /// Program address is not word aligned
    #[error("flash address 0x{address:08X} is not word aligned")]
    Unaligned {
        /// Requested address
        address: u32,
    },
    /// No valid application could be started
    #[error("no valid application to jump to")]
    JumpFailed,
}

/// Packs bytes into little endian flash words. A trailing partial word is padded with 0xFF,
/// which leaves the unused bytes in their erased state
pub fn pack_words(data: &[u8]) -> Vec<u32> {
    data.chunks(4)
        .map(|chunk| {
            let mut word = [0xFF; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            u32::from_le_bytes(word)
        })
        .collect()
}
