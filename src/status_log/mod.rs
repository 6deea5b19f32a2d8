//! Wear-leveled circular log of IAP status records
//!
//! The log is append only. Every status transition writes a fresh [IapStatusRecord] into the next
//! free slot, and the newest valid record is the authoritative upgrade state. Once the last slot
//! of the last sub-area has been used the whole region is erased and writing restarts at
//! sub-area 0, slot 0. Sub-areas and slots are numbered from 0.
//!
//! Records are only trusted if both their header and ender tags are intact. The per sub-area
//! bitmap is a hint that narrows the search: the bit of a group is cleared *before* any slot of
//! that group is programmed, so a set bit guarantees the group holds no data.

use log::{debug, error, info, warn};

use crate::hardware::{ERASED_WORD, Flash, FlashRegion, HardwareError};

mod layout;
mod record;

pub use layout::*;
pub use record::*;

/// Status log result
pub type LogResult<T> = Result<T, LogError>;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
/// Status log error
pub enum LogError {
    /// A sub-area claims to be in use but its table is inconsistent. The region must be erased
    #[error("status log sub-area {sub_area} is corrupt")]
    Corrupt {
        /// Index of the offending sub-area
        sub_area: usize,
    },
    /// The configured layout cannot hold the log
    #[error("invalid status log layout: {0}")]
    InvalidLayout(&'static str),
    /// Flash access failed
    #[error("status log flash access failed")]
    Hardware(
        #[from]
        #[source]
        HardwareError,
    ),
}

impl LogError {
    /// True if the underlying flash operation timed out
    pub fn is_timeout(&self) -> bool {
        matches!(self, LogError::Hardware(HardwareError::Timeout))
    }
}

/// A record together with where it was found
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Located {
    /// The record
    pub record: IapStatusRecord,
    /// Sub-area holding the record
    pub sub_area: usize,
    /// Slot within the sub-area
    pub slot: usize,
}

/// Accessor for the status log living in a [Flash] device
#[derive(Debug, Copy, Clone)]
pub struct WearLevelLog {
    layout: LogLayout,
}

// Mask that clears bitmap bits 0..=group
fn claim_mask(group: usize) -> u32 {
    u32::MAX.checked_shl(group as u32 + 1).unwrap_or(0)
}

impl WearLevelLog {
    /// Creates a log over `layout`
    pub fn new(layout: LogLayout) -> LogResult<Self> {
        layout.validate()?;
        Ok(Self { layout })
    }

    /// Layout of the log
    pub fn layout(&self) -> &LogLayout {
        &self.layout
    }

    fn read_slot<F: Flash + ?Sized>(
        &self,
        flash: &F,
        sub_area: usize,
        slot: usize,
    ) -> LogResult<[u8; RECORD_SIZE]> {
        let mut buf = [0u8; RECORD_SIZE];
        flash.read(self.layout.slot_addr(sub_area, slot), &mut buf)?;
        Ok(buf)
    }

    /// Number of claimed groups in a sub-area table, or [LogError::Corrupt]
    fn claimed_groups<F: Flash + ?Sized>(
        &self,
        flash: &F,
        sub_area: usize,
        map: u32,
    ) -> LogResult<usize> {
        let claimed = !map;
        let groups = claimed.trailing_ones();
        let tag = flash.read_word(self.layout.size_tag_addr(sub_area))?;
        if tag != SIZE_TAG
            || claimed.checked_shr(groups).unwrap_or(0) != 0
            || groups as usize > self.layout.groups_per_area()
        {
            error!(
                "Status log sub-area {sub_area} inconsistent. Bitmap {map:08X}, size tag {tag:08X}"
            );
            return Err(LogError::Corrupt { sub_area });
        }
        Ok(groups as usize)
    }

    /// Finds the newest valid record.
    ///
    /// Returns `Ok(None)` if no sub-area holds a valid record, and [LogError::Corrupt] if a
    /// sub-area in use has an inconsistent table
    pub fn read_latest<F: Flash + ?Sized>(&self, flash: &F) -> LogResult<Option<Located>> {
        for sub_area in (0..self.layout.sub_area_count).rev() {
            let map = flash.read_word(self.layout.bitmap_addr(sub_area))?;
            if map == ERASED_WORD {
                continue;
            }
            let groups = self.claimed_groups(flash, sub_area, map)?;
            let candidates =
                (groups * self.layout.slots_per_bit()).min(self.layout.slots_per_area());
            for slot in (0..candidates).rev() {
                let raw = self.read_slot(flash, sub_area, slot)?;
                if let Some(record) = IapStatusRecord::from_bytes(&raw) {
                    debug!("Latest status record at {sub_area}/{slot}: {record:?}");
                    return Ok(Some(Located {
                        record,
                        sub_area,
                        slot,
                    }));
                }
            }
            debug!("Sub-area {sub_area} claimed but holds no valid record");
        }
        Ok(None)
    }

    /// Erases the whole log region
    pub fn erase<F: Flash + ?Sized>(&self, flash: &mut F) -> LogResult<()> {
        info!("Erasing status log");
        flash.erase_region(FlashRegion::StatusLog)?;
        Ok(())
    }

    fn area_writable<F: Flash + ?Sized>(&self, flash: &F, sub_area: usize) -> LogResult<bool> {
        let map = flash.read_word(self.layout.bitmap_addr(sub_area))?;
        let tag = flash.read_word(self.layout.size_tag_addr(sub_area))?;
        if map == ERASED_WORD {
            return Ok(tag == ERASED_WORD || tag == SIZE_TAG);
        }
        Ok(self.claimed_groups(flash, sub_area, map).is_ok())
    }

    /// First blank slot at or after `start`, or [None] if the region has no blank slot left
    fn find_writable<F: Flash + ?Sized>(
        &self,
        flash: &F,
        start: (usize, usize),
    ) -> LogResult<Option<(usize, usize)>> {
        let mut pos = Some(start);
        let mut checked_area = None;
        while let Some((sub_area, slot)) = pos {
            if checked_area != Some(sub_area) {
                checked_area = Some(sub_area);
                if !self.area_writable(flash, sub_area)? {
                    warn!("Skipping unusable status log sub-area {sub_area}");
                    pos = self
                        .layout
                        .next_position(sub_area, self.layout.slots_per_area() - 1);
                    continue;
                }
            }
            if self.read_slot(flash, sub_area, slot)?.iter().all(|b| *b == 0xFF) {
                return Ok(Some((sub_area, slot)));
            }
            warn!("Status log slot {sub_area}/{slot} is not blank, skipping");
            pos = self.layout.next_position(sub_area, slot);
        }
        Ok(None)
    }

    fn program<F: Flash + ?Sized>(
        &self,
        flash: &mut F,
        sub_area: usize,
        slot: usize,
        record: &IapStatusRecord,
    ) -> LogResult<()> {
        let tag_addr = self.layout.size_tag_addr(sub_area);
        if flash.read_word(tag_addr)? == ERASED_WORD {
            flash.write_words(tag_addr, &[SIZE_TAG])?;
        }
        let map_addr = self.layout.bitmap_addr(sub_area);
        let map = flash.read_word(map_addr)?;
        let claimed = map & claim_mask(self.layout.group_of(slot));
        if claimed != map {
            flash.write_words(map_addr, &[claimed])?;
        }
        flash.write_words(self.layout.slot_addr(sub_area, slot), &record.to_words())?;
        Ok(())
    }

    /// Appends a record and returns the `(sub_area, slot)` it was written to.
    ///
    /// A corrupt log, or a log without any blank slot left, is erased first. Flash errors are
    /// passed through without retrying
    pub fn write<F: Flash + ?Sized>(
        &self,
        flash: &mut F,
        record: &IapStatusRecord,
    ) -> LogResult<(usize, usize)> {
        let start = match self.read_latest(flash) {
            Ok(Some(latest)) => self.layout.next_position(latest.sub_area, latest.slot),
            Ok(None) => Some((0, 0)),
            Err(LogError::Corrupt { sub_area }) => {
                warn!("Status log corrupt in sub-area {sub_area}, starting over");
                self.erase(flash)?;
                Some((0, 0))
            }
            Err(e) => return Err(e),
        };
        let target = match start {
            Some(start) => self.find_writable(flash, start)?,
            None => None,
        };
        let (sub_area, slot) = match target {
            Some(pos) => pos,
            None => {
                info!("Status log exhausted, wrapping around");
                self.erase(flash)?;
                (0, 0)
            }
        };
        self.program(flash, sub_area, slot, record)?;
        info!("Status log: wrote {record:?} to {sub_area}/{slot}");
        Ok((sub_area, slot))
    }

    /// Appends a record for `status`, carrying the version forward. Confirming an application
    /// ([IapStatus::AppDone]) bumps the version
    pub fn append_status<F: Flash + ?Sized>(
        &self,
        flash: &mut F,
        status: IapStatus,
        method: TransmitMethod,
    ) -> LogResult<IapStatusRecord> {
        let version = match self.read_latest(flash) {
            Ok(latest) => latest.map_or(0, |l| l.record.version),
            Err(LogError::Corrupt { .. }) => 0,
            Err(e) => return Err(e),
        };
        let version = match status {
            IapStatus::AppDone => version.wrapping_add(1),
            _ => version,
        };
        let record = IapStatusRecord::new(status, version, method);
        self.write(flash, &record)?;
        Ok(record)
    }
}
