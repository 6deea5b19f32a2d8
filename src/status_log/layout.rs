//! Geometry of the status log region
//!
//! ```text
//! sub-area n:  +--------+--------+--------+--------+-----+
//!              | bitmap |  size  | slot 0 | slot 1 | ... |
//!              |  u32   |  tag   | 20 B   | 20 B   |     |
//!              +--------+--------+--------+--------+-----+
//! ```
//!
//! Bit `g` of the bitmap is cleared once any slot of group `g` has been claimed. Each group
//! spans [LogLayout::slots_per_bit] consecutive slots.

use super::{LogError, LogResult, record::RECORD_SIZE};

/// Bytes of the table leading each sub-area
pub const TABLE_SIZE: usize = 8;
/// Expected size tag of an in-use sub-area
pub const SIZE_TAG: u32 = 0xFFFF_0000 | RECORD_SIZE as u32;
const BITMAP_BITS: usize = u32::BITS as usize;

/// Placement and size of the status log
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LogLayout {
    /// Address of the first sub-area
    pub base: u32,
    /// Size of each sub-area in bytes
    pub sub_area_size: usize,
    /// Number of sub-areas
    pub sub_area_count: usize,
}

impl Default for LogLayout {
    /// 16 KiB sector split into 1 KiB sub-areas
    fn default() -> Self {
        Self {
            base: 0x0800_C000,
            sub_area_size: 0x400,
            sub_area_count: 16,
        }
    }
}

impl LogLayout {
    /// Checks the layout can hold records at all
    pub fn validate(&self) -> LogResult<()> {
        if self.base % 4 != 0 || self.sub_area_size % 4 != 0 {
            return Err(LogError::InvalidLayout("sub-areas must be word aligned"));
        }
        if self.sub_area_count == 0 {
            return Err(LogError::InvalidLayout("at least one sub-area is needed"));
        }
        if self.sub_area_size < TABLE_SIZE + RECORD_SIZE {
            return Err(LogError::InvalidLayout("sub-area cannot hold a single record"));
        }
        if u32::try_from(self.region_len())
            .ok()
            .and_then(|len| self.base.checked_add(len))
            .is_none()
        {
            return Err(LogError::InvalidLayout("region exceeds address space"));
        }
        Ok(())
    }

    /// Total bytes of the region
    pub fn region_len(&self) -> usize {
        self.sub_area_size * self.sub_area_count
    }

    /// Record slots per sub-area
    pub fn slots_per_area(&self) -> usize {
        (self.sub_area_size - TABLE_SIZE) / RECORD_SIZE
    }

    /// Slots covered by one bitmap bit
    pub fn slots_per_bit(&self) -> usize {
        self.slots_per_area().div_ceil(BITMAP_BITS)
    }

    /// Bitmap bits in use for a full sub-area
    pub fn groups_per_area(&self) -> usize {
        self.slots_per_area().div_ceil(self.slots_per_bit())
    }

    /// Group a slot falls into
    pub fn group_of(&self, slot: usize) -> usize {
        slot / self.slots_per_bit()
    }

    pub(crate) fn area_addr(&self, sub_area: usize) -> u32 {
        self.base + (sub_area * self.sub_area_size) as u32
    }

    /// Address of a sub-area's usage bitmap
    pub fn bitmap_addr(&self, sub_area: usize) -> u32 {
        self.area_addr(sub_area)
    }

    /// Address of a sub-area's size tag
    pub fn size_tag_addr(&self, sub_area: usize) -> u32 {
        self.area_addr(sub_area) + 4
    }

    /// Address of a record slot
    pub fn slot_addr(&self, sub_area: usize, slot: usize) -> u32 {
        self.area_addr(sub_area) + (TABLE_SIZE + slot * RECORD_SIZE) as u32
    }

    /// Position following `(sub_area, slot)`. [None] once the last slot of the last sub-area is reached
    pub fn next_position(&self, sub_area: usize, slot: usize) -> Option<(usize, usize)> {
        if slot + 1 < self.slots_per_area() {
            Some((sub_area, slot + 1))
        } else if sub_area + 1 < self.sub_area_count {
            Some((sub_area + 1, 0))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_geometry() {
        let l = LogLayout::default();
        l.validate().unwrap();
        assert_eq!(l.region_len(), 0x4000);
        assert_eq!(l.slots_per_area(), 50);
        assert_eq!(l.slots_per_bit(), 2);
        assert_eq!(l.groups_per_area(), 25);
        assert_eq!(l.slot_addr(1, 2), 0x0800_C400 + 8 + 40);
    }

    #[test]
    fn small_areas_use_one_slot_per_bit() {
        let l = LogLayout {
            base: 0,
            sub_area_size: TABLE_SIZE + 3 * RECORD_SIZE,
            sub_area_count: 2,
        };
        assert_eq!(l.slots_per_bit(), 1);
        assert_eq!(l.next_position(0, 2), Some((1, 0)));
        assert_eq!(l.next_position(1, 1), Some((1, 2)));
        assert_eq!(l.next_position(1, 2), None);
    }

    #[test]
    fn rejects_unusable_layouts() {
        let tiny = LogLayout {
            base: 0,
            sub_area_size: 16,
            sub_area_count: 4,
        };
        assert!(matches!(tiny.validate(), Err(LogError::InvalidLayout(_))));
        let none = LogLayout {
            sub_area_count: 0,
            ..Default::default()
        };
        assert!(none.validate().is_err());
    }
}
