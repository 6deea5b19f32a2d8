//! Simulation hardware for unit testing the bootloader
//!
//! [SimulationHardware] is a cheap handle onto shared state, so a test can keep one clone to
//! inspect (and sabotage) the platform while the [crate::Bootloader] owns another.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{
    BootloaderOptions,
    channel::{CanChannel, CanFrame, ChannelError, ChannelResult},
};

use super::{Flash, FlashRegion, Hardware, HardwareError, HardwareResult};

/// A single program operation observed by the simulated flash
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FlashWrite {
    /// Start address of the operation
    pub address: u32,
    /// Number of words requested
    pub words: usize,
}

#[derive(Debug)]
struct SimRegion {
    region: FlashRegion,
    start: u32,
    data: Vec<u8>,
}

impl SimRegion {
    fn offset_of(&self, address: u32, len: usize) -> Option<usize> {
        let offset = address.checked_sub(self.start)? as usize;
        (offset.checked_add(len)? <= self.data.len()).then_some(offset)
    }
}

#[derive(Debug, Default)]
struct SimState {
    regions: Vec<SimRegion>,
    sent: Vec<CanFrame>,
    writes: Vec<FlashWrite>,
    erases: Vec<FlashRegion>,
    jumps: usize,
    app_visible: bool,
    bus_off: bool,
    fail_next_write: Option<HardwareError>,
    fail_next_erase: Option<HardwareError>,
    torn_write: Option<usize>,
}

impl SimState {
    fn locate(&self, address: u32, len: usize) -> HardwareResult<(usize, usize)> {
        self.regions
            .iter()
            .enumerate()
            .find_map(|(idx, r)| r.offset_of(address, len).map(|off| (idx, off)))
            .ok_or(HardwareError::OutOfBounds { address, len })
    }
}

#[derive(Debug, Clone, Default)]
/// In-memory platform with NOR flash semantics and a recording CAN bus
pub struct SimulationHardware {
    state: Arc<RwLock<SimState>>,
}

impl SimulationHardware {
    /// Creates a platform with no flash regions
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a platform whose application and status log regions match `options`
    pub fn from_options(options: &BootloaderOptions) -> Self {
        let program = options.uds.program_region;
        Self::new()
            .with_region(FlashRegion::Application, program.start, program.len() as usize)
            .with_region(
                FlashRegion::StatusLog,
                options.status_log.base,
                options.status_log.region_len(),
            )
    }

    /// Adds an erased flash region
    pub fn with_region(self, region: FlashRegion, start: u32, len: usize) -> Self {
        self.state_mut().regions.push(SimRegion {
            region,
            start,
            data: vec![0xFF; len],
        });
        self
    }

    fn state(&self) -> RwLockReadGuard<'_, SimState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_mut(&self) -> RwLockWriteGuard<'_, SimState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every frame sent so far
    pub fn sent_frames(&self) -> Vec<CanFrame> {
        self.state().sent.clone()
    }

    /// Drains the frames sent so far
    pub fn take_sent_frames(&self) -> Vec<CanFrame> {
        std::mem::take(&mut self.state_mut().sent)
    }

    /// Every program operation attempted so far
    pub fn flash_writes(&self) -> Vec<FlashWrite> {
        self.state().writes.clone()
    }

    /// Every erase performed so far
    pub fn erases(&self) -> Vec<FlashRegion> {
        self.state().erases.clone()
    }

    /// Number of jump to application attempts
    pub fn jump_count(&self) -> usize {
        self.state().jumps
    }

    /// Sets what [Hardware::check_new_app_visible] reports. A visible app also makes jumps succeed
    pub fn set_app_visible(&self, visible: bool) {
        self.state_mut().app_visible = visible;
    }

    /// Makes every following [CanChannel::send_frame] fail with [ChannelError::BusOff]
    pub fn set_bus_off(&self, bus_off: bool) {
        self.state_mut().bus_off = bus_off;
    }

    /// Makes the next program operation fail with `err` without touching flash
    pub fn fail_next_write(&self, err: HardwareError) {
        self.state_mut().fail_next_write = Some(err);
    }

    /// Makes the next erase fail with `err` without touching flash
    pub fn fail_next_erase(&self, err: HardwareError) {
        self.state_mut().fail_next_erase = Some(err);
    }

    /// Simulates power loss during the next program operation: only the first `words`
    /// words reach flash and the operation reports [HardwareError::Timeout]
    pub fn tear_next_write(&self, words: usize) {
        self.state_mut().torn_write = Some(words);
    }

    /// Raw copy of flash contents, bypassing fault injection
    pub fn peek(&self, address: u32, len: usize) -> HardwareResult<Vec<u8>> {
        let state = self.state();
        let (idx, off) = state.locate(address, len)?;
        Ok(state.regions[idx].data[off..off + len].to_vec())
    }

    /// Raw overwrite of flash contents, ignoring program semantics. Used to fake corruption
    pub fn poke(&self, address: u32, bytes: &[u8]) -> HardwareResult<()> {
        let mut state = self.state_mut();
        let (idx, off) = state.locate(address, bytes.len())?;
        state.regions[idx].data[off..off + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

impl Flash for SimulationHardware {
    fn read(&self, address: u32, buf: &mut [u8]) -> HardwareResult<()> {
        let state = self.state();
        let (idx, off) = state.locate(address, buf.len())?;
        buf.copy_from_slice(&state.regions[idx].data[off..off + buf.len()]);
        Ok(())
    }

    fn write_words(&mut self, address: u32, words: &[u32]) -> HardwareResult<()> {
        if address % 4 != 0 {
            return Err(HardwareError::Unaligned { address });
        }
        let mut state = self.state_mut();
        let (idx, off) = state.locate(address, words.len() * 4)?;
        state.writes.push(FlashWrite {
            address,
            words: words.len(),
        });
        if let Some(err) = state.fail_next_write.take() {
            return Err(err);
        }
        let torn = state.torn_write.take();
        let programmed = torn.unwrap_or(words.len()).min(words.len());
        let data = &mut state.regions[idx].data;
        for (i, word) in words.iter().take(programmed).enumerate() {
            let pos = off + i * 4;
            let mut cell = [0u8; 4];
            for (j, b) in word.to_le_bytes().iter().enumerate() {
                data[pos + j] &= b;
                cell[j] = data[pos + j];
            }
            if u32::from_le_bytes(cell) != *word {
                return Err(HardwareError::VerifyMismatch {
                    address: address + (i * 4) as u32,
                });
            }
        }
        match torn {
            Some(_) => Err(HardwareError::Timeout),
            None => Ok(()),
        }
    }

    fn erase_region(&mut self, region: FlashRegion) -> HardwareResult<()> {
        let mut state = self.state_mut();
        if let Some(err) = state.fail_next_erase.take() {
            return Err(err);
        }
        state.erases.push(region);
        state
            .regions
            .iter_mut()
            .filter(|r| r.region == region)
            .for_each(|r| r.data.fill(0xFF));
        Ok(())
    }
}

impl CanChannel for SimulationHardware {
    fn send_frame(&mut self, frame: &CanFrame) -> ChannelResult<()> {
        let mut state = self.state_mut();
        if state.bus_off {
            return Err(ChannelError::BusOff);
        }
        state.sent.push(*frame);
        Ok(())
    }
}

impl Hardware for SimulationHardware {
    fn jump_to_application(&mut self) -> HardwareResult<()> {
        let mut state = self.state_mut();
        state.jumps += 1;
        if state.app_visible {
            Ok(())
        } else {
            Err(HardwareError::JumpFailed)
        }
    }

    fn check_new_app_visible(&mut self) -> bool {
        self.state().app_visible
    }
}
