//! SocketCAN module
//!
//! Runs the bootloader on a Linux host against a real (or virtual) CAN interface. Flash is
//! still simulated, which makes this handy for testing flashing tools over `vcan0`:
//!
//! ```no_run
//! # fn main() -> ecu_bootloader::BootloaderResult<()> {
//! use ecu_bootloader::{Bootloader, BootloaderOptions, hardware::socketcan::SocketCanHardware};
//!
//! let options = BootloaderOptions::default();
//! let hw = SocketCanHardware::open("vcan0", &options)?;
//! let mut bootloader = Bootloader::new(hw, options)?;
//! bootloader.boot()?;
//! loop {
//!     if let Some(frame) = bootloader.hardware_mut().recv_frame()? {
//!         bootloader.on_can_frame(&frame)?;
//!     }
//! }
//! # }
//! ```

use std::time::Duration;

use log::debug;
use socketcan::{EmbeddedFrame, Id, Socket, StandardId};

use crate::{
    BootloaderOptions,
    channel::{CanChannel, CanFrame, ChannelError, ChannelResult},
};

use super::{Flash, FlashRegion, Hardware, HardwareResult, simulation::SimulationHardware};

/// How long [SocketCanHardware::recv_frame] blocks before giving up
const READ_TIMEOUT: Duration = Duration::from_millis(10);
const WRITE_TIMEOUT: Duration = Duration::from_millis(100);

/// Raw CAN socket paired with simulated flash
pub struct SocketCanHardware {
    socket: socketcan::CanSocket,
    flash: SimulationHardware,
}

impl SocketCanHardware {
    /// Opens `if_name`, with flash regions sized from `options`
    pub fn open(if_name: &str, options: &BootloaderOptions) -> ChannelResult<Self> {
        let socket = socketcan::CanSocket::open(if_name)?;
        socket.set_read_timeout(READ_TIMEOUT)?;
        socket.set_write_timeout(WRITE_TIMEOUT)?;
        debug!("Opened SocketCAN interface {if_name}");
        Ok(Self {
            socket,
            flash: SimulationHardware::from_options(options),
        })
    }

    /// The simulated flash, for inspecting what a tester programmed
    pub fn flash(&self) -> &SimulationHardware {
        &self.flash
    }

    /// Reads the next standard data frame. [None] if nothing arrived within the read timeout.
    /// Extended and remote frames are dropped
    pub fn recv_frame(&mut self) -> ChannelResult<Option<CanFrame>> {
        let read = match self.socket.read_frame() {
            Ok(f) => f,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        match read {
            socketcan::CanFrame::Data(f) => match f.id() {
                Id::Standard(id) => Ok(Some(CanFrame::new(id.as_raw() as u32, f.data()))),
                Id::Extended(_) => Ok(None),
            },
            socketcan::CanFrame::Error(_) => {
                debug!("Error frame received");
                Ok(None)
            }
            _ => Ok(None),
        }
    }
}

impl std::fmt::Debug for SocketCanHardware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketCanHardware")
            .field("flash", &self.flash)
            .finish_non_exhaustive()
    }
}

impl CanChannel for SocketCanHardware {
    fn send_frame(&mut self, frame: &CanFrame) -> ChannelResult<()> {
        let invalid = || ChannelError::InvalidFrame {
            id: frame.get_address(),
            len: frame.get_data().len(),
        };
        let id = u16::try_from(frame.get_address())
            .ok()
            .and_then(StandardId::new)
            .ok_or_else(invalid)?;
        let cf = socketcan::CanFrame::new(id, frame.get_data()).ok_or_else(invalid)?;
        self.socket.write_frame(&cf).map_err(|e| match e.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                ChannelError::WriteTimeout
            }
            _ => ChannelError::IOError(e),
        })
    }
}

impl Flash for SocketCanHardware {
    fn read(&self, address: u32, buf: &mut [u8]) -> HardwareResult<()> {
        self.flash.read(address, buf)
    }

    fn write_words(&mut self, address: u32, words: &[u32]) -> HardwareResult<()> {
        self.flash.write_words(address, words)
    }

    fn erase_region(&mut self, region: FlashRegion) -> HardwareResult<()> {
        self.flash.erase_region(region)
    }
}

impl Hardware for SocketCanHardware {
    fn jump_to_application(&mut self) -> HardwareResult<()> {
        self.flash.jump_to_application()
    }

    fn check_new_app_visible(&mut self) -> bool {
        self.flash.check_new_app_visible()
    }
}
