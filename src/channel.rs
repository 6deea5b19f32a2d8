//! Module for the CAN link between the bootloader and the tester
//!
//! The bootloader only ever puts frames onto the bus itself. Received frames are pushed into
//! [crate::Bootloader::on_can_frame] by whatever owns the CAN controller (an interrupt handler,
//! a socket reader loop, or a test).

/// Highest identifier representable with 11 bit (standard) addressing
pub const MAX_STANDARD_ID: u32 = 0x7FF;

/// Communication channel result
pub type ChannelResult<T> = Result<T, ChannelError>;

#[derive(Debug, thiserror::Error)]
/// Error produced by a communication channel
pub enum ChannelError {
    /// Underlying IO Error with channel
    #[error("IO error")]
    IOError(
        #[from]
        #[source]
        std::io::Error,
    ),
    /// Timeout when writing data to the channel
    #[error("timeout writing to channel")]
    WriteTimeout,
    /// The CAN controller has gone bus-off
    #[error("CAN controller is bus-off")]
    BusOff,
    /// The interface is not open
    #[error("channel's interface is not open")]
    InterfaceNotOpen,
    /// Frame cannot be put onto the bus
    #[error("invalid CAN frame. ID 0x{id:03X}, {len} bytes")]
    InvalidFrame {
        /// CAN ID of the frame
        id: u32,
        /// Payload length of the frame
        len: usize,
    },
    /// Payload does not fit into a single ISO-TP transfer
    #[error("payload of {0} bytes is too large for ISO-TP")]
    PayloadTooLarge(usize),
}

/// A classic CAN data frame with a standard identifier
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CanFrame {
    id: u32,
    dlc: u8,
    data: [u8; 8],
}

impl CanFrame {
    /// Creates a new CAN frame. Any data beyond 8 bytes is discarded
    pub fn new(id: u32, data: &[u8]) -> Self {
        let dlc = data.len().min(8);
        let mut buf = [0u8; 8];
        buf[..dlc].copy_from_slice(&data[..dlc]);
        Self {
            id,
            dlc: dlc as u8,
            data: buf,
        }
    }

    /// CAN ID of the frame
    pub fn get_address(&self) -> u32 {
        self.id
    }

    /// Data carried by the frame (DLC bytes)
    pub fn get_data(&self) -> &[u8] {
        &self.data[..self.dlc as usize]
    }

    /// True if the ID fits in 11 bits
    pub fn is_standard(&self) -> bool {
        self.id <= MAX_STANDARD_ID
    }
}

/// A channel able to put CAN frames onto the bus
pub trait CanChannel {
    /// Sends a single frame. Frames are queued in call order
    fn send_frame(&mut self, frame: &CanFrame) -> ChannelResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_truncates_to_eight_bytes() {
        let f = CanFrame::new(0x70F, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        assert_eq!(f.get_data(), &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(f.is_standard());
        assert!(!CanFrame::new(0x18DA_F110, &[]).is_standard());
    }
}
