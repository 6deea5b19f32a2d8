//! ISO-TP (ISO15765-2) codec for the bootloader side of the link
//!
//! The codec reassembles tester requests and segments bootloader responses. It holds a single
//! reception context and a single transmission context, so only one transfer is in flight per
//! direction. Frames are put onto the bus through the [CanChannel] passed into each call.
//!
//! The protocol control information (PCI) lives in the upper nibble of the first byte:
//!
//! | Nibble | Frame |
//! |--|--|
//! | 0x0 | Single frame, lower nibble is the payload length |
//! | 0x1 | First frame, 12 bit total length, first 6 payload bytes |
//! | 0x2 | Consecutive frame, lower nibble is the sequence number |
//! | 0x3 | Flow control, lower nibble is the flow status |

use std::cmp::min;

use log::{debug, warn};

use crate::channel::{CanChannel, CanFrame, ChannelError, ChannelResult};

/// Largest payload a 12 bit first frame length can describe
pub const MAX_PAYLOAD_LEN: usize = 4095;

/// ISO-TP configuration options
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IsoTpSettings {
    /// Block size advertised to the tester in our flow control frames. 0 means no further flow control
    pub block_size: u8,
    /// Minimum separation time advertised to the tester (In milliseconds)
    pub st_min: u8,
    /// Pad frames to 8 bytes
    pub pad_frame: bool,
    /// Byte used for padding
    pub padding_byte: u8,
    /// Size of the reassembly buffer. Longer requests are refused with an overflow flow control
    pub rx_capacity: usize,
    /// Wait for the tester's flow control between blocks of consecutive frames when sending.
    /// If false, all consecutive frames are sent back to back
    pub honor_flow_control: bool,
}

impl Default for IsoTpSettings {
    fn default() -> Self {
        Self {
            block_size: 30,
            st_min: 8,
            pad_frame: true,
            padding_byte: 0xCC,
            rx_capacity: MAX_PAYLOAD_LEN,
            honor_flow_control: true,
        }
    }
}

/// Flow control status (lower nibble of a flow control frame)
#[derive(Debug, Copy, Clone, PartialEq, Eq, strum_macros::FromRepr, strum_macros::Display)]
#[repr(u8)]
pub enum FlowStatus {
    /// Continue to send
    ContinueToSend = 0,
    /// Wait for another flow control frame
    Wait = 1,
    /// Receiver cannot take the transfer
    Overflow = 2,
}

/// Something the codec hands up to the diagnostic layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsoTpEvent {
    /// A complete request was received
    Payload(Vec<u8>),
    /// A multi frame request was dropped because of a sequence error.
    /// `sid` is the first payload byte of the dropped request
    Aborted {
        /// Service ID of the dropped request
        sid: u8,
    },
}

#[derive(Debug, Default)]
struct IsoTpRxMemory {
    receiving: bool,
    data: Vec<u8>,
    max_size: usize,
    next_sn: u8,
    frames_since_fc: u8,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum IsoTpRxAction {
    None,
    Completed,
    SendFC,
    SequenceError,
}

impl IsoTpRxMemory {
    fn reset(&mut self) {
        self.data.clear();
        self.receiving = false;
        self.max_size = 0;
        self.frames_since_fc = 0;
    }

    fn add_start_frame(&mut self, total: usize, s: &[u8]) {
        self.reset();
        self.max_size = total;
        self.receiving = true;
        self.next_sn = 1;
        self.data.extend_from_slice(s);
    }

    fn add_consecutive_frame(&mut self, sn: u8, s: &[u8], block_size: u8) -> IsoTpRxAction {
        if sn != self.next_sn {
            return IsoTpRxAction::SequenceError;
        }
        let max_copy = min(self.max_size - self.data.len(), min(s.len(), 7));
        self.data.extend_from_slice(&s[..max_copy]);
        self.next_sn = (self.next_sn + 1) & 0x0F;
        self.frames_since_fc = self.frames_since_fc.wrapping_add(1);
        if self.data.len() >= self.max_size {
            IsoTpRxAction::Completed
        } else if block_size != 0 && self.frames_since_fc == block_size {
            self.frames_since_fc = 0;
            IsoTpRxAction::SendFC
        } else {
            IsoTpRxAction::None
        }
    }
}

#[derive(Debug)]
struct IsoTpTxMemory {
    data: Vec<u8>,
    current_pos: usize,
    current_pci: u8,
    awaiting_fc: bool,
    // Set by the tester
    fc_bs: u8,
    // Set by the tester. Recorded only, the codec has no clock
    fc_stmin: u8,
}

impl Default for IsoTpTxMemory {
    fn default() -> Self {
        Self {
            data: vec![],
            current_pos: 0,
            current_pci: 0x21,
            awaiting_fc: false,
            fc_bs: 0,
            fc_stmin: 0,
        }
    }
}

impl IsoTpTxMemory {
    fn reset(&mut self) {
        *self = Self::default();
    }

    fn transmitting(&self) -> bool {
        self.current_pos < self.data.len()
    }

    fn get_start_frame(&mut self, data: &[u8]) -> Vec<u8> {
        self.reset();
        self.data = data.to_vec();
        let mut tx = Vec::with_capacity(8);
        tx.push(0x10 | ((data.len() >> 8) & 0x0F) as u8);
        tx.push((data.len() & 0xFF) as u8);
        tx.extend_from_slice(&data[0..6]);
        self.current_pos = 6;
        tx
    }

    fn next_consecutive_frame(&mut self) -> Vec<u8> {
        let max_data = min(7, self.data.len() - self.current_pos);
        let mut tx = Vec::with_capacity(8);
        tx.push(self.current_pci);
        tx.extend_from_slice(&self.data[self.current_pos..self.current_pos + max_data]);
        self.current_pos += max_data;
        self.current_pci += 1;
        if self.current_pci == 0x30 {
            self.current_pci = 0x20;
        }
        tx
    }
}

/// ISO-TP codec with one reception and one transmission context
#[derive(Debug)]
pub struct IsoTpCodec {
    rx_id: u32,
    tx_id: u32,
    settings: IsoTpSettings,
    rx: IsoTpRxMemory,
    tx: IsoTpTxMemory,
}

impl IsoTpCodec {
    /// Creates a codec accepting frames on `rx_id` and answering on `tx_id`
    pub fn new(rx_id: u32, tx_id: u32, settings: IsoTpSettings) -> Self {
        Self {
            rx_id,
            tx_id,
            settings,
            rx: IsoTpRxMemory::default(),
            tx: IsoTpTxMemory::default(),
        }
    }

    /// True while a multi frame request is being reassembled
    pub fn is_receiving(&self) -> bool {
        self.rx.receiving
    }

    /// True while a multi frame response still has consecutive frames left to send
    pub fn is_transmitting(&self) -> bool {
        self.tx.transmitting()
    }

    /// Block size and separation time last requested by the tester
    pub fn peer_flow_control(&self) -> (u8, u8) {
        (self.tx.fc_bs, self.tx.fc_stmin)
    }

    fn send<C: CanChannel + ?Sized>(&self, can: &mut C, mut data: Vec<u8>) -> ChannelResult<()> {
        if self.settings.pad_frame {
            data.resize(8, self.settings.padding_byte);
        }
        let frame = CanFrame::new(self.tx_id, &data);
        debug!("ISOTP Out -> {:03X} {:02X?}", self.tx_id, frame.get_data());
        can.send_frame(&frame)
    }

    fn send_flow_control<C: CanChannel + ?Sized>(
        &self,
        can: &mut C,
        status: FlowStatus,
    ) -> ChannelResult<()> {
        let fc = vec![
            0x30 | status as u8,
            self.settings.block_size,
            self.settings.st_min,
        ];
        self.send(can, fc)
    }

    /// Feeds one received frame into the codec.
    ///
    /// Flow control frames owed to the tester (or consecutive frames released by the tester's
    /// flow control) are sent on `can` before returning
    pub fn on_frame<C: CanChannel + ?Sized>(
        &mut self,
        frame: &CanFrame,
        can: &mut C,
    ) -> ChannelResult<Option<IsoTpEvent>> {
        if frame.get_address() != self.rx_id {
            debug!(
                "Ignoring frame for ID {:03X}: {:02X?}",
                frame.get_address(),
                frame.get_data()
            );
            return Ok(None);
        }
        let data = frame.get_data();
        let Some(&pci) = data.first() else {
            warn!("Ignoring empty frame");
            return Ok(None);
        };
        debug!("ISOTP In <- {:03X} {data:02X?}", self.rx_id);
        match pci & 0xF0 {
            0x00 => Ok(self.on_single_frame(data)),
            0x10 => self.on_first_frame(data, can),
            0x20 => self.on_consecutive_frame(data, can),
            0x30 => self.on_flow_control(data, can).map(|_| None),
            _ => {
                warn!("Unsupported ISO-TP frame type {pci:02X}, ignoring");
                Ok(None)
            }
        }
    }

    fn on_single_frame(&mut self, data: &[u8]) -> Option<IsoTpEvent> {
        let len = (data[0] & 0x0F) as usize;
        if len == 0 || len > 7 || len >= data.len() {
            warn!("Invalid single frame {data:02X?}");
            return None;
        }
        if self.rx.receiving {
            warn!("Single frame interrupted multi frame reception");
        }
        self.rx.reset();
        Some(IsoTpEvent::Payload(data[1..1 + len].to_vec()))
    }

    fn on_first_frame<C: CanChannel + ?Sized>(
        &mut self,
        data: &[u8],
        can: &mut C,
    ) -> ChannelResult<Option<IsoTpEvent>> {
        if data.len() < 8 {
            warn!("Short first frame {data:02X?}");
            return Ok(None);
        }
        let total = ((((data[0] & 0x0F) as u16) << 8) | (data[1] as u16)) as usize;
        if total <= 7 {
            warn!("First frame declares {total} bytes, which fits a single frame. Ignoring");
            return Ok(None);
        }
        if total > self.settings.rx_capacity {
            warn!(
                "First frame declares {total} bytes, capacity is {}",
                self.settings.rx_capacity
            );
            self.rx.reset();
            self.send_flow_control(can, FlowStatus::Overflow)?;
            return Ok(None);
        }
        if self.rx.receiving {
            warn!("New first frame, dropping {} buffered bytes", self.rx.data.len());
        }
        self.rx.add_start_frame(total, &data[2..8]);
        self.send_flow_control(can, FlowStatus::ContinueToSend)?;
        Ok(None)
    }

    fn on_consecutive_frame<C: CanChannel + ?Sized>(
        &mut self,
        data: &[u8],
        can: &mut C,
    ) -> ChannelResult<Option<IsoTpEvent>> {
        if !self.rx.receiving {
            debug!("Consecutive frame without reception in progress, ignoring");
            return Ok(None);
        }
        let sn = data[0] & 0x0F;
        match self
            .rx
            .add_consecutive_frame(sn, &data[1..], self.settings.block_size)
        {
            IsoTpRxAction::None => Ok(None),
            IsoTpRxAction::SendFC => {
                self.send_flow_control(can, FlowStatus::ContinueToSend)?;
                Ok(None)
            }
            IsoTpRxAction::Completed => {
                let payload = std::mem::take(&mut self.rx.data);
                self.rx.reset();
                debug!("RX done!: {payload:02X?}");
                Ok(Some(IsoTpEvent::Payload(payload)))
            }
            IsoTpRxAction::SequenceError => {
                warn!(
                    "Consecutive frame sequence error: expected {}, got {sn}",
                    self.rx.next_sn
                );
                let sid = self.rx.data.first().copied().unwrap_or_default();
                self.rx.reset();
                Ok(Some(IsoTpEvent::Aborted { sid }))
            }
        }
    }

    fn on_flow_control<C: CanChannel + ?Sized>(
        &mut self,
        data: &[u8],
        can: &mut C,
    ) -> ChannelResult<()> {
        if !self.tx.awaiting_fc {
            debug!("Unsolicited flow control {data:02X?}, ignoring");
            return Ok(());
        }
        if data.len() < 3 {
            warn!("Short flow control frame {data:02X?}, ignoring");
            return Ok(());
        }
        match FlowStatus::from_repr(data[0] & 0x0F) {
            Some(FlowStatus::ContinueToSend) => {
                self.tx.fc_bs = data[1];
                self.tx.fc_stmin = data[2];
                self.tx.awaiting_fc = false;
                self.send_block(can)
            }
            Some(FlowStatus::Wait) => {
                debug!("Tester asked us to wait");
                Ok(())
            }
            Some(FlowStatus::Overflow) => {
                warn!("Tester cannot take {} bytes, aborting", self.tx.data.len());
                self.tx.reset();
                Ok(())
            }
            None => {
                warn!("Invalid flow status in {data:02X?}, aborting transmission");
                self.tx.reset();
                Ok(())
            }
        }
    }

    fn send_block<C: CanChannel + ?Sized>(&mut self, can: &mut C) -> ChannelResult<()> {
        let mut sent = 0usize;
        while self.tx.transmitting() {
            let block_done = self.tx.fc_bs != 0 && sent == self.tx.fc_bs as usize;
            if self.settings.honor_flow_control && block_done {
                debug!("Awaiting FC");
                self.tx.awaiting_fc = true;
                return Ok(());
            }
            let cf = self.tx.next_consecutive_frame();
            self.send(can, cf)?;
            sent += 1;
        }
        debug!("Tx done!");
        self.tx.reset();
        Ok(())
    }

    /// Segments and sends a payload to the tester.
    ///
    /// Payloads of up to 7 bytes go out as a single frame. Longer payloads send a first frame
    /// and, depending on [IsoTpSettings::honor_flow_control], either wait for the tester's
    /// flow control or send every consecutive frame straight away
    pub fn send_message<C: CanChannel + ?Sized>(
        &mut self,
        payload: &[u8],
        can: &mut C,
    ) -> ChannelResult<()> {
        if payload.is_empty() {
            return Ok(());
        }
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(ChannelError::PayloadTooLarge(payload.len()));
        }
        if self.tx.transmitting() {
            warn!("Dropping unfinished transmission of {} bytes", self.tx.data.len());
            self.tx.reset();
        }
        if payload.len() <= 7 {
            let mut sf = Vec::with_capacity(8);
            sf.push(payload.len() as u8);
            sf.extend_from_slice(payload);
            return self.send(can, sf);
        }
        let ff = self.tx.get_start_frame(payload);
        self.send(can, ff)?;
        if self.settings.honor_flow_control {
            self.tx.awaiting_fc = true;
            Ok(())
        } else {
            self.send_block(can)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Bus(Vec<CanFrame>);

    impl CanChannel for Bus {
        fn send_frame(&mut self, frame: &CanFrame) -> ChannelResult<()> {
            self.0.push(*frame);
            Ok(())
        }
    }

    fn codec() -> IsoTpCodec {
        IsoTpCodec::new(0x707, 0x70F, IsoTpSettings::default())
    }

    fn rx(codec: &mut IsoTpCodec, bus: &mut Bus, data: &[u8]) -> Option<IsoTpEvent> {
        codec.on_frame(&CanFrame::new(0x707, data), bus).unwrap()
    }

    #[test]
    fn single_frame_is_delivered() {
        let mut c = codec();
        let mut bus = Bus::default();
        assert_eq!(
            rx(&mut c, &mut bus, &[0x02, 0x10, 0x02, 0, 0, 0, 0, 0]),
            Some(IsoTpEvent::Payload(vec![0x10, 0x02]))
        );
        assert!(bus.0.is_empty());
    }

    #[test]
    fn other_can_ids_are_ignored() {
        let mut c = codec();
        let mut bus = Bus::default();
        rx(&mut c, &mut bus, &[0x10, 0x0A, 1, 2, 3, 4, 5, 6]);
        let foreign = CanFrame::new(0x7E0, &[0x21, 7, 8, 9, 10]);
        assert_eq!(c.on_frame(&foreign, &mut bus).unwrap(), None);
        assert!(c.is_receiving());
        assert_eq!(
            rx(&mut c, &mut bus, &[0x21, 7, 8, 9, 10]),
            Some(IsoTpEvent::Payload((1..=10).collect()))
        );
    }

    #[test]
    fn first_frame_sends_flow_control() {
        let mut c = codec();
        let mut bus = Bus::default();
        assert_eq!(rx(&mut c, &mut bus, &[0x10, 0x12, 1, 2, 3, 4, 5, 6]), None);
        assert_eq!(bus.0.len(), 1);
        assert_eq!(bus.0[0].get_address(), 0x70F);
        assert_eq!(
            bus.0[0].get_data(),
            &[0x30, 30, 8, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC]
        );
        assert_eq!(rx(&mut c, &mut bus, &[0x21, 7, 8, 9, 10, 11, 12, 13]), None);
        // Trailing padding beyond the declared length is discarded
        assert_eq!(
            rx(&mut c, &mut bus, &[0x22, 14, 15, 16, 17, 18, 19, 20]),
            Some(IsoTpEvent::Payload((1..=18).collect()))
        );
        assert!(!c.is_receiving());
    }

    #[test]
    fn flow_control_repeats_every_block() {
        let settings = IsoTpSettings {
            block_size: 2,
            ..Default::default()
        };
        let mut c = IsoTpCodec::new(0x707, 0x70F, settings);
        let mut bus = Bus::default();
        rx(&mut c, &mut bus, &[0x10, 45, 0, 0, 0, 0, 0, 0]);
        for sn in 1..=5u8 {
            assert_eq!(rx(&mut c, &mut bus, &[0x20 | sn, 0, 0, 0, 0, 0, 0, 0]), None);
        }
        // Initial FC plus one after every 2nd consecutive frame
        assert_eq!(bus.0.len(), 3);
        assert!(matches!(
            rx(&mut c, &mut bus, &[0x26, 0, 0, 0, 0, 0, 0, 0]),
            Some(IsoTpEvent::Payload(p)) if p.len() == 45
        ));
    }

    #[test]
    fn sequence_error_aborts_and_recovers() {
        let mut c = codec();
        let mut bus = Bus::default();
        rx(&mut c, &mut bus, &[0x10, 0x0A, 0x36, 0x01, 3, 4, 5, 6]);
        assert_eq!(
            rx(&mut c, &mut bus, &[0x22, 7, 8, 9, 10]),
            Some(IsoTpEvent::Aborted { sid: 0x36 })
        );
        assert!(!c.is_receiving());
        // Rest of the aborted transfer is ignored
        assert_eq!(rx(&mut c, &mut bus, &[0x21, 7, 8, 9, 10]), None);
        rx(&mut c, &mut bus, &[0x10, 0x08, 1, 2, 3, 4, 5, 6]);
        assert_eq!(
            rx(&mut c, &mut bus, &[0x21, 7, 8]),
            Some(IsoTpEvent::Payload((1..=8).collect()))
        );
    }

    #[test]
    fn sequence_number_wraps() {
        let mut c = codec();
        let mut bus = Bus::default();
        // 6 + 17 * 7 = 125 bytes needs sequence numbers 1..=15, 0, 1
        rx(&mut c, &mut bus, &[0x10, 125, 0, 0, 0, 0, 0, 0]);
        let mut result = None;
        for i in 1..=17u8 {
            result = rx(&mut c, &mut bus, &[0x20 | (i & 0x0F), i, i, i, i, i, i, i]);
        }
        match result {
            Some(IsoTpEvent::Payload(p)) => {
                assert_eq!(p.len(), 125);
                assert_eq!(p[124], 17);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn oversized_first_frame_gets_overflow() {
        let settings = IsoTpSettings {
            rx_capacity: 0xFF,
            ..Default::default()
        };
        let mut c = IsoTpCodec::new(0x707, 0x70F, settings);
        let mut bus = Bus::default();
        assert_eq!(rx(&mut c, &mut bus, &[0x11, 0x00, 0, 0, 0, 0, 0, 0]), None);
        assert_eq!(bus.0[0].get_data()[0], 0x32);
        assert!(!c.is_receiving());
    }

    #[test]
    fn short_response_is_single_frame() {
        let mut c = codec();
        let mut bus = Bus::default();
        c.send_message(&[0x76, 0x01], &mut bus).unwrap();
        assert_eq!(
            bus.0,
            vec![CanFrame::new(
                0x70F,
                &[0x02, 0x76, 0x01, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC]
            )]
        );
    }

    #[test]
    fn long_response_waits_for_flow_control() {
        let mut c = codec();
        let mut bus = Bus::default();
        let payload: Vec<u8> = (0..30).collect();
        c.send_message(&payload, &mut bus).unwrap();
        assert_eq!(bus.0.len(), 1);
        assert_eq!(bus.0[0].get_data(), &[0x10, 30, 0, 1, 2, 3, 4, 5]);
        assert!(c.is_transmitting());

        // BS of 2, so only two frames are released
        rx(&mut c, &mut bus, &[0x30, 2, 0]);
        assert_eq!(bus.0.len(), 3);
        assert_eq!(bus.0[1].get_data(), &[0x21, 6, 7, 8, 9, 10, 11, 12]);
        assert_eq!(c.peer_flow_control(), (2, 0));

        rx(&mut c, &mut bus, &[0x31, 0, 0]);
        assert_eq!(bus.0.len(), 3);

        rx(&mut c, &mut bus, &[0x30, 0, 0]);
        assert_eq!(bus.0.len(), 5);
        assert_eq!(
            bus.0[4].get_data(),
            &[0x24, 27, 28, 29, 0xCC, 0xCC, 0xCC, 0xCC]
        );
        assert!(!c.is_transmitting());
    }

    #[test]
    fn overflow_flow_control_aborts_response() {
        let mut c = codec();
        let mut bus = Bus::default();
        c.send_message(&[0u8; 20], &mut bus).unwrap();
        rx(&mut c, &mut bus, &[0x32, 0, 0]);
        assert!(!c.is_transmitting());
        rx(&mut c, &mut bus, &[0x30, 0, 0]);
        assert_eq!(bus.0.len(), 1);
    }

    #[test]
    fn fire_and_forget_sends_everything() {
        let settings = IsoTpSettings {
            honor_flow_control: false,
            pad_frame: false,
            ..Default::default()
        };
        let mut c = IsoTpCodec::new(0x707, 0x70F, settings);
        let mut bus = Bus::default();
        let payload = vec![0xAA; 6 + 7 * 16];
        c.send_message(&payload, &mut bus).unwrap();
        assert_eq!(bus.0.len(), 17);
        let pcis: Vec<u8> = bus.0.iter().map(|f| f.get_data()[0]).collect();
        assert_eq!(pcis[15], 0x2F);
        assert_eq!(pcis[16], 0x20);
        assert!(!c.is_transmitting());
    }

    #[test]
    fn rejects_payload_beyond_twelve_bits() {
        let mut c = codec();
        let mut bus = Bus::default();
        assert!(matches!(
            c.send_message(&vec![0; MAX_PAYLOAD_LEN + 1], &mut bus),
            Err(ChannelError::PayloadTooLarge(4096))
        ));
    }
}
