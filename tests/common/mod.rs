#![allow(dead_code)]

use ecu_bootloader::{
    Bootloader, BootloaderOptions,
    channel::CanFrame,
    hardware::simulation::SimulationHardware,
};

pub const TESTER_ID: u32 = 0x707;
pub const ECU_ID: u32 = 0x70F;

/// Plays the tester side of the link against a simulated ECU
pub struct Tester {
    pub bootloader: Bootloader<SimulationHardware>,
    pub hw: SimulationHardware,
    pub options: BootloaderOptions,
}

impl Tester {
    pub fn new(options: BootloaderOptions) -> Self {
        let _ = env_logger::try_init();
        let hw = SimulationHardware::from_options(&options);
        let bootloader = Bootloader::new(hw.clone(), options.clone()).unwrap();
        Self {
            bootloader,
            hw,
            options,
        }
    }

    /// Simulates a reset: a fresh bootloader on the same flash
    pub fn power_cycle(&mut self) {
        self.hw.take_sent_frames();
        self.bootloader = Bootloader::new(self.hw.clone(), self.options.clone()).unwrap();
    }

    /// Puts one frame on the bus and returns whatever the ECU sent in reaction
    pub fn send_frame(&mut self, data: &[u8]) -> Vec<CanFrame> {
        self.bootloader
            .on_can_frame(&CanFrame::new(TESTER_ID, data))
            .unwrap();
        self.hw.take_sent_frames()
    }

    /// Segments `payload` like a tester would, checking the ECU's flow control on the way.
    /// Returns the frames sent after the last request frame
    pub fn send_request(&mut self, payload: &[u8]) -> Vec<CanFrame> {
        if payload.len() <= 7 {
            let mut sf = vec![payload.len() as u8];
            sf.extend_from_slice(payload);
            sf.resize(8, 0x00);
            return self.send_frame(&sf);
        }
        let len = payload.len();
        let mut ff = vec![0x10 | (len >> 8) as u8, len as u8];
        ff.extend_from_slice(&payload[..6]);
        let fc = self.send_frame(&ff);
        assert_eq!(fc.len(), 1, "expected flow control after first frame");
        assert_eq!(fc[0].get_data()[0], 0x30);
        let bs = fc[0].get_data()[1] as usize;

        let chunks: Vec<&[u8]> = payload[6..].chunks(7).collect();
        let mut sn = 1u8;
        let mut since_fc = 0;
        for (idx, chunk) in chunks.iter().enumerate() {
            let mut cf = vec![0x20 | sn];
            cf.extend_from_slice(chunk);
            let out = self.send_frame(&cf);
            if idx == chunks.len() - 1 {
                return out;
            }
            sn = (sn + 1) & 0x0F;
            since_fc += 1;
            if bs != 0 && since_fc == bs {
                assert_eq!(out.len(), 1, "expected flow control after block");
                assert_eq!(out[0].get_data()[0], 0x30);
                since_fc = 0;
            } else {
                assert!(out.is_empty(), "unexpected frames mid transfer: {out:02X?}");
            }
        }
        unreachable!()
    }

    /// Reassembles the ECU's response, sending a single flow control for multi frame responses
    pub fn read_response(&mut self, frames: Vec<CanFrame>) -> Option<Vec<u8>> {
        let first = frames.first()?;
        assert_eq!(first.get_address(), ECU_ID);
        let data = first.get_data();
        match data[0] >> 4 {
            0x0 => {
                assert_eq!(frames.len(), 1);
                let len = (data[0] & 0x0F) as usize;
                Some(data[1..1 + len].to_vec())
            }
            0x1 => {
                let total = (((data[0] & 0x0F) as usize) << 8) | data[1] as usize;
                let mut payload = data[2..].to_vec();
                let cfs = self.send_frame(&[0x30, 0x00, 0x00]);
                let mut sn = 1u8;
                for cf in cfs {
                    assert_eq!(cf.get_data()[0], 0x20 | sn);
                    payload.extend_from_slice(&cf.get_data()[1..]);
                    sn = (sn + 1) & 0x0F;
                }
                assert!(payload.len() >= total);
                payload.truncate(total);
                Some(payload)
            }
            pci => panic!("unexpected response frame type {pci:X}"),
        }
    }

    pub fn request(&mut self, payload: &[u8]) -> Option<Vec<u8>> {
        let frames = self.send_request(payload);
        self.read_response(frames)
    }
}

pub fn request_download(address: u32, size: u32) -> Vec<u8> {
    let mut req = vec![0x34, 0x00, 0x44];
    req.extend_from_slice(&address.to_be_bytes());
    req.extend_from_slice(&size.to_be_bytes());
    req
}
