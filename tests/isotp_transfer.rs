mod common;

use common::{ECU_ID, Tester, request_download};
use ecu_bootloader::{BootloaderOptions, uds::SessionState};

fn in_download(options: BootloaderOptions) -> Tester {
    let mut t = Tester::new(options);
    t.request(&[0x10, 0x02]).unwrap();
    assert_eq!(
        t.request(&request_download(0x0801_0000, 0x1000)).unwrap()[0],
        0x74
    );
    t
}

#[test]
fn responses_are_padded() {
    let mut t = Tester::new(BootloaderOptions::default());
    let frames = t.send_request(&[0x10, 0x02]);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].get_address(), ECU_ID);
    assert_eq!(
        frames[0].get_data(),
        &[0x06, 0x50, 0x02, 0x00, 0x32, 0x01, 0xF4, 0xCC]
    );
}

#[test]
fn responses_without_padding() {
    let mut options = BootloaderOptions::default();
    options.isotp.pad_frame = false;
    let mut t = Tester::new(options);
    let frames = t.send_request(&[0x3E, 0x00]);
    assert_eq!(frames[0].get_data(), &[0x02, 0x7E, 0x00]);
}

#[test]
fn other_ids_are_ignored() {
    let mut t = Tester::new(BootloaderOptions::default());
    let frame = ecu_bootloader::channel::CanFrame::new(0x7E0, &[0x02, 0x10, 0x02]);
    t.bootloader.on_can_frame(&frame).unwrap();
    assert!(t.hw.take_sent_frames().is_empty());
    assert_eq!(t.bootloader.session(), SessionState::NoSession);
}

#[test]
fn suppressed_response_sends_nothing() {
    let mut t = Tester::new(BootloaderOptions::default());
    assert!(t.send_request(&[0x3E, 0x80]).is_empty());
}

#[test]
fn full_size_transfer_block() {
    let mut t = in_download(BootloaderOptions::default());
    // 0x402 bytes: FF plus 146 consecutive frames, flow control every 30
    let mut req = vec![0x36, 0x01];
    req.extend((0..1024u32).map(|i| (i % 256) as u8));
    assert_eq!(t.request(&req), Some(vec![0x76, 0x01]));
    assert_eq!(t.hw.peek(0x0801_0000 + 1020, 4).unwrap(), vec![252, 253, 254, 255]);
}

#[test]
fn sequence_error_reports_and_recovers() {
    let mut t = in_download(BootloaderOptions::default());
    let fc = t.send_frame(&[0x10, 20, 0x36, 0x01, 1, 2, 3, 4]);
    assert_eq!(fc[0].get_data()[0], 0x30);
    // Sequence number 2 instead of 1
    let frames = t.send_frame(&[0x22, 5, 6, 7, 8, 9, 10, 11]);
    assert_eq!(frames.len(), 1);
    assert_eq!(
        frames[0].get_data(),
        &[0x03, 0x7F, 0x36, 0x71, 0xCC, 0xCC, 0xCC, 0xCC]
    );
    assert!(t.send_frame(&[0x21, 5, 6, 7, 8, 9, 10, 11]).is_empty());
    assert_eq!(t.bootloader.session(), SessionState::DownloadRequested);

    let mut req = vec![0x36, 0x01];
    req.extend(1..=18u8);
    assert_eq!(t.request(&req), Some(vec![0x76, 0x01]));
    assert_eq!(t.hw.peek(0x0801_0000, 4).unwrap(), vec![1, 2, 3, 4]);
}

#[test]
fn restarted_first_frame_replaces_transfer() {
    let mut t = in_download(BootloaderOptions::default());
    t.send_frame(&[0x10, 20, 0x36, 0x01, 0xEE, 0xEE, 0xEE, 0xEE]);
    t.send_frame(&[0x21, 0xEE, 0xEE, 0xEE, 0xEE, 0xEE, 0xEE, 0xEE]);
    let mut req = vec![0x36, 0x01];
    req.extend(1..=8u8);
    assert_eq!(t.request(&req), Some(vec![0x76, 0x01]));
    assert_eq!(
        t.hw.peek(0x0801_0000, 8).unwrap(),
        (1..=8u8).collect::<Vec<_>>()
    );
}

#[test]
fn oversized_request_gets_overflow() {
    let mut options = BootloaderOptions::default();
    options.isotp.rx_capacity = 64;
    options.uds.transfer_block_size = 0x22;
    let mut t = in_download(options);
    let frames = t.send_frame(&[0x10, 100, 0x36, 0x01, 0, 0, 0, 0]);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].get_data()[0], 0x32);
    // Nothing is buffered, so consecutive frames are dropped
    assert!(t.send_frame(&[0x21, 0, 0, 0, 0, 0, 0, 0]).is_empty());

    let mut req = vec![0x36, 0x01];
    req.extend([0xAB; 32]);
    assert_eq!(t.request(&req), Some(vec![0x76, 0x01]));
}
