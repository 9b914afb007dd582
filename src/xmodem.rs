//! Sender-only XMODEM-1K, used to upload stubs and firmware to the
//! WinnerMicro bootloaders.
//!
//! The receiver opens the transfer by sending `'C'` (CRC-16 mode) or `NAK`
//! (arithmetic checksum mode). Every packet is `STX | blk | 255-blk |
//! 1024 data bytes | check`; the final packet is padded with a configurable
//! byte. After the last block, `EOT` is repeated until acknowledged.

use std::time::Duration;

use log::{debug, trace};

use crate::crc::crc16_xmodem;
use crate::{Error, Result};

pub const STX: u8 = 0x02;
pub const EOT: u8 = 0x04;
pub const ACK: u8 = 0x06;
pub const NAK: u8 = 0x15;
pub const CAN: u8 = 0x18;
pub const CRC_INITIATION: u8 = 0x43;

pub const BLOCK_SIZE: usize = 1024;

/// Minimal byte channel the sender runs over.
///
/// The progress hook fires on the channel after every acknowledged packet
/// so transports can surface transfer state without a second borrow of the
/// link.
pub trait BlockIo {
    fn send(&mut self, bytes: &[u8]) -> Result<()>;
    fn recv_byte(&mut self, timeout: Duration) -> Result<Option<u8>>;

    fn on_progress(&mut self, _progress: XmodemProgress) {}
}

/// Check mode selected by the receiver's initiation byte.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum CheckMode {
    Crc16,
    Checksum,
}

/// Progress snapshot emitted after every acknowledged packet.
#[derive(Debug, Clone, Copy)]
pub struct XmodemProgress {
    pub bytes_sent: usize,
    pub total: usize,
    pub block: u32,
    pub offset: usize,
}

pub struct XmodemSender {
    padding: u8,
    max_retries: u32,
    initiation_timeout: Duration,
    response_timeout: Duration,
}

impl Default for XmodemSender {
    fn default() -> XmodemSender {
        XmodemSender {
            padding: 0x1A,
            max_retries: 5,
            initiation_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(2),
        }
    }
}

impl XmodemSender {
    pub fn new() -> XmodemSender {
        XmodemSender::default()
    }

    /// Sets the byte used to pad the final block. The WM bootloaders
    /// require 0xFF.
    pub fn padding(mut self, padding: u8) -> Self {
        self.padding = padding;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Sends `payload` and drives the whole transfer to completion.
    pub fn send(&self, io: &mut impl BlockIo, payload: &[u8]) -> Result<()> {
        let mode = self.await_initiation(io)?;

        debug!("XMODEM receiver initiated transfer in {:?} mode", mode);

        let mut block_number: u8 = 1;
        let mut bytes_sent = 0usize;

        for (index, chunk) in payload.chunks(BLOCK_SIZE).enumerate() {
            let packet = self.build_packet(block_number, chunk, mode);

            self.send_packet(io, &packet)?;

            bytes_sent += chunk.len();
            block_number = block_number.wrapping_add(1);

            io.on_progress(XmodemProgress {
                bytes_sent,
                total: payload.len(),
                block: index as u32 + 1,
                offset: index * BLOCK_SIZE,
            });
        }

        self.send_eot(io)
    }

    fn await_initiation(&self, io: &mut impl BlockIo) -> Result<CheckMode> {
        match io.recv_byte(self.initiation_timeout)? {
            Some(CRC_INITIATION) => Ok(CheckMode::Crc16),
            Some(NAK) => Ok(CheckMode::Checksum),
            _ => Err(Error::XmodemInitiationFailed),
        }
    }

    fn build_packet(&self, block_number: u8, chunk: &[u8], mode: CheckMode) -> Vec<u8> {
        let mut packet = Vec::with_capacity(BLOCK_SIZE + 5);

        packet.push(STX);
        packet.push(block_number);
        packet.push(255 - block_number);
        packet.extend_from_slice(chunk);
        packet.resize(3 + BLOCK_SIZE, self.padding);

        match mode {
            CheckMode::Crc16 => {
                let crc = crc16_xmodem(&packet[3..]);
                packet.extend_from_slice(&crc.to_be_bytes());
            }
            CheckMode::Checksum => {
                let sum = packet[3..].iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
                packet.push(sum);
            }
        }

        packet
    }

    fn send_packet(&self, io: &mut impl BlockIo, packet: &[u8]) -> Result<()> {
        for attempt in 0..=self.max_retries {
            io.send(packet)?;

            match io.recv_byte(self.response_timeout)? {
                Some(ACK) => return Ok(()),
                Some(CAN) => return Err(Error::XmodemAborted("receiver sent CAN")),
                Some(NAK) | None => {
                    trace!("packet {} not acknowledged, attempt {}", packet[1], attempt + 1);
                }
                Some(other) => {
                    trace!("unexpected response {:#04x} to packet {}", other, packet[1]);
                }
            }
        }

        Err(Error::XmodemAborted("packet retries exhausted"))
    }

    fn send_eot(&self, io: &mut impl BlockIo) -> Result<()> {
        for _ in 0..=self.max_retries {
            io.send(&[EOT])?;

            if let Some(ACK) = io.recv_byte(self.response_timeout)? {
                return Ok(());
            }
        }

        Err(Error::XmodemAborted("EOT was never acknowledged"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted receiver: validates every packet and replies per script.
    struct FakeReceiver {
        responses: VecDeque<u8>,
        packets: Vec<Vec<u8>>,
        acks: u32,
        progress: Vec<XmodemProgress>,
    }

    impl FakeReceiver {
        fn with_responses(responses: &[u8]) -> FakeReceiver {
            FakeReceiver {
                responses: responses.iter().copied().collect(),
                packets: Vec::new(),
                acks: 0,
                progress: Vec::new(),
            }
        }
    }

    impl BlockIo for FakeReceiver {
        fn send(&mut self, bytes: &[u8]) -> Result<()> {
            self.packets.push(bytes.to_vec());
            Ok(())
        }

        fn recv_byte(&mut self, _timeout: Duration) -> Result<Option<u8>> {
            let response = self.responses.pop_front();

            if response == Some(ACK) {
                self.acks += 1;
            }

            Ok(response)
        }

        fn on_progress(&mut self, progress: XmodemProgress) {
            self.progress.push(progress);
        }
    }

    fn ack_script(packets: usize) -> Vec<u8> {
        let mut script = vec![CRC_INITIATION];
        script.extend(std::iter::repeat(ACK).take(packets + 1)); // packets + EOT
        script
    }

    #[test]
    fn it_should_ack_once_per_kilobyte_block() {
        let payload = vec![0x42u8; 2500];
        let mut receiver = FakeReceiver::with_responses(&ack_script(3));

        XmodemSender::new()
            .padding(0xFF)
            .send(&mut receiver, &payload)
            .unwrap();

        // ceil(2500 / 1024) data packets plus the EOT acknowledgement
        assert_eq!(receiver.acks, 4);
        assert_eq!(receiver.packets.last().unwrap(), &[EOT]);
    }

    #[test]
    fn it_should_pad_the_final_block() {
        let payload = vec![0x11u8; 1030];
        let mut receiver = FakeReceiver::with_responses(&ack_script(2));

        XmodemSender::new()
            .padding(0xFF)
            .send(&mut receiver, &payload)
            .unwrap();

        let last_data_packet = &receiver.packets[1];

        assert_eq!(last_data_packet.len(), 3 + 1024 + 2);
        assert_eq!(last_data_packet[0], STX);
        assert_eq!(last_data_packet[1], 2);
        assert_eq!(last_data_packet[2], 253);
        assert_eq!(&last_data_packet[3..9], &[0x11; 6]);
        assert!(last_data_packet[9..1027].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn it_should_append_a_crc16_in_crc_mode() {
        let payload = vec![0xA5u8; 1024];
        let mut receiver = FakeReceiver::with_responses(&ack_script(1));

        XmodemSender::new().send(&mut receiver, &payload).unwrap();

        let packet = &receiver.packets[0];
        let crc = crc16_xmodem(&packet[3..3 + 1024]);

        assert_eq!(&packet[3 + 1024..], &crc.to_be_bytes());
    }

    #[test]
    fn it_should_fall_back_to_arithmetic_checksums_on_nak() {
        let payload = vec![0x7Eu8; 10];
        let mut receiver = FakeReceiver::with_responses(&[NAK, ACK, ACK]);

        XmodemSender::new()
            .padding(0x00)
            .send(&mut receiver, &payload)
            .unwrap();

        let packet = &receiver.packets[0];

        assert_eq!(packet.len(), 3 + 1024 + 1);

        let sum = packet[3..3 + 1024]
            .iter()
            .fold(0u8, |acc, &b| acc.wrapping_add(b));

        assert_eq!(packet[1027], sum);
    }

    #[test]
    fn it_should_retry_on_nak_then_abort() {
        let payload = vec![0x00u8; 10];

        // Initiation, then nothing but NAKs
        let mut receiver = FakeReceiver::with_responses(&[CRC_INITIATION, NAK, NAK, NAK]);

        let result = XmodemSender::new()
            .max_retries(2)
            .send(&mut receiver, &payload);

        assert!(matches!(result, Err(Error::XmodemAborted(_))));
        assert_eq!(receiver.packets.len(), 3);
    }

    #[test]
    fn it_should_abort_when_the_receiver_cancels() {
        let payload = vec![0x00u8; 10];
        let mut receiver = FakeReceiver::with_responses(&[CRC_INITIATION, CAN]);

        let result = XmodemSender::new().send(&mut receiver, &payload);

        assert!(matches!(result, Err(Error::XmodemAborted(_))));
    }

    #[test]
    fn it_should_fail_without_initiation() {
        let payload = vec![0x00u8; 10];
        let mut receiver = FakeReceiver::with_responses(&[0x99]);

        let result = XmodemSender::new().send(&mut receiver, &payload);

        assert!(matches!(result, Err(Error::XmodemInitiationFailed)));
    }

    #[test]
    fn it_should_wrap_block_numbers() {
        let payload = vec![0x55u8; BLOCK_SIZE * 300];
        let mut receiver = FakeReceiver::with_responses(&ack_script(300));

        XmodemSender::new().send(&mut receiver, &payload).unwrap();

        assert_eq!(receiver.progress.len(), 300);
        assert_eq!(receiver.progress.last().unwrap().block, 300);
        // Packet 256 carries block number 1 again (1-based, wraps at 256)
        assert_eq!(receiver.packets[255][1], 0);
        assert_eq!(receiver.packets[256][1], 1);
    }
}
