//! Espressif serial bootloader protocol: command framing and the SPI
//! controller registers used for direct flash-ID reads.
//!
//! Commands travel SLIP-framed as `0x00 | op | len_lo | len_hi |
//! checksum[4 LE] | data`; responses as `0x01 | op | len_lo | len_hi |
//! value[4 LE] | data | status | error`. The checksum word is only
//! meaningful for the block-data commands, where it is the XOR of the
//! payload seeded with 0xEF.

use byteorder::{ByteOrder, LittleEndian};
use num_enum::IntoPrimitive;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive)]
#[repr(u8)]
pub enum Op {
    FlashBegin = 0x02,
    FlashData = 0x03,
    FlashEnd = 0x04,
    MemBegin = 0x05,
    MemEnd = 0x06,
    MemData = 0x07,
    Sync = 0x08,
    WriteReg = 0x09,
    ReadReg = 0x0A,
    SpiAttach = 0x0D,
    ReadFlashSlow = 0x0E,
    ChangeBaudrate = 0x0F,
    SpiFlashMd5 = 0x13,
    GetSecurityInfo = 0x14,
    ReadFlash = 0xD2,
}

/// The sync payload: `07 07 12 20` then 32 autobaud bytes.
pub fn sync_data() -> Vec<u8> {
    let mut data = vec![0x07, 0x07, 0x12, 0x20];
    data.extend_from_slice(&[0x55; 32]);
    data
}

/// Rolling XOR over block payloads, seeded with 0xEF.
pub fn checksum(data: &[u8]) -> u32 {
    data.iter().fold(0xEFu8, |acc, &b| acc ^ b) as u32
}

/// Builds the raw (pre-SLIP) command frame.
pub fn command_frame(op: Op, data: &[u8], checksum: u32) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8 + data.len());

    frame.push(0x00);
    frame.push(op.into());

    let mut len = [0u8; 2];
    LittleEndian::write_u16(&mut len, data.len() as u16);
    frame.extend_from_slice(&len);

    let mut checksum_bytes = [0u8; 4];
    LittleEndian::write_u32(&mut checksum_bytes, checksum);
    frame.extend_from_slice(&checksum_bytes);

    frame.extend_from_slice(data);

    frame
}

/// A decoded response packet, status tail stripped.
#[derive(Debug, Clone)]
pub struct Response {
    pub op: u8,
    pub value: u32,
    pub data: Vec<u8>,
    pub status: u8,
    pub error: u8,
}

impl Response {
    /// Parses a SLIP payload into a response. Returns `None` for packets
    /// that are not command responses (the stub streams raw data packets
    /// during fast reads).
    pub fn parse(payload: &[u8]) -> Option<Response> {
        if payload.len() < 10 || payload[0] != 0x01 {
            return None;
        }

        let declared = LittleEndian::read_u16(&payload[2..4]) as usize;
        let body = &payload[8..];

        if body.len() < 2 || body.len() != declared {
            return None;
        }

        Some(Response {
            op: payload[1],
            value: LittleEndian::read_u32(&payload[4..8]),
            data: body[..body.len() - 2].to_vec(),
            status: body[body.len() - 2],
            error: body[body.len() - 1],
        })
    }

    /// Converts a non-zero status tail into an error.
    pub fn check(&self, op: &'static str) -> Result<()> {
        if self.status != 0 {
            return Err(Error::ProtocolStatus {
                op,
                status: ((self.status as u16) << 8) | self.error as u16,
            });
        }

        Ok(())
    }
}

/// SPI controller register map; the base moved between generations.
#[derive(Debug, Clone, Copy)]
pub struct SpiRegs {
    pub cmd: u32,
    pub usr: u32,
    pub usr1: u32,
    pub usr2: u32,
    pub mosi_dlen: u32,
    pub miso_dlen: u32,
    pub w0: u32,
}

impl SpiRegs {
    pub const fn esp32() -> SpiRegs {
        const BASE: u32 = 0x3FF4_2000;

        SpiRegs {
            cmd: BASE,
            usr: BASE + 0x1C,
            usr1: BASE + 0x20,
            usr2: BASE + 0x24,
            mosi_dlen: BASE + 0x28,
            miso_dlen: BASE + 0x2C,
            w0: BASE + 0x80,
        }
    }

    pub const fn esp32_s3_c3() -> SpiRegs {
        const BASE: u32 = 0x6000_2000;

        SpiRegs {
            cmd: BASE,
            usr: BASE + 0x18,
            usr1: BASE + 0x1C,
            usr2: BASE + 0x20,
            mosi_dlen: BASE + 0x24,
            miso_dlen: BASE + 0x28,
            w0: BASE + 0x58,
        }
    }
}

/// `SPI_CMD_REG` execute bit.
pub const SPI_CMD_USR: u32 = 1 << 18;
/// `SPI_USR_REG` flags: command phase and MISO phase enables.
pub const SPI_USR_COMMAND: u32 = 1 << 31;
pub const SPI_USR_MISO: u32 = 1 << 28;

/// The chip-identification register shared by the ROMs.
pub const CHIP_MAGIC_REG: u32 = 0x4000_1000;

pub const MAGIC_ESP32: u32 = 0x00F0_1D83;
pub const MAGIC_ESP32S2: u32 = 0x0000_07C6;
pub const MAGIC_ESP8266: u32 = 0xFFF0_C101;
pub const MAGIC_ESP32C3_V0: u32 = 0x6921_506F;
pub const MAGIC_ESP32C3_V1: u32 = 0x1B31_506F;
pub const MAGIC_ESP32S3: u32 = 0x0000_0009;

#[cfg(test)]
mod tests {
    use super::*;
    use assert_hex::assert_eq_hex;

    #[test]
    fn it_should_build_a_sync_frame() {
        let frame = command_frame(Op::Sync, &sync_data(), 0);

        assert_eq_hex!(&frame[0..8], &[0x00, 0x08, 0x24, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(frame.len(), 8 + 36);
        assert_eq!(&frame[8..12], &[0x07, 0x07, 0x12, 0x20]);
        assert!(frame[12..].iter().all(|&b| b == 0x55));
    }

    #[test]
    fn it_should_xor_block_checksums_from_the_seed() {
        assert_eq!(checksum(&[]), 0xEF);
        assert_eq!(checksum(&[0xEF]), 0x00);
        assert_eq!(checksum(&[0x01, 0x02, 0x03]), (0xEFu8 ^ 0x01 ^ 0x02 ^ 0x03) as u32);
    }

    #[test]
    fn it_should_parse_a_response_packet() {
        // value 0x12345678, one data byte, clean status
        let mut payload = vec![0x01, 0x0A, 0x03, 0x00];
        payload.extend_from_slice(&0x1234_5678u32.to_le_bytes());
        payload.extend_from_slice(&[0xAB, 0x00, 0x00]);

        let response = Response::parse(&payload).unwrap();

        assert_eq!(response.op, 0x0A);
        assert_eq!(response.value, 0x1234_5678);
        assert_eq!(response.data, vec![0xAB]);
        response.check("ReadReg").unwrap();
    }

    #[test]
    fn it_should_reject_raw_data_packets() {
        // Fast-read data packets have no response header
        assert!(Response::parse(&[0x55; 64]).is_none());
    }

    #[test]
    fn it_should_surface_the_status_tail() {
        let mut payload = vec![0x01, 0x02, 0x02, 0x00];
        payload.extend_from_slice(&[0x00; 4]);
        payload.extend_from_slice(&[0x01, 0x05]);

        let response = Response::parse(&payload).unwrap();
        let err = response.check("FlashBegin").unwrap_err();

        assert!(matches!(err, Error::ProtocolStatus { status: 0x0105, .. }));
    }
}
