//! Frame codec for the BK7231 BootROM.
//!
//! Every command starts with the HCI-style preamble `01 E0 FC`. Register
//! and link commands use the short form (`len opcode payload`); flash
//! commands use the long form (`FF F4 len_lo len_hi opcode payload`).
//! Responses mirror the request behind a fixed `04 0E` head.

use byteorder::{ByteOrder, LittleEndian};
use num_enum::IntoPrimitive;

use crate::{Error, Result};

pub const PREAMBLE: [u8; 3] = [0x01, 0xE0, 0xFC];
pub const LONG_MARKER: [u8; 2] = [0xFF, 0xF4];
pub const RESPONSE_HEAD: [u8; 2] = [0x04, 0x0E];

/// Commands carried in the short frame form.
#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive)]
#[repr(u8)]
pub enum ShortOp {
    LinkCheck = 0x00,
    WriteReg = 0x01,
    ReadReg = 0x03,
    SetBaudRate = 0x0F,
    CheckCrc = 0x10,
}

/// The LinkCheck response echoes the opcode plus one.
pub const LINK_CHECK_RESPONSE_OP: u8 = 0x01;

/// Commands carried in the long frame form.
#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive)]
#[repr(u8)]
pub enum LongOp {
    FlashWrite4K = 0x07,
    FlashRead4K = 0x09,
    FlashErase4K = 0x0B,
    FlashReadSR = 0x0C,
    FlashWriteSR = 0x0D,
    FlashGetMid = 0x0E,
    FlashEraseSize = 0x0F,
}

/// Sub-opcodes of [`LongOp::FlashEraseSize`].
pub const ERASE_SIZE_4K: u8 = 0x20;
pub const ERASE_SIZE_64K: u8 = 0xD8;

pub fn short_frame(op: ShortOp, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(5 + payload.len());

    frame.extend_from_slice(&PREAMBLE);
    frame.push(payload.len() as u8 + 1);
    frame.push(op.into());
    frame.extend_from_slice(payload);

    frame
}

pub fn long_frame(op: LongOp, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8 + payload.len());

    frame.extend_from_slice(&PREAMBLE);
    frame.extend_from_slice(&LONG_MARKER);

    let mut len = [0u8; 2];
    LittleEndian::write_u16(&mut len, payload.len() as u16 + 1);
    frame.extend_from_slice(&len);

    frame.push(op.into());
    frame.extend_from_slice(payload);

    frame
}

/// Total response size for a short command with `payload_len` payload bytes.
pub fn short_response_len(payload_len: usize) -> usize {
    // 04 0E len 01 E0 FC op
    7 + payload_len
}

/// Total response size for a long command with `payload_len` payload bytes.
pub fn long_response_len(payload_len: usize) -> usize {
    // 04 0E FF 01 E0 FC F4 len_lo len_hi op
    10 + payload_len
}

/// Validates the short response framing and returns the payload.
pub fn parse_short_response<'a>(op: u8, response: &'a [u8]) -> Result<&'a [u8]> {
    if response.len() < 7 {
        return Err(framing("short response truncated"));
    }

    if response[0..2] != RESPONSE_HEAD || response[3..6] != PREAMBLE {
        return Err(framing("bad short response head"));
    }

    if response[6] != op {
        return Err(framing("short response opcode mismatch"));
    }

    Ok(&response[7..])
}

/// Validates the long response framing and returns the payload, which for
/// flash commands starts with the status byte.
pub fn parse_long_response<'a>(op: LongOp, response: &'a [u8]) -> Result<&'a [u8]> {
    if response.len() < 10 {
        return Err(framing("long response truncated"));
    }

    if response[0..2] != RESPONSE_HEAD
        || response[2] != 0xFF
        || response[3..6] != PREAMBLE
        || response[6] != 0xF4
    {
        return Err(framing("bad long response head"));
    }

    if response[9] != u8::from(op) {
        return Err(framing("long response opcode mismatch"));
    }

    Ok(&response[10..])
}

/// Checks the leading status byte of a long flash response.
pub fn check_status(op: &'static str, payload: &[u8]) -> Result<()> {
    match payload.first() {
        Some(0) => Ok(()),
        Some(&status) => Err(Error::ProtocolStatus {
            op,
            status: status as u16,
        }),
        None => Err(framing("missing status byte")),
    }
}

fn framing(reason: &str) -> Error {
    Error::ProtocolFraming {
        op: "bk72xx",
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_hex::assert_eq_hex;
    use hex_literal::hex;

    #[test]
    fn it_should_build_a_link_check_frame() {
        let frame = short_frame(ShortOp::LinkCheck, &[]);

        assert_eq_hex!(&frame[..], &[0x01, 0xE0, 0xFC, 0x01, 0x00]);
    }

    #[test]
    fn it_should_build_a_set_baud_rate_frame() {
        let mut payload = [0u8; 5];
        LittleEndian::write_u32(&mut payload, 921_600);
        payload[4] = 20;

        let frame = short_frame(ShortOp::SetBaudRate, &payload);

        assert_eq_hex!(
            &frame[..],
            &[0x01, 0xE0, 0xFC, 0x06, 0x0F, 0x00, 0x10, 0x0E, 0x00, 0x14]
        );
    }

    #[test]
    fn it_should_build_a_long_flash_read_frame() {
        let mut addr = [0u8; 4];
        LittleEndian::write_u32(&mut addr, 0x0001_1000);

        let frame = long_frame(LongOp::FlashRead4K, &addr);

        assert_eq_hex!(
            &frame[..],
            &[0x01, 0xE0, 0xFC, 0xFF, 0xF4, 0x05, 0x00, 0x09, 0x00, 0x10, 0x01, 0x00]
        );
    }

    #[test]
    fn it_should_parse_a_short_response() {
        let response = hex!("04 0E 05 01 E0 FC 01 00");
        let payload = parse_short_response(0x01, &response).unwrap();

        assert_eq!(payload, &[0x00]);
    }

    #[test]
    fn it_should_reject_an_opcode_mismatch() {
        let response = hex!("04 0E 05 01 E0 FC 03 00");

        assert!(parse_short_response(0x01, &response).is_err());
    }

    #[test]
    fn it_should_parse_a_long_response() {
        let response = hex!("04 0E FF 01 E0 FC F4 06 00 0E 00 CD 60 14 00");
        let payload = parse_long_response(LongOp::FlashGetMid, &response).unwrap();

        check_status("FlashGetMID", payload).unwrap();
        assert_eq!(LittleEndian::read_u32(&payload[1..5]), 0x0014_60CD);
    }

    #[test]
    fn it_should_surface_a_non_zero_status() {
        let payload = [0x04, 0x00, 0x10, 0x01, 0x00];
        let err = check_status("FlashErase4K", &payload).unwrap_err();

        assert!(matches!(err, Error::ProtocolStatus { status: 4, .. }));
    }

    #[test]
    fn it_should_predict_response_lengths() {
        // LinkCheck: head + one status byte
        assert_eq!(short_response_len(1), 8);
        // FlashRead4K: head + status + address + sector
        assert_eq!(long_response_len(1 + 4 + 4096), 4111);
    }
}
