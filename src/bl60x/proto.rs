//! Command codec for the Bouffalo BootROM and eflash loader.
//!
//! Commands are `opcode | checksum | len_lo | len_hi` followed by `len`
//! payload bytes. The ROM dialect ignores the checksum byte; the flash
//! commands served by the eflash loader require the 8-bit sum over the
//! length and payload bytes. Responses open with two ASCII bytes: `OK`,
//! `FL` (a 16-bit error code follows) or `PD` (still working, poll again).

use num_enum::{FromPrimitive, IntoPrimitive};
use thiserror::Error;

/// Handshake byte; the ROM autobauds on a burst of these.
pub const HANDSHAKE_BYTE: u8 = 0x55;
pub const HANDSHAKE_LEN: usize = 16;

/// Largest payload accepted by a single load/write command.
pub const MAX_CHUNK: usize = 4092;

#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive)]
#[repr(u8)]
pub enum Op {
    GetBootInfo = 0x10,
    LoadBootHeader = 0x11,
    LoadSegmentHeader = 0x17,
    LoadSegmentData = 0x18,
    CheckImage = 0x19,
    RunImage = 0x1A,
    FlashErase = 0x30,
    FlashWrite = 0x31,
    FlashRead = 0x32,
    FlashGetJedecId = 0x36,
    FlashConfig616 = 0x3B,
    FlashChipErase = 0x3C,
    FlashReadSha = 0x3D,
}

impl Op {
    /// Flash commands are checked by the loader; ROM loading commands are
    /// not.
    pub fn wants_checksum(self) -> bool {
        matches!(
            self,
            Op::FlashErase
                | Op::FlashWrite
                | Op::FlashRead
                | Op::FlashGetJedecId
                | Op::FlashConfig616
                | Op::FlashChipErase
                | Op::FlashReadSha
        )
    }
}

/// Serializes one command frame.
pub fn command(op: Op, payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u16;
    let len_bytes = len.to_le_bytes();

    let checksum = if op.wants_checksum() {
        payload
            .iter()
            .chain(len_bytes.iter())
            .fold(0u8, |acc, &b| acc.wrapping_add(b))
    } else {
        0
    };

    let mut frame = Vec::with_capacity(4 + payload.len());

    frame.push(op.into());
    frame.push(checksum);
    frame.extend_from_slice(&len_bytes);
    frame.extend_from_slice(payload);

    frame
}

/// Known BootROM / eflash loader error codes, condensed to the groups the
/// flasher can act on. Everything else surfaces as `Unknown`.
#[derive(Error, Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, FromPrimitive)]
#[repr(u16)]
pub enum RomError {
    #[error("success")]
    Success = 0x0000,

    #[error("flash init failed")]
    FlashInit = 0x0001,
    #[error("flash erase failed")]
    FlashErase = 0x0003,
    #[error("flash write failed")]
    FlashWrite = 0x0006,

    #[error("unknown command id")]
    CommandId = 0x0101,
    #[error("bad command length")]
    CommandLength = 0x0102,
    #[error("command checksum error")]
    CommandCrc = 0x0103,
    #[error("command out of sequence")]
    CommandSeq = 0x0104,

    #[error("boot header length mismatch")]
    BootHeaderLength = 0x0201,
    #[error("boot header not loaded")]
    BootHeaderNotLoaded = 0x0202,
    #[error("boot header magic error")]
    BootHeaderMagic = 0x0203,
    #[error("boot header checksum error")]
    BootHeaderCrc = 0x0204,

    #[error("image hash error")]
    ImageHash = 0x0217,

    #[error("unrecognised bootrom error")]
    #[num_enum(default)]
    Unknown = 0xFFFF,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_hex::assert_eq_hex;

    #[test]
    fn it_should_serialize_get_boot_info() {
        assert_eq_hex!(&command(Op::GetBootInfo, &[])[..], &[0x10, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn it_should_leave_rom_commands_unchecksummed() {
        let frame = command(Op::LoadSegmentData, &[0xAB; 100]);

        assert_eq!(frame[0], 0x18);
        assert_eq!(frame[1], 0x00);
        assert_eq!(u16::from_le_bytes([frame[2], frame[3]]), 100);
        assert_eq!(&frame[4..], &[0xAB; 100]);
    }

    #[test]
    fn it_should_checksum_flash_commands() {
        let payload = [0x00, 0x10, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00];
        let frame = command(Op::FlashRead, &payload);

        let expected: u8 = payload
            .iter()
            .chain([0x08u8, 0x00].iter())
            .fold(0u8, |acc, &b| acc.wrapping_add(b));

        assert_eq!(frame[0], 0x32);
        assert_eq!(frame[1], expected);
    }

    #[test]
    fn it_should_decode_known_rom_errors() {
        assert_eq!(RomError::from(0x0203u16), RomError::BootHeaderMagic);
        assert_eq!(RomError::from(0xBEEFu16), RomError::Unknown);
    }
}
