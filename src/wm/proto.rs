//! Frame codec and firmware headers for the WinnerMicro bootloaders.
//!
//! Commands are `0x21 | total_len[2 LE] | crc16[2 LE] | cmd_type[4 LE] |
//! params` where the CRC-16/CCITT-FALSE covers `cmd_type + params` and
//! `total_len` counts `cmd_type + params + 2` (the CRC itself included).

use byteorder::{ByteOrder, LittleEndian};
use num_enum::IntoPrimitive;

use crate::chip::ChipFamily;
use crate::crc::{crc16_ccitt_false, crc32};
use crate::{Error, Result};

pub const FRAME_HEAD: u8 = 0x21;

#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive)]
#[repr(u32)]
pub enum Cmd {
    SetBaudRate = 0x31,
    GetFlashId = 0x3C,
    EraseSecboot = 0x3F,
    ReadFlash = 0x4A,
}

pub fn frame(cmd: Cmd, params: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + params.len());
    let mut cmd_bytes = [0u8; 4];
    LittleEndian::write_u32(&mut cmd_bytes, cmd.into());
    body.extend_from_slice(&cmd_bytes);
    body.extend_from_slice(params);

    let crc = crc16_ccitt_false(&body);
    let total_len = body.len() as u16 + 2;

    let mut out = Vec::with_capacity(5 + body.len());
    out.push(FRAME_HEAD);
    out.extend_from_slice(&total_len.to_le_bytes());
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(&body);

    out
}

/// The secboot image header magic, as it appears in flash.
pub const SECBOOT_MAGIC: [u8; 4] = [0x9F, 0xFF, 0xFF, 0xA0];

/// Flash-mapped base address of the firmware region.
pub const FLASH_BASE: u32 = 0x0800_0000;

/// Header length of the in-memory pseudo-FLS wrapper.
pub fn pseudo_fls_len(family: ChipFamily) -> usize {
    match family {
        ChipFamily::W800 => 48,
        _ => 44,
    }
}

/// Wraps a raw firmware body in the header the bootloader expects from an
/// FLS upload: image location and length, the payload CRC-32, a version
/// string and a closing header CRC-32. The W800 header carries one extra
/// word selecting the next boot image.
pub fn build_pseudo_fls(family: ChipFamily, addr: u32, payload: &[u8]) -> Vec<u8> {
    let len = pseudo_fls_len(family);
    let mut header = vec![0u8; len];

    header[0..4].copy_from_slice(&SECBOOT_MAGIC);
    LittleEndian::write_u32(&mut header[4..8], 0); // image attributes
    LittleEndian::write_u32(&mut header[8..12], addr);
    LittleEndian::write_u32(&mut header[12..16], payload.len() as u32);
    LittleEndian::write_u32(&mut header[16..20], addr - len as u32); // header location
    LittleEndian::write_u32(&mut header[20..24], 0); // upgrade image location
    LittleEndian::write_u32(&mut header[24..28], crc32(0xFFFF_FFFF, payload));

    let version_at = if family == ChipFamily::W800 {
        LittleEndian::write_u32(&mut header[28..32], 0); // next boot image
        32
    } else {
        28
    };

    header[version_at..version_at + 8].copy_from_slice(b"G03.00.0");

    let header_crc = crc32(0xFFFF_FFFF, &header[..len - 4]);
    LittleEndian::write_u32(&mut header[len - 4..], header_crc);

    header
}

/// True when `image` already starts with a secboot header.
pub fn is_fls_image(image: &[u8]) -> bool {
    image.len() >= 4 && image[0..4] == SECBOOT_MAGIC
}

/// Extracts the flash-ID byte pairs following the `FID` marker.
///
/// The bootloader answers with an ASCII line such as `FID:1715`; the W800
/// reports two bytes, the W600 a single one.
pub fn parse_flash_id(response: &[u8], id_bytes: usize) -> Result<Vec<u8>> {
    let marker = response
        .windows(3)
        .position(|window| window == b"FID")
        .ok_or_else(|| Error::ProtocolFraming {
            op: "GetFlashId",
            reason: "response carries no FID marker".into(),
        })?;

    let hex: Vec<u8> = response[marker + 3..]
        .iter()
        .copied()
        .filter(|b| b.is_ascii_hexdigit())
        .take(id_bytes * 2)
        .collect();

    if hex.len() < id_bytes * 2 {
        return Err(Error::ProtocolFraming {
            op: "GetFlashId",
            reason: format!("expected {} hex digits, got {}", id_bytes * 2, hex.len()),
        });
    }

    Ok(hex
        .chunks(2)
        .map(|pair| (hex_value(pair[0]) << 4) | hex_value(pair[1]))
        .collect())
}

fn hex_value(digit: u8) -> u8 {
    match digit {
        b'0'..=b'9' => digit - b'0',
        b'a'..=b'f' => digit - b'a' + 10,
        _ => digit.wrapping_sub(b'A').wrapping_add(10),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_hex::assert_eq_hex;

    #[test]
    fn it_should_frame_a_command_with_its_crc() {
        let built = frame(Cmd::SetBaudRate, &[0x00, 0x10, 0x0E, 0x00]);

        // cmd_type + params
        let body = [0x31, 0x00, 0x00, 0x00, 0x00, 0x10, 0x0E, 0x00];
        let crc = crc16_ccitt_false(&body);

        assert_eq!(built[0], 0x21);
        // total_len counts cmd_type + params + the trailing CRC
        assert_eq!(u16::from_le_bytes([built[1], built[2]]), 10);
        assert_eq!(u16::from_le_bytes([built[3], built[4]]), crc);
        assert_eq_hex!(&built[5..], &body);
    }

    #[test]
    fn it_should_build_family_sized_pseudo_fls_headers() {
        let payload = vec![0xA5u8; 256];

        let w600 = build_pseudo_fls(ChipFamily::W600, 0x0800_2000, &payload);
        let w800 = build_pseudo_fls(ChipFamily::W800, 0x0800_2000, &payload);

        assert_eq!(w600.len(), 44);
        assert_eq!(w800.len(), 48);
        assert_eq!(&w600[0..4], &SECBOOT_MAGIC);
        assert_eq!(&w800[0..4], &SECBOOT_MAGIC);
    }

    #[test]
    fn it_should_checksum_the_payload_and_the_header() {
        let payload = vec![0x3Cu8; 1000];
        let header = build_pseudo_fls(ChipFamily::W800, 0x0800_2000, &payload);

        assert_eq!(
            u32::from_le_bytes([header[24], header[25], header[26], header[27]]),
            crc32(0xFFFF_FFFF, &payload)
        );
        assert_eq!(
            u32::from_le_bytes([header[44], header[45], header[46], header[47]]),
            crc32(0xFFFF_FFFF, &header[..44])
        );
        assert_eq!(
            u32::from_le_bytes([header[12], header[13], header[14], header[15]]),
            1000
        );
    }

    #[test]
    fn it_should_parse_flash_ids_after_the_marker() {
        assert_eq!(parse_flash_id(b"CCCFID:1715\r\n", 2).unwrap(), vec![0x17, 0x15]);
        assert_eq!(parse_flash_id(b"FID:14", 1).unwrap(), vec![0x14]);
        assert!(parse_flash_id(b"CCC", 1).is_err());
        assert!(parse_flash_id(b"FID:1", 1).is_err());
    }

    #[test]
    fn it_should_recognise_fls_images() {
        assert!(is_fls_image(&[0x9F, 0xFF, 0xFF, 0xA0, 0x00]));
        assert!(!is_fls_image(&[0x00, 0x01, 0x02, 0x03]));
        assert!(!is_fls_image(&[0x9F]));
    }
}
