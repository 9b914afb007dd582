//! Boot header construction for BL602/BL702 firmware images.
//!
//! The header is 176 bytes: the `BFNP` magic and revision, an embedded
//! flash parameter block (`FCFG`) and clock block (`PCFG`) each closed by
//! their own CRC-32, the boot configuration words, the SHA-256 of the
//! firmware body, and a trailing CRC-32 over everything before it.

use byteorder::{ByteOrder, LittleEndian};
use sha2::{Digest, Sha256};

use crate::crc::crc32;

pub const BOOT_HEADER_LEN: usize = 176;

/// `"BFNP"` little-endian.
pub const BOOT_HEADER_MAGIC: u32 = 0x504E_4642;

/// Offset the ROM loads the firmware body from.
pub const IMAGE_START: u32 = 0x1000;

const FLASH_CFG_FIELDS: usize = 84;
const CLOCK_CFG_FIELDS: usize = 8;

/// SPI flash parameters embedded in the boot header.
///
/// Only the opcodes and timings the BootROM needs to reach the array are
/// modelled; the rest of the 84-byte block stays zero.
#[derive(Debug, Clone, Copy)]
pub struct FlashParams {
    pub io_mode: u8,
    pub continuous_read: u8,
    pub clock_delay: u8,
    pub clock_invert: u8,
    pub reset_enable_cmd: u8,
    pub reset_cmd: u8,
    pub jedec_id_cmd: u8,
    pub sector_size_kb: u8,
    pub manufacturer_id: u8,
    pub page_size: u16,
    pub chip_erase_cmd: u8,
    pub sector_erase_cmd: u8,
    pub block_erase_32k_cmd: u8,
    pub block_erase_64k_cmd: u8,
    pub write_enable_cmd: u8,
    pub page_program_cmd: u8,
    pub fast_read_cmd: u8,
    pub fast_read_dummy_clocks: u8,
    pub sector_erase_ms: u16,
    pub block_erase_32k_ms: u16,
    pub block_erase_64k_ms: u16,
    pub page_program_ms: u16,
    pub chip_erase_ms: u16,
}

impl Default for FlashParams {
    /// Timings and opcodes of the garden-variety 4-wire NOR parts found
    /// on BL602 modules.
    fn default() -> FlashParams {
        FlashParams {
            io_mode: 0x04,
            continuous_read: 0x01,
            clock_delay: 0x01,
            clock_invert: 0x01,
            reset_enable_cmd: 0x66,
            reset_cmd: 0x99,
            jedec_id_cmd: 0x9F,
            sector_size_kb: 4,
            manufacturer_id: 0xC8,
            page_size: 256,
            chip_erase_cmd: 0xC7,
            sector_erase_cmd: 0x20,
            block_erase_32k_cmd: 0x52,
            block_erase_64k_cmd: 0xD8,
            write_enable_cmd: 0x06,
            page_program_cmd: 0x02,
            fast_read_cmd: 0x0B,
            fast_read_dummy_clocks: 1,
            sector_erase_ms: 300,
            block_erase_32k_ms: 1200,
            block_erase_64k_ms: 1200,
            page_program_ms: 5,
            chip_erase_ms: 33_000,
        }
    }
}

impl FlashParams {
    fn write_into(&self, fields: &mut [u8]) {
        debug_assert_eq!(fields.len(), FLASH_CFG_FIELDS);

        fields[0] = self.io_mode;
        fields[1] = self.continuous_read;
        fields[2] = self.clock_delay;
        fields[3] = self.clock_invert;
        fields[4] = self.reset_enable_cmd;
        fields[5] = self.reset_cmd;
        fields[8] = self.jedec_id_cmd;
        fields[12] = self.sector_size_kb;
        fields[13] = self.manufacturer_id;
        LittleEndian::write_u16(&mut fields[14..16], self.page_size);
        fields[16] = self.chip_erase_cmd;
        fields[17] = self.sector_erase_cmd;
        fields[18] = self.block_erase_32k_cmd;
        fields[19] = self.block_erase_64k_cmd;
        fields[20] = self.write_enable_cmd;
        fields[21] = self.page_program_cmd;
        fields[24] = self.fast_read_cmd;
        fields[25] = self.fast_read_dummy_clocks;
        LittleEndian::write_u16(&mut fields[70..72], self.sector_erase_ms);
        LittleEndian::write_u16(&mut fields[72..74], self.block_erase_32k_ms);
        LittleEndian::write_u16(&mut fields[74..76], self.block_erase_64k_ms);
        LittleEndian::write_u16(&mut fields[76..78], self.page_program_ms);
        LittleEndian::write_u16(&mut fields[78..80], self.chip_erase_ms);
    }
}

/// Crystal and PLL selection for the target board.
#[derive(Debug, Clone, Copy)]
pub struct ClockParams {
    pub xtal_type: u8,
    pub pll_clock: u8,
    pub hclk_divider: u8,
    pub bclk_divider: u8,
    pub flash_clock_type: u8,
    pub flash_clock_divider: u8,
}

impl Default for ClockParams {
    fn default() -> ClockParams {
        ClockParams {
            xtal_type: 4, // 40 MHz
            pll_clock: 4,
            hclk_divider: 0,
            bclk_divider: 1,
            flash_clock_type: 3,
            flash_clock_divider: 1,
        }
    }
}

impl ClockParams {
    fn write_into(&self, fields: &mut [u8]) {
        debug_assert_eq!(fields.len(), CLOCK_CFG_FIELDS);

        fields[0] = self.xtal_type;
        fields[1] = self.pll_clock;
        fields[2] = self.hclk_divider;
        fields[3] = self.bclk_divider;
        fields[4] = self.flash_clock_type;
        fields[5] = self.flash_clock_divider;
        // Bytes 6 and 7 are reserved
    }
}

/// Builds the 176-byte boot header for `firmware`.
pub fn build(flash: &FlashParams, clock: &ClockParams, firmware: &[u8]) -> [u8; BOOT_HEADER_LEN] {
    let mut header = [0u8; BOOT_HEADER_LEN];

    LittleEndian::write_u32(&mut header[0..4], BOOT_HEADER_MAGIC);
    LittleEndian::write_u32(&mut header[4..8], 1); // revision

    // Flash parameter block: magic, 84 field bytes, CRC-32 over the fields
    header[8..12].copy_from_slice(b"FCFG");
    flash.write_into(&mut header[12..96]);
    let flash_crc = crc32(0xFFFF_FFFF, &header[12..96]);
    LittleEndian::write_u32(&mut header[96..100], flash_crc);

    // Clock block, same shape
    header[100..104].copy_from_slice(b"PCFG");
    clock.write_into(&mut header[104..112]);
    let clock_crc = crc32(0xFFFF_FFFF, &header[104..112]);
    LittleEndian::write_u32(&mut header[112..116], clock_crc);

    LittleEndian::write_u32(&mut header[116..120], 0); // boot config
    LittleEndian::write_u32(&mut header[120..124], firmware.len() as u32);
    LittleEndian::write_u32(&mut header[124..128], 0); // entry point
    LittleEndian::write_u32(&mut header[128..132], IMAGE_START);

    let hash = Sha256::digest(firmware);
    header[132..164].copy_from_slice(&hash);

    // Bytes 164..172 reserved; tail CRC closes the header
    let tail_crc = crc32(0xFFFF_FFFF, &header[0..172]);
    LittleEndian::write_u32(&mut header[172..176], tail_crc);

    header
}

/// True when `image` already carries a boot header.
pub fn has_boot_header(image: &[u8]) -> bool {
    image.len() >= 4 && LittleEndian::read_u32(&image[0..4]) == BOOT_HEADER_MAGIC
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> [u8; BOOT_HEADER_LEN] {
        let firmware = vec![0x37u8; 8192];

        build(&FlashParams::default(), &ClockParams::default(), &firmware)
    }

    #[test]
    fn it_should_start_with_the_bfnp_magic() {
        let header = sample_header();

        assert_eq!(&header[0..4], b"BFNP");
        assert!(has_boot_header(&header));
        assert!(!has_boot_header(&[0u8; 176]));
    }

    #[test]
    fn it_should_checksum_all_three_regions() {
        let header = sample_header();

        assert_eq!(
            LittleEndian::read_u32(&header[96..100]),
            crc32(0xFFFF_FFFF, &header[12..96])
        );
        assert_eq!(
            LittleEndian::read_u32(&header[112..116]),
            crc32(0xFFFF_FFFF, &header[104..112])
        );
        assert_eq!(
            LittleEndian::read_u32(&header[172..176]),
            crc32(0xFFFF_FFFF, &header[0..172])
        );
    }

    #[test]
    fn it_should_embed_the_firmware_digest_and_length() {
        let firmware = vec![0x37u8; 8192];
        let header = build(&FlashParams::default(), &ClockParams::default(), &firmware);

        assert_eq!(LittleEndian::read_u32(&header[120..124]), 8192);
        assert_eq!(&header[132..164], &Sha256::digest(&firmware)[..]);
        assert_eq!(LittleEndian::read_u32(&header[128..132]), 0x1000);
        assert_eq!(LittleEndian::read_u32(&header[124..128]), 0);
    }
}
