//! Registry of the SPI NOR flash ICs found on BK7231 modules.
//!
//! The set is closed and small, so lookup is a linear scan over a static
//! table; callers treat it as free. The protect/unprotect words describe
//! the block-protect bit-field inside the (possibly multi-byte) status
//! register.

/// Places `v` into a bit-field of `len` bits starting at `start`.
pub const fn bfd(v: u32, start: u8, len: u8) -> u32 {
    (v & ((1 << len) - 1)) << start
}

/// Describes one SPI NOR IC, keyed by its 24-bit JEDEC Manufacturer/Device
/// ID as the BK BootROM reports it.
#[derive(Debug, Clone, Copy)]
pub struct FlashChip {
    pub mid: u32,
    pub name: &'static str,
    pub icon: &'static str,
    pub vendor: &'static str,
    pub memory_bytes: u32,
    /// Number of status-register bytes (1 to 3).
    pub status_reg_width: u8,
    /// Field value that disables all block protection.
    pub unprotect_word: u32,
    /// Field value that protects the whole array.
    pub protect_word: u32,
    /// The protect bits within the combined status word.
    pub mask: u32,
    /// Bit-field start and length inside the status word.
    pub sb: u8,
    pub lb: u8,
    /// Read Status Register opcodes, one per register byte.
    pub read_opcodes: [u8; 4],
    /// Write Status Register opcodes, one per register byte.
    pub write_opcodes: [u8; 4],
}

const fn chip(
    mid: u32,
    name: &'static str,
    icon: &'static str,
    vendor: &'static str,
    status_reg_width: u8,
    sb: u8,
    lb: u8,
) -> FlashChip {
    FlashChip {
        mid,
        name,
        icon,
        vendor,
        // The capacity byte of the MID is log2 of the array size
        memory_bytes: 1u32 << (mid >> 16),
        status_reg_width,
        unprotect_word: 0,
        protect_word: (1 << lb) - 1,
        mask: bfd((1 << lb) - 1, sb, lb),
        sb,
        lb,
        read_opcodes: [0x05, 0x35, 0x15, 0x00],
        write_opcodes: [0x01, 0x31, 0x11, 0x00],
    }
}

pub static FLASH_CHIPS: &[FlashChip] = &[
    // GigaDevice
    chip(0x1340C8, "GD25Q40B", "gigadevice", "GigaDevice", 2, 2, 3),
    chip(0x1440C8, "GD25Q80C", "gigadevice", "GigaDevice", 2, 2, 5),
    chip(0x1540C8, "GD25Q16C", "gigadevice", "GigaDevice", 2, 2, 5),
    chip(0x1640C8, "GD25Q32C", "gigadevice", "GigaDevice", 2, 2, 5),
    chip(0x1565C8, "GD25WQ16E", "gigadevice", "GigaDevice", 2, 2, 5),
    chip(0x1665C8, "GD25WQ32E", "gigadevice", "GigaDevice", 2, 2, 5),
    // Winbond
    chip(0x1340EF, "W25Q40CL", "winbond", "Winbond", 2, 2, 3),
    chip(0x1440EF, "W25Q80DV", "winbond", "Winbond", 2, 2, 5),
    chip(0x1540EF, "W25Q16JL", "winbond", "Winbond", 2, 2, 5),
    chip(0x1640EF, "W25Q32JV", "winbond", "Winbond", 2, 2, 5),
    chip(0x1740EF, "W25Q64JV", "winbond", "Winbond", 2, 2, 5),
    chip(0x1840EF, "W25Q128JV", "winbond", "Winbond", 2, 2, 5),
    // XTX
    chip(0x14400B, "XT25F08B", "xtx", "XTX", 2, 2, 5),
    chip(0x15400B, "XT25F16B", "xtx", "XTX", 2, 2, 5),
    chip(0x16400B, "XT25F32B", "xtx", "XTX", 2, 2, 5),
    chip(0x14600B, "XT25Q08D", "xtx", "XTX", 2, 2, 5),
    // Puya
    chip(0x136085, "P25Q40H", "puya", "Puya", 2, 2, 3),
    chip(0x146085, "P25Q80H", "puya", "Puya", 2, 2, 5),
    chip(0x156085, "P25Q16H", "puya", "Puya", 2, 2, 5),
    chip(0x166085, "P25Q32H", "puya", "Puya", 2, 2, 5),
    // BoYa
    chip(0x144068, "BY25Q80A", "boya", "BoYa", 2, 2, 5),
    chip(0x154068, "BY25Q16B", "boya", "BoYa", 2, 2, 5),
    chip(0x164068, "BY25Q32B", "boya", "BoYa", 2, 2, 5),
    // TsingTeng
    chip(0x1360CD, "TH25Q40HB", "tsingteng", "TsingTeng", 2, 2, 3),
    chip(0x1460CD, "TH25Q80HB", "tsingteng", "TsingTeng", 2, 2, 5),
    chip(0x1560CD, "TH25Q16HB", "tsingteng", "TsingTeng", 2, 2, 5),
    // EON
    chip(0x14301C, "EN25Q80B", "eon", "EON", 1, 2, 5),
    chip(0x15701C, "EN25QH16A", "eon", "EON", 1, 2, 5),
    chip(0x16701C, "EN25QH32B", "eon", "EON", 1, 2, 5),
    // XMC
    chip(0x144020, "XM25QH80B", "xmc", "XMC", 2, 2, 5),
    chip(0x154020, "XM25QH16C", "xmc", "XMC", 2, 2, 5),
    chip(0x164020, "XM25QH32B", "xmc", "XMC", 2, 2, 5),
    // Fudan
    chip(0x1440A1, "FM25Q08A", "fudan", "Fudan", 2, 2, 5),
    chip(0x1540A1, "FM25Q16A", "fudan", "Fudan", 2, 2, 5),
    chip(0x1640A1, "FM25Q32A", "fudan", "Fudan", 2, 2, 5),
    // Zbit
    chip(0x14405E, "ZB25VQ80", "zbit", "Zbit", 2, 2, 5),
    chip(0x15405E, "ZB25VQ16", "zbit", "Zbit", 2, 2, 5),
    chip(0x16405E, "ZB25VQ32", "zbit", "Zbit", 2, 2, 5),
    // Macronix
    chip(0x1420C2, "MX25L8006E", "macronix", "Macronix", 1, 2, 4),
    chip(0x1520C2, "MX25L1606E", "macronix", "Macronix", 1, 2, 4),
    chip(0x1620C2, "MX25L3206E", "macronix", "Macronix", 1, 2, 4),
];

/// Looks up a descriptor by its 24-bit MID.
pub fn lookup(mid: u32) -> Option<&'static FlashChip> {
    FLASH_CHIPS.iter().find(|chip| chip.mid == mid & 0x00FF_FFFF)
}
