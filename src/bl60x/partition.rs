//! On-chip flash layout table for the Bouffalo parts.
//!
//! The table is two CRC-closed regions: a 16-byte head (`BFPT` magic,
//! version, entry count, age) and up to sixteen 32-byte entries. Each entry
//! describes one slot: two address/length pairs so a partition can have an
//! active and a shadow copy.

use byteorder::{ByteOrder, LittleEndian};

use crate::crc::crc32;
use crate::{Error, Result};

pub const MAGIC: &[u8; 4] = b"BFPT";
pub const MAX_ENTRIES: usize = 16;
pub const HEAD_LEN: usize = 16;
pub const ENTRY_LEN: usize = 32;

const NAME_FIELD: usize = 10;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PartitionEntry {
    pub entry_type: u8,
    pub slot_flag: u8,
    /// ASCII, at most 8 characters.
    pub name: String,
    pub addr0: u32,
    pub addr1: u32,
    pub len0: u32,
    pub len1: u32,
}

impl PartitionEntry {
    fn validate(&self) -> Result<()> {
        if self.name.len() > 8 || !self.name.is_ascii() {
            return Err(Error::InvalidPartitionTable(format!(
                "partition name {:?} must be at most 8 ASCII characters",
                self.name
            )));
        }

        Ok(())
    }

    /// Checks both slots against the configured flash size.
    pub fn fits(&self, flash_size: u32) -> bool {
        let slot0 = self.addr0.checked_add(self.len0).map_or(false, |end| end <= flash_size);
        let slot1 = self.addr1.checked_add(self.len1).map_or(false, |end| end <= flash_size);

        slot0 && slot1
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PartitionTable {
    pub version: u16,
    pub age: u32,
    pub entries: Vec<PartitionEntry>,
}

impl PartitionTable {
    /// The stock layout: a boot slot plus mirrored firmware slots sized to
    /// the flash.
    pub fn standard(flash_size: u32) -> PartitionTable {
        let half = (flash_size.saturating_sub(0x1_0000)) / 2 & !0xFFF;

        PartitionTable {
            version: 1,
            age: 0,
            entries: vec![
                PartitionEntry {
                    entry_type: 0,
                    slot_flag: 0,
                    name: "FW".into(),
                    addr0: 0x1_0000,
                    addr1: 0x1_0000 + half,
                    len0: half,
                    len1: half,
                },
                PartitionEntry {
                    entry_type: 2,
                    slot_flag: 0,
                    name: "media".into(),
                    addr0: 0x1_0000 + 2 * half,
                    addr1: 0,
                    len0: flash_size - (0x1_0000 + 2 * half),
                    len1: 0,
                },
            ],
        }
    }

    pub fn validate(&self, flash_size: u32) -> Result<()> {
        if self.entries.len() > MAX_ENTRIES {
            return Err(Error::InvalidPartitionTable(format!(
                "{} entries exceed the table capacity of {}",
                self.entries.len(),
                MAX_ENTRIES
            )));
        }

        for entry in &self.entries {
            entry.validate()?;

            if !entry.fits(flash_size) {
                return Err(Error::InvalidPartitionTable(format!(
                    "partition {:?} does not fit a {:#x} byte flash",
                    entry.name, flash_size
                )));
            }
        }

        Ok(())
    }

    /// Serializes the table. The inverse of [`PartitionTable::parse`].
    pub fn build(&self) -> Result<Vec<u8>> {
        if self.entries.len() > MAX_ENTRIES {
            return Err(Error::InvalidPartitionTable(format!(
                "{} entries exceed the table capacity of {}",
                self.entries.len(),
                MAX_ENTRIES
            )));
        }

        let mut out = Vec::with_capacity(HEAD_LEN + self.entries.len() * ENTRY_LEN + 4);

        out.extend_from_slice(MAGIC);

        let mut head = [0u8; 8];
        LittleEndian::write_u16(&mut head[0..2], self.version);
        LittleEndian::write_u16(&mut head[2..4], self.entries.len() as u16);
        LittleEndian::write_u32(&mut head[4..8], self.age);
        out.extend_from_slice(&head);

        let head_crc = crc32(0xFFFF_FFFF, &out[0..12]);
        out.extend_from_slice(&head_crc.to_le_bytes());

        for entry in &self.entries {
            entry.validate()?;

            let mut raw = [0u8; ENTRY_LEN];

            raw[0] = entry.entry_type;
            raw[1] = entry.slot_flag;
            raw[2..2 + entry.name.len()].copy_from_slice(entry.name.as_bytes());
            LittleEndian::write_u32(&mut raw[12..16], entry.addr0);
            LittleEndian::write_u32(&mut raw[16..20], entry.addr1);
            LittleEndian::write_u32(&mut raw[20..24], entry.len0);
            LittleEndian::write_u32(&mut raw[24..28], entry.len1);
            // Bytes 28..32 reserved

            out.extend_from_slice(&raw);
        }

        let entries_crc = crc32(0xFFFF_FFFF, &out[HEAD_LEN..]);
        out.extend_from_slice(&entries_crc.to_le_bytes());

        Ok(out)
    }

    pub fn parse(bytes: &[u8]) -> Result<PartitionTable> {
        if bytes.len() < HEAD_LEN + 4 {
            return Err(Error::InvalidPartitionTable("table is truncated".into()));
        }

        if &bytes[0..4] != MAGIC {
            return Err(Error::InvalidPartitionTable(format!(
                "bad magic {:02x?}",
                &bytes[0..4]
            )));
        }

        let head_crc = LittleEndian::read_u32(&bytes[12..16]);

        if head_crc != crc32(0xFFFF_FFFF, &bytes[0..12]) {
            return Err(Error::InvalidPartitionTable("head checksum mismatch".into()));
        }

        let version = LittleEndian::read_u16(&bytes[4..6]);
        let count = LittleEndian::read_u16(&bytes[6..8]) as usize;
        let age = LittleEndian::read_u32(&bytes[8..12]);

        if count > MAX_ENTRIES {
            return Err(Error::InvalidPartitionTable(format!(
                "entry count {} exceeds the table capacity",
                count
            )));
        }

        let body_end = HEAD_LEN + count * ENTRY_LEN;

        if bytes.len() < body_end + 4 {
            return Err(Error::InvalidPartitionTable("entry region is truncated".into()));
        }

        let entries_crc = LittleEndian::read_u32(&bytes[body_end..body_end + 4]);

        if entries_crc != crc32(0xFFFF_FFFF, &bytes[HEAD_LEN..body_end]) {
            return Err(Error::InvalidPartitionTable("entry checksum mismatch".into()));
        }

        let mut entries = Vec::with_capacity(count);

        for raw in bytes[HEAD_LEN..body_end].chunks(ENTRY_LEN) {
            let name_end = raw[2..2 + NAME_FIELD]
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(NAME_FIELD);
            let name = std::str::from_utf8(&raw[2..2 + name_end])
                .map_err(|_| Error::InvalidPartitionTable("partition name is not ASCII".into()))?
                .to_string();

            let entry = PartitionEntry {
                entry_type: raw[0],
                slot_flag: raw[1],
                name,
                addr0: LittleEndian::read_u32(&raw[12..16]),
                addr1: LittleEndian::read_u32(&raw[16..20]),
                len0: LittleEndian::read_u32(&raw[20..24]),
                len1: LittleEndian::read_u32(&raw[24..28]),
            };

            entry.validate()?;
            entries.push(entry);
        }

        Ok(PartitionTable { version, age, entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_should_round_trip_through_build_and_parse() {
        let table = PartitionTable::standard(0x20_0000);
        let bytes = table.build().unwrap();

        let reparsed = PartitionTable::parse(&bytes).unwrap();

        assert_eq!(reparsed, table);
        assert_eq!(reparsed.build().unwrap(), bytes);
    }

    #[test]
    fn it_should_fit_within_the_declared_flash() {
        let table = PartitionTable::standard(0x20_0000);

        table.validate(0x20_0000).unwrap();
        assert!(table.validate(0x8_0000).is_err());
    }

    #[test]
    fn it_should_reject_long_or_non_ascii_names() {
        let mut table = PartitionTable::standard(0x20_0000);
        table.entries[0].name = "muchtoolong".into();

        assert!(table.build().is_err());

        table.entries[0].name = "bÿte".into();

        assert!(table.build().is_err());
    }

    #[test]
    fn it_should_reject_too_many_entries() {
        let mut table = PartitionTable::standard(0x20_0000);
        let template = table.entries[0].clone();

        table.entries = std::iter::repeat(template).take(MAX_ENTRIES + 1).collect();

        assert!(table.build().is_err());
    }

    #[test]
    fn it_should_reject_corrupted_tables() {
        let table = PartitionTable::standard(0x20_0000);
        let mut bytes = table.build().unwrap();

        bytes[20] ^= 0xFF;

        assert!(PartitionTable::parse(&bytes).is_err());
    }
}
