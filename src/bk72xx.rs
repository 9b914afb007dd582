//! Driver for the Beken BK7231 family BootROM.
//!
//! The ROM speaks HCI-style frames over UART at 115 200 baud. A session
//! starts with a liberal "get bus" loop (the user may be power-cycling the
//! module while we poll), negotiates a faster baud rate, identifies and
//! unprotects the external SPI NOR on the newer variants, and then moves
//! 4 KiB sectors. Reads and writes both end with a device-side CRC-32 that
//! must match the host buffer.

pub mod proto;

use std::thread;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use log::debug;

use crate::chip::ChipFamily;
use crate::crc::crc32;
use crate::flashdb::{self, bfd, FlashChip};
use crate::flasher::{CancelToken, EventSink, FlashOptions, Flasher, FlasherState, LogLevel, Session};
use crate::transport::Transport;
use crate::{Error, Result};

use proto::{LongOp, ShortOp};

pub const SECTOR_SIZE: u32 = 4096;
pub const BLOCK_SIZE: u32 = 0x10000;

/// The BootROM always listens at this rate.
const LINK_BAUD: u32 = 115_200;

/// T/U modules default to a 2 MiB flash; the newer variants report theirs.
const DEFAULT_MEMORY_BYTES: u32 = 0x20_0000;

const LINK_CHECK_TIMEOUT: Duration = Duration::from_millis(10);
const REGISTER_TIMEOUT: Duration = Duration::from_millis(100);
const FLASH_TIMEOUT: Duration = Duration::from_millis(500);
const ERASE_4K_TIMEOUT: Duration = Duration::from_millis(800);
const ERASE_64K_TIMEOUT: Duration = Duration::from_millis(3000);
const BAUD_RESPONSE_TIMEOUT: Duration = Duration::from_millis(500);

const GET_BUS_OUTER_ATTEMPTS: u32 = 100;
const GET_BUS_INNER_ATTEMPTS: u32 = 100;
const BAUD_ATTEMPTS: u32 = 10;
const UNPROTECT_ATTEMPTS: u32 = 10;
const ERASE_ATTEMPTS: u32 = 6;
const SECTOR_ATTEMPTS: u32 = 3;

/// SCTRL chip id register.
const CHIP_ID_REG: u32 = 0x0080_0000;

/// eFuse controller: a control register latching the byte address and a
/// data register exposing the read byte.
const EFUSE_CTRL_REG: u32 = 0x4488_0000;
const EFUSE_DATA_REG: u32 = 0x4488_0004;

/// The well-known Tuya key coefficients burned into retail BK7231N parts.
const TUYA_KEY_COEFFS: [u32; 4] = [0x510F_B093, 0xA3CB_EADC, 0x5993_A17E, 0xC7AD_EB03];

pub struct Bk72xxFlasher<T: Transport> {
    family: ChipFamily,
    session: Session<T>,
    target_baud: u32,
    flash: Option<&'static FlashChip>,
    memory_bytes: u32,
    read_result: Option<Vec<u8>>,
    warned_control_lines: bool,
}

impl<T: Transport> Bk72xxFlasher<T> {
    pub fn new(
        family: ChipFamily,
        transport: T,
        target_baud: u32,
        options: FlashOptions,
        events: EventSink,
        cancel: CancelToken,
    ) -> Bk72xxFlasher<T> {
        Bk72xxFlasher {
            family,
            session: Session::new(transport, options, events, cancel),
            target_baud,
            flash: None,
            memory_bytes: DEFAULT_MEMORY_BYTES,
            read_result: None,
            warned_control_lines: false,
        }
    }

    /// Opens the port, wins the bus, raises the baud rate and identifies
    /// the flash where the variant supports it.
    fn prepare(&mut self) -> Result<()> {
        self.session.connect()?;
        self.session.set_state(FlasherState::Syncing);
        self.get_bus()?;

        self.session.set_state(FlasherState::Configuring);
        self.switch_baud(self.target_baud)?;

        if !self.family.is_bk_tu() {
            self.session.set_state(FlasherState::Identifying);
            self.identify_flash()?;
            self.set_protect_state(true)?;

            if !matches!(self.family, ChipFamily::Bk7238 | ChipFamily::Bk7252N) {
                self.check_encryption_key()?;
            }
        }

        Ok(())
    }

    /// Wins the ROM's attention. The module may be power-cycled at any
    /// point during this window, so we stay liberal: pulse the control
    /// lines every round, fall back to a software reset every fifth, and
    /// hammer LinkCheck in between.
    fn get_bus(&mut self) -> Result<()> {
        self.session
            .log(LogLevel::Info, "Connecting... power cycle the device if it does not answer");

        for outer in 0..GET_BUS_OUTER_ATTEMPTS {
            self.session.ensure_active()?;
            self.pulse_reset_lines();

            if outer % 5 == 0 {
                self.session.write(b"reboot\r\n")?;
            }

            for _ in 0..GET_BUS_INNER_ATTEMPTS {
                self.session.ensure_active()?;

                if self.link_check()? {
                    self.session.drain()?;
                    self.session.log(LogLevel::Info, "Link established");
                    return Ok(());
                }
            }
        }

        Err(Error::SyncFailed {
            attempts: GET_BUS_OUTER_ATTEMPTS,
        })
    }

    fn pulse_reset_lines(&mut self) {
        let dtr = self.session.set_dtr(true);
        let rts = self.session.set_rts(true);

        if !(dtr && rts) && !self.warned_control_lines {
            self.warned_control_lines = true;
            self.session.log(
                LogLevel::Warning,
                "DTR/RTS not honoured by this adapter; reset the module manually",
            );
        }

        thread::sleep(Duration::from_millis(50));
        self.session.set_dtr(false);
        self.session.set_rts(false);
    }

    fn link_check(&mut self) -> Result<bool> {
        self.session.write(&proto::short_frame(ShortOp::LinkCheck, &[]))?;

        let response = match self
            .session
            .try_read_exact(proto::short_response_len(1), LINK_CHECK_TIMEOUT)?
        {
            Some(response) => response,
            None => return Ok(false),
        };

        match proto::parse_short_response(proto::LINK_CHECK_RESPONSE_OP, &response) {
            Ok(payload) => Ok(payload == [0x00]),
            Err(_) => Ok(false),
        }
    }

    /// Negotiates `baud`, reverting to 115 200 after every failed attempt.
    fn switch_baud(&mut self, baud: u32) -> Result<()> {
        if baud == self.session.baud {
            return Ok(());
        }

        let mut payload = [0u8; 5];
        LittleEndian::write_u32(&mut payload, baud);
        payload[4] = 20;

        for attempt in 1..=BAUD_ATTEMPTS {
            self.session.ensure_active()?;
            self.session
                .write(&proto::short_frame(ShortOp::SetBaudRate, &payload))?;

            // Let the request drain at the old rate before switching
            thread::sleep(Duration::from_millis(20));
            self.session.set_baud(baud)?;

            if let Some(response) = self
                .session
                .try_read_exact(proto::short_response_len(5), BAUD_RESPONSE_TIMEOUT)?
            {
                if proto::parse_short_response(ShortOp::SetBaudRate.into(), &response).is_ok() {
                    self.session.drain()?;
                    self.session
                        .log(LogLevel::Info, &format!("Baud rate set to {}", baud));
                    return Ok(());
                }
            }

            debug!("baud switch attempt {} failed, reverting", attempt);
            self.session.set_baud(LINK_BAUD)?;
            self.session.drain()?;
            self.get_bus()?;
        }

        Err(Error::SyncFailed {
            attempts: BAUD_ATTEMPTS,
        })
    }

    fn short_command(
        &mut self,
        op: ShortOp,
        payload: &[u8],
        response_payload: usize,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>> {
        self.session.write(&proto::short_frame(op, payload))?;

        let response = match self
            .session
            .try_read_exact(proto::short_response_len(response_payload), timeout)?
        {
            Some(response) => response,
            None => return Ok(None),
        };

        proto::parse_short_response(op.into(), &response).map(|p| Some(p.to_vec()))
    }

    fn long_command(
        &mut self,
        op: LongOp,
        name: &'static str,
        payload: &[u8],
        response_payload: usize,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>> {
        self.session.write(&proto::long_frame(op, payload))?;

        let response = match self
            .session
            .try_read_exact(proto::long_response_len(response_payload), timeout)?
        {
            Some(response) => response,
            None => return Ok(None),
        };

        let payload = proto::parse_long_response(op, &response)?;
        proto::check_status(name, payload)?;

        Ok(Some(payload.to_vec()))
    }

    fn read_reg(&mut self, addr: u32) -> Result<u32> {
        let mut payload = [0u8; 4];
        LittleEndian::write_u32(&mut payload, addr);

        let response = self
            .short_command(ShortOp::ReadReg, &payload, 8, REGISTER_TIMEOUT)?
            .ok_or(Error::Timeout(REGISTER_TIMEOUT))?;

        Ok(LittleEndian::read_u32(&response[4..8]))
    }

    fn write_reg(&mut self, addr: u32, value: u32) -> Result<()> {
        let mut payload = [0u8; 8];
        LittleEndian::write_u32(&mut payload[0..4], addr);
        LittleEndian::write_u32(&mut payload[4..8], value);

        self.short_command(ShortOp::WriteReg, &payload, 8, REGISTER_TIMEOUT)?
            .ok_or(Error::Timeout(REGISTER_TIMEOUT))?;

        Ok(())
    }

    fn flash_get_mid(&mut self) -> Result<u32> {
        let payload = [0u8; 4];
        let response = self
            .long_command(LongOp::FlashGetMid, "FlashGetMID", &payload, 5, FLASH_TIMEOUT)?
            .ok_or(Error::Timeout(FLASH_TIMEOUT))?;

        Ok(LittleEndian::read_u32(&response[1..5]) & 0x00FF_FFFF)
    }

    fn read_status_reg(&mut self, index: u8) -> Result<u8> {
        let response = self
            .long_command(LongOp::FlashReadSR, "FlashReadSR", &[index], 3, FLASH_TIMEOUT)?
            .ok_or(Error::Timeout(FLASH_TIMEOUT))?;

        Ok(response[2])
    }

    fn write_status_reg(&mut self, index: u8, value: u8) -> Result<()> {
        self.long_command(
            LongOp::FlashWriteSR,
            "FlashWriteSR",
            &[index, value],
            3,
            FLASH_TIMEOUT,
        )?
        .ok_or(Error::Timeout(FLASH_TIMEOUT))?;

        Ok(())
    }

    fn identify_flash(&mut self) -> Result<()> {
        let chip_id = self.read_reg(CHIP_ID_REG)?;
        debug!("chip id register: {:#010x}", chip_id);

        let mid = self.flash_get_mid()?;
        let chip = flashdb::lookup(mid).ok_or(Error::UnknownFlash(mid))?;

        self.flash = Some(chip);
        self.memory_bytes = chip.memory_bytes;
        self.session
            .log(LogLevel::Info, &format!("Flash def found: {}", chip.name));

        Ok(())
    }

    /// Reads the combined status word, rewrites the protect bit-field and
    /// verifies the result, retrying on disagreement.
    fn set_protect_state(&mut self, unprotect: bool) -> Result<()> {
        let chip = *self.flash.as_ref().ok_or(Error::UnknownFlash(0))?;
        let field = if unprotect { chip.unprotect_word } else { chip.protect_word };
        let width = chip.status_reg_width as usize;

        let mut word = 0u32;

        for attempt in 0..UNPROTECT_ATTEMPTS {
            word = 0;

            for i in 0..width {
                word |= (self.read_status_reg(i as u8)? as u32) << (8 * i);
            }

            let target = (word & !chip.mask) | bfd(field, chip.sb, chip.lb);

            if word == target {
                debug!("protect state settled after {} attempts", attempt);
                return Ok(());
            }

            for i in 0..width {
                self.write_status_reg(i as u8, (target >> (8 * i)) as u8)?;
            }
        }

        Err(Error::VerificationMismatch {
            kind: "status register",
            device: format!("{:#06x}", word),
            host: "protect bits cleared".into(),
        })
    }

    /// Reads the 16-byte eFuse block and compares the four key
    /// coefficients against the family's expected value.
    fn check_encryption_key(&mut self) -> Result<()> {
        let mut block = [0u8; 16];

        for (addr, slot) in block.iter_mut().enumerate() {
            self.write_reg(EFUSE_CTRL_REG, ((addr as u32) << 8) | 1)?;

            // The busy bit clears once the byte is latched
            for _ in 0..20 {
                if self.read_reg(EFUSE_CTRL_REG)? & 1 == 0 {
                    break;
                }
            }

            *slot = self.read_reg(EFUSE_DATA_REG)? as u8;
        }

        let mut coeffs = [0u32; 4];

        for (i, coeff) in coeffs.iter_mut().enumerate() {
            *coeff = LittleEndian::read_u32(&block[i * 4..i * 4 + 4]);
        }

        let expected = match self.family {
            ChipFamily::Bk7231N => TUYA_KEY_COEFFS,
            _ => [0u32; 4],
        };

        let uniform = coeffs.iter().all(|&c| c == coeffs[0]);

        if coeffs != expected && !uniform {
            if self.session.options.skip_key_check {
                self.session.log(
                    LogLevel::Warning,
                    "Device encryption key is non-standard; continuing as requested",
                );
            } else {
                return Err(Error::EncryptionKeyMismatch {
                    family: self.family.name(),
                });
            }
        }

        Ok(())
    }

    fn read_sector(&mut self, addr: u32) -> Result<Vec<u8>> {
        let mut payload = [0u8; 4];
        LittleEndian::write_u32(&mut payload, addr);

        for _ in 0..SECTOR_ATTEMPTS {
            match self.long_command(
                LongOp::FlashRead4K,
                "FlashRead4K",
                &payload,
                1 + 4 + SECTOR_SIZE as usize,
                FLASH_TIMEOUT,
            )? {
                Some(response) => {
                    if LittleEndian::read_u32(&response[1..5]) != addr {
                        debug!("sector response for the wrong address, retrying");
                        self.session.drain()?;
                        continue;
                    }

                    return Ok(response[5..].to_vec());
                }
                None => self.session.drain()?,
            }
        }

        Err(Error::Timeout(FLASH_TIMEOUT))
    }

    fn write_sector(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        let mut payload = Vec::with_capacity(4 + data.len());
        let mut addr_bytes = [0u8; 4];
        LittleEndian::write_u32(&mut addr_bytes, addr);
        payload.extend_from_slice(&addr_bytes);
        payload.extend_from_slice(data);

        for _ in 0..SECTOR_ATTEMPTS {
            match self.long_command(LongOp::FlashWrite4K, "FlashWrite4K", &payload, 5, FLASH_TIMEOUT)? {
                Some(_) => return Ok(()),
                None => self.session.drain()?,
            }
        }

        Err(Error::Timeout(FLASH_TIMEOUT))
    }

    fn erase_unit(&mut self, addr: u32, block: bool) -> Result<()> {
        for _ in 0..ERASE_ATTEMPTS {
            let done = if block {
                let mut payload = [0u8; 5];
                payload[0] = proto::ERASE_SIZE_64K;
                LittleEndian::write_u32(&mut payload[1..5], addr);

                self.long_command(
                    LongOp::FlashEraseSize,
                    "FlashEraseSize",
                    &payload,
                    6,
                    ERASE_64K_TIMEOUT,
                )?
                .is_some()
            } else {
                let mut payload = [0u8; 4];
                LittleEndian::write_u32(&mut payload, addr);

                self.long_command(LongOp::FlashErase4K, "FlashErase4K", &payload, 5, ERASE_4K_TIMEOUT)?
                    .is_some()
            };

            if done {
                return Ok(());
            }

            self.session.drain()?;
        }

        Err(Error::Timeout(if block { ERASE_64K_TIMEOUT } else { ERASE_4K_TIMEOUT }))
    }

    /// Erases `[start, end)` with 4 KiB sectors at the ragged edges and
    /// 64 KiB blocks in between.
    fn erase_range(&mut self, start: u32, end: u32) -> Result<()> {
        let mut addr = start;

        while addr < end {
            self.session.ensure_active()?;

            if addr % BLOCK_SIZE == 0 && end - addr >= BLOCK_SIZE {
                self.erase_unit(addr, true)?;
                addr += BLOCK_SIZE;
            } else {
                self.erase_unit(addr, false)?;
                addr += SECTOR_SIZE;
            }
        }

        Ok(())
    }

    fn check_crc(&mut self, start: u32, end: u32) -> Result<u32> {
        let mut payload = [0u8; 8];
        LittleEndian::write_u32(&mut payload[0..4], start);
        LittleEndian::write_u32(&mut payload[4..8], end);

        // The device walks the whole range, so scale the budget with it
        let megabytes = ((end - start) >> 20).max(1) as u64;
        let timeout = Duration::from_millis(1000 + 4000 * megabytes);

        let response = self
            .short_command(ShortOp::CheckCrc, &payload, 4, timeout)?
            .ok_or(Error::Timeout(timeout))?;

        Ok(LittleEndian::read_u32(&response[0..4]))
    }

    /// T/U BootROMs expect flash addresses offset by the flash size.
    fn read_addr(&self, addr: u32) -> u32 {
        if self.family.is_bk_tu() {
            addr + self.memory_bytes
        } else {
            addr
        }
    }

    fn verify_range(&mut self, start: u32, data: &[u8], is_read: bool) -> Result<()> {
        self.session.set_state(FlasherState::Verifying);

        // The T/U address quirk only applies to the read path; writes land
        // at their face-value addresses and are checked there
        let (crc_start, crc_end) = if is_read {
            (self.read_addr(start), self.read_addr(start + data.len() as u32))
        } else {
            (start, start + data.len() as u32)
        };

        let device = self.check_crc(crc_start, crc_end)?;
        let host = crc32(0xFFFF_FFFF, data);

        if device != host {
            if is_read && self.session.options.ignore_crc_err {
                self.session.log(
                    LogLevel::Warning,
                    &format!("CRC mismatch ignored: device {:#010x}, host {:#010x}", device, host),
                );
                return Ok(());
            }

            return Err(Error::VerificationMismatch {
                kind: "CRC-32",
                device: format!("{:#010x}", device),
                host: format!("{:#010x}", host),
            });
        }

        self.session
            .log(LogLevel::Success, &format!("CRC matches {:#010x}!", host));

        Ok(())
    }

    fn guard_bootloader(&self, addr: u32) -> Result<()> {
        if let Some(floor) = self.family.bootloader_floor() {
            if addr < floor && !self.session.options.overwrite_bootloader {
                return Err(Error::ProtectedRegion { addr, floor });
            }
        }

        Ok(())
    }

    fn run_read(&mut self, start_sector: u32, sectors: u32, full_read: bool) -> Result<()> {
        self.prepare()?;

        let (start, count) = if full_read {
            (0, self.memory_bytes / SECTOR_SIZE)
        } else {
            (start_sector * SECTOR_SIZE, sectors)
        };

        self.session.set_state(FlasherState::Working);
        self.session.log(
            LogLevel::Info,
            &format!("Reading {} KiB from {:#x}", count * 4, start),
        );

        let total = (count * SECTOR_SIZE) as u64;
        let mut buffer = Vec::with_capacity(total as usize);

        for i in 0..count {
            self.session.ensure_active()?;

            let addr = self.read_addr(start + i * SECTOR_SIZE);
            buffer.extend_from_slice(&self.read_sector(addr)?);
            self.session.progress(buffer.len() as u64, total);
        }

        // A bus glitch tends to produce uniform garbage; refuse it early
        if buffer.iter().all(|&b| b == 0x00) || buffer.iter().all(|&b| b == 0xFF) {
            return Err(Error::ProtocolFraming {
                op: "FlashRead4K",
                reason: "read produced a uniform buffer, assuming a wedged bus".into(),
            });
        }

        self.verify_range(start, &buffer, true)?;
        self.read_result = Some(buffer);

        Ok(())
    }

    fn run_write(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        // Nothing may be transmitted if the bootloader guard trips
        self.guard_bootloader(offset)?;

        let mut image = data.to_vec();

        if image.len() % SECTOR_SIZE as usize != 0 {
            let padded = (image.len() / SECTOR_SIZE as usize + 1) * SECTOR_SIZE as usize;
            image.resize(padded, 0xFF);
        }

        self.prepare()?;
        self.session.set_state(FlasherState::Working);

        let end = offset + image.len() as u32;
        self.session.log(
            LogLevel::Info,
            &format!("Erasing {:#x}..{:#x}", offset, end),
        );
        self.erase_range(offset, end)?;

        self.session
            .log(LogLevel::Info, &format!("Writing {} KiB to {:#x}", image.len() / 1024, offset));

        let total = image.len() as u64;

        for (i, sector) in image.chunks(SECTOR_SIZE as usize).enumerate() {
            self.session.ensure_active()?;
            self.write_sector(offset + (i as u32) * SECTOR_SIZE, sector)?;
            self.session.progress((i as u64 + 1) * SECTOR_SIZE as u64, total);
        }

        self.verify_range(offset, &image, false)
    }

    fn run_erase(&mut self, start_sector: u32, sectors: u32, erase_all: bool) -> Result<()> {
        let (start, count) = if erase_all {
            (0, u32::MAX)
        } else {
            (start_sector * SECTOR_SIZE, sectors)
        };

        self.guard_bootloader(start)?;
        self.prepare()?;

        let end = if erase_all {
            self.memory_bytes
        } else {
            start + count * SECTOR_SIZE
        };

        self.session.set_state(FlasherState::Working);
        self.session
            .log(LogLevel::Info, &format!("Erasing {:#x}..{:#x}", start, end));

        self.erase_range(start, end)
    }
}

impl<T: Transport> Flasher for Bk72xxFlasher<T> {
    fn do_read(&mut self, start_sector: u32, sectors: u32, full_read: bool) -> Result<()> {
        let result = self.run_read(start_sector, sectors, full_read);
        self.session.finish(&result);
        result
    }

    fn do_write(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        let result = self.run_write(offset, data);
        self.session.finish(&result);
        result
    }

    fn do_erase(&mut self, start_sector: u32, sectors: u32, erase_all: bool) -> Result<bool> {
        let result = self.run_erase(start_sector, sectors, erase_all);
        self.session.finish(&result);
        result.map(|()| true)
    }

    fn read_result(&self) -> Option<&[u8]> {
        self.read_result.as_deref()
    }

    fn close(&mut self) {
        self.session.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::ScriptedTransport;

    fn flasher(
        family: ChipFamily,
        transport: ScriptedTransport,
        options: FlashOptions,
    ) -> Bk72xxFlasher<ScriptedTransport> {
        Bk72xxFlasher::new(
            family,
            transport,
            LINK_BAUD, // keep the negotiated rate, tests skip the baud switch
            options,
            EventSink::new(),
            CancelToken::new(),
        )
    }

    /// Builds the short response frame for `op` with `payload`.
    fn short_response(op: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0x04, 0x0E, payload.len() as u8 + 4, 0x01, 0xE0, 0xFC, op];
        frame.extend_from_slice(payload);
        frame
    }

    /// Builds the long response frame for `op` with `payload`.
    fn long_response(op: LongOp, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0x04, 0x0E, 0xFF, 0x01, 0xE0, 0xFC, 0xF4];
        frame.extend_from_slice(&(payload.len() as u16 + 1).to_le_bytes());
        frame.push(op.into());
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn it_should_reject_writes_below_the_tu_bootloader() {
        let mut flasher = flasher(
            ChipFamily::Bk7231T,
            ScriptedTransport::new(),
            FlashOptions::default(),
        );

        let err = flasher.do_write(0x10FFF, &[0u8; 16]).unwrap_err();

        assert!(matches!(err, Error::ProtectedRegion { addr: 0x10FFF, floor: 0x11000 }));
        // The guard must trip before the port is even opened
        assert!(flasher.session.transport_mut().writes.is_empty());
    }

    #[test]
    fn it_should_allow_writes_at_the_bootloader_boundary() {
        // No scripted responses: the operation fails at sync, but only
        // after passing the bootloader guard and opening the port.
        let mut flasher = flasher(
            ChipFamily::Bk7231T,
            ScriptedTransport::new(),
            FlashOptions::default(),
        );

        // Trip cancellation immediately so the get-bus loop exits fast
        let cancel = CancelToken::new();
        flasher.session = Session::new(
            ScriptedTransport::new(),
            FlashOptions::default(),
            EventSink::new(),
            cancel.clone(),
        );
        cancel.cancel();

        let err = flasher.do_write(0x11000, &[0u8; 16]).unwrap_err();

        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn it_should_allow_bootloader_writes_with_the_override() {
        let cancel = CancelToken::new();
        cancel.cancel();

        let options = FlashOptions {
            overwrite_bootloader: true,
            ..FlashOptions::default()
        };

        let mut flasher = Bk72xxFlasher::new(
            ChipFamily::Bk7231T,
            ScriptedTransport::new(),
            LINK_BAUD,
            options,
            EventSink::new(),
            cancel,
        );

        // With the override the guard passes and we fail later (cancelled)
        let err = flasher.do_write(0, &[0u8; 16]).unwrap_err();

        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn it_should_read_and_crc_check_a_small_range() {
        // BK7231N end-to-end: link check acknowledged on the third attempt,
        // flash identified as a TH25Q80HB, two sectors read, CRC verified.
        let sector_a = vec![0x5Au8; SECTOR_SIZE as usize];
        let sector_b = vec![0xA5u8; SECTOR_SIZE as usize];

        let expected_crc = {
            let mut whole = sector_a.clone();
            whole.extend_from_slice(&sector_b);
            crc32(0xFFFF_FFFF, &whole)
        };

        let mut link_checks = 0u32;

        let sectors = [sector_a, sector_b];
        let transport = ScriptedTransport::new().respond_with(move |written| {
            if written == b"reboot\r\n" {
                return vec![];
            }

            // Short LinkCheck frame
            if written.len() == 5 && written[4] == 0x00 {
                link_checks += 1;

                if link_checks < 3 {
                    return vec![];
                }

                return vec![short_response(0x01, &[0x00])];
            }

            // Long frames: op at index 7
            if written.len() > 7 && written[3] == 0xFF {
                let op = written[7];
                let args = &written[8..];

                return match op {
                    0x0E => vec![long_response(
                        LongOp::FlashGetMid,
                        &[0x00, 0xCD, 0x60, 0x14, 0x00],
                    )],
                    0x0C => vec![long_response(LongOp::FlashReadSR, &[0x00, args[0], 0x00])],
                    0x09 => {
                        let addr = u32::from_le_bytes([args[0], args[1], args[2], args[3]]);
                        let index = (addr / SECTOR_SIZE) as usize;
                        let mut payload = vec![0x00];
                        payload.extend_from_slice(&addr.to_le_bytes());
                        payload.extend_from_slice(&sectors[index]);
                        vec![long_response(LongOp::FlashRead4K, &payload)]
                    }
                    _ => vec![],
                };
            }

            // Short frames: op at index 4
            if written.len() > 4 && written[3] != 0xFF {
                let op = written[4];
                let args = &written[5..];

                return match op {
                    // ReadReg: echo the address, return zero (registers and
                    // eFuse bytes all read as zero, a uniform key)
                    0x03 => {
                        let mut payload = args[0..4].to_vec();
                        payload.extend_from_slice(&[0, 0, 0, 0]);
                        vec![short_response(0x03, &payload)]
                    }
                    // WriteReg: echo
                    0x01 => vec![short_response(0x01, &args[0..8])],
                    // CheckCRC
                    0x10 => vec![short_response(0x10, &expected_crc.to_le_bytes())],
                    _ => vec![],
                };
            }

            vec![]
        });

        let mut flasher = flasher(ChipFamily::Bk7231N, transport, FlashOptions::default());

        flasher.do_read(0, 2, false).unwrap();

        let result = flasher.read_result().unwrap();

        assert_eq!(result.len(), 2 * SECTOR_SIZE as usize);
        assert!(result[..SECTOR_SIZE as usize].iter().all(|&b| b == 0x5A));
        assert_eq!(flasher.session.state(), FlasherState::Completed);
    }

    #[test]
    fn it_should_surface_unknown_flash_chips() {
        let transport = ScriptedTransport::new().respond_with(move |written| {
            if written.len() == 5 && written[4] == 0x00 {
                return vec![short_response(0x01, &[0x00])];
            }

            if written.len() > 7 && written[3] == 0xFF && written[7] == 0x0E {
                // A MID that is not in the registry
                return vec![long_response(
                    LongOp::FlashGetMid,
                    &[0x00, 0x01, 0xAD, 0xDE, 0x00],
                )];
            }

            if written.len() > 4 && written[3] != 0xFF && written[4] == 0x03 {
                let mut payload = written[5..9].to_vec();
                payload.extend_from_slice(&[0, 0, 0, 0]);
                return vec![short_response(0x03, &payload)];
            }

            vec![]
        });

        let mut flasher = flasher(ChipFamily::Bk7231N, transport, FlashOptions::default());
        let err = flasher.do_read(0, 1, false).unwrap_err();

        assert!(matches!(err, Error::UnknownFlash(0x00DE_AD01)));
        assert_eq!(flasher.session.state(), FlasherState::Failed);
    }
}
